//! # wasmlink core
//!
//! Core library for statically linking two core WebAssembly modules.
//!
//! A main module and a library module that import from each other (by module
//! name) are joined into a single module in which every cross-module import
//! has been replaced by a direct reference to the declaration that satisfies
//! it.
//!
//! ## Pipeline
//!
//! ```text
//! bytes → Parser → Unique names → ImportResolver (both ways) → ModuleCombiner
//!       → Name resolution → Encoder → bytes
//! ```
//!
//! 1. **Parser**: decodes each binary into the module IR ([`ir`])
//! 2. **Naming**: gives every declaration a module-qualified symbolic name and
//!    turns references into name form ([`names`])
//! 3. **ImportResolver**: maps each import the other module satisfies to the
//!    supplier's symbolic name and rewrites references to it ([`resolver`])
//! 4. **ModuleCombiner**: drops the satisfied imports and splices the two
//!    field lists ([`merger`])
//! 5. **Name resolution**: turns every reference back into a dense index
//! 6. **Encoder**: writes the binary, optionally checked by the validator
//!
//! Two standalone passes work on a single module: the Index Rebaser
//! ([`rebase`]) and the read-only memory Access Checker ([`access`]).
//! [`audit`] filters exports and checks import sources against allow or deny
//! lists.
//!
//! ## Example
//!
//! ```ignore
//! use wasmlink_core::{LinkConfig, Linker};
//!
//! let linker = Linker::new(LinkConfig::default());
//! let (linked, stats) = linker.link_bytes("main", &main_bytes, "lib", &lib_bytes)?;
//! println!("{} imports resolved", stats.imports_resolved);
//! ```

mod error;
pub mod access;
pub mod audit;
pub mod encoder;
pub mod ir;
pub mod merger;
pub mod names;
pub mod parser;
pub mod rebase;
pub mod resolver;
pub mod validate;
pub mod walk;

pub use access::check as check_access;
pub use audit::{audit_exports, check_imports, ExportAudit, ImportCheck, NamePolicy};
pub use encoder::{encode, EncodeOptions};
pub use error::{Error, Result};
pub use ir::{ExternKind, Field, Module, Space, Var};
pub use merger::combine;
pub use names::{
    apply_names, assign_unique_names, assign_unique_names_avoiding, resolve_names, SymbolTable,
    UsedNames,
};
pub use parser::{ModuleParser, ParseOptions};
pub use rebase::rebase;
pub use resolver::{ImportMap, ImportResolver};
pub use validate::{validate, validate_module};

use wasmparser::WasmFeatures;

/// Configuration for a link
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Proposals accepted by the reader and the validator
    pub features: WasmFeatures,

    /// Populate symbolic names from the inputs' `name` sections
    pub read_debug_names: bool,

    /// Fail on a malformed `name` section instead of ignoring it
    pub fail_on_custom_section_error: bool,

    /// Validate both inputs and the linked output
    pub validate: bool,

    /// Emit a `name` section in the output
    pub write_debug_names: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            features: WasmFeatures::default(),
            read_debug_names: true,
            fail_on_custom_section_error: true,
            validate: true,
            write_debug_names: true,
        }
    }
}

impl LinkConfig {
    pub fn parse_options(&self) -> ParseOptions {
        ParseOptions {
            features: self.features,
            read_debug_names: self.read_debug_names,
            fail_on_custom_section_error: self.fail_on_custom_section_error,
        }
    }

    pub fn encode_options(&self) -> EncodeOptions {
        EncodeOptions {
            write_debug_names: self.write_debug_names,
        }
    }
}

/// Statistics about a link
#[derive(Debug, Clone, Default)]
pub struct LinkStats {
    /// Imports satisfied by the other module (both directions)
    pub imports_resolved: usize,

    /// Import fields dropped during combination
    pub imports_elided: usize,

    /// Imports left in the output
    pub imports_retained: usize,

    /// Locally defined functions in the output
    pub functions: usize,

    /// Locally defined memories in the output
    pub memories: usize,

    /// Exports in the output
    pub exports: usize,

    /// Combined size of both inputs (bytes)
    pub input_size: usize,

    /// Size of the linked output (bytes)
    pub output_size: usize,
}

/// Two-module static linker
pub struct Linker {
    config: LinkConfig,
}

impl Linker {
    /// Create a linker with the given configuration
    pub fn new(config: LinkConfig) -> Self {
        Self { config }
    }

    /// Create a linker with default configuration
    pub fn with_defaults() -> Self {
        Self::new(LinkConfig::default())
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Parse (and, if configured, validate) one input module
    pub fn parse(&self, name: &str, bytes: &[u8]) -> Result<Module> {
        if self.config.validate {
            validate(bytes, self.config.features).map_err(|err| match err {
                Error::Validation(message) => {
                    Error::Validation(format!("module {name}: {message}"))
                }
                other => other,
            })?;
        }
        ModuleParser::with_options(self.config.parse_options()).parse(name, bytes)
    }

    /// Link `module` with `libmodule`
    ///
    /// Both inputs are consumed. The result is index-resolved and named after
    /// `module`.
    pub fn link(&self, module: Module, libmodule: Module) -> Result<(Module, LinkStats)> {
        let (linked, stats) = self.link_modules(module, libmodule)?;
        if self.config.validate {
            log::info!("Validating linked module");
            validate_module(&linked, self.config.features)?;
        }
        Ok((linked, stats))
    }

    /// Parse, link and encode two binaries
    pub fn link_bytes(
        &self,
        main_name: &str,
        main_bytes: &[u8],
        lib_name: &str,
        lib_bytes: &[u8],
    ) -> Result<(Vec<u8>, LinkStats)> {
        let module = self.parse(main_name, main_bytes)?;
        let libmodule = self.parse(lib_name, lib_bytes)?;

        let (linked, mut stats) = self.link_modules(module, libmodule)?;

        log::info!("Encoding linked module");
        let output = encode(&linked, &self.config.encode_options())?;
        if self.config.validate {
            log::info!("Validating linked module");
            validate(&output, self.config.features)?;
        }

        stats.input_size = main_bytes.len() + lib_bytes.len();
        stats.output_size = output.len();
        log::info!(
            "Link complete: {} + {} bytes → {} bytes",
            main_bytes.len(),
            lib_bytes.len(),
            stats.output_size
        );
        Ok((output, stats))
    }

    fn link_modules(
        &self,
        mut module: Module,
        mut libmodule: Module,
    ) -> Result<(Module, LinkStats)> {
        if module.name == libmodule.name {
            log::warn!(
                "Both modules are named {}, imports from that name bind to the other module",
                module.name
            );
        }
        let input_imports = module.imports().count() + libmodule.imports().count();

        log::info!("Naming declarations of {} and {}", module.name, libmodule.name);
        // One name set for both modules, so prefixes like `a` + `b.c` and
        // `a.b` + `c` cannot produce the same name.
        let mut used = UsedNames::default();
        assign_unique_names_avoiding(&mut module, &mut used);
        assign_unique_names_avoiding(&mut libmodule, &mut used);
        apply_names(&mut module)?;
        apply_names(&mut libmodule)?;

        // Both maps are built from the unrewritten modules.
        log::info!("Resolving imports");
        let resolver = ImportResolver::new();
        let module_map = resolver.build_import_map(&module, &libmodule)?;
        let lib_map = resolver.build_import_map(&libmodule, &module)?;
        resolver.rewrite(&mut module, &module_map)?;
        resolver.rewrite(&mut libmodule, &lib_map)?;

        let mut linked = combine(module, libmodule);

        log::info!("Resolving names in {}", linked.name);
        resolve_names(&mut linked)?;

        let imports_retained = linked.imports().count();
        let stats = LinkStats {
            imports_resolved: module_map.len() + lib_map.len(),
            imports_elided: input_imports - imports_retained,
            imports_retained,
            functions: linked.num_locals(Space::Func) as usize,
            memories: linked.num_locals(Space::Memory) as usize,
            exports: linked.exports().count(),
            ..Default::default()
        };
        log::info!(
            "Linked {}: {} imports resolved, {} retained",
            linked.name,
            stats.imports_resolved,
            stats.imports_retained
        );
        Ok((linked, stats))
    }
}
