//! wasmlink CLI - Static WebAssembly Module Linking
//!
//! Links a main module and a library module into one core module, and
//! provides the single-module passes of the toolchain.
//!
//! ## Usage
//!
//! ```bash
//! # Link two modules
//! wasmlink link main.wasm lib.wasm -o linked.wasm
//!
//! # Fail if anything writes to memory 0
//! wasmlink check-access linked.wasm --rw-index 1
//!
//! # Shift local memories behind two memories already placed
//! wasmlink rebase lib.wasm --memory-base 3 -o rebased.wasm
//!
//! # Keep only the `run` export
//! wasmlink audit-exports linked.wasm out.wasm -e run
//!
//! # Reject imports from anything but `env`
//! wasmlink check-imports linked.wasm -i env
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use wasmlink_core::{
    audit_exports, check_access, check_imports, encode, rebase, EncodeOptions, LinkConfig,
    LinkStats, Linker, Module, ModuleParser, NamePolicy, ParseOptions,
};
use wasmparser::WasmFeatures;

#[derive(Parser)]
#[command(name = "wasmlink")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Static WebAssembly module linking", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Link a main module with the library module it imports from
    Link {
        /// Main module (.wasm)
        main: PathBuf,

        /// Library module (.wasm)
        lib: PathBuf,

        /// Output file path (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Module name of the main module (defaults to the file stem)
        #[arg(long)]
        main_name: Option<String>,

        /// Module name the main module imports the library as (defaults to the file stem)
        #[arg(long)]
        lib_name: Option<String>,

        #[command(flatten)]
        features: FeatureArgs,

        /// Ignore the inputs' `name` sections
        #[arg(long)]
        no_debug_names: bool,

        /// Skip validation of inputs and output
        #[arg(long)]
        no_check: bool,

        /// Ignore malformed `name` sections instead of failing
        #[arg(long)]
        ignore_custom_section_errors: bool,

        /// Do not write a `name` section
        #[arg(long)]
        no_names_section: bool,

        /// Show link statistics
        #[arg(long)]
        stats: bool,
    },

    /// Check that no instruction writes to a read-only memory
    CheckAccess {
        /// Input module
        input: PathBuf,

        /// Memories with an index below this are read-only
        #[arg(long = "rw-index", value_name = "N")]
        rw_index: u32,

        #[command(flatten)]
        reader: ReaderArgs,
    },

    /// Shift memory references for placement behind other memories
    Rebase {
        /// Input module
        input: PathBuf,

        /// 1-based slot of the module's first local memory
        #[arg(long, value_name = "N")]
        memory_base: u32,

        /// Output file path
        #[arg(short, long)]
        output: PathBuf,

        #[command(flatten)]
        reader: ReaderArgs,
    },

    /// Remove exports not permitted by an allow-list or deny-list
    AuditExports {
        /// Input module
        input: PathBuf,

        /// Output file path
        output: PathBuf,

        /// Export to keep (allow-list)
        #[arg(short = 'e', long = "export", value_name = "NAME")]
        keep: Vec<String>,

        /// Export to remove (deny-list)
        #[arg(short = 'r', long = "remove", value_name = "NAME")]
        remove: Vec<String>,

        #[command(flatten)]
        reader: ReaderArgs,
    },

    /// Fail if the module imports from a module not permitted by the lists
    CheckImports {
        /// Input module
        input: PathBuf,

        /// Module imports may come from (allow-list)
        #[arg(short = 'i', long = "include", value_name = "MODULE")]
        include: Vec<String>,

        /// Module imports may not come from (deny-list)
        #[arg(short = 'e', long = "exclude", value_name = "MODULE")]
        exclude: Vec<String>,

        #[command(flatten)]
        reader: ReaderArgs,
    },
}

/// Proposal toggles applied on top of the default feature set
#[derive(Args, Debug, Default)]
struct FeatureArgs {
    /// Enable a proposal (e.g. multi-memory, tail-call, simd, legacy-exceptions)
    #[arg(long = "enable", value_name = "FEATURE", value_parser = parse_feature)]
    enable: Vec<WasmFeatures>,

    /// Disable a proposal
    #[arg(long = "disable", value_name = "FEATURE", value_parser = parse_feature)]
    disable: Vec<WasmFeatures>,
}

impl FeatureArgs {
    fn features(&self) -> WasmFeatures {
        let mut features = WasmFeatures::default();
        for flag in &self.enable {
            features.insert(*flag);
        }
        for flag in &self.disable {
            features.remove(*flag);
        }
        features
    }
}

/// Reader options shared by the single-module subcommands
#[derive(Args, Debug, Default)]
struct ReaderArgs {
    #[command(flatten)]
    features: FeatureArgs,

    /// Ignore the input's `name` section
    #[arg(long)]
    no_debug_names: bool,

    /// Ignore a malformed `name` section instead of failing
    #[arg(long)]
    ignore_custom_section_errors: bool,
}

impl ReaderArgs {
    fn parse_options(&self) -> ParseOptions {
        ParseOptions {
            features: self.features.features(),
            read_debug_names: !self.no_debug_names,
            fail_on_custom_section_error: !self.ignore_custom_section_errors,
        }
    }
}

fn parse_feature(name: &str) -> std::result::Result<WasmFeatures, String> {
    let flag = match name {
        "bulk-memory" => WasmFeatures::BULK_MEMORY,
        "exceptions" => WasmFeatures::EXCEPTIONS,
        "extended-const" => WasmFeatures::EXTENDED_CONST,
        "legacy-exceptions" => WasmFeatures::LEGACY_EXCEPTIONS,
        "memory64" => WasmFeatures::MEMORY64,
        "multi-memory" => WasmFeatures::MULTI_MEMORY,
        "multi-value" => WasmFeatures::MULTI_VALUE,
        "mutable-global" => WasmFeatures::MUTABLE_GLOBAL,
        "reference-types" => WasmFeatures::REFERENCE_TYPES,
        "relaxed-simd" => WasmFeatures::RELAXED_SIMD,
        "saturating-float-to-int" => WasmFeatures::SATURATING_FLOAT_TO_INT,
        "sign-extension" => WasmFeatures::SIGN_EXTENSION,
        "simd" => WasmFeatures::SIMD,
        "tail-call" => WasmFeatures::TAIL_CALL,
        _ => return Err(format!("unknown feature `{name}`")),
    };
    Ok(flag)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    match cli.command {
        Commands::Link {
            main,
            lib,
            output,
            main_name,
            lib_name,
            features,
            no_debug_names,
            no_check,
            ignore_custom_section_errors,
            no_names_section,
            stats,
        } => {
            let config = LinkConfig {
                features: features.features(),
                read_debug_names: !no_debug_names,
                fail_on_custom_section_error: !ignore_custom_section_errors,
                validate: !no_check,
                write_debug_names: !no_names_section,
            };
            let main_name = module_name(&main, main_name)?;
            let lib_name = module_name(&lib, lib_name)?;
            link_command(config, &main, &main_name, &lib, &lib_name, output, stats)
        }

        Commands::CheckAccess {
            input,
            rw_index,
            reader,
        } => {
            let module = read_module(&input, &reader.parse_options())?;
            check_access(&module, rw_index)
                .with_context(|| format!("Access check failed for {}", input.display()))?;
            eprintln!(
                "{}: no writes to memories below index {}",
                input.display(),
                rw_index
            );
            Ok(())
        }

        Commands::Rebase {
            input,
            memory_base,
            output,
            reader,
        } => {
            let mut module = read_module(&input, &reader.parse_options())?;
            let shifted = rebase(&mut module, memory_base)
                .with_context(|| format!("Failed to rebase {}", input.display()))?;
            write_module(&module, Some(&output))?;
            eprintln!("Rebased {} memory references", shifted);
            Ok(())
        }

        Commands::AuditExports {
            input,
            output,
            keep,
            remove,
            reader,
        } => {
            let policy = NamePolicy::from_lists(keep, remove)?;
            let mut module = read_module(&input, &reader.parse_options())?;
            let audit = audit_exports(&mut module, &policy);
            for (name, kept) in &audit.exports {
                eprintln!("export {name}: {}", if *kept { "kept" } else { "removed" });
            }
            write_module(&module, Some(&output))
        }

        Commands::CheckImports {
            input,
            include,
            exclude,
            reader,
        } => {
            let policy = NamePolicy::from_lists(include, exclude)?;
            let module = read_module(&input, &reader.parse_options())?;
            let check = check_imports(&module, &policy);
            for source in &check.modules_seen {
                eprintln!("import from {source}");
            }
            check
                .into_result()
                .with_context(|| format!("Import check failed for {}", input.display()))?;
            Ok(())
        }
    }
}

/// Link command implementation
fn link_command(
    config: LinkConfig,
    main: &Path,
    main_name: &str,
    lib: &Path,
    lib_name: &str,
    output: Option<PathBuf>,
    show_stats: bool,
) -> Result<()> {
    let main_bytes = read_file(main)?;
    let lib_bytes = read_file(lib)?;

    let start = Instant::now();
    let linker = Linker::new(config);
    let (linked, stats) = linker
        .link_bytes(main_name, &main_bytes, lib_name, &lib_bytes)
        .with_context(|| format!("Failed to link {} with {}", main.display(), lib.display()))?;
    let elapsed = start.elapsed();

    write_bytes(&linked, output.as_deref())?;

    if show_stats {
        print_stats(&stats, elapsed);
    }
    Ok(())
}

/// Print link statistics
fn print_stats(stats: &LinkStats, elapsed: std::time::Duration) {
    eprintln!();
    eprintln!("Link Statistics");
    eprintln!("{}", "=".repeat(50));

    eprintln!();
    eprintln!("Imports:");
    eprintln!("  Resolved:            {}", stats.imports_resolved);
    eprintln!("  Elided:              {}", stats.imports_elided);
    eprintln!("  Retained:            {}", stats.imports_retained);

    eprintln!();
    eprintln!("Output:");
    eprintln!("  Functions:           {}", stats.functions);
    eprintln!("  Memories:            {}", stats.memories);
    eprintln!("  Exports:             {}", stats.exports);

    eprintln!();
    eprintln!("Size:");
    eprintln!("  Input size:          {} bytes", stats.input_size);
    eprintln!("  Output size:         {} bytes", stats.output_size);

    eprintln!();
    eprintln!("  Link time:           {:?}", elapsed);
    eprintln!("{}", "=".repeat(50));
}

/// Module name from an explicit override or the file stem
fn module_name(path: &Path, name: Option<String>) -> Result<String> {
    match name {
        Some(name) => Ok(name),
        None => path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("Cannot derive a module name from {}", path.display())),
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn read_module(path: &Path, options: &ParseOptions) -> Result<Module> {
    let bytes = read_file(path)?;
    let name = module_name(path, None)?;
    ModuleParser::with_options(options.clone())
        .parse(&name, &bytes)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

fn write_module(module: &Module, output: Option<&Path>) -> Result<()> {
    let bytes = encode(module, &EncodeOptions::default()).context("Failed to encode module")?;
    write_bytes(&bytes, output)
}

fn write_bytes(bytes: &[u8], output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            fs::write(path, bytes).with_context(|| format!("Failed to write {}", path.display()))
        }
        None => std::io::stdout()
            .lock()
            .write_all(bytes)
            .context("Failed to write to stdout"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_link_args() {
        let cli = Cli::try_parse_from([
            "wasmlink",
            "link",
            "main.wasm",
            "lib.wasm",
            "-o",
            "out.wasm",
            "--lib-name",
            "env2",
            "--enable",
            "multi-memory",
            "--stats",
        ])
        .unwrap();

        match cli.command {
            Commands::Link {
                output,
                lib_name,
                features,
                stats,
                no_check,
                ..
            } => {
                assert_eq!(output, Some(PathBuf::from("out.wasm")));
                assert_eq!(lib_name.as_deref(), Some("env2"));
                assert!(features.features().contains(WasmFeatures::MULTI_MEMORY));
                assert!(stats);
                assert!(!no_check);
            }
            _ => panic!("expected link"),
        }
    }

    #[test]
    fn test_cli_check_access_requires_threshold() {
        assert!(Cli::try_parse_from(["wasmlink", "check-access", "a.wasm"]).is_err());
        assert!(
            Cli::try_parse_from(["wasmlink", "check-access", "a.wasm", "--rw-index", "1"]).is_ok()
        );
    }

    #[test]
    fn test_cli_rebase_args() {
        let cli = Cli::try_parse_from([
            "wasmlink",
            "rebase",
            "a.wasm",
            "--memory-base",
            "3",
            "-o",
            "b.wasm",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Rebase { memory_base: 3, .. }));
    }

    #[test]
    fn test_cli_audit_lists() {
        let cli = Cli::try_parse_from([
            "wasmlink",
            "audit-exports",
            "a.wasm",
            "b.wasm",
            "-e",
            "run",
            "-e",
            "memory",
        ])
        .unwrap();
        match cli.command {
            Commands::AuditExports { keep, remove, .. } => {
                assert_eq!(keep, vec!["run", "memory"]);
                assert!(remove.is_empty());
            }
            _ => panic!("expected audit-exports"),
        }
    }

    #[test]
    fn test_unknown_feature_rejected() {
        assert!(parse_feature("threads-but-wrong").is_err());
        assert!(
            Cli::try_parse_from(["wasmlink", "link", "a.wasm", "b.wasm", "--enable", "nope"])
                .is_err()
        );
    }

    #[test]
    fn test_cli_reader_flags() {
        let cli = Cli::try_parse_from([
            "wasmlink",
            "check-imports",
            "a.wasm",
            "--no-debug-names",
            "--ignore-custom-section-errors",
            "--enable",
            "multi-memory",
        ])
        .unwrap();
        match cli.command {
            Commands::CheckImports { reader, .. } => {
                let options = reader.parse_options();
                assert!(!options.read_debug_names);
                assert!(!options.fail_on_custom_section_error);
                assert!(options.features.contains(WasmFeatures::MULTI_MEMORY));
            }
            _ => panic!("expected check-imports"),
        }

        let defaults = ReaderArgs::default().parse_options();
        assert!(defaults.read_debug_names);
        assert!(defaults.fail_on_custom_section_error);
    }

    #[test]
    fn test_cli_verbose() {
        let cli = Cli::parse_from(["wasmlink", "-v", "check-imports", "a.wasm", "-i", "env"]);
        assert!(cli.verbose);
    }

    #[test]
    fn test_module_name_defaults_to_stem() {
        assert_eq!(module_name(Path::new("dir/lib.wasm"), None).unwrap(), "lib");
        assert_eq!(
            module_name(Path::new("dir/lib.wasm"), Some("env".into())).unwrap(),
            "env"
        );
    }
}
