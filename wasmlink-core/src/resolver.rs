//! Import resolution between the two modules being linked
//!
//! The resolver maps every import of one module that the other module
//! satisfies to the symbolic name of the supplying declaration, then rewrites
//! each name-form reference to such an import into a direct reference. After
//! combination the rewritten references bind to the supplier's declaration,
//! and the import itself is dead.

use crate::ir::{
    DataMode, ElemItems, ElemMode, ExternKind, Field, Import, Instr, Module, Space, TryHandler,
    Var,
};
use crate::names::SymbolTable;
use crate::walk::{self, describe};
use crate::{Error, Result};
use std::collections::HashMap;

/// Local import binding to the name of the declaration that supplies it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportMap {
    entries: HashMap<(ExternKind, String), String>,
}

impl ImportMap {
    /// Target name for the import bound to `local` in the `kind` index space
    pub fn get(&self, kind: ExternKind, local: &str) -> Option<&str> {
        self.entries
            .get(&(kind, local.to_string()))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// (kind, local binding, target) triples, in no particular order
    pub fn iter(&self) -> impl Iterator<Item = (ExternKind, &str, &str)> {
        self.entries
            .iter()
            .map(|((kind, local), target)| (*kind, local.as_str(), target.as_str()))
    }

    fn insert(&mut self, kind: ExternKind, local: String, target: String) {
        self.entries.insert((kind, local), target);
    }
}

/// Import resolver
pub struct ImportResolver {
    /// Whether an import without a matching export aborts resolution
    strict: bool,
}

impl ImportResolver {
    /// Create a resolver that skips imports it cannot satisfy
    pub fn new() -> Self {
        Self { strict: false }
    }

    /// Create a resolver that fails on imports the library does not satisfy
    pub fn strict() -> Self {
        Self { strict: true }
    }

    /// Resolve `module`'s imports from `libmodule` and rewrite `module` in place
    pub fn resolve(&self, module: &mut Module, libmodule: &Module) -> Result<ImportMap> {
        let map = self.build_import_map(module, libmodule)?;
        self.rewrite(module, &map)?;
        Ok(map)
    }

    /// Map each import of `module` sourced from `libmodule` to the export's target
    pub fn build_import_map(&self, module: &Module, libmodule: &Module) -> Result<ImportMap> {
        let bindings = libmodule.export_bindings();
        let lib_symbols = SymbolTable::build(libmodule);
        let mut map = ImportMap::default();

        for import in module.imports() {
            if import.module != libmodule.name {
                continue;
            }
            let kind = import.desc.kind();
            let Some(local) = import.desc.name() else {
                log::debug!(
                    "Import {}::{} has no local name, leaving index references alone",
                    import.module,
                    import.field
                );
                continue;
            };

            let target = match bindings.find(&import.field) {
                None => Err(Unmatched::NoExport),
                Some(export) if export.kind != kind => Err(Unmatched::KindMismatch(export.kind)),
                Some(export) => {
                    let space = Space::from(kind);
                    lib_symbols
                        .index_of(space, &export.var)
                        .ok()
                        .and_then(|idx| lib_symbols.name_of(space, idx))
                        .ok_or(Unmatched::Unnamed)
                }
            };

            match target {
                Ok(target) => {
                    log::debug!(
                        "Import {}::{} (${}) resolves to ${}",
                        import.module,
                        import.field,
                        local,
                        target
                    );
                    map.insert(kind, local.to_string(), target.to_string());
                }
                Err(reason) if self.strict => return Err(unmatched_import(import, reason)),
                Err(reason) => {
                    log::warn!(
                        "Import {}::{} left unresolved: {}",
                        import.module,
                        import.field,
                        reason
                    );
                }
            }
        }

        Ok(map)
    }

    /// Replace name-form references found in `map` by their target names
    ///
    /// Every reference into an importable index space must name a declaration
    /// of `module`; the first one that does not aborts the rewrite.
    pub fn rewrite(&self, module: &mut Module, map: &ImportMap) -> Result<()> {
        let mut rewriter = Rewriter {
            symbols: SymbolTable::build(module),
            map,
            location: String::new(),
            rewritten: 0,
        };
        let mut ordinals = [0usize; 7];

        for field in module.fields.iter_mut() {
            match field {
                Field::Func(func) => {
                    rewriter.enter(Space::Func, func.name.as_deref(), &mut ordinals);
                    rewriter.expr(&mut func.body)?;
                }
                Field::Global(global) => {
                    rewriter.enter(Space::Global, global.name.as_deref(), &mut ordinals);
                    rewriter.expr(&mut global.init)?;
                }
                Field::Table(table) => {
                    rewriter.enter(Space::Table, table.name.as_deref(), &mut ordinals);
                    if let Some(init) = &mut table.init {
                        rewriter.expr(init)?;
                    }
                }
                Field::Export(export) => {
                    rewriter.location = format!("export \"{}\"", export.name);
                    rewriter.var(export.kind, &mut export.var, &[])?;
                }
                Field::Elem(segment) => {
                    rewriter.enter(Space::Elem, segment.name.as_deref(), &mut ordinals);
                    if let ElemMode::Active { table, offset } = &mut segment.mode {
                        rewriter.var(ExternKind::Table, table, &[])?;
                        rewriter.expr(offset)?;
                    }
                    match &mut segment.items {
                        ElemItems::Funcs(funcs) => {
                            for func in funcs.iter_mut() {
                                rewriter.var(ExternKind::Func, func, &[])?;
                            }
                        }
                        ElemItems::Exprs(exprs) => {
                            for expr in exprs.iter_mut() {
                                rewriter.expr(expr)?;
                            }
                        }
                    }
                }
                Field::Data(segment) => {
                    rewriter.enter(Space::Data, segment.name.as_deref(), &mut ordinals);
                    if let DataMode::Active { memory, offset } = &mut segment.mode {
                        rewriter.var(ExternKind::Memory, memory, &[])?;
                        rewriter.expr(offset)?;
                    }
                }
                Field::Start(var) => {
                    rewriter.location = "start".to_string();
                    rewriter.var(ExternKind::Func, var, &[])?;
                }
                // Tag declarations carry no references
                Field::Import(_) | Field::Memory(_) | Field::Tag(_) => {}
            }
        }

        log::debug!(
            "Rewrote {} references in module {}",
            rewriter.rewritten,
            module.name
        );
        Ok(())
    }
}

impl Default for ImportResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Why an import found no supplier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unmatched {
    NoExport,
    KindMismatch(ExternKind),
    /// The export's target has no symbolic name to bind to
    Unnamed,
}

impl std::fmt::Display for Unmatched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Unmatched::NoExport => f.write_str("no export with that name"),
            Unmatched::KindMismatch(found) => {
                write!(f, "the export with that name is a {}", Space::from(*found))
            }
            Unmatched::Unnamed => f.write_str("the exported declaration has no symbolic name"),
        }
    }
}

fn unmatched_import(import: &Import, reason: Unmatched) -> Error {
    Error::UnresolvedReference {
        space: import.desc.kind().into(),
        reference: format!("\"{}\".\"{}\"", import.module, import.field),
        context: format!("import ({reason})"),
    }
}

struct Rewriter<'a> {
    symbols: SymbolTable,
    map: &'a ImportMap,
    location: String,
    rewritten: usize,
}

impl Rewriter<'_> {
    fn enter(&mut self, space: Space, name: Option<&str>, ordinals: &mut [usize; 7]) {
        let ordinal = ordinals[space as usize];
        ordinals[space as usize] += 1;
        self.location = describe(space, name, ordinal);
    }

    fn expr(&mut self, expr: &mut [Instr]) -> Result<()> {
        walk::walk_mut(expr, &mut Vec::new(), &mut |instr, labels| {
            self.instr(instr, labels)
        })
    }

    fn instr(&mut self, instr: &mut Instr, labels: &[Option<String>]) -> Result<()> {
        match instr {
            Instr::Call(f) | Instr::ReturnCall(f) | Instr::RefFunc(f) => {
                self.var(ExternKind::Func, f, labels)
            }
            Instr::CallIndirect { table, .. } | Instr::ReturnCallIndirect { table, .. } => {
                self.var(ExternKind::Table, table, labels)
            }
            Instr::GlobalGet(g) | Instr::GlobalSet(g) => self.var(ExternKind::Global, g, labels),
            Instr::TableGet(t)
            | Instr::TableSet(t)
            | Instr::TableGrow(t)
            | Instr::TableSize(t)
            | Instr::TableFill(t)
            | Instr::TableInit { table: t, .. } => self.var(ExternKind::Table, t, labels),
            Instr::TableCopy { dst, src } => {
                self.var(ExternKind::Table, dst, labels)?;
                self.var(ExternKind::Table, src, labels)
            }
            Instr::Load(access) | Instr::Store(access) => {
                self.var(ExternKind::Memory, &mut access.memarg.memory, labels)
            }
            Instr::MemorySize(m)
            | Instr::MemoryGrow(m)
            | Instr::MemoryFill(m)
            | Instr::MemoryInit { memory: m, .. } => self.var(ExternKind::Memory, m, labels),
            Instr::MemoryCopy { dst, src } => {
                self.var(ExternKind::Memory, dst, labels)?;
                self.var(ExternKind::Memory, src, labels)
            }
            Instr::Throw(tag) => self.var(ExternKind::Tag, tag, labels),
            Instr::Try {
                handler: TryHandler::Catches { catches, .. },
                ..
            } => {
                for catch in catches.iter_mut() {
                    self.var(ExternKind::Tag, &mut catch.tag, labels)?;
                }
                Ok(())
            }
            // Segment indices are never imported
            _ => Ok(()),
        }
    }

    fn var(&mut self, kind: ExternKind, var: &mut Var, labels: &[Option<String>]) -> Result<()> {
        let space = Space::from(kind);
        if self.symbols.index_of(space, var).is_err() {
            let context = walk::with_label(&self.location, labels);
            self.symbols.resolve(space, var, &context)?;
        }

        if let Var::Symbol(name) = var {
            if let Some(target) = self.map.get(kind, name) {
                *var = Var::symbol(target);
                self.rewritten += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Export, Func, FuncSig, Global, GlobalType, ImportDesc, ValType};

    fn func(name: &str, body: Vec<Instr>) -> Field {
        Field::Func(Func {
            name: Some(name.to_string()),
            sig: FuncSig::default(),
            locals: Vec::new(),
            body,
        })
    }

    fn import_func(module: &str, field: &str, local: &str) -> Field {
        Field::Import(Import {
            module: module.to_string(),
            field: field.to_string(),
            desc: ImportDesc::Func {
                name: Some(local.to_string()),
                sig: FuncSig::default(),
            },
        })
    }

    fn export(name: &str, kind: ExternKind, var: Var) -> Field {
        Field::Export(Export {
            name: name.to_string(),
            kind,
            var,
        })
    }

    /// `L` defines three functions and exports the third as `helper`
    fn library() -> Module {
        let mut lib = Module::new("L");
        lib.push(func("zero", vec![]));
        lib.push(func("one", vec![]));
        lib.push(func("impl", vec![]));
        lib.push(export("helper", ExternKind::Func, Var::Index(2)));
        lib
    }

    fn main_calling(field: &str) -> Module {
        let mut main = Module::new("M");
        main.push(import_func("L", field, "helper"));
        main.push(func("main", vec![Instr::Call(Var::symbol("helper"))]));
        main
    }

    fn first_call(module: &Module) -> &Var {
        match &module.funcs().next().unwrap().body[0] {
            Instr::Call(var) => var,
            other => panic!("expected call, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_rewrites_call_to_export_target() {
        let mut main = main_calling("helper");
        let lib = library();

        let map = ImportResolver::new().resolve(&mut main, &lib).unwrap();

        assert_eq!(map.len(), 1);
        assert_eq!(map.get(ExternKind::Func, "helper"), Some("impl"));
        assert_eq!(first_call(&main), &Var::symbol("impl"));
        // Declarations themselves are left alone
        assert_eq!(main.imports().count(), 1);
    }

    #[test]
    fn test_missing_export_is_skipped() {
        let mut main = main_calling("missing");
        let lib = library();

        let map = ImportResolver::new().resolve(&mut main, &lib).unwrap();

        assert!(map.is_empty());
        assert_eq!(first_call(&main), &Var::symbol("helper"));
    }

    #[test]
    fn test_strict_resolver_fails_on_missing_export() {
        let main = main_calling("missing");
        let lib = library();

        let err = ImportResolver::strict()
            .build_import_map(&main, &lib)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::UnresolvedReference {
                space: Space::Func,
                ..
            }
        ));
        assert!(err.to_string().contains("no export with that name"));
    }

    #[test]
    fn test_kind_mismatch_is_skipped() {
        let main = main_calling("counter");
        let mut lib = Module::new("L");
        lib.push(Field::Global(Global {
            name: Some("count".into()),
            ty: GlobalType {
                val: ValType::I32,
                mutable: true,
            },
            init: vec![Instr::i32_const(0)],
        }));
        lib.push(export("counter", ExternKind::Global, Var::Index(0)));

        let map = ImportResolver::new().build_import_map(&main, &lib).unwrap();
        assert!(map.is_empty());

        let err = ImportResolver::strict()
            .build_import_map(&main, &lib)
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("the export with that name is a global"));
    }

    #[test]
    fn test_strict_resolver_reports_unnamed_target() {
        let main = main_calling("helper");
        let mut lib = library();
        // Points past the three functions of `L`
        lib.push(export("helper", ExternKind::Func, Var::Index(7)));
        lib.fields.retain(|field| match field {
            Field::Export(export) => export.var != Var::Index(2),
            _ => true,
        });

        let err = ImportResolver::strict()
            .build_import_map(&main, &lib)
            .unwrap_err();
        assert!(err.to_string().contains("has no symbolic name"), "{err}");
    }

    #[test]
    fn test_third_party_imports_and_indices_untouched() {
        let mut main = Module::new("M");
        main.push(import_func("env", "log", "log"));
        main.push(import_func("L", "helper", "helper"));
        main.push(func(
            "main",
            vec![
                Instr::Call(Var::symbol("log")),
                Instr::Call(Var::Index(1)),
                Instr::Call(Var::symbol("helper")),
            ],
        ));
        main.push(export("run", ExternKind::Func, Var::symbol("helper")));

        ImportResolver::new().resolve(&mut main, &library()).unwrap();

        let body = &main.funcs().next().unwrap().body;
        assert_eq!(body[0], Instr::Call(Var::symbol("log")));
        assert_eq!(body[1], Instr::Call(Var::Index(1)));
        assert_eq!(body[2], Instr::Call(Var::symbol("impl")));
        assert_eq!(main.exports().next().unwrap().var, Var::symbol("impl"));
    }

    #[test]
    fn test_unresolved_direct_reference_aborts() {
        let mut main = main_calling("helper");
        main.push(func(
            "broken",
            vec![Instr::Block {
                label: Some("body".into()),
                sig: crate::ir::BlockSig::Empty,
                body: vec![Instr::Call(Var::symbol("nowhere"))],
            }],
        ));

        let err = ImportResolver::new()
            .resolve(&mut main, &library())
            .unwrap_err();
        match err {
            Error::UnresolvedReference { context, .. } => {
                assert_eq!(context, "function $broken (in block $body)");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
