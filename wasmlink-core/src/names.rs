//! Symbol tables and the naming passes
//!
//! - [`assign_unique_names`] gives every declaration a name that is unique
//!   within its index space and distinguishable from any other module's names.
//! - [`apply_names`] turns index-form references into name-form references.
//! - [`resolve_names`] turns name-form references back into dense indices,
//!   with imported declarations of each kind numbered before local ones.

use crate::ir::{DataMode, ElemItems, ElemMode, Field, Instr, Module, Space, TryHandler, Var};
use crate::walk::{self, describe};
use crate::{Error, Result};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
struct Namespace {
    names: Vec<Option<String>>,
    by_name: HashMap<String, u32>,
    ambiguous: HashSet<String>,
    imported: u32,
}

impl Namespace {
    fn register(&mut self, name: Option<&str>) {
        let idx = self.names.len() as u32;
        if let Some(name) = name {
            if self.by_name.contains_key(name) {
                self.ambiguous.insert(name.to_string());
            } else {
                self.by_name.insert(name.to_string(), idx);
            }
        }
        self.names.push(name.map(str::to_string));
    }
}

/// Why a reference could not be turned into an index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unresolved {
    Missing,
    Ambiguous,
}

/// Per index space declaration list of one module, imports first
#[derive(Debug, Default)]
pub struct SymbolTable {
    spaces: [Namespace; 7],
}

impl SymbolTable {
    pub fn build(module: &Module) -> Self {
        let mut table = SymbolTable::default();

        for import in module.imports() {
            let ns = table.ns_mut(import.desc.kind().into());
            ns.register(import.desc.name());
            ns.imported += 1;
        }

        for field in &module.fields {
            let (space, name) = match field {
                Field::Func(f) => (Space::Func, f.name.as_deref()),
                Field::Table(t) => (Space::Table, t.name.as_deref()),
                Field::Memory(m) => (Space::Memory, m.name.as_deref()),
                Field::Global(g) => (Space::Global, g.name.as_deref()),
                Field::Tag(t) => (Space::Tag, t.name.as_deref()),
                Field::Data(d) => (Space::Data, d.name.as_deref()),
                Field::Elem(e) => (Space::Elem, e.name.as_deref()),
                Field::Import(_) | Field::Export(_) | Field::Start(_) => continue,
            };
            table.ns_mut(space).register(name);
        }

        table
    }

    fn ns(&self, space: Space) -> &Namespace {
        &self.spaces[space as usize]
    }

    fn ns_mut(&mut self, space: Space) -> &mut Namespace {
        &mut self.spaces[space as usize]
    }

    /// Total declarations in `space`
    pub fn len(&self, space: Space) -> u32 {
        self.ns(space).names.len() as u32
    }

    /// Imported declarations in `space`; they occupy `0..num_imported`
    pub fn num_imported(&self, space: Space) -> u32 {
        self.ns(space).imported
    }

    /// Symbolic name of the declaration at `idx`
    pub fn name_of(&self, space: Space, idx: u32) -> Option<&str> {
        self.ns(space)
            .names
            .get(idx as usize)
            .and_then(|name| name.as_deref())
    }

    /// Index of the declaration a reference points at
    pub fn index_of(&self, space: Space, var: &Var) -> std::result::Result<u32, Unresolved> {
        let ns = self.ns(space);
        match var {
            Var::Index(idx) if (*idx as usize) < ns.names.len() => Ok(*idx),
            Var::Index(_) => Err(Unresolved::Missing),
            Var::Symbol(name) if ns.ambiguous.contains(name) => Err(Unresolved::Ambiguous),
            Var::Symbol(name) => ns.by_name.get(name).copied().ok_or(Unresolved::Missing),
        }
    }

    /// [`Self::index_of`], turning failures into link errors
    pub fn resolve(&self, space: Space, var: &Var, context: &str) -> Result<u32> {
        self.index_of(space, var).map_err(|why| match (why, var) {
            (Unresolved::Ambiguous, Var::Symbol(name)) => Error::AmbiguousReference {
                space,
                name: name.clone(),
            },
            _ => Error::UnresolvedReference {
                space,
                reference: var.to_string(),
                context: context.to_string(),
            },
        })
    }
}

/// Names already handed out by the unique-naming pass, per index space
///
/// Sharing one set between the modules of a link keeps their names apart even
/// when module names overlap (`a` + `b.c` and `a.b` + `c`).
#[derive(Debug, Default)]
pub struct UsedNames {
    spaces: [HashSet<String>; 7],
}

impl UsedNames {
    pub fn contains(&self, space: Space, name: &str) -> bool {
        self.spaces[space as usize].contains(name)
    }

    fn claim(&mut self, space: Space, base: String) -> String {
        let taken = &mut self.spaces[space as usize];
        let mut candidate = base.clone();
        let mut suffix = 1;
        while taken.contains(&candidate) {
            candidate = format!("{base}.{suffix}");
            suffix += 1;
        }
        taken.insert(candidate.clone());
        candidate
    }
}

/// Give every declaration a module-qualified name unique within its space
///
/// The name is `<module>.<existing name>` or, for anonymous declarations,
/// `<module>.<kind letter><index>`; a `.N` suffix breaks remaining collisions.
/// References are not touched, so run this before [`apply_names`] on a module
/// whose references are still index-form.
pub fn assign_unique_names(module: &mut Module) {
    assign_unique_names_avoiding(module, &mut UsedNames::default());
}

/// [`assign_unique_names`], also avoiding every name in `used`
///
/// The names given out are added to `used`.
pub fn assign_unique_names_avoiding(module: &mut Module, used: &mut UsedNames) {
    let prefix = module.name.clone();
    let mut next: [u32; 7] = [0; 7];

    let mut assign = |space: Space, name: &mut Option<String>| {
        let idx = next[space as usize];
        next[space as usize] += 1;

        let base = match name.as_deref() {
            Some(existing) => format!("{prefix}.{existing}"),
            None => format!("{prefix}.{}{idx}", space.prefix()),
        };
        *name = Some(used.claim(space, base));
    };

    // Imports take the low indices of every space.
    for field in module.fields.iter_mut() {
        if let Field::Import(import) = field {
            let space = import.desc.kind().into();
            assign(space, import.desc.name_mut());
        }
    }

    for field in module.fields.iter_mut() {
        match field {
            Field::Func(f) => assign(Space::Func, &mut f.name),
            Field::Table(t) => assign(Space::Table, &mut t.name),
            Field::Memory(m) => assign(Space::Memory, &mut m.name),
            Field::Global(g) => assign(Space::Global, &mut g.name),
            Field::Tag(t) => assign(Space::Tag, &mut t.name),
            Field::Data(d) => assign(Space::Data, &mut d.name),
            Field::Elem(e) => assign(Space::Elem, &mut e.name),
            Field::Import(_) | Field::Export(_) | Field::Start(_) => {}
        }
    }
}

/// Rewrite every index-form reference into name form
///
/// References to anonymous declarations stay index-form.
pub fn apply_names(module: &mut Module) -> Result<()> {
    let symbols = SymbolTable::build(module);
    for_each_var_mut(module, &mut |space, var, context| {
        if let Var::Index(_) = var {
            let idx = symbols.resolve(space, var, context)?;
            if let Some(name) = symbols.name_of(space, idx) {
                *var = Var::symbol(name);
            }
        }
        Ok(())
    })
}

/// Rewrite every name-form reference into a dense index
///
/// Fails on the first name that does not identify exactly one declaration of
/// the expected kind.
pub fn resolve_names(module: &mut Module) -> Result<()> {
    let symbols = SymbolTable::build(module);
    for_each_var_mut(module, &mut |space, var, context| {
        if let Var::Symbol(_) = var {
            let idx = symbols.resolve(space, var, context)?;
            *var = Var::Index(idx);
        }
        Ok(())
    })
}

type VarVisitor<'a> = dyn FnMut(Space, &mut Var, &str) -> Result<()> + 'a;

/// Visit every reference of a module together with its index space
pub(crate) fn for_each_var_mut(module: &mut Module, f: &mut VarVisitor<'_>) -> Result<()> {
    let mut ordinals = [0usize; 7];
    let mut next_ordinal = |space: Space| {
        let ordinal = ordinals[space as usize];
        ordinals[space as usize] += 1;
        ordinal
    };

    for field in module.fields.iter_mut() {
        match field {
            Field::Func(func) => {
                let location =
                    describe(Space::Func, func.name.as_deref(), next_ordinal(Space::Func));
                expr_vars_mut(&mut func.body, &location, f)?;
            }
            Field::Global(global) => {
                let location = describe(
                    Space::Global,
                    global.name.as_deref(),
                    next_ordinal(Space::Global),
                );
                expr_vars_mut(&mut global.init, &location, f)?;
            }
            Field::Table(table) => {
                let location = describe(
                    Space::Table,
                    table.name.as_deref(),
                    next_ordinal(Space::Table),
                );
                if let Some(init) = &mut table.init {
                    expr_vars_mut(init, &location, f)?;
                }
            }
            Field::Export(export) => {
                let location = format!("export \"{}\"", export.name);
                f(export.kind.into(), &mut export.var, &location)?;
            }
            Field::Elem(segment) => {
                let location = describe(
                    Space::Elem,
                    segment.name.as_deref(),
                    next_ordinal(Space::Elem),
                );
                if let ElemMode::Active { table, offset } = &mut segment.mode {
                    f(Space::Table, table, &location)?;
                    expr_vars_mut(offset, &location, f)?;
                }
                match &mut segment.items {
                    ElemItems::Funcs(funcs) => {
                        for func in funcs.iter_mut() {
                            f(Space::Func, func, &location)?;
                        }
                    }
                    ElemItems::Exprs(exprs) => {
                        for expr in exprs.iter_mut() {
                            expr_vars_mut(expr, &location, f)?;
                        }
                    }
                }
            }
            Field::Data(segment) => {
                let location = describe(
                    Space::Data,
                    segment.name.as_deref(),
                    next_ordinal(Space::Data),
                );
                if let DataMode::Active { memory, offset } = &mut segment.mode {
                    f(Space::Memory, memory, &location)?;
                    expr_vars_mut(offset, &location, f)?;
                }
            }
            Field::Start(var) => f(Space::Func, var, "start")?,
            Field::Import(_) | Field::Memory(_) | Field::Tag(_) => {}
        }
    }
    Ok(())
}

fn expr_vars_mut(expr: &mut [Instr], location: &str, f: &mut VarVisitor<'_>) -> Result<()> {
    walk::walk_mut(expr, &mut Vec::new(), &mut |instr, _labels| {
        instr_vars_mut(instr, &mut |space, var| f(space, var, location))
    })
}

fn instr_vars_mut(
    instr: &mut Instr,
    f: &mut dyn FnMut(Space, &mut Var) -> Result<()>,
) -> Result<()> {
    match instr {
        Instr::Call(v) | Instr::ReturnCall(v) | Instr::RefFunc(v) => f(Space::Func, v),
        Instr::CallIndirect { table, .. } | Instr::ReturnCallIndirect { table, .. } => {
            f(Space::Table, table)
        }
        Instr::GlobalGet(v) | Instr::GlobalSet(v) => f(Space::Global, v),
        Instr::TableGet(v)
        | Instr::TableSet(v)
        | Instr::TableGrow(v)
        | Instr::TableSize(v)
        | Instr::TableFill(v) => f(Space::Table, v),
        Instr::TableCopy { dst, src } => {
            f(Space::Table, dst)?;
            f(Space::Table, src)
        }
        Instr::TableInit { table, elem } => {
            f(Space::Table, table)?;
            f(Space::Elem, elem)
        }
        Instr::ElemDrop(v) => f(Space::Elem, v),
        Instr::Load(access) | Instr::Store(access) => f(Space::Memory, &mut access.memarg.memory),
        Instr::MemorySize(v) | Instr::MemoryGrow(v) | Instr::MemoryFill(v) => f(Space::Memory, v),
        Instr::MemoryCopy { dst, src } => {
            f(Space::Memory, dst)?;
            f(Space::Memory, src)
        }
        Instr::MemoryInit { memory, data } => {
            f(Space::Memory, memory)?;
            f(Space::Data, data)
        }
        Instr::DataDrop(v) => f(Space::Data, v),
        Instr::Throw(v) => f(Space::Tag, v),
        Instr::Try {
            handler: TryHandler::Catches { catches, .. },
            ..
        } => {
            for catch in catches.iter_mut() {
                f(Space::Tag, &mut catch.tag)?;
            }
            Ok(())
        }
        Instr::Try {
            handler: TryHandler::Delegate(_),
            ..
        }
        | Instr::Block { .. }
        | Instr::Loop { .. }
        | Instr::If { .. }
        | Instr::Opaque(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        Export, ExternKind, Func, FuncSig, Import, ImportDesc, Memory, MemoryType,
    };

    fn func(name: Option<&str>, body: Vec<Instr>) -> Field {
        Field::Func(Func {
            name: name.map(str::to_string),
            sig: FuncSig::default(),
            locals: Vec::new(),
            body,
        })
    }

    fn import_func(module: &str, field: &str) -> Field {
        Field::Import(Import {
            module: module.into(),
            field: field.into(),
            desc: ImportDesc::Func {
                name: None,
                sig: FuncSig::default(),
            },
        })
    }

    #[test]
    fn test_symbol_table_orders_imports_first() {
        let mut module = Module::new("m");
        module.push(func(Some("local"), vec![]));
        module.push(import_func("env", "ext"));

        let mut module_named = module.clone();
        assign_unique_names(&mut module_named);
        let symbols = SymbolTable::build(&module_named);

        assert_eq!(symbols.len(Space::Func), 2);
        assert_eq!(symbols.num_imported(Space::Func), 1);
        assert_eq!(symbols.name_of(Space::Func, 0), Some("m.f0"));
        assert_eq!(symbols.name_of(Space::Func, 1), Some("m.local"));
    }

    #[test]
    fn test_unique_names_break_collisions() {
        let mut module = Module::new("m");
        module.push(func(Some("dup"), vec![]));
        module.push(func(Some("dup"), vec![]));
        module.push(func(None, vec![]));
        assign_unique_names(&mut module);

        let names: Vec<_> = module.funcs().map(|f| f.name.clone().unwrap()).collect();
        assert_eq!(names, vec!["m.dup", "m.dup.1", "m.f2"]);
    }

    #[test]
    fn test_unique_names_across_overlapping_module_names() {
        let mut first = Module::new("a");
        first.push(func(Some("b.c"), vec![]));
        let mut second = Module::new("a.b");
        second.push(func(Some("c"), vec![]));

        let mut used = UsedNames::default();
        assign_unique_names_avoiding(&mut first, &mut used);
        assign_unique_names_avoiding(&mut second, &mut used);

        assert_eq!(first.funcs().next().unwrap().name.as_deref(), Some("a.b.c"));
        assert_eq!(second.funcs().next().unwrap().name.as_deref(), Some("a.b.c.1"));
        assert!(used.contains(Space::Func, "a.b.c.1"));
    }

    #[test]
    fn test_apply_then_resolve_restores_indices() {
        let mut module = Module::new("m");
        module.push(import_func("env", "ext"));
        module.push(func(None, vec![Instr::Call(Var::Index(0)), Instr::Call(Var::Index(1))]));
        module.push(Field::Export(Export {
            name: "run".into(),
            kind: ExternKind::Func,
            var: Var::Index(1),
        }));
        let original = module.clone();

        assign_unique_names(&mut module);
        apply_names(&mut module).unwrap();
        let body = &module.funcs().next().unwrap().body;
        assert_eq!(body[0], Instr::Call(Var::symbol("m.f0")));
        assert_eq!(body[1], Instr::Call(Var::symbol("m.f1")));

        resolve_names(&mut module).unwrap();
        let body = &module.funcs().next().unwrap().body;
        assert_eq!(body, &original.funcs().next().unwrap().body);
        assert_eq!(module.exports().next().unwrap().var, Var::Index(1));
    }

    #[test]
    fn test_resolve_names_reports_missing() {
        let mut module = Module::new("m");
        module.push(func(Some("f"), vec![Instr::Call(Var::symbol("nowhere"))]));

        let err = resolve_names(&mut module).unwrap_err();
        match err {
            Error::UnresolvedReference {
                space,
                reference,
                context,
            } => {
                assert_eq!(space, Space::Func);
                assert_eq!(reference, "$nowhere");
                assert_eq!(context, "function $f");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_resolve_names_reports_ambiguous() {
        let mut module = Module::new("m");
        module.push(Field::Memory(Memory {
            name: Some("mem".into()),
            ty: MemoryType::pages(1, None),
        }));
        module.push(Field::Memory(Memory {
            name: Some("mem".into()),
            ty: MemoryType::pages(1, None),
        }));
        module.push(func(None, vec![Instr::MemorySize(Var::symbol("mem"))]));

        assert!(matches!(
            resolve_names(&mut module),
            Err(Error::AmbiguousReference {
                space: Space::Memory,
                ..
            })
        ));
    }

    #[test]
    fn test_apply_names_rejects_out_of_range_index() {
        let mut module = Module::new("m");
        module.push(func(None, vec![Instr::GlobalGet(Var::Index(4))]));
        assign_unique_names(&mut module);

        assert!(matches!(
            apply_names(&mut module),
            Err(Error::UnresolvedReference {
                space: Space::Global,
                ..
            })
        ));
    }
}
