//! Module IR shared by every pass
//!
//! A [`Module`] is a name plus an ordered list of [`Field`]s. Field order only
//! matters for index assignment: within each index space, imported
//! declarations come first (in field order), followed by local declarations
//! (in field order).
//!
//! References between declarations are [`Var`]s, either symbolic or a dense
//! index. The binary reader produces index-form references, the naming passes
//! convert between the two forms, and the encoder only accepts index form.
//!
//! Function signatures are stored structurally (including block types and
//! `call_indirect` types), so merging two modules never has to merge type
//! sections.

use std::collections::HashMap;
use std::fmt;
use wasm_encoder::Encode;

/// Reference to a declaration, by symbolic name or by dense index
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Var {
    /// Symbolic name (without the leading `$`)
    Symbol(String),
    /// Dense index within one index space
    Index(u32),
}

impl Var {
    /// Create a symbolic reference
    pub fn symbol(name: impl Into<String>) -> Self {
        Var::Symbol(name.into())
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Var::Symbol(name) => Some(name),
            Var::Index(_) => None,
        }
    }

    pub fn as_index(&self) -> Option<u32> {
        match self {
            Var::Index(idx) => Some(*idx),
            Var::Symbol(_) => None,
        }
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Var::Symbol(name) => write!(f, "${name}"),
            Var::Index(idx) => write!(f, "{idx}"),
        }
    }
}

/// Kind of an importable/exportable declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExternKind {
    Func,
    Table,
    Memory,
    Global,
    Tag,
}

/// Index spaces of a module
///
/// The first five are the importable kinds; data and element segments have
/// their own index spaces but are never imported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Space {
    Func,
    Table,
    Memory,
    Global,
    Tag,
    Data,
    Elem,
}

impl Space {
    pub const ALL: [Space; 7] = [
        Space::Func,
        Space::Table,
        Space::Memory,
        Space::Global,
        Space::Tag,
        Space::Data,
        Space::Elem,
    ];

    /// Short prefix used when generating names for anonymous declarations
    pub fn prefix(self) -> &'static str {
        match self {
            Space::Func => "f",
            Space::Table => "t",
            Space::Memory => "m",
            Space::Global => "g",
            Space::Tag => "e",
            Space::Data => "d",
            Space::Elem => "el",
        }
    }
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desc = match self {
            Space::Func => "function",
            Space::Table => "table",
            Space::Memory => "memory",
            Space::Global => "global",
            Space::Tag => "tag",
            Space::Data => "data segment",
            Space::Elem => "element segment",
        };
        f.write_str(desc)
    }
}

impl From<ExternKind> for Space {
    fn from(kind: ExternKind) -> Self {
        match kind {
            ExternKind::Func => Space::Func,
            ExternKind::Table => Space::Table,
            ExternKind::Memory => Space::Memory,
            ExternKind::Global => Space::Global,
            ExternKind::Tag => Space::Tag,
        }
    }
}

/// Reference types supported by the IR
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefType {
    Func,
    Extern,
}

/// Value types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
    V128,
    Ref(RefType),
}

/// Structural function signature
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FuncSig {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

impl FuncSig {
    pub fn new(params: impl Into<Vec<ValType>>, results: impl Into<Vec<ValType>>) -> Self {
        Self {
            params: params.into(),
            results: results.into(),
        }
    }
}

/// Memory type definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryType {
    pub minimum: u64,
    pub maximum: Option<u64>,
    pub memory64: bool,
    pub shared: bool,
    pub page_size_log2: Option<u32>,
}

impl MemoryType {
    /// Unshared 32-bit memory with the given page limits
    pub fn pages(minimum: u64, maximum: Option<u64>) -> Self {
        Self {
            minimum,
            maximum,
            memory64: false,
            shared: false,
            page_size_log2: None,
        }
    }
}

/// Table type definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableType {
    pub element: RefType,
    pub minimum: u64,
    pub maximum: Option<u64>,
    pub table64: bool,
}

/// Global type definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalType {
    pub val: ValType,
    pub mutable: bool,
}

/// Type of a structured control instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockSig {
    Empty,
    Value(ValType),
    Func(FuncSig),
}

/// An instruction sequence
pub type Expr = Vec<Instr>;

/// Instructions
///
/// Every instruction that can reference a declaration has its own variant
/// carrying [`Var`]s. Everything else is kept as [`Instr::Opaque`] raw bytes,
/// which contain no module-level indices.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Block {
        label: Option<String>,
        sig: BlockSig,
        body: Expr,
    },
    Loop {
        label: Option<String>,
        sig: BlockSig,
        body: Expr,
    },
    If {
        label: Option<String>,
        sig: BlockSig,
        then: Expr,
        otherwise: Option<Expr>,
    },
    Try {
        label: Option<String>,
        sig: BlockSig,
        body: Expr,
        handler: TryHandler,
    },

    Call(Var),
    ReturnCall(Var),
    CallIndirect { table: Var, sig: FuncSig },
    ReturnCallIndirect { table: Var, sig: FuncSig },
    RefFunc(Var),

    GlobalGet(Var),
    GlobalSet(Var),

    TableGet(Var),
    TableSet(Var),
    TableGrow(Var),
    TableSize(Var),
    TableFill(Var),
    TableCopy { dst: Var, src: Var },
    TableInit { table: Var, elem: Var },
    ElemDrop(Var),

    Load(MemAccess),
    Store(MemAccess),
    MemorySize(Var),
    MemoryGrow(Var),
    MemoryFill(Var),
    MemoryCopy { dst: Var, src: Var },
    MemoryInit { memory: Var, data: Var },
    DataDrop(Var),

    Throw(Var),

    /// Encoded instruction without module-level references
    Opaque(Vec<u8>),
}

impl Instr {
    /// `i32.const` as an opaque instruction
    pub fn i32_const(value: i32) -> Self {
        let mut bytes = Vec::new();
        wasm_encoder::Instruction::I32Const(value).encode(&mut bytes);
        Instr::Opaque(bytes)
    }

    /// `i32.load` with natural alignment
    pub fn i32_load(memory: Var, offset: u64) -> Self {
        Instr::Load(MemAccess {
            name: "i32.load",
            opcode: vec![0x28],
            memarg: MemArg {
                memory,
                align: 2,
                offset,
            },
            lane: None,
        })
    }

    /// `i32.store` with natural alignment
    pub fn i32_store(memory: Var, offset: u64) -> Self {
        Instr::Store(MemAccess {
            name: "i32.store",
            opcode: vec![0x36],
            memarg: MemArg {
                memory,
                align: 2,
                offset,
            },
            lane: None,
        })
    }
}

/// How a legacy `try` block ends
#[derive(Debug, Clone, PartialEq)]
pub enum TryHandler {
    Catches {
        catches: Vec<Catch>,
        catch_all: Option<Expr>,
    },
    Delegate(u32),
}

/// A `catch` clause of a legacy `try` block
#[derive(Debug, Clone, PartialEq)]
pub struct Catch {
    pub tag: Var,
    pub body: Expr,
}

/// A load or store
#[derive(Debug, Clone, PartialEq)]
pub struct MemAccess {
    /// Text-format mnemonic, for diagnostics
    pub name: &'static str,
    /// Opcode bytes (including any prefix) preceding the memarg
    pub opcode: Vec<u8>,
    pub memarg: MemArg,
    /// Lane immediate of SIMD lane accesses
    pub lane: Option<u8>,
}

/// Memory immediate of loads and stores
#[derive(Debug, Clone, PartialEq)]
pub struct MemArg {
    pub memory: Var,
    /// Alignment exponent
    pub align: u32,
    pub offset: u64,
}

/// Import declaration, carrying the locally bound declaration
#[derive(Debug, Clone, PartialEq)]
pub struct Import {
    /// Source module name
    pub module: String,
    /// Field name within the source module
    pub field: String,
    pub desc: ImportDesc,
}

/// Declared signature and local name of an import
#[derive(Debug, Clone, PartialEq)]
pub enum ImportDesc {
    Func { name: Option<String>, sig: FuncSig },
    Table { name: Option<String>, ty: TableType },
    Memory { name: Option<String>, ty: MemoryType },
    Global { name: Option<String>, ty: GlobalType },
    Tag { name: Option<String>, sig: FuncSig },
}

impl ImportDesc {
    pub fn kind(&self) -> ExternKind {
        match self {
            ImportDesc::Func { .. } => ExternKind::Func,
            ImportDesc::Table { .. } => ExternKind::Table,
            ImportDesc::Memory { .. } => ExternKind::Memory,
            ImportDesc::Global { .. } => ExternKind::Global,
            ImportDesc::Tag { .. } => ExternKind::Tag,
        }
    }

    /// Name the import is bound to inside the importing module
    pub fn name(&self) -> Option<&str> {
        match self {
            ImportDesc::Func { name, .. }
            | ImportDesc::Table { name, .. }
            | ImportDesc::Memory { name, .. }
            | ImportDesc::Global { name, .. }
            | ImportDesc::Tag { name, .. } => name.as_deref(),
        }
    }

    pub fn name_mut(&mut self) -> &mut Option<String> {
        match self {
            ImportDesc::Func { name, .. }
            | ImportDesc::Table { name, .. }
            | ImportDesc::Memory { name, .. }
            | ImportDesc::Global { name, .. }
            | ImportDesc::Tag { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Func {
    pub name: Option<String>,
    pub sig: FuncSig,
    /// Local declarations as (count, type) runs, parameters excluded
    pub locals: Vec<(u32, ValType)>,
    pub body: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    pub name: Option<String>,
    pub ty: GlobalType,
    pub init: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Memory {
    pub name: Option<String>,
    pub ty: MemoryType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub name: Option<String>,
    pub ty: TableType,
    /// Explicit initializer expression, if any
    pub init: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub name: Option<String>,
    pub sig: FuncSig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Export {
    /// Public export name
    pub name: String,
    pub kind: ExternKind,
    pub var: Var,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElemSegment {
    pub name: Option<String>,
    pub mode: ElemMode,
    pub ty: RefType,
    pub items: ElemItems,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ElemMode {
    Passive,
    Declared,
    Active { table: Var, offset: Expr },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ElemItems {
    Funcs(Vec<Var>),
    Exprs(Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataSegment {
    pub name: Option<String>,
    pub mode: DataMode,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataMode {
    Passive,
    Active { memory: Var, offset: Expr },
}

/// One declaration or directive of a module
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Import(Import),
    Func(Func),
    Global(Global),
    Memory(Memory),
    Table(Table),
    Tag(Tag),
    Export(Export),
    Elem(ElemSegment),
    Data(DataSegment),
    Start(Var),
}

/// A named module
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Module {
    /// Name other modules use to import from this one
    pub name: String,
    pub fields: Vec<Field>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn push(&mut self, field: Field) -> &mut Self {
        self.fields.push(field);
        self
    }

    /// Move every field out, leaving the module empty
    pub fn take_fields(&mut self) -> Vec<Field> {
        std::mem::take(&mut self.fields)
    }

    /// Append owned fields at the end, preserving their order
    pub fn append_fields(&mut self, fields: Vec<Field>) {
        self.fields.extend(fields);
    }

    pub fn imports(&self) -> impl Iterator<Item = &Import> {
        self.fields.iter().filter_map(|field| match field {
            Field::Import(import) => Some(import),
            _ => None,
        })
    }

    pub fn exports(&self) -> impl Iterator<Item = &Export> {
        self.fields.iter().filter_map(|field| match field {
            Field::Export(export) => Some(export),
            _ => None,
        })
    }

    pub fn funcs(&self) -> impl Iterator<Item = &Func> {
        self.fields.iter().filter_map(|field| match field {
            Field::Func(func) => Some(func),
            _ => None,
        })
    }

    /// Number of imported declarations of `kind`
    pub fn num_imports(&self, kind: ExternKind) -> u32 {
        self.imports().filter(|i| i.desc.kind() == kind).count() as u32
    }

    /// Number of locally defined declarations in `space`
    pub fn num_locals(&self, space: Space) -> u32 {
        self.fields
            .iter()
            .filter(|field| {
                matches!(
                    (space, field),
                    (Space::Func, Field::Func(_))
                        | (Space::Table, Field::Table(_))
                        | (Space::Memory, Field::Memory(_))
                        | (Space::Global, Field::Global(_))
                        | (Space::Tag, Field::Tag(_))
                        | (Space::Data, Field::Data(_))
                        | (Space::Elem, Field::Elem(_))
                )
            })
            .count() as u32
    }

    /// Lookup table from export name to export
    pub fn export_bindings(&self) -> ExportBindings<'_> {
        let mut by_name = HashMap::new();
        for export in self.exports() {
            by_name.entry(export.name.as_str()).or_insert(export);
        }
        ExportBindings { by_name }
    }
}

/// Export name to export binding table of one module
///
/// When an export name is duplicated, the first export wins.
#[derive(Debug)]
pub struct ExportBindings<'a> {
    by_name: HashMap<&'a str, &'a Export>,
}

impl<'a> ExportBindings<'a> {
    pub fn find(&self, name: &str) -> Option<&'a Export> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn import(module: &str, field: &str, desc: ImportDesc) -> Field {
        Field::Import(Import {
            module: module.to_string(),
            field: field.to_string(),
            desc,
        })
    }

    #[test]
    fn test_take_and_append_fields() {
        let mut a = Module::new("a");
        a.push(Field::Start(Var::Index(0)));
        a.push(Field::Memory(Memory {
            name: None,
            ty: MemoryType::pages(1, None),
        }));

        let mut b = Module::new("b");
        let moved = a.take_fields();
        assert!(a.fields.is_empty());
        b.append_fields(moved);
        assert_eq!(b.fields.len(), 2);
        assert!(matches!(b.fields[0], Field::Start(_)));
    }

    #[test]
    fn test_import_and_local_counts() {
        let mut module = Module::new("m");
        module.push(import(
            "env",
            "mem",
            ImportDesc::Memory {
                name: None,
                ty: MemoryType::pages(1, None),
            },
        ));
        module.push(Field::Memory(Memory {
            name: None,
            ty: MemoryType::pages(1, None),
        }));
        module.push(Field::Memory(Memory {
            name: None,
            ty: MemoryType::pages(2, None),
        }));

        assert_eq!(module.num_imports(ExternKind::Memory), 1);
        assert_eq!(module.num_imports(ExternKind::Func), 0);
        assert_eq!(module.num_locals(Space::Memory), 2);
    }

    #[test]
    fn test_export_bindings_first_wins() {
        let mut module = Module::new("m");
        module.push(Field::Export(Export {
            name: "run".into(),
            kind: ExternKind::Func,
            var: Var::Index(0),
        }));
        module.push(Field::Export(Export {
            name: "run".into(),
            kind: ExternKind::Func,
            var: Var::Index(1),
        }));

        let bindings = module.export_bindings();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings.find("run").unwrap().var, Var::Index(0));
        assert!(bindings.find("missing").is_none());
    }

    #[test]
    fn test_var_display() {
        assert_eq!(Var::symbol("L.helper").to_string(), "$L.helper");
        assert_eq!(Var::Index(3).to_string(), "3");
    }
}
