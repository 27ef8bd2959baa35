//! Module encoding using wasm-encoder
//!
//! Function signatures are interned into the type section in first-use order,
//! so the IR never carries type indices. Every reference must already be
//! index-form; run [`crate::names::resolve_names`] first.

use crate::ir::{
    BlockSig, DataMode, ElemItems, ElemMode, ExternKind, Field, FuncSig, GlobalType, ImportDesc,
    Instr, MemoryType, Module, RefType, Space, TableType, TryHandler, ValType, Var,
};
use crate::names::SymbolTable;
use crate::walk;
use crate::{Error, Result};
use std::collections::HashMap;
use wasm_encoder::{
    BlockType, CodeSection, ConstExpr, DataCountSection, DataSection, ElementSection, Elements,
    Encode, EntityType, ExportKind, ExportSection, Function, FunctionSection, GlobalSection,
    ImportSection, IndirectNameMap, Instruction, MemorySection, NameMap, NameSection,
    StartSection, TableSection, TagKind, TagSection, TagType, TypeSection,
};

/// Options controlling how modules are written
#[derive(Debug, Clone)]
pub struct EncodeOptions {
    /// Emit a `name` section from the declarations' symbolic names
    pub write_debug_names: bool,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            write_debug_names: true,
        }
    }
}

/// Encode a fully index-resolved module to binary
pub fn encode(module: &Module, options: &EncodeOptions) -> Result<Vec<u8>> {
    let mut encoder = Encoder::new();

    let mut imports = ImportSection::new();
    let mut functions = FunctionSection::new();
    let mut tables = TableSection::new();
    let mut memories = MemorySection::new();
    let mut tags = TagSection::new();
    let mut globals = GlobalSection::new();
    let mut exports = ExportSection::new();
    let mut start = None;
    let mut elements = ElementSection::new();
    let mut code = CodeSection::new();
    let mut data = DataSection::new();

    for field in &module.fields {
        match field {
            Field::Import(import) => {
                let ty = match &import.desc {
                    ImportDesc::Func { sig, .. } => EntityType::Function(encoder.type_index(sig)),
                    ImportDesc::Table { ty, .. } => EntityType::Table(table_type(ty)),
                    ImportDesc::Memory { ty, .. } => EntityType::Memory(memory_type(ty)),
                    ImportDesc::Global { ty, .. } => EntityType::Global(global_type(ty)),
                    ImportDesc::Tag { sig, .. } => EntityType::Tag(TagType {
                        kind: TagKind::Exception,
                        func_type_idx: encoder.type_index(sig),
                    }),
                };
                imports.import(&import.module, &import.field, ty);
            }
            Field::Func(func) => {
                functions.function(encoder.type_index(&func.sig));
                let mut body = Vec::new();
                encoder.expr(&func.body, &mut body)?;
                Instruction::End.encode(&mut body);
                let mut f = Function::new(func.locals.iter().map(|(n, ty)| (*n, val_type(*ty))));
                f.raw(body);
                code.function(&f);
            }
            Field::Table(table) => match &table.init {
                Some(init) => {
                    let init = encoder.const_expr(init)?;
                    tables.table_with_init(table_type(&table.ty), &init);
                }
                None => {
                    tables.table(table_type(&table.ty));
                }
            },
            Field::Memory(memory) => {
                memories.memory(memory_type(&memory.ty));
            }
            Field::Global(global) => {
                let init = encoder.const_expr(&global.init)?;
                globals.global(global_type(&global.ty), &init);
            }
            Field::Tag(tag) => {
                tags.tag(TagType {
                    kind: TagKind::Exception,
                    func_type_idx: encoder.type_index(&tag.sig),
                });
            }
            Field::Export(export) => {
                let kind = match export.kind {
                    ExternKind::Func => ExportKind::Func,
                    ExternKind::Table => ExportKind::Table,
                    ExternKind::Memory => ExportKind::Memory,
                    ExternKind::Global => ExportKind::Global,
                    ExternKind::Tag => ExportKind::Tag,
                };
                exports.export(&export.name, kind, index(export.kind.into(), &export.var)?);
            }
            Field::Start(var) => {
                if start.is_some() {
                    return Err(Error::EncodingError(
                        "module has more than one start function".to_string(),
                    ));
                }
                start = Some(index(Space::Func, var)?);
            }
            Field::Elem(segment) => {
                let items = match &segment.items {
                    ElemItems::Funcs(funcs) => ElemPayload::Funcs(
                        funcs
                            .iter()
                            .map(|f| index(Space::Func, f))
                            .collect::<Result<Vec<_>>>()?,
                    ),
                    ElemItems::Exprs(exprs) => ElemPayload::Exprs(
                        exprs
                            .iter()
                            .map(|e| encoder.const_expr(e))
                            .collect::<Result<Vec<_>>>()?,
                    ),
                };
                let elems = match &items {
                    ElemPayload::Funcs(funcs) => Elements::Functions(funcs.as_slice().into()),
                    ElemPayload::Exprs(exprs) => {
                        Elements::Expressions(ref_type(segment.ty), exprs.as_slice().into())
                    }
                };
                match &segment.mode {
                    ElemMode::Passive => {
                        elements.passive(elems);
                    }
                    ElemMode::Declared => {
                        elements.declared(elems);
                    }
                    ElemMode::Active { table, offset } => {
                        let offset = encoder.const_expr(offset)?;
                        elements.active(Some(index(Space::Table, table)?), &offset, elems);
                    }
                }
            }
            Field::Data(segment) => match &segment.mode {
                DataMode::Passive => {
                    data.passive(segment.data.iter().copied());
                }
                DataMode::Active { memory, offset } => {
                    let offset = encoder.const_expr(offset)?;
                    data.active(
                        index(Space::Memory, memory)?,
                        &offset,
                        segment.data.iter().copied(),
                    );
                }
            },
        }
    }

    let mut out = wasm_encoder::Module::new();
    if !encoder.types.is_empty() {
        out.section(&encoder.types);
    }
    if !imports.is_empty() {
        out.section(&imports);
    }
    if !functions.is_empty() {
        out.section(&functions);
    }
    if !tables.is_empty() {
        out.section(&tables);
    }
    if !memories.is_empty() {
        out.section(&memories);
    }
    if !tags.is_empty() {
        out.section(&tags);
    }
    if !globals.is_empty() {
        out.section(&globals);
    }
    if !exports.is_empty() {
        out.section(&exports);
    }
    if let Some(function_index) = start {
        out.section(&StartSection { function_index });
    }
    if !elements.is_empty() {
        out.section(&elements);
    }
    if encoder.uses_data_count {
        out.section(&DataCountSection { count: data.len() });
    }
    if !code.is_empty() {
        out.section(&code);
    }
    if !data.is_empty() {
        out.section(&data);
    }
    if options.write_debug_names {
        out.section(&name_section(module)?);
    }

    let bytes = out.finish();
    log::debug!(
        "Encoded module {}: {} bytes, {} types",
        module.name,
        bytes.len(),
        encoder.type_ids.len()
    );
    Ok(bytes)
}

/// Owned element payload, borrowed by [`Elements`] while encoding
enum ElemPayload {
    Funcs(Vec<u32>),
    Exprs(Vec<ConstExpr>),
}

struct Encoder {
    types: TypeSection,
    type_ids: HashMap<FuncSig, u32>,
    uses_data_count: bool,
}

impl Encoder {
    fn new() -> Self {
        Self {
            types: TypeSection::new(),
            type_ids: HashMap::new(),
            uses_data_count: false,
        }
    }

    fn type_index(&mut self, sig: &FuncSig) -> u32 {
        if let Some(&idx) = self.type_ids.get(sig) {
            return idx;
        }
        let idx = self.type_ids.len() as u32;
        self.types.ty().function(
            sig.params.iter().map(|ty| val_type(*ty)),
            sig.results.iter().map(|ty| val_type(*ty)),
        );
        self.type_ids.insert(sig.clone(), idx);
        idx
    }

    fn block_type(&mut self, sig: &BlockSig) -> BlockType {
        match sig {
            BlockSig::Empty => BlockType::Empty,
            BlockSig::Value(ty) => BlockType::Result(val_type(*ty)),
            BlockSig::Func(sig) => BlockType::FunctionType(self.type_index(sig)),
        }
    }

    fn const_expr(&mut self, expr: &[Instr]) -> Result<ConstExpr> {
        let mut bytes = Vec::new();
        self.expr(expr, &mut bytes)?;
        Ok(ConstExpr::raw(bytes))
    }

    fn expr(&mut self, expr: &[Instr], sink: &mut Vec<u8>) -> Result<()> {
        for instr in expr {
            self.instr(instr, sink)?;
        }
        Ok(())
    }

    fn instr(&mut self, instr: &Instr, sink: &mut Vec<u8>) -> Result<()> {
        let encoded = match instr {
            Instr::Block { sig, body, .. } => {
                Instruction::Block(self.block_type(sig)).encode(sink);
                self.expr(body, sink)?;
                Instruction::End
            }
            Instr::Loop { sig, body, .. } => {
                Instruction::Loop(self.block_type(sig)).encode(sink);
                self.expr(body, sink)?;
                Instruction::End
            }
            Instr::If {
                sig,
                then,
                otherwise,
                ..
            } => {
                Instruction::If(self.block_type(sig)).encode(sink);
                self.expr(then, sink)?;
                if let Some(otherwise) = otherwise {
                    Instruction::Else.encode(sink);
                    self.expr(otherwise, sink)?;
                }
                Instruction::End
            }
            Instr::Try {
                sig, body, handler, ..
            } => {
                Instruction::Try(self.block_type(sig)).encode(sink);
                self.expr(body, sink)?;
                match handler {
                    TryHandler::Catches { catches, catch_all } => {
                        for catch in catches {
                            Instruction::Catch(index(Space::Tag, &catch.tag)?).encode(sink);
                            self.expr(&catch.body, sink)?;
                        }
                        if let Some(catch_all) = catch_all {
                            Instruction::CatchAll.encode(sink);
                            self.expr(catch_all, sink)?;
                        }
                        Instruction::End
                    }
                    TryHandler::Delegate(depth) => Instruction::Delegate(*depth),
                }
            }

            Instr::Call(f) => Instruction::Call(index(Space::Func, f)?),
            Instr::ReturnCall(f) => Instruction::ReturnCall(index(Space::Func, f)?),
            Instr::CallIndirect { table, sig } => Instruction::CallIndirect {
                type_index: self.type_index(sig),
                table_index: index(Space::Table, table)?,
            },
            Instr::ReturnCallIndirect { table, sig } => Instruction::ReturnCallIndirect {
                type_index: self.type_index(sig),
                table_index: index(Space::Table, table)?,
            },
            Instr::RefFunc(f) => Instruction::RefFunc(index(Space::Func, f)?),

            Instr::GlobalGet(g) => Instruction::GlobalGet(index(Space::Global, g)?),
            Instr::GlobalSet(g) => Instruction::GlobalSet(index(Space::Global, g)?),

            Instr::TableGet(t) => Instruction::TableGet(index(Space::Table, t)?),
            Instr::TableSet(t) => Instruction::TableSet(index(Space::Table, t)?),
            Instr::TableGrow(t) => Instruction::TableGrow(index(Space::Table, t)?),
            Instr::TableSize(t) => Instruction::TableSize(index(Space::Table, t)?),
            Instr::TableFill(t) => Instruction::TableFill(index(Space::Table, t)?),
            Instr::TableCopy { dst, src } => Instruction::TableCopy {
                src_table: index(Space::Table, src)?,
                dst_table: index(Space::Table, dst)?,
            },
            Instr::TableInit { table, elem } => Instruction::TableInit {
                elem_index: index(Space::Elem, elem)?,
                table: index(Space::Table, table)?,
            },
            Instr::ElemDrop(e) => Instruction::ElemDrop(index(Space::Elem, e)?),

            Instr::Load(access) | Instr::Store(access) => {
                sink.extend_from_slice(&access.opcode);
                wasm_encoder::MemArg {
                    offset: access.memarg.offset,
                    align: access.memarg.align,
                    memory_index: index(Space::Memory, &access.memarg.memory)?,
                }
                .encode(sink);
                if let Some(lane) = access.lane {
                    sink.push(lane);
                }
                return Ok(());
            }
            Instr::MemorySize(m) => Instruction::MemorySize(index(Space::Memory, m)?),
            Instr::MemoryGrow(m) => Instruction::MemoryGrow(index(Space::Memory, m)?),
            Instr::MemoryFill(m) => Instruction::MemoryFill(index(Space::Memory, m)?),
            Instr::MemoryCopy { dst, src } => Instruction::MemoryCopy {
                src_mem: index(Space::Memory, src)?,
                dst_mem: index(Space::Memory, dst)?,
            },
            Instr::MemoryInit { memory, data } => {
                self.uses_data_count = true;
                Instruction::MemoryInit {
                    mem: index(Space::Memory, memory)?,
                    data_index: index(Space::Data, data)?,
                }
            }
            Instr::DataDrop(d) => {
                self.uses_data_count = true;
                Instruction::DataDrop(index(Space::Data, d)?)
            }

            Instr::Throw(tag) => Instruction::Throw(index(Space::Tag, tag)?),

            Instr::Opaque(bytes) => {
                sink.extend_from_slice(bytes);
                return Ok(());
            }
        };
        encoded.encode(sink);
        Ok(())
    }
}

/// Numeric index of a resolved reference
fn index(space: Space, var: &Var) -> Result<u32> {
    match var {
        Var::Index(idx) => Ok(*idx),
        Var::Symbol(name) => Err(Error::SymbolicReference {
            space,
            name: name.clone(),
        }),
    }
}

fn name_section(module: &Module) -> Result<NameSection> {
    let symbols = SymbolTable::build(module);
    let mut names = NameSection::new();
    if !module.name.is_empty() {
        names.module(&module.name);
    }

    let map = |space: Space| {
        let mut map = NameMap::new();
        for idx in 0..symbols.len(space) {
            if let Some(name) = symbols.name_of(space, idx) {
                map.append(idx, name);
            }
        }
        map
    };
    names.functions(&map(Space::Func));

    let mut labels = IndirectNameMap::new();
    let mut labeled_funcs = 0;
    let base = symbols.num_imported(Space::Func);
    for (i, func) in module.funcs().enumerate() {
        let mut func_labels = NameMap::new();
        let mut named = 0;
        let mut next = 0u32;
        walk::walk(&func.body, &mut Vec::new(), &mut |instr, _| {
            match instr {
                Instr::Block { label, .. }
                | Instr::Loop { label, .. }
                | Instr::If { label, .. }
                | Instr::Try { label, .. } => {
                    if let Some(label) = label {
                        func_labels.append(next, label);
                        named += 1;
                    }
                    next += 1;
                }
                _ => {}
            }
            Ok(())
        })?;
        if named > 0 {
            labels.append(base + i as u32, &func_labels);
            labeled_funcs += 1;
        }
    }
    if labeled_funcs > 0 {
        names.labels(&labels);
    }

    names.tables(&map(Space::Table));
    names.memories(&map(Space::Memory));
    names.globals(&map(Space::Global));
    names.elements(&map(Space::Elem));
    names.data(&map(Space::Data));
    names.tags(&map(Space::Tag));
    Ok(names)
}

fn val_type(ty: ValType) -> wasm_encoder::ValType {
    match ty {
        ValType::I32 => wasm_encoder::ValType::I32,
        ValType::I64 => wasm_encoder::ValType::I64,
        ValType::F32 => wasm_encoder::ValType::F32,
        ValType::F64 => wasm_encoder::ValType::F64,
        ValType::V128 => wasm_encoder::ValType::V128,
        ValType::Ref(rt) => wasm_encoder::ValType::Ref(ref_type(rt)),
    }
}

fn ref_type(ty: RefType) -> wasm_encoder::RefType {
    match ty {
        RefType::Func => wasm_encoder::RefType::FUNCREF,
        RefType::Extern => wasm_encoder::RefType::EXTERNREF,
    }
}

fn table_type(ty: &TableType) -> wasm_encoder::TableType {
    wasm_encoder::TableType {
        element_type: ref_type(ty.element),
        table64: ty.table64,
        minimum: ty.minimum,
        maximum: ty.maximum,
        shared: false,
    }
}

fn memory_type(ty: &MemoryType) -> wasm_encoder::MemoryType {
    wasm_encoder::MemoryType {
        minimum: ty.minimum,
        maximum: ty.maximum,
        memory64: ty.memory64,
        shared: ty.shared,
        page_size_log2: ty.page_size_log2,
    }
}

fn global_type(ty: &GlobalType) -> wasm_encoder::GlobalType {
    wasm_encoder::GlobalType {
        val_type: val_type(ty.val),
        mutable: ty.mutable,
        shared: false,
    }
}
