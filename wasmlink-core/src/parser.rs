//! Core module parsing using wasmparser
//!
//! This module decodes a core WebAssembly binary into the linker IR. Every
//! cross-declaration reference becomes an index-form [`Var`], structured
//! control is decoded into a tree, and instructions that carry no
//! module-level index are kept as their raw encoding.

use crate::ir::{
    BlockSig, Catch, DataMode, DataSegment, ElemItems, ElemMode, ElemSegment, Export, Expr,
    ExternKind, Field, Func, FuncSig, Global, GlobalType, Import, ImportDesc, Instr, MemAccess,
    MemArg, Memory, MemoryType, Module, RefType, Space, Table, TableType, Tag, TryHandler, ValType,
    Var,
};
use crate::walk;
use crate::{Error, Result};
use std::collections::HashMap;
use wasmparser::{
    BlockType, Encoding, HeapType, KnownCustom, Name, NameSectionReader, Operator,
    OperatorsReader, Parser, Payload, TypeRef, ValType as WasmValType, WasmFeatures,
};

/// Options controlling how binaries are decoded
#[derive(Debug, Clone)]
pub struct ParseOptions {
    /// Proposals the reader accepts instructions from
    pub features: WasmFeatures,
    /// Populate symbolic names from the `name` custom section
    pub read_debug_names: bool,
    /// Treat a malformed `name` section as a parse error instead of ignoring it
    pub fail_on_custom_section_error: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            features: WasmFeatures::default(),
            read_debug_names: true,
            fail_on_custom_section_error: true,
        }
    }
}

/// Parser for core WebAssembly modules
pub struct ModuleParser {
    options: ParseOptions,
}

impl ModuleParser {
    /// Create a parser with default options
    pub fn new() -> Self {
        Self::with_options(ParseOptions::default())
    }

    pub fn with_options(options: ParseOptions) -> Self {
        Self { options }
    }

    /// Parse module bytes into an IR module called `name`
    ///
    /// An empty `name` falls back to the module name recorded in the `name`
    /// section, if any.
    pub fn parse(&self, name: &str, bytes: &[u8]) -> Result<Module> {
        if bytes.len() < 8 {
            return Err(Error::InvalidWasm("file too small".to_string()));
        }
        if &bytes[0..4] != b"\0asm" {
            return Err(Error::InvalidWasm("invalid magic number".to_string()));
        }

        let mut builder = ModuleBuilder::new(&self.options, bytes);
        for payload in Parser::new(0).parse_all(bytes) {
            builder.handle_payload(payload?)?;
        }
        builder.finish(name)
    }
}

impl Default for ModuleParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Names recovered from the `name` custom section, keyed by absolute index
#[derive(Debug, Default)]
struct DebugNames {
    module: Option<String>,
    spaces: HashMap<Space, HashMap<u32, String>>,
    /// Label names per function, numbered by block-introducing instruction
    labels: HashMap<u32, HashMap<u32, String>>,
}

impl DebugNames {
    fn read(reader: NameSectionReader<'_>) -> Result<Self> {
        let mut names = DebugNames::default();
        for subsection in reader {
            let (space, map) = match subsection? {
                Name::Module { name, .. } => {
                    names.module = Some(name.to_string());
                    continue;
                }
                Name::Label(indirect) => {
                    for func in indirect {
                        let func = func?;
                        let mut labels = HashMap::new();
                        for naming in func.names {
                            let naming = naming?;
                            labels.insert(naming.index, naming.name.to_string());
                        }
                        names.labels.insert(func.index, labels);
                    }
                    continue;
                }
                Name::Function(map) => (Space::Func, map),
                Name::Table(map) => (Space::Table, map),
                Name::Memory(map) => (Space::Memory, map),
                Name::Global(map) => (Space::Global, map),
                Name::Tag(map) => (Space::Tag, map),
                Name::Element(map) => (Space::Elem, map),
                Name::Data(map) => (Space::Data, map),
                _ => continue,
            };
            let entries = names.spaces.entry(space).or_default();
            for naming in map {
                let naming = naming?;
                entries.insert(naming.index, naming.name.to_string());
            }
        }
        Ok(names)
    }

    fn get(&self, space: Space, idx: u32) -> Option<String> {
        self.spaces.get(&space)?.get(&idx).cloned()
    }
}

/// Accumulates the sections of one module
struct ModuleBuilder<'a> {
    options: &'a ParseOptions,
    bytes: &'a [u8],
    types: Vec<FuncSig>,
    imports: Vec<Import>,
    func_sigs: Vec<FuncSig>,
    funcs: Vec<Func>,
    tables: Vec<Table>,
    memories: Vec<Memory>,
    globals: Vec<Global>,
    tags: Vec<Tag>,
    exports: Vec<Export>,
    start: Option<u32>,
    elems: Vec<ElemSegment>,
    datas: Vec<DataSegment>,
    names: Option<DebugNames>,
}

impl<'a> ModuleBuilder<'a> {
    fn new(options: &'a ParseOptions, bytes: &'a [u8]) -> Self {
        Self {
            options,
            bytes,
            types: Vec::new(),
            imports: Vec::new(),
            func_sigs: Vec::new(),
            funcs: Vec::new(),
            tables: Vec::new(),
            memories: Vec::new(),
            globals: Vec::new(),
            tags: Vec::new(),
            exports: Vec::new(),
            start: None,
            elems: Vec::new(),
            datas: Vec::new(),
            names: None,
        }
    }

    fn sig(&self, type_index: u32) -> Result<FuncSig> {
        lookup_sig(&self.types, type_index)
    }

    fn expr(&self, reader: OperatorsReader<'a>) -> Result<Expr> {
        ExprReader {
            reader,
            bytes: self.bytes,
            types: &self.types,
            features: self.options.features,
        }
        .read_expr()
    }

    fn handle_payload(&mut self, payload: Payload<'a>) -> Result<()> {
        match payload {
            Payload::Version { encoding, .. } => {
                if encoding != Encoding::Module {
                    return Err(Error::NotAModule);
                }
            }

            Payload::TypeSection(reader) => {
                for func_type in reader.into_iter_err_on_gc_types() {
                    let func_type = func_type?;
                    self.types.push(FuncSig {
                        params: convert_val_types(func_type.params())?,
                        results: convert_val_types(func_type.results())?,
                    });
                }
            }

            Payload::ImportSection(reader) => {
                for import in reader {
                    let import = import?;
                    let desc = match import.ty {
                        TypeRef::Func(idx) => ImportDesc::Func {
                            name: None,
                            sig: self.sig(idx)?,
                        },
                        TypeRef::Table(t) => ImportDesc::Table {
                            name: None,
                            ty: convert_table_type(&t)?,
                        },
                        TypeRef::Memory(m) => ImportDesc::Memory {
                            name: None,
                            ty: convert_memory_type(&m),
                        },
                        TypeRef::Global(g) => ImportDesc::Global {
                            name: None,
                            ty: convert_global_type(&g)?,
                        },
                        TypeRef::Tag(t) => ImportDesc::Tag {
                            name: None,
                            sig: self.sig(t.func_type_idx)?,
                        },
                    };
                    self.imports.push(Import {
                        module: import.module.to_string(),
                        field: import.name.to_string(),
                        desc,
                    });
                }
            }

            Payload::FunctionSection(reader) => {
                for type_index in reader {
                    let sig = self.sig(type_index?)?;
                    self.func_sigs.push(sig);
                }
            }

            Payload::TableSection(reader) => {
                for table in reader {
                    let table = table?;
                    let init = match table.init {
                        wasmparser::TableInit::RefNull => None,
                        wasmparser::TableInit::Expr(expr) => {
                            Some(self.expr(expr.get_operators_reader())?)
                        }
                    };
                    self.tables.push(Table {
                        name: None,
                        ty: convert_table_type(&table.ty)?,
                        init,
                    });
                }
            }

            Payload::MemorySection(reader) => {
                for memory in reader {
                    self.memories.push(Memory {
                        name: None,
                        ty: convert_memory_type(&memory?),
                    });
                }
            }

            Payload::TagSection(reader) => {
                for tag in reader {
                    let sig = self.sig(tag?.func_type_idx)?;
                    self.tags.push(Tag { name: None, sig });
                }
            }

            Payload::GlobalSection(reader) => {
                for global in reader {
                    let global = global?;
                    let init = self.expr(global.init_expr.get_operators_reader())?;
                    self.globals.push(Global {
                        name: None,
                        ty: convert_global_type(&global.ty)?,
                        init,
                    });
                }
            }

            Payload::ExportSection(reader) => {
                for export in reader {
                    let export = export?;
                    let kind = match export.kind {
                        wasmparser::ExternalKind::Func => ExternKind::Func,
                        wasmparser::ExternalKind::Table => ExternKind::Table,
                        wasmparser::ExternalKind::Memory => ExternKind::Memory,
                        wasmparser::ExternalKind::Global => ExternKind::Global,
                        wasmparser::ExternalKind::Tag => ExternKind::Tag,
                    };
                    self.exports.push(Export {
                        name: export.name.to_string(),
                        kind,
                        var: Var::Index(export.index),
                    });
                }
            }

            Payload::StartSection { func, .. } => {
                self.start = Some(func);
            }

            Payload::ElementSection(reader) => {
                for element in reader {
                    let element = element?;
                    let mode = match element.kind {
                        wasmparser::ElementKind::Passive => ElemMode::Passive,
                        wasmparser::ElementKind::Declared => ElemMode::Declared,
                        wasmparser::ElementKind::Active {
                            table_index,
                            offset_expr,
                        } => ElemMode::Active {
                            table: Var::Index(table_index.unwrap_or(0)),
                            offset: self.expr(offset_expr.get_operators_reader())?,
                        },
                    };
                    let (ty, items) = match element.items {
                        wasmparser::ElementItems::Functions(funcs) => {
                            let funcs = funcs
                                .into_iter()
                                .map(|idx| idx.map(Var::Index))
                                .collect::<std::result::Result<Vec<_>, _>>()?;
                            (RefType::Func, ElemItems::Funcs(funcs))
                        }
                        wasmparser::ElementItems::Expressions(ty, exprs) => {
                            let mut items = Vec::new();
                            for expr in exprs {
                                items.push(self.expr(expr?.get_operators_reader())?);
                            }
                            (convert_ref_type(ty)?, ElemItems::Exprs(items))
                        }
                    };
                    self.elems.push(ElemSegment {
                        name: None,
                        mode,
                        ty,
                        items,
                    });
                }
            }

            Payload::DataSection(reader) => {
                for data in reader {
                    let data = data?;
                    let mode = match data.kind {
                        wasmparser::DataKind::Passive => DataMode::Passive,
                        wasmparser::DataKind::Active {
                            memory_index,
                            offset_expr,
                        } => DataMode::Active {
                            memory: Var::Index(memory_index),
                            offset: self.expr(offset_expr.get_operators_reader())?,
                        },
                    };
                    self.datas.push(DataSegment {
                        name: None,
                        mode,
                        data: data.data.to_vec(),
                    });
                }
            }

            Payload::CodeSectionEntry(body) => {
                let idx = self.funcs.len();
                let sig = self.func_sigs.get(idx).cloned().ok_or_else(|| {
                    Error::ParseError(format!("code entry {idx} has no function declaration"))
                })?;
                let mut locals = Vec::new();
                for local in body.get_locals_reader()? {
                    let (count, ty) = local?;
                    locals.push((count, convert_val_type(ty)?));
                }
                let body = self.expr(body.get_operators_reader()?)?;
                self.funcs.push(Func {
                    name: None,
                    sig,
                    locals,
                    body,
                });
            }

            Payload::CustomSection(reader) => match reader.as_known() {
                KnownCustom::Name(names) if self.options.read_debug_names => {
                    match DebugNames::read(names) {
                        Ok(names) => self.names = Some(names),
                        Err(err) if self.options.fail_on_custom_section_error => return Err(err),
                        Err(err) => log::warn!("Ignoring malformed name section: {}", err),
                    }
                }
                _ => log::debug!("Dropping custom section: {}", reader.name()),
            },

            _ => {}
        }

        Ok(())
    }

    fn finish(mut self, name: &str) -> Result<Module> {
        if self.funcs.len() != self.func_sigs.len() {
            return Err(Error::ParseError(format!(
                "{} functions declared but {} bodies present",
                self.func_sigs.len(),
                self.funcs.len()
            )));
        }

        let debug_module_name = match self.names.take() {
            Some(names) => {
                self.apply_debug_names(&names)?;
                names.module
            }
            None => None,
        };
        let name = match (name.is_empty(), debug_module_name) {
            (true, Some(debug)) => debug,
            _ => name.to_string(),
        };

        let mut module = Module::new(name);
        module.fields.extend(self.imports.into_iter().map(Field::Import));
        module.fields.extend(self.funcs.into_iter().map(Field::Func));
        module.fields.extend(self.tables.into_iter().map(Field::Table));
        module.fields.extend(self.memories.into_iter().map(Field::Memory));
        module.fields.extend(self.globals.into_iter().map(Field::Global));
        module.fields.extend(self.tags.into_iter().map(Field::Tag));
        module.fields.extend(self.exports.into_iter().map(Field::Export));
        module
            .fields
            .extend(self.start.map(|func| Field::Start(Var::Index(func))));
        module.fields.extend(self.elems.into_iter().map(Field::Elem));
        module.fields.extend(self.datas.into_iter().map(Field::Data));

        log::debug!(
            "Parsed module {}: {} fields, {} imports",
            module.name,
            module.fields.len(),
            module.imports().count()
        );
        Ok(module)
    }

    fn apply_debug_names(&mut self, names: &DebugNames) -> Result<()> {
        let mut imported = [0u32; 7];
        for import in self.imports.iter_mut() {
            let space = Space::from(import.desc.kind());
            let idx = imported[space as usize];
            imported[space as usize] += 1;
            *import.desc.name_mut() = names.get(space, idx);
        }
        let base = |space: Space| imported[space as usize];

        for (i, func) in self.funcs.iter_mut().enumerate() {
            let idx = base(Space::Func) + i as u32;
            func.name = names.get(Space::Func, idx);
            if let Some(labels) = names.labels.get(&idx) {
                apply_label_names(&mut func.body, labels)?;
            }
        }
        for (i, table) in self.tables.iter_mut().enumerate() {
            table.name = names.get(Space::Table, base(Space::Table) + i as u32);
        }
        for (i, memory) in self.memories.iter_mut().enumerate() {
            memory.name = names.get(Space::Memory, base(Space::Memory) + i as u32);
        }
        for (i, global) in self.globals.iter_mut().enumerate() {
            global.name = names.get(Space::Global, base(Space::Global) + i as u32);
        }
        for (i, tag) in self.tags.iter_mut().enumerate() {
            tag.name = names.get(Space::Tag, base(Space::Tag) + i as u32);
        }
        for (i, elem) in self.elems.iter_mut().enumerate() {
            elem.name = names.get(Space::Elem, i as u32);
        }
        for (i, data) in self.datas.iter_mut().enumerate() {
            data.name = names.get(Space::Data, i as u32);
        }
        Ok(())
    }
}

/// Name labels in order of their block-introducing instruction
fn apply_label_names(body: &mut [Instr], labels: &HashMap<u32, String>) -> Result<()> {
    let mut next = 0u32;
    walk::walk_mut(body, &mut Vec::new(), &mut |instr, _| {
        match instr {
            Instr::Block { label, .. }
            | Instr::Loop { label, .. }
            | Instr::If { label, .. }
            | Instr::Try { label, .. } => {
                *label = labels.get(&next).cloned();
                next += 1;
            }
            _ => {}
        }
        Ok(())
    })
}

/// What ended an instruction sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminator {
    End,
    Else,
    Catch(u32),
    CatchAll,
    Delegate(u32),
}

impl Terminator {
    fn mnemonic(self) -> &'static str {
        match self {
            Terminator::End => "end",
            Terminator::Else => "else",
            Terminator::Catch(_) => "catch",
            Terminator::CatchAll => "catch_all",
            Terminator::Delegate(_) => "delegate",
        }
    }
}

/// Decodes one expression (function body or constant expression)
struct ExprReader<'a, 'b> {
    reader: OperatorsReader<'a>,
    bytes: &'a [u8],
    types: &'b [FuncSig],
    features: WasmFeatures,
}

impl<'a> ExprReader<'a, '_> {
    fn read_expr(mut self) -> Result<Expr> {
        match self.read_seq()? {
            (expr, Terminator::End) if self.reader.eof() => Ok(expr),
            (_, Terminator::End) => Err(self.error("operators after the final `end`")),
            (_, other) => Err(self.unexpected(other, "expression")),
        }
    }

    fn read_seq(&mut self) -> Result<(Expr, Terminator)> {
        let mut expr = Vec::new();
        loop {
            let start = self.reader.original_position();
            let op = self.reader.read()?;
            let end = self.reader.original_position();
            let bytes = self.bytes;
            let raw = bytes
                .get(start..end)
                .ok_or_else(|| self.error("operator outside of module bytes"))?;

            let instr = match op {
                Operator::End => return Ok((expr, Terminator::End)),
                Operator::Else => return Ok((expr, Terminator::Else)),
                Operator::Catch { tag_index } => return Ok((expr, Terminator::Catch(tag_index))),
                Operator::CatchAll => return Ok((expr, Terminator::CatchAll)),
                Operator::Delegate { relative_depth } => {
                    return Ok((expr, Terminator::Delegate(relative_depth)))
                }

                Operator::Block { blockty } => Instr::Block {
                    label: None,
                    sig: self.block_sig(blockty)?,
                    body: self.read_block("block")?,
                },
                Operator::Loop { blockty } => Instr::Loop {
                    label: None,
                    sig: self.block_sig(blockty)?,
                    body: self.read_block("loop")?,
                },
                Operator::If { blockty } => {
                    let sig = self.block_sig(blockty)?;
                    let (then, end) = self.read_seq()?;
                    let otherwise = match end {
                        Terminator::End => None,
                        Terminator::Else => Some(self.read_block("else")?),
                        other => return Err(self.unexpected(other, "if")),
                    };
                    Instr::If {
                        label: None,
                        sig,
                        then,
                        otherwise,
                    }
                }
                Operator::Try { blockty } => {
                    self.require(WasmFeatures::LEGACY_EXCEPTIONS, "legacy exception handling")?;
                    let sig = self.block_sig(blockty)?;
                    let (body, end) = self.read_seq()?;
                    Instr::Try {
                        label: None,
                        sig,
                        body,
                        handler: self.read_handler(end)?,
                    }
                }

                op => self.instr(op, raw)?,
            };
            expr.push(instr);
        }
    }

    /// Read a block body that must be closed by `end`
    fn read_block(&mut self, what: &str) -> Result<Expr> {
        match self.read_seq()? {
            (body, Terminator::End) => Ok(body),
            (_, other) => Err(self.unexpected(other, what)),
        }
    }

    fn read_handler(&mut self, mut next: Terminator) -> Result<TryHandler> {
        let mut catches = Vec::new();
        loop {
            match next {
                Terminator::End => {
                    return Ok(TryHandler::Catches {
                        catches,
                        catch_all: None,
                    })
                }
                Terminator::Delegate(depth) if catches.is_empty() => {
                    return Ok(TryHandler::Delegate(depth))
                }
                Terminator::Catch(tag) => {
                    let (body, end) = self.read_seq()?;
                    catches.push(Catch {
                        tag: Var::Index(tag),
                        body,
                    });
                    next = end;
                }
                Terminator::CatchAll => {
                    let body = self.read_block("catch_all")?;
                    return Ok(TryHandler::Catches {
                        catches,
                        catch_all: Some(body),
                    });
                }
                other => return Err(self.unexpected(other, "try")),
            }
        }
    }

    /// Map a non-structured operator
    fn instr(&self, op: Operator<'a>, raw: &[u8]) -> Result<Instr> {
        use Operator::*;

        match raw.first() {
            Some(0xFE) => return Err(unsupported("atomic memory instructions")),
            Some(0xFB) => return Err(unsupported("garbage collection instructions")),
            Some(0xFD) => self.require(WasmFeatures::SIMD, "SIMD instructions")?,
            _ => {}
        }

        let instr = match op {
            // Calls
            Call { function_index } => Instr::Call(Var::Index(function_index)),
            ReturnCall { function_index } => {
                self.require(WasmFeatures::TAIL_CALL, "tail calls")?;
                Instr::ReturnCall(Var::Index(function_index))
            }
            CallIndirect {
                type_index,
                table_index,
            } => Instr::CallIndirect {
                table: Var::Index(table_index),
                sig: lookup_sig(self.types, type_index)?,
            },
            ReturnCallIndirect {
                type_index,
                table_index,
            } => {
                self.require(WasmFeatures::TAIL_CALL, "tail calls")?;
                Instr::ReturnCallIndirect {
                    table: Var::Index(table_index),
                    sig: lookup_sig(self.types, type_index)?,
                }
            }
            CallRef { .. } | ReturnCallRef { .. } => {
                return Err(unsupported("typed function references"))
            }

            // Reference types
            RefFunc { function_index } => Instr::RefFunc(Var::Index(function_index)),
            RefNull {
                hty: HeapType::Concrete(_),
            } => return Err(unsupported("typed function references")),

            // Globals
            GlobalGet { global_index } => Instr::GlobalGet(Var::Index(global_index)),
            GlobalSet { global_index } => Instr::GlobalSet(Var::Index(global_index)),

            // Tables
            TableGet { table } => Instr::TableGet(Var::Index(table)),
            TableSet { table } => Instr::TableSet(Var::Index(table)),
            TableGrow { table } => Instr::TableGrow(Var::Index(table)),
            TableSize { table } => Instr::TableSize(Var::Index(table)),
            TableFill { table } => Instr::TableFill(Var::Index(table)),
            TableCopy {
                dst_table,
                src_table,
            } => Instr::TableCopy {
                dst: Var::Index(dst_table),
                src: Var::Index(src_table),
            },
            TableInit { elem_index, table } => Instr::TableInit {
                table: Var::Index(table),
                elem: Var::Index(elem_index),
            },
            ElemDrop { elem_index } => Instr::ElemDrop(Var::Index(elem_index)),

            // Memory
            I32Load { memarg } => Instr::Load(self.access("i32.load", raw, memarg, None)?),
            I64Load { memarg } => Instr::Load(self.access("i64.load", raw, memarg, None)?),
            F32Load { memarg } => Instr::Load(self.access("f32.load", raw, memarg, None)?),
            F64Load { memarg } => Instr::Load(self.access("f64.load", raw, memarg, None)?),
            I32Load8S { memarg } => Instr::Load(self.access("i32.load8_s", raw, memarg, None)?),
            I32Load8U { memarg } => Instr::Load(self.access("i32.load8_u", raw, memarg, None)?),
            I32Load16S { memarg } => Instr::Load(self.access("i32.load16_s", raw, memarg, None)?),
            I32Load16U { memarg } => Instr::Load(self.access("i32.load16_u", raw, memarg, None)?),
            I64Load8S { memarg } => Instr::Load(self.access("i64.load8_s", raw, memarg, None)?),
            I64Load8U { memarg } => Instr::Load(self.access("i64.load8_u", raw, memarg, None)?),
            I64Load16S { memarg } => Instr::Load(self.access("i64.load16_s", raw, memarg, None)?),
            I64Load16U { memarg } => Instr::Load(self.access("i64.load16_u", raw, memarg, None)?),
            I64Load32S { memarg } => Instr::Load(self.access("i64.load32_s", raw, memarg, None)?),
            I64Load32U { memarg } => Instr::Load(self.access("i64.load32_u", raw, memarg, None)?),
            I32Store { memarg } => Instr::Store(self.access("i32.store", raw, memarg, None)?),
            I64Store { memarg } => Instr::Store(self.access("i64.store", raw, memarg, None)?),
            F32Store { memarg } => Instr::Store(self.access("f32.store", raw, memarg, None)?),
            F64Store { memarg } => Instr::Store(self.access("f64.store", raw, memarg, None)?),
            I32Store8 { memarg } => Instr::Store(self.access("i32.store8", raw, memarg, None)?),
            I32Store16 { memarg } => Instr::Store(self.access("i32.store16", raw, memarg, None)?),
            I64Store8 { memarg } => Instr::Store(self.access("i64.store8", raw, memarg, None)?),
            I64Store16 { memarg } => Instr::Store(self.access("i64.store16", raw, memarg, None)?),
            I64Store32 { memarg } => Instr::Store(self.access("i64.store32", raw, memarg, None)?),
            MemorySize { mem } => Instr::MemorySize(self.memory(mem)?),
            MemoryGrow { mem } => Instr::MemoryGrow(self.memory(mem)?),
            MemoryFill { mem } => Instr::MemoryFill(self.memory(mem)?),
            MemoryCopy { dst_mem, src_mem } => Instr::MemoryCopy {
                dst: self.memory(dst_mem)?,
                src: self.memory(src_mem)?,
            },
            MemoryInit { data_index, mem } => Instr::MemoryInit {
                memory: self.memory(mem)?,
                data: Var::Index(data_index),
            },
            DataDrop { data_index } => Instr::DataDrop(Var::Index(data_index)),
            MemoryDiscard { .. } => return Err(unsupported("memory.discard")),

            // SIMD memory access
            V128Load { memarg } => Instr::Load(self.access("v128.load", raw, memarg, None)?),
            V128Load8x8S { memarg } => {
                Instr::Load(self.access("v128.load8x8_s", raw, memarg, None)?)
            }
            V128Load8x8U { memarg } => {
                Instr::Load(self.access("v128.load8x8_u", raw, memarg, None)?)
            }
            V128Load16x4S { memarg } => {
                Instr::Load(self.access("v128.load16x4_s", raw, memarg, None)?)
            }
            V128Load16x4U { memarg } => {
                Instr::Load(self.access("v128.load16x4_u", raw, memarg, None)?)
            }
            V128Load32x2S { memarg } => {
                Instr::Load(self.access("v128.load32x2_s", raw, memarg, None)?)
            }
            V128Load32x2U { memarg } => {
                Instr::Load(self.access("v128.load32x2_u", raw, memarg, None)?)
            }
            V128Load8Splat { memarg } => {
                Instr::Load(self.access("v128.load8_splat", raw, memarg, None)?)
            }
            V128Load16Splat { memarg } => {
                Instr::Load(self.access("v128.load16_splat", raw, memarg, None)?)
            }
            V128Load32Splat { memarg } => {
                Instr::Load(self.access("v128.load32_splat", raw, memarg, None)?)
            }
            V128Load64Splat { memarg } => {
                Instr::Load(self.access("v128.load64_splat", raw, memarg, None)?)
            }
            V128Load32Zero { memarg } => {
                Instr::Load(self.access("v128.load32_zero", raw, memarg, None)?)
            }
            V128Load64Zero { memarg } => {
                Instr::Load(self.access("v128.load64_zero", raw, memarg, None)?)
            }
            V128Load8Lane { memarg, lane } => {
                Instr::Load(self.access("v128.load8_lane", raw, memarg, Some(lane))?)
            }
            V128Load16Lane { memarg, lane } => {
                Instr::Load(self.access("v128.load16_lane", raw, memarg, Some(lane))?)
            }
            V128Load32Lane { memarg, lane } => {
                Instr::Load(self.access("v128.load32_lane", raw, memarg, Some(lane))?)
            }
            V128Load64Lane { memarg, lane } => {
                Instr::Load(self.access("v128.load64_lane", raw, memarg, Some(lane))?)
            }
            V128Store { memarg } => Instr::Store(self.access("v128.store", raw, memarg, None)?),
            V128Store8Lane { memarg, lane } => {
                Instr::Store(self.access("v128.store8_lane", raw, memarg, Some(lane))?)
            }
            V128Store16Lane { memarg, lane } => {
                Instr::Store(self.access("v128.store16_lane", raw, memarg, Some(lane))?)
            }
            V128Store32Lane { memarg, lane } => {
                Instr::Store(self.access("v128.store32_lane", raw, memarg, Some(lane))?)
            }
            V128Store64Lane { memarg, lane } => {
                Instr::Store(self.access("v128.store64_lane", raw, memarg, Some(lane))?)
            }

            // Exceptions
            Throw { tag_index } => {
                self.require(
                    WasmFeatures::EXCEPTIONS | WasmFeatures::LEGACY_EXCEPTIONS,
                    "exception handling",
                )?;
                Instr::Throw(Var::Index(tag_index))
            }
            Rethrow { .. } => {
                self.require(WasmFeatures::LEGACY_EXCEPTIONS, "legacy exception handling")?;
                Instr::Opaque(raw.to_vec())
            }
            TryTable { .. } | ThrowRef => return Err(unsupported("try_table and exnref")),

            // No module-level indices
            _ => Instr::Opaque(raw.to_vec()),
        };
        Ok(instr)
    }

    fn access(
        &self,
        name: &'static str,
        raw: &[u8],
        memarg: wasmparser::MemArg,
        lane: Option<u8>,
    ) -> Result<MemAccess> {
        Ok(MemAccess {
            name,
            opcode: raw[..opcode_len(raw)].to_vec(),
            memarg: MemArg {
                memory: self.memory(memarg.memory)?,
                align: u32::from(memarg.align),
                offset: memarg.offset,
            },
            lane,
        })
    }

    fn memory(&self, idx: u32) -> Result<Var> {
        if idx != 0 {
            self.require(WasmFeatures::MULTI_MEMORY, "multiple memories")?;
        }
        Ok(Var::Index(idx))
    }

    fn block_sig(&self, ty: BlockType) -> Result<BlockSig> {
        Ok(match ty {
            BlockType::Empty => BlockSig::Empty,
            BlockType::Type(ty) => BlockSig::Value(convert_val_type(ty)?),
            BlockType::FuncType(idx) => BlockSig::Func(lookup_sig(self.types, idx)?),
        })
    }

    fn require(&self, feature: WasmFeatures, what: &str) -> Result<()> {
        if self.features.intersects(feature) {
            Ok(())
        } else {
            Err(Error::UnsupportedFeature(format!(
                "{what} at offset {:#x} (proposal not enabled)",
                self.reader.original_position()
            )))
        }
    }

    fn error(&self, message: &str) -> Error {
        Error::ParseError(format!(
            "{message} (at offset {:#x})",
            self.reader.original_position()
        ))
    }

    fn unexpected(&self, terminator: Terminator, context: &str) -> Error {
        self.error(&format!(
            "unexpected `{}` in {context}",
            terminator.mnemonic()
        ))
    }
}

fn unsupported(what: &str) -> Error {
    Error::UnsupportedFeature(what.to_string())
}

/// Length of the opcode (prefix byte plus LEB sub-opcode) of an encoded instruction
fn opcode_len(raw: &[u8]) -> usize {
    match raw.first() {
        Some(0xFC | 0xFD) => {
            1 + raw[1..]
                .iter()
                .position(|byte| byte & 0x80 == 0)
                .map_or(raw.len() - 1, |pos| pos + 1)
        }
        _ => 1,
    }
}

fn lookup_sig(types: &[FuncSig], type_index: u32) -> Result<FuncSig> {
    types.get(type_index as usize).cloned().ok_or_else(|| {
        Error::ParseError(format!("type index {type_index} out of bounds"))
    })
}

fn convert_val_types(types: &[WasmValType]) -> Result<Vec<ValType>> {
    types.iter().map(|ty| convert_val_type(*ty)).collect()
}

/// Convert wasmparser ValType to the IR ValType
fn convert_val_type(ty: WasmValType) -> Result<ValType> {
    Ok(match ty {
        WasmValType::I32 => ValType::I32,
        WasmValType::I64 => ValType::I64,
        WasmValType::F32 => ValType::F32,
        WasmValType::F64 => ValType::F64,
        WasmValType::V128 => ValType::V128,
        WasmValType::Ref(rt) => ValType::Ref(convert_ref_type(rt)?),
    })
}

/// Only nullable `funcref` and `externref` are modeled
fn convert_ref_type(rt: wasmparser::RefType) -> Result<RefType> {
    if rt == wasmparser::RefType::FUNCREF {
        Ok(RefType::Func)
    } else if rt == wasmparser::RefType::EXTERNREF {
        Ok(RefType::Extern)
    } else {
        Err(Error::UnsupportedFeature(format!("reference type {rt:?}")))
    }
}

fn convert_table_type(t: &wasmparser::TableType) -> Result<TableType> {
    Ok(TableType {
        element: convert_ref_type(t.element_type)?,
        minimum: t.initial,
        maximum: t.maximum,
        table64: t.table64,
    })
}

fn convert_memory_type(m: &wasmparser::MemoryType) -> MemoryType {
    MemoryType {
        minimum: m.initial,
        maximum: m.maximum,
        memory64: m.memory64,
        shared: m.shared,
        page_size_log2: m.page_size_log2,
    }
}

fn convert_global_type(g: &wasmparser::GlobalType) -> Result<GlobalType> {
    Ok(GlobalType {
        val: convert_val_type(g.content_type)?,
        mutable: g.mutable,
    })
}
