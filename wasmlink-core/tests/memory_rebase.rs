//! Memory rebasing integration test
//!
//! A module with one imported and one local memory is rebased so that its
//! local memory lands behind two memories placed ahead of it. The encoded
//! output is inspected with wasmparser; it is not instantiated, since its
//! indices refer to memories that only exist once the modules are merged.

use wasm_encoder::{
    CodeSection, EntityType, ExportKind, ExportSection, Function, FunctionSection, ImportSection,
    Instruction, MemArg, MemorySection, MemoryType, Module, TypeSection,
};
use wasmlink_core::{encode, rebase, EncodeOptions, ModuleParser, ParseOptions};
use wasmparser::{Operator, Parser, Payload, WasmFeatures};

fn memory_type() -> MemoryType {
    MemoryType {
        minimum: 1,
        maximum: None,
        memory64: false,
        shared: false,
        page_size_log2: None,
    }
}

fn memarg(memory_index: u32) -> MemArg {
    MemArg {
        offset: 0,
        align: 2,
        memory_index,
    }
}

/// Imports `env.mem` (memory 0), defines memory 1, and `copy` loads from
/// memory 0 and stores into memory 1.
fn build_two_memory_module() -> Vec<u8> {
    let mut types = TypeSection::new();
    types.ty().function([], []);

    let mut imports = ImportSection::new();
    imports.import("env", "mem", EntityType::Memory(memory_type()));

    let mut functions = FunctionSection::new();
    functions.function(0);

    let mut memory = MemorySection::new();
    memory.memory(memory_type());

    let mut exports = ExportSection::new();
    exports.export("copy", ExportKind::Func, 0);

    let mut code = CodeSection::new();
    let mut copy_fn = Function::new([]);
    copy_fn.instruction(&Instruction::I32Const(8));
    copy_fn.instruction(&Instruction::I32Const(0));
    copy_fn.instruction(&Instruction::I32Load(memarg(0)));
    copy_fn.instruction(&Instruction::I32Store(memarg(1)));
    copy_fn.instruction(&Instruction::MemorySize(1));
    copy_fn.instruction(&Instruction::Drop);
    copy_fn.instruction(&Instruction::End);
    code.function(&copy_fn);

    let mut module = Module::new();
    module
        .section(&types)
        .section(&imports)
        .section(&functions)
        .section(&memory)
        .section(&exports)
        .section(&code);
    module.finish()
}

/// Memory indices referenced by the first function body, in order
fn memory_references(bytes: &[u8]) -> Vec<u32> {
    let mut found = Vec::new();
    for payload in Parser::new(0).parse_all(bytes) {
        if let Payload::CodeSectionEntry(body) = payload.unwrap() {
            let mut reader = body.get_operators_reader().unwrap();
            while !reader.eof() {
                match reader.read().unwrap() {
                    Operator::I32Load { memarg } | Operator::I32Store { memarg } => {
                        found.push(memarg.memory)
                    }
                    Operator::MemorySize { mem } => found.push(mem),
                    _ => {}
                }
            }
            break;
        }
    }
    found
}

#[test]
fn test_rebase_shifts_local_memory_only() {
    let mut features = WasmFeatures::default();
    features.insert(WasmFeatures::MULTI_MEMORY);
    let parser = ModuleParser::with_options(ParseOptions {
        features,
        ..Default::default()
    });

    let input = build_two_memory_module();
    assert_eq!(memory_references(&input), vec![0, 1, 1]);

    let mut module = parser.parse("m", &input).unwrap();
    let shifted = rebase(&mut module, 3).unwrap();
    assert_eq!(shifted, 2);

    let output = encode(&module, &EncodeOptions::default()).unwrap();
    assert_eq!(memory_references(&output), vec![0, 3, 3]);
}
