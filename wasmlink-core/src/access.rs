//! Read-only memory policy
//!
//! Memories whose index is below a threshold are read-only: no instruction
//! may write to them or change their size. Loads and `memory.size` are always
//! allowed, and only the destination of `memory.copy` is checked, so copying
//! out of a read-only memory is permitted.

use crate::ir::{DataMode, ElemMode, Field, Instr, Module, Space, Var};
use crate::names::SymbolTable;
use crate::walk::{self, describe};
use crate::{Error, Result};

/// Check `module` against the policy, stopping at the first violation
///
/// Memories with index `< rw_threshold` are read-only.
pub fn check(module: &Module, rw_threshold: u32) -> Result<()> {
    let mut checker = Checker {
        symbols: SymbolTable::build(module),
        threshold: rw_threshold,
        location: String::new(),
        checked: 0,
    };
    let mut ordinals = [0usize; 7];

    for field in &module.fields {
        let (space, name, exprs): (Space, Option<&str>, Vec<&[Instr]>) = match field {
            Field::Func(func) => (Space::Func, func.name.as_deref(), vec![&func.body]),
            Field::Global(global) => (Space::Global, global.name.as_deref(), vec![&global.init]),
            Field::Elem(segment) => match &segment.mode {
                ElemMode::Active { offset, .. } => {
                    (Space::Elem, segment.name.as_deref(), vec![offset])
                }
                ElemMode::Passive | ElemMode::Declared => {
                    (Space::Elem, segment.name.as_deref(), vec![])
                }
            },
            Field::Data(segment) => match &segment.mode {
                DataMode::Active { offset, .. } => {
                    (Space::Data, segment.name.as_deref(), vec![offset])
                }
                DataMode::Passive => (Space::Data, segment.name.as_deref(), vec![]),
            },
            _ => continue,
        };

        let ordinal = ordinals[space as usize];
        ordinals[space as usize] += 1;
        checker.location = describe(space, name, ordinal);
        for expr in exprs {
            walk::walk(expr, &mut Vec::new(), &mut |instr, labels| {
                checker.instr(instr, labels)
            })?;
        }
    }

    log::debug!(
        "{}: {} memory writes checked against threshold {}",
        module.name,
        checker.checked,
        rw_threshold
    );
    Ok(())
}

struct Checker {
    symbols: SymbolTable,
    threshold: u32,
    location: String,
    checked: usize,
}

impl Checker {
    fn instr(&mut self, instr: &Instr, labels: &[Option<String>]) -> Result<()> {
        match instr {
            Instr::Store(access) => self.write(access.name, &access.memarg.memory, labels),
            Instr::MemoryFill(m) => self.write("memory.fill", m, labels),
            Instr::MemoryGrow(m) => self.write("memory.grow", m, labels),
            Instr::MemoryInit { memory, .. } => self.write("memory.init", memory, labels),
            // The source side of a copy may be read-only
            Instr::MemoryCopy { dst, .. } => self.write("memory.copy", dst, labels),
            _ => Ok(()),
        }
    }

    fn write(
        &mut self,
        instruction: &'static str,
        memory: &Var,
        labels: &[Option<String>],
    ) -> Result<()> {
        let location = walk::with_label(&self.location, labels);
        let idx = self.symbols.resolve(Space::Memory, memory, &location)?;
        self.checked += 1;
        if idx < self.threshold {
            return Err(Error::PolicyViolation {
                instruction,
                memory: idx,
                threshold: self.threshold,
                location,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BlockSig, Func, FuncSig, Memory, MemoryType};

    fn module_with(body: Vec<Instr>) -> Module {
        let mut module = Module::new("M");
        for _ in 0..2 {
            module.push(Field::Memory(Memory {
                name: None,
                ty: MemoryType::pages(1, None),
            }));
        }
        module.push(Field::Func(Func {
            name: Some("work".into()),
            sig: FuncSig::default(),
            locals: Vec::new(),
            body,
        }));
        module
    }

    #[test]
    fn test_store_below_threshold_fails() {
        let module = module_with(vec![Instr::i32_store(Var::Index(0), 0)]);
        let err = check(&module, 1).unwrap_err();
        match err {
            Error::PolicyViolation {
                instruction,
                memory,
                threshold,
                location,
            } => {
                assert_eq!(instruction, "i32.store");
                assert_eq!(memory, 0);
                assert_eq!(threshold, 1);
                assert_eq!(location, "function $work");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_store_at_threshold_passes() {
        let module = module_with(vec![Instr::i32_store(Var::Index(1), 0)]);
        assert!(check(&module, 1).is_ok());
    }

    #[test]
    fn test_loads_and_size_are_exempt() {
        let module = module_with(vec![
            Instr::i32_load(Var::Index(0), 0),
            Instr::MemorySize(Var::Index(0)),
        ]);
        assert!(check(&module, 2).is_ok());
    }

    #[test]
    fn test_copy_checks_destination_only() {
        let from_protected = module_with(vec![Instr::MemoryCopy {
            dst: Var::Index(1),
            src: Var::Index(0),
        }]);
        assert!(check(&from_protected, 1).is_ok());

        let into_protected = module_with(vec![Instr::MemoryCopy {
            dst: Var::Index(0),
            src: Var::Index(1),
        }]);
        assert!(matches!(
            check(&into_protected, 1),
            Err(Error::PolicyViolation {
                instruction: "memory.copy",
                ..
            })
        ));
    }

    #[test]
    fn test_first_violation_only() {
        let module = module_with(vec![
            Instr::MemoryGrow(Var::Index(1)),
            Instr::i32_store(Var::Index(0), 0),
        ]);
        let err = check(&module, 2).unwrap_err();
        assert!(matches!(
            err,
            Error::PolicyViolation {
                instruction: "memory.grow",
                memory: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_location_names_enclosing_block() {
        let module = module_with(vec![Instr::Block {
            label: Some("fill".into()),
            sig: BlockSig::Empty,
            body: vec![Instr::MemoryFill(Var::Index(0))],
        }]);
        let err = check(&module, 1).unwrap_err();
        assert!(err.to_string().contains("function $work (in block $fill)"));
    }
}
