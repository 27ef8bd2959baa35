//! Memory index rebasing
//!
//! Shifts references to a module's locally defined memories so they address
//! the slots those memories occupy once memory declarations from several
//! modules are laid out one after another. `memory_index_base` is 1-based:
//! local memory `i` (counted after the imports) moves to `i + base - 1`,
//! while imported memories keep their indices.

use crate::ir::{DataMode, ElemMode, ExternKind, Field, Instr, Module, Space, Var};
use crate::walk;
use crate::{Error, Result};

/// Rebase every memory instruction of `module` in place
///
/// References must be index-form. Returns the number of references shifted.
pub fn rebase(module: &mut Module, memory_index_base: u32) -> Result<usize> {
    if memory_index_base == 0 {
        return Err(Error::InvalidMemoryBase(memory_index_base));
    }
    let mut rebaser = Rebaser {
        imported: module.num_imports(ExternKind::Memory),
        shift: memory_index_base - 1,
        shifted: 0,
    };

    for field in module.fields.iter_mut() {
        match field {
            Field::Func(func) => rebaser.expr(&mut func.body)?,
            Field::Global(global) => rebaser.expr(&mut global.init)?,
            Field::Elem(segment) => {
                if let ElemMode::Active { offset, .. } = &mut segment.mode {
                    rebaser.expr(offset)?;
                }
            }
            Field::Data(segment) => {
                if let DataMode::Active { offset, .. } = &mut segment.mode {
                    rebaser.expr(offset)?;
                }
            }
            _ => {}
        }
    }

    log::info!(
        "Rebased {} memory references in {} (base {})",
        rebaser.shifted,
        module.name,
        memory_index_base
    );
    Ok(rebaser.shifted)
}

struct Rebaser {
    imported: u32,
    shift: u32,
    shifted: usize,
}

impl Rebaser {
    fn expr(&mut self, expr: &mut [Instr]) -> Result<()> {
        walk::walk_mut(expr, &mut Vec::new(), &mut |instr, _| self.instr(instr))
    }

    fn instr(&mut self, instr: &mut Instr) -> Result<()> {
        match instr {
            Instr::Load(access) | Instr::Store(access) => self.memory(&mut access.memarg.memory),
            Instr::MemorySize(m)
            | Instr::MemoryGrow(m)
            | Instr::MemoryFill(m)
            | Instr::MemoryInit { memory: m, .. } => self.memory(m),
            Instr::MemoryCopy { dst, src } => {
                self.memory(dst)?;
                self.memory(src)
            }
            _ => Ok(()),
        }
    }

    fn memory(&mut self, var: &mut Var) -> Result<()> {
        let idx = match var {
            Var::Index(idx) => *idx,
            Var::Symbol(name) => {
                return Err(Error::SymbolicReference {
                    space: Space::Memory,
                    name: name.clone(),
                })
            }
        };
        if idx < self.imported || self.shift == 0 {
            return Ok(());
        }
        let rebased = idx.checked_add(self.shift).ok_or(Error::IndexOverflow {
            space: Space::Memory,
            index: idx,
        })?;
        *var = Var::Index(rebased);
        self.shifted += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Func, FuncSig, Import, ImportDesc, Memory, MemoryType};

    /// One imported memory (index 0) and one local memory (index 1)
    fn module_with(body: Vec<Instr>) -> Module {
        let mut module = Module::new("M");
        module.push(Field::Import(Import {
            module: "env".into(),
            field: "mem".into(),
            desc: ImportDesc::Memory {
                name: None,
                ty: MemoryType::pages(1, None),
            },
        }));
        module.push(Field::Memory(Memory {
            name: None,
            ty: MemoryType::pages(1, None),
        }));
        module.push(Field::Func(Func {
            name: None,
            sig: FuncSig::default(),
            locals: Vec::new(),
            body,
        }));
        module
    }

    fn body(module: &Module) -> &[Instr] {
        &module.funcs().next().unwrap().body
    }

    #[test]
    fn test_local_memory_shifts_imported_stays() {
        let mut module = module_with(vec![
            Instr::i32_const(0),
            Instr::i32_load(Var::Index(1), 0),
            Instr::i32_store(Var::Index(0), 4),
            Instr::MemoryCopy {
                dst: Var::Index(1),
                src: Var::Index(0),
            },
            Instr::MemorySize(Var::Index(1)),
        ]);

        let shifted = rebase(&mut module, 3).unwrap();

        assert_eq!(shifted, 3);
        let body = body(&module);
        assert_eq!(body[1], Instr::i32_load(Var::Index(3), 0));
        assert_eq!(body[2], Instr::i32_store(Var::Index(0), 4));
        assert_eq!(
            body[3],
            Instr::MemoryCopy {
                dst: Var::Index(3),
                src: Var::Index(0),
            }
        );
        assert_eq!(body[4], Instr::MemorySize(Var::Index(3)));
    }

    #[test]
    fn test_base_one_is_identity() {
        let mut module = module_with(vec![Instr::MemoryGrow(Var::Index(1))]);
        let original = module.clone();

        assert_eq!(rebase(&mut module, 1).unwrap(), 0);
        assert_eq!(module, original);
    }

    #[test]
    fn test_base_zero_is_rejected() {
        let mut module = module_with(vec![]);
        assert!(matches!(
            rebase(&mut module, 0),
            Err(Error::InvalidMemoryBase(0))
        ));
    }

    #[test]
    fn test_overflow_is_reported() {
        let mut module = module_with(vec![Instr::MemoryFill(Var::Index(2))]);
        assert!(matches!(
            rebase(&mut module, u32::MAX),
            Err(Error::IndexOverflow {
                space: Space::Memory,
                index: 2
            })
        ));
    }

    #[test]
    fn test_symbolic_reference_is_rejected() {
        let mut module = module_with(vec![Instr::MemorySize(Var::symbol("mem"))]);
        assert!(matches!(
            rebase(&mut module, 2),
            Err(Error::SymbolicReference { .. })
        ));
    }
}
