//! Expression traversal shared by the module passes
//!
//! The walkers only handle descent into structured control instructions and
//! the label stack. What to do with each instruction is decided by the
//! caller's closure, which sees every instruction in pre-order (a block
//! instruction is visited before its body) together with the labels of the
//! enclosing blocks, innermost last.

use crate::ir::{Instr, Space, TryHandler};
use crate::Result;

/// Walk `expr`, allowing the visitor to rewrite instructions in place
///
/// The first error returned by the visitor aborts the walk.
pub fn walk_mut<F>(
    expr: &mut [Instr],
    labels: &mut Vec<Option<String>>,
    visit: &mut F,
) -> Result<()>
where
    F: FnMut(&mut Instr, &[Option<String>]) -> Result<()>,
{
    for instr in expr.iter_mut() {
        visit(instr, labels.as_slice())?;
        match instr {
            Instr::Block { label, body, .. } | Instr::Loop { label, body, .. } => {
                labels.push(label.clone());
                let result = walk_mut(body, labels, visit);
                labels.pop();
                result?;
            }
            Instr::If {
                label,
                then,
                otherwise,
                ..
            } => {
                labels.push(label.clone());
                let mut result = walk_mut(then, labels, visit);
                if let (Ok(()), Some(otherwise)) = (&result, otherwise) {
                    result = walk_mut(otherwise, labels, visit);
                }
                labels.pop();
                result?;
            }
            Instr::Try {
                label,
                body,
                handler,
                ..
            } => {
                labels.push(label.clone());
                let result = walk_try_mut(body, handler, labels, visit);
                labels.pop();
                result?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn walk_try_mut<F>(
    body: &mut [Instr],
    handler: &mut TryHandler,
    labels: &mut Vec<Option<String>>,
    visit: &mut F,
) -> Result<()>
where
    F: FnMut(&mut Instr, &[Option<String>]) -> Result<()>,
{
    walk_mut(body, labels, visit)?;
    if let TryHandler::Catches { catches, catch_all } = handler {
        for catch in catches.iter_mut() {
            walk_mut(&mut catch.body, labels, visit)?;
        }
        if let Some(catch_all) = catch_all {
            walk_mut(catch_all, labels, visit)?;
        }
    }
    Ok(())
}

/// Read-only counterpart of [`walk_mut`]
pub fn walk<F>(expr: &[Instr], labels: &mut Vec<Option<String>>, visit: &mut F) -> Result<()>
where
    F: FnMut(&Instr, &[Option<String>]) -> Result<()>,
{
    for instr in expr {
        visit(instr, labels.as_slice())?;
        match instr {
            Instr::Block { label, body, .. } | Instr::Loop { label, body, .. } => {
                labels.push(label.clone());
                let result = walk(body, labels, visit);
                labels.pop();
                result?;
            }
            Instr::If {
                label,
                then,
                otherwise,
                ..
            } => {
                labels.push(label.clone());
                let mut result = walk(then, labels, visit);
                if let (Ok(()), Some(otherwise)) = (&result, otherwise) {
                    result = walk(otherwise, labels, visit);
                }
                labels.pop();
                result?;
            }
            Instr::Try {
                label,
                body,
                handler,
                ..
            } => {
                labels.push(label.clone());
                let result = walk_try(body, handler, labels, visit);
                labels.pop();
                result?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn walk_try<F>(
    body: &[Instr],
    handler: &TryHandler,
    labels: &mut Vec<Option<String>>,
    visit: &mut F,
) -> Result<()>
where
    F: FnMut(&Instr, &[Option<String>]) -> Result<()>,
{
    walk(body, labels, visit)?;
    if let TryHandler::Catches { catches, catch_all } = handler {
        for catch in catches {
            walk(&catch.body, labels, visit)?;
        }
        if let Some(catch_all) = catch_all {
            walk(catch_all, labels, visit)?;
        }
    }
    Ok(())
}

/// Human-readable location of a declaration, for diagnostics
pub(crate) fn describe(space: Space, name: Option<&str>, ordinal: usize) -> String {
    match name {
        Some(name) => format!("{space} ${name}"),
        None => format!("{space} #{ordinal}"),
    }
}

/// Append the innermost named label, if any, to a location
pub(crate) fn with_label(location: &str, labels: &[Option<String>]) -> String {
    match labels.iter().rev().flatten().next() {
        Some(label) => format!("{location} (in block ${label})"),
        None => location.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BlockSig, Catch, Var};

    fn nested() -> Vec<Instr> {
        vec![
            Instr::Call(Var::Index(0)),
            Instr::Block {
                label: Some("outer".into()),
                sig: BlockSig::Empty,
                body: vec![
                    Instr::Loop {
                        label: None,
                        sig: BlockSig::Empty,
                        body: vec![Instr::Call(Var::Index(1))],
                    },
                    Instr::If {
                        label: Some("cond".into()),
                        sig: BlockSig::Empty,
                        then: vec![Instr::Call(Var::Index(2))],
                        otherwise: Some(vec![Instr::Call(Var::Index(3))]),
                    },
                ],
            },
            Instr::Try {
                label: None,
                sig: BlockSig::Empty,
                body: vec![Instr::Call(Var::Index(4))],
                handler: TryHandler::Catches {
                    catches: vec![Catch {
                        tag: Var::Index(0),
                        body: vec![Instr::Call(Var::Index(5))],
                    }],
                    catch_all: Some(vec![Instr::Call(Var::Index(6))]),
                },
            },
        ]
    }

    #[test]
    fn test_walk_visits_in_order_with_labels() {
        let expr = nested();
        let mut seen = Vec::new();
        let mut labels = Vec::new();
        walk(&expr, &mut labels, &mut |instr, labels| {
            if let Instr::Call(Var::Index(idx)) = instr {
                seen.push((*idx, labels.len()));
            }
            Ok(())
        })
        .unwrap();

        assert_eq!(
            seen,
            vec![(0, 0), (1, 2), (2, 2), (3, 2), (4, 1), (5, 1), (6, 1)]
        );
        assert!(labels.is_empty());
    }

    #[test]
    fn test_walk_mut_rewrites_nested_calls() {
        let mut expr = nested();
        let mut labels = Vec::new();
        walk_mut(&mut expr, &mut labels, &mut |instr, _| {
            if let Instr::Call(var) = instr {
                *var = Var::symbol("target");
            }
            Ok(())
        })
        .unwrap();

        let mut calls = 0;
        walk(&expr, &mut Vec::new(), &mut |instr, _| {
            if let Instr::Call(var) = instr {
                assert_eq!(var, &Var::symbol("target"));
                calls += 1;
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(calls, 7);
    }

    #[test]
    fn test_with_label_uses_innermost_named() {
        let labels = vec![Some("outer".to_string()), None];
        assert_eq!(
            with_label("function $f", &labels),
            "function $f (in block $outer)"
        );
        assert_eq!(with_label("function $f", &[]), "function $f");
    }
}
