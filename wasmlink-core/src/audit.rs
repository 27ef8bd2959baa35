//! Allow/deny filtering of a single module's exports and imports

use crate::ir::{Field, Module};
use crate::{Error, Result};
use std::collections::HashSet;

/// Which names a module may export, or which modules it may import from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum NamePolicy {
    /// Everything is permitted
    #[default]
    Unrestricted,
    /// Only the listed names are permitted
    Allow(HashSet<String>),
    /// Everything except the listed names is permitted
    Deny(HashSet<String>),
}

impl NamePolicy {
    /// Build a policy from command-line style lists
    ///
    /// At most one of the two lists may be non-empty.
    pub fn from_lists<A, D>(allow: A, deny: D) -> Result<Self>
    where
        A: IntoIterator,
        A::Item: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        let allow: HashSet<String> = allow.into_iter().map(Into::into).collect();
        let deny: HashSet<String> = deny.into_iter().map(Into::into).collect();
        match (allow.is_empty(), deny.is_empty()) {
            (false, false) => Err(Error::ConflictingPolicies),
            (false, true) => Ok(NamePolicy::Allow(allow)),
            (true, false) => Ok(NamePolicy::Deny(deny)),
            (true, true) => Ok(NamePolicy::Unrestricted),
        }
    }

    pub fn permits(&self, name: &str) -> bool {
        match self {
            NamePolicy::Unrestricted => true,
            NamePolicy::Allow(names) => names.contains(name),
            NamePolicy::Deny(names) => !names.contains(name),
        }
    }
}

/// Outcome of [`audit_exports`]: every export seen, in order, with whether it was kept
#[derive(Debug, Clone, Default)]
pub struct ExportAudit {
    pub exports: Vec<(String, bool)>,
}

impl ExportAudit {
    pub fn kept(&self) -> impl Iterator<Item = &str> {
        self.exports
            .iter()
            .filter(|(_, kept)| *kept)
            .map(|(name, _)| name.as_str())
    }

    pub fn removed(&self) -> impl Iterator<Item = &str> {
        self.exports
            .iter()
            .filter(|(_, kept)| !*kept)
            .map(|(name, _)| name.as_str())
    }
}

/// Remove every export the policy does not permit
pub fn audit_exports(module: &mut Module, policy: &NamePolicy) -> ExportAudit {
    let mut audit = ExportAudit::default();
    module.fields.retain(|field| match field {
        Field::Export(export) => {
            let keep = policy.permits(&export.name);
            if !keep {
                log::debug!("Suppressing export {}", export.name);
            }
            audit.exports.push((export.name.clone(), keep));
            keep
        }
        _ => true,
    });
    log::info!(
        "{}: kept {} of {} exports",
        module.name,
        audit.kept().count(),
        audit.exports.len()
    );
    audit
}

/// Outcome of [`check_imports`]
#[derive(Debug, Clone, Default)]
pub struct ImportCheck {
    /// Source module of each import examined, in order
    pub modules_seen: Vec<String>,
    /// First import whose source module is not permitted, as (module, field)
    pub violation: Option<(String, String)>,
}

impl ImportCheck {
    pub fn into_result(self) -> Result<Vec<String>> {
        match self.violation {
            Some((module, field)) => Err(Error::DisallowedImport { module, field }),
            None => Ok(self.modules_seen),
        }
    }
}

/// Check import source modules against the policy, stopping at the first one refused
pub fn check_imports(module: &Module, policy: &NamePolicy) -> ImportCheck {
    let mut check = ImportCheck::default();
    for import in module.imports() {
        check.modules_seen.push(import.module.clone());
        if !policy.permits(&import.module) {
            log::debug!("Import {}::{} is not permitted", import.module, import.field);
            check.violation = Some((import.module.clone(), import.field.clone()));
            break;
        }
    }
    check
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Export, ExternKind, FuncSig, Import, ImportDesc, Var};

    fn exporting(names: &[&str]) -> Module {
        let mut module = Module::new("m");
        for (idx, name) in names.iter().enumerate() {
            module.push(Field::Export(Export {
                name: name.to_string(),
                kind: ExternKind::Func,
                var: Var::Index(idx as u32),
            }));
        }
        module
    }

    fn export_names(module: &Module) -> Vec<&str> {
        module.exports().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn test_allow_list_keeps_only_listed() {
        let mut module = exporting(&["a", "b", "c"]);
        let policy = NamePolicy::from_lists(["b"], Vec::<String>::new()).unwrap();

        let audit = audit_exports(&mut module, &policy);

        assert_eq!(export_names(&module), vec!["b"]);
        assert_eq!(audit.removed().collect::<Vec<_>>(), vec!["a", "c"]);
        assert_eq!(audit.exports.len(), 3);
    }

    #[test]
    fn test_deny_list_removes_listed() {
        let mut module = exporting(&["a", "b", "c"]);
        let policy = NamePolicy::from_lists(Vec::<String>::new(), ["b"]).unwrap();

        audit_exports(&mut module, &policy);

        assert_eq!(export_names(&module), vec!["a", "c"]);
    }

    #[test]
    fn test_both_lists_conflict() {
        assert!(matches!(
            NamePolicy::from_lists(["a"], ["b"]),
            Err(Error::ConflictingPolicies)
        ));
        assert_eq!(
            NamePolicy::from_lists(Vec::<String>::new(), Vec::<String>::new()).unwrap(),
            NamePolicy::Unrestricted
        );
    }

    #[test]
    fn test_import_check_stops_at_first_refusal() {
        let mut module = Module::new("m");
        for (source, field) in [("env", "a"), ("wasi", "b"), ("other", "c")] {
            module.push(Field::Import(Import {
                module: source.into(),
                field: field.into(),
                desc: ImportDesc::Func {
                    name: None,
                    sig: FuncSig::default(),
                },
            }));
        }

        let policy = NamePolicy::from_lists(["env"], Vec::<String>::new()).unwrap();
        let check = check_imports(&module, &policy);
        assert_eq!(check.modules_seen, vec!["env", "wasi"]);
        assert!(matches!(
            check.into_result(),
            Err(Error::DisallowedImport { module, field }) if module == "wasi" && field == "b"
        ));

        let policy = NamePolicy::from_lists(Vec::<String>::new(), ["missing"]).unwrap();
        assert_eq!(check_imports(&module, &policy).into_result().unwrap().len(), 3);
    }
}
