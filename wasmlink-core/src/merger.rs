//! Module combination
//!
//! Splices the field lists of the two linked modules into one. Imports that
//! one module takes from the other are dropped, since import resolution has
//! already pointed every use of them at the supplying declaration. All other
//! fields move into the output exactly once, keeping their relative order so
//! that each index space stays "imports first, then locals":
//!
//! ```text
//! module imports | libmodule imports | module others | libmodule others
//! ```

use crate::ir::{Field, Module};
use std::collections::HashSet;

/// Combine `module` and `libmodule` into one module named after `module`
pub fn combine(mut module: Module, mut libmodule: Module) -> Module {
    let (module_imports, module_others, module_elided) =
        partition(module.take_fields(), &libmodule.name);
    let (lib_imports, lib_others, lib_elided) = partition(libmodule.take_fields(), &module.name);

    log::info!(
        "Combining {} with {}: eliding {} + {} cross-module imports",
        module.name,
        libmodule.name,
        module_elided,
        lib_elided
    );

    let mut combined = Module::new(module.name);
    combined.append_fields(module_imports);
    combined.append_fields(lib_imports);
    combined.append_fields(module_others);
    combined.append_fields(lib_others);

    warn_on_conflicts(&combined);
    combined
}

/// Split fields into (retained imports, other fields, elided import count)
fn partition(fields: Vec<Field>, elided_source: &str) -> (Vec<Field>, Vec<Field>, usize) {
    let mut imports = Vec::new();
    let mut others = Vec::new();
    let mut elided = 0;

    for field in fields {
        match field {
            Field::Import(import) if import.module == elided_source => {
                log::debug!("Eliding import {}::{}", import.module, import.field);
                elided += 1;
            }
            Field::Import(_) => imports.push(field),
            _ => others.push(field),
        }
    }

    (imports, others, elided)
}

fn warn_on_conflicts(module: &Module) {
    let mut seen = HashSet::new();
    for export in module.exports() {
        if !seen.insert(export.name.as_str()) {
            log::warn!("Duplicate export after combination: {}", export.name);
        }
    }

    let starts = module
        .fields
        .iter()
        .filter(|field| matches!(field, Field::Start(_)))
        .count();
    if starts > 1 {
        log::warn!("Combined module has {} start functions", starts);
    }
}
