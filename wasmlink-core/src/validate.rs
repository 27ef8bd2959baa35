//! Static well-formedness checks using the wasmparser validator

use crate::encoder::{self, EncodeOptions};
use crate::ir::Module;
use crate::{Error, Result};
use wasmparser::{Validator, WasmFeatures};

/// Validate a binary module with the given proposals enabled
pub fn validate(bytes: &[u8], features: WasmFeatures) -> Result<()> {
    Validator::new_with_features(features)
        .validate_all(bytes)
        .map(|_| ())
        .map_err(|err| Error::Validation(err.to_string()))
}

/// Encode an index-resolved module and validate the result
pub fn validate_module(module: &Module, features: WasmFeatures) -> Result<()> {
    let options = EncodeOptions {
        write_debug_names: false,
    };
    let bytes = encoder::encode(module, &options)?;
    validate(&bytes, features).map_err(|err| match err {
        Error::Validation(message) => {
            Error::Validation(format!("module {}: {message}", module.name))
        }
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Field, Func, FuncSig, Instr, Var};

    #[test]
    fn test_validate_accepts_well_formed() {
        let bytes = wat::parse_str("(module (func (result i32) i32.const 1))").unwrap();
        assert!(validate(&bytes, WasmFeatures::default()).is_ok());
    }

    #[test]
    fn test_validate_reports_type_error() {
        let bytes = wat::parse_str("(module (func (result i32) i64.const 1))").unwrap();
        assert!(matches!(
            validate(&bytes, WasmFeatures::default()),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_validate_module_catches_dangling_index() {
        let mut module = Module::new("m");
        module.push(Field::Func(Func {
            name: None,
            sig: FuncSig::default(),
            locals: Vec::new(),
            body: vec![Instr::Call(Var::Index(5))],
        }));

        let err = validate_module(&module, WasmFeatures::default()).unwrap_err();
        assert!(err.to_string().contains("module m"));
    }
}
