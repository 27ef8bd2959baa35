//! Error types for wasmlink-core

use crate::ir::Space;
use thiserror::Error;

/// Result type alias using the wasmlink Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reading, linking, checking or writing modules
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid WebAssembly binary
    #[error("invalid WebAssembly binary: {0}")]
    InvalidWasm(String),

    /// Input is a component rather than a core module
    #[error("input is not a core WebAssembly module (got a component)")]
    NotAModule,

    /// Binary decoding error, the message carries the byte offset
    #[error("failed to parse module: {0}")]
    ParseError(String),

    /// Instruction or proposal the IR does not model
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Static well-formedness violation reported by the validator
    #[error("validation failed: {0}")]
    Validation(String),

    /// A reference does not name a declaration of the expected kind
    #[error("unresolved {space} reference {reference} in {context}")]
    UnresolvedReference {
        space: Space,
        reference: String,
        context: String,
    },

    /// A symbolic name is shared by several declarations of one kind
    #[error("ambiguous {space} reference ${name}: name is declared more than once")]
    AmbiguousReference { space: Space, name: String },

    /// A mutating memory access targets a read-only memory
    #[error(
        "{instruction} writes memory {memory} in {location}, \
         but memories below index {threshold} are read-only"
    )]
    PolicyViolation {
        instruction: &'static str,
        memory: u32,
        threshold: u32,
        location: String,
    },

    /// Memory index base must count at least one slot
    #[error("invalid memory index base {0}: the base is 1-based and must be at least 1")]
    InvalidMemoryBase(u32),

    /// Rebased index does not fit in u32
    #[error("{space} index {index} overflows after rebasing")]
    IndexOverflow { space: Space, index: u32 },

    /// Encoder found a reference that was never resolved to an index
    #[error("{space} reference ${name} must be resolved to an index before encoding")]
    SymbolicReference { space: Space, name: String },

    /// Allow-list and deny-list were both supplied
    #[error("an allow-list and a deny-list cannot be used at the same time")]
    ConflictingPolicies,

    /// Import from a module the policy does not permit
    #[error("import {module}::{field} is not permitted")]
    DisallowedImport { module: String, field: String },

    /// Encoding error
    #[error("failed to encode output module: {0}")]
    EncodingError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<wasmparser::BinaryReaderError> for Error {
    fn from(err: wasmparser::BinaryReaderError) -> Self {
        Error::ParseError(err.to_string())
    }
}
