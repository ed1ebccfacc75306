//! Error types for the peforge engine.
//!
//! One enum covers the whole crate; components log through `tracing` and
//! surface failures as `EngineError` values rather than panicking across
//! the public interface.

use thiserror::Error;

/// Main error type for peforge operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A requested offset lies outside `[0, len)` of the byte source.
    #[error("Offset {offset:#x} out of range (file length {len:#x})")]
    OutOfRange { offset: u64, len: u64 },

    /// Malformed pattern text, script token, or header field.
    #[error("Parse error: {0}")]
    Parse(String),

    /// The assembler produced no encoding and no fallback applied.
    #[error("No encoding for payload: {0}")]
    Encoding(String),

    /// An expression referenced a variable that never resolved.
    #[error("Invalid variable: {0}")]
    InvalidVariable(String),

    /// A `check` command observed bytes other than expected.
    #[error("Check mismatch at {offset:#x}: expected [{expected}], found [{actual}]")]
    CheckMismatch {
        offset: u64,
        expected: String,
        actual: String,
    },

    /// Unrecoverable run failure: missing `end;`, unreadable script file,
    /// no file loaded.
    #[error("Fatal: {0}")]
    Fatal(String),

    /// File I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for peforge operations.
pub type Result<T> = std::result::Result<T, EngineError>;
