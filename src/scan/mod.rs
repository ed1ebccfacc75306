//! Signature scanning: wildcard patterns, byte search, and entropy.
//!
//! Everything here is pure and stateless. Patterns are whitespace-separated
//! hex bytes with `?`/`??` wildcards; search picks Boyer-Moore-Horspool
//! when wildcards are present and a plain literal search otherwise. Both
//! run chunk-by-chunk against a [`ByteSource`](crate::io::ByteSource)
//! larger than memory.

pub mod entropy;
pub mod pattern;
pub mod search;

pub use entropy::{entropy_by_region, entropy_windows, shannon_entropy};
pub use pattern::{parse_pattern, PatternByte};
pub use search::{
    find_all, find_all_in_source, find_first, find_first_in_source, find_in_range, ScanConfig,
};

use serde::{Deserialize, Serialize};

/// One occurrence of a named signature in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureMatch {
    /// Absolute file offset of the first matched byte.
    pub offset: u64,
    /// Name the caller gave the signature.
    pub name: String,
    /// Original pattern text.
    pub pattern: String,
    /// Length of the match in bytes.
    pub length: usize,
}

impl SignatureMatch {
    pub fn new(offset: u64, name: &str, pattern: &str, length: usize) -> Self {
        Self {
            offset,
            name: name.to_string(),
            pattern: pattern.to_string(),
            length,
        }
    }
}
