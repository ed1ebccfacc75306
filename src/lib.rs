//! peforge: static PE analysis and patching engine.
//!
//! Four cooperating subsystems over one byte-addressable view of a
//! Portable Executable:
//!
//! - [`pe`] decomposes headers into a navigable structure tree and a
//!   byte-accurate region map;
//! - [`scan`] provides wildcard signature search and Shannon entropy;
//! - [`detect`] runs a priority-ordered pipeline of packer/protector
//!   detectors with confidence scoring;
//! - [`script`] interprets `.euv` patch programs whose writes go through
//!   a transactional undo journal.
//!
//! Everything reads and writes the target through the [`io::ByteSource`]
//! port; hosts supply the mapped or buffered backing.

/// Error types and result alias.
pub mod error;

/// Logging and tracing infrastructure.
pub mod logging;

/// Byte-source port, mmap/vector backings, dirty-offset publication.
pub mod io;

/// Signature scanning, wildcard patterns, entropy.
pub mod scan;

/// PE structure mapping: tree, regions, overlay.
pub mod pe;

/// Value readings at an offset (integers, ULEB128, DOS timestamps).
pub mod inspect;

/// Inline x86 encoding for patch payloads.
pub mod asm;

/// Integer expression evaluation with sentinel propagation.
pub mod expr;

/// Transactional undo journal.
pub mod journal;

/// Packer/protector detection pipeline.
pub mod detect;

/// `.euv` script parsing, execution, and watching.
pub mod script;

pub use error::{EngineError, Result};
pub use io::{ByteSource, DirtyOffsets, MmapByteSource, VecByteSource};
pub use journal::UndoJournal;
pub use pe::{PeMap, PeMapper};
pub use script::{RunReport, ScriptEngine, ScriptWatcher};
