//! The `.euv` patch-script subsystem: parser, engine, and file watcher.

pub mod engine;
pub mod parser;
pub mod watcher;

pub use engine::{RunReport, ScriptEngine};
pub use parser::{parse, Access, MethodContainer, Script};
pub use watcher::ScriptWatcher;
