//! Patch-script execution.
//!
//! Runs parsed methods in declaration order against a shared
//! [`ByteSource`]. Each method gets a fresh local scope; `clink` exports
//! are copied to the global scope as `Method.Symbol` when the body
//! finishes. Every byte written is recorded in the undo journal, and one
//! transaction boundary covering the whole run is committed at the end.
//! Command failures are logged and skip the command, never the run;
//! only parse failures and a missing file are fatal.

use crate::asm;
use crate::error::{EngineError, Result};
use crate::expr::{self, Scope, INVALID};
use crate::io::{read_vec, ByteSource, DirtyOffsets};
use crate::journal::UndoJournal;
use crate::scan::{self, pattern, ScanConfig};
use crate::script::parser::{self, validate_variable, MethodContainer};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Summary of one script run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Bytes written (and undo entries recorded).
    pub writes: usize,
    /// Commands skipped for any reason.
    pub skipped: usize,
    /// `check` commands that observed unexpected bytes.
    pub check_failures: usize,
}

/// Callback receiving each successful patch address.
pub type PatchCallback = Box<dyn FnMut(u64) + Send>;

/// Executes `.euv` programs against a byte source and undo journal.
pub struct ScriptEngine<'a> {
    source: &'a mut dyn ByteSource,
    journal: &'a UndoJournal,
    dirty: Option<&'a DirtyOffsets>,
    scan_config: ScanConfig,
    on_patch: Option<PatchCallback>,
    globals: BTreeMap<String, i64>,
    last_address: i64,
}

impl<'a> ScriptEngine<'a> {
    pub fn new(source: &'a mut dyn ByteSource, journal: &'a UndoJournal) -> Self {
        Self {
            source,
            journal,
            dirty: None,
            scan_config: ScanConfig::default(),
            on_patch: None,
            globals: BTreeMap::new(),
            last_address: 0,
        }
    }

    /// Publish written offsets through this dirty set.
    pub fn with_dirty(mut self, dirty: &'a DirtyOffsets) -> Self {
        self.dirty = Some(dirty);
        self
    }

    /// Receive the address of every committed patch.
    pub fn on_patch(mut self, callback: PatchCallback) -> Self {
        self.on_patch = Some(callback);
        self
    }

    /// Global scope left behind by previous runs, keyed `Method.Symbol`.
    pub fn globals(&self) -> &BTreeMap<String, i64> {
        &self.globals
    }

    /// Parse and run a script file.
    pub fn run_file(&mut self, path: &Path) -> Result<RunReport> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Fatal(format!("cannot read script '{}': {e}", path.display()))
        })?;
        self.run_source(&text)
    }

    /// Parse and run script text.
    pub fn run_source(&mut self, text: &str) -> Result<RunReport> {
        let script = parser::parse(text).inspect_err(|e| error!(error = %e, "script rejected"))?;
        if self.source.is_empty() {
            return Err(EngineError::Fatal("no file loaded".into()));
        }

        let mut report = RunReport::default();
        for method in &script.methods {
            self.run_method(method, &mut report);
        }

        if report.writes > 0 {
            self.journal.commit(report.writes);
            if let Some(dirty) = self.dirty {
                dirty.publish();
            }
        }
        info!(
            writes = report.writes,
            skipped = report.skipped,
            check_failures = report.check_failures,
            "script run finished"
        );
        Ok(report)
    }

    fn run_method(&mut self, method: &MethodContainer, report: &mut RunReport) {
        debug!(method = %method.name, "entering method");
        let mut local = BTreeMap::new();

        for line in &method.body {
            self.execute_line(line, &mut local, report);
        }

        // Exports copy local bindings to `Method.Symbol` once the body
        // is done; an export the body never bound is only a warning.
        for export in &method.exports {
            match local.get(export) {
                Some(value) => {
                    self.globals
                        .insert(format!("{}.{}", method.name, export), *value);
                }
                None => warn!(
                    method = %method.name,
                    symbol = %export,
                    "export never bound in method body"
                ),
            }
        }
    }

    fn execute_line(
        &mut self,
        line: &str,
        local: &mut BTreeMap<String, i64>,
        report: &mut RunReport,
    ) {
        if let Some(inner) = enclosed(line, "find(") {
            self.cmd_find(inner, local, report);
        } else if let Some(inner) = enclosed(line, "set(") {
            self.cmd_set(inner, local, report);
        } else if let Some(rest) = line.strip_prefix("check ") {
            self.cmd_check(rest, local, report);
        } else if line.contains(':') {
            self.cmd_patch(line, local, report);
        } else {
            warn!(line, "unrecognized command skipped");
            report.skipped += 1;
        }
    }

    /// `find(VAR = PATTERN)`: whole-file scan, first match or INVALID.
    fn cmd_find(&mut self, inner: &str, local: &mut BTreeMap<String, i64>, report: &mut RunReport) {
        let Some((var, pattern_text)) = inner.split_once('=') else {
            warn!(line = inner, "malformed find command skipped");
            report.skipped += 1;
            return;
        };
        let var = var.trim();
        if let Err(e) = validate_variable(var) {
            error!(error = %e, "find aborted");
            report.skipped += 1;
            return;
        }
        let parsed = match scan::parse_pattern(pattern_text) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "find aborted");
                report.skipped += 1;
                return;
            }
        };

        match scan::find_first_in_source(&*self.source, &parsed, &self.scan_config) {
            Some(offset) => {
                info!(var, offset = format_args!("{offset:#x}"), "signature found");
                local.insert(var.to_string(), offset as i64);
            }
            None => {
                info!(var, pattern = %pattern_text.trim(), "signature not found");
                local.insert(var.to_string(), INVALID);
            }
        }
    }

    /// `set(VAR = EXPR)`: evaluate and bind; INVALID propagates.
    fn cmd_set(&mut self, inner: &str, local: &mut BTreeMap<String, i64>, report: &mut RunReport) {
        let Some((var, expression)) = inner.split_once('=') else {
            warn!(line = inner, "malformed set command skipped");
            report.skipped += 1;
            return;
        };
        let var = var.trim();
        if let Err(e) = validate_variable(var) {
            error!(error = %e, "set aborted");
            report.skipped += 1;
            return;
        }
        let scope = Scope::new(local, &self.globals, self.last_address);
        match expr::evaluate(expression, &scope) {
            Ok(value) => {
                debug!(var, value, "variable set");
                local.insert(var.to_string(), value);
            }
            Err(e) => {
                error!(error = %e, "set aborted");
                report.skipped += 1;
            }
        }
    }

    /// `check ADDR : BYTES`: compare and log; a mismatch only ends this
    /// command.
    fn cmd_check(&mut self, rest: &str, local: &mut BTreeMap<String, i64>, report: &mut RunReport) {
        let Some((addr_text, bytes_text)) = rest.split_once(':') else {
            warn!(line = rest, "malformed check command skipped");
            report.skipped += 1;
            return;
        };
        let Some(addr) = self.resolve_address(addr_text, local, report) else {
            return;
        };
        let expected = match scan::parse_pattern(bytes_text) {
            Ok(p) if !p.is_empty() => p,
            Ok(_) => {
                warn!("check with empty byte list skipped");
                report.skipped += 1;
                return;
            }
            Err(e) => {
                error!(error = %e, "check aborted");
                report.skipped += 1;
                return;
            }
        };

        if addr + expected.len() as u64 > self.source.len() {
            warn!(addr = format_args!("{addr:#x}"), "check out of range, skipped");
            report.skipped += 1;
            return;
        }
        let actual = read_vec(&*self.source, addr, expected.len());
        let matches = expected
            .iter()
            .zip(actual.iter())
            .all(|(p, b)| p.matches(*b));
        if matches {
            debug!(addr = format_args!("{addr:#x}"), "check passed");
        } else {
            let mismatch = EngineError::CheckMismatch {
                offset: addr,
                expected: pattern::render(&expected),
                actual: hex_string(&actual),
            };
            warn!(error = %mismatch, "check failed");
            report.check_failures += 1;
        }
    }

    /// `ADDR : PAYLOAD`: encode the payload and write it.
    fn cmd_patch(&mut self, line: &str, local: &mut BTreeMap<String, i64>, report: &mut RunReport) {
        let Some((addr_text, payload)) = line.split_once(':') else {
            report.skipped += 1;
            return;
        };
        let payload = payload.trim();
        let Some(addr) = self.resolve_address(addr_text, local, report) else {
            return;
        };

        let Some(bytes) = interpret_payload(payload, addr) else {
            warn!(payload, "no interpretation for payload, line skipped");
            report.skipped += 1;
            return;
        };
        if bytes.is_empty() {
            warn!(payload, "empty payload, line skipped");
            report.skipped += 1;
            return;
        }
        if addr + bytes.len() as u64 > self.source.len() {
            warn!(
                addr = format_args!("{addr:#x}"),
                len = bytes.len(),
                "patch out of range, skipped"
            );
            report.skipped += 1;
            return;
        }

        let old = read_vec(&*self.source, addr, bytes.len());
        for (i, &byte) in bytes.iter().enumerate() {
            let offset = addr + i as u64;
            // One journal entry per byte; the journal lock is released
            // before the write itself.
            self.journal.record(offset, vec![old[i]], vec![byte]);
            if let Err(e) = self.source.write_u8(offset, byte) {
                warn!(offset, error = %e, "write failed");
            }
        }
        if let Some(dirty) = self.dirty {
            dirty.mark_range(addr, bytes.len() as u64);
        }
        report.writes += bytes.len();
        self.last_address = (addr + bytes.len() as u64) as i64;
        info!(
            addr = format_args!("{addr:#x}"),
            patch = format_args!("[{}] -> [{}]", hex_string(&old), hex_string(&bytes)),
            "patched"
        );
        if let Some(callback) = &mut self.on_patch {
            callback(addr);
        }
    }

    /// Evaluate an address expression, handling the INVALID and
    /// out-of-range skip policies. `None` means the command was skipped
    /// and accounted for.
    fn resolve_address(
        &mut self,
        text: &str,
        local: &BTreeMap<String, i64>,
        report: &mut RunReport,
    ) -> Option<u64> {
        let scope = Scope::new(local, &self.globals, self.last_address);
        let value = match expr::evaluate(text, &scope) {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "address expression aborted");
                report.skipped += 1;
                return None;
            }
        };
        if value == INVALID {
            info!(expr = %text.trim(), "skipped due to missing signature");
            report.skipped += 1;
            return None;
        }
        if value < 0 || value as u64 >= self.source.len() {
            warn!(address = value, "address out of range, skipped");
            report.skipped += 1;
            return None;
        }
        Some(value as u64)
    }
}

/// Strip `prefix` and a trailing `)`.
fn enclosed<'t>(line: &'t str, prefix: &str) -> Option<&'t str> {
    line.strip_prefix(prefix)?.strip_suffix(')')
}

/// Payload interpretation order: inline assembly, then a double-quoted
/// ASCII literal, then whitespace-separated hex bytes.
fn interpret_payload(payload: &str, addr: u64) -> Option<Vec<u8>> {
    if let Some(bytes) = asm::encode(payload, addr) {
        return Some(bytes);
    }
    if let Some(text) = quoted_substring(payload) {
        return Some(text.as_bytes().to_vec());
    }
    pattern::literal_bytes(&scan::parse_pattern(payload).ok()?)
}

fn quoted_substring(text: &str) -> Option<&str> {
    let first = text.find('"')?;
    let rest = &text[first + 1..];
    let second = rest.find('"')?;
    Some(&rest[..second])
}

fn hex_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}
