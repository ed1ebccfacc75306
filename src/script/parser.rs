//! Patch-script parsing.
//!
//! Scripts are line-oriented UTF-8: comments start where a `#` or `//`
//! token begins, the body is bracketed by `start;` and `end;`, and
//! method declarations collect raw body lines plus a `clink` export
//! list. Execution happens later; parsing only builds the containers.

use crate::error::{EngineError, Result};
use std::collections::BTreeSet;
use tracing::debug;

/// Method visibility modifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Public,
    Private,
}

/// One parsed method: raw body lines plus the symbols it exports to the
/// global scope when it finishes.
#[derive(Debug, Clone)]
pub struct MethodContainer {
    pub name: String,
    pub access: Access,
    pub body: Vec<String>,
    pub exports: BTreeSet<String>,
}

/// A parsed script.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub methods: Vec<MethodContainer>,
}

/// Command words that cannot be used as variable names.
pub const RESERVED_WORDS: &[&str] = &[
    "find", "set", "check", "start", "end", "clink", "public", "private",
];

pub fn is_reserved(name: &str) -> bool {
    RESERVED_WORDS.contains(&name)
}

/// Valid assignment target: `[A-Za-z_][A-Za-z0-9_]*` and not reserved.
pub fn validate_variable(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !valid_start || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(EngineError::Parse(format!("invalid variable name '{name}'")));
    }
    if is_reserved(name) {
        return Err(EngineError::Parse(format!(
            "'{name}' is a reserved word and cannot name a variable"
        )));
    }
    Ok(())
}

/// Cut the line where a `#` or `//` token begins.
fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    let mut at_token_start = true;
    for (i, &b) in bytes.iter().enumerate() {
        if at_token_start {
            if b == b'#' || (b == b'/' && bytes.get(i + 1) == Some(&b'/')) {
                return &line[..i];
            }
        }
        at_token_start = b.is_ascii_whitespace();
    }
    line
}

/// Trim, strip comments, and collapse runs of spaces to one.
fn normalize(line: &str) -> String {
    strip_comment(line)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

enum State {
    Outside,
    Inside,
    InMethod,
}

struct ParserState {
    state: State,
    access: Access,
    current: Option<MethodContainer>,
    collecting_exports: bool,
    methods: Vec<MethodContainer>,
    finished: bool,
}

/// Parse script text into method containers.
pub fn parse(source: &str) -> Result<Script> {
    let mut p = ParserState {
        state: State::Outside,
        access: Access::Private,
        current: None,
        collecting_exports: false,
        methods: Vec::new(),
        finished: false,
    };

    for raw in source.lines() {
        if p.finished {
            break;
        }
        let line = normalize(raw);
        if line.is_empty() {
            continue;
        }
        parse_line(&mut p, &line)?;
    }

    if !p.finished {
        return Err(match p.state {
            State::Outside => EngineError::Fatal("script has no 'start;' marker".into()),
            _ => EngineError::Fatal("end of input before 'end;'".into()),
        });
    }
    Ok(Script { methods: p.methods })
}

fn parse_line(p: &mut ParserState, line: &str) -> Result<()> {
    match p.state {
        State::Outside => {
            if line.split(' ').any(|t| t == "start;") {
                p.state = State::Inside;
            }
            Ok(())
        }
        State::Inside => parse_top_level(p, line),
        State::InMethod => parse_method_line(p, line),
    }
}

fn parse_top_level(p: &mut ParserState, line: &str) -> Result<()> {
    if line == "end;" {
        p.finished = true;
        return Ok(());
    }
    match line {
        "public:" => p.access = Access::Public,
        "private:" => p.access = Access::Private,
        _ => {
            if let Some((name, tail)) = method_declaration(line) {
                p.current = Some(MethodContainer {
                    name,
                    access: p.access,
                    body: Vec::new(),
                    exports: BTreeSet::new(),
                });
                p.state = State::InMethod;
                // Braces may share the declaration line.
                for token in tail.split_whitespace() {
                    parse_line(p, token)?;
                }
            } else {
                debug!(line, "ignoring line outside any method");
            }
        }
    }
    Ok(())
}

/// Extract the name from a `_createMethod(NAME)` line, returning any
/// trailing text (typically an opening brace) for further processing.
fn method_declaration(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("_createMethod(")?;
    let close = rest.find(')')?;
    let name = rest[..close].trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), rest[close + 1..].trim().to_string()))
}

fn parse_method_line(p: &mut ParserState, line: &str) -> Result<()> {
    let method = p
        .current
        .as_mut()
        .ok_or_else(|| EngineError::Parse("method body outside a method".into()))?;

    if p.collecting_exports {
        p.collecting_exports = !collect_exports(line, &mut method.exports);
        return Ok(());
    }

    if line == "{" {
        return Ok(());
    }
    if line == "}" {
        let done = p.current.take().map(|m| {
            debug!(method = %m.name, lines = m.body.len(), "method parsed");
            m
        });
        p.methods.extend(done);
        p.state = State::Inside;
        return Ok(());
    }

    if let Some(rest) = line.strip_prefix("clink:") {
        p.collecting_exports = !collect_exports(rest, &mut method.exports);
        return Ok(());
    }
    if line.contains('[') {
        let after = &line[line.find('[').map(|i| i + 1).unwrap_or(0)..];
        p.collecting_exports = !collect_exports(after, &mut method.exports);
        return Ok(());
    }

    validate_body_line(line)?;
    method.body.push(line.to_string());
    Ok(())
}

/// Pull export names out of one physical line. Returns true when the
/// closing `]` was seen.
fn collect_exports(text: &str, exports: &mut BTreeSet<String>) -> bool {
    let (names_part, closed) = match text.find(']') {
        Some(i) => (&text[..i], true),
        None => (text, false),
    };
    for name in names_part
        .split([',', '['])
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        exports.insert(name.to_string());
    }
    closed
}

/// Reject reserved words used as assignment targets. Everything else is
/// validated at execution time.
fn validate_body_line(line: &str) -> Result<()> {
    for prefix in ["find(", "set("] {
        if let Some(rest) = line.strip_prefix(prefix) {
            if let Some((var, _)) = rest.split_once('=') {
                validate_variable(var.trim())?;
            }
        }
    }
    Ok(())
}
