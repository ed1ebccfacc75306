//! Wildcard byte-pattern parsing.

use crate::error::{EngineError, Result};

/// One position of a parsed pattern: a concrete byte or a wildcard that
/// matches anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternByte {
    Any,
    Literal(u8),
}

impl PatternByte {
    #[inline]
    pub fn matches(&self, byte: u8) -> bool {
        match self {
            Self::Any => true,
            Self::Literal(b) => *b == byte,
        }
    }

    /// Concrete value, or `None` for a wildcard.
    pub fn literal(&self) -> Option<u8> {
        match self {
            Self::Any => None,
            Self::Literal(b) => Some(*b),
        }
    }
}

/// Parse pattern text into an ordered byte sequence.
///
/// Tokens are whitespace-separated; `?` or `??` is a wildcard, anything
/// else must be a two-digit hex byte. Empty input yields an empty
/// sequence (which matches nothing when searched).
pub fn parse_pattern(text: &str) -> Result<Vec<PatternByte>> {
    let mut out = Vec::new();
    for token in text.split_whitespace() {
        if token == "?" || token == "??" {
            out.push(PatternByte::Any);
        } else if token.len() == 2 {
            let value = u8::from_str_radix(token, 16)
                .map_err(|_| EngineError::Parse(format!("bad hex token '{token}' in pattern")))?;
            out.push(PatternByte::Literal(value));
        } else {
            return Err(EngineError::Parse(format!(
                "bad pattern token '{token}': expected two hex digits or a wildcard"
            )));
        }
    }
    Ok(out)
}

/// True when at least one position is a wildcard.
pub fn has_wildcards(pattern: &[PatternByte]) -> bool {
    pattern.iter().any(|p| matches!(p, PatternByte::Any))
}

/// Collect the literal bytes of a wildcard-free pattern.
pub fn literal_bytes(pattern: &[PatternByte]) -> Option<Vec<u8>> {
    pattern.iter().map(|p| p.literal()).collect()
}

/// Render a parsed pattern back to its canonical text form.
pub fn render(pattern: &[PatternByte]) -> String {
    pattern
        .iter()
        .map(|p| match p {
            PatternByte::Any => "??".to_string(),
            PatternByte::Literal(b) => format!("{b:02X}"),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
