//! Integer expression evaluation for patch scripts.
//!
//! Recursive descent over `+ - * / %` with parentheses, hex and decimal
//! literals, and identifiers resolved against a local scope first, then
//! a global one. All arithmetic is 64-bit signed and wrapping; division
//! and modulo by zero yield 0. The reserved sentinel [`INVALID`]
//! poisons every expression it touches, which is how a failed signature
//! lookup disables the writes that depend on it.

use crate::error::{EngineError, Result};
use std::collections::BTreeMap;

/// Sentinel for "value never resolved". Flows through arithmetic
/// unchanged.
pub const INVALID: i64 = i64::MIN;

/// Variable scopes visible to one evaluation.
pub struct Scope<'a> {
    pub local: &'a BTreeMap<String, i64>,
    pub global: &'a BTreeMap<String, i64>,
    /// Value of the `.` / `()` whole-expression forms.
    pub last_address: i64,
}

impl<'a> Scope<'a> {
    pub fn new(
        local: &'a BTreeMap<String, i64>,
        global: &'a BTreeMap<String, i64>,
        last_address: i64,
    ) -> Self {
        Self {
            local,
            global,
            last_address,
        }
    }

    /// Local first, then global; unknown names resolve to 0.
    fn lookup(&self, name: &str) -> i64 {
        self.local
            .get(name)
            .or_else(|| self.global.get(name))
            .copied()
            .unwrap_or(0)
    }
}

/// Evaluate `text` against `scope`.
pub fn evaluate(text: &str, scope: &Scope<'_>) -> Result<i64> {
    let trimmed = text.trim();
    // `.` and `()` as the whole expression are the last patch address.
    if trimmed == "." || trimmed == "()" {
        return Ok(scope.last_address);
    }

    let mut parser = Parser {
        chars: trimmed.chars().collect(),
        pos: 0,
        scope,
    };
    let value = parser.expr()?;
    parser.skip_ws();
    if parser.pos != parser.chars.len() {
        return Err(EngineError::Parse(format!(
            "trailing input at column {} in expression '{trimmed}'",
            parser.pos + 1
        )));
    }
    Ok(value)
}

fn apply(op: char, lhs: i64, rhs: i64) -> i64 {
    if lhs == INVALID || rhs == INVALID {
        return INVALID;
    }
    match op {
        '+' => lhs.wrapping_add(rhs),
        '-' => lhs.wrapping_sub(rhs),
        '*' => lhs.wrapping_mul(rhs),
        '/' => {
            if rhs == 0 {
                0
            } else {
                lhs.wrapping_div(rhs)
            }
        }
        '%' => {
            if rhs == 0 {
                0
            } else {
                lhs.wrapping_rem(rhs)
            }
        }
        _ => unreachable!("operator set is fixed"),
    }
}

struct Parser<'a, 'b> {
    chars: Vec<char>,
    pos: usize,
    scope: &'a Scope<'b>,
}

impl Parser<'_, '_> {
    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|c| c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn eat(&mut self, expected: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expr(&mut self) -> Result<i64> {
        let mut value = self.mul()?;
        loop {
            self.skip_ws();
            match self.peek() {
                Some(op @ ('+' | '-')) => {
                    self.pos += 1;
                    let rhs = self.mul()?;
                    value = apply(op, value, rhs);
                }
                _ => return Ok(value),
            }
        }
    }

    fn mul(&mut self) -> Result<i64> {
        let mut value = self.unary()?;
        loop {
            self.skip_ws();
            match self.peek() {
                Some(op @ ('*' | '/' | '%')) => {
                    self.pos += 1;
                    let rhs = self.unary()?;
                    value = apply(op, value, rhs);
                }
                _ => return Ok(value),
            }
        }
    }

    fn unary(&mut self) -> Result<i64> {
        self.skip_ws();
        match self.peek() {
            Some('-') => {
                self.pos += 1;
                let value = self.atom()?;
                Ok(if value == INVALID {
                    INVALID
                } else {
                    value.wrapping_neg()
                })
            }
            Some('+') => {
                self.pos += 1;
                self.atom()
            }
            _ => self.atom(),
        }
    }

    fn atom(&mut self) -> Result<i64> {
        self.skip_ws();
        match self.peek() {
            Some('(') => {
                self.pos += 1;
                let value = self.expr()?;
                if !self.eat(')') {
                    return Err(EngineError::Parse("expected ')'".into()));
                }
                Ok(value)
            }
            Some(c) if c.is_ascii_digit() => self.number(),
            Some(c) if c.is_ascii_alphabetic() || c == '_' => Ok(self.identifier()),
            other => Err(EngineError::Parse(format!(
                "unexpected {:?} in expression",
                other.map(String::from).unwrap_or_else(|| "end of input".into())
            ))),
        }
    }

    fn number(&mut self) -> Result<i64> {
        let start = self.pos;
        if self.peek() == Some('0')
            && matches!(self.chars.get(self.pos + 1), Some('x') | Some('X'))
        {
            self.pos += 2;
            let digits_start = self.pos;
            while self.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
                self.pos += 1;
            }
            if self.pos == digits_start {
                return Err(EngineError::Parse("empty hex literal".into()));
            }
            let digits: String = self.chars[digits_start..self.pos].iter().collect();
            // Wrap oversized literals like the arithmetic does.
            return Ok(u64::from_str_radix(&digits, 16)
                .map(|v| v as i64)
                .map_err(|_| EngineError::Parse(format!("hex literal too long '0x{digits}'")))?);
        }
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        let digits: String = self.chars[start..self.pos].iter().collect();
        digits
            .parse::<i64>()
            .map_err(|_| EngineError::Parse(format!("bad integer literal '{digits}'")))
    }

    fn identifier(&mut self) -> i64 {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        {
            self.pos += 1;
        }
        let name: String = self.chars[start..self.pos].iter().collect();
        self.scope.lookup(&name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(text: &str) -> i64 {
        let empty = BTreeMap::new();
        evaluate(text, &Scope::new(&empty, &empty, 0)).unwrap()
    }

    fn eval_with(text: &str, local: &[(&str, i64)], global: &[(&str, i64)], last: i64) -> i64 {
        let local: BTreeMap<String, i64> =
            local.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        let global: BTreeMap<String, i64> =
            global.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        evaluate(text, &Scope::new(&local, &global, last)).unwrap()
    }

    #[test]
    fn test_precedence_and_parentheses() {
        assert_eq!(eval("1 + 2 * 3"), 7);
        assert_eq!(eval("(1 + 2) * 3"), 9);
        assert_eq!(eval("10 - 2 - 3"), 5);
        assert_eq!(eval("100 / 5 / 2"), 10);
        assert_eq!(eval("17 % 5"), 2);
    }

    #[test]
    fn test_hex_and_unary() {
        assert_eq!(eval("0x10"), 16);
        assert_eq!(eval("0xFF + 1"), 256);
        assert_eq!(eval("-5 + 3"), -2);
        assert_eq!(eval("+7"), 7);
        assert_eq!(eval("-0x10"), -16);
    }

    #[test]
    fn test_division_by_zero_yields_zero() {
        assert_eq!(eval("5 / 0"), 0);
        assert_eq!(eval("5 % 0"), 0);
        assert_eq!(eval("1 + 5 / 0"), 1);
    }

    #[test]
    fn test_wrapping() {
        let empty = BTreeMap::new();
        let mut global = BTreeMap::new();
        global.insert("max".to_string(), i64::MAX);
        let scope = Scope::new(&empty, &global, 0);
        assert_eq!(evaluate("max + 1", &scope).unwrap(), i64::MIN.wrapping_add(1));
    }

    #[test]
    fn test_scope_resolution() {
        // Local shadows global; unknown names are 0.
        assert_eq!(eval_with("x + 1", &[("x", 10)], &[("x", 99)], 0), 11);
        assert_eq!(eval_with("y", &[], &[("y", 42)], 0), 42);
        assert_eq!(eval_with("unknown + 5", &[], &[], 0), 5);
        assert_eq!(eval_with("M.exported", &[], &[("M.exported", 7)], 0), 7);
    }

    #[test]
    fn test_last_address_forms() {
        assert_eq!(eval_with(".", &[], &[], 0x400), 0x400);
        assert_eq!(eval_with("()", &[], &[], 0x400), 0x400);
        assert_eq!(eval_with(" . ", &[], &[], 0x400), 0x400);
    }

    #[test]
    fn test_invalid_propagates() {
        let cases = [
            "x",
            "x + 1",
            "1 + x",
            "x * 0",
            "-x",
            "(x + 5) * 2",
            "x / 0",
            "10 % x",
        ];
        for case in cases {
            assert_eq!(
                eval_with(case, &[("x", INVALID)], &[], 0),
                INVALID,
                "case: {case}"
            );
        }
        // Both scopes poisoned.
        assert_eq!(
            eval_with("a + b", &[("a", INVALID)], &[("b", 3)], 0),
            INVALID
        );
    }

    #[test]
    fn test_syntax_errors() {
        let empty = BTreeMap::new();
        let scope = Scope::new(&empty, &empty, 0);
        assert!(evaluate("1 +", &scope).is_err());
        assert!(evaluate("(1 + 2", &scope).is_err());
        assert!(evaluate("0x", &scope).is_err());
        assert!(evaluate("1 2", &scope).is_err());
        assert!(evaluate("", &scope).is_err());
    }
}
