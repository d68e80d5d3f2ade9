//! Dial pattern matching
//!
//! Syntax:
//!
//! | token     | matches                                        |
//! |-----------|------------------------------------------------|
//! | `0`-`9`, `+`, `#`, other chars | that character exactly    |
//! | `X`       | any single digit                               |
//! | `[1-4]`   | one digit in the range                         |
//! | `[135]`   | one of the listed digits (ranges may be mixed) |
//! | trailing `*` | any remaining characters, including none    |
//!
//! A `*` anywhere but the end is a literal star (feature codes like `*97`).

use std::fmt;
use std::str::FromStr;

use crate::error::{CallEngineError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(char),
    AnyDigit,
    Class(Vec<(char, char)>),
}

impl Token {
    fn matches(&self, c: char) -> bool {
        match self {
            Token::Literal(l) => *l == c,
            Token::AnyDigit => c.is_ascii_digit(),
            Token::Class(ranges) => ranges.iter().any(|(lo, hi)| *lo <= c && c <= *hi),
        }
    }
}

/// Compiled dial pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialPattern {
    source: String,
    tokens: Vec<Token>,
    open_ended: bool,
}

impl DialPattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        let invalid = |reason: &str| CallEngineError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = pattern.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty pattern"));
        }

        let (body, open_ended) = match trimmed.strip_suffix('*') {
            Some(body) => (body, true),
            None => (trimmed, false),
        };

        let mut tokens = Vec::new();
        let mut chars = body.chars();
        while let Some(c) = chars.next() {
            match c {
                'X' | 'x' => tokens.push(Token::AnyDigit),
                '[' => {
                    let mut ranges = Vec::new();
                    let mut closed = false;
                    let mut pending: Option<char> = None;
                    while let Some(c) = chars.next() {
                        match c {
                            ']' => {
                                closed = true;
                                break;
                            }
                            '-' => {
                                let lo = pending.take().ok_or_else(|| invalid("range without start"))?;
                                let hi = chars
                                    .next()
                                    .filter(|h| h.is_ascii_digit())
                                    .ok_or_else(|| invalid("range without end"))?;
                                if hi < lo {
                                    return Err(invalid("descending range"));
                                }
                                ranges.push((lo, hi));
                            }
                            d if d.is_ascii_digit() => {
                                if let Some(prev) = pending.replace(d) {
                                    ranges.push((prev, prev));
                                }
                            }
                            _ => return Err(invalid("only digits allowed in a class")),
                        }
                    }
                    if let Some(last) = pending {
                        ranges.push((last, last));
                    }
                    if !closed {
                        return Err(invalid("unterminated '['"));
                    }
                    if ranges.is_empty() {
                        return Err(invalid("empty class"));
                    }
                    tokens.push(Token::Class(ranges));
                }
                ']' => return Err(invalid("unexpected ']'")),
                other => tokens.push(Token::Literal(other)),
            }
        }

        Ok(Self {
            source: trimmed.to_string(),
            tokens,
            open_ended,
        })
    }

    pub fn matches(&self, number: &str) -> bool {
        let mut chars = number.chars();
        for token in &self.tokens {
            match chars.next() {
                Some(c) if token.matches(c) => {}
                _ => return false,
            }
        }
        self.open_ended || chars.next().is_none()
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl FromStr for DialPattern {
    type Err = CallEngineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for DialPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> DialPattern {
        DialPattern::parse(s).unwrap()
    }

    #[test]
    fn test_exact_digits() {
        assert!(p("100").matches("100"));
        assert!(!p("100").matches("1000"));
        assert!(!p("100").matches("10"));
    }

    #[test]
    fn test_trailing_wildcard() {
        let pattern = p("0049*");
        assert!(pattern.matches("0049891234567"));
        assert!(pattern.matches("0049"));
        assert!(!pattern.matches("0048891234567"));
        assert!(p("+4930*").matches("+4930123456"));
    }

    #[test]
    fn test_digit_class() {
        let internal = p("[1-4]XX");
        assert!(internal.matches("100"));
        assert!(internal.matches("499"));
        assert!(!internal.matches("500"));
        assert!(!internal.matches("10"));
        assert!(!internal.matches("1000"));

        let mixed = p("[135-7]0");
        assert!(mixed.matches("10"));
        assert!(mixed.matches("60"));
        assert!(!mixed.matches("20"));
    }

    #[test]
    fn test_feature_code_star_is_literal() {
        let vm = p("*97");
        assert!(vm.matches("*97"));
        assert!(!vm.matches("197"));
    }

    #[test]
    fn test_invalid_patterns() {
        for bad in ["", "[1-", "[]", "[a]", "1]", "[5-2]"] {
            assert!(
                matches!(DialPattern::parse(bad), Err(CallEngineError::InvalidPattern { .. })),
                "{} should be rejected",
                bad
            );
        }
    }
}
