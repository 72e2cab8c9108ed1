//! Property-based message selectors.
//!
//! Supported syntax is a small subset of JMS selectors, enough to route job
//! messages by key:
//!
//! ```text
//! job_key = 'refresh_pools'
//! job_key <> 'heal_entire_org'
//! job_key IN ('a', 'b') AND region NOT IN ('eu')
//! ```
//!
//! Conditions are joined with `AND`. A message lacking the property never
//! matches a positive condition and always matches a negative one.

use core::str::FromStr;

use crate::transport::{TransportError, TransportMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Condition {
    Equals { property: String, value: String, negated: bool },
    In { property: String, values: Vec<String>, negated: bool },
}

impl Condition {
    fn matches(&self, message: &TransportMessage) -> bool {
        match self {
            Condition::Equals {
                property,
                value,
                negated,
            } => {
                let hit = message.property(property) == Some(value.as_str());
                hit != *negated
            }
            Condition::In {
                property,
                values,
                negated,
            } => {
                let hit = message
                    .property(property)
                    .is_some_and(|actual| values.iter().any(|v| v == actual));
                hit != *negated
            }
        }
    }
}

/// A parsed selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFilter {
    source: String,
    conditions: Vec<Condition>,
}

impl MessageFilter {
    pub fn parse(source: &str) -> Result<Self, TransportError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let mut conditions = vec![parser.condition()?];

        while parser.peek_keyword("AND") {
            parser.pos += 1;
            conditions.push(parser.condition()?);
        }

        if let Some(extra) = parser.tokens.get(parser.pos) {
            return Err(TransportError::InvalidFilter(format!(
                "unexpected token {extra:?} in '{source}'"
            )));
        }

        Ok(Self {
            source: source.trim().to_string(),
            conditions,
        })
    }

    pub fn matches(&self, message: &TransportMessage) -> bool {
        self.conditions.iter().all(|c| c.matches(message))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl FromStr for MessageFilter {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl core::fmt::Display for MessageFilter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.source)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Literal(String),
    Eq,
    NotEq,
    Open,
    Close,
    Comma,
}

fn tokenize(source: &str) -> Result<Vec<Token>, TransportError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '=' => {
                chars.next();
                tokens.push(Token::Eq);
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '<' | '!' => {
                chars.next();
                match (c, chars.next()) {
                    ('<', Some('>')) | ('!', Some('=')) => tokens.push(Token::NotEq),
                    _ => {
                        return Err(TransportError::InvalidFilter(format!(
                            "unsupported operator in '{source}'"
                        )));
                    }
                }
            }
            '\'' => {
                chars.next();
                let mut literal = String::new();
                loop {
                    match chars.next() {
                        // '' escapes a single quote
                        Some('\'') if chars.peek() == Some(&'\'') => {
                            chars.next();
                            literal.push('\'');
                        }
                        Some('\'') => break,
                        Some(ch) => literal.push(ch),
                        None => {
                            return Err(TransportError::InvalidFilter(format!(
                                "unterminated literal in '{source}'"
                            )));
                        }
                    }
                }
                tokens.push(Token::Literal(literal));
            }
            c if c.is_alphanumeric() || c == '_' || c == '.' => {
                let mut word = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_alphanumeric() || ch == '_' || ch == '.' {
                        word.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Word(word));
            }
            other => {
                return Err(TransportError::InvalidFilter(format!(
                    "unexpected character '{other}' in '{source}'"
                )));
            }
        }
    }

    if tokens.is_empty() {
        return Err(TransportError::InvalidFilter("empty filter".to_string()));
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.tokens.get(self.pos), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn expect(&mut self, expected: Token) -> Result<(), TransportError> {
        match self.next() {
            Some(t) if t == expected => Ok(()),
            other => Err(TransportError::InvalidFilter(format!(
                "expected {expected:?}, found {other:?}"
            ))),
        }
    }

    fn literal(&mut self) -> Result<String, TransportError> {
        match self.next() {
            Some(Token::Literal(value)) => Ok(value),
            other => Err(TransportError::InvalidFilter(format!(
                "expected quoted literal, found {other:?}"
            ))),
        }
    }

    fn condition(&mut self) -> Result<Condition, TransportError> {
        let property = match self.next() {
            Some(Token::Word(w)) => w,
            other => {
                return Err(TransportError::InvalidFilter(format!(
                    "expected property name, found {other:?}"
                )));
            }
        };

        let negated = self.peek_keyword("NOT");
        if negated {
            self.pos += 1;
        }

        if self.peek_keyword("IN") {
            self.pos += 1;
            self.expect(Token::Open)?;
            let mut values = vec![self.literal()?];
            while self.tokens.get(self.pos) == Some(&Token::Comma) {
                self.pos += 1;
                values.push(self.literal()?);
            }
            self.expect(Token::Close)?;
            return Ok(Condition::In {
                property,
                values,
                negated,
            });
        }

        if negated {
            return Err(TransportError::InvalidFilter(
                "NOT is only supported before IN".to_string(),
            ));
        }

        let negated = match self.next() {
            Some(Token::Eq) => false,
            Some(Token::NotEq) => true,
            other => {
                return Err(TransportError::InvalidFilter(format!(
                    "expected comparison operator, found {other:?}"
                )));
            }
        };

        Ok(Condition::Equals {
            property,
            value: self.literal()?,
            negated,
        })
    }
}
