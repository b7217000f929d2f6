//! Filter expression tokenizer

use crate::error::FilterError;
use crate::expr::CompareOp;
use chrono::{NaiveDateTime, Utc};
use tablelocal_common::PropertyValue;
use tablelocal_common::entity::parse_datetime;
use uuid::Uuid;

/// A lexical token with its byte offset in the source
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub pos: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    LParen,
    RParen,
    /// Property name
    Ident(String),
    Literal(PropertyValue),
    Compare(CompareOp),
    And,
    Or,
    Not,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LParen => f.write_str("'('"),
            Self::RParen => f.write_str("')'"),
            Self::Ident(name) => write!(f, "property {name}"),
            Self::Literal(value) => write!(f, "{} literal", value.edm_type()),
            Self::Compare(op) => write!(f, "operator {}", op.as_str()),
            Self::And => f.write_str("'and'"),
            Self::Or => f.write_str("'or'"),
            Self::Not => f.write_str("'not'"),
        }
    }
}

/// Split a filter string into tokens
pub fn tokenize(input: &str) -> Result<Vec<Spanned>, FilterError> {
    Lexer {
        src: input,
        bytes: input.as_bytes(),
        pos: 0,
    }
    .run()
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl Lexer<'_> {
    fn run(mut self) -> Result<Vec<Spanned>, FilterError> {
        let mut tokens = Vec::new();
        while let Some(c) = self.peek() {
            let start = self.pos;
            let token = match c {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    self.pos += 1;
                    continue;
                }
                b'(' => {
                    self.pos += 1;
                    Token::LParen
                }
                b')' => {
                    self.pos += 1;
                    Token::RParen
                }
                b'\'' => Token::Literal(PropertyValue::String(self.quoted()?)),
                b'-' | b'0'..=b'9' => Token::Literal(self.number()?),
                c if c.is_ascii_alphabetic() || c == b'_' => self.word()?,
                _ => {
                    let ch = self.src[start..].chars().next().unwrap_or('?');
                    return Err(FilterError::UnexpectedChar { pos: start, ch });
                }
            };
            tokens.push(Spanned { token, pos: start });
        }
        Ok(tokens)
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    /// Read a single-quoted string starting at the opening quote.
    /// A doubled quote inside the string is an escaped quote.
    fn quoted(&mut self) -> Result<String, FilterError> {
        let start = self.pos;
        self.pos += 1;
        let mut out = String::new();
        loop {
            let rest = &self.src[self.pos..];
            let Some(idx) = rest.find('\'') else {
                return Err(FilterError::UnterminatedString { pos: start });
            };
            out.push_str(&rest[..idx]);
            self.pos += idx + 1;
            if self.peek() == Some(b'\'') {
                out.push('\'');
                self.pos += 1;
            } else {
                return Ok(out);
            }
        }
    }

    fn number(&mut self) -> Result<PropertyValue, FilterError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        let mut is_double = false;
        while let Some(c) = self.peek() {
            match c {
                b'0'..=b'9' => {}
                b'.' => is_double = true,
                b'e' | b'E' => {
                    is_double = true;
                    if matches!(self.bytes.get(self.pos + 1), Some(b'+' | b'-')) {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
            self.pos += 1;
        }
        let text = &self.src[start..self.pos];
        let invalid = |msg: &str| FilterError::InvalidLiteral {
            pos: start,
            message: format!("{msg}: {text}"),
        };

        match self.peek() {
            Some(b'L' | b'l') => {
                self.pos += 1;
                if is_double {
                    return Err(invalid("Int64 literal cannot have a fraction"));
                }
                text.parse::<i64>()
                    .map(PropertyValue::Int64)
                    .map_err(|_| invalid("invalid Int64 literal"))
            }
            Some(b'D' | b'd') => {
                self.pos += 1;
                text.parse::<f64>()
                    .map(PropertyValue::Double)
                    .map_err(|_| invalid("invalid Double literal"))
            }
            _ if is_double => text
                .parse::<f64>()
                .map(PropertyValue::Double)
                .map_err(|_| invalid("invalid Double literal")),
            _ => {
                let value = text
                    .parse::<i64>()
                    .map_err(|_| invalid("invalid integer literal"))?;
                Ok(i32::try_from(value).map_or(PropertyValue::Int64(value), PropertyValue::Int32))
            }
        }
    }

    fn word(&mut self) -> Result<Token, FilterError> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_')
        {
            self.pos += 1;
        }
        let word = &self.src[start..self.pos];

        if self.peek() == Some(b'\'') {
            let body = self.quoted()?;
            return typed_literal(word, &body, start).map(Token::Literal);
        }

        // keywords are lowercase only; `Not` or `True` name properties
        Ok(match word {
            "and" => Token::And,
            "or" => Token::Or,
            "not" => Token::Not,
            "true" => Token::Literal(PropertyValue::Boolean(true)),
            "false" => Token::Literal(PropertyValue::Boolean(false)),
            _ => CompareOp::parse(word).map_or_else(|| Token::Ident(word.to_string()), Token::Compare),
        })
    }
}

/// Decode a prefixed literal such as `datetime'...'` or `guid'...'`
fn typed_literal(prefix: &str, body: &str, pos: usize) -> Result<PropertyValue, FilterError> {
    let invalid = |kind: &str| FilterError::InvalidLiteral {
        pos,
        message: format!("invalid {kind} literal: {body}"),
    };
    match prefix.to_ascii_lowercase().as_str() {
        "datetime" => parse_datetime(body)
            .or_else(|| {
                NaiveDateTime::parse_from_str(body, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|naive| naive.and_utc())
            })
            .map(|dt| PropertyValue::DateTime(dt.with_timezone(&Utc)))
            .ok_or_else(|| invalid("datetime")),
        "guid" => Uuid::parse_str(body)
            .map(PropertyValue::Guid)
            .map_err(|_| invalid("guid")),
        "x" | "binary" => hex::decode(body)
            .map(PropertyValue::Binary)
            .map_err(|_| invalid("binary")),
        _ => Err(FilterError::InvalidLiteral {
            pos,
            message: format!("unknown literal prefix: {prefix}"),
        }),
    }
}
