//! Filter parse errors

use thiserror::Error;

/// Why a filter string was rejected. Positions are byte offsets.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("filter is empty")]
    Empty,

    #[error("unexpected character {ch:?} at position {pos}")]
    UnexpectedChar { pos: usize, ch: char },

    #[error("unterminated string literal starting at position {pos}")]
    UnterminatedString { pos: usize },

    #[error("{message} (position {pos})")]
    InvalidLiteral { pos: usize, message: String },

    #[error("unexpected {found} at position {pos}")]
    UnexpectedToken { pos: usize, found: String },

    #[error("unexpected end of filter, expected {expected}")]
    UnexpectedEnd { expected: &'static str },

    #[error("filter nesting exceeds {max} levels")]
    TooDeep { max: usize },
}

impl From<FilterError> for tablelocal_common::Error {
    fn from(err: FilterError) -> Self {
        Self::InvalidFilter(err.to_string())
    }
}
