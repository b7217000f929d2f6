//! tablelocal Query - OData `$filter` expressions
//!
//! A filter string is tokenized, parsed into an [`Expr`] tree and then
//! evaluated against entities one at a time. See [`expr`] for the
//! evaluation rules around missing properties and mixed types.

pub mod error;
pub mod expr;
pub mod lexer;
pub mod parser;

pub use error::FilterError;
pub use expr::{CompareOp, Expr, Operand};

use tablelocal_common::Entity;

/// A parsed, reusable filter
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    source: String,
    expr: Expr,
}

impl Filter {
    /// Parse a `$filter` string
    pub fn parse(input: &str) -> Result<Self, FilterError> {
        let tokens = lexer::tokenize(input)?;
        let expr = parser::parse(tokens)?;
        Ok(Self {
            source: input.to_string(),
            expr,
        })
    }

    /// Whether the entity satisfies the filter. Unknown counts as no match.
    #[must_use]
    pub fn matches(&self, entity: &Entity) -> bool {
        self.expr.eval(entity).unwrap_or(false)
    }

    /// PartitionKey the filter pins the result to, if it has a top-level
    /// `PartitionKey eq '...'` conjunct
    #[must_use]
    pub fn partition_key(&self) -> Option<&str> {
        self.expr.string_equality("PartitionKey")
    }

    #[must_use]
    pub const fn expr(&self) -> &Expr {
        &self.expr
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl std::str::FromStr for Filter {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
