//! Predicate tree and evaluation.
//!
//! Evaluation is three-valued: a comparison that references a property the
//! entity does not have, or that compares values of incompatible types, is
//! *unknown*. Unknown propagates through `not`, is absorbed by `false` under
//! `and` and by `true` under `or`, and a predicate that is unknown overall
//! does not match.

use std::cmp::Ordering;
use tablelocal_common::{Entity, PropertyValue};

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    #[must_use]
    pub fn parse(word: &str) -> Option<Self> {
        Some(match word {
            "eq" => Self::Eq,
            "ne" => Self::Ne,
            "gt" => Self::Gt,
            "ge" => Self::Ge,
            "lt" => Self::Lt,
            "le" => Self::Le,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Gt => "gt",
            Self::Ge => "ge",
            Self::Lt => "lt",
            Self::Le => "le",
        }
    }

    fn test(self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::Ne => ordering != Ordering::Equal,
            Self::Gt => ordering == Ordering::Greater,
            Self::Ge => ordering != Ordering::Less,
            Self::Lt => ordering == Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
        }
    }
}

/// One side of a comparison
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Property(String),
    Literal(PropertyValue),
}

impl Operand {
    fn resolve(&self, entity: &Entity) -> Option<PropertyValue> {
        match self {
            Self::Property(name) => entity.property(name),
            Self::Literal(value) => Some(value.clone()),
        }
    }
}

/// A filter predicate
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    /// Evaluate against an entity. `None` means unknown.
    #[must_use]
    pub fn eval(&self, entity: &Entity) -> Option<bool> {
        match self {
            Self::Compare { left, op, right } => {
                let left = left.resolve(entity)?;
                let right = right.resolve(entity)?;
                left.compare(&right).map(|ordering| op.test(ordering))
            }
            Self::And(a, b) => match (a.eval(entity), b.eval(entity)) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            },
            Self::Or(a, b) => match (a.eval(entity), b.eval(entity)) {
                (Some(true), _) | (_, Some(true)) => Some(true),
                (Some(false), Some(false)) => Some(false),
                _ => None,
            },
            Self::Not(inner) => inner.eval(entity).map(|v| !v),
        }
    }

    /// The value `P` of a top-level `PropertyName eq 'P'` conjunct, if any.
    #[must_use]
    pub fn string_equality(&self, property: &str) -> Option<&str> {
        match self {
            Self::Compare {
                left: Operand::Property(name),
                op: CompareOp::Eq,
                right: Operand::Literal(PropertyValue::String(value)),
            }
            | Self::Compare {
                left: Operand::Literal(PropertyValue::String(value)),
                op: CompareOp::Eq,
                right: Operand::Property(name),
            } if name == property => Some(value),
            Self::And(a, b) => a
                .string_equality(property)
                .or_else(|| b.string_equality(property)),
            _ => None,
        }
    }
}
