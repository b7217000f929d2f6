//! Recursive-descent parser for filter expressions.
//!
//! Grammar, lowest precedence first:
//!
//! ```text
//! or      := and ( "or" and )*
//! and     := unary ( "and" unary )*
//! unary   := "not" unary | primary
//! primary := "(" or ")" | operand op operand
//! operand := property | literal
//! ```

use crate::error::FilterError;
use crate::expr::{Expr, Operand};
use crate::lexer::{Spanned, Token};

/// Maximum nesting of parentheses and `not`
pub const MAX_DEPTH: usize = 64;

/// Parse a token stream into an expression tree
pub fn parse(tokens: Vec<Spanned>) -> Result<Expr, FilterError> {
    if tokens.is_empty() {
        return Err(FilterError::Empty);
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.or()?;
    match parser.tokens.get(parser.pos) {
        None => Ok(expr),
        Some(extra) => Err(unexpected(extra)),
    }
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn next(&mut self, expected: &'static str) -> Result<Spanned, FilterError> {
        let spanned = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(FilterError::UnexpectedEnd { expected })?;
        self.pos += 1;
        Ok(spanned)
    }

    fn enter(&mut self) -> Result<(), FilterError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(FilterError::TooDeep { max: MAX_DEPTH });
        }
        Ok(())
    }

    fn or(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, FilterError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            self.enter()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, FilterError> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            self.enter()?;
            let inner = self.or()?;
            let close = self.next("')'")?;
            if close.token != Token::RParen {
                return Err(unexpected(&close));
            }
            self.depth -= 1;
            return Ok(inner);
        }

        let left = self.operand()?;
        let op = self.next("comparison operator")?;
        let Token::Compare(op) = op.token else {
            return Err(unexpected(&op));
        };
        let right = self.operand()?;
        Ok(Expr::Compare { left, op, right })
    }

    fn operand(&mut self) -> Result<Operand, FilterError> {
        let spanned = self.next("property name or literal")?;
        match spanned.token {
            Token::Ident(name) => Ok(Operand::Property(name)),
            Token::Literal(value) => Ok(Operand::Literal(value)),
            _ => Err(unexpected(&spanned)),
        }
    }
}

fn unexpected(spanned: &Spanned) -> FilterError {
    FilterError::UnexpectedToken {
        pos: spanned.pos,
        found: spanned.token.to_string(),
    }
}
