//! Integer Expression Evaluator
//!
//! Evaluates the argument expressions of `@math`, `@property`, `@foreach`,
//! `@set` and `@add` directives over the active shader property values.
//!
//! Grammar (recursive descent, C-like precedence):
//!
//! ```text
//! or      := and ( "||" and )*
//! and     := cmp ( "&&" cmp )*
//! cmp     := add ( ("==" | "!=" | "<" | "<=" | ">" | ">=") add )?
//! add     := mul ( ("+" | "-") mul )*
//! mul     := unary ( ("*" | "/" | "%") unary )*
//! unary   := ("!" | "-")* primary
//! primary := integer | identifier | "(" or ")"
//! ```
//!
//! Identifiers resolve to shader property values. `@math` treats an unknown
//! identifier as a hard error; `@property` conditions treat it as 0 (an absent
//! property is simply false).

use crate::error::{CrucibleError, Result};
use crate::properties::{ShaderProperties, ShaderPropertyId};

/// How unknown identifiers resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UndefinedBehavior {
    /// Unknown identifier is a hard error (`@math`).
    Error,
    /// Unknown identifier evaluates to 0 (`@property`, `@foreach`, `@set`).
    Zero,
}

/// Evaluate `expression` against `properties`.
pub(crate) fn evaluate(
    expression: &str,
    properties: &ShaderProperties,
    undefined: UndefinedBehavior,
) -> Result<i64> {
    let tokens = tokenize(expression)?;
    let mut parser = Parser {
        expression,
        tokens: &tokens,
        position: 0,
        properties,
        undefined,
    };
    let value = parser.parse_or()?;
    if parser.position != parser.tokens.len() {
        return Err(parser.error("trailing tokens after expression"));
    }
    Ok(value)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Integer(i64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    LeftParen,
    RightParen,
}

fn tokenize(expression: &str) -> Result<Vec<Token>> {
    let bytes = expression.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b' ' | b'\t' | b'\r' | b'\n' => i += 1,
            b'0'..=b'9' => {
                let start = i;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                let text = &expression[start..i];
                let value = text.parse::<i64>().map_err(|e| {
                    evaluation_error(expression, format!("bad integer literal `{text}`: {e}"))
                })?;
                tokens.push(Token::Integer(value));
            }
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                tokens.push(Token::Identifier(expression[start..i].to_string()));
            }
            b'+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            b'-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            b'*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            b'/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            b'%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            b'(' => {
                tokens.push(Token::LeftParen);
                i += 1;
            }
            b')' => {
                tokens.push(Token::RightParen);
                i += 1;
            }
            b'=' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            b'!' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            b'!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            b'<' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            b'<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            b'>' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            b'>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            b'&' if bytes.get(i + 1) == Some(&b'&') => {
                tokens.push(Token::AndAnd);
                i += 2;
            }
            b'|' if bytes.get(i + 1) == Some(&b'|') => {
                tokens.push(Token::OrOr);
                i += 2;
            }
            _ => {
                return Err(evaluation_error(
                    expression,
                    format!("unexpected character `{}`", c as char),
                ));
            }
        }
    }
    if tokens.is_empty() {
        return Err(evaluation_error(expression, "empty expression".to_string()));
    }
    Ok(tokens)
}

fn evaluation_error(expression: &str, message: String) -> CrucibleError {
    CrucibleError::ExpressionEvaluation {
        expression: expression.to_string(),
        message,
    }
}

struct Parser<'a> {
    expression: &'a str,
    tokens: &'a [Token],
    position: usize,
    properties: &'a ShaderProperties,
    undefined: UndefinedBehavior,
}

impl Parser<'_> {
    fn error(&self, message: &str) -> CrucibleError {
        evaluation_error(self.expression, message.to_string())
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.position);
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<i64> {
        let mut value = self.parse_and()?;
        while self.eat(&Token::OrOr) {
            let rhs = self.parse_and()?;
            value = i64::from(value != 0 || rhs != 0);
        }
        Ok(value)
    }

    fn parse_and(&mut self) -> Result<i64> {
        let mut value = self.parse_cmp()?;
        while self.eat(&Token::AndAnd) {
            let rhs = self.parse_cmp()?;
            value = i64::from(value != 0 && rhs != 0);
        }
        Ok(value)
    }

    fn parse_cmp(&mut self) -> Result<i64> {
        let lhs = self.parse_add()?;
        let op = match self.peek() {
            Some(Token::Eq) => Token::Eq,
            Some(Token::Ne) => Token::Ne,
            Some(Token::Lt) => Token::Lt,
            Some(Token::Le) => Token::Le,
            Some(Token::Gt) => Token::Gt,
            Some(Token::Ge) => Token::Ge,
            _ => return Ok(lhs),
        };
        self.position += 1;
        let rhs = self.parse_add()?;
        let result = match op {
            Token::Eq => lhs == rhs,
            Token::Ne => lhs != rhs,
            Token::Lt => lhs < rhs,
            Token::Le => lhs <= rhs,
            Token::Gt => lhs > rhs,
            Token::Ge => lhs >= rhs,
            _ => unreachable!(),
        };
        Ok(i64::from(result))
    }

    fn parse_add(&mut self) -> Result<i64> {
        let mut value = self.parse_mul()?;
        loop {
            if self.eat(&Token::Plus) {
                value = value.wrapping_add(self.parse_mul()?);
            } else if self.eat(&Token::Minus) {
                value = value.wrapping_sub(self.parse_mul()?);
            } else {
                return Ok(value);
            }
        }
    }

    fn parse_mul(&mut self) -> Result<i64> {
        let mut value = self.parse_unary()?;
        loop {
            if self.eat(&Token::Star) {
                value = value.wrapping_mul(self.parse_unary()?);
            } else if self.eat(&Token::Slash) {
                let rhs = self.parse_unary()?;
                value = value
                    .checked_div(rhs)
                    .ok_or_else(|| self.error("division by zero or overflow"))?;
            } else if self.eat(&Token::Percent) {
                let rhs = self.parse_unary()?;
                value = value
                    .checked_rem(rhs)
                    .ok_or_else(|| self.error("modulo by zero or overflow"))?;
            } else {
                return Ok(value);
            }
        }
    }

    fn parse_unary(&mut self) -> Result<i64> {
        if self.eat(&Token::Not) {
            let value = self.parse_unary()?;
            Ok(i64::from(value == 0))
        } else if self.eat(&Token::Minus) {
            let value = self.parse_unary()?;
            value
                .checked_neg()
                .ok_or_else(|| self.error("negation overflow"))
        } else {
            self.parse_primary()
        }
    }

    fn parse_primary(&mut self) -> Result<i64> {
        match self.advance().cloned() {
            Some(Token::Integer(value)) => Ok(value),
            Some(Token::Identifier(name)) => {
                let id = ShaderPropertyId::from_name(&name);
                match self.properties.get_property_value(id) {
                    Some(value) => Ok(i64::from(value)),
                    None => match self.undefined {
                        UndefinedBehavior::Zero => Ok(0),
                        UndefinedBehavior::Error => {
                            Err(self.error(&format!("unknown shader property `{name}`")))
                        }
                    },
                }
            }
            Some(Token::LeftParen) => {
                let value = self.parse_or()?;
                if self.eat(&Token::RightParen) {
                    Ok(value)
                } else {
                    Err(self.error("missing closing parenthesis"))
                }
            }
            _ => Err(self.error("expected integer, identifier or parenthesized expression")),
        }
    }
}
