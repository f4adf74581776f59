// Arithmetic expressions for {{expr: ...}} template blocks

//! # Expression Evaluator
//!
//! A small recursive-descent evaluator for arithmetic inside templates, for
//! example `{{expr: quantity * unit_price * (1 - discount)}}`.
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/' | '%') unary)*
//! unary   := '-' unary | primary
//! primary := number | variable | '(' expr ')'
//! ```
//!
//! Variables are dotted paths resolved by the caller (numbers or numeric
//! strings). This is deliberately not a general expression language: there
//! are no comparisons, functions or string operations.

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("Unexpected character '{0}' at position {1}")]
    UnexpectedChar(char, usize),

    #[error("Unexpected end of expression")]
    UnexpectedEnd,

    #[error("Unexpected token '{0}'")]
    UnexpectedToken(String),

    #[error("Invalid number '{0}'")]
    InvalidNumber(String),

    #[error("Unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("Variable '{0}' is not numeric")]
    NonNumericVariable(String),

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Modulo by zero")]
    ModuloByZero,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Number(n) => format_number(*n),
            Token::Ident(name) => name.clone(),
            Token::Plus => "+".to_string(),
            Token::Minus => "-".to_string(),
            Token::Star => "*".to_string(),
            Token::Slash => "/".to_string(),
            Token::Percent => "%".to_string(),
            Token::LParen => "(".to_string(),
            Token::RParen => ")".to_string(),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '+' => { tokens.push(Token::Plus); i += 1; }
            '-' => { tokens.push(Token::Minus); i += 1; }
            '*' => { tokens.push(Token::Star); i += 1; }
            '/' => { tokens.push(Token::Slash); i += 1; }
            '%' => { tokens.push(Token::Percent); i += 1; }
            '(' => { tokens.push(Token::LParen); i += 1; }
            ')' => { tokens.push(Token::RParen); i += 1; }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let number = literal
                    .parse::<f64>()
                    .map_err(|_| ExpressionError::InvalidNumber(literal.clone()))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(ExpressionError::UnexpectedChar(other, i)),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    resolve: &'a dyn Fn(&str) -> Option<Value>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> Result<f64, ExpressionError> {
        let mut value = self.term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    value += self.term()?;
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    value -= self.term()?;
                }
                _ => return Ok(value),
            }
        }
    }

    fn term(&mut self) -> Result<f64, ExpressionError> {
        let mut value = self.unary()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.pos += 1;
                    value *= self.unary()?;
                }
                Some(Token::Slash) => {
                    self.pos += 1;
                    let divisor = self.unary()?;
                    if divisor == 0.0 {
                        return Err(ExpressionError::DivisionByZero);
                    }
                    value /= divisor;
                }
                Some(Token::Percent) => {
                    self.pos += 1;
                    let divisor = self.unary()?;
                    if divisor == 0.0 {
                        return Err(ExpressionError::ModuloByZero);
                    }
                    value %= divisor;
                }
                _ => return Ok(value),
            }
        }
    }

    fn unary(&mut self) -> Result<f64, ExpressionError> {
        if let Some(Token::Minus) = self.peek() {
            self.pos += 1;
            return Ok(-self.unary()?);
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<f64, ExpressionError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(n),
            Some(Token::Ident(name)) => self.variable(&name),
            Some(Token::LParen) => {
                let value = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(value),
                    Some(other) => Err(ExpressionError::UnexpectedToken(other.describe())),
                    None => Err(ExpressionError::UnexpectedEnd),
                }
            }
            Some(other) => Err(ExpressionError::UnexpectedToken(other.describe())),
            None => Err(ExpressionError::UnexpectedEnd),
        }
    }

    fn variable(&self, name: &str) -> Result<f64, ExpressionError> {
        match (self.resolve)(name) {
            Some(Value::Number(n)) => n
                .as_f64()
                .ok_or_else(|| ExpressionError::NonNumericVariable(name.to_string())),
            Some(Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| ExpressionError::NonNumericVariable(name.to_string())),
            Some(_) => Err(ExpressionError::NonNumericVariable(name.to_string())),
            None => Err(ExpressionError::UnknownVariable(name.to_string())),
        }
    }
}

/// Evaluate an arithmetic expression, resolving variables with `resolve`
pub fn evaluate(input: &str, resolve: &dyn Fn(&str) -> Option<Value>) -> Result<f64, ExpressionError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ExpressionError::UnexpectedEnd);
    }

    let mut parser = Parser {
        tokens,
        pos: 0,
        resolve,
    };
    let value = parser.expr()?;

    match parser.peek() {
        None => Ok(value),
        Some(token) => Err(ExpressionError::UnexpectedToken(token.describe())),
    }
}

/// Render a result; integral values drop the fraction
pub fn format_number(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

/// Convert a result to JSON, integral values as integers
pub fn number_to_value(value: f64) -> Value {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        Value::from(value as i64)
    } else {
        serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_vars(_: &str) -> Option<Value> {
        None
    }

    #[test]
    fn test_precedence() {
        assert_eq!(evaluate("2 + 3 * 4", &no_vars).unwrap(), 14.0);
        assert_eq!(evaluate("(2 + 3) * 4", &no_vars).unwrap(), 20.0);
        assert_eq!(evaluate("10 - 4 - 3", &no_vars).unwrap(), 3.0);
        assert_eq!(evaluate("-2 * -3 + 10 % 4", &no_vars).unwrap(), 8.0);
    }

    #[test]
    fn test_division_by_zero() {
        assert_eq!(evaluate("5 / 0", &no_vars), Err(ExpressionError::DivisionByZero));
        assert_eq!(evaluate("5 % (2 - 2)", &no_vars), Err(ExpressionError::ModuloByZero));
    }

    #[test]
    fn test_variables() {
        let resolve = |name: &str| match name {
            "quantity" => Some(json!(3)),
            "order.price" => Some(json!("2.5")),
            "customer" => Some(json!("Acme")),
            _ => None,
        };

        assert_eq!(evaluate("quantity * order.price", &resolve).unwrap(), 7.5);
        assert_eq!(
            evaluate("quantity * missing", &resolve),
            Err(ExpressionError::UnknownVariable("missing".to_string()))
        );
        assert_eq!(
            evaluate("customer + 1", &resolve),
            Err(ExpressionError::NonNumericVariable("customer".to_string()))
        );
    }

    #[test]
    fn test_malformed_input() {
        assert!(evaluate("(1 + 2", &no_vars).is_err());
        assert!(evaluate("1 +", &no_vars).is_err());
        assert!(evaluate("1 2", &no_vars).is_err());
        assert!(evaluate("1 $ 2", &no_vars).is_err());
        assert!(evaluate("", &no_vars).is_err());
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(14.0), "14");
        assert_eq!(format_number(7.5), "7.5");
        assert_eq!(number_to_value(-3.0), json!(-3));
    }
}
