//! Formula tokenizer and recursive-descent parser.
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/') unary)*
//! unary   := '-' unary | primary
//! primary := number | name | quoted-name | '(' expr ')'
//! ```

use super::{FormulaExpr, FormulaOp};
use crate::errors::DomainError;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(String),
    Name(String),
    Op(char),
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, DomainError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let start = i;
        match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '+' | '-' | '*' | '/' => {
                tokens.push((Token::Op(c), start));
                i += 1;
            }
            '(' => {
                tokens.push((Token::LParen, start));
                i += 1;
            }
            ')' => {
                tokens.push((Token::RParen, start));
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                i += 1;
                let mut name = String::new();
                while i < chars.len() && chars[i] != quote {
                    name.push(chars[i]);
                    i += 1;
                }
                if i == chars.len() {
                    return Err(DomainError::invalid(format!(
                        "The formula is missing a closing quote for {}{}.",
                        quote, name
                    )));
                }
                i += 1;
                tokens.push((Token::Name(name), start));
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut number = String::new();
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    number.push(chars[i]);
                    i += 1;
                }
                if number.parse::<f64>().is_err() {
                    return Err(DomainError::invalid(format!(
                        "'{}' is not a valid number in the formula.",
                        number
                    )));
                }
                tokens.push((Token::Number(number), start));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut name = String::new();
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    name.push(chars[i]);
                    i += 1;
                }
                tokens.push((Token::Name(name), start));
            }
            other => {
                return Err(DomainError::invalid(format!(
                    "The formula contains an unexpected character '{}' at position {}.",
                    other, start
                )))
            }
        }
    }
    Ok(tokens)
}

pub(super) struct FormulaParser {
    tokens: Vec<(Token, usize)>,
    position: usize,
}

impl FormulaParser {
    pub(super) fn parse(input: &str) -> Result<FormulaExpr, DomainError> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(DomainError::invalid("Formula can't be blank."));
        }
        let mut parser = FormulaParser {
            tokens,
            position: 0,
        };
        let expr = parser.parse_expr()?;
        if let Some((token, offset)) = parser.tokens.get(parser.position) {
            return Err(DomainError::invalid(format!(
                "Unexpected {} at position {} in the formula.",
                describe(token),
                offset
            )));
        }
        Ok(expr)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position).map(|(t, _)| t)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).map(|(t, _)| t.clone());
        self.position += 1;
        token
    }

    fn parse_expr(&mut self) -> Result<FormulaExpr, DomainError> {
        let mut left = self.parse_term()?;
        while let Some(Token::Op(c @ ('+' | '-'))) = self.peek() {
            let op = if *c == '+' {
                FormulaOp::Add
            } else {
                FormulaOp::Subtract
            };
            self.advance();
            let right = self.parse_term()?;
            left = FormulaExpr::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<FormulaExpr, DomainError> {
        let mut left = self.parse_unary()?;
        while let Some(Token::Op(c @ ('*' | '/'))) = self.peek() {
            let op = if *c == '*' {
                FormulaOp::Multiply
            } else {
                FormulaOp::Divide
            };
            self.advance();
            let right = self.parse_unary()?;
            left = FormulaExpr::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<FormulaExpr, DomainError> {
        if let Some(Token::Op('-')) = self.peek() {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(FormulaExpr::Negate(Box::new(operand)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<FormulaExpr, DomainError> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(FormulaExpr::Number(n)),
            Some(Token::Name(name)) => Ok(FormulaExpr::Property(name)),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(DomainError::invalid(
                        "The formula is missing a closing parenthesis.",
                    )),
                }
            }
            Some(token) => Err(DomainError::invalid(format!(
                "Unexpected {} in the formula.",
                describe(&token)
            ))),
            None => Err(DomainError::invalid(
                "The formula ends where a value was expected.",
            )),
        }
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Number(n) => format!("number {}", n),
        Token::Name(n) => format!("name '{}'", n),
        Token::Op(c) => format!("operator '{}'", c),
        Token::LParen => "'('".to_string(),
        Token::RParen => "')'".to_string(),
    }
}
