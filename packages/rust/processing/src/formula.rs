//! Arithmetic formulas for the `calculate` transform.
//!
//! Grammar (no functions, no assignment, nothing else):
//!
//! ```text
//! expr   := term (('+' | '-') term)*
//! term   := unary (('*' | '/' | '%') unary)*
//! unary  := '-' unary | atom
//! atom   := number | field | '(' expr ')'
//! field  := ident ('.' ident)* | '{' any text except '}' '}'
//! ```

use siteflow_shared::Record;

use crate::path::{as_number, lookup};

/// Deepest run of parentheses and unary minus a formula may nest.
const MAX_DEPTH: usize = 64;
/// Longest formula, in tokens. Bounds left-leaning operator chains.
const MAX_TOKENS: usize = 512;

/// A parsed formula.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    root: Expr,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Num(f64),
    Field(String),
    Neg(Box<Expr>),
    Bin(Op, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Field(String),
    Op(char),
    Open,
    Close,
}

impl Formula {
    pub fn parse(source: &str) -> Result<Self, String> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err("empty formula".into());
        }
        if tokens.len() > MAX_TOKENS {
            return Err(format!("formula longer than {MAX_TOKENS} tokens"));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let root = parser.expr()?;
        if let Some(extra) = parser.tokens.get(parser.pos) {
            return Err(format!("unexpected {extra:?} in formula '{source}'"));
        }
        Ok(Self { root })
    }

    /// Evaluate against a record. `None` when a referenced field is missing
    /// or non-numeric, on division by zero, or for non-finite results.
    pub fn eval(&self, record: &Record) -> Option<f64> {
        eval(&self.root, record).filter(|n| n.is_finite())
    }
}

fn eval(expr: &Expr, record: &Record) -> Option<f64> {
    match expr {
        Expr::Num(n) => Some(*n),
        Expr::Field(path) => lookup(record, path).and_then(as_number),
        Expr::Neg(inner) => eval(inner, record).map(|n| -n),
        Expr::Bin(op, lhs, rhs) => {
            let (a, b) = (eval(lhs, record)?, eval(rhs, record)?);
            match op {
                Op::Add => Some(a + b),
                Op::Sub => Some(a - b),
                Op::Mul => Some(a * b),
                Op::Div | Op::Rem if b == 0.0 => None,
                Op::Div => Some(a / b),
                Op::Rem => Some(a % b),
            }
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '0'..='9' | '.' => {
                let mut end = start;
                while let Some(&(i, d)) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        end = i + d.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let literal = &source[start..end];
                let n = literal
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{literal}'"))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut end = start;
                while let Some(&(i, d)) = chars.peek() {
                    if d.is_alphanumeric() || d == '_' || d == '.' {
                        end = i + d.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Field(source[start..end].to_string()));
            }
            '{' => {
                chars.next();
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some((_, '}')) => break,
                        Some((_, d)) => name.push(d),
                        None => return Err("unterminated '{' in formula".into()),
                    }
                }
                let name = name.trim();
                if name.is_empty() {
                    return Err("empty field reference '{}'".into());
                }
                tokens.push(Token::Field(name.to_string()));
            }
            '+' | '-' | '*' | '/' | '%' => {
                chars.next();
                tokens.push(Token::Op(c));
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            other => return Err(format!("unexpected character '{other}' in formula")),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn nested(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<Expr, String>,
    ) -> Result<Expr, String> {
        if self.depth >= MAX_DEPTH {
            return Err("formula nested too deeply".into());
        }
        self.depth += 1;
        let parsed = parse(self);
        self.depth -= 1;
        parsed
    }

    fn expr(&mut self) -> Result<Expr, String> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(c @ ('+' | '-'))) = self.peek() {
            let op = if *c == '+' { Op::Add } else { Op::Sub };
            self.pos += 1;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(self.term()?));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, String> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(c @ ('*' | '/' | '%'))) = self.peek() {
            let op = match c {
                '*' => Op::Mul,
                '/' => Op::Div,
                _ => Op::Rem,
            };
            self.pos += 1;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(self.unary()?));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if let Some(Token::Op('-')) = self.peek() {
            self.pos += 1;
            return Ok(Expr::Neg(Box::new(self.nested(Self::unary)?)));
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Expr::Num(n)),
            Some(Token::Field(name)) => Ok(Expr::Field(name)),
            Some(Token::Open) => {
                let inner = self.nested(Self::expr)?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err("missing ')' in formula".into()),
                }
            }
            Some(other) => Err(format!("unexpected {other:?} in formula")),
            None => Err("formula ends unexpectedly".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> Record {
        json!({
            "price": 20,
            "qty": "3",
            "discount": 0.25,
            "unit price": 4,
            "seller": {"fee": 2},
            "name": "widget"
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn eval_str(source: &str) -> Option<f64> {
        Formula::parse(source).unwrap().eval(&record())
    }

    #[test]
    fn precedence_and_grouping() {
        assert_eq!(eval_str("1 + 2 * 3"), Some(7.0));
        assert_eq!(eval_str("(1 + 2) * 3"), Some(9.0));
        assert_eq!(eval_str("10 - 4 - 3"), Some(3.0));
        assert_eq!(eval_str("7 % 4"), Some(3.0));
        assert_eq!(eval_str("-2 * -(3 + 1)"), Some(8.0));
    }

    #[test]
    fn field_references() {
        assert_eq!(eval_str("price * qty"), Some(60.0));
        assert_eq!(eval_str("price * (1 - discount) + seller.fee"), Some(17.0));
        assert_eq!(eval_str("{unit price} * 2"), Some(8.0));
    }

    #[test]
    fn unusable_values_yield_none() {
        assert_eq!(eval_str("name * 2"), None);
        assert_eq!(eval_str("missing + 1"), None);
        assert_eq!(eval_str("price / 0"), None);
        assert_eq!(eval_str("price % (qty - 3)"), None);
    }

    #[test]
    fn rejects_anything_but_arithmetic() {
        for source in [
            "",
            "1 +",
            "(1 + 2",
            "price; drop",
            "alert('x')",
            "process.exit()",
            "1 2",
            "a = 3",
            "{}",
        ] {
            assert!(Formula::parse(source).is_err(), "{source:?} should not parse");
        }
    }

    #[test]
    fn deep_nesting_is_rejected_not_overflowed() {
        let parens = format!("{}1{}", "(".repeat(100_000), ")".repeat(100_000));
        assert_eq!(Formula::parse(&parens).unwrap_err(), "formula longer than 512 tokens");

        let negations = format!("{}1", "-".repeat(100));
        assert_eq!(Formula::parse(&negations).unwrap_err(), "formula nested too deeply");
        let parens = format!("{}1{}", "(".repeat(65), ")".repeat(65));
        assert_eq!(Formula::parse(&parens).unwrap_err(), "formula nested too deeply");

        let chain = vec!["price"; 300].join(" + ");
        assert!(Formula::parse(&chain).is_err());

        let within = format!("{}price{}", "(".repeat(64), ")".repeat(64));
        assert_eq!(eval_str(&within), Some(20.0));
        assert_eq!(eval_str(&format!("{}2", "-".repeat(64))), Some(2.0));
    }
}
