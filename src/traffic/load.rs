//! Poisson load expressions.
//!
//! A load is written as a fraction of the link rate, e.g. `"0.5"` or
//! `"3/8"`. Only numbers, `+ - * /`, unary minus and parentheses are
//! accepted.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LoadError {
    #[error("unexpected '{0}' at offset {1}")]
    Unexpected(char, usize),
    #[error("expression ends early")]
    End,
    #[error("invalid number '{0}'")]
    Number(String),
    #[error("division by zero")]
    DivByZero,
    #[error("expression nests deeper than {MAX_DEPTH} levels")]
    TooDeep,
    #[error("load evaluates to {0}, which is not a non-negative number")]
    OutOfRange(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadExpr {
    Num(f64),
    Neg(Box<LoadExpr>),
    Bin(Op, Box<LoadExpr>, Box<LoadExpr>),
}

impl LoadExpr {
    pub fn eval(&self) -> Result<f64, LoadError> {
        Ok(match self {
            LoadExpr::Num(n) => *n,
            LoadExpr::Neg(e) => -e.eval()?,
            LoadExpr::Bin(op, l, r) => {
                let (l, r) = (l.eval()?, r.eval()?);
                match op {
                    Op::Add => l + r,
                    Op::Sub => l - r,
                    Op::Mul => l * r,
                    Op::Div if r == 0.0 => return Err(LoadError::DivByZero),
                    Op::Div => l / r,
                }
            }
        })
    }

    /// Offered load in whole Mbit/s on a link of `rate_mbps`, truncated.
    pub fn mbps(&self, rate_mbps: u32) -> Result<u64, LoadError> {
        let load = self.eval()? * f64::from(rate_mbps);
        if !load.is_finite() || load < 0.0 {
            return Err(LoadError::OutOfRange(load));
        }
        Ok(load.trunc() as u64)
    }
}

impl FromStr for LoadExpr {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parser = Parser {
            src: s.as_bytes(),
            pos: 0,
            depth: 0,
        };
        let expr = parser.expr()?;
        parser.skip_ws();
        match parser.peek() {
            None => Ok(expr),
            Some(c) => Err(LoadError::Unexpected(c as char, parser.pos)),
        }
    }
}

impl fmt::Display for LoadExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadExpr::Num(n) => write!(f, "{n}"),
            LoadExpr::Neg(e) => write!(f, "-({e})"),
            LoadExpr::Bin(op, l, r) => {
                let op = match op {
                    Op::Add => '+',
                    Op::Sub => '-',
                    Op::Mul => '*',
                    Op::Div => '/',
                };
                write!(f, "({l} {op} {r})")
            }
        }
    }
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
    depth: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|c| c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn expr(&mut self) -> Result<LoadExpr, LoadError> {
        let mut lhs = self.term()?;
        loop {
            self.skip_ws();
            let op = match self.peek() {
                Some(b'+') => Op::Add,
                Some(b'-') => Op::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = LoadExpr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn term(&mut self) -> Result<LoadExpr, LoadError> {
        let mut lhs = self.factor()?;
        loop {
            self.skip_ws();
            let op = match self.peek() {
                Some(b'*') => Op::Mul,
                Some(b'/') => Op::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.factor()?;
            lhs = LoadExpr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn factor(&mut self) -> Result<LoadExpr, LoadError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(LoadError::TooDeep);
        }
        self.skip_ws();
        let result = match self.peek() {
            None => Err(LoadError::End),
            Some(b'-') => {
                self.pos += 1;
                self.factor().map(|e| LoadExpr::Neg(Box::new(e)))
            }
            Some(b'+') => {
                self.pos += 1;
                self.factor()
            }
            Some(b'(') => {
                self.pos += 1;
                let inner = self.expr()?;
                self.skip_ws();
                match self.peek() {
                    Some(b')') => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    Some(c) => Err(LoadError::Unexpected(c as char, self.pos)),
                    None => Err(LoadError::End),
                }
            }
            Some(c) if c.is_ascii_digit() || c == b'.' => self.number(),
            Some(c) => Err(LoadError::Unexpected(c as char, self.pos)),
        };
        self.depth -= 1;
        result
    }

    fn number(&mut self) -> Result<LoadExpr, LoadError> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_digit() || c == b'.')
        {
            self.pos += 1;
        }
        let text = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        text.parse()
            .map(LoadExpr::Num)
            .map_err(|_| LoadError::Number(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(s: &str) -> Result<f64, LoadError> {
        s.parse::<LoadExpr>()?.eval()
    }

    #[test]
    fn fractions_of_link_rate() {
        assert_eq!(eval("0.5").unwrap(), 0.5);
        assert_eq!(eval("3/8").unwrap(), 0.375);
        assert_eq!(eval(" 1 - 2 * 0.25 ").unwrap(), 0.5);
        assert_eq!(eval("(1 + 1) / 4").unwrap(), 0.5);
        assert_eq!(eval("-(-1)").unwrap(), 1.0);
    }

    #[test]
    fn load_is_truncated_against_rate() {
        let expr: LoadExpr = "1/3".parse().unwrap();
        assert_eq!(expr.mbps(96).unwrap(), 32);
        let expr: LoadExpr = "0.7".parse().unwrap();
        // 0.7 * 96 = 67.19..
        assert_eq!(expr.mbps(96).unwrap(), 67);
    }

    #[test]
    fn rejects_anything_but_arithmetic() {
        assert!(matches!(
            eval("__import__('os')"),
            Err(LoadError::Unexpected('_', 0))
        ));
        assert!(matches!(eval("1 +"), Err(LoadError::End)));
        assert!(matches!(eval("(1"), Err(LoadError::End)));
        assert!(matches!(eval("1 2"), Err(LoadError::Unexpected('2', 2))));
        assert!(matches!(eval("1..2"), Err(LoadError::Number(_))));
        assert!(matches!(eval("1/0"), Err(LoadError::DivByZero)));
    }

    #[test]
    fn deep_nesting_is_bounded() {
        let deep = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        assert!(matches!(eval(&deep), Err(LoadError::TooDeep)));
    }

    #[test]
    fn negative_load_is_out_of_range() {
        let expr: LoadExpr = "0 - 0.5".parse().unwrap();
        assert!(matches!(expr.mbps(10), Err(LoadError::OutOfRange(_))));
    }
}
