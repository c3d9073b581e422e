//! Recursive-descent parser for the safe expression evaluator.
//!
//! Grammar (low to high precedence):
//!   or_expr    := and_expr ("or" and_expr)*
//!   and_expr   := not_expr ("and" not_expr)*
//!   not_expr   := "not" not_expr | comparison
//!   comparison := arith (cmp_op arith)*
//!   arith      := unary (("+" | "-") unary)*
//!   unary      := "-" unary | postfix
//!   postfix    := atom (("." NAME) | "[" expr "]" | "(" args ")")*
//!   atom       := NUMBER | STRING | "True" | "False" | "None" | NAME
//!               | "[" list_items "]" | "{" dict_items "}" | "(" expr ")"

use super::ast::{ArithOp, BoolOp, CompareOp, Expr};
use crate::error::EvalError;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Symbol(&'static str),
    Eof,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    src: &'a str,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            chars: src.char_indices().peekable(),
            src,
        }
    }

    fn tokenize(mut self) -> Result<Vec<Token>, EvalError> {
        let mut tokens = Vec::new();
        while let Some(&(i, c)) = self.chars.peek() {
            if c.is_whitespace() {
                self.chars.next();
                continue;
            }
            if c.is_ascii_digit() {
                tokens.push(self.lex_number(i));
                continue;
            }
            if c == '"' || c == '\'' {
                tokens.push(self.lex_string(c)?);
                continue;
            }
            if c.is_alphabetic() || c == '_' {
                tokens.push(self.lex_ident(i));
                continue;
            }
            tokens.push(self.lex_symbol()?);
        }
        tokens.push(Token::Eof);
        Ok(tokens)
    }

    fn lex_number(&mut self, start: usize) -> Token {
        let mut end = start;
        while let Some(&(i, c)) = self.chars.peek() {
            if c.is_ascii_digit() || c == '.' {
                end = i + c.len_utf8();
                self.chars.next();
            } else {
                break;
            }
        }
        Token::Number(self.src[start..end].parse().unwrap_or(0.0))
    }

    fn lex_string(&mut self, quote: char) -> Result<Token, EvalError> {
        self.chars.next(); // consume opening quote
        let mut s = String::new();
        loop {
            match self.chars.next() {
                Some((_, '\\')) => {
                    if let Some((_, next)) = self.chars.next() {
                        s.push(match next {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                    }
                }
                Some((_, c)) if c == quote => return Ok(Token::Str(s)),
                Some((_, c)) => s.push(c),
                None => return Err(EvalError::Parse("unterminated string literal".to_string())),
            }
        }
    }

    fn lex_ident(&mut self, start: usize) -> Token {
        let mut end = start;
        while let Some(&(i, c)) = self.chars.peek() {
            if c.is_alphanumeric() || c == '_' {
                end = i + c.len_utf8();
                self.chars.next();
            } else {
                break;
            }
        }
        Token::Ident(self.src[start..end].to_string())
    }

    fn lex_symbol(&mut self) -> Result<Token, EvalError> {
        let (_, c) = self.chars.next().unwrap();
        let two_char = |this: &mut Self, expect: char, sym: &'static str, single: &'static str| {
            if this.chars.peek().map(|&(_, c)| c) == Some(expect) {
                this.chars.next();
                sym
            } else {
                single
            }
        };
        let sym = match c {
            '(' => "(",
            ')' => ")",
            '[' => "[",
            ']' => "]",
            '{' => "{",
            '}' => "}",
            ',' => ",",
            ':' => ":",
            '.' => ".",
            '+' => "+",
            '-' => "-",
            '=' => {
                if self.chars.peek().map(|&(_, c)| c) == Some('=') {
                    self.chars.next();
                    "=="
                } else {
                    return Err(EvalError::Parse("unexpected '='".to_string()));
                }
            }
            '!' => {
                if self.chars.peek().map(|&(_, c)| c) == Some('=') {
                    self.chars.next();
                    "!="
                } else {
                    return Err(EvalError::Parse("unexpected '!'".to_string()));
                }
            }
            '<' => two_char(self, '=', "<=", "<"),
            '>' => two_char(self, '=', ">=", ">"),
            other => return Err(EvalError::Parse(format!("unexpected character '{other}'"))),
        };
        Ok(Token::Symbol(sym))
    }
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

pub fn parse(src: &str) -> Result<Expr, EvalError> {
    let tokens = Lexer::new(src).tokenize()?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.peek() != &Token::Eof {
        return Err(EvalError::Parse("trailing input after expression".to_string()));
    }
    Ok(expr)
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn eat_symbol(&mut self, sym: &'static str) -> Result<(), EvalError> {
        if self.peek() == &Token::Symbol(sym) {
            self.advance();
            Ok(())
        } else {
            Err(EvalError::Parse(format!("expected '{sym}'")))
        }
    }

    fn is_ident(&self, name: &str) -> bool {
        matches!(self.peek(), Token::Ident(s) if s == name)
    }

    fn parse_or(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_and()?;
        while self.is_ident("or") {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::BoolOp(BoolOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_not()?;
        while self.is_ident("and") {
            self.advance();
            let rhs = self.parse_not()?;
            lhs = Expr::BoolOp(BoolOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr, EvalError> {
        if self.is_ident("not") {
            self.advance();
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_arith()?;
        loop {
            let op = if self.peek() == &Token::Symbol("==") {
                CompareOp::Eq
            } else if self.peek() == &Token::Symbol("!=") {
                CompareOp::NotEq
            } else if self.peek() == &Token::Symbol("<") {
                CompareOp::Lt
            } else if self.peek() == &Token::Symbol("<=") {
                CompareOp::LtE
            } else if self.peek() == &Token::Symbol(">") {
                CompareOp::Gt
            } else if self.peek() == &Token::Symbol(">=") {
                CompareOp::GtE
            } else if self.is_ident("in") {
                CompareOp::In
            } else if self.is_ident("not") && matches!(self.tokens.get(self.pos + 1), Some(Token::Ident(s)) if s == "in") {
                self.advance();
                CompareOp::NotIn
            } else {
                break;
            };
            self.advance();
            let rhs = self.parse_arith()?;
            lhs = Expr::Compare(Box::new(lhs), op, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_arith(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = if self.peek() == &Token::Symbol("+") {
                ArithOp::Add
            } else if self.peek() == &Token::Symbol("-") {
                ArithOp::Sub
            } else {
                break;
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::Arith(Box::new(lhs), op, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, EvalError> {
        if self.peek() == &Token::Symbol("-") {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, EvalError> {
        let mut expr = self.parse_atom()?;
        loop {
            match self.peek() {
                Token::Symbol(".") => {
                    self.advance();
                    let name = match self.advance() {
                        Token::Ident(s) => s,
                        _ => return Err(EvalError::Parse("expected attribute name".to_string())),
                    };
                    expr = Expr::Attribute(Box::new(expr), name);
                }
                Token::Symbol("[") => {
                    self.advance();
                    let index = self.parse_or()?;
                    self.eat_symbol("]")?;
                    expr = Expr::Subscript(Box::new(expr), Box::new(index));
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_atom(&mut self) -> Result<Expr, EvalError> {
        match self.advance() {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::Ident(name) => match name.as_str() {
                "True" => Ok(Expr::Bool(true)),
                "False" => Ok(Expr::Bool(false)),
                "None" => Ok(Expr::NoneLit),
                _ if self.peek() == &Token::Symbol("(") => {
                    self.advance();
                    let mut args = Vec::new();
                    if self.peek() != &Token::Symbol(")") {
                        args.push(self.parse_or()?);
                        while self.peek() == &Token::Symbol(",") {
                            self.advance();
                            args.push(self.parse_or()?);
                        }
                    }
                    self.eat_symbol(")")?;
                    Ok(Expr::Call(name, args))
                }
                _ => Ok(Expr::Name(name)),
            },
            Token::Symbol("(") => {
                let inner = self.parse_or()?;
                self.eat_symbol(")")?;
                Ok(inner)
            }
            Token::Symbol("[") => {
                let mut items = Vec::new();
                if self.peek() != &Token::Symbol("]") {
                    items.push(self.parse_or()?);
                    while self.peek() == &Token::Symbol(",") {
                        self.advance();
                        items.push(self.parse_or()?);
                    }
                }
                self.eat_symbol("]")?;
                Ok(Expr::List(items))
            }
            Token::Symbol("{") => {
                let mut items = Vec::new();
                if self.peek() != &Token::Symbol("}") {
                    loop {
                        let key = self.parse_or()?;
                        self.eat_symbol(":")?;
                        let value = self.parse_or()?;
                        items.push((key, value));
                        if self.peek() == &Token::Symbol(",") {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                self.eat_symbol("}")?;
                Ok(Expr::Dict(items))
            }
            other => Err(EvalError::Parse(format!("unexpected token {other:?}"))),
        }
    }
}
