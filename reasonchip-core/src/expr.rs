//! Expression Evaluator.
//!
//! Two entry points: [`evaluate_predicate`] (boolean context, used by
//! `when`/`assert`/`loop`) and [`interpolate`] (string-template context,
//! used by `params`/`variables`/interpolated scalars). Expressions are
//! parsed by a small recursive-descent parser over a fixed, safe grammar —
//! no host-language reflection, no I/O, no module imports. A narrow grammar
//! over a fixed builtin allowlist is deliberate: embedding a general
//! dynamic-language interpreter here would make input pipelines a code
//! execution surface.

use crate::context::VariableContext;
use crate::error::{EvaluationError, ReasonChipError};
use crate::value::Value;
use std::collections::BTreeMap;

const DEFAULT_RECURSION_LIMIT: usize = 64;

// ─────────────────────────────── Tokenizer ───────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    Dot,
    Comma,
    Colon,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
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

    fn tokenize(mut self) -> Result<Vec<Tok>, String> {
        let mut toks = Vec::new();
        loop {
            self.skip_ws();
            let Some(&(i, c)) = self.chars.peek() else {
                toks.push(Tok::Eof);
                return Ok(toks);
            };
            match c {
                '+' => {
                    self.chars.next();
                    toks.push(Tok::Plus);
                }
                '-' => {
                    self.chars.next();
                    toks.push(Tok::Minus);
                }
                '*' => {
                    self.chars.next();
                    toks.push(Tok::Star);
                }
                '/' => {
                    self.chars.next();
                    toks.push(Tok::Slash);
                }
                '%' => {
                    self.chars.next();
                    toks.push(Tok::Percent);
                }
                '.' => {
                    self.chars.next();
                    toks.push(Tok::Dot);
                }
                ',' => {
                    self.chars.next();
                    toks.push(Tok::Comma);
                }
                ':' => {
                    self.chars.next();
                    toks.push(Tok::Colon);
                }
                '(' => {
                    self.chars.next();
                    toks.push(Tok::LParen);
                }
                ')' => {
                    self.chars.next();
                    toks.push(Tok::RParen);
                }
                '[' => {
                    self.chars.next();
                    toks.push(Tok::LBracket);
                }
                ']' => {
                    self.chars.next();
                    toks.push(Tok::RBracket);
                }
                '{' => {
                    self.chars.next();
                    toks.push(Tok::LBrace);
                }
                '}' => {
                    self.chars.next();
                    toks.push(Tok::RBrace);
                }
                '=' => {
                    self.chars.next();
                    self.expect_char('=')?;
                    toks.push(Tok::EqEq);
                }
                '!' => {
                    self.chars.next();
                    if self.peek_char() == Some('=') {
                        self.chars.next();
                        toks.push(Tok::NotEq);
                    } else {
                        toks.push(Tok::Not);
                    }
                }
                '<' => {
                    self.chars.next();
                    if self.peek_char() == Some('=') {
                        self.chars.next();
                        toks.push(Tok::Le);
                    } else {
                        toks.push(Tok::Lt);
                    }
                }
                '>' => {
                    self.chars.next();
                    if self.peek_char() == Some('=') {
                        self.chars.next();
                        toks.push(Tok::Ge);
                    } else {
                        toks.push(Tok::Gt);
                    }
                }
                '&' => {
                    self.chars.next();
                    self.expect_char('&')?;
                    toks.push(Tok::And);
                }
                '|' => {
                    self.chars.next();
                    self.expect_char('|')?;
                    toks.push(Tok::Or);
                }
                '"' | '\'' => {
                    toks.push(Tok::Str(self.read_string(c)?));
                }
                _ if c.is_ascii_digit() => {
                    toks.push(self.read_number());
                }
                _ if c.is_alphabetic() || c == '_' => {
                    let word = self.read_ident();
                    toks.push(match word.as_str() {
                        "and" => Tok::And,
                        "or" => Tok::Or,
                        "not" => Tok::Not,
                        _ => Tok::Ident(word),
                    });
                }
                other => return Err(format!("unexpected character `{other}` at byte {i}")),
            }
            let _ = self.src;
        }
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn expect_char(&mut self, expected: char) -> Result<(), String> {
        match self.chars.next() {
            Some((_, c)) if c == expected => Ok(()),
            _ => Err(format!("expected `{expected}`")),
        }
    }

    fn skip_ws(&mut self) {
        while let Some(&(_, c)) = self.chars.peek() {
            if c.is_whitespace() {
                self.chars.next();
            } else {
                break;
            }
        }
    }

    fn read_string(&mut self, quote: char) -> Result<String, String> {
        self.chars.next(); // opening quote
        let mut s = String::new();
        loop {
            match self.chars.next() {
                Some((_, c)) if c == quote => return Ok(s),
                Some((_, '\\')) => match self.chars.next() {
                    Some((_, 'n')) => s.push('\n'),
                    Some((_, 't')) => s.push('\t'),
                    Some((_, c2)) => s.push(c2),
                    None => return Err("unterminated escape".to_string()),
                },
                Some((_, c)) => s.push(c),
                None => return Err("unterminated string literal".to_string()),
            }
        }
    }

    fn read_number(&mut self) -> Tok {
        let mut s = String::new();
        let mut is_float = false;
        while let Some(&(_, c)) = self.chars.peek() {
            if c.is_ascii_digit() {
                s.push(c);
                self.chars.next();
            } else if c == '.' && !is_float {
                is_float = true;
                s.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        if is_float {
            Tok::Float(s.parse().unwrap_or(0.0))
        } else {
            Tok::Int(s.parse().unwrap_or(0))
        }
    }

    fn read_ident(&mut self) -> String {
        let mut s = String::new();
        while let Some(&(_, c)) = self.chars.peek() {
            if c.is_alphanumeric() || c == '_' {
                s.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        s
    }
}

// ─────────────────────────────── AST ─────────────────────────────────────

#[derive(Debug, Clone)]
enum PathSeg {
    Field(String),
    Index(Box<Ast>),
}

#[derive(Debug, Clone)]
enum Ast {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Ast>),
    Dict(Vec<(Ast, Ast)>),
    Path(String, Vec<PathSeg>),
    Not(Box<Ast>),
    Neg(Box<Ast>),
    And(Box<Ast>, Box<Ast>),
    Or(Box<Ast>, Box<Ast>),
    Cmp(CmpOp, Box<Ast>, Box<Ast>),
    Arith(ArithOp, Box<Ast>, Box<Ast>),
    Call(String, Vec<Ast>),
}

#[derive(Debug, Clone, Copy)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy)]
enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

// ─────────────────────────────── Parser ──────────────────────────────────

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn new(toks: Vec<Tok>) -> Self {
        Self { toks, pos: 0 }
    }

    fn peek(&self) -> &Tok {
        &self.toks[self.pos]
    }

    fn advance(&mut self) -> Tok {
        let t = self.toks[self.pos].clone();
        if self.pos + 1 < self.toks.len() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, t: &Tok) -> Result<(), String> {
        if self.peek() == t {
            self.advance();
            Ok(())
        } else {
            Err(format!("expected {t:?}, found {:?}", self.peek()))
        }
    }

    fn parse_expr(&mut self) -> Result<Ast, String> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Ast, String> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Tok::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Ast::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Ast, String> {
        let mut left = self.parse_not()?;
        while matches!(self.peek(), Tok::And) {
            self.advance();
            let right = self.parse_not()?;
            left = Ast::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Ast, String> {
        if matches!(self.peek(), Tok::Not) {
            self.advance();
            let inner = self.parse_not()?;
            Ok(Ast::Not(Box::new(inner)))
        } else {
            self.parse_cmp()
        }
    }

    fn parse_cmp(&mut self) -> Result<Ast, String> {
        let left = self.parse_add()?;
        let op = match self.peek() {
            Tok::EqEq => CmpOp::Eq,
            Tok::NotEq => CmpOp::Ne,
            Tok::Lt => CmpOp::Lt,
            Tok::Le => CmpOp::Le,
            Tok::Gt => CmpOp::Gt,
            Tok::Ge => CmpOp::Ge,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_add()?;
        Ok(Ast::Cmp(op, Box::new(left), Box::new(right)))
    }

    fn parse_add(&mut self) -> Result<Ast, String> {
        let mut left = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Tok::Plus => ArithOp::Add,
                Tok::Minus => ArithOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_mul()?;
            left = Ast::Arith(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_mul(&mut self) -> Result<Ast, String> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Tok::Star => ArithOp::Mul,
                Tok::Slash => ArithOp::Div,
                Tok::Percent => ArithOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Ast::Arith(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Ast, String> {
        if matches!(self.peek(), Tok::Minus) {
            self.advance();
            Ok(Ast::Neg(Box::new(self.parse_unary()?)))
        } else {
            self.parse_postfix()
        }
    }

    fn parse_postfix(&mut self) -> Result<Ast, String> {
        let mut base = self.parse_primary()?;
        loop {
            match self.peek() {
                Tok::Dot => {
                    self.advance();
                    let Tok::Ident(name) = self.advance() else {
                        return Err("expected field name after `.`".to_string());
                    };
                    base = match base {
                        Ast::Path(root, mut segs) => {
                            segs.push(PathSeg::Field(name));
                            Ast::Path(root, segs)
                        }
                        other => return Err(format!("cannot access field on {other:?}")),
                    };
                }
                Tok::LBracket => {
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(&Tok::RBracket)?;
                    base = match base {
                        Ast::Path(root, mut segs) => {
                            segs.push(PathSeg::Index(Box::new(index)));
                            Ast::Path(root, segs)
                        }
                        other => return Err(format!("cannot index {other:?}")),
                    };
                }
                _ => break,
            }
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Ast, String> {
        match self.advance() {
            Tok::Int(n) => Ok(Ast::Int(n)),
            Tok::Float(f) => Ok(Ast::Float(f)),
            Tok::Str(s) => Ok(Ast::Str(s)),
            Tok::LParen => {
                let e = self.parse_expr()?;
                self.expect(&Tok::RParen)?;
                Ok(e)
            }
            Tok::LBracket => {
                let mut items = Vec::new();
                if !matches!(self.peek(), Tok::RBracket) {
                    items.push(self.parse_expr()?);
                    while matches!(self.peek(), Tok::Comma) {
                        self.advance();
                        items.push(self.parse_expr()?);
                    }
                }
                self.expect(&Tok::RBracket)?;
                Ok(Ast::List(items))
            }
            Tok::LBrace => {
                let mut items = Vec::new();
                if !matches!(self.peek(), Tok::RBrace) {
                    loop {
                        let k = self.parse_expr()?;
                        self.expect(&Tok::Colon)?;
                        let v = self.parse_expr()?;
                        items.push((k, v));
                        if matches!(self.peek(), Tok::Comma) {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(&Tok::RBrace)?;
                Ok(Ast::Dict(items))
            }
            Tok::Ident(name) => match name.as_str() {
                "true" | "True" => Ok(Ast::Bool(true)),
                "false" | "False" => Ok(Ast::Bool(false)),
                "null" | "None" | "nil" => Ok(Ast::Null),
                _ => {
                    if matches!(self.peek(), Tok::LParen) {
                        self.advance();
                        let mut args = Vec::new();
                        if !matches!(self.peek(), Tok::RParen) {
                            args.push(self.parse_expr()?);
                            while matches!(self.peek(), Tok::Comma) {
                                self.advance();
                                args.push(self.parse_expr()?);
                            }
                        }
                        self.expect(&Tok::RParen)?;
                        Ok(Ast::Call(name, args))
                    } else {
                        Ok(Ast::Path(name, Vec::new()))
                    }
                }
            },
            other => Err(format!("unexpected token {other:?}")),
        }
    }
}

fn parse(src: &str) -> Result<Ast, String> {
    let toks = Lexer::new(src).tokenize()?;
    let mut p = Parser::new(toks);
    let ast = p.parse_expr()?;
    if !matches!(p.peek(), Tok::Eof) {
        return Err(format!("trailing tokens starting at {:?}", p.peek()));
    }
    Ok(ast)
}

// ─────────────────────────────── Builtins ────────────────────────────────

const BUILTINS: &[&str] = &[
    "abs", "min", "max", "sum", "round", "pow", "len", "int", "float", "str", "bool", "list",
    "tuple", "dict", "sorted", "reversed", "enumerate", "range", "all", "any", "repr", "format",
    "type", "isinstance", "iter", "next", "escape", "unescape",
];

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Int(n) => Some(*n as f64),
        Value::Float(f) => Some(*f),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn call_builtin(name: &str, args: Vec<Value>) -> Result<Value, String> {
    match name {
        "abs" => {
            let v = args.first().ok_or("abs() takes 1 argument")?;
            match v {
                Value::Int(n) => Ok(Value::Int(n.abs())),
                _ => Ok(Value::Float(as_f64(v).ok_or("abs() needs a number")?.abs())),
            }
        }
        "min" | "max" => {
            let items: Vec<&Value> = if args.len() == 1 {
                args[0].as_sequence().ok_or("expects an iterable")?.iter().collect()
            } else {
                args.iter().collect()
            };
            let mut best = items.first().ok_or("empty sequence")?;
            for item in &items[1..] {
                let a = as_f64(item).unwrap_or(f64::NAN);
                let b = as_f64(best).unwrap_or(f64::NAN);
                let take = if name == "min" { a < b } else { a > b };
                if take {
                    best = item;
                }
            }
            Ok((*best).clone())
        }
        "sum" => {
            let items = args.first().ok_or("sum() takes 1 argument")?.as_sequence().ok_or("sum() needs a sequence")?;
            let mut acc = 0.0;
            let mut all_int = true;
            for it in items {
                acc += as_f64(it).ok_or("sum() needs numbers")?;
                if !matches!(it, Value::Int(_)) {
                    all_int = false;
                }
            }
            Ok(if all_int { Value::Int(acc as i64) } else { Value::Float(acc) })
        }
        "round" => {
            let v = as_f64(args.first().ok_or("round() takes 1 argument")?).ok_or("round() needs a number")?;
            let digits = args.get(1).and_then(|d| match d {
                Value::Int(n) => Some(*n as i32),
                _ => None,
            }).unwrap_or(0);
            let factor = 10f64.powi(digits);
            let rounded = (v * factor).round() / factor;
            Ok(if digits <= 0 { Value::Int(rounded as i64) } else { Value::Float(rounded) })
        }
        "pow" => {
            let base = as_f64(args.first().ok_or("pow() takes 2 arguments")?).ok_or("pow() needs a number")?;
            let exp = as_f64(args.get(1).ok_or("pow() takes 2 arguments")?).ok_or("pow() needs a number")?;
            Ok(Value::Float(base.powf(exp)))
        }
        "len" => {
            let v = args.first().ok_or("len() takes 1 argument")?;
            let n = match v {
                Value::Str(s) => s.chars().count(),
                Value::Sequence(s) => s.len(),
                Value::Mapping(m) => m.len(),
                Value::Bytes(b) => b.len(),
                _ => return Err("len() needs a sized value".to_string()),
            };
            Ok(Value::Int(n as i64))
        }
        "int" => {
            let v = args.first().ok_or("int() takes 1 argument")?;
            match v {
                Value::Str(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| "cannot parse int".to_string()),
                other => Ok(Value::Int(as_f64(other).ok_or("cannot convert to int")? as i64)),
            }
        }
        "float" => {
            let v = args.first().ok_or("float() takes 1 argument")?;
            match v {
                Value::Str(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| "cannot parse float".to_string()),
                other => Ok(Value::Float(as_f64(other).ok_or("cannot convert to float")?)),
            }
        }
        "str" | "repr" | "format" => {
            let v = args.first().ok_or("takes 1 argument")?;
            Ok(Value::Str(v.stringify()))
        }
        "bool" => {
            let v = args.first().ok_or("bool() takes 1 argument")?;
            Ok(Value::Bool(v.is_truthy()))
        }
        "list" | "tuple" => {
            let v = args.first().ok_or("takes 1 argument")?;
            match v {
                Value::Sequence(s) => Ok(Value::Sequence(s.clone())),
                Value::Str(s) => Ok(Value::Sequence(s.chars().map(|c| Value::Str(c.to_string())).collect())),
                _ => Err("cannot convert to list".to_string()),
            }
        }
        "dict" => {
            let v = args.first().ok_or("dict() takes 1 argument")?;
            match v {
                Value::Mapping(m) => Ok(Value::Mapping(m.clone())),
                _ => Err("cannot convert to dict".to_string()),
            }
        }
        "sorted" => {
            let mut items: Vec<Value> = args.first().ok_or("sorted() takes 1 argument")?.as_sequence().ok_or("needs a sequence")?.to_vec();
            items.sort_by(|a, b| as_f64(a).unwrap_or(0.0).partial_cmp(&as_f64(b).unwrap_or(0.0)).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.stringify().cmp(&b.stringify())));
            Ok(Value::Sequence(items))
        }
        "reversed" => {
            let mut items: Vec<Value> = args.first().ok_or("reversed() takes 1 argument")?.as_sequence().ok_or("needs a sequence")?.to_vec();
            items.reverse();
            Ok(Value::Sequence(items))
        }
        "enumerate" => {
            let items = args.first().ok_or("enumerate() takes 1 argument")?.as_sequence().ok_or("needs a sequence")?;
            Ok(Value::Sequence(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| Value::Sequence(vec![Value::Int(i as i64), v.clone()]))
                    .collect(),
            ))
        }
        "range" => {
            let nums: Vec<i64> = args.iter().map(|v| match v { Value::Int(n) => *n, _ => 0 }).collect();
            let (start, stop, step) = match nums.len() {
                1 => (0, nums[0], 1),
                2 => (nums[0], nums[1], 1),
                _ => (nums[0], nums[1], nums[2]),
            };
            if step == 0 {
                return Err("range() step cannot be zero".to_string());
            }
            let mut out = Vec::new();
            let mut i = start;
            while (step > 0 && i < stop) || (step < 0 && i > stop) {
                out.push(Value::Int(i));
                i += step;
            }
            Ok(Value::Sequence(out))
        }
        "all" => {
            let items = args.first().ok_or("all() takes 1 argument")?.as_sequence().ok_or("needs a sequence")?;
            Ok(Value::Bool(items.iter().all(|v| v.is_truthy())))
        }
        "any" => {
            let items = args.first().ok_or("any() takes 1 argument")?.as_sequence().ok_or("needs a sequence")?;
            Ok(Value::Bool(items.iter().any(|v| v.is_truthy())))
        }
        "type" => {
            let v = args.first().ok_or("type() takes 1 argument")?;
            let name = match v {
                Value::Null => "null",
                Value::Bool(_) => "bool",
                Value::Int(_) => "int",
                Value::Float(_) => "float",
                Value::Str(_) => "str",
                Value::Bytes(_) => "bytes",
                Value::Sequence(_) => "list",
                Value::Mapping(_) => "dict",
            };
            Ok(Value::Str(name.to_string()))
        }
        "isinstance" => {
            let v = args.first().ok_or("isinstance() takes 2 arguments")?;
            let want = args.get(1).and_then(|v| v.as_str()).ok_or("isinstance() second argument must be a type name string")?;
            let got = match v {
                Value::Null => "null",
                Value::Bool(_) => "bool",
                Value::Int(_) => "int",
                Value::Float(_) => "float",
                Value::Str(_) => "str",
                Value::Bytes(_) => "bytes",
                Value::Sequence(_) => "list",
                Value::Mapping(_) => "dict",
            };
            Ok(Value::Bool(got == want))
        }
        "iter" => Ok(args.into_iter().next().ok_or("iter() takes 1 argument")?),
        "next" => {
            let items = args.first().ok_or("next() takes 1 argument")?.as_sequence().ok_or("needs a sequence")?;
            items.first().cloned().ok_or_else(|| "StopIteration".to_string())
        }
        "escape" => {
            let s = args.first().and_then(|v| v.as_str()).ok_or("escape() needs a string")?;
            Ok(Value::Str(
                s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('"', "&quot;"),
            ))
        }
        "unescape" => {
            let s = args.first().and_then(|v| v.as_str()).ok_or("unescape() needs a string")?;
            Ok(Value::Str(
                s.replace("&amp;", "&").replace("&lt;", "<").replace("&gt;", ">").replace("&quot;", "\""),
            ))
        }
        other => Err(format!("`{other}` is not a permitted builtin")),
    }
}

// ─────────────────────────────── Evaluator ───────────────────────────────

fn eval(ast: &Ast, ctx: &VariableContext) -> Result<Value, String> {
    match ast {
        Ast::Null => Ok(Value::Null),
        Ast::Bool(b) => Ok(Value::Bool(*b)),
        Ast::Int(n) => Ok(Value::Int(*n)),
        Ast::Float(f) => Ok(Value::Float(*f)),
        Ast::Str(s) => Ok(Value::Str(s.clone())),
        Ast::List(items) => Ok(Value::Sequence(
            items.iter().map(|i| eval(i, ctx)).collect::<Result<_, _>>()?,
        )),
        Ast::Dict(pairs) => {
            let mut m = BTreeMap::new();
            for (k, v) in pairs {
                let key = eval(k, ctx)?;
                let key = key.as_str().ok_or("dict literal keys must be strings")?.to_string();
                m.insert(key, eval(v, ctx)?);
            }
            Ok(Value::Mapping(m))
        }
        Ast::Path(root, segs) => {
            let mut cur = ctx
                .get(root)
                .cloned()
                .ok_or_else(|| format!("unknown variable `{root}`"))?;
            for seg in segs {
                cur = match seg {
                    PathSeg::Field(name) => match &cur {
                        Value::Mapping(m) => m
                            .get(name)
                            .cloned()
                            .ok_or_else(|| format!("no field `{name}`"))?,
                        _ => return Err(format!("cannot access field `{name}` on non-mapping")),
                    },
                    PathSeg::Index(idx_ast) => {
                        let idx = eval(idx_ast, ctx)?;
                        match (&cur, &idx) {
                            (Value::Sequence(s), Value::Int(i)) => {
                                let i = if *i < 0 { s.len() as i64 + i } else { *i };
                                s.get(i as usize).cloned().ok_or("index out of range")?
                            }
                            (Value::Mapping(m), Value::Str(k)) => {
                                m.get(k).cloned().ok_or("no such key")?
                            }
                            _ => return Err("invalid index operation".to_string()),
                        }
                    }
                };
            }
            Ok(cur)
        }
        Ast::Not(e) => Ok(Value::Bool(!eval(e, ctx)?.is_truthy())),
        Ast::Neg(e) => match eval(e, ctx)? {
            Value::Int(n) => Ok(Value::Int(-n)),
            Value::Float(f) => Ok(Value::Float(-f)),
            _ => Err("unary `-` needs a number".to_string()),
        },
        Ast::And(l, r) => {
            let lv = eval(l, ctx)?;
            if !lv.is_truthy() {
                Ok(lv)
            } else {
                eval(r, ctx)
            }
        }
        Ast::Or(l, r) => {
            let lv = eval(l, ctx)?;
            if lv.is_truthy() {
                Ok(lv)
            } else {
                eval(r, ctx)
            }
        }
        Ast::Cmp(op, l, r) => {
            let lv = eval(l, ctx)?;
            let rv = eval(r, ctx)?;
            let ord = value_cmp(&lv, &rv);
            Ok(Value::Bool(match op {
                CmpOp::Eq => lv == rv,
                CmpOp::Ne => lv != rv,
                CmpOp::Lt => ord == Some(std::cmp::Ordering::Less),
                CmpOp::Le => matches!(ord, Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)),
                CmpOp::Gt => ord == Some(std::cmp::Ordering::Greater),
                CmpOp::Ge => matches!(ord, Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)),
            }))
        }
        Ast::Arith(op, l, r) => {
            let lv = eval(l, ctx)?;
            let rv = eval(r, ctx)?;
            arith(*op, &lv, &rv)
        }
        Ast::Call(name, args) => {
            if !BUILTINS.contains(&name.as_str()) {
                return Err(format!("`{name}` is not a permitted name"));
            }
            let values = args.iter().map(|a| eval(a, ctx)).collect::<Result<_, _>>()?;
            call_builtin(name, values)
        }
    }
}

fn value_cmp(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        _ => as_f64(a)?.partial_cmp(&as_f64(b)?),
    }
}

fn arith(op: ArithOp, l: &Value, r: &Value) -> Result<Value, String> {
    if let (Value::Str(a), Value::Str(b)) = (l, r) {
        if matches!(op, ArithOp::Add) {
            return Ok(Value::Str(format!("{a}{b}")));
        }
    }
    if let (Value::Sequence(a), Value::Sequence(b)) = (l, r) {
        if matches!(op, ArithOp::Add) {
            let mut out = a.clone();
            out.extend(b.clone());
            return Ok(Value::Sequence(out));
        }
    }
    let a = as_f64(l).ok_or("arithmetic needs numbers")?;
    let b = as_f64(r).ok_or("arithmetic needs numbers")?;
    let result = match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Mod => a % b,
    };
    let both_int = matches!(l, Value::Int(_)) && matches!(r, Value::Int(_)) && !matches!(op, ArithOp::Div);
    Ok(if both_int { Value::Int(result as i64) } else { Value::Float(result) })
}

/// Evaluate `expr` in boolean context against `ctx`.
pub fn evaluate_predicate(expr: &str, ctx: &VariableContext) -> Result<Value, ReasonChipError> {
    let ast = parse(expr).map_err(|cause| ReasonChipError::Expression {
        site: Default::default(),
        source: EvaluationError::new(expr, cause),
    })?;
    eval(&ast, ctx).map_err(|cause| ReasonChipError::Expression {
        site: Default::default(),
        source: EvaluationError::new(expr, cause),
    })
}

/// Like [`evaluate_predicate`] but takes the already-parsed placeholder
/// contents `{{ expr }}` and additionally type-preserves: a whole-string
/// single placeholder replaces the string with the native value.
fn evaluate_one(expr: &str, ctx: &VariableContext) -> Result<Value, ReasonChipError> {
    evaluate_predicate(expr, ctx)
}

/// Recursively walk `value`, substituting `{{ expr }}` placeholders found
/// in strings. Mappings/sequences are deep-copied with each
/// element interpolated; other scalars are returned as-is. Bounded by
/// `depth_limit` recursive calls to guard cyclic structures.
pub fn interpolate(value: &Value, ctx: &VariableContext) -> Result<Value, ReasonChipError> {
    interpolate_bounded(value, ctx, DEFAULT_RECURSION_LIMIT)
}

fn interpolate_bounded(value: &Value, ctx: &VariableContext, depth: usize) -> Result<Value, ReasonChipError> {
    if depth == 0 {
        return Err(ReasonChipError::RecursionLimitExceeded {
            limit: DEFAULT_RECURSION_LIMIT,
            value: value.stringify(),
        });
    }
    match value {
        Value::Str(s) => interpolate_string(s, ctx, depth - 1),
        Value::Sequence(items) => Ok(Value::Sequence(
            items
                .iter()
                .map(|v| interpolate_bounded(v, ctx, depth - 1))
                .collect::<Result<_, _>>()?,
        )),
        Value::Mapping(map) => {
            let mut out = BTreeMap::new();
            for (k, v) in map {
                out.insert(k.clone(), interpolate_bounded(v, ctx, depth - 1)?);
            }
            Ok(Value::Mapping(out))
        }
        other => Ok(other.clone()),
    }
}

fn find_placeholders(s: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let bytes = s.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'{' && bytes[i + 1] == b'{' {
            if let Some(end) = s[i + 2..].find("}}") {
                spans.push((i, i + 2 + end + 2));
                i += 2 + end + 2;
                continue;
            }
        }
        i += 1;
    }
    spans
}

fn interpolate_string(s: &str, ctx: &VariableContext, depth: usize) -> Result<Value, ReasonChipError> {
    let spans = find_placeholders(s);
    if spans.is_empty() {
        return Ok(Value::Str(s.to_string()));
    }

    // Whole-string single placeholder: type-preserving replacement.
    if spans.len() == 1 && spans[0] == (0, s.len()) {
        let expr = s[spans[0].0 + 2..spans[0].1 - 2].trim();
        let result = evaluate_one(expr, ctx)?;
        return interpolate_bounded(&result, ctx, depth);
    }

    let mut out = String::new();
    let mut last = 0;
    for (start, end) in spans {
        out.push_str(&s[last..start]);
        let expr = s[start + 2..end - 2].trim();
        let result = evaluate_one(expr, ctx)?;
        out.push_str(&result.stringify());
        last = end;
    }
    out.push_str(&s[last..]);
    Ok(Value::Str(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn ctx(pairs: &[(&str, Value)]) -> VariableContext {
        let mut m = BTreeMap::new();
        for (k, v) in pairs {
            m.insert(k.to_string(), v.clone());
        }
        VariableContext::from_mapping(m)
    }

    #[test]
    fn predicate_arithmetic_and_compare() {
        let c = ctx(&[("x", Value::Int(5))]);
        assert!(evaluate_predicate("x > 3", &c).unwrap().is_truthy());
        assert!(!evaluate_predicate("x > 10", &c).unwrap().is_truthy());
        assert!(evaluate_predicate("x * 2 == 10", &c).unwrap().is_truthy());
    }

    #[test]
    fn predicate_builtins() {
        let c = VariableContext::new();
        assert_eq!(evaluate_predicate("len([1,2,3])", &c).unwrap(), Value::Int(3));
        assert_eq!(evaluate_predicate("max(1, 5, 2)", &c).unwrap(), Value::Int(5));
        assert_eq!(evaluate_predicate("abs(-4)", &c).unwrap(), Value::Int(4));
    }

    #[test]
    fn interpolation_idempotent_on_plain_values() {
        let c = ctx(&[("name", Value::Str("Elvis".into()))]);
        let v = Value::Str("no placeholders here".into());
        assert_eq!(interpolate(&v, &c).unwrap(), v);
    }

    #[test]
    fn type_preserving_whole_string_placeholder() {
        let c = ctx(&[("n", Value::Int(42))]);
        let result = interpolate(&Value::Str("{{n}}".into()), &c).unwrap();
        assert_eq!(result, Value::Int(42));
    }

    #[test]
    fn mixed_string_stringifies() {
        let c = ctx(&[("name", Value::Str("Elvis".into()))]);
        let result = interpolate(&Value::Str("Hi, {{name}}!".into()), &c).unwrap();
        assert_eq!(result, Value::Str("Hi, Elvis!".into()));
    }

    #[test]
    fn nested_structure_interpolated_deeply() {
        let c = ctx(&[("x", Value::Int(1))]);
        let v = Value::Sequence(vec![Value::Str("{{x}}".into()), Value::Str("lit".into())]);
        let result = interpolate(&v, &c).unwrap();
        assert_eq!(result, Value::Sequence(vec![Value::Int(1), Value::Str("lit".into())]));
    }

    #[test]
    fn unknown_variable_errors() {
        let c = VariableContext::new();
        assert!(evaluate_predicate("missing > 1", &c).is_err());
    }
}
