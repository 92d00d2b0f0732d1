//! Expression language of the probe runtime.
//!
//! Supports literals, locals, `@ivars`, `$globals`, constants, arithmetic,
//! comparison, boolean operators, assignment, indexing, and method calls.
//! Statements may be separated by `;`; the value of the last is returned.

use crate::error::EvalError;
use crate::value::Value;

/// Name resolution and method dispatch for one evaluation.
pub trait Env {
    fn local(&self, name: &str) -> Option<Value>;
    fn set_local(&self, name: &str, value: Value);
    /// `self` of the evaluation.
    fn receiver(&self) -> Value;
    fn global(&self, name: &str) -> Option<Value>;
    fn set_global(&self, name: &str, value: Value);
    fn has_class(&self, name: &str) -> bool;
    /// Call a program-defined method. Returns [`EvalError::NoMethod`] when
    /// the receiver does not define `name`.
    fn call(&self, recv: &Value, name: &str, args: Vec<Value>) -> Result<Value, EvalError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Local(String),
    Ivar(String),
    Global(String),
}

/// Parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Lit(Value),
    Ident(String),
    Const(String),
    Ivar(String),
    Global(String),
    SelfRef,
    List(Vec<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Assign(Target, Box<Expr>),
    Call {
        recv: Option<Box<Expr>>,
        name: String,
        args: Vec<Expr>,
    },
    Index(Box<Expr>, Box<Expr>),
    Raise(Vec<Expr>),
    Seq(Vec<Expr>),
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Ivar(String),
    Global(String),
    Op(&'static str),
}

const OPS: &[&str] = &[
    "==", "!=", "<=", ">=", "&&", "||", "+", "-", "*", "/", "%", "<", ">", "!", "=", "(", ")",
    "[", "]", ",", ".", ";",
];

fn lex(src: &str) -> Result<Vec<Tok>, EvalError> {
    let chars: Vec<char> = src.chars().collect();
    let mut toks = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '_') {
                i += 1;
            }
            let is_float = i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit();
            if is_float {
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let text: String = chars[start..i].iter().filter(|c| **c != '_').collect();
            if is_float {
                let f = text
                    .parse::<f64>()
                    .map_err(|e| EvalError::Syntax(format!("bad number {text}: {e}")))?;
                toks.push(Tok::Float(f));
            } else {
                let n = text
                    .parse::<i64>()
                    .map_err(|e| EvalError::Syntax(format!("bad number {text}: {e}")))?;
                toks.push(Tok::Int(n));
            }
            continue;
        }
        if c == '"' || c == '\'' {
            let quote = c;
            i += 1;
            let mut s = String::new();
            loop {
                match chars.get(i) {
                    None => return Err(EvalError::Syntax("unterminated string".into())),
                    Some(&ch) if ch == quote => {
                        i += 1;
                        break;
                    }
                    Some('\\') if quote == '"' => {
                        let esc = chars
                            .get(i + 1)
                            .ok_or_else(|| EvalError::Syntax("unterminated string".into()))?;
                        s.push(match esc {
                            'n' => '\n',
                            't' => '\t',
                            other => *other,
                        });
                        i += 2;
                    }
                    Some(&ch) => {
                        s.push(ch);
                        i += 1;
                    }
                }
            }
            toks.push(Tok::Str(s));
            continue;
        }
        if c == '@' || c == '$' || c.is_alphabetic() || c == '_' {
            let start = i;
            i += 1;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            if i < chars.len() && (chars[i] == '?' || chars[i] == '!') && c != '@' && c != '$' {
                // `a != b` keeps `!` as an operator.
                if !(chars[i] == '!' && chars.get(i + 1) == Some(&'=')) {
                    i += 1;
                }
            }
            let word: String = chars[start..i].iter().collect();
            if word.len() == 1 && (c == '@' || c == '$') {
                return Err(EvalError::Syntax(format!("unexpected {c}")));
            }
            toks.push(match c {
                '@' => Tok::Ivar(word),
                '$' => Tok::Global(word),
                _ => Tok::Ident(word),
            });
            continue;
        }
        let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
        match OPS.iter().find(|op| rest.starts_with(**op)) {
            Some(op) => {
                toks.push(Tok::Op(*op));
                i += op.len();
            }
            None => return Err(EvalError::Syntax(format!("unexpected character {c:?}"))),
        }
    }
    Ok(toks)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn peek_at(&self, n: usize) -> Option<&Tok> {
        self.toks.get(self.pos + n)
    }

    fn next(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn eat(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Some(Tok::Op(o)) if *o == op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, op: &str) -> Result<(), EvalError> {
        if self.eat(op) {
            Ok(())
        } else {
            Err(EvalError::Syntax(format!(
                "expected `{op}`, found {}",
                self.describe_next()
            )))
        }
    }

    fn describe_next(&self) -> String {
        match self.peek() {
            None => "end of input".into(),
            Some(Tok::Op(o)) => format!("`{o}`"),
            Some(Tok::Ident(s)) | Some(Tok::Ivar(s)) | Some(Tok::Global(s)) => format!("`{s}`"),
            Some(Tok::Str(s)) => format!("{s:?}"),
            Some(Tok::Int(n)) => n.to_string(),
            Some(Tok::Float(f)) => f.to_string(),
        }
    }

    fn program(&mut self) -> Result<Expr, EvalError> {
        let mut stmts = Vec::new();
        loop {
            while self.eat(";") {}
            if self.peek().is_none() {
                break;
            }
            stmts.push(self.statement()?);
            if self.peek().is_some() && !self.eat(";") {
                return Err(EvalError::Syntax(format!(
                    "unexpected {}",
                    self.describe_next()
                )));
            }
        }
        match stmts.len() {
            0 => Ok(Expr::Lit(Value::Nil)),
            1 => Ok(stmts.remove(0)),
            _ => Ok(Expr::Seq(stmts)),
        }
    }

    fn statement(&mut self) -> Result<Expr, EvalError> {
        if matches!(self.peek(), Some(Tok::Ident(w)) if w == "raise") {
            self.pos += 1;
            let mut args = Vec::new();
            if self.peek().is_some() && !matches!(self.peek(), Some(Tok::Op(";"))) {
                args.push(self.expr()?);
                while self.eat(",") {
                    args.push(self.expr()?);
                }
            }
            return Ok(Expr::Raise(args));
        }
        self.expr()
    }

    fn expr(&mut self) -> Result<Expr, EvalError> {
        let is_assign = matches!(self.peek_at(1), Some(Tok::Op("=")));
        if is_assign {
            let target = match self.peek() {
                Some(Tok::Ident(n)) if !starts_upper(n) => Some(Target::Local(n.clone())),
                Some(Tok::Ivar(n)) => Some(Target::Ivar(n.clone())),
                Some(Tok::Global(n)) => Some(Target::Global(n.clone())),
                _ => None,
            };
            if let Some(target) = target {
                self.pos += 2;
                let value = self.expr()?;
                return Ok(Expr::Assign(target, Box::new(value)));
            }
        }
        self.or()
    }

    fn or(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.and()?;
        while self.eat("||") {
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.equality()?;
        while self.eat("&&") {
            let rhs = self.equality()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn binary_level(
        &mut self,
        ops: &[(&str, BinOp)],
        next: fn(&mut Self) -> Result<Expr, EvalError>,
    ) -> Result<Expr, EvalError> {
        let mut lhs = next(self)?;
        'outer: loop {
            for (text, op) in ops {
                if self.eat(text) {
                    let rhs = next(self)?;
                    lhs = Expr::Binary(*op, Box::new(lhs), Box::new(rhs));
                    continue 'outer;
                }
            }
            return Ok(lhs);
        }
    }

    fn equality(&mut self) -> Result<Expr, EvalError> {
        self.binary_level(&[("==", BinOp::Eq), ("!=", BinOp::Ne)], Self::comparison)
    }

    fn comparison(&mut self) -> Result<Expr, EvalError> {
        self.binary_level(
            &[
                ("<=", BinOp::Le),
                (">=", BinOp::Ge),
                ("<", BinOp::Lt),
                (">", BinOp::Gt),
            ],
            Self::additive,
        )
    }

    fn additive(&mut self) -> Result<Expr, EvalError> {
        self.binary_level(&[("+", BinOp::Add), ("-", BinOp::Sub)], Self::multiplicative)
    }

    fn multiplicative(&mut self) -> Result<Expr, EvalError> {
        self.binary_level(
            &[("*", BinOp::Mul), ("/", BinOp::Div), ("%", BinOp::Rem)],
            Self::unary,
        )
    }

    fn unary(&mut self) -> Result<Expr, EvalError> {
        if self.eat("!") {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        if self.eat("-") {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, EvalError> {
        let mut e = self.primary()?;
        loop {
            if self.eat(".") {
                let name = match self.next() {
                    Some(Tok::Ident(n)) => n,
                    _ => return Err(EvalError::Syntax("expected method name after `.`".into())),
                };
                let args = if self.eat("(") { self.args(")")? } else { Vec::new() };
                e = Expr::Call {
                    recv: Some(Box::new(e)),
                    name,
                    args,
                };
            } else if self.eat("[") {
                let idx = self.expr()?;
                self.expect("]")?;
                e = Expr::Index(Box::new(e), Box::new(idx));
            } else {
                return Ok(e);
            }
        }
    }

    fn args(&mut self, close: &str) -> Result<Vec<Expr>, EvalError> {
        let mut args = Vec::new();
        if self.eat(close) {
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            if self.eat(close) {
                return Ok(args);
            }
            self.expect(",")?;
        }
    }

    fn primary(&mut self) -> Result<Expr, EvalError> {
        match self.next() {
            Some(Tok::Int(n)) => Ok(Expr::Lit(Value::Int(n))),
            Some(Tok::Float(f)) => Ok(Expr::Lit(Value::Float(f))),
            Some(Tok::Str(s)) => Ok(Expr::Lit(Value::Str(s))),
            Some(Tok::Ivar(n)) => Ok(Expr::Ivar(n)),
            Some(Tok::Global(n)) => Ok(Expr::Global(n)),
            Some(Tok::Ident(n)) => Ok(match n.as_str() {
                "nil" => Expr::Lit(Value::Nil),
                "true" => Expr::Lit(Value::Bool(true)),
                "false" => Expr::Lit(Value::Bool(false)),
                "self" => Expr::SelfRef,
                _ if self.eat("(") => Expr::Call {
                    recv: None,
                    name: n,
                    args: self.args(")")?,
                },
                _ if starts_upper(&n) => Expr::Const(n),
                _ => Expr::Ident(n),
            }),
            Some(Tok::Op("(")) => {
                let e = self.expr()?;
                self.expect(")")?;
                Ok(e)
            }
            Some(Tok::Op("[")) => Ok(Expr::List(self.args("]")?)),
            Some(Tok::Op(o)) => Err(EvalError::Syntax(format!("unexpected `{o}`"))),
            None => Err(EvalError::Syntax("unexpected end of input".into())),
        }
    }
}

fn starts_upper(s: &str) -> bool {
    s.chars().next().is_some_and(char::is_uppercase)
}

/// Parse `src` into an expression tree.
pub fn parse(src: &str) -> Result<Expr, EvalError> {
    let toks = lex(src)?;
    let mut p = Parser { toks, pos: 0 };
    p.program()
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// Parse and evaluate `src` in `env`.
pub fn evaluate(src: &str, env: &dyn Env) -> Result<Value, EvalError> {
    eval(&parse(src)?, env)
}

pub fn eval(expr: &Expr, env: &dyn Env) -> Result<Value, EvalError> {
    match expr {
        Expr::Lit(v) => Ok(v.clone()),
        Expr::SelfRef => Ok(env.receiver()),
        Expr::Ident(name) => match env.local(name) {
            Some(v) => Ok(v),
            None => match call(env, &env.receiver(), name, Vec::new()) {
                Err(EvalError::NoMethod { .. }) => Err(EvalError::Name(name.clone())),
                other => other,
            },
        },
        Expr::Const(name) => {
            if env.has_class(name) {
                Ok(Value::Class(name.clone()))
            } else {
                Err(EvalError::Name(name.clone()))
            }
        }
        Expr::Ivar(name) => Ok(env
            .receiver()
            .as_object()
            .and_then(|o| o.ivar(name))
            .unwrap_or(Value::Nil)),
        Expr::Global(name) => Ok(env.global(name).unwrap_or(Value::Nil)),
        Expr::List(items) => Ok(Value::List(
            items
                .iter()
                .map(|e| eval(e, env))
                .collect::<Result<_, _>>()?,
        )),
        Expr::Not(e) => Ok(Value::Bool(!eval(e, env)?.truthy())),
        Expr::Neg(e) => match eval(e, env)? {
            Value::Int(n) => Ok(Value::Int(-n)),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => Err(EvalError::NoMethod {
                name: "-@".into(),
                receiver: other.inspect(),
            }),
        },
        Expr::And(a, b) => {
            let l = eval(a, env)?;
            if l.truthy() {
                eval(b, env)
            } else {
                Ok(l)
            }
        }
        Expr::Or(a, b) => {
            let l = eval(a, env)?;
            if l.truthy() {
                Ok(l)
            } else {
                eval(b, env)
            }
        }
        Expr::Binary(op, a, b) => binary(*op, eval(a, env)?, eval(b, env)?),
        Expr::Assign(target, e) => {
            let v = eval(e, env)?;
            match target {
                Target::Local(n) => env.set_local(n, v.clone()),
                Target::Global(n) => env.set_global(n, v.clone()),
                Target::Ivar(n) => match env.receiver() {
                    Value::Object(o) => o.set_ivar(n.clone(), v.clone()),
                    other => {
                        return Err(EvalError::Type(format!(
                            "can't modify instance variables of {}",
                            other.inspect()
                        )))
                    }
                },
            }
            Ok(v)
        }
        Expr::Call { recv, name, args } => {
            let recv = match recv {
                Some(r) => eval(r, env)?,
                None => env.receiver(),
            };
            let args = args
                .iter()
                .map(|a| eval(a, env))
                .collect::<Result<Vec<_>, _>>()?;
            call(env, &recv, name, args)
        }
        Expr::Index(target, idx) => index(eval(target, env)?, eval(idx, env)?),
        Expr::Raise(args) => {
            let args = args
                .iter()
                .map(|a| eval(a, env))
                .collect::<Result<Vec<_>, _>>()?;
            Err(raise_error(&args))
        }
        Expr::Seq(stmts) => {
            let mut last = Value::Nil;
            for s in stmts {
                last = eval(s, env)?;
            }
            Ok(last)
        }
    }
}

fn raise_error(args: &[Value]) -> EvalError {
    match args {
        [] => EvalError::Raised {
            class: "RuntimeError".into(),
            message: "unhandled exception".into(),
        },
        [Value::Class(c)] => EvalError::Raised {
            class: c.clone(),
            message: c.clone(),
        },
        [Value::Class(c), msg, ..] => EvalError::Raised {
            class: c.clone(),
            message: msg.to_string(),
        },
        [msg, ..] => EvalError::Raised {
            class: "RuntimeError".into(),
            message: msg.to_string(),
        },
    }
}

fn call(env: &dyn Env, recv: &Value, name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
    if matches!(recv, Value::Object(_) | Value::Class(_)) || name == "raise" {
        match env.call(recv, name, args.clone()) {
            Err(EvalError::NoMethod { .. }) => {}
            other => return other,
        }
    }
    builtin(recv, name, &args).unwrap_or_else(|| {
        Err(EvalError::NoMethod {
            name: name.to_string(),
            receiver: recv.inspect(),
        })
    })
}

fn builtin(recv: &Value, name: &str, args: &[Value]) -> Option<Result<Value, EvalError>> {
    let v = match (recv, name, args) {
        (_, "class", []) => Value::Class(recv.class_name()),
        (_, "inspect", []) => Value::Str(recv.inspect()),
        (_, "to_s", []) => Value::Str(recv.to_string()),
        (_, "nil?", []) => Value::Bool(matches!(recv, Value::Nil)),
        (Value::Int(n), "to_f", []) => Value::Float(*n as f64),
        (Value::Int(n), "abs", []) => Value::Int(n.abs()),
        (Value::Int(_), "to_i", []) => recv.clone(),
        (Value::Float(f), "to_i", []) => Value::Int(*f as i64),
        (Value::Float(f), "abs", []) => Value::Float(f.abs()),
        (Value::Str(s), "length" | "size", []) => Value::Int(s.chars().count() as i64),
        (Value::Str(s), "upcase", []) => Value::Str(s.to_uppercase()),
        (Value::Str(s), "downcase", []) => Value::Str(s.to_lowercase()),
        (Value::Str(s), "to_i", []) => Value::Int(s.trim().parse().unwrap_or(0)),
        (Value::List(l), "size" | "length", []) => Value::Int(l.len() as i64),
        (Value::List(l), "first", []) => l.first().cloned().unwrap_or(Value::Nil),
        (Value::List(l), "last", []) => l.last().cloned().unwrap_or(Value::Nil),
        (Value::List(l), "include?", [x]) => Value::Bool(l.contains(x)),
        (Value::List(l), "sum", []) => {
            return Some(l.iter().cloned().try_fold(Value::Int(0), |acc, v| binary(BinOp::Add, acc, v)))
        }
        (Value::Object(o), "instance_variables", []) => {
            Value::List(o.ivars().into_iter().map(|(k, _)| Value::Str(k)).collect())
        }
        (Value::Object(o), "instance_variable_get", [Value::Str(n)]) => {
            o.ivar(n).unwrap_or(Value::Nil)
        }
        _ => return None,
    };
    Some(Ok(v))
}

fn index(target: Value, idx: Value) -> Result<Value, EvalError> {
    match (&target, &idx) {
        (Value::List(l), Value::Int(i)) => {
            let i = if *i < 0 { l.len() as i64 + i } else { *i };
            Ok(usize::try_from(i)
                .ok()
                .and_then(|i| l.get(i))
                .cloned()
                .unwrap_or(Value::Nil))
        }
        (Value::Str(s), Value::Int(i)) => Ok(usize::try_from(*i)
            .ok()
            .and_then(|i| s.chars().nth(i))
            .map(|c| Value::Str(c.to_string()))
            .unwrap_or(Value::Nil)),
        _ => Err(EvalError::NoMethod {
            name: "[]".into(),
            receiver: target.inspect(),
        }),
    }
}

fn type_error(op: BinOp, a: &Value, b: &Value) -> EvalError {
    EvalError::Type(format!(
        "{} can't be combined with {} ({op:?})",
        a.class_name(),
        b.class_name()
    ))
}

fn binary(op: BinOp, a: Value, b: Value) -> Result<Value, EvalError> {
    use BinOp::*;
    if matches!(op, Eq | Ne) && !(is_number(&a) && is_number(&b)) {
        return Ok(Value::Bool((a == b) == (op == Eq)));
    }
    match (&a, &b) {
        (Value::Int(x), Value::Int(y)) => {
            let (x, y) = (*x, *y);
            Ok(match op {
                Add => Value::Int(x.wrapping_add(y)),
                Sub => Value::Int(x.wrapping_sub(y)),
                Mul => Value::Int(x.wrapping_mul(y)),
                Div | Rem if y == 0 => {
                    return Err(EvalError::Raised {
                        class: "ZeroDivisionError".into(),
                        message: "divided by 0".into(),
                    })
                }
                Div => Value::Int(x.div_euclid(y)),
                Rem => Value::Int(x.rem_euclid(y)),
                Lt => Value::Bool(x < y),
                Le => Value::Bool(x <= y),
                Gt => Value::Bool(x > y),
                Ge => Value::Bool(x >= y),
                Eq => Value::Bool(x == y),
                Ne => Value::Bool(x != y),
            })
        }
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let x = as_f64(&a);
            let y = as_f64(&b);
            Ok(match op {
                Add => Value::Float(x + y),
                Sub => Value::Float(x - y),
                Mul => Value::Float(x * y),
                Div => Value::Float(x / y),
                Rem => Value::Float(x % y),
                Lt => Value::Bool(x < y),
                Le => Value::Bool(x <= y),
                Gt => Value::Bool(x > y),
                Ge => Value::Bool(x >= y),
                Eq => Value::Bool(x == y),
                Ne => Value::Bool(x != y),
            })
        }
        (Value::Str(x), Value::Str(y)) => Ok(match op {
            Add => Value::Str(format!("{x}{y}")),
            Lt => Value::Bool(x < y),
            Le => Value::Bool(x <= y),
            Gt => Value::Bool(x > y),
            Ge => Value::Bool(x >= y),
            _ => return Err(type_error(op, &a, &b)),
        }),
        (Value::Str(x), Value::Int(n)) if op == Mul => {
            Ok(Value::Str(x.repeat(usize::try_from(*n).unwrap_or(0))))
        }
        (Value::List(x), Value::List(y)) if op == Add => {
            Ok(Value::List(x.iter().chain(y.iter()).cloned().collect()))
        }
        _ => Err(type_error(op, &a, &b)),
    }
}

fn is_number(v: &Value) -> bool {
    matches!(v, Value::Int(_) | Value::Float(_))
}

fn as_f64(v: &Value) -> f64 {
    match v {
        Value::Int(n) => *n as f64,
        Value::Float(f) => *f,
        _ => 0.0,
    }
}

/// Identifiers in `src` that look like the start of a name being typed.
pub fn completion_prefix(src: &str) -> &str {
    let start = src
        .rfind(|c: char| !(c.is_alphanumeric() || c == '_' || c == '@' || c == '$'))
        .map(|i| i + 1)
        .unwrap_or(0);
    &src[start..]
}
