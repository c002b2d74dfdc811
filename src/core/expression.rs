// src/core/expression.rs

//! # Expression Evaluation
//!
//! Scripts embed expressions in three places: parameter blocks of commands
//! (`;mes {text: "a" + "b"}`), conditions and loop counts (`;if {exp: "tv.n > 2"}`),
//! and inline/block script tags (`- tv.n += 1`, `= gv.name`).
//!
//! The engine only depends on the [`ExpressionEvaluator`] trait. [`BasicEvaluator`]
//! is the default implementation: a small JavaScript-like language that reads and
//! writes the `tv`/`gv`/`sv` namespaces of a [`VarContext`] and reads the current
//! macro parameters through `mp`.

use crate::core::variables::{Namespace, VarContext};
use crate::models::TagValues;
use serde_json::{Map, Number, Value};
use std::fmt;
use thiserror::Error;

/// Errors raised while lexing, parsing or evaluating an expression.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    /// The lexer found a character that starts no token.
    #[error("Unexpected character '{ch}' at offset {offset} in expression '{source_text}'")]
    UnexpectedChar {
        /// The offending character.
        ch: char,
        /// Byte offset in the expression.
        offset: usize,
        /// The whole expression.
        source_text: String,
    },
    /// A string literal was opened but never closed.
    #[error("Unterminated string literal in expression '{0}'")]
    UnterminatedString(String),
    /// The token stream does not form a valid expression.
    #[error("Syntax error in expression '{source_text}': {message}")]
    Syntax {
        /// The whole expression.
        source_text: String,
        /// Description of the failure.
        message: String,
    },
    /// A root identifier that is neither a namespace nor a literal.
    #[error("'{0}' is not defined")]
    Undefined(String),
    /// Variables were referenced while evaluating without a variable context.
    #[error("Variables are not available while evaluating '{0}'")]
    NoVariables(String),
    /// `mp` was referenced outside of a macro invocation.
    #[error("'mp' is only available inside a macro")]
    NoMacroParams,
    /// The left-hand side of an assignment is not a writable path.
    #[error("Invalid assignment target in '{0}'")]
    InvalidTarget(String),
    /// An operation was applied to values it cannot handle.
    #[error("Type error: {0}")]
    Type(String),
}

/// What an expression can see while it runs.
#[derive(Debug, Default)]
pub struct Scope<'a> {
    vars: Option<&'a mut VarContext>,
    macro_params: Option<&'a TagValues>,
}

impl<'a> Scope<'a> {
    /// A scope without variables: only literals and operators are usable.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A scope over `vars`, with `macro_params` as `mp`.
    pub fn new(vars: &'a mut VarContext, macro_params: Option<&'a TagValues>) -> Self {
        Self {
            vars: Some(vars),
            macro_params,
        }
    }
}

/// Pluggable expression capability used by the parser, the script cursor and the conductor.
pub trait ExpressionEvaluator: fmt::Debug + Send + Sync {
    /// Evaluates `source` and returns its value.
    fn evaluate(&self, source: &str, scope: &mut Scope<'_>) -> Result<Value, EvalError>;

    /// Evaluates `source` and converts the result with JavaScript truthiness.
    fn evaluate_bool(&self, source: &str, scope: &mut Scope<'_>) -> Result<bool, EvalError> {
        self.evaluate(source, scope).map(|v| is_truthy(&v))
    }
}

/// The default evaluator.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicEvaluator;

impl BasicEvaluator {
    /// Creates the evaluator.
    pub fn new() -> Self {
        Self
    }
}

impl ExpressionEvaluator for BasicEvaluator {
    fn evaluate(&self, source: &str, scope: &mut Scope<'_>) -> Result<Value, EvalError> {
        let tokens = tokenize(source)?;
        let program = ExprParser::new(source, &tokens).parse_program()?;
        log::trace!("Evaluating expression '{}'", source);
        Interpreter { source, scope }.eval(&program)
    }
}

// --- VALUE HELPERS ---

/// JavaScript truthiness.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Converts a value to a number the way JavaScript's `Number(...)` does. Returns NaN when impossible.
pub fn to_number(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                0.0
            } else {
                trimmed.parse::<f64>().unwrap_or(f64::NAN)
            }
        }
        Value::Array(_) | Value::Object(_) => f64::NAN,
    }
}

/// Renders a value as text, as printed by `=` lines.
pub fn to_display_string(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(to_display_string)
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => "[object Object]".to_string(),
    }
}

/// Wraps a float into a JSON number, preferring an integer representation.
pub fn number_value(n: f64) -> Result<Value, EvalError> {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        // Integral and inside the exactly-representable range, so the conversion is lossless.
        #[allow(clippy::cast_possible_truncation)]
        return Ok(Value::Number(Number::from(n as i64)));
    }
    Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| EvalError::Type(format!("{} is not a finite number", n)))
}

fn loose_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_))
        | (Value::Number(_), Value::String(_))
        | (Value::String(_), Value::Number(_))
        | (Value::Bool(_), Value::Number(_))
        | (Value::Number(_), Value::Bool(_)) => to_number(a) == to_number(b),
        _ => a == b,
    }
}

fn strict_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => to_number(a) == to_number(b),
        _ => a == b,
    }
}

// --- LEXER ---

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Number(f64),
    Str(String),
    Ident(String),
    Punct(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    /// Whether a line break separates this token from the previous one.
    newline_before: bool,
}

/// Longest punctuators first, so `===` wins over `==` and `=`.
const PUNCTUATORS: &[&str] = &[
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "+=", "-=", "*=", "/=", "+", "-", "*",
    "/", "%", "<", ">", "!", "=", "?", ":", ".", ",", ";", "(", ")", "[", "]", "{", "}",
];

fn tokenize(source: &str) -> Result<Vec<Token>, EvalError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();
    let mut newline_before = false;

    while let Some(&(offset, c)) = chars.peek() {
        if c == '\n' {
            newline_before = true;
            chars.next();
            continue;
        }
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let kind = if c.is_ascii_digit()
            || (c == '.' && source.get(offset + 1..).is_some_and(|r| r.starts_with(|d: char| d.is_ascii_digit())))
        {
            let mut end = offset;
            let mut seen_exponent = false;
            while let Some(&(i, d)) = chars.peek() {
                let is_exponent_sign = (d == '+' || d == '-')
                    && source
                        .get(..i)
                        .is_some_and(|prefix| prefix.ends_with(['e', 'E']));
                if d.is_ascii_digit() || d == '.' || is_exponent_sign {
                    end = i + d.len_utf8();
                    chars.next();
                } else if (d == 'e' || d == 'E') && !seen_exponent {
                    seen_exponent = true;
                    end = i + 1;
                    chars.next();
                } else {
                    break;
                }
            }
            let literal = source.get(offset..end).unwrap_or_default();
            let value = literal.parse::<f64>().map_err(|_| EvalError::Syntax {
                source_text: source.to_string(),
                message: format!("invalid number literal '{}'", literal),
            })?;
            TokenKind::Number(value)
        } else if c == '"' || c == '\'' {
            chars.next();
            TokenKind::Str(read_string(&mut chars, c, source)?)
        } else if c.is_alphabetic() || c == '_' || c == '$' {
            let mut ident = String::new();
            while let Some(&(_, d)) = chars.peek() {
                if d.is_alphanumeric() || d == '_' || d == '$' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            TokenKind::Ident(ident)
        } else {
            let rest = source.get(offset..).unwrap_or_default();
            let punct = PUNCTUATORS
                .iter()
                .copied()
                .find(|p| rest.starts_with(*p))
                .ok_or_else(|| EvalError::UnexpectedChar {
                    ch: c,
                    offset,
                    source_text: source.to_string(),
                })?;
            // Punctuators are ASCII, so their char count equals their byte length.
            for _ in 0..punct.len() {
                chars.next();
            }
            TokenKind::Punct(punct)
        };

        tokens.push(Token {
            kind,
            newline_before,
        });
        newline_before = false;
    }

    Ok(tokens)
}

fn read_string(
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
    quote: char,
    source: &str,
) -> Result<String, EvalError> {
    let mut text = String::new();
    while let Some((_, c)) = chars.next() {
        match c {
            c if c == quote => return Ok(text),
            '\\' => {
                let (_, escaped) = chars
                    .next()
                    .ok_or_else(|| EvalError::UnterminatedString(source.to_string()))?;
                match escaped {
                    'n' => text.push('\n'),
                    't' => text.push('\t'),
                    'r' => text.push('\r'),
                    '0' => text.push('\0'),
                    'u' => {
                        let mut code = String::with_capacity(4);
                        for _ in 0..4 {
                            if let Some((_, h)) = chars.next() {
                                code.push(h);
                            }
                        }
                        let ch = u32::from_str_radix(&code, 16)
                            .ok()
                            .and_then(char::from_u32)
                            .ok_or_else(|| EvalError::Syntax {
                                source_text: source.to_string(),
                                message: format!("invalid unicode escape '\\u{}'", code),
                            })?;
                        text.push(ch);
                    }
                    other => text.push(other),
                }
            }
            _ => text.push(c),
        }
    }
    Err(EvalError::UnterminatedString(source.to_string()))
}

// --- AST ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    StrictEq,
    StrictNe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnaryOp {
    Not,
    Neg,
    Plus,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Ident(String),
    Member(Box<Expr>, Box<Expr>),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
    Assign(Option<BinaryOp>, Box<Expr>, Box<Expr>),
    Sequence(Vec<Expr>),
}

// --- PARSER ---

/// Recursive-descent parser, lowest precedence first.
struct ExprParser<'a> {
    source: &'a str,
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> ExprParser<'a> {
    fn new(source: &'a str, tokens: &'a [Token]) -> Self {
        Self {
            source,
            tokens,
            pos: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> EvalError {
        EvalError::Syntax {
            source_text: self.source.to_string(),
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn peek_punct(&self) -> Option<&'static str> {
        match self.peek().map(|t| &t.kind) {
            Some(TokenKind::Punct(p)) => Some(*p),
            _ => None,
        }
    }

    fn eat_punct(&mut self, punct: &str) -> bool {
        if self.peek_punct() == Some(punct) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, punct: &str) -> Result<(), EvalError> {
        if self.eat_punct(punct) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", punct)))
        }
    }

    /// program ::= statement ((';' | NEWLINE) statement)*
    fn parse_program(&mut self) -> Result<Expr, EvalError> {
        let mut statements = Vec::new();
        loop {
            while self.eat_punct(";") {}
            if self.peek().is_none() {
                break;
            }
            statements.push(self.parse_assignment()?);
            match self.peek() {
                None => break,
                Some(t) if t.kind == TokenKind::Punct(";") => continue,
                Some(t) if t.newline_before => continue,
                Some(t) => return Err(self.error(format!("unexpected token {:?}", t.kind))),
            }
        }
        match statements.len() {
            0 => Ok(Expr::Literal(Value::Null)),
            1 => Ok(statements.remove(0)),
            _ => Ok(Expr::Sequence(statements)),
        }
    }

    fn parse_assignment(&mut self) -> Result<Expr, EvalError> {
        let target = self.parse_conditional()?;
        let op = match self.peek_punct() {
            Some("=") => None,
            Some("+=") => Some(BinaryOp::Add),
            Some("-=") => Some(BinaryOp::Sub),
            Some("*=") => Some(BinaryOp::Mul),
            Some("/=") => Some(BinaryOp::Div),
            _ => return Ok(target),
        };
        self.pos += 1;
        if !matches!(target, Expr::Member(..) | Expr::Ident(_)) {
            return Err(EvalError::InvalidTarget(self.source.to_string()));
        }
        let value = self.parse_assignment()?;
        Ok(Expr::Assign(op, Box::new(target), Box::new(value)))
    }

    fn parse_conditional(&mut self) -> Result<Expr, EvalError> {
        let condition = self.parse_or()?;
        if !self.eat_punct("?") {
            return Ok(condition);
        }
        let then_branch = self.parse_assignment()?;
        self.expect_punct(":")?;
        let else_branch = self.parse_assignment()?;
        Ok(Expr::Conditional(
            Box::new(condition),
            Box::new(then_branch),
            Box::new(else_branch),
        ))
    }

    fn parse_or(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_and()?;
        while self.eat_punct("||") {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_equality()?;
        while self.eat_punct("&&") {
            let right = self.parse_equality()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.peek_punct() {
                Some("==") => BinaryOp::Eq,
                Some("!=") => BinaryOp::Ne,
                Some("===") => BinaryOp::StrictEq,
                Some("!==") => BinaryOp::StrictNe,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_comparison()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek_punct() {
                Some("<") => BinaryOp::Lt,
                Some("<=") => BinaryOp::Le,
                Some(">") => BinaryOp::Gt,
                Some(">=") => BinaryOp::Ge,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek_punct() {
                Some("+") => BinaryOp::Add,
                Some("-") => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek_punct() {
                Some("*") => BinaryOp::Mul,
                Some("/") => BinaryOp::Div,
                Some("%") => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, EvalError> {
        let op = match self.peek_punct() {
            Some("!") => UnaryOp::Not,
            Some("-") => UnaryOp::Neg,
            Some("+") => UnaryOp::Plus,
            _ => return self.parse_postfix(),
        };
        self.pos += 1;
        let operand = self.parse_unary()?;
        Ok(Expr::Unary(op, Box::new(operand)))
    }

    fn parse_postfix(&mut self) -> Result<Expr, EvalError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat_punct(".") {
                match self.peek().map(|t| &t.kind) {
                    Some(TokenKind::Ident(name)) => {
                        self.pos += 1;
                        expr = Expr::Member(
                            Box::new(expr),
                            Box::new(Expr::Literal(Value::String(name.clone()))),
                        );
                    }
                    _ => return Err(self.error("expected a property name after '.'")),
                }
            } else if self.eat_punct("[") {
                let key = self.parse_assignment()?;
                self.expect_punct("]")?;
                expr = Expr::Member(Box::new(expr), Box::new(key));
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, EvalError> {
        let token = self
            .peek()
            .ok_or_else(|| self.error("unexpected end of expression"))?;
        self.pos += 1;
        match &token.kind {
            TokenKind::Number(n) => Ok(Expr::Literal(number_value(*n)?)),
            TokenKind::Str(s) => Ok(Expr::Literal(Value::String(s.clone()))),
            TokenKind::Ident(name) => Ok(match name.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" | "undefined" => Expr::Literal(Value::Null),
                _ => Expr::Ident(name.clone()),
            }),
            TokenKind::Punct("(") => {
                let inner = self.parse_assignment()?;
                self.expect_punct(")")?;
                Ok(inner)
            }
            TokenKind::Punct("[") => {
                let mut items = Vec::new();
                while !self.eat_punct("]") {
                    items.push(self.parse_assignment()?);
                    if !self.eat_punct(",") {
                        self.expect_punct("]")?;
                        break;
                    }
                }
                Ok(Expr::Array(items))
            }
            TokenKind::Punct("{") => self.parse_object_body(),
            TokenKind::Punct(p) => Err(self.error(format!("unexpected '{}'", p))),
        }
    }

    /// Parses `key: value, ...}` after the opening brace has been consumed.
    fn parse_object_body(&mut self) -> Result<Expr, EvalError> {
        let mut entries = Vec::new();
        while !self.eat_punct("}") {
            let key = match self.peek().map(|t| &t.kind) {
                Some(TokenKind::Ident(name)) => name.clone(),
                Some(TokenKind::Str(s)) => s.clone(),
                Some(TokenKind::Number(n)) => to_display_string(&number_value(*n)?),
                _ => return Err(self.error("expected an object key")),
            };
            self.pos += 1;
            self.expect_punct(":")?;
            let value = self.parse_assignment()?;
            entries.push((key, value));
            if !self.eat_punct(",") {
                self.expect_punct("}")?;
                break;
            }
        }
        Ok(Expr::Object(entries))
    }
}

// --- INTERPRETER ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Root {
    Var(Namespace),
    MacroParams,
}

fn root_of(name: &str) -> Option<Root> {
    match name {
        "tv" => Some(Root::Var(Namespace::Tmp)),
        "gv" => Some(Root::Var(Namespace::Game)),
        "sv" => Some(Root::Var(Namespace::System)),
        "mp" => Some(Root::MacroParams),
        _ => None,
    }
}

fn property_of(container: &Value, key: &str) -> Value {
    match container {
        Value::Object(map) => map.get(key).cloned().unwrap_or(Value::Null),
        Value::Array(items) if key == "length" => Value::from(items.len()),
        Value::Array(items) => key
            .parse::<usize>()
            .ok()
            .and_then(|i| items.get(i))
            .cloned()
            .unwrap_or(Value::Null),
        Value::String(s) if key == "length" => Value::from(s.chars().count()),
        _ => Value::Null,
    }
}

struct Interpreter<'s, 'a> {
    source: &'s str,
    scope: &'s mut Scope<'a>,
}

impl Interpreter<'_, '_> {
    fn eval(&mut self, expr: &Expr) -> Result<Value, EvalError> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Ident(_) | Expr::Member(..) => {
                if let Some((root, keys)) = self.resolve_path(expr)? {
                    return self.read_path(root, &keys);
                }
                match expr {
                    Expr::Ident(name) => Err(EvalError::Undefined(name.clone())),
                    Expr::Member(object, key) => {
                        let container = self.eval(object)?;
                        let key = to_display_string(&self.eval(key)?);
                        Ok(property_of(&container, &key))
                    }
                    _ => Ok(Value::Null),
                }
            }
            Expr::Array(items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Expr::Object(entries) => {
                let mut map = Map::new();
                for (key, value) in entries {
                    let value = self.eval(value)?;
                    map.insert(key.clone(), value);
                }
                Ok(Value::Object(map))
            }
            Expr::Unary(op, operand) => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!is_truthy(&value))),
                    UnaryOp::Neg => number_value(-to_number(&value)),
                    UnaryOp::Plus => number_value(to_number(&value)),
                }
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                apply_binary(*op, &left, &right)
            }
            Expr::And(left, right) => {
                let left = self.eval(left)?;
                if is_truthy(&left) {
                    self.eval(right)
                } else {
                    Ok(left)
                }
            }
            Expr::Or(left, right) => {
                let left = self.eval(left)?;
                if is_truthy(&left) {
                    Ok(left)
                } else {
                    self.eval(right)
                }
            }
            Expr::Conditional(condition, then_branch, else_branch) => {
                if is_truthy(&self.eval(condition)?) {
                    self.eval(then_branch)
                } else {
                    self.eval(else_branch)
                }
            }
            Expr::Assign(op, target, value) => {
                let (root, keys) = self
                    .resolve_path(target)?
                    .ok_or_else(|| EvalError::InvalidTarget(self.source.to_string()))?;
                let value = self.eval(value)?;
                let new_value = match op {
                    None => value,
                    Some(op) => {
                        let current = self.read_path(root, &keys)?;
                        apply_binary(*op, &current, &value)?
                    }
                };
                self.write_path(root, &keys, new_value.clone())?;
                Ok(new_value)
            }
            Expr::Sequence(statements) => {
                let mut last = Value::Null;
                for statement in statements {
                    last = self.eval(statement)?;
                }
                Ok(last)
            }
        }
    }

    /// Resolves `tv.a["b"].c` style chains into a root and a list of keys.
    /// Returns `None` when the chain is not rooted at a namespace.
    fn resolve_path(&mut self, expr: &Expr) -> Result<Option<(Root, Vec<String>)>, EvalError> {
        match expr {
            Expr::Ident(name) => Ok(root_of(name).map(|root| (root, Vec::new()))),
            Expr::Member(object, key) => match self.resolve_path(object)? {
                Some((root, mut keys)) => {
                    let key = to_display_string(&self.eval(key)?);
                    keys.push(key);
                    Ok(Some((root, keys)))
                }
                None => Ok(None),
            },
            _ => Ok(None),
        }
    }

    fn root_map(&self, root: Root) -> Result<&TagValues, EvalError> {
        match root {
            Root::Var(namespace) => self
                .scope
                .vars
                .as_deref()
                .map(|vars| vars.namespace(namespace))
                .ok_or_else(|| EvalError::NoVariables(self.source.to_string())),
            Root::MacroParams => self.scope.macro_params.ok_or(EvalError::NoMacroParams),
        }
    }

    fn read_path(&self, root: Root, keys: &[String]) -> Result<Value, EvalError> {
        let map = self.root_map(root)?;
        let Some((first, rest)) = keys.split_first() else {
            return Ok(Value::Object(map.clone()));
        };
        let mut current = map.get(first).cloned().unwrap_or(Value::Null);
        for key in rest {
            current = property_of(&current, key);
        }
        Ok(current)
    }

    fn write_path(&mut self, root: Root, keys: &[String], value: Value) -> Result<(), EvalError> {
        let Root::Var(namespace) = root else {
            return Err(EvalError::InvalidTarget(self.source.to_string()));
        };
        let Some((last, parents)) = keys.split_last() else {
            return Err(EvalError::InvalidTarget(self.source.to_string()));
        };
        let vars = self
            .scope
            .vars
            .as_deref_mut()
            .ok_or_else(|| EvalError::NoVariables(self.source.to_string()))?;
        let map = vars.namespace_mut(namespace);

        let Some((first, middle)) = parents.split_first() else {
            map.insert(last.clone(), value);
            return Ok(());
        };
        let mut current = map.get_mut(first).ok_or_else(|| {
            EvalError::Type(format!("cannot set property '{}' of undefined", last))
        })?;
        for key in middle {
            current = match current {
                Value::Object(inner) => inner.get_mut(key),
                Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
                _ => None,
            }
            .ok_or_else(|| EvalError::Type(format!("cannot set property '{}' of undefined", last)))?;
        }
        match current {
            Value::Object(inner) => {
                inner.insert(last.clone(), value);
                Ok(())
            }
            Value::Array(items) => {
                let index = last
                    .parse::<usize>()
                    .map_err(|_| EvalError::Type(format!("invalid array index '{}'", last)))?;
                if index == items.len() {
                    items.push(value);
                } else if let Some(slot) = items.get_mut(index) {
                    *slot = value;
                } else {
                    return Err(EvalError::Type(format!("array index {} out of range", index)));
                }
                Ok(())
            }
            other => Err(EvalError::Type(format!(
                "cannot set property '{}' of {}",
                last,
                to_display_string(other)
            ))),
        }
    }
}

fn apply_binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    match op {
        BinaryOp::Add => {
            if left.is_string() || right.is_string() {
                let mut text = to_display_string(left);
                text.push_str(&to_display_string(right));
                Ok(Value::String(text))
            } else {
                number_value(to_number(left) + to_number(right))
            }
        }
        BinaryOp::Sub => number_value(to_number(left) - to_number(right)),
        BinaryOp::Mul => number_value(to_number(left) * to_number(right)),
        BinaryOp::Div => number_value(to_number(left) / to_number(right)),
        BinaryOp::Rem => number_value(to_number(left) % to_number(right)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (left, right) {
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => to_number(left).partial_cmp(&to_number(right)),
            };
            let result = ordering.is_some_and(|o| match op {
                BinaryOp::Lt => o.is_lt(),
                BinaryOp::Le => o.is_le(),
                BinaryOp::Gt => o.is_gt(),
                _ => o.is_ge(),
            });
            Ok(Value::Bool(result))
        }
        BinaryOp::Eq => Ok(Value::Bool(loose_equal(left, right))),
        BinaryOp::Ne => Ok(Value::Bool(!loose_equal(left, right))),
        BinaryOp::StrictEq => Ok(Value::Bool(strict_equal(left, right))),
        BinaryOp::StrictNe => Ok(Value::Bool(!strict_equal(left, right))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval_with(vars: &mut VarContext, source: &str) -> Result<Value, EvalError> {
        BasicEvaluator::new().evaluate(source, &mut Scope::new(vars, None))
    }

    #[test]
    fn test_literals_and_arithmetic() {
        let mut scope = Scope::empty();
        let evaluator = BasicEvaluator::new();
        assert_eq!(evaluator.evaluate("1 + 2 * 3", &mut scope).unwrap(), json!(7));
        assert_eq!(evaluator.evaluate("(1 + 2) * 3", &mut scope).unwrap(), json!(9));
        assert_eq!(evaluator.evaluate("7 / 2", &mut scope).unwrap(), json!(3.5));
        assert_eq!(evaluator.evaluate("-4 % 3", &mut scope).unwrap(), json!(-1));
        assert_eq!(evaluator.evaluate("'a' + 1", &mut scope).unwrap(), json!("a1"));
        assert_eq!(evaluator.evaluate("\"x\\ny\"", &mut scope).unwrap(), json!("x\ny"));
        assert_eq!(evaluator.evaluate("1.5e2", &mut scope).unwrap(), json!(150));
    }

    #[test]
    fn test_object_literal_for_parameter_blocks() {
        let value = BasicEvaluator::new()
            .evaluate("({text: \"hel\" + \"lo\", 'x': 1, y: [1, true, null],})", &mut Scope::empty())
            .unwrap();
        assert_eq!(value, json!({"text": "hello", "x": 1, "y": [1, true, null]}));
    }

    #[test]
    fn test_logic_and_comparison() {
        let mut scope = Scope::empty();
        let evaluator = BasicEvaluator::new();
        assert_eq!(evaluator.evaluate("1 < 2 && 'b' > 'a'", &mut scope).unwrap(), json!(true));
        assert_eq!(evaluator.evaluate("0 || 'fallback'", &mut scope).unwrap(), json!("fallback"));
        assert_eq!(evaluator.evaluate("1 == '1'", &mut scope).unwrap(), json!(true));
        assert_eq!(evaluator.evaluate("1 === '1'", &mut scope).unwrap(), json!(false));
        assert_eq!(evaluator.evaluate("1 === 1.0", &mut scope).unwrap(), json!(true));
        assert_eq!(evaluator.evaluate("!0 ? 'y' : 'n'", &mut scope).unwrap(), json!("y"));
        assert!(!evaluator.evaluate_bool("null", &mut scope).unwrap());
    }

    #[test]
    fn test_assignment_and_statements() {
        let mut vars = VarContext::new();
        let result = eval_with(&mut vars, "tv.count = 1; tv.count += 2\ngv.name = 'Yuki'").unwrap();
        assert_eq!(result, json!("Yuki"));
        assert_eq!(vars.get(Namespace::Tmp, "count"), Some(&json!(3)));
        assert_eq!(eval_with(&mut vars, "tv.count * 2").unwrap(), json!(6));
        assert_eq!(eval_with(&mut vars, "gv['name'].length").unwrap(), json!(4));
    }

    #[test]
    fn test_nested_assignment() {
        let mut vars = VarContext::new();
        eval_with(&mut vars, "gv.flags = {seen: false}; gv.flags.seen = true").unwrap();
        assert_eq!(eval_with(&mut vars, "gv.flags.seen").unwrap(), json!(true));
        let err = eval_with(&mut vars, "gv.missing.deep = 1").unwrap_err();
        assert!(matches!(err, EvalError::Type(_)));
    }

    #[test]
    fn test_missing_members_are_null_but_unknown_roots_fail() {
        let mut vars = VarContext::new();
        assert_eq!(eval_with(&mut vars, "tv.nothing").unwrap(), Value::Null);
        assert_eq!(
            eval_with(&mut vars, "window.x").unwrap_err(),
            EvalError::Undefined("window".to_string())
        );
    }

    #[test]
    fn test_variables_unavailable_in_empty_scope() {
        let err = BasicEvaluator::new()
            .evaluate("tv.x", &mut Scope::empty())
            .unwrap_err();
        assert!(matches!(err, EvalError::NoVariables(_)));
    }

    #[test]
    fn test_macro_params_are_read_only() {
        let mut vars = VarContext::new();
        let mut params = TagValues::new();
        params.insert("who".to_string(), json!("Aoi"));
        let evaluator = BasicEvaluator::new();

        let value = evaluator
            .evaluate("'hi ' + mp.who", &mut Scope::new(&mut vars, Some(&params)))
            .unwrap();
        assert_eq!(value, json!("hi Aoi"));

        let err = evaluator
            .evaluate("mp.who = 'x'", &mut Scope::new(&mut vars, Some(&params)))
            .unwrap_err();
        assert!(matches!(err, EvalError::InvalidTarget(_)));

        let err = evaluator.evaluate("mp.who", &mut Scope::new(&mut vars, None)).unwrap_err();
        assert_eq!(err, EvalError::NoMacroParams);
    }

    #[test]
    fn test_syntax_errors() {
        let evaluator = BasicEvaluator::new();
        assert!(matches!(
            evaluator.evaluate("1 +", &mut Scope::empty()),
            Err(EvalError::Syntax { .. })
        ));
        assert!(matches!(
            evaluator.evaluate("'open", &mut Scope::empty()),
            Err(EvalError::UnterminatedString(_))
        ));
        assert!(matches!(
            evaluator.evaluate("1 # 2", &mut Scope::empty()),
            Err(EvalError::UnexpectedChar { ch: '#', .. })
        ));
        assert!(matches!(
            evaluator.evaluate("1 = 2", &mut Scope::empty()),
            Err(EvalError::InvalidTarget(_))
        ));
        assert!(matches!(
            evaluator.evaluate("1 / 0", &mut Scope::empty()),
            Err(EvalError::Type(_))
        ));
    }
}
