//! Guards.
//!
//! A transition rule may carry a guard that decides whether the rule applies
//! to an event. Guards come in two forms:
//!
//! - named guards, resolved from the machine's [`Implementations`](crate::Implementations):
//!   `"guard": "isCircleUnderPointer"` or `"guard": {"type": "isCircleUnderPointer", "params": {...}}`
//! - inline expressions evaluated against the context and the event:
//!   `"guard": {"expr": "ctx.count < 10 && event.force"}`
//!
//! The expression language supports:
//!
//! - `ctx.field` / `event.field` - field access (truthy check)
//! - `ctx.field.nested` - nested field access
//! - `ctx.field == value` - equality (strings, numbers, booleans, null)
//! - `ctx.field != value` - inequality
//! - `ctx.field > value` - greater than (numbers)
//! - `ctx.field >= value` - greater or equal (numbers)
//! - `ctx.field < value` - less than (numbers)
//! - `ctx.field <= value` - less or equal (numbers)
//! - `!expr` - logical NOT
//! - `expr && expr` - logical AND (higher precedence than OR)
//! - `expr || expr` - logical OR
//! - `(expr)` - grouping for precedence control

use crate::error::{BoxError, CoreError};
use crate::event::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Guard reference as written in a machine definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GuardRef {
    /// `"guard": "name"`
    Name(String),
    /// `"guard": {"expr": "ctx.ready"}`
    Expr { expr: String },
    /// `"guard": {"type": "name", "params": ...}`
    Named {
        #[serde(rename = "type")]
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
}

/// Arguments passed to a named guard.
#[derive(Debug, Clone, Copy)]
pub struct GuardArgs<'a> {
    pub context: &'a Value,
    pub event: &'a Event,
    pub params: Option<&'a Value>,
}

/// A named guard implementation. Must be side-effect free.
pub type GuardFn = dyn Fn(&GuardArgs<'_>) -> Result<bool, BoxError> + Send + Sync;

/// A guard compiled from a [`GuardRef`].
#[derive(Debug, Clone)]
pub enum Guard {
    Named { name: String, params: Option<Value> },
    Expr { source: String, expr: GuardExpr },
}

impl Guard {
    /// Compiles a guard reference, parsing inline expressions.
    pub fn compile(guard: &GuardRef) -> Result<Self, CoreError> {
        match guard {
            GuardRef::Name(name) => Ok(Guard::Named {
                name: name.clone(),
                params: None,
            }),
            GuardRef::Named { name, params } => Ok(Guard::Named {
                name: name.clone(),
                params: params.clone(),
            }),
            GuardRef::Expr { expr } => Ok(Guard::Expr {
                source: expr.clone(),
                expr: GuardExpr::parse(expr)?,
            }),
        }
    }

    /// Returns a human-readable label for logs and errors.
    pub fn label(&self) -> &str {
        match self {
            Guard::Named { name, .. } => name,
            Guard::Expr { source, .. } => source,
        }
    }

    /// Returns the registry name for named guards.
    pub fn name(&self) -> Option<&str> {
        match self {
            Guard::Named { name, .. } => Some(name),
            Guard::Expr { .. } => None,
        }
    }
}

/// Which value a field path is resolved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldScope {
    Context,
    Event,
}

/// A dotted field path rooted at `ctx.` or `event.`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRef {
    pub scope: FieldScope,
    pub path: String,
}

/// A parsed guard expression.
#[derive(Debug, Clone)]
pub enum GuardExpr {
    /// Field is truthy.
    Truthy(FieldRef),
    /// Equality comparison.
    Eq(FieldRef, Value),
    /// Inequality comparison.
    Ne(FieldRef, Value),
    /// Greater than.
    Gt(FieldRef, f64),
    /// Greater or equal.
    Ge(FieldRef, f64),
    /// Less than.
    Lt(FieldRef, f64),
    /// Less or equal.
    Le(FieldRef, f64),
    /// Logical AND.
    And(Box<GuardExpr>, Box<GuardExpr>),
    /// Logical OR.
    Or(Box<GuardExpr>, Box<GuardExpr>),
    /// Logical NOT.
    Not(Box<GuardExpr>),
}

impl GuardExpr {
    /// Parses a guard expression from a string.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CoreError::InvalidGuard {
                reason: "empty guard expression".to_string(),
            });
        }

        let mut parser = Parser::new(s);
        let expr = parser.parse_expr()?;
        parser.skip_whitespace();
        if parser.pos < s.len() {
            return Err(CoreError::InvalidGuard {
                reason: format!("unexpected input at '{}'", &s[parser.pos..]),
            });
        }
        Ok(expr)
    }

    /// Evaluates the guard against a context and event.
    pub fn evaluate(&self, ctx: &Value, event: &Event) -> bool {
        match self {
            GuardExpr::Truthy(field) => is_truthy(&get_field(ctx, event, field)),
            GuardExpr::Eq(field, expected) => {
                values_equal(&get_field(ctx, event, field), expected)
            }
            GuardExpr::Ne(field, expected) => {
                !values_equal(&get_field(ctx, event, field), expected)
            }
            GuardExpr::Gt(field, expected) => {
                compare(ctx, event, field, |v| v > *expected)
            }
            GuardExpr::Ge(field, expected) => {
                compare(ctx, event, field, |v| v >= *expected)
            }
            GuardExpr::Lt(field, expected) => {
                compare(ctx, event, field, |v| v < *expected)
            }
            GuardExpr::Le(field, expected) => {
                compare(ctx, event, field, |v| v <= *expected)
            }
            GuardExpr::And(left, right) => {
                left.evaluate(ctx, event) && right.evaluate(ctx, event)
            }
            GuardExpr::Or(left, right) => left.evaluate(ctx, event) || right.evaluate(ctx, event),
            GuardExpr::Not(inner) => !inner.evaluate(ctx, event),
        }
    }
}

fn compare(ctx: &Value, event: &Event, field: &FieldRef, op: impl Fn(f64) -> bool) -> bool {
    as_f64(&get_field(ctx, event, field))
        .map(op)
        .unwrap_or(false)
}

fn get_field(ctx: &Value, event: &Event, field: &FieldRef) -> Value {
    let mut parts = field.path.split('.');

    let mut current = match field.scope {
        FieldScope::Context => ctx,
        FieldScope::Event => {
            // The event type lives outside the payload map.
            let head = parts.next().unwrap_or_default();
            if head == "type" {
                return match parts.next() {
                    None => Value::String(event.event_type.clone()),
                    Some(_) => Value::Null,
                };
            }
            match event.payload.get(head) {
                Some(value) => value,
                None => return Value::Null,
            }
        }
    };

    for part in parts {
        match current {
            Value::Object(map) => {
                current = map.get(part).unwrap_or(&Value::Null);
            }
            _ => return Value::Null,
        }
    }

    current.clone()
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .map(|(a, b)| (a - b).abs() < f64::EPSILON)
            .unwrap_or(false),
        (Value::String(a), Value::String(b)) => a == b,
        _ => false,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Maximum nesting of `!` and parentheses in a guard expression.
pub const MAX_GUARD_NESTING: usize = 64;

/// Maximum number of `&&`/`||` operators in a guard expression.
pub const MAX_GUARD_OPERATORS: usize = 256;

/// Recursive descent parser for guard expressions.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
    depth: usize,
    operators: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            depth: 0,
            operators: 0,
        }
    }

    fn enter(&mut self) -> Result<(), CoreError> {
        self.depth += 1;
        if self.depth > MAX_GUARD_NESTING {
            return Err(CoreError::InvalidGuard {
                reason: "expression nested too deeply".to_string(),
            });
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn count_operator(&mut self) -> Result<(), CoreError> {
        self.operators += 1;
        if self.operators > MAX_GUARD_OPERATORS {
            return Err(CoreError::InvalidGuard {
                reason: format!("expression has more than {} operators", MAX_GUARD_OPERATORS),
            });
        }
        Ok(())
    }

    fn parse_expr(&mut self) -> Result<GuardExpr, CoreError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<GuardExpr, CoreError> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();

        while self.peek_str("||") {
            self.pos += 2;
            self.count_operator()?;
            self.skip_whitespace();
            let right = self.parse_and()?;
            left = GuardExpr::Or(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<GuardExpr, CoreError> {
        let mut left = self.parse_unary()?;
        self.skip_whitespace();

        while self.peek_str("&&") {
            self.pos += 2;
            self.count_operator()?;
            self.skip_whitespace();
            let right = self.parse_unary()?;
            left = GuardExpr::And(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<GuardExpr, CoreError> {
        self.skip_whitespace();

        if self.peek_char() == Some('!') {
            self.pos += 1;
            self.skip_whitespace();
            self.enter()?;
            let inner = self.parse_unary()?;
            self.leave();
            return Ok(GuardExpr::Not(Box::new(inner)));
        }

        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<GuardExpr, CoreError> {
        self.skip_whitespace();

        if self.peek_char() == Some('(') {
            self.pos += 1;
            self.enter()?;
            let expr = self.parse_expr()?;
            self.leave();
            self.skip_whitespace();
            if self.peek_char() != Some(')') {
                return Err(CoreError::InvalidGuard {
                    reason: "expected ')'".to_string(),
                });
            }
            self.pos += 1;
            return Ok(expr);
        }

        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<GuardExpr, CoreError> {
        self.skip_whitespace();
        let field = self.parse_field()?;
        self.skip_whitespace();

        if self.peek_str("==") {
            self.pos += 2;
            let value = self.parse_value()?;
            return Ok(GuardExpr::Eq(field, value));
        }

        if self.peek_str("!=") {
            self.pos += 2;
            let value = self.parse_value()?;
            return Ok(GuardExpr::Ne(field, value));
        }

        if self.peek_str(">=") {
            self.pos += 2;
            return Ok(GuardExpr::Ge(field, self.parse_number()?));
        }

        if self.peek_str("<=") {
            self.pos += 2;
            return Ok(GuardExpr::Le(field, self.parse_number()?));
        }

        if self.peek_char() == Some('>') {
            self.pos += 1;
            return Ok(GuardExpr::Gt(field, self.parse_number()?));
        }

        if self.peek_char() == Some('<') {
            self.pos += 1;
            return Ok(GuardExpr::Lt(field, self.parse_number()?));
        }

        Ok(GuardExpr::Truthy(field))
    }

    fn parse_field(&mut self) -> Result<FieldRef, CoreError> {
        let scope = if self.peek_str("ctx.") {
            self.pos += 4;
            FieldScope::Context
        } else if self.peek_str("event.") {
            self.pos += 6;
            FieldScope::Event
        } else {
            return Err(CoreError::InvalidGuard {
                reason: "field must start with 'ctx.' or 'event.'".to_string(),
            });
        };

        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' || c == '.' || c == '$' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }

        let path = &self.input[start..self.pos];
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(CoreError::InvalidGuard {
                reason: format!("invalid field path '{}'", path),
            });
        }

        Ok(FieldRef {
            scope,
            path: path.to_string(),
        })
    }

    fn parse_value(&mut self) -> Result<Value, CoreError> {
        self.skip_whitespace();
        let rest = &self.input[self.pos..];

        if rest.starts_with("true") {
            self.pos += 4;
            return Ok(Value::Bool(true));
        }
        if rest.starts_with("false") {
            self.pos += 5;
            return Ok(Value::Bool(false));
        }
        if rest.starts_with("null") {
            self.pos += 4;
            return Ok(Value::Null);
        }

        if rest.starts_with('"') {
            return self.parse_string_value();
        }

        let num = self.parse_number()?;
        serde_json::Number::from_f64(num)
            .map(Value::Number)
            .ok_or_else(|| CoreError::InvalidGuard {
                reason: format!("number out of range: {}", num),
            })
    }

    /// Parses a double-quoted literal with JSON escapes.
    fn parse_string_value(&mut self) -> Result<Value, CoreError> {
        let start = self.pos;
        self.pos += 1;

        while let Some(c) = self.peek_char() {
            if c == '"' {
                self.pos += 1;
                let literal = &self.input[start..self.pos];
                return serde_json::from_str::<String>(literal)
                    .map(Value::String)
                    .map_err(|e| CoreError::InvalidGuard {
                        reason: format!("invalid string literal {}: {}", literal, e),
                    });
            }
            if c == '\\' {
                self.pos += 1;
                if let Some(escaped) = self.peek_char() {
                    self.pos += escaped.len_utf8();
                }
            } else {
                self.pos += c.len_utf8();
            }
        }

        Err(CoreError::InvalidGuard {
            reason: "unterminated string".to_string(),
        })
    }

    fn parse_number(&mut self) -> Result<f64, CoreError> {
        self.skip_whitespace();
        let start = self.pos;

        if self.peek_char() == Some('-') {
            self.pos += 1;
        }

        while matches!(self.peek_char(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }

        if self.peek_char() == Some('.') {
            self.pos += 1;
            while matches!(self.peek_char(), Some(c) if c.is_ascii_digit()) {
                self.pos += 1;
            }
        }

        let num_str = &self.input[start..self.pos];
        num_str.parse::<f64>().map_err(|_| CoreError::InvalidGuard {
            reason: format!("invalid number: '{}'", num_str),
        })
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}
