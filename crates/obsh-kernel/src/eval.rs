//! Evaluable closures: operator parameters written as small expressions.
//!
//! Operators such as `map` and `select` are parameterised with closure text
//! like `|x| x * 2`. The text is compiled once, at setup, and called once per
//! item. A compile failure is a command-fatal condition; an evaluation
//! failure only affects the item being processed.
//!
//! Supports:
//! - Literals: integers, floats, `"strings"`, `true`, `false`, `null`, `[lists]`
//! - Arithmetic: `+`, `-`, `*`, `/`, `%` (`+` also concatenates strings and lists)
//! - Comparison: `==`, `!=`, `<`, `<=`, `>`, `>=`
//! - Logic: `&&`, `||`, `!`
//! - Field access `x.name` and indexing `x[0]`
//! - Names resolve to parameters, then captured bindings, then environment
//!   variables; unknown names are an error
//!
//! Does NOT support assignment, function calls or loops.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use obsh_types::Value;

use crate::env::Env;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("syntax error in {text:?}: {message}")]
    Syntax { text: String, message: String },

    #[error("{0}")]
    Runtime(String),
}

fn runtime(message: impl Into<String>) -> EvalError {
    EvalError::Runtime(message.into())
}

/// Closure source text plus the bindings it captured when it was written.
///
/// This is what travels to workers and remote runners; it is compiled again
/// on the other side. Deserialises from either a bare string or the full
/// `{source, captured}` form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "EvaluableRepr")]
pub struct Evaluable {
    pub source: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub captured: BTreeMap<String, Value>,
}

impl Evaluable {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            captured: BTreeMap::new(),
        }
    }

    /// Bind a name visible to the closure body.
    pub fn capture(mut self, name: impl Into<String>, value: Value) -> Self {
        self.captured.insert(name.into(), value);
        self
    }

    pub fn compile(&self) -> Result<Callable, EvalError> {
        let mut parser = Parser::new(&self.source);
        let params = parser.parse_params()?;
        let body = parser.parse_expr()?;
        parser.expect_end()?;
        Ok(Callable {
            params,
            body,
            captured: self.captured.clone(),
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EvaluableRepr {
    Text(String),
    Full {
        source: String,
        #[serde(default)]
        captured: BTreeMap<String, Value>,
    },
}

impl From<EvaluableRepr> for Evaluable {
    fn from(repr: EvaluableRepr) -> Self {
        match repr {
            EvaluableRepr::Text(source) => Evaluable::new(source),
            EvaluableRepr::Full { source, captured } => Evaluable { source, captured },
        }
    }
}

impl From<&str> for Evaluable {
    fn from(source: &str) -> Self {
        Evaluable::new(source)
    }
}

/// A compiled closure.
#[derive(Debug, Clone)]
pub struct Callable {
    params: Vec<String>,
    body: Expr,
    captured: BTreeMap<String, Value>,
}

impl Callable {
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Call with one argument per parameter.
    pub fn call(&self, args: &[Value], env: &Env) -> Result<Value, EvalError> {
        if args.len() != self.params.len() {
            return Err(runtime(format!(
                "expected {} argument(s), got {}",
                self.params.len(),
                args.len()
            )));
        }
        let bindings = Bindings {
            params: &self.params,
            args,
            captured: &self.captured,
            env,
        };
        bindings.eval(&self.body)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Lit(Value),
    Name(String),
    List(Vec<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Field(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
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
    And,
    Or,
}

struct Bindings<'a> {
    params: &'a [String],
    args: &'a [Value],
    captured: &'a BTreeMap<String, Value>,
    env: &'a Env,
}

impl Bindings<'_> {
    fn lookup(&self, name: &str) -> Result<Value, EvalError> {
        if let Some(i) = self.params.iter().position(|p| p == name) {
            return Ok(self.args[i].clone());
        }
        if let Some(v) = self.captured.get(name) {
            return Ok(v.clone());
        }
        self.env
            .get(name)
            .cloned()
            .ok_or_else(|| runtime(format!("unknown name: {}", name)))
    }

    fn eval(&self, expr: &Expr) -> Result<Value, EvalError> {
        match expr {
            Expr::Lit(v) => Ok(v.clone()),
            Expr::Name(name) => self.lookup(name),
            Expr::List(items) => items
                .iter()
                .map(|e| self.eval(e))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            Expr::Not(inner) => Ok(Value::Bool(!self.eval(inner)?.is_truthy())),
            Expr::Neg(inner) => match self.eval(inner)? {
                Value::Int(i) => i
                    .checked_neg()
                    .map(Value::Int)
                    .ok_or_else(|| runtime("overflow in negation")),
                Value::Float(f) => Ok(Value::Float(-f)),
                other => Err(runtime(format!("cannot negate {}", other.type_name()))),
            },
            Expr::Binary(BinOp::And, l, r) => {
                let left = self.eval(l)?;
                if !left.is_truthy() {
                    return Ok(left);
                }
                self.eval(r)
            }
            Expr::Binary(BinOp::Or, l, r) => {
                let left = self.eval(l)?;
                if left.is_truthy() {
                    return Ok(left);
                }
                self.eval(r)
            }
            Expr::Binary(op, l, r) => binary(*op, self.eval(l)?, self.eval(r)?),
            Expr::Field(inner, name) => match self.eval(inner)? {
                Value::Record(fields) => fields
                    .get(name)
                    .cloned()
                    .ok_or_else(|| runtime(format!("no field {:?}", name))),
                other => Err(runtime(format!(
                    "cannot read field {:?} of {}",
                    name,
                    other.type_name()
                ))),
            },
            Expr::Index(inner, index) => {
                let target = self.eval(inner)?;
                let index = self.eval(index)?;
                index_value(&target, &index)
            }
        }
    }
}

fn index_value(target: &Value, index: &Value) -> Result<Value, EvalError> {
    match (target, index) {
        (Value::List(items), Value::Int(i)) => {
            let len = items.len() as i64;
            let pos = if *i < 0 { len + i } else { *i };
            if pos < 0 || pos >= len {
                return Err(runtime(format!("index {} out of range for length {}", i, len)));
            }
            Ok(items[pos as usize].clone())
        }
        (Value::Record(fields), Value::Str(key)) => fields
            .get(key)
            .cloned()
            .ok_or_else(|| runtime(format!("no field {:?}", key))),
        (t, i) => Err(runtime(format!(
            "cannot index {} with {}",
            t.type_name(),
            i.type_name()
        ))),
    }
}

fn binary(op: BinOp, left: Value, right: Value) -> Result<Value, EvalError> {
    use Value::{Float, Int, List, Str};

    let cmp = |l: &Value, r: &Value| l.total_cmp(r);
    match op {
        BinOp::Eq => return Ok(Value::Bool(cmp(&left, &right) == Ordering::Equal)),
        BinOp::Ne => return Ok(Value::Bool(cmp(&left, &right) != Ordering::Equal)),
        BinOp::Lt => return Ok(Value::Bool(cmp(&left, &right) == Ordering::Less)),
        BinOp::Le => return Ok(Value::Bool(cmp(&left, &right) != Ordering::Greater)),
        BinOp::Gt => return Ok(Value::Bool(cmp(&left, &right) == Ordering::Greater)),
        BinOp::Ge => return Ok(Value::Bool(cmp(&left, &right) != Ordering::Less)),
        _ => {}
    }

    match (op, left, right) {
        (BinOp::Add, Str(a), Str(b)) => Ok(Str(a + &b)),
        (BinOp::Add, List(mut a), List(b)) => {
            a.extend(b);
            Ok(List(a))
        }
        (op, Int(a), Int(b)) => int_op(op, a, b),
        (op, Int(a), Float(b)) => float_op(op, a as f64, b),
        (op, Float(a), Int(b)) => float_op(op, a, b as f64),
        (op, Float(a), Float(b)) => float_op(op, a, b),
        (op, l, r) => Err(runtime(format!(
            "unsupported operands for {:?}: {} and {}",
            op,
            l.type_name(),
            r.type_name()
        ))),
    }
}

fn int_op(op: BinOp, a: i64, b: i64) -> Result<Value, EvalError> {
    let result = match op {
        BinOp::Add => a.checked_add(b).ok_or_else(|| runtime("overflow in addition"))?,
        BinOp::Sub => a.checked_sub(b).ok_or_else(|| runtime("overflow in subtraction"))?,
        BinOp::Mul => a.checked_mul(b).ok_or_else(|| runtime("overflow in multiplication"))?,
        BinOp::Div => {
            if b == 0 {
                return Err(runtime("division by zero"));
            }
            a.checked_div(b).ok_or_else(|| runtime("overflow in division"))?
        }
        BinOp::Rem => {
            if b == 0 {
                return Err(runtime("modulo by zero"));
            }
            a.checked_rem(b).ok_or_else(|| runtime("overflow in modulo"))?
        }
        _ => unreachable!("comparison and logic handled by caller"),
    };
    Ok(Value::Int(result))
}

fn float_op(op: BinOp, a: f64, b: f64) -> Result<Value, EvalError> {
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(runtime("division by zero"));
            }
            a / b
        }
        BinOp::Rem => {
            if b == 0.0 {
                return Err(runtime("modulo by zero"));
            }
            a % b
        }
        _ => unreachable!("comparison and logic handled by caller"),
    };
    Ok(Value::Float(result))
}

/// Recursive descent parser over the closure text.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn error(&self, message: impl Into<String>) -> EvalError {
        EvalError::Syntax {
            text: self.input.to_string(),
            message: message.into(),
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.input[self.pos..].chars().next() {
            if ch.is_whitespace() {
                self.pos += ch.len_utf8();
            } else {
                break;
            }
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_whitespace();
        self.input[self.pos..].chars().next()
    }

    fn rest(&mut self) -> &str {
        self.skip_whitespace();
        &self.input[self.pos..]
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &str) -> Result<(), EvalError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(format!("expected {:?}", token)))
        }
    }

    fn expect_end(&mut self) -> Result<(), EvalError> {
        if self.rest().is_empty() {
            Ok(())
        } else {
            let trailing = self.rest().to_string();
            Err(self.error(format!("unexpected trailing input: {:?}", trailing)))
        }
    }

    /// `|a, b|` prefix. Absent bars mean no parameters.
    fn parse_params(&mut self) -> Result<Vec<String>, EvalError> {
        if self.rest().starts_with("||") {
            self.pos += 2;
            return Ok(Vec::new());
        }
        if !self.eat("|") {
            return Ok(Vec::new());
        }
        let mut params = Vec::new();
        if self.eat("|") {
            return Ok(params);
        }
        loop {
            params.push(self.parse_identifier()?);
            if self.eat(",") {
                continue;
            }
            self.expect("|")?;
            return Ok(params);
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, EvalError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_and()?;
        while self.eat("||") {
            let right = self.parse_and()?;
            left = Expr::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_comparison()?;
        while self.eat("&&") {
            let right = self.parse_comparison()?;
            left = Expr::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, EvalError> {
        let left = self.parse_additive()?;
        // Two-character operators first so `<=` is not read as `<`.
        let op = if self.eat("==") {
            BinOp::Eq
        } else if self.eat("!=") {
            BinOp::Ne
        } else if self.eat("<=") {
            BinOp::Le
        } else if self.eat(">=") {
            BinOp::Ge
        } else if self.eat("<") {
            BinOp::Lt
        } else if self.eat(">") {
            BinOp::Gt
        } else {
            return Ok(left);
        };
        let right = self.parse_additive()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_additive(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Some('+') => BinOp::Add,
                Some('-') => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some('*') => BinOp::Mul,
                Some('/') => BinOp::Div,
                Some('%') => BinOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, EvalError> {
        if self.rest().starts_with('!') && !self.rest().starts_with("!=") {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        match self.peek() {
            Some('-') => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.parse_unary()?)))
            }
            Some('+') => {
                self.pos += 1;
                self.parse_unary()
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, EvalError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(".") {
                let name = self.parse_identifier()?;
                expr = Expr::Field(Box::new(expr), name);
            } else if self.eat("[") {
                let index = self.parse_expr()?;
                self.expect("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, EvalError> {
        match self.peek() {
            Some('(') => {
                self.pos += 1;
                let inner = self.parse_expr()?;
                self.expect(")")?;
                Ok(inner)
            }
            Some('[') => {
                self.pos += 1;
                let mut items = Vec::new();
                if self.eat("]") {
                    return Ok(Expr::List(items));
                }
                loop {
                    items.push(self.parse_expr()?);
                    if self.eat(",") {
                        continue;
                    }
                    self.expect("]")?;
                    return Ok(Expr::List(items));
                }
            }
            Some('"') => self.parse_string(),
            Some(c) if c.is_ascii_digit() => self.parse_number(),
            Some(c) if c.is_alphabetic() || c == '_' => {
                let name = self.parse_identifier()?;
                Ok(match name.as_str() {
                    "true" => Expr::Lit(Value::Bool(true)),
                    "false" => Expr::Lit(Value::Bool(false)),
                    "null" => Expr::Lit(Value::Null),
                    _ => Expr::Name(name),
                })
            }
            Some(c) => Err(self.error(format!("unexpected character {:?}", c))),
            None => Err(self.error("unexpected end of expression")),
        }
    }

    fn parse_number(&mut self) -> Result<Expr, EvalError> {
        let start = self.pos;
        let mut seen_dot = false;
        while let Some(ch) = self.input[self.pos..].chars().next() {
            if ch.is_ascii_digit() {
                self.pos += 1;
            } else if ch == '.'
                && !seen_dot
                && self.input[self.pos + 1..]
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_digit())
            {
                seen_dot = true;
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = &self.input[start..self.pos];
        if seen_dot {
            text.parse::<f64>()
                .map(|f| Expr::Lit(Value::Float(f)))
                .map_err(|e| self.error(format!("invalid number {:?}: {}", text, e)))
        } else {
            text.parse::<i64>()
                .map(|i| Expr::Lit(Value::Int(i)))
                .map_err(|e| self.error(format!("invalid number {:?}: {}", text, e)))
        }
    }

    fn parse_string(&mut self) -> Result<Expr, EvalError> {
        self.pos += 1; // opening quote
        let mut out = String::new();
        let mut chars = self.input[self.pos..].char_indices();
        while let Some((offset, ch)) = chars.next() {
            match ch {
                '"' => {
                    self.pos += offset + 1;
                    return Ok(Expr::Lit(Value::Str(out)));
                }
                '\\' => match chars.next() {
                    Some((_, 'n')) => out.push('\n'),
                    Some((_, 't')) => out.push('\t'),
                    Some((_, other)) => out.push(other),
                    None => break,
                },
                other => out.push(other),
            }
        }
        Err(self.error("unterminated string"))
    }

    fn parse_identifier(&mut self) -> Result<String, EvalError> {
        self.skip_whitespace();
        let start = self.pos;
        while let Some(ch) = self.input[self.pos..].chars().next() {
            if ch.is_alphanumeric() || ch == '_' {
                self.pos += ch.len_utf8();
            } else {
                break;
            }
        }
        if start == self.pos {
            return Err(self.error("expected identifier"));
        }
        Ok(self.input[start..self.pos].to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn call(source: &str, args: &[Value]) -> Result<Value, EvalError> {
        let env = Env::new("/");
        Evaluable::new(source).compile()?.call(args, &env)
    }

    #[rstest]
    #[case("|x| x * 2", 21, Value::Int(42))]
    #[case("|x| x + 1 * 2", 1, Value::Int(3))]
    #[case("|x| (x + 1) * 2", 1, Value::Int(4))]
    #[case("|x| x % 3 == 1", 4, Value::Bool(true))]
    #[case("|x| -x", 5, Value::Int(-5))]
    #[case("|x| x / 2.0", 3, Value::Float(1.5))]
    #[case("|x| x > 1 && x < 5", 3, Value::Bool(true))]
    #[case("|x| !(x >= 3)", 3, Value::Bool(false))]
    #[case("|x| [x, x + 1][1]", 7, Value::Int(8))]
    fn test_single_argument(#[case] source: &str, #[case] arg: i64, #[case] expected: Value) {
        assert_eq!(call(source, &[Value::Int(arg)]).unwrap(), expected);
    }

    #[test]
    fn test_two_parameters() {
        let result = call("|a, b| a + b", &[Value::Int(2), Value::Int(3)]).unwrap();
        assert_eq!(result, Value::Int(5));
    }

    #[test]
    fn test_no_parameters() {
        assert_eq!(call("1 + 2", &[]).unwrap(), Value::Int(3));
        assert_eq!(call("|| 7", &[]).unwrap(), Value::Int(7));
    }

    #[test]
    fn test_string_concat() {
        let result = call(r#"|s| s + "!""#, &[Value::from("hi")]).unwrap();
        assert_eq!(result, Value::from("hi!"));
    }

    #[test]
    fn test_field_access() {
        let mut fields = BTreeMap::new();
        fields.insert("pid".to_string(), Value::Int(42));
        let result = call("|p| p.pid", &[Value::Record(fields)]).unwrap();
        assert_eq!(result, Value::Int(42));
    }

    #[test]
    fn test_captured_binding() {
        let env = Env::new("/");
        let f = Evaluable::new("|x| x * factor")
            .capture("factor", Value::Int(10))
            .compile()
            .unwrap();
        assert_eq!(f.call(&[Value::Int(3)], &env).unwrap(), Value::Int(30));
    }

    #[test]
    fn test_environment_variable() {
        let mut env = Env::new("/");
        env.set("offset", Value::Int(100));
        let f = Evaluable::new("|x| x + offset").compile().unwrap();
        assert_eq!(f.call(&[Value::Int(1)], &env).unwrap(), Value::Int(101));
    }

    #[rstest]
    #[case("|x| x / 0")]
    #[case("|x| x % 0")]
    #[case("|x| y")]
    #[case("|x| x.field")]
    #[case("|x| [1][x]")]
    fn test_runtime_errors(#[case] source: &str) {
        assert!(matches!(
            call(source, &[Value::Int(5)]),
            Err(EvalError::Runtime(_))
        ));
    }

    #[rstest]
    #[case("|x x")]
    #[case("|x| (x")]
    #[case("|x| x +")]
    #[case("|x| x $")]
    #[case(r#"|x| "open"#)]
    fn test_syntax_errors(#[case] source: &str) {
        assert!(matches!(
            Evaluable::new(source).compile(),
            Err(EvalError::Syntax { .. })
        ));
    }

    #[test]
    fn test_wrong_arity() {
        assert!(call("|a, b| a", &[Value::Int(1)]).is_err());
    }

    #[test]
    fn test_overflow_is_an_error() {
        let result = call("|x| x * 2", &[Value::Int(i64::MAX)]);
        assert!(result.is_err());
    }

    #[test]
    fn test_deserialises_from_bare_string() {
        let short: Evaluable = serde_json::from_str(r#""|x| x + n""#).unwrap();
        assert_eq!(short, Evaluable::new("|x| x + n"));

        let full: Evaluable =
            serde_json::from_str(r#"{"source": "|x| x + n", "captured": {"n": {"Int": 1}}}"#).unwrap();
        assert_eq!(full, Evaluable::new("|x| x + n").capture("n", Value::Int(1)));
    }
}
