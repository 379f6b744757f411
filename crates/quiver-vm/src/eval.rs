//! Tree-walking evaluator over JSON values.
//!
//! Selection of a missing map key raises [`EvalError::NoSuchKey`], which
//! the caller treats as a soft miss (the program is false, not an error).
//! Everything else raises [`EvalError::Runtime`] and propagates.

use std::cmp::Ordering;

use serde_json::Value;

use crate::ast::{BinaryOp, Expr, UnaryOp};

#[derive(Debug)]
pub(crate) enum EvalError {
    NoSuchKey(String),
    Runtime(String),
}

type EvalResult = std::result::Result<Value, EvalError>;

pub(crate) fn eval(expr: &Expr, root: &Value) -> EvalResult {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Ident(name) => root
            .get(name.as_str())
            .cloned()
            .ok_or_else(|| EvalError::NoSuchKey(name.clone())),
        Expr::Select { target, field } => {
            let value = eval(target, root)?;
            match value {
                Value::Object(map) => map
                    .get(field.as_str())
                    .cloned()
                    .ok_or_else(|| EvalError::NoSuchKey(field.clone())),
                other => Err(EvalError::Runtime(format!(
                    "cannot select {:?} from {}",
                    field,
                    kind(&other)
                ))),
            }
        }
        Expr::Call { target, method, args } => {
            let value = eval(target, root)?;
            let args = args.iter().map(|a| eval(a, root)).collect::<Result<Vec<_>, _>>()?;
            call(&value, method, &args)
        }
        Expr::Unary { op, expr } => {
            let value = eval(expr, root)?;
            match op {
                UnaryOp::Not => match value {
                    Value::Bool(b) => Ok(Value::Bool(!b)),
                    other => Err(EvalError::Runtime(format!("cannot negate {}", kind(&other)))),
                },
                UnaryOp::Neg => match Num::of(&value) {
                    Some(Num::Int(i)) => i
                        .checked_neg()
                        .map(Value::from)
                        .ok_or_else(|| EvalError::Runtime("integer overflow".to_string())),
                    Some(Num::Float(f)) => float(-f),
                    None => Err(EvalError::Runtime(format!("cannot negate {}", kind(&value)))),
                },
            }
        }
        Expr::Binary { op, lhs, rhs } => binary(*op, lhs, rhs, root),
    }
}

fn binary(op: BinaryOp, lhs: &Expr, rhs: &Expr, root: &Value) -> EvalResult {
    // Boolean operators short-circuit left to right.
    if op == BinaryOp::Or {
        if as_bool(&eval(lhs, root)?)? {
            return Ok(Value::Bool(true));
        }
        return Ok(Value::Bool(as_bool(&eval(rhs, root)?)?));
    }
    if op == BinaryOp::And {
        if !as_bool(&eval(lhs, root)?)? {
            return Ok(Value::Bool(false));
        }
        return Ok(Value::Bool(as_bool(&eval(rhs, root)?)?));
    }

    let left = eval(lhs, root)?;
    let right = eval(rhs, root)?;
    match op {
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(&left, &right))),
        BinaryOp::Ne => Ok(Value::Bool(!loose_eq(&left, &right))),
        BinaryOp::Lt => ordered(&left, &right).map(|o| Value::Bool(o == Ordering::Less)),
        BinaryOp::Le => ordered(&left, &right).map(|o| Value::Bool(o != Ordering::Greater)),
        BinaryOp::Gt => ordered(&left, &right).map(|o| Value::Bool(o == Ordering::Greater)),
        BinaryOp::Ge => ordered(&left, &right).map(|o| Value::Bool(o != Ordering::Less)),
        BinaryOp::In => membership(&left, &right),
        BinaryOp::Add => match (&left, &right) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
            _ => arithmetic(op, &left, &right),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => arithmetic(op, &left, &right),
        BinaryOp::Or | BinaryOp::And => unreachable!("handled above"),
    }
}

fn call(target: &Value, method: &str, args: &[Value]) -> EvalResult {
    match method {
        "size" => match target {
            Value::String(s) => Ok(Value::from(s.len() as i64)),
            Value::Array(items) => Ok(Value::from(items.len() as i64)),
            Value::Object(map) => Ok(Value::from(map.len() as i64)),
            other => Err(EvalError::Runtime(format!("size() on {}", kind(other)))),
        },
        "contains" => {
            let needle = one_arg(method, args)?;
            match target {
                Value::String(s) => match needle {
                    Value::String(sub) => Ok(Value::Bool(s.contains(sub.as_str()))),
                    other => {
                        Err(EvalError::Runtime(format!("contains() with {}", kind(other))))
                    }
                },
                Value::Array(items) => Ok(Value::Bool(items.iter().any(|v| loose_eq(v, needle)))),
                Value::Object(map) => match needle {
                    Value::String(key) => Ok(Value::Bool(map.contains_key(key.as_str()))),
                    other => {
                        Err(EvalError::Runtime(format!("contains() with {}", kind(other))))
                    }
                },
                other => Err(EvalError::Runtime(format!("contains() on {}", kind(other)))),
            }
        }
        "startsWith" => match (target, one_arg(method, args)?) {
            (Value::String(s), Value::String(prefix)) => {
                Ok(Value::Bool(s.starts_with(prefix.as_str())))
            }
            (t, a) => Err(EvalError::Runtime(format!(
                "startsWith() on {} with {}",
                kind(t),
                kind(a)
            ))),
        },
        "endsWith" => match (target, one_arg(method, args)?) {
            (Value::String(s), Value::String(suffix)) => {
                Ok(Value::Bool(s.ends_with(suffix.as_str())))
            }
            (t, a) => Err(EvalError::Runtime(format!(
                "endsWith() on {} with {}",
                kind(t),
                kind(a)
            ))),
        },
        other => Err(EvalError::Runtime(format!("no such method: {}", other))),
    }
}

fn one_arg<'a>(method: &str, args: &'a [Value]) -> Result<&'a Value, EvalError> {
    match args {
        [arg] => Ok(arg),
        _ => Err(EvalError::Runtime(format!(
            "{}() takes one argument, got {}",
            method,
            args.len()
        ))),
    }
}

fn membership(needle: &Value, haystack: &Value) -> EvalResult {
    match haystack {
        Value::Array(items) => Ok(Value::Bool(items.iter().any(|v| loose_eq(v, needle)))),
        Value::Object(map) => match needle {
            Value::String(key) => Ok(Value::Bool(map.contains_key(key.as_str()))),
            other => Err(EvalError::Runtime(format!("{} in map", kind(other)))),
        },
        other => Err(EvalError::Runtime(format!("membership test on {}", kind(other)))),
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> EvalResult {
    let (a, b) = match (Num::of(left), Num::of(right)) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(EvalError::Runtime(format!(
                "arithmetic on {} and {}",
                kind(left),
                kind(right)
            )))
        }
    };
    match (a, b) {
        (Num::Int(a), Num::Int(b)) => {
            let result = match op {
                BinaryOp::Add => a.checked_add(b),
                BinaryOp::Sub => a.checked_sub(b),
                BinaryOp::Mul => a.checked_mul(b),
                BinaryOp::Div => {
                    if b == 0 {
                        return Err(EvalError::Runtime("division by zero".to_string()));
                    }
                    a.checked_div(b)
                }
                _ => unreachable!("non-arithmetic op"),
            };
            result
                .map(Value::from)
                .ok_or_else(|| EvalError::Runtime("integer overflow".to_string()))
        }
        (a, b) => {
            let (a, b) = (a.as_f64(), b.as_f64());
            match op {
                BinaryOp::Add => float(a + b),
                BinaryOp::Sub => float(a - b),
                BinaryOp::Mul => float(a * b),
                BinaryOp::Div => {
                    if b == 0.0 {
                        Err(EvalError::Runtime("division by zero".to_string()))
                    } else {
                        float(a / b)
                    }
                }
                _ => unreachable!("non-arithmetic op"),
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn of(value: &Value) -> Option<Num> {
        match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Num::Int(i))
                } else {
                    n.as_f64().map(Num::Float)
                }
            }
            _ => None,
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

fn float(f: f64) -> EvalResult {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| EvalError::Runtime(format!("non-finite result: {}", f)))
}

fn as_bool(value: &Value) -> Result<bool, EvalError> {
    match value {
        Value::Bool(b) => Ok(*b),
        other => Err(EvalError::Runtime(format!("expected bool, got {}", kind(other)))),
    }
}

/// Equality with numeric cross-type comparison (`1 == 1.0` holds).
fn loose_eq(left: &Value, right: &Value) -> bool {
    match (Num::of(left), Num::of(right)) {
        (Some(a), Some(b)) => match (a, b) {
            (Num::Int(a), Num::Int(b)) => a == b,
            (a, b) => a.as_f64() == b.as_f64(),
        },
        _ => left == right,
    }
}

fn ordered(left: &Value, right: &Value) -> Result<Ordering, EvalError> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => match (Num::of(left), Num::of(right)) {
            (Some(Num::Int(a)), Some(Num::Int(b))) => Ok(a.cmp(&b)),
            (Some(a), Some(b)) => a
                .as_f64()
                .partial_cmp(&b.as_f64())
                .ok_or_else(|| EvalError::Runtime("incomparable floats".to_string())),
            _ => Err(EvalError::Runtime(format!(
                "cannot compare {} and {}",
                kind(left),
                kind(right)
            ))),
        },
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}
