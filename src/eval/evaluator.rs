//! Evaluates the safe-expression AST against an optional name environment.
//!
//! Two name-resolution modes exist for `Expr::Name`:
//! - `Pure`: bare names are never resolvable (the parser already turns the
//!   literals `True`/`False`/`None` into dedicated AST nodes, so any
//!   remaining `Name` is a disallowed bare variable). Used by the loop
//!   condition evaluator.
//! - `WithEnv`: bare names resolve against a supplied environment, raising
//!   `UnknownVariable` rather than a parse failure when absent. Used by the
//!   condition/router block handler.

use super::ast::{ArithOp, BoolOp, CompareOp, Expr};
use crate::error::EvalError;
use serde_json::{Map, Number, Value};
use std::collections::HashMap;

#[derive(Clone, Copy)]
pub enum NameMode<'a> {
    Pure,
    WithEnv(&'a HashMap<String, Value>),
}

/// Hook for callers (the function handler) that need a wider call whitelist
/// than the base `{len, str, int, bool}` set. Returns `None` to fall back to
/// the base whitelist, `Some(Err(Disallowed))` to reject, or `Some(Ok(v))`.
pub type CallExtension<'a> = dyn Fn(&str, &[Value]) -> Option<Result<Value, EvalError>> + 'a;

/// Python-style truthiness: `None`, empty string, `0`/`0.0`, empty list/dict,
/// and `false` are falsy; everything else is truthy.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn number_value(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < (i64::MAX as f64) {
        Value::Number(Number::from(f as i64))
    } else {
        Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn as_f64(value: &Value) -> Result<f64, EvalError> {
    match value {
        Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0)),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        _ => Err(EvalError::Type(format!("expected a number, got {value}"))),
    }
}

/// Python-ish `str()` - distinct from the resolver's embedded-stringification
/// rules (`None` here renders as `"None"`, not `"null"`).
fn py_str(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => serde_json::to_string(value).unwrap_or_default(),
    }
}

pub fn eval(expr: &Expr, mode: NameMode) -> Result<Value, EvalError> {
    eval_inner(expr, mode, None)
}

/// Same evaluation rules as [`eval`], but `Expr::Call` nodes outside the base
/// whitelist are first offered to `ext` before being rejected.
pub fn eval_with_extensions(expr: &Expr, mode: NameMode, ext: &CallExtension) -> Result<Value, EvalError> {
    eval_inner(expr, mode, Some(ext))
}

fn eval_inner(expr: &Expr, mode: NameMode, ext: Option<&CallExtension>) -> Result<Value, EvalError> {
    match expr {
        Expr::Number(n) => Ok(number_value(*n)),
        Expr::Str(s) => Ok(Value::String(s.clone())),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::NoneLit => Ok(Value::Null),
        Expr::Name(name) => match mode {
            NameMode::Pure => Err(EvalError::Disallowed(format!("bare name '{name}' is not allowed"))),
            NameMode::WithEnv(env) => env
                .get(name)
                .cloned()
                .ok_or_else(|| EvalError::UnknownVariable(name.clone())),
        },
        Expr::List(items) => {
            let values = items
                .iter()
                .map(|e| eval_inner(e, mode, ext))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(values))
        }
        Expr::Dict(pairs) => {
            let mut map = Map::new();
            for (k, v) in pairs {
                let key = py_str(&eval_inner(k, mode, ext)?);
                map.insert(key, eval_inner(v, mode, ext)?);
            }
            Ok(Value::Object(map))
        }
        Expr::Subscript(base, index) => {
            let base_v = eval_inner(base, mode, ext)?;
            let index_v = eval_inner(index, mode, ext)?;
            eval_subscript(&base_v, &index_v)
        }
        Expr::Attribute(base, name) => {
            let base_v = eval_inner(base, mode, ext)?;
            match &base_v {
                Value::Object(map) => Ok(map.get(name).cloned().unwrap_or(Value::Null)),
                _ => Ok(Value::Null),
            }
        }
        Expr::Call(name, args) => eval_call(name, args, mode, ext),
        Expr::Neg(inner) => {
            let v = eval_inner(inner, mode, ext)?;
            Ok(number_value(-as_f64(&v)?))
        }
        Expr::Not(inner) => {
            let v = eval_inner(inner, mode, ext)?;
            Ok(Value::Bool(!truthy(&v)))
        }
        Expr::BoolOp(op, lhs, rhs) => {
            let l = eval_inner(lhs, mode, ext)?;
            match op {
                BoolOp::And => {
                    if !truthy(&l) {
                        Ok(l)
                    } else {
                        eval_inner(rhs, mode, ext)
                    }
                }
                BoolOp::Or => {
                    if truthy(&l) {
                        Ok(l)
                    } else {
                        eval_inner(rhs, mode, ext)
                    }
                }
            }
        }
        Expr::Compare(lhs, op, rhs) => {
            let l = eval_inner(lhs, mode, ext)?;
            let r = eval_inner(rhs, mode, ext)?;
            eval_compare(&l, *op, &r)
        }
        Expr::Arith(lhs, op, rhs) => {
            let l = eval_inner(lhs, mode, ext)?;
            let r = eval_inner(rhs, mode, ext)?;
            eval_arith(&l, *op, &r)
        }
    }
}

fn eval_subscript(base: &Value, index: &Value) -> Result<Value, EvalError> {
    match base {
        Value::Object(map) => {
            let key = py_str(index);
            Ok(map.get(&key).cloned().unwrap_or(Value::Null))
        }
        Value::Array(arr) => {
            let idx = match index {
                Value::Number(n) => n.as_i64().ok_or_else(|| EvalError::Type("non-integer index".to_string()))?,
                _ => return Err(EvalError::Type("list indices must be integers".to_string())),
            };
            let idx = if idx < 0 { arr.len() as i64 + idx } else { idx };
            if idx < 0 {
                return Err(EvalError::Type("index out of range".to_string()));
            }
            arr.get(idx as usize)
                .cloned()
                .ok_or_else(|| EvalError::Type("index out of range".to_string()))
        }
        Value::String(s) => {
            let idx = match index {
                Value::Number(n) => n.as_i64().ok_or_else(|| EvalError::Type("non-integer index".to_string()))?,
                _ => return Err(EvalError::Type("string indices must be integers".to_string())),
            };
            s.chars()
                .nth(idx.max(0) as usize)
                .map(|c| Value::String(c.to_string()))
                .ok_or_else(|| EvalError::Type("index out of range".to_string()))
        }
        _ => Err(EvalError::Type("value is not subscriptable".to_string())),
    }
}

fn eval_call(name: &str, args: &[Expr], mode: NameMode, ext: Option<&CallExtension>) -> Result<Value, EvalError> {
    let values = args
        .iter()
        .map(|a| eval_inner(a, mode, ext))
        .collect::<Result<Vec<_>, _>>()?;
    match name {
        "len" => {
            let v = values
                .first()
                .ok_or_else(|| EvalError::Type("len() requires one argument".to_string()))?;
            let n = match v {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                _ => return Err(EvalError::Type("object has no len()".to_string())),
            };
            Ok(number_value(n as f64))
        }
        "str" => Ok(Value::String(values.first().map(py_str).unwrap_or_default())),
        "int" => {
            let v = values
                .first()
                .ok_or_else(|| EvalError::Type("int() requires one argument".to_string()))?;
            let n = match v {
                Value::Number(n) => n.as_f64().unwrap_or(0.0).trunc(),
                Value::Bool(b) => {
                    if *b {
                        1.0
                    } else {
                        0.0
                    }
                }
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| EvalError::Type(format!("invalid literal for int(): '{s}'")))?
                    .trunc(),
                _ => return Err(EvalError::Type("int() argument must be a number or string".to_string())),
            };
            Ok(number_value(n))
        }
        "bool" => Ok(Value::Bool(values.first().map(truthy).unwrap_or(false))),
        other => match ext.and_then(|f| f(other, &values)) {
            Some(result) => result,
            None => Err(EvalError::Disallowed(format!("call to '{other}' is not permitted"))),
        },
    }
}

fn eval_compare(l: &Value, op: CompareOp, r: &Value) -> Result<Value, EvalError> {
    let result = match op {
        CompareOp::Eq => values_equal(l, r),
        CompareOp::NotEq => !values_equal(l, r),
        CompareOp::Lt => ordering(l, r)? == std::cmp::Ordering::Less,
        CompareOp::LtE => ordering(l, r)? != std::cmp::Ordering::Greater,
        CompareOp::Gt => ordering(l, r)? == std::cmp::Ordering::Greater,
        CompareOp::GtE => ordering(l, r)? != std::cmp::Ordering::Less,
        CompareOp::In => membership(l, r)?,
        CompareOp::NotIn => !membership(l, r)?,
    };
    Ok(Value::Bool(result))
}

fn values_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => l == r,
    }
}

fn ordering(l: &Value, r: &Value) -> Result<std::cmp::Ordering, EvalError> {
    match (l, r) {
        (Value::Number(_), Value::Number(_)) | (Value::Bool(_), Value::Number(_)) | (Value::Number(_), Value::Bool(_)) => {
            as_f64(l)?
                .partial_cmp(&as_f64(r)?)
                .ok_or_else(|| EvalError::Type("cannot compare NaN".to_string()))
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(EvalError::Type("unorderable types".to_string())),
    }
}

fn membership(l: &Value, r: &Value) -> Result<bool, EvalError> {
    match r {
        Value::Array(arr) => Ok(arr.iter().any(|v| values_equal(v, l))),
        Value::Object(map) => {
            let key = py_str(l);
            Ok(map.contains_key(&key))
        }
        Value::String(s) => match l {
            Value::String(needle) => Ok(s.contains(needle.as_str())),
            _ => Err(EvalError::Type("'in <string>' requires string as left operand".to_string())),
        },
        _ => Err(EvalError::Type("argument of type is not iterable".to_string())),
    }
}

fn eval_arith(l: &Value, op: ArithOp, r: &Value) -> Result<Value, EvalError> {
    if let (ArithOp::Add, Value::String(a), Value::String(b)) = (op, l, r) {
        return Ok(Value::String(format!("{a}{b}")));
    }
    let lf = as_f64(l)?;
    let rf = as_f64(r)?;
    let result = match op {
        ArithOp::Add => lf + rf,
        ArithOp::Sub => lf - rf,
    };
    Ok(number_value(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::parser::parse;
    use serde_json::json;

    fn eval_pure(src: &str) -> Result<Value, EvalError> {
        eval(&parse(src)?, NameMode::Pure)
    }

    fn eval_env(src: &str, env: &HashMap<String, Value>) -> Result<Value, EvalError> {
        eval(&parse(src)?, NameMode::WithEnv(env))
    }

    #[test]
    fn arithmetic() {
        assert_eq!(eval_pure("1 + 1").unwrap(), json!(2));
        assert_eq!(eval_pure("10 - 3").unwrap(), json!(7));
    }

    #[test]
    fn comparisons_and_boolean_ops() {
        assert_eq!(eval_pure("1 < 2 and 2 < 3").unwrap(), json!(true));
        assert_eq!(eval_pure("not (1 == 2)").unwrap(), json!(true));
        assert_eq!(eval_pure("3 in [1,2,3]").unwrap(), json!(true));
    }

    #[test]
    fn pure_mode_rejects_bare_names() {
        assert!(eval_pure("x > 1").is_err());
    }

    #[test]
    fn with_env_resolves_bare_names() {
        let mut env = HashMap::new();
        env.insert("x".to_string(), json!(10));
        assert_eq!(eval_env("x > 5", &env).unwrap(), json!(true));
    }

    #[test]
    fn with_env_unknown_name_errs() {
        let env = HashMap::new();
        assert!(eval_env("missing > 1", &env).is_err());
    }

    #[test]
    fn whitelisted_calls() {
        assert_eq!(eval_pure("len([1,2,3])").unwrap(), json!(3));
        assert_eq!(eval_pure("str(5)").unwrap(), json!("5"));
        assert_eq!(eval_pure("bool(0)").unwrap(), json!(false));
    }

    #[test]
    fn disallowed_call_fails() {
        assert!(eval_pure("eval('1')").is_err());
    }
}
