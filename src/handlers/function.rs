//! Function handler: runs pre-language-neutralized user code.
//!
//! Every `<path>` reference in the code string is rendered as a literal
//! before anything is parsed (`resolver::resolve_code_literals`), then the
//! result is executed as a short sequence of statements by a tiny
//! interpreter built on the same AST the safe expression evaluator (§4.2)
//! uses, extended with assignment and a wider call whitelist. If the
//! program assigns `__return__`, that value becomes the block's output;
//! otherwise `{executed: true}`. Exceptions never propagate - they become
//! `{error, traceback, resolvedCode}`.

use super::{BlockHandler, HandlerDeps};
use crate::engine::context::ExecutionContext;
use crate::eval::{self, evaluator::NameMode, CallExtension};
use crate::model::Block;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

pub struct FunctionHandler;

#[async_trait]
impl BlockHandler for FunctionHandler {
    fn can_handle(&self, block_type: &str) -> bool {
        matches!(block_type, "function" | "code")
    }

    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        block: &Block,
        _resolved_inputs: &Map<String, Value>,
        _deps: &HandlerDeps,
    ) -> anyhow::Result<Value> {
        let raw_code = block
            .inputs
            .get("code")
            .and_then(|v| v.as_str())
            .unwrap_or("");

        let resolved_code = crate::resolver::resolve_code_literals(raw_code, ctx);

        let context_map = build_context_map(ctx);

        match run_program(&resolved_code, context_map) {
            Ok(Some(return_value)) => Ok(return_value),
            Ok(None) => Ok(json!({"executed": true})),
            Err(message) => Ok(json!({
                "error": message,
                "traceback": message,
                "resolvedCode": resolved_code,
            })),
        }
    }
}

/// Builds the `context` mapping exposed to function code: `start`,
/// `variable`, every block output by normalized name, plus `_loop` when one
/// is present. This mirrors the reference resolver's own root selection so
/// `context['variable']['x']`-style access inside code agrees with `<variable.x>`.
fn build_context_map(ctx: &ExecutionContext) -> Value {
    let mut map = Map::new();
    map.insert("start".to_string(), Value::Object(ctx.inputs.clone()));
    map.insert("variable".to_string(), Value::Object(ctx.workflow_variables.clone()));
    for (k, v) in &ctx.block_outputs {
        map.insert(k.clone(), v.clone());
    }
    Value::Object(map)
}

/// A single parsed statement: either `name = expr` or a bare expression
/// (evaluated, result discarded - matches the "only __return__ matters"
/// contract).
enum Stmt {
    Assign(String, eval::Expr),
    Expr(eval::Expr),
}

fn split_statements(code: &str) -> Vec<&str> {
    code.split(['\n', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.starts_with('#'))
        .collect()
}

/// Finds the top-level `=` that separates an assignment target from its
/// expression, ignoring `==`, `!=`, `<=`, `>=` and anything nested inside
/// brackets or string literals.
fn find_assign_split(stmt: &str) -> Option<usize> {
    let bytes = stmt.as_bytes();
    let mut depth = 0i32;
    let mut in_string: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if let Some(q) = in_string {
            if c == b'\\' {
                i += 1;
            } else if c == q {
                in_string = None;
            }
        } else {
            match c {
                b'\'' | b'"' => in_string = Some(c),
                b'(' | b'[' | b'{' => depth += 1,
                b')' | b']' | b'}' => depth -= 1,
                b'=' if depth == 0 => {
                    let prev = if i > 0 { bytes[i - 1] } else { 0 };
                    let next = bytes.get(i + 1).copied().unwrap_or(0);
                    let is_comparison = matches!(prev, b'=' | b'!' | b'<' | b'>') || next == b'=';
                    if !is_comparison {
                        return Some(i);
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }
    None
}

fn is_valid_target(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_statement(stmt: &str) -> Result<Stmt, String> {
    if let Some(split) = find_assign_split(stmt) {
        let target = stmt[..split].trim();
        let rhs = stmt[split + 1..].trim();
        if is_valid_target(target) {
            let expr = eval::parse(rhs).map_err(|e| e.to_string())?;
            return Ok(Stmt::Assign(target.to_string(), expr));
        }
    }
    let expr = eval::parse(stmt).map_err(|e| e.to_string())?;
    Ok(Stmt::Expr(expr))
}

/// Extended call whitelist for function-handler code, beyond the base
/// `{len, str, int, bool}` the expression evaluator already allows: list and
/// dict constructors, JSON encode/decode, and a minimal `isinstance`.
fn extensions() -> impl Fn(&str, &[Value]) -> Option<Result<Value, crate::error::EvalError>> {
    |name: &str, values: &[Value]| -> Option<Result<Value, crate::error::EvalError>> {
        use crate::error::EvalError;
        match name {
            "list" => Some(Ok(match values.first() {
                Some(Value::Array(a)) => Value::Array(a.clone()),
                Some(Value::Object(o)) => Value::Array(o.keys().map(|k| Value::String(k.clone())).collect()),
                Some(Value::String(s)) => Value::Array(s.chars().map(|c| Value::String(c.to_string())).collect()),
                None => Value::Array(vec![]),
                _ => Value::Array(vec![]),
            })),
            "dict" => Some(Ok(match values.first() {
                Some(v @ Value::Object(_)) => v.clone(),
                None => Value::Object(Map::new()),
                _ => Value::Object(Map::new()),
            })),
            "float" => Some(
                values
                    .first()
                    .and_then(|v| match v {
                        Value::Number(n) => n.as_f64(),
                        Value::String(s) => s.trim().parse::<f64>().ok(),
                        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
                        _ => None,
                    })
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(|| EvalError::Type("float() argument must be a number or string".to_string())),
            ),
            "json_encode" | "json_dumps" => Some(
                values
                    .first()
                    .map(|v| Value::String(serde_json::to_string(v).unwrap_or_default()))
                    .ok_or_else(|| EvalError::Type("json_encode() requires one argument".to_string())),
            ),
            "json_decode" | "json_loads" => Some(match values.first() {
                Some(Value::String(s)) => {
                    serde_json::from_str(s).map_err(|e| EvalError::Type(format!("invalid JSON: {e}")))
                }
                _ => Err(EvalError::Type("json_decode() requires a string argument".to_string())),
            }),
            "isinstance" => Some(
                (|| {
                    let value = values.first().ok_or_else(|| EvalError::Type("isinstance() requires two arguments".to_string()))?;
                    let type_name = match values.get(1) {
                        Some(Value::String(s)) => s.as_str(),
                        _ => return Err(EvalError::Type("isinstance() second argument must be a type name".to_string())),
                    };
                    let matches = match type_name {
                        "str" => matches!(value, Value::String(_)),
                        "int" | "float" => matches!(value, Value::Number(_)),
                        "bool" => matches!(value, Value::Bool(_)),
                        "list" => matches!(value, Value::Array(_)),
                        "dict" => matches!(value, Value::Object(_)),
                        "NoneType" => matches!(value, Value::Null),
                        _ => false,
                    };
                    Ok(Value::Bool(matches))
                })(),
            ),
            _ => None,
        }
    }
}

/// Runs the substituted program: a short sequence of `name = expr` / bare
/// expression statements sharing one environment (seeded with `context`).
/// Returns `Ok(Some(value))` if `__return__` was ever assigned.
fn run_program(code: &str, context_map: Value) -> Result<Option<Value>, String> {
    let mut env: HashMap<String, Value> = HashMap::new();
    env.insert("context".to_string(), context_map);

    let ext = extensions();
    let ext_ref: &CallExtension = &ext;

    for stmt_src in split_statements(code) {
        let stmt = parse_statement(stmt_src)?;
        match stmt {
            Stmt::Assign(name, expr) => {
                let value = eval::evaluator::eval_with_extensions(&expr, NameMode::WithEnv(&env), ext_ref)
                    .map_err(|e| format!("{stmt_src}: {e}"))?;
                env.insert(name, value);
            }
            Stmt::Expr(expr) => {
                eval::evaluator::eval_with_extensions(&expr, NameMode::WithEnv(&env), ext_ref)
                    .map_err(|e| format!("{stmt_src}: {e}"))?;
            }
        }
    }

    Ok(env.remove("__return__"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn assigns_and_returns() {
        let result = run_program("x = 1 + 2\n__return__ = {\"v\": x}", json!({})).unwrap();
        assert_eq!(result, Some(json!({"v": 3})));
    }

    #[test]
    fn no_return_assigns_executed_marker() {
        let result = run_program("x = 1", json!({})).unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn reads_context_mapping() {
        let ctx_val = json!({"variable": {"count": 5}});
        let result = run_program("__return__ = context['variable']['count']", ctx_val).unwrap();
        assert_eq!(result, Some(json!(5)));
    }

    #[test]
    fn json_roundtrip_extension_calls() {
        let result = run_program(
            "encoded = json_encode({\"a\": 1})\n__return__ = json_decode(encoded)",
            json!({}),
        )
        .unwrap();
        assert_eq!(result, Some(json!({"a": 1})));
    }

    #[test]
    fn syntax_error_is_captured_not_propagated() {
        let err = run_program("x = ", json!({})).unwrap_err();
        assert!(!err.is_empty());
    }
}
