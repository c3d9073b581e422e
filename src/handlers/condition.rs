//! Condition/Router handler.
//!
//! Accepts a single `condition`, an `if`, or a `routes` list and evaluates
//! each against an environment of `start`, `variable`, and every block
//! output by normalized name (evaluator mode `WithEnv`, §4.2).

use super::{BlockHandler, HandlerDeps};
use crate::engine::context::ExecutionContext;
use crate::eval::{self, truthy};
use crate::model::Block;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

pub struct ConditionHandler;

#[async_trait]
impl BlockHandler for ConditionHandler {
    fn can_handle(&self, block_type: &str) -> bool {
        matches!(block_type, "condition" | "router")
    }

    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        _block: &Block,
        resolved_inputs: &Map<String, Value>,
        _deps: &HandlerDeps,
    ) -> anyhow::Result<Value> {
        let env = build_env(ctx);

        if let Some(routes) = resolved_inputs.get("routes").and_then(|v| v.as_array()) {
            for (i, route) in routes.iter().enumerate() {
                let condition = route.get("condition").and_then(|v| v.as_str()).unwrap_or("");
                if evaluate_truthy(condition, &env) {
                    let name = route
                        .get("name")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| format!("route_{i}"));
                    return Ok(json!({"result": true, "branch": name, "matchedRoute": i}));
                }
            }
            return Ok(json!({"result": false, "branch": "default", "matchedRoute": Value::Null}));
        }

        if let Some(if_expr) = resolved_inputs.get("if").and_then(|v| v.as_str()) {
            let result = evaluate_truthy(if_expr, &env);
            let branch = if result { "then" } else { "else" };
            return Ok(json!({"result": result, "branch": branch}));
        }

        if let Some(condition) = resolved_inputs.get("condition").and_then(|v| v.as_str()) {
            let result = evaluate_truthy(condition, &env);
            let branch = if result { "true" } else { "false" };
            return Ok(json!({"result": result, "branch": branch}));
        }

        Ok(json!({"result": true, "branch": "default"}))
    }
}

fn build_env(ctx: &ExecutionContext) -> HashMap<String, Value> {
    let mut env = HashMap::new();
    env.insert("start".to_string(), Value::Object(ctx.inputs.clone()));
    env.insert("variable".to_string(), Value::Object(ctx.workflow_variables.clone()));
    for (k, v) in &ctx.block_outputs {
        env.insert(k.clone(), v.clone());
    }
    env
}

/// Non-string conditions are coerced by the Python-style truthy rule.
/// Expression parse/safety failures default to `false` (§4.2, §7).
fn evaluate_truthy(condition: &str, env: &HashMap<String, Value>) -> bool {
    match eval::eval_with_env(condition, env) {
        Ok(value) => truthy(&value),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map as JMap;

    fn handler_and_deps() -> (ConditionHandler, HandlerDeps) {
        (
            ConditionHandler,
            HandlerDeps {
                http_client: reqwest::Client::new(),
                config: std::sync::Arc::new(crate::config::Config::from_env()),
            },
        )
    }

    fn block() -> Block {
        Block {
            id: "r".into(),
            name: "r".into(),
            block_type: "condition".into(),
            parent_id: None,
            inputs: JMap::new(),
            outputs: JMap::new(),
        }
    }

    #[tokio::test]
    async fn first_matching_route_wins() {
        let (handler, deps) = handler_and_deps();
        let mut inputs = JMap::new();
        inputs.insert(
            "x".to_string(),
            json!(5),
        );
        let mut ctx = ExecutionContext::new(inputs, JMap::new());
        let b = block();
        let mut resolved = JMap::new();
        resolved.insert(
            "routes".to_string(),
            json!([
                {"condition": "start['x'] > 10", "name": "big"},
                {"condition": "start['x'] > 0", "name": "pos"}
            ]),
        );
        let out = handler.execute(&mut ctx, &b, &resolved, &deps).await.unwrap();
        assert_eq!(out["branch"], json!("pos"));
        assert_eq!(out["matchedRoute"], json!(1));
    }

    #[tokio::test]
    async fn no_match_returns_default() {
        let (handler, deps) = handler_and_deps();
        let mut inputs = JMap::new();
        inputs.insert("x".to_string(), json!(-1));
        let mut ctx = ExecutionContext::new(inputs, JMap::new());
        let b = block();
        let mut resolved = JMap::new();
        resolved.insert(
            "routes".to_string(),
            json!([{"condition": "start['x'] > 0", "name": "pos"}]),
        );
        let out = handler.execute(&mut ctx, &b, &resolved, &deps).await.unwrap();
        assert_eq!(out["branch"], json!("default"));
        assert_eq!(out["matchedRoute"], Value::Null);
    }

    #[tokio::test]
    async fn if_form_uses_then_else_branches() {
        let (handler, deps) = handler_and_deps();
        let mut ctx = ExecutionContext::new(JMap::new(), JMap::new());
        let b = block();
        let mut resolved = JMap::new();
        resolved.insert("if".to_string(), json!("1 == 1"));
        let out = handler.execute(&mut ctx, &b, &resolved, &deps).await.unwrap();
        assert_eq!(out["branch"], json!("then"));
    }
}
