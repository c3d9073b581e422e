//! Variables handler: assigns resolved values into `workflowVariables`.
//!
//! The one exception to "handlers don't mutate shared state directly" - this
//! handler is explicitly permitted to write `ctx.workflow_variables`.

use super::{BlockHandler, HandlerDeps};
use crate::engine::context::ExecutionContext;
use crate::model::Block;
use crate::resolver;
use async_trait::async_trait;
use serde_json::{json, Map, Value};

pub struct VariablesHandler;

#[async_trait]
impl BlockHandler for VariablesHandler {
    fn can_handle(&self, block_type: &str) -> bool {
        block_type == "variables"
    }

    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        _block: &Block,
        resolved_inputs: &Map<String, Value>,
        _deps: &HandlerDeps,
    ) -> anyhow::Result<Value> {
        let mut updated = Map::new();
        if let Some(entries) = resolved_inputs.get("variables").and_then(|v| v.as_array()) {
            for entry in entries {
                let name = entry
                    .get("variableName")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                if name.is_empty() {
                    continue;
                }
                let raw_value = entry.get("value").cloned().unwrap_or(Value::Null);
                let resolved = resolver::resolve(&raw_value, ctx);
                ctx.workflow_variables.insert(name.to_string(), resolved.clone());
                updated.insert(name.to_string(), resolved);
            }
        }

        let names: Vec<Value> = ctx
            .workflow_variables
            .keys()
            .map(|k| Value::String(k.clone()))
            .collect();

        Ok(json!({
            "updated": updated,
            "variables": names,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map as JMap;

    #[tokio::test]
    async fn assigns_resolved_values_and_lists_all_variable_names() {
        let mut ctx = ExecutionContext::new(JMap::new(), JMap::new());
        ctx.workflow_variables.insert("existing".to_string(), json!(1));
        let handler = VariablesHandler;
        let deps = super::HandlerDeps {
            http_client: reqwest::Client::new(),
            config: std::sync::Arc::new(crate::config::Config::from_env()),
        };
        let block = Block {
            id: "v".into(),
            name: "v".into(),
            block_type: "variables".into(),
            parent_id: None,
            inputs: JMap::new(),
            outputs: JMap::new(),
        };
        let mut inputs = JMap::new();
        inputs.insert(
            "variables".to_string(),
            json!([{"variableName": "count", "value": 3}]),
        );
        let output = handler.execute(&mut ctx, &block, &inputs, &deps).await.unwrap();
        assert_eq!(output["updated"]["count"], json!(3));
        assert_eq!(ctx.workflow_variables.get("count"), Some(&json!(3)));
        let names = output["variables"].as_array().unwrap();
        assert!(names.contains(&json!("count")));
        assert!(names.contains(&json!("existing")));
    }
}
