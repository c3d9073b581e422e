//! Response / Output handler: shapes the value returned to the caller.

use super::{BlockHandler, HandlerDeps};
use crate::engine::context::ExecutionContext;
use crate::model::Block;
use crate::resolver;
use async_trait::async_trait;
use serde_json::{json, Map, Value};

pub struct ResponseHandler;

#[async_trait]
impl BlockHandler for ResponseHandler {
    fn can_handle(&self, block_type: &str) -> bool {
        matches!(block_type, "response" | "output")
    }

    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        _block: &Block,
        resolved_inputs: &Map<String, Value>,
        _deps: &HandlerDeps,
    ) -> anyhow::Result<Value> {
        let data_mode = resolved_inputs
            .get("dataMode")
            .and_then(|v| v.as_str())
            .unwrap_or("raw");
        let status = resolved_inputs.get("status").cloned().unwrap_or(json!(200));

        let resolved_data = resolved_inputs.get("data").map(|d| resolver::resolve(d, ctx));

        let data = if data_mode == "structured" {
            if let Some(builder_data) = resolved_inputs.get("builderData").and_then(|v| v.as_array()) {
                if !builder_data.is_empty() {
                    let mut built = Map::new();
                    for entry in builder_data {
                        if let Some(name) = entry.get("name").and_then(|v| v.as_str()) {
                            let value = entry.get("value").cloned().unwrap_or(Value::Null);
                            built.insert(name.to_string(), resolver::resolve(&value, ctx));
                        }
                    }
                    Value::Object(built)
                } else {
                    fallback_data(resolved_data, resolved_inputs)
                }
            } else {
                fallback_data(resolved_data, resolved_inputs)
            }
        } else {
            match &resolved_data {
                Some(v) if crate::eval::truthy(v) => v.clone(),
                _ => Value::Object(resolved_inputs.clone()),
            }
        };

        let headers = build_headers(resolved_inputs, ctx);

        let mut out = Map::new();
        out.insert("data".to_string(), data);
        out.insert("status".to_string(), status);
        out.insert(
            "headers".to_string(),
            headers.map(Value::Object).unwrap_or(Value::Null),
        );
        out.insert("dataMode".to_string(), Value::String(data_mode.to_string()));
        Ok(Value::Object(out))
    }
}

fn fallback_data(resolved_data: Option<Value>, resolved_inputs: &Map<String, Value>) -> Value {
    match resolved_data {
        Some(v) if crate::eval::truthy(&v) => v,
        _ => Value::Object(resolved_inputs.clone()),
    }
}

fn build_headers(resolved_inputs: &Map<String, Value>, ctx: &ExecutionContext) -> Option<Map<String, Value>> {
    let entries = resolved_inputs.get("headers").and_then(|v| v.as_array())?;
    let mut headers = Map::new();
    for entry in entries {
        let cells = entry.get("cells").unwrap_or(entry);
        let key = cells.get("Key").and_then(|v| v.as_str()).unwrap_or("").trim();
        if key.is_empty() {
            continue;
        }
        let value = cells.get("Value").cloned().unwrap_or(Value::Null);
        headers.insert(key.to_string(), resolver::resolve(&value, ctx));
    }
    if headers.is_empty() {
        None
    } else {
        Some(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map as JMap;

    fn deps() -> HandlerDeps {
        HandlerDeps {
            http_client: reqwest::Client::new(),
            config: std::sync::Arc::new(crate::config::Config::from_env()),
        }
    }

    fn block() -> Block {
        Block {
            id: "r".into(),
            name: "r".into(),
            block_type: "response".into(),
            parent_id: None,
            inputs: JMap::new(),
            outputs: JMap::new(),
        }
    }

    #[tokio::test]
    async fn raw_mode_returns_resolved_data() {
        let mut ctx = ExecutionContext::new(JMap::new(), JMap::new());
        ctx.workflow_variables.insert("count".to_string(), json!(3));
        let handler = ResponseHandler;
        let mut inputs = JMap::new();
        inputs.insert("dataMode".to_string(), json!("raw"));
        inputs.insert("data".to_string(), json!("<variable.count>"));
        let output = handler.execute(&mut ctx, &block(), &inputs, &deps()).await.unwrap();
        assert_eq!(output["data"], json!(3));
    }

    #[tokio::test]
    async fn raw_mode_falls_back_to_full_input_map_when_data_empty() {
        let mut ctx = ExecutionContext::new(JMap::new(), JMap::new());
        let handler = ResponseHandler;
        let mut inputs = JMap::new();
        inputs.insert("dataMode".to_string(), json!("raw"));
        inputs.insert("foo".to_string(), json!("bar"));
        let output = handler.execute(&mut ctx, &block(), &inputs, &deps()).await.unwrap();
        assert_eq!(output["data"]["foo"], json!("bar"));
    }
}
