//! Workflow document ingestion.
//!
//! Converts the loosely-typed JSON a workflow author ships (`blocks` as either
//! a map or a list, `inputs` either explicit or derived from `subBlocks`) into
//! the closed `Block`/`Edge` runtime shapes the scheduler operates on.

use crate::error::EngineError;
use serde_json::{Map, Value};

/// A block as the scheduler sees it. Identity is `id`; `name` is the
/// reference/display key (defaults to `id` when absent).
#[derive(Debug, Clone)]
pub struct Block {
    pub id: String,
    pub name: String,
    pub block_type: String,
    pub parent_id: Option<String>,
    pub inputs: Map<String, Value>,
    pub outputs: Map<String, Value>,
}

impl Block {
    /// `name.lower().replace(' ', '_')`, the key outputs are additionally stored under.
    pub fn normalized_name(&self) -> String {
        normalize_name(&self.name)
    }

    pub fn is_loop_container(&self) -> bool {
        matches!(self.block_type.as_str(), "loop" | "loop_block")
    }
}

pub fn normalize_name(name: &str) -> String {
    name.to_lowercase().replace(' ', "_")
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowDocument {
    /// Stable iteration order (document order for a list, key order for a map).
    pub blocks: Vec<Block>,
    pub edges: Vec<Edge>,
}

impl WorkflowDocument {
    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub fn children_of(&self, parent_id: &str) -> Vec<&Block> {
        self.blocks
            .iter()
            .filter(|b| b.parent_id.as_deref() == Some(parent_id))
            .collect()
    }
}

/// Parse a raw JSON workflow document, unwrapping an optional `{state: {...}}` wrapper.
pub fn parse_workflow_document(raw: &Value) -> Result<WorkflowDocument, EngineError> {
    let doc = if raw.get("blocks").is_none() && raw.get("state").is_some() {
        raw.get("state").unwrap()
    } else {
        raw
    };

    let blocks_val = doc
        .get("blocks")
        .ok_or(EngineError::MissingField("blocks"))?;
    let edges_val = doc.get("edges").cloned().unwrap_or(Value::Array(vec![]));

    let blocks = parse_blocks(blocks_val)?;
    let edges = parse_edges(&edges_val)?;

    Ok(WorkflowDocument { blocks, edges })
}

fn parse_blocks(value: &Value) -> Result<Vec<Block>, EngineError> {
    let mut blocks = Vec::new();
    match value {
        Value::Array(items) => {
            for item in items {
                let id = item
                    .get("id")
                    .and_then(|v| v.as_str())
                    .ok_or(EngineError::MissingField("id"))?
                    .to_string();
                blocks.push(parse_block(id, item));
            }
        }
        Value::Object(map) => {
            for (id, item) in map {
                blocks.push(parse_block(id.clone(), item));
            }
        }
        _ => {
            return Err(EngineError::InvalidShape(
                "'blocks' must be a map or a list".to_string(),
            ))
        }
    }
    Ok(blocks)
}

fn parse_block(id: String, item: &Value) -> Block {
    let name = item
        .get("name")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| id.clone());

    let block_type = item
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    let parent_id = item
        .get("parentId")
        .and_then(|v| v.as_str())
        .or_else(|| {
            item.get("data")
                .and_then(|d| d.get("parentId"))
                .and_then(|v| v.as_str())
        })
        .map(|s| s.to_string());

    let inputs = match item.get("inputs") {
        Some(Value::Object(map)) => map.clone(),
        _ => item
            .get("subBlocks")
            .and_then(|v| v.as_object())
            .map(flatten_sub_blocks)
            .unwrap_or_default(),
    };

    let outputs = item
        .get("outputs")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();

    Block {
        id,
        name,
        block_type,
        parent_id,
        inputs,
        outputs,
    }
}

/// Flattens `subBlocks[name].value` into a plain input map. The `messages`
/// sub-block is special-cased: a list of `{content}` entries is joined with
/// newlines into a single string, matching how chat-style blocks author prompts.
fn flatten_sub_blocks(sub_blocks: &Map<String, Value>) -> Map<String, Value> {
    let mut inputs = Map::new();
    for (key, sub_block) in sub_blocks {
        let value = sub_block.get("value").cloned().unwrap_or(Value::Null);
        if key == "messages" {
            if let Some(items) = value.as_array() {
                let joined = items
                    .iter()
                    .filter_map(|m| m.get("content").and_then(|c| c.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n");
                inputs.insert(key.clone(), Value::String(joined));
                continue;
            }
        }
        inputs.insert(key.clone(), value);
    }
    inputs
}

fn parse_edges(value: &Value) -> Result<Vec<Edge>, EngineError> {
    let mut edges = Vec::new();
    let items: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map) => map.values().collect(),
        Value::Null => Vec::new(),
        _ => {
            return Err(EngineError::InvalidShape(
                "'edges' must be a map or a list".to_string(),
            ))
        }
    };
    for item in items {
        let source = item.get("source").and_then(|v| v.as_str());
        let target = item.get("target").and_then(|v| v.as_str());
        if let (Some(source), Some(target)) = (source, target) {
            edges.push(Edge {
                source: source.to_string(),
                target: target.to_string(),
            });
        }
    }
    Ok(edges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_list_shaped_blocks_and_edges() {
        let doc = json!({
            "blocks": [
                {"id": "a", "type": "start"},
                {"id": "b", "type": "response", "name": "Final Response"}
            ],
            "edges": [{"source": "a", "target": "b"}]
        });
        let parsed = parse_workflow_document(&doc).unwrap();
        assert_eq!(parsed.blocks.len(), 2);
        assert_eq!(parsed.edges.len(), 1);
        assert_eq!(parsed.block("b").unwrap().normalized_name(), "final_response");
    }

    #[test]
    fn unwraps_state_wrapper() {
        let doc = json!({"state": {"blocks": {"a": {"type": "start"}}, "edges": []}});
        let parsed = parse_workflow_document(&doc).unwrap();
        assert_eq!(parsed.blocks.len(), 1);
        assert_eq!(parsed.blocks[0].id, "a");
    }

    #[test]
    fn flattens_sub_blocks_joining_messages() {
        let doc = json!({
            "blocks": {
                "a": {
                    "type": "agent",
                    "subBlocks": {
                        "model": {"value": "gpt-4o"},
                        "messages": {"value": [{"content": "hello"}, {"content": "world"}]}
                    }
                }
            },
            "edges": []
        });
        let parsed = parse_workflow_document(&doc).unwrap();
        let block = &parsed.blocks[0];
        assert_eq!(block.inputs.get("model").unwrap(), "gpt-4o");
        assert_eq!(block.inputs.get("messages").unwrap(), "hello\nworld");
    }
}
