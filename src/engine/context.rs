//! The per-run execution context: the only mutable state a workflow run owns.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopType {
    For,
    ForEach,
    While,
    DoWhile,
}

impl LoopType {
    pub fn parse(s: &str) -> Self {
        match s {
            "forEach" => LoopType::ForEach,
            "while" => LoopType::While,
            "doWhile" => LoopType::DoWhile,
            _ => LoopType::For,
        }
    }
}

pub const MAX_LOOP_ITERATIONS: u64 = 1000;

#[derive(Debug, Clone)]
pub struct LoopState {
    pub iteration: u64,
    pub items: Vec<Value>,
    pub current_item: Value,
    pub max_iterations: u64,
    pub loop_type: LoopType,
    pub condition: Option<String>,
    pub iteration_outputs: Vec<Map<String, Value>>,
}

impl LoopState {
    pub fn new(loop_type: LoopType, max_iterations: u64, items: Vec<Value>, condition: Option<String>) -> Self {
        let max_iterations = match loop_type {
            LoopType::ForEach => items.len() as u64,
            _ => max_iterations.min(MAX_LOOP_ITERATIONS),
        };
        Self {
            iteration: 0,
            items,
            current_item: Value::Null,
            max_iterations,
            loop_type,
            condition,
            iteration_outputs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub block_id: String,
    pub block_name: String,
    pub block_type: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub success: bool,
    pub output: Value,
}

impl LogRecord {
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "blockId": self.block_id,
            "blockName": self.block_name,
            "blockType": self.block_type,
            "startedAt": self.started_at.to_rfc3339(),
            "endedAt": self.ended_at.to_rfc3339(),
            "success": self.success,
            "output": self.output,
        })
    }
}

/// Owned exclusively by one request; created at the start of a run and
/// discarded once the response is sent.
pub struct ExecutionContext {
    pub inputs: Map<String, Value>,
    pub workflow_variables: Map<String, Value>,
    pub block_outputs: Map<String, Value>,
    pub logs: Vec<LogRecord>,
    pub loop_states: HashMap<String, LoopState>,
    pub current_loop_id: Option<String>,
}

impl ExecutionContext {
    pub fn new(inputs: Map<String, Value>, workflow_variables: Map<String, Value>) -> Self {
        Self {
            inputs,
            workflow_variables,
            block_outputs: Map::new(),
            logs: Vec::new(),
            loop_states: HashMap::new(),
            current_loop_id: None,
        }
    }

    /// Stores a block's output under both its raw and normalized name keys.
    pub fn store_output(&mut self, raw_name: &str, normalized_name: &str, output: Value) {
        self.block_outputs.insert(raw_name.to_string(), output.clone());
        self.block_outputs.insert(normalized_name.to_string(), output);
    }

    pub fn push_log(&mut self, record: LogRecord) {
        self.logs.push(record);
    }

    pub fn logs_as_value(&self) -> Value {
        Value::Array(self.logs.iter().map(LogRecord::to_value).collect())
    }
}
