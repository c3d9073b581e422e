//! DAG scheduler: graph build, topological traversal, leaf execution with
//! retry, the loop driver, and run finalization (§4.4).

use super::context::{ExecutionContext, LoopState, LoopType, LogRecord, MAX_LOOP_ITERATIONS};
use super::is_transient;
use crate::eval::{self, truthy};
use crate::handlers::{BlockHandler, HandlerDeps};
use crate::model::{Block, WorkflowDocument};
use crate::resolver;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

pub struct RunResult {
    pub success: bool,
    pub output: Value,
    pub error: Option<String>,
    pub logs: Value,
}

pub async fn run_workflow(
    doc: &WorkflowDocument,
    registry: &[Box<dyn BlockHandler>],
    deps: &HandlerDeps,
    inputs: Map<String, Value>,
    workflow_variables: Map<String, Value>,
) -> RunResult {
    let mut ctx = ExecutionContext::new(inputs, workflow_variables);

    let loop_children = loop_children_ids(doc);
    let top_level: HashSet<String> = doc
        .blocks
        .iter()
        .map(|b| b.id.clone())
        .filter(|id| !loop_children.contains(id))
        .collect();
    let order = topological_order(doc, &top_level);

    let mut final_output: Option<Value> = None;

    for id in &order {
        let block = match doc.block(id) {
            Some(b) => b,
            None => continue,
        };

        let output = if block.is_loop_container() {
            run_loop(&mut ctx, doc, block, registry, deps).await
        } else {
            execute_and_record(&mut ctx, block, registry, deps).await
        };

        if matches!(block.block_type.as_str(), "response" | "output") {
            final_output = Some(output);
        }
    }

    RunResult {
        success: true,
        output: final_output.unwrap_or(Value::Null),
        error: None,
        logs: ctx.logs_as_value(),
    }
}

/// Collects the ids of every block whose *direct* parent is a loop container.
fn loop_children_ids(doc: &WorkflowDocument) -> HashSet<String> {
    let mut set = HashSet::new();
    for block in &doc.blocks {
        if let Some(parent_id) = &block.parent_id {
            if let Some(parent) = doc.block(parent_id) {
                if parent.is_loop_container() {
                    set.insert(block.id.clone());
                }
            }
        }
    }
    set
}

/// Kahn's algorithm restricted to `ids`, edges outside the set ignored.
/// FIFO among ties: the initial ready queue follows `doc.blocks` document
/// order, and newly-ready nodes are appended to the back of the same queue.
fn topological_order(doc: &WorkflowDocument, ids: &HashSet<String>) -> Vec<String> {
    let mut indegree: HashMap<&str, usize> = ids.iter().map(|id| (id.as_str(), 0)).collect();
    let mut adjacency: HashMap<&str, Vec<&str>> = ids.iter().map(|id| (id.as_str(), Vec::new())).collect();

    for edge in &doc.edges {
        if ids.contains(&edge.source) && ids.contains(&edge.target) {
            adjacency.get_mut(edge.source.as_str()).unwrap().push(edge.target.as_str());
            *indegree.get_mut(edge.target.as_str()).unwrap() += 1;
        }
    }

    let mut queue: VecDeque<&str> = VecDeque::new();
    for block in &doc.blocks {
        if ids.contains(&block.id) && indegree[block.id.as_str()] == 0 {
            queue.push_back(block.id.as_str());
        }
    }

    let mut order = Vec::new();
    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());
        if let Some(children) = adjacency.get(id) {
            for &child in children {
                let entry = indegree.get_mut(child).unwrap();
                *entry -= 1;
                if *entry == 0 {
                    queue.push_back(child);
                }
            }
        }
    }
    order
}

/// Executes one leaf block with the retry policy, stores its output under
/// both name keys, and appends a log record. Returns the stored output.
async fn execute_and_record(
    ctx: &mut ExecutionContext,
    block: &Block,
    registry: &[Box<dyn BlockHandler>],
    deps: &HandlerDeps,
) -> Value {
    let started_at = Utc::now();
    let (output, success) = execute_leaf(ctx, block, registry, deps).await;
    let ended_at = Utc::now();

    ctx.store_output(&block.name, &block.normalized_name(), output.clone());
    ctx.push_log(LogRecord {
        block_id: block.id.clone(),
        block_name: block.name.clone(),
        block_type: block.block_type.clone(),
        started_at,
        ended_at,
        success,
        output: output.clone(),
    });
    output
}

/// Resolves inputs, dispatches to the first matching handler, and retries up
/// to 3 attempts on transient failures with `1.0 * 2^attempt` second backoff.
async fn execute_leaf(
    ctx: &mut ExecutionContext,
    block: &Block,
    registry: &[Box<dyn BlockHandler>],
    deps: &HandlerDeps,
) -> (Value, bool) {
    let resolved = resolver::resolve(&Value::Object(block.inputs.clone()), ctx);
    let resolved_inputs = match resolved {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    let handler = match registry.iter().find(|h| h.can_handle(&block.block_type)) {
        Some(h) => h,
        None => {
            return (
                json!({"error": format!("No handler for block type: {}", block.block_type)}),
                false,
            )
        }
    };

    let mut attempt: u32 = 0;
    loop {
        match handler.execute(ctx, block, &resolved_inputs, deps).await {
            Ok(value) => return (value, true),
            Err(error) => {
                let message = error.to_string();
                if is_transient(&message) && attempt < 2 {
                    let backoff_secs = 1.0 * 2f64.powi(attempt as i32);
                    tokio::time::sleep(Duration::from_secs_f64(backoff_secs)).await;
                    attempt += 1;
                } else {
                    return (json!({"error": message, "retries": attempt}), false);
                }
            }
        }
    }
}

type BoxedFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The loop driver (§4.4). Recursive (for nested loops), hence boxed.
fn run_loop<'a>(
    ctx: &'a mut ExecutionContext,
    doc: &'a WorkflowDocument,
    loop_block: &'a Block,
    registry: &'a [Box<dyn BlockHandler>],
    deps: &'a HandlerDeps,
) -> BoxedFuture<'a, Value> {
    Box::pin(async move {
        let resolved = resolver::resolve(&Value::Object(loop_block.inputs.clone()), ctx);
        let resolved_inputs = match resolved {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        let loop_type = LoopType::parse(
            resolved_inputs.get("loopType").and_then(|v| v.as_str()).unwrap_or("for"),
        );
        let iterations = resolved_inputs
            .get("iterations")
            .and_then(|v| v.as_u64())
            .unwrap_or(MAX_LOOP_ITERATIONS);
        let items = resolve_for_each_items(loop_block.inputs.get("forEachItems"), ctx);
        let condition = match loop_type {
            LoopType::While => resolved_inputs.get("whileCondition").and_then(|v| v.as_str()).map(String::from),
            LoopType::DoWhile => resolved_inputs.get("doWhileCondition").and_then(|v| v.as_str()).map(String::from),
            _ => None,
        };

        ctx.loop_states
            .insert(loop_block.id.clone(), LoopState::new(loop_type, iterations, items, condition));

        let previous_loop_id = ctx.current_loop_id.replace(loop_block.id.clone());

        let children = doc.children_of(&loop_block.id);
        let child_ids: HashSet<String> = children.iter().map(|b| b.id.clone()).collect();
        let child_order = topological_order(doc, &child_ids);

        loop {
            let (iteration, max_iterations, loop_type, current_item, items_snapshot, condition) = {
                let state = ctx.loop_states.get(&loop_block.id).unwrap();
                (
                    state.iteration,
                    state.max_iterations,
                    state.loop_type,
                    state.current_item.clone(),
                    state.items.clone(),
                    state.condition.clone(),
                )
            };

            if iteration >= MAX_LOOP_ITERATIONS {
                break;
            }

            let should_continue = match loop_type {
                LoopType::For => iteration < max_iterations,
                LoopType::ForEach => iteration < items_snapshot.len() as u64,
                LoopType::While => evaluate_loop_condition(
                    ctx,
                    condition.as_deref(),
                    iteration,
                    max_iterations,
                    &current_item,
                    &items_snapshot,
                ),
                LoopType::DoWhile => {
                    iteration == 0
                        || evaluate_loop_condition(
                            ctx,
                            condition.as_deref(),
                            iteration,
                            max_iterations,
                            &current_item,
                            &items_snapshot,
                        )
                }
            };
            if !should_continue {
                break;
            }

            if loop_type == LoopType::ForEach {
                if let Some(state) = ctx.loop_states.get_mut(&loop_block.id) {
                    state.current_item = state.items.get(iteration as usize).cloned().unwrap_or(Value::Null);
                }
            }

            let current_item = ctx.loop_states.get(&loop_block.id).unwrap().current_item.clone();
            let loop_marker = json!({"index": iteration, "item": current_item, "items": items_snapshot});
            let previous_marker = ctx.block_outputs.insert("_loop".to_string(), loop_marker);

            let mut iteration_output = Map::new();
            for child_id in &child_order {
                let child = match doc.block(child_id) {
                    Some(b) => b,
                    None => continue,
                };
                let output = if child.is_loop_container() {
                    run_loop(&mut *ctx, doc, child, registry, deps).await
                } else {
                    execute_and_record(ctx, child, registry, deps).await
                };
                iteration_output.insert(child.name.clone(), output);
            }

            match previous_marker {
                Some(v) => {
                    ctx.block_outputs.insert("_loop".to_string(), v);
                }
                None => {
                    ctx.block_outputs.remove("_loop");
                }
            }

            if let Some(state) = ctx.loop_states.get_mut(&loop_block.id) {
                state.iteration_outputs.push(iteration_output);
                state.iteration += 1;
            }
        }

        ctx.current_loop_id = previous_loop_id;

        let (results, total) = {
            let state = ctx.loop_states.get(&loop_block.id).unwrap();
            (state.iteration_outputs.clone(), state.iteration)
        };
        let output = json!({"results": results, "totalIterations": total, "status": "completed"});
        ctx.store_output(&loop_block.name, &loop_block.normalized_name(), output.clone());
        output
    })
}

/// Temporarily injects a `_loop` snapshot, resolves `<...>` references inside
/// `condition` into literals, and evaluates the result with the `Pure`
/// evaluator. Falls back to `iteration < maxIterations` on an empty
/// condition or any parse/safety failure (§4.2, §7).
fn evaluate_loop_condition(
    ctx: &mut ExecutionContext,
    condition: Option<&str>,
    iteration: u64,
    max_iterations: u64,
    current_item: &Value,
    items: &[Value],
) -> bool {
    let condition = match condition {
        Some(c) if !c.trim().is_empty() => c,
        _ => return iteration < max_iterations,
    };

    let loop_marker = json!({"index": iteration, "item": current_item, "items": items});
    let previous = ctx.block_outputs.insert("_loop".to_string(), loop_marker);
    let substituted = resolver::resolve_code_literals(condition, ctx);
    match previous {
        Some(v) => {
            ctx.block_outputs.insert("_loop".to_string(), v);
        }
        None => {
            ctx.block_outputs.remove("_loop");
        }
    }

    match eval::eval_pure(&substituted) {
        Ok(value) => truthy(&value),
        Err(_) => iteration < max_iterations,
    }
}

/// Item resolution for `forEachItems` (§4.3.8): sequences pass through,
/// mappings become `[key, value]` pairs, strings are reference-resolved then
/// JSON-parsed as a fallback, anything else yields the empty sequence.
fn resolve_for_each_items(raw: Option<&Value>, ctx: &ExecutionContext) -> Vec<Value> {
    let raw = match raw {
        Some(v) => v.clone(),
        None => return Vec::new(),
    };
    let resolved = resolver::resolve(&raw, ctx);
    match resolved {
        Value::Array(items) => items,
        Value::Object(map) => map
            .into_iter()
            .map(|(k, v)| Value::Array(vec![Value::String(k), v]))
            .collect(),
        Value::String(s) => serde_json::from_str::<Value>(&s)
            .ok()
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::parse_workflow_document;
    use std::sync::Arc;

    fn deps() -> HandlerDeps {
        HandlerDeps {
            http_client: reqwest::Client::new(),
            config: Arc::new(Config::from_env()),
        }
    }

    #[tokio::test]
    async fn linear_dag_threads_variable_into_response() {
        let doc = parse_workflow_document(&json!({
            "blocks": [
                {"id": "a", "type": "start"},
                {"id": "b", "type": "variables", "inputs": {"variables": [{"variableName": "count", "value": 3}]}},
                {"id": "c", "type": "response", "inputs": {"dataMode": "raw", "data": "<variable.count>"}}
            ],
            "edges": [{"source": "a", "target": "b"}, {"source": "b", "target": "c"}]
        }))
        .unwrap();

        let registry = crate::handlers::build_registry();
        let result = run_workflow(&doc, &registry, &deps(), Map::new(), Map::new()).await;
        assert_eq!(result.output["data"], json!(3));
    }

    #[tokio::test]
    async fn router_picks_first_truthy_route() {
        let doc = parse_workflow_document(&json!({
            "blocks": [
                {"id": "a", "type": "start"},
                {"id": "r", "type": "condition", "inputs": {"routes": [
                    {"condition": "start['x'] > 10", "name": "big"},
                    {"condition": "start['x'] > 0", "name": "pos"}
                ]}}
            ],
            "edges": [{"source": "a", "target": "r"}]
        }))
        .unwrap();
        let registry = crate::handlers::build_registry();
        let mut inputs = Map::new();
        inputs.insert("x".to_string(), json!(5));
        let result = run_workflow(&doc, &registry, &deps(), inputs, Map::new()).await;
        assert_eq!(result.logs.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn for_each_loop_runs_every_item_and_reports_total() {
        // The loop container's aggregated output is stored via
        // `ExecutionContext::store_output` (§4.4 finalization), not logged -
        // `run_loop` never calls `push_log` for the container itself, matching
        // the original's `_execute_loop` (only its children get log records).
        // Read it back the way a downstream block would: through a `response`
        // block wired to `<l.results>` / `<l.totalIterations>`.
        let doc = parse_workflow_document(&json!({
            "blocks": [
                {"id": "l", "type": "loop", "name": "L", "inputs": {"loopType": "forEach", "forEachItems": [10, 20, 30]}},
                {"id": "c", "type": "function", "name": "C", "parentId": "l", "inputs": {"code": "__return__ = {\"v\": <_loop.item> * 2}"}},
                {"id": "r", "type": "response", "inputs": {
                    "dataMode": "structured",
                    "builderData": [
                        {"name": "results", "value": "<l.results>"},
                        {"name": "totalIterations", "value": "<l.totalIterations>"}
                    ]
                }}
            ],
            "edges": [{"source": "l", "target": "r"}]
        }))
        .unwrap();
        let registry = crate::handlers::build_registry();
        let result = run_workflow(&doc, &registry, &deps(), Map::new(), Map::new()).await;
        assert_eq!(result.output["data"]["totalIterations"], json!(3));
        let results = result.output["data"]["results"].as_array().unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0]["C"]["v"], json!(20));
        assert_eq!(results[2]["C"]["v"], json!(60));
    }
}
