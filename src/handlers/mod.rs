//! Block Handler Contract and the built-in handler registry.
//!
//! Every handler exposes `can_handle`/`execute`; the executor looks up the
//! first handler whose `can_handle` returns true. Handlers must not mutate
//! `block_outputs` directly - only the executor does, after a handler
//! returns. Handler-local failures are captured as output `Value`s; only
//! genuinely retry-eligible failures (see `crate::engine::is_transient`)
//! are returned as `Err`.

pub mod agent;
pub mod api;
pub mod condition;
pub mod function;
pub mod response;
pub mod start;
pub mod variables;

use crate::config::Config;
use crate::engine::context::ExecutionContext;
use crate::model::Block;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Shared, cloneable dependencies every handler may need.
#[derive(Clone)]
pub struct HandlerDeps {
    pub http_client: reqwest::Client,
    pub config: Arc<Config>,
}

#[async_trait]
pub trait BlockHandler: Send + Sync {
    fn can_handle(&self, block_type: &str) -> bool;

    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        block: &Block,
        resolved_inputs: &Map<String, Value>,
        deps: &HandlerDeps,
    ) -> anyhow::Result<Value>;
}

/// The ordered handler registry: first match wins. The loop container is
/// deliberately absent - it is driven directly by the scheduler (see
/// `crate::engine::executor`), never dispatched through this registry.
pub fn build_registry() -> Vec<Box<dyn BlockHandler>> {
    vec![
        Box::new(start::StartHandler),
        Box::new(agent::AgentHandler),
        Box::new(function::FunctionHandler),
        Box::new(condition::ConditionHandler),
        Box::new(api::ApiHandler),
        Box::new(variables::VariablesHandler),
        Box::new(response::ResponseHandler),
    ]
}
