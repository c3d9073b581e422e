//! Start handler: returns the run's inputs unchanged.

use super::{BlockHandler, HandlerDeps};
use crate::engine::context::ExecutionContext;
use crate::model::Block;
use async_trait::async_trait;
use serde_json::{Map, Value};

pub struct StartHandler;

#[async_trait]
impl BlockHandler for StartHandler {
    fn can_handle(&self, block_type: &str) -> bool {
        matches!(block_type, "start" | "start_trigger" | "starter")
    }

    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        _block: &Block,
        _resolved_inputs: &Map<String, Value>,
        _deps: &HandlerDeps,
    ) -> anyhow::Result<Value> {
        Ok(Value::Object(ctx.inputs.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_start_aliases() {
        let h = StartHandler;
        assert!(h.can_handle("start"));
        assert!(h.can_handle("start_trigger"));
        assert!(h.can_handle("starter"));
        assert!(!h.can_handle("response"));
    }
}
