//! Agent handler: a provider-agnostic LLM conversation with tool calling (§4.3.7).
//!
//! Builds the initial message list from the block's resolved prompt inputs,
//! registers native (`local_*`), MCP, and block-declared tools, then drives
//! the tool-use loop against whichever provider `model` classifies to.

use super::{BlockHandler, HandlerDeps};
use crate::engine::context::ExecutionContext;
use crate::mcp::{self, McpToolCall};
use crate::model::Block;
use crate::providers::{self, AssistantTurn, ChatMessage, Provider, ToolCallRequest, ToolDeclaration};
use crate::tools::NativeTools;
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::OnceLock;

pub struct AgentHandler;

const MAX_TOOL_ITERATIONS: usize = 50;
const MAX_TOOL_RESULT_SIZE: usize = 50_000;
const MAX_MESSAGE_HISTORY: usize = 30;

#[async_trait]
impl BlockHandler for AgentHandler {
    fn can_handle(&self, block_type: &str) -> bool {
        matches!(block_type, "agent" | "llm" | "ai_agent")
    }

    async fn execute(
        &self,
        _ctx: &mut ExecutionContext,
        _block: &Block,
        resolved_inputs: &Map<String, Value>,
        deps: &HandlerDeps,
    ) -> anyhow::Result<Value> {
        let model = resolved_inputs.get("model").and_then(|v| v.as_str()).unwrap_or("gpt-4o").to_string();
        let provider = providers::classify_model(&model);

        // §6: `inputs.apiKey` wins over the provider's environment-sourced
        // key when present (`{{VAR_NAME}}` tokens inside it are substituted
        // from the process environment first); the env-key lookup is only a
        // fallback for blocks that don't set one.
        let api_key_override = resolved_inputs
            .get("apiKey")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(resolve_env_references);

        let (api_key, base_url) = match providers::resolve_credentials(provider, &deps.config) {
            Ok((default_key, base_url)) => (api_key_override.or(default_key), base_url),
            Err(message) => match api_key_override {
                Some(key) => (Some(key), None),
                None => return Ok(json!({"error": message, "provider": provider.as_str()})),
            },
        };

        let mut messages = build_initial_messages(resolved_inputs);

        let native_tools = deps.config.workspace_dir.as_ref().map(|root| {
            NativeTools::new(root.clone(), deps.config.enable_command_execution, deps.config.max_file_size)
        });
        let mcp_calls = build_mcp_calls(resolved_inputs);
        let custom_tools = build_custom_tool_declarations(resolved_inputs);

        let mut declarations: Vec<ToolDeclaration> = Vec::new();
        if let Some(native) = &native_tools {
            declarations.extend(native.declarations());
        }
        declarations.extend(mcp_calls.iter().map(|(_, decl)| decl.clone()));
        declarations.extend(custom_tools);

        let mut tool_call_log: Vec<Value> = Vec::new();

        for _ in 0..MAX_TOOL_ITERATIONS {
            let turn = match providers::send_chat_turn(
                &deps.http_client,
                provider,
                api_key.as_deref(),
                base_url.as_deref(),
                &model,
                &messages,
                &declarations,
            )
            .await
            {
                Ok(t) => t,
                Err(message) => return Ok(json!({"error": message, "provider": provider.as_str()})),
            };

            if turn.tool_calls.is_empty() || turn.done {
                return Ok(finalize_output(
                    &turn,
                    &model,
                    provider,
                    &tool_call_log,
                    resolved_inputs.get("responseFormat"),
                ));
            }

            messages.push(ChatMessage {
                role: "assistant".to_string(),
                content: turn.content.clone(),
                tool_call_id: None,
                tool_calls: turn.tool_calls.clone(),
            });

            for call in &turn.tool_calls {
                let result = dispatch_tool_call(call, native_tools.as_ref(), &mcp_calls, &deps.http_client).await;
                let truncated = truncate_result(&result);
                tool_call_log.push(json!({
                    "id": call.id,
                    "name": call.name,
                    "input": call.input,
                    "result": truncated,
                }));
                messages.push(ChatMessage {
                    role: "tool".to_string(),
                    content: truncated,
                    tool_call_id: Some(call.id.clone()),
                    tool_calls: Vec::new(),
                });
            }

            prune_history(&mut messages);
        }

        Ok(json!({
            "error": format!("Exceeded MAX_TOOL_ITERATIONS ({MAX_TOOL_ITERATIONS}) without reaching a final turn"),
            "provider": provider.as_str(),
        }))
    }
}

fn env_var_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([A-Z_][A-Z0-9_]*)\}\}").unwrap())
}

/// Replaces every `{{VAR_NAME}}` token in `value` with that environment
/// variable's value (empty string if unset), per the `inputs.apiKey`
/// substitution rule in §6. Text outside `{{...}}` tokens passes through
/// unchanged.
fn resolve_env_references(value: &str) -> String {
    env_var_pattern()
        .replace_all(value, |caps: &regex::Captures| std::env::var(&caps[1]).unwrap_or_default())
        .into_owned()
}

fn build_initial_messages(resolved_inputs: &Map<String, Value>) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    if let Some(system) = resolved_inputs.get("systemPrompt").and_then(|v| v.as_str()) {
        if !system.is_empty() {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system.to_string(),
                tool_call_id: None,
                tool_calls: Vec::new(),
            });
        }
    }
    let user_content = resolved_inputs
        .get("userPrompt")
        .or_else(|| resolved_inputs.get("prompt"))
        .or_else(|| resolved_inputs.get("messages"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    messages.push(ChatMessage {
        role: "user".to_string(),
        content: user_content,
        tool_call_id: None,
        tool_calls: Vec::new(),
    });
    messages
}

fn build_mcp_calls(resolved_inputs: &Map<String, Value>) -> Vec<(McpToolCall, ToolDeclaration)> {
    resolved_inputs
        .get("mcpServers")
        .and_then(|v| v.as_array())
        .map(|servers| {
            servers
                .iter()
                .filter_map(|s| {
                    let server_url = s.get("serverUrl").and_then(|v| v.as_str())?.to_string();
                    let tool_name = s.get("toolName").and_then(|v| v.as_str())?.to_string();
                    let exposed_name = format!("mcp_{}", tool_name);
                    let description = s
                        .get("description")
                        .and_then(|v| v.as_str())
                        .unwrap_or("Remote MCP tool")
                        .to_string();
                    let parameters = s.get("parameters").cloned().unwrap_or(json!({"type": "object", "properties": {}}));
                    Some((
                        McpToolCall { server_url, tool_name },
                        ToolDeclaration {
                            name: exposed_name,
                            description,
                            parameters,
                        },
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn build_custom_tool_declarations(resolved_inputs: &Map<String, Value>) -> Vec<ToolDeclaration> {
    resolved_inputs
        .get("tools")
        .and_then(|v| v.as_array())
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| {
                    let name = t.get("name").and_then(|v| v.as_str())?.to_string();
                    let description = t.get("description").and_then(|v| v.as_str()).unwrap_or("").to_string();
                    let parameters = t.get("parameters").cloned().unwrap_or(json!({"type": "object", "properties": {}}));
                    Some(ToolDeclaration { name, description, parameters })
                })
                .collect()
        })
        .unwrap_or_default()
}

async fn dispatch_tool_call(
    call: &ToolCallRequest,
    native_tools: Option<&NativeTools>,
    mcp_calls: &[(McpToolCall, ToolDeclaration)],
    http_client: &reqwest::Client,
) -> String {
    if call.name.starts_with("local_") {
        match native_tools {
            Some(native) => native.dispatch(&call.name, &call.input).await.to_string(),
            None => json!({"success": false, "error": "Native tools are not configured (WORKSPACE_DIR unset)"}).to_string(),
        }
    } else if let Some((mcp_call, _)) = mcp_calls.iter().find(|(_, d)| d.name == call.name) {
        match mcp::call_tool(http_client, mcp_call, call.input.clone()).await {
            Ok(text) => text,
            Err(error) => json!({"success": false, "error": error}).to_string(),
        }
    } else {
        json!({"success": false, "error": format!("Unknown tool: {}", call.name)}).to_string()
    }
}

fn truncate_result(result: &str) -> String {
    if result.chars().count() <= MAX_TOOL_RESULT_SIZE {
        return result.to_string();
    }
    let truncated: String = result.chars().take(MAX_TOOL_RESULT_SIZE).collect();
    format!("{truncated}\n...[truncated, {} characters omitted]", result.chars().count() - MAX_TOOL_RESULT_SIZE)
}

/// Keeps the first message plus the most recent 29, replacing the dropped
/// middle with a synthetic marker summarizing the omission (§4.3.7 step 4).
fn prune_history(messages: &mut Vec<ChatMessage>) {
    if messages.len() <= MAX_MESSAGE_HISTORY {
        return;
    }
    let dropped = messages.len() - MAX_MESSAGE_HISTORY;
    let first = messages[0].clone_shallow();
    let tail_start = messages.len() - (MAX_MESSAGE_HISTORY - 1);
    let mut kept: Vec<ChatMessage> = messages.split_off(tail_start);
    let marker = ChatMessage {
        role: "user".to_string(),
        content: format!("[{dropped} earlier messages omitted to stay within history limits]"),
        tool_call_id: None,
        tool_calls: Vec::new(),
    };
    let mut rebuilt = vec![first, marker];
    rebuilt.append(&mut kept);
    *messages = rebuilt;
}

impl ChatMessage {
    fn clone_shallow(&self) -> ChatMessage {
        self.clone()
    }
}

fn finalize_output(
    turn: &AssistantTurn,
    model: &str,
    provider: Provider,
    tool_call_log: &[Value],
    response_format: Option<&Value>,
) -> Value {
    let mut output = Map::new();
    output.insert("content".to_string(), json!(turn.content));
    output.insert("model".to_string(), json!(model));
    output.insert("provider".to_string(), json!(provider.as_str()));
    output.insert(
        "toolCalls".to_string(),
        json!({"list": tool_call_log, "count": tool_call_log.len()}),
    );

    if let Some(format) = response_format {
        if let Ok(parsed) = serde_json::from_str::<Value>(&turn.content) {
            if let Value::Object(parsed_map) = &parsed {
                for (k, v) in parsed_map {
                    output.insert(k.clone(), v.clone());
                }
            }
            if let Some(schema) = format.get("schema") {
                match jsonschema::JSONSchema::compile(schema) {
                    Ok(compiled) => match compiled.validate(&parsed) {
                        Ok(()) => {
                            output.insert("_schema_valid".to_string(), json!(true));
                        }
                        Err(errors) => {
                            let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
                            output.insert("_schema_error".to_string(), json!(messages.join("; ")));
                        }
                    },
                    Err(e) => {
                        output.insert("_schema_error".to_string(), json!(format!("invalid schema: {e}")));
                    }
                }
            }
        }
    }

    Value::Object(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_long_results_with_marker() {
        let long = "x".repeat(MAX_TOOL_RESULT_SIZE + 100);
        let truncated = truncate_result(&long);
        assert!(truncated.len() < long.len());
        assert!(truncated.contains("truncated"));
    }

    #[test]
    fn env_reference_is_substituted() {
        std::env::set_var("WORKFLOW_ENGINE_TEST_AGENT_KEY", "sk-live-123");
        assert_eq!(resolve_env_references("{{WORKFLOW_ENGINE_TEST_AGENT_KEY}}"), "sk-live-123");
        std::env::remove_var("WORKFLOW_ENGINE_TEST_AGENT_KEY");
    }

    #[test]
    fn plain_string_without_tokens_is_unchanged() {
        assert_eq!(resolve_env_references("sk-plain-value"), "sk-plain-value");
    }

    #[test]
    fn unset_env_reference_resolves_to_empty_string() {
        std::env::remove_var("WORKFLOW_ENGINE_TEST_AGENT_MISSING");
        assert_eq!(resolve_env_references("{{WORKFLOW_ENGINE_TEST_AGENT_MISSING}}"), "");
    }

    #[test]
    fn short_results_are_untouched() {
        assert_eq!(truncate_result("hi"), "hi");
    }

    #[test]
    fn prune_keeps_first_and_recent_with_marker() {
        let mut messages: Vec<ChatMessage> = (0..40)
            .map(|i| ChatMessage {
                role: "user".to_string(),
                content: i.to_string(),
                tool_call_id: None,
                tool_calls: Vec::new(),
            })
            .collect();
        prune_history(&mut messages);
        assert_eq!(messages.len(), MAX_MESSAGE_HISTORY);
        assert_eq!(messages[0].content, "0");
        assert!(messages[1].content.contains("omitted"));
        assert_eq!(messages.last().unwrap().content, "39");
    }
}
