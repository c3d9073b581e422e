//! Provider selection and wire-protocol adapters for the agent handler.
//!
//! Classifies a `model` string into a [`Provider`], then speaks that
//! provider's native chat-completion shape over the shared `reqwest::Client`.
//! Only the protocol shape matters here - the real provider SDKs are treated
//! as an external collaborator (§1 Out of scope).

use crate::config::Config;
use serde_json::{json, Map, Value};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Anthropic,
    OpenAi,
    Google,
    Grok,
    DeepSeek,
    Mistral,
    Azure,
    Vertex,
    OpenRouter,
    Cerebras,
    Groq,
    VLlm,
    Ollama,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::OpenAi => "openai",
            Provider::Google => "google",
            Provider::Grok => "grok",
            Provider::DeepSeek => "deepseek",
            Provider::Mistral => "mistral",
            Provider::Azure => "azure",
            Provider::Vertex => "vertex",
            Provider::OpenRouter => "openrouter",
            Provider::Cerebras => "cerebras",
            Provider::Groq => "groq",
            Provider::VLlm => "vllm",
            Provider::Ollama => "ollama",
        }
    }
}

/// Classifies `model` per §4.3.7: explicit `provider/` prefixes win first,
/// then substring rules over the bare model name.
pub fn classify_model(model: &str) -> Provider {
    for (prefix, provider) in [
        ("azure/", Provider::Azure),
        ("vertex/", Provider::Vertex),
        ("openrouter/", Provider::OpenRouter),
        ("cerebras/", Provider::Cerebras),
        ("groq/", Provider::Groq),
        ("vllm/", Provider::VLlm),
        ("ollama/", Provider::Ollama),
    ] {
        if let Some(rest) = model.strip_prefix(prefix) {
            let _ = rest;
            return provider;
        }
    }

    let lower = model.to_lowercase();
    if lower.contains("claude") {
        return Provider::Anthropic;
    }
    if lower.contains("gemini") {
        return Provider::Google;
    }
    if lower.contains("grok") {
        return Provider::Grok;
    }
    if lower.contains("deepseek") {
        return Provider::DeepSeek;
    }
    if ["mistral", "mixtral", "codestral"].iter().any(|s| lower.contains(s)) {
        return Provider::Mistral;
    }
    if lower.contains("gpt") || is_o_series(&lower) {
        return Provider::OpenAi;
    }
    Provider::OpenAi
}

fn is_o_series(lower: &str) -> bool {
    ["o1", "o3", "o4"].iter().any(|prefix| {
        lower
            .strip_prefix(prefix)
            .map(|rest| rest.is_empty() || !rest.chars().next().unwrap().is_alphanumeric())
            .unwrap_or(false)
    })
}

/// Resolves the API key/base-URL this provider needs from `Config`. Self-hosted
/// Ollama/vLLM tolerate an absent key.
pub fn resolve_credentials(provider: Provider, config: &Config) -> Result<(Option<String>, Option<String>), String> {
    let keys = &config.provider_keys;
    let missing = |name: &str| format!("No API key configured for provider '{name}'");
    match provider {
        Provider::Anthropic => Ok((Some(keys.anthropic.clone().ok_or_else(|| missing("anthropic"))?), None)),
        Provider::OpenAi => Ok((Some(keys.openai.clone().ok_or_else(|| missing("openai"))?), None)),
        Provider::Google | Provider::Vertex => Ok((Some(keys.google.clone().ok_or_else(|| missing("google"))?), None)),
        Provider::Grok => Ok((Some(keys.xai.clone().ok_or_else(|| missing("grok"))?), None)),
        Provider::DeepSeek => Ok((Some(keys.deepseek.clone().ok_or_else(|| missing("deepseek"))?), None)),
        Provider::Mistral => Ok((Some(keys.mistral.clone().ok_or_else(|| missing("mistral"))?), None)),
        Provider::OpenRouter => Ok((Some(keys.openrouter.clone().ok_or_else(|| missing("openrouter"))?), None)),
        Provider::Cerebras => Ok((Some(keys.cerebras.clone().ok_or_else(|| missing("cerebras"))?), None)),
        Provider::Groq => Ok((Some(keys.groq.clone().ok_or_else(|| missing("groq"))?), None)),
        Provider::Azure => Ok((
            Some(keys.azure_api_key.clone().ok_or_else(|| missing("azure"))?),
            Some(keys.azure_endpoint.clone().ok_or_else(|| "AZURE_OPENAI_ENDPOINT not set".to_string())?),
        )),
        Provider::VLlm => Ok((keys.vllm_api_key.clone(), keys.vllm_base_url.clone())),
        Provider::Ollama => Ok((keys.ollama_api_key.clone(), keys.ollama_url.clone())),
    }
}

/// A normalized chat message, provider-agnostic.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    pub tool_call_id: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
}

#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

pub struct AssistantTurn {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub done: bool,
}

fn openai_tools_json(tools: &[ToolDeclaration]) -> Value {
    Value::Array(
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect(),
    )
}

fn openai_messages_json(messages: &[ChatMessage]) -> Value {
    Value::Array(
        messages
            .iter()
            .map(|m| {
                let mut obj = Map::new();
                obj.insert("role".to_string(), json!(m.role));
                obj.insert("content".to_string(), json!(m.content));
                if let Some(id) = &m.tool_call_id {
                    obj.insert("tool_call_id".to_string(), json!(id));
                }
                if !m.tool_calls.is_empty() {
                    obj.insert(
                        "tool_calls".to_string(),
                        Value::Array(
                            m.tool_calls
                                .iter()
                                .map(|tc| {
                                    json!({
                                        "id": tc.id,
                                        "type": "function",
                                        "function": {"name": tc.name, "arguments": tc.input.to_string()}
                                    })
                                })
                                .collect(),
                        ),
                    );
                }
                Value::Object(obj)
            })
            .collect(),
    )
}

fn parse_openai_response(body: &Value) -> Result<AssistantTurn, String> {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| "no choices in provider response".to_string())?;
    let message = choice.get("message").cloned().unwrap_or(Value::Null);
    let content = message.get("content").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let tool_calls = message
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| {
                    let id = tc.get("id")?.as_str()?.to_string();
                    let function = tc.get("function")?;
                    let name = function.get("name")?.as_str()?.to_string();
                    let args_str = function.get("arguments").and_then(|v| v.as_str()).unwrap_or("{}");
                    let input = serde_json::from_str(args_str).unwrap_or(json!({}));
                    Some(ToolCallRequest { id, name, input })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let finish_reason = choice.get("finish_reason").and_then(|v| v.as_str()).unwrap_or("stop");
    Ok(AssistantTurn {
        content,
        done: tool_calls.is_empty() || finish_reason == "stop",
        tool_calls,
    })
}

/// Shared OpenAI-compatible chat-completions call, used by every provider
/// whose wire format is the `{messages, tools}` / `{choices:[{message}]}`
/// shape: openai, azure, openrouter, cerebras, groq, vllm, ollama, deepseek,
/// the mistral family, and grok (xAI's public API is OpenAI-compatible).
async fn call_openai_compatible(
    client: &reqwest::Client,
    base_url: &str,
    api_key: Option<&str>,
    model: &str,
    messages: &[ChatMessage],
    tools: &[ToolDeclaration],
) -> Result<AssistantTurn, String> {
    let mut body = json!({
        "model": model,
        "messages": openai_messages_json(messages),
    });
    if !tools.is_empty() {
        body["tools"] = openai_tools_json(tools);
    }

    let mut request = client
        .post(base_url)
        .timeout(Duration::from_secs(60))
        .json(&body);
    if let Some(key) = api_key {
        request = request.bearer_auth(key);
    }

    let response = request.send().await.map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(format!("provider returned {status}: {text}"));
    }
    let parsed: Value = response.json().await.map_err(|e| e.to_string())?;
    parse_openai_response(&parsed)
}

async fn call_anthropic(
    client: &reqwest::Client,
    api_key: &str,
    model: &str,
    messages: &[ChatMessage],
    tools: &[ToolDeclaration],
) -> Result<AssistantTurn, String> {
    let (system, rest): (Vec<&ChatMessage>, Vec<&ChatMessage>) =
        (messages.iter().filter(|m| m.role == "system").collect(), messages.iter().filter(|m| m.role != "system").collect());
    let system_prompt = system.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join("\n");

    let anthropic_messages: Vec<Value> = rest
        .iter()
        .map(|m| {
            let role = if m.role == "tool" { "user" } else { m.role.as_str() };
            json!({"role": role, "content": m.content})
        })
        .collect();

    let mut body = json!({
        "model": model,
        "max_tokens": 4096,
        "messages": anthropic_messages,
    });
    if !system_prompt.is_empty() {
        body["system"] = json!(system_prompt);
    }
    if !tools.is_empty() {
        body["tools"] = Value::Array(
            tools
                .iter()
                .map(|t| json!({"name": t.name, "description": t.description, "input_schema": t.parameters}))
                .collect(),
        );
    }

    let response = client
        .post("https://api.anthropic.com/v1/messages")
        .timeout(Duration::from_secs(60))
        .header("x-api-key", api_key)
        .header("anthropic-version", "2023-06-01")
        .json(&body)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(format!("provider returned {status}: {text}"));
    }
    let parsed: Value = response.json().await.map_err(|e| e.to_string())?;

    let blocks = parsed.get("content").and_then(|c| c.as_array()).cloned().unwrap_or_default();
    let mut content = String::new();
    let mut tool_calls = Vec::new();
    for block in &blocks {
        match block.get("type").and_then(|v| v.as_str()) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                    content.push_str(text);
                }
            }
            Some("tool_use") => {
                let id = block.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                let name = block.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                let input = block.get("input").cloned().unwrap_or(json!({}));
                tool_calls.push(ToolCallRequest { id, name, input });
            }
            _ => {}
        }
    }
    let stop_reason = parsed.get("stop_reason").and_then(|v| v.as_str()).unwrap_or("end_turn");
    Ok(AssistantTurn {
        content,
        done: stop_reason != "tool_use",
        tool_calls,
    })
}

async fn call_google(
    client: &reqwest::Client,
    api_key: &str,
    model: &str,
    messages: &[ChatMessage],
    tools: &[ToolDeclaration],
) -> Result<AssistantTurn, String> {
    let contents: Vec<Value> = messages
        .iter()
        .filter(|m| m.role != "system")
        .map(|m| {
            let role = if m.role == "assistant" { "model" } else { "user" };
            json!({"role": role, "parts": [{"text": m.content}]})
        })
        .collect();

    let mut body = json!({"contents": contents});
    if !tools.is_empty() {
        body["tools"] = json!([{
            "functionDeclarations": tools.iter().map(|t| json!({
                "name": t.name,
                "description": t.description,
                "parameters": t.parameters,
            })).collect::<Vec<_>>()
        }]);
    }

    let url = format!(
        "https://generativelanguage.googleapis.com/v1beta/models/{model}:generateContent?key={api_key}"
    );
    let response = client
        .post(&url)
        .timeout(Duration::from_secs(60))
        .json(&body)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(format!("provider returned {status}: {text}"));
    }
    let parsed: Value = response.json().await.map_err(|e| e.to_string())?;

    let parts = parsed
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .cloned()
        .unwrap_or_default();

    let mut content = String::new();
    let mut tool_calls = Vec::new();
    for (i, part) in parts.iter().enumerate() {
        if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
            content.push_str(text);
        }
        if let Some(call) = part.get("functionCall") {
            let name = call.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let input = call.get("args").cloned().unwrap_or(json!({}));
            tool_calls.push(ToolCallRequest {
                id: format!("call_{i}"),
                name,
                input,
            });
        }
    }
    Ok(AssistantTurn {
        done: tool_calls.is_empty(),
        content,
        tool_calls,
    })
}

/// Dispatches to the provider's native wire format.
pub async fn send_chat_turn(
    client: &reqwest::Client,
    provider: Provider,
    api_key: Option<&str>,
    base_url_override: Option<&str>,
    model: &str,
    messages: &[ChatMessage],
    tools: &[ToolDeclaration],
) -> Result<AssistantTurn, String> {
    match provider {
        Provider::Anthropic => {
            let key = api_key.ok_or_else(|| "anthropic requires an API key".to_string())?;
            call_anthropic(client, key, model, messages, tools).await
        }
        Provider::Google | Provider::Vertex => {
            let key = api_key.ok_or_else(|| "google requires an API key".to_string())?;
            call_google(client, key, model, messages, tools).await
        }
        Provider::Grok => {
            call_openai_compatible(client, "https://api.x.ai/v1/chat/completions", api_key, model, messages, tools).await
        }
        Provider::Azure => {
            let base = base_url_override.ok_or_else(|| "azure requires AZURE_OPENAI_ENDPOINT".to_string())?;
            let url = format!("{base}/openai/deployments/{model}/chat/completions");
            call_openai_compatible(client, &url, api_key, model, messages, tools).await
        }
        Provider::VLlm => {
            let base = base_url_override.unwrap_or("http://localhost:8000/v1");
            let url = format!("{base}/chat/completions");
            call_openai_compatible(client, &url, api_key, model, messages, tools).await
        }
        Provider::Ollama => {
            let base = base_url_override.unwrap_or("http://localhost:11434/v1");
            let url = format!("{base}/chat/completions");
            call_openai_compatible(client, &url, api_key, model, messages, tools).await
        }
        Provider::OpenRouter => {
            call_openai_compatible(client, "https://openrouter.ai/api/v1/chat/completions", api_key, model, messages, tools).await
        }
        Provider::Cerebras => {
            call_openai_compatible(client, "https://api.cerebras.ai/v1/chat/completions", api_key, model, messages, tools).await
        }
        Provider::Groq => {
            call_openai_compatible(client, "https://api.groq.com/openai/v1/chat/completions", api_key, model, messages, tools).await
        }
        Provider::DeepSeek => {
            call_openai_compatible(client, "https://api.deepseek.com/chat/completions", api_key, model, messages, tools).await
        }
        Provider::Mistral => {
            call_openai_compatible(client, "https://api.mistral.ai/v1/chat/completions", api_key, model, messages, tools).await
        }
        Provider::OpenAi => {
            call_openai_compatible(client, "https://api.openai.com/v1/chat/completions", api_key, model, messages, tools).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_explicit_prefixes() {
        assert_eq!(classify_model("azure/gpt-4o"), Provider::Azure);
        assert_eq!(classify_model("ollama/llama3"), Provider::Ollama);
    }

    #[test]
    fn classifies_by_substring() {
        assert_eq!(classify_model("claude-3-5-sonnet"), Provider::Anthropic);
        assert_eq!(classify_model("gpt-4o"), Provider::OpenAi);
        assert_eq!(classify_model("o3-mini"), Provider::OpenAi);
        assert_eq!(classify_model("gemini-1.5-pro"), Provider::Google);
        assert_eq!(classify_model("grok-2"), Provider::Grok);
        assert_eq!(classify_model("deepseek-chat"), Provider::DeepSeek);
        assert_eq!(classify_model("mixtral-8x7b"), Provider::Mistral);
    }

    #[test]
    fn defaults_to_openai_compatible() {
        assert_eq!(classify_model("some-unknown-model"), Provider::OpenAi);
    }
}
