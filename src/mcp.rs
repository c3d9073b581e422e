//! Minimal MCP (Model Context Protocol) streamable-HTTP client.
//!
//! Only the client contract the Agent handler needs: open a session,
//! initialize, call one tool, and collect its content blocks. The transport
//! library itself is an external collaborator (§1 Out of scope) - this is a
//! direct JSON-RPC-over-HTTP implementation of just the shape we consume.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::{json, Value};
use std::time::Duration;

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const CALL_BUDGET: Duration = Duration::from_secs(60);

pub struct McpToolCall {
    pub server_url: String,
    pub tool_name: String,
}

/// Opens a session, initializes, calls one tool, and renders its content
/// blocks into a single string (text verbatim, binary as base64 with its
/// MIME type noted inline). The whole round trip is bounded by `CALL_BUDGET`.
pub async fn call_tool(client: &reqwest::Client, call: &McpToolCall, arguments: Value) -> Result<String, String> {
    tokio::time::timeout(CALL_BUDGET, call_tool_inner(client, call, arguments))
        .await
        .map_err(|_| "MCP call timed out after 60s".to_string())?
}

async fn call_tool_inner(client: &reqwest::Client, call: &McpToolCall, arguments: Value) -> Result<String, String> {
    let session_id = initialize_session(client, &call.server_url).await?;

    let body = json!({
        "jsonrpc": "2.0",
        "id": 2,
        "method": "tools/call",
        "params": {
            "name": call.tool_name,
            "arguments": arguments,
        }
    });

    let mut request = client.post(&call.server_url).json(&body);
    if let Some(session) = &session_id {
        request = request.header("Mcp-Session-Id", session);
    }
    let response = request.send().await.map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("MCP server returned {}", response.status()));
    }
    let parsed: Value = response.json().await.map_err(|e| e.to_string())?;

    if let Some(error) = parsed.get("error") {
        let message = error.get("message").and_then(|v| v.as_str()).unwrap_or("MCP tool call failed");
        return Err(message.to_string());
    }

    let content = parsed
        .get("result")
        .and_then(|r| r.get("content"))
        .and_then(|c| c.as_array())
        .cloned()
        .unwrap_or_default();

    Ok(render_content(&content))
}

async fn initialize_session(client: &reqwest::Client, server_url: &str) -> Result<Option<String>, String> {
    let body = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "workflow-engine", "version": "1.0.0"},
        }
    });
    let response = client.post(server_url).json(&body).send().await.map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("MCP initialize returned {}", response.status()));
    }
    let session_id = response
        .headers()
        .get("Mcp-Session-Id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    Ok(session_id)
}

fn render_content(blocks: &[Value]) -> String {
    let mut out = String::new();
    for block in blocks {
        match block.get("type").and_then(|v| v.as_str()) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                    out.push_str(text);
                }
            }
            Some("image") | Some("audio") | Some("blob") => {
                let data = block.get("data").and_then(|v| v.as_str()).unwrap_or("");
                let mime = block.get("mimeType").and_then(|v| v.as_str()).unwrap_or("application/octet-stream");
                if looks_like_base64(data) {
                    out.push_str(&format!("[{mime} base64]{data}"));
                } else {
                    out.push_str(&format!("[{mime} base64]{}", STANDARD.encode(data)));
                }
            }
            _ => {
                out.push_str(&block.to_string());
            }
        }
    }
    out
}

fn looks_like_base64(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_text_blocks() {
        let blocks = vec![json!({"type": "text", "text": "hello"}), json!({"type": "text", "text": " world"})];
        assert_eq!(render_content(&blocks), "hello world");
    }

    #[test]
    fn renders_binary_blocks_with_mime_marker() {
        let blocks = vec![json!({"type": "image", "data": "aGVsbG8=", "mimeType": "image/png"})];
        let rendered = render_content(&blocks);
        assert!(rendered.contains("image/png"));
        assert!(rendered.contains("aGVsbG8="));
    }
}
