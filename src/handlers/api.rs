//! API / HTTP handler.
//!
//! Issues one HTTP request per invocation using the shared `reqwest::Client`
//! from `HandlerDeps`. All inputs arrive pre-resolved by the executor; this
//! handler only shapes the request and normalizes the response (§4.3.6).

use super::{BlockHandler, HandlerDeps};
use crate::engine::context::ExecutionContext;
use crate::model::Block;
use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Map, Value};
use std::str::FromStr;
use std::time::Duration;

pub struct ApiHandler;

#[async_trait]
impl BlockHandler for ApiHandler {
    fn can_handle(&self, block_type: &str) -> bool {
        matches!(block_type, "api" | "http" | "http_request")
    }

    async fn execute(
        &self,
        _ctx: &mut ExecutionContext,
        _block: &Block,
        resolved_inputs: &Map<String, Value>,
        deps: &HandlerDeps,
    ) -> anyhow::Result<Value> {
        let url = resolved_inputs
            .get("url")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        if url.is_empty() {
            return Ok(json!({"error": "No URL provided"}));
        }
        if url.starts_with('<') {
            return Ok(json!({"error": format!("Failed to resolve URL reference: {url}")}));
        }

        let method_str = resolved_inputs
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET")
            .to_uppercase();
        let method = match Method::from_str(&method_str) {
            Ok(m) => m,
            Err(_) => return Ok(json!({"error": format!("Unsupported HTTP method: {method_str}")})),
        };

        let timeout_secs = resolved_inputs
            .get("timeout")
            .and_then(|v| v.as_f64())
            .unwrap_or(30.0);

        let mut request = deps
            .http_client
            .request(method.clone(), &url)
            .timeout(Duration::from_secs_f64(timeout_secs.max(0.1)));

        request = apply_headers(request, resolved_inputs.get("headers"));

        if let Some(params) = resolved_inputs.get("params").and_then(|v| v.as_object()) {
            let query: Vec<(String, String)> = params
                .iter()
                .map(|(k, v)| (k.clone(), value_as_query_string(v)))
                .collect();
            request = request.query(&query);
        }

        let is_body_method = matches!(method, Method::POST | Method::PUT | Method::PATCH);
        if is_body_method {
            if let Some(body) = resolved_inputs.get("body") {
                request = match body {
                    Value::Object(_) | Value::Array(_) => request
                        .header("Content-Type", "application/json")
                        .json(body),
                    Value::String(s) => request.body(s.clone()),
                    Value::Null => request,
                    other => request.body(other.to_string()),
                };
            }
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Ok(json!({"error": format!("Request timed out after {timeout_secs}s"), "url": url}))
            }
            Err(e) if e.is_connect() => {
                return Ok(json!({"error": format!("Connection failed: {e}"), "url": url}))
            }
            Err(e) => return Ok(json!({"error": e.to_string(), "url": url})),
        };

        let status = response.status().as_u16();

        // 429/503 responses are the retry-eligible statuses named by the
        // transient-failure taxonomy (`engine::is_transient`). Surfacing
        // them as an error here, rather than a normal `{status: 429, ...}`
        // output, is what lets the executor's retry loop see and act on them.
        if status == 429 || status == 503 {
            return Err(anyhow::anyhow!("upstream returned HTTP {status} for {url}"));
        }

        let status_text = response
            .status()
            .canonical_reason()
            .unwrap_or("")
            .to_string();
        let is_json = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("application/json"))
            .unwrap_or(false);

        let mut headers_out = Map::new();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                headers_out.insert(name.to_string(), Value::String(v.to_string()));
            }
        }

        let body_text = match response.text().await {
            Ok(t) => t,
            Err(e) => return Ok(json!({"error": e.to_string(), "url": url})),
        };

        let data = if is_json {
            serde_json::from_str(&body_text).unwrap_or(Value::String(body_text))
        } else {
            Value::String(body_text)
        };

        Ok(json!({
            "status": status,
            "statusText": status_text,
            "headers": headers_out,
            "data": data,
            "ok": (200..300).contains(&status),
            "url": url,
        }))
    }
}

fn value_as_query_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Accepts either a plain header mapping or the `[{cells:{Key,Value}}]`
/// table-builder shape the workflow authoring UI emits.
fn apply_headers(mut request: reqwest::RequestBuilder, headers: Option<&Value>) -> reqwest::RequestBuilder {
    match headers {
        Some(Value::Object(map)) => {
            for (k, v) in map {
                if let Some(s) = v.as_str() {
                    request = request.header(k, s);
                }
            }
        }
        Some(Value::Array(rows)) => {
            for row in rows {
                let cells = row.get("cells").unwrap_or(row);
                let key = cells.get("Key").and_then(|v| v.as_str()).unwrap_or("").trim();
                let value = cells.get("Value").and_then(|v| v.as_str()).unwrap_or("");
                if !key.is_empty() {
                    request = request.header(key, value);
                }
            }
        }
        _ => {}
    }
    request
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unresolved_reference_url_is_rejected() {
        // sanity check on the guard condition used above
        assert!("<api.url>".starts_with('<'));
    }
}
