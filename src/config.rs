//! Configuration module - environment-based configuration
//!
//! Loads every knob the engine and HTTP surface read from the process
//! environment into one struct, the way the rest of this codebase does it.

use std::env;
use std::path::PathBuf;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub workflow_path: String,
    pub log_level: String,

    pub max_request_size: usize,
    pub rate_limit_requests: u32,
    pub rate_limit_window_secs: u64,

    pub workspace_dir: Option<PathBuf>,
    pub enable_command_execution: bool,
    pub max_file_size: u64,

    pub provider_keys: ProviderKeys,
}

/// Environment-sourced credentials/endpoints for every recognized LLM provider.
#[derive(Debug, Clone, Default)]
pub struct ProviderKeys {
    pub anthropic: Option<String>,
    pub openai: Option<String>,
    pub google: Option<String>,
    pub deepseek: Option<String>,
    pub xai: Option<String>,
    pub cerebras: Option<String>,
    pub groq: Option<String>,
    pub mistral: Option<String>,
    pub openrouter: Option<String>,
    pub azure_api_key: Option<String>,
    pub azure_endpoint: Option<String>,
    pub azure_api_version: String,
    pub vllm_api_key: Option<String>,
    pub vllm_base_url: Option<String>,
    pub ollama_api_key: Option<String>,
    pub ollama_url: Option<String>,
    pub vertex: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let workspace_dir = env::var("WORKSPACE_DIR").ok().map(PathBuf::from);
        let enable_command_execution = env::var("ENABLE_COMMAND_EXECUTION")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Self {
            host,
            port,
            workflow_path: env::var("WORKFLOW_PATH").unwrap_or_else(|_| "workflow.json".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            max_request_size: env::var("MAX_REQUEST_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10 * 1024 * 1024),
            rate_limit_requests: env::var("RATE_LIMIT_REQUESTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            rate_limit_window_secs: env::var("RATE_LIMIT_WINDOW")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            workspace_dir,
            enable_command_execution,
            max_file_size: env::var("MAX_FILE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100 * 1024 * 1024),
            provider_keys: ProviderKeys {
                anthropic: env::var("ANTHROPIC_API_KEY").ok(),
                openai: env::var("OPENAI_API_KEY").ok(),
                google: env::var("GOOGLE_API_KEY").ok(),
                deepseek: env::var("DEEPSEEK_API_KEY").ok(),
                xai: env::var("XAI_API_KEY").ok(),
                cerebras: env::var("CEREBRAS_API_KEY").ok(),
                groq: env::var("GROQ_API_KEY").ok(),
                mistral: env::var("MISTRAL_API_KEY").ok(),
                openrouter: env::var("OPENROUTER_API_KEY").ok(),
                azure_api_key: env::var("AZURE_OPENAI_API_KEY").ok(),
                azure_endpoint: env::var("AZURE_OPENAI_ENDPOINT").ok(),
                azure_api_version: env::var("AZURE_OPENAI_API_VERSION")
                    .unwrap_or_else(|_| "2024-02-01".to_string()),
                vllm_api_key: env::var("VLLM_API_KEY").ok(),
                vllm_base_url: env::var("VLLM_BASE_URL").ok(),
                ollama_api_key: env::var("OLLAMA_API_KEY").ok(),
                ollama_url: env::var("OLLAMA_URL").ok(),
                vertex: env::var("VERTEX_API_KEY").ok(),
            },
        }
    }

    /// Get server bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Collect `WORKFLOW_VAR_<NAME>` environment variables as initial workflow variables,
    /// JSON-parsing each value when possible and falling back to the raw string.
    pub fn seed_workflow_variables(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut vars = serde_json::Map::new();
        for (key, value) in env::vars() {
            if let Some(name) = key.strip_prefix("WORKFLOW_VAR_") {
                let parsed = serde_json::from_str(&value)
                    .unwrap_or_else(|_| serde_json::Value::String(value.clone()));
                vars.insert(name.to_string(), parsed);
            }
        }
        vars
    }

    /// Any placeholder-looking provider key values, and whether at least one real key is set.
    pub fn validate_environment(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let keys = [
            ("ANTHROPIC_API_KEY", self.provider_keys.anthropic.as_deref()),
            ("OPENAI_API_KEY", self.provider_keys.openai.as_deref()),
            ("GOOGLE_API_KEY", self.provider_keys.google.as_deref()),
        ];
        let any_set = keys.iter().any(|(_, v)| matches!(v, Some(s) if !s.is_empty()));
        if !any_set {
            warnings.push(
                "No recognized LLM provider API key is set (checked ANTHROPIC_API_KEY, OPENAI_API_KEY, GOOGLE_API_KEY)"
                    .to_string(),
            );
        }
        for (name, value) in keys {
            if let Some(v) = value {
                if v.contains("your-key-here") || v.contains("xxx") {
                    warnings.push(format!("{name} looks like a placeholder value"));
                }
            }
        }
        warnings
    }
}
