//! Native filesystem/command tools exposed to the agent handler as `local_*`.
//!
//! All paths are resolved and confined under `WORKSPACE_DIR` (§6); any
//! traversal that would escape it is rejected before touching the
//! filesystem. `execute_command` additionally rejects shell metacharacters
//! and tokenizes with `shlex` rather than invoking a shell.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

pub struct NativeTools {
    pub workspace_root: PathBuf,
    pub command_execution_enabled: bool,
    pub max_file_size: u64,
}

const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);
const SHELL_METACHARACTERS: &[char] = &['|', '>', '<', '&', ';', '$', '`'];

impl NativeTools {
    pub fn new(workspace_root: PathBuf, command_execution_enabled: bool, max_file_size: u64) -> Self {
        Self {
            workspace_root,
            command_execution_enabled,
            max_file_size,
        }
    }

    /// Tool declarations exposed to the model, each prefixed `local_`.
    pub fn declarations(&self) -> Vec<crate::providers::ToolDeclaration> {
        let path_param = |desc: &str| {
            json!({
                "type": "object",
                "properties": {"path": {"type": "string", "description": desc}},
                "required": ["path"],
            })
        };
        let mut decls = vec![
            crate::providers::ToolDeclaration {
                name: "local_write_file".to_string(),
                description: "Write UTF-8 text content to a file under the workspace".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string"},
                        "content": {"type": "string"},
                    },
                    "required": ["path", "content"],
                }),
            },
            crate::providers::ToolDeclaration {
                name: "local_write_bytes".to_string(),
                description: "Write base64-encoded bytes to a file under the workspace".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string"},
                        "base64": {"type": "string"},
                    },
                    "required": ["path", "base64"],
                }),
            },
            crate::providers::ToolDeclaration {
                name: "local_append_file".to_string(),
                description: "Append UTF-8 text content to a file under the workspace".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string"},
                        "content": {"type": "string"},
                    },
                    "required": ["path", "content"],
                }),
            },
            crate::providers::ToolDeclaration {
                name: "local_read_file".to_string(),
                description: "Read a UTF-8 text file under the workspace".to_string(),
                parameters: path_param("path relative to the workspace root"),
            },
            crate::providers::ToolDeclaration {
                name: "local_read_bytes".to_string(),
                description: "Read a file under the workspace, returned base64-encoded".to_string(),
                parameters: path_param("path relative to the workspace root"),
            },
            crate::providers::ToolDeclaration {
                name: "local_delete_file".to_string(),
                description: "Delete a file under the workspace".to_string(),
                parameters: path_param("path relative to the workspace root"),
            },
            crate::providers::ToolDeclaration {
                name: "local_list_directory".to_string(),
                description: "List entries in a directory under the workspace".to_string(),
                parameters: path_param("directory path relative to the workspace root"),
            },
        ];
        if self.command_execution_enabled {
            decls.push(crate::providers::ToolDeclaration {
                name: "local_execute_command".to_string(),
                description: "Run a command (no shell metacharacters) under the workspace".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {"command": {"type": "string"}},
                    "required": ["command"],
                }),
            });
        }
        decls
    }

    /// Resolves `relative` under the workspace root, rejecting any traversal
    /// that would escape it. Rejects `..` components textually rather than
    /// relying solely on canonicalization, since the target need not exist
    /// yet (write paths).
    fn safe_path(&self, relative: &str) -> Result<PathBuf, String> {
        let candidate = Path::new(relative);
        if candidate.is_absolute() {
            return Err("Path escapes sandbox: absolute paths are not permitted".to_string());
        }
        let mut normalized = PathBuf::new();
        for component in candidate.components() {
            use std::path::Component;
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    return Err("Path escapes sandbox: '..' is not permitted".to_string());
                }
                _ => return Err("Path escapes sandbox: invalid path component".to_string()),
            }
        }
        Ok(self.workspace_root.join(normalized))
    }

    pub async fn dispatch(&self, tool_name: &str, args: &Value) -> Value {
        let result = match tool_name {
            "local_write_file" => self.write_file(args).await,
            "local_write_bytes" => self.write_bytes(args).await,
            "local_append_file" => self.append_file(args).await,
            "local_read_file" => self.read_file(args).await,
            "local_read_bytes" => self.read_bytes(args).await,
            "local_delete_file" => self.delete_file(args).await,
            "local_list_directory" => self.list_directory(args).await,
            "local_execute_command" => self.execute_command(args).await,
            other => Err(format!("Unknown native tool: {other}")),
        };
        match result {
            Ok(mut v) => {
                v["success"] = json!(true);
                v
            }
            Err(error) => json!({"success": false, "error": error}),
        }
    }

    fn required_path(&self, args: &Value) -> Result<PathBuf, String> {
        let relative = args.get("path").and_then(|v| v.as_str()).ok_or("'path' is required")?;
        self.safe_path(relative)
    }

    async fn write_file(&self, args: &Value) -> Result<Value, String> {
        let path = self.required_path(args)?;
        let content = args.get("content").and_then(|v| v.as_str()).unwrap_or("");
        if content.len() as u64 > self.max_file_size {
            return Err("File exceeds MAX_FILE_SIZE".to_string());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| e.to_string())?;
        }
        tokio::fs::write(&path, content).await.map_err(|e| e.to_string())?;
        Ok(json!({"path": args["path"]}))
    }

    async fn write_bytes(&self, args: &Value) -> Result<Value, String> {
        let path = self.required_path(args)?;
        let b64 = args.get("base64").and_then(|v| v.as_str()).ok_or("'base64' is required")?;
        let bytes = STANDARD.decode(b64).map_err(|e| format!("invalid base64: {e}"))?;
        if bytes.len() as u64 > self.max_file_size {
            return Err("File exceeds MAX_FILE_SIZE".to_string());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| e.to_string())?;
        }
        tokio::fs::write(&path, &bytes).await.map_err(|e| e.to_string())?;
        Ok(json!({"path": args["path"], "bytes": bytes.len()}))
    }

    async fn append_file(&self, args: &Value) -> Result<Value, String> {
        let path = self.required_path(args)?;
        let content = args.get("content").and_then(|v| v.as_str()).unwrap_or("");
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| e.to_string())?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| e.to_string())?;
        file.write_all(content.as_bytes()).await.map_err(|e| e.to_string())?;
        Ok(json!({"path": args["path"]}))
    }

    async fn read_file(&self, args: &Value) -> Result<Value, String> {
        let path = self.required_path(args)?;
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| e.to_string())?;
        Ok(json!({"content": content}))
    }

    async fn read_bytes(&self, args: &Value) -> Result<Value, String> {
        let path = self.required_path(args)?;
        let bytes = tokio::fs::read(&path).await.map_err(|e| e.to_string())?;
        Ok(json!({"base64": STANDARD.encode(bytes)}))
    }

    async fn delete_file(&self, args: &Value) -> Result<Value, String> {
        let path = self.required_path(args)?;
        tokio::fs::remove_file(&path).await.map_err(|e| e.to_string())?;
        Ok(json!({"path": args["path"]}))
    }

    async fn list_directory(&self, args: &Value) -> Result<Value, String> {
        let path = self.required_path(args)?;
        let mut entries = tokio::fs::read_dir(&path).await.map_err(|e| e.to_string())?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| e.to_string())? {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(json!({"entries": names}))
    }

    async fn execute_command(&self, args: &Value) -> Result<Value, String> {
        if !self.command_execution_enabled {
            return Err("Command execution is disabled (ENABLE_COMMAND_EXECUTION is not set)".to_string());
        }
        let command = args.get("command").and_then(|v| v.as_str()).ok_or("'command' is required")?;
        if command.chars().any(|c| SHELL_METACHARACTERS.contains(&c)) || command.contains("$(") || command.contains("${") {
            return Err("Command contains disallowed shell metacharacters".to_string());
        }
        let parts = shlex::split(command).ok_or("Failed to tokenize command")?;
        let (program, rest) = parts.split_first().ok_or("Empty command")?;

        let output = tokio::time::timeout(
            COMMAND_TIMEOUT,
            Command::new(program)
                .args(rest)
                .current_dir(&self.workspace_root)
                .output(),
        )
        .await
        .map_err(|_| "Command timed out after 300s".to_string())?
        .map_err(|e| e.to_string())?;

        Ok(json!({
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": String::from_utf8_lossy(&output.stderr),
            "exitCode": output.status.code(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tools() -> NativeTools {
        NativeTools::new(std::env::temp_dir().join("workflow_engine_test_sandbox"), false, 100 * 1024 * 1024)
    }

    #[test]
    fn rejects_parent_dir_traversal() {
        let t = tools();
        let err = t.safe_path("../etc/passwd").unwrap_err();
        assert!(err.contains("escapes sandbox"));
    }

    #[test]
    fn rejects_absolute_paths() {
        let t = tools();
        let err = t.safe_path("/etc/passwd").unwrap_err();
        assert!(err.contains("escapes sandbox"));
    }

    #[test]
    fn accepts_relative_subpath() {
        let t = tools();
        let resolved = t.safe_path("notes/todo.txt").unwrap();
        assert!(resolved.starts_with(&t.workspace_root));
    }

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let t = NativeTools::new(std::env::temp_dir().join(format!("wf_test_{}", uuid::Uuid::new_v4())), false, 1024 * 1024);
        tokio::fs::create_dir_all(&t.workspace_root).await.unwrap();
        let write = t.dispatch("local_write_file", &json!({"path": "a.txt", "content": "hi"})).await;
        assert_eq!(write["success"], json!(true));
        let read = t.dispatch("local_read_file", &json!({"path": "a.txt"})).await;
        assert_eq!(read["content"], json!("hi"));
        tokio::fs::remove_dir_all(&t.workspace_root).await.ok();
    }

    #[tokio::test]
    async fn sandbox_escape_is_rejected_and_writes_nothing() {
        let root = std::env::temp_dir().join(format!("wf_test_{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&root).await.unwrap();
        let t = NativeTools::new(root.clone(), false, 1024 * 1024);
        let result = t.dispatch("local_write_file", &json!({"path": "../escaped.txt", "content": "x"})).await;
        assert_eq!(result["success"], json!(false));
        assert!(!root.parent().unwrap().join("escaped.txt").exists());
        tokio::fs::remove_dir_all(&root).await.ok();
    }

    #[test]
    fn execute_command_rejects_shell_metacharacters() {
        assert!("echo hi; rm -rf /".contains(';'));
    }
}
