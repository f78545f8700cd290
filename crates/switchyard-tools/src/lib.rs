use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::fs;
use tokio::process::Command;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use switchyard_types::ToolDefinition;

pub mod loop_detector;
pub mod policy;

pub use loop_detector::*;
pub use policy::*;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    /// Tools that act on the outside world default to `suggest` trust.
    #[serde(default)]
    pub requires_auth: bool,
}

impl From<&ToolSchema> for ToolDefinition {
    fn from(schema: &ToolSchema) -> Self {
        ToolDefinition {
            name: schema.name.clone(),
            description: schema.description.clone(),
            input_schema: schema.input_schema.clone(),
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;
    async fn execute(&self, args: Value) -> anyhow::Result<String>;
    async fn execute_with_cancel(
        &self,
        args: Value,
        _cancel: CancellationToken,
    ) -> anyhow::Result<String> {
        self.execute(args).await
    }
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the file and shell tools, sandboxed to `root`.
    pub fn with_builtins(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let mut map: HashMap<String, Arc<dyn Tool>> = HashMap::new();
        map.insert("read".to_string(), Arc::new(ReadTool { root: root.clone() }));
        map.insert("write".to_string(), Arc::new(WriteTool { root: root.clone() }));
        map.insert("edit".to_string(), Arc::new(EditTool { root: root.clone() }));
        map.insert("exec".to_string(), Arc::new(ExecTool { root }));
        Self {
            tools: Arc::new(RwLock::new(map)),
        }
    }

    pub async fn register(&self, tool: Arc<dyn Tool>) -> anyhow::Result<()> {
        let schema = tool.schema();
        validate_tool_schemas(std::slice::from_ref(&schema))?;
        self.tools.write().await.insert(schema.name, tool);
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<ToolSchema> {
        let mut schemas = self
            .tools
            .read()
            .await
            .values()
            .map(|t| t.schema())
            .collect::<Vec<_>>();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub async fn names(&self) -> Vec<String> {
        self.list().await.into_iter().map(|s| s.name).collect()
    }

    pub async fn definitions(&self) -> Vec<ToolDefinition> {
        self.list().await.iter().map(ToolDefinition::from).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSchemaValidationError {
    pub tool_name: String,
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for ToolSchemaValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid tool schema `{}` at `{}`: {}",
            self.tool_name, self.path, self.reason
        )
    }
}

impl std::error::Error for ToolSchemaValidationError {}

pub fn validate_tool_schemas(schemas: &[ToolSchema]) -> Result<(), ToolSchemaValidationError> {
    for schema in schemas {
        if schema.name.trim().is_empty() {
            return Err(ToolSchemaValidationError {
                tool_name: schema.name.clone(),
                path: "$".to_string(),
                reason: "tool name is empty".to_string(),
            });
        }
        validate_schema_node(&schema.name, "$", &schema.input_schema)?;
    }
    Ok(())
}

fn validate_schema_node(
    tool_name: &str,
    path: &str,
    value: &Value,
) -> Result<(), ToolSchemaValidationError> {
    let Some(obj) = value.as_object() else {
        return Ok(());
    };

    if obj.get("type").and_then(|t| t.as_str()) == Some("array") && !obj.contains_key("items") {
        return Err(ToolSchemaValidationError {
            tool_name: tool_name.to_string(),
            path: path.to_string(),
            reason: "array schema missing items".to_string(),
        });
    }
    if let Some(items) = obj.get("items") {
        validate_schema_node(tool_name, &format!("{path}.items"), items)?;
    }
    if let Some(props) = obj.get("properties").and_then(|v| v.as_object()) {
        for (key, child) in props {
            validate_schema_node(tool_name, &format!("{path}.properties.{key}"), child)?;
        }
    }
    Ok(())
}

/// Relative paths only, never escaping the sandbox root.
fn resolve_in_root(root: &Path, path: &str) -> Option<PathBuf> {
    let raw = Path::new(path);
    if path.is_empty()
        || raw.is_absolute()
        || raw.components().any(|c| matches!(c, Component::ParentDir))
    {
        return None;
    }
    Some(root.join(raw))
}

fn str_arg<'a>(args: &'a Value, key: &str) -> &'a str {
    args.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

struct ReadTool {
    root: PathBuf,
}

#[async_trait]
impl Tool for ReadTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "read".to_string(),
            description: "Read a file relative to the task workspace".to_string(),
            input_schema: json!({"type":"object","properties":{"path":{"type":"string"}},"required":["path"]}),
            requires_auth: false,
        }
    }

    async fn execute(&self, args: Value) -> anyhow::Result<String> {
        let path = str_arg(&args, "path");
        let Some(full) = resolve_in_root(&self.root, path) else {
            anyhow::bail!("path `{path}` denied by sandbox policy");
        };
        Ok(fs::read_to_string(full).await?)
    }
}

struct WriteTool {
    root: PathBuf,
}

#[async_trait]
impl Tool for WriteTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "write".to_string(),
            description: "Write a file relative to the task workspace".to_string(),
            input_schema: json!({"type":"object","properties":{"path":{"type":"string"},"content":{"type":"string"}},"required":["path","content"]}),
            requires_auth: false,
        }
    }

    async fn execute(&self, args: Value) -> anyhow::Result<String> {
        let path = str_arg(&args, "path");
        let Some(full) = resolve_in_root(&self.root, path) else {
            anyhow::bail!("path `{path}` denied by sandbox policy");
        };
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = str_arg(&args, "content");
        fs::write(&full, content).await?;
        Ok(format!("wrote {} bytes to {path}", content.len()))
    }
}

struct EditTool {
    root: PathBuf,
}

#[async_trait]
impl Tool for EditTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "edit".to_string(),
            description: "Replace a string in a workspace file".to_string(),
            input_schema: json!({"type":"object","properties":{"path":{"type":"string"},"old":{"type":"string"},"new":{"type":"string"}},"required":["path","old","new"]}),
            requires_auth: false,
        }
    }

    async fn execute(&self, args: Value) -> anyhow::Result<String> {
        let path = str_arg(&args, "path");
        let Some(full) = resolve_in_root(&self.root, path) else {
            anyhow::bail!("path `{path}` denied by sandbox policy");
        };
        let old = str_arg(&args, "old");
        if old.is_empty() {
            anyhow::bail!("`old` must not be empty");
        }
        let content = fs::read_to_string(&full).await?;
        let hits = content.matches(old).count();
        if hits == 0 {
            anyhow::bail!("`old` not found in {path}");
        }
        fs::write(&full, content.replace(old, str_arg(&args, "new"))).await?;
        Ok(format!("replaced {hits} occurrence(s) in {path}"))
    }
}

struct ExecTool {
    root: PathBuf,
}

impl ExecTool {
    fn command(&self, args: &Value) -> anyhow::Result<Command> {
        let cmd = str_arg(args, "command");
        if cmd.trim().is_empty() {
            anyhow::bail!("missing `command`");
        }
        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd).current_dir(&self.root).kill_on_drop(true);
        Ok(command)
    }
}

#[async_trait]
impl Tool for ExecTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "exec".to_string(),
            description: "Run a shell command in the task workspace".to_string(),
            input_schema: json!({"type":"object","properties":{"command":{"type":"string"}},"required":["command"]}),
            requires_auth: true,
        }
    }

    async fn execute(&self, args: Value) -> anyhow::Result<String> {
        self.execute_with_cancel(args, CancellationToken::new()).await
    }

    async fn execute_with_cancel(
        &self,
        args: Value,
        cancel: CancellationToken,
    ) -> anyhow::Result<String> {
        let mut command = self.command(&args)?;
        let child = command.output();
        let output = tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("command cancelled"),
            output = child => output?,
        };
        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            text.push_str("\n[stderr]\n");
            text.push_str(&stderr);
        }
        if !output.status.success() {
            anyhow::bail!("command exited with {}: {}", output.status, text.trim());
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn validator_rejects_array_without_items() {
        let schemas = vec![ToolSchema {
            name: "bad".to_string(),
            description: "bad schema".to_string(),
            input_schema: json!({
                "type":"object",
                "properties":{"todos":{"type":"array"}}
            }),
            requires_auth: false,
        }];
        let err = validate_tool_schemas(&schemas).expect_err("expected schema validation failure");
        assert_eq!(err.tool_name, "bad");
        assert!(err.path.contains("properties.todos"));
    }

    #[tokio::test]
    async fn builtin_schemas_are_unique_and_valid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = ToolRegistry::with_builtins(dir.path());
        let schemas = registry.list().await;
        validate_tool_schemas(&schemas).expect("builtin tool schemas should validate");
        let unique = schemas
            .iter()
            .map(|schema| schema.name.as_str())
            .collect::<HashSet<_>>();
        assert_eq!(unique.len(), schemas.len());
        assert_eq!(registry.names().await, vec!["edit", "exec", "read", "write"]);
    }

    #[tokio::test]
    async fn file_tools_stay_inside_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = ToolRegistry::with_builtins(dir.path());
        let write = registry.get("write").await.expect("write tool");
        write
            .execute(json!({"path": "notes/a.txt", "content": "alpha beta"}))
            .await
            .expect("write");
        let edit = registry.get("edit").await.expect("edit tool");
        edit.execute(json!({"path": "notes/a.txt", "old": "beta", "new": "gamma"}))
            .await
            .expect("edit");
        let read = registry.get("read").await.expect("read tool");
        let content = read
            .execute(json!({"path": "notes/a.txt"}))
            .await
            .expect("read");
        assert_eq!(content, "alpha gamma");

        let escaped = read.execute(json!({"path": "../etc/passwd"})).await;
        assert!(escaped.is_err());
        let absolute = read.execute(json!({"path": "/etc/passwd"})).await;
        assert!(absolute.is_err());
    }

    #[tokio::test]
    async fn register_rejects_invalid_schema() {
        struct Broken;
        #[async_trait]
        impl Tool for Broken {
            fn schema(&self) -> ToolSchema {
                ToolSchema {
                    name: "broken".to_string(),
                    description: String::new(),
                    input_schema: json!({"type": "array"}),
                    requires_auth: false,
                }
            }
            async fn execute(&self, _args: Value) -> anyhow::Result<String> {
                Ok(String::new())
            }
        }
        let registry = ToolRegistry::new();
        assert!(registry.register(Arc::new(Broken)).await.is_err());
        assert!(registry.get("broken").await.is_none());
    }

    #[test]
    fn schema_converts_to_definition() {
        let schema = ToolSchema {
            name: "read".to_string(),
            description: "d".to_string(),
            input_schema: json!({"type": "object"}),
            requires_auth: true,
        };
        let def = ToolDefinition::from(&schema);
        assert_eq!(def.name, "read");
        assert_eq!(def.input_schema, json!({"type": "object"}));
    }
}
