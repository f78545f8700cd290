use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};

use switchyard_types::{HubEvent, Message, ProviderInfo, StopReason, ToolCall, ToolDefinition};

mod claude;
mod echo;
mod openai;
mod sse;

pub use claude::ClaudeApiProvider;
pub use echo::EchoProvider;
pub use openai::OpenAICompatibleProvider;

/// Name used when neither task, role nor configuration picks a provider.
pub const FALLBACK_PROVIDER: &str = "claude";

pub const DEFAULT_CLAUDE_MODEL: &str = "claude-sonnet-4-5-20250929";
pub const DEFAULT_CLAUDE_MAX_TOKENS: u32 = 8192;
pub const DEFAULT_CLAUDE_BASE_URL: &str = "https://api.anthropic.com/v1";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ProviderConfig {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(default)]
    pub max_tokens: u32,
}

/// Normalized request handed to every backend.
#[derive(Debug, Clone, Default)]
pub struct ProviderRequest {
    pub prompt: String,
    pub system_prompt: String,
    pub model: String,
    pub workdir: String,
    pub timeout: Duration,
    pub budget: f64,
    pub permission_mode: String,
    pub add_dirs: Vec<String>,
    pub session_id: String,
    pub docker: Option<bool>,
    pub tools: Vec<ToolDefinition>,
    /// Prior tool-loop turns, appended after the prompt.
    pub messages: Vec<Message>,
    /// When set, streaming backends forward `output_chunk` events here.
    pub events: Option<mpsc::Sender<HubEvent>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderResult {
    pub output: String,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub session_id: String,
    pub is_error: bool,
    pub error: String,
    /// Name of the provider that actually served the request.
    pub provider: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub provider_ms: u64,
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: StopReason,
}

impl ProviderResult {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            is_error: true,
            error: error.into(),
            ..Self::default()
        }
    }

    pub fn wants_tools(&self) -> bool {
        self.stop_reason == StopReason::ToolUse && !self.tool_calls.is_empty()
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> &'static str;

    async fn execute(&self, req: ProviderRequest) -> anyhow::Result<ProviderResult>;

    /// Capability probe for multi-turn tool execution.
    fn as_tool_capable(&self) -> Option<&dyn ToolCapableProvider> {
        None
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.name().to_string(),
            kind: self.kind().to_string(),
            model: String::new(),
            tools: self.as_tool_capable().is_some(),
        }
    }
}

#[async_trait]
pub trait ToolCapableProvider: Provider {
    async fn execute_with_tools(&self, req: ProviderRequest) -> anyhow::Result<ProviderResult>;
}

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Arc<RwLock<HashMap<String, Arc<dyn Provider>>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(configs: &HashMap<String, ProviderConfig>) -> Self {
        Self {
            providers: Arc::new(RwLock::new(build_providers(configs))),
        }
    }

    pub async fn reload(&self, configs: &HashMap<String, ProviderConfig>) {
        let rebuilt = build_providers(configs);
        *self.providers.write().await = rebuilt;
    }

    pub async fn register(&self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.write().await.insert(name.into(), provider);
    }

    pub async fn get(&self, name: &str) -> anyhow::Result<Arc<dyn Provider>> {
        let providers = self.providers.read().await;
        if let Some(provider) = providers.get(name) {
            return Ok(provider.clone());
        }
        let mut available = providers.keys().cloned().collect::<Vec<_>>();
        available.sort();
        anyhow::bail!(
            "provider `{}` is not configured. configured providers: {}",
            name,
            available.join(", ")
        );
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.providers.read().await.contains_key(name)
    }

    pub async fn list(&self) -> Vec<ProviderInfo> {
        let mut infos = self
            .providers
            .read()
            .await
            .iter()
            .map(|(name, provider)| ProviderInfo {
                name: name.clone(),
                ..provider.info()
            })
            .collect::<Vec<_>>();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}

fn build_providers(configs: &HashMap<String, ProviderConfig>) -> HashMap<String, Arc<dyn Provider>> {
    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();

    for (name, cfg) in configs {
        let provider: Arc<dyn Provider> = match cfg.kind.as_str() {
            "openai-compatible" => Arc::new(OpenAICompatibleProvider::new(
                name,
                &cfg.base_url,
                non_placeholder(&cfg.api_key),
                &cfg.model,
            )),
            "claude-api" => Arc::new(ClaudeApiProvider::from_config(name, cfg)),
            "echo" => Arc::new(EchoProvider::new(name)),
            other => {
                tracing::warn!(provider = %name, kind = %other, "skipping provider with unknown type");
                continue;
            }
        };
        providers.insert(name.clone(), provider);
    }

    if !providers.contains_key(FALLBACK_PROVIDER) {
        providers.insert(
            FALLBACK_PROVIDER.to_string(),
            Arc::new(ClaudeApiProvider::from_config(
                FALLBACK_PROVIDER,
                &ProviderConfig {
                    kind: "claude-api".to_string(),
                    ..ProviderConfig::default()
                },
            )),
        );
    }

    providers
}

fn non_placeholder(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
    {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_key(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}
