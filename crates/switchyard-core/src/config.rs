use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use switchyard_providers::ProviderConfig;
use switchyard_tools::{RoleToolPolicy, ToolProfile};
use switchyard_types::TrustLevel;

use crate::duration::parse_duration;
use crate::error::{HubError, HubResult};

pub const DEFAULT_MAX_PROMPT_LEN: usize = 102_400;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub max_concurrent: usize,
    pub route_concurrency: usize,
    pub default_model: String,
    pub default_timeout: String,
    pub default_budget: f64,
    pub default_permission_mode: String,
    pub default_workdir: String,
    pub workspace_dir: String,
    pub agents_dir: String,
    pub knowledge_dir: String,
    pub allowed_dirs: Vec<String>,
    /// 0 means the built-in limit.
    pub max_prompt_len: usize,
    pub default_provider: String,
    pub fallback_providers: Vec<String>,
    pub providers: HashMap<String, ProviderConfig>,
    pub roles: HashMap<String, RoleConfig>,
    pub smart_dispatch: SmartDispatchConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub offline_queue: OfflineQueueConfig,
    pub trust: TrustConfig,
    pub tools: ToolsConfig,
    pub reflection: ReflectionConfig,
    pub webhooks: Vec<WebhookConfig>,
    pub logging: LoggingConfig,
    /// Directory relative paths in the config resolve against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            route_concurrency: 5,
            default_model: "sonnet".to_string(),
            default_timeout: "15m".to_string(),
            default_budget: 0.0,
            default_permission_mode: "acceptEdits".to_string(),
            default_workdir: String::new(),
            workspace_dir: String::new(),
            agents_dir: String::new(),
            knowledge_dir: String::new(),
            allowed_dirs: Vec::new(),
            max_prompt_len: 0,
            default_provider: String::new(),
            fallback_providers: Vec::new(),
            providers: HashMap::new(),
            roles: HashMap::new(),
            smart_dispatch: SmartDispatchConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            offline_queue: OfflineQueueConfig::default(),
            trust: TrustConfig::default(),
            tools: ToolsConfig::default(),
            reflection: ReflectionConfig::default(),
            webhooks: Vec::new(),
            logging: LoggingConfig::default(),
            base_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoleConfig {
    /// Legacy prompt file, relative to the config base dir.
    pub soul_file: String,
    pub model: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub permission_mode: String,
    pub allowed_dirs: Vec<String>,
    pub provider: String,
    pub docker: Option<bool>,
    pub fallback_providers: Vec<String>,
    pub trust_level: String,
    pub tools: RoleToolPolicy,
    pub workspace: RoleWorkspace,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoleWorkspace {
    pub dir: String,
    pub soul_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SmartDispatchConfig {
    pub enabled: bool,
    pub coordinator: String,
    pub default_role: String,
    pub classify_budget: f64,
    pub classify_timeout: String,
    pub review: bool,
    pub review_budget: f64,
    pub review_cost_threshold: f64,
    pub classify_model: String,
    pub escalation_model: String,
    /// `smart` (LLM classification) or `coordinator`.
    pub fallback: String,
    pub rules: Vec<RoutingRule>,
    pub bindings: Vec<RoutingBinding>,
}

impl Default for SmartDispatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            coordinator: String::new(),
            default_role: String::new(),
            classify_budget: 0.1,
            classify_timeout: "30s".to_string(),
            review: false,
            review_budget: 0.2,
            review_cost_threshold: 0.10,
            classify_model: "sonnet".to_string(),
            escalation_model: "opus".to_string(),
            fallback: "smart".to_string(),
            rules: Vec::new(),
            bindings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoutingRule {
    pub role: String,
    pub keywords: Vec<String>,
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoutingBinding {
    pub channel: String,
    pub user_id: String,
    pub channel_id: String,
    pub guild_id: String,
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub fail_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout: String,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fail_threshold: 5,
            success_threshold: 2,
            open_timeout: "30s".to_string(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn open_timeout(&self) -> Duration {
        parse_duration(&self.open_timeout).unwrap_or(Duration::from_secs(30))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OfflineQueueConfig {
    pub enabled: bool,
    pub max_items: usize,
}

impl Default for OfflineQueueConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_items: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrustConfig {
    pub enabled: bool,
    pub promote_threshold: u32,
    pub auto_promote: bool,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            promote_threshold: 10,
            auto_promote: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolsConfig {
    pub max_iterations: usize,
    pub default_profile: String,
    pub profiles: HashMap<String, ToolProfile>,
    /// Tool name to trust level.
    pub trust_override: HashMap<String, String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            default_profile: "standard".to_string(),
            profiles: HashMap::new(),
            trust_override: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReflectionConfig {
    pub enabled: bool,
    pub trigger_on_fail: bool,
    pub min_cost: f64,
    pub budget: f64,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            trigger_on_fail: false,
            min_cost: 0.03,
            budget: 0.05,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebhookConfig {
    pub url: String,
    pub headers: HashMap<String, String>,
    /// Empty or `all` matches every status.
    pub events: Vec<String>,
}

impl WebhookConfig {
    pub fn matches(&self, status: &str) -> bool {
        self.events.is_empty() || self.events.iter().any(|e| e == "all" || e == status)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: String,
    pub retention_days: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: String::new(),
            retention_days: 14,
        }
    }
}

impl HubConfig {
    pub fn max_prompt_len(&self) -> usize {
        if self.max_prompt_len == 0 {
            DEFAULT_MAX_PROMPT_LEN
        } else {
            self.max_prompt_len
        }
    }

    pub fn role(&self, name: &str) -> Option<&RoleConfig> {
        if name.is_empty() {
            return None;
        }
        self.roles.get(name)
    }

    pub fn logs_dir(&self) -> PathBuf {
        if self.logging.dir.is_empty() {
            switchyard_observability::canonical_logs_dir_from_root(&self.base_dir)
        } else {
            PathBuf::from(&self.logging.dir)
        }
    }

    /// Expands `~/` and anchors relative directories at `base_dir`.
    pub fn resolve_paths(&mut self, base_dir: &Path) {
        self.base_dir = base_dir.to_path_buf();
        for dir in [
            &mut self.default_workdir,
            &mut self.workspace_dir,
            &mut self.agents_dir,
            &mut self.knowledge_dir,
            &mut self.logging.dir,
        ] {
            *dir = resolve_dir(dir, base_dir);
        }
        for dir in self.allowed_dirs.iter_mut() {
            *dir = resolve_dir(dir, base_dir);
        }
        for role in self.roles.values_mut() {
            for dir in role.allowed_dirs.iter_mut() {
                *dir = resolve_dir(dir, base_dir);
            }
            role.workspace.dir = resolve_dir(&role.workspace.dir, base_dir);
        }
    }

    /// Hard errors reject the config; softer problems are logged.
    pub fn validate(&self) -> HubResult<()> {
        if self.max_concurrent == 0 {
            return Err(HubError::InvalidConfig(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if parse_duration(&self.default_timeout).is_none() {
            tracing::warn!(
                default_timeout = %self.default_timeout,
                "default_timeout is not a valid duration, tasks fall back to 15m"
            );
        }
        if self.max_concurrent > 20 {
            tracing::warn!(max_concurrent = self.max_concurrent, "max_concurrent is very high");
        }
        for (name, role) in &self.roles {
            if !role.trust_level.is_empty() && TrustLevel::parse(&role.trust_level).is_none() {
                return Err(HubError::InvalidConfig(format!(
                    "role {name:?} has invalid trust_level {:?}",
                    role.trust_level
                )));
            }
        }
        for (tool, level) in &self.tools.trust_override {
            if TrustLevel::parse(level).is_none() {
                return Err(HubError::InvalidConfig(format!(
                    "tool {tool:?} has invalid trust override {level:?}"
                )));
            }
        }
        let sd = &self.smart_dispatch;
        if sd.enabled {
            if sd.default_role.is_empty() || !self.roles.contains_key(&sd.default_role) {
                return Err(HubError::InvalidConfig(format!(
                    "smart_dispatch.default_role {:?} is not a configured role",
                    sd.default_role
                )));
            }
            if sd.fallback != "smart" && sd.fallback != "coordinator" && !sd.fallback.is_empty() {
                return Err(HubError::InvalidConfig(format!(
                    "smart_dispatch.fallback must be \"smart\" or \"coordinator\", got {:?}",
                    sd.fallback
                )));
            }
            for rule in &sd.rules {
                for pattern in &rule.patterns {
                    if regex::Regex::new(&format!("(?i){pattern}")).is_err() {
                        tracing::warn!(role = %rule.role, pattern = %pattern, "invalid routing pattern");
                    }
                }
            }
        }
        Ok(())
    }
}

pub fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().to_string();
        }
    }
    path.to_string()
}

fn resolve_dir(dir: &str, base_dir: &Path) -> String {
    if dir.is_empty() {
        return String::new();
    }
    let expanded = expand_home(dir);
    let path = Path::new(&expanded);
    if path.is_absolute() {
        expanded
    } else {
        base_dir.join(path).to_string_lossy().to_string()
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    runtime: Value,
    cli: Value,
}

/// Layered configuration: global file, project file, environment, runtime patches, CLI.
#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    global_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let project_path = path.as_ref().to_path_buf();
        let global_path = resolve_global_config_path();

        let global = read_config_file(&global_path)
            .await
            .unwrap_or_else(|err| {
                tracing::warn!(path = %global_path.display(), error = %err, "ignoring unreadable global config");
                empty_object()
            });
        let project = read_config_file(&project_path).await?;

        let layers = ConfigLayers {
            global,
            project,
            env: env_layer(),
            runtime: empty_object(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };

        Ok(Self {
            project_path,
            global_path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub async fn get(&self) -> HubConfig {
        let merged = self.get_effective_value().await;
        let mut cfg = serde_json::from_value::<HubConfig>(merged).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "effective config did not parse, using defaults");
            HubConfig::default()
        });
        let base = self
            .project_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        cfg.resolve_paths(&base);
        crate::workspace::apply_soul_metadata(&mut cfg).await;
        cfg
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.runtime);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        json!({
            "global": layers.global,
            "project": layers.project,
            "env": layers.env,
            "runtime": layers.runtime,
            "cli": layers.cli
        })
    }

    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
        }
        let snapshot = self.layers.read().await.project.clone();
        write_config_file(&self.project_path, &snapshot).await?;
        Ok(self.get_effective_value().await)
    }

    pub async fn patch_runtime(&self, patch: Value) -> Value {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.runtime, &patch);
        }
        self.get_effective_value().await
    }

    pub fn global_path(&self) -> &Path {
        &self.global_path
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

async fn read_config_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    if raw.trim().is_empty() {
        return Ok(empty_object());
    }
    let value = if is_yaml(path) {
        serde_yaml::from_str::<Value>(&raw)?
    } else {
        serde_json::from_str::<Value>(&raw)?
    };
    Ok(if value.is_object() { value } else { empty_object() })
}

async fn write_config_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    let mut to_write = value.clone();
    strip_persisted_secrets(&mut to_write);
    let raw = if is_yaml(path) {
        serde_yaml::to_string(&to_write)?
    } else {
        serde_json::to_string_pretty(&to_write)?
    };
    fs::write(path, raw).await?;
    Ok(())
}

/// Keys supplied through the environment are never written back to disk.
fn strip_persisted_secrets(value: &mut Value) {
    let Some(providers) = value
        .get_mut("providers")
        .and_then(|v| v.as_object_mut())
    else {
        return;
    };
    for provider_cfg in providers.values_mut() {
        let Value::Object(cfg) = provider_cfg else {
            continue;
        };
        let env_var = match cfg.get("type").and_then(|v| v.as_str()) {
            Some("claude-api") => "ANTHROPIC_API_KEY",
            Some("openai-compatible") => "OPENAI_API_KEY",
            _ => continue,
        };
        let runtime = std::env::var(env_var).ok().filter(|v| !v.trim().is_empty());
        if runtime.is_some() && cfg.get("api_key").and_then(|v| v.as_str()) == runtime.as_deref() {
            cfg.remove("api_key");
        }
    }
}

fn resolve_global_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("SWITCHYARD_GLOBAL_CONFIG") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("switchyard").join("config.json");
    }
    PathBuf::from(".switchyard/global_config.json")
}

fn env_layer() -> Value {
    let mut root = empty_object();

    if let Some(n) = std::env::var("SWITCHYARD_MAX_CONCURRENT")
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|n| *n > 0)
    {
        deep_merge(&mut root, &json!({ "max_concurrent": n }));
    }
    if let Some(provider) = non_empty_env("SWITCHYARD_DEFAULT_PROVIDER") {
        deep_merge(&mut root, &json!({ "default_provider": provider }));
    }
    if let Some(model) = non_empty_env("SWITCHYARD_DEFAULT_MODEL") {
        deep_merge(&mut root, &json!({ "default_model": model }));
    }
    if let Some(enabled) = std::env::var("SWITCHYARD_SMART_DISPATCH")
        .ok()
        .and_then(|v| parse_bool_like(&v))
    {
        deep_merge(&mut root, &json!({ "smart_dispatch": { "enabled": enabled } }));
    }
    if let Some(api_key) = non_empty_env("ANTHROPIC_API_KEY") {
        deep_merge(
            &mut root,
            &json!({
                "providers": {
                    "claude-api": {
                        "type": "claude-api",
                        "api_key": api_key
                    }
                }
            }),
        );
    }
    if let Some(api_key) = non_empty_env("OPENAI_API_KEY") {
        deep_merge(
            &mut root,
            &json!({
                "providers": {
                    "openai": {
                        "type": "openai-compatible",
                        "api_key": api_key,
                        "base_url": "https://api.openai.com/v1",
                        "model": "gpt-4o-mini"
                    }
                }
            }),
        );
    }

    root
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
