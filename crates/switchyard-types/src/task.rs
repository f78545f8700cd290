use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unit of work handed to the dispatcher.
///
/// Empty strings mean "unset"; the dispatcher fills them from configuration
/// exactly once before execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Task {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub workdir: String,
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider: String,
    /// Sandbox override; `None` defers to the role setting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker: Option<bool>,
    #[serde(default)]
    pub timeout: String,
    #[serde(default)]
    pub budget: f64,
    #[serde(default)]
    pub permission_mode: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add_dirs: Vec<String>,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    /// Provenance tag such as `cron`, `chat` or `route:telegram`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trace_id: String,
}

impl Task {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// First eight characters of the id, used in log fields and default names.
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    Error,
    Timeout,
    Cancelled,
    Queued,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Success => "success",
            TaskStatus::Error => "error",
            TaskStatus::Timeout => "timeout",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Queued => "queued",
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, TaskStatus::Success)
    }

    /// `error` and `timeout`: the outcomes that count as a failed attempt.
    pub fn is_failure(self) -> bool {
        matches!(self, TaskStatus::Error | TaskStatus::Timeout)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Observe,
    Suggest,
    Auto,
}

impl TrustLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            TrustLevel::Observe => "observe",
            TrustLevel::Suggest => "suggest",
            TrustLevel::Auto => "auto",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "observe" => Some(TrustLevel::Observe),
            "suggest" => Some(TrustLevel::Suggest),
            "auto" => Some(TrustLevel::Auto),
            _ => None,
        }
    }

    pub fn next(self) -> Option<Self> {
        match self {
            TrustLevel::Observe => Some(TrustLevel::Suggest),
            TrustLevel::Suggest => Some(TrustLevel::Auto),
            TrustLevel::Auto => None,
        }
    }
}

impl std::fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub id: String,
    pub name: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub duration_ms: u64,
    pub cost_usd: f64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output_file: String,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub provider_ms: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_level: Option<TrustLevel>,
}

impl TaskResult {
    pub fn new(task: &Task, status: TaskStatus) -> Self {
        Self {
            id: task.id.clone(),
            name: task.name.clone(),
            status,
            output: String::new(),
            error: String::new(),
            duration_ms: 0,
            cost_usd: 0.0,
            model: task.model.clone(),
            session_id: task.session_id.clone(),
            output_file: String::new(),
            tokens_in: 0,
            tokens_out: 0,
            provider_ms: 0,
            trace_id: task.trace_id.clone(),
            provider: String::new(),
            trust_level: None,
        }
    }

    /// Terminal `error` result for a task rejected before any provider was contacted.
    pub fn rejected(task: &Task, error: impl Into<String>) -> Self {
        let mut result = Self::new(task, TaskStatus::Error);
        result.error = error.into();
        result
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResult {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub total_cost_usd: f64,
    /// Completion order, not submission order.
    pub tasks: Vec<TaskResult>,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedTaskInfo {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookPayload {
    pub event: String,
    pub job_id: String,
    pub name: String,
    pub source: String,
    pub status: String,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub timestamp: DateTime<Utc>,
}
