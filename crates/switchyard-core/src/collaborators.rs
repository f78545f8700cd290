//! Contracts the dispatch core consumes, plus in-memory implementations.
//!
//! Every collaborator is fallible from the outside world's point of view; the
//! dispatcher logs their errors and carries on.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use switchyard_types::{
    short_id, HubEvent, Task, TaskResult, ToolCall, ToolResult, TrustLevel, WebhookPayload,
};

use crate::event_bus::EventBus;
use crate::reflection::ReflectionRecord;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryRecord {
    pub task_id: String,
    pub name: String,
    pub source: String,
    pub role: String,
    pub task: Task,
    pub result: TaskResult,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub output_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub action: String,
    pub source: String,
    pub detail: String,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn record_history(&self, record: HistoryRecord) -> anyhow::Result<()>;

    async fn record_session_activity(
        &self,
        task: &Task,
        result: &TaskResult,
        role: &str,
    ) -> anyhow::Result<()>;

    async fn audit(&self, action: &str, source: &str, detail: &str) -> anyhow::Result<()>;

    /// Persists raw task output and returns the name it was stored under.
    async fn save_output(&self, task_id: &str, output: &str) -> anyhow::Result<String>;
}

#[async_trait]
pub trait RoleMemory: Send + Sync {
    async fn get(&self, role: &str, key: &str) -> Option<String>;

    async fn set(&self, role: &str, key: &str, value: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BudgetDecision {
    pub allowed: bool,
    /// Non-empty when the task should run on a cheaper model.
    pub downgrade_model: String,
    pub utilization: f64,
    pub message: String,
}

impl BudgetDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            ..Self::default()
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            message: message.into(),
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait BudgetChecker: Send + Sync {
    async fn check_budget(&self, role: &str, task: &Task) -> BudgetDecision;
}

#[async_trait]
pub trait OfflineQueue: Send + Sync {
    async fn enqueue_task(&self, task: &Task, role: &str, priority: i32) -> anyhow::Result<()>;

    async fn is_queue_full(&self, limit: usize) -> bool;
}

pub trait TrustEngine: Send + Sync {
    /// Resolves the role's level and adjusts the task; returns the level and whether it needs confirmation.
    fn apply_trust_to_task(&self, task: &mut Task, role: &str) -> (TrustLevel, bool);

    /// `Some` carries a substitute result; the tool must not run.
    fn filter_tool_call(&self, role: &str, call: &ToolCall, requires_auth: bool) -> Option<ToolResult>;

    fn record_outcome(&self, role: &str, success: bool);

    /// Promotion notice when the role earned one, at most once per day.
    fn check_trust_promotion(&self, role: &str) -> Option<String>;
}

pub trait StreamBroker: Send + Sync {
    fn publish(&self, key: &str, event: HubEvent);

    fn publish_multi(&self, keys: &[&str], event: HubEvent);

    fn has_subscribers(&self, key: &str) -> bool;
}

impl StreamBroker for EventBus {
    fn publish(&self, key: &str, event: HubEvent) {
        EventBus::publish(self, key, event);
    }

    fn publish_multi(&self, keys: &[&str], event: HubEvent) {
        EventBus::publish_multi(self, keys, event);
    }

    fn has_subscribers(&self, key: &str) -> bool {
        EventBus::has_subscribers(self, key)
    }
}

pub trait WebhookSink: Send + Sync {
    /// Fire-and-forget delivery of one outcome.
    fn send_webhooks(&self, status: &str, payload: WebhookPayload);
}

#[async_trait]
pub trait Reflector: Send + Sync {
    async fn perform_reflection(
        &self,
        task: &Task,
        result: &TaskResult,
    ) -> anyhow::Result<ReflectionRecord>;

    async fn store_reflection(&self, record: ReflectionRecord) -> anyhow::Result<()>;

    /// Most recent first.
    async fn recent_reflections(&self, role: &str, limit: usize) -> Vec<ReflectionRecord>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionActivity {
    pub session_id: String,
    pub task_id: String,
    pub role: String,
    pub status: String,
    pub cost_usd: f64,
}

#[derive(Default)]
struct HistoryInner {
    records: Vec<HistoryRecord>,
    sessions: Vec<SessionActivity>,
    audit: Vec<AuditEntry>,
    memory: HashMap<(String, String), String>,
    outputs: HashMap<String, String>,
}

/// `<first 8 of id>_<YYYYmmdd-HHMMSS>.json`
pub fn output_file_name(task_id: &str, at: DateTime<Utc>) -> String {
    format!("{}_{}.json", short_id(task_id), at.format("%Y%m%d-%H%M%S"))
}

/// Writes `output` into `dir` (created on demand) and returns the file name.
pub async fn write_output_file(dir: &Path, task_id: &str, output: &str) -> anyhow::Result<String> {
    tokio::fs::create_dir_all(dir).await?;
    let name = output_file_name(task_id, Utc::now());
    tokio::fs::write(dir.join(&name), output).await?;
    Ok(name)
}

/// History rows, session activity, audit log and role memory kept in process.
///
/// Task outputs stay in memory too unless an output directory is set.
#[derive(Default)]
pub struct InMemoryHistory {
    inner: Mutex<HistoryInner>,
    output_dir: Option<PathBuf>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Output kept in memory under the given name.
    pub fn output(&self, name: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .outputs
            .get(name)
            .cloned()
    }

    pub fn records(&self) -> Vec<HistoryRecord> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).records.clone()
    }

    pub fn sessions(&self) -> Vec<SessionActivity> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).sessions.clone()
    }

    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).audit.clone()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistory {
    async fn record_history(&self, record: HistoryRecord) -> anyhow::Result<()> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .records
            .push(record);
        Ok(())
    }

    async fn record_session_activity(
        &self,
        task: &Task,
        result: &TaskResult,
        role: &str,
    ) -> anyhow::Result<()> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .sessions
            .push(SessionActivity {
                session_id: result.session_id.clone(),
                task_id: task.id.clone(),
                role: role.to_string(),
                status: result.status.to_string(),
                cost_usd: result.cost_usd,
            });
        Ok(())
    }

    async fn audit(&self, action: &str, source: &str, detail: &str) -> anyhow::Result<()> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .audit
            .push(AuditEntry {
                action: action.to_string(),
                source: source.to_string(),
                detail: detail.to_string(),
                at: Utc::now(),
            });
        Ok(())
    }

    async fn save_output(&self, task_id: &str, output: &str) -> anyhow::Result<String> {
        if let Some(dir) = &self.output_dir {
            return write_output_file(dir, task_id, output).await;
        }
        let name = output_file_name(task_id, Utc::now());
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .outputs
            .insert(name.clone(), output.to_string());
        Ok(name)
    }
}

#[async_trait]
impl RoleMemory for InMemoryHistory {
    async fn get(&self, role: &str, key: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .memory
            .get(&(role.to_string(), key.to_string()))
            .cloned()
    }

    async fn set(&self, role: &str, key: &str, value: &str) -> anyhow::Result<()> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .memory
            .insert((role.to_string(), key.to_string()), value.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedTask {
    pub task: Task,
    pub role: String,
    pub priority: i32,
    pub queued_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct InMemoryOfflineQueue {
    items: Mutex<VecDeque<QueuedTask>>,
}

impl InMemoryOfflineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn drain(&self) -> Vec<QueuedTask> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect()
    }
}

#[async_trait]
impl OfflineQueue for InMemoryOfflineQueue {
    async fn enqueue_task(&self, task: &Task, role: &str, priority: i32) -> anyhow::Result<()> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(QueuedTask {
                task: task.clone(),
                role: role.to_string(),
                priority,
                queued_at: Utc::now(),
            });
        Ok(())
    }

    async fn is_queue_full(&self, limit: usize) -> bool {
        self.len() >= limit
    }
}

/// Returns the same decision for every check.
pub struct StaticBudget {
    decision: BudgetDecision,
}

impl StaticBudget {
    pub fn new(decision: BudgetDecision) -> Self {
        Self { decision }
    }
}

impl Default for StaticBudget {
    fn default() -> Self {
        Self::new(BudgetDecision::allow())
    }
}

#[async_trait]
impl BudgetChecker for StaticBudget {
    async fn check_budget(&self, _role: &str, _task: &Task) -> BudgetDecision {
        self.decision.clone()
    }
}

pub struct NoopWebhooks;

impl WebhookSink for NoopWebhooks {
    fn send_webhooks(&self, _status: &str, _payload: WebhookPayload) {}
}

pub struct NoopReflector;

#[async_trait]
impl Reflector for NoopReflector {
    async fn perform_reflection(
        &self,
        _task: &Task,
        _result: &TaskResult,
    ) -> anyhow::Result<ReflectionRecord> {
        anyhow::bail!("reflection is not configured")
    }

    async fn store_reflection(&self, _record: ReflectionRecord) -> anyhow::Result<()> {
        Ok(())
    }

    async fn recent_reflections(&self, _role: &str, _limit: usize) -> Vec<ReflectionRecord> {
        Vec::new()
    }
}
