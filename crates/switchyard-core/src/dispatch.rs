//! Dispatch orchestrator.
//!
//! One worker per dispatched task, gated by the task semaphore. Routing and
//! classification calls use their own semaphore so a backlog of long tasks
//! never delays a routing decision. All shared state sits behind a single
//! mutex that is never held across an await.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Component, Path, PathBuf, MAIN_SEPARATOR};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use switchyard_observability::{emit_event, ObservabilityEvent, ProcessKind};
use switchyard_providers::{ProviderRegistry, ProviderResult};
use switchyard_tools::ToolRegistry;
use switchyard_types::{
    new_id, short_id, DispatchResult, FailedTaskInfo, HubEvent, Task, TaskResult, TaskStatus,
    TrustLevel, WebhookPayload, EVENT_COMPLETED, EVENT_ERROR, EVENT_STARTED, EVENT_TASK_QUEUED,
    EVENT_TRUST_PROMOTION, TRUST_KEY,
};

use crate::circuit::CircuitRegistry;
use crate::collaborators::{
    BudgetChecker, HistoryRecord, HistoryStore, InMemoryHistory, InMemoryOfflineQueue, NoopWebhooks,
    OfflineQueue, Reflector, RoleMemory, StaticBudget, StreamBroker, TrustEngine, WebhookSink,
};
use crate::config::{expand_home, HubConfig};
use crate::duration::{format_duration, parse_duration_or, round_to_seconds};
use crate::error::{HubError, HubResult};
use crate::event_bus::EventBus;
use crate::failover::{execute_with_provider, resolve_provider_name, ALL_PROVIDERS_UNAVAILABLE};
use crate::reflection::{build_reflection_context, reflect_and_store, should_reflect, LlmReflector};
use crate::text::truncate;
use crate::tool_loop::ToolLoop;
use crate::trust::ConfigTrustEngine;
use crate::webhook::HttpWebhookSink;
use crate::workspace::{knowledge_dir_has_files, load_soul_file, resolve_workspace};

/// Failed tasks stay available for retry/reroute this long.
pub const FAILED_TASK_TTL: Duration = Duration::from_secs(30 * 60);

const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const EVENT_BUFFER: usize = 128;
const REFLECTION_CONTEXT_LIMIT: usize = 3;

fn ansi_escape_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]").expect("valid ansi escape regex"))
}

/// Strips NUL bytes and ANSI escapes, then truncates to `max_len` bytes.
pub fn sanitize_prompt(input: &str, max_len: usize) -> String {
    let without_nul = input.replace('\0', "");
    let mut out = ansi_escape_re().replace_all(&without_nul, "").into_owned();
    if out.len() > max_len {
        out = crate::text::clip(&out, max_len).to_string();
        tracing::warn!(from = input.len(), to = max_len, "prompt truncated");
    } else if out.len() != input.len() {
        tracing::warn!("prompt sanitized, removed control characters");
    }
    out
}

/// Populates zero-valued fields from configuration; set fields are left alone.
pub fn fill_defaults(cfg: &HubConfig, task: &mut Task) {
    if task.id.is_empty() {
        task.id = new_id();
    }
    if task.session_id.is_empty() {
        task.session_id = new_id();
    }
    if task.model.is_empty() {
        task.model = cfg.default_model.clone();
    }
    if task.timeout.is_empty() {
        task.timeout = cfg.default_timeout.clone();
    }
    if task.budget == 0.0 {
        task.budget = cfg.default_budget;
    }
    if task.permission_mode.is_empty() {
        task.permission_mode = cfg.default_permission_mode.clone();
    }
    if task.workdir.is_empty() {
        task.workdir = cfg.default_workdir.clone();
    }
    task.workdir = expand_home(&task.workdir);
    if task.name.is_empty() {
        task.name = format!("task-{}", short_id(&task.id));
    }
    if !task.prompt.is_empty() {
        task.prompt = sanitize_prompt(&task.prompt, cfg.max_prompt_len());
    }
}

/// Folds `.` and `..` without touching the filesystem; `..` never climbs above the root.
fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(Component::ParentDir),
            },
            other => out.push(other),
        }
    }
    out
}

fn absolute(path: &str) -> PathBuf {
    let path = PathBuf::from(expand_home(path));
    let path = if path.is_absolute() {
        path
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&path))
            .unwrap_or(path)
    };
    clean_path(&path)
}

fn with_separator(path: &Path) -> String {
    let mut s = path.to_string_lossy().trim_end_matches(MAIN_SEPARATOR).to_string();
    s.push(MAIN_SEPARATOR);
    s
}

/// Checks workdir and extra dirs against the role allow-list, else the global one.
/// An empty allow-list means no restriction.
pub fn validate_dirs(cfg: &HubConfig, task: &Task, role: &str) -> HubResult<()> {
    let allowed = cfg
        .role(role)
        .map(|rc| rc.allowed_dirs.as_slice())
        .filter(|dirs| !dirs.is_empty())
        .unwrap_or(cfg.allowed_dirs.as_slice());
    if allowed.is_empty() {
        return Ok(());
    }
    let allowed: Vec<String> = allowed.iter().map(|d| with_separator(&absolute(d))).collect();

    let check = |dir: &str, label: &str| -> HubResult<()> {
        if dir.is_empty() {
            return Ok(());
        }
        let candidate = with_separator(&absolute(dir));
        if allowed.iter().any(|a| candidate.starts_with(a.as_str())) {
            Ok(())
        } else {
            Err(HubError::DirectoryNotAllowed(format!(
                "{label} {dir:?} is not within allowedDirs"
            )))
        }
    };

    check(&task.workdir, "workdir")?;
    for dir in &task.add_dirs {
        check(dir, "addDir")?;
    }
    Ok(())
}

pub fn build_summary(result: &DispatchResult) -> String {
    let ok = result.tasks.iter().filter(|t| t.status.is_success()).count();
    let duration = round_to_seconds(Duration::from_millis(result.duration_ms));
    format!(
        "{ok}/{} tasks succeeded (${:.2}, {})",
        result.tasks.len(),
        result.total_cost_usd,
        format_duration(duration)
    )
}

pub(crate) fn webhook_payload(task: &Task, result: &TaskResult) -> WebhookPayload {
    WebhookPayload {
        event: result.status.to_string(),
        job_id: task.id.clone(),
        name: task.name.clone(),
        source: task.source.clone(),
        status: result.status.to_string(),
        cost_usd: result.cost_usd,
        duration_ms: result.duration_ms,
        model: result.model.clone(),
        output: truncate(&result.output, 500),
        error: truncate(&result.error, 300),
        timestamp: Utc::now(),
    }
}

struct RunningTask {
    task: Task,
    started: Instant,
    cancel: CancellationToken,
}

struct FailedTask {
    task: Task,
    failed_at: DateTime<Utc>,
    error: String,
}

#[derive(Default)]
struct DispatchState {
    active: bool,
    started: Option<Instant>,
    batch: Option<CancellationToken>,
    running: HashMap<String, RunningTask>,
    finished: Vec<TaskResult>,
    failed: HashMap<String, FailedTask>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TaskStatusEntry {
    pub id: String,
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub elapsed: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub duration: String,
    pub cost_usd: f64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub timeout: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub prompt: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub source: String,
}

/// Point-in-time view of the current batch.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DispatchStatus {
    /// `idle`, `dispatching` or `done`.
    pub status: String,
    pub running: usize,
    pub completed: usize,
    pub tasks: Vec<TaskStatusEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<String>,
}

enum Outcome {
    Finished(ProviderResult),
    TimedOut,
    Cancelled,
}

async fn run_bounded<F>(fut: F, timeout: Duration, cancel: &CancellationToken) -> Outcome
where
    F: Future<Output = ProviderResult>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Outcome::Cancelled,
        res = tokio::time::timeout(timeout, fut) => match res {
            Ok(pr) => Outcome::Finished(pr),
            Err(_) => Outcome::TimedOut,
        },
    }
}

fn result_from_provider(task: &Task, pr: &ProviderResult, elapsed: Duration) -> TaskResult {
    let mut result = TaskResult::new(task, TaskStatus::Success);
    result.output = pr.output.clone();
    result.cost_usd = pr.cost_usd;
    result.duration_ms = elapsed.as_millis() as u64;
    result.tokens_in = pr.tokens_in;
    result.tokens_out = pr.tokens_out;
    result.provider_ms = pr.provider_ms;
    result.provider = pr.provider.clone();
    if !pr.session_id.is_empty() {
        result.session_id = pr.session_id.clone();
    }
    result
}

/// Owns the policy collaborators and the shared state for every task this hub runs.
#[derive(Clone)]
pub struct Dispatcher {
    pub(crate) cfg: Arc<HubConfig>,
    pub(crate) providers: ProviderRegistry,
    pub(crate) circuits: CircuitRegistry,
    pub(crate) tools: Option<ToolRegistry>,
    pub(crate) broker: Arc<dyn StreamBroker>,
    pub(crate) history: Arc<dyn HistoryStore>,
    pub(crate) memory: Arc<dyn RoleMemory>,
    pub(crate) budget: Arc<dyn BudgetChecker>,
    pub(crate) queue: Arc<dyn OfflineQueue>,
    pub(crate) trust: Arc<dyn TrustEngine>,
    pub(crate) webhooks: Arc<dyn WebhookSink>,
    pub(crate) reflector: Arc<dyn Reflector>,
    pub(crate) task_sem: Arc<Semaphore>,
    pub(crate) route_sem: Arc<Semaphore>,
    root: CancellationToken,
    state: Arc<Mutex<DispatchState>>,
}

impl Dispatcher {
    /// Dispatcher with in-memory collaborators; swap them with the `with_*` builders.
    pub fn new(cfg: HubConfig, providers: ProviderRegistry) -> Self {
        let cfg = Arc::new(cfg);
        let circuits = CircuitRegistry::new(cfg.circuit_breaker.clone());
        let history = Arc::new(InMemoryHistory::new());
        let webhooks: Arc<dyn WebhookSink> = if cfg.webhooks.is_empty() {
            Arc::new(NoopWebhooks)
        } else {
            Arc::new(HttpWebhookSink::new(cfg.webhooks.clone()))
        };
        let reflector = Arc::new(LlmReflector::new(
            cfg.clone(),
            providers.clone(),
            circuits.clone(),
        ));
        Self {
            task_sem: Arc::new(Semaphore::new(cfg.max_concurrent.max(1))),
            route_sem: Arc::new(Semaphore::new(cfg.route_concurrency.max(1))),
            trust: Arc::new(ConfigTrustEngine::new(&cfg)),
            cfg,
            providers,
            circuits,
            tools: None,
            broker: Arc::new(EventBus::new()),
            history: history.clone(),
            memory: history,
            budget: Arc::new(StaticBudget::default()),
            queue: Arc::new(InMemoryOfflineQueue::new()),
            webhooks,
            reflector,
            root: CancellationToken::new(),
            state: Arc::new(Mutex::new(DispatchState::default())),
        }
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_circuits(mut self, circuits: CircuitRegistry) -> Self {
        self.circuits = circuits;
        self
    }

    pub fn with_broker(mut self, broker: Arc<dyn StreamBroker>) -> Self {
        self.broker = broker;
        self
    }

    pub fn with_history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = history;
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn RoleMemory>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_budget(mut self, budget: Arc<dyn BudgetChecker>) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_offline_queue(mut self, queue: Arc<dyn OfflineQueue>) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_trust(mut self, trust: Arc<dyn TrustEngine>) -> Self {
        self.trust = trust;
        self
    }

    pub fn with_webhooks(mut self, webhooks: Arc<dyn WebhookSink>) -> Self {
        self.webhooks = webhooks;
        self
    }

    pub fn with_reflector(mut self, reflector: Arc<dyn Reflector>) -> Self {
        self.reflector = reflector;
        self
    }

    pub fn config(&self) -> &HubConfig {
        &self.cfg
    }

    pub fn circuits(&self) -> &CircuitRegistry {
        &self.circuits
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn fill_defaults(&self, task: &mut Task) {
        fill_defaults(&self.cfg, task);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs a batch, one worker per task, at most `max_concurrent` at a time.
    ///
    /// Results are in completion order. Only one batch runs at a time; tasks
    /// started through `run_task` keep their running entries across batches.
    pub async fn dispatch(&self, tasks: Vec<Task>) -> HubResult<DispatchResult> {
        let batch = self.root.child_token();
        let started_at = Utc::now();
        let started = Instant::now();
        {
            let mut state = self.lock();
            if state.active {
                return Err(HubError::DispatchInProgress);
            }
            state.active = true;
            state.started = Some(started);
            state.batch = Some(batch.clone());
            state.finished.clear();
        }

        let mut workers = JoinSet::new();
        for mut task in tasks {
            self.fill_defaults(&mut task);
            let this = self.clone();
            let batch = batch.clone();
            workers.spawn(async move {
                let Ok(_permit) = this.task_sem.clone().acquire_owned().await else {
                    return TaskResult::rejected(&task, "dispatcher is shutting down");
                };
                this.run_task_in(task, &batch).await
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => tracing::error!(error = %err, "dispatch worker failed"),
            }
        }

        batch.cancel();
        {
            let mut state = self.lock();
            state.active = false;
            state.batch = None;
        }

        let finished_at = Utc::now();
        let mut out = DispatchResult {
            started_at,
            finished_at,
            duration_ms: started.elapsed().as_millis() as u64,
            total_cost_usd: results.iter().map(|r| r.cost_usd).sum(),
            tasks: results,
            summary: String::new(),
        };
        out.summary = build_summary(&out);
        tracing::info!(summary = %out.summary, "dispatch finished");
        Ok(out)
    }

    /// Full pipeline for one task outside a batch; the caller holds no permit.
    pub async fn run_task(&self, mut task: Task) -> TaskResult {
        self.fill_defaults(&mut task);
        let Ok(_permit) = self.task_sem.acquire().await else {
            return TaskResult::rejected(&task, "dispatcher is shutting down");
        };
        let scope = self.root.child_token();
        self.run_task_in(task, &scope).await
    }

    /// Executes without the tool loop, streaming, history or state tracking,
    /// holding a permit from `sem` only for the provider call.
    pub(crate) async fn run_single_task_in(
        &self,
        sem: &Semaphore,
        mut task: Task,
        role: &str,
    ) -> TaskResult {
        self.trust.apply_trust_to_task(&mut task, role);

        if let Err(err) = validate_dirs(&self.cfg, &task, role) {
            return TaskResult::rejected(&task, err.to_string());
        }

        let Ok(_permit) = sem.acquire().await else {
            return TaskResult::rejected(&task, "dispatcher is shutting down");
        };

        self.inject_knowledge_dir(&mut task).await;

        let decision = self.budget.check_budget(role, &task).await;
        if !decision.allowed {
            tracing::warn!(task_id = %task.short_id(), reason = %decision.message, "budget check failed");
            return TaskResult::rejected(&task, HubError::BudgetExceeded(decision.message).to_string());
        }
        if !decision.downgrade_model.is_empty() {
            tracing::info!(
                task_id = %task.short_id(),
                from = %task.model,
                to = %decision.downgrade_model,
                utilization = %format!("{:.0}%", decision.utilization * 100.0),
                "auto-downgrade model"
            );
            task.model = decision.downgrade_model;
        }

        tracing::debug!(
            task_id = %task.short_id(),
            name = %task.name,
            model = %task.model,
            provider = %resolve_provider_name(&self.cfg, &task, role),
            source = %task.source,
            "task start"
        );

        let timeout = parse_duration_or(&task.timeout, DEFAULT_TASK_TIMEOUT);
        let cancel = self.root.child_token();
        let started = Instant::now();
        let outcome = run_bounded(
            execute_with_provider(&self.cfg, &task, role, &self.providers, &self.circuits, None),
            timeout,
            &cancel,
        )
        .await;
        let elapsed = started.elapsed();

        let mut result = match &outcome {
            Outcome::Finished(pr) => result_from_provider(&task, pr, elapsed),
            _ => result_from_provider(&task, &ProviderResult::default(), elapsed),
        };
        match outcome {
            Outcome::TimedOut => {
                result.status = TaskStatus::Timeout;
                result.error = format!("timed out after {}", format_duration(timeout));
            }
            Outcome::Cancelled => {
                result.status = TaskStatus::Cancelled;
                result.error = "cancelled".to_string();
            }
            Outcome::Finished(pr) if pr.is_error => {
                result.status = TaskStatus::Error;
                result.error = pr.error;
            }
            Outcome::Finished(_) => {}
        }

        self.save_output(&task, &mut result).await;
        self.maybe_enqueue(&task, role, &mut result).await;
        self.log_outcome(&task, role, &result);
        result
    }

    /// Single-task path on the task semaphore; used for retries and review.
    pub async fn run_single_task(&self, task: Task, role: &str) -> TaskResult {
        let sem = self.task_sem.clone();
        self.run_single_task_in(&sem, task, role).await
    }

    async fn inject_knowledge_dir(&self, task: &mut Task) {
        let dir = &self.cfg.knowledge_dir;
        if !dir.is_empty() && knowledge_dir_has_files(dir).await && !task.add_dirs.contains(dir) {
            task.add_dirs.push(dir.clone());
        }
    }

    async fn save_output(&self, task: &Task, result: &mut TaskResult) {
        if result.output.is_empty() {
            return;
        }
        match self.history.save_output(&task.id, &result.output).await {
            Ok(name) => result.output_file = name,
            Err(err) => {
                tracing::warn!(task_id = %task.short_id(), error = %err, "save output failed");
            }
        }
    }

    /// Re-tags total unavailability as `queued` when the offline queue takes the task.
    async fn maybe_enqueue(&self, task: &Task, role: &str, result: &mut TaskResult) -> bool {
        let queue_cfg = &self.cfg.offline_queue;
        if result.status != TaskStatus::Error
            || !result.error.contains(ALL_PROVIDERS_UNAVAILABLE)
            || !queue_cfg.enabled
        {
            return false;
        }
        let limit = if queue_cfg.max_items == 0 { 100 } else { queue_cfg.max_items };
        if self.queue.is_queue_full(limit).await {
            tracing::warn!(task_id = %task.short_id(), "offline queue full, task not enqueued");
            return false;
        }
        match self.queue.enqueue_task(task, role, 0).await {
            Ok(()) => {
                result.status = TaskStatus::Queued;
                tracing::info!(task_id = %task.short_id(), name = %task.name, "task queued for offline retry");
                true
            }
            Err(err) => {
                tracing::warn!(task_id = %task.short_id(), error = %err, "failed to enqueue task");
                false
            }
        }
    }

    fn log_outcome(&self, task: &Task, role: &str, result: &TaskResult) {
        let level = if result.status.is_success() {
            Level::INFO
        } else {
            Level::WARN
        };
        emit_event(
            level,
            ProcessKind::Hub,
            ObservabilityEvent {
                task_id: Some(task.id.as_str()),
                session_id: Some(result.session_id.as_str()),
                role: (!role.is_empty()).then_some(role),
                provider: (!result.provider.is_empty()).then_some(result.provider.as_str()),
                model: Some(result.model.as_str()),
                status: Some(result.status.as_str()),
                detail: (!result.error.is_empty()).then_some(result.error.as_str()),
                ..ObservabilityEvent::new("task.finished", "dispatch")
            },
        );
    }

    fn publish_task_event(&self, task: &Task, event_type: &str, data: serde_json::Value) {
        self.broker.publish_multi(
            &[task.id.as_str(), task.session_id.as_str()],
            HubEvent::for_task(event_type, &task.id, &task.session_id, data),
        );
    }

    async fn prepare_role(&self, task: &mut Task, role: &str) {
        if let Some(soul) = load_soul_file(&self.cfg, role).await {
            task.system_prompt = soul;
        }
        let ws = resolve_workspace(&self.cfg, role);
        let holds_default_workdir = task.workdir == self.cfg.default_workdir
            || task.workdir == expand_home(&self.cfg.default_workdir);
        if holds_default_workdir && !ws.dir.is_empty() {
            task.workdir = expand_home(&ws.dir);
        }
        if let Some(rc) = self.cfg.role(role) {
            if task.model == self.cfg.default_model && !rc.model.is_empty() {
                task.model = rc.model.clone();
            }
            if task.permission_mode == self.cfg.default_permission_mode && !rc.permission_mode.is_empty() {
                task.permission_mode = rc.permission_mode.clone();
            }
        }
    }

    /// The `run_task` pipeline; `batch` is the cancellation scope of the caller.
    pub(crate) async fn run_task_in(&self, mut task: Task, batch: &CancellationToken) -> TaskResult {
        if task.trace_id.is_empty() {
            task.trace_id = short_id(&task.id).to_string();
        }
        let role = task.role.clone();

        if !role.is_empty() {
            self.prepare_role(&mut task, &role).await;
        }
        self.inject_knowledge_dir(&mut task).await;

        let (trust_level, _) = self.trust.apply_trust_to_task(&mut task, &role);
        if trust_level == TrustLevel::Observe {
            tracing::debug!(role = %role, "trust: observe mode, forcing plan permission");
        }

        if self.cfg.reflection.enabled && !role.is_empty() {
            let context =
                build_reflection_context(self.reflector.as_ref(), &role, REFLECTION_CONTEXT_LIMIT).await;
            if !context.is_empty() {
                task.system_prompt = format!("{}\n\n{}", task.system_prompt, context);
            }
        }

        if let Err(err) = validate_dirs(&self.cfg, &task, &role) {
            let result = TaskResult::rejected(&task, err.to_string());
            self.log_outcome(&task, &role, &result);
            return result;
        }

        let timeout = parse_duration_or(&task.timeout, DEFAULT_TASK_TIMEOUT);
        let cancel = batch.child_token();
        let started = Instant::now();
        let started_at = Utc::now();
        self.lock().running.insert(
            task.id.clone(),
            RunningTask {
                task: task.clone(),
                started,
                cancel: cancel.clone(),
            },
        );

        let decision = self.budget.check_budget(&role, &task).await;
        if !decision.allowed {
            tracing::warn!(task_id = %task.short_id(), reason = %decision.message, "budget check failed");
            let result =
                TaskResult::rejected(&task, HubError::BudgetExceeded(decision.message).to_string());
            {
                let mut state = self.lock();
                state.running.remove(&task.id);
                state.finished.push(result.clone());
            }
            self.log_outcome(&task, &role, &result);
            return result;
        }
        if !decision.downgrade_model.is_empty() {
            tracing::info!(
                task_id = %task.short_id(),
                from = %task.model,
                to = %decision.downgrade_model,
                utilization = %format!("{:.0}%", decision.utilization * 100.0),
                "auto-downgrade model"
            );
            task.model = decision.downgrade_model;
        }

        tracing::debug!(
            task_id = %task.short_id(),
            name = %task.name,
            model = %task.model,
            provider = %resolve_provider_name(&self.cfg, &task, &role),
            role = %role,
            workdir = %task.workdir,
            "task start"
        );

        self.publish_task_event(
            &task,
            EVENT_STARTED,
            json!({ "name": task.name, "role": role, "model": task.model }),
        );

        let streaming = self.broker.has_subscribers(&task.id)
            || self.broker.has_subscribers(&task.session_id);
        let (events_tx, forwarder) = if streaming {
            let (tx, mut rx) = mpsc::channel::<HubEvent>(EVENT_BUFFER);
            let broker = self.broker.clone();
            let keys = [task.id.clone(), task.session_id.clone()];
            let handle = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    broker.publish_multi(&[keys[0].as_str(), keys[1].as_str()], event);
                }
            });
            (Some(tx), Some(handle))
        } else {
            (None, None)
        };

        let tool_loop = ToolLoop {
            cfg: &self.cfg,
            providers: &self.providers,
            circuits: &self.circuits,
            tools: self.tools.as_ref(),
            trust: self.trust.as_ref(),
            broker: self.broker.as_ref(),
        };
        let outcome = run_bounded(
            tool_loop.run(&task, &role, events_tx.as_ref(), &cancel),
            timeout,
            &cancel,
        )
        .await;
        drop(events_tx);
        if let Some(handle) = forwarder {
            let _ = handle.await;
        }
        let elapsed = started.elapsed();

        let mut result = match &outcome {
            Outcome::Finished(pr) => result_from_provider(&task, pr, elapsed),
            _ => result_from_provider(&task, &ProviderResult::default(), elapsed),
        };
        match outcome {
            Outcome::TimedOut => {
                result.status = TaskStatus::Timeout;
                result.error = format!("timed out after {}", format_duration(timeout));
            }
            Outcome::Cancelled => {
                result.status = TaskStatus::Cancelled;
                result.error = if batch.is_cancelled() {
                    "dispatch cancelled".to_string()
                } else {
                    "cancelled".to_string()
                };
            }
            Outcome::Finished(pr) if pr.is_error => {
                result.status = TaskStatus::Error;
                result.error = pr.error;
            }
            Outcome::Finished(_) => {}
        }

        self.save_output(&task, &mut result).await;
        if self.maybe_enqueue(&task, &role, &mut result).await {
            self.publish_task_event(
                &task,
                EVENT_TASK_QUEUED,
                json!({ "name": task.name, "role": role, "error": result.error }),
            );
        }

        {
            let mut state = self.lock();
            state.running.remove(&task.id);
            state.finished.push(result.clone());
            if !matches!(result.status, TaskStatus::Success | TaskStatus::Queued) {
                state.failed.insert(
                    task.id.clone(),
                    FailedTask {
                        task: task.clone(),
                        failed_at: Utc::now(),
                        error: result.error.clone(),
                    },
                );
            }
        }

        tracing::debug!(
            task_id = %task.short_id(),
            name = %task.name,
            elapsed_ms = elapsed.as_millis() as u64,
            cost = result.cost_usd,
            tokens_in = result.tokens_in,
            tokens_out = result.tokens_out,
            status = %result.status,
            "task done"
        );
        self.log_outcome(&task, &role, &result);

        self.record(&task, &result, &role, started_at).await;
        if !task.source.starts_with("chat") {
            if let Err(err) = self.history.record_session_activity(&task, &result, &role).await {
                tracing::warn!(task_id = %task.short_id(), error = %err, "record session activity failed");
            }
        }

        if result.status != TaskStatus::Queued {
            let event_type = if result.status.is_success() {
                EVENT_COMPLETED
            } else {
                EVENT_ERROR
            };
            self.publish_task_event(
                &task,
                event_type,
                json!({
                    "status": result.status,
                    "durationMs": result.duration_ms,
                    "costUsd": result.cost_usd,
                    "tokensIn": result.tokens_in,
                    "tokensOut": result.tokens_out,
                    "error": result.error,
                }),
            );
        }

        self.webhooks
            .send_webhooks(result.status.as_str(), webhook_payload(&task, &result));

        result.trust_level = Some(trust_level);

        if should_reflect(&self.cfg, &task, &result) {
            let reflector = self.reflector.clone();
            let (task, result) = (task.clone(), result.clone());
            tokio::spawn(async move {
                reflect_and_store(reflector.as_ref(), &task, &result).await;
            });
        }

        self.trust.record_outcome(&role, result.status.is_success());
        if result.status.is_success() && !role.is_empty() {
            if let Some(message) = self.trust.check_trust_promotion(&role) {
                self.broker.publish(
                    TRUST_KEY,
                    HubEvent::new(
                        EVENT_TRUST_PROMOTION,
                        json!({ "role": role, "message": message }),
                    ),
                );
            }
        }

        result
    }

    pub(crate) async fn record(
        &self,
        task: &Task,
        result: &TaskResult,
        role: &str,
        started_at: DateTime<Utc>,
    ) {
        let record = HistoryRecord {
            task_id: task.id.clone(),
            name: task.name.clone(),
            source: task.source.clone(),
            role: role.to_string(),
            task: task.clone(),
            result: result.clone(),
            started_at,
            finished_at: Utc::now(),
            output_file: result.output_file.clone(),
        };
        if let Err(err) = self.history.record_history(record).await {
            tracing::warn!(task_id = %task.short_id(), error = %err, "record history failed");
        }
    }

    pub(crate) async fn audit(&self, action: &str, source: &str, detail: &str) {
        if let Err(err) = self.history.audit(action, source, detail).await {
            tracing::warn!(action = %action, error = %err, "audit log failed");
        }
    }

    /// Re-runs a cached failure under a new id through the single-task path.
    pub async fn retry_task(&self, task_id: &str) -> HubResult<TaskResult> {
        let original = self
            .lock()
            .failed
            .get(task_id)
            .map(|ft| ft.task.clone())
            .ok_or_else(|| HubError::FailedTaskNotFound(task_id.to_string()))?;

        let mut task = original;
        task.id = new_id();
        task.session_id = new_id();
        task.source = format!("retry:{}", task.source);
        self.fill_defaults(&mut task);
        let role = task.role.clone();

        let started_at = Utc::now();
        let result = self.run_single_task(task.clone(), &role).await;

        self.record(&task, &result, &role, started_at).await;
        if let Err(err) = self.history.record_session_activity(&task, &result, &role).await {
            tracing::warn!(task_id = %task.short_id(), error = %err, "record session activity failed");
        }

        {
            let mut state = self.lock();
            if result.status.is_success() {
                state.failed.remove(task_id);
            } else {
                state.failed.insert(
                    task.id.clone(),
                    FailedTask {
                        task: task.clone(),
                        failed_at: Utc::now(),
                        error: result.error.clone(),
                    },
                );
            }
        }

        self.audit(
            "task.retry",
            &task.source,
            &format!("original={task_id} new={} status={}", task.id, result.status),
        )
        .await;
        Ok(result)
    }

    pub(crate) fn failed_task(&self, task_id: &str) -> Option<Task> {
        self.lock().failed.get(task_id).map(|ft| ft.task.clone())
    }

    pub(crate) fn forget_failed_task(&self, task_id: &str) {
        self.lock().failed.remove(task_id);
    }

    /// Failed tasks available for retry/reroute, oldest first.
    pub fn list_failed_tasks(&self) -> Vec<FailedTaskInfo> {
        let state = self.lock();
        let mut out: Vec<FailedTaskInfo> = state
            .failed
            .iter()
            .map(|(id, ft)| FailedTaskInfo {
                id: id.clone(),
                name: ft.task.name.clone(),
                prompt: truncate(&ft.task.prompt, 100),
                role: ft.task.role.clone(),
                source: ft.task.source.clone(),
                error: ft.error.clone(),
                failed_at: ft.failed_at,
            })
            .collect();
        out.sort_by(|a, b| a.failed_at.cmp(&b.failed_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Drops cache entries older than [`FAILED_TASK_TTL`]; returns how many went.
    pub fn cleanup_failed_tasks(&self) -> usize {
        let now = Utc::now();
        let mut state = self.lock();
        let before = state.failed.len();
        state.failed.retain(|_, ft| {
            (now - ft.failed_at)
                .to_std()
                .map(|age| age <= FAILED_TASK_TTL)
                .unwrap_or(true)
        });
        before - state.failed.len()
    }

    pub fn status(&self) -> DispatchStatus {
        let state = self.lock();
        let status = if state.active {
            "dispatching"
        } else if !state.finished.is_empty() {
            "done"
        } else {
            "idle"
        };

        let mut tasks: Vec<TaskStatusEntry> = state
            .running
            .values()
            .map(|rt| TaskStatusEntry {
                id: rt.task.id.clone(),
                name: rt.task.name.clone(),
                status: "running".to_string(),
                elapsed: format_duration(round_to_seconds(rt.started.elapsed())),
                duration: String::new(),
                cost_usd: 0.0,
                model: rt.task.model.clone(),
                timeout: rt.task.timeout.clone(),
                prompt: truncate(&rt.task.prompt, 100),
                source: rt.task.source.clone(),
            })
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks.extend(state.finished.iter().map(|r| TaskStatusEntry {
            id: r.id.clone(),
            name: r.name.clone(),
            status: r.status.to_string(),
            elapsed: String::new(),
            duration: format_duration(round_to_seconds(Duration::from_millis(r.duration_ms))),
            cost_usd: r.cost_usd,
            model: r.model.clone(),
            timeout: String::new(),
            prompt: String::new(),
            source: String::new(),
        }));

        DispatchStatus {
            status: status.to_string(),
            running: state.running.len(),
            completed: state.finished.len(),
            tasks,
            elapsed: match (state.active, state.started) {
                (true, Some(started)) => Some(format_duration(round_to_seconds(started.elapsed()))),
                _ => None,
            },
        }
    }

    /// Cancels the active batch; false when nothing is dispatching.
    pub fn cancel(&self) -> bool {
        let state = self.lock();
        match &state.batch {
            Some(batch) => {
                batch.cancel();
                tracing::info!(running = state.running.len(), "dispatch cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancels one running task by id.
    pub fn cancel_task(&self, task_id: &str) -> bool {
        let state = self.lock();
        match state.running.get(task_id) {
            Some(rt) => {
                rt.cancel.cancel();
                tracing::info!(task_id = %task_id, "task cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancels everything this dispatcher started, including retries and routing calls.
    pub fn shutdown(&self) {
        self.root.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use switchyard_providers::{Provider, ProviderRequest};

    use super::*;
    use crate::collaborators::{BudgetDecision, NoopReflector};
    use crate::config::RoleConfig;

    /// Counts concurrent entries; prompts containing `slow` outlast any test timeout.
    struct StubProvider {
        calls: AtomicUsize,
        current: AtomicUsize,
        max: AtomicUsize,
        delay: Duration,
        fail_first: usize,
        error: String,
        cost: f64,
    }

    impl StubProvider {
        fn new(delay: Duration, cost: f64) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                current: AtomicUsize::new(0),
                max: AtomicUsize::new(0),
                delay,
                fail_first: 0,
                error: String::new(),
                cost,
            }
        }

        fn failing(mut self, times: usize, error: &str) -> Self {
            self.fail_first = times;
            self.error = error.to_string();
            self
        }
    }

    #[async_trait]
    impl Provider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        fn kind(&self) -> &'static str {
            "stub"
        }

        async fn execute(&self, req: ProviderRequest) -> anyhow::Result<ProviderResult> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            let mut seen = self.max.load(Ordering::SeqCst);
            while now > seen {
                match self
                    .max
                    .compare_exchange(seen, now, Ordering::SeqCst, Ordering::SeqCst)
                {
                    Ok(_) => break,
                    Err(actual) => seen = actual,
                }
            }

            let delay = if req.prompt.contains("slow") {
                Duration::from_secs(10)
            } else {
                self.delay
            };
            tokio::time::sleep(delay).await;
            self.current.fetch_sub(1, Ordering::SeqCst);

            if call < self.fail_first {
                return Ok(ProviderResult::failure(self.error.clone()));
            }
            let mut result = ProviderResult::text(format!("done: {}", req.prompt));
            result.cost_usd = self.cost;
            Ok(result)
        }
    }

    async fn dispatcher(cfg: HubConfig, provider: Arc<StubProvider>) -> Dispatcher {
        let providers = ProviderRegistry::new();
        providers.register("stub", provider).await;
        let cfg = HubConfig {
            default_provider: "stub".to_string(),
            ..cfg
        };
        Dispatcher::new(cfg, providers)
    }

    #[test]
    fn fill_defaults_only_populates_empty_fields() {
        let cfg = HubConfig {
            default_workdir: "/srv/work".to_string(),
            default_budget: 2.0,
            ..HubConfig::default()
        };

        let mut empty = Task::new("hello");
        fill_defaults(&cfg, &mut empty);
        assert_eq!(empty.id.len(), 36);
        assert_eq!(empty.session_id.len(), 36);
        assert_ne!(empty.id, empty.session_id);
        assert_eq!(empty.model, "sonnet");
        assert_eq!(empty.timeout, "15m");
        assert_eq!(empty.budget, 2.0);
        assert_eq!(empty.permission_mode, "acceptEdits");
        assert_eq!(empty.workdir, "/srv/work");
        assert_eq!(empty.name, format!("task-{}", &empty.id[..8]));

        let mut set = Task::new("hello");
        set.id = "fixed-id".to_string();
        set.session_id = "sess".to_string();
        set.model = "opus".to_string();
        set.timeout = "1m".to_string();
        set.budget = 0.5;
        set.permission_mode = "plan".to_string();
        set.workdir = "/tmp/x".to_string();
        set.name = "named".to_string();
        let before = set.clone();
        fill_defaults(&cfg, &mut set);
        assert_eq!(set, before);
    }

    #[test]
    fn sanitize_strips_control_sequences_and_truncates() {
        assert_eq!(sanitize_prompt("a\0b\x1b[31mred\x1b[0m", 100), "abred");
        assert_eq!(sanitize_prompt("abcdef", 4), "abcd");
    }

    #[test]
    fn validate_dirs_prefers_role_list() {
        let mut cfg = HubConfig {
            allowed_dirs: vec!["/srv".to_string()],
            ..HubConfig::default()
        };
        cfg.roles.insert(
            "dev".to_string(),
            RoleConfig {
                allowed_dirs: vec!["/home/dev".to_string()],
                ..RoleConfig::default()
            },
        );

        let mut task = Task::new("x");
        task.workdir = "/srv/app".to_string();
        assert!(validate_dirs(&cfg, &task, "").is_ok());
        let err = validate_dirs(&cfg, &task, "dev").expect_err("outside role dirs");
        assert_eq!(err.to_string(), "workdir \"/srv/app\" is not within allowedDirs");

        task.workdir = "/srv".to_string();
        assert!(validate_dirs(&cfg, &task, "").is_ok());
        task.workdir = "/srvx".to_string();
        assert!(validate_dirs(&cfg, &task, "").is_err());

        task.workdir = "/srv/app".to_string();
        task.add_dirs = vec!["/etc".to_string()];
        let err = validate_dirs(&cfg, &task, "").expect_err("add dir");
        assert_eq!(err.to_string(), "addDir \"/etc\" is not within allowedDirs");

        assert!(validate_dirs(&HubConfig::default(), &task, "").is_ok());
    }

    #[test]
    fn validate_dirs_resolves_parent_components() {
        let cfg = HubConfig {
            allowed_dirs: vec!["/srv/allowed".to_string()],
            ..HubConfig::default()
        };

        let mut task = Task::new("x");
        task.workdir = "/srv/allowed/../../etc".to_string();
        let err = validate_dirs(&cfg, &task, "").expect_err("workdir climbs out");
        assert_eq!(
            err.to_string(),
            "workdir \"/srv/allowed/../../etc\" is not within allowedDirs"
        );

        task.workdir = "/srv/allowed/./app/../lib".to_string();
        assert!(validate_dirs(&cfg, &task, "").is_ok());

        task.add_dirs = vec!["/srv/allowed/../allowed-other".to_string()];
        let err = validate_dirs(&cfg, &task, "").expect_err("add dir climbs out");
        assert!(err.to_string().starts_with("addDir "));

        task.add_dirs = vec!["/srv/allowed/sub/..".to_string()];
        assert!(validate_dirs(&cfg, &task, "").is_ok());
    }

    #[test]
    fn clean_path_folds_dot_components() {
        assert_eq!(clean_path(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert_eq!(clean_path(Path::new("/../../etc")), PathBuf::from("/etc"));
        assert_eq!(clean_path(Path::new("a/../../b")), PathBuf::from("../b"));
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_pool_size() {
        let provider = Arc::new(StubProvider::new(Duration::from_millis(30), 0.01));
        let cfg = HubConfig {
            max_concurrent: 2,
            ..HubConfig::default()
        };
        let dispatcher = dispatcher(cfg, provider.clone()).await;
        let tasks = (0..6).map(|i| Task::new(format!("task {i}"))).collect();

        let result = dispatcher.dispatch(tasks).await.expect("dispatch");
        assert_eq!(result.tasks.len(), 6);
        assert!(result.tasks.iter().all(|t| t.status == TaskStatus::Success));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 6);
        assert!(provider.max.load(Ordering::SeqCst) <= 2);
        assert_eq!(provider.max.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn summary_counts_successes_and_sums_cost() {
        let provider = Arc::new(StubProvider::new(Duration::from_millis(5), 0.25));
        let dispatcher = dispatcher(HubConfig::default(), provider).await;
        let mut slow = Task::new("slow job");
        slow.timeout = "50ms".to_string();

        let result = dispatcher
            .dispatch(vec![Task::new("one"), Task::new("two"), slow])
            .await
            .expect("dispatch");
        assert_eq!(result.summary, "2/3 tasks succeeded ($0.50, 0s)");
        assert!((result.total_cost_usd - 0.5).abs() < 1e-9);

        let timed_out = result
            .tasks
            .iter()
            .find(|t| t.status == TaskStatus::Timeout)
            .expect("timeout result");
        assert_eq!(timed_out.error, "timed out after 50ms");
        assert_eq!(dispatcher.list_failed_tasks().len(), 1);
        assert_eq!(dispatcher.status().status, "done");
    }

    #[tokio::test]
    async fn retry_uses_new_id_and_clears_cache_on_success() {
        let provider = Arc::new(
            StubProvider::new(Duration::from_millis(1), 0.1).failing(1, "invalid request"),
        );
        let history = Arc::new(InMemoryHistory::new());
        let dispatcher = dispatcher(HubConfig::default(), provider)
            .await
            .with_history(history.clone());

        let mut task = Task::new("flaky").with_source("cli").with_role("dev");
        task.model = "opus".to_string();
        task.permission_mode = "plan".to_string();
        let first = dispatcher.dispatch(vec![task]).await.expect("dispatch");
        let failed = &first.tasks[0];
        assert_eq!(failed.status, TaskStatus::Error);
        assert_eq!(failed.error, "invalid request");

        let cached = dispatcher.list_failed_tasks();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].id, failed.id);
        assert_eq!(cached[0].role, "dev");

        let retried = dispatcher.retry_task(&failed.id).await.expect("retry");
        assert_eq!(retried.status, TaskStatus::Success);
        assert_ne!(retried.id, failed.id);
        assert_ne!(retried.session_id, failed.session_id);
        assert_eq!(retried.model, "opus");
        assert!(dispatcher.list_failed_tasks().is_empty());

        let records = history.records();
        let retry_record = records.last().expect("history");
        assert_eq!(retry_record.source, "retry:cli");
        assert_eq!(retry_record.task.prompt, "flaky");
        assert_eq!(retry_record.role, "dev");
        assert_eq!(retry_record.task.role, "dev");
        assert_eq!(retry_record.task.model, "opus");
        assert_eq!(retry_record.task.permission_mode, "plan");
        assert!(!retried.output_file.is_empty());
        assert_eq!(retry_record.output_file, retried.output_file);
        assert_eq!(
            history.output(&retried.output_file).as_deref(),
            Some("done: flaky")
        );
        assert!(first.tasks[0].output_file.is_empty());
        let audit = history.audit_log();
        assert_eq!(audit.last().expect("audit").action, "task.retry");
        assert!(audit
            .last()
            .expect("audit")
            .detail
            .starts_with(&format!("original={} new=", failed.id)));
    }

    #[tokio::test]
    async fn failed_retry_keeps_both_entries() {
        let provider = Arc::new(
            StubProvider::new(Duration::from_millis(1), 0.0).failing(5, "invalid request"),
        );
        let dispatcher = dispatcher(HubConfig::default(), provider).await;
        let first = dispatcher
            .dispatch(vec![Task::new("broken")])
            .await
            .expect("dispatch");
        let retried = dispatcher
            .retry_task(&first.tasks[0].id)
            .await
            .expect("retry");
        assert_eq!(retried.status, TaskStatus::Error);
        let ids: Vec<String> = dispatcher
            .list_failed_tasks()
            .into_iter()
            .map(|f| f.id)
            .collect();
        assert!(ids.contains(&first.tasks[0].id));
        assert!(ids.contains(&retried.id));
    }

    #[tokio::test]
    async fn retry_of_unknown_id_is_an_error() {
        let provider = Arc::new(StubProvider::new(Duration::ZERO, 0.0));
        let dispatcher = dispatcher(HubConfig::default(), provider).await;
        let err = dispatcher.retry_task("nope").await.expect_err("missing");
        assert!(matches!(err, HubError::FailedTaskNotFound(_)));
    }

    #[tokio::test]
    async fn total_unavailability_is_queued_when_queue_enabled() {
        let provider = Arc::new(
            StubProvider::new(Duration::ZERO, 0.0).failing(10, "connection refused"),
        );
        let mut cfg = HubConfig::default();
        cfg.offline_queue.enabled = true;
        cfg.circuit_breaker.enabled = false;
        let queue = Arc::new(InMemoryOfflineQueue::new());
        let bus = EventBus::new();
        let dispatcher = dispatcher(cfg, provider)
            .await
            .with_offline_queue(queue.clone())
            .with_broker(Arc::new(bus.clone()));

        let mut task = Task::new("later please");
        task.session_id = "sess-q".to_string();
        let mut rx = bus.subscribe("sess-q");

        let result = dispatcher.dispatch(vec![task]).await.expect("dispatch");
        let queued = &result.tasks[0];
        assert_eq!(queued.status, TaskStatus::Queued);
        assert!(queued.error.starts_with("all providers unavailable"));
        assert_eq!(queue.len(), 1);
        assert!(dispatcher.list_failed_tasks().is_empty());

        assert_eq!(rx.recv().await.expect("started").event_type, EVENT_STARTED);
        assert_eq!(rx.recv().await.expect("queued").event_type, EVENT_TASK_QUEUED);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn budget_denial_never_reaches_provider() {
        let provider = Arc::new(StubProvider::new(Duration::ZERO, 0.0));
        let dispatcher = dispatcher(HubConfig::default(), provider.clone())
            .await
            .with_budget(Arc::new(StaticBudget::new(BudgetDecision::deny("daily cap"))));

        let result = dispatcher
            .dispatch(vec![Task::new("spend")])
            .await
            .expect("dispatch");
        assert_eq!(result.tasks[0].error, "budget_exceeded: daily cap");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        let status = dispatcher.status();
        assert_eq!(status.running, 0);
        assert_eq!(status.completed, 1);
    }

    #[tokio::test]
    async fn budget_downgrade_switches_model() {
        let provider = Arc::new(StubProvider::new(Duration::ZERO, 0.0));
        let decision = BudgetDecision {
            allowed: true,
            downgrade_model: "haiku".to_string(),
            utilization: 0.9,
            message: String::new(),
        };
        let dispatcher = dispatcher(HubConfig::default(), provider)
            .await
            .with_budget(Arc::new(StaticBudget::new(decision)));
        let result = dispatcher.run_task(Task::new("cheap")).await;
        assert_eq!(result.status, TaskStatus::Success);
        assert_eq!(result.model, "haiku");
    }

    #[tokio::test]
    async fn events_are_ordered_started_then_completed() {
        let provider = Arc::new(StubProvider::new(Duration::ZERO, 0.2));
        let bus = EventBus::new();
        let dispatcher = dispatcher(HubConfig::default(), provider)
            .await
            .with_broker(Arc::new(bus.clone()));
        let mut task = Task::new("observe me");
        task.session_id = "sess-1".to_string();
        let mut rx = bus.subscribe("sess-1");

        dispatcher.dispatch(vec![task]).await.expect("dispatch");
        let started = rx.recv().await.expect("started");
        assert_eq!(started.event_type, EVENT_STARTED);
        assert_eq!(started.data["model"], json!("sonnet"));
        let completed = rx.recv().await.expect("completed");
        assert_eq!(completed.event_type, EVENT_COMPLETED);
        assert_eq!(completed.data["status"], json!("success"));
        assert_eq!(completed.data["costUsd"], json!(0.2));
    }

    #[tokio::test]
    async fn cancel_marks_running_tasks_cancelled() {
        let provider = Arc::new(StubProvider::new(Duration::ZERO, 0.0));
        let dispatcher = dispatcher(HubConfig::default(), provider).await;
        assert!(!dispatcher.cancel());

        let worker = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.dispatch(vec![Task::new("slow forever")]).await })
        };
        for _ in 0..200 {
            if dispatcher.status().running == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let status = dispatcher.status();
        assert_eq!(status.status, "dispatching");
        assert_eq!(status.tasks[0].status, "running");
        assert!(dispatcher.cancel());

        let result = worker.await.expect("join").expect("dispatch");
        assert_eq!(result.tasks[0].status, TaskStatus::Cancelled);
        assert_eq!(result.tasks[0].error, "dispatch cancelled");
    }

    #[tokio::test]
    async fn second_batch_is_rejected_while_one_is_running() {
        let provider = Arc::new(StubProvider::new(Duration::ZERO, 0.0));
        let cfg = HubConfig {
            max_concurrent: 4,
            ..HubConfig::default()
        };
        let dispatcher = dispatcher(cfg, provider.clone()).await;

        let mut side = Task::new("slow side job");
        side.id = "side-task".to_string();
        let side_worker = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.run_task(side).await })
        };
        let mut batched = Task::new("slow batch job");
        batched.id = "batch-task".to_string();
        let batch_worker = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.dispatch(vec![batched]).await })
        };
        for _ in 0..200 {
            if dispatcher.status().running == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let status = dispatcher.status();
        assert_eq!(status.status, "dispatching");
        assert_eq!(status.running, 2);

        let err = dispatcher
            .dispatch(vec![Task::new("second batch")])
            .await
            .expect_err("batch already running");
        assert!(matches!(err, HubError::DispatchInProgress));
        assert_eq!(dispatcher.status().running, 2);
        assert!(provider.calls.load(Ordering::SeqCst) <= 2);

        assert!(dispatcher.cancel());
        let batch = batch_worker.await.expect("join").expect("dispatch");
        assert_eq!(batch.tasks[0].id, "batch-task");
        assert_eq!(batch.tasks[0].error, "dispatch cancelled");

        let status = dispatcher.status();
        assert_eq!(status.running, 1);
        assert_eq!(status.tasks[0].id, "side-task");
        assert_eq!(status.tasks[0].status, "running");

        assert!(dispatcher.cancel_task("side-task"));
        let side = side_worker.await.expect("join");
        assert_eq!(side.status, TaskStatus::Cancelled);
        assert_eq!(side.error, "cancelled");
    }

    #[tokio::test]
    async fn cancel_task_stops_only_that_task() {
        let provider = Arc::new(StubProvider::new(Duration::from_millis(20), 0.0));
        let dispatcher = dispatcher(HubConfig::default(), provider).await;
        let mut slow = Task::new("slow one");
        slow.id = "slow-task-id".to_string();

        let worker = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.dispatch(vec![slow, Task::new("quick")]).await })
        };
        for _ in 0..200 {
            if dispatcher.cancel_task("slow-task-id") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let result = worker.await.expect("join").expect("dispatch");
        let slow = result
            .tasks
            .iter()
            .find(|t| t.id == "slow-task-id")
            .expect("slow result");
        assert_eq!(slow.status, TaskStatus::Cancelled);
        assert_eq!(slow.error, "cancelled");
        assert!(result
            .tasks
            .iter()
            .any(|t| t.id != "slow-task-id" && t.status == TaskStatus::Success));
    }

    #[tokio::test]
    async fn cleanup_drops_expired_failures() {
        let provider = Arc::new(
            StubProvider::new(Duration::ZERO, 0.0).failing(2, "invalid request"),
        );
        let dispatcher = dispatcher(HubConfig::default(), provider)
            .await
            .with_reflector(Arc::new(NoopReflector));
        let result = dispatcher
            .dispatch(vec![Task::new("a"), Task::new("b")])
            .await
            .expect("dispatch");
        let stale = result.tasks[0].id.clone();
        {
            let mut state = dispatcher.lock();
            let entry = state.failed.get_mut(&stale).expect("cached");
            entry.failed_at = Utc::now() - chrono::Duration::minutes(31);
        }
        assert_eq!(dispatcher.cleanup_failed_tasks(), 1);
        let left = dispatcher.list_failed_tasks();
        assert_eq!(left.len(), 1);
        assert_ne!(left[0].id, stale);
    }

    #[tokio::test]
    async fn directory_policy_rejects_before_execution() {
        let provider = Arc::new(StubProvider::new(Duration::ZERO, 0.0));
        let cfg = HubConfig {
            allowed_dirs: vec!["/srv/allowed".to_string()],
            ..HubConfig::default()
        };
        let dispatcher = dispatcher(cfg, provider.clone()).await;
        let mut task = Task::new("escape");
        task.workdir = "/etc".to_string();
        let result = dispatcher.dispatch(vec![task]).await.expect("dispatch");
        assert_eq!(result.tasks[0].status, TaskStatus::Error);
        assert!(result.tasks[0].error.contains("is not within allowedDirs"));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn role_overrides_apply_only_to_default_values() {
        let provider = Arc::new(StubProvider::new(Duration::ZERO, 0.0));
        let mut cfg = HubConfig::default();
        cfg.roles.insert(
            "dev".to_string(),
            RoleConfig {
                model: "opus".to_string(),
                permission_mode: "bypassPermissions".to_string(),
                ..RoleConfig::default()
            },
        );
        let history = Arc::new(InMemoryHistory::new());
        let dispatcher = dispatcher(cfg, provider)
            .await
            .with_history(history.clone());

        let defaulted = Task::new("use role model").with_role("dev");
        let mut explicit = Task::new("keep mine").with_role("dev");
        explicit.model = "haiku".to_string();
        dispatcher
            .dispatch(vec![defaulted, explicit])
            .await
            .expect("dispatch");

        let records = history.records();
        let model_for = |prompt: &str| {
            records
                .iter()
                .find(|r| r.task.prompt == prompt)
                .map(|r| (r.task.model.clone(), r.task.permission_mode.clone()))
                .expect("record")
        };
        assert_eq!(
            model_for("use role model"),
            ("opus".to_string(), "bypassPermissions".to_string())
        );
        assert_eq!(model_for("keep mine").0, "haiku");
    }
}
