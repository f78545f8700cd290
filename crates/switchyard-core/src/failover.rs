use std::collections::HashSet;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::Level;

use switchyard_observability::{emit_event, ObservabilityEvent, ProcessKind};
use switchyard_providers::{ProviderRegistry, ProviderRequest, ProviderResult, FALLBACK_PROVIDER};
use switchyard_types::{HubEvent, Task, EVENT_PROVIDER_FAILOVER};

use crate::circuit::CircuitRegistry;
use crate::config::HubConfig;
use crate::duration::parse_duration_or;

pub const ALL_PROVIDERS_UNAVAILABLE: &str = "all providers unavailable";

const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(15 * 60);

const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "deadline exceeded",
    "connection refused",
    "connection reset",
    "eof",
    "broken pipe",
    "http 5",
    "status 5",
    "temporarily unavailable",
    "service unavailable",
    "too many requests",
    "rate limit",
];

/// task provider, then role provider, then configured default, then the built-in fallback.
pub fn resolve_provider_name(cfg: &HubConfig, task: &Task, role: &str) -> String {
    if !task.provider.is_empty() {
        return task.provider.clone();
    }
    if let Some(rc) = cfg.role(role) {
        if !rc.provider.is_empty() {
            return rc.provider.clone();
        }
    }
    if !cfg.default_provider.is_empty() {
        return cfg.default_provider.clone();
    }
    FALLBACK_PROVIDER.to_string()
}

/// Primary, then role fallbacks, then config fallbacks, without duplicates.
pub fn build_provider_candidates(cfg: &HubConfig, task: &Task, role: &str) -> Vec<String> {
    let primary = resolve_provider_name(cfg, task, role);
    let role_fallbacks = cfg
        .role(role)
        .map(|rc| rc.fallback_providers.as_slice())
        .unwrap_or_default();

    let mut seen = HashSet::new();
    std::iter::once(&primary)
        .chain(role_fallbacks.iter())
        .chain(cfg.fallback_providers.iter())
        .filter(|name| seen.insert(name.as_str().to_string()))
        .cloned()
        .collect()
}

pub fn is_transient_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
}

pub fn build_provider_request(
    cfg: &HubConfig,
    task: &Task,
    role: &str,
    provider: &str,
    events: Option<mpsc::Sender<HubEvent>>,
) -> ProviderRequest {
    let model = if task.model.is_empty() {
        cfg.providers
            .get(provider)
            .map(|pc| pc.model.clone())
            .unwrap_or_default()
    } else {
        task.model.clone()
    };
    let docker = task
        .docker
        .or_else(|| cfg.role(role).and_then(|rc| rc.docker));

    ProviderRequest {
        prompt: task.prompt.clone(),
        system_prompt: task.system_prompt.clone(),
        model,
        workdir: task.workdir.clone(),
        timeout: parse_duration_or(&task.timeout, DEFAULT_TASK_TIMEOUT),
        budget: task.budget,
        permission_mode: task.permission_mode.clone(),
        add_dirs: task.add_dirs.clone(),
        session_id: task.session_id.clone(),
        docker,
        tools: Vec::new(),
        messages: Vec::new(),
        events,
    }
}

/// Runs the task through its candidate chain, failing over on transient errors.
///
/// Non-transient failures return at once and leave the circuit untouched. When
/// every candidate is skipped or fails transiently the result carries
/// [`ALL_PROVIDERS_UNAVAILABLE`].
pub async fn execute_with_provider(
    cfg: &HubConfig,
    task: &Task,
    role: &str,
    registry: &ProviderRegistry,
    circuits: &CircuitRegistry,
    events: Option<&mpsc::Sender<HubEvent>>,
) -> ProviderResult {
    let candidates = build_provider_candidates(cfg, task, role);
    let mut last_err = String::new();

    for (i, name) in candidates.iter().enumerate() {
        let next = candidates.get(i + 1);

        if circuits.enabled() && !circuits.get(name).allow() {
            tracing::debug!(task_id = %task.id, provider = %name, "circuit open, skipping provider");
            if let (0, Some(next)) = (i, next) {
                publish_failover(events, task, name, next, "circuit open").await;
            }
            continue;
        }

        let provider = match registry.get(name).await {
            Ok(provider) => provider,
            Err(err) => {
                tracing::debug!(task_id = %task.id, provider = %name, error = %err, "provider not registered");
                continue;
            }
        };

        let req = build_provider_request(cfg, task, role, name, events.cloned());
        let outcome = provider.execute(req).await;
        let (result, err_msg) = match outcome {
            Ok(result) if result.is_error => {
                let msg = result.error.clone();
                (Some(result), msg)
            }
            Ok(result) => (Some(result), String::new()),
            Err(err) => (None, err.to_string()),
        };

        if err_msg.is_empty() {
            if circuits.enabled() {
                circuits.get(name).record_success();
            }
            let mut result = result.unwrap_or_default();
            result.provider = name.clone();
            return result;
        }

        if !is_transient_error(&err_msg) {
            tracing::warn!(task_id = %task.id, provider = %name, error = %err_msg, "provider non-transient error");
            let mut result = result
                .unwrap_or_else(|| ProviderResult::failure(format!("provider {name}: {err_msg}")));
            result.provider = name.clone();
            return result;
        }

        if circuits.enabled() {
            circuits.get(name).record_failure();
        }
        tracing::warn!(task_id = %task.id, provider = %name, error = %err_msg, "provider transient error");
        last_err = format!("provider {name}: {err_msg}");

        if let Some(next) = next {
            emit_event(
                Level::WARN,
                ProcessKind::Hub,
                ObservabilityEvent {
                    task_id: Some(task.id.as_str()),
                    provider: Some(name.as_str()),
                    detail: Some(next.as_str()),
                    error_code: Some("PROVIDER_FAILOVER"),
                    ..ObservabilityEvent::new("provider.failover", "failover")
                },
            );
            publish_failover(events, task, name, next, &err_msg).await;
        }
    }

    let error = if last_err.is_empty() {
        ALL_PROVIDERS_UNAVAILABLE.to_string()
    } else {
        format!("{ALL_PROVIDERS_UNAVAILABLE}: {last_err}")
    };
    ProviderResult::failure(error)
}

async fn publish_failover(
    events: Option<&mpsc::Sender<HubEvent>>,
    task: &Task,
    from: &str,
    to: &str,
    reason: &str,
) {
    let Some(tx) = events else {
        return;
    };
    let event = HubEvent::for_task(
        EVENT_PROVIDER_FAILOVER,
        &task.id,
        &task.session_id,
        json!({ "from": from, "to": to, "reason": reason }),
    );
    let _ = tx.send(event).await;
}
