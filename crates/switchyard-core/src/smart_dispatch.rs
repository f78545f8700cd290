//! Route, run, remember, review: the free-text entry point.

use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::json;

use switchyard_types::{
    Confidence, HubEvent, RouteRequest, RouteResult, SmartDispatchResult, Task, DASHBOARD_KEY,
    EVENT_TASK_RECEIVED, EVENT_TASK_ROUTING,
};

use crate::config::HubConfig;
use crate::dispatch::{fill_defaults, webhook_payload, Dispatcher};
use crate::error::{HubError, HubResult};
use crate::template::{expand_prompt, TemplateContext};
use crate::text::truncate;
use crate::workspace::{load_soul_file, resolve_workspace};

/// Review runs when enabled and either routing was unsure or the task was expensive.
pub fn should_review(cfg: &HubConfig, route: &RouteResult, task_cost: f64) -> bool {
    let sd = &cfg.smart_dispatch;
    sd.review && (route.confidence == Confidence::Low || task_cost > sd.review_cost_threshold)
}

pub fn build_review_prompt(original_prompt: &str, output: &str, agent_role: &str) -> String {
    format!(
        "Review this agent output for quality and correctness.\n\
         \n\
         Original request: {}\n\
         \n\
         Agent ({}) output:\n\
         {}\n\
         \n\
         Is this output satisfactory? Reply with ONLY a JSON object:\n\
         {{\"ok\":true,\"comment\":\"brief comment\"}} or {{\"ok\":false,\"comment\":\"what's wrong\"}}",
        truncate(original_prompt, 300),
        agent_role,
        truncate(output, 2000),
    )
}

#[derive(Debug, Deserialize)]
struct RawReview {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    comment: String,
}

/// `None` when the reply holds no parseable `{"ok":..,"comment":..}` object.
pub fn parse_review(output: &str) -> Option<(bool, String)> {
    let start = output.find('{')?;
    let end = output.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<RawReview>(&output[start..=end])
        .ok()
        .map(|r| (r.ok, r.comment))
}

impl Dispatcher {
    pub async fn smart_dispatch(&self, req: RouteRequest) -> SmartDispatchResult {
        let source = req.source.clone();
        self.broker.publish(
            DASHBOARD_KEY,
            HubEvent::new(
                EVENT_TASK_RECEIVED,
                json!({ "source": source, "prompt": truncate(&req.prompt, 200) }),
            ),
        );

        let route = self.route(&req).await;
        tracing::info!(
            prompt = %truncate(&req.prompt, 60),
            role = %route.role,
            method = %route.method,
            confidence = %route.confidence,
            "route decision"
        );
        self.broker.publish(
            DASHBOARD_KEY,
            HubEvent::new(
                EVENT_TASK_ROUTING,
                json!({
                    "source": source,
                    "role": route.role,
                    "method": route.method,
                    "confidence": route.confidence,
                }),
            ),
        );

        let role = route.role.clone();
        let mut task = Task::new(req.prompt.clone())
            .with_role(role.clone())
            .with_source(format!("route:{source}"));
        fill_defaults(&self.cfg, &mut task);

        if !role.is_empty() {
            if let Some(soul) = load_soul_file(&self.cfg, &role).await {
                task.system_prompt = soul;
            }
            if let Some(rc) = self.cfg.role(&role) {
                if !rc.model.is_empty() {
                    task.model = rc.model.clone();
                }
                if !rc.permission_mode.is_empty() {
                    task.permission_mode = rc.permission_mode.clone();
                }
            }
        }

        let workspace = resolve_workspace(&self.cfg, &role);
        task.prompt = expand_prompt(
            &task.prompt,
            &TemplateContext {
                role: &role,
                knowledge_dir: &self.cfg.knowledge_dir,
                workspace_dir: &workspace.dir,
                memory: Some(self.memory.as_ref()),
            },
        )
        .await;

        let started_at = Utc::now();
        let result = self.run_single_task(task.clone(), &role).await;

        self.record(&task, &result, &role, started_at).await;
        if let Err(err) = self.history.record_session_activity(&task, &result, &role).await {
            tracing::warn!(task_id = %task.short_id(), error = %err, "record session activity failed");
        }

        if result.status.is_success() {
            self.remember_route(&role, &req.prompt, &result.output).await;
        }

        let mut out = SmartDispatchResult {
            route: route.clone(),
            task: result,
            review_ok: None,
            review: String::new(),
        };

        if should_review(&self.cfg, &route, out.task.cost_usd) && out.task.status.is_success() {
            let (ok, comment) = self.review_output(&req.prompt, &out.task.output, &role).await;
            out.review_ok = Some(ok);
            out.review = comment;
        }

        self.audit(
            "route.dispatch",
            &source,
            &format!(
                "role={} method={} confidence={} prompt={}",
                route.role,
                route.method,
                route.confidence,
                truncate(&req.prompt, 100)
            ),
        )
        .await;

        self.webhooks
            .send_webhooks(out.task.status.as_str(), webhook_payload(&task, &out.task));
        out
    }

    async fn remember_route(&self, role: &str, prompt: &str, output: &str) {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        for (key, value) in [
            ("last_route_output", truncate(output, 500)),
            ("last_route_prompt", truncate(prompt, 200)),
            ("last_route_time", now),
        ] {
            if let Err(err) = self.memory.set(role, key, &value).await {
                tracing::warn!(role = %role, key = %key, error = %err, "set role memory failed");
            }
        }
    }

    /// Coordinator verdict on an agent's output. Errors never block delivery.
    pub async fn review_output(&self, original_prompt: &str, output: &str, agent_role: &str) -> (bool, String) {
        let sd = &self.cfg.smart_dispatch;
        let mut task = Task::new(build_review_prompt(original_prompt, output, agent_role))
            .with_source("route-review");
        task.timeout = sd.classify_timeout.clone();
        task.budget = sd.review_budget;
        fill_defaults(&self.cfg, &mut task);
        if let Some(rc) = self.cfg.role(&sd.coordinator) {
            if !rc.model.is_empty() {
                task.model = rc.model.clone();
            }
        }

        let result = self.run_single_task(task, &sd.coordinator).await;
        if !result.status.is_success() {
            return (true, "review skipped (error)".to_string());
        }
        parse_review(&result.output).unwrap_or_else(|| (true, "review parse error".to_string()))
    }

    /// Sends a cached failure back through routing instead of its original role.
    pub async fn reroute_task(&self, task_id: &str) -> HubResult<SmartDispatchResult> {
        let failed = self
            .failed_task(task_id)
            .ok_or_else(|| HubError::FailedTaskNotFound(task_id.to_string()))?;
        if !self.cfg.smart_dispatch.enabled {
            return Err(HubError::SmartDispatchDisabled);
        }

        let result = self
            .smart_dispatch(RouteRequest::new(failed.prompt, "reroute"))
            .await;
        if result.task.status.is_success() {
            self.forget_failed_task(task_id);
        }

        self.audit(
            "task.reroute",
            "reroute",
            &format!(
                "original={task_id} role={} status={}",
                result.route.role, result.task.status
            ),
        )
        .await;
        Ok(result)
    }
}
