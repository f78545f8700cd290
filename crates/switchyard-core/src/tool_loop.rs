use std::collections::BTreeSet;
use std::time::Instant;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use switchyard_providers::{ProviderRegistry, ProviderResult};
use switchyard_tools::{resolve_allowed_tools, LoopDetector, RoleToolPolicy, ToolRegistry, ToolSchema};
use switchyard_types::{
    HubEvent, Message, Task, ToolCall, ToolResult, EVENT_TOOL_CALL, EVENT_TOOL_RESULT,
};

use crate::circuit::CircuitRegistry;
use crate::collaborators::{StreamBroker, TrustEngine};
use crate::config::HubConfig;
use crate::failover::{build_provider_request, execute_with_provider, resolve_provider_name};

pub const DEFAULT_MAX_TOOL_ITERATIONS: usize = 10;

/// Everything one agentic run needs, borrowed from the dispatcher.
pub struct ToolLoop<'a> {
    pub cfg: &'a HubConfig,
    pub providers: &'a ProviderRegistry,
    pub circuits: &'a CircuitRegistry,
    pub tools: Option<&'a ToolRegistry>,
    pub trust: &'a dyn TrustEngine,
    pub broker: &'a dyn StreamBroker,
}

impl ToolLoop<'_> {
    /// Runs the task, letting a tool-capable provider call registered tools
    /// until it produces a final answer.
    ///
    /// Falls back to plain failover execution when there is no tool registry,
    /// the provider cannot use tools, or no tools are registered.
    pub async fn run(
        &self,
        task: &Task,
        role: &str,
        events: Option<&mpsc::Sender<HubEvent>>,
        cancel: &CancellationToken,
    ) -> ProviderResult {
        let Some(tools) = self.tools else {
            return self.plain(task, role, events).await;
        };

        let provider_name = resolve_provider_name(self.cfg, task, role);
        let provider = match self.providers.get(&provider_name).await {
            Ok(provider) => provider,
            Err(err) => return ProviderResult::failure(err.to_string()),
        };
        let Some(tool_provider) = provider.as_tool_capable() else {
            return self.plain(task, role, events).await;
        };
        let schemas = tools.list().await;
        if schemas.is_empty() {
            return self.plain(task, role, events).await;
        }

        let allowed = self.allowed_tools(task, tools.names().await);
        let mut req = build_provider_request(self.cfg, task, role, &provider_name, events.cloned());
        req.tools = tools.definitions().await;

        let mut detector = LoopDetector::default();
        let max_iter = match self.cfg.tools.max_iterations {
            0 => DEFAULT_MAX_TOOL_ITERATIONS,
            n => n,
        };
        let mut messages: Vec<Message> = Vec::new();

        for i in 0..max_iter {
            req.messages = messages.clone();
            let result = match tool_provider.execute_with_tools(req.clone()).await {
                Ok(result) => result,
                Err(err) => return ProviderResult::failure(err.to_string()),
            };
            if result.is_error {
                return result;
            }
            if !result.wants_tools() {
                let mut result = result;
                result.provider = provider_name;
                return result;
            }

            for call in &result.tool_calls {
                self.broker.publish_multi(
                    &[task.id.as_str(), task.session_id.as_str()],
                    HubEvent::for_task(
                        EVENT_TOOL_CALL,
                        &task.id,
                        &task.session_id,
                        json!({ "id": call.id, "name": call.name }),
                    ),
                );
            }

            let mut results = Vec::with_capacity(result.tool_calls.len());
            for call in &result.tool_calls {
                let outcome = self
                    .handle_call(task, call, i, &schemas, allowed.as_ref(), &mut detector, tools, cancel)
                    .await;
                results.push(outcome);
            }

            messages.push(Message::assistant_tool_calls(&result.output, &result.tool_calls));
            messages.push(Message::tool_results(results));
        }

        tracing::warn!(task_id = %task.id, max_iter, "tool loop exhausted");
        let mut result = ProviderResult::failure(format!("max tool iterations ({max_iter}) reached"));
        result.provider = provider_name;
        result
    }

    async fn plain(
        &self,
        task: &Task,
        role: &str,
        events: Option<&mpsc::Sender<HubEvent>>,
    ) -> ProviderResult {
        execute_with_provider(self.cfg, task, role, self.providers, self.circuits, events).await
    }

    fn allowed_tools(&self, task: &Task, registered: Vec<String>) -> Option<BTreeSet<String>> {
        if task.role.is_empty() {
            return None;
        }
        let policy = self
            .cfg
            .role(&task.role)
            .map(|rc| rc.tools.clone())
            .unwrap_or_else(RoleToolPolicy::default);
        Some(resolve_allowed_tools(
            &policy,
            &self.cfg.tools.default_profile,
            &self.cfg.tools.profiles,
            &registered,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_call(
        &self,
        task: &Task,
        call: &ToolCall,
        iteration: usize,
        schemas: &[ToolSchema],
        allowed: Option<&BTreeSet<String>>,
        detector: &mut LoopDetector,
        tools: &ToolRegistry,
        cancel: &CancellationToken,
    ) -> ToolResult {
        if let Some(allowed) = allowed {
            if !allowed.contains(&call.name) {
                tracing::warn!(tool = %call.name, role = %task.role, "tool call blocked by policy");
                return ToolResult::error(
                    &call.id,
                    format!(
                        "error: tool {:?} not allowed by policy for role {:?}",
                        call.name, task.role
                    ),
                );
            }
        }

        if let Some(msg) = detector.check(&call.name, &call.input) {
            tracing::warn!(tool = %call.name, "tool loop detected");
            return ToolResult::error(&call.id, msg);
        }
        if iteration > 2 {
            if let Some(msg) = detector.detect_pattern() {
                tracing::warn!(tool = %call.name, "tool pattern detected");
                return ToolResult::error(&call.id, msg);
            }
        }
        detector.record(&call.name, &call.input);

        let requires_auth = schemas
            .iter()
            .find(|s| s.name == call.name)
            .is_some_and(|s| s.requires_auth);
        if let Some(mock) = self.trust.filter_tool_call(&task.role, call, requires_auth) {
            return mock;
        }

        let Some(tool) = tools.get(&call.name).await else {
            return ToolResult::error(&call.id, format!("error: tool {:?} not found", call.name));
        };

        let started = Instant::now();
        let outcome = tool.execute_with_cancel(call.input.clone(), cancel.clone()).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        let result = match outcome {
            Ok(output) => ToolResult::ok(&call.id, output),
            Err(err) => ToolResult::error(&call.id, format!("error: {err}")),
        };

        self.broker.publish_multi(
            &[task.id.as_str(), task.session_id.as_str()],
            HubEvent::for_task(
                EVENT_TOOL_RESULT,
                &task.id,
                &task.session_id,
                json!({
                    "id": call.id,
                    "name": call.name,
                    "duration": duration_ms,
                    "isError": result.is_error,
                }),
            ),
        );
        result
    }
}
