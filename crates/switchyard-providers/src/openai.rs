use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};

use switchyard_types::{ContentBlock, Message, MessageRole, ProviderInfo, StopReason, ToolCall};

use crate::sse::{
    data_events, extract_api_error, forward_chunk, http_failure, parse_tool_arguments,
};
use crate::{Provider, ProviderRequest, ProviderResult, ToolCapableProvider};

/// Chat-completions backend for OpenAI, Ollama, vLLM and other compatible servers.
pub struct OpenAICompatibleProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: Client,
}

impl OpenAICompatibleProvider {
    pub fn new(name: &str, base_url: &str, api_key: Option<String>, default_model: &str) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.or_else(|| {
                if name == "openai" {
                    crate::env_key("OPENAI_API_KEY")
                } else {
                    None
                }
            }),
            default_model: default_model.to_string(),
            client: Client::new(),
        }
    }

    async fn run(&self, req: ProviderRequest) -> anyhow::Result<ProviderResult> {
        let model = if req.model.trim().is_empty() {
            self.default_model.as_str()
        } else {
            req.model.trim()
        };
        if model.is_empty() {
            anyhow::bail!("no model specified for provider `{}`", self.name);
        }

        let streaming = req.events.is_some();
        let mut body = json!({
            "model": model,
            "messages": wire_messages(&req),
            "stream": streaming,
        });
        let wire_tools = req
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.input_schema,
                    }
                })
            })
            .collect::<Vec<_>>();
        if !wire_tools.is_empty() {
            body["tools"] = Value::Array(wire_tools);
        }
        if streaming {
            body["stream_options"] = json!({"include_usage": true});
        }

        let mut http = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(api_key) = &self.api_key {
            http = http.bearer_auth(api_key);
        }

        let start = Instant::now();
        let resp = http.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let mut result = ProviderResult::failure(http_failure(status, &text));
            result.duration_ms = start.elapsed().as_millis() as u64;
            return Ok(result);
        }

        let mut result = if streaming {
            self.read_stream(resp, &req).await?
        } else {
            let value: Value = resp.json().await?;
            parse_response(&value)
        };
        result.duration_ms = start.elapsed().as_millis() as u64;
        result.provider_ms = result.duration_ms;
        if result.tokens_in > 0 || result.tokens_out > 0 {
            result.cost_usd = estimate_cost(result.tokens_in, result.tokens_out);
        }
        Ok(result)
    }

    async fn read_stream(
        &self,
        resp: reqwest::Response,
        req: &ProviderRequest,
    ) -> anyhow::Result<ProviderResult> {
        #[derive(Default)]
        struct PendingCall {
            id: String,
            name: String,
            args: String,
        }

        let mut events = data_events(resp);
        let mut result = ProviderResult::default();
        let mut pending: Vec<PendingCall> = Vec::new();
        let mut finish_reason = String::new();

        while let Some(value) = events.next().await {
            let value = value?;
            if let Some(detail) = extract_api_error(&value) {
                return Ok(ProviderResult::failure(detail));
            }
            if result.session_id.is_empty() {
                if let Some(id) = value.get("id").and_then(|v| v.as_str()) {
                    result.session_id = id.to_string();
                }
            }
            if let Some((tokens_in, tokens_out)) = extract_usage(&value) {
                result.tokens_in = tokens_in;
                result.tokens_out = tokens_out;
            }
            let Some(choice) = value.get("choices").and_then(|v| v.get(0)) else {
                continue;
            };
            if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
                finish_reason = reason.to_string();
            }
            let delta = choice.get("delta").cloned().unwrap_or_default();
            if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    result.output.push_str(text);
                    forward_chunk(req.events.as_ref(), &req.session_id, text).await;
                }
            }
            if let Some(calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                for call in calls {
                    let idx = call.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                    while pending.len() <= idx {
                        pending.push(PendingCall::default());
                    }
                    let slot = &mut pending[idx];
                    if let Some(id) = call.get("id").and_then(|v| v.as_str()) {
                        slot.id = id.to_string();
                    }
                    let function = call.get("function").cloned().unwrap_or_default();
                    if let Some(name) = function.get("name").and_then(|v| v.as_str()) {
                        slot.name = name.to_string();
                    }
                    if let Some(args) = function.get("arguments").and_then(|v| v.as_str()) {
                        slot.args.push_str(args);
                    }
                }
            }
        }

        result.tool_calls = pending
            .into_iter()
            .filter(|call| !call.id.is_empty())
            .map(|call| ToolCall {
                input: parse_tool_arguments(&call.args),
                id: call.id,
                name: call.name,
            })
            .collect();
        result.stop_reason = map_finish_reason(&finish_reason);
        Ok(result)
    }
}

#[async_trait]
impl Provider for OpenAICompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "openai-compatible"
    }

    async fn execute(&self, req: ProviderRequest) -> anyhow::Result<ProviderResult> {
        self.run(req).await
    }

    fn as_tool_capable(&self) -> Option<&dyn ToolCapableProvider> {
        Some(self)
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.name.clone(),
            kind: self.kind().to_string(),
            model: self.default_model.clone(),
            tools: true,
        }
    }
}

#[async_trait]
impl ToolCapableProvider for OpenAICompatibleProvider {
    async fn execute_with_tools(&self, req: ProviderRequest) -> anyhow::Result<ProviderResult> {
        self.run(req).await
    }
}

fn wire_messages(req: &ProviderRequest) -> Vec<Value> {
    let mut out = Vec::with_capacity(req.messages.len() + 2);
    if !req.system_prompt.is_empty() {
        out.push(json!({"role": "system", "content": req.system_prompt}));
    }
    out.push(json!({"role": "user", "content": req.prompt}));
    for message in &req.messages {
        out.extend(convert_message(message));
    }
    out
}

/// Tool results become one `tool` message each; assistant tool_use blocks become `tool_calls`.
fn convert_message(message: &Message) -> Vec<Value> {
    match message.role {
        MessageRole::Assistant => {
            let calls = message
                .content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolUse { id, name, input } => Some(json!({
                        "id": id,
                        "type": "function",
                        "function": {"name": name, "arguments": input.to_string()},
                    })),
                    _ => None,
                })
                .collect::<Vec<_>>();
            let mut msg = json!({"role": "assistant", "content": message.text()});
            if !calls.is_empty() {
                msg["tool_calls"] = Value::Array(calls);
            }
            vec![msg]
        }
        MessageRole::User => {
            let results = message
                .content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => Some(json!({
                        "role": "tool",
                        "tool_call_id": tool_use_id,
                        "content": content,
                    })),
                    _ => None,
                })
                .collect::<Vec<_>>();
            if results.is_empty() {
                vec![json!({"role": "user", "content": message.text()})]
            } else {
                results
            }
        }
    }
}

fn parse_response(value: &Value) -> ProviderResult {
    if let Some(detail) = extract_api_error(value) {
        return ProviderResult::failure(detail);
    }
    let mut result = ProviderResult {
        session_id: value
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        ..ProviderResult::default()
    };
    if let Some(choice) = value.get("choices").and_then(|v| v.get(0)) {
        let message = choice.get("message").cloned().unwrap_or_default();
        result.output = message
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        result.tool_calls = message
            .get("tool_calls")
            .and_then(|v| v.as_array())
            .map(|calls| {
                calls
                    .iter()
                    .map(|call| ToolCall {
                        id: call["id"].as_str().unwrap_or_default().to_string(),
                        name: call["function"]["name"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                        input: parse_tool_arguments(
                            call["function"]["arguments"].as_str().unwrap_or_default(),
                        ),
                    })
                    .collect()
            })
            .unwrap_or_default();
        result.stop_reason = map_finish_reason(
            choice
                .get("finish_reason")
                .and_then(|v| v.as_str())
                .unwrap_or_default(),
        );
    }
    if let Some((tokens_in, tokens_out)) = extract_usage(value) {
        result.tokens_in = tokens_in;
        result.tokens_out = tokens_out;
    }
    result
}

fn map_finish_reason(reason: &str) -> StopReason {
    match reason {
        "tool_calls" | "function_call" => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    }
}

fn extract_usage(value: &Value) -> Option<(u64, u64)> {
    let usage = value.get("usage").filter(|v| v.is_object())?;
    let prompt = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    Some((prompt, completion))
}

/// Rough estimate at GPT-4o list prices.
fn estimate_cost(tokens_in: u64, tokens_out: u64) -> f64 {
    tokens_in as f64 * 2.50 / 1_000_000.0 + tokens_out as f64 * 10.00 / 1_000_000.0
}
