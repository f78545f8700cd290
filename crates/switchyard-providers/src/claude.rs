use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};

use switchyard_types::{ProviderInfo, StopReason, ToolCall};

use crate::sse::{
    data_events, extract_api_error, forward_chunk, http_failure, parse_tool_arguments,
};
use crate::{
    Provider, ProviderConfig, ProviderRequest, ProviderResult, ToolCapableProvider,
    DEFAULT_CLAUDE_BASE_URL, DEFAULT_CLAUDE_MAX_TOKENS, DEFAULT_CLAUDE_MODEL,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API backend.
pub struct ClaudeApiProvider {
    name: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
    base_url: String,
    client: Client,
}

impl ClaudeApiProvider {
    pub fn from_config(name: &str, cfg: &ProviderConfig) -> Self {
        Self {
            name: name.to_string(),
            api_key: crate::non_placeholder(&cfg.api_key)
                .or_else(|| crate::env_key("ANTHROPIC_API_KEY")),
            model: if cfg.model.is_empty() {
                DEFAULT_CLAUDE_MODEL.to_string()
            } else {
                cfg.model.clone()
            },
            max_tokens: if cfg.max_tokens == 0 {
                DEFAULT_CLAUDE_MAX_TOKENS
            } else {
                cfg.max_tokens
            },
            base_url: if cfg.base_url.is_empty() {
                DEFAULT_CLAUDE_BASE_URL.to_string()
            } else {
                cfg.base_url.trim_end_matches('/').to_string()
            },
            client: Client::new(),
        }
    }

    fn request_body(&self, req: &ProviderRequest, model: &str) -> anyhow::Result<Value> {
        let mut messages = vec![json!({"role": "user", "content": req.prompt})];
        for message in &req.messages {
            messages.push(serde_json::to_value(message)?);
        }
        let mut body = json!({
            "model": model,
            "max_tokens": self.max_tokens,
            "messages": messages,
        });
        if !req.system_prompt.is_empty() {
            body["system"] = json!(req.system_prompt);
        }
        if !req.tools.is_empty() {
            body["tools"] = Value::Array(
                req.tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "name": tool.name,
                            "description": tool.description,
                            "input_schema": tool.input_schema,
                        })
                    })
                    .collect(),
            );
        }
        if req.events.is_some() {
            body["stream"] = json!(true);
        }
        Ok(body)
    }

    async fn run(&self, req: ProviderRequest) -> anyhow::Result<ProviderResult> {
        let model = if req.model.trim().is_empty() {
            self.model.clone()
        } else {
            req.model.trim().to_string()
        };
        let body = self.request_body(&req, &model)?;

        let mut http = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);
        if let Some(key) = &self.api_key {
            http = http.header("x-api-key", key);
        }

        let start = Instant::now();
        let resp = http.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Ok(ProviderResult::failure(http_failure(status, &text)));
        }

        let mut result = if req.events.is_some() {
            read_stream(resp, &req).await?
        } else {
            let value: Value = resp.json().await?;
            parse_message(&value)
        };
        result.duration_ms = start.elapsed().as_millis() as u64;
        result.provider_ms = result.duration_ms;
        result.cost_usd = calculate_cost(&model, result.tokens_in, result.tokens_out);
        Ok(result)
    }
}

#[async_trait]
impl Provider for ClaudeApiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "claude-api"
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
            model: self.model.clone(),
            tools: true,
        }
    }
}

#[async_trait]
impl ToolCapableProvider for ClaudeApiProvider {
    async fn execute_with_tools(&self, req: ProviderRequest) -> anyhow::Result<ProviderResult> {
        self.run(req).await
    }
}

fn parse_message(value: &Value) -> ProviderResult {
    if let Some(detail) = extract_api_error(value) {
        return ProviderResult::failure(detail);
    }
    let mut text = Vec::new();
    let mut tool_calls = Vec::new();
    for block in value
        .get("content")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
    {
        match block.get("type").and_then(|v| v.as_str()) {
            Some("text") => {
                text.push(block["text"].as_str().unwrap_or_default().to_string());
            }
            Some("tool_use") => tool_calls.push(ToolCall {
                id: block["id"].as_str().unwrap_or_default().to_string(),
                name: block["name"].as_str().unwrap_or_default().to_string(),
                input: block.get("input").cloned().unwrap_or_else(|| json!({})),
            }),
            _ => {}
        }
    }
    ProviderResult {
        output: text.join("\n"),
        session_id: value["id"].as_str().unwrap_or_default().to_string(),
        tokens_in: value["usage"]["input_tokens"].as_u64().unwrap_or(0),
        tokens_out: value["usage"]["output_tokens"].as_u64().unwrap_or(0),
        stop_reason: map_stop_reason(value["stop_reason"].as_str().unwrap_or_default()),
        tool_calls,
        ..ProviderResult::default()
    }
}

async fn read_stream(
    resp: reqwest::Response,
    req: &ProviderRequest,
) -> anyhow::Result<ProviderResult> {
    let mut events = data_events(resp);
    let mut result = ProviderResult::default();
    let mut current: Option<(String, String)> = None;
    let mut input_buffer = String::new();

    while let Some(value) = events.next().await {
        let value = value?;
        if let Some(detail) = extract_api_error(&value) {
            return Ok(ProviderResult::failure(detail));
        }
        match value.get("type").and_then(|v| v.as_str()).unwrap_or_default() {
            "message_start" => {
                result.session_id = value["message"]["id"].as_str().unwrap_or_default().to_string();
                result.tokens_in = value["message"]["usage"]["input_tokens"]
                    .as_u64()
                    .unwrap_or(0);
            }
            "content_block_start" => {
                let block = &value["content_block"];
                if block["type"].as_str() == Some("tool_use") {
                    current = Some((
                        block["id"].as_str().unwrap_or_default().to_string(),
                        block["name"].as_str().unwrap_or_default().to_string(),
                    ));
                    input_buffer.clear();
                }
            }
            "content_block_delta" => {
                let delta = &value["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        let text = delta["text"].as_str().unwrap_or_default();
                        if !text.is_empty() {
                            result.output.push_str(text);
                            forward_chunk(req.events.as_ref(), &req.session_id, text).await;
                        }
                    }
                    Some("input_json_delta") => {
                        input_buffer.push_str(delta["partial_json"].as_str().unwrap_or_default());
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                if let Some((id, name)) = current.take() {
                    result.tool_calls.push(ToolCall {
                        id,
                        name,
                        input: parse_tool_arguments(&input_buffer),
                    });
                }
            }
            "message_delta" => {
                if let Some(reason) = value["delta"]["stop_reason"].as_str() {
                    result.stop_reason = map_stop_reason(reason);
                }
                if let Some(out) = value["usage"]["output_tokens"].as_u64() {
                    result.tokens_out = out;
                }
            }
            "message_stop" => break,
            _ => {}
        }
    }
    Ok(result)
}

fn map_stop_reason(reason: &str) -> StopReason {
    if reason == "tool_use" {
        StopReason::ToolUse
    } else {
        StopReason::EndTurn
    }
}

/// List prices per million tokens; unknown models are billed as sonnet.
fn calculate_cost(model: &str, tokens_in: u64, tokens_out: u64) -> f64 {
    let (input_per_m, output_per_m) = if model.contains("opus") {
        (15.0, 75.0)
    } else if model.contains("haiku") {
        (0.80, 4.0)
    } else {
        (3.0, 15.0)
    };
    tokens_in as f64 / 1_000_000.0 * input_per_m + tokens_out as f64 / 1_000_000.0 * output_per_m
}
