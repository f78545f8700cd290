use std::pin::Pin;
use std::str;

use async_stream::__private::AsyncStream;
use async_stream::try_stream;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

use switchyard_types::{HubEvent, EVENT_OUTPUT_CHUNK};

pub(crate) type DataStream = Pin<Box<dyn Stream<Item = anyhow::Result<Value>> + Send>>;

/// Parses an SSE body into the JSON payloads of its `data:` lines, stopping at `[DONE]`.
pub(crate) fn data_events(resp: reqwest::Response) -> DataStream {
    parse_data_events(resp.bytes_stream())
}

/// Splits raw bytes on `\n` before decoding, so a character split across
/// network chunks is decoded only once its line is complete.
pub(crate) fn parse_data_events<S, B, E>(bytes: S) -> DataStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<anyhow::Error> + Send + 'static,
{
    let mut bytes = Box::pin(bytes);
    let stream: AsyncStream<anyhow::Result<Value>, _> = try_stream! {
        let mut buffer: Vec<u8> = Vec::new();
        'outer: while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|err| -> anyhow::Error { err.into() })?;
            buffer.extend_from_slice(chunk.as_ref());

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = buffer.drain(..=pos).collect();
                let line = str::from_utf8(&raw[..pos])
                    .map_err(|err| anyhow::anyhow!("invalid utf-8 in event stream: {err}"))?
                    .trim_end_matches('\r');
                let Some(payload) = line.strip_prefix("data:") else {
                    continue;
                };
                let payload = payload.trim();
                if payload == "[DONE]" {
                    break 'outer;
                }
                let Ok(value) = serde_json::from_str::<Value>(payload) else {
                    continue;
                };
                yield value;
            }
        }
    };
    Box::pin(stream)
}

pub(crate) async fn forward_chunk(
    sink: Option<&mpsc::Sender<HubEvent>>,
    session_id: &str,
    chunk: &str,
) {
    let Some(sink) = sink else { return };
    let mut event = HubEvent::new(EVENT_OUTPUT_CHUNK, serde_json::json!({ "chunk": chunk }));
    event.session_id = session_id.to_string();
    // The receiver is gone once the task finished; dropping the chunk is fine then.
    let _ = sink.send(event).await;
}

pub(crate) fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut end = max_len;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    input[..end].to_string()
}

/// `HTTP <status>: <body>` keeps the status visible to transient-error classification.
pub(crate) fn http_failure(status: reqwest::StatusCode, body: &str) -> String {
    format!("HTTP {}: {}", status.as_u16(), truncate_for_error(body, 500))
}

pub(crate) fn extract_api_error(value: &Value) -> Option<String> {
    let error = value.get("error")?;
    if let Some(message) = error.get("message").and_then(|v| v.as_str()) {
        return match error.get("type").and_then(|v| v.as_str()) {
            Some(kind) if !kind.is_empty() => Some(format!("{kind}: {message}")),
            _ => Some(message.to_string()),
        };
    }
    error.as_str().map(|s| s.to_string())
}

pub(crate) fn parse_tool_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
