use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const EVENT_STARTED: &str = "started";
pub const EVENT_PROGRESS: &str = "progress";
pub const EVENT_OUTPUT_CHUNK: &str = "output_chunk";
pub const EVENT_COMPLETED: &str = "completed";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_TASK_QUEUED: &str = "task_queued";
pub const EVENT_TASK_RECEIVED: &str = "task_received";
pub const EVENT_TASK_ROUTING: &str = "task_routing";
pub const EVENT_TOOL_CALL: &str = "tool_call";
pub const EVENT_TOOL_RESULT: &str = "tool_result";
pub const EVENT_PROVIDER_FAILOVER: &str = "provider_failover";
pub const EVENT_TRUST_PROMOTION: &str = "trust_promotion";

/// Broadcast key every dashboard listener subscribes to.
pub const DASHBOARD_KEY: &str = "__dashboard__";
pub const TRUST_KEY: &str = "trust";

/// Streaming event published per task (and to the dashboard key).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub task_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl HubEvent {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            task_id: String::new(),
            session_id: String::new(),
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn for_task(
        event_type: impl Into<String>,
        task_id: impl Into<String>,
        session_id: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            session_id: session_id.into(),
            ..Self::new(event_type, data)
        }
    }
}
