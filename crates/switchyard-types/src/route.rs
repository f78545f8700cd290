use serde::{Deserialize, Serialize};

use crate::task::TaskResult;

/// Free-text input plus the channel context it arrived on.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RouteRequest {
    pub prompt: String,
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub guild_id: String,
}

impl RouteRequest {
    pub fn new(prompt: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            source: source.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum RouteMethod {
    Binding,
    Keyword,
    Llm,
    LlmEscalated,
    Coordinator,
    Default,
}

impl RouteMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            RouteMethod::Binding => "binding",
            RouteMethod::Keyword => "keyword",
            RouteMethod::Llm => "llm",
            RouteMethod::LlmEscalated => "llm-escalated",
            RouteMethod::Coordinator => "coordinator",
            RouteMethod::Default => "default",
        }
    }
}

impl std::fmt::Display for RouteMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        }
    }

    /// Lenient parse for model-reported confidence; empty or unknown is `medium`.
    pub fn parse_loose(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "high" => Confidence::High,
            "low" => Confidence::Low,
            _ => Confidence::Medium,
        }
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteResult {
    pub role: String,
    pub method: RouteMethod,
    pub confidence: Confidence,
    pub reason: String,
}

impl RouteResult {
    pub fn new(
        role: impl Into<String>,
        method: RouteMethod,
        confidence: Confidence,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            role: role.into(),
            method,
            confidence,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmartDispatchResult {
    pub route: RouteResult,
    pub task: TaskResult,
    /// `None` when no review ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_ok: Option<bool>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub review: String,
}
