use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use switchyard_types::{Task, ToolCall, ToolResult, TrustLevel};

use crate::collaborators::TrustEngine;
use crate::config::HubConfig;
use crate::text::truncate;

const SUGGESTION_COOLDOWN_HOURS: i64 = 24;

#[derive(Default)]
struct TrustState {
    streaks: HashMap<String, u32>,
    last_suggested: HashMap<String, DateTime<Utc>>,
    promoted: HashMap<String, TrustLevel>,
}

/// Trust levels read from configuration, with in-process success streaks.
pub struct ConfigTrustEngine {
    enabled: bool,
    promote_threshold: u32,
    auto_promote: bool,
    role_levels: HashMap<String, TrustLevel>,
    tool_overrides: HashMap<String, TrustLevel>,
    state: Mutex<TrustState>,
}

impl ConfigTrustEngine {
    pub fn new(cfg: &HubConfig) -> Self {
        let role_levels = cfg
            .roles
            .iter()
            .filter_map(|(name, rc)| TrustLevel::parse(&rc.trust_level).map(|l| (name.clone(), l)))
            .collect();
        let tool_overrides = cfg
            .tools
            .trust_override
            .iter()
            .filter_map(|(tool, raw)| TrustLevel::parse(raw).map(|l| (tool.clone(), l)))
            .collect();
        Self {
            enabled: cfg.trust.enabled,
            promote_threshold: cfg.trust.promote_threshold.max(1),
            auto_promote: cfg.trust.auto_promote,
            role_levels,
            tool_overrides,
            state: Mutex::new(TrustState::default()),
        }
    }

    fn configured_level(&self, role: &str) -> Option<TrustLevel> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .promoted
            .get(role)
            .copied()
            .or_else(|| self.role_levels.get(role).copied())
    }

    /// Effective level for task execution; `auto` when trust is disabled.
    pub fn resolve_trust_level(&self, role: &str) -> TrustLevel {
        if !self.enabled || role.is_empty() {
            return TrustLevel::Auto;
        }
        self.configured_level(role).unwrap_or(TrustLevel::Auto)
    }

    /// Tool override, then role level, then `suggest` for auth-gated tools.
    pub fn tool_trust_level(&self, role: &str, tool: &str, requires_auth: bool) -> TrustLevel {
        if let Some(level) = self.tool_overrides.get(tool) {
            return *level;
        }
        if let Some(level) = self.configured_level(role) {
            return level;
        }
        if requires_auth {
            TrustLevel::Suggest
        } else {
            TrustLevel::Auto
        }
    }

    pub fn consecutive_successes(&self, role: &str) -> u32 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.streaks.get(role).copied().unwrap_or(0)
    }
}

impl TrustEngine for ConfigTrustEngine {
    fn apply_trust_to_task(&self, task: &mut Task, role: &str) -> (TrustLevel, bool) {
        let level = self.resolve_trust_level(role);
        match level {
            TrustLevel::Observe => {
                task.permission_mode = "plan".to_string();
                (level, false)
            }
            TrustLevel::Suggest => (level, true),
            TrustLevel::Auto => (level, false),
        }
    }

    fn filter_tool_call(&self, role: &str, call: &ToolCall, requires_auth: bool) -> Option<ToolResult> {
        let input = serde_json::to_string(&call.input).unwrap_or_default();
        match self.tool_trust_level(role, &call.name, requires_auth) {
            TrustLevel::Observe => {
                tracing::info!(tool = %call.name, role = %role, "tool call observed, not executed");
                Some(ToolResult::ok(
                    &call.id,
                    format!(
                        "[OBSERVE MODE: tool {} would execute with input: {}]",
                        call.name,
                        truncate(&input, 100)
                    ),
                ))
            }
            TrustLevel::Suggest => {
                tracing::info!(tool = %call.name, role = %role, "tool call requires approval");
                Some(ToolResult::ok(
                    &call.id,
                    format!(
                        "[APPROVAL REQUIRED: tool {} with input: {}]",
                        call.name,
                        truncate(&input, 200)
                    ),
                ))
            }
            TrustLevel::Auto => None,
        }
    }

    fn record_outcome(&self, role: &str, success: bool) {
        if role.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let streak = state.streaks.entry(role.to_string()).or_insert(0);
        *streak = if success { *streak + 1 } else { 0 };
    }

    fn check_trust_promotion(&self, role: &str) -> Option<String> {
        if !self.enabled || role.is_empty() {
            return None;
        }
        let level = self.resolve_trust_level(role);
        let next = level.next()?;

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let streak = state.streaks.get(role).copied().unwrap_or(0);
        if streak < self.promote_threshold {
            return None;
        }

        if self.auto_promote {
            state.promoted.insert(role.to_string(), next);
            state.streaks.insert(role.to_string(), 0);
            tracing::info!(role = %role, from = %level, to = %next, "trust auto-promoted");
            return Some(format!(
                "Trust Auto-Promoted [{role}]\n{level} → {next} ({streak} consecutive successes)"
            ));
        }

        let now = Utc::now();
        if let Some(last) = state.last_suggested.get(role) {
            if now - *last < Duration::hours(SUGGESTION_COOLDOWN_HOURS) {
                return None;
            }
        }
        state.last_suggested.insert(role.to_string(), now);
        Some(format!(
            "Trust Promotion Ready [{role}]\n{level} → {next} available ({streak} consecutive successes)"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::config::RoleConfig;

    fn config(level: &str) -> HubConfig {
        let mut cfg = HubConfig::default();
        cfg.trust.enabled = true;
        cfg.trust.promote_threshold = 2;
        cfg.roles.insert(
            "dev".to_string(),
            RoleConfig {
                trust_level: level.to_string(),
                ..RoleConfig::default()
            },
        );
        cfg
    }

    fn call(name: &str) -> ToolCall {
        ToolCall {
            id: "c1".to_string(),
            name: name.to_string(),
            input: json!({"cmd": "ls"}),
        }
    }

    #[test]
    fn observe_forces_plan_mode() {
        let engine = ConfigTrustEngine::new(&config("observe"));
        let mut task = Task::new("x");
        task.permission_mode = "acceptEdits".to_string();
        let (level, confirm) = engine.apply_trust_to_task(&mut task, "dev");
        assert_eq!(level, TrustLevel::Observe);
        assert!(!confirm);
        assert_eq!(task.permission_mode, "plan");
    }

    #[test]
    fn disabled_trust_is_auto() {
        let mut cfg = config("observe");
        cfg.trust.enabled = false;
        let engine = ConfigTrustEngine::new(&cfg);
        assert_eq!(engine.resolve_trust_level("dev"), TrustLevel::Auto);
    }

    #[test]
    fn tool_filter_precedence() {
        let mut cfg = config("suggest");
        cfg.tools
            .trust_override
            .insert("read".to_string(), "auto".to_string());
        let engine = ConfigTrustEngine::new(&cfg);

        assert!(engine.filter_tool_call("dev", &call("read"), false).is_none());
        let mock = engine
            .filter_tool_call("dev", &call("exec"), false)
            .expect("approval");
        assert_eq!(
            mock.content,
            "[APPROVAL REQUIRED: tool exec with input: {\"cmd\":\"ls\"}]"
        );
        assert!(!mock.is_error);

        assert_eq!(
            engine.tool_trust_level("other", "exec", true),
            TrustLevel::Suggest
        );
        assert_eq!(engine.tool_trust_level("other", "exec", false), TrustLevel::Auto);
    }

    #[test]
    fn observe_mock_truncates_input() {
        let engine = ConfigTrustEngine::new(&config("observe"));
        let long = ToolCall {
            id: "c".to_string(),
            name: "write".to_string(),
            input: json!({ "body": "x".repeat(300) }),
        };
        let mock = engine.filter_tool_call("dev", &long, false).expect("mock");
        assert!(mock.content.starts_with("[OBSERVE MODE: tool write would execute with input: "));
        assert!(mock.content.ends_with("...]"));
    }

    #[test]
    fn promotion_is_suggested_once_per_day() {
        let engine = ConfigTrustEngine::new(&config("observe"));
        engine.record_outcome("dev", true);
        assert!(engine.check_trust_promotion("dev").is_none());
        engine.record_outcome("dev", true);
        let msg = engine.check_trust_promotion("dev").expect("promotion");
        assert!(msg.starts_with("Trust Promotion Ready [dev]\nobserve → suggest"));
        engine.record_outcome("dev", true);
        assert!(engine.check_trust_promotion("dev").is_none());
    }

    #[test]
    fn failure_resets_streak_and_auto_promote_applies() {
        let mut cfg = config("observe");
        cfg.trust.auto_promote = true;
        let engine = ConfigTrustEngine::new(&cfg);
        engine.record_outcome("dev", true);
        engine.record_outcome("dev", false);
        assert_eq!(engine.consecutive_successes("dev"), 0);

        engine.record_outcome("dev", true);
        engine.record_outcome("dev", true);
        let msg = engine.check_trust_promotion("dev").expect("promoted");
        assert!(msg.starts_with("Trust Auto-Promoted [dev]"));
        assert_eq!(engine.resolve_trust_level("dev"), TrustLevel::Suggest);
    }
}
