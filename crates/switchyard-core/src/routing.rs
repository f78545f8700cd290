//! Four-tier role routing: bindings, keywords, LLM classification, default.

use regex::Regex;
use serde::Deserialize;

use switchyard_types::{Confidence, RouteMethod, RouteRequest, RouteResult, Task};

use crate::config::{HubConfig, SmartDispatchConfig};
use crate::dispatch::{fill_defaults, Dispatcher};

const FALLBACK_COORDINATOR: &str = "coordinator";

/// First binding whose channel filter passes and whose user, channel or guild id matches.
pub fn match_binding(sd: &SmartDispatchConfig, req: &RouteRequest) -> Option<RouteResult> {
    sd.bindings
        .iter()
        .filter(|b| b.channel.is_empty() || b.channel == req.source)
        .find(|b| {
            (!b.user_id.is_empty() && b.user_id == req.user_id)
                || (!b.channel_id.is_empty() && b.channel_id == req.channel_id)
                || (!b.guild_id.is_empty() && b.guild_id == req.guild_id)
        })
        .map(|b| {
            RouteResult::new(
                b.role.clone(),
                RouteMethod::Binding,
                Confidence::High,
                format!("matched binding rule for channel={}", b.channel),
            )
        })
}

/// Routing rules (keywords, then patterns) ahead of role keywords.
pub fn match_keywords(cfg: &HubConfig, prompt: &str) -> Option<RouteResult> {
    let lower = prompt.to_lowercase();

    for rule in &cfg.smart_dispatch.rules {
        if let Some(kw) = rule
            .keywords
            .iter()
            .find(|kw| lower.contains(&kw.to_lowercase()))
        {
            return Some(RouteResult::new(
                rule.role.clone(),
                RouteMethod::Keyword,
                Confidence::High,
                format!("matched rule keyword {kw:?}"),
            ));
        }
        for pattern in &rule.patterns {
            let Ok(re) = Regex::new(&format!("(?i){pattern}")) else {
                continue;
            };
            if re.is_match(prompt) {
                return Some(RouteResult::new(
                    rule.role.clone(),
                    RouteMethod::Keyword,
                    Confidence::High,
                    format!("matched rule pattern {pattern:?}"),
                ));
            }
        }
    }

    let mut roles: Vec<_> = cfg.roles.iter().collect();
    roles.sort_by(|a, b| a.0.cmp(b.0));
    for (name, rc) in roles {
        if let Some(kw) = rc
            .keywords
            .iter()
            .find(|kw| !kw.is_empty() && lower.contains(&kw.to_lowercase()))
        {
            return Some(RouteResult::new(
                name.clone(),
                RouteMethod::Keyword,
                Confidence::Medium,
                format!("matched role keyword {kw:?}"),
            ));
        }
    }
    None
}

pub fn build_classify_prompt(cfg: &HubConfig, prompt: &str) -> String {
    let mut names: Vec<&String> = cfg.roles.keys().collect();
    names.sort();

    let role_lines: Vec<String> = names
        .iter()
        .map(|name| {
            let rc = &cfg.roles[name.as_str()];
            let desc = if rc.description.is_empty() {
                "(no description)"
            } else {
                rc.description.as_str()
            };
            let keywords = if rc.keywords.is_empty() {
                String::new()
            } else {
                format!(" [keywords: {}]", rc.keywords.join(", "))
            };
            format!("- {name}: {desc}{keywords}")
        })
        .collect();
    let valid_keys: Vec<&str> = names.iter().map(|n| n.as_str()).collect();

    format!(
        "You are a task router. Given a user request, decide which team member should handle it.\n\
         \n\
         Available roles:\n\
         {}\n\
         \n\
         IMPORTANT: The \"role\" field in your response MUST be one of these exact keys: {}\n\
         Do NOT use translated names, functional titles, or any other values.\n\
         \n\
         User request: {}\n\
         \n\
         Reply with ONLY a JSON object (no markdown, no explanation):\n\
         {{\"role\":\"<exact_role_key>\",\"confidence\":\"high|medium|low\",\"reason\":\"<brief reason>\"}}\n\
         \n\
         If no role is clearly appropriate, use {:?} as the default.",
        role_lines.join("\n"),
        valid_keys.join(", "),
        prompt,
        cfg.smart_dispatch.default_role,
    )
}

#[derive(Debug, Deserialize)]
struct RawRoute {
    #[serde(default)]
    role: String,
    #[serde(default)]
    confidence: String,
    #[serde(default)]
    reason: String,
}

/// Reads the classifier reply. Unparseable output degrades to the default role at low confidence.
pub fn parse_llm_route(output: &str, default_role: &str) -> RouteResult {
    let span = match (output.find('{'), output.rfind('}')) {
        (Some(start), Some(end)) if end > start => &output[start..=end],
        _ => {
            return RouteResult::new(
                default_role,
                RouteMethod::Llm,
                Confidence::Low,
                "could not parse LLM response",
            )
        }
    };
    match serde_json::from_str::<RawRoute>(span) {
        Ok(raw) => RouteResult::new(
            if raw.role.is_empty() {
                default_role.to_string()
            } else {
                raw.role
            },
            RouteMethod::Llm,
            Confidence::parse_loose(&raw.confidence),
            raw.reason,
        ),
        Err(err) => RouteResult::new(
            default_role,
            RouteMethod::Llm,
            Confidence::Low,
            format!("JSON parse error: {err}"),
        ),
    }
}

impl Dispatcher {
    /// Picks a role for free text. Never fails; the last resort is the default role.
    pub async fn route(&self, req: &RouteRequest) -> RouteResult {
        let sd = &self.cfg.smart_dispatch;

        if let Some(result) = match_binding(sd, req) {
            if self.cfg.roles.contains_key(&result.role) {
                return result;
            }
            tracing::warn!(role = %result.role, "binding matched role not in config, falling through");
        }

        if let Some(result) = match_keywords(&self.cfg, &req.prompt) {
            if self.cfg.roles.contains_key(&result.role) {
                return result;
            }
            tracing::warn!(role = %result.role, "keyword matched role not in config, falling through");
        }

        if sd.fallback == FALLBACK_COORDINATOR {
            return RouteResult::new(
                sd.default_role.clone(),
                RouteMethod::Coordinator,
                Confidence::High,
                "fallback mode set to coordinator",
            );
        }

        match self.classify_by_llm(&req.prompt).await {
            Ok(mut result) => {
                if !self.cfg.roles.contains_key(&result.role) {
                    result.role = sd.default_role.clone();
                    result.confidence = Confidence::Low;
                    result.reason.push_str(" (role not found, using default)");
                }
                result
            }
            Err(err) => {
                tracing::warn!(error = %err, "LLM classify error, using default");
                RouteResult::new(
                    sd.default_role.clone(),
                    RouteMethod::Default,
                    Confidence::Low,
                    format!("LLM classification failed: {err}"),
                )
            }
        }
    }

    /// Asks the coordinator, escalating to the stronger model on a low-confidence answer.
    pub async fn classify_by_llm(&self, prompt: &str) -> anyhow::Result<RouteResult> {
        let sd = &self.cfg.smart_dispatch;
        let mut task = Task::new(build_classify_prompt(&self.cfg, prompt)).with_source("route-classify");
        task.timeout = sd.classify_timeout.clone();
        task.budget = sd.classify_budget;
        fill_defaults(&self.cfg, &mut task);
        task.model = sd.classify_model.clone();

        let result = self
            .run_single_task_in(&self.route_sem, task.clone(), &sd.coordinator)
            .await;
        if !result.status.is_success() {
            anyhow::bail!("classification failed: {}", result.error);
        }
        let parsed = parse_llm_route(&result.output, &sd.default_role);

        if parsed.confidence == Confidence::Low && !sd.escalation_model.is_empty() {
            tracing::info!(
                reason = %parsed.reason,
                model = %sd.escalation_model,
                "route: confidence low, escalating"
            );
            task.model = sd.escalation_model.clone();
            let escalated = self
                .run_single_task_in(&self.route_sem, task, &sd.coordinator)
                .await;
            if escalated.status.is_success() {
                let mut second = parse_llm_route(&escalated.output, &sd.default_role);
                second.method = RouteMethod::LlmEscalated;
                return Ok(second);
            }
        }
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use switchyard_providers::{Provider, ProviderRegistry, ProviderRequest, ProviderResult};

    use super::*;
    use crate::config::{RoleConfig, RoutingBinding, RoutingRule};

    fn routed_config() -> HubConfig {
        let mut cfg = HubConfig::default();
        cfg.default_provider = "scripted".to_string();
        cfg.smart_dispatch.enabled = true;
        cfg.smart_dispatch.coordinator = "lead".to_string();
        cfg.smart_dispatch.default_role = "lead".to_string();
        for (name, desc, keywords) in [
            ("lead", "Coordinates the team", vec![]),
            ("dev", "Writes code", vec!["rust", "bug"]),
            ("writer", "", vec!["blog"]),
        ] {
            cfg.roles.insert(
                name.to_string(),
                RoleConfig {
                    description: desc.to_string(),
                    keywords: keywords.into_iter().map(String::from).collect(),
                    ..RoleConfig::default()
                },
            );
        }
        cfg
    }

    /// Replies from a queue of canned outputs and records the models it saw.
    struct ScriptedClassifier {
        replies: Mutex<Vec<String>>,
        models: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    impl ScriptedClassifier {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().rev().map(|s| s.to_string()).collect()),
                models: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Provider for ScriptedClassifier {
        fn name(&self) -> &str {
            "scripted"
        }

        fn kind(&self) -> &'static str {
            "scripted"
        }

        async fn execute(&self, req: ProviderRequest) -> anyhow::Result<ProviderResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.models.lock().expect("models").push(req.model);
            let reply = self.replies.lock().expect("replies").pop();
            Ok(match reply {
                Some(text) => ProviderResult::text(text),
                None => ProviderResult::failure("no scripted reply"),
            })
        }
    }

    async fn dispatcher(cfg: HubConfig, provider: Arc<ScriptedClassifier>) -> Dispatcher {
        let providers = ProviderRegistry::new();
        providers.register("scripted", provider).await;
        Dispatcher::new(cfg, providers)
    }

    #[test]
    fn binding_requires_channel_and_an_id() {
        let mut sd = SmartDispatchConfig::default();
        sd.bindings = vec![
            RoutingBinding {
                channel: "discord".to_string(),
                guild_id: "g1".to_string(),
                role: "dev".to_string(),
                ..RoutingBinding::default()
            },
            RoutingBinding {
                user_id: "u9".to_string(),
                role: "writer".to_string(),
                ..RoutingBinding::default()
            },
        ];

        let mut req = RouteRequest::new("hi", "telegram");
        req.guild_id = "g1".to_string();
        assert!(match_binding(&sd, &req).is_none());

        req.source = "discord".to_string();
        let hit = match_binding(&sd, &req).expect("binding");
        assert_eq!(hit.role, "dev");
        assert_eq!(hit.reason, "matched binding rule for channel=discord");

        let mut any_channel = RouteRequest::new("hi", "slack");
        any_channel.user_id = "u9".to_string();
        assert_eq!(match_binding(&sd, &any_channel).expect("user").role, "writer");
    }

    #[test]
    fn rules_outrank_role_keywords() {
        let mut cfg = routed_config();
        cfg.smart_dispatch.rules = vec![RoutingRule {
            role: "writer".to_string(),
            keywords: vec!["Release Notes".to_string()],
            patterns: vec![r"^draft\s".to_string(), "(".to_string()],
        }];

        let hit = match_keywords(&cfg, "write release notes for the rust bug fix").expect("rule");
        assert_eq!(hit.role, "writer");
        assert_eq!(hit.confidence, Confidence::High);
        assert_eq!(hit.reason, "matched rule keyword \"Release Notes\"");

        let hit = match_keywords(&cfg, "DRAFT a memo").expect("pattern");
        assert_eq!(hit.reason, "matched rule pattern \"^draft\\\\s\"");

        let hit = match_keywords(&cfg, "fix this Rust bug").expect("role keyword");
        assert_eq!(hit.role, "dev");
        assert_eq!(hit.confidence, Confidence::Medium);
        assert_eq!(hit.method, RouteMethod::Keyword);

        assert!(match_keywords(&cfg, "hello there").is_none());
    }

    #[test]
    fn classify_prompt_lists_sorted_roles() {
        let prompt = build_classify_prompt(&routed_config(), "plan the sprint");
        assert!(prompt.contains(
            "Available roles:\n- dev: Writes code [keywords: rust, bug]\n- lead: Coordinates the team\n- writer: (no description) [keywords: blog]\n"
        ));
        assert!(prompt.contains("MUST be one of these exact keys: dev, lead, writer\n"));
        assert!(prompt.contains("User request: plan the sprint\n"));
        assert!(prompt.ends_with("use \"lead\" as the default."));
    }

    #[test]
    fn parse_llm_route_degrades_gracefully() {
        let ok = parse_llm_route(
            "Sure! {\"role\":\"dev\",\"confidence\":\"high\",\"reason\":\"code\"} done",
            "lead",
        );
        assert_eq!(ok.role, "dev");
        assert_eq!(ok.method, RouteMethod::Llm);
        assert_eq!(ok.confidence, Confidence::High);

        let defaults = parse_llm_route("{\"reason\":\"unsure\"}", "lead");
        assert_eq!(defaults.role, "lead");
        assert_eq!(defaults.confidence, Confidence::Medium);

        let missing = parse_llm_route("no json", "lead");
        assert_eq!(missing.reason, "could not parse LLM response");
        assert_eq!(missing.confidence, Confidence::Low);

        let broken = parse_llm_route("{not json}", "lead");
        assert!(broken.reason.starts_with("JSON parse error: "));
    }

    #[tokio::test]
    async fn binding_outranks_keywords_and_classifier() {
        let mut cfg = routed_config();
        cfg.smart_dispatch.rules = vec![RoutingRule {
            role: "dev".to_string(),
            keywords: vec!["blog".to_string()],
            patterns: Vec::new(),
        }];
        cfg.smart_dispatch.bindings = vec![RoutingBinding {
            channel: "discord".to_string(),
            channel_id: "c42".to_string(),
            role: "writer".to_string(),
            ..RoutingBinding::default()
        }];
        let provider =
            ScriptedClassifier::new(&[r#"{"role":"lead","confidence":"high","reason":"llm"}"#]);
        let dispatcher = dispatcher(cfg, provider.clone()).await;

        let mut req = RouteRequest::new("blog post about a rust bug", "discord");
        req.channel_id = "c42".to_string();
        let result = dispatcher.route(&req).await;
        assert_eq!(result.method, RouteMethod::Binding);
        assert_eq!(result.role, "writer");
        assert_eq!(result.confidence, Confidence::High);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);

        req.source = "slack".to_string();
        let result = dispatcher.route(&req).await;
        assert_eq!(result.method, RouteMethod::Keyword);
        assert_eq!(result.role, "dev");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_binding_role_falls_through_to_keywords() {
        let mut cfg = routed_config();
        cfg.smart_dispatch.bindings = vec![RoutingBinding {
            user_id: "u1".to_string(),
            role: "ghost".to_string(),
            ..RoutingBinding::default()
        }];
        let provider = ScriptedClassifier::new(&[]);
        let dispatcher = dispatcher(cfg, provider.clone()).await;

        let mut req = RouteRequest::new("blog post about rust", "cli");
        req.user_id = "u1".to_string();
        let result = dispatcher.route(&req).await;
        assert_eq!(result.method, RouteMethod::Keyword);
        assert_eq!(result.role, "dev");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn coordinator_fallback_skips_the_llm() {
        let mut cfg = routed_config();
        cfg.smart_dispatch.fallback = "coordinator".to_string();
        let provider = ScriptedClassifier::new(&[]);
        let dispatcher = dispatcher(cfg, provider.clone()).await;

        let result = dispatcher.route(&RouteRequest::new("anything", "cli")).await;
        assert_eq!(result.role, "lead");
        assert_eq!(result.method, RouteMethod::Coordinator);
        assert_eq!(result.confidence, Confidence::High);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn low_confidence_escalates_to_stronger_model() {
        let provider = ScriptedClassifier::new(&[
            r#"{"role":"dev","confidence":"low","reason":"maybe"}"#,
            r#"{"role":"writer","confidence":"high","reason":"prose"}"#,
        ]);
        let dispatcher = dispatcher(routed_config(), provider.clone()).await;

        let result = dispatcher.route(&RouteRequest::new("tidy this up", "cli")).await;
        assert_eq!(result.role, "writer");
        assert_eq!(result.method, RouteMethod::LlmEscalated);
        assert_eq!(
            *provider.models.lock().expect("models"),
            vec!["sonnet".to_string(), "opus".to_string()]
        );
    }

    #[tokio::test]
    async fn unknown_llm_role_maps_to_default() {
        let provider =
            ScriptedClassifier::new(&[r#"{"role":"Engineer","confidence":"high","reason":"code"}"#]);
        let dispatcher = dispatcher(routed_config(), provider).await;

        let result = dispatcher.route(&RouteRequest::new("tidy this up", "cli")).await;
        assert_eq!(result.role, "lead");
        assert_eq!(result.confidence, Confidence::Low);
        assert_eq!(result.reason, "code (role not found, using default)");
    }

    #[tokio::test]
    async fn classification_failure_uses_default_role() {
        let provider = ScriptedClassifier::new(&[]);
        let dispatcher = dispatcher(routed_config(), provider).await;

        let result = dispatcher.route(&RouteRequest::new("tidy this up", "cli")).await;
        assert_eq!(result.role, "lead");
        assert_eq!(result.method, RouteMethod::Default);
        assert_eq!(
            result.reason,
            "LLM classification failed: classification failed: no scripted reply"
        );
    }
}
