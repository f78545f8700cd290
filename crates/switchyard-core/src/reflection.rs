//! Post-execution self-assessment.
//!
//! A cheap model scores finished role tasks 1-5. The improvement notes of the
//! most recent assessments are fed back into the next prompt for that role.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use switchyard_providers::ProviderRegistry;
use switchyard_types::{new_id, short_id, Task, TaskResult, TaskStatus};

use crate::circuit::CircuitRegistry;
use crate::collaborators::Reflector;
use crate::config::HubConfig;
use crate::failover::execute_with_provider;
use crate::text::truncate;

pub const REFLECTION_MODEL: &str = "haiku";
pub const REFLECTION_TIMEOUT: &str = "30s";
const DEFAULT_MIN_COST: f64 = 0.03;
const DEFAULT_BUDGET: f64 = 0.05;
const DEFAULT_CONTEXT_LIMIT: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReflectionRecord {
    pub task_id: String,
    pub role: String,
    pub score: u8,
    pub feedback: String,
    pub improvement: String,
    pub cost_usd: f64,
    pub created_at: DateTime<Utc>,
}

pub fn should_reflect(cfg: &HubConfig, task: &Task, result: &TaskResult) -> bool {
    if !cfg.reflection.enabled || task.role.is_empty() {
        return false;
    }
    let failed = result.status.is_failure();
    if failed {
        return cfg.reflection.trigger_on_fail;
    }
    let min_cost = if cfg.reflection.min_cost > 0.0 {
        cfg.reflection.min_cost
    } else {
        DEFAULT_MIN_COST
    };
    result.cost_usd >= min_cost
}

pub fn reflection_budget(cfg: &HubConfig) -> f64 {
    if cfg.reflection.budget > 0.0 {
        cfg.reflection.budget
    } else {
        DEFAULT_BUDGET
    }
}

pub fn build_reflection_prompt(task: &Task, result: &TaskResult) -> String {
    format!(
        "Evaluate this task output quality. Score 1-5 (1=poor, 5=excellent).\n\
         Respond ONLY with JSON: {{\"score\":N,\"feedback\":\"brief assessment\",\"improvement\":\"specific suggestion\"}}\n\
         \n\
         Task: {}\n\
         Agent: {}\n\
         Status: {}\n\
         Output: {}",
        truncate(&task.prompt, 500),
        task.role,
        result.status,
        truncate(&result.output, 1000),
    )
}

/// The first balanced `{...}` object, after stripping a markdown code fence.
pub fn extract_json_object(raw: &str) -> Option<&str> {
    let mut s = raw.trim();
    if s.starts_with("```") {
        if let Some(idx) = s.find('\n') {
            s = &s[idx + 1..];
        }
        if let Some(last) = s.rfind("```") {
            s = &s[..last];
        }
        s = s.trim();
    }

    let start = s.find('{')?;
    let mut depth = 0usize;
    for (i, b) in s.bytes().enumerate().skip(start) {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&s[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Debug, Deserialize)]
struct RawReflection {
    #[serde(default)]
    score: i64,
    #[serde(default)]
    feedback: String,
    #[serde(default)]
    improvement: String,
}

/// Parses the model's assessment. Task id, role and cost are left for the caller.
pub fn parse_reflection_output(output: &str) -> anyhow::Result<ReflectionRecord> {
    let json = extract_json_object(output).ok_or_else(|| anyhow!("no JSON found in reflection output"))?;
    let parsed: RawReflection =
        serde_json::from_str(json).context("invalid JSON in reflection")?;
    if !(1..=5).contains(&parsed.score) {
        bail!("score {} out of range 1-5", parsed.score);
    }
    Ok(ReflectionRecord {
        task_id: String::new(),
        role: String::new(),
        score: parsed.score as u8,
        feedback: parsed.feedback,
        improvement: parsed.improvement,
        cost_usd: 0.0,
        created_at: Utc::now(),
    })
}

/// Text block appended to a role's system prompt; empty without history.
pub async fn build_reflection_context(reflector: &dyn Reflector, role: &str, limit: usize) -> String {
    if role.is_empty() {
        return String::new();
    }
    let limit = if limit == 0 { DEFAULT_CONTEXT_LIMIT } else { limit };
    let records = reflector.recent_reflections(role, limit).await;
    if records.is_empty() {
        return String::new();
    }
    let mut out = format!("Recent self-assessments for agent {role}:\n");
    for record in records {
        out.push_str(&format!("- Score: {}/5 - {}\n", record.score, record.improvement));
    }
    out
}

/// Runs assessments through the provider chain and keeps them in memory.
pub struct LlmReflector {
    cfg: Arc<HubConfig>,
    providers: ProviderRegistry,
    circuits: CircuitRegistry,
    records: Mutex<Vec<ReflectionRecord>>,
}

impl LlmReflector {
    pub fn new(cfg: Arc<HubConfig>, providers: ProviderRegistry, circuits: CircuitRegistry) -> Self {
        Self {
            cfg,
            providers,
            circuits,
            records: Mutex::new(Vec::new()),
        }
    }

    fn reflection_task(&self, task: &Task, result: &TaskResult) -> Task {
        let mut reflection = Task::new(build_reflection_prompt(task, result))
            .with_role(task.role.clone())
            .with_source("reflection");
        reflection.name = format!("reflection-{}", short_id(&task.id));
        reflection.session_id = new_id();
        reflection.model = REFLECTION_MODEL.to_string();
        reflection.budget = reflection_budget(&self.cfg);
        reflection.timeout = REFLECTION_TIMEOUT.to_string();
        reflection.permission_mode = "plan".to_string();
        reflection.workdir = crate::config::expand_home(&self.cfg.default_workdir);
        reflection
    }
}

#[async_trait]
impl Reflector for LlmReflector {
    async fn perform_reflection(
        &self,
        task: &Task,
        result: &TaskResult,
    ) -> anyhow::Result<ReflectionRecord> {
        let reflection = self.reflection_task(task, result);
        let timeout = Duration::from_secs(30);
        let outcome = tokio::time::timeout(
            timeout,
            execute_with_provider(&self.cfg, &reflection, "", &self.providers, &self.circuits, None),
        )
        .await
        .map_err(|_| anyhow!("reflection failed: timed out"))?;
        if outcome.is_error {
            bail!("reflection failed: {}", outcome.error);
        }

        let mut record = parse_reflection_output(&outcome.output).context("parse reflection")?;
        record.task_id = task.id.clone();
        record.role = task.role.clone();
        record.cost_usd = outcome.cost_usd;
        Ok(record)
    }

    async fn store_reflection(&self, record: ReflectionRecord) -> anyhow::Result<()> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
        Ok(())
    }

    async fn recent_reflections(&self, role: &str, limit: usize) -> Vec<ReflectionRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .iter()
            .rev()
            .filter(|r| role.is_empty() || r.role == role)
            .take(limit)
            .cloned()
            .collect()
    }
}

/// Assesses a finished task and stores the record; failures are only logged.
pub async fn reflect_and_store(reflector: &dyn Reflector, task: &Task, result: &TaskResult) {
    match reflector.perform_reflection(task, result).await {
        Ok(record) => {
            tracing::info!(task_id = %task.id, role = %task.role, score = record.score, "reflection recorded");
            if let Err(err) = reflector.store_reflection(record).await {
                tracing::warn!(task_id = %task.id, error = %err, "store reflection failed");
            }
        }
        Err(err) => {
            tracing::debug!(task_id = %task.id, error = %err, "reflection skipped");
        }
    }
}
