use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use chrono::{Local, SecondsFormat};
use regex::{Captures, Regex};

use crate::collaborators::RoleMemory;

fn env_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{env\.([A-Za-z_][A-Za-z0-9_]*)\}\}").expect("valid env template regex")
    })
}

fn memory_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{memory\.([A-Za-z_][A-Za-z0-9_]*)\}\}")
            .expect("valid memory template regex")
    })
}

fn rules_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{rules\.([A-Za-z_][A-Za-z0-9_\-]*)\}\}")
            .expect("valid rules template regex")
    })
}

pub struct TemplateContext<'a> {
    pub role: &'a str,
    pub knowledge_dir: &'a str,
    pub workspace_dir: &'a str,
    pub memory: Option<&'a dyn RoleMemory>,
}

/// Expands `{{date}}`, `{{datetime}}`, `{{weekday}}`, `{{knowledge_dir}}`,
/// `{{env.KEY}}`, `{{memory.KEY}}` and `{{rules.NAME}}`.
pub async fn expand_prompt(prompt: &str, ctx: &TemplateContext<'_>) -> String {
    if !prompt.contains("{{") {
        return prompt.to_string();
    }

    let now = Local::now();
    let mut out = prompt
        .replace("{{date}}", &now.format("%Y-%m-%d").to_string())
        .replace(
            "{{datetime}}",
            &now.to_rfc3339_opts(SecondsFormat::Secs, true),
        )
        .replace("{{weekday}}", &now.format("%A").to_string())
        .replace("{{knowledge_dir}}", ctx.knowledge_dir);

    out = env_re()
        .replace_all(&out, |caps: &Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned();

    if let (false, Some(memory)) = (ctx.role.is_empty(), ctx.memory) {
        let mut values = HashMap::new();
        for caps in memory_re().captures_iter(&out) {
            let key = caps[1].to_string();
            if !values.contains_key(&key) {
                let value = memory.get(ctx.role, &key).await.unwrap_or_default();
                values.insert(key, value);
            }
        }
        out = memory_re()
            .replace_all(&out, |caps: &Captures<'_>| {
                values.get(&caps[1]).cloned().unwrap_or_default()
            })
            .into_owned();
    }

    if out.contains("{{rules.") {
        let mut rules = HashMap::new();
        for caps in rules_re().captures_iter(&out) {
            let name = caps[1].to_string();
            if rules.contains_key(&name) {
                continue;
            }
            let path = Path::new(ctx.workspace_dir)
                .join("rules")
                .join(format!("{name}.md"));
            let body = match tokio::fs::read_to_string(&path).await {
                Ok(body) => body,
                Err(_) => format!("(rule not found: {name})"),
            };
            rules.insert(name, body);
        }
        out = rules_re()
            .replace_all(&out, |caps: &Captures<'_>| {
                rules.get(&caps[1]).cloned().unwrap_or_default()
            })
            .into_owned();
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemoryHistory;

    fn ctx<'a>(memory: Option<&'a dyn RoleMemory>, workspace_dir: &'a str) -> TemplateContext<'a> {
        TemplateContext {
            role: "dev",
            knowledge_dir: "/kb",
            workspace_dir,
            memory,
        }
    }

    #[tokio::test]
    async fn plain_prompt_is_untouched() {
        let out = expand_prompt("no templates here", &ctx(None, "")).await;
        assert_eq!(out, "no templates here");
    }

    #[tokio::test]
    async fn static_and_env_variables_expand() {
        std::env::set_var("SWITCHYARD_TEMPLATE_TEST", "value");
        let out = expand_prompt(
            "kb={{knowledge_dir}} env={{env.SWITCHYARD_TEMPLATE_TEST}} missing={{env.SWITCHYARD_NOPE_X}} date={{date}}",
            &ctx(None, ""),
        )
        .await;
        assert!(out.starts_with("kb=/kb env=value missing= date="));
        assert!(!out.contains("{{"));
    }

    #[tokio::test]
    async fn memory_and_rules_expand() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::create_dir_all(dir.path().join("rules"))
            .await
            .expect("mkdir");
        tokio::fs::write(dir.path().join("rules").join("style.md"), "Be brief.")
            .await
            .expect("write");
        let history = InMemoryHistory::new();
        history.set("dev", "topic", "rust").await.expect("set");

        let ws = dir.path().to_string_lossy().to_string();
        let out = expand_prompt(
            "{{memory.topic}} | {{rules.style}} | {{rules.absent}}",
            &ctx(Some(&history), &ws),
        )
        .await;
        assert_eq!(out, "rust | Be brief. | (rule not found: absent)");
    }
}
