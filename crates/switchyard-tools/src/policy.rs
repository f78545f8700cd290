use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

pub const PROFILE_MINIMAL: &str = "minimal";
pub const PROFILE_STANDARD: &str = "standard";
pub const PROFILE_FULL: &str = "full";

/// A named preset of allowed tools; `*` in `allow` means every registered tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolProfile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RoleToolPolicy {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub profile: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny: Vec<String>,
}

pub fn builtin_profile(name: &str) -> Option<ToolProfile> {
    let allow: &[&str] = match name {
        PROFILE_MINIMAL => &["memory_search", "memory_get", "knowledge_search"],
        PROFILE_STANDARD => &[
            "read",
            "write",
            "edit",
            "exec",
            "memory_search",
            "memory_get",
            "knowledge_search",
            "web_fetch",
            "session_list",
        ],
        PROFILE_FULL => &["*"],
        _ => return None,
    };
    Some(ToolProfile {
        name: name.to_string(),
        allow: allow.iter().map(|s| s.to_string()).collect(),
        deny: Vec::new(),
    })
}

/// Built-in profiles win over custom ones; unknown names resolve to `standard`.
pub fn resolve_profile(name: &str, custom: &HashMap<String, ToolProfile>) -> ToolProfile {
    let name = if name.is_empty() { PROFILE_STANDARD } else { name };
    builtin_profile(name)
        .or_else(|| custom.get(name).cloned())
        .or_else(|| builtin_profile(PROFILE_STANDARD))
        .unwrap_or_default()
}

/// profile allow, minus profile deny, plus role allow, minus role deny.
pub fn resolve_allowed_tools(
    policy: &RoleToolPolicy,
    default_profile: &str,
    custom: &HashMap<String, ToolProfile>,
    registered: &[String],
) -> BTreeSet<String> {
    let profile_name = if policy.profile.is_empty() {
        default_profile
    } else {
        policy.profile.as_str()
    };
    let profile = resolve_profile(profile_name, custom);

    let mut allowed = BTreeSet::new();
    for name in &profile.allow {
        if name == "*" {
            allowed.extend(registered.iter().cloned());
            break;
        }
        allowed.insert(name.clone());
    }
    for name in &profile.deny {
        allowed.remove(name);
    }
    allowed.extend(policy.allow.iter().cloned());
    for name in &policy.deny {
        allowed.remove(name);
    }
    allowed
}

pub fn policy_summary(
    policy: &RoleToolPolicy,
    default_profile: &str,
    custom: &HashMap<String, ToolProfile>,
    registered: &[String],
) -> String {
    let allowed = resolve_allowed_tools(policy, default_profile, custom, registered);
    let profile = if policy.profile.is_empty() {
        default_profile
    } else {
        policy.profile.as_str()
    };
    let mut parts = vec![
        format!("Profile: {profile}"),
        format!("Allowed: {} tools", allowed.len()),
    ];
    if !policy.allow.is_empty() {
        parts.push(format!("Additional: {}", policy.allow.join(", ")));
    }
    if !policy.deny.is_empty() {
        parts.push(format!("Denied: {}", policy.deny.join(", ")));
    }
    parts.join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registered() -> Vec<String> {
        ["read", "write", "exec", "email_send"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn full_profile_expands_to_registered_tools() {
        let policy = RoleToolPolicy {
            profile: "full".to_string(),
            deny: vec!["email_send".to_string()],
            ..RoleToolPolicy::default()
        };
        let allowed = resolve_allowed_tools(&policy, "standard", &HashMap::new(), &registered());
        assert_eq!(
            allowed.into_iter().collect::<Vec<_>>(),
            vec!["exec", "read", "write"]
        );
    }

    #[test]
    fn role_allow_extends_and_deny_trims_profile() {
        let policy = RoleToolPolicy {
            profile: "minimal".to_string(),
            allow: vec!["read".to_string()],
            deny: vec!["memory_get".to_string()],
        };
        let allowed = resolve_allowed_tools(&policy, "standard", &HashMap::new(), &registered());
        assert!(allowed.contains("read"));
        assert!(allowed.contains("memory_search"));
        assert!(!allowed.contains("memory_get"));
        assert!(!allowed.contains("exec"));
    }

    #[test]
    fn custom_profile_and_unknown_fallback() {
        let mut custom = HashMap::new();
        custom.insert(
            "ops".to_string(),
            ToolProfile {
                name: "ops".to_string(),
                allow: vec!["exec".to_string(), "read".to_string()],
                deny: vec!["read".to_string()],
            },
        );
        let ops = RoleToolPolicy {
            profile: "ops".to_string(),
            ..RoleToolPolicy::default()
        };
        let allowed = resolve_allowed_tools(&ops, "standard", &custom, &registered());
        assert_eq!(allowed.into_iter().collect::<Vec<_>>(), vec!["exec"]);

        let unknown = resolve_profile("nope", &custom);
        assert_eq!(unknown.name, "standard");
    }

    #[test]
    fn summary_lists_profile_and_overrides() {
        let policy = RoleToolPolicy {
            profile: String::new(),
            allow: vec!["email_send".to_string()],
            deny: vec!["exec".to_string()],
        };
        let summary = policy_summary(&policy, "minimal", &HashMap::new(), &registered());
        assert_eq!(
            summary,
            "Profile: minimal | Allowed: 4 tools | Additional: email_send | Denied: exec"
        );
    }
}
