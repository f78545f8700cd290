use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::fs;

use crate::config::{HubConfig, RoleWorkspace};

#[derive(Debug, Clone, Default, Deserialize)]
struct SoulFrontmatter {
    description: Option<String>,
    keywords: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SoulDocument {
    pub description: Option<String>,
    pub keywords: Option<Vec<String>>,
    pub body: String,
}

/// Splits optional `---` YAML frontmatter from the prompt body.
pub fn parse_soul_markdown(raw: &str) -> SoulDocument {
    let trimmed = raw.trim_start();
    if !trimmed.starts_with("---") {
        return SoulDocument {
            body: raw.to_string(),
            ..SoulDocument::default()
        };
    }
    let mut parts = trimmed.splitn(3, "---");
    let _ = parts.next();
    let (Some(frontmatter), Some(body)) = (parts.next(), parts.next()) else {
        return SoulDocument {
            body: raw.to_string(),
            ..SoulDocument::default()
        };
    };
    match serde_yaml::from_str::<SoulFrontmatter>(frontmatter.trim()) {
        Ok(meta) => SoulDocument {
            description: meta.description,
            keywords: meta.keywords,
            body: body.trim().to_string(),
        },
        Err(err) => {
            tracing::debug!(error = %err, "soul frontmatter did not parse, using whole file");
            SoulDocument {
                body: raw.to_string(),
                ..SoulDocument::default()
            }
        }
    }
}

/// Role workspace with the shared workspace dir and `<agents_dir>/<role>/SOUL.md` as defaults.
pub fn resolve_workspace(cfg: &HubConfig, role: &str) -> RoleWorkspace {
    let Some(rc) = cfg.role(role) else {
        return RoleWorkspace {
            dir: cfg.workspace_dir.clone(),
            soul_file: String::new(),
        };
    };
    let mut ws = rc.workspace.clone();
    if ws.dir.is_empty() {
        ws.dir = cfg.workspace_dir.clone();
    }
    if ws.soul_file.is_empty() && !cfg.agents_dir.is_empty() {
        ws.soul_file = Path::new(&cfg.agents_dir)
            .join(role)
            .join("SOUL.md")
            .to_string_lossy()
            .to_string();
    }
    ws
}

fn anchored(cfg: &HubConfig, path: &str) -> PathBuf {
    let path = PathBuf::from(crate::config::expand_home(path));
    if path.is_absolute() {
        path
    } else {
        cfg.base_dir.join(path)
    }
}

async fn read_soul(path: &Path) -> Option<SoulDocument> {
    match fs::read_to_string(path).await {
        Ok(raw) => Some(parse_soul_markdown(&raw)),
        Err(err) => {
            tracing::debug!(path = %path.display(), error = %err, "no soul file");
            None
        }
    }
}

async fn load_soul_document(cfg: &HubConfig, role: &str) -> Option<SoulDocument> {
    let ws = resolve_workspace(cfg, role);
    if !ws.soul_file.is_empty() {
        if let Some(doc) = read_soul(&anchored(cfg, &ws.soul_file)).await {
            return Some(doc);
        }
    }
    let legacy = cfg.role(role).map(|rc| rc.soul_file.as_str()).unwrap_or("");
    if legacy.is_empty() {
        return None;
    }
    read_soul(&anchored(cfg, legacy)).await
}

/// System prompt body for the role: workspace soul file, else the legacy prompt file.
pub async fn load_soul_file(cfg: &HubConfig, role: &str) -> Option<String> {
    let doc = load_soul_document(cfg, role).await?;
    let body = doc.body.trim();
    if body.is_empty() {
        None
    } else {
        tracing::debug!(role = %role, size = body.len(), "loaded soul file");
        Some(body.to_string())
    }
}

/// Fills empty role descriptions and keywords from soul frontmatter.
pub async fn apply_soul_metadata(cfg: &mut HubConfig) {
    let names: Vec<String> = cfg
        .roles
        .iter()
        .filter(|(_, rc)| rc.description.is_empty() || rc.keywords.is_empty())
        .map(|(name, _)| name.clone())
        .collect();
    for name in names {
        let Some(doc) = load_soul_document(cfg, &name).await else {
            continue;
        };
        let Some(rc) = cfg.roles.get_mut(&name) else {
            continue;
        };
        if rc.description.is_empty() {
            if let Some(description) = doc.description {
                rc.description = description;
            }
        }
        if rc.keywords.is_empty() {
            if let Some(keywords) = doc.keywords {
                rc.keywords = keywords;
            }
        }
    }
}

/// True when the directory holds at least one non-hidden regular file.
pub async fn knowledge_dir_has_files(dir: &str) -> bool {
    if dir.is_empty() {
        return false;
    }
    let Ok(mut entries) = fs::read_dir(dir).await else {
        return false;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        if is_file && !hidden {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoleConfig;

    #[test]
    fn frontmatter_is_split_from_body() {
        let doc = parse_soul_markdown(
            "---\ndescription: Release engineer\nkeywords: [deploy, rollback]\n---\nYou ship things.\n",
        );
        assert_eq!(doc.description.as_deref(), Some("Release engineer"));
        assert_eq!(
            doc.keywords,
            Some(vec!["deploy".to_string(), "rollback".to_string()])
        );
        assert_eq!(doc.body, "You ship things.");

        let plain = parse_soul_markdown("Just a prompt");
        assert_eq!(plain.body, "Just a prompt");
        assert!(plain.description.is_none());
    }

    #[tokio::test]
    async fn soul_file_precedence_and_metadata() {
        let dir = tempfile::tempdir().expect("tempdir");
        let agents = dir.path().join("agents");
        fs::create_dir_all(agents.join("ops")).await.expect("mkdir");
        fs::write(
            agents.join("ops").join("SOUL.md"),
            "---\ndescription: Operations\nkeywords: [deploy]\n---\nOps soul",
        )
        .await
        .expect("write");
        fs::write(dir.path().join("legacy.md"), "Legacy prompt")
            .await
            .expect("write");

        let mut cfg = HubConfig {
            agents_dir: agents.to_string_lossy().to_string(),
            base_dir: dir.path().to_path_buf(),
            ..HubConfig::default()
        };
        cfg.roles.insert("ops".to_string(), RoleConfig::default());
        cfg.roles.insert(
            "writer".to_string(),
            RoleConfig {
                soul_file: "legacy.md".to_string(),
                ..RoleConfig::default()
            },
        );

        assert_eq!(load_soul_file(&cfg, "ops").await.as_deref(), Some("Ops soul"));
        assert_eq!(
            load_soul_file(&cfg, "writer").await.as_deref(),
            Some("Legacy prompt")
        );
        assert_eq!(load_soul_file(&cfg, "ghost").await, None);

        apply_soul_metadata(&mut cfg).await;
        assert_eq!(cfg.roles["ops"].description, "Operations");
        assert_eq!(cfg.roles["ops"].keywords, vec!["deploy"]);
    }

    #[tokio::test]
    async fn knowledge_dir_ignores_hidden_files_and_subdirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().to_string_lossy().to_string();
        assert!(!knowledge_dir_has_files(&path).await);
        fs::write(dir.path().join(".hidden"), "x").await.expect("write");
        fs::create_dir(dir.path().join("sub")).await.expect("mkdir");
        assert!(!knowledge_dir_has_files(&path).await);
        fs::write(dir.path().join("notes.md"), "x").await.expect("write");
        assert!(knowledge_dir_has_files(&path).await);
        assert!(!knowledge_dir_has_files("").await);
    }

    #[test]
    fn workspace_defaults_to_shared_dir() {
        let mut cfg = HubConfig {
            workspace_dir: "/srv/ws".to_string(),
            ..HubConfig::default()
        };
        cfg.roles.insert("dev".to_string(), RoleConfig::default());
        let ws = resolve_workspace(&cfg, "dev");
        assert_eq!(ws.dir, "/srv/ws");
        assert!(ws.soul_file.is_empty());
    }
}
