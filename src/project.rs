use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: u64,
    pub path_with_namespace: String,
    pub http_url_to_repo: String,
    #[serde(default)]
    pub ssh_url_to_repo: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub web_url: Option<String>,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub wiki_enabled: bool,
}

impl Project {
    /// Directory under the output root. Namespaces are flattened with `__`
    /// and the id is appended, so equal short names never collide.
    pub fn archive_dir_name(&self) -> String {
        let flattened: String = self
            .path_with_namespace
            .split('/')
            .map(sanitize_segment)
            .collect::<Vec<_>>()
            .join("__");
        format!("{}-{}", flattened, self.id)
    }

    /// Last segment of the namespaced path, e.g. `tools` for `acme/infra/tools`.
    pub fn short_name(&self) -> String {
        let last = self
            .path_with_namespace
            .rsplit('/')
            .find(|s| !s.is_empty())
            .unwrap_or("repo");
        sanitize_segment(last.trim_end_matches(".git"))
    }

    pub fn mirror_dir_name(&self) -> String {
        format!("{}.git", self.short_name())
    }

    pub fn wiki_mirror_dir_name(&self) -> String {
        format!("{}.wiki.git", self.short_name())
    }
}

fn sanitize_segment(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    // `.` and `..` would escape the output root.
    if cleaned.chars().all(|c| c == '.') {
        cleaned.replace('.', "_")
    } else {
        cleaned
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize)]
pub struct Group {
    pub id: u64,
    #[serde(default)]
    pub full_path: String,
}

#[derive(Debug, PartialEq, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ArchiveStatus {
    Archived { size_bytes: u64 },
    DryRun,
    Failed { reason: String },
}

impl ArchiveStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, ArchiveStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveResult {
    pub project: Project,
    pub output_path: PathBuf,
    #[serde(flatten)]
    pub status: ArchiveStatus,
    pub messages: Vec<String>,
}

#[cfg(test)]
pub fn project(id: u64, path_with_namespace: &str, http_url_to_repo: &str) -> Project {
    Project {
        id,
        path_with_namespace: String::from(path_with_namespace),
        http_url_to_repo: String::from(http_url_to_repo),
        ssh_url_to_repo: None,
        name: path_with_namespace.rsplit('/').next().map(String::from),
        web_url: None,
        default_branch: Some(String::from("main")),
        wiki_enabled: false,
    }
}
