use serde::{Deserialize, Serialize};

use crate::types::{ProfileId, RepoId};

/// A borg repository the orchestrator manages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub id: RepoId,
    pub name: String,
    /// Local path or `ssh://` URL.
    pub location: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
}

/// What to back up, and into which repositories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupProfile {
    pub id: ProfileId,
    pub name: String,
    /// Archive name prefix, also used to scope prunes.
    pub prefix: String,
    pub backup_paths: Vec<String>,
    #[serde(default)]
    pub exclude_paths: Vec<String>,
    pub repository_ids: Vec<RepoId>,
}
