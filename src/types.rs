use serde::{Deserialize, Serialize};
use std::fmt;

pub type RepoId = i64;
pub type ProfileId = i64;

/// One schedulable unit of work: a backup profile targeting one repository.
///
/// Several profiles may target the same repository; they are scheduled
/// independently but share that repository's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupId {
    pub backup_profile_id: ProfileId,
    pub repository_id: RepoId,
}

impl BackupId {
    pub fn new(backup_profile_id: ProfileId, repository_id: RepoId) -> Self {
        Self {
            backup_profile_id,
            repository_id,
        }
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BackupProfileId: {}, RepositoryId: {}",
            self.backup_profile_id, self.repository_id
        )
    }
}
