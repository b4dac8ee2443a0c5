use thiserror::Error;

use crate::types::ProfileId;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid schedule: {0}")]
    InvalidPolicy(String),

    #[error("backup profile {0} not found")]
    ProfileNotFound(ProfileId),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ScheduleError>;
