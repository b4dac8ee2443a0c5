//! Backup repository orchestration.
//!
//! Serializes mutating operations per repository, validates every
//! repository state change against a fixed transition table plus runtime
//! business rules, and keeps recurring backup/prune schedules armed.

pub mod api;
pub mod engine;
pub mod events;
pub mod locks;
pub mod notifications;
pub mod runner;
pub mod schedule;
pub mod state;
pub mod storage;
pub mod types;
pub mod utils;
pub mod web;

pub use types::{BackupId, ProfileId, RepoId};
