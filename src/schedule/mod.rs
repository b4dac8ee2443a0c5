//! Recurring backups and prunes: policies, next-run calculation, the
//! timer scheduler and the editing service that keeps it in sync.

pub mod calc;
pub mod error;
pub mod policy;
pub mod scheduler;
pub mod service;

pub use calc::{next_prune_run, next_run};
pub use error::{Result, ScheduleError};
pub use policy::{BackupSchedule, PruningPolicy, PruningRule, RecurrencePolicy, RunRecord, Weekday};
pub use scheduler::{channel, ArmedTimer, ScheduleChangeSignal, Scheduler, TimerKey, TimerKind};
pub use service::ScheduleService;
