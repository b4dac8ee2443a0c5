use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{Result, ScheduleError};
use crate::types::ProfileId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Weekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl From<Weekday> for chrono::Weekday {
    fn from(day: Weekday) -> Self {
        match day {
            Weekday::Monday => chrono::Weekday::Mon,
            Weekday::Tuesday => chrono::Weekday::Tue,
            Weekday::Wednesday => chrono::Weekday::Wed,
            Weekday::Thursday => chrono::Weekday::Thu,
            Weekday::Friday => chrono::Weekday::Fri,
            Weekday::Saturday => chrono::Weekday::Sat,
            Weekday::Sunday => chrono::Weekday::Sun,
        }
    }
}

/// When a backup recurs. All times are UTC; seconds are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum RecurrencePolicy {
    #[default]
    Disabled,
    #[serde(rename_all = "camelCase")]
    MinuteInterval { interval_minutes: u32 },
    Hourly,
    Daily { at: NaiveTime },
    Weekly { weekday: Weekday, at: NaiveTime },
    Monthly { day: u8, at: NaiveTime },
}

impl RecurrencePolicy {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, RecurrencePolicy::Disabled)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            RecurrencePolicy::MinuteInterval { interval_minutes } if *interval_minutes == 0 => {
                Err(ScheduleError::InvalidPolicy(
                    "minute interval must be at least 1".to_string(),
                ))
            }
            RecurrencePolicy::Monthly { day, .. } if !(1..=31).contains(day) => Err(
                ScheduleError::InvalidPolicy(format!("day of month {} is out of range", day)),
            ),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSchedule {
    pub id: i64,
    pub backup_profile_id: ProfileId,
    pub policy: RecurrencePolicy,
    /// Bumped on every edit; a timer armed for an older revision is stale.
    pub revision: i64,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_run_status: Option<String>,
}

/// Which archives a prune keeps. Counts follow borg's `--keep-*` options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PruningPolicy {
    pub enabled: bool,
    pub keep_hourly: u32,
    pub keep_daily: u32,
    pub keep_weekly: u32,
    pub keep_monthly: u32,
    pub keep_yearly: u32,
    pub keep_within_days: u32,
}

impl PruningPolicy {
    pub fn validate(&self) -> Result<()> {
        let keeps = [
            self.keep_hourly,
            self.keep_daily,
            self.keep_weekly,
            self.keep_monthly,
            self.keep_yearly,
            self.keep_within_days,
        ];
        if self.enabled && keeps.iter().all(|n| *n == 0) {
            return Err(ScheduleError::InvalidPolicy(
                "pruning rule must keep at least one archive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PruningRule {
    pub id: i64,
    pub backup_profile_id: ProfileId,
    pub policy: PruningPolicy,
    pub revision: i64,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_run_status: Option<String>,
}

/// Bookkeeping written after every timer firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub last_run: DateTime<Utc>,
    pub last_run_status: String,
    pub next_run: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policies_round_trip_through_json() {
        let policy = RecurrencePolicy::Weekly {
            weekday: Weekday::Wednesday,
            at: NaiveTime::from_hms_opt(10, 15, 0).unwrap(),
        };
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["mode"], "weekly");
        assert_eq!(json["weekday"], "wednesday");
        assert_eq!(serde_json::from_value::<RecurrencePolicy>(json).unwrap(), policy);

        let json = serde_json::to_value(RecurrencePolicy::MinuteInterval { interval_minutes: 5 }).unwrap();
        assert_eq!(json["mode"], "minuteInterval");
        assert_eq!(json["intervalMinutes"], 5);
    }

    #[test]
    fn invalid_policies_are_rejected() {
        let at = NaiveTime::from_hms_opt(3, 0, 0).unwrap();
        assert!(RecurrencePolicy::MinuteInterval { interval_minutes: 0 }.validate().is_err());
        assert!(RecurrencePolicy::Monthly { day: 0, at }.validate().is_err());
        assert!(RecurrencePolicy::Monthly { day: 32, at }.validate().is_err());
        assert!(RecurrencePolicy::Monthly { day: 31, at }.validate().is_ok());
        assert!(!RecurrencePolicy::Disabled.is_enabled());
    }

    #[test]
    fn enabled_pruning_must_keep_something() {
        let mut policy = PruningPolicy {
            enabled: true,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
        policy.keep_daily = 7;
        assert!(policy.validate().is_ok());
    }
}
