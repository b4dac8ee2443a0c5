//! Next-run arithmetic for recurrence policies.
//!
//! Pure functions of `(policy, from)`. Targets are computed in UTC with
//! seconds zeroed; a target equal to `from` counts as already passed.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};

use super::policy::RecurrencePolicy;

/// Fallback delay for a prune whose backup is not scheduled.
const PRUNE_FALLBACK_DAYS: i64 = 7;
/// Minimum distance between now and the next prune.
const PRUNE_MIN_DELAY_HOURS: i64 = 1;

pub fn next_run(policy: &RecurrencePolicy, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match policy {
        RecurrencePolicy::Disabled => None,
        RecurrencePolicy::MinuteInterval { interval_minutes } => {
            Some(from + Duration::minutes(i64::from(*interval_minutes)))
        }
        RecurrencePolicy::Hourly => {
            let hour = at_time(from.date_naive(), from.hour(), 0)?;
            Some(hour + Duration::hours(1))
        }
        RecurrencePolicy::Daily { at } => {
            let today = at_time(from.date_naive(), at.hour(), at.minute())?;
            if today <= from {
                Some(today + Duration::days(1))
            } else {
                Some(today)
            }
        }
        RecurrencePolicy::Weekly { weekday, at } => {
            let target = chrono::Weekday::from(*weekday).num_days_from_monday();
            let current = from.weekday().num_days_from_monday();
            let days_ahead = (target + 7 - current) % 7;
            let candidate = at_time(
                from.date_naive() + Duration::days(i64::from(days_ahead)),
                at.hour(),
                at.minute(),
            )?;
            if candidate <= from {
                Some(candidate + Duration::days(7))
            } else {
                Some(candidate)
            }
        }
        RecurrencePolicy::Monthly { day, at } => {
            let candidate = monthly_candidate(from.year(), from.month(), *day, at)?;
            if candidate > from {
                return Some(candidate);
            }
            let (year, month) = if from.month() == 12 {
                (from.year() + 1, 1)
            } else {
                (from.year(), from.month() + 1)
            };
            monthly_candidate(year, month, *day, at)
        }
    }
}

/// Next prune, placed just after the paired backup so the two never
/// contend for the repository lock at the same instant.
pub fn next_prune_run(
    backup_next_run: Option<DateTime<Utc>>,
    from: DateTime<Utc>,
) -> DateTime<Utc> {
    match backup_next_run {
        None => from + Duration::days(PRUNE_FALLBACK_DAYS),
        Some(backup) => {
            let earliest = from + Duration::hours(PRUNE_MIN_DELAY_HOURS);
            if backup < earliest {
                earliest
            } else {
                backup + Duration::minutes(1)
            }
        }
    }
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if is_leap_year(year) => 29,
        2 => 28,
        _ => 0,
    }
}

fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

/// The configured day of month, clamped to the month's length.
fn monthly_candidate(year: i32, month: u32, day: u8, at: &NaiveTime) -> Option<DateTime<Utc>> {
    let day = u32::from(day).clamp(1, days_in_month(year, month));
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    at_time(date, at.hour(), at.minute())
}

fn at_time(date: NaiveDate, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    let naive = date.and_hms_opt(hour, minute, 0)?;
    Some(Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::policy::Weekday;
    use proptest::prelude::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn disabled_has_no_next_run() {
        assert_eq!(next_run(&RecurrencePolicy::Disabled, utc(2024, 1, 1, 0, 0)), None);
    }

    #[test]
    fn minute_interval_adds_minutes() {
        let policy = RecurrencePolicy::MinuteInterval { interval_minutes: 15 };
        assert_eq!(
            next_run(&policy, utc(2024, 3, 10, 23, 50)),
            Some(utc(2024, 3, 11, 0, 5))
        );
    }

    #[test]
    fn hourly_goes_to_next_full_hour() {
        let from = Utc.with_ymd_and_hms(2024, 5, 5, 9, 59, 59).unwrap();
        assert_eq!(next_run(&RecurrencePolicy::Hourly, from), Some(utc(2024, 5, 5, 10, 0)));
        assert_eq!(
            next_run(&RecurrencePolicy::Hourly, utc(2024, 12, 31, 23, 0)),
            Some(utc(2025, 1, 1, 0, 0))
        );
    }

    #[test]
    fn daily_same_day_or_tomorrow() {
        let policy = RecurrencePolicy::Daily { at: time(10, 15) };
        assert_eq!(next_run(&policy, utc(2024, 6, 1, 9, 0)), Some(utc(2024, 6, 1, 10, 15)));
        assert_eq!(next_run(&policy, utc(2024, 6, 1, 10, 15)), Some(utc(2024, 6, 2, 10, 15)));
        assert_eq!(next_run(&policy, utc(2024, 6, 30, 11, 0)), Some(utc(2024, 7, 1, 10, 15)));
    }

    #[test]
    fn weekly_same_weekday_after_time_rolls_a_week() {
        let policy = RecurrencePolicy::Weekly {
            weekday: Weekday::Wednesday,
            at: time(10, 15),
        };
        // 2024-05-15 is a Wednesday
        assert_eq!(next_run(&policy, utc(2024, 5, 15, 11, 0)), Some(utc(2024, 5, 22, 10, 15)));
        assert_eq!(next_run(&policy, utc(2024, 5, 15, 9, 0)), Some(utc(2024, 5, 15, 10, 15)));
        assert_eq!(next_run(&policy, utc(2024, 5, 17, 9, 0)), Some(utc(2024, 5, 22, 10, 15)));
    }

    #[test]
    fn monthly_clamps_to_february() {
        let from = utc(2024, 2, 1, 0, 0);
        for day in [29, 30, 31] {
            let policy = RecurrencePolicy::Monthly { day, at: time(10, 15) };
            assert_eq!(next_run(&policy, from), Some(utc(2024, 2, 29, 10, 15)));
        }
        let policy = RecurrencePolicy::Monthly { day: 30, at: time(10, 15) };
        assert_eq!(next_run(&policy, utc(2023, 2, 1, 0, 0)), Some(utc(2023, 2, 28, 10, 15)));
    }

    #[test]
    fn monthly_resumes_unclamped_day_after_february() {
        let policy = RecurrencePolicy::Monthly { day: 30, at: time(10, 15) };
        assert_eq!(next_run(&policy, utc(2024, 2, 29, 11, 0)), Some(utc(2024, 3, 30, 10, 15)));
        let policy = RecurrencePolicy::Monthly { day: 31, at: time(10, 15) };
        assert_eq!(next_run(&policy, utc(2023, 2, 28, 11, 0)), Some(utc(2023, 3, 31, 10, 15)));
    }

    #[test]
    fn monthly_rolls_into_next_month_and_year() {
        let policy = RecurrencePolicy::Monthly { day: 31, at: time(10, 15) };
        assert_eq!(next_run(&policy, utc(2024, 1, 31, 12, 0)), Some(utc(2024, 2, 29, 10, 15)));
        assert_eq!(next_run(&policy, utc(2024, 3, 31, 10, 15)), Some(utc(2024, 4, 30, 10, 15)));
        let policy = RecurrencePolicy::Monthly { day: 5, at: time(0, 0) };
        assert_eq!(next_run(&policy, utc(2024, 12, 6, 0, 0)), Some(utc(2025, 1, 5, 0, 0)));
    }

    #[test]
    fn month_lengths() {
        assert_eq!(days_in_month(2024, 2), 29);
        assert_eq!(days_in_month(1900, 2), 28);
        assert_eq!(days_in_month(2000, 2), 29);
        assert_eq!(days_in_month(2024, 4), 30);
        assert_eq!(days_in_month(2024, 12), 31);
    }

    #[test]
    fn prune_follows_backup() {
        let now = utc(2024, 1, 1, 12, 0);
        assert_eq!(next_prune_run(None, now), utc(2024, 1, 8, 12, 0));
        assert_eq!(next_prune_run(Some(utc(2024, 1, 1, 12, 30)), now), utc(2024, 1, 1, 13, 0));
        assert_eq!(next_prune_run(Some(utc(2024, 1, 2, 3, 0)), now), utc(2024, 1, 2, 3, 1));
    }

    fn any_time() -> impl Strategy<Value = DateTime<Utc>> {
        // 2000-01-01 .. 2100-01-01
        (946_684_800i64..4_102_444_800i64)
            .prop_map(|secs| Utc.timestamp_opt(secs, 0).unwrap())
    }

    fn any_policy() -> impl Strategy<Value = RecurrencePolicy> {
        let at = (0u32..24, 0u32..60).prop_map(|(h, m)| NaiveTime::from_hms_opt(h, m, 0).unwrap());
        let weekday = prop::sample::select(vec![
            Weekday::Monday,
            Weekday::Tuesday,
            Weekday::Wednesday,
            Weekday::Thursday,
            Weekday::Friday,
            Weekday::Saturday,
            Weekday::Sunday,
        ]);
        prop_oneof![
            (1u32..10_000).prop_map(|n| RecurrencePolicy::MinuteInterval { interval_minutes: n }),
            Just(RecurrencePolicy::Hourly),
            at.clone().prop_map(|at| RecurrencePolicy::Daily { at }),
            (weekday, at.clone()).prop_map(|(weekday, at)| RecurrencePolicy::Weekly { weekday, at }),
            (1u8..=31, at).prop_map(|(day, at)| RecurrencePolicy::Monthly { day, at }),
        ]
    }

    proptest! {
        #[test]
        fn next_run_is_always_in_the_future(policy in any_policy(), from in any_time()) {
            let next = next_run(&policy, from).unwrap();
            prop_assert!(next > from);
        }

        #[test]
        fn calendar_targets_have_zero_seconds(policy in any_policy(), from in any_time()) {
            prop_assume!(!matches!(policy, RecurrencePolicy::MinuteInterval { .. }));
            let next = next_run(&policy, from).unwrap();
            prop_assert_eq!(next.second(), 0);
            prop_assert!(next - from <= Duration::days(31));
        }

        #[test]
        fn hourly_is_idempotent_within_the_hour(from in any_time(), offset in 0i64..3600) {
            let start = at_time(from.date_naive(), from.hour(), 0).unwrap();
            let a = next_run(&RecurrencePolicy::Hourly, start).unwrap();
            let b = next_run(&RecurrencePolicy::Hourly, start + Duration::seconds(offset)).unwrap();
            prop_assert_eq!(a, b);
        }
    }
}
