use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::SchedulerError;

/// The `cron` crate wants a leading seconds field; standard 5-field
/// expressions get `0 ` prepended.
pub fn normalize_cron(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

pub fn parse_schedule(expression: &str) -> Result<Schedule, SchedulerError> {
    Schedule::from_str(&normalize_cron(expression)).map_err(|e| SchedulerError::InvalidCron {
        expression: expression.to_string(),
        message: e.to_string(),
    })
}

/// Due when a tick falls in `(last_run, now]`. Without a previous run, any
/// tick in the last day counts.
pub fn is_cron_due(
    schedule: &Schedule,
    now: DateTime<Utc>,
    last_run: Option<DateTime<Utc>>,
) -> bool {
    let check_from = last_run.unwrap_or(now - chrono::Duration::days(1));
    schedule
        .after(&check_from)
        .next()
        .is_some_and(|next| next <= now)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 10, h, m, 0).unwrap()
    }

    #[test]
    fn five_field_expressions_gain_seconds() {
        assert_eq!(normalize_cron("0 * * * *"), "0 0 * * * *");
        assert_eq!(normalize_cron(" 0 2 * * * "), "0 0 2 * * *");
        assert_eq!(normalize_cron("30 0 2 * * *"), "30 0 2 * * *");
    }

    #[test]
    fn invalid_expression_is_rejected() {
        let err = parse_schedule("every hour").unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidCron { .. }));
    }

    #[test]
    fn hourly_is_due_on_the_hour() {
        let schedule = parse_schedule("0 * * * *").unwrap();
        assert!(!is_cron_due(&schedule, at(10, 59), Some(at(10, 0))));
        assert!(is_cron_due(&schedule, at(11, 0), Some(at(10, 0))));
        assert!(is_cron_due(&schedule, at(11, 20), Some(at(10, 30))));
        assert!(!is_cron_due(&schedule, at(11, 0), Some(at(11, 0))));
    }

    #[test]
    fn daily_cleanup_is_due_at_two() {
        let schedule = parse_schedule("0 2 * * *").unwrap();
        assert!(!is_cron_due(&schedule, at(1, 59), Some(at(0, 0))));
        assert!(is_cron_due(&schedule, at(2, 0), Some(at(0, 0))));
    }
}
