//! Schedule Engine (C3): evaluates standard 5-field cron expressions,
//! `@`-nicknames, and `@every DURATION` against a clock bound to a timezone.

use crate::error::ScheduleError;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use chrono_tz::Tz;
use std::str::FromStr;

/// A compiled, ready-to-evaluate schedule. Tagged variant rather than a
/// trait object: there are exactly three shapes, and dynamic dispatch would
/// buy nothing but indirection.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// A standard 5-field cron expression (nicknames are desugared into
    /// this at parse time), bound to a timezone.
    Standard { inner: cron::Schedule, tz: Tz },
    /// `@every DURATION`: fires exactly `duration` after the previous fire.
    Every { duration: ChronoDuration },
}

impl Schedule {
    /// Parses a schedule spec (`"15 */2 * * *"`, `"@daily"`, `"@every 1h"`)
    /// bound to the given IANA timezone name (empty string means UTC).
    pub fn parse(spec: &str, tz_name: &str) -> Result<Schedule, ScheduleError> {
        let tz = parse_tz(tz_name)?;

        if let Some(duration_str) = spec.strip_prefix("@every ") {
            let duration = parse_duration(duration_str)
                .map_err(|e| ScheduleError::new(spec, e))?;
            return Ok(Schedule::Every { duration });
        }

        let desugared = desugar_nickname(spec)?;
        let six_field = format!("0 {desugared}");
        let inner = cron::Schedule::from_str(&six_field)
            .map_err(|e| ScheduleError::new(spec, e.to_string()))?;

        Ok(Schedule::Standard { inner, tz })
    }

    /// Smallest instant strictly greater than `now` satisfying this
    /// schedule.
    pub fn next(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Schedule::Standard { inner, tz } => {
                let local_now = now.with_timezone(tz);
                inner
                    .after(&local_now)
                    .next()
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or(now + ChronoDuration::days(365 * 10))
            }
            Schedule::Every { duration } => now + *duration,
        }
    }
}

fn parse_tz(tz_name: &str) -> Result<Tz, ScheduleError> {
    if tz_name.is_empty() {
        return Ok(Tz::UTC);
    }
    Tz::from_str(tz_name).map_err(|_| ScheduleError::new(tz_name, "unknown timezone"))
}

/// Expands a nickname into an equivalent standard 5-field expression.
/// `@every` and raw standard expressions pass through unchanged.
fn desugar_nickname(spec: &str) -> Result<String, ScheduleError> {
    let expanded = match spec {
        "@yearly" | "@annually" => "0 0 1 1 *",
        "@monthly" => "0 0 1 * *",
        "@weekly" => "0 0 * * 0",
        "@daily" | "@midnight" => "0 0 * * *",
        "@hourly" => "0 * * * *",
        other if other.starts_with('@') => {
            return Err(ScheduleError::new(spec, "unknown nickname"));
        }
        other => other,
    };
    Ok(expanded.to_string())
}

/// Parses a Go-style duration string (`"1h"`, `"30s"`, `"1h30m"`) into a
/// `chrono::Duration`. Supports `h`, `m`, `s` units, combinable left to
/// right (largest unit first).
fn parse_duration(s: &str) -> Result<ChronoDuration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = ChronoDuration::zero();
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        if digits.is_empty() {
            return Err(format!("invalid duration {s:?}"));
        }
        let n: i64 = digits.parse().map_err(|_| format!("invalid duration {s:?}"))?;
        digits.clear();
        total = total
            + match c {
                'h' => ChronoDuration::hours(n),
                'm' => ChronoDuration::minutes(n),
                's' => ChronoDuration::seconds(n),
                other => return Err(format!("unknown duration unit {other:?} in {s:?}")),
            };
    }
    if !digits.is_empty() {
        return Err(format!("invalid duration {s:?}: trailing digits"));
    }
    Ok(total)
}

/// The schedule the Collector and Watchers register under: fires on every
/// `:00` second boundary, i.e. at every minute tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReloadSchedule;

impl ReloadSchedule {
    pub fn next(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let extra_seconds = 60 - now.timestamp() % 60;
        let truncated = now - ChronoDuration::nanoseconds(now.timestamp_subsec_nanos() as i64);
        truncated + ChronoDuration::seconds(extra_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn standard_schedule_fires_strictly_after_now() {
        let s = Schedule::parse("*/5 * * * *", "").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = s.next(now);
        assert!(next > now);
        assert_eq!(next.timestamp() % 300, 0);
    }

    #[test]
    fn nickname_daily_fires_at_midnight() {
        let s = Schedule::parse("@daily", "").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 13, 0, 0).unwrap();
        let next = s.next(now);
        assert_eq!(next.format("%H:%M:%S").to_string(), "00:00:00");
        assert!(next > now);
    }

    #[test]
    fn every_adds_duration_to_now() {
        let s = Schedule::parse("@every 1h30m", "").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = s.next(now);
        assert_eq!(next - now, ChronoDuration::minutes(90));
    }

    #[test]
    fn reload_schedule_lands_on_minute_boundary() {
        let r = ReloadSchedule;
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 30).unwrap();
        let next = r.next(now);
        assert!(next > now);
        assert_eq!(next.timestamp() % 60, 0);
        assert_eq!(next.timestamp_subsec_nanos(), 0);
    }

    #[test]
    fn reload_schedule_on_exact_boundary_advances_a_full_minute() {
        let r = ReloadSchedule;
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 1, 0).unwrap();
        let next = r.next(now);
        assert_eq!(next - now, ChronoDuration::seconds(60));
    }

    #[test]
    fn unknown_nickname_errors() {
        assert!(Schedule::parse("@fortnightly", "").is_err());
    }

    #[test]
    fn bad_timezone_errors() {
        assert!(Schedule::parse("@daily", "Not/AZone").is_err());
    }
}
