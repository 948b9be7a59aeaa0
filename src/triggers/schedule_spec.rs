use chrono::{DateTime, TimeZone};
use cron::Schedule;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

lazy_static! {
    static ref DURATION_PART: Regex = Regex::new(r"(\d+)\s*(ms|s|m|h|d|w)").unwrap();
    static ref DURATION: Regex = Regex::new(r"^\s*(\d+\s*(ms|s|m|h|d|w)\s*)+$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression {expression:?}: {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("invalid duration {0:?}, expected something like \"30m\" or \"1h 30m\"")]
    InvalidDuration(String),
}

/// When a scheduled trigger should fire: a cron expression or a fixed delay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ScheduleSpec {
    Cron { expression: String, schedule: Box<Schedule> },
    Interval { text: String, every: Duration },
}

impl ScheduleSpec {
    /// Delay from `now` until this spec next fires.
    ///
    /// Intervals are always measured from `now`. Returns `None` for a cron expression with
    /// no upcoming occurrence.
    pub fn delay_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Option<Duration> {
        match self {
            ScheduleSpec::Interval { every, .. } => Some(*every),
            ScheduleSpec::Cron { schedule, .. } => {
                let next = schedule.after(now).next()?;
                Some((next - now.clone()).to_std().unwrap_or_default())
            }
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ScheduleSpec::Cron { expression, .. } => expression,
            ScheduleSpec::Interval { text, .. } => text,
        }
    }
}

impl PartialEq for ScheduleSpec {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleSpec {
    type Err = ScheduleError;

    /// Anything made only of `<number><unit>` groups is an interval, everything else must be a
    /// cron expression. Five-field expressions get a leading seconds field.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        if DURATION.is_match(text) {
            return Ok(ScheduleSpec::Interval {
                text: text.to_string(),
                every: parse_duration(text)?,
            });
        }

        let fields = text.split_whitespace().count();
        let normalized = match fields {
            5 => format!("0 {}", text),
            6 | 7 => text.to_string(),
            _ => {
                return Err(ScheduleError::InvalidCron {
                    expression: text.to_string(),
                    reason: format!("expected 5 to 7 fields, found {}", fields),
                })
            }
        };
        let schedule = Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
            expression: text.to_string(),
            reason: e.to_string(),
        })?;

        Ok(ScheduleSpec::Cron {
            expression: text.to_string(),
            schedule: Box::new(schedule),
        })
    }
}

impl TryFrom<String> for ScheduleSpec {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ScheduleSpec> for String {
    fn from(spec: ScheduleSpec) -> Self {
        spec.as_str().to_string()
    }
}

/// Parses durations such as `"500ms"`, `"30m"` or `"1h 30m"`. Zero is rejected.
pub fn parse_duration(text: &str) -> Result<Duration, ScheduleError> {
    let invalid = || ScheduleError::InvalidDuration(text.to_string());
    if !DURATION.is_match(text) {
        return Err(invalid());
    }

    let mut total = Duration::ZERO;
    for part in DURATION_PART.captures_iter(text) {
        let amount: u64 = part[1].parse().map_err(|_| invalid())?;
        let unit_millis: u64 = match &part[2] {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            "w" => 604_800_000,
            _ => return Err(invalid()),
        };
        let millis = amount.checked_mul(unit_millis).ok_or_else(invalid)?;
        total = total
            .checked_add(Duration::from_millis(millis))
            .ok_or_else(invalid)?;
    }

    if total.is_zero() {
        return Err(invalid());
    }
    Ok(total)
}
