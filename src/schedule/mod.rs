//! Policy schedules: frequency parsing, next-due computation and the
//! cron-equivalent expression persisted on each trigger.

pub mod interval;

pub use interval::IntervalSchedule;

use crate::error::ScheduleError;
use crate::types::Trigger;
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How often a policy fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Minutely,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Custom,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minutely => "minutely",
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Custom => "custom",
        }
    }

    /// Inclusive bounds on the interval multiplier accepted from a policy body.
    fn interval_bounds(&self) -> (u32, u32) {
        match self {
            Self::Minutely => (15, u32::MAX),
            Self::Hourly => (1, 23),
            Self::Daily => (1, 31),
            Self::Weekly => (1, 52),
            Self::Monthly => (1, 12),
            Self::Custom => (1, u32::MAX),
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minutely" => Ok(Self::Minutely),
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "custom" => Ok(Self::Custom),
            _ => Err(ScheduleError::InvalidFrequency(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// A next-due calculator for one trigger.
#[derive(Debug, Clone)]
pub enum Schedule {
    Interval(IntervalSchedule),
    Cron(Box<cron::Schedule>),
}

impl Schedule {
    /// Rebuild the schedule from a stored trigger.
    pub fn from_trigger(trigger: &Trigger) -> Result<Self, ScheduleError> {
        let frequency: Frequency = trigger.frequency.parse()?;
        match frequency {
            Frequency::Custom => parse_cron(&trigger.cron_expression).map(Self::from),
            _ => IntervalSchedule::new(frequency, trigger.interval, trigger.start_time)
                .map(Self::Interval),
        }
    }

    /// First occurrence strictly after `after`, if the schedule has one.
    pub fn next(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Interval(s) => s.next(after),
            Self::Cron(s) => s.after(&after).next(),
        }
    }
}

impl From<cron::Schedule> for Schedule {
    fn from(s: cron::Schedule) -> Self {
        Self::Cron(Box::new(s))
    }
}

/// Parse a standard five-field cron expression (minute hour dom month dow,
/// Sunday = 0 or 7).
pub fn parse_cron(expr: &str) -> Result<cron::Schedule, ScheduleError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(ScheduleError::InvalidCron {
            expr: expr.to_string(),
            reason: format!("expected 5 fields, found {}", fields.len()),
        });
    }

    // The cron crate wants a leading seconds field and counts weekdays from 1.
    let normalized = format!(
        "0 {} {} {} {} {}",
        fields[0],
        fields[1],
        fields[2],
        fields[3],
        day_of_week_names(fields[4])
    );
    cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Rewrite numeric weekday tokens (0-7, Sunday = 0 and 7) as names.
fn day_of_week_names(field: &str) -> String {
    const NAMES: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

    field
        .split(',')
        .map(|item| {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (item, None),
            };
            let range = range
                .split('-')
                .map(|part| match part.parse::<usize>() {
                    Ok(n) if n < NAMES.len() => NAMES[n].to_string(),
                    _ => part.to_string(),
                })
                .collect::<Vec<_>>()
                .join("-");
            match step {
                Some(step) => format!("{range}/{step}"),
                None => range,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// The cron-equivalent of a frequency anchored at `start`.
///
/// The multiplier is only expressible for minutely and hourly; for the other
/// frequencies the expression names the anchor slot and `interval` is applied
/// by [`IntervalSchedule`].
pub fn frequency_to_cron(
    frequency: Frequency,
    start: DateTime<Utc>,
    interval: u32,
) -> Result<String, ScheduleError> {
    let (minute, hour) = (start.minute(), start.hour());
    match frequency {
        Frequency::Minutely => Ok(format!("*/{interval} * * * *")),
        Frequency::Hourly if interval > 1 => Ok(format!("{minute} */{interval} * * *")),
        Frequency::Hourly => Ok(format!("{minute} * * * *")),
        Frequency::Daily => Ok(format!("{minute} {hour} * * *")),
        Frequency::Weekly => Ok(format!(
            "{minute} {hour} * * {}",
            start.weekday().num_days_from_sunday()
        )),
        Frequency::Monthly => Ok(format!("{minute} {hour} {} * *", start.day())),
        Frequency::Custom => Err(ScheduleError::Validation(
            "custom frequency requires an explicit cron expression".into(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Policy body schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawSchedule {
    frequency: String,
    #[serde(default)]
    interval: Option<serde_json::Value>,
    start_time: DateTime<Utc>,
    #[serde(default)]
    end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    cron: Option<String>,
}

/// A validated schedule declared in a policy body under `schedule`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSpec {
    pub frequency: Frequency,
    pub interval: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub cron_expression: String,
}

impl ScheduleSpec {
    /// Read and validate `body.schedule`.
    pub fn from_policy_body(body: &serde_json::Value) -> Result<Self, ScheduleError> {
        let raw = body
            .get("schedule")
            .ok_or_else(|| ScheduleError::Validation("policy has no schedule".into()))?;
        let raw: RawSchedule = serde_json::from_value(raw.clone())
            .map_err(|e| ScheduleError::Validation(format!("malformed schedule: {e}")))?;

        let frequency: Frequency = raw.frequency.parse()?;
        let interval = match (&raw.interval, frequency) {
            (None, Frequency::Custom) => 1,
            (None, _) => return Err(ScheduleError::InvalidInterval(String::new())),
            (Some(value), _) => parse_interval(value)?,
        };

        let (min, max) = frequency.interval_bounds();
        if interval < min {
            return Err(ScheduleError::Validation(format!(
                "{frequency} interval must be at least {min}, got {interval}"
            )));
        }
        if interval > max {
            return Err(ScheduleError::Validation(format!(
                "{frequency} interval must be at most {max}, got {interval}"
            )));
        }

        if let Some(end) = raw.end_time {
            if end <= raw.start_time {
                return Err(ScheduleError::Validation(
                    "end_time must be after start_time".into(),
                ));
            }
        }

        let cron_expression = match frequency {
            Frequency::Custom => {
                let expr = raw.cron.as_deref().map(str::trim).unwrap_or_default();
                parse_cron(expr)?;
                expr.to_string()
            }
            _ => frequency_to_cron(frequency, raw.start_time, interval)?,
        };

        Ok(Self {
            frequency,
            interval,
            start_time: raw.start_time,
            end_time: raw.end_time,
            cron_expression,
        })
    }
}

fn parse_interval(value: &serde_json::Value) -> Result<u32, ScheduleError> {
    let parsed = match value {
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
        serde_json::Value::Number(n) => n.as_i64(),
        _ => None,
    };
    match parsed {
        Some(n) if n > 0 => {
            u32::try_from(n).map_err(|_| ScheduleError::InvalidInterval(value.to_string()))
        }
        _ => Err(ScheduleError::InvalidInterval(value.to_string())),
    }
}
