//! Cron expression parsing and next-trigger computation.
//!
//! Accepts standard 5-field expressions, 6-field expressions with a leading
//! seconds field, and the usual descriptors:
//! ```text
//! ┌───────────── second (0-59, 6-field form only)
//! │ ┌───────────── minute (0-59)
//! │ │ ┌───────────── hour (0-23)
//! │ │ │ ┌───────────── day of month (1-31)
//! │ │ │ │ ┌───────────── month (1-12)
//! │ │ │ │ │ ┌───────────── day of week (0-6, 0 or 7 = Sunday)
//! │ │ │ │ │ │
//! * * * * * *
//! ```
//! `@yearly`, `@annually`, `@monthly`, `@weekly`, `@daily`, `@midnight` and
//! `@hourly` are expanded before parsing. Times are local wall-clock times.
//!
//! Five fields always start at the minute, as in crontab. Schedulers that read
//! five fields as `sec min hour dom month` disagree here: `0 5 * * *` fires
//! daily at 05:00, not hourly at minute 5. Write those schedules in the
//! six-field form. Interval descriptors such as `@every 1h` are rejected.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("expected 5 or 6 fields, got {0}")]
    FieldCount(usize),
    #[error("unrecognized descriptor: {0}")]
    Descriptor(String),
    #[error("invalid value '{0}'")]
    Value(String),
    #[error("value {value} is out of range [{min}, {max}]")]
    OutOfRange { value: u32, min: u32, max: u32 },
    #[error("invalid range: {0}-{1}")]
    Range(u32, u32),
    #[error("invalid step: {0}")]
    Step(String),
}

/// Set of allowed values for one field, as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field {
    bits: u64,
    /// The field was written as a bare `*` or `?`.
    star: bool,
}

impl Field {
    fn parse(expr: &str, min: u32, max: u32) -> Result<Self, CronError> {
        let mut field = Field {
            bits: 0,
            star: false,
        };
        for part in expr.split(',') {
            field.parse_part(part, min, max)?;
        }
        Ok(field)
    }

    fn parse_part(&mut self, part: &str, min: u32, max: u32) -> Result<(), CronError> {
        let (range, step) = match part.split_once('/') {
            Some((range, step_str)) => {
                let step = step_str
                    .parse::<u32>()
                    .map_err(|_| CronError::Step(step_str.to_string()))?;
                if step == 0 {
                    return Err(CronError::Step(step_str.to_string()));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range == "*" || range == "?" {
            if step.is_none() {
                self.star = true;
            }
            (min, max)
        } else if let Some((start, end)) = range.split_once('-') {
            let start = parse_value(start)?;
            let end = parse_value(end)?;
            if start > end {
                return Err(CronError::Range(start, end));
            }
            (start, end)
        } else {
            let value = parse_value(range)?;
            // `5/15` starts at 5 and runs to the end of the range
            (value, if step.is_some() { max } else { value })
        };

        for value in [start, end] {
            if value < min || value > max {
                return Err(CronError::OutOfRange { value, min, max });
            }
        }

        let step = step.unwrap_or(1) as usize;
        for value in (start..=end).step_by(step) {
            self.bits |= 1 << value;
        }
        Ok(())
    }

    fn contains(&self, value: u32) -> bool {
        self.bits & (1 << value) != 0
    }
}

fn parse_value(s: &str) -> Result<u32, CronError> {
    s.parse::<u32>()
        .map_err(|_| CronError::Value(s.to_string()))
}

/// A parsed cron schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expr: String,
    second: Field,
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

impl CronSchedule {
    /// Parse a cron expression or descriptor.
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let trimmed = expr.trim();
        let expanded = if trimmed.starts_with('@') {
            expand_descriptor(trimmed)?
        } else {
            trimmed
        };

        let parts: Vec<&str> = expanded.split_whitespace().collect();
        let (second, rest) = match parts.len() {
            5 => ("0", &parts[..]),
            6 => (parts[0], &parts[1..]),
            n => return Err(CronError::FieldCount(n)),
        };

        let mut day_of_week = Field::parse(rest[4], 0, 7)?;
        // 7 is an alias for Sunday
        if day_of_week.contains(7) {
            day_of_week.bits = (day_of_week.bits & !(1 << 7)) | 1;
        }

        Ok(Self {
            expr: trimmed.to_string(),
            second: Field::parse(second, 0, 59)?,
            minute: Field::parse(rest[0], 0, 59)?,
            hour: Field::parse(rest[1], 0, 23)?,
            day_of_month: Field::parse(rest[2], 1, 31)?,
            month: Field::parse(rest[3], 1, 12)?,
            day_of_week,
        })
    }

    /// The expression this schedule was parsed from.
    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// Check if a time matches this schedule.
    pub fn matches(&self, at: &NaiveDateTime) -> bool {
        self.second.contains(at.second())
            && self.minute.contains(at.minute())
            && self.hour.contains(at.hour())
            && self.month.contains(at.month())
            && self.day_matches(&at.date())
    }

    /// Day-of-month and day-of-week are OR-ed when both are restricted,
    /// AND-ed otherwise.
    fn day_matches(&self, date: &NaiveDate) -> bool {
        let dom = self.day_of_month.contains(date.day());
        let dow = self
            .day_of_week
            .contains(date.weekday().num_days_from_sunday());
        if self.day_of_month.star || self.day_of_week.star {
            dom && dow
        } else {
            dom || dow
        }
    }

    /// The first trigger strictly after `after`, or `None` if there is no
    /// trigger within the next five years (e.g. `0 0 30 2 *`).
    pub fn next_after(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        let mut t = after.with_nanosecond(0)? + chrono::Duration::seconds(1);
        let last_year = t.year() + 5;

        loop {
            if t.year() > last_year {
                return None;
            }
            if !self.month.contains(t.month()) {
                let (year, month) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.day_matches(&t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hour.contains(t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + chrono::Duration::hours(1);
                continue;
            }
            if !self.minute.contains(t.minute()) {
                t = t.date().and_hms_opt(t.hour(), t.minute(), 0)?
                    + chrono::Duration::minutes(1);
                continue;
            }
            if !self.second.contains(t.second()) {
                t += chrono::Duration::seconds(1);
                continue;
            }
            return Some(t);
        }
    }
}

fn expand_descriptor(descriptor: &str) -> Result<&'static str, CronError> {
    match descriptor {
        "@yearly" | "@annually" => Ok("0 0 0 1 1 *"),
        "@monthly" => Ok("0 0 0 1 * *"),
        "@weekly" => Ok("0 0 0 * * 0"),
        "@daily" | "@midnight" => Ok("0 0 0 * * *"),
        "@hourly" => Ok("0 0 * * * *"),
        other => Err(CronError::Descriptor(other.to_string())),
    }
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronSchedule::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}
