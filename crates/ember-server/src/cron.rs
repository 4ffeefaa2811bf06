//! Five-field cron expressions for plugin schedules.
//!
//! Supports `*`, numbers, comma lists, `a-b` ranges and `*/n` or `a-b/n`
//! steps in the classic `minute hour day month weekday` layout, matched in
//! UTC. Weekday 0 is Sunday.

use chrono::{DateTime, Datelike, Timelike, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("bad cron spec: {0}")]
pub struct CronError(String);

/// A parsed cron schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSpec {
    minute: Field,
    hour: Field,
    day: Field,
    month: Field,
    weekday: Field,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Field {
    Any,
    /// Sorted, deduplicated admissible values.
    Values(Vec<u32>),
}

impl Field {
    fn matches(&self, value: u32) -> bool {
        match self {
            Field::Any => true,
            Field::Values(values) => values.binary_search(&value).is_ok(),
        }
    }
}

impl CronSpec {
    /// Parse a five-field expression.
    ///
    /// # Errors
    ///
    /// Returns an error when the field count is wrong, a value is out of
    /// range, or a term does not parse.
    pub fn parse(spec: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = spec.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError(format!(
                "expected 5 fields, got {} in `{spec}`",
                fields.len()
            )));
        }
        Ok(Self {
            minute: parse_field(fields[0], 0, 59)?,
            hour: parse_field(fields[1], 0, 23)?,
            day: parse_field(fields[2], 1, 31)?,
            month: parse_field(fields[3], 1, 12)?,
            weekday: parse_field(fields[4], 0, 6)?,
        })
    }

    /// Whether the schedule fires at the minute containing `at`.
    #[must_use]
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.minute.matches(at.minute())
            && self.hour.matches(at.hour())
            && self.day.matches(at.day())
            && self.month.matches(at.month())
            && self.weekday.matches(at.weekday().num_days_from_sunday())
    }
}

fn parse_field(field: &str, min: u32, max: u32) -> Result<Field, CronError> {
    if field == "*" {
        return Ok(Field::Any);
    }
    let mut values = Vec::new();
    for term in field.split(',') {
        let (range, step) = match term.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| CronError(format!("bad step in `{term}`")))?;
                if step == 0 {
                    return Err(CronError(format!("zero step in `{term}`")));
                }
                (range, step)
            }
            None => (term, 1),
        };
        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (
                parse_bounded(lo, min, max)?,
                parse_bounded(hi, min, max)?,
            )
        } else {
            let v = parse_bounded(range, min, max)?;
            (v, v)
        };
        if lo > hi {
            return Err(CronError(format!("inverted range `{term}`")));
        }
        values.extend((lo..=hi).step_by(step as usize));
    }
    values.sort_unstable();
    values.dedup();
    Ok(Field::Values(values))
}

fn parse_bounded(raw: &str, min: u32, max: u32) -> Result<u32, CronError> {
    let value: u32 = raw
        .parse()
        .map_err(|_| CronError(format!("bad value `{raw}`")))?;
    if value < min || value > max {
        return Err(CronError(format!(
            "value {value} out of range {min}-{max}"
        )));
    }
    Ok(value)
}
