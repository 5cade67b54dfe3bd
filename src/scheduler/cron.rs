//! Standard 5-field cron expressions, evaluated in UTC.
//!
//! `minute hour day-of-month month day-of-week`. Each field accepts `*`,
//! single values, ranges `a-b`, steps `*/n` and `a-b/n`, and comma lists.
//! Day-of-week runs 0-7 with both 0 and 7 meaning Sunday. When both day
//! fields are restricted a day matches if either does.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};

use crate::errors::TriageError;

/// Search horizon for `next_after`; covers leap-day schedules.
const MAX_SEARCH_DAYS: i64 = 366 * 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expr: String,
    minutes: u64,
    hours: u32,
    days_of_month: u32,
    months: u16,
    days_of_week: u8,
    dom_restricted: bool,
    dow_restricted: bool,
}

fn invalid(expr: &str, message: impl Into<String>) -> TriageError {
    TriageError::InvalidCron {
        expr: expr.to_string(),
        message: message.into(),
    }
}

/// Parse one field into a bitmask over `min..=max`.
fn parse_field(expr: &str, field: &str, name: &str, min: u32, max: u32) -> Result<u64, TriageError> {
    let mut mask = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| invalid(expr, format!("bad step '{}' in cron {} field", step, name)))?;
                if step == 0 {
                    return Err(invalid(expr, format!("zero step in cron {} field", name)));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let value = |s: &str| -> Result<u32, TriageError> {
            let v: u32 = s
                .parse()
                .map_err(|_| invalid(expr, format!("bad value '{}' in cron {} field", s, name)))?;
            if v < min || v > max {
                return Err(invalid(
                    expr,
                    format!("{} out of range {}-{} in cron {} field", v, min, max, name),
                ));
            }
            Ok(v)
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let (a, b) = (value(a)?, value(b)?);
            if a > b {
                return Err(invalid(expr, format!("reversed range '{}' in cron {} field", range, name)));
            }
            (a, b)
        } else {
            let v = value(range)?;
            // `a/n` means from a to the end of the field.
            if part.contains('/') { (v, max) } else { (v, v) }
        };

        let mut v = start;
        while v <= end {
            mask |= 1 << v;
            v += step;
        }
    }
    Ok(mask)
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, TriageError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(
                expr,
                format!("cron expression needs 5 fields, got {}", fields.len()),
            ));
        }

        let minutes = parse_field(expr, fields[0], "minute", 0, 59)?;
        let hours = parse_field(expr, fields[1], "hour", 0, 23)? as u32;
        let days_of_month = parse_field(expr, fields[2], "day-of-month", 1, 31)? as u32;
        let months = parse_field(expr, fields[3], "month", 1, 12)? as u16;
        let mut dow = parse_field(expr, fields[4], "day-of-week", 0, 7)?;
        if dow & (1 << 7) != 0 {
            dow = (dow | 1) & !(1 << 7);
        }

        Ok(Self {
            expr: expr.to_string(),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week: dow as u8,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        if self.months & (1 << date.month()) == 0 {
            return false;
        }
        let dom = self.days_of_month & (1 << date.day()) != 0;
        let dow = self.days_of_week & (1 << date.weekday().num_days_from_sunday()) != 0;
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// First (hour, minute) on a matching day at or after `from`.
    fn first_time_from(&self, from: NaiveTime) -> Option<NaiveTime> {
        for hour in from.hour()..24 {
            if self.hours & (1 << hour) == 0 {
                continue;
            }
            let start_minute = if hour == from.hour() { from.minute() } else { 0 };
            for minute in start_minute..60 {
                if self.minutes & (1 << minute) != 0 {
                    return NaiveTime::from_hms_opt(hour, minute, 0);
                }
            }
        }
        None
    }

    /// The first firing time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))?
            + Duration::minutes(1);
        let mut date = start.date_naive();
        let mut from = start.time();

        for _ in 0..MAX_SEARCH_DAYS {
            if self.day_matches(date)
                && let Some(time) = self.first_time_from(from)
            {
                return Some(Utc.from_utc_datetime(&date.and_time(time)));
            }
            date = date.succ_opt()?;
            from = NaiveTime::MIN;
        }
        None
    }
}
