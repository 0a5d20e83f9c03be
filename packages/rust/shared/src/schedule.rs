//! Schedule definitions and next-run arithmetic.
//!
//! All four schedule types resolve to a wall-clock instant (UTC). The
//! scheduler fires exactly at the computed `next_run`, so the displayed and
//! the actual cadence are the same thing.
//!
//! Value formats:
//! - `interval`: `15` (minutes) or a suffixed duration (`30s`, `15m`, `6h`, `1d`)
//! - `daily`: `HH:MM`
//! - `weekly`: `<weekday> HH:MM`, e.g. `mon 09:30`
//! - `monthly`: `<day> HH:MM`, day 1-31, clamped to the month's length

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SiteflowError};

/// Cadence family of a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Interval,
    Daily,
    Weekly,
    Monthly,
}

/// A schedule as written in a definition: `{"type": "daily", "value": "08:00"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(rename = "type")]
    pub kind: ScheduleKind,
    pub value: String,
}

impl Schedule {
    /// Shorthand for an interval schedule in minutes.
    pub fn interval_minutes(minutes: u32) -> Self {
        Self {
            kind: ScheduleKind::Interval,
            value: minutes.to_string(),
        }
    }

    /// Validate and parse the value for this schedule's kind.
    pub fn parse(&self) -> Result<Cadence> {
        let value = self.value.trim();
        match self.kind {
            ScheduleKind::Interval => parse_interval(value).map(Cadence::Interval),
            ScheduleKind::Daily => parse_time(value).map(Cadence::Daily),
            ScheduleKind::Weekly => {
                let (day, time) = split_day_time(value)?;
                let weekday = day.parse::<Weekday>().map_err(|_| {
                    SiteflowError::scheduling(format!("invalid weekday '{day}' in '{value}'"))
                })?;
                Ok(Cadence::Weekly(weekday, parse_time(time)?))
            }
            ScheduleKind::Monthly => {
                let (day, time) = split_day_time(value)?;
                let day: u32 = day.parse().map_err(|_| {
                    SiteflowError::scheduling(format!("invalid day of month '{day}' in '{value}'"))
                })?;
                if !(1..=31).contains(&day) {
                    return Err(SiteflowError::scheduling(format!(
                        "day of month must be 1-31, got {day}"
                    )));
                }
                Ok(Cadence::Monthly(day, parse_time(time)?))
            }
        }
    }

    /// Parse and compute the first fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        Ok(self.parse()?.next_after(after))
    }

    /// Next fire time counted from `base` that is still in the future.
    /// Firings missed between `base` and `now` are skipped, not replayed.
    pub fn next_due(&self, base: DateTime<Utc>, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let cadence = self.parse()?;
        let mut next = cadence.next_after(base);
        if next <= now {
            next = match cadence {
                // Stay on the base + k * period grid.
                Cadence::Interval(period) => {
                    let behind = (now - next).num_milliseconds();
                    let step = period.num_milliseconds().max(1);
                    next + Duration::milliseconds((behind / step + 1) * step)
                }
                _ => cadence.next_after(now),
            };
        }
        Ok(next)
    }
}

/// A validated schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Interval(Duration),
    Daily(NaiveTime),
    Weekly(Weekday, NaiveTime),
    Monthly(u32, NaiveTime),
}

impl Cadence {
    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Self::Interval(period) => after + period,
            Self::Daily(time) => {
                let today = at(after.date_naive(), time);
                if today > after {
                    today
                } else {
                    today + Duration::days(1)
                }
            }
            Self::Weekly(weekday, time) => {
                let current = after.weekday().num_days_from_monday() as i64;
                let target = weekday.num_days_from_monday() as i64;
                let ahead = (target - current).rem_euclid(7);
                let candidate = at(after.date_naive() + Duration::days(ahead), time);
                if candidate > after {
                    candidate
                } else {
                    candidate + Duration::days(7)
                }
            }
            Self::Monthly(day, time) => {
                let (mut year, mut month) = (after.year(), after.month());
                loop {
                    let candidate = at(month_day(year, month, day), time);
                    if candidate > after {
                        return candidate;
                    }
                    if month == 12 {
                        year += 1;
                        month = 1;
                    } else {
                        month += 1;
                    }
                }
            }
        }
    }
}

fn at(date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(time))
}

/// `day` in the given month, clamped to the month's last day.
fn month_day(year: i32, month: u32, day: u32) -> NaiveDate {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    let last = first_of_next
        .and_then(|d| d.pred_opt())
        .map_or(28, |d| d.day());
    NaiveDate::from_ymd_opt(year, month, day.min(last)).unwrap_or(NaiveDate::MIN)
}

fn parse_interval(value: &str) -> Result<Duration> {
    let invalid = || {
        SiteflowError::scheduling(format!(
            "invalid interval '{value}': expected minutes or a duration like 30s, 15m, 6h, 1d"
        ))
    };

    let (digits, unit) = match value.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((idx, _)) => value.split_at(idx),
        None => (value, "m"),
    };
    let amount: i64 = digits.parse().map_err(|_| invalid())?;
    if amount <= 0 {
        return Err(SiteflowError::scheduling(format!(
            "interval must be positive, got '{value}'"
        )));
    }

    match unit.trim() {
        "s" => Ok(Duration::seconds(amount)),
        "m" => Ok(Duration::minutes(amount)),
        "h" => Ok(Duration::hours(amount)),
        "d" => Ok(Duration::days(amount)),
        _ => Err(invalid()),
    }
}

fn parse_time(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|_| SiteflowError::scheduling(format!("invalid time '{value}': expected HH:MM")))
}

fn split_day_time(value: &str) -> Result<(&str, &str)> {
    value.split_once(char::is_whitespace).ok_or_else(|| {
        SiteflowError::scheduling(format!("invalid schedule '{value}': expected '<day> HH:MM'"))
    })
}
