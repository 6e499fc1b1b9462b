//! Time window parsing and evaluation.
//!
//! Window strings are `DAYS HH:MM-HH:MM ZONE`, e.g.
//! `MON-FRI 09:00-17:00 Asia/Tokyo` or `SAT,SUN 00:00-06:00 UTC`.
//! The literal `never` permits nothing and is represented by the caller
//! as the absence of a window.

use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TimeWindowError {
    #[error("invalid time window format: {0}")]
    Format(String),
    #[error("unknown day name: {0}")]
    UnknownDay(String),
    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),
    #[error("invalid time of day: {0}")]
    BadTime(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub days: Vec<Weekday>,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub timezone: Tz,
}

const DAY_NAMES: &[(&str, Weekday)] = &[
    ("MON", Weekday::Mon),
    ("TUE", Weekday::Tue),
    ("WED", Weekday::Wed),
    ("THU", Weekday::Thu),
    ("FRI", Weekday::Fri),
    ("SAT", Weekday::Sat),
    ("SUN", Weekday::Sun),
];

fn parse_day(name: &str) -> Result<Weekday, TimeWindowError> {
    let upper = name.trim().to_ascii_uppercase();
    let key = if upper.len() >= 3 { &upper[..3] } else { upper.as_str() };
    DAY_NAMES
        .iter()
        .find(|(abbr, _)| *abbr == key)
        .map(|(_, day)| *day)
        .ok_or_else(|| TimeWindowError::UnknownDay(name.to_string()))
}

fn day_index(day: Weekday) -> usize {
    day.num_days_from_monday() as usize
}

fn parse_time(text: &str) -> Result<NaiveTime, TimeWindowError> {
    NaiveTime::parse_from_str(text, "%H:%M").map_err(|_| TimeWindowError::BadTime(text.to_string()))
}

impl TimeWindow {
    /// Parse `DAYS HH:MM-HH:MM ZONE`. Day lists accept ranges (`MON-FRI`)
    /// and commas (`SAT,SUN`); ranges wrap across the week boundary.
    pub fn parse(source: &str) -> Result<TimeWindow, TimeWindowError> {
        let source = source.trim();
        if source.is_empty() || source.eq_ignore_ascii_case("never") {
            return Err(TimeWindowError::Format(source.to_string()));
        }

        let mut parts = source.rsplitn(3, ' ');
        let zone_text = parts.next().ok_or_else(|| TimeWindowError::Format(source.into()))?;
        let range_text = parts.next().ok_or_else(|| TimeWindowError::Format(source.into()))?;
        let days_text = parts.next().ok_or_else(|| TimeWindowError::Format(source.into()))?;

        let timezone: Tz = zone_text
            .parse()
            .map_err(|_| TimeWindowError::UnknownTimezone(zone_text.to_string()))?;

        let (start_text, end_text) = range_text
            .split_once('-')
            .ok_or_else(|| TimeWindowError::Format(range_text.to_string()))?;
        let start = parse_time(start_text)?;
        let end = parse_time(end_text)?;

        let mut days = Vec::new();
        for group in days_text.split(',') {
            let group = group.trim();
            if let Some((from, to)) = group.split_once('-') {
                let from = parse_day(from)?;
                let to = parse_day(to)?;
                let mut i = day_index(from);
                loop {
                    let day = DAY_NAMES[i].1;
                    if !days.contains(&day) {
                        days.push(day);
                    }
                    if day == to {
                        break;
                    }
                    i = (i + 1) % 7;
                }
            } else {
                let day = parse_day(group)?;
                if !days.contains(&day) {
                    days.push(day);
                }
            }
        }

        Ok(TimeWindow {
            days,
            start,
            end,
            timezone,
        })
    }

    /// Whether the instant falls inside the window. Overnight ranges
    /// (`23:00-06:00`) match when the window opened on an allowed day.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        let local = instant.with_timezone(&self.timezone);
        let now = NaiveTime::from_hms_opt(local.hour(), local.minute(), local.second())
            .expect("valid local time");
        let today = local.weekday();

        if self.start <= self.end {
            self.days.contains(&today) && now >= self.start && now <= self.end
        } else {
            // Overnight: after the start on an allowed day, or before the
            // end on the day following an allowed day.
            if now >= self.start {
                self.days.contains(&today)
            } else if now <= self.end {
                let yesterday = DAY_NAMES[(day_index(today) + 6) % 7].1;
                self.days.contains(&yesterday)
            } else {
                false
            }
        }
    }
}
