//! Five-field cron expressions with timezone-aware matching.
//!
//! `minute hour day-of-month month day-of-week`, supporting `*`, lists,
//! ranges, `/step`, and names for months and weekdays. Day-of-week
//! accepts 0-7 with both 0 and 7 meaning Sunday.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use chrono_tz::Tz;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: Vec<u8>,
    hour: Vec<u8>,
    day_of_month: Vec<u8>,
    month: Vec<u8>,
    day_of_week: Vec<u8>,
}

const MONTH_NAMES: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DOW_NAMES: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

impl CronExpr {
    pub fn parse(source: &str) -> Result<CronExpr, String> {
        let fields: Vec<&str> = source.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(format!(
                "cron expression must have 5 fields (minute hour dom month dow): {source}"
            ));
        }
        Ok(CronExpr {
            minute: parse_field(fields[0], 0, 59, None)?,
            hour: parse_field(fields[1], 0, 23, None)?,
            day_of_month: parse_field(fields[2], 1, 31, None)?,
            month: parse_field(fields[3], 1, 12, Some(MONTH_NAMES))?,
            day_of_week: parse_dow(fields[4])?,
        })
    }

    /// Whether the minute containing `instant` matches, in `tz`.
    pub fn matches(&self, instant: DateTime<Utc>, tz: &Tz) -> bool {
        let local = instant.with_timezone(tz);
        self.minute.contains(&(local.minute() as u8))
            && self.hour.contains(&(local.hour() as u8))
            && self.day_of_month.contains(&(local.day() as u8))
            && self.month.contains(&(local.month() as u8))
            && self
                .day_of_week
                .contains(&(local.weekday().num_days_from_sunday() as u8))
    }

    /// Next matching minute strictly after `after`, scanning at most two
    /// years ahead.
    pub fn next_after(&self, after: DateTime<Utc>, tz: &Tz) -> Option<DateTime<Utc>> {
        let mut candidate = (after + Duration::minutes(1))
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))?;
        let limit = after + Duration::days(730);
        while candidate <= limit {
            if self.matches(candidate, tz) {
                return Some(candidate);
            }
            candidate += Duration::minutes(1);
        }
        None
    }
}

fn parse_dow(field: &str) -> Result<Vec<u8>, String> {
    let mut values = parse_field(field, 0, 7, Some(DOW_NAMES))?;
    if values.contains(&7) {
        values.retain(|v| *v != 7);
        if !values.contains(&0) {
            values.insert(0, 0);
        }
    }
    Ok(values)
}

fn parse_field(
    field: &str,
    min: u8,
    max: u8,
    names: Option<&[&str]>,
) -> Result<Vec<u8>, String> {
    let mut values = Vec::new();
    for segment in field.split(',') {
        let (range, step) = match segment.split_once('/') {
            Some((range, step)) => {
                let step: u8 = step
                    .parse()
                    .map_err(|_| format!("invalid cron step: {step}"))?;
                if step == 0 {
                    return Err("cron step must be >= 1".to_string());
                }
                (range, step)
            }
            None => (segment, 1),
        };
        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((from, to)) = range.split_once('-') {
            (parse_atom(from, min, max, names)?, parse_atom(to, min, max, names)?)
        } else {
            let value = parse_atom(range, min, max, names)?;
            (value, value)
        };
        if start > end {
            return Err(format!("descending cron range: {segment}"));
        }
        let mut v = start;
        while v <= end {
            if !values.contains(&v) {
                values.push(v);
            }
            match v.checked_add(step) {
                Some(next) => v = next,
                None => break,
            }
        }
    }
    if values.is_empty() {
        return Err(format!("empty cron field: {field}"));
    }
    values.sort_unstable();
    Ok(values)
}

fn parse_atom(atom: &str, min: u8, max: u8, names: Option<&[&str]>) -> Result<u8, String> {
    if let Some(names) = names {
        let upper = atom.to_ascii_uppercase();
        if let Some(pos) = names.iter().position(|n| *n == upper) {
            // Names map onto the field's numeric base.
            return Ok(if min == 1 { pos as u8 + 1 } else { pos as u8 });
        }
    }
    let value: u8 = atom
        .parse()
        .map_err(|_| format!("invalid cron value: {atom}"))?;
    if value < min || value > max {
        return Err(format!("cron value {value} out of range {min}-{max}"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Tz;

    fn utc() -> Tz {
        "UTC".parse().unwrap()
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_parse_and_match_exact() {
        let expr = CronExpr::parse("0 9 * * MON").unwrap();
        // 2026-08-03 is a Monday.
        assert!(expr.matches(at(2026, 8, 3, 9, 0), &utc()));
        assert!(!expr.matches(at(2026, 8, 3, 9, 1), &utc()));
        assert!(!expr.matches(at(2026, 8, 4, 9, 0), &utc()));
    }

    #[test]
    fn test_steps_and_ranges() {
        let expr = CronExpr::parse("*/15 9-17 * * 1-5").unwrap();
        assert!(expr.matches(at(2026, 8, 3, 9, 30), &utc()));
        assert!(expr.matches(at(2026, 8, 3, 17, 45), &utc()));
        assert!(!expr.matches(at(2026, 8, 3, 8, 45), &utc()));
        // Saturday.
        assert!(!expr.matches(at(2026, 8, 1, 10, 0), &utc()));
    }

    #[test]
    fn test_sunday_as_seven() {
        let expr = CronExpr::parse("0 0 * * 7").unwrap();
        // 2026-08-02 is a Sunday.
        assert!(expr.matches(at(2026, 8, 2, 0, 0), &utc()));
    }

    #[test]
    fn test_timezone_shifts_match() {
        let tokyo: Tz = "Asia/Tokyo".parse().unwrap();
        let expr = CronExpr::parse("0 9 * * *").unwrap();
        // 00:00 UTC == 09:00 JST.
        assert!(expr.matches(at(2026, 8, 3, 0, 0), &tokyo));
        assert!(!expr.matches(at(2026, 8, 3, 9, 0), &tokyo));
    }

    #[test]
    fn test_next_after() {
        let expr = CronExpr::parse("30 6 * * *").unwrap();
        let next = expr.next_after(at(2026, 8, 3, 7, 0), &utc()).unwrap();
        assert_eq!(next, at(2026, 8, 4, 6, 30));
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(CronExpr::parse("* * * *").is_err());
        assert!(CronExpr::parse("61 * * * *").is_err());
        assert!(CronExpr::parse("*/0 * * * *").is_err());
        assert!(CronExpr::parse("5-1 * * * *").is_err());
    }
}
