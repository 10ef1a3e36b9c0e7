use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc, Weekday};
use tracing::warn;

use crate::error::{HavenError, Result};

/// Number of period steps scanned before giving up on a rule whose BY-parts
/// never produce a future instant. Roughly four years for daily rules.
const SEARCH_HORIZON: u32 = 1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Freq {
    Minutely,
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

/// A parsed iCalendar-style recurrence rule.
///
/// Supported parts: `FREQ` (MINUTELY/HOURLY/DAILY/WEEKLY/MONTHLY),
/// `INTERVAL`, `BYHOUR`, `BYMINUTE`, `BYDAY` (MO..SU), `COUNT`, `UNTIL`
/// (`YYYYMMDDTHHMMSSZ`). Anything else is rejected at parse time so a typo
/// surfaces when the automation is created, not when it silently never fires.
#[derive(Debug, Clone, PartialEq)]
pub struct RecurrenceRule {
    freq: Freq,
    interval: u32,
    by_hour: Vec<u32>,
    by_minute: Vec<u32>,
    by_day: Vec<Weekday>,
    count: Option<u32>,
    until: Option<DateTime<Utc>>,
}

impl RecurrenceRule {
    /// Parse an `RRULE` content line, with or without the `RRULE:` prefix.
    pub fn parse(rule: &str) -> Result<Self> {
        let body = rule.trim().strip_prefix("RRULE:").unwrap_or(rule.trim());
        if body.is_empty() {
            return Err(HavenError::Recurrence("empty rule".into()));
        }

        let mut freq = None;
        let mut interval = 1u32;
        let mut by_hour = Vec::new();
        let mut by_minute = Vec::new();
        let mut by_day = Vec::new();
        let mut count = None;
        let mut until = None;

        for part in body.split(';') {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| HavenError::Recurrence(format!("malformed part: {part}")))?;
            match key.to_ascii_uppercase().as_str() {
                "FREQ" => {
                    freq = Some(match value.to_ascii_uppercase().as_str() {
                        "MINUTELY" => Freq::Minutely,
                        "HOURLY" => Freq::Hourly,
                        "DAILY" => Freq::Daily,
                        "WEEKLY" => Freq::Weekly,
                        "MONTHLY" => Freq::Monthly,
                        other => {
                            return Err(HavenError::Recurrence(format!(
                                "unsupported FREQ: {other}"
                            )))
                        }
                    });
                }
                "INTERVAL" => {
                    interval = value.parse().map_err(|_| {
                        HavenError::Recurrence(format!("bad INTERVAL: {value}"))
                    })?;
                    if interval == 0 {
                        return Err(HavenError::Recurrence("INTERVAL must be >= 1".into()));
                    }
                }
                "BYHOUR" => {
                    by_hour = parse_numeric_list(value, 23, "BYHOUR")?;
                }
                "BYMINUTE" => {
                    by_minute = parse_numeric_list(value, 59, "BYMINUTE")?;
                }
                "BYDAY" => {
                    for day in value.split(',') {
                        by_day.push(parse_weekday(day)?);
                    }
                }
                "COUNT" => {
                    count = Some(value.parse().map_err(|_| {
                        HavenError::Recurrence(format!("bad COUNT: {value}"))
                    })?);
                }
                "UNTIL" => {
                    until = Some(parse_until(value)?);
                }
                other => {
                    return Err(HavenError::Recurrence(format!(
                        "unsupported rule part: {other}"
                    )))
                }
            }
        }

        let freq =
            freq.ok_or_else(|| HavenError::Recurrence("rule is missing FREQ".into()))?;

        Ok(Self {
            freq,
            interval,
            by_hour,
            by_minute,
            by_day,
            count,
            until,
        })
    }

    /// Compute the first occurrence strictly after `after`.
    ///
    /// Returns `None` when the rule is exhausted (COUNT consumed, UNTIL
    /// passed, or the bounded search horizon was scanned without a match).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        // Seconds never participate in the supported BY-parts; work at
        // minute resolution anchored on `after`.
        let anchor = after
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(after);

        let mut emitted = 0u32;
        for step in 0..SEARCH_HORIZON {
            for candidate in self.candidates_for_step(anchor, step) {
                if let Some(until) = self.until {
                    if candidate > until {
                        return None;
                    }
                }
                if let Some(count) = self.count {
                    if emitted >= count {
                        return None;
                    }
                }
                emitted += 1;
                if candidate > after {
                    return Some(candidate);
                }
            }
        }

        warn!(rule = ?self, "recurrence search horizon exhausted without a match");
        None
    }

    /// All occurrence instants produced by period `step`, in order.
    fn candidates_for_step(&self, anchor: DateTime<Utc>, step: u32) -> Vec<DateTime<Utc>> {
        let offset = (step * self.interval) as i64;
        match self.freq {
            Freq::Minutely => {
                let t = anchor + Duration::minutes(offset);
                if self.hour_matches(t.hour()) && self.minute_matches(t.minute()) {
                    vec![t]
                } else {
                    vec![]
                }
            }
            Freq::Hourly => {
                let base = anchor + Duration::hours(offset);
                if !self.hour_matches(base.hour()) {
                    return vec![];
                }
                self.minutes_or(base.minute())
                    .into_iter()
                    .filter_map(|m| base.with_minute(m))
                    .collect()
            }
            Freq::Daily => {
                let day = anchor + Duration::days(offset);
                if !self.day_matches(day.weekday()) {
                    return vec![];
                }
                self.times_on(day)
            }
            Freq::Weekly => {
                let week_anchor = anchor + Duration::weeks(offset);
                // Expand every matching weekday within the 7-day window
                // starting at the anchor's weekday.
                let mut out = Vec::new();
                for d in 0..7 {
                    let day = week_anchor + Duration::days(d);
                    let matches = if self.by_day.is_empty() {
                        day.weekday() == anchor.weekday()
                    } else {
                        self.by_day.contains(&day.weekday())
                    };
                    if matches {
                        out.extend(self.times_on(day));
                    }
                }
                out
            }
            Freq::Monthly => {
                let months = step * self.interval;
                let Some(day) = add_months(anchor, months) else {
                    return vec![];
                };
                if !self.day_matches(day.weekday()) {
                    return vec![];
                }
                self.times_on(day)
            }
        }
    }

    /// Concrete instants on `day`, crossing BYHOUR × BYMINUTE.
    ///
    /// When BYHOUR is present but BYMINUTE is not, minutes default to :00 —
    /// "every day at 7" means 07:00, not 07:<whenever-the-rule-was-made>.
    fn times_on(&self, day: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let hours: Vec<u32> = if self.by_hour.is_empty() {
            vec![day.hour()]
        } else {
            self.by_hour.clone()
        };
        let minutes: Vec<u32> = if self.by_minute.is_empty() {
            if self.by_hour.is_empty() {
                vec![day.minute()]
            } else {
                vec![0]
            }
        } else {
            self.by_minute.clone()
        };

        let mut out = Vec::new();
        for &h in &hours {
            for &m in &minutes {
                if let Some(t) = Utc
                    .with_ymd_and_hms(day.year(), day.month(), day.day(), h, m, 0)
                    .single()
                {
                    out.push(t);
                }
            }
        }
        out.sort();
        out
    }

    fn minutes_or(&self, default: u32) -> Vec<u32> {
        if self.by_minute.is_empty() {
            vec![default]
        } else {
            self.by_minute.clone()
        }
    }

    fn hour_matches(&self, hour: u32) -> bool {
        self.by_hour.is_empty() || self.by_hour.contains(&hour)
    }

    fn minute_matches(&self, minute: u32) -> bool {
        self.by_minute.is_empty() || self.by_minute.contains(&minute)
    }

    fn day_matches(&self, day: Weekday) -> bool {
        self.by_day.is_empty() || self.by_day.contains(&day)
    }
}

/// Parse-and-evaluate convenience: the storage and queue layers only ever
/// need "the next instant after X for this rule string".
pub fn next_after(rule: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    Ok(RecurrenceRule::parse(rule)?.next_after(after))
}

fn parse_numeric_list(value: &str, max: u32, part: &str) -> Result<Vec<u32>> {
    let mut out = Vec::new();
    for item in value.split(',') {
        let n: u32 = item
            .parse()
            .map_err(|_| HavenError::Recurrence(format!("bad {part}: {item}")))?;
        if n > max {
            return Err(HavenError::Recurrence(format!(
                "{part} value {n} out of range 0..={max}"
            )));
        }
        out.push(n);
    }
    out.sort_unstable();
    out.dedup();
    Ok(out)
}

fn parse_weekday(token: &str) -> Result<Weekday> {
    match token.to_ascii_uppercase().as_str() {
        "MO" => Ok(Weekday::Mon),
        "TU" => Ok(Weekday::Tue),
        "WE" => Ok(Weekday::Wed),
        "TH" => Ok(Weekday::Thu),
        "FR" => Ok(Weekday::Fri),
        "SA" => Ok(Weekday::Sat),
        "SU" => Ok(Weekday::Sun),
        other => Err(HavenError::Recurrence(format!("bad BYDAY token: {other}"))),
    }
}

fn parse_until(value: &str) -> Result<DateTime<Utc>> {
    // iCalendar UTC form: 20250310T070000Z
    let cleaned = value.trim_end_matches('Z');
    let parsed = chrono::NaiveDateTime::parse_from_str(cleaned, "%Y%m%dT%H%M%S")
        .or_else(|_| {
            chrono::NaiveDate::parse_from_str(cleaned, "%Y%m%d")
                .map(|d| d.and_hms_opt(23, 59, 59).unwrap())
        })
        .map_err(|_| HavenError::Recurrence(format!("bad UNTIL: {value}")))?;
    Ok(Utc.from_utc_datetime(&parsed))
}

/// Month arithmetic that clamps nothing: months lacking the anchor day
/// (e.g. the 31st) yield no candidate rather than shifting to a nearby day.
fn add_months(anchor: DateTime<Utc>, months: u32) -> Option<DateTime<Utc>> {
    let total = anchor.month0() + months;
    let year = anchor.year() + (total / 12) as i32;
    let month = total % 12 + 1;
    Utc.with_ymd_and_hms(
        year,
        month,
        anchor.day(),
        anchor.hour(),
        anchor.minute(),
        0,
    )
    .single()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn daily_by_hour_picks_next_seven_am() {
        let rule = RecurrenceRule::parse("FREQ=DAILY;BYHOUR=7").unwrap();
        // Asked at 09:30 — next occurrence is tomorrow 07:00.
        let next = rule.next_after(at(2025, 3, 1, 9, 30)).unwrap();
        assert_eq!(next, at(2025, 3, 2, 7, 0));
        // Asked at 05:10 — today 07:00.
        let next = rule.next_after(at(2025, 3, 1, 5, 10)).unwrap();
        assert_eq!(next, at(2025, 3, 1, 7, 0));
    }

    #[test]
    fn weekly_byday_weekdays_only() {
        let rule = RecurrenceRule::parse("FREQ=DAILY;BYDAY=MO,TU,WE,TH,FR;BYHOUR=7").unwrap();
        // 2025-03-01 is a Saturday — next weekday occurrence is Monday 03-03.
        let next = rule.next_after(at(2025, 3, 1, 12, 0)).unwrap();
        assert_eq!(next, at(2025, 3, 3, 7, 0));
    }

    #[test]
    fn weekly_advances_a_full_week() {
        let rule = RecurrenceRule::parse("FREQ=WEEKLY;BYDAY=WE;BYHOUR=18;BYMINUTE=30").unwrap();
        // 2025-03-05 is a Wednesday; asked after that day's slot has passed.
        let next = rule.next_after(at(2025, 3, 5, 19, 0)).unwrap();
        assert_eq!(next, at(2025, 3, 12, 18, 30));
    }

    #[test]
    fn hourly_with_interval() {
        let rule = RecurrenceRule::parse("FREQ=HOURLY;INTERVAL=2").unwrap();
        let next = rule.next_after(at(2025, 3, 1, 10, 15)).unwrap();
        assert_eq!(next, at(2025, 3, 1, 12, 15));
    }

    #[test]
    fn minutely_interval() {
        let rule = RecurrenceRule::parse("FREQ=MINUTELY;INTERVAL=15").unwrap();
        let next = rule.next_after(at(2025, 3, 1, 10, 0)).unwrap();
        assert_eq!(next, at(2025, 3, 1, 10, 15));
    }

    #[test]
    fn until_exhausts_rule() {
        let rule =
            RecurrenceRule::parse("FREQ=DAILY;BYHOUR=7;UNTIL=20250302T000000Z").unwrap();
        assert_eq!(rule.next_after(at(2025, 3, 1, 5, 0)), Some(at(2025, 3, 1, 7, 0)));
        assert_eq!(rule.next_after(at(2025, 3, 1, 8, 0)), None);
    }

    #[test]
    fn count_limits_occurrences() {
        let rule = RecurrenceRule::parse("FREQ=DAILY;BYHOUR=7;COUNT=1").unwrap();
        // One occurrence allowed from the anchor; the first future one exists…
        assert!(rule.next_after(at(2025, 3, 1, 5, 0)).is_some());
    }

    #[test]
    fn monthly_skips_short_months() {
        let rule = RecurrenceRule::parse("FREQ=MONTHLY;BYHOUR=9").unwrap();
        // Anchored on Jan 31 — February has no 31st, so March 31 is next.
        let next = rule.next_after(at(2025, 1, 31, 10, 0)).unwrap();
        assert_eq!(next, at(2025, 3, 31, 9, 0));
    }

    #[test]
    fn invalid_rules_error() {
        assert!(RecurrenceRule::parse("").is_err());
        assert!(RecurrenceRule::parse("FREQ=FORTNIGHTLY").is_err());
        assert!(RecurrenceRule::parse("BYHOUR=7").is_err());
        assert!(RecurrenceRule::parse("FREQ=DAILY;BYHOUR=26").is_err());
        assert!(RecurrenceRule::parse("FREQ=DAILY;BYDAY=XX").is_err());
        assert!(RecurrenceRule::parse("FREQ=DAILY;INTERVAL=0").is_err());
    }

    #[test]
    fn rrule_prefix_accepted() {
        let a = RecurrenceRule::parse("RRULE:FREQ=DAILY;BYHOUR=7").unwrap();
        let b = RecurrenceRule::parse("FREQ=DAILY;BYHOUR=7").unwrap();
        assert_eq!(a, b);
    }
}
