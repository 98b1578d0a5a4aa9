//! Cron pattern grammar for schedules.
//!
//! Five fields: `minute hour day-of-month month day-of-week`. Each field is a
//! comma-separated list of `*`, `N`, `A-B`, optionally followed by `/STEP`.
//! Months accept `jan`..`dec`, weekdays `sun`..`sat` (0 and 7 are Sunday).
//! When both day fields are restricted a time matches if either one does.

use std::str::FromStr;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    #[error("expected 5 fields, found {0}")]
    FieldCount(usize),
    #[error("invalid {field} field '{value}'")]
    InvalidField { field: &'static str, value: String },
    #[error("unknown macro '{0}'")]
    UnknownMacro(String),
}

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

struct FieldSpec {
    name: &'static str,
    min: u8,
    max: u8,
    names: &'static [&'static str],
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[] };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[] };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[] };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12, names: &MONTH_NAMES };
// 7 est accepté à la lecture puis replié sur 0 (dimanche)
const DAY_OF_WEEK: FieldSpec = FieldSpec { name: "day-of-week", min: 0, max: 7, names: &DAY_NAMES };

/// Motif cron compilé ; chaque champ est un masque de bits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronPattern {
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronPattern {
    pub fn matches(&self, at: OffsetDateTime) -> bool {
        let bit = |mask: u64, v: u8| mask & (1u64 << v) != 0;

        if !bit(self.minutes, at.minute())
            || !bit(self.hours, at.hour())
            || !bit(self.months, u8::from(at.month()))
        {
            return false;
        }

        let dom = bit(self.days_of_month, at.day());
        let dow = bit(self.days_of_week, at.weekday().number_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            _ => dom && dow,
        }
    }
}

impl FromStr for CronPattern {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let expanded = if trimmed.starts_with('@') {
            match trimmed {
                "@yearly" | "@annually" => "0 0 1 1 *",
                "@monthly" => "0 0 1 * *",
                "@weekly" => "0 0 * * 0",
                "@daily" | "@midnight" => "0 0 * * *",
                "@hourly" => "0 * * * *",
                other => return Err(CronError::UnknownMacro(other.to_string())),
            }
        } else {
            trimmed
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }

        let mut days_of_week = parse_field(fields[4], &DAY_OF_WEEK)?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(CronPattern {
            minutes: parse_field(fields[0], &MINUTE)?,
            hours: parse_field(fields[1], &HOUR)?,
            days_of_month: parse_field(fields[2], &DAY_OF_MONTH)?,
            months: parse_field(fields[3], &MONTH)?,
            days_of_week,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        })
    }
}

fn parse_field(raw: &str, spec: &FieldSpec) -> Result<u64, CronError> {
    let invalid = || CronError::InvalidField {
        field: spec.name,
        value: raw.to_string(),
    };

    let mut mask = 0u64;
    for part in raw.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u8 = step.parse().map_err(|_| invalid())?;
                if step == 0 {
                    return Err(invalid());
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, spec).ok_or_else(invalid)?, parse_value(b, spec).ok_or_else(invalid)?)
        } else {
            let v = parse_value(range, spec).ok_or_else(invalid)?;
            // "5/15" signifie de 5 jusqu'au max par pas de 15
            if step > 1 { (v, spec.max) } else { (v, v) }
        };

        if start > end {
            return Err(invalid());
        }
        let mut v = start;
        while v <= end {
            mask |= 1u64 << v;
            v = match v.checked_add(step) {
                Some(next) => next,
                None => break,
            };
        }
    }
    Ok(mask)
}

fn parse_value(raw: &str, spec: &FieldSpec) -> Option<u8> {
    let value = match raw.parse::<u8>() {
        Ok(v) => v,
        Err(_) => {
            let lower = raw.to_ascii_lowercase();
            let idx = spec.names.iter().position(|n| *n == lower)?;
            // les mois commencent à 1, les jours à 0
            u8::try_from(idx).ok()? + spec.min
        }
    };
    (spec.min..=spec.max).contains(&value).then_some(value)
}

/// Vrai si `pattern` déclenche à la minute de `now` (fonction pure)
pub fn would_run_now(pattern: &str, now: OffsetDateTime) -> Result<bool, CronError> {
    Ok(pattern.parse::<CronPattern>()?.matches(now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_every_minute() {
        assert!(would_run_now("* * * * *", datetime!(2024-05-17 13:42 UTC)).unwrap());
    }

    #[test]
    fn test_steps_and_ranges() {
        let p: CronPattern = "*/15 9-17 * * mon-fri".parse().unwrap();
        // vendredi 17 mai 2024
        assert!(p.matches(datetime!(2024-05-17 09:30 UTC)));
        assert!(!p.matches(datetime!(2024-05-17 09:31 UTC)));
        assert!(!p.matches(datetime!(2024-05-17 18:00 UTC)));
        // samedi
        assert!(!p.matches(datetime!(2024-05-18 10:00 UTC)));
    }

    #[test]
    fn test_start_with_step() {
        let p: CronPattern = "5/20 * * * *".parse().unwrap();
        assert!(p.matches(datetime!(2024-01-01 00:05 UTC)));
        assert!(p.matches(datetime!(2024-01-01 00:45 UTC)));
        assert!(!p.matches(datetime!(2024-01-01 00:00 UTC)));
    }

    #[test]
    fn test_day_fields_use_or_when_both_restricted() {
        // le 1er du mois OU un lundi
        let p: CronPattern = "0 0 1 * 1".parse().unwrap();
        assert!(p.matches(datetime!(2024-05-01 00:00 UTC))); // mercredi 1er
        assert!(p.matches(datetime!(2024-05-06 00:00 UTC))); // lundi
        assert!(!p.matches(datetime!(2024-05-07 00:00 UTC)));
    }

    #[test]
    fn test_sunday_as_seven_and_names() {
        let p: CronPattern = "0 12 * jun 7".parse().unwrap();
        assert!(p.matches(datetime!(2024-06-02 12:00 UTC))); // dimanche
        assert!(!p.matches(datetime!(2024-07-07 12:00 UTC)));
    }

    #[test]
    fn test_macros() {
        assert!(would_run_now("@hourly", datetime!(2024-02-29 07:00 UTC)).unwrap());
        assert!(!would_run_now("@daily", datetime!(2024-02-29 07:00 UTC)).unwrap());
        assert_eq!(
            "@fortnightly".parse::<CronPattern>(),
            Err(CronError::UnknownMacro("@fortnightly".into()))
        );
    }

    #[test]
    fn test_invalid_patterns() {
        assert_eq!("* * * *".parse::<CronPattern>(), Err(CronError::FieldCount(4)));
        assert!(matches!(
            "61 * * * *".parse::<CronPattern>(),
            Err(CronError::InvalidField { field: "minute", .. })
        ));
        assert!(matches!(
            "*/0 * * * *".parse::<CronPattern>(),
            Err(CronError::InvalidField { .. })
        ));
        assert!(matches!(
            "0 0 10-2 * *".parse::<CronPattern>(),
            Err(CronError::InvalidField { field: "day-of-month", .. })
        ));
    }
}
