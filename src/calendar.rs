use chrono::{Datelike, Duration, NaiveDate};
use std::fmt;

/// Canonical display names, indexed by weekday 0=Monday .. 6=Sunday.
pub const DAY_NAMES: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

/// Lessons only occur Monday through Friday.
const LAST_WORKING_WEEKDAY: u32 = 4;

#[derive(Debug, Clone, PartialEq)]
pub enum CalendarError {
    InvalidRange { start: NaiveDate, end: NaiveDate },
}

impl fmt::Display for CalendarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalendarError::InvalidRange { start, end } => {
                write!(f, "start date {} is after end date {}", start, end)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkingDay {
    pub date: NaiveDate,
    /// 0=Monday .. 6=Sunday.
    pub weekday: u32,
    pub name: &'static str,
}

/// Maps an inclusive date range onto its working days (Monday..Friday),
/// in ascending date order. Non-working dates are omitted entirely.
pub fn resolve_working_days(
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<WorkingDay>, CalendarError> {
    if start > end {
        return Err(CalendarError::InvalidRange { start, end });
    }
    let mut days = Vec::new();
    let mut date = start;
    while date <= end {
        let weekday = date.weekday().num_days_from_monday();
        if weekday <= LAST_WORKING_WEEKDAY {
            days.push(WorkingDay {
                date,
                weekday,
                name: DAY_NAMES[weekday as usize],
            });
        }
        date += Duration::days(1);
    }
    Ok(days)
}

/// Folds a localized weekday name into a comparison key: trimmed,
/// lowercased, internal whitespace collapsed, diacritics stripped.
/// Pure; imported names and lookup names normalize to the same key.
pub fn normalize_day_name(raw: &str) -> String {
    let folded: String = raw.chars().map(fold_char).collect();
    folded
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn fold_char(c: char) -> char {
    match c {
        'Ç' | 'ç' => 'c',
        'Ğ' | 'ğ' => 'g',
        'İ' | 'ı' => 'i',
        'Ö' | 'ö' => 'o',
        'Ş' | 'ş' => 's',
        'Ü' | 'ü' => 'u',
        'Â' | 'â' => 'a',
        'Î' | 'î' => 'i',
        'Û' | 'û' => 'u',
        'É' | 'é' => 'e',
        _ => c.to_ascii_lowercase(),
    }
}

/// Resolves a localized weekday name (English or Turkish, any spelling
/// variant the normalizer folds) to the canonical weekday 0=Monday..6=Sunday.
pub fn weekday_from_name(raw: &str) -> Option<u32> {
    match normalize_day_name(raw).as_str() {
        "monday" | "mon" | "pazartesi" => Some(0),
        "tuesday" | "tue" | "sali" => Some(1),
        "wednesday" | "wed" | "carsamba" => Some(2),
        "thursday" | "thu" | "persembe" => Some(3),
        "friday" | "fri" | "cuma" => Some(4),
        "saturday" | "sat" | "cumartesi" => Some(5),
        "sunday" | "sun" | "pazar" => Some(6),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("test date")
    }

    #[test]
    fn resolver_rejects_inverted_range() {
        let err = resolve_working_days(d("2026-02-05"), d("2026-02-01")).unwrap_err();
        assert!(matches!(err, CalendarError::InvalidRange { .. }));
    }

    #[test]
    fn resolver_skips_weekend_days() {
        // 2026-02-01 is a Sunday, 2026-02-05 a Thursday.
        let days = resolve_working_days(d("2026-02-01"), d("2026-02-05")).unwrap();
        let dates: Vec<String> = days.iter().map(|w| w.date.to_string()).collect();
        assert_eq!(
            dates,
            vec!["2026-02-02", "2026-02-03", "2026-02-04", "2026-02-05"]
        );
        assert_eq!(days[0].weekday, 0);
        assert_eq!(days[0].name, "Monday");
        assert_eq!(days[1].weekday, 1);
        assert_eq!(days[1].name, "Tuesday");
    }

    #[test]
    fn resolver_single_day_range() {
        let days = resolve_working_days(d("2026-02-07"), d("2026-02-07")).unwrap();
        assert!(days.is_empty(), "Saturday alone resolves to nothing");
        let days = resolve_working_days(d("2026-02-06"), d("2026-02-06")).unwrap();
        assert_eq!(days.len(), 1);
        assert_eq!(days[0].name, "Friday");
    }

    #[test]
    fn normalizer_folds_case_whitespace_and_diacritics() {
        assert_eq!(normalize_day_name("  Monday "), "monday");
        assert_eq!(normalize_day_name("ÇARŞAMBA"), "carsamba");
        assert_eq!(normalize_day_name("Çarşamba"), "carsamba");
        assert_eq!(normalize_day_name("Carsamba"), "carsamba");
        assert_eq!(normalize_day_name("Salı"), "sali");
        assert_eq!(normalize_day_name("per şembe"), "per sembe");
    }

    #[test]
    fn weekday_lookup_accepts_turkish_and_english_variants() {
        assert_eq!(weekday_from_name("Çarşamba"), Some(2));
        assert_eq!(weekday_from_name("carsamba"), Some(2));
        assert_eq!(weekday_from_name("Wednesday"), Some(2));
        assert_eq!(weekday_from_name("Pazartesi"), Some(0));
        assert_eq!(weekday_from_name("SALI"), Some(1));
        assert_eq!(weekday_from_name("Perşembe"), Some(3));
        assert_eq!(weekday_from_name("cuma"), Some(4));
        assert_eq!(weekday_from_name("Pazar"), Some(6));
        assert_eq!(weekday_from_name("Monntag"), None);
        assert_eq!(weekday_from_name(""), None);
    }
}
