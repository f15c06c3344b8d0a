use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};

/// Calendar month in UTC, rendered as `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth {
    year: i32,
    month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Option<YearMonth> {
        (1..=12).contains(&month).then_some(YearMonth { year, month })
    }

    pub fn of(at: DateTime<Utc>) -> YearMonth {
        YearMonth {
            year: at.year(),
            month: at.month(),
        }
    }

    pub fn parse(value: &str) -> Option<YearMonth> {
        let (year, month) = value.split_once('-')?;
        if year.len() != 4 || month.len() != 2 {
            return None;
        }
        YearMonth::new(year.parse().ok()?, month.parse().ok()?)
    }

    pub fn months_back(self, count: u32) -> YearMonth {
        let index = self.year * 12 + self.month as i32 - 1 - count as i32;
        YearMonth {
            year: index.div_euclid(12),
            month: index.rem_euclid(12) as u32 + 1,
        }
    }

    /// First instant of the month, midnight UTC on day one.
    pub fn start(self) -> DateTime<Utc> {
        let date = NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or_default();
        Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
    }

    /// The `count` months ending at `self` inclusive, oldest first.
    pub fn trailing(self, count: u32) -> Vec<YearMonth> {
        (0..count).rev().map(|back| self.months_back(back)).collect()
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn months_back_crosses_year_boundary() {
        let feb = YearMonth::new(2025, 2).unwrap();
        assert_eq!(feb.months_back(2).to_string(), "2024-12");
        assert_eq!(feb.months_back(13).to_string(), "2024-01");
        assert_eq!(feb.months_back(0), feb);
    }

    #[test]
    fn trailing_is_oldest_first() {
        let keys: Vec<String> = YearMonth::new(2025, 3)
            .unwrap()
            .trailing(12)
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(keys.len(), 12);
        assert_eq!(keys.first().map(String::as_str), Some("2024-04"));
        assert_eq!(keys.last().map(String::as_str), Some("2025-03"));
    }

    #[test]
    fn parse_rejects_malformed_keys() {
        assert_eq!(YearMonth::parse("2025-07"), YearMonth::new(2025, 7));
        assert_eq!(YearMonth::parse("2025-13"), None);
        assert_eq!(YearMonth::parse("2025-7"), None);
        assert_eq!(YearMonth::parse("garbage"), None);
    }

    #[test]
    fn start_is_midnight_on_the_first() {
        let start = YearMonth::new(2024, 11).unwrap().start();
        assert_eq!(start.to_rfc3339(), "2024-11-01T00:00:00+00:00");
    }
}
