use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use time::{Date, Month};

/// An accounting month, the unit of month-close and retroactive adjustment.
///
/// The canonical textual form is `YYYY-MM`; consumers receive it as a `month`
/// string alongside a separate integer `year` field, and the two are kept
/// mutually consistent by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Period {
    year: i32,
    month: u8,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid period '{0}': expected YYYY-MM")]
pub struct ParsePeriodError(String);

impl Period {
    pub fn new(year: i32, month: u8) -> Result<Self, ParsePeriodError> {
        if !(1..=12).contains(&month) || !(1000..=9999).contains(&year) {
            return Err(ParsePeriodError(format!("{}-{}", year, month)));
        }
        Ok(Self { year, month })
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u8 {
        self.month
    }

    /// First calendar day of the month.
    pub fn first_day(&self) -> Date {
        let month = Month::try_from(self.month).expect("month validated on construction");
        Date::from_calendar_date(self.year, month, 1).expect("month validated on construction")
    }

    /// Last calendar day of the month. Retroactive ledger rows are dated here
    /// so that period reports pick them up.
    pub fn last_day(&self) -> Date {
        let month = Month::try_from(self.month).expect("month validated on construction");
        let day = time::util::days_in_year_month(self.year, month);
        Date::from_calendar_date(self.year, month, day).expect("month validated on construction")
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = ParsePeriodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParsePeriodError(s.to_string());
        let (y, m) = s.split_once('-').ok_or_else(err)?;
        if y.len() != 4 || m.len() != 2 {
            return Err(err());
        }
        let year = y.parse::<i32>().map_err(|_| err())?;
        let month = m.parse::<u8>().map_err(|_| err())?;
        Self::new(year, month).map_err(|_| err())
    }
}

impl Serialize for Period {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
