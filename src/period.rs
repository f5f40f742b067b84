//! Time buckets
//!
//! Every aggregate belongs to exactly one period of one granularity. Periods are
//! computed in UTC and carry a stable textual key used in the aggregate's
//! natural composite key.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::RollupError;

/// Time bucket size of an aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl Granularity {
    pub const ALL: [Granularity; 6] = [
        Granularity::Hour,
        Granularity::Day,
        Granularity::Week,
        Granularity::Month,
        Granularity::Quarter,
        Granularity::Year,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
            Granularity::Quarter => "quarter",
            Granularity::Year => "year",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hour" | "hourly" => Some(Granularity::Hour),
            "day" | "daily" => Some(Granularity::Day),
            "week" | "weekly" => Some(Granularity::Week),
            "month" | "monthly" => Some(Granularity::Month),
            "quarter" | "quarterly" => Some(Granularity::Quarter),
            "year" | "yearly" => Some(Granularity::Year),
            _ => None,
        }
    }

    /// The granularity whose aggregates feed a rollup into `self`.
    ///
    /// Hourly (and raw-sourced daily) aggregates read measurements directly, so
    /// they have no lower granularity. Weeks straddle month boundaries, hence
    /// months roll up from days.
    pub fn rollup_source(&self) -> Option<Granularity> {
        match self {
            Granularity::Hour | Granularity::Day => None,
            Granularity::Week | Granularity::Month => Some(Granularity::Day),
            Granularity::Quarter => Some(Granularity::Month),
            Granularity::Year => Some(Granularity::Quarter),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A concrete time bucket `[start, end)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Period {
    pub granularity: Granularity,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Period {
    /// The period of the given granularity that contains `ts`
    pub fn containing(granularity: Granularity, ts: DateTime<Utc>) -> Self {
        let date = ts.date_naive();
        let (start, end) = match granularity {
            Granularity::Hour => {
                let start = at_midnight(date) + Duration::hours(ts.hour() as i64);
                (start, start + Duration::hours(1))
            }
            Granularity::Day => {
                let start = at_midnight(date);
                (start, start + Duration::days(1))
            }
            Granularity::Week => {
                let offset = date.weekday().num_days_from_monday() as i64;
                let start = at_midnight(date - Duration::days(offset));
                (start, start + Duration::days(7))
            }
            Granularity::Month => {
                let (y, m) = (date.year(), date.month());
                (month_start(y, m), next_month_start(y, m))
            }
            Granularity::Quarter => {
                let first = (date.month0() / 3) * 3 + 1;
                let y = date.year();
                (month_start(y, first), next_month_start(y, first + 2))
            }
            Granularity::Year => (month_start(date.year(), 1), month_start(date.year() + 1, 1)),
        };

        Period {
            granularity,
            start,
            end,
        }
    }

    /// Parse a period key back into a period
    pub fn from_key(granularity: Granularity, key: &str) -> Result<Self, RollupError> {
        let invalid = || RollupError::InvalidPeriod(format!("{} key '{}'", granularity, key));
        let anchor: NaiveDate = match granularity {
            Granularity::Hour => {
                let (day, hour) = key.split_once('T').ok_or_else(invalid)?;
                let date = NaiveDate::parse_from_str(day, "%Y-%m-%d").map_err(|_| invalid())?;
                let hour: u32 = hour.parse().map_err(|_| invalid())?;
                if hour > 23 {
                    return Err(invalid());
                }
                let ts = at_midnight(date) + Duration::hours(hour as i64);
                return Ok(Period::containing(granularity, ts));
            }
            Granularity::Day => {
                NaiveDate::parse_from_str(key, "%Y-%m-%d").map_err(|_| invalid())?
            }
            Granularity::Week => {
                let (year, week) = key.split_once("-W").ok_or_else(invalid)?;
                let year: i32 = year.parse().map_err(|_| invalid())?;
                let week: u32 = week.parse().map_err(|_| invalid())?;
                NaiveDate::from_isoywd_opt(year, week, chrono::Weekday::Mon).ok_or_else(invalid)?
            }
            Granularity::Month => {
                NaiveDate::parse_from_str(&format!("{}-01", key), "%Y-%m-%d")
                    .map_err(|_| invalid())?
            }
            Granularity::Quarter => {
                let (year, quarter) = key.split_once("-Q").ok_or_else(invalid)?;
                let year: i32 = year.parse().map_err(|_| invalid())?;
                let quarter: u32 = quarter.parse().map_err(|_| invalid())?;
                if !(1..=4).contains(&quarter) {
                    return Err(invalid());
                }
                NaiveDate::from_ymd_opt(year, (quarter - 1) * 3 + 1, 1).ok_or_else(invalid)?
            }
            Granularity::Year => {
                let year: i32 = key.parse().map_err(|_| invalid())?;
                NaiveDate::from_ymd_opt(year, 1, 1).ok_or_else(invalid)?
            }
        };

        Ok(Period::containing(granularity, at_midnight(anchor)))
    }

    /// Stable textual key of the period
    pub fn key(&self) -> String {
        match self.granularity {
            Granularity::Hour => self.start.format("%Y-%m-%dT%H").to_string(),
            Granularity::Day => self.start.format("%Y-%m-%d").to_string(),
            Granularity::Week => {
                let week = self.start.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
            Granularity::Month => self.start.format("%Y-%m").to_string(),
            Granularity::Quarter => {
                format!("{}-Q{}", self.start.year(), self.start.month0() / 3 + 1)
            }
            Granularity::Year => self.start.format("%Y").to_string(),
        }
    }

    /// The enclosing period of a coarser granularity
    pub fn within(&self, granularity: Granularity) -> Period {
        Period::containing(granularity, self.start)
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.granularity, self.key())
    }
}

fn at_midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}

fn month_start(year: i32, month: u32) -> DateTime<Utc> {
    // Month values here are always 1..=12 by construction
    let date = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MIN);
    at_midnight(date)
}

fn next_month_start(year: i32, month: u32) -> DateTime<Utc> {
    if month >= 12 {
        month_start(year + 1, 1)
    } else {
        month_start(year, month + 1)
    }
}
