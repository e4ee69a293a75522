use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const DAY_NAMES: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

/// A parsed weekday specification: either a contiguous range `Mon-Fri`
/// (no wrap-around) or a discrete list `Mon/Wed/Fri`.
///
/// Internally a 7-bit set (bit 0 = Monday); membership tests are O(1).
/// The source text is retained so the pattern round-trips through
/// serialization and display unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeekdayPattern {
    days: u8,
    text: String,
}

impl WeekdayPattern {
    pub fn parse(text: &str) -> Result<Self, PatternError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(PatternError::Empty);
        }

        let mut days = 0u8;
        if let Some((from, to)) = trimmed.split_once('-') {
            let i = day_index(from)?;
            let j = day_index(to)?;
            if i > j {
                return Err(PatternError::ReversedRange {
                    from: from.trim().to_string(),
                    to: to.trim().to_string(),
                });
            }
            for k in i..=j {
                days |= 1 << k;
            }
        } else {
            for token in trimmed.split('/') {
                days |= 1 << day_index(token)?;
            }
        }

        Ok(Self {
            days,
            text: trimmed.to_string(),
        })
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.days & (1 << day.num_days_from_monday()) != 0
    }

    pub fn matches(&self, date: NaiveDate) -> bool {
        self.contains(date.weekday())
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

fn day_index(token: &str) -> Result<u8, PatternError> {
    let t = token.trim().to_lowercase();
    if t.is_empty() {
        return Err(PatternError::Empty);
    }
    DAY_NAMES
        .iter()
        .position(|d| *d == t)
        .map(|i| i as u8)
        .ok_or_else(|| PatternError::UnknownDay(token.trim().to_string()))
}

impl fmt::Display for WeekdayPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for WeekdayPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for WeekdayPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text)
    }
}

impl<'de> Deserialize<'de> for WeekdayPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        WeekdayPattern::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    Empty,
    UnknownDay(String),
    ReversedRange { from: String, to: String },
}

impl fmt::Display for PatternError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternError::Empty => write!(f, "empty weekday pattern"),
            PatternError::UnknownDay(d) => write!(f, "unknown weekday: {d}"),
            PatternError::ReversedRange { from, to } => {
                write!(f, "reversed range: {from} comes after {to}")
            }
        }
    }
}

impl std::error::Error for PatternError {}
