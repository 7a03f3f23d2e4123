//! Recurrence rule codec.
//!
//! Only the subset of RFC 5545 the engine expands is understood: `FREQ`,
//! `INTERVAL`, `BYDAY` (weekly rules), and one of `COUNT` or `UNTIL`.
//! Everything else in a rule string is ignored.

use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc, Weekday};
use thiserror::Error;
use tracing::{debug, warn};

const UNTIL_SUFFIX: &str = "T235959Z";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleParseError {
    #[error("recurrence rule is empty")]
    Empty,

    #[error("invalid COUNT value '{0}': expected a positive integer")]
    InvalidCount(String),

    #[error("invalid UNTIL value '{0}': expected YYYYMMDD")]
    InvalidUntil(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Frequency {
    pub fn as_token(self) -> &'static str {
        match self {
            Frequency::Daily => "DAILY",
            Frequency::Weekly => "WEEKLY",
            Frequency::Monthly => "MONTHLY",
            Frequency::Yearly => "YEARLY",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_uppercase().as_str() {
            "DAILY" => Some(Frequency::Daily),
            "WEEKLY" => Some(Frequency::Weekly),
            "MONTHLY" => Some(Frequency::Monthly),
            "YEARLY" => Some(Frequency::Yearly),
            _ => None,
        }
    }
}

/// Set of weekdays, iterated Monday first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct WeekdaySet(u8);

impl WeekdaySet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn single(day: Weekday) -> Self {
        let mut set = Self::empty();
        set.insert(day);
        set
    }

    pub fn insert(&mut self, day: Weekday) {
        self.0 |= 1 << day.num_days_from_monday();
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = Weekday> + '_ {
        ALL_WEEKDAYS
            .into_iter()
            .filter(move |day| self.contains(*day))
    }
}

impl FromIterator<Weekday> for WeekdaySet {
    fn from_iter<I: IntoIterator<Item = Weekday>>(iter: I) -> Self {
        let mut set = Self::empty();
        for day in iter {
            set.insert(day);
        }
        set
    }
}

const ALL_WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Termination {
    #[default]
    Never,
    /// Total number of occurrences, the anchor counted as the first.
    Count(NonZeroU32),
    /// Last calendar day on which an occurrence may fall.
    Until(NaiveDate),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecurrenceRule {
    pub frequency: Frequency,
    pub interval: NonZeroU32,
    pub weekdays: WeekdaySet,
    pub termination: Termination,
}

impl RecurrenceRule {
    pub fn new(frequency: Frequency) -> Self {
        Self {
            frequency,
            interval: NonZeroU32::MIN,
            weekdays: WeekdaySet::empty(),
            termination: Termination::Never,
        }
    }

    #[must_use]
    pub fn every(mut self, interval: NonZeroU32) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn on<I: IntoIterator<Item = Weekday>>(mut self, days: I) -> Self {
        self.weekdays = days.into_iter().collect();
        self
    }

    #[must_use]
    pub fn count(mut self, count: NonZeroU32) -> Self {
        self.termination = Termination::Count(count);
        self
    }

    #[must_use]
    pub fn until(mut self, last_day: NaiveDate) -> Self {
        self.termination = Termination::Until(last_day);
        self
    }

    /// Weekdays a weekly rule fires on; a rule without `BYDAY` repeats on
    /// the anchor's own weekday.
    pub fn effective_weekdays(&self, anchor: NaiveDate) -> WeekdaySet {
        if self.weekdays.is_empty() {
            WeekdaySet::single(anchor.weekday())
        } else {
            self.weekdays
        }
    }

    /// Inclusive upper bound implied by `UNTIL`, if any.
    pub fn until_instant(&self) -> Option<DateTime<Utc>> {
        match self.termination {
            Termination::Until(day) => Some(end_of_day(day)),
            _ => None,
        }
    }
}

pub fn end_of_day(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN))
        .and_utc()
}

#[tracing::instrument(level = "debug")]
pub fn parse(raw: &str) -> Result<RecurrenceRule, RuleParseError> {
    let body = strip_rrule_prefix(raw.trim());
    let fields = split_fields(body);
    if fields.is_empty() {
        return Err(RuleParseError::Empty);
    }

    let frequency = match fields.get("FREQ") {
        Some(token) => Frequency::from_token(token).unwrap_or_else(|| {
            warn!(freq = %token, "unknown FREQ; defaulting to DAILY");
            Frequency::Daily
        }),
        None => {
            warn!(rule = %raw, "rule has no FREQ; defaulting to DAILY");
            Frequency::Daily
        }
    };

    let interval = match fields.get("INTERVAL") {
        Some(value) => value
            .parse::<u32>()
            .ok()
            .and_then(NonZeroU32::new)
            .unwrap_or_else(|| {
                debug!(interval = %value, "unusable INTERVAL; defaulting to 1");
                NonZeroU32::MIN
            }),
        None => NonZeroU32::MIN,
    };

    let weekdays = fields
        .get("BYDAY")
        .map(|value| {
            value
                .split(',')
                .filter_map(|code| {
                    let day = weekday_from_code(code);
                    if day.is_none() {
                        debug!(code = %code, "skipping unknown BYDAY code");
                    }
                    day
                })
                .collect::<WeekdaySet>()
        })
        .unwrap_or_default();

    // COUNT is checked first, so it wins when both markers are present.
    let termination = if let Some(value) = fields.get("COUNT") {
        let count = value
            .parse::<u32>()
            .ok()
            .and_then(NonZeroU32::new)
            .ok_or_else(|| RuleParseError::InvalidCount(value.clone()))?;
        if fields.contains_key("UNTIL") {
            debug!("rule carries both COUNT and UNTIL; COUNT wins");
        }
        Termination::Count(count)
    } else if let Some(value) = fields.get("UNTIL") {
        Termination::Until(parse_until(value)?)
    } else {
        Termination::Never
    };

    Ok(RecurrenceRule {
        frequency,
        interval,
        weekdays,
        termination,
    })
}

pub fn serialize(rule: &RecurrenceRule) -> String {
    rule.to_string()
}

impl fmt::Display for RecurrenceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FREQ={};INTERVAL={}",
            self.frequency.as_token(),
            self.interval
        )?;

        if !self.weekdays.is_empty() {
            let codes = self
                .weekdays
                .iter()
                .map(weekday_code)
                .collect::<Vec<_>>()
                .join(",");
            write!(f, ";BYDAY={codes}")?;
        }

        match self.termination {
            Termination::Never => Ok(()),
            Termination::Count(count) => write!(f, ";COUNT={count}"),
            Termination::Until(day) => write!(f, ";UNTIL={}{UNTIL_SUFFIX}", until_digits(day)),
        }
    }
}

impl FromStr for RecurrenceRule {
    type Err = RuleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

pub fn weekday_code(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "MO",
        Weekday::Tue => "TU",
        Weekday::Wed => "WE",
        Weekday::Thu => "TH",
        Weekday::Fri => "FR",
        Weekday::Sat => "SA",
        Weekday::Sun => "SU",
    }
}

pub fn weekday_from_code(code: &str) -> Option<Weekday> {
    match code.trim().to_ascii_uppercase().as_str() {
        "MO" => Some(Weekday::Mon),
        "TU" => Some(Weekday::Tue),
        "WE" => Some(Weekday::Wed),
        "TH" => Some(Weekday::Thu),
        "FR" => Some(Weekday::Fri),
        "SA" => Some(Weekday::Sat),
        "SU" => Some(Weekday::Sun),
        _ => None,
    }
}

fn strip_rrule_prefix(body: &str) -> &str {
    match body.get(..6) {
        Some(prefix) if prefix.eq_ignore_ascii_case("RRULE:") => &body[6..],
        _ => body,
    }
}

/// Splits `KEY=VALUE;KEY=VALUE`, keeping the first value seen per key.
fn split_fields(body: &str) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    for token in body.split(';') {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_uppercase();
        let value = value.trim();
        if key.is_empty() || value.is_empty() {
            continue;
        }
        values.entry(key).or_insert_with(|| value.to_string());
    }
    values
}

/// `YYYYMMDD`; years outside 0..=9999 carry a sign and as many digits as
/// they need, e.g. `+100000101` or `-00010301`.
fn until_digits(day: NaiveDate) -> String {
    let year = day.year();
    if (0..=9999).contains(&year) {
        format!("{year:04}{:02}{:02}", day.month(), day.day())
    } else {
        format!("{year:+05}{:02}{:02}", day.month(), day.day())
    }
}

fn parse_until(value: &str) -> Result<NaiveDate, RuleParseError> {
    let invalid = || RuleParseError::InvalidUntil(value.to_string());
    let date = value.split_once('T').map_or(value, |(date, _)| date);

    let (signed, digits) = match date.strip_prefix(['+', '-']) {
        Some(rest) => (true, rest),
        None => (false, date),
    };
    if digits.len() < 8
        || (!signed && digits.len() != 8)
        || !digits.chars().all(|c| c.is_ascii_digit())
    {
        return Err(invalid());
    }

    let (year_digits, month_day) = digits.split_at(digits.len() - 4);
    let mut year = year_digits.parse::<i32>().map_err(|_| invalid())?;
    if date.starts_with('-') {
        year = -year;
    }
    let month = month_day[..2].parse::<u32>().map_err(|_| invalid())?;
    let day = month_day[2..].parse::<u32>().map_err(|_| invalid())?;
    NaiveDate::from_ymd_opt(year, month, day).ok_or_else(invalid)
}
