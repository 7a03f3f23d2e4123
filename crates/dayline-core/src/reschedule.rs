//! Maps a semantic drop target onto a concrete due timestamp.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use thiserror::Error;

use crate::datetime::{add_days, to_calendar_day};
use crate::item::CalendarItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DueBucket {
    Today,
    Tomorrow,
    Upcoming,
    Someday,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown bucket '{0}': expected today, tomorrow, upcoming or someday")]
pub struct UnknownBucket(pub String);

impl DueBucket {
    pub const ALL: [DueBucket; 4] = [
        DueBucket::Today,
        DueBucket::Tomorrow,
        DueBucket::Upcoming,
        DueBucket::Someday,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DueBucket::Today => "Today",
            DueBucket::Tomorrow => "Tomorrow",
            DueBucket::Upcoming => "Upcoming",
            DueBucket::Someday => "Someday",
        }
    }

    /// Bucket a task with this due timestamp is listed under. Overdue tasks
    /// stay in Today.
    pub fn classify(due: Option<DateTime<Utc>>, today: NaiveDate) -> Self {
        let Some(due) = due else {
            return DueBucket::Someday;
        };
        let day = to_calendar_day(&due);
        if day <= today {
            DueBucket::Today
        } else if day == add_days(today, 1) {
            DueBucket::Tomorrow
        } else {
            DueBucket::Upcoming
        }
    }
}

impl fmt::Display for DueBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DueBucket {
    type Err = UnknownBucket;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "today" => Ok(DueBucket::Today),
            "tomorrow" => Ok(DueBucket::Tomorrow),
            "upcoming" => Ok(DueBucket::Upcoming),
            "someday" => Ok(DueBucket::Someday),
            other => Err(UnknownBucket(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReschedulePolicy {
    /// Time given to items that carry no time of day.
    pub neutral_time: NaiveTime,
    /// Days after today an Upcoming drop lands on; at least 2.
    pub upcoming_days: u32,
}

impl Default for ReschedulePolicy {
    fn default() -> Self {
        Self {
            neutral_time: NaiveTime::from_hms_opt(12, 0, 0).unwrap_or(NaiveTime::MIN),
            upcoming_days: 2,
        }
    }
}

/// New due timestamp for `item` dropped on `target`.
///
/// The time of day comes from the item's current due timestamp when it has
/// one; `None` means the due date is cleared.
#[tracing::instrument(level = "debug", skip(item, policy), fields(id = %item.id))]
pub fn reschedule(
    item: &CalendarItem,
    target: DueBucket,
    today: NaiveDate,
    policy: &ReschedulePolicy,
) -> Option<DateTime<Utc>> {
    let offset = match target {
        DueBucket::Today => 0,
        DueBucket::Tomorrow => 1,
        DueBucket::Upcoming => i64::from(policy.upcoming_days.max(2)),
        DueBucket::Someday => return None,
    };

    let time = match item.due {
        Some(due) if item.has_time_of_day() => due.time(),
        _ => policy.neutral_time,
    };
    Some(add_days(today, offset).and_time(time).and_utc())
}

/// An optimistic due-date change awaiting confirmation from persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TentativePlacement {
    pub item_id: String,
    pub target: DueBucket,
    pub previous_due: Option<DateTime<Utc>>,
    pub new_due: Option<DateTime<Utc>>,
}
