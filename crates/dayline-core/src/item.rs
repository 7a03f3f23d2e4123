use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::recurrence::{RecurrenceRule, RuleParseError};

/// An event or task as delivered by the persistence layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CalendarItem {
    pub id: String,

    pub title: String,

    pub start: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_day: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due: Option<DateTime<Utc>>,

    /// Wire-encoded recurrence rule (`FREQ=...;INTERVAL=...`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthetic: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
}

impl CalendarItem {
    pub fn new(title: String, start: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title,
            start,
            end: None,
            all_day: None,
            due: None,
            rule: None,
            synthetic: None,
            source_id: None,
            owner_id: None,
        }
    }

    pub fn is_all_day(&self) -> bool {
        self.all_day.unwrap_or(false)
    }

    pub fn is_synthetic(&self) -> bool {
        self.synthetic.unwrap_or(false)
    }

    /// End instant clamped so that it never precedes the start.
    pub fn effective_end(&self) -> DateTime<Utc> {
        match self.end {
            Some(end) if end >= self.start => end,
            Some(end) => {
                tracing::warn!(
                    id = %self.id,
                    start = %self.start,
                    end = %end,
                    "item ends before it starts; treating as a point"
                );
                self.start
            }
            None => self.start,
        }
    }

    pub fn duration(&self) -> Duration {
        self.effective_end() - self.start
    }

    pub fn recurrence(&self) -> Option<Result<RecurrenceRule, RuleParseError>> {
        self.rule
            .as_deref()
            .filter(|raw| !raw.trim().is_empty())
            .map(str::parse)
    }

    pub fn has_time_of_day(&self) -> bool {
        !self.is_all_day() && self.due.is_some()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::CalendarItem;

    #[test]
    fn absent_optional_fields_deserialize_as_none() {
        let raw = r#"{"id":"a1","title":"Standup","start":"2025-03-12T09:00:00Z"}"#;
        let item: CalendarItem = serde_json::from_str(raw).expect("parse item");
        assert_eq!(item.end, None);
        assert_eq!(item.rule, None);
        assert!(!item.is_all_day());
        assert!(!item.is_synthetic());
        assert!(item.recurrence().is_none());
    }

    #[test]
    fn reversed_span_is_treated_as_point() {
        let start = Utc
            .with_ymd_and_hms(2025, 3, 12, 9, 0, 0)
            .single()
            .expect("valid start");
        let mut item = CalendarItem::new("Broken".to_string(), start);
        item.end = Some(start - chrono::Duration::hours(2));
        assert_eq!(item.effective_end(), start);
        assert_eq!(item.duration(), chrono::Duration::zero());
    }

    #[test]
    fn blank_rule_is_not_recurring() {
        let start = Utc
            .with_ymd_and_hms(2025, 3, 12, 9, 0, 0)
            .single()
            .expect("valid start");
        let mut item = CalendarItem::new("Blank".to_string(), start);
        item.rule = Some("   ".to_string());
        assert!(item.recurrence().is_none());
    }
}
