//! Groups items into calendar-day buckets.

use std::collections::BTreeMap;

use chrono::{Datelike, Days, NaiveDate};
use tracing::{debug, warn};

use crate::datetime::to_calendar_day;
use crate::item::CalendarItem;

/// Longest run of continuation days a single item contributes.
pub const MAX_SPAN_DAYS: u64 = 366;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketEntry {
    pub item: CalendarItem,
    /// Set on every day of a multi-day item after its first.
    pub continuation: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayBucket {
    pub day: NaiveDate,
    pub entries: Vec<BucketEntry>,
}

impl DayBucket {
    /// Whether a month header belongs above this bucket.
    pub fn starts_new_month(&self, previous: Option<&DayBucket>) -> bool {
        match previous {
            Some(prev) => {
                prev.day.year() != self.day.year() || prev.day.month() != self.day.month()
            }
            None => true,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// First and last calendar day an item touches, at most `MAX_SPAN_DAYS`
/// past its start.
pub fn day_span(item: &CalendarItem) -> (NaiveDate, NaiveDate) {
    let start_day = to_calendar_day(&item.start);
    let end_day = to_calendar_day(&item.effective_end()).max(start_day);
    let limit = start_day
        .checked_add_days(Days::new(MAX_SPAN_DAYS))
        .unwrap_or(NaiveDate::MAX);
    (start_day, end_day.min(limit))
}

/// Buckets in ascending day order; entries sorted by start, ties kept in
/// input order.
#[tracing::instrument(skip(items), fields(items = items.len()))]
pub fn bucket(items: &[CalendarItem]) -> Vec<DayBucket> {
    let mut by_day: BTreeMap<NaiveDate, Vec<BucketEntry>> = BTreeMap::new();

    for item in items {
        let (start_day, end_day) = day_span(item);
        if to_calendar_day(&item.effective_end()) > end_day {
            warn!(id = %item.id, %end_day, "multi-day item truncated");
        }
        by_day.entry(start_day).or_default().push(BucketEntry {
            item: item.clone(),
            continuation: false,
        });

        let mut day = start_day;
        while day < end_day {
            let Some(next) = day.succ_opt() else {
                break;
            };
            day = next;
            by_day.entry(day).or_default().push(BucketEntry {
                item: item.clone(),
                continuation: true,
            });
        }
    }

    let buckets = by_day
        .into_iter()
        .map(|(day, mut entries)| {
            entries.sort_by_key(|entry| entry.item.start);
            DayBucket { day, entries }
        })
        .collect::<Vec<_>>();

    debug!(buckets = buckets.len(), "bucketed items by day");
    buckets
}

pub fn has_items_on_day(items: &[CalendarItem], day: NaiveDate) -> bool {
    items.iter().any(|item| {
        let (start_day, end_day) = day_span(item);
        start_day <= day && day <= end_day
    })
}

pub fn bucket_days(buckets: &[DayBucket]) -> Vec<NaiveDate> {
    buckets.iter().map(|bucket| bucket.day).collect()
}

/// Day with the smallest distance to `target`; the earlier day wins ties.
pub fn nearest_bucket_day(days: &[NaiveDate], target: NaiveDate) -> Option<NaiveDate> {
    days.iter()
        .copied()
        .min_by_key(|day| ((*day - target).num_days().abs(), *day))
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
    use proptest::prelude::*;

    use super::{MAX_SPAN_DAYS, bucket, bucket_days, has_items_on_day, nearest_bucket_day};
    use crate::item::CalendarItem;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0)
            .single()
            .expect("valid instant")
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn item(id: &str, start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> CalendarItem {
        let mut item = CalendarItem::new(id.to_string(), start);
        item.id = id.to_string();
        item.end = end;
        item
    }

    #[test]
    fn multi_day_item_lands_on_every_day_it_touches() {
        let trip = item("trip", at(2025, 3, 15, 16), Some(at(2025, 3, 17, 23)));
        let buckets = bucket(&[trip]);

        assert_eq!(
            bucket_days(&buckets),
            vec![date(2025, 3, 15), date(2025, 3, 16), date(2025, 3, 17)]
        );
        let flags = buckets
            .iter()
            .map(|b| b.entries[0].continuation)
            .collect::<Vec<_>>();
        assert_eq!(flags, vec![false, true, true]);
    }

    #[test]
    fn far_future_end_is_truncated() {
        let start = at(2025, 3, 15, 16);
        let forever = item("forever", start, Some(at(3025, 3, 15, 16)));
        let buckets = bucket(std::slice::from_ref(&forever));

        assert_eq!(buckets.len() as u64, MAX_SPAN_DAYS + 1);
        let last = date(2025, 3, 15) + Duration::days(MAX_SPAN_DAYS as i64);
        assert_eq!(buckets.last().map(|b| b.day), Some(last));
        assert!(has_items_on_day(std::slice::from_ref(&forever), last));
        assert!(!has_items_on_day(&[forever], last + Duration::days(1)));
    }

    #[test]
    fn entries_sort_by_start_with_stable_ties() {
        let late = item("late", at(2025, 3, 12, 18), None);
        let first = item("first", at(2025, 3, 12, 9), None);
        let second = item("second", at(2025, 3, 12, 9), None);
        let buckets = bucket(&[late, first, second]);

        assert_eq!(buckets.len(), 1);
        let ids = buckets[0]
            .entries
            .iter()
            .map(|entry| entry.item.id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["first", "second", "late"]);
    }

    #[test]
    fn continuation_sorts_ahead_of_same_day_items() {
        let span = item("span", at(2025, 3, 11, 20), Some(at(2025, 3, 12, 10)));
        let morning = item("morning", at(2025, 3, 12, 8), None);
        let buckets = bucket(&[morning, span]);
        let day_two = &buckets[1];
        assert_eq!(day_two.day, date(2025, 3, 12));
        assert_eq!(day_two.entries[0].item.id, "span");
        assert!(day_two.entries[0].continuation);
        assert_eq!(day_two.entries[1].item.id, "morning");
    }

    #[test]
    fn month_headers_only_on_month_change() {
        let buckets = bucket(&[
            item("a", at(2025, 2, 27, 9), None),
            item("b", at(2025, 2, 28, 9), None),
            item("c", at(2025, 3, 1, 9), None),
            item("d", at(2026, 3, 1, 9), None),
        ]);
        let headers = buckets
            .iter()
            .enumerate()
            .map(|(idx, b)| b.starts_new_month(idx.checked_sub(1).map(|p| &buckets[p])))
            .collect::<Vec<_>>();
        assert_eq!(headers, vec![true, false, true, true]);
    }

    #[test]
    fn nearest_day_prefers_earlier_on_tie() {
        let days = [date(2025, 2, 27), date(2025, 3, 10)];
        assert_eq!(
            nearest_bucket_day(&days, date(2025, 3, 1)),
            Some(date(2025, 2, 27))
        );
        let tie = [date(2025, 3, 3), date(2025, 3, 7)];
        assert_eq!(
            nearest_bucket_day(&tie, date(2025, 3, 5)),
            Some(date(2025, 3, 3))
        );
        assert_eq!(nearest_bucket_day(&[], date(2025, 3, 5)), None);
    }

    proptest! {
        #[test]
        fn day_lookup_agrees_with_buckets(
            spans in prop::collection::vec((0i64..60 * 24, prop::option::of(0i64..5 * 24)), 0..12),
        ) {
            let origin = at(2025, 3, 1, 0);
            let items = spans
                .iter()
                .enumerate()
                .map(|(idx, (start_h, len_h))| {
                    let start = origin + Duration::hours(*start_h);
                    item(&idx.to_string(), start, len_h.map(|h| start + Duration::hours(h)))
                })
                .collect::<Vec<_>>();
            let days = bucket_days(&bucket(&items));

            for offset in -2..70 {
                let day = date(2025, 3, 1) + Duration::days(offset);
                prop_assert_eq!(has_items_on_day(&items, day), days.contains(&day));
            }
        }
    }
}
