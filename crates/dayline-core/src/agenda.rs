//! The item pipeline behind a day-list view: expansion, bucketing, date
//! selection and drag-and-drop rescheduling.

use anyhow::anyhow;
use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, info, warn};

use crate::bucket::{DayBucket, bucket};
use crate::config::EngineSettings;
use crate::item::CalendarItem;
use crate::occurrence::{Horizon, expand_all};
use crate::reschedule::{DueBucket, TentativePlacement, reschedule};
use crate::sync::{ListView, SyncState, Synchronizer, Ticket, TimerKind, TimerRequest};

/// Receives due-date changes for persistence.
pub trait DueDateSink {
    fn update_item_due_date(&mut self, id: &str, due: Option<DateTime<Utc>>) -> anyhow::Result<()>;
}

/// Items grouped under one semantic due bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueGroup<'a> {
    pub bucket: DueBucket,
    pub items: Vec<&'a CalendarItem>,
}

#[derive(Debug)]
pub struct Agenda {
    items: Vec<CalendarItem>,
    expanded: Vec<CalendarItem>,
    buckets: Vec<DayBucket>,
    horizon: Horizon,
    today: NaiveDate,
    settings: EngineSettings,
    sync: Synchronizer,
    pending: Vec<TentativePlacement>,
}

impl Agenda {
    /// Builds the pipeline for `items` as seen at `now` on the viewer's
    /// calendar date `today`.
    #[tracing::instrument(skip(items, settings), fields(items = items.len()))]
    pub fn new(
        items: Vec<CalendarItem>,
        settings: EngineSettings,
        now: DateTime<Utc>,
        today: NaiveDate,
    ) -> Self {
        let mut agenda = Self {
            items,
            expanded: Vec::new(),
            buckets: Vec::new(),
            horizon: Horizon::from_now(now, settings.horizon_months),
            today,
            settings,
            sync: Synchronizer::new(settings.sync),
            pending: Vec::new(),
        };
        agenda.rebuild();
        agenda
    }

    /// Source items, without synthetic occurrences.
    pub fn items(&self) -> &[CalendarItem] {
        &self.items
    }

    /// Source items followed by every occurrence inside the horizon.
    pub fn expanded(&self) -> &[CalendarItem] {
        &self.expanded
    }

    pub fn buckets(&self) -> &[DayBucket] {
        &self.buckets
    }

    pub fn horizon(&self) -> Horizon {
        self.horizon
    }

    pub fn today(&self) -> NaiveDate {
        self.today
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync.state()
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.sync
    }

    /// Placements applied locally but not yet confirmed or rolled back.
    pub fn pending(&self) -> &[TentativePlacement] {
        &self.pending
    }

    /// Replaces the whole item collection.
    pub fn set_items(&mut self, items: Vec<CalendarItem>) {
        self.items = items;
        self.rebuild();
    }

    /// Buckets restricted to days in `from..=to`.
    pub fn buckets_between(&self, from: NaiveDate, to: NaiveDate) -> &[DayBucket] {
        let lo = self.buckets.partition_point(|b| b.day < from);
        let hi = self.buckets.partition_point(|b| b.day <= to);
        &self.buckets[lo..hi.max(lo)]
    }

    /// Source items grouped by due bucket, in Today/Tomorrow/Upcoming/Someday
    /// order. Empty groups are kept.
    pub fn due_groups(&self) -> Vec<DueGroup<'_>> {
        let mut groups = DueBucket::ALL
            .iter()
            .map(|bucket| DueGroup {
                bucket: *bucket,
                items: Vec::new(),
            })
            .collect::<Vec<_>>();

        for item in &self.items {
            let target = DueBucket::classify(item.due, self.today);
            if let Some(group) = groups.iter_mut().find(|group| group.bucket == target) {
                group.items.push(item);
            }
        }
        for group in &mut groups {
            group.items.sort_by_key(|item| (item.due, item.start));
        }
        groups
    }

    pub fn request_select_date(
        &mut self,
        date: NaiveDate,
        view: &mut dyn ListView,
    ) -> Option<TimerRequest> {
        self.sync.request_select_date(date, view)
    }

    pub fn on_user_scroll(&mut self, view: &dyn ListView) {
        self.sync.on_user_scroll(view);
    }

    /// Selects the day of the clicked item; unknown ids are ignored.
    pub fn on_item_click(
        &mut self,
        item_id: &str,
        view: &mut dyn ListView,
    ) -> Option<TimerRequest> {
        let Some(item) = self.expanded.iter().find(|item| item.id == item_id).cloned() else {
            debug!(item_id, "click on unknown item");
            return None;
        };
        self.sync.on_item_click(&item, view)
    }

    /// The host finished rendering the current buckets.
    pub fn on_rendered(&mut self, view: &mut dyn ListView) -> Option<TimerRequest> {
        self.sync.on_buckets_rendered(&self.buckets, view)
    }

    pub fn on_timer(
        &mut self,
        ticket: Ticket,
        kind: TimerKind,
        view: &mut dyn ListView,
    ) -> Option<TimerRequest> {
        self.sync.on_timer(ticket, kind, view)
    }

    /// Drop of `item_id` onto the bucket named `bucket_name`.
    ///
    /// The new due date is applied locally and handed to `sink`. A sink
    /// failure is logged and the placement stays pending so the caller can
    /// still roll it back.
    #[tracing::instrument(skip(self, sink))]
    pub fn on_item_drop(
        &mut self,
        item_id: &str,
        bucket_name: &str,
        sink: &mut dyn DueDateSink,
    ) -> anyhow::Result<TentativePlacement> {
        let target: DueBucket = bucket_name.parse()?;
        let placement = self.apply_drop(item_id, target)?;

        match sink.update_item_due_date(&placement.item_id, placement.new_due) {
            Ok(()) => self.confirm(&placement),
            Err(err) => {
                warn!(
                    item_id = %placement.item_id,
                    error = %err,
                    "failed to persist due date; keeping optimistic placement"
                );
            }
        }
        Ok(placement)
    }

    /// Moves `item_id` to `target` locally and records the change as pending.
    #[tracing::instrument(skip(self))]
    pub fn apply_drop(
        &mut self,
        item_id: &str,
        target: DueBucket,
    ) -> anyhow::Result<TentativePlacement> {
        let item = self
            .items
            .iter_mut()
            .find(|item| item.id == item_id)
            .ok_or_else(|| anyhow!("no item with id {item_id}"))?;

        let new_due = reschedule(item, target, self.today, &self.settings.reschedule);
        let placement = TentativePlacement {
            item_id: item.id.clone(),
            target,
            previous_due: item.due,
            new_due,
        };
        item.due = new_due;

        info!(
            item_id,
            %target,
            previous = ?placement.previous_due,
            due = ?new_due,
            "applied tentative placement"
        );
        self.pending.push(placement.clone());
        self.rebuild();
        Ok(placement)
    }

    /// Persistence accepted the placement.
    pub fn confirm(&mut self, placement: &TentativePlacement) {
        if let Some(index) = self.pending.iter().position(|pending| pending == placement) {
            self.pending.remove(index);
        }
        debug!(item_id = %placement.item_id, "placement confirmed");
    }

    /// Persistence rejected the placement; restore the previous due date.
    #[tracing::instrument(skip(self, placement), fields(item_id = %placement.item_id))]
    pub fn rollback(&mut self, placement: &TentativePlacement) -> anyhow::Result<()> {
        let position = self
            .pending
            .iter()
            .position(|pending| pending == placement)
            .ok_or_else(|| anyhow!("placement for {} is not pending", placement.item_id))?;
        self.pending.remove(position);

        let item = self
            .items
            .iter_mut()
            .find(|item| item.id == placement.item_id)
            .ok_or_else(|| anyhow!("no item with id {}", placement.item_id))?;
        item.due = placement.previous_due;
        warn!(previous = ?placement.previous_due, "placement rolled back");
        self.rebuild();
        Ok(())
    }

    fn rebuild(&mut self) {
        self.expanded = expand_all(&self.items, self.horizon);
        self.buckets = bucket(&self.expanded);
        self.sync.set_buckets(&self.buckets);
        debug!(
            items = self.items.len(),
            expanded = self.expanded.len(),
            buckets = self.buckets.len(),
            "rebuilt agenda"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use anyhow::anyhow;
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};

    use super::{Agenda, DueDateSink};
    use crate::config::EngineSettings;
    use crate::item::CalendarItem;
    use crate::reschedule::DueBucket;
    use crate::sync::{ListView, SyncPhase, TimerKind};

    #[derive(Default)]
    struct RecordingSink {
        calls: Vec<(String, Option<DateTime<Utc>>)>,
        fail: bool,
    }

    impl DueDateSink for RecordingSink {
        fn update_item_due_date(
            &mut self,
            id: &str,
            due: Option<DateTime<Utc>>,
        ) -> anyhow::Result<()> {
            self.calls.push((id.to_string(), due));
            if self.fail {
                return Err(anyhow!("backend unavailable"));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct AllRendered {
        scrolled: Vec<NaiveDate>,
    }

    impl ListView for AllRendered {
        fn locate_day(&self, _day: NaiveDate) -> anyhow::Result<bool> {
            Ok(true)
        }

        fn scroll_to_day(&mut self, day: NaiveDate) -> anyhow::Result<()> {
            self.scrolled.push(day);
            Ok(())
        }

        fn topmost_visible_day(&self) -> anyhow::Result<Option<NaiveDate>> {
            Ok(self.scrolled.last().copied())
        }
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0)
            .single()
            .expect("valid instant")
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn named(id: &str, start: DateTime<Utc>) -> CalendarItem {
        let mut item = CalendarItem::new(id.to_string(), start);
        item.id = id.to_string();
        item
    }

    fn agenda(items: Vec<CalendarItem>) -> Agenda {
        Agenda::new(
            items,
            EngineSettings::default(),
            at(2025, 3, 12, 9),
            date(2025, 3, 12),
        )
    }

    #[test]
    fn recurring_items_expand_into_buckets() {
        let mut standup = named("standup", at(2025, 3, 10, 9));
        standup.rule = Some("FREQ=DAILY;INTERVAL=1;COUNT=3".to_string());
        let agenda = agenda(vec![standup]);

        assert_eq!(agenda.expanded().len(), 3);
        let days = agenda.buckets().iter().map(|b| b.day).collect::<Vec<_>>();
        assert_eq!(days, vec![date(2025, 3, 10), date(2025, 3, 11), date(2025, 3, 12)]);
        assert_eq!(
            agenda.buckets()[1].entries[0].item.id,
            "standup@2025-03-11"
        );
    }

    #[test]
    fn buckets_between_is_inclusive() {
        let agenda = agenda(vec![
            named("a", at(2025, 3, 1, 9)),
            named("b", at(2025, 3, 5, 9)),
            named("c", at(2025, 3, 9, 9)),
        ]);
        let days = agenda
            .buckets_between(date(2025, 3, 5), date(2025, 3, 9))
            .iter()
            .map(|b| b.day)
            .collect::<Vec<_>>();
        assert_eq!(days, vec![date(2025, 3, 5), date(2025, 3, 9)]);
        assert!(agenda.buckets_between(date(2025, 3, 10), date(2025, 3, 1)).is_empty());
    }

    #[test]
    fn drop_persists_and_regroups() {
        let mut task = named("task", at(2025, 3, 1, 8));
        task.due = Some(at(2025, 3, 20, 15));
        let mut agenda = agenda(vec![task]);
        let mut sink = RecordingSink::default();

        let placement = agenda
            .on_item_drop("task", "tomorrow", &mut sink)
            .expect("drop");
        assert_eq!(placement.new_due, Some(at(2025, 3, 13, 15)));
        assert_eq!(sink.calls, vec![("task".to_string(), Some(at(2025, 3, 13, 15)))]);
        assert!(agenda.pending().is_empty());

        let groups = agenda.due_groups();
        assert_eq!(groups[1].bucket, DueBucket::Tomorrow);
        assert_eq!(groups[1].items[0].id, "task");
    }

    #[test]
    fn failed_persist_keeps_placement_for_rollback() {
        let mut task = named("task", at(2025, 3, 1, 8));
        task.due = Some(at(2025, 3, 20, 15));
        let mut agenda = agenda(vec![task]);
        let mut sink = RecordingSink {
            fail: true,
            ..RecordingSink::default()
        };

        let placement = agenda
            .on_item_drop("task", "someday", &mut sink)
            .expect("drop still applies");
        assert_eq!(agenda.items()[0].due, None);
        assert_eq!(agenda.pending(), [placement.clone()]);

        agenda.rollback(&placement).expect("rollback");
        assert_eq!(agenda.items()[0].due, Some(at(2025, 3, 20, 15)));
        assert!(agenda.pending().is_empty());
        assert!(agenda.rollback(&placement).is_err());
    }

    #[test]
    fn confirming_one_of_two_identical_placements_keeps_the_other() {
        let mut agenda = agenda(vec![named("task", at(2025, 3, 1, 8))]);
        let first = agenda
            .apply_drop("task", DueBucket::Someday)
            .expect("first drop");
        let second = agenda
            .apply_drop("task", DueBucket::Someday)
            .expect("second drop");
        assert_eq!(first, second);

        agenda.confirm(&first);
        assert_eq!(agenda.pending(), [second.clone()]);
        agenda.rollback(&second).expect("rollback");
        assert!(agenda.pending().is_empty());
    }

    #[test]
    fn unknown_bucket_or_item_is_an_error() {
        let mut agenda = agenda(vec![named("task", at(2025, 3, 1, 8))]);
        let mut sink = RecordingSink::default();
        assert!(agenda.on_item_drop("task", "later", &mut sink).is_err());
        assert!(agenda.on_item_drop("ghost", "today", &mut sink).is_err());
        assert!(sink.calls.is_empty());
    }

    #[test]
    fn click_on_occurrence_selects_its_day() {
        let mut weekly = named("gym", at(2025, 3, 3, 18));
        weekly.rule = Some("FREQ=WEEKLY;INTERVAL=1;COUNT=2".to_string());
        let mut agenda = agenda(vec![weekly]);
        let mut view = AllRendered::default();

        let timer = agenda
            .on_item_click("gym@2025-03-10", &mut view)
            .expect("settle timer");
        assert_eq!(view.scrolled, vec![date(2025, 3, 10)]);
        assert_eq!(agenda.on_item_click("missing", &mut view), None);

        // The unknown click left the pending settle in place.
        assert!(matches!(
            agenda.synchronizer().phase(),
            SyncPhase::ProgrammaticScrolling { .. }
        ));
        assert_eq!(timer.kind, TimerKind::Settle);
        agenda.on_timer(timer.ticket, timer.kind, &mut view);
        assert_eq!(agenda.sync_state().visible_date, Some(date(2025, 3, 10)));
    }

    #[test]
    fn due_groups_cover_every_bucket_in_order() {
        let mut overdue = named("overdue", at(2025, 3, 1, 8));
        overdue.due = Some(at(2025, 3, 2, 9));
        let mut later = named("later", at(2025, 3, 1, 8));
        later.due = Some(at(2025, 4, 2, 9));
        let undated = named("undated", at(2025, 3, 1, 8));
        let agenda = agenda(vec![later, undated, overdue]);

        let summary = agenda
            .due_groups()
            .iter()
            .map(|group| {
                (
                    group.bucket,
                    group.items.iter().map(|item| item.id.as_str()).collect::<BTreeSet<_>>(),
                )
            })
            .collect::<Vec<_>>();
        assert_eq!(
            summary,
            vec![
                (DueBucket::Today, BTreeSet::from(["overdue"])),
                (DueBucket::Tomorrow, BTreeSet::new()),
                (DueBucket::Upcoming, BTreeSet::from(["later"])),
                (DueBucket::Someday, BTreeSet::from(["undated"])),
            ]
        );
    }
}
