//! Keeps the externally selected date and the scrolled-to date of a lazily
//! rendered day list in agreement.
//!
//! The synchronizer never sleeps. Whenever it needs to wait it hands back a
//! [`TimerRequest`]; the host fires it later through
//! [`Synchronizer::on_timer`]. Each date request gets a fresh [`Ticket`] and
//! timers carrying an older ticket are dropped, so the latest request always
//! wins.

use std::fmt;
use std::time::Duration;

use chrono::NaiveDate;
use tracing::{debug, info, trace};

use crate::bucket::{DayBucket, bucket_days, nearest_bucket_day};
use crate::datetime::to_calendar_day;
use crate::item::CalendarItem;

/// The rendered list as seen by the synchronizer.
///
/// Errors from any method are treated as "element not found".
pub trait ListView {
    /// Whether the element for `day` has been rendered.
    fn locate_day(&self, day: NaiveDate) -> anyhow::Result<bool>;

    fn scroll_to_day(&mut self, day: NaiveDate) -> anyhow::Result<()>;

    /// Day whose element sits nearest the top of the viewport.
    fn topmost_visible_day(&self) -> anyhow::Result<Option<NaiveDate>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(u64);

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Scroll animation finished.
    Settle,
    /// Look for a day element that was not rendered yet.
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerRequest {
    pub ticket: Ticket,
    pub kind: TimerKind,
    pub delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollStep {
    AwaitingElement { retries_left: u32 },
    Settling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    NoItems,
    NotRendered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    ProgrammaticScrolling {
        ticket: Ticket,
        target: NaiveDate,
        step: ScrollStep,
    },
    NoMatchFallback {
        ticket: Ticket,
        requested: NaiveDate,
        shown: NaiveDate,
        reason: FallbackReason,
    },
}

impl SyncPhase {
    fn ticket(&self) -> Option<Ticket> {
        match self {
            SyncPhase::Idle => None,
            SyncPhase::ProgrammaticScrolling { ticket, .. }
            | SyncPhase::NoMatchFallback { ticket, .. } => Some(*ticket),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub settle_delay: Duration,
    pub retry_delay: Duration,
    pub retries: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(300),
            retry_delay: Duration::from_millis(500),
            retries: 1,
        }
    }
}

/// Snapshot handed to the UI for status display.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncState {
    pub selected_date: Option<NaiveDate>,
    pub visible_date: Option<NaiveDate>,
    /// Day actually scrolled to; differs from `visible_date` after a
    /// nearest-match fallback.
    pub shown_date: Option<NaiveDate>,
    pub is_programmatic_scroll: bool,
    pub pending_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Synchronizer {
    settings: SyncSettings,
    days: Vec<NaiveDate>,
    phase: SyncPhase,
    selected: Option<NaiveDate>,
    visible: Option<NaiveDate>,
    shown: Option<NaiveDate>,
    message: Option<String>,
    issued: u64,
}

impl Synchronizer {
    pub fn new(settings: SyncSettings) -> Self {
        Self {
            settings,
            days: Vec::new(),
            phase: SyncPhase::Idle,
            selected: None,
            visible: None,
            shown: None,
            message: None,
            issued: 0,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn state(&self) -> SyncState {
        SyncState {
            selected_date: self.selected,
            visible_date: self.visible,
            shown_date: self.shown,
            is_programmatic_scroll: self.phase != SyncPhase::Idle,
            pending_message: self.message.clone(),
        }
    }

    /// Replaces the day index without reacting to it.
    pub fn set_buckets(&mut self, buckets: &[DayBucket]) {
        self.days = bucket_days(buckets);
    }

    pub fn has_items_on_day(&self, day: NaiveDate) -> bool {
        self.days.binary_search(&day).is_ok()
    }

    /// Selects `date` and scrolls the list toward it.
    #[tracing::instrument(skip(self, view), fields(date = %date))]
    pub fn request_select_date(
        &mut self,
        date: NaiveDate,
        view: &mut dyn ListView,
    ) -> Option<TimerRequest> {
        if let Some(previous) = self.phase.ticket() {
            debug!(%previous, "superseding in-flight date request");
        }
        self.issued += 1;
        let ticket = Ticket(self.issued);

        self.selected = Some(date);
        self.message = None;

        if self.has_items_on_day(date) {
            self.phase = SyncPhase::ProgrammaticScrolling {
                ticket,
                target: date,
                step: ScrollStep::AwaitingElement {
                    retries_left: self.settings.retries,
                },
            };
            self.attempt_scroll(ticket, date, view)
        } else {
            self.fall_back(ticket, date, FallbackReason::NoItems, view)
        }
    }

    pub fn on_item_click(
        &mut self,
        item: &CalendarItem,
        view: &mut dyn ListView,
    ) -> Option<TimerRequest> {
        self.request_select_date(to_calendar_day(&item.start), view)
    }

    /// Render-complete signal: a new bucket set is on screen.
    #[tracing::instrument(skip(self, buckets, view), fields(buckets = buckets.len()))]
    pub fn on_buckets_rendered(
        &mut self,
        buckets: &[DayBucket],
        view: &mut dyn ListView,
    ) -> Option<TimerRequest> {
        self.set_buckets(buckets);

        let SyncPhase::ProgrammaticScrolling {
            ticket,
            target,
            step: ScrollStep::AwaitingElement { .. },
        } = self.phase
        else {
            return None;
        };

        if !self.has_items_on_day(target) {
            return self.fall_back(ticket, target, FallbackReason::NoItems, view);
        }
        if element_ready(view, target) {
            return self.scroll_and_settle(ticket, target, view);
        }
        // A retry timer is still pending for this ticket.
        trace!(%target, "render finished without the requested day");
        None
    }

    #[tracing::instrument(skip(self, view))]
    pub fn on_timer(
        &mut self,
        ticket: Ticket,
        kind: TimerKind,
        view: &mut dyn ListView,
    ) -> Option<TimerRequest> {
        if self.phase.ticket() != Some(ticket) {
            debug!(%ticket, "ignoring timer for superseded request");
            return None;
        }

        match (self.phase, kind) {
            (
                SyncPhase::ProgrammaticScrolling {
                    step: ScrollStep::Settling,
                    ..
                },
                TimerKind::Settle,
            ) => {
                self.message = None;
                self.settle();
                None
            }
            (SyncPhase::NoMatchFallback { .. }, TimerKind::Settle) => {
                self.settle();
                None
            }
            (
                SyncPhase::ProgrammaticScrolling {
                    target,
                    step: ScrollStep::AwaitingElement { .. },
                    ..
                },
                TimerKind::Retry,
            ) => self.attempt_scroll(ticket, target, view),
            (phase, kind) => {
                trace!(?phase, ?kind, "timer does not apply to current phase");
                None
            }
        }
    }

    /// User-driven scroll; ignored while a programmatic scroll is running.
    pub fn on_user_scroll(&mut self, view: &dyn ListView) {
        if self.phase != SyncPhase::Idle {
            trace!("ignoring scroll event during programmatic scroll");
            return;
        }

        match view.topmost_visible_day() {
            Ok(Some(day)) => {
                if self.visible != Some(day) {
                    trace!(%day, "visible day changed by user scroll");
                }
                self.visible = Some(day);
                self.shown = Some(day);
            }
            Ok(None) => {}
            Err(err) => {
                debug!(error = %err, "could not read topmost visible day");
            }
        }
    }

    fn attempt_scroll(
        &mut self,
        ticket: Ticket,
        target: NaiveDate,
        view: &mut dyn ListView,
    ) -> Option<TimerRequest> {
        if element_ready(view, target) {
            return self.scroll_and_settle(ticket, target, view);
        }

        let retries_left = match self.phase {
            SyncPhase::ProgrammaticScrolling {
                step: ScrollStep::AwaitingElement { retries_left },
                ..
            } => retries_left,
            _ => 0,
        };
        if retries_left == 0 {
            return self.fall_back(ticket, target, FallbackReason::NotRendered, view);
        }

        self.phase = SyncPhase::ProgrammaticScrolling {
            ticket,
            target,
            step: ScrollStep::AwaitingElement {
                retries_left: retries_left - 1,
            },
        };
        self.message = Some(format!("Loading items for {target}..."));
        debug!(%ticket, %target, "day not rendered yet; retry scheduled");
        Some(TimerRequest {
            ticket,
            kind: TimerKind::Retry,
            delay: self.settings.retry_delay,
        })
    }

    fn scroll_and_settle(
        &mut self,
        ticket: Ticket,
        target: NaiveDate,
        view: &mut dyn ListView,
    ) -> Option<TimerRequest> {
        if let Err(err) = view.scroll_to_day(target) {
            debug!(error = %err, %target, "scroll failed; treating day as missing");
            return self.fall_back(ticket, target, FallbackReason::NotRendered, view);
        }
        self.phase = SyncPhase::ProgrammaticScrolling {
            ticket,
            target,
            step: ScrollStep::Settling,
        };
        self.shown = Some(target);
        Some(self.settle_timer(ticket))
    }

    fn fall_back(
        &mut self,
        ticket: Ticket,
        requested: NaiveDate,
        reason: FallbackReason,
        view: &mut dyn ListView,
    ) -> Option<TimerRequest> {
        let candidates = match reason {
            FallbackReason::NoItems => self.days.clone(),
            FallbackReason::NotRendered => self
                .days
                .iter()
                .copied()
                .filter(|day| *day != requested)
                .collect(),
        };

        let Some(shown) = nearest_bucket_day(&candidates, requested) else {
            info!(%requested, ?reason, "no other day to show");
            self.message = Some(match reason {
                FallbackReason::NoItems => "Nothing scheduled anywhere".to_string(),
                FallbackReason::NotRendered => format!("Could not display {requested}"),
            });
            self.phase = SyncPhase::Idle;
            self.visible = self.selected;
            return None;
        };

        if let Err(err) = view.scroll_to_day(shown) {
            debug!(error = %err, %shown, "fallback scroll failed");
        }
        self.message = Some(match reason {
            FallbackReason::NoItems => {
                format!("No items on {requested}; showing {shown}")
            }
            FallbackReason::NotRendered => {
                format!("Could not display {requested}; showing {shown}")
            }
        });
        self.shown = Some(shown);
        self.phase = SyncPhase::NoMatchFallback {
            ticket,
            requested,
            shown,
            reason,
        };
        info!(%requested, %shown, ?reason, "showing nearest day instead");
        Some(self.settle_timer(ticket))
    }

    fn settle(&mut self) {
        // The active date reflects what was asked for, not what is shown.
        self.visible = self.selected;
        self.phase = SyncPhase::Idle;
    }

    fn settle_timer(&self, ticket: Ticket) -> TimerRequest {
        TimerRequest {
            ticket,
            kind: TimerKind::Settle,
            delay: self.settings.settle_delay,
        }
    }
}

fn element_ready(view: &dyn ListView, day: NaiveDate) -> bool {
    match view.locate_day(day) {
        Ok(found) => found,
        Err(err) => {
            debug!(error = %err, %day, "day lookup failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use anyhow::anyhow;
    use chrono::{NaiveDate, TimeZone, Utc};

    use super::{
        ListView, SyncPhase, SyncSettings, Synchronizer, TimerKind, TimerRequest,
    };
    use crate::bucket::bucket;
    use crate::item::CalendarItem;

    #[derive(Default)]
    struct FakeView {
        rendered: BTreeSet<NaiveDate>,
        scrolled: Vec<NaiveDate>,
        top: Option<NaiveDate>,
        broken: bool,
    }

    impl ListView for FakeView {
        fn locate_day(&self, day: NaiveDate) -> anyhow::Result<bool> {
            if self.broken {
                return Err(anyhow!("query failed"));
            }
            Ok(self.rendered.contains(&day))
        }

        fn scroll_to_day(&mut self, day: NaiveDate) -> anyhow::Result<()> {
            self.scrolled.push(day);
            self.top = Some(day);
            Ok(())
        }

        fn topmost_visible_day(&self) -> anyhow::Result<Option<NaiveDate>> {
            Ok(self.top)
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn item_on(day: NaiveDate) -> CalendarItem {
        let start = Utc
            .from_utc_datetime(&day.and_hms_opt(9, 0, 0).expect("valid time"));
        CalendarItem::new(format!("item {day}"), start)
    }

    fn synced(days: &[NaiveDate]) -> Synchronizer {
        let items = days.iter().copied().map(item_on).collect::<Vec<_>>();
        let mut sync = Synchronizer::new(SyncSettings::default());
        sync.set_buckets(&bucket(&items));
        sync
    }

    fn rendered(days: &[NaiveDate]) -> FakeView {
        FakeView {
            rendered: days.iter().copied().collect(),
            ..FakeView::default()
        }
    }

    fn fire(sync: &mut Synchronizer, timer: TimerRequest, view: &mut FakeView) -> Option<TimerRequest> {
        sync.on_timer(timer.ticket, timer.kind, view)
    }

    #[test]
    fn empty_day_falls_back_to_nearest_bucket() {
        let days = [date(2025, 2, 27), date(2025, 3, 10)];
        let mut sync = synced(&days);
        let mut view = rendered(&days);

        let timer = sync
            .request_select_date(date(2025, 3, 1), &mut view)
            .expect("settle timer");
        assert_eq!(timer.kind, TimerKind::Settle);
        assert!(matches!(sync.phase(), SyncPhase::NoMatchFallback { .. }));
        assert_eq!(view.scrolled, vec![date(2025, 2, 27)]);

        let state = sync.state();
        assert_eq!(state.selected_date, Some(date(2025, 3, 1)));
        assert_eq!(state.shown_date, Some(date(2025, 2, 27)));
        let message = state.pending_message.expect("message");
        assert!(message.contains("2025-03-01"));
        assert!(message.contains("2025-02-27"));

        assert_eq!(fire(&mut sync, timer, &mut view), None);
        let state = sync.state();
        assert_eq!(sync.phase(), SyncPhase::Idle);
        assert_eq!(state.visible_date, Some(date(2025, 3, 1)));
        assert_eq!(state.shown_date, Some(date(2025, 2, 27)));
    }

    #[test]
    fn rendered_day_scrolls_then_settles() {
        let days = [date(2025, 3, 10), date(2025, 3, 12)];
        let mut sync = synced(&days);
        let mut view = rendered(&days);

        let timer = sync
            .request_select_date(date(2025, 3, 12), &mut view)
            .expect("settle timer");
        assert!(sync.state().is_programmatic_scroll);
        assert_eq!(view.scrolled, vec![date(2025, 3, 12)]);

        fire(&mut sync, timer, &mut view);
        let state = sync.state();
        assert!(!state.is_programmatic_scroll);
        assert_eq!(state.visible_date, Some(date(2025, 3, 12)));
        assert_eq!(state.pending_message, None);
    }

    #[test]
    fn missing_element_waits_for_render_signal() {
        let days = [date(2025, 3, 10), date(2025, 3, 12)];
        let mut sync = synced(&days);
        let mut view = rendered(&[]);

        let timer = sync
            .request_select_date(date(2025, 3, 12), &mut view)
            .expect("retry timer");
        assert_eq!(timer.kind, TimerKind::Retry);
        assert!(sync.state().pending_message.expect("loading").starts_with("Loading"));
        assert!(view.scrolled.is_empty());

        view.rendered = days.iter().copied().collect();
        let items = days.iter().copied().map(item_on).collect::<Vec<_>>();
        let settle = sync
            .on_buckets_rendered(&bucket(&items), &mut view)
            .expect("settle timer");
        assert_eq!(settle.kind, TimerKind::Settle);
        assert_eq!(view.scrolled, vec![date(2025, 3, 12)]);

        // The retry armed earlier is now stale for this phase.
        assert_eq!(fire(&mut sync, timer, &mut view), None);
        fire(&mut sync, settle, &mut view);
        assert_eq!(sync.state().visible_date, Some(date(2025, 3, 12)));
    }

    #[test]
    fn element_that_never_appears_falls_back() {
        let days = [date(2025, 3, 10), date(2025, 3, 12)];
        let mut sync = synced(&days);
        let mut view = rendered(&[date(2025, 3, 10)]);

        let retry = sync
            .request_select_date(date(2025, 3, 12), &mut view)
            .expect("retry timer");
        let settle = fire(&mut sync, retry, &mut view).expect("settle timer");
        assert!(matches!(sync.phase(), SyncPhase::NoMatchFallback { .. }));
        assert_eq!(view.scrolled, vec![date(2025, 3, 10)]);

        fire(&mut sync, settle, &mut view);
        assert_eq!(sync.state().visible_date, Some(date(2025, 3, 12)));
    }

    #[test]
    fn newer_request_invalidates_pending_retry() {
        let days = [date(2025, 3, 10), date(2025, 3, 12)];
        let mut sync = synced(&days);
        let mut view = rendered(&[date(2025, 3, 10)]);

        let stale = sync
            .request_select_date(date(2025, 3, 12), &mut view)
            .expect("retry timer");
        let settle = sync
            .request_select_date(date(2025, 3, 10), &mut view)
            .expect("settle timer");
        assert_eq!(view.scrolled, vec![date(2025, 3, 10)]);

        view.rendered.insert(date(2025, 3, 12));
        assert_eq!(fire(&mut sync, stale, &mut view), None);
        assert_eq!(view.scrolled, vec![date(2025, 3, 10)]);

        fire(&mut sync, settle, &mut view);
        assert_eq!(sync.state().selected_date, Some(date(2025, 3, 10)));
        assert_eq!(sync.state().visible_date, Some(date(2025, 3, 10)));
    }

    #[test]
    fn user_scroll_is_ignored_while_scrolling_programmatically() {
        let days = [date(2025, 3, 10), date(2025, 3, 12)];
        let mut sync = synced(&days);
        let mut view = rendered(&days);

        view.top = Some(date(2025, 3, 10));
        sync.on_user_scroll(&view);
        assert_eq!(sync.state().visible_date, Some(date(2025, 3, 10)));

        let timer = sync
            .request_select_date(date(2025, 3, 12), &mut view)
            .expect("settle timer");
        view.top = Some(date(2025, 3, 11));
        sync.on_user_scroll(&view);
        assert_eq!(sync.state().visible_date, Some(date(2025, 3, 10)));

        fire(&mut sync, timer, &mut view);
        assert_eq!(sync.state().visible_date, Some(date(2025, 3, 12)));
    }

    #[test]
    fn no_buckets_reports_nothing_without_scrolling() {
        let mut sync = synced(&[]);
        let mut view = rendered(&[]);

        assert_eq!(sync.request_select_date(date(2025, 3, 1), &mut view), None);
        assert_eq!(sync.phase(), SyncPhase::Idle);
        assert!(view.scrolled.is_empty());
        assert_eq!(
            sync.state().pending_message.as_deref(),
            Some("Nothing scheduled anywhere")
        );
    }

    #[test]
    fn only_day_that_never_renders_reports_it_could_not_be_displayed() {
        let days = [date(2025, 3, 12)];
        let mut sync = synced(&days);
        let mut view = rendered(&[]);

        let retry = sync
            .request_select_date(date(2025, 3, 12), &mut view)
            .expect("retry timer");
        assert_eq!(fire(&mut sync, retry, &mut view), None);
        assert_eq!(sync.phase(), SyncPhase::Idle);
        assert!(view.scrolled.is_empty());
        assert_eq!(
            sync.state().pending_message.as_deref(),
            Some("Could not display 2025-03-12")
        );
        assert_eq!(sync.state().visible_date, Some(date(2025, 3, 12)));
    }

    #[test]
    fn view_errors_route_into_retry_and_fallback() {
        let days = [date(2025, 3, 10), date(2025, 3, 12)];
        let mut sync = Synchronizer::new(SyncSettings {
            retries: 0,
            ..SyncSettings::default()
        });
        let items = days.iter().copied().map(item_on).collect::<Vec<_>>();
        sync.set_buckets(&bucket(&items));
        let mut view = FakeView {
            broken: true,
            ..rendered(&days)
        };

        let timer = sync
            .request_select_date(date(2025, 3, 12), &mut view)
            .expect("settle timer");
        assert_eq!(timer.kind, TimerKind::Settle);
        assert!(matches!(sync.phase(), SyncPhase::NoMatchFallback { .. }));
        assert_eq!(view.scrolled, vec![date(2025, 3, 10)]);
    }

    #[test]
    fn item_click_selects_its_calendar_day() {
        let days = [date(2025, 3, 10)];
        let mut sync = synced(&days);
        let mut view = rendered(&days);

        sync.on_item_click(&item_on(date(2025, 3, 10)), &mut view);
        assert_eq!(sync.state().selected_date, Some(date(2025, 3, 10)));
        assert_eq!(view.scrolled, vec![date(2025, 3, 10)]);
    }
}
