//! Projects recurring items onto concrete dates inside a bounded window.

use std::ops::ControlFlow;

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveTime, Utc};
use tracing::{debug, warn};

use crate::datetime::to_calendar_day;
use crate::item::CalendarItem;
use crate::recurrence::{Frequency, RecurrenceRule, Termination};

/// Upper bound on generator steps, whatever the rule and window say.
const MAX_STEPS: u32 = 20_000;

/// Generation window; `end` is the hard horizon for unbounded rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Horizon {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Horizon {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// `months` months either side of `now`.
    pub fn from_now(now: DateTime<Utc>, months: u32) -> Self {
        let start = now
            .checked_sub_months(Months::new(months))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let end = now
            .checked_add_months(Months::new(months))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self { start, end }
    }
}

struct Collector {
    anchor_start: DateTime<Utc>,
    anchor_day: NaiveDate,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    until: Option<DateTime<Utc>>,
    remaining: Option<u32>,
    out: Vec<DateTime<Utc>>,
}

impl Collector {
    fn offer(&mut self, candidate: DateTime<Utc>) -> ControlFlow<()> {
        if candidate <= self.anchor_start {
            return ControlFlow::Continue(());
        }
        if self.remaining == Some(0)
            || self.until.is_some_and(|until| candidate > until)
            || candidate > self.window_end
        {
            return ControlFlow::Break(());
        }
        if to_calendar_day(&candidate) == self.anchor_day {
            return ControlFlow::Continue(());
        }

        if candidate >= self.window_start {
            self.out.push(candidate);
        }
        match self.remaining.as_mut() {
            Some(remaining) => {
                *remaining -= 1;
                if *remaining == 0 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            }
            None => ControlFlow::Continue(()),
        }
    }

    /// Last day a skipped candidate may fall on: before the window opens and
    /// no later than `UNTIL`.
    fn skip_limit(&self) -> Option<NaiveDate> {
        let before_window = to_calendar_day(&self.window_start).pred_opt()?;
        let until_day = self.until.map(|until| to_calendar_day(&until));
        Some(until_day.map_or(before_window, |until| until.min(before_window)))
    }

    /// Accounts for `occurrences` candidates passed over without being
    /// offered; breaks once they use up `COUNT`.
    fn skip(&mut self, occurrences: u64) -> ControlFlow<()> {
        if let Some(remaining) = self.remaining.as_mut() {
            if u64::from(*remaining) <= occurrences {
                *remaining = 0;
                return ControlFlow::Break(());
            }
            // Smaller than `remaining`, so it fits.
            *remaining -= occurrences as u32;
        }
        if occurrences > 0 {
            debug!(occurrences, "skipped occurrences before the window");
        }
        ControlFlow::Continue(())
    }

    /// True once a whole period starting on `day` lies past every bound.
    fn exhausted_from(&self, day: NaiveDate) -> bool {
        let horizon_day = to_calendar_day(&self.window_end);
        let until_day = self.until.map(|until| to_calendar_day(&until));
        day > horizon_day || until_day.is_some_and(|until| day > until)
    }
}

/// Concrete start instants for `rule` after the anchor, ascending.
///
/// The anchor itself is never returned but counts as the first occurrence
/// toward `COUNT`. Candidates before `window_start` are counted and dropped;
/// nothing after `window_end` is ever produced.
#[tracing::instrument(level = "debug", skip(rule), fields(rule = %rule))]
pub fn generate(
    rule: &RecurrenceRule,
    anchor_start: DateTime<Utc>,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Vec<DateTime<Utc>> {
    let remaining = match rule.termination {
        Termination::Count(count) => Some(count.get() - 1),
        _ => None,
    };
    let mut collector = Collector {
        anchor_start,
        anchor_day: to_calendar_day(&anchor_start),
        window_start,
        window_end,
        until: rule.until_instant(),
        remaining,
        out: Vec::new(),
    };
    if collector.remaining == Some(0) {
        return collector.out;
    }

    let time = anchor_start.time();
    let interval = i64::from(rule.interval.get());
    let finished = match rule.frequency {
        Frequency::Daily => step_days(&mut collector, time, interval),
        Frequency::Weekly => step_weeks(&mut collector, rule, time, interval),
        Frequency::Monthly => step_months(&mut collector, time, interval),
        Frequency::Yearly => step_months(&mut collector, time, interval * 12),
    };
    if !finished {
        warn!(
            anchor = %anchor_start,
            steps = MAX_STEPS,
            "occurrence generation hit the step limit"
        );
    }

    debug!(count = collector.out.len(), "generated occurrences");
    collector.out
}

fn at(day: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    day.and_time(time).and_utc()
}

fn step_days(collector: &mut Collector, time: NaiveTime, interval: i64) -> bool {
    let skipped = collector
        .skip_limit()
        .map_or(0, |limit| ((limit - collector.anchor_day).num_days() / interval).max(0));
    if collector.skip(skipped.unsigned_abs()).is_break() {
        return true;
    }

    for step in (skipped + 1)..=(skipped + i64::from(MAX_STEPS)) {
        let Some(day) = collector
            .anchor_day
            .checked_add_signed(Duration::days(step * interval))
        else {
            return true;
        };
        if collector.offer(at(day, time)).is_break() {
            return true;
        }
    }
    false
}

fn step_weeks(
    collector: &mut Collector,
    rule: &RecurrenceRule,
    time: NaiveTime,
    interval: i64,
) -> bool {
    let weekdays = rule.effective_weekdays(collector.anchor_day);
    let back = i64::from(collector.anchor_day.weekday().num_days_from_monday());
    let Some(first_monday) = collector
        .anchor_day
        .checked_add_signed(Duration::days(-back))
    else {
        return true;
    };

    // Whole weeks after the anchor's week that end before the window.
    let skipped = collector.skip_limit().map_or(0, |limit| {
        ((limit - first_monday).num_days() - 6).div_euclid(7 * interval).max(0)
    });
    let per_week = weekdays.len() as u64;
    if collector
        .skip(skipped.unsigned_abs().saturating_mul(per_week))
        .is_break()
    {
        return true;
    }

    let steps = std::iter::once(0).chain((skipped + 1)..);
    for step in steps.take(MAX_STEPS as usize) {
        let Some(monday) = first_monday.checked_add_signed(Duration::weeks(step * interval)) else {
            return true;
        };
        if collector.exhausted_from(monday) {
            return true;
        }
        for weekday in weekdays.iter() {
            let offset = i64::from(weekday.num_days_from_monday());
            let Some(day) = monday.checked_add_signed(Duration::days(offset)) else {
                return true;
            };
            if collector.offer(at(day, time)).is_break() {
                return true;
            }
        }
    }
    false
}

/// Steps whole months, skipping dates the target month does not have.
fn step_months(collector: &mut Collector, time: NaiveTime, months: i64) -> bool {
    let anchor = collector.anchor_day;
    let base = month_index(anchor);

    // Whole months before the one holding the skip limit.
    let skipped = collector
        .skip_limit()
        .map_or(0, |limit| ((month_index(limit) - 1 - base) / months).max(0));
    let occurrences = if anchor.day() <= 28 {
        skipped.unsigned_abs()
    } else {
        (1..=skipped)
            .filter(|step| month_has_day(base + step * months, anchor.day()))
            .count() as u64
    };
    if collector.skip(occurrences).is_break() {
        return true;
    }

    for step in (skipped + 1)..=(skipped + i64::from(MAX_STEPS)) {
        let index = base + step * months;
        let Ok(year) = i32::try_from(index.div_euclid(12)) else {
            return true;
        };
        let month = index.rem_euclid(12) as u32 + 1;
        let Some(month_start) = NaiveDate::from_ymd_opt(year, month, 1) else {
            return true;
        };
        if collector.exhausted_from(month_start) {
            return true;
        }
        let Some(day) = NaiveDate::from_ymd_opt(year, month, anchor.day()) else {
            debug!(year, month, day = anchor.day(), "skipping nonexistent date");
            continue;
        };
        if collector.offer(at(day, time)).is_break() {
            return true;
        }
    }
    false
}

fn month_index(day: NaiveDate) -> i64 {
    i64::from(day.year()) * 12 + i64::from(day.month0())
}

fn month_has_day(index: i64, day: u32) -> bool {
    let Ok(year) = i32::try_from(index.div_euclid(12)) else {
        return false;
    };
    let month = index.rem_euclid(12) as u32 + 1;
    NaiveDate::from_ymd_opt(year, month, day).is_some()
}

/// Synthetic copies of `item` for every generated occurrence.
///
/// Items without a rule, synthetic items, and items whose rule cannot be
/// parsed yield nothing.
#[tracing::instrument(level = "debug", skip(item), fields(id = %item.id))]
pub fn expand_item(
    item: &CalendarItem,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Vec<CalendarItem> {
    if item.is_synthetic() {
        return Vec::new();
    }
    let rule = match item.recurrence() {
        None => return Vec::new(),
        Some(Ok(rule)) => rule,
        Some(Err(err)) => {
            warn!(
                id = %item.id,
                rule = ?item.rule,
                error = %err,
                "malformed recurrence rule; no occurrences generated"
            );
            return Vec::new();
        }
    };

    generate(&rule, item.start, window_start, window_end)
        .into_iter()
        .map(|start| occurrence_of(item, start))
        .collect()
}

fn occurrence_of(item: &CalendarItem, start: DateTime<Utc>) -> CalendarItem {
    let shift = start - item.start;
    CalendarItem {
        id: occurrence_id(&item.id, to_calendar_day(&start)),
        title: item.title.clone(),
        start,
        end: item.end.map(|_| start + item.duration()),
        all_day: item.all_day,
        due: item.due.map(|due| due + shift),
        rule: None,
        synthetic: Some(true),
        source_id: Some(item.id.clone()),
        owner_id: item.owner_id.clone(),
    }
}

/// Stable id for the occurrence of `source_id` on `day`.
pub fn occurrence_id(source_id: &str, day: NaiveDate) -> String {
    format!("{source_id}@{}", day.format("%Y-%m-%d"))
}

/// Originals followed by every occurrence generated inside `horizon`.
#[tracing::instrument(skip(items))]
pub fn expand_all(items: &[CalendarItem], horizon: Horizon) -> Vec<CalendarItem> {
    let mut out = items.to_vec();
    for item in items {
        out.extend(expand_item(item, horizon.start, horizon.end));
    }
    debug!(
        originals = items.len(),
        total = out.len(),
        "expanded recurring items"
    );
    out
}
