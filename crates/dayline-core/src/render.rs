use std::io::{self, IsTerminal, Write};

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use unicode_width::UnicodeWidthStr;

use crate::agenda::DueGroup;
use crate::bucket::DayBucket;
use crate::config::Config;
use crate::item::CalendarItem;
use crate::recurrence::RecurrenceRule;
use crate::sync::SyncState;

#[derive(Debug, Clone)]
pub struct Renderer {
    color: bool,
}

impl Renderer {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let color = cfg
            .get_bool("color")
            .context("invalid color setting")?
            .unwrap_or(true);

        Ok(Self {
            color: color && io::stdout().is_terminal(),
        })
    }

    pub fn plain() -> Self {
        Self { color: false }
    }

    #[tracing::instrument(skip(self, buckets), fields(buckets = buckets.len()))]
    pub fn print_agenda(&mut self, buckets: &[DayBucket], today: NaiveDate) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        self.write_agenda(&mut out, buckets, today)
    }

    /// Day list with a header whenever the month changes.
    pub fn write_agenda<W: Write>(
        &self,
        mut out: W,
        buckets: &[DayBucket],
        today: NaiveDate,
    ) -> anyhow::Result<()> {
        if buckets.is_empty() {
            writeln!(out, "Nothing scheduled.")?;
            return Ok(());
        }

        let mut previous: Option<&DayBucket> = None;
        for bucket in buckets {
            if bucket.starts_new_month(previous) {
                if previous.is_some() {
                    writeln!(out)?;
                }
                let header = bucket.day.format("%B %Y").to_string();
                writeln!(out, "{}", self.paint(&header, "1"))?;
            }

            let label = bucket.day.format("%a %Y-%m-%d").to_string();
            let label = if bucket.day == today {
                self.paint(&label, "32")
            } else {
                label
            };
            writeln!(out, "  {label}")?;

            for entry in &bucket.entries {
                let when = if entry.continuation {
                    "  ...".to_string()
                } else if entry.item.is_all_day() {
                    "all-day".to_string()
                } else {
                    entry.item.start.format("%H:%M").to_string()
                };
                let marker = if entry.item.is_synthetic() { " *" } else { "" };
                writeln!(
                    out,
                    "    {} {}{}",
                    self.paint(&pad(&when, 7), "33"),
                    entry.item.title,
                    marker
                )?;
            }
            previous = Some(bucket);
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, groups))]
    pub fn print_due_groups(&mut self, groups: &[DueGroup<'_>]) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        self.write_due_groups(&mut out, groups)
    }

    pub fn write_due_groups<W: Write>(
        &self,
        mut out: W,
        groups: &[DueGroup<'_>],
    ) -> anyhow::Result<()> {
        for group in groups {
            writeln!(
                out,
                "{} ({})",
                self.paint(group.bucket.name(), "1"),
                group.items.len()
            )?;
            if group.items.is_empty() {
                continue;
            }

            let rows = group
                .items
                .iter()
                .map(|item| {
                    vec![
                        short_id(&item.id),
                        item.due
                            .map(|due| due.format("%Y-%m-%d %H:%M").to_string())
                            .unwrap_or_default(),
                        item.title.clone(),
                    ]
                })
                .collect::<Vec<_>>();
            write_table(
                &mut out,
                vec!["ID".to_string(), "Due".to_string(), "Title".to_string()],
                rows,
            )?;
            writeln!(out)?;
        }
        Ok(())
    }

    pub fn print_sync_state(&mut self, state: &SyncState) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        self.write_sync_state(&mut out, state)
    }

    pub fn write_sync_state<W: Write>(&self, mut out: W, state: &SyncState) -> anyhow::Result<()> {
        let day = |value: Option<NaiveDate>| {
            value
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "-".to_string())
        };
        writeln!(out, "selected   {}", day(state.selected_date))?;
        writeln!(out, "visible    {}", day(state.visible_date))?;
        writeln!(out, "shown      {}", day(state.shown_date))?;
        writeln!(out, "scrolling  {}", state.is_programmatic_scroll)?;
        if let Some(message) = &state.pending_message {
            writeln!(out, "{}", self.paint(message, "36"))?;
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, item, occurrences), fields(id = %item.id))]
    pub fn print_occurrences(
        &mut self,
        item: &CalendarItem,
        occurrences: &[CalendarItem],
    ) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "{} ({})", self.paint(&item.title, "1"), item.id)?;
        if let Some(rule) = &item.rule {
            writeln!(out, "rule      {rule}")?;
        }
        writeln!(out, "anchor    {}", stamp(item.start))?;

        let rows = occurrences
            .iter()
            .map(|occ| {
                vec![
                    occ.id.clone(),
                    stamp(occ.start),
                    occ.end.map(stamp).unwrap_or_default(),
                ]
            })
            .collect::<Vec<_>>();
        write_table(
            &mut out,
            vec!["Occurrence".to_string(), "Start".to_string(), "End".to_string()],
            rows,
        )?;
        Ok(())
    }

    pub fn print_rule(&mut self, rule: &RecurrenceRule) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "{rule}")?;
        writeln!(out, "frequency {}", rule.frequency.as_token())?;
        writeln!(out, "interval  {}", rule.interval)?;
        if !rule.weekdays.is_empty() {
            let days = rule
                .weekdays
                .iter()
                .map(|day| day.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(out, "weekdays  {days}")?;
        }
        writeln!(out, "ends      {:?}", rule.termination)?;
        Ok(())
    }

    fn paint(&self, text: &str, code: &str) -> String {
        if !self.color {
            return text.to_string();
        }
        format!("\x1b[{code}m{text}\x1b[0m")
    }
}

fn stamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%MZ").to_string()
}

fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

fn pad(text: &str, width: usize) -> String {
    let visible = UnicodeWidthStr::width(text);
    format!("{text}{}", " ".repeat(width.saturating_sub(visible)))
}

fn write_table<W: Write>(
    mut writer: W,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
) -> anyhow::Result<()> {
    let column_count = headers.len();
    let mut widths = vec![0usize; column_count];

    for (idx, header) in headers.iter().enumerate() {
        widths[idx] = widths[idx].max(UnicodeWidthStr::width(header.as_str()));
    }
    for row in &rows {
        for (idx, cell) in row.iter().enumerate().take(column_count) {
            widths[idx] = widths[idx].max(UnicodeWidthStr::width(strip_ansi(cell).as_str()));
        }
    }

    for (header, width) in headers.iter().zip(&widths) {
        write!(writer, "{}", pad(header, *width))?;
        write!(writer, " ")?;
    }
    writeln!(writer)?;
    for width in &widths {
        write!(writer, "{:-<width$} ", "", width = *width)?;
    }
    writeln!(writer)?;

    for row in rows {
        for (cell, width) in row.iter().zip(&widths) {
            let visible_width = UnicodeWidthStr::width(strip_ansi(cell).as_str());
            write!(writer, "{}{} ", cell, " ".repeat(width.saturating_sub(visible_width)))?;
        }
        writeln!(writer)?;
    }

    Ok(())
}

fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;

    for ch in s.chars() {
        if escaped {
            if ch == 'm' {
                escaped = false;
            }
            continue;
        }
        if ch == '\x1b' {
            escaped = true;
            continue;
        }
        out.push(ch);
    }

    out
}
