use std::collections::BTreeSet;

use anyhow::{Context, anyhow};
use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, info, instrument, warn};

use crate::agenda::{Agenda, DueDateSink};
use crate::cli::Invocation;
use crate::config::{Config, EngineSettings};
use crate::datastore::ItemStore;
use crate::datetime::{add_days, parse_date_expr, to_calendar_day, today_in, viewer_timezone};
use crate::item::CalendarItem;
use crate::occurrence::expand_item;
use crate::recurrence::RecurrenceRule;
use crate::render::Renderer;
use crate::reschedule::DueBucket;
use crate::sync::{ListView, TimerRequest};

/// Days shown by `agenda` when no end date is given.
const DEFAULT_AGENDA_DAYS: i64 = 14;

/// Upper bound on timers driven synchronously by `select`.
const MAX_TIMER_ROUNDS: usize = 16;

pub fn known_command_names() -> Vec<&'static str> {
    vec![
        "agenda", "due", "add", "rule", "expand", "move", "select", "help", "version",
    ]
}

pub fn expand_command_abbrev<'a>(token: &'a str, known: &[&'a str]) -> Option<&'a str> {
    if known.contains(&token) {
        return Some(token);
    }

    let mut matches = known.iter().copied().filter(|name| name.starts_with(token));
    let first = matches.next()?;
    if matches.next().is_some() {
        None
    } else {
        Some(first)
    }
}

#[instrument(skip(store, cfg, renderer, inv))]
pub fn dispatch(
    store: &mut ItemStore,
    cfg: &Config,
    renderer: &mut Renderer,
    inv: Invocation,
) -> anyhow::Result<()> {
    let now = Utc::now();
    let command = inv.command.as_str();

    debug!(command, args = ?inv.command_args, "dispatching command");

    match command {
        "agenda" => cmd_agenda(store, cfg, renderer, &inv.command_args, now),
        "due" => cmd_due(store, cfg, renderer, now),
        "add" => cmd_add(store, &inv.command_args, now),
        "rule" => cmd_rule(renderer, &inv.command_args),
        "expand" => cmd_expand(store, cfg, renderer, &inv.command_args, now),
        "move" => cmd_move(store, cfg, &inv.command_args, now),
        "select" => cmd_select(store, cfg, renderer, &inv.command_args, now),
        "help" => cmd_help(),
        "version" => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        other => Err(anyhow!("unknown command: {other}")),
    }
}

fn load_agenda(store: &ItemStore, cfg: &Config, now: DateTime<Utc>) -> anyhow::Result<Agenda> {
    let settings = EngineSettings::from_config(cfg)?;
    let items = store.load()?;
    let today = today_in(now, viewer_timezone());
    Ok(Agenda::new(items, settings, now, today))
}

fn parse_day(arg: &str, now: DateTime<Utc>) -> anyhow::Result<NaiveDate> {
    let ts = parse_date_expr(arg, now).with_context(|| format!("invalid date: {arg}"))?;
    Ok(to_calendar_day(&ts))
}

#[instrument(skip(store, cfg, renderer, args, now))]
fn cmd_agenda(
    store: &ItemStore,
    cfg: &Config,
    renderer: &mut Renderer,
    args: &[String],
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    info!("command agenda");
    let agenda = load_agenda(store, cfg, now)?;

    let from = match args.first() {
        Some(arg) => parse_day(arg, now)?,
        None => agenda.today(),
    };
    let to = match args.get(1) {
        Some(arg) => parse_day(arg, now)?,
        None => add_days(from, DEFAULT_AGENDA_DAYS),
    };
    if to < from {
        return Err(anyhow!("agenda range ends before it starts: {from} > {to}"));
    }

    let buckets = agenda.buckets_between(from, to);
    debug!(%from, %to, buckets = buckets.len(), "rendering agenda");
    renderer.print_agenda(buckets, agenda.today())
}

#[instrument(skip(store, cfg, renderer, now))]
fn cmd_due(
    store: &ItemStore,
    cfg: &Config,
    renderer: &mut Renderer,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    info!("command due");
    let agenda = load_agenda(store, cfg, now)?;
    renderer.print_due_groups(&agenda.due_groups())
}

#[instrument(skip(store, args, now))]
fn cmd_add(store: &ItemStore, args: &[String], now: DateTime<Utc>) -> anyhow::Result<()> {
    info!("command add");

    let mut title_words = Vec::new();
    let mut start = None;
    let mut end = None;
    let mut due = None;
    let mut rule = None;
    let mut all_day = false;

    for arg in args {
        if let Some(value) = arg.strip_prefix("start:") {
            start = Some(parse_date_expr(value, now).context("invalid start")?);
        } else if let Some(value) = arg.strip_prefix("end:") {
            end = Some(parse_date_expr(value, now).context("invalid end")?);
        } else if let Some(value) = arg.strip_prefix("due:") {
            due = Some(parse_date_expr(value, now).context("invalid due")?);
        } else if let Some(value) = arg.strip_prefix("rule:") {
            let parsed: RecurrenceRule = value
                .parse()
                .with_context(|| format!("invalid rule: {value}"))?;
            rule = Some(parsed.to_string());
        } else if arg == "allday" {
            all_day = true;
        } else {
            title_words.push(arg.as_str());
        }
    }

    let title = title_words.join(" ");
    if title.trim().is_empty() {
        return Err(anyhow!("add requires a title"));
    }
    let start = start.ok_or_else(|| anyhow!("add requires start:<date>"))?;
    if let Some(end) = end
        && end < start
    {
        return Err(anyhow!("end {end} is before start {start}"));
    }

    let mut item = CalendarItem::new(title, start);
    item.end = end;
    item.due = due;
    item.rule = rule;
    item.all_day = all_day.then_some(true);
    let id = item.id.clone();

    store.add_item(item)?;
    println!("Created item {id}.");
    Ok(())
}

#[instrument(skip(renderer, args))]
fn cmd_rule(renderer: &mut Renderer, args: &[String]) -> anyhow::Result<()> {
    let raw = args.join("");
    let rule: RecurrenceRule = raw
        .parse()
        .with_context(|| format!("invalid rule: {raw}"))?;
    renderer.print_rule(&rule)
}

#[instrument(skip(store, cfg, renderer, args, now))]
fn cmd_expand(
    store: &ItemStore,
    cfg: &Config,
    renderer: &mut Renderer,
    args: &[String],
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    info!("command expand");
    let token = args
        .first()
        .ok_or_else(|| anyhow!("expand requires an item id"))?;
    let agenda = load_agenda(store, cfg, now)?;
    let item = resolve_item(agenda.items(), token)?;

    if item.rule.is_none() {
        warn!(id = %item.id, "item has no recurrence rule");
    }
    let horizon = agenda.horizon();
    let occurrences = expand_item(item, horizon.start, horizon.end);
    renderer.print_occurrences(item, &occurrences)
}

#[instrument(skip(store, cfg, args, now))]
fn cmd_move(
    store: &mut ItemStore,
    cfg: &Config,
    args: &[String],
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    info!("command move");
    let [token, bucket_name] = args else {
        return Err(anyhow!("usage: move <id> <today|tomorrow|upcoming|someday>"));
    };
    let target: DueBucket = bucket_name.parse()?;

    let mut agenda = load_agenda(store, cfg, now)?;
    let id = resolve_item(agenda.items(), token)?.id.clone();
    let placement = agenda.apply_drop(&id, target)?;

    match store.update_item_due_date(&placement.item_id, placement.new_due) {
        Ok(()) => {
            agenda.confirm(&placement);
            let due = placement
                .new_due
                .map(|due| due.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "none".to_string());
            println!("Moved {} to {} (due {due}).", placement.item_id, placement.target);
            Ok(())
        }
        Err(err) => {
            agenda.rollback(&placement)?;
            Err(err.context(format!("failed to move {}", placement.item_id)))
        }
    }
}

#[instrument(skip(store, cfg, renderer, args, now))]
fn cmd_select(
    store: &ItemStore,
    cfg: &Config,
    renderer: &mut Renderer,
    args: &[String],
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    info!("command select");
    let arg = args
        .first()
        .ok_or_else(|| anyhow!("select requires a date"))?;
    let date = parse_day(arg, now)?;

    let mut agenda = load_agenda(store, cfg, now)?;
    let mut view = HeadlessView::new(agenda.buckets().iter().map(|b| b.day).collect());

    let mut next = agenda.request_select_date(date, &mut view);
    drive_timers(&mut agenda, &mut view, &mut next);
    renderer.print_sync_state(&agenda.sync_state())
}

/// Fires pending timers immediately until the synchronizer goes quiet.
fn drive_timers(agenda: &mut Agenda, view: &mut HeadlessView, next: &mut Option<TimerRequest>) {
    for _ in 0..MAX_TIMER_ROUNDS {
        let Some(timer) = next.take() else {
            return;
        };
        debug!(ticket = %timer.ticket, kind = ?timer.kind, "firing timer");
        *next = agenda.on_timer(timer.ticket, timer.kind, view);
    }
    warn!("synchronizer did not settle");
}

/// Exact id, else a unique id prefix.
fn resolve_item<'a>(items: &'a [CalendarItem], token: &str) -> anyhow::Result<&'a CalendarItem> {
    if let Some(item) = items.iter().find(|item| item.id == token) {
        return Ok(item);
    }
    let mut matches = items.iter().filter(|item| item.id.starts_with(token));
    match (matches.next(), matches.next()) {
        (Some(item), None) => Ok(item),
        (Some(_), Some(_)) => Err(anyhow!("ambiguous item id: {token}")),
        (None, _) => Err(anyhow!("no item with id {token}")),
    }
}

/// Day list with every bucket rendered, as a terminal sees it.
#[derive(Debug, Default)]
struct HeadlessView {
    rendered: BTreeSet<NaiveDate>,
    top: Option<NaiveDate>,
}

impl HeadlessView {
    fn new(rendered: BTreeSet<NaiveDate>) -> Self {
        Self {
            rendered,
            top: None,
        }
    }
}

impl ListView for HeadlessView {
    fn locate_day(&self, day: NaiveDate) -> anyhow::Result<bool> {
        Ok(self.rendered.contains(&day))
    }

    fn scroll_to_day(&mut self, day: NaiveDate) -> anyhow::Result<()> {
        if !self.rendered.contains(&day) {
            return Err(anyhow!("day {day} is not in the list"));
        }
        self.top = Some(day);
        Ok(())
    }

    fn topmost_visible_day(&self) -> anyhow::Result<Option<NaiveDate>> {
        Ok(self.top)
    }
}

fn cmd_help() -> anyhow::Result<()> {
    println!("Usage: dayline [-v|-q] [--daylinerc PATH] [--data DIR] [rc.KEY=VALUE] <command> [args]");
    println!();
    println!("  agenda [from] [to]          day list with occurrences");
    println!("  due                         items grouped by due bucket");
    println!("  add <title> start:<date> [end:<date>] [due:<date>] [rule:<rrule>] [allday]");
    println!("  rule <rrule>                parse and normalize a recurrence rule");
    println!("  expand <id>                 occurrences of one item");
    println!("  move <id> <bucket>          today, tomorrow, upcoming or someday");
    println!("  select <date>               scroll the day list to a date");
    println!("  help | version");
    Ok(())
}
