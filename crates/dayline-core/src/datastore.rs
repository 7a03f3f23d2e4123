use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::agenda::DueDateSink;
use crate::item::CalendarItem;

/// File-backed item collection kept as a JSON array in `items.json`.
#[derive(Debug)]
pub struct ItemStore {
    pub items_path: PathBuf,
}

impl ItemStore {
    #[tracing::instrument(skip(data_dir))]
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        let items_path = data_dir.join("items.json");
        if !items_path.exists() {
            fs::write(&items_path, "[]\n")
                .with_context(|| format!("failed to create {}", items_path.display()))?;
        }

        info!(
            data_dir = %data_dir.display(),
            items = %items_path.display(),
            "opened item store"
        );

        Ok(Self { items_path })
    }

    #[tracing::instrument(skip(self))]
    pub fn load(&self) -> anyhow::Result<Vec<CalendarItem>> {
        let raw = fs::read_to_string(&self.items_path)
            .with_context(|| format!("failed reading {}", self.items_path.display()))?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        let items: Vec<CalendarItem> = serde_json::from_str(&raw)
            .with_context(|| format!("failed parsing {}", self.items_path.display()))?;
        debug!(count = items.len(), "loaded items");
        Ok(items)
    }

    #[tracing::instrument(skip(self, items), fields(count = items.len()))]
    pub fn save(&self, items: &[CalendarItem]) -> anyhow::Result<()> {
        save_json_atomic(&self.items_path, items).context("failed to save items.json")
    }

    #[tracing::instrument(skip(self, item), fields(id = %item.id))]
    pub fn add_item(&self, item: CalendarItem) -> anyhow::Result<Vec<CalendarItem>> {
        let mut items = self.load()?;
        if items.iter().any(|existing| existing.id == item.id) {
            return Err(anyhow!("item already exists: {}", item.id));
        }
        items.push(item);
        items.sort_by_key(|existing| existing.start);
        self.save(&items)?;
        Ok(items)
    }

    #[tracing::instrument(skip(self))]
    pub fn set_due(&self, id: &str, due: Option<DateTime<Utc>>) -> anyhow::Result<()> {
        let mut items = self.load()?;
        let item = items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or_else(|| anyhow!("item not found: {id}"))?;
        item.due = due;
        self.save(&items)
    }
}

impl DueDateSink for ItemStore {
    fn update_item_due_date(&mut self, id: &str, due: Option<DateTime<Utc>>) -> anyhow::Result<()> {
        self.set_due(id, due)
    }
}

#[tracing::instrument(skip(path, items))]
fn save_json_atomic(path: &Path, items: &[CalendarItem]) -> anyhow::Result<()> {
    debug!(file = %path.display(), count = items.len(), "saving items atomically");
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut temp, items)?;
    writeln!(temp)?;
    temp.flush()?;

    temp.persist(path)
        .map_err(|err| anyhow!("failed to persist {}: {}", path.display(), err))?;

    Ok(())
}
