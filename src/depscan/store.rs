//! Persisted dependency record store.
//!
//! Two tables live in one JSON document under the project's dump directory:
//! `files` holds confirmed records, `files_cache` holds staging records that
//! a fast build writes before its compile pass. A successful pass promotes
//! staging into confirmed, so an interrupted build never poisons the
//! confirmed table.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const STORE_FILE: &str = "deps.db.json";

/// One scanned file: its stamp and the direct includes resolved at scan time.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DepRecord {
    /// Whole-second mtime stamp, stored as text.
    pub mtime: String,
    #[serde(default)]
    pub deps: Vec<PathBuf>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct DepStore {
    #[serde(default)]
    files: BTreeMap<PathBuf, DepRecord>,
    #[serde(default, rename = "files_cache")]
    staging: BTreeMap<PathBuf, DepRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Confirmed,
    Staging,
}

/// Handle over the on-disk store. All mutation stays in memory until
/// [`StoreHandle::save`].
pub struct StoreHandle {
    path: PathBuf,
    store: DepStore,
}

impl StoreHandle {
    /// Open the store under `dir`, creating an empty one when the file is
    /// missing. A file that fails to parse is discarded: the tracker then
    /// runs with a cold cache, which only costs rescans.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(STORE_FILE);
        let store = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => DepStore::default(),
        };
        Ok(StoreHandle { path, store })
    }

    pub fn confirmed(&self) -> &BTreeMap<PathBuf, DepRecord> {
        &self.store.files
    }

    pub fn get(&self, table: Table, path: &Path) -> Option<&DepRecord> {
        self.table(table).get(path)
    }

    pub fn upsert(&mut self, table: Table, path: PathBuf, record: DepRecord) {
        self.table_mut(table).insert(path, record);
    }

    /// Replace the confirmed table with staging and clear staging.
    pub fn promote(&mut self) {
        self.store.files = std::mem::take(&mut self.store.staging);
    }

    /// Drop every record in both tables.
    pub fn clear(&mut self) {
        self.store.files.clear();
        self.store.staging.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.store.files.is_empty() && self.store.staging.is_empty()
    }

    /// Write the store to disk via a temp file renamed into place, so a
    /// crash mid-write leaves the previous store intact.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create store directory '{}'", parent.display())
            })?;
        }
        let text = serde_json::to_string_pretty(&self.store)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, text)
            .with_context(|| format!("failed to write '{}'", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to replace '{}'", self.path.display()))?;
        Ok(())
    }

    fn table(&self, table: Table) -> &BTreeMap<PathBuf, DepRecord> {
        match table {
            Table::Confirmed => &self.store.files,
            Table::Staging => &self.store.staging,
        }
    }

    fn table_mut(&mut self, table: Table) -> &mut BTreeMap<PathBuf, DepRecord> {
        match table {
            Table::Confirmed => &mut self.store.files,
            Table::Staging => &mut self.store.staging,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(mtime: &str, deps: &[&str]) -> DepRecord {
        DepRecord {
            mtime: mtime.into(),
            deps: deps.iter().map(PathBuf::from).collect(),
        }
    }

    #[test]
    fn test_missing_store_opens_empty() {
        let dir = tempdir().unwrap();
        let store = StoreHandle::open(dir.path()).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let mut store = StoreHandle::open(dir.path()).unwrap();
        store.upsert(
            Table::Confirmed,
            PathBuf::from("/src/main.c"),
            record("1724400000", &["/inc/app.h"]),
        );
        store.save().unwrap();

        let reloaded = StoreHandle::open(dir.path()).unwrap();
        let rec = reloaded
            .get(Table::Confirmed, Path::new("/src/main.c"))
            .unwrap();
        assert_eq!(rec.mtime, "1724400000");
        assert_eq!(rec.deps, vec![PathBuf::from("/inc/app.h")]);
    }

    #[test]
    fn test_corrupt_store_is_recreated() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(STORE_FILE), "{ not json").unwrap();

        let store = StoreHandle::open(dir.path()).unwrap();
        assert!(store.is_empty());
        store.save().unwrap();

        let reloaded = StoreHandle::open(dir.path()).unwrap();
        assert!(reloaded.is_empty());
    }

    #[test]
    fn test_promote_replaces_confirmed_and_clears_staging() {
        let dir = tempdir().unwrap();
        let mut store = StoreHandle::open(dir.path()).unwrap();
        store.upsert(
            Table::Confirmed,
            PathBuf::from("/src/old.c"),
            record("100", &[]),
        );
        store.upsert(
            Table::Staging,
            PathBuf::from("/src/new.c"),
            record("200", &[]),
        );

        store.promote();

        assert!(store.get(Table::Confirmed, Path::new("/src/old.c")).is_none());
        assert!(store.get(Table::Confirmed, Path::new("/src/new.c")).is_some());
        assert!(store.get(Table::Staging, Path::new("/src/new.c")).is_none());
    }
}
