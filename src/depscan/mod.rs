//! Include-graph staleness tracking.
//!
//! A textual `#include` scanner feeds a transitive-closure walk over the
//! project's header directories. Each file's record (mtime stamp + direct
//! includes) persists across builds in [`store::StoreHandle`], so an
//! unchanged file skips both the rescan and the recompile.

pub mod store;

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use store::{DepRecord, StoreHandle, Table};

/// Staleness verdict for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    /// Never seen before.
    New,
    /// Stamp moved forward, a dependency did, or the file failed to scan.
    Changed,
    Stable,
}

/// Case-insensitive flat filename index over the header directories.
/// Bare `#include <name.h>` forms resolve through this; the first directory
/// declaring a name wins.
pub struct HeaderIndex {
    dirs: Vec<PathBuf>,
    by_name: HashMap<String, PathBuf>,
}

impl HeaderIndex {
    pub fn build(dirs: &[String]) -> Self {
        let dirs: Vec<PathBuf> = dirs.iter().map(PathBuf::from).collect();
        let mut by_name = HashMap::new();
        for dir in &dirs {
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                if !entry.path().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_lowercase();
                by_name.entry(name).or_insert_with(|| entry.path());
            }
        }
        HeaderIndex { dirs, by_name }
    }

    fn lookup_name(&self, name: &str) -> Option<PathBuf> {
        self.by_name.get(&name.to_lowercase()).cloned()
    }

    fn lookup_relative(&self, relative: &str) -> Option<PathBuf> {
        self.dirs
            .iter()
            .map(|dir| dir.join(relative))
            .find(|candidate| candidate.is_file())
    }
}

pub struct DepTracker {
    index: HeaderIndex,
    /// Record cache: hydrated from the confirmed table, refreshed on demand.
    records: HashMap<PathBuf, DepRecord>,
    /// Per-session verdicts. A file is stated at most once per run.
    states: HashMap<PathBuf, FileState>,
}

impl DepTracker {
    pub fn new(header_dirs: &[String]) -> Self {
        DepTracker {
            index: HeaderIndex::build(header_dirs),
            records: HashMap::new(),
            states: HashMap::new(),
        }
    }

    /// Hydrate the record cache from the store's confirmed table. Stale
    /// records stay as loaded; classification rescans them lazily.
    pub fn load(&mut self, store: &StoreHandle) {
        for (path, record) in store.confirmed() {
            self.records.insert(path.clone(), record.clone());
        }
    }

    /// Direct includes of `file`, resolved against the header directories.
    /// Unresolvable includes are dropped; system headers outside the project
    /// are none of the tracker's business.
    pub fn scan_includes(&self, file: &Path) -> Result<Vec<PathBuf>> {
        let reader = BufReader::new(fs::File::open(file)?);
        let mut deps = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let trimmed = line.trim_start();
            if !trimmed.starts_with("#include") {
                continue;
            }
            if let Some(name) = match_include(trimmed) {
                if let Some(resolved) = self.resolve(file, &name) {
                    deps.push(resolved);
                }
            }
        }
        Ok(deps)
    }

    fn resolve(&self, includer: &Path, name: &str) -> Option<PathBuf> {
        if name.starts_with('.') {
            let candidate = includer.parent()?.join(name);
            return candidate.is_file().then_some(candidate);
        }
        if name.contains('/') || name.contains('\\') {
            return self.index.lookup_relative(name);
        }
        self.index.lookup_name(name)
    }

    /// Every file reachable from `file` through `#include`, excluding `file`
    /// itself. Cycles terminate through the visited set.
    pub fn transitive(&mut self, file: &Path) -> Vec<PathBuf> {
        let mut visited: HashSet<PathBuf> = HashSet::new();
        let mut closure = Vec::new();
        let mut stack = vec![file.to_path_buf()];
        visited.insert(file.to_path_buf());

        while let Some(current) = stack.pop() {
            for dep in self.record_for(&current).deps.clone() {
                if visited.insert(dep.clone()) {
                    closure.push(dep.clone());
                    stack.push(dep);
                }
            }
        }
        closure
    }

    /// Classify one source file: its own stamp, then every file in its
    /// include closure. Any non-stable dependency makes the source Changed.
    /// The whole closure is stated even for an already-stale source, so every
    /// visited record is refreshed and persisted afterwards.
    pub fn classify(&mut self, file: &Path) -> FileState {
        let own = self.state_of(file);
        let mut deps_stable = true;
        for dep in self.transitive(file) {
            if self.state_of(&dep) != FileState::Stable {
                deps_stable = false;
            }
        }
        match own {
            FileState::Stable if !deps_stable => FileState::Changed,
            other => other,
        }
    }

    fn state_of(&mut self, file: &Path) -> FileState {
        if let Some(&state) = self.states.get(file) {
            return state;
        }
        let state = match mtime_stamp(file) {
            None => {
                self.refresh(file);
                FileState::Changed
            }
            Some(current) => match self.records.get(file) {
                None => {
                    self.refresh(file);
                    FileState::New
                }
                // only a strictly newer stamp is a change; a file whose
                // mtime moved backwards (restored from a backup, copied
                // with an old timestamp) is still the content we recorded
                Some(record) if !stamp_newer(&current, &record.mtime) => FileState::Stable,
                Some(_) => {
                    self.refresh(file);
                    FileState::Changed
                }
            },
        };
        self.states.insert(file.to_path_buf(), state);
        state
    }

    /// Record for `file`, scanning on a cache miss. Stating the file first
    /// guarantees a stale record is rescanned before its includes are walked.
    fn record_for(&mut self, file: &Path) -> &DepRecord {
        self.state_of(file);
        &self.records[file]
    }

    /// Rescan `file` and replace its record. A scan failure stores an empty
    /// record with an empty stamp, which can never match a live file again.
    fn refresh(&mut self, file: &Path) {
        let record = match (mtime_stamp(file), self.scan_includes(file)) {
            (Some(mtime), Ok(deps)) => DepRecord { mtime, deps },
            _ => DepRecord {
                mtime: String::new(),
                deps: Vec::new(),
            },
        };
        self.records.insert(file.to_path_buf(), record);
    }

    /// Write every record inspected this session into `table`. Files that
    /// left the project drop out because nothing states them anymore.
    pub fn persist(&self, store: &mut StoreHandle, table: Table) {
        for path in self.states.keys() {
            if let Some(record) = self.records.get(path) {
                store.upsert(table, path.clone(), record.clone());
            }
        }
    }
}

/// The include name between the delimiters, or `None` for a malformed line.
/// Both quote and angle forms share one scanner: the opener is whichever of
/// `"` or `<` comes first, the closer whichever of `"` or `>` follows.
pub fn match_include(line: &str) -> Option<String> {
    let open = line.find(['"', '<'])?;
    let rest = &line[open + 1..];
    let close = rest.find(['"', '>'])?;
    let name = rest[..close].trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// True when `current` is numerically later than `recorded`. A stamp that
/// fails to parse (the empty marker a failed scan leaves behind) always
/// counts as superseded.
fn stamp_newer(current: &str, recorded: &str) -> bool {
    match (current.parse::<u64>(), recorded.parse::<u64>()) {
        (Ok(current), Ok(recorded)) => current > recorded,
        _ => true,
    }
}

/// Whole-second mtime stamp, textual. Second precision keeps the comparison
/// immune to filesystems that truncate sub-second fields on copy.
pub fn mtime_stamp(path: &Path) -> Option<String> {
    let meta = fs::metadata(path).ok()?;
    let mtime = meta.modified().ok()?;
    let secs = mtime.duration_since(UNIX_EPOCH).ok()?.as_secs();
    Some(secs.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_include_forms() {
        assert_eq!(match_include("#include <stdio.h>"), Some("stdio.h".into()));
        assert_eq!(match_include("#include \"app.h\""), Some("app.h".into()));
        assert_eq!(
            match_include("#include \"sub/dir/x.h\"  // local"),
            Some("sub/dir/x.h".into())
        );
        assert_eq!(match_include("#include < spaced.h >"), Some("spaced.h".into()));
        assert_eq!(match_include("#include"), None);
        assert_eq!(match_include("#include <broken"), None);
    }

    #[test]
    fn test_stamp_newer_ordering() {
        assert!(stamp_newer("101", "100"));
        assert!(!stamp_newer("100", "100"));
        assert!(!stamp_newer("99", "100"));
        assert!(stamp_newer("100", ""));
    }
}
