//! Change journal.
//!
//! The journal is the ledger of every host mutation applied during a setup
//! session. It is plain data: it never runs commands and never touches the
//! files it describes. The persisted form is the only handoff between a setup
//! run and a later cleanup run.
//!
//! Records are keyed by `(category, target)`. Recording the same target twice
//! merges into one record: the latest action decides how it is reversed, and
//! every entry is kept in the record's history.
//!
//! ```json
//! {
//!   "version": 1,
//!   "session": { "selected_device": "0000:0b:00.0", ... },
//!   "changes": {
//!     "file-edit": [
//!       {
//!         "target": "/etc/default/grub",
//!         "action": "modified",
//!         "timestamp": "2026-10-18T14:25:01Z",
//!         "details": { "backup_path": "/var/lib/vfioprep/backups/..." },
//!         "history": [ { "sequence": 0, "action": "modified", ... } ]
//!       }
//!     ]
//!   }
//! }
//! ```

use crate::error::{PrepError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};


/// Persisted format version.
pub const JOURNAL_VERSION: u32 = 1;

/// Free-form per-entry details.
pub type Details = BTreeMap<String, String>;

/// Well-known detail keys.
pub mod detail {
    /// Where the pre-edit copy of a file was saved.
    pub const BACKUP_PATH: &str = "backup_path";
    /// Value a setting had before it was changed.
    pub const PREVIOUS_VALUE: &str = "previous_value";
    /// Boot-parameter mechanism that made the change.
    pub const TOOL: &str = "tool";
    /// Set on files whose restoration requires regenerating the bootloader config.
    pub const BOOTLOADER: &str = "bootloader";
    /// Set when the mutation itself failed after being recorded.
    pub const ERROR: &str = "error";
}

/// Kind of host state a change touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    FileEdit,
    ModuleList,
    BootParameterTool,
    Package,
    Snapshot,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::FileEdit,
        Category::ModuleList,
        Category::BootParameterTool,
        Category::Package,
        Category::Snapshot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::FileEdit => "file-edit",
            Category::ModuleList => "module-list",
            Category::BootParameterTool => "boot-parameter-tool",
            Category::Package => "package",
            Category::Snapshot => "snapshot",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Created,
    Modified,
    Added,
    Removed,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Created => "created",
            Action::Modified => "modified",
            Action::Added => "added",
            Action::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// One recorded mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// Journal-wide recording order.
    pub sequence: u64,
    pub action: Action,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: Details,
}

/// All entries for one `(category, target)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub target: String,
    /// Latest action; decides reversal semantics.
    pub action: Action,
    /// Time of the latest action.
    pub timestamp: DateTime<Utc>,
    /// All details merged, later values winning on key clashes.
    #[serde(default)]
    pub details: Details,
    /// Every entry in recording order.
    pub history: Vec<ChangeEntry>,
}

impl ChangeRecord {
    fn new(target: String, entry: ChangeEntry) -> Self {
        Self {
            target,
            action: entry.action,
            timestamp: entry.timestamp,
            details: entry.details.clone(),
            history: vec![entry],
        }
    }

    fn push(&mut self, entry: ChangeEntry) {
        self.action = entry.action;
        self.timestamp = entry.timestamp;
        self.details.extend(entry.details.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.history.push(entry);
    }

    /// Backup paths in recording order, without duplicates.
    pub fn backup_paths(&self) -> Vec<PathBuf> {
        let mut seen = HashSet::new();
        self.history
            .iter()
            .filter_map(|e| e.details.get(detail::BACKUP_PATH))
            .filter(|p| !p.is_empty() && seen.insert(p.as_str()))
            .map(PathBuf::from)
            .collect()
    }

    /// The first backup taken, i.e. the state before the session touched the target.
    pub fn earliest_backup(&self) -> Option<PathBuf> {
        self.backup_paths().into_iter().next()
    }

    /// Whether the target did not exist before the session.
    ///
    /// True when the first recorded action created or added it.
    pub fn originally_absent(&self) -> bool {
        matches!(self.history.first().map(|e| e.action), Some(Action::Created | Action::Added))
    }

    /// Latest value for a detail key across the history.
    pub fn detail(&self, key: &str) -> Option<&str> {
        self.details.get(key).map(String::as_str)
    }
}

/// What the setup session decided, kept for reporting at cleanup time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionInfo {
    pub started_at: Option<DateTime<Utc>>,
    /// Bus address of the primary device.
    pub selected_device: Option<String>,
    pub device_description: Option<String>,
    /// `vendor:device` pairs handed to the passthrough driver.
    pub device_ids: Vec<String>,
    pub isolation_group: Option<u32>,
    /// Boot-parameter mechanism name (e.g. "kernelstub", "grub").
    pub boot_tool: Option<String>,
    pub dry_run: bool,
}

/// Flattened view of one entry, see [`Journal::entries`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalEntry<'a> {
    pub category: Category,
    pub target: &'a str,
    pub entry: &'a ChangeEntry,
}

/// Ledger of applied host mutations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Journal {
    pub version: u32,
    #[serde(default)]
    pub session: SessionInfo,
    #[serde(default)]
    changes: BTreeMap<Category, Vec<ChangeRecord>>,
    #[serde(skip)]
    next_sequence: u64,
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}

impl Journal {
    /// Start an empty journal for a new session.
    pub fn new() -> Self {
        Self {
            version: JOURNAL_VERSION,
            session: SessionInfo { started_at: Some(Utc::now()), ..Default::default() },
            changes: BTreeMap::new(),
            next_sequence: 0,
        }
    }

    /// Record a mutation. Never fails.
    pub fn record(
        &mut self,
        category: Category,
        target: impl Into<String>,
        action: Action,
        details: Details,
    ) {
        let target = target.into();
        let entry = ChangeEntry {
            sequence: self.next_sequence,
            action,
            timestamp: Utc::now(),
            details,
        };
        self.next_sequence += 1;

        debug!(%category, %target, %action, sequence = entry.sequence, "Recorded change");

        let records = self.changes.entry(category).or_default();
        match records.iter_mut().find(|r| r.target == target) {
            Some(record) => record.push(entry),
            None => records.push(ChangeRecord::new(target, entry)),
        }
    }

    /// Records of one category in first-recorded order.
    pub fn records(&self, category: Category) -> &[ChangeRecord] {
        self.changes.get(&category).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The record for `(category, target)`, if any.
    pub fn find(&self, category: Category, target: &str) -> Option<&ChangeRecord> {
        self.records(category).iter().find(|r| r.target == target)
    }

    /// Number of distinct `(category, target)` records.
    pub fn len(&self) -> usize {
        self.changes.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every entry across all categories, in recording order.
    pub fn entries(&self) -> Vec<JournalEntry<'_>> {
        let mut entries: Vec<JournalEntry<'_>> = self
            .changes
            .iter()
            .flat_map(|(category, records)| {
                records.iter().flat_map(move |record| {
                    record.history.iter().map(move |entry| JournalEntry {
                        category: *category,
                        target: &record.target,
                        entry,
                    })
                })
            })
            .collect();
        entries.sort_by_key(|e| e.entry.sequence);
        entries
    }

    /// Record count per category, in [`Category::ALL`] order, skipping empty ones.
    pub fn counts(&self) -> Vec<(Category, usize)> {
        Category::ALL
            .into_iter()
            .map(|c| (c, self.records(c).len()))
            .filter(|(_, n)| *n > 0)
            .collect()
    }

    /// Every backup path detail, in recording order, without duplicates.
    pub fn all_backup_paths(&self) -> Vec<PathBuf> {
        let mut seen = HashSet::new();
        self.entries()
            .into_iter()
            .filter_map(|e| e.entry.details.get(detail::BACKUP_PATH))
            .filter(|p| !p.is_empty() && seen.insert(p.clone()))
            .map(PathBuf::from)
            .collect()
    }

    /// Write the whole journal to `path`, replacing any previous file.
    ///
    /// The file is written next to `path` and renamed into place, so a reader
    /// never observes a half-written journal.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let failed = |p: &Path, e: std::io::Error| PrepError::PersistFailed {
            path: p.to_path_buf(),
            source: e,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| failed(parent, e))?;
        }

        let content = serde_json::to_vec_pretty(self).map_err(PrepError::internal)?;

        let temp_path = path.with_extension("json.tmp");
        {
            let mut f = fs::File::create(&temp_path).map_err(|e| failed(&temp_path, e))?;
            f.write_all(&content).map_err(|e| failed(&temp_path, e))?;
            f.sync_all().map_err(|e| failed(&temp_path, e))?;
        }
        fs::rename(&temp_path, path).map_err(|e| failed(path, e))?;

        info!(path = %path.display(), records = self.len(), "Persisted journal");
        Ok(())
    }

    /// Load a persisted journal.
    ///
    /// A missing file is [`PrepError::JournalNotFound`], the normal
    /// "nothing to clean up" case.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PrepError::JournalNotFound { path: path.to_path_buf() });
            }
            Err(e) => return Err(PrepError::IoError { path: path.to_path_buf(), source: e }),
        };

        let corrupt = |reason: String| PrepError::CorruptJournal { path: path.to_path_buf(), reason };

        let mut journal: Journal =
            serde_json::from_str(&content).map_err(|e| corrupt(e.to_string()))?;

        if journal.version > JOURNAL_VERSION {
            return Err(corrupt(format!(
                "unsupported version {} (this build reads up to {})",
                journal.version, JOURNAL_VERSION
            )));
        }
        for (category, records) in &journal.changes {
            if let Some(record) = records.iter().find(|r| r.history.is_empty()) {
                return Err(corrupt(format!(
                    "{} record for {} has no history",
                    category, record.target
                )));
            }
        }

        journal.next_sequence = journal
            .changes
            .values()
            .flatten()
            .flat_map(|r| r.history.iter().map(|e| e.sequence + 1))
            .max()
            .unwrap_or(0);

        info!(path = %path.display(), records = journal.len(), "Loaded journal");
        Ok(journal)
    }
}
