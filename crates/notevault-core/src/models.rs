//! Core data models for the note-versioning engine.
//!
//! These types are designed to be:
//! - **Serializable**: All types derive Serialize/Deserialize, camelCase on disk
//! - **Debuggable**: Derive Debug for easy inspection
//! - **Cloneable**: caches hand out owned copies
//! - **Type-Safe**: Enums replace magic strings

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Schema version written into the central manifest
pub const CENTRAL_MANIFEST_VERSION: &str = "1.0.0";

/// Branch every note starts with
pub const DEFAULT_BRANCH: &str = "main";

// ==================== Central registry ====================

/// Registry entry for one tracked note
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NoteEntry {
    /// Current vault-relative path of the document
    pub note_path: String,
    /// Path of the per-note manifest, relative to the database root
    pub manifest_path: String,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub has_edit_history: bool,
}

impl NoteEntry {
    /// Create a fresh entry stamped with the current time
    pub fn new(note_path: impl Into<String>, manifest_path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            note_path: note_path.into(),
            manifest_path: manifest_path.into(),
            created_at: now,
            last_modified: now,
            has_edit_history: false,
        }
    }
}

/// Root registry: note identity -> path, plus global settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CentralManifest {
    pub version: String,
    #[serde(default)]
    pub notes: BTreeMap<String, NoteEntry>,
    #[serde(default)]
    pub global_settings: GlobalSettings,
}

impl Default for CentralManifest {
    fn default() -> Self {
        Self {
            version: CENTRAL_MANIFEST_VERSION.to_string(),
            notes: BTreeMap::new(),
            global_settings: GlobalSettings::default(),
        }
    }
}

// ==================== Settings ====================

/// Settings shared by every note unless a branch overrides them
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalSettings {
    /// Cap on versions kept per branch (0 = unlimited)
    pub max_versions_per_branch: u32,
    /// Drop versions older than `auto_cleanup_days`
    pub auto_cleanup_old_versions: bool,
    pub auto_cleanup_days: u32,
    /// Capture fine-grained edits in the edit-history store
    pub enable_edit_history: bool,
    /// Every Nth edit of a branch is stored as a full snapshot
    pub edit_full_snapshot_interval: u32,
    /// Default timeline display options
    pub timeline: TimelineSettings,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            max_versions_per_branch: 50,
            auto_cleanup_old_versions: false,
            auto_cleanup_days: 30,
            enable_edit_history: true,
            edit_full_snapshot_interval: 10,
            timeline: TimelineSettings::default(),
        }
    }
}

impl GlobalSettings {
    /// Effective retention for a branch: branch overrides win over globals
    pub fn retention_for(&self, branch: &BranchData) -> RetentionPolicy {
        let overrides = branch.settings.clone().unwrap_or_default();
        let max_versions = overrides
            .max_versions_per_branch
            .unwrap_or(self.max_versions_per_branch);
        let auto_cleanup = overrides
            .auto_cleanup_old_versions
            .unwrap_or(self.auto_cleanup_old_versions);
        let days = overrides.auto_cleanup_days.unwrap_or(self.auto_cleanup_days);

        RetentionPolicy {
            max_versions,
            max_age_days: auto_cleanup.then_some(days),
        }
    }
}

/// Per-branch overrides of the global retention settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BranchSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_versions_per_branch: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_cleanup_old_versions: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_cleanup_days: Option<u32>,
}

/// Timeline display options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TimelineSettings {
    pub show_description: bool,
    pub show_name: bool,
    pub show_version_number: bool,
    pub expand_by_default: bool,
}

impl Default for TimelineSettings {
    fn default() -> Self {
        Self {
            show_description: true,
            show_name: true,
            show_version_number: true,
            expand_by_default: false,
        }
    }
}

/// Resolved retention rules for one branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// 0 = unlimited
    pub max_versions: u32,
    pub max_age_days: Option<u32>,
}

impl RetentionPolicy {
    /// Version ids that fall outside this policy.
    ///
    /// The newest version is never selected.
    pub fn expired_versions(&self, branch: &BranchData, now: DateTime<Utc>) -> Vec<String> {
        let sorted = branch.sorted_versions();
        let Some((newest_id, _)) = sorted.last() else {
            return Vec::new();
        };
        let newest_id = (*newest_id).clone();
        let mut expired = Vec::new();

        if self.max_versions > 0 && sorted.len() > self.max_versions as usize {
            let excess = sorted.len() - self.max_versions as usize;
            expired.extend(sorted.iter().take(excess).map(|(id, _)| (*id).clone()));
        }

        if let Some(days) = self.max_age_days {
            let cutoff = now - Duration::days(i64::from(days));
            for (id, meta) in &sorted {
                if meta.timestamp < cutoff && !expired.contains(*id) {
                    expired.push((*id).clone());
                }
            }
        }

        expired.retain(|id| *id != newest_id);
        expired
    }
}

// ==================== Note manifest ====================

/// Metadata of one saved snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VersionMeta {
    pub version_number: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

/// One version lineage of a note
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BranchData {
    #[serde(default)]
    pub versions: BTreeMap<String, VersionMeta>,
    /// High-water mark of assigned version numbers; never decremented
    #[serde(default)]
    pub total_versions: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<BranchSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline_settings: Option<TimelineSettings>,
}

impl BranchData {
    /// Version number the next appended version receives
    pub fn next_version_number(&self) -> u64 {
        // Older manifests may have a counter lagging behind the stored numbers
        let max_seen = self
            .versions
            .values()
            .map(|v| v.version_number)
            .max()
            .unwrap_or(0);
        self.total_versions.max(max_seen) + 1
    }

    /// Append a version, assigning the next number. Returns the number.
    pub fn push_version(&mut self, version_id: impl Into<String>, mut meta: VersionMeta) -> u64 {
        let number = self.next_version_number();
        meta.version_number = number;
        self.versions.insert(version_id.into(), meta);
        self.total_versions = number;
        number
    }

    /// Versions ordered by version number, oldest first
    pub fn sorted_versions(&self) -> Vec<(&String, &VersionMeta)> {
        let mut versions: Vec<_> = self.versions.iter().collect();
        versions.sort_by_key(|(_, meta)| meta.version_number);
        versions
    }

    /// Newest version of the branch
    pub fn latest(&self) -> Option<(&String, &VersionMeta)> {
        self.versions
            .iter()
            .max_by_key(|(_, meta)| meta.version_number)
    }
}

/// Per-note history manifest
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NoteManifest {
    pub note_id: String,
    pub note_path: String,
    pub current_branch: String,
    #[serde(default)]
    pub branches: BTreeMap<String, BranchData>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl NoteManifest {
    /// A manifest with a single empty `main` branch
    pub fn new(note_id: impl Into<String>, note_path: impl Into<String>) -> Self {
        let now = Utc::now();
        let mut branches = BTreeMap::new();
        branches.insert(DEFAULT_BRANCH.to_string(), BranchData::default());
        Self {
            note_id: note_id.into(),
            note_path: note_path.into(),
            current_branch: DEFAULT_BRANCH.to_string(),
            branches,
            created_at: now,
            last_modified: now,
        }
    }

    pub fn branch(&self, name: &str) -> Option<&BranchData> {
        self.branches.get(name)
    }

    pub fn branch_mut(&mut self, name: &str) -> Option<&mut BranchData> {
        self.branches.get_mut(name)
    }

    /// The current branch, created on the fly if the manifest lost it
    pub fn current_branch_mut(&mut self) -> &mut BranchData {
        self.branches.entry(self.current_branch.clone()).or_default()
    }

    pub fn current_branch_data(&self) -> Option<&BranchData> {
        self.branches.get(&self.current_branch)
    }

    /// Find which branch holds a version id
    pub fn branch_of_version(&self, version_id: &str) -> Option<&str> {
        self.branches
            .iter()
            .find(|(_, data)| data.versions.contains_key(version_id))
            .map(|(name, _)| name.as_str())
    }

    /// Total number of versions across every branch
    pub fn version_count(&self) -> usize {
        self.branches.values().map(|b| b.versions.len()).sum()
    }

    /// Bump `last_modified`
    pub fn touch(&mut self) {
        self.last_modified = Utc::now();
    }
}

// ==================== Edit history ====================

/// How an edit's payload is stored
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Full,
    Diff,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Diff => "diff",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "full" => Some(Self::Full),
            "diff" => Some(Self::Diff),
            _ => None,
        }
    }
}

/// One fine-grained auto-captured edit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EditRecord {
    pub edit_id: String,
    pub note_id: String,
    pub branch_name: String,
    pub version_number: u64,
    pub storage_type: StorageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_edit_id: Option<String>,
    pub content_hash: String,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub timestamp: DateTime<Utc>,
}

// ==================== Timeline ====================

/// Which history a timeline is built from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HistorySource {
    Version,
    Edit,
}

impl HistorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Version => "version",
            Self::Edit => "edit",
        }
    }
}

impl std::fmt::Display for HistorySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a diff run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiffChangeKind {
    Equal,
    Added,
    Removed,
}

/// A run of consecutive lines sharing one change kind
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiffChange {
    pub kind: DiffChangeKind,
    pub value: String,
    /// Number of lines in `value`
    pub count: usize,
}

/// Line counts of a diff
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiffStats {
    pub additions: usize,
    pub deletions: usize,
}

impl DiffStats {
    pub fn of(changes: &[DiffChange]) -> Self {
        changes.iter().fold(Self::default(), |mut acc, change| {
            match change.kind {
                DiffChangeKind::Added => acc.additions += change.count,
                DiffChangeKind::Removed => acc.deletions += change.count,
                DiffChangeKind::Equal => {}
            }
            acc
        })
    }
}

/// Cached diff between two adjacent history points
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEvent {
    pub note_id: String,
    pub branch_name: String,
    pub source: HistorySource,
    /// `None` for the first point of a history
    pub from_version_id: Option<String>,
    pub to_version_id: String,
    pub to_version_number: u64,
    pub timestamp: DateTime<Utc>,
    pub diff_changes: Vec<DiffChange>,
    pub stats: DiffStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}
