//! Version operations: full snapshots of a document, grouped per branch.
//!
//! Mutations of one note run in order on a FIFO lane keyed by note id, so the
//! duplicate check and the append that follows it see a consistent branch.

use crate::events::{EventBus, HistoryEvent};
use crate::identity::NoteIdentityResolver;
use crate::manifest::{BranchRemoval, ManifestOrchestrator};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notevault_core::metadata::strip_keys;
use notevault_core::prelude::*;
use notevault_history::{HistoryPoint, TimelineProvider, line_changes};
use notevault_store::{CentralRegistry, NoteHistoryStore, SnapshotStore};
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use tracing::instrument;

/// Options for saving a version
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    pub name: Option<String>,
    pub tags: Option<Vec<String>>,
    /// Save even when the content equals the latest version
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved {
        note_id: String,
        version_id: String,
        version_number: u64,
    },
    /// Content matched the latest version; nothing was written
    Duplicate { note_id: String, version_id: String },
}

impl SaveOutcome {
    pub fn note_id(&self) -> &str {
        match self {
            SaveOutcome::Saved { note_id, .. } | SaveOutcome::Duplicate { note_id, .. } => note_id,
        }
    }

    pub fn version_id(&self) -> &str {
        match self {
            SaveOutcome::Saved { version_id, .. } | SaveOutcome::Duplicate { version_id, .. } => {
                version_id
            }
        }
    }
}

/// Listing entry of a saved version
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub id: String,
    pub branch: String,
    pub version_number: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    pub size: u64,
}

impl VersionInfo {
    fn new(id: &str, branch: &str, meta: &VersionMeta) -> Self {
        Self {
            id: id.to_string(),
            branch: branch.to_string(),
            version_number: meta.version_number,
            timestamp: meta.timestamp,
            name: meta.name.clone(),
            tags: meta.tags.clone(),
            size: meta.size,
        }
    }
}

/// What deleting versions removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionDeletion {
    VersionRemoved,
    /// The branch became empty and was deleted
    BranchRemoved { branch: String },
    /// The note lost its last branch and was unregistered
    NoteRemoved,
}

impl From<(BranchRemoval, &str)> for VersionDeletion {
    fn from((removal, branch): (BranchRemoval, &str)) -> Self {
        match removal {
            BranchRemoval::Branch => VersionDeletion::BranchRemoved {
                branch: branch.to_string(),
            },
            BranchRemoval::Note => VersionDeletion::NoteRemoved,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Snapshot content as stored
    Markdown,
    /// Version metadata plus content
    Json,
    /// Content without the note identity field
    Txt,
}

impl FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "markdown" | "md" => Ok(ExportFormat::Markdown),
            "json" => Ok(ExportFormat::Json),
            "txt" | "text" => Ok(ExportFormat::Txt),
            other => Err(Error::validation(format!("Unknown export format: {}", other))),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportedVersion<'a> {
    note_id: &'a str,
    version_id: &'a str,
    branch: &'a str,
    version_number: u64,
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tags: Option<&'a [String]>,
    content: &'a str,
}

pub struct VersionService {
    config: Arc<VersionControlConfig>,
    fs: Arc<dyn FileSystem>,
    registry: Arc<CentralRegistry>,
    notes: Arc<NoteHistoryStore>,
    snapshots: Arc<SnapshotStore>,
    orchestrator: Arc<ManifestOrchestrator>,
    identity: Arc<NoteIdentityResolver>,
    events: Arc<EventBus>,
    queue: KeyedQueue,
}

impl VersionService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<VersionControlConfig>,
        fs: Arc<dyn FileSystem>,
        registry: Arc<CentralRegistry>,
        notes: Arc<NoteHistoryStore>,
        snapshots: Arc<SnapshotStore>,
        orchestrator: Arc<ManifestOrchestrator>,
        identity: Arc<NoteIdentityResolver>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            fs,
            registry,
            notes,
            snapshots,
            orchestrator,
            identity,
            events,
            queue: KeyedQueue::new(),
        }
    }

    /// Snapshot the current content of a document into its current branch
    #[instrument(skip(self, options))]
    pub async fn save_new_version_for_file(&self, doc: &str, options: SaveOptions) -> Result<SaveOutcome> {
        let doc = normalize_note_path(doc)?;
        let note_id = self.identity.get_or_create_note_id(&doc).await?;
        self.queue
            .run(&note_id, || self.save_locked(&doc, &note_id, options))
            .await
    }

    async fn save_locked(&self, doc: &str, note_id: &str, options: SaveOptions) -> Result<SaveOutcome> {
        let manifest = self.orchestrator.ensure_manifest(note_id, doc).await?;
        let content = self
            .fs
            .read_to_string(&self.config.document_path(doc))
            .await?;
        let hash = compute_hash(&content);
        let branch = manifest.current_branch.clone();

        if !options.force
            && let Some(latest) = self.duplicate_of_latest(&manifest, &content, &hash).await?
        {
            log::debug!("{} unchanged since version {}", doc, latest);
            return Ok(SaveOutcome::Duplicate {
                note_id: note_id.to_string(),
                version_id: latest,
            });
        }

        let version_id = generate_version_id();
        let size = self.snapshots.write(note_id, &version_id, &content).await?;
        let meta = VersionMeta {
            version_number: 0,
            timestamp: Utc::now(),
            name: options.name.filter(|n| !n.trim().is_empty()),
            tags: options.tags.filter(|t| !t.is_empty()),
            size,
            content_hash: Some(hash),
        };

        let (target_branch, vid) = (branch.clone(), version_id.clone());
        let appended = self
            .notes
            .update(note_id, move |manifest| {
                Ok(manifest
                    .branches
                    .entry(target_branch)
                    .or_default()
                    .push_version(vid, meta))
            })
            .await;

        let version_number = match appended {
            Ok(number) => number,
            Err(e) => {
                if let Err(cleanup) = self.snapshots.delete(note_id, &version_id).await {
                    log::error!("Could not remove orphaned snapshot {}: {}", version_id, cleanup);
                }
                return Err(e);
            }
        };

        log::info!("Saved version {} (#{}) of {} on {}", version_id, version_number, doc, branch);

        if let Err(e) = self.apply_retention(note_id).await {
            log::warn!("Retention for note {} failed: {}", note_id, e);
        }

        self.events
            .publish(HistoryEvent::VersionSaved {
                note_id: note_id.to_string(),
                branch,
                version_id: version_id.clone(),
                version_number,
            })
            .await;

        Ok(SaveOutcome::Saved {
            note_id: note_id.to_string(),
            version_id,
            version_number,
        })
    }

    /// Id of the current branch's latest version when it holds `content`
    async fn duplicate_of_latest(
        &self,
        manifest: &NoteManifest,
        content: &str,
        hash: &str,
    ) -> Result<Option<String>> {
        let Some((latest_id, meta)) = manifest.current_branch_data().and_then(|b| b.latest()) else {
            return Ok(None);
        };
        let same = match meta.content_hash.as_deref() {
            Some(stored) => stored == hash,
            // Manifests written without hashes fall back to the snapshot
            None => self
                .snapshots
                .read(&manifest.note_id, latest_id)
                .await?
                .is_some_and(|previous| previous == content),
        };
        Ok(same.then(|| latest_id.clone()))
    }

    /// Apply retention to every branch of a note; returns the removed ids
    #[instrument(skip(self))]
    pub async fn enforce_retention(&self, note_id: &str) -> Result<Vec<String>> {
        self.queue
            .run(note_id, || self.apply_retention(note_id))
            .await
    }

    async fn apply_retention(&self, note_id: &str) -> Result<Vec<String>> {
        let settings = self.registry.global_settings().await?;
        let removed = self
            .notes
            .update(note_id, move |manifest| {
                let now = Utc::now();
                let mut removed = Vec::new();
                for branch in manifest.branches.values_mut() {
                    for id in settings.retention_for(branch).expired_versions(branch, now) {
                        branch.versions.remove(&id);
                        removed.push(id);
                    }
                }
                Ok(removed)
            })
            .await?;

        for version_id in &removed {
            if let Err(e) = self.snapshots.delete(note_id, version_id).await {
                log::warn!("Could not delete expired snapshot {}: {}", version_id, e);
            }
        }
        if !removed.is_empty() {
            log::info!("Retention removed {} version(s) of note {}", removed.len(), note_id);
        }
        Ok(removed)
    }

    /// Overwrite a document with the content of one of its versions
    #[instrument(skip(self))]
    pub async fn restore_version(&self, doc: &str, note_id: &str, version_id: &str) -> Result<()> {
        let doc = normalize_note_path(doc)?;
        let path = self.config.document_path(&doc);
        if !self.fs.exists(&path).await {
            return Err(Error::not_found(format!("document {}", doc)));
        }
        let content = self.get_version_content(note_id, version_id).await?;
        self.fs.write(&path, content.as_bytes()).await?;
        log::info!("Restored {} to version {}", doc, version_id);
        Ok(())
    }

    /// Delete one version; an emptied branch goes with it
    #[instrument(skip(self))]
    pub async fn delete_version(&self, note_id: &str, version_id: &str) -> Result<VersionDeletion> {
        self.queue
            .run(note_id, || async {
                let manifest = self.orchestrator.load_or_repair_manifest(note_id).await?;
                let branch = manifest
                    .branch_of_version(version_id)
                    .ok_or_else(|| Error::not_found(format!("version {}", version_id)))?
                    .to_string();
                let last_in_branch = manifest
                    .branch(&branch)
                    .is_some_and(|data| data.versions.len() == 1);

                if last_in_branch {
                    let removal = self.orchestrator.delete_branch(note_id, &branch).await?;
                    return Ok(VersionDeletion::from((removal, branch.as_str())));
                }

                let (target_branch, vid) = (branch.clone(), version_id.to_string());
                self.notes
                    .update(note_id, move |manifest| {
                        manifest
                            .branch_mut(&target_branch)
                            .and_then(|data| data.versions.remove(&vid))
                            .map(|_| ())
                            .ok_or_else(|| Error::not_found(format!("version {}", vid)))
                    })
                    .await?;
                self.snapshots.delete(note_id, version_id).await?;
                log::info!("Deleted version {} of note {}", version_id, note_id);
                Ok(VersionDeletion::VersionRemoved)
            })
            .await
    }

    /// Delete the current branch with all of its versions
    #[instrument(skip(self))]
    pub async fn delete_all_versions_in_current_branch(&self, note_id: &str) -> Result<VersionDeletion> {
        self.queue
            .run(note_id, || async {
                let manifest = self.orchestrator.load_or_repair_manifest(note_id).await?;
                let branch = manifest.current_branch.clone();
                let removal = self.orchestrator.delete_branch(note_id, &branch).await?;
                Ok(VersionDeletion::from((removal, branch.as_str())))
            })
            .await
    }

    /// Write a version out as a new document without the note identity.
    ///
    /// Returns the vault-relative path of the new document.
    #[instrument(skip(self))]
    pub async fn create_deviation(
        &self,
        note_id: &str,
        version_id: &str,
        target_folder: &str,
        base_name: &str,
    ) -> Result<String> {
        let content = self.get_version_content(note_id, version_id).await?;
        let stripped = strip_keys(&content, self.identity.keys().all())?;

        let base = base_name.trim().trim_end_matches(".md");
        if base.is_empty() || base.contains('/') || base.contains('\\') {
            return Err(Error::validation(format!("Invalid file name: {:?}", base_name)));
        }
        let folder = target_folder.trim().trim_matches('/');
        let relative = |name: String| {
            if folder.is_empty() {
                normalize_note_path(&name)
            } else {
                normalize_note_path(&format!("{}/{}", folder, name))
            }
        };

        let mut candidate = relative(format!("{}.md", base))?;
        let mut n = 1u32;
        while self.fs.exists(&self.config.document_path(&candidate)).await {
            candidate = relative(format!("{} {}.md", base, n))?;
            n += 1;
        }

        let path = self.config.document_path(&candidate);
        if let Some(parent) = path.parent() {
            self.fs.create_dir_all(parent).await?;
        }
        self.fs.write(&path, stripped.as_bytes()).await?;
        log::info!("Created {} from version {} of note {}", candidate, version_id, note_id);
        Ok(candidate)
    }

    /// Versions of the current branch, newest first
    pub async fn get_version_history(&self, note_id: &str) -> Result<Vec<VersionInfo>> {
        let Some(manifest) = self.notes.load(note_id, false).await? else {
            return Ok(Vec::new());
        };
        let Some(branch) = manifest.current_branch_data() else {
            return Ok(Vec::new());
        };
        let mut versions: Vec<VersionInfo> = branch
            .sorted_versions()
            .into_iter()
            .map(|(id, meta)| VersionInfo::new(id, &manifest.current_branch, meta))
            .collect();
        versions.reverse();
        Ok(versions)
    }

    pub async fn get_version_content(&self, note_id: &str, version_id: &str) -> Result<String> {
        self.snapshots
            .read(note_id, version_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("version {} of note {}", version_id, note_id)))
    }

    /// Rename or retag a version; `None` clears the field
    pub async fn update_version_details(
        &self,
        note_id: &str,
        version_id: &str,
        name: Option<String>,
        tags: Option<Vec<String>>,
    ) -> Result<()> {
        let vid = version_id.to_string();
        self.notes
            .update(note_id, move |manifest| {
                let branch = manifest
                    .branch_of_version(&vid)
                    .ok_or_else(|| Error::not_found(format!("version {}", vid)))?
                    .to_string();
                let meta = manifest
                    .branch_mut(&branch)
                    .and_then(|data| data.versions.get_mut(&vid))
                    .ok_or_else(|| Error::not_found(format!("version {}", vid)))?;
                meta.name = name.filter(|n| !n.trim().is_empty());
                meta.tags = tags.filter(|t| !t.is_empty());
                Ok(())
            })
            .await
    }

    pub async fn export_version(&self, note_id: &str, version_id: &str, format: ExportFormat) -> Result<String> {
        let content = self.get_version_content(note_id, version_id).await?;
        match format {
            ExportFormat::Markdown => Ok(content),
            ExportFormat::Txt => strip_keys(&content, self.identity.keys().all()),
            ExportFormat::Json => {
                let manifest = self
                    .notes
                    .load(note_id, false)
                    .await?
                    .ok_or_else(|| Error::not_found(format!("note {}", note_id)))?;
                let branch = manifest
                    .branch_of_version(version_id)
                    .ok_or_else(|| Error::not_found(format!("version {}", version_id)))?;
                let meta = manifest
                    .branch(branch)
                    .and_then(|data| data.versions.get(version_id))
                    .ok_or_else(|| Error::not_found(format!("version {}", version_id)))?;
                let exported = ExportedVersion {
                    note_id,
                    version_id,
                    branch,
                    version_number: meta.version_number,
                    timestamp: meta.timestamp,
                    name: meta.name.as_deref(),
                    tags: meta.tags.as_deref(),
                    content: &content,
                };
                Ok(serde_json::to_string_pretty(&exported)?)
            }
        }
    }

    /// Line changes turning version `from` into version `to`
    pub async fn compare_versions(&self, note_id: &str, from: &str, to: &str) -> Result<Vec<DiffChange>> {
        let old = self.get_version_content(note_id, from).await?;
        let new = self.get_version_content(note_id, to).await?;
        Ok(line_changes(&old, &new))
    }
}

/// Timeline points backed by the snapshots of a branch
pub struct SnapshotTimeline {
    notes: Arc<NoteHistoryStore>,
    snapshots: Arc<SnapshotStore>,
}

impl SnapshotTimeline {
    pub fn new(notes: Arc<NoteHistoryStore>, snapshots: Arc<SnapshotStore>) -> Self {
        Self { notes, snapshots }
    }
}

#[async_trait]
impl TimelineProvider for SnapshotTimeline {
    async fn history_points(&self, note_id: &str, branch: &str) -> Result<Vec<HistoryPoint>> {
        let Some(manifest) = self.notes.load(note_id, false).await? else {
            return Ok(Vec::new());
        };
        Ok(manifest
            .branch(branch)
            .map(|data| {
                data.versions
                    .iter()
                    .map(|(id, meta)| HistoryPoint {
                        id: id.clone(),
                        version_number: meta.version_number,
                        timestamp: meta.timestamp,
                        name: meta.name.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn content(&self, note_id: &str, _branch: &str, point_id: &str) -> Result<Option<String>> {
        self.snapshots.read(note_id, point_id).await
    }
}
