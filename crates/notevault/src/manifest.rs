//! Manifest orchestration: keeps the central registry, the per-note manifests
//! and the note folders consistent with each other.
//!
//! Every operation that changes one side updates the other before returning,
//! and rolls back what it already did when a later step fails.

use crate::events::{EventBus, HistoryEvent};
use notevault_core::prelude::*;
use notevault_core::utils::short_random;
use notevault_core::{validate_branch_name, validate_note_id};
use notevault_store::{CentralRegistry, NoteHistoryStore, SnapshotStore, manifest_rel_path};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::instrument;

/// Suffixed candidates tried before falling back to a random suffix
const MAX_ID_SUFFIX: u32 = 100;

/// Outcome of consolidating the note ids registered for one path
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateResolution {
    pub note_path: String,
    pub winner: Option<String>,
    pub losers: Vec<String>,
}

/// What deleting a branch ended up removing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchRemoval {
    Branch,
    /// It was the last branch, so the whole note went with it
    Note,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchSummary {
    pub name: String,
    pub version_count: usize,
    pub latest_version_id: Option<String>,
    pub is_current: bool,
}

pub struct ManifestOrchestrator {
    fs: Arc<dyn FileSystem>,
    registry: Arc<CentralRegistry>,
    notes: Arc<NoteHistoryStore>,
    snapshots: Arc<SnapshotStore>,
    events: Arc<EventBus>,
    /// Shared while a note folder is created or renamed; exclusive while an
    /// unregistered folder is evicted
    layout: RwLock<()>,
}

impl ManifestOrchestrator {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        registry: Arc<CentralRegistry>,
        notes: Arc<NoteHistoryStore>,
        snapshots: Arc<SnapshotStore>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            fs,
            registry,
            notes,
            snapshots,
            events,
            layout: RwLock::new(()),
        }
    }

    /// Create the folder and manifest of a note and register it
    #[instrument(skip(self))]
    pub async fn create_note_entry(&self, note_id: &str, note_path: &str) -> Result<NoteManifest> {
        validate_note_id(note_id)?;
        let note_path = normalize_note_path(note_path)?;
        if self.registry.entry(note_id).await?.is_some() {
            return Err(Error::conflict(format!("Note {} is already registered", note_id)));
        }

        let manifest = {
            let _layout = self.layout.read().await;
            let note_dir = self.notes.note_dir(note_id);
            self.fs.create_dir_all(&self.notes.versions_dir(note_id)).await?;

            let manifest = NoteManifest::new(note_id, note_path.as_str());
            let registered = async {
                self.notes.save(&manifest).await?;
                self.registry
                    .add_note_entry(note_id, NoteEntry::new(note_path.as_str(), manifest_rel_path(note_id)))
                    .await
            }
            .await;

            if let Err(e) = registered {
                log::warn!("Rolling back creation of note {}: {}", note_id, e);
                if let Err(cleanup) = self.fs.remove_dir_all(&note_dir).await {
                    log::error!("Could not remove {}: {}", note_dir.display(), cleanup);
                }
                self.notes.invalidate(note_id);
                self.registry.invalidate();
                return Err(e);
            }
            manifest
        };

        log::info!("Registered note {} for {}", note_id, note_path);
        self.events
            .publish(HistoryEvent::NoteRegistered {
                note_id: note_id.to_string(),
                note_path,
            })
            .await;
        Ok(manifest)
    }

    /// Unregister a note and delete its folder.
    ///
    /// The registry entry goes first; a folder that cannot be removed is left
    /// for the cleanup pass to evict.
    #[instrument(skip(self))]
    pub async fn delete_note_entry(&self, note_id: &str) -> Result<()> {
        validate_note_id(note_id)?;
        self.registry.remove_note_entry(note_id).await?;
        self.notes.invalidate(note_id);

        let note_dir = self.notes.note_dir(note_id);
        if let Err(e) = self.fs.remove_dir_all(&note_dir).await {
            log::error!("Failed to delete folder of note {}: {}", note_id, e);
        }

        log::info!("Deleted note {}", note_id);
        self.events
            .publish(HistoryEvent::NoteDeleted {
                note_id: note_id.to_string(),
            })
            .await;
        Ok(())
    }

    /// Move a note to a new id: folder, manifest and registry key
    #[instrument(skip(self))]
    pub async fn rename_note_entry(&self, old_id: &str, new_id: &str) -> Result<()> {
        validate_note_id(old_id)?;
        validate_note_id(new_id)?;
        if self.registry.entry(old_id).await?.is_none() {
            return Err(Error::not_found(format!("note {}", old_id)));
        }
        if self.registry.entry(new_id).await?.is_some() || self.fs.exists(&self.notes.note_dir(new_id)).await {
            return Err(Error::conflict(format!("Note id {} is already taken", new_id)));
        }

        {
            let _layout = self.layout.read().await;
            let old_dir = self.notes.note_dir(old_id);
            let new_dir = self.notes.note_dir(new_id);
            self.fs.rename(&old_dir, &new_dir).await?;
            self.notes.invalidate(old_id);

            if let Err(e) = self.rekey_manifest(new_id).await {
                self.roll_back_folder(&new_dir, &old_dir).await;
                self.notes.invalidate(new_id);
                return Err(e);
            }

            if let Err(e) = self
                .registry
                .rename_note_id(old_id, new_id, &manifest_rel_path(new_id))
                .await
            {
                self.roll_back_folder(&new_dir, &old_dir).await;
                self.notes.invalidate(new_id);
                if let Err(undo) = self.rekey_manifest(old_id).await {
                    log::error!("Could not restore manifest id of {}: {}", old_id, undo);
                }
                return Err(e);
            }
        }

        log::info!("Renamed note {} -> {}", old_id, new_id);
        self.events
            .publish(HistoryEvent::NoteRenamed {
                old_id: old_id.to_string(),
                new_id: new_id.to_string(),
            })
            .await;
        Ok(())
    }

    /// Rewrite the `noteId` of the manifest stored under `note_id`'s folder
    async fn rekey_manifest(&self, note_id: &str) -> Result<()> {
        let id = note_id.to_string();
        self.notes
            .update(note_id, move |manifest| {
                manifest.note_id = id;
                Ok(())
            })
            .await
    }

    /// Delete the note folder `name` unless a note registered under that id
    /// exists by the time the folder lock is held.
    ///
    /// Returns whether the folder was deleted. An expired `token` leaves the
    /// folder alone.
    #[instrument(skip(self, token))]
    pub async fn evict_unregistered_folder(&self, name: &str, token: &RelevanceToken) -> Result<bool> {
        {
            let _layout = self.layout.write().await;
            if !token.is_relevant() {
                return Ok(false);
            }
            if self.registry.load(true).await?.notes.contains_key(name) {
                log::debug!("Folder {} was registered meanwhile; keeping it", name);
                return Ok(false);
            }
            log::info!("Evicting unregistered note folder {}", name);
            self.fs.remove_dir_all(&self.notes.note_dir(name)).await?;
            self.notes.invalidate(name);
        }

        if validate_note_id(name).is_ok() {
            self.events
                .publish(HistoryEvent::NoteDeleted {
                    note_id: name.to_string(),
                })
                .await;
        }
        Ok(true)
    }

    async fn roll_back_folder(&self, from: &std::path::Path, to: &std::path::Path) {
        if let Err(e) = self.fs.rename(from, to).await {
            log::error!("Could not move {} back to {}: {}", from.display(), to.display(), e);
        }
    }

    /// Record a new document path in both the registry and the manifest
    #[instrument(skip(self))]
    pub async fn update_note_path(&self, note_id: &str, new_path: &str) -> Result<()> {
        let new_path = normalize_note_path(new_path)?;
        self.registry.update_note_path(note_id, &new_path).await?;
        let path = new_path.clone();
        match self
            .notes
            .update(note_id, move |manifest| {
                manifest.note_path = path;
                Ok(())
            })
            .await
        {
            Ok(()) => {}
            // Recreated with the right path on next access
            Err(e) if e.is_not_found() => {
                log::warn!("Note {} has no manifest to update", note_id)
            }
            Err(e) => return Err(e),
        }
        log::debug!("Note {} now tracks {}", note_id, new_path);
        Ok(())
    }

    /// Manifest of a registered note, recreated empty if it went missing
    pub async fn load_or_repair_manifest(&self, note_id: &str) -> Result<NoteManifest> {
        if let Some(manifest) = self.notes.load(note_id, false).await? {
            return Ok(manifest);
        }
        let entry = self
            .registry
            .entry(note_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("note {}", note_id)))?;

        log::warn!("Recreating missing manifest of note {} ({})", note_id, entry.note_path);
        self.fs.create_dir_all(&self.notes.versions_dir(note_id)).await?;
        let manifest = NoteManifest::new(note_id, entry.note_path.as_str());
        self.notes.save(&manifest).await?;
        Ok(manifest)
    }

    /// Manifest for `note_id` at `note_path`, registering the note if needed
    pub async fn ensure_manifest(&self, note_id: &str, note_path: &str) -> Result<NoteManifest> {
        if self.registry.entry(note_id).await?.is_none() {
            return self.create_note_entry(note_id, note_path).await;
        }
        let manifest = self.load_or_repair_manifest(note_id).await?;
        if manifest.note_path != note_path {
            self.update_note_path(note_id, note_path).await?;
            return self
                .notes
                .load(note_id, false)
                .await?
                .ok_or_else(|| Error::not_found(format!("manifest of note {}", note_id)));
        }
        Ok(manifest)
    }

    /// Keep the oldest note registered for a path and delete the rest.
    ///
    /// Oldest `createdAt` wins; ties go to the smallest id.
    #[instrument(skip(self))]
    pub async fn resolve_duplicates_for_path(&self, note_path: &str) -> Result<DuplicateResolution> {
        let mut entries = self.registry.entries_for_path(note_path).await?;
        entries.sort_by(|(a_id, a), (b_id, b)| {
            a.created_at.cmp(&b.created_at).then_with(|| a_id.cmp(b_id))
        });

        let mut ids = entries.into_iter().map(|(id, _)| id);
        let winner = ids.next();
        let losers: Vec<String> = ids.collect();

        let resolution = DuplicateResolution {
            note_path: note_path.to_string(),
            winner: winner.clone(),
            losers: losers.clone(),
        };
        let Some(winner) = winner else {
            return Ok(resolution);
        };
        if losers.is_empty() {
            return Ok(resolution);
        }

        log::warn!(
            "Path {} is registered to {} notes; keeping {}",
            note_path,
            losers.len() + 1,
            winner
        );
        for loser in &losers {
            self.delete_note_entry(loser).await?;
        }
        self.events
            .publish(HistoryEvent::DuplicatesResolved {
                note_path: note_path.to_string(),
                winner,
                losers,
            })
            .await;
        Ok(resolution)
    }

    async fn is_taken(&self, note_id: &str) -> Result<bool> {
        Ok(self.registry.entry(note_id).await?.is_some()
            || self.fs.exists(&self.notes.note_dir(note_id)).await)
    }

    /// `candidate`, else `candidate-1` .. `candidate-100`, else a random suffix
    pub async fn ensure_unique_note_id(&self, candidate: &str) -> Result<String> {
        validate_note_id(candidate)?;
        if !self.is_taken(candidate).await? {
            return Ok(candidate.to_string());
        }
        for suffix in 1..=MAX_ID_SUFFIX {
            let next = format!("{}-{}", candidate, suffix);
            if !self.is_taken(&next).await? {
                return Ok(next);
            }
        }
        loop {
            let next = format!("{}-{}", candidate, short_random());
            if !self.is_taken(&next).await? {
                return Ok(next);
            }
        }
    }

    // ==================== Branches ====================

    /// Create branch `name`, seeded with a copy of the latest snapshot of
    /// `from` (default: the current branch). Returns the seeded version id.
    #[instrument(skip(self))]
    pub async fn create_branch(
        &self,
        note_id: &str,
        name: &str,
        from: Option<&str>,
    ) -> Result<Option<String>> {
        validate_branch_name(name)?;
        let manifest = self.load_or_repair_manifest(note_id).await?;
        if manifest.branch(name).is_some() {
            return Err(Error::conflict(format!("Branch {} already exists", name)));
        }
        let source_name = from.unwrap_or(manifest.current_branch.as_str());
        let source = manifest
            .branch(source_name)
            .ok_or_else(|| Error::not_found(format!("branch {}", source_name)))?;

        let seed = match source.latest() {
            Some((version_id, meta)) => {
                let content = self
                    .snapshots
                    .read(note_id, version_id)
                    .await?
                    .ok_or_else(|| Error::not_found(format!("snapshot {}", version_id)))?;
                let new_id = generate_version_id();
                let size = self.snapshots.write(note_id, &new_id, &content).await?;
                let seeded = VersionMeta {
                    version_number: 0,
                    timestamp: chrono::Utc::now(),
                    name: meta.name.clone(),
                    tags: meta.tags.clone(),
                    size,
                    content_hash: Some(compute_hash(&content)),
                };
                Some((new_id, seeded))
            }
            None => None,
        };

        let branch_name = name.to_string();
        let seeded = seed.clone();
        let result = self
            .notes
            .update(note_id, move |manifest| {
                if manifest.branch(&branch_name).is_some() {
                    return Err(Error::conflict(format!("Branch {} already exists", branch_name)));
                }
                let mut data = BranchData::default();
                if let Some((version_id, meta)) = seeded {
                    data.push_version(version_id, meta);
                }
                manifest.branches.insert(branch_name, data);
                Ok(())
            })
            .await;

        if let Err(e) = result {
            if let Some((version_id, _)) = &seed
                && let Err(cleanup) = self.snapshots.delete(note_id, version_id).await
            {
                log::error!("Could not remove seeded snapshot {}: {}", version_id, cleanup);
            }
            return Err(e);
        }
        log::info!("Created branch {} of note {} from {}", name, note_id, source_name);
        Ok(seed.map(|(version_id, _)| version_id))
    }

    /// Make `name` the current branch; returns its latest version id so the
    /// caller can restore the document to it
    #[instrument(skip(self))]
    pub async fn switch_branch(&self, note_id: &str, name: &str) -> Result<Option<String>> {
        let name = name.to_string();
        self.notes
            .update(note_id, move |manifest| {
                let latest = manifest
                    .branch(&name)
                    .ok_or_else(|| Error::not_found(format!("branch {}", name)))?
                    .latest()
                    .map(|(id, _)| id.clone());
                manifest.current_branch = name;
                Ok(latest)
            })
            .await
    }

    /// Delete a branch and its snapshots; the last branch takes the note with it
    #[instrument(skip(self))]
    pub async fn delete_branch(&self, note_id: &str, name: &str) -> Result<BranchRemoval> {
        let manifest = self.load_or_repair_manifest(note_id).await?;
        if manifest.branch(name).is_none() {
            return Err(Error::not_found(format!("branch {}", name)));
        }
        if manifest.branches.len() == 1 {
            self.delete_note_entry(note_id).await?;
            return Ok(BranchRemoval::Note);
        }

        let branch_name = name.to_string();
        let removed = self
            .notes
            .update(note_id, move |manifest| {
                let removed = manifest
                    .branches
                    .remove(&branch_name)
                    .ok_or_else(|| Error::not_found(format!("branch {}", branch_name)))?;
                if manifest.current_branch == branch_name
                    && let Some(first) = manifest.branches.keys().next()
                {
                    manifest.current_branch = first.clone();
                }
                Ok(removed)
            })
            .await?;

        for version_id in removed.versions.keys() {
            if let Err(e) = self.snapshots.delete(note_id, version_id).await {
                log::warn!("Could not delete snapshot {}: {}", version_id, e);
            }
        }
        log::info!("Deleted branch {} of note {}", name, note_id);
        self.events
            .publish(HistoryEvent::BranchDeleted {
                note_id: note_id.to_string(),
                branch: name.to_string(),
            })
            .await;
        Ok(BranchRemoval::Branch)
    }

    pub async fn list_branches(&self, note_id: &str) -> Result<Vec<BranchSummary>> {
        let manifest = self.load_or_repair_manifest(note_id).await?;
        Ok(manifest
            .branches
            .iter()
            .map(|(name, data)| BranchSummary {
                name: name.clone(),
                version_count: data.versions.len(),
                latest_version_id: data.latest().map(|(id, _)| id.clone()),
                is_current: *name == manifest.current_branch,
            })
            .collect())
    }

    /// Replace a branch's retention overrides (`None` clears them)
    pub async fn update_branch_settings(
        &self,
        note_id: &str,
        branch: &str,
        settings: Option<BranchSettings>,
    ) -> Result<()> {
        let branch = branch.to_string();
        self.notes
            .update(note_id, move |manifest| {
                manifest
                    .branch_mut(&branch)
                    .ok_or_else(|| Error::not_found(format!("branch {}", branch)))?
                    .settings = settings;
                Ok(())
            })
            .await
    }

    pub async fn update_timeline_settings(
        &self,
        note_id: &str,
        branch: &str,
        settings: Option<TimelineSettings>,
    ) -> Result<()> {
        let branch = branch.to_string();
        self.notes
            .update(note_id, move |manifest| {
                manifest
                    .branch_mut(&branch)
                    .ok_or_else(|| Error::not_found(format!("branch {}", branch)))?
                    .timeline_settings = settings;
                Ok(())
            })
            .await
    }
}
