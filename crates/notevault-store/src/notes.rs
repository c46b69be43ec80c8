//! Per-note manifest storage.
//!
//! One manifest per note at `<db-root>/db/<noteId>/manifest.json`, cached in
//! memory. Read-modify-write goes through [`NoteHistoryStore::update`], which
//! serializes on a per-note lane of a [`KeyedQueue`].

use crate::atomic::AtomicStore;
use dashmap::DashMap;
use notevault_core::prelude::*;
use notevault_core::{NOTES_DIR, validate_note_id};
use std::path::{Path, PathBuf};
use tracing::instrument;

/// File name of a note manifest inside its folder
pub const MANIFEST_FILE: &str = "manifest.json";

/// Folder holding a note's snapshots
pub const VERSIONS_DIR: &str = "versions";

/// Manifest path relative to the database root, as recorded in the registry
pub fn manifest_rel_path(note_id: &str) -> String {
    format!("{}/{}/{}", NOTES_DIR, note_id, MANIFEST_FILE)
}

/// Cached per-note manifests with per-note write serialization
pub struct NoteHistoryStore {
    notes_dir: PathBuf,
    store: AtomicStore,
    cache: DashMap<String, NoteManifest>,
    queue: KeyedQueue,
}

impl NoteHistoryStore {
    pub fn new(notes_dir: impl Into<PathBuf>, store: AtomicStore) -> Self {
        Self {
            notes_dir: notes_dir.into(),
            store,
            cache: DashMap::new(),
            queue: KeyedQueue::new(),
        }
    }

    pub fn notes_dir(&self) -> &Path {
        &self.notes_dir
    }

    pub fn note_dir(&self, note_id: &str) -> PathBuf {
        self.notes_dir.join(note_id)
    }

    pub fn manifest_path(&self, note_id: &str) -> PathBuf {
        self.note_dir(note_id).join(MANIFEST_FILE)
    }

    pub fn versions_dir(&self, note_id: &str) -> PathBuf {
        self.note_dir(note_id).join(VERSIONS_DIR)
    }

    /// Manifest of a note, `None` if missing or unreadable
    pub async fn load(&self, note_id: &str, force: bool) -> Result<Option<NoteManifest>> {
        validate_note_id(note_id)?;
        if !force && let Some(cached) = self.cache.get(note_id) {
            return Ok(Some(cached.clone()));
        }

        let manifest: Option<NoteManifest> = self
            .store
            .read_json(&self.manifest_path(note_id))
            .await?
            .into_option();
        match &manifest {
            Some(m) => {
                self.cache.insert(note_id.to_string(), m.clone());
            }
            None => {
                self.cache.remove(note_id);
            }
        }
        Ok(manifest)
    }

    /// Overwrite a manifest wholesale
    #[instrument(skip(self, manifest), fields(note_id = %manifest.note_id))]
    pub async fn save(&self, manifest: &NoteManifest) -> Result<()> {
        let note_id = manifest.note_id.clone();
        self.queue
            .run(&note_id, || self.persist(manifest))
            .await
    }

    async fn persist(&self, manifest: &NoteManifest) -> Result<()> {
        validate_note_id(&manifest.note_id)?;
        self.store
            .write_json(&self.manifest_path(&manifest.note_id), manifest)
            .await?;
        self.cache
            .insert(manifest.note_id.clone(), manifest.clone());
        Ok(())
    }

    /// Reload fresh, apply `edit`, persist, cache.
    ///
    /// Fails with `NotFound` when the note has no manifest. A failing `edit`
    /// persists nothing.
    #[instrument(skip(self, edit))]
    pub async fn update<T, F>(&self, note_id: &str, edit: F) -> Result<T>
    where
        F: FnOnce(&mut NoteManifest) -> Result<T>,
    {
        self.queue
            .run(note_id, || async move {
                let mut manifest = self
                    .load(note_id, true)
                    .await?
                    .ok_or_else(|| Error::not_found(format!("manifest of note {}", note_id)))?;
                let output = edit(&mut manifest)?;
                manifest.touch();
                self.persist(&manifest).await?;
                Ok(output)
            })
            .await
    }

    pub fn invalidate(&self, note_id: &str) {
        self.cache.remove(note_id);
    }

    pub fn invalidate_all(&self) {
        self.cache.clear();
    }
}
