//! Central registry: note identity -> document path, plus global settings.
//!
//! The registry is cached in memory together with a derived
//! `notePath -> noteId` index. Every mutation is serialized on the instance's
//! write queue and works against a fresh copy from disk: reload, apply a pure
//! transform, persist atomically, then refresh the cache and index.

use crate::atomic::AtomicStore;
use notevault_core::prelude::*;
use notevault_core::validate_note_id;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::instrument;

/// Cached central manifest with serialized writers
pub struct CentralRegistry {
    path: PathBuf,
    store: AtomicStore,
    defaults: GlobalSettings,
    cache: RwLock<Option<CentralManifest>>,
    path_index: RwLock<HashMap<String, String>>,
    writes: Mutex<()>,
}

impl CentralRegistry {
    /// `defaults` seeds `globalSettings` when no registry exists yet
    pub fn new(path: impl Into<PathBuf>, store: AtomicStore, defaults: GlobalSettings) -> Self {
        Self {
            path: path.into(),
            store,
            defaults,
            cache: RwLock::new(None),
            path_index: RwLock::new(HashMap::new()),
            writes: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cached registry, reading from disk on first access or when `force`d.
    ///
    /// Disk reads take the write queue, so a read can never install a copy
    /// older than one a concurrent mutation already installed.
    pub async fn load(&self, force: bool) -> Result<CentralManifest> {
        if !force {
            let cached = self.cache.read().clone();
            if let Some(cached) = cached {
                return Ok(cached);
            }
        }

        let _turn = self.writes.lock().await;
        let manifest = self.read_disk().await?;
        self.install(manifest.clone());
        Ok(manifest)
    }

    async fn read_disk(&self) -> Result<CentralManifest> {
        let defaults = self.defaults.clone();
        self.store
            .read_json_or_default(&self.path, || CentralManifest {
                global_settings: defaults,
                ..Default::default()
            })
            .await
    }

    /// Drop the in-memory copy; next access reads from disk
    pub fn invalidate(&self) {
        *self.cache.write() = None;
        self.path_index.write().clear();
    }

    fn install(&self, manifest: CentralManifest) {
        *self.path_index.write() = build_path_index(&manifest);
        *self.cache.write() = Some(manifest);
    }

    /// Reload, transform, persist, refresh. A failing transform persists nothing.
    async fn mutate<T, F>(&self, transform: F) -> Result<T>
    where
        F: FnOnce(&mut CentralManifest) -> Result<T>,
    {
        let _turn = self.writes.lock().await;

        let mut manifest = self.read_disk().await?;
        let output = transform(&mut manifest)?;
        self.store.write_json(&self.path, &manifest).await?;
        self.install(manifest);
        Ok(output)
    }

    /// Register a note. Fails if the id is already taken.
    #[instrument(skip(self, entry), fields(note_path = %entry.note_path))]
    pub async fn add_note_entry(&self, note_id: &str, entry: NoteEntry) -> Result<()> {
        validate_note_id(note_id)?;
        self.mutate(|manifest| {
            if let Some(existing) = manifest.notes.get(note_id) {
                return Err(Error::conflict(format!(
                    "Note id {} is already registered for {}",
                    note_id, existing.note_path
                )));
            }
            manifest.notes.insert(note_id.to_string(), entry);
            Ok(())
        })
        .await?;
        log::debug!("Registered note {}", note_id);
        Ok(())
    }

    /// Unregister a note, returning its entry if it was present
    #[instrument(skip(self))]
    pub async fn remove_note_entry(&self, note_id: &str) -> Result<Option<NoteEntry>> {
        let removed = self
            .mutate(|manifest| Ok(manifest.notes.remove(note_id)))
            .await?;
        if removed.is_some() {
            log::debug!("Unregistered note {}", note_id);
        }
        Ok(removed)
    }

    #[instrument(skip(self))]
    pub async fn update_note_path(&self, note_id: &str, new_path: &str) -> Result<()> {
        self.mutate(|manifest| {
            let entry = manifest
                .notes
                .get_mut(note_id)
                .ok_or_else(|| Error::not_found(format!("note {}", note_id)))?;
            entry.note_path = new_path.to_string();
            entry.last_modified = chrono::Utc::now();
            Ok(())
        })
        .await
    }

    /// Move an entry to a new id in one write
    #[instrument(skip(self))]
    pub async fn rename_note_id(
        &self,
        old_id: &str,
        new_id: &str,
        new_manifest_path: &str,
    ) -> Result<()> {
        validate_note_id(new_id)?;
        self.mutate(|manifest| {
            if manifest.notes.contains_key(new_id) {
                return Err(Error::conflict(format!("Note id {} is already taken", new_id)));
            }
            let mut entry = manifest
                .notes
                .remove(old_id)
                .ok_or_else(|| Error::not_found(format!("note {}", old_id)))?;
            entry.manifest_path = new_manifest_path.to_string();
            entry.last_modified = chrono::Utc::now();
            manifest.notes.insert(new_id.to_string(), entry);
            Ok(())
        })
        .await
    }

    pub async fn set_has_edit_history(&self, note_id: &str, has_edit_history: bool) -> Result<()> {
        if self
            .entry(note_id)
            .await?
            .is_some_and(|e| e.has_edit_history == has_edit_history)
        {
            return Ok(());
        }
        self.mutate(|manifest| {
            let entry = manifest
                .notes
                .get_mut(note_id)
                .ok_or_else(|| Error::not_found(format!("note {}", note_id)))?;
            entry.has_edit_history = has_edit_history;
            Ok(())
        })
        .await
    }

    /// Apply `update` to the global settings and persist
    pub async fn update_global_settings<F>(&self, update: F) -> Result<GlobalSettings>
    where
        F: FnOnce(&mut GlobalSettings),
    {
        self.mutate(|manifest| {
            update(&mut manifest.global_settings);
            Ok(manifest.global_settings.clone())
        })
        .await
    }

    pub async fn global_settings(&self) -> Result<GlobalSettings> {
        Ok(self.load(false).await?.global_settings)
    }

    /// Id registered for a path. With duplicates present, the oldest entry.
    pub async fn note_id_for_path(&self, note_path: &str) -> Result<Option<String>> {
        let cold = self.cache.read().is_none();
        if cold {
            self.load(false).await?;
        }
        Ok(self.path_index.read().get(note_path).cloned())
    }

    pub async fn entry(&self, note_id: &str) -> Result<Option<NoteEntry>> {
        Ok(self.load(false).await?.notes.get(note_id).cloned())
    }

    pub async fn all_entries(&self) -> Result<BTreeMap<String, NoteEntry>> {
        Ok(self.load(false).await?.notes)
    }

    /// Every entry registered for a path, in id order
    pub async fn entries_for_path(&self, note_path: &str) -> Result<Vec<(String, NoteEntry)>> {
        Ok(self
            .load(false)
            .await?
            .notes
            .into_iter()
            .filter(|(_, entry)| entry.note_path == note_path)
            .collect())
    }
}

/// `notePath -> noteId`, preferring the earliest `createdAt` (then smallest id)
fn build_path_index(manifest: &CentralManifest) -> HashMap<String, String> {
    let mut index: HashMap<String, (&String, &NoteEntry)> = HashMap::new();
    for (id, entry) in &manifest.notes {
        index
            .entry(entry.note_path.clone())
            .and_modify(|current| {
                if (entry.created_at, id) < (current.1.created_at, current.0) {
                    *current = (id, entry);
                }
            })
            .or_insert((id, entry));
    }
    index
        .into_iter()
        .map(|(path, (id, _))| (path, id.clone()))
        .collect()
}
