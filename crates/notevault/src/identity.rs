//! Note identity: maps a document to the note id stored in its metadata.
//!
//! Copies of a document carry the same id as their source; moved documents
//! carry an id registered under their old path. Both cases are told apart by
//! checking whether the registered document still exists with that id.

use crate::manifest::ManifestOrchestrator;
use notevault_core::prelude::*;
use notevault_core::{generate_note_id, validate_note_id};
use notevault_store::CentralRegistry;
use serde_json::Value;
use std::sync::Arc;
use tracing::instrument;

pub struct NoteIdentityResolver {
    config: Arc<VersionControlConfig>,
    fs: Arc<dyn FileSystem>,
    metadata: Arc<dyn DocumentMetadata>,
    keys: MetadataKeys,
    registry: Arc<CentralRegistry>,
    orchestrator: Arc<ManifestOrchestrator>,
    queue: KeyedQueue,
}

impl NoteIdentityResolver {
    pub fn new(
        config: Arc<VersionControlConfig>,
        fs: Arc<dyn FileSystem>,
        metadata: Arc<dyn DocumentMetadata>,
        registry: Arc<CentralRegistry>,
        orchestrator: Arc<ManifestOrchestrator>,
    ) -> Self {
        let keys = MetadataKeys::new(config.note_id_key.clone(), config.legacy_note_id_keys.clone());
        Self {
            config,
            fs,
            metadata,
            keys,
            registry,
            orchestrator,
            queue: KeyedQueue::new(),
        }
    }

    pub fn keys(&self) -> &MetadataKeys {
        &self.keys
    }

    /// Note id of a document, assigning and writing one when it has none.
    ///
    /// Resolution for one path runs after any earlier resolution of the same
    /// path has finished.
    #[instrument(skip(self))]
    pub async fn get_or_create_note_id(&self, doc: &str) -> Result<String> {
        let doc = normalize_note_path(doc)?;
        self.queue.run(&doc, || self.resolve(&doc)).await
    }

    /// Id stored in the document's metadata, without creating one
    pub async fn read_note_id(&self, doc: &str) -> Result<Option<String>> {
        let doc = normalize_note_path(doc)?;
        self.keys.read_note_id(self.metadata.as_ref(), &doc).await
    }

    async fn resolve(&self, doc: &str) -> Result<String> {
        if !self.fs.exists(&self.config.document_path(doc)).await {
            return Err(Error::not_found(format!("document {}", doc)));
        }

        let stored = match self.keys.read_note_id(self.metadata.as_ref(), doc).await? {
            Some(id) if validate_note_id(&id).is_ok() => Some(id),
            Some(id) => {
                log::warn!("Ignoring malformed note id {:?} in {}", id, doc);
                None
            }
            None => None,
        };

        let note_id = match stored {
            Some(id) => self.reconcile(doc, id).await?,
            None => {
                let id = match self.registry.note_id_for_path(doc).await? {
                    Some(id) => id,
                    None => self.mint(doc).await?,
                };
                self.write_id(doc, None, &id).await?;
                id
            }
        };

        let resolution = self.orchestrator.resolve_duplicates_for_path(doc).await?;
        match resolution.winner {
            Some(winner) if resolution.losers.contains(&note_id) => {
                log::info!("{} adopts surviving note id {} (was {})", doc, winner, note_id);
                self.write_id(doc, Some(&note_id), &winner).await?;
                Ok(winner)
            }
            _ => Ok(note_id),
        }
    }

    /// Decide what a stored id means for this document
    async fn reconcile(&self, doc: &str, note_id: String) -> Result<String> {
        let Some(entry) = self.registry.entry(&note_id).await? else {
            // An unknown id never displaces the note already tracking this path
            if let Some(registered) = self.registry.note_id_for_path(doc).await? {
                log::info!(
                    "{} carries unregistered note id {}; restoring {}",
                    doc,
                    note_id,
                    registered
                );
                self.write_id(doc, Some(&note_id), &registered).await?;
                return Ok(registered);
            }
            return Ok(note_id);
        };
        if entry.note_path == doc {
            return Ok(note_id);
        }

        if self.still_carries(&entry.note_path, &note_id).await {
            let fresh = self.mint(doc).await?;
            log::info!(
                "{} is a copy of {}; assigning note id {}",
                doc,
                entry.note_path,
                fresh
            );
            self.write_id(doc, Some(&note_id), &fresh).await?;
            return Ok(fresh);
        }

        log::info!("Note {} moved from {} to {}", note_id, entry.note_path, doc);
        self.orchestrator.update_note_path(&note_id, doc).await?;
        Ok(note_id)
    }

    /// Whether `doc` exists and its metadata still names `note_id`
    async fn still_carries(&self, doc: &str, note_id: &str) -> bool {
        if !self.fs.exists(&self.config.document_path(doc)).await {
            return false;
        }
        match self.keys.read_note_id(self.metadata.as_ref(), doc).await {
            Ok(Some(id)) => id == note_id,
            Ok(None) => false,
            Err(e) => {
                log::warn!("Could not read note id of {}: {}", doc, e);
                false
            }
        }
    }

    async fn mint(&self, doc: &str) -> Result<String> {
        self.orchestrator
            .ensure_unique_note_id(&generate_note_id(doc))
            .await
    }

    /// Write `note_id` unless the stored id changed from `expected` meanwhile
    async fn write_id(&self, doc: &str, expected: Option<&str>, note_id: &str) -> Result<()> {
        let current = self.keys.read_note_id(self.metadata.as_ref(), doc).await?;
        if current.as_deref() != expected {
            return Err(Error::conflict(format!(
                "Note id of {} changed from {:?} to {:?} during resolution",
                doc, expected, current
            )));
        }
        self.metadata
            .set(doc, &self.keys.primary, Value::String(note_id.to_string()))
            .await
    }
}
