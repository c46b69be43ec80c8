//! Orphan cleanup and duplicate consolidation.
//!
//! Registered notes whose manifest is missing or unreadable get an empty one
//! recreated. Note folders no registry entry points to are evicted. Paths
//! registered to several notes are consolidated to one.
//!
//! The pass works from a registry snapshot, but a folder is only deleted
//! after the registry is re-read under the orchestrator's folder lock, so a
//! note registered while the pass runs is never evicted.

use crate::manifest::ManifestOrchestrator;
use notevault_core::prelude::*;
use notevault_store::{CentralRegistry, NoteHistoryStore};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::instrument;

/// What one cleanup pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    /// Registered notes whose manifest was recreated
    pub recovered: Vec<String>,
    /// Unregistered note folders that were deleted
    pub evicted: Vec<String>,
    /// Duplicate note ids removed, keyed by the path they shared
    pub duplicates: BTreeMap<String, Vec<String>>,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        self.recovered.is_empty() && self.evicted.is_empty() && self.duplicates.is_empty()
    }
}

pub struct CleanupService {
    fs: Arc<dyn FileSystem>,
    registry: Arc<CentralRegistry>,
    notes: Arc<NoteHistoryStore>,
    orchestrator: Arc<ManifestOrchestrator>,
}

impl CleanupService {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        registry: Arc<CentralRegistry>,
        notes: Arc<NoteHistoryStore>,
        orchestrator: Arc<ManifestOrchestrator>,
    ) -> Self {
        Self {
            fs,
            registry,
            notes,
            orchestrator,
        }
    }

    /// One cleanup pass. Once `token` expires the pass stops before its
    /// next change and returns what it did so far.
    #[instrument(skip(self, token))]
    pub async fn cleanup_orphaned_versions(&self, token: &RelevanceToken) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        let entries = self.registry.load(true).await?.notes;

        for note_id in entries.keys() {
            if !token.is_relevant() {
                return Ok(report);
            }
            let readable = match self.notes.load(note_id, true).await {
                Ok(manifest) => manifest.is_some(),
                Err(e) => {
                    log::warn!("Manifest of note {} unreadable: {}", note_id, e);
                    false
                }
            };
            if readable {
                continue;
            }
            match self.orchestrator.load_or_repair_manifest(note_id).await {
                Ok(_) => report.recovered.push(note_id.clone()),
                // Deleted since the snapshot was taken
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        let notes_dir = self.notes.notes_dir().to_path_buf();
        if self.fs.exists(&notes_dir).await {
            for dir in self.fs.list_dir(&notes_dir).await? {
                if !dir.is_dir || entries.contains_key(&dir.name) {
                    continue;
                }
                if !token.is_relevant() {
                    return Ok(report);
                }
                if self
                    .orchestrator
                    .evict_unregistered_folder(&dir.name, token)
                    .await?
                {
                    report.evicted.push(dir.name);
                }
            }
        }

        let mut per_path: BTreeMap<&str, usize> = BTreeMap::new();
        for entry in entries.values() {
            *per_path.entry(entry.note_path.as_str()).or_default() += 1;
        }
        for (path, count) in per_path {
            if count < 2 {
                continue;
            }
            if !token.is_relevant() {
                return Ok(report);
            }
            let resolution = self.orchestrator.resolve_duplicates_for_path(path).await?;
            if !resolution.losers.is_empty() {
                report.duplicates.insert(path.to_string(), resolution.losers);
            }
        }

        if report.is_empty() {
            log::debug!("Cleanup found nothing to do");
        } else {
            log::info!(
                "Cleanup recovered {}, evicted {}, consolidated {} path(s)",
                report.recovered.len(),
                report.evicted.len(),
                report.duplicates.len()
            );
        }
        Ok(report)
    }

    /// Run cleanup every `period` until `token` expires.
    ///
    /// Failures are logged; the loop keeps going.
    pub fn start_periodic(self: Arc<Self>, period: Duration, token: RelevanceToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !token.is_relevant() {
                    log::debug!("Periodic cleanup stopped");
                    break;
                }
                if let Err(e) = self.cleanup_orphaned_versions(&token).await {
                    log::error!("Periodic cleanup failed: {}", e);
                }
            }
        })
    }
}
