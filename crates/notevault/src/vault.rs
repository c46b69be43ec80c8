//! [`NoteVault`]: the engine facade wiring stores, services and the event bus.

use crate::cleanup::{CleanupReport, CleanupService};
use crate::events::{EventBus, HistoryEvent, HistoryEventHandler, HistoryPurgeHandler};
use crate::identity::NoteIdentityResolver;
use crate::manifest::{BranchSummary, ManifestOrchestrator};
use crate::versions::{
    ExportFormat, SaveOptions, SaveOutcome, SnapshotTimeline, VersionDeletion, VersionInfo,
    VersionService,
};
use notevault_core::prelude::*;
use notevault_history::{BranchIntegrityReport, EditHistoryStore, HistoryDb, TimelineStore};
use notevault_store::{AtomicStore, CentralRegistry, NoteHistoryStore, SnapshotStore};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::instrument;

pub struct NoteVault {
    config: Arc<VersionControlConfig>,
    fs: Arc<dyn FileSystem>,
    events: Arc<EventBus>,
    registry: Arc<CentralRegistry>,
    notes: Arc<NoteHistoryStore>,
    orchestrator: Arc<ManifestOrchestrator>,
    identity: Arc<NoteIdentityResolver>,
    versions: VersionService,
    edits: Arc<EditHistoryStore>,
    timeline: Arc<TimelineStore>,
    snapshot_timeline: SnapshotTimeline,
    cleanup: Arc<CleanupService>,
    /// Background tasks run while tokens from this source stay relevant
    lifetime: RelevanceSource,
}

impl NoteVault {
    /// Open a vault on the local disk, front matter carrying note ids
    pub async fn open(config: VersionControlConfig) -> Result<Self> {
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFs);
        let metadata: Arc<dyn DocumentMetadata> =
            Arc::new(FrontmatterMetadata::new(config.vault_root.clone(), fs.clone()));
        Self::with_host(config, fs, metadata).await
    }

    /// Open a vault over host-provided file and metadata access
    pub async fn with_host(
        config: VersionControlConfig,
        fs: Arc<dyn FileSystem>,
        metadata: Arc<dyn DocumentMetadata>,
    ) -> Result<Self> {
        config.validate()?;
        fs.create_dir_all(&config.notes_dir()).await?;
        let db = HistoryDb::open(config.edit_history_path())?;
        Ok(Self::assemble(config, fs, metadata, db))
    }

    fn assemble(
        config: VersionControlConfig,
        fs: Arc<dyn FileSystem>,
        metadata: Arc<dyn DocumentMetadata>,
        db: HistoryDb,
    ) -> Self {
        let config = Arc::new(config);
        let store = AtomicStore::new(fs.clone());
        let events = Arc::new(EventBus::new());

        let registry = Arc::new(CentralRegistry::new(
            config.central_manifest_path(),
            store.clone(),
            config.default_settings.clone(),
        ));
        let notes = Arc::new(NoteHistoryStore::new(config.notes_dir(), store.clone()));
        let snapshots = Arc::new(SnapshotStore::new(config.notes_dir(), store));

        let edits = Arc::new(EditHistoryStore::new(
            db.clone(),
            config.default_settings.edit_full_snapshot_interval,
            config.verification_batch_size,
        ));
        let timeline = Arc::new(TimelineStore::new(db));
        let purge: Arc<dyn HistoryEventHandler> =
            Arc::new(HistoryPurgeHandler::new(edits.clone(), timeline.clone()));
        events.register(purge);

        let orchestrator = Arc::new(ManifestOrchestrator::new(
            fs.clone(),
            registry.clone(),
            notes.clone(),
            snapshots.clone(),
            events.clone(),
        ));
        let identity = Arc::new(NoteIdentityResolver::new(
            config.clone(),
            fs.clone(),
            metadata,
            registry.clone(),
            orchestrator.clone(),
        ));
        let versions = VersionService::new(
            config.clone(),
            fs.clone(),
            registry.clone(),
            notes.clone(),
            snapshots.clone(),
            orchestrator.clone(),
            identity.clone(),
            events.clone(),
        );
        let cleanup = Arc::new(CleanupService::new(
            fs.clone(),
            registry.clone(),
            notes.clone(),
            orchestrator.clone(),
        ));

        log::info!("Opened note vault at {}", config.vault_root.display());
        Self {
            snapshot_timeline: SnapshotTimeline::new(notes.clone(), snapshots),
            config,
            fs,
            events,
            registry,
            notes,
            orchestrator,
            identity,
            versions,
            edits,
            timeline,
            cleanup,
            lifetime: RelevanceSource::new(),
        }
    }

    pub fn config(&self) -> &VersionControlConfig {
        &self.config
    }

    pub fn registry(&self) -> &CentralRegistry {
        &self.registry
    }

    pub fn edit_history(&self) -> &EditHistoryStore {
        &self.edits
    }

    /// Register an extra handler for lifecycle events
    pub fn register_handler(&self, handler: Arc<dyn HistoryEventHandler>) {
        self.events.register(handler);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HistoryEvent> {
        self.events.subscribe()
    }

    // ==================== Identity ====================

    pub async fn get_or_create_note_id(&self, doc: &str) -> Result<String> {
        self.identity.get_or_create_note_id(doc).await
    }

    /// Note id stored in a document, if any; never assigns one
    pub async fn find_note_id(&self, doc: &str) -> Result<Option<String>> {
        self.identity.read_note_id(doc).await
    }

    // ==================== Versions ====================

    pub async fn save_new_version_for_file(&self, doc: &str, options: SaveOptions) -> Result<SaveOutcome> {
        self.versions.save_new_version_for_file(doc, options).await
    }

    /// Save a version in the background; failures are logged only
    pub fn auto_save(self: &Arc<Self>, doc: impl Into<String>) -> JoinHandle<()> {
        let vault = Arc::clone(self);
        let doc = doc.into();
        tokio::spawn(async move {
            match vault
                .save_new_version_for_file(&doc, SaveOptions::default())
                .await
            {
                Ok(SaveOutcome::Saved { version_id, .. }) => {
                    log::debug!("Auto-saved {} as {}", doc, version_id)
                }
                Ok(SaveOutcome::Duplicate { .. }) => {}
                Err(e) => log::warn!("Auto-save of {} failed: {}", doc, e),
            }
        })
    }

    pub async fn get_version_history(&self, note_id: &str) -> Result<Vec<VersionInfo>> {
        self.versions.get_version_history(note_id).await
    }

    pub async fn get_version_content(&self, note_id: &str, version_id: &str) -> Result<String> {
        self.versions.get_version_content(note_id, version_id).await
    }

    pub async fn restore_version(&self, doc: &str, note_id: &str, version_id: &str) -> Result<()> {
        self.versions.restore_version(doc, note_id, version_id).await
    }

    pub async fn delete_version(&self, note_id: &str, version_id: &str) -> Result<VersionDeletion> {
        self.versions.delete_version(note_id, version_id).await
    }

    pub async fn delete_all_versions_in_current_branch(&self, note_id: &str) -> Result<VersionDeletion> {
        self.versions
            .delete_all_versions_in_current_branch(note_id)
            .await
    }

    pub async fn update_version_details(
        &self,
        note_id: &str,
        version_id: &str,
        name: Option<String>,
        tags: Option<Vec<String>>,
    ) -> Result<()> {
        self.versions
            .update_version_details(note_id, version_id, name, tags)
            .await
    }

    pub async fn create_deviation(
        &self,
        note_id: &str,
        version_id: &str,
        target_folder: &str,
        base_name: &str,
    ) -> Result<String> {
        self.versions
            .create_deviation(note_id, version_id, target_folder, base_name)
            .await
    }

    pub async fn export_version(&self, note_id: &str, version_id: &str, format: ExportFormat) -> Result<String> {
        self.versions.export_version(note_id, version_id, format).await
    }

    pub async fn compare_versions(&self, note_id: &str, from: &str, to: &str) -> Result<Vec<DiffChange>> {
        self.versions.compare_versions(note_id, from, to).await
    }

    pub async fn enforce_retention(&self, note_id: &str) -> Result<Vec<String>> {
        self.versions.enforce_retention(note_id).await
    }

    // ==================== Branches ====================

    pub async fn create_branch(&self, note_id: &str, name: &str, from: Option<&str>) -> Result<Option<String>> {
        self.orchestrator.create_branch(note_id, name, from).await
    }

    /// Returns the latest version id of the branch switched to
    pub async fn switch_branch(&self, note_id: &str, name: &str) -> Result<Option<String>> {
        self.orchestrator.switch_branch(note_id, name).await
    }

    pub async fn delete_branch(&self, note_id: &str, name: &str) -> Result<VersionDeletion> {
        let removal = self.orchestrator.delete_branch(note_id, name).await?;
        Ok(VersionDeletion::from((removal, name)))
    }

    pub async fn list_branches(&self, note_id: &str) -> Result<Vec<BranchSummary>> {
        self.orchestrator.list_branches(note_id).await
    }

    pub async fn update_branch_settings(
        &self,
        note_id: &str,
        branch: &str,
        settings: Option<BranchSettings>,
    ) -> Result<()> {
        self.orchestrator
            .update_branch_settings(note_id, branch, settings)
            .await
    }

    pub async fn update_timeline_settings(
        &self,
        note_id: &str,
        branch: &str,
        settings: Option<TimelineSettings>,
    ) -> Result<()> {
        self.orchestrator
            .update_timeline_settings(note_id, branch, settings)
            .await
    }

    pub async fn update_global_settings<F>(&self, update: F) -> Result<GlobalSettings>
    where
        F: FnOnce(&mut GlobalSettings),
    {
        self.registry.update_global_settings(update).await
    }

    // ==================== Timeline ====================

    /// Timeline of a branch (default: the current one), newest first
    pub async fn get_or_generate_timeline(
        &self,
        note_id: &str,
        branch: Option<&str>,
        source: HistorySource,
    ) -> Result<Vec<TimelineEvent>> {
        let branch = match branch {
            Some(branch) => branch.to_string(),
            None => self.current_branch(note_id).await?,
        };
        match source {
            HistorySource::Version => {
                self.timeline
                    .get_or_generate_timeline(note_id, &branch, source, &self.snapshot_timeline)
                    .await
            }
            HistorySource::Edit => {
                self.timeline
                    .get_or_generate_timeline(note_id, &branch, source, self.edits.as_ref())
                    .await
            }
        }
    }

    async fn current_branch(&self, note_id: &str) -> Result<String> {
        Ok(self
            .notes
            .load(note_id, false)
            .await?
            .map(|manifest| manifest.current_branch)
            .unwrap_or_else(|| DEFAULT_BRANCH.to_string()))
    }

    // ==================== Edit history ====================

    /// Record the document's current content in the edit history of its
    /// current branch. `None` when edit history is off or nothing changed.
    #[instrument(skip(self))]
    pub async fn save_edit(&self, doc: &str) -> Result<Option<EditRecord>> {
        let settings = self.registry.global_settings().await?;
        if !settings.enable_edit_history {
            return Ok(None);
        }
        let doc = normalize_note_path(doc)?;
        let note_id = self.identity.get_or_create_note_id(&doc).await?;
        let manifest = self.orchestrator.ensure_manifest(&note_id, &doc).await?;
        let content = self
            .fs
            .read_to_string(&self.config.document_path(&doc))
            .await?;

        self.edits
            .set_full_snapshot_interval(settings.edit_full_snapshot_interval);
        let record = self
            .edits
            .save_edit(&note_id, &doc, &manifest.current_branch, &content)
            .await?;

        if record.is_some() {
            let flagged = self
                .registry
                .entry(&note_id)
                .await?
                .is_some_and(|entry| entry.has_edit_history);
            if !flagged {
                self.registry.set_has_edit_history(&note_id, true).await?;
            }
        }
        Ok(record)
    }

    pub async fn get_edit_content(&self, note_id: &str, branch: &str, edit_id: &str) -> Result<String> {
        self.edits.get_edit_content(note_id, branch, edit_id).await
    }

    pub async fn get_edit_manifest(&self, note_id: &str) -> Result<Option<NoteManifest>> {
        self.edits.get_edit_manifest(note_id).await
    }

    pub async fn list_edits(&self, note_id: &str, branch: &str) -> Result<Vec<EditRecord>> {
        self.edits.list_edits(note_id, branch).await
    }

    /// Verify every edit branch of a note. Branches whose scan was abandoned
    /// because the vault shut down are left out.
    pub async fn verify_edit_history(
        &self,
        note_id: &str,
        fix: bool,
    ) -> Result<BTreeMap<String, BranchIntegrityReport>> {
        let token = self.lifetime.token();
        let mut reports = BTreeMap::new();
        for branch in self.edits.verify_all_chains(note_id).await?.into_keys() {
            if let Some(report) = self
                .edits
                .verify_branch_integrity(note_id, &branch, fix, &token)
                .await?
            {
                reports.insert(branch, report);
            }
        }
        Ok(reports)
    }

    // ==================== Maintenance ====================

    /// One cleanup pass; stops early once the vault shuts down
    pub async fn cleanup_orphaned_versions(&self) -> Result<CleanupReport> {
        self.cleanup
            .cleanup_orphaned_versions(&self.lifetime.token())
            .await
    }

    /// Start periodic cleanup at the configured interval, until
    /// [`shutdown`](Self::shutdown). `None` when the interval is 0.
    pub fn start_periodic_cleanup(&self) -> Option<JoinHandle<()>> {
        if self.config.cleanup_interval_secs == 0 {
            return None;
        }
        let period = Duration::from_secs(self.config.cleanup_interval_secs);
        Some(
            Arc::clone(&self.cleanup).start_periodic(period, self.lifetime.token()),
        )
    }

    /// Expire background work started by this vault
    pub fn shutdown(&self) {
        self.lifetime.advance();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn vault() -> (TempDir, Arc<NoteVault>) {
        let temp = TempDir::new().unwrap();
        let config = VersionControlConfig::builder(temp.path()).build().unwrap();
        let vault = NoteVault::open(config).await.unwrap();
        (temp, Arc::new(vault))
    }

    #[tokio::test]
    async fn test_open_creates_layout() {
        let (temp, vault) = vault().await;
        assert!(vault.config().notes_dir().is_dir());
        assert!(temp.path().join(".versiondb/edit-history.sqlite3").exists());
    }

    #[tokio::test]
    async fn test_auto_save_swallows_errors() {
        let (_temp, vault) = vault().await;
        // Missing document: logged, not raised
        vault.auto_save("missing.md").await.unwrap();
        assert!(vault.registry().all_entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_edit_respects_setting() {
        let (temp, vault) = vault().await;
        std::fs::write(temp.path().join("a.md"), "one\n").unwrap();

        let record = vault.save_edit("a.md").await.unwrap().unwrap();
        assert_eq!(record.version_number, 1);
        let note_id = record.note_id.clone();
        assert!(vault.registry().entry(&note_id).await.unwrap().unwrap().has_edit_history);

        vault
            .update_global_settings(|s| s.enable_edit_history = false)
            .await
            .unwrap();
        std::fs::write(temp.path().join("a.md"), "two\n").unwrap();
        assert!(vault.save_edit("a.md").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_edit_timeline() {
        let (temp, vault) = vault().await;
        let doc = temp.path().join("a.md");
        std::fs::write(&doc, "one\n").unwrap();
        let first = vault.save_edit("a.md").await.unwrap().unwrap();
        let body = std::fs::read_to_string(&doc).unwrap();
        std::fs::write(&doc, format!("{}two\n", body)).unwrap();
        vault.save_edit("a.md").await.unwrap().unwrap();

        let events = vault
            .get_or_generate_timeline(&first.note_id, None, HistorySource::Edit)
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].stats.additions, 1);
        assert_eq!(events[0].from_version_id.as_deref(), Some(first.edit_id.as_str()));
    }
}
