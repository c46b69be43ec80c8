//! Atomic record persistence with backup-and-restore.
//!
//! Writes follow: serialize -> write `<file>.tmp` -> move the current file to
//! `<file>.bak` -> move the temp file into place -> drop the backup. A failure
//! at any step puts the backup back if the target is now missing or empty, so
//! the target is always either the previous or the new record, never a torn
//! write.
//!
//! Reads repair leftovers of an interrupted write and quarantine unparseable
//! files under a timestamped `.corrupt-*` name, handing the caller its default
//! so one bad manifest cannot stall the rest of the note space.

use chrono::Utc;
use notevault_core::{Error, FileSystem, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Suffix of the in-flight temp file
const TEMP_SUFFIX: &str = ".tmp";
/// Suffix of the previous version kept during a replace
const BACKUP_SUFFIX: &str = ".bak";

/// Outcome of reading a record file
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome<T> {
    /// Parsed successfully
    Loaded(T),
    /// Neither the file nor a backup exists
    Missing,
    /// The file was unparseable and has been moved aside
    Quarantined { preserved_as: PathBuf },
}

impl<T> ReadOutcome<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Loaded(value) => Some(value),
            _ => None,
        }
    }
}

/// Crash-safe JSON record storage over a [`FileSystem`]
#[derive(Clone)]
pub struct AtomicStore {
    fs: Arc<dyn FileSystem>,
}

impl AtomicStore {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }

    /// Underlying file system
    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    /// Serialize `value` as pretty JSON and replace `path` atomically
    pub async fn write_json<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        self.write_bytes(path, json.as_bytes()).await
    }

    /// Replace `path` with `bytes` atomically
    pub async fn write_bytes(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            self.fs.create_dir_all(parent).await?;
        }

        let temp = sibling(path, TEMP_SUFFIX);
        let backup = sibling(path, BACKUP_SUFFIX);

        match self.replace(path, &temp, &backup, bytes).await {
            Ok(()) => {
                // The new record is committed; a leftover backup is swept on next read
                if self.fs.exists(&backup).await
                    && let Err(e) = self.fs.remove_file(&backup).await
                {
                    log::warn!("Could not remove backup {}: {}", backup.display(), e);
                }
                Ok(())
            }
            Err(e) => {
                self.recover_after_failed_write(path, &temp, &backup).await;
                Err(e)
            }
        }
    }

    async fn replace(&self, path: &Path, temp: &Path, backup: &Path, bytes: &[u8]) -> Result<()> {
        self.fs.write(temp, bytes).await?;
        if self.fs.exists(path).await {
            self.fs.rename(path, backup).await?;
        }
        self.fs.rename(temp, path).await
    }

    /// Best-effort rollback; never masks the original error
    async fn recover_after_failed_write(&self, path: &Path, temp: &Path, backup: &Path) {
        if self.fs.exists(backup).await && self.is_missing_or_empty(path).await {
            if self.fs.exists(path).await {
                let _ = self.fs.remove_file(path).await;
            }
            match self.fs.rename(backup, path).await {
                Ok(()) => log::info!("Restored {} from backup after failed write", path.display()),
                Err(e) => log::error!(
                    "Failed to restore {} from backup {}: {}",
                    path.display(),
                    backup.display(),
                    e
                ),
            }
        }
        if self.fs.exists(temp).await {
            let _ = self.fs.remove_file(temp).await;
        }
    }

    async fn is_missing_or_empty(&self, path: &Path) -> bool {
        if !self.fs.exists(path).await {
            return true;
        }
        matches!(self.fs.file_len(path).await, Ok(0))
    }

    /// Put back a backup left by an interrupted write, or drop a stale one
    async fn repair_leftovers(&self, path: &Path) -> Result<()> {
        let backup = sibling(path, BACKUP_SUFFIX);
        if !self.fs.exists(&backup).await {
            return Ok(());
        }

        if self.is_missing_or_empty(path).await {
            log::warn!(
                "Recovering {} from leftover backup {}",
                path.display(),
                backup.display()
            );
            if self.fs.exists(path).await {
                self.fs.remove_file(path).await?;
            }
            self.fs.rename(&backup, path).await?;
        } else {
            log::debug!("Removing stale backup {}", backup.display());
            self.fs.remove_file(&backup).await?;
        }
        Ok(())
    }

    /// Read and parse a record, repairing and quarantining as needed
    pub async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<ReadOutcome<T>> {
        self.repair_leftovers(path).await?;

        if !self.fs.exists(path).await {
            return Ok(ReadOutcome::Missing);
        }

        let content = match self.fs.read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.is_not_found() => return Ok(ReadOutcome::Missing),
            Err(e) => return Err(e),
        };

        match serde_json::from_str::<T>(&content) {
            Ok(value) => Ok(ReadOutcome::Loaded(value)),
            Err(parse_err) => {
                let preserved_as = sibling(
                    path,
                    &format!(".corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S%3f")),
                );
                log::warn!(
                    "Corrupt record {} ({}); preserving as {}",
                    path.display(),
                    parse_err,
                    preserved_as.display()
                );
                self.fs.rename(path, &preserved_as).await.map_err(|e| {
                    Error::corrupt(format!(
                        "Unparseable {} could not be preserved: {}",
                        path.display(),
                        e
                    ))
                })?;
                Ok(ReadOutcome::Quarantined { preserved_as })
            }
        }
    }

    /// Read a record, falling back to `default` when missing or corrupt
    pub async fn read_json_or_default<T, F>(&self, path: &Path, default: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: FnOnce() -> T,
    {
        Ok(self.read_json(path).await?.into_option().unwrap_or_else(default))
    }
}

/// `<path><suffix>` in the same directory
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use notevault_core::{DirEntryInfo, LocalFs};
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        generation: u32,
        payload: String,
    }

    /// Mutating step that [`FaultyFs`] can be told to fail
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum Step {
        WriteTemp,
        MoveToBackup,
        MoveIntoPlace,
        RemoveBackup,
    }

    /// LocalFs that fails the Nth occurrence of one step
    pub(crate) struct FaultyFs {
        inner: LocalFs,
        fail_at: Option<Step>,
        hits: AtomicUsize,
    }

    impl FaultyFs {
        pub(crate) fn failing(step: Step) -> Self {
            Self {
                inner: LocalFs,
                fail_at: Some(step),
                hits: AtomicUsize::new(0),
            }
        }

        fn trip(&self, step: Step) -> Result<()> {
            if self.fail_at == Some(step) {
                self.hits.fetch_add(1, Ordering::SeqCst);
                return Err(Error::io(std::io::Error::other(format!(
                    "injected failure at {:?}",
                    step
                ))));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl FileSystem for FaultyFs {
        async fn exists(&self, path: &Path) -> bool {
            self.inner.exists(path).await
        }
        async fn read_to_string(&self, path: &Path) -> Result<String> {
            self.inner.read_to_string(path).await
        }
        async fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
            if path.to_string_lossy().ends_with(TEMP_SUFFIX)
                && let Err(e) = self.trip(Step::WriteTemp)
            {
                // Torn temp write
                self.inner.write(path, &contents[..contents.len() / 2]).await?;
                return Err(e);
            }
            self.inner.write(path, contents).await
        }
        async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
            if to.to_string_lossy().ends_with(BACKUP_SUFFIX) {
                self.trip(Step::MoveToBackup)?;
            } else if from.to_string_lossy().ends_with(TEMP_SUFFIX) {
                self.trip(Step::MoveIntoPlace)?;
            }
            self.inner.rename(from, to).await
        }
        async fn remove_file(&self, path: &Path) -> Result<()> {
            if path.to_string_lossy().ends_with(BACKUP_SUFFIX) {
                self.trip(Step::RemoveBackup)?;
            }
            self.inner.remove_file(path).await
        }
        async fn create_dir_all(&self, path: &Path) -> Result<()> {
            self.inner.create_dir_all(path).await
        }
        async fn remove_dir_all(&self, path: &Path) -> Result<()> {
            self.inner.remove_dir_all(path).await
        }
        async fn list_dir(&self, path: &Path) -> Result<Vec<DirEntryInfo>> {
            self.inner.list_dir(path).await
        }
        async fn file_len(&self, path: &Path) -> Result<u64> {
            self.inner.file_len(path).await
        }
    }

    fn record(generation: u32) -> Record {
        Record {
            generation,
            payload: "x".repeat(64),
        }
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let temp = TempDir::new().unwrap();
        let store = AtomicStore::new(Arc::new(LocalFs));
        let path = temp.path().join("nested/manifest.json");

        store.write_json(&path, &record(1)).await.unwrap();
        let loaded: ReadOutcome<Record> = store.read_json(&path).await.unwrap();
        assert_eq!(loaded, ReadOutcome::Loaded(record(1)));

        // No temp or backup files left behind
        let names: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["manifest.json".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_returns_default() {
        let temp = TempDir::new().unwrap();
        let store = AtomicStore::new(Arc::new(LocalFs));
        let value = store
            .read_json_or_default(&temp.path().join("none.json"), || record(7))
            .await
            .unwrap();
        assert_eq!(value.generation, 7);
    }

    #[tokio::test]
    async fn test_injected_failures_never_leave_torn_record() {
        for step in [
            Step::WriteTemp,
            Step::MoveToBackup,
            Step::MoveIntoPlace,
            Step::RemoveBackup,
        ] {
            let temp = TempDir::new().unwrap();
            let path = temp.path().join("manifest.json");
            AtomicStore::new(Arc::new(LocalFs))
                .write_json(&path, &record(1))
                .await
                .unwrap();

            let faulty = AtomicStore::new(Arc::new(FaultyFs::failing(step)));
            let result = faulty.write_json(&path, &record(2)).await;
            if step == Step::RemoveBackup {
                assert!(result.is_ok(), "backup cleanup failure is not fatal");
            } else {
                assert!(result.is_err(), "{:?} should surface the error", step);
            }

            // Recovery happens on the next read through a healthy fs
            let healthy = AtomicStore::new(Arc::new(LocalFs));
            let loaded: Record = healthy
                .read_json_or_default(&path, || record(0))
                .await
                .unwrap();
            assert!(
                loaded.generation == 1 || loaded.generation == 2,
                "{:?} produced generation {}",
                step,
                loaded.generation
            );
            assert!(std::fs::metadata(&path).unwrap().len() > 0);
            assert!(!sibling(&path, BACKUP_SUFFIX).exists());
        }
    }

    #[tokio::test]
    async fn test_leftover_backup_restored_when_main_missing() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("central-manifest.json");
        let backup = sibling(&path, BACKUP_SUFFIX);
        std::fs::write(&backup, serde_json::to_string(&record(4)).unwrap()).unwrap();

        let store = AtomicStore::new(Arc::new(LocalFs));
        let loaded: Record = store.read_json_or_default(&path, || record(0)).await.unwrap();
        assert_eq!(loaded.generation, 4);
        assert!(path.exists());
        assert!(!backup.exists());
    }

    #[tokio::test]
    async fn test_leftover_backup_restored_when_main_empty() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("manifest.json");
        std::fs::write(&path, "").unwrap();
        std::fs::write(
            sibling(&path, BACKUP_SUFFIX),
            serde_json::to_string(&record(3)).unwrap(),
        )
        .unwrap();

        let store = AtomicStore::new(Arc::new(LocalFs));
        let loaded: Record = store.read_json_or_default(&path, || record(0)).await.unwrap();
        assert_eq!(loaded.generation, 3);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_quarantined() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("manifest.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = AtomicStore::new(Arc::new(LocalFs));
        let outcome: ReadOutcome<Record> = store.read_json(&path).await.unwrap();
        let ReadOutcome::Quarantined { preserved_as } = outcome else {
            panic!("expected quarantine, got {:?}", outcome);
        };
        assert!(!path.exists());
        assert_eq!(std::fs::read_to_string(&preserved_as).unwrap(), "{ not json");
        assert!(
            preserved_as
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("manifest.json.corrupt-")
        );

        // Default is handed back on the next read too
        let value = store.read_json_or_default(&path, || record(9)).await.unwrap();
        assert_eq!(value.generation, 9);
    }
}
