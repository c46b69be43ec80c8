//! Snapshot content store: `<db-root>/db/<noteId>/versions/<versionId>.md`.
//!
//! Snapshots are write-once. A write goes to a temp name and is moved into
//! place so a reader never observes a partial snapshot.

use crate::atomic::AtomicStore;
use notevault_core::prelude::*;
use notevault_core::validate_note_id;
use std::path::PathBuf;
use std::sync::Arc;

const SNAPSHOT_EXTENSION: &str = "md";

pub struct SnapshotStore {
    notes_dir: PathBuf,
    store: AtomicStore,
}

impl SnapshotStore {
    pub fn new(notes_dir: impl Into<PathBuf>, store: AtomicStore) -> Self {
        Self {
            notes_dir: notes_dir.into(),
            store,
        }
    }

    fn fs(&self) -> &Arc<dyn FileSystem> {
        self.store.fs()
    }

    /// Path of a snapshot file
    pub fn path(&self, note_id: &str, version_id: &str) -> Result<PathBuf> {
        validate_note_id(note_id)?;
        validate_version_id(version_id)?;
        Ok(self
            .notes_dir
            .join(note_id)
            .join(crate::notes::VERSIONS_DIR)
            .join(format!("{}.{}", version_id, SNAPSHOT_EXTENSION)))
    }

    /// Store a snapshot, returning its size in bytes
    pub async fn write(&self, note_id: &str, version_id: &str, content: &str) -> Result<u64> {
        let path = self.path(note_id, version_id)?;
        self.store.write_bytes(&path, content.as_bytes()).await?;
        log::debug!("Wrote snapshot {}/{} ({} bytes)", note_id, version_id, content.len());
        Ok(content.len() as u64)
    }

    /// Snapshot content, `None` if it does not exist
    pub async fn read(&self, note_id: &str, version_id: &str) -> Result<Option<String>> {
        let path = self.path(note_id, version_id)?;
        match self.fs().read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn exists(&self, note_id: &str, version_id: &str) -> Result<bool> {
        Ok(self.fs().exists(&self.path(note_id, version_id)?).await)
    }

    /// Remove a snapshot; removing a missing one is not an error
    pub async fn delete(&self, note_id: &str, version_id: &str) -> Result<()> {
        let path = self.path(note_id, version_id)?;
        match self.fs().remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Version ids become file names
fn validate_version_id(version_id: &str) -> Result<()> {
    let valid = !version_id.is_empty()
        && version_id.len() <= 128
        && version_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(Error::validation(format!("Invalid version id: {:?}", version_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notevault_core::{LocalFs, generate_version_id};
    use tempfile::TempDir;

    fn snapshots(temp: &TempDir) -> SnapshotStore {
        SnapshotStore::new(temp.path().join("db"), AtomicStore::new(Arc::new(LocalFs)))
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let temp = TempDir::new().unwrap();
        let store = snapshots(&temp);
        let version_id = generate_version_id();

        let size = store.write("n-1", &version_id, "héllo").await.unwrap();
        assert_eq!(size, "héllo".len() as u64);
        assert_eq!(
            store.read("n-1", &version_id).await.unwrap().as_deref(),
            Some("héllo")
        );
        assert!(
            temp.path()
                .join("db/n-1/versions")
                .join(format!("{}.md", version_id))
                .exists()
        );

        store.delete("n-1", &version_id).await.unwrap();
        store.delete("n-1", &version_id).await.unwrap();
        assert_eq!(store.read("n-1", &version_id).await.unwrap(), None);
    }

    #[test]
    fn test_version_id_must_be_a_plain_file_name() {
        let temp = TempDir::new().unwrap();
        let store = snapshots(&temp);
        assert!(store.path("n-1", "../../etc").is_err());
        assert!(store.path("n-1", "").is_err());
        assert!(store.path("n-1", "1700000000000_ab12cd34").is_ok());
    }
}
