//! File system capability consumed by the engine.
//!
//! The host application supplies the real implementation; [`LocalFs`] maps
//! every call onto `tokio::fs` for stand-alone use and tests.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

/// One entry returned by [`FileSystem::list_dir`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: String,
    pub path: PathBuf,
    pub is_dir: bool,
}

/// Path-level file operations the engine needs from its host
#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn exists(&self, path: &Path) -> bool;

    async fn read_to_string(&self, path: &Path) -> Result<String>;

    /// Create or truncate `path` with `contents`
    async fn write(&self, path: &Path, contents: &[u8]) -> Result<()>;

    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    async fn remove_file(&self, path: &Path) -> Result<()>;

    async fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Recursively delete a directory; missing directories are not an error
    async fn remove_dir_all(&self, path: &Path) -> Result<()>;

    async fn list_dir(&self, path: &Path) -> Result<Vec<DirEntryInfo>>;

    /// Size in bytes of a file
    async fn file_len(&self, path: &Path) -> Result<u64>;
}

/// [`FileSystem`] backed by the local disk
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

#[async_trait]
impl FileSystem for LocalFs {
    async fn exists(&self, path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    async fn read_to_string(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path)
            .await
            .map_err(|e| Error::io_at(path, e))
    }

    async fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        fs::write(path, contents)
            .await
            .map_err(|e| Error::io_at(path, e))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to).await.map_err(|e| Error::io_at(from, e))
    }

    async fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)
            .await
            .map_err(|e| Error::io_at(path, e))
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)
            .await
            .map_err(|e| Error::io_at(path, e))
    }

    async fn remove_dir_all(&self, path: &Path) -> Result<()> {
        match fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io_at(path, e)),
        }
    }

    async fn list_dir(&self, path: &Path) -> Result<Vec<DirEntryInfo>> {
        let mut reader = fs::read_dir(path).await.map_err(|e| Error::io_at(path, e))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(|e| Error::io_at(path, e))? {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| Error::io_at(entry.path(), e))?;
            entries.push(DirEntryInfo {
                name: entry.file_name().to_string_lossy().to_string(),
                path: entry.path(),
                is_dir: file_type.is_dir(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn file_len(&self, path: &Path) -> Result<u64> {
        fs::metadata(path)
            .await
            .map(|m| m.len())
            .map_err(|e| Error::io_at(path, e))
    }
}
