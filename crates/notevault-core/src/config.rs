//! Configuration types for the versioning engine.
//!
//! Follows a builder pattern for complex configuration with validation.

use crate::error::{Error, Result};
use crate::models::GlobalSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the folder holding per-note data under the database root
pub const NOTES_DIR: &str = "db";

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionControlConfig {
    /// Root of the host vault; document paths are relative to it
    pub vault_root: PathBuf,
    /// Database root; relative paths resolve against `vault_root`
    pub db_root: PathBuf,
    /// File name of the central registry inside `db_root`
    pub central_manifest_file: String,
    /// File name of the edit-history database inside `db_root`
    pub edit_history_file: String,
    /// Metadata key carrying the note id
    pub note_id_key: String,
    /// Older metadata keys migrated to `note_id_key` on first read
    pub legacy_note_id_keys: Vec<String>,
    /// Seconds between periodic cleanup passes (0 = disabled)
    pub cleanup_interval_secs: u64,
    /// Edits verified per batch during full-branch verification
    pub verification_batch_size: usize,
    pub log_level: String,
    /// Seed for the registry's global settings on first run
    pub default_settings: GlobalSettings,
}

impl Default for VersionControlConfig {
    fn default() -> Self {
        Self {
            vault_root: PathBuf::from("."),
            db_root: PathBuf::from(".versiondb"),
            central_manifest_file: "central-manifest.json".to_string(),
            edit_history_file: "edit-history.sqlite3".to_string(),
            note_id_key: "vc-id".to_string(),
            legacy_note_id_keys: vec!["vc_id".to_string(), "version-control-id".to_string()],
            cleanup_interval_secs: 3600,
            verification_batch_size: 50,
            log_level: "INFO".to_string(),
            default_settings: GlobalSettings::default(),
        }
    }
}

impl VersionControlConfig {
    /// Create a new config with builder
    pub fn builder(vault_root: impl Into<PathBuf>) -> VersionControlConfigBuilder {
        VersionControlConfigBuilder::new(vault_root)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.note_id_key.trim().is_empty() {
            return Err(Error::config_error("Note id metadata key cannot be empty"));
        }
        if self.legacy_note_id_keys.contains(&self.note_id_key) {
            return Err(Error::config_error(
                "Note id key cannot also be listed as a legacy key",
            ));
        }
        if self.central_manifest_file.is_empty() || self.edit_history_file.is_empty() {
            return Err(Error::config_error("Database file names cannot be empty"));
        }
        if self.verification_batch_size == 0 {
            return Err(Error::config_error("Verification batch size must be > 0"));
        }
        if self.vault_root.exists() && !self.vault_root.is_dir() {
            return Err(Error::config_error(format!(
                "Vault root is not a directory: {}",
                self.vault_root.display()
            )));
        }
        Ok(())
    }

    /// Absolute database root (tilde-expanded, joined onto the vault root)
    pub fn db_dir(&self) -> PathBuf {
        let raw = self.db_root.to_string_lossy();
        let expanded = PathBuf::from(shellexpand::tilde(&raw).as_ref());
        if expanded.is_absolute() {
            expanded
        } else {
            self.vault_root.join(expanded)
        }
    }

    /// Folder holding one sub-folder per note
    pub fn notes_dir(&self) -> PathBuf {
        self.db_dir().join(NOTES_DIR)
    }

    pub fn central_manifest_path(&self) -> PathBuf {
        self.db_dir().join(&self.central_manifest_file)
    }

    pub fn edit_history_path(&self) -> PathBuf {
        self.db_dir().join(&self.edit_history_file)
    }

    /// Absolute path of a vault-relative document
    pub fn document_path(&self, note_path: &str) -> PathBuf {
        self.vault_root.join(Path::new(note_path))
    }
}

/// Builder for VersionControlConfig
pub struct VersionControlConfigBuilder {
    config: VersionControlConfig,
}

impl VersionControlConfigBuilder {
    /// Create a new builder
    pub fn new(vault_root: impl Into<PathBuf>) -> Self {
        Self {
            config: VersionControlConfig {
                vault_root: vault_root.into(),
                ..Default::default()
            },
        }
    }

    pub fn db_root(mut self, db_root: impl Into<PathBuf>) -> Self {
        self.config.db_root = db_root.into();
        self
    }

    pub fn note_id_key(mut self, key: impl Into<String>) -> Self {
        self.config.note_id_key = key.into();
        self
    }

    pub fn legacy_note_id_keys(mut self, keys: Vec<String>) -> Self {
        self.config.legacy_note_id_keys = keys;
        self
    }

    pub fn cleanup_interval_secs(mut self, secs: u64) -> Self {
        self.config.cleanup_interval_secs = secs;
        self
    }

    pub fn verification_batch_size(mut self, size: usize) -> Self {
        self.config.verification_batch_size = size;
        self
    }

    pub fn default_settings(mut self, settings: GlobalSettings) -> Self {
        self.config.default_settings = settings;
        self
    }

    /// Build and validate
    pub fn build(self) -> Result<VersionControlConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_builder_and_paths() {
        let temp = TempDir::new().unwrap();
        let config = VersionControlConfig::builder(temp.path())
            .db_root(".history")
            .build()
            .unwrap();

        assert_eq!(config.db_dir(), temp.path().join(".history"));
        assert_eq!(config.notes_dir(), temp.path().join(".history").join("db"));
        assert_eq!(
            config.central_manifest_path(),
            temp.path().join(".history/central-manifest.json")
        );
        assert_eq!(config.document_path("a/b.md"), temp.path().join("a/b.md"));
    }

    #[test]
    fn test_absolute_db_root_is_kept() {
        let temp = TempDir::new().unwrap();
        let elsewhere = TempDir::new().unwrap();
        let config = VersionControlConfig::builder(temp.path())
            .db_root(elsewhere.path())
            .build()
            .unwrap();
        assert_eq!(config.db_dir(), elsewhere.path());
    }

    #[test]
    fn test_validation_rejects_bad_keys() {
        let temp = TempDir::new().unwrap();
        assert!(
            VersionControlConfig::builder(temp.path())
                .note_id_key("")
                .build()
                .is_err()
        );
        assert!(
            VersionControlConfig::builder(temp.path())
                .legacy_note_id_keys(vec!["vc-id".to_string()])
                .build()
                .is_err()
        );
        assert!(
            VersionControlConfig::builder(temp.path())
                .verification_batch_size(0)
                .build()
                .is_err()
        );
    }
}
