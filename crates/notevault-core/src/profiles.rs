//! Pre-configured profiles for different deployment scenarios
//!
//! - Development: Verbose logging, frequent cleanup, small verification batches
//! - Production: Conservative retention, hourly cleanup
//! - Minimal: Snapshots only, no edit history, no periodic cleanup

use crate::config::VersionControlConfig;
use std::path::PathBuf;
use std::str::FromStr;

/// Profile selector for pre-configured deployments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigProfile {
    Development,
    Production,
    Minimal,
}

impl ConfigProfile {
    /// Create a config for `vault_root` from this profile
    pub fn create_config(self, vault_root: impl Into<PathBuf>) -> VersionControlConfig {
        let mut config = VersionControlConfig {
            vault_root: vault_root.into(),
            ..Default::default()
        };

        match self {
            Self::Development => {
                config.log_level = "DEBUG".to_string();
                config.cleanup_interval_secs = 300; // 5 minutes
                config.verification_batch_size = 10;
                config.default_settings.max_versions_per_branch = 0;
            }

            Self::Production => {
                config.log_level = "INFO".to_string();
                config.cleanup_interval_secs = 3600; // 1 hour
                config.verification_batch_size = 100;
                config.default_settings.max_versions_per_branch = 100;
                config.default_settings.auto_cleanup_old_versions = true;
                config.default_settings.auto_cleanup_days = 90;
            }

            Self::Minimal => {
                config.log_level = "WARN".to_string();
                config.cleanup_interval_secs = 0;
                config.default_settings.enable_edit_history = false;
            }
        }

        config
    }
}

impl FromStr for ConfigProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "minimal" => Ok(Self::Minimal),
            other => Err(format!("Unknown profile: {}", other)),
        }
    }
}
