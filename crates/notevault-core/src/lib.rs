//! # NoteVault Core
//!
//! Core data models, error types, configuration and host capability traits
//! for the note-versioning engine. Every other crate depends on this one.
//!
//! ## Architecture Principles
//!
//! - **Type-Driven Design**: strong types for manifests, branches and edits
//! - **Zero Panic in Libraries**: all errors are `Result<T, Error>`
//! - **Injected Host**: file access and document metadata go through traits
//! - **Builder Pattern for Configuration**: validated on build
//!
//! ## Core Modules
//!
//! - [`models`] - Registry, manifest, edit and timeline data types
//! - [`error`] - Error taxonomy and Result alias
//! - [`config`] - Engine configuration and on-disk layout
//! - [`profiles`] - Configuration presets
//! - [`fs`] - File system capability ([`FileSystem`], [`LocalFs`])
//! - [`metadata`] - Document metadata capability ([`DocumentMetadata`])
//! - [`queue`] - Per-key FIFO task serialization
//! - [`utils`] - Hashing, ids, path normalization, relevance tokens
//!
//! ## Usage Examples
//!
//! ```
//! use notevault_core::prelude::*;
//!
//! let mut manifest = NoteManifest::new("meeting-1a2b3c4d", "notes/meeting.md");
//! let number = manifest.current_branch_mut().push_version(
//!     generate_version_id(),
//!     VersionMeta {
//!         version_number: 0,
//!         timestamp: chrono::Utc::now(),
//!         name: None,
//!         tags: None,
//!         size: 5,
//!         content_hash: Some(compute_hash("hello")),
//!     },
//! );
//! assert_eq!(number, 1);
//! ```

pub mod config;
pub mod error;
pub mod fs;
pub mod metadata;
pub mod models;
pub mod profiles;
pub mod queue;
pub mod utils;

pub use config::*;
pub use error::{Error, Result};
pub use fs::{DirEntryInfo, FileSystem, LocalFs};
pub use metadata::{DocumentMetadata, FrontmatterMetadata, MetadataKeys};
pub use models::*;
pub use profiles::ConfigProfile;
pub use queue::KeyedQueue;
pub use utils::{
    RelevanceSource, RelevanceToken, compute_hash, generate_note_id, generate_version_id,
    normalize_note_path, validate_branch_name, validate_note_id,
};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::VersionControlConfig;
    pub use crate::error::{Error, Result};
    pub use crate::fs::{FileSystem, LocalFs};
    pub use crate::metadata::{DocumentMetadata, FrontmatterMetadata, MetadataKeys};
    pub use crate::models::{
        BranchData, BranchSettings, CentralManifest, DEFAULT_BRANCH, DiffChange, DiffChangeKind,
        DiffStats, EditRecord, GlobalSettings, HistorySource, NoteEntry, NoteManifest,
        StorageType, TimelineEvent, TimelineSettings, VersionMeta,
    };
    pub use crate::profiles::ConfigProfile;
    pub use crate::queue::KeyedQueue;
    pub use crate::utils::{
        RelevanceSource, RelevanceToken, compute_hash, generate_version_id, normalize_note_path,
    };
}
