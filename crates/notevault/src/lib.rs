//! # NoteVault
//!
//! Note-versioning engine for a folder of markdown documents.
//!
//! A document is identified by a note id kept in its metadata. Each note has
//! named branches of full snapshots, an optional fine-grained edit history
//! stored as diff chains, and timelines of the changes between adjacent
//! points of either history.
//!
//! - [`vault`] - the [`NoteVault`] facade
//! - [`versions`] - snapshot versions, retention, export and comparison
//! - [`manifest`] - registry/manifest consistency and branches
//! - [`identity`] - note id assignment, copy and move detection
//! - [`cleanup`] - orphan recovery, eviction and duplicate consolidation
//! - [`events`] - lifecycle events and their handlers
//!
//! ```no_run
//! use notevault::prelude::*;
//!
//! # async fn example() -> notevault::Result<()> {
//! let config = VersionControlConfig::builder("/path/to/vault").build()?;
//! let vault = NoteVault::open(config).await?;
//!
//! let saved = vault
//!     .save_new_version_for_file("notes/meeting.md", SaveOptions::default())
//!     .await?;
//! for version in vault.get_version_history(saved.note_id()).await? {
//!     println!("#{} {}", version.version_number, version.id);
//! }
//! # Ok(())
//! # }
//! ```

pub mod cleanup;
pub mod events;
pub mod identity;
pub mod manifest;
pub mod vault;
pub mod versions;

pub use cleanup::{CleanupReport, CleanupService};
pub use events::{EventBus, HistoryEvent, HistoryEventHandler, HistoryPurgeHandler};
pub use identity::NoteIdentityResolver;
pub use manifest::{BranchRemoval, BranchSummary, DuplicateResolution, ManifestOrchestrator};
pub use notevault_core::{Error, Result};
pub use vault::NoteVault;
pub use versions::{
    ExportFormat, SaveOptions, SaveOutcome, SnapshotTimeline, VersionDeletion, VersionInfo,
    VersionService,
};

pub mod prelude {
    pub use crate::cleanup::CleanupReport;
    pub use crate::events::{HistoryEvent, HistoryEventHandler};
    pub use crate::manifest::BranchSummary;
    pub use crate::vault::NoteVault;
    pub use crate::versions::{ExportFormat, SaveOptions, SaveOutcome, VersionDeletion, VersionInfo};
    pub use notevault_core::prelude::*;
    pub use notevault_history::BranchIntegrityReport;
}
