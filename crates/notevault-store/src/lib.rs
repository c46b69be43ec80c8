//! # NoteVault Store
//!
//! Durable storage for the versioning engine: atomic record persistence, the
//! central registry, per-note manifests and snapshot content.
//!
//! ```no_run
//! use notevault_core::prelude::*;
//! use notevault_store::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<()> {
//! let config = VersionControlConfig::builder("/path/to/vault").build()?;
//! let store = AtomicStore::new(Arc::new(LocalFs));
//! let registry = CentralRegistry::new(
//!     config.central_manifest_path(),
//!     store.clone(),
//!     config.default_settings.clone(),
//! );
//! let notes = NoteHistoryStore::new(config.notes_dir(), store.clone());
//!
//! for (note_id, entry) in registry.all_entries().await? {
//!     if let Some(manifest) = notes.load(&note_id, false).await? {
//!         println!("{} ({}): {} versions", note_id, entry.note_path, manifest.version_count());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod atomic;
pub mod notes;
pub mod registry;
pub mod snapshots;

pub use atomic::{AtomicStore, ReadOutcome};
pub use notes::{MANIFEST_FILE, NoteHistoryStore, VERSIONS_DIR, manifest_rel_path};
pub use registry::CentralRegistry;
pub use snapshots::SnapshotStore;

pub mod prelude {
    pub use crate::atomic::AtomicStore;
    pub use crate::notes::{NoteHistoryStore, manifest_rel_path};
    pub use crate::registry::CentralRegistry;
    pub use crate::snapshots::SnapshotStore;
}
