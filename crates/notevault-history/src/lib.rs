//! # NoteVault History
//!
//! Fine-grained edit history and the timeline cache, both kept in one
//! embedded SQLite database.
//!
//! - [`edits`] - diff-chain edit records with integrity verification
//! - [`timeline`] - cached diffs between adjacent history points
//! - [`diff`] - patch codec, gzip payloads, grouped line changes
//! - [`db`] - connection handling on the blocking pool
//!
//! ```no_run
//! use notevault_core::prelude::*;
//! use notevault_history::prelude::*;
//!
//! # async fn example() -> Result<()> {
//! let db = HistoryDb::open("/path/to/vault/.versiondb/edit-history.sqlite3")?;
//! let edits = EditHistoryStore::new(db.clone(), 10, 50);
//! let timeline = TimelineStore::new(db);
//!
//! edits.save_edit("meeting-1a2b3c4d", "notes/meeting.md", "main", "# Agenda\n").await?;
//! let events = timeline
//!     .get_or_generate_timeline("meeting-1a2b3c4d", "main", HistorySource::Edit, &edits)
//!     .await?;
//! println!("{} timeline events", events.len());
//! # Ok(())
//! # }
//! ```

pub mod db;
pub mod diff;
pub mod edits;
pub mod timeline;

pub use db::HistoryDb;
pub use diff::{PatchOp, line_changes};
pub use edits::{BranchIntegrityReport, ChainProblem, EditHistoryStore, EditIntegrity};
pub use timeline::{HistoryPoint, TimelineProvider, TimelineStore};

pub mod prelude {
    pub use crate::db::HistoryDb;
    pub use crate::edits::{BranchIntegrityReport, EditHistoryStore, EditIntegrity};
    pub use crate::timeline::{HistoryPoint, TimelineProvider, TimelineStore};
}
