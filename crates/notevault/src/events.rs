//! Event bus for history lifecycle changes.
//!
//! Registered [`HistoryEventHandler`]s are awaited in registration order as
//! part of the publishing operation; their failures are logged and never
//! propagate. Passive observers subscribe to a broadcast channel instead.

use async_trait::async_trait;
use notevault_core::Result;
use notevault_history::{EditHistoryStore, TimelineStore};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Capacity of the observer channel; slow observers miss the oldest events
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HistoryEvent {
    #[serde(rename_all = "camelCase")]
    NoteRegistered { note_id: String, note_path: String },
    #[serde(rename_all = "camelCase")]
    NoteDeleted { note_id: String },
    #[serde(rename_all = "camelCase")]
    NoteRenamed { old_id: String, new_id: String },
    #[serde(rename_all = "camelCase")]
    BranchDeleted { note_id: String, branch: String },
    #[serde(rename_all = "camelCase")]
    VersionSaved {
        note_id: String,
        branch: String,
        version_id: String,
        version_number: u64,
    },
    #[serde(rename_all = "camelCase")]
    DuplicatesResolved {
        note_path: String,
        winner: String,
        losers: Vec<String>,
    },
}

#[async_trait]
pub trait HistoryEventHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: &HistoryEvent) -> Result<()>;
}

pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn HistoryEventHandler>>>,
    sender: broadcast::Sender<HistoryEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            handlers: RwLock::new(Vec::new()),
            sender,
        }
    }

    pub fn register(&self, handler: Arc<dyn HistoryEventHandler>) {
        log::debug!("Registered history event handler {}", handler.name());
        self.handlers.write().push(handler);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HistoryEvent> {
        self.sender.subscribe()
    }

    /// Run every handler, then notify observers
    pub async fn publish(&self, event: HistoryEvent) {
        let handlers: Vec<_> = self.handlers.read().clone();
        for handler in handlers {
            if let Err(e) = handler.handle(&event).await {
                log::warn!("Handler {} failed on {:?}: {}", handler.name(), event, e);
            }
        }
        // No receivers is fine
        let _ = self.sender.send(event);
    }
}

/// Keeps the edit history and timeline cache in step with note lifecycle
pub struct HistoryPurgeHandler {
    edits: Arc<EditHistoryStore>,
    timeline: Arc<TimelineStore>,
}

impl HistoryPurgeHandler {
    pub fn new(edits: Arc<EditHistoryStore>, timeline: Arc<TimelineStore>) -> Self {
        Self { edits, timeline }
    }

    async fn purge_note(&self, note_id: &str) -> Result<()> {
        self.edits.delete_note_edits(note_id).await?;
        self.timeline.clear_note(note_id).await?;
        Ok(())
    }
}

#[async_trait]
impl HistoryEventHandler for HistoryPurgeHandler {
    fn name(&self) -> &str {
        "history-purge"
    }

    async fn handle(&self, event: &HistoryEvent) -> Result<()> {
        match event {
            HistoryEvent::NoteDeleted { note_id } => self.purge_note(note_id).await,
            HistoryEvent::DuplicatesResolved { losers, .. } => {
                for loser in losers {
                    self.purge_note(loser).await?;
                }
                Ok(())
            }
            HistoryEvent::BranchDeleted { note_id, branch } => {
                self.edits.delete_branch_edits(note_id, branch).await?;
                self.timeline.clear_branch(note_id, branch).await?;
                Ok(())
            }
            HistoryEvent::NoteRenamed { old_id, new_id } => {
                self.edits.rename_note(old_id, new_id).await?;
                self.timeline.rename_note(old_id, new_id).await
            }
            HistoryEvent::NoteRegistered { .. } | HistoryEvent::VersionSaved { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notevault_core::Error;
    use notevault_history::HistoryDb;
    use parking_lot::Mutex;

    struct Recorder {
        seen: Mutex<Vec<HistoryEvent>>,
        fail: bool,
    }

    #[async_trait]
    impl HistoryEventHandler for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn handle(&self, event: &HistoryEvent) -> Result<()> {
            self.seen.lock().push(event.clone());
            if self.fail {
                return Err(Error::other("boom"));
            }
            Ok(())
        }
    }

    fn deleted(id: &str) -> HistoryEvent {
        HistoryEvent::NoteDeleted {
            note_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_stop_others() {
        let bus = EventBus::new();
        let failing = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            fail: true,
        });
        let healthy = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            fail: false,
        });
        bus.register(failing.clone());
        bus.register(healthy.clone());
        let mut observer = bus.subscribe();

        bus.publish(deleted("n-1")).await;

        assert_eq!(failing.seen.lock().len(), 1);
        assert_eq!(healthy.seen.lock().as_slice(), &[deleted("n-1")]);
        assert_eq!(observer.recv().await.unwrap(), deleted("n-1"));
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(HistoryEvent::DuplicatesResolved {
            note_path: "a.md".into(),
            winner: "a-1".into(),
            losers: vec!["a-2".into()],
        })
        .unwrap();
        assert_eq!(json["type"], "duplicatesResolved");
        assert_eq!(json["notePath"], "a.md");
        assert_eq!(json["losers"][0], "a-2");
    }

    #[tokio::test]
    async fn test_purge_handler_removes_loser_history() {
        let db = HistoryDb::open_in_memory().unwrap();
        let edits = Arc::new(EditHistoryStore::new(db.clone(), 10, 50));
        let timeline = Arc::new(TimelineStore::new(db));
        edits.save_edit("keep", "a.md", "main", "one\n").await.unwrap();
        edits.save_edit("lose", "a.md", "main", "two\n").await.unwrap();

        let handler = HistoryPurgeHandler::new(edits.clone(), timeline);
        handler
            .handle(&HistoryEvent::DuplicatesResolved {
                note_path: "a.md".into(),
                winner: "keep".into(),
                losers: vec!["lose".into()],
            })
            .await
            .unwrap();

        assert!(edits.has_edits("keep").await.unwrap());
        assert!(!edits.has_edits("lose").await.unwrap());
    }
}
