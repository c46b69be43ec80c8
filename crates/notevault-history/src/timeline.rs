//! Timeline: cached line diffs between adjacent history points.
//!
//! A cached event is reused only while it still links the same predecessor to
//! the same successor; anything else is recomputed for that pair alone.
//! Events pointing at history points that no longer exist are purged. Work
//! for one note is serialized on a FIFO lane.

use crate::db::{HistoryDb, SqlResultExt};
use crate::diff::line_changes;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notevault_core::prelude::*;
use rusqlite::params;
use std::collections::{HashMap, HashSet};
use tracing::instrument;

/// One point of a history (a version or an edit)
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPoint {
    pub id: String,
    pub version_number: u64,
    pub timestamp: DateTime<Utc>,
    pub name: Option<String>,
}

/// Supplies the history points of a branch and their content
#[async_trait]
pub trait TimelineProvider: Send + Sync {
    /// Points of a branch, in any order
    async fn history_points(&self, note_id: &str, branch: &str) -> Result<Vec<HistoryPoint>>;

    /// Content of one point, `None` if it is gone
    async fn content(&self, note_id: &str, branch: &str, point_id: &str) -> Result<Option<String>>;
}

/// Timeline event cache over the shared [`HistoryDb`]
pub struct TimelineStore {
    db: HistoryDb,
    queue: KeyedQueue,
}

impl TimelineStore {
    pub fn new(db: HistoryDb) -> Self {
        Self {
            db,
            queue: KeyedQueue::new(),
        }
    }

    /// Timeline of a branch, newest first
    #[instrument(skip(self, provider))]
    pub async fn get_or_generate_timeline(
        &self,
        note_id: &str,
        branch: &str,
        source: HistorySource,
        provider: &dyn TimelineProvider,
    ) -> Result<Vec<TimelineEvent>> {
        self.queue
            .run(note_id, || self.generate(note_id, branch, source, provider))
            .await
    }

    async fn generate(
        &self,
        note_id: &str,
        branch: &str,
        source: HistorySource,
        provider: &dyn TimelineProvider,
    ) -> Result<Vec<TimelineEvent>> {
        let mut points = provider.history_points(note_id, branch).await?;
        points.sort_by(|a, b| {
            a.version_number
                .cmp(&b.version_number)
                .then(a.timestamp.cmp(&b.timestamp))
        });

        let cached: HashMap<String, TimelineEvent> = self
            .cached_events(note_id, branch, source)
            .await?
            .into_iter()
            .map(|event| (event.to_version_id.clone(), event))
            .collect();
        let live: HashSet<&str> = points.iter().map(|p| p.id.as_str()).collect();
        let stale: Vec<String> = cached
            .keys()
            .filter(|id| !live.contains(id.as_str()))
            .cloned()
            .collect();

        let mut contents: HashMap<String, Option<String>> = HashMap::new();
        let mut events = Vec::with_capacity(points.len());
        let mut fresh = Vec::new();

        for (i, point) in points.iter().enumerate() {
            let previous = i.checked_sub(1).map(|j| &points[j]);
            let expected_from = previous.map(|p| p.id.clone());

            if let Some(event) = cached.get(&point.id)
                && event.from_version_id == expected_from
            {
                let mut event = event.clone();
                if event.name != point.name || event.to_version_number != point.version_number {
                    event.name = point.name.clone();
                    event.to_version_number = point.version_number;
                    fresh.push(event.clone());
                }
                events.push(event);
                continue;
            }

            let Some(after) = fetch(provider, note_id, branch, &point.id, &mut contents).await? else {
                log::warn!(
                    "No content for {} point {} of {}/{}; leaving it out of the timeline",
                    source,
                    point.id,
                    note_id,
                    branch
                );
                continue;
            };
            let before = match previous {
                Some(p) => fetch(provider, note_id, branch, &p.id, &mut contents)
                    .await?
                    .unwrap_or_default(),
                None => String::new(),
            };

            let diff_changes = line_changes(&before, &after);
            let event = TimelineEvent {
                note_id: note_id.to_string(),
                branch_name: branch.to_string(),
                source,
                from_version_id: expected_from,
                to_version_id: point.id.clone(),
                to_version_number: point.version_number,
                timestamp: point.timestamp,
                stats: DiffStats::of(&diff_changes),
                diff_changes,
                name: point.name.clone(),
            };
            fresh.push(event.clone());
            events.push(event);
        }

        if !stale.is_empty() || !fresh.is_empty() {
            log::debug!(
                "Timeline {}/{} ({}): {} recomputed, {} purged, {} reused",
                note_id,
                branch,
                source,
                fresh.len(),
                stale.len(),
                events.len().saturating_sub(fresh.len())
            );
            self.write_events(note_id, branch, source, stale, fresh).await?;
        }

        events.reverse();
        Ok(events)
    }

    /// Cached events of a branch as stored, oldest first
    pub async fn cached_events(
        &self,
        note_id: &str,
        branch: &str,
        source: HistorySource,
    ) -> Result<Vec<TimelineEvent>> {
        let (note_id, branch) = (note_id.to_string(), branch.to_string());
        self.db
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT to_version_id, event FROM timeline_events \
                         WHERE note_id = ?1 AND branch_name = ?2 AND source = ?3",
                    )
                    .sql()?;
                let rows = stmt
                    .query_map(params![note_id, branch, source.as_str()], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })
                    .sql()?;

                let mut events = Vec::new();
                for row in rows {
                    let (id, raw) = row.sql()?;
                    match serde_json::from_str::<TimelineEvent>(&raw) {
                        Ok(event) => events.push(event),
                        // Regenerated on the next pass
                        Err(e) => log::warn!("Dropping unreadable timeline event {}: {}", id, e),
                    }
                }
                events.sort_by_key(|e| e.to_version_number);
                Ok(events)
            })
            .await
    }

    async fn write_events(
        &self,
        note_id: &str,
        branch: &str,
        source: HistorySource,
        stale: Vec<String>,
        fresh: Vec<TimelineEvent>,
    ) -> Result<()> {
        let (note_id, branch) = (note_id.to_string(), branch.to_string());
        self.db
            .call(move |conn| {
                let tx = conn.transaction().sql()?;
                for id in &stale {
                    tx.execute(
                        "DELETE FROM timeline_events WHERE note_id = ?1 AND branch_name = ?2 \
                         AND source = ?3 AND to_version_id = ?4",
                        params![note_id, branch, source.as_str(), id],
                    )
                    .sql()?;
                }
                for event in &fresh {
                    tx.execute(
                        "INSERT INTO timeline_events (note_id, branch_name, source, to_version_id, event) \
                         VALUES (?1, ?2, ?3, ?4, ?5) \
                         ON CONFLICT(note_id, branch_name, source, to_version_id) \
                         DO UPDATE SET event = excluded.event",
                        params![
                            note_id,
                            branch,
                            source.as_str(),
                            event.to_version_id,
                            serde_json::to_string(event)?
                        ],
                    )
                    .sql()?;
                }
                tx.commit().sql()
            })
            .await
    }

    /// Drop every cached event of a note
    pub async fn clear_note(&self, note_id: &str) -> Result<usize> {
        let owned = note_id.to_string();
        self.queue
            .run(note_id, || {
                self.db.call(move |conn| {
                    conn.execute(
                        "DELETE FROM timeline_events WHERE note_id = ?1",
                        params![owned],
                    )
                    .sql()
                })
            })
            .await
    }

    /// Drop the cached events of one branch
    pub async fn clear_branch(&self, note_id: &str, branch: &str) -> Result<usize> {
        let (owned, branch) = (note_id.to_string(), branch.to_string());
        self.queue
            .run(note_id, || {
                self.db.call(move |conn| {
                    conn.execute(
                        "DELETE FROM timeline_events WHERE note_id = ?1 AND branch_name = ?2",
                        params![owned, branch],
                    )
                    .sql()
                })
            })
            .await
    }

    /// Re-key every cached event of a note
    pub async fn rename_note(&self, old_id: &str, new_id: &str) -> Result<()> {
        let (old, new) = (old_id.to_string(), new_id.to_string());
        self.queue
            .run(old_id, || {
                self.db.call(move |conn| {
                    let tx = conn.transaction().sql()?;
                    let rows: Vec<(String, String)> = {
                        let mut stmt = tx
                            .prepare("SELECT to_version_id, event FROM timeline_events WHERE note_id = ?1")
                            .sql()?;
                        stmt.query_map(params![old], |row| Ok((row.get(0)?, row.get(1)?)))
                            .sql()?
                            .collect::<rusqlite::Result<_>>()
                            .sql()?
                    };
                    tx.execute("DELETE FROM timeline_events WHERE note_id = ?1", params![old])
                        .sql()?;

                    for (id, raw) in rows {
                        let Ok(mut event) = serde_json::from_str::<TimelineEvent>(&raw) else {
                            log::warn!("Dropping unreadable timeline event {} during rename", id);
                            continue;
                        };
                        event.note_id = new.clone();
                        tx.execute(
                            "INSERT OR REPLACE INTO timeline_events \
                             (note_id, branch_name, source, to_version_id, event) \
                             VALUES (?1, ?2, ?3, ?4, ?5)",
                            params![
                                new,
                                event.branch_name,
                                event.source.as_str(),
                                event.to_version_id,
                                serde_json::to_string(&event)?
                            ],
                        )
                        .sql()?;
                    }
                    tx.commit().sql()
                })
            })
            .await
    }
}

/// Provider content, memoized for one generation pass
async fn fetch(
    provider: &dyn TimelineProvider,
    note_id: &str,
    branch: &str,
    point_id: &str,
    memo: &mut HashMap<String, Option<String>>,
) -> Result<Option<String>> {
    if let Some(content) = memo.get(point_id) {
        return Ok(content.clone());
    }
    let content = match provider.content(note_id, branch, point_id).await {
        Ok(content) => content,
        Err(e) if e.is_not_found() => None,
        Err(e) => {
            log::warn!("Unreadable history point {} of {}: {}", point_id, note_id, e);
            None
        }
    };
    memo.insert(point_id.to_string(), content.clone());
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory history that counts content fetches
    #[derive(Default)]
    struct FakeHistory {
        points: Mutex<BTreeMap<String, (HistoryPoint, String)>>,
        fetches: AtomicUsize,
    }

    impl FakeHistory {
        fn add(&self, id: &str, number: u64, content: &str) {
            let point = HistoryPoint {
                id: id.to_string(),
                version_number: number,
                timestamp: Utc::now(),
                name: None,
            };
            self.points
                .lock()
                .insert(id.to_string(), (point, content.to_string()));
        }

        fn remove(&self, id: &str) {
            self.points.lock().remove(id);
        }

        fn rename(&self, id: &str, name: &str) {
            if let Some((point, _)) = self.points.lock().get_mut(id) {
                point.name = Some(name.to_string());
            }
        }

        fn fetches(&self) -> usize {
            self.fetches.swap(0, Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TimelineProvider for FakeHistory {
        async fn history_points(&self, _note_id: &str, _branch: &str) -> Result<Vec<HistoryPoint>> {
            Ok(self.points.lock().values().map(|(p, _)| p.clone()).collect())
        }

        async fn content(&self, _note_id: &str, _branch: &str, point_id: &str) -> Result<Option<String>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.points.lock().get(point_id).map(|(_, c)| c.clone()))
        }
    }

    fn timeline() -> TimelineStore {
        TimelineStore::new(HistoryDb::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_generates_events_newest_first() {
        let store = timeline();
        let history = FakeHistory::default();
        history.add("v1", 1, "hello\n");
        history.add("v2", 2, "hello\nworld\n");

        let events = store
            .get_or_generate_timeline("n-1", "main", HistorySource::Version, &history)
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].to_version_id, "v2");
        assert_eq!(events[0].from_version_id.as_deref(), Some("v1"));
        assert_eq!(events[0].stats.additions, 1);
        assert_eq!(events[1].from_version_id, None);
        assert_eq!(events[1].stats.additions, 1);
    }

    #[tokio::test]
    async fn test_cached_events_are_reused() {
        let store = timeline();
        let history = FakeHistory::default();
        history.add("v1", 1, "a\n");
        history.add("v2", 2, "a\nb\n");
        store
            .get_or_generate_timeline("n-1", "main", HistorySource::Version, &history)
            .await
            .unwrap();
        assert!(history.fetches() > 0);

        store
            .get_or_generate_timeline("n-1", "main", HistorySource::Version, &history)
            .await
            .unwrap();
        assert_eq!(history.fetches(), 0);

        // Only the new pair is diffed
        history.add("v3", 3, "a\nb\nc\n");
        let events = store
            .get_or_generate_timeline("n-1", "main", HistorySource::Version, &history)
            .await
            .unwrap();
        assert_eq!(history.fetches(), 2);
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn test_gap_relinks_and_purges() {
        let store = timeline();
        let history = FakeHistory::default();
        history.add("v1", 1, "a\n");
        history.add("v2", 2, "a\nb\n");
        history.add("v3", 3, "a\nb\nc\n");
        store
            .get_or_generate_timeline("n-1", "main", HistorySource::Version, &history)
            .await
            .unwrap();

        history.remove("v2");
        let events = store
            .get_or_generate_timeline("n-1", "main", HistorySource::Version, &history)
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].from_version_id.as_deref(), Some("v1"));
        assert_eq!(events[0].stats.additions, 2);

        let cached = store
            .cached_events("n-1", "main", HistorySource::Version)
            .await
            .unwrap();
        assert!(cached.iter().all(|e| e.to_version_id != "v2"));
    }

    #[tokio::test]
    async fn test_name_change_refreshes_without_diffing() {
        let store = timeline();
        let history = FakeHistory::default();
        history.add("v1", 1, "a\n");
        store
            .get_or_generate_timeline("n-1", "main", HistorySource::Version, &history)
            .await
            .unwrap();
        history.fetches();

        history.rename("v1", "Draft");
        let events = store
            .get_or_generate_timeline("n-1", "main", HistorySource::Version, &history)
            .await
            .unwrap();
        assert_eq!(events[0].name.as_deref(), Some("Draft"));
        assert_eq!(history.fetches(), 0);
    }

    #[tokio::test]
    async fn test_sources_and_notes_are_isolated() {
        let store = timeline();
        let history = FakeHistory::default();
        history.add("v1", 1, "a\n");
        for source in [HistorySource::Version, HistorySource::Edit] {
            store
                .get_or_generate_timeline("n-1", "main", source, &history)
                .await
                .unwrap();
        }
        store
            .get_or_generate_timeline("n-2", "main", HistorySource::Version, &history)
            .await
            .unwrap();

        assert_eq!(store.clear_note("n-1").await.unwrap(), 2);
        assert_eq!(
            store
                .cached_events("n-2", "main", HistorySource::Version)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_rename_and_clear_branch() {
        let store = timeline();
        let history = FakeHistory::default();
        history.add("v1", 1, "a\n");
        for branch in ["main", "draft"] {
            store
                .get_or_generate_timeline("n-1", branch, HistorySource::Version, &history)
                .await
                .unwrap();
        }

        store.rename_note("n-1", "n-9").await.unwrap();
        let moved = store
            .cached_events("n-9", "main", HistorySource::Version)
            .await
            .unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].note_id, "n-9");

        assert_eq!(store.clear_branch("n-9", "draft").await.unwrap(), 1);
        assert_eq!(store.clear_note("n-1").await.unwrap(), 0);
    }
}
