//! Fine-grained edit history stored as diff chains.
//!
//! Each `(note, branch)` holds a chain of [`EditRecord`]s. A record is either
//! a full copy of the content or a patch against its predecessor; every
//! chain ends at a full record. Reconstruction walks back to the nearest full
//! record, replays patches forward and checks the SHA-256 of the result.
//!
//! A per-note [`NoteManifest`] (edit ids in place of version ids) lives in the
//! same database and is updated in the same transaction as the records.

use crate::db::{HistoryDb, SqlResultExt};
use crate::diff::{apply_patch, compress, decode_patch, decompress, decompress_text, encode_patch, make_patch};
use crate::timeline::{HistoryPoint, TimelineProvider};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notevault_core::prelude::*;
use notevault_core::{generate_version_id, validate_branch_name, validate_note_id};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::instrument;

const EDIT_COLUMNS: &str = "edit_id, note_id, branch_name, version_number, storage_type, \
     previous_edit_id, content_hash, compressed_size, uncompressed_size, timestamp, payload";

/// Result of re-hashing one edit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditIntegrity {
    Valid,
    /// Stored hash disagrees with the reconstructed content
    Mismatch { expected: String, actual: String },
    /// Mismatch found and the stored hash rewritten
    Repaired { previous: String, actual: String },
    /// The chain could not be replayed
    Unreadable { reason: String },
}

impl EditIntegrity {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid | Self::Repaired { .. })
    }
}

/// A structural defect in a branch's chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainProblem {
    pub edit_id: String,
    pub reason: String,
}

/// Outcome of verifying every edit of a branch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchIntegrityReport {
    pub checked: usize,
    pub valid: usize,
    pub repaired: Vec<String>,
    pub mismatched: Vec<String>,
    pub unreadable: Vec<(String, String)>,
}

impl BranchIntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.mismatched.is_empty() && self.unreadable.is_empty()
    }
}

/// Stored edit: metadata plus its compressed payload
#[derive(Debug, Clone)]
struct EditRow {
    record: EditRecord,
    payload: Vec<u8>,
}

/// Column values as SQLite hands them back
struct RawEdit {
    edit_id: String,
    note_id: String,
    branch_name: String,
    version_number: i64,
    storage_type: String,
    previous_edit_id: Option<String>,
    content_hash: String,
    compressed_size: i64,
    uncompressed_size: i64,
    timestamp: String,
    payload: Vec<u8>,
}

impl RawEdit {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            edit_id: row.get(0)?,
            note_id: row.get(1)?,
            branch_name: row.get(2)?,
            version_number: row.get(3)?,
            storage_type: row.get(4)?,
            previous_edit_id: row.get(5)?,
            content_hash: row.get(6)?,
            compressed_size: row.get(7)?,
            uncompressed_size: row.get(8)?,
            timestamp: row.get(9)?,
            payload: row.get(10)?,
        })
    }

    fn into_row(self) -> Result<EditRow> {
        let storage_type = StorageType::from_db_str(&self.storage_type).ok_or_else(|| {
            Error::corrupt(format!(
                "Edit {} has unknown storage type {:?}",
                self.edit_id, self.storage_type
            ))
        })?;
        let timestamp = parse_timestamp(&self.timestamp)?;
        Ok(EditRow {
            record: EditRecord {
                edit_id: self.edit_id,
                note_id: self.note_id,
                branch_name: self.branch_name,
                version_number: self.version_number.max(0) as u64,
                storage_type,
                previous_edit_id: self.previous_edit_id,
                content_hash: self.content_hash,
                compressed_size: self.compressed_size.max(0) as u64,
                uncompressed_size: self.uncompressed_size.max(0) as u64,
                timestamp,
            },
            payload: self.payload,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::corrupt(format!("Invalid timestamp {:?}: {}", raw, e)))
}

// ==================== Row helpers (run inside `HistoryDb::call`) ====================

fn fetch_edit(conn: &Connection, note_id: &str, branch: &str, edit_id: &str) -> Result<Option<EditRow>> {
    let sql = format!(
        "SELECT {} FROM edits WHERE note_id = ?1 AND branch_name = ?2 AND edit_id = ?3",
        EDIT_COLUMNS
    );
    conn.query_row(&sql, params![note_id, branch, edit_id], RawEdit::from_row)
        .optional()
        .sql()?
        .map(RawEdit::into_row)
        .transpose()
}

fn fetch_branch_records(conn: &Connection, note_id: &str, branch: &str) -> Result<Vec<EditRecord>> {
    let sql = format!(
        "SELECT {} FROM edits WHERE note_id = ?1 AND branch_name = ?2 ORDER BY version_number, timestamp",
        EDIT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).sql()?;
    let rows = stmt
        .query_map(params![note_id, branch], RawEdit::from_row)
        .sql()?;
    let mut records = Vec::new();
    for raw in rows {
        records.push(raw.sql()?.into_row()?.record);
    }
    Ok(records)
}

fn insert_edit(conn: &Connection, record: &EditRecord, payload: &[u8]) -> Result<()> {
    conn.execute(
        "INSERT INTO edits (edit_id, note_id, branch_name, version_number, storage_type, \
         previous_edit_id, content_hash, compressed_size, uncompressed_size, timestamp, payload) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            record.edit_id,
            record.note_id,
            record.branch_name,
            record.version_number as i64,
            record.storage_type.as_str(),
            record.previous_edit_id,
            record.content_hash,
            record.compressed_size as i64,
            record.uncompressed_size as i64,
            record.timestamp.to_rfc3339(),
            payload,
        ],
    )
    .sql()?;
    Ok(())
}

fn delete_row(conn: &Connection, note_id: &str, branch: &str, edit_id: &str) -> Result<bool> {
    let removed = conn
        .execute(
            "DELETE FROM edits WHERE note_id = ?1 AND branch_name = ?2 AND edit_id = ?3",
            params![note_id, branch, edit_id],
        )
        .sql()?;
    Ok(removed > 0)
}

/// Turn a record into a self-contained full record holding `content`
fn rewrite_as_full(conn: &Connection, record: &EditRecord, content: &str) -> Result<()> {
    let payload = compress(content.as_bytes())?;
    conn.execute(
        "UPDATE edits SET storage_type = ?1, previous_edit_id = NULL, payload = ?2, \
         compressed_size = ?3, uncompressed_size = ?4 \
         WHERE note_id = ?5 AND branch_name = ?6 AND edit_id = ?7",
        params![
            StorageType::Full.as_str(),
            payload,
            payload.len() as i64,
            content.len() as i64,
            record.note_id,
            record.branch_name,
            record.edit_id,
        ],
    )
    .sql()?;
    Ok(())
}

fn load_manifest(conn: &Connection, note_id: &str) -> Result<Option<NoteManifest>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT manifest FROM manifests WHERE note_id = ?1",
            params![note_id],
            |row| row.get(0),
        )
        .optional()
        .sql()?;
    let Some(raw) = raw else {
        return rebuild_manifest(conn, note_id);
    };
    match serde_json::from_str::<NoteManifest>(&raw) {
        Ok(manifest) => Ok(Some(manifest)),
        Err(e) => {
            log::warn!("Edit manifest of {} is unreadable ({}); rebuilding from records", note_id, e);
            rebuild_manifest(conn, note_id)
        }
    }
}

/// Derive a manifest from the stored records alone
fn rebuild_manifest(conn: &Connection, note_id: &str) -> Result<Option<NoteManifest>> {
    let mut stmt = conn
        .prepare("SELECT DISTINCT branch_name FROM edits WHERE note_id = ?1 ORDER BY branch_name")
        .sql()?;
    let branches = stmt
        .query_map(params![note_id], |row| row.get::<_, String>(0))
        .sql()?
        .collect::<rusqlite::Result<Vec<_>>>()
        .sql()?;
    if branches.is_empty() {
        return Ok(None);
    }

    let mut manifest = NoteManifest::new(note_id, "");
    manifest.branches.clear();
    for branch in &branches {
        let mut data = BranchData::default();
        for record in fetch_branch_records(conn, note_id, branch)? {
            data.total_versions = data.total_versions.max(record.version_number);
            data.versions.insert(record.edit_id.clone(), meta_for(&record));
        }
        manifest.branches.insert(branch.clone(), data);
    }
    if !manifest.branches.contains_key(&manifest.current_branch) {
        manifest.current_branch = branches[0].clone();
    }
    Ok(Some(manifest))
}

fn store_manifest(conn: &Connection, manifest: &NoteManifest) -> Result<()> {
    conn.execute(
        "INSERT INTO manifests (note_id, manifest) VALUES (?1, ?2) \
         ON CONFLICT(note_id) DO UPDATE SET manifest = excluded.manifest",
        params![manifest.note_id, serde_json::to_string(manifest)?],
    )
    .sql()?;
    Ok(())
}

fn delete_manifest(conn: &Connection, note_id: &str) -> Result<()> {
    conn.execute("DELETE FROM manifests WHERE note_id = ?1", params![note_id])
        .sql()?;
    Ok(())
}

/// Drop an edit from the manifest; the branch keeps its numbering
fn forget_in_manifest(conn: &Connection, note_id: &str, branch: &str, edit_id: &str) -> Result<()> {
    if let Some(mut manifest) = load_manifest(conn, note_id)? {
        if let Some(data) = manifest.branch_mut(branch) {
            data.versions.remove(edit_id);
        }
        manifest.touch();
        store_manifest(conn, &manifest)?;
    }
    Ok(())
}

fn meta_for(record: &EditRecord) -> VersionMeta {
    VersionMeta {
        version_number: record.version_number,
        timestamp: record.timestamp,
        name: None,
        tags: None,
        size: record.uncompressed_size,
        content_hash: Some(record.content_hash.clone()),
    }
}

/// Replay the chain ending at `edit_id`. The result is not hash-checked.
fn reconstruct(conn: &Connection, note_id: &str, branch: &str, edit_id: &str) -> Result<(String, EditRow)> {
    let target = fetch_edit(conn, note_id, branch, edit_id)?
        .ok_or_else(|| Error::not_found(format!("edit {}/{}/{}", note_id, branch, edit_id)))?;

    // Walk back to the nearest full record
    let mut chain: Vec<EditRow> = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut current = target.clone();
    loop {
        if !visited.insert(current.record.edit_id.clone()) {
            return Err(Error::corrupt(format!(
                "Edit chain of {} loops at {}",
                edit_id, current.record.edit_id
            )));
        }
        match current.record.storage_type {
            StorageType::Full => {
                chain.push(current);
                break;
            }
            StorageType::Diff => {
                let previous_id = current.record.previous_edit_id.clone().ok_or_else(|| {
                    Error::corrupt(format!(
                        "Diff edit {} has no predecessor",
                        current.record.edit_id
                    ))
                })?;
                let previous = fetch_edit(conn, note_id, branch, &previous_id)?.ok_or_else(|| {
                    Error::corrupt(format!(
                        "Edit {} references missing predecessor {}",
                        current.record.edit_id, previous_id
                    ))
                })?;
                chain.push(current);
                current = previous;
            }
        }
    }

    // Replay forward from the full record
    let mut rows = chain.into_iter().rev();
    let base = rows
        .next()
        .ok_or_else(|| Error::corrupt(format!("Empty edit chain for {}", edit_id)))?;
    let mut content = decompress_text(&base.payload)?;
    for row in rows {
        let patch = decode_patch(&decompress(&row.payload)?)?;
        content = apply_patch(&content, &patch).map_err(|e| {
            Error::corrupt(format!("Edit {} does not apply: {}", row.record.edit_id, e))
        })?;
    }
    Ok((content, target))
}

/// Chain defects of one branch without replaying any payload
fn chain_problems(conn: &Connection, note_id: &str, branch: &str) -> Result<Vec<ChainProblem>> {
    let mut stmt = conn
        .prepare(
            "SELECT edit_id, storage_type, previous_edit_id FROM edits \
             WHERE note_id = ?1 AND branch_name = ?2",
        )
        .sql()?;
    let links: HashMap<String, (String, Option<String>)> = stmt
        .query_map(params![note_id, branch], |row| {
            Ok((row.get::<_, String>(0)?, (row.get(1)?, row.get(2)?)))
        })
        .sql()?
        .collect::<rusqlite::Result<_>>()
        .sql()?;

    // Ids known to reach a full record
    let mut grounded: HashSet<String> = HashSet::new();
    let mut problems = Vec::new();
    let mut ids: Vec<&String> = links.keys().collect();
    ids.sort();

    for id in ids {
        let mut path: Vec<String> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut current = id.as_str();
        let outcome: std::result::Result<(), String> = loop {
            if grounded.contains(current) {
                break Ok(());
            }
            if !seen.insert(current) {
                break Err(format!("chain loops at {}", current));
            }
            let Some((kind, previous)) = links.get(current) else {
                break Err(format!("missing predecessor {}", current));
            };
            path.push(current.to_string());
            match (StorageType::from_db_str(kind), previous) {
                (Some(StorageType::Full), _) => break Ok(()),
                (Some(StorageType::Diff), Some(previous)) => current = previous.as_str(),
                (Some(StorageType::Diff), None) => break Err(format!("diff edit {} has no predecessor", current)),
                (None, _) => break Err(format!("unknown storage type {:?}", kind)),
            }
        };
        match outcome {
            Ok(()) => grounded.extend(path),
            Err(reason) => problems.push(ChainProblem {
                edit_id: id.clone(),
                reason,
            }),
        }
    }
    Ok(problems)
}

fn branches_with_edits(conn: &Connection, note_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT DISTINCT branch_name FROM edits WHERE note_id = ?1 ORDER BY branch_name")
        .sql()?;
    stmt.query_map(params![note_id], |row| row.get(0))
        .sql()?
        .collect::<rusqlite::Result<Vec<String>>>()
        .sql()
}

// ==================== Store ====================

/// Edit-history store over the shared [`HistoryDb`]
pub struct EditHistoryStore {
    db: HistoryDb,
    full_snapshot_interval: AtomicU32,
    verification_batch_size: usize,
}

impl EditHistoryStore {
    pub fn new(db: HistoryDb, full_snapshot_interval: u32, verification_batch_size: usize) -> Self {
        Self {
            db,
            full_snapshot_interval: AtomicU32::new(full_snapshot_interval),
            verification_batch_size: verification_batch_size.max(1),
        }
    }

    pub fn db(&self) -> &HistoryDb {
        &self.db
    }

    /// Every Nth edit of a branch is stored in full (0 or 1 = always)
    pub fn set_full_snapshot_interval(&self, interval: u32) {
        self.full_snapshot_interval.store(interval, Ordering::Relaxed);
    }

    pub fn full_snapshot_interval(&self) -> u32 {
        self.full_snapshot_interval.load(Ordering::Relaxed)
    }

    /// Record `content` as the new head of `branch`.
    ///
    /// Returns `None` when the content equals the current head.
    #[instrument(skip(self, content), fields(bytes = content.len()))]
    pub async fn save_edit(
        &self,
        note_id: &str,
        note_path: &str,
        branch: &str,
        content: &str,
    ) -> Result<Option<EditRecord>> {
        validate_note_id(note_id)?;
        validate_branch_name(branch)?;
        let interval = u64::from(self.full_snapshot_interval());
        let (note_id, note_path, branch, content) = (
            note_id.to_string(),
            note_path.to_string(),
            branch.to_string(),
            content.to_string(),
        );

        let saved = self
            .db
            .call(move |conn| {
                let tx = conn.transaction().sql()?;
                let mut manifest = load_manifest(&tx, &note_id)?
                    .unwrap_or_else(|| NoteManifest::new(&note_id, &note_path));
                manifest.note_path = note_path;
                let content_hash = compute_hash(&content);

                let head = manifest
                    .branch(&branch)
                    .and_then(|data| data.latest())
                    .map(|(id, meta)| (id.clone(), meta.content_hash.clone()));
                if let Some((_, Some(head_hash))) = &head
                    && *head_hash == content_hash
                {
                    return Ok(None);
                }
                let head_content = match &head {
                    Some((head_id, _)) => match reconstruct(&tx, &note_id, &branch, head_id) {
                        Ok((text, _)) => Some((head_id.clone(), text)),
                        Err(e) => {
                            log::warn!("Head edit {} unreadable, storing a full record: {}", head_id, e);
                            None
                        }
                    },
                    None => None,
                };
                if head_content.as_ref().is_some_and(|(_, text)| *text == content) {
                    return Ok(None);
                }

                let data = manifest.branches.entry(branch.clone()).or_default();
                let version_number = data.next_version_number();
                let full_payload = compress(content.as_bytes())?;
                let periodic_full = interval <= 1 || version_number % interval == 1;

                let (storage_type, previous_edit_id, payload) = match head_content {
                    Some((head_id, head_text)) if !periodic_full => {
                        let patch = compress(&encode_patch(&make_patch(&head_text, &content))?)?;
                        if patch.len() < full_payload.len() {
                            (StorageType::Diff, Some(head_id), patch)
                        } else {
                            (StorageType::Full, None, full_payload)
                        }
                    }
                    _ => (StorageType::Full, None, full_payload),
                };

                let record = EditRecord {
                    edit_id: generate_version_id(),
                    note_id: note_id.clone(),
                    branch_name: branch.clone(),
                    version_number,
                    storage_type,
                    previous_edit_id,
                    content_hash,
                    compressed_size: payload.len() as u64,
                    uncompressed_size: content.len() as u64,
                    timestamp: Utc::now(),
                };
                insert_edit(&tx, &record, &payload)?;
                data.push_version(record.edit_id.clone(), meta_for(&record));
                manifest.touch();
                store_manifest(&tx, &manifest)?;
                tx.commit().sql()?;
                Ok(Some(record))
            })
            .await?;

        if let Some(record) = &saved {
            log::debug!(
                "Saved edit {} #{} of {}/{} as {} ({} -> {} bytes)",
                record.edit_id,
                record.version_number,
                record.note_id,
                record.branch_name,
                record.storage_type.as_str(),
                record.uncompressed_size,
                record.compressed_size
            );
        }
        Ok(saved)
    }

    /// Reconstructed content of an edit, verified against its stored hash
    #[instrument(skip(self))]
    pub async fn get_edit_content(&self, note_id: &str, branch: &str, edit_id: &str) -> Result<String> {
        let (note_id, branch, edit_id) = (note_id.to_string(), branch.to_string(), edit_id.to_string());
        self.db
            .call(move |conn| {
                let (content, row) = reconstruct(conn, &note_id, &branch, &edit_id)?;
                let actual = compute_hash(&content);
                if actual != row.record.content_hash {
                    return Err(Error::corrupt(format!(
                        "Edit {} failed its integrity check (stored {}, computed {})",
                        edit_id, row.record.content_hash, actual
                    )));
                }
                Ok(content)
            })
            .await
    }

    pub async fn get_edit_manifest(&self, note_id: &str) -> Result<Option<NoteManifest>> {
        let note_id = note_id.to_string();
        self.db.call(move |conn| load_manifest(conn, &note_id)).await
    }

    pub async fn save_edit_manifest(&self, manifest: &NoteManifest) -> Result<()> {
        validate_note_id(&manifest.note_id)?;
        let manifest = manifest.clone();
        self.db.call(move |conn| store_manifest(conn, &manifest)).await
    }

    /// Records of a branch, oldest first
    pub async fn list_edits(&self, note_id: &str, branch: &str) -> Result<Vec<EditRecord>> {
        let (note_id, branch) = (note_id.to_string(), branch.to_string());
        self.db
            .call(move |conn| fetch_branch_records(conn, &note_id, &branch))
            .await
    }

    pub async fn has_edits(&self, note_id: &str) -> Result<bool> {
        let note_id = note_id.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM edits WHERE note_id = ?1)",
                    params![note_id],
                    |row| row.get(0),
                )
                .sql()
            })
            .await
    }

    /// Re-hash one edit; with `fix`, a mismatching stored hash is rewritten
    #[instrument(skip(self))]
    pub async fn verify_edit_integrity(
        &self,
        note_id: &str,
        branch: &str,
        edit_id: &str,
        fix: bool,
    ) -> Result<EditIntegrity> {
        let (note_id, branch, edit_id) = (note_id.to_string(), branch.to_string(), edit_id.to_string());
        self.db
            .call(move |conn| {
                let tx = conn.transaction().sql()?;
                let (content, row) = match reconstruct(&tx, &note_id, &branch, &edit_id) {
                    Ok(found) => found,
                    Err(e) if e.is_not_found() => return Err(e),
                    Err(e) => {
                        return Ok(EditIntegrity::Unreadable {
                            reason: e.to_string(),
                        });
                    }
                };

                let actual = compute_hash(&content);
                let expected = row.record.content_hash.clone();
                if actual == expected {
                    return Ok(EditIntegrity::Valid);
                }
                if !fix {
                    return Ok(EditIntegrity::Mismatch { expected, actual });
                }

                tx.execute(
                    "UPDATE edits SET content_hash = ?1, uncompressed_size = ?2 \
                     WHERE note_id = ?3 AND branch_name = ?4 AND edit_id = ?5",
                    params![actual, content.len() as i64, note_id, branch, edit_id],
                )
                .sql()?;
                if let Some(mut manifest) = load_manifest(&tx, &note_id)?
                    && let Some(meta) = manifest
                        .branch_mut(&branch)
                        .and_then(|data| data.versions.get_mut(&edit_id))
                {
                    meta.content_hash = Some(actual.clone());
                    meta.size = content.len() as u64;
                    store_manifest(&tx, &manifest)?;
                }
                tx.commit().sql()?;
                log::warn!("Repaired content hash of edit {}/{}/{}", note_id, branch, edit_id);
                Ok(EditIntegrity::Repaired {
                    previous: expected,
                    actual,
                })
            })
            .await
    }

    /// Structural problems of a branch's chains
    pub async fn chain_problems(&self, note_id: &str, branch: &str) -> Result<Vec<ChainProblem>> {
        let (note_id, branch) = (note_id.to_string(), branch.to_string());
        self.db
            .call(move |conn| chain_problems(conn, &note_id, &branch))
            .await
    }

    /// Every diff record links back to a full record, without cycles
    pub async fn verify_chain_consistency(&self, note_id: &str, branch: &str) -> Result<bool> {
        let problems = self.chain_problems(note_id, branch).await?;
        for problem in &problems {
            log::warn!(
                "Chain problem in {}/{} at {}: {}",
                note_id,
                branch,
                problem.edit_id,
                problem.reason
            );
        }
        Ok(problems.is_empty())
    }

    /// Chain consistency of every branch that has edits
    pub async fn verify_all_chains(&self, note_id: &str) -> Result<BTreeMap<String, bool>> {
        let owned = note_id.to_string();
        let branches = self
            .db
            .call(move |conn| branches_with_edits(conn, &owned))
            .await?;
        let mut report = BTreeMap::new();
        for branch in branches {
            let consistent = self.verify_chain_consistency(note_id, &branch).await?;
            report.insert(branch, consistent);
        }
        Ok(report)
    }

    /// Verify every edit of a branch in bounded batches.
    ///
    /// Returns `None` if `token` expired before the scan finished; repairs
    /// of a batch are only applied while the token is still relevant.
    #[instrument(skip(self, token))]
    pub async fn verify_branch_integrity(
        &self,
        note_id: &str,
        branch: &str,
        fix: bool,
        token: &RelevanceToken,
    ) -> Result<Option<BranchIntegrityReport>> {
        let ids: Vec<String> = self
            .list_edits(note_id, branch)
            .await?
            .into_iter()
            .map(|record| record.edit_id)
            .collect();
        let mut report = BranchIntegrityReport::default();

        for batch in ids.chunks(self.verification_batch_size) {
            let mut mismatched = Vec::new();
            for edit_id in batch {
                let status = match self.verify_edit_integrity(note_id, branch, edit_id, false).await {
                    Ok(status) => status,
                    // Deleted while we were scanning
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Err(e),
                };
                report.checked += 1;
                match status {
                    EditIntegrity::Valid => report.valid += 1,
                    EditIntegrity::Mismatch { .. } => mismatched.push(edit_id.clone()),
                    EditIntegrity::Unreadable { reason } => {
                        report.unreadable.push((edit_id.clone(), reason))
                    }
                    EditIntegrity::Repaired { .. } => report.repaired.push(edit_id.clone()),
                }
            }

            if !token.is_relevant() {
                log::debug!("Abandoning verification of {}/{}", note_id, branch);
                return Ok(None);
            }

            for edit_id in mismatched {
                if !fix {
                    report.mismatched.push(edit_id);
                    continue;
                }
                match self.verify_edit_integrity(note_id, branch, &edit_id, true).await? {
                    EditIntegrity::Repaired { .. } => report.repaired.push(edit_id),
                    EditIntegrity::Valid => report.valid += 1,
                    _ => report.mismatched.push(edit_id),
                }
            }

            tokio::task::yield_now().await;
        }

        if !token.is_relevant() {
            return Ok(None);
        }
        log::info!(
            "Verified {} edits of {}/{}: {} valid, {} repaired, {} mismatched, {} unreadable",
            report.checked,
            note_id,
            branch,
            report.valid,
            report.repaired.len(),
            report.mismatched.len(),
            report.unreadable.len()
        );
        Ok(Some(report))
    }

    /// Delete an edit, first turning its direct dependents into full records
    #[instrument(skip(self))]
    pub async fn delete_edit(&self, note_id: &str, branch: &str, edit_id: &str) -> Result<bool> {
        let (note_id, branch, edit_id) = (note_id.to_string(), branch.to_string(), edit_id.to_string());
        self.db
            .call(move |conn| {
                let tx = conn.transaction().sql()?;
                if fetch_edit(&tx, &note_id, &branch, &edit_id)?.is_none() {
                    return Ok(false);
                }

                let dependents: Vec<String> = {
                    let mut stmt = tx
                        .prepare(
                            "SELECT edit_id FROM edits WHERE note_id = ?1 AND branch_name = ?2 \
                             AND previous_edit_id = ?3",
                        )
                        .sql()?;
                    stmt.query_map(params![note_id, branch, edit_id], |row| row.get(0))
                        .sql()?
                        .collect::<rusqlite::Result<_>>()
                        .sql()?
                };
                // Any dependent left as a diff of a missing base breaks the
                // chain, so a failed rebase aborts the whole deletion
                for dependent in dependents {
                    let (content, row) =
                        reconstruct(&tx, &note_id, &branch, &dependent).map_err(|e| {
                            Error::corrupt(format!(
                                "Cannot delete edit {}: dependent {} could not be rebased: {}",
                                edit_id, dependent, e
                            ))
                        })?;
                    rewrite_as_full(&tx, &row.record, &content)?;
                }

                delete_row(&tx, &note_id, &branch, &edit_id)?;
                forget_in_manifest(&tx, &note_id, &branch, &edit_id)?;
                tx.commit().sql()?;
                Ok(true)
            })
            .await
    }

    /// Drop one record as-is, leaving dependents untouched
    pub async fn remove_edit_record(&self, note_id: &str, branch: &str, edit_id: &str) -> Result<bool> {
        let (note_id, branch, edit_id) = (note_id.to_string(), branch.to_string(), edit_id.to_string());
        self.db
            .call(move |conn| {
                let tx = conn.transaction().sql()?;
                let removed = delete_row(&tx, &note_id, &branch, &edit_id)?;
                if removed {
                    forget_in_manifest(&tx, &note_id, &branch, &edit_id)?;
                }
                tx.commit().sql()?;
                Ok(removed)
            })
            .await
    }

    /// Delete every edit of a branch; returns the number removed
    pub async fn delete_branch_edits(&self, note_id: &str, branch: &str) -> Result<usize> {
        let (note_id, branch) = (note_id.to_string(), branch.to_string());
        self.db
            .call(move |conn| {
                let tx = conn.transaction().sql()?;
                let removed = tx
                    .execute(
                        "DELETE FROM edits WHERE note_id = ?1 AND branch_name = ?2",
                        params![note_id, branch],
                    )
                    .sql()?;
                if let Some(mut manifest) = load_manifest(&tx, &note_id)? {
                    manifest.branches.remove(&branch);
                    if manifest.branches.is_empty() {
                        delete_manifest(&tx, &note_id)?;
                    } else {
                        if manifest.current_branch == branch
                            && let Some(first) = manifest.branches.keys().next()
                        {
                            manifest.current_branch = first.clone();
                        }
                        manifest.touch();
                        store_manifest(&tx, &manifest)?;
                    }
                }
                tx.commit().sql()?;
                Ok(removed)
            })
            .await
    }

    /// Delete every edit and the edit manifest of a note
    #[instrument(skip(self))]
    pub async fn delete_note_edits(&self, note_id: &str) -> Result<usize> {
        let note_id = note_id.to_string();
        let removed = self
            .db
            .call({
                let note_id = note_id.clone();
                move |conn| {
                    let tx = conn.transaction().sql()?;
                    let removed = tx
                        .execute("DELETE FROM edits WHERE note_id = ?1", params![note_id])
                        .sql()?;
                    delete_manifest(&tx, &note_id)?;
                    tx.commit().sql()?;
                    Ok(removed)
                }
            })
            .await?;
        if removed > 0 {
            log::info!("Deleted {} edits of note {}", removed, note_id);
        }
        Ok(removed)
    }

    /// Move all edits and the edit manifest to a new note id
    #[instrument(skip(self))]
    pub async fn rename_note(&self, old_id: &str, new_id: &str) -> Result<()> {
        validate_note_id(new_id)?;
        let (old_id, new_id) = (old_id.to_string(), new_id.to_string());
        self.db
            .call(move |conn| {
                let tx = conn.transaction().sql()?;
                let taken: bool = tx
                    .query_row(
                        "SELECT EXISTS(SELECT 1 FROM edits WHERE note_id = ?1) \
                         OR EXISTS(SELECT 1 FROM manifests WHERE note_id = ?1)",
                        params![new_id],
                        |row| row.get(0),
                    )
                    .sql()?;
                if taken {
                    return Err(Error::conflict(format!(
                        "Edit history already exists for {}",
                        new_id
                    )));
                }

                let manifest = load_manifest(&tx, &old_id)?;
                tx.execute(
                    "UPDATE edits SET note_id = ?1 WHERE note_id = ?2",
                    params![new_id, old_id],
                )
                .sql()?;
                delete_manifest(&tx, &old_id)?;
                if let Some(mut manifest) = manifest {
                    manifest.note_id = new_id.clone();
                    manifest.touch();
                    store_manifest(&tx, &manifest)?;
                }
                tx.commit().sql()?;
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl TimelineProvider for EditHistoryStore {
    async fn history_points(&self, note_id: &str, branch: &str) -> Result<Vec<HistoryPoint>> {
        Ok(self
            .list_edits(note_id, branch)
            .await?
            .into_iter()
            .map(|record| HistoryPoint {
                id: record.edit_id,
                version_number: record.version_number,
                timestamp: record.timestamp,
                name: None,
            })
            .collect())
    }

    async fn content(&self, note_id: &str, branch: &str, point_id: &str) -> Result<Option<String>> {
        match self.get_edit_content(note_id, branch, point_id).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notevault_core::RelevanceSource;

    fn store(interval: u32) -> EditHistoryStore {
        EditHistoryStore::new(HistoryDb::open_in_memory().unwrap(), interval, 2)
    }

    fn body(lines: usize, tail: &str) -> String {
        let mut text: String = (0..lines).map(|i| format!("line {}\n", i)).collect();
        text.push_str(tail);
        text
    }

    async fn save(store: &EditHistoryStore, content: &str) -> EditRecord {
        store
            .save_edit("n-1", "a.md", "main", content)
            .await
            .unwrap()
            .expect("content changed")
    }

    #[tokio::test]
    async fn test_first_edit_full_then_diffs() {
        let store = store(10);
        let first = save(&store, &body(50, "one\n")).await;
        let second = save(&store, &body(50, "two\n")).await;
        let third = save(&store, &body(50, "three\n")).await;

        assert_eq!(first.storage_type, StorageType::Full);
        assert_eq!(second.storage_type, StorageType::Diff);
        assert_eq!(second.previous_edit_id.as_deref(), Some(first.edit_id.as_str()));
        assert_eq!(third.version_number, 3);

        for (record, tail) in [(&first, "one\n"), (&second, "two\n"), (&third, "three\n")] {
            assert_eq!(
                store.get_edit_content("n-1", "main", &record.edit_id).await.unwrap(),
                body(50, tail)
            );
        }
    }

    #[tokio::test]
    async fn test_identical_content_is_noop() {
        let store = store(10);
        save(&store, "same\n").await;
        assert!(
            store
                .save_edit("n-1", "a.md", "main", "same\n")
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(store.list_edits("n-1", "main").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_periodic_full_records() {
        let store = store(3);
        let mut kinds = Vec::new();
        for i in 0..7 {
            kinds.push(save(&store, &body(40, &format!("edit {}\n", i))).await.storage_type);
        }
        use StorageType::{Diff, Full};
        assert_eq!(kinds, vec![Full, Diff, Diff, Full, Diff, Diff, Full]);
    }

    #[tokio::test]
    async fn test_tiny_content_prefers_full_over_larger_diff() {
        let store = store(10);
        save(&store, "a").await;
        let second = save(&store, "b").await;
        assert_eq!(second.storage_type, StorageType::Full);
        assert_eq!(store.get_edit_content("n-1", "main", &second.edit_id).await.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_manifest_tracks_edits() {
        let store = store(10);
        let record = save(&store, "hello\n").await;
        let manifest = store.get_edit_manifest("n-1").await.unwrap().unwrap();
        assert_eq!(manifest.note_path, "a.md");
        let meta = &manifest.branch("main").unwrap().versions[&record.edit_id];
        assert_eq!(meta.version_number, 1);
        assert_eq!(meta.content_hash.as_deref(), Some(record.content_hash.as_str()));
    }

    #[tokio::test]
    async fn test_deleted_predecessor_is_detected_then_cleared() {
        let store = store(10);
        let first = save(&store, &body(30, "a\n")).await;
        let second = save(&store, &body(30, "b\n")).await;
        assert_eq!(second.storage_type, StorageType::Diff);
        assert!(store.verify_chain_consistency("n-1", "main").await.unwrap());

        // Raw removal leaves the dependent dangling
        assert!(store.remove_edit_record("n-1", "main", &first.edit_id).await.unwrap());
        assert!(!store.verify_chain_consistency("n-1", "main").await.unwrap());
        let err = store
            .get_edit_content("n-1", "main", &second.edit_id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CorruptData { .. }));

        // Pruning the dangling record restores consistency
        store.remove_edit_record("n-1", "main", &second.edit_id).await.unwrap();
        assert!(store.verify_chain_consistency("n-1", "main").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_edit_rebases_dependents() {
        let store = store(10);
        let first = save(&store, &body(30, "a\n")).await;
        let second = save(&store, &body(30, "b\n")).await;
        let third = save(&store, &body(30, "c\n")).await;

        assert!(store.delete_edit("n-1", "main", &first.edit_id).await.unwrap());
        assert!(!store.delete_edit("n-1", "main", &first.edit_id).await.unwrap());

        let records = store.list_edits("n-1", "main").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].edit_id, second.edit_id);
        assert_eq!(records[0].storage_type, StorageType::Full);
        assert!(store.verify_chain_consistency("n-1", "main").await.unwrap());
        assert_eq!(
            store.get_edit_content("n-1", "main", &third.edit_id).await.unwrap(),
            body(30, "c\n")
        );

        // Numbering continues past deleted edits
        let fourth = save(&store, &body(30, "d\n")).await;
        assert_eq!(fourth.version_number, 4);
    }

    #[tokio::test]
    async fn test_delete_edit_keeps_chain_when_rebase_fails() {
        let store = store(10);
        let first = save(&store, &body(30, "a\n")).await;
        let second = save(&store, &body(30, "b\n")).await;
        let third = save(&store, &body(30, "c\n")).await;
        assert_eq!(third.previous_edit_id.as_deref(), Some(second.edit_id.as_str()));

        // The base of the chain no longer decompresses
        let (note, branch, id) = ("n-1".to_string(), "main".to_string(), first.edit_id.clone());
        store
            .db()
            .call(move |conn| {
                conn.execute(
                    "UPDATE edits SET payload = x'00ff00ff' WHERE note_id = ?1 AND branch_name = ?2 AND edit_id = ?3",
                    params![note, branch, id],
                )
                .sql()
            })
            .await
            .unwrap();

        let err = store
            .delete_edit("n-1", "main", &second.edit_id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CorruptData { .. }));

        let records = store.list_edits("n-1", "main").await.unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.edit_id.as_str()).collect();
        assert_eq!(ids, vec![first.edit_id.as_str(), second.edit_id.as_str(), third.edit_id.as_str()]);
        assert_eq!(records[2].storage_type, StorageType::Diff);
        let manifest = store.get_edit_manifest("n-1").await.unwrap().unwrap();
        assert!(manifest.branch("main").unwrap().versions.contains_key(&second.edit_id));
    }

    #[tokio::test]
    async fn test_unicode_forms_are_distinct_edits() {
        let store = store(10);
        save(&store, "caf\u{00E9}\n").await;
        let decomposed = store
            .save_edit("n-1", "a.md", "main", "cafe\u{0301}\n")
            .await
            .unwrap()
            .expect("byte-different content is a new edit");
        assert_eq!(
            store.get_edit_content("n-1", "main", &decomposed.edit_id).await.unwrap(),
            "cafe\u{0301}\n"
        );
    }

    #[tokio::test]
    async fn test_hash_mismatch_detected_and_fixed() {
        let store = store(10);
        let record = save(&store, "content\n").await;
        let (note, branch, id) = ("n-1".to_string(), "main".to_string(), record.edit_id.clone());
        store
            .db()
            .call(move |conn| {
                conn.execute(
                    "UPDATE edits SET content_hash = 'bogus' WHERE note_id = ?1 AND branch_name = ?2 AND edit_id = ?3",
                    params![note, branch, id],
                )
                .sql()
            })
            .await
            .unwrap();

        assert!(store.get_edit_content("n-1", "main", &record.edit_id).await.is_err());
        let status = store
            .verify_edit_integrity("n-1", "main", &record.edit_id, false)
            .await
            .unwrap();
        assert!(matches!(status, EditIntegrity::Mismatch { .. }));

        let status = store
            .verify_edit_integrity("n-1", "main", &record.edit_id, true)
            .await
            .unwrap();
        assert!(matches!(status, EditIntegrity::Repaired { .. }));
        assert_eq!(
            store.get_edit_content("n-1", "main", &record.edit_id).await.unwrap(),
            "content\n"
        );
    }

    #[tokio::test]
    async fn test_branch_verification_in_batches() {
        let store = store(4);
        for i in 0..5 {
            save(&store, &body(20, &format!("{}\n", i))).await;
        }
        let source = RelevanceSource::new();
        let report = store
            .verify_branch_integrity("n-1", "main", false, &source.token())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.checked, 5);
        assert_eq!(report.valid, 5);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_expired_token_abandons_verification() {
        let store = store(4);
        save(&store, "x\n").await;
        let source = RelevanceSource::new();
        let token = source.token();
        source.advance();
        assert!(
            store
                .verify_branch_integrity("n-1", "main", true, &token)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_branch_and_note_deletion() {
        let store = store(10);
        save(&store, "main\n").await;
        store.save_edit("n-1", "a.md", "draft", "draft\n").await.unwrap();

        let chains = store.verify_all_chains("n-1").await.unwrap();
        assert_eq!(chains.len(), 2);
        assert!(chains.values().all(|ok| *ok));

        assert_eq!(store.delete_branch_edits("n-1", "draft").await.unwrap(), 1);
        let manifest = store.get_edit_manifest("n-1").await.unwrap().unwrap();
        assert!(manifest.branch("draft").is_none());

        assert_eq!(store.delete_note_edits("n-1").await.unwrap(), 1);
        assert!(store.get_edit_manifest("n-1").await.unwrap().is_none());
        assert!(!store.has_edits("n-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_rename_note() {
        let store = store(10);
        let record = save(&store, "moved\n").await;
        store.save_edit("n-2", "b.md", "main", "other\n").await.unwrap();

        assert!(store.rename_note("n-1", "n-2").await.is_err());
        store.rename_note("n-1", "n-3").await.unwrap();

        assert!(!store.has_edits("n-1").await.unwrap());
        assert_eq!(
            store.get_edit_content("n-3", "main", &record.edit_id).await.unwrap(),
            "moved\n"
        );
        let manifest = store.get_edit_manifest("n-3").await.unwrap().unwrap();
        assert_eq!(manifest.note_id, "n-3");
    }

    #[tokio::test]
    async fn test_corrupt_manifest_is_rebuilt_from_records() {
        let store = store(10);
        let record = save(&store, "one\n").await;
        store
            .db()
            .call(|conn| {
                conn.execute("UPDATE manifests SET manifest = '{broken'", [])
                    .sql()
            })
            .await
            .unwrap();

        let manifest = store.get_edit_manifest("n-1").await.unwrap().unwrap();
        assert!(manifest.branch("main").unwrap().versions.contains_key(&record.edit_id));

        let next = save(&store, "two\n").await;
        assert_eq!(next.version_number, 2);
    }
}
