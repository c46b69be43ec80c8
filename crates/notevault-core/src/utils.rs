//! Shared utilities for operations across notevault crates.
//!
//! Provides DRY helpers for:
//! - Content hashing
//! - Identifier generation and validation
//! - Vault path normalization
//! - Cooperative cancellation tokens

use crate::{Error, Result};
use chrono::Utc;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

/// Characters allowed in a note id (it doubles as a folder name)
static NOTE_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").unwrap());

/// Runs of characters that are not safe in a slug
static SLUG_STRIP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

/// SHA-256 of the exact bytes of `content`, hex encoded.
///
/// No normalization: canonically equal text with different bytes hashes
/// differently, so change detection never hides a byte-level edit.
pub fn compute_hash(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

/// Check that a note id is safe to use as a folder name
pub fn validate_note_id(note_id: &str) -> Result<()> {
    if note_id == "." || note_id == ".." || !NOTE_ID_PATTERN.is_match(note_id) {
        return Err(Error::validation(format!(
            "Invalid note id {:?}: expected 1-128 characters of [A-Za-z0-9._-]",
            note_id
        )));
    }
    Ok(())
}

/// Check that a branch name is usable
pub fn validate_branch_name(name: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.len() > 100 || trimmed != name {
        return Err(Error::validation(format!("Invalid branch name {:?}", name)));
    }
    if name.contains(['/', '\\']) {
        return Err(Error::validation(format!(
            "Branch name {:?} must not contain path separators",
            name
        )));
    }
    Ok(())
}

/// Normalize a vault-relative document path: forward slashes, no leading
/// `./` or `/`, no `..` segments.
pub fn normalize_note_path(path: &str) -> Result<String> {
    let unified = path.replace('\\', "/");
    let mut segments = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(Error::validation(format!(
                    "Note path {:?} escapes the vault",
                    path
                )));
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return Err(Error::validation("Note path cannot be empty"));
    }
    Ok(segments.join("/"))
}

/// Lowercase ASCII slug of a document's file stem, used to seed note ids.
/// Accents are folded (`Café` -> `cafe`).
pub fn slugify_path(note_path: &str) -> String {
    let stem = note_path
        .rsplit('/')
        .next()
        .unwrap_or(note_path)
        .trim_end_matches(".md");
    let folded: String = stem.nfd().filter(|c| !is_combining_mark(*c)).collect();
    let lowered = folded.to_lowercase();
    let slug = SLUG_STRIP.replace_all(&lowered, "-");
    let slug = slug.trim_matches('-');
    let slug: String = slug.chars().take(48).collect();
    if slug.is_empty() {
        "note".to_string()
    } else {
        slug
    }
}

/// Fresh note id candidate derived from a document path
pub fn generate_note_id(note_path: &str) -> String {
    format!("{}-{}", slugify_path(note_path), short_random())
}

/// Sortable, unique id for a snapshot or edit: `<millis>_<random>`
pub fn generate_version_id() -> String {
    format!("{}_{}", Utc::now().timestamp_millis(), short_random())
}

/// Eight random hex characters
pub fn short_random() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Cooperative cancellation: long-running work checks `is_relevant()`
/// before applying results and abandons silently once it turns false.
///
/// A token is bound to a generation of its [`RelevanceSource`]; bumping the
/// source (e.g. the active note changed) expires every outstanding token.
#[derive(Debug, Clone)]
pub struct RelevanceToken {
    generation: u64,
    current: Arc<AtomicU64>,
    cancelled: Arc<AtomicBool>,
}

impl RelevanceToken {
    /// A token that never expires
    pub fn always() -> Self {
        Self {
            generation: 0,
            current: Arc::new(AtomicU64::new(0)),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_relevant(&self) -> bool {
        !self.cancelled.load(Ordering::Acquire)
            && self.current.load(Ordering::Acquire) == self.generation
    }

    /// Expire this token (and its clones) explicitly
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// Issues [`RelevanceToken`]s and invalidates them when the context moves on
#[derive(Debug, Clone, Default)]
pub struct RelevanceSource {
    current: Arc<AtomicU64>,
}

impl RelevanceSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token valid until the next `advance`
    pub fn token(&self) -> RelevanceToken {
        RelevanceToken {
            generation: self.current.load(Ordering::Acquire),
            current: Arc::clone(&self.current),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Expire every token issued so far
    pub fn advance(&self) {
        self.current.fetch_add(1, Ordering::AcqRel);
    }
}
