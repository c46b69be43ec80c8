//! Document metadata capability: one structured field in a document's
//! leading YAML block.
//!
//! The engine only reads and writes the note identity field, and it does so
//! exclusively through [`DocumentMetadata`]. [`FrontmatterMetadata`] is the
//! default implementation over a [`FileSystem`].

use crate::error::{Error, Result};
use crate::fs::FileSystem;
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use serde_yaml::Mapping;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

/// Matches a leading front matter block: --- ... ---
static FRONTMATTER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^---[ \t]*\r?\n(?:([\s\S]*?)\r?\n)?---[ \t]*(?:\r?\n|$)").unwrap()
});

/// Get/set/delete one key of a document's metadata block.
///
/// `doc` is a vault-relative document path.
#[async_trait]
pub trait DocumentMetadata: Send + Sync {
    async fn get(&self, doc: &str, key: &str) -> Result<Option<Value>>;

    async fn set(&self, doc: &str, key: &str, value: Value) -> Result<()>;

    /// Returns whether the key was present
    async fn delete(&self, doc: &str, key: &str) -> Result<bool>;
}

/// Primary metadata key for the note id plus legacy aliases to migrate from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataKeys {
    pub primary: String,
    pub legacy: Vec<String>,
}

impl MetadataKeys {
    pub fn new(primary: impl Into<String>, legacy: Vec<String>) -> Self {
        Self {
            primary: primary.into(),
            legacy,
        }
    }

    /// Primary key first, then aliases
    pub fn all(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.legacy.iter().map(String::as_str))
    }

    /// Read the note id, migrating a legacy alias to the primary key.
    pub async fn read_note_id(
        &self,
        metadata: &dyn DocumentMetadata,
        doc: &str,
    ) -> Result<Option<String>> {
        if let Some(id) = metadata.get(doc, &self.primary).await?.and_then(value_as_id) {
            return Ok(Some(id));
        }

        for alias in &self.legacy {
            if let Some(id) = metadata.get(doc, alias).await?.and_then(value_as_id) {
                log::info!("Migrating note id key {:?} -> {:?} in {}", alias, self.primary, doc);
                metadata
                    .set(doc, &self.primary, Value::String(id.clone()))
                    .await?;
                metadata.delete(doc, alias).await?;
                return Ok(Some(id));
            }
        }

        Ok(None)
    }
}

fn value_as_id(value: Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Split content into (front matter body, rest of document)
pub fn split_front_matter(content: &str) -> (Option<&str>, &str) {
    match FRONTMATTER_PATTERN.captures(content) {
        Some(caps) => {
            let body = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            let end = caps.get(0).map(|m| m.end()).unwrap_or(0);
            (Some(body), &content[end..])
        }
        None => (None, content),
    }
}

/// Parse the front matter of `content` into a YAML mapping
pub fn parse_front_matter(content: &str) -> Result<Option<Mapping>> {
    let (block, _) = split_front_matter(content);
    let Some(block) = block else {
        return Ok(None);
    };
    if block.trim().is_empty() {
        return Ok(Some(Mapping::new()));
    }
    match serde_yaml::from_str::<serde_yaml::Value>(block) {
        Ok(serde_yaml::Value::Mapping(map)) => Ok(Some(map)),
        Ok(serde_yaml::Value::Null) => Ok(Some(Mapping::new())),
        Ok(_) => Err(Error::corrupt("Front matter is not a mapping")),
        Err(e) => Err(Error::corrupt(format!("Invalid front matter: {}", e))),
    }
}

/// Re-assemble a document from a mapping and a body.
///
/// An empty mapping drops the block entirely.
pub fn render_with_front_matter(map: &Mapping, body: &str) -> Result<String> {
    if map.is_empty() {
        return Ok(body.to_string());
    }
    let yaml = serde_yaml::to_string(map)
        .map_err(|e| Error::other(format!("Failed to serialize front matter: {}", e)))?;
    Ok(format!("---\n{}---\n{}", yaml, body))
}

/// Remove the given keys from a document's front matter.
///
/// Used when forking a snapshot so the copy does not inherit the identity.
pub fn strip_keys<'a>(content: &str, keys: impl IntoIterator<Item = &'a str>) -> Result<String> {
    let Some(mut map) = parse_front_matter(content)? else {
        return Ok(content.to_string());
    };
    let mut changed = false;
    for key in keys {
        changed |= map.remove(key).is_some();
    }
    if !changed {
        return Ok(content.to_string());
    }
    let (_, body) = split_front_matter(content);
    render_with_front_matter(&map, body)
}

/// [`DocumentMetadata`] that edits YAML front matter through a [`FileSystem`]
pub struct FrontmatterMetadata {
    vault_root: PathBuf,
    fs: Arc<dyn FileSystem>,
}

impl FrontmatterMetadata {
    pub fn new(vault_root: impl Into<PathBuf>, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            vault_root: vault_root.into(),
            fs,
        }
    }

    fn resolve(&self, doc: &str) -> PathBuf {
        self.vault_root.join(Path::new(doc))
    }

    async fn rewrite<F>(&self, doc: &str, edit: F) -> Result<bool>
    where
        F: FnOnce(&mut Mapping) -> bool + Send,
    {
        let path = self.resolve(doc);
        let content = self.fs.read_to_string(&path).await?;
        let mut map = parse_front_matter(&content)?.unwrap_or_default();
        if !edit(&mut map) {
            return Ok(false);
        }
        let (_, body) = split_front_matter(&content);
        let updated = render_with_front_matter(&map, body)?;
        self.fs.write(&path, updated.as_bytes()).await?;
        Ok(true)
    }
}

#[async_trait]
impl DocumentMetadata for FrontmatterMetadata {
    async fn get(&self, doc: &str, key: &str) -> Result<Option<Value>> {
        let content = self.fs.read_to_string(&self.resolve(doc)).await?;
        let map = match parse_front_matter(&content) {
            Ok(map) => map,
            Err(e) => {
                log::warn!("Ignoring unreadable front matter in {}: {}", doc, e);
                None
            }
        };
        let Some(value) = map.and_then(|m| m.get(key).cloned()) else {
            return Ok(None);
        };
        serde_yaml::from_value::<Value>(value)
            .map(Some)
            .map_err(|e| Error::corrupt(format!("Front matter key {:?}: {}", key, e)))
    }

    async fn set(&self, doc: &str, key: &str, value: Value) -> Result<()> {
        let yaml = serde_yaml::to_value(&value)
            .map_err(|e| Error::validation(format!("Unrepresentable metadata value: {}", e)))?;
        let key = key.to_string();
        self.rewrite(doc, move |map| {
            map.insert(serde_yaml::Value::String(key), yaml);
            true
        })
        .await?;
        Ok(())
    }

    async fn delete(&self, doc: &str, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.rewrite(doc, move |map| map.remove(key.as_str()).is_some())
            .await
    }
}
