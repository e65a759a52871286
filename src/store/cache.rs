use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::generation::CacheGeneration;

/// Body served in place of geographic data that could not be fetched.
/// Consumers see "no data" instead of a failed fetch.
pub const EMPTY_FEATURE_COLLECTION: &str = r#"{"type":"FeatureCollection","features":[]}"#;

/// A stored response: status, content type and body bytes, plus the
/// time it was written. This is what cache stores persist per URL.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
    pub stored_at: DateTime<Utc>,
}

impl CachedResponse {
    pub fn new(status: u16, content_type: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type: content_type.into(),
            body,
            stored_at: Utc::now(),
        }
    }

    pub fn ok(content_type: impl Into<String>, body: Vec<u8>) -> Self {
        Self::new(200, content_type, body)
    }

    /// A well-formed empty FeatureCollection with status 200.
    pub fn empty_feature_collection() -> Self {
        Self::ok(
            "application/json",
            EMPTY_FEATURE_COLLECTION.as_bytes().to_vec(),
        )
    }

    /// A synthesized 404 placeholder for resources that are allowed to
    /// be missing offline (tiles, glyphs, unknown core assets).
    pub fn placeholder_not_found(message: &str) -> Self {
        Self::new(404, "text/plain", message.as_bytes().to_vec())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).context("Failed to parse cached response body as JSON")
    }
}

/// Per-entry metadata, stored next to the body file.
#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    url: String,
    status: u16,
    #[serde(rename = "contentType")]
    content_type: String,
    #[serde(rename = "contentLength")]
    content_length: u64,
    #[serde(rename = "storedAt")]
    stored_at: DateTime<Utc>,
}

/// A named, durable mapping from normalized URL to stored response.
///
/// Entries live as a `<hash>.json` metadata file plus a `<hash>.bin`
/// body file; the filename is the SHA-256 of the URL. Both files are
/// written to a temp path and renamed into place, readers require the
/// metadata file, so a partially written entry is never visible.
pub struct CacheStore {
    name: String,
    dir: PathBuf,
}

impl CacheStore {
    pub fn open(root: &Path, generation: CacheGeneration) -> Result<Self> {
        let name = generation.store_name();
        let dir = root.join(&name);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create cache store directory: {}", name))?;
        Ok(Self { name, dir })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn entry_stem(key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", Self::entry_stem(key)))
    }

    fn body_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.bin", Self::entry_stem(key)))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.meta_path(key).exists()
    }

    pub fn get(&self, key: &str) -> Result<Option<CachedResponse>> {
        let meta_path = self.meta_path(key);
        if !meta_path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(&meta_path)
            .with_context(|| format!("Failed to read cache entry metadata for {}", key))?;
        let meta: EntryMeta = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse cache entry metadata for {}", key))?;

        let body = match fs::read(self.body_path(key)) {
            Ok(body) => body,
            Err(e) => {
                // Body missing or unreadable: treat the entry as absent
                debug!(store = %self.name, key, error = %e, "Cache entry body unreadable");
                return Ok(None);
            }
        };

        Ok(Some(CachedResponse {
            status: meta.status,
            content_type: meta.content_type,
            body,
            stored_at: meta.stored_at,
        }))
    }

    /// Insert or overwrite an entry. The body is committed before the
    /// metadata so a crash mid-write leaves either the old entry or a
    /// complete new one, never a truncated body behind fresh metadata.
    pub fn put(&self, key: &str, response: &CachedResponse) -> Result<()> {
        let meta = EntryMeta {
            url: key.to_string(),
            status: response.status,
            content_type: response.content_type.clone(),
            content_length: response.body.len() as u64,
            stored_at: response.stored_at,
        };

        let body_path = self.body_path(key);
        let body_tmp = body_path.with_extension("bin.tmp");
        fs::write(&body_tmp, &response.body)
            .with_context(|| format!("Failed to write cache entry body for {}", key))?;
        fs::rename(&body_tmp, &body_path)
            .with_context(|| format!("Failed to commit cache entry body for {}", key))?;

        let meta_path = self.meta_path(key);
        let meta_tmp = meta_path.with_extension("json.tmp");
        fs::write(&meta_tmp, serde_json::to_string(&meta)?)
            .with_context(|| format!("Failed to write cache entry metadata for {}", key))?;
        fs::rename(&meta_tmp, &meta_path)
            .with_context(|| format!("Failed to commit cache entry metadata for {}", key))?;

        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        let meta_path = self.meta_path(key);
        if meta_path.exists() {
            fs::remove_file(&meta_path)
                .with_context(|| format!("Failed to delete cache entry metadata for {}", key))?;
        }
        let body_path = self.body_path(key);
        if body_path.exists() {
            fs::remove_file(&body_path)
                .with_context(|| format!("Failed to delete cache entry body for {}", key))?;
        }
        Ok(())
    }

    /// All entry keys (original URLs) currently in the store.
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = fs::read_to_string(&path)?;
            match serde_json::from_str::<EntryMeta>(&contents) {
                Ok(meta) => keys.push(meta.url),
                Err(e) => debug!(store = %self.name, path = %path.display(), error = %e,
                    "Skipping unreadable cache entry metadata"),
            }
        }
        Ok(keys)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.keys()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
