//! Content-addressed LLM response cache.
//!
//! Cache keys are blake3 hashes over the fully rendered request (task,
//! model, system, user, schema), so any change to a prompt or schema
//! minting a different request misses cleanly. Entries are plain JSON
//! files sharded by the first two hex characters of the key; payloads
//! store the validated response plus the billed cost, which feeds the
//! governor's cache-savings ledger on later hits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::oracle::{OracleRequest, OracleResponse};
use slr_common::util::atomic_write_json;

/// One persisted cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Task label of the cached request (diagnostic only).
    pub task: String,
    /// Model that produced the response.
    pub model: String,
    /// The validated response payload.
    pub content: serde_json::Value,
    /// Billed cost of the original call (USD).
    pub cost_usd: f64,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}

/// On-disk response cache.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    dir: PathBuf,
}

impl ResponseCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Content-addressed key for a request under a given model.
    pub fn key(request: &OracleRequest, model: &str) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(request.task.as_bytes());
        hasher.update(&[0x1f]);
        hasher.update(model.as_bytes());
        hasher.update(&[0x1f]);
        hasher.update(request.system.as_bytes());
        hasher.update(&[0x1f]);
        hasher.update(request.user.as_bytes());
        hasher.update(&[0x1f]);
        hasher.update(request.schema.to_string().as_bytes());
        hasher.finalize().to_hex().to_string()
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(&key[..2]).join(format!("{key}.json"))
    }

    /// Look up a cached response. Unreadable or malformed entries are
    /// treated as misses (and left for a later overwrite).
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let path = self.path_for(key);
        if !path.exists() {
            return None;
        }
        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<CacheEntry>(&raw) {
                Ok(entry) => {
                    debug!(key = %&key[..8.min(key.len())], "response cache hit");
                    Some(entry)
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "cache entry malformed; miss");
                    None
                }
            },
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cache entry unreadable; miss");
                None
            }
        }
    }

    /// Persist a response under its key.
    pub fn put(
        &self,
        key: &str,
        request: &OracleRequest,
        model: &str,
        response: &OracleResponse,
        now: DateTime<Utc>,
    ) -> std::io::Result<()> {
        let entry = CacheEntry {
            task: request.task.clone(),
            model: model.to_string(),
            content: response.content.clone(),
            cost_usd: response.cost_usd,
            created_at: now,
        };
        atomic_write_json(&self.path_for(key), &entry)
    }

    /// Delete the whole cache directory (the `clear_cache` option).
    pub fn clear(&self) -> std::io::Result<()> {
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }

    /// Number of entries on disk (diagnostic).
    pub fn len(&self) -> usize {
        let Ok(shards) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        shards
            .flatten()
            .filter_map(|shard| std::fs::read_dir(shard.path()).ok())
            .flat_map(|entries| entries.flatten())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(user: &str) -> OracleRequest {
        OracleRequest {
            task: "extract_claims".to_string(),
            system: "You review papers.".to_string(),
            user: user.to_string(),
            schema: serde_json::json!({"type": "object"}),
        }
    }

    fn response() -> OracleResponse {
        OracleResponse {
            content: serde_json::json!({"claims": []}),
            cost_usd: 0.015,
            truncated: false,
        }
    }

    #[test]
    fn keys_are_stable_and_content_addressed() {
        let a = ResponseCache::key(&request("paper text"), "model-a");
        let b = ResponseCache::key(&request("paper text"), "model-a");
        let c = ResponseCache::key(&request("different text"), "model-a");
        let d = ResponseCache::key(&request("paper text"), "model-b");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::new(dir.path().join("llm_cache"));
        let req = request("paper text");
        let key = ResponseCache::key(&req, "model-a");

        assert!(cache.get(&key).is_none());
        cache
            .put(&key, &req, "model-a", &response(), Utc::now())
            .unwrap();
        let entry = cache.get(&key).unwrap();
        assert_eq!(entry.content, serde_json::json!({"claims": []}));
        assert!((entry.cost_usd - 0.015).abs() < 1e-9);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn malformed_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::new(dir.path().join("llm_cache"));
        let req = request("x");
        let key = ResponseCache::key(&req, "m");
        let path = cache.path_for(&key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{broken").unwrap();
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn clear_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::new(dir.path().join("llm_cache"));
        let req = request("x");
        let key = ResponseCache::key(&req, "m");
        cache.put(&key, &req, "m", &response(), Utc::now()).unwrap();
        assert!(!cache.is_empty());
        cache.clear().unwrap();
        assert!(cache.is_empty());
    }
}
