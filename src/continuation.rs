//! Continuation cache: spillover storage for oversized tool results.
//!
//! When a call result exceeds the inline size budget the batch executor
//! stores the full payload here and hands the caller a continuation id.
//! Payloads are retrievable in byte ranges until their TTL lapses; the GC
//! worker purges expired entries.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

/// Default number of bytes returned by a retrieve.
pub const DEFAULT_RETRIEVE_LIMIT: usize = 500_000;

/// Absolute cap on bytes returned by a single retrieve.
pub const MAX_RETRIEVE_LIMIT: usize = 2_000_000;

/// Result of a cache retrieval.
#[derive(Debug)]
pub struct Retrieval {
    pub found: bool,
    pub data: Value,
    pub total_size_bytes: usize,
    pub offset: usize,
    pub has_more: bool,
    pub complete: bool,
}

impl Retrieval {
    fn not_found() -> Self {
        Retrieval {
            found: false,
            data: Value::Null,
            total_size_bytes: 0,
            offset: 0,
            has_more: false,
            complete: false,
        }
    }
}

struct CacheEntry {
    payload: String,
    expires_at: Instant,
}

/// TTL-bounded store of serialized payloads keyed by continuation id.
pub struct ResponseCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        ResponseCache {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Store a payload, minting its continuation id
    /// (`cont_<batch>_<index>_<hash>`).
    pub fn store(&self, batch_id: &str, call_index: usize, payload: &Value) -> String {
        let serialized = payload.to_string();
        let mut hasher = DefaultHasher::new();
        serialized.hash(&mut hasher);
        let id = format!("cont_{batch_id}_{call_index}_{:08x}", hasher.finish() as u32);

        self.entries
            .lock()
            .expect("response cache lock poisoned")
            .insert(
                id.clone(),
                CacheEntry {
                    payload: serialized,
                    expires_at: Instant::now() + self.ttl,
                },
            );
        tracing::debug!(continuation_id = %id, "continuation stored");
        id
    }

    /// Retrieve up to `limit` bytes of a payload starting at `offset`.
    ///
    /// `limit` is clamped to [`MAX_RETRIEVE_LIMIT`]; zero falls back to the
    /// default. A full read from offset zero returns the parsed JSON value;
    /// partial reads return the raw chunk as a string.
    pub fn retrieve(&self, id: &str, offset: usize, limit: usize) -> Retrieval {
        let limit = if limit == 0 {
            DEFAULT_RETRIEVE_LIMIT
        } else {
            limit.min(MAX_RETRIEVE_LIMIT)
        };

        let entries = self.entries.lock().expect("response cache lock poisoned");
        let Some(entry) = entries.get(id) else {
            return Retrieval::not_found();
        };
        if entry.expires_at <= Instant::now() {
            return Retrieval::not_found();
        }

        let bytes = entry.payload.as_bytes();
        let total = bytes.len();
        if offset >= total {
            return Retrieval {
                found: true,
                data: Value::String(String::new()),
                total_size_bytes: total,
                offset,
                has_more: false,
                complete: false,
            };
        }

        let end = (offset + limit).min(total);
        let has_more = end < total;
        let complete = offset == 0 && !has_more;

        let data = if complete {
            serde_json::from_str(&entry.payload)
                .unwrap_or_else(|_| Value::String(entry.payload.clone()))
        } else {
            Value::String(String::from_utf8_lossy(&bytes[offset..end]).into_owned())
        };

        Retrieval {
            found: true,
            data,
            total_size_bytes: total,
            offset,
            has_more,
            complete,
        }
    }

    /// Remove an entry; true when it existed.
    pub fn delete(&self, id: &str) -> bool {
        self.entries
            .lock()
            .expect("response cache lock poisoned")
            .remove(id)
            .is_some()
    }

    /// Drop expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock().expect("response cache lock poisoned");
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        let purged = before - entries.len();
        if purged > 0 {
            tracing::debug!(purged, "expired continuations purged");
        }
        purged
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("response cache lock poisoned")
            .len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
