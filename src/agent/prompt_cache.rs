//! Rendered system prompt cache.
//!
//! Prompt inputs (identity, soul, skills, tool summary, runtime context) are
//! hashed; an unchanged set of inputs reuses the rendered prompt. Entries are
//! evicted least-recently-used once `capacity` is reached.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::debug;

/// Hex chars of the SHA-256 digest used as the cache key.
const HASH_LEN: usize = 16;

/// Hash prompt sources independent of insertion order.
///
/// ```
/// use std::collections::BTreeMap;
/// use aisbot::agent::prompt_cache::hash_sources;
///
/// let mut a = BTreeMap::new();
/// a.insert("identity".to_string(), "You are aisbot.".to_string());
/// assert_eq!(hash_sources(&a).len(), 16);
/// ```
pub fn hash_sources(sources: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in sources {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
        .chars()
        .take(HASH_LEN)
        .collect()
}

struct CachedPrompt {
    rendered: String,
    last_used: AtomicU64,
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptLookup {
    pub rendered: String,
    pub hash: String,
    pub hit: bool,
}

/// Content-hash keyed cache of rendered system prompts.
pub struct SystemPromptCache {
    capacity: usize,
    entries: RwLock<HashMap<String, CachedPrompt>>,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SystemPromptCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Return the cached rendering for `sources`, or render and store it.
    pub async fn get_or_render<F>(&self, sources: &BTreeMap<String, String>, render: F) -> PromptLookup
    where
        F: FnOnce() -> String,
    {
        let hash = hash_sources(sources);

        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(&hash) {
                entry.last_used.store(self.tick(), Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                return PromptLookup {
                    rendered: entry.rendered.clone(),
                    hash,
                    hit: true,
                };
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let rendered = render();

        let mut entries = self.entries.write().await;
        if !entries.contains_key(&hash) && entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used.load(Ordering::Relaxed))
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                debug!(hash = %oldest, "Evicting cached system prompt");
                entries.remove(&oldest);
            }
        }
        entries.insert(
            hash.clone(),
            CachedPrompt {
                rendered: rendered.clone(),
                last_used: AtomicU64::new(self.tick()),
            },
        );

        PromptLookup {
            rendered,
            hash,
            hit: false,
        }
    }

    /// Drop the entry for `hash`.
    pub async fn invalidate(&self, hash: &str) -> bool {
        self.entries.write().await.remove(hash).is_some()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// `(hits, misses)` since creation.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
