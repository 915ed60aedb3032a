// Response cache with TTL, LRU eviction, and request coalescing

//! # Cache Module
//!
//! Caches successful delivery results keyed by the message's structural
//! identity (sender, category, content). Entries expire after a TTL and the
//! least-recently-used entry is evicted when the cache is full.
//!
//! Concurrent dispatches for the same key are **coalesced**: the first
//! caller (the leader) computes the result while the rest wait on a watch
//! channel and receive the leader's result, so a burst of identical
//! requests costs one downstream invocation. Only successful results are
//! stored; failures are shared with the waiters of that burst but never
//! cached.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::clock::{system_clock, SharedClock};
use crate::engine::pipeline::{Handler, Middleware};
use crate::models::message::{DeliveryResult, Message};
use crate::{RelayError, Result};

/// Cache sizing and expiry settings
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long a stored result stays valid
    pub ttl: Duration,

    /// Entry count above which the least-recently-used entry is evicted
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            max_entries: 1024,
        }
    }
}

impl CacheConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }
}

struct CacheEntry {
    value: DeliveryResult,
    expires_at: Instant,
    last_access: Instant,
}

enum Role {
    Leader(watch::Sender<Option<DeliveryResult>>),
    Follower(watch::Receiver<Option<DeliveryResult>>),
}

/// Coalescing response cache stage
///
/// ## Example:
/// ```
/// use agent_relay::{CacheConfig, CacheMiddleware};
/// use std::time::Duration;
///
/// let cache = CacheMiddleware::new(
///     CacheConfig::default().with_ttl(Duration::from_secs(30)).with_max_entries(256),
/// );
/// ```
pub struct CacheMiddleware {
    config: CacheConfig,
    clock: SharedClock,
    entries: Mutex<HashMap<u64, CacheEntry>>,
    pending: Mutex<HashMap<u64, watch::Receiver<Option<DeliveryResult>>>>,
}

impl CacheMiddleware {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            clock: system_clock(),
            entries: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    /// Structural identity: same sender, category, and content hash alike
    fn cache_key(message: &Message) -> u64 {
        let mut hasher = DefaultHasher::new();
        message.sender.hash(&mut hasher);
        message.category.hash(&mut hasher);
        message.content.hash(&mut hasher);
        hasher.finish()
    }

    fn lookup(&self, key: u64) -> Option<DeliveryResult> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        match entries.get_mut(&key) {
            Some(entry) if now < entry.expires_at => {
                entry.last_access = now;
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    fn store(&self, key: u64, value: DeliveryResult) {
        let now = self.clock.now();
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: now + self.config.ttl,
                last_access: now,
            },
        );
        while entries.len() > self.config.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| *k);
            match oldest {
                Some(k) => {
                    entries.remove(&k);
                }
                None => break,
            }
        }
    }

    /// Become the leader for `key` or join an in-flight computation
    fn claim(&self, key: u64) -> Role {
        let mut pending = self.pending.lock().expect("cache lock poisoned");
        if let Some(rx) = pending.get(&key) {
            Role::Follower(rx.clone())
        } else {
            let (tx, rx) = watch::channel(None);
            pending.insert(key, rx);
            Role::Leader(tx)
        }
    }

    fn release(&self, key: u64) {
        self.pending.lock().expect("cache lock poisoned").remove(&key);
    }
}

#[async_trait]
impl Middleware for CacheMiddleware {
    fn name(&self) -> &str {
        "cache"
    }

    async fn handle(
        &self,
        message: Message,
        cancel: CancellationToken,
        next: Handler,
    ) -> Result<DeliveryResult> {
        let key = Self::cache_key(&message);

        if let Some(hit) = self.lookup(key) {
            debug!(%key, "cache hit");
            return Ok(hit.with_data("cache_hit", serde_json::json!(true)));
        }

        match self.claim(key) {
            Role::Leader(tx) => {
                let result = next(message, cancel).await;
                match &result {
                    Ok(r) => {
                        if r.success {
                            self.store(key, r.clone());
                        }
                        self.release(key);
                        let _ = tx.send(Some(r.clone()));
                    }
                    Err(e) => {
                        // waiters get a clean failure; the error stays ours
                        self.release(key);
                        let _ = tx.send(Some(DeliveryResult::fail(e.to_string())));
                    }
                }
                result
            }
            Role::Follower(mut rx) => loop {
                if let Some(result) = rx.borrow_and_update().clone() {
                    return Ok(result);
                }
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                    changed = rx.changed() => {
                        if changed.is_err() {
                            // leader dropped without publishing; compute alone
                            return next(message, cancel).await;
                        }
                    }
                }
            },
        }
    }
}
