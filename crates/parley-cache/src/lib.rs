//! Dynamic sharded message cache.
//!
//! A concurrency-safe lookaside for recent conversation windows. Keys
//! are either a group id or the concatenation `viewer ∥ other` for a
//! one-to-one conversation (each direction keeps its own window — a
//! sender's window is only warmed by the sender's own operations).
//! Every window holds at most [`WINDOW_SIZE`] messages ordered by
//! creation time, newest last.
//!
//! The shard array is resized by a background monitor that watches the
//! cumulative miss ratio: heavy missing doubles the shard count (up to
//! the configured maximum), light missing halves it (down to the
//! minimum). Data operations hold the reshape lock in shared mode, so
//! they never observe a half-rehashed table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parley_types::Message;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

/// Fixed per-key window size. Not a tuning knob.
pub const WINDOW_SIZE: usize = 10;

const MONITOR_INTERVAL: Duration = Duration::from_secs(10);
const LOAD_THRESHOLD: f64 = 0.20;

/// Cache key for a one-to-one conversation, viewer first. The two
/// participants therefore maintain independent cached windows.
pub fn conversation_key(viewer: Uuid, other: Uuid) -> String {
    format!("{viewer}{other}")
}

/// In-place mutation applied by [`DynamicShardedCache::update`].
///
/// An empty `description` means "leave the body unchanged" — callers
/// marking flags must pass `String::new()` rather than the current
/// body. `received` and `read` can only move false→true; `visible`
/// only true→false (it clears the receiver-side visibility of the
/// cached entry, the one path a soft delete reaches the cache
/// through). `updated_at` is applied only when strictly newer.
#[derive(Debug, Clone)]
pub struct MessageUpdate {
    pub description: String,
    pub received: bool,
    pub read: bool,
    pub visible: bool,
    pub updated_at: DateTime<Utc>,
}

impl Default for MessageUpdate {
    fn default() -> Self {
        Self {
            description: String::new(),
            received: false,
            read: false,
            visible: true,
            updated_at: DateTime::UNIX_EPOCH,
        }
    }
}

/// Point-in-time counter snapshot. All counters are monotone and read
/// without taking any lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub resizes: u64,
    pub shard_count: usize,
}

#[derive(Default)]
struct Shard {
    items: RwLock<HashMap<String, Vec<Message>>>,
}

pub struct DynamicShardedCache {
    /// Reshape guard: data ops take it shared, resize exclusive.
    shards: RwLock<Vec<Shard>>,
    shard_count: AtomicUsize,
    min_shards: usize,
    max_shards: usize,

    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    resizes: AtomicU64,

    stop_tx: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl DynamicShardedCache {
    /// Create the cache and spawn its resize monitor. Shard counts are
    /// normalized to powers of two within `[min_shards, max_shards]`.
    pub fn new(min_shards: usize, max_shards: usize) -> Arc<Self> {
        let min_shards = min_shards.max(1).next_power_of_two();
        let max_shards = if max_shards < min_shards {
            min_shards * 4
        } else {
            max_shards.next_power_of_two()
        };

        let shards = (0..min_shards).map(|_| Shard::default()).collect();
        let (stop_tx, stop_rx) = watch::channel(false);

        let cache = Arc::new(Self {
            shards: RwLock::new(shards),
            shard_count: AtomicUsize::new(min_shards),
            min_shards,
            max_shards,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            resizes: AtomicU64::new(0),
            stop_tx,
            stopped: AtomicBool::new(false),
        });

        tokio::spawn(Self::monitor(Arc::clone(&cache), stop_rx));
        cache
    }

    /// Stop the resize monitor. Idempotent: the underlying channel is
    /// signalled at most once, later calls are no-ops.
    pub fn stop_monitoring(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            let _ = self.stop_tx.send(true);
        }
    }

    /// Fetch the window for `key` if its newest entry was created at or
    /// before `before`. An absent key and a window newer than `before`
    /// both count as misses — either way the caller has to go to the
    /// store.
    pub fn get(&self, key: &str, before: DateTime<Utc>) -> Option<Vec<Message>> {
        let shards = self.shards.read().expect("cache reshape lock poisoned");
        let shard = &shards[shard_index(key, shards.len())];
        let items = shard.items.read().expect("cache shard lock poisoned");

        match items.get(key).and_then(|window| window.last()) {
            Some(newest) if newest.created_at <= before => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(items[key].clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Append `message` to the window for `key`, creating the key on
    /// first insert and evicting the oldest entry once the window is
    /// full.
    pub fn set(&self, key: &str, message: Message) {
        let shards = self.shards.read().expect("cache reshape lock poisoned");
        let shard = &shards[shard_index(key, shards.len())];
        let mut items = shard.items.write().expect("cache shard lock poisoned");

        let window = items.entry(key.to_string()).or_default();
        if window.len() == WINDOW_SIZE {
            window.remove(0);
        }
        window.push(message);
    }

    /// Mutate the entry matching `message_id` in place, honoring the
    /// monotone-flag rules documented on [`MessageUpdate`]. Unknown
    /// keys and ids are ignored.
    pub fn update(&self, key: &str, message_id: Uuid, update: &MessageUpdate) {
        let shards = self.shards.read().expect("cache reshape lock poisoned");
        let shard = &shards[shard_index(key, shards.len())];
        let mut items = shard.items.write().expect("cache shard lock poisoned");

        let Some(window) = items.get_mut(key) else {
            return;
        };
        let Some(message) = window.iter_mut().find(|m| m.id == message_id) else {
            return;
        };

        if !update.description.is_empty() && message.description != update.description {
            message.description = update.description.clone();
        }
        if update.received && !message.received {
            message.received = true;
        }
        if update.read && !message.read {
            message.read = true;
        }
        if !update.visible && message.receiver_visible {
            message.receiver_visible = false;
        }
        if update.updated_at > message.updated_at {
            message.updated_at = update.updated_at;
        }
    }

    /// Drop the entry matching `message_id`, preserving the order of
    /// the rest of the window.
    pub fn remove_message(&self, key: &str, message_id: Uuid) {
        let shards = self.shards.read().expect("cache reshape lock poisoned");
        let shard = &shards[shard_index(key, shards.len())];
        let mut items = shard.items.write().expect("cache shard lock poisoned");

        if let Some(window) = items.get_mut(key) {
            window.retain(|m| m.id != message_id);
        }
    }

    /// Evict the whole window for `key`.
    pub fn remove(&self, key: &str) {
        let shards = self.shards.read().expect("cache reshape lock poisoned");
        let shard = &shards[shard_index(key, shards.len())];
        let mut items = shard.items.write().expect("cache shard lock poisoned");

        if items.remove(key).is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of cached entries for `key`.
    pub fn len(&self, key: &str) -> usize {
        let shards = self.shards.read().expect("cache reshape lock poisoned");
        let shard = &shards[shard_index(key, shards.len())];
        let items = shard.items.read().expect("cache shard lock poisoned");
        items.get(key).map_or(0, Vec::len)
    }

    pub fn is_empty(&self, key: &str) -> bool {
        self.len(key) == 0
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            resizes: self.resizes.load(Ordering::Relaxed),
            shard_count: self.shard_count(),
        }
    }

    async fn monitor(cache: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
        // interval fires immediately once; the first real check is one
        // period out
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => cache.check_and_resize(),
                _ = stop_rx.changed() => {
                    debug!("cache monitor stopped");
                    return;
                }
            }
        }
    }

    fn check_and_resize(&self) {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        if hits + misses == 0 {
            return;
        }

        let load = misses as f64 / (hits + misses) as f64;
        let current = self.shard_count();

        if load >= LOAD_THRESHOLD && current < self.max_shards {
            self.resize((current * 2).min(self.max_shards));
        } else if load < LOAD_THRESHOLD && current > self.min_shards {
            self.resize((current / 2).max(self.min_shards));
        }
    }

    /// Rebuild the shard array at `new_count`, rehashing every entry.
    /// Holds the reshape lock exclusively, so no data operation can
    /// observe the table mid-rehash.
    fn resize(&self, new_count: usize) {
        let mut shards = self.shards.write().expect("cache reshape lock poisoned");
        if shards.len() == new_count {
            return;
        }

        let mut new_shards: Vec<Shard> = (0..new_count).map(|_| Shard::default()).collect();
        for shard in shards.iter() {
            let mut items = shard.items.write().expect("cache shard lock poisoned");
            for (key, window) in items.drain() {
                let idx = shard_index(&key, new_count);
                new_shards[idx]
                    .items
                    .get_mut()
                    .expect("cache shard lock poisoned")
                    .insert(key, window);
            }
        }

        *shards = new_shards;
        self.shard_count.store(new_count, Ordering::Relaxed);
        self.resizes.fetch_add(1, Ordering::Relaxed);
        info!(shards = new_count, "message cache resized");
    }
}

/// 32-bit FNV-1a. Two cheap operations per byte; the exact variant the
/// shard index has always been derived from, so it stays hand-rolled
/// rather than pulling in the 64-bit `fnv` crate.
fn fnv1a(key: &str) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    let mut hash = OFFSET_BASIS;
    for byte in key.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

fn shard_index(key: &str, shard_count: usize) -> usize {
    fnv1a(key) as usize % shard_count
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn message_at(offset_secs: i64) -> Message {
        let at = DateTime::UNIX_EPOCH + TimeDelta::seconds(offset_secs);
        Message {
            id: Uuid::new_v4(),
            description: format!("m{offset_secs}"),
            sender_id: Uuid::new_v4(),
            receiver_id: Some(Uuid::new_v4()),
            group_id: None,
            sent: true,
            received: false,
            read: false,
            sender_visible: true,
            receiver_visible: true,
            created_at: at,
            updated_at: at,
        }
    }

    async fn tick_monitor() {
        tokio::time::sleep(MONITOR_INTERVAL + Duration::from_millis(500)).await;
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn window_wraps_at_ten_entries() {
        let cache = DynamicShardedCache::new(2, 16);
        let messages: Vec<Message> = (1..=11).map(message_at).collect();
        for m in &messages {
            cache.set("k", m.clone());
        }

        assert_eq!(cache.len("k"), WINDOW_SIZE);
        let window = cache
            .get("k", DateTime::UNIX_EPOCH + TimeDelta::seconds(100))
            .unwrap();
        let ids: Vec<Uuid> = window.iter().map(|m| m.id).collect();
        let expected: Vec<Uuid> = messages[1..].iter().map(|m| m.id).collect();
        assert_eq!(ids, expected, "oldest entry must be evicted first");
        cache.stop_monitoring();
    }

    #[tokio::test]
    async fn get_respects_timestamp_gate_and_counts() {
        let cache = DynamicShardedCache::new(2, 16);
        cache.set("k", message_at(100));

        // newest entry is after the requested point: miss
        assert!(cache
            .get("k", DateTime::UNIX_EPOCH + TimeDelta::seconds(50))
            .is_none());
        // at the requested point: hit
        assert!(cache
            .get("k", DateTime::UNIX_EPOCH + TimeDelta::seconds(100))
            .is_some());
        // unknown key: miss
        assert!(cache
            .get("absent", DateTime::UNIX_EPOCH + TimeDelta::seconds(100))
            .is_none());

        let metrics = cache.metrics();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 2);
        cache.stop_monitoring();
    }

    #[tokio::test]
    async fn update_flags_are_monotone() {
        let cache = DynamicShardedCache::new(2, 16);
        let msg = message_at(10);
        let id = msg.id;
        cache.set("k", msg);

        cache.update(
            "k",
            id,
            &MessageUpdate {
                received: true,
                read: true,
                visible: false,
                updated_at: DateTime::UNIX_EPOCH + TimeDelta::seconds(20),
                ..Default::default()
            },
        );

        // attempt to walk everything back
        cache.update(
            "k",
            id,
            &MessageUpdate {
                received: false,
                read: false,
                visible: true,
                updated_at: DateTime::UNIX_EPOCH + TimeDelta::seconds(5),
                ..Default::default()
            },
        );

        let window = cache
            .get("k", DateTime::UNIX_EPOCH + TimeDelta::seconds(100))
            .unwrap();
        let cached = &window[0];
        assert!(cached.received);
        assert!(cached.read);
        assert!(!cached.receiver_visible);
        assert_eq!(
            cached.updated_at,
            DateTime::UNIX_EPOCH + TimeDelta::seconds(20),
            "stale updated_at must not regress the entry"
        );
        cache.stop_monitoring();
    }

    #[tokio::test]
    async fn empty_description_leaves_body_unchanged() {
        let cache = DynamicShardedCache::new(2, 16);
        let msg = message_at(10);
        let id = msg.id;
        cache.set("k", msg);

        cache.update(
            "k",
            id,
            &MessageUpdate {
                received: true,
                ..Default::default()
            },
        );
        let window = cache
            .get("k", DateTime::UNIX_EPOCH + TimeDelta::seconds(100))
            .unwrap();
        assert_eq!(window[0].description, "m10");

        cache.update(
            "k",
            id,
            &MessageUpdate {
                description: "edited".into(),
                ..Default::default()
            },
        );
        let window = cache
            .get("k", DateTime::UNIX_EPOCH + TimeDelta::seconds(100))
            .unwrap();
        assert_eq!(window[0].description, "edited");
        cache.stop_monitoring();
    }

    #[tokio::test]
    async fn remove_message_compacts_and_remove_counts_eviction() {
        let cache = DynamicShardedCache::new(2, 16);
        let messages: Vec<Message> = (1..=3).map(message_at).collect();
        for m in &messages {
            cache.set("k", m.clone());
        }

        cache.remove_message("k", messages[1].id);
        let window = cache
            .get("k", DateTime::UNIX_EPOCH + TimeDelta::seconds(100))
            .unwrap();
        let ids: Vec<Uuid> = window.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![messages[0].id, messages[2].id]);

        cache.remove("k");
        assert_eq!(cache.len("k"), 0);
        assert_eq!(cache.metrics().evictions, 1);

        // removing an absent key is a no-op, not another eviction
        cache.remove("k");
        assert_eq!(cache.metrics().evictions, 1);
        cache.stop_monitoring();
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_scales_up_under_miss_pressure() {
        let cache = DynamicShardedCache::new(2, 16);
        assert_eq!(cache.shard_count(), 2);

        // 30 distinct keys, 100 lookups at a 0.5 miss rate
        let at = DateTime::UNIX_EPOCH + TimeDelta::seconds(1);
        for i in 0..30 {
            cache.set(&format!("key{i}"), message_at(1));
        }
        for i in 0..50 {
            assert!(cache.get(&format!("key{}", i % 30), at).is_some());
            assert!(cache.get(&format!("missing{i}"), at).is_none());
        }

        tick_monitor().await;
        assert_eq!(cache.shard_count(), 4);

        tick_monitor().await;
        tick_monitor().await;
        assert_eq!(cache.shard_count(), 16, "persistent misses reach the cap");
        assert_eq!(cache.metrics().resizes, 3);

        // contents survive every rehash
        for i in 0..30 {
            assert!(
                cache.get(&format!("key{i}"), at).is_some(),
                "key{i} lost during resize"
            );
        }
        cache.stop_monitoring();
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_scales_down_when_hits_dominate() {
        let cache = DynamicShardedCache::new(2, 16);
        let at = DateTime::UNIX_EPOCH + TimeDelta::seconds(1);

        // miss pressure first, so there is something to scale back down
        for i in 0..20 {
            assert!(cache.get(&format!("missing{i}"), at).is_none());
        }
        tick_monitor().await;
        assert_eq!(cache.shard_count(), 4);

        // hit-dominated traffic drags the cumulative load under the
        // threshold: 20 misses against 200+ hits
        cache.set("k", message_at(1));
        for _ in 0..220 {
            assert!(cache.get("k", at).is_some());
        }
        tick_monitor().await;
        assert_eq!(cache.shard_count(), 2, "low load halves back to the minimum");

        // at the floor, further low-load ticks change nothing
        tick_monitor().await;
        assert_eq!(cache.shard_count(), 2);
        assert_eq!(cache.metrics().resizes, 2);
        cache.stop_monitoring();
    }

    #[tokio::test(start_paused = true)]
    async fn all_hit_traffic_engages_monitor_without_resizing_at_minimum() {
        let cache = DynamicShardedCache::new(2, 16);
        let at = DateTime::UNIX_EPOCH + TimeDelta::seconds(1);

        // zero misses: load is 0, below threshold, already at the floor
        cache.set("k", message_at(1));
        for _ in 0..50 {
            assert!(cache.get("k", at).is_some());
        }

        tick_monitor().await;
        assert_eq!(cache.shard_count(), 2);
        assert_eq!(cache.metrics().resizes, 0);
        cache.stop_monitoring();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_monitoring_is_idempotent_and_halts_resizing() {
        let cache = DynamicShardedCache::new(2, 16);
        let at = DateTime::UNIX_EPOCH + TimeDelta::seconds(1);
        for i in 0..20 {
            assert!(cache.get(&format!("missing{i}"), at).is_none());
        }

        cache.stop_monitoring();
        cache.stop_monitoring();

        tick_monitor().await;
        assert_eq!(cache.shard_count(), 2, "no resize after stop");
    }

    #[test]
    fn fnv1a_matches_reference_vectors() {
        // published FNV-1a 32-bit test vectors
        assert_eq!(fnv1a(""), 0x811c_9dc5);
        assert_eq!(fnv1a("a"), 0xe40c_292c);
        assert_eq!(fnv1a("foobar"), 0xbf9c_f968);
    }

    #[test]
    fn conversation_keys_are_direction_specific() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_ne!(conversation_key(a, b), conversation_key(b, a));
        assert_eq!(conversation_key(a, b), format!("{a}{b}"));
    }
}
