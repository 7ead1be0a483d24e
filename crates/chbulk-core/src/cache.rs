// Deduplication cache
//
// Bounds duplicate ingestion from client-side retries: a fingerprint present
// in the cache means "already accepted for processing" and repeats within the
// life window are silently dropped. This is a throughput optimization, not a
// correctness guarantee; fingerprint collisions are an accepted risk.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

/// Approximate in-memory cost of one cache entry (key, timestamp, map and
/// queue overhead), used to enforce the hard size ceiling.
const ENTRY_COST: usize = 64;

/// Sizing and lifetime parameters, mirroring the cache configuration block.
#[derive(Debug, Clone)]
pub struct DedupOptions {
    /// Shard count, must be a power of two.
    pub shards: usize,
    /// Time after which an entry can be evicted.
    pub life_window: Duration,
    /// Interval between active sweeps of expired entries; zero disables
    /// sweeping (entries still expire lazily on access).
    pub clean_window: Duration,
    /// Expected entries in one life window, a sizing hint only.
    pub max_entries_in_window: usize,
    /// Hard memory ceiling in bytes; 0 means unbounded.
    pub max_bytes: usize,
    pub verbose: bool,
}

impl Default for DedupOptions {
    fn default() -> Self {
        Self {
            shards: 1024,
            life_window: Duration::from_secs(600),
            clean_window: Duration::ZERO,
            max_entries_in_window: 600_000,
            max_bytes: 0,
            verbose: false,
        }
    }
}

struct Shard {
    entries: HashMap<u64, Instant>,
    order: VecDeque<(u64, Instant)>,
}

impl Shard {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    fn evict_front(&mut self) -> Option<u64> {
        let (fp, inserted) = self.order.pop_front()?;
        // Only remove the map entry if it still belongs to this queue slot;
        // a re-inserted fingerprint has a newer timestamp.
        if self.entries.get(&fp) == Some(&inserted) {
            self.entries.remove(&fp);
        }
        Some(fp)
    }

    fn purge_expired(&mut self, life: Duration, now: Instant) {
        while let Some((_, inserted)) = self.order.front() {
            if now.duration_since(*inserted) < life {
                break;
            }
            self.evict_front();
        }
    }
}

/// Fixed-shard, time-windowed fingerprint cache with FIFO eviction under a
/// hard size ceiling. Shards lock independently so pushes to different
/// tables never serialize on one cache lock.
pub struct DedupCache {
    shards: Vec<Mutex<Shard>>,
    mask: u64,
    life_window: Duration,
    max_shard_bytes: usize,
    verbose: bool,
}

/// Content fingerprint of normalized query parameters plus body.
pub fn fingerprint(params: &str, content: &str) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(params.as_bytes());
    hasher.update(&[0]);
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    u64::from_le_bytes(digest.as_bytes()[..8].try_into().expect("8-byte prefix"))
}

impl DedupCache {
    pub fn new(opts: DedupOptions) -> Result<Self> {
        if opts.shards == 0 || !opts.shards.is_power_of_two() {
            return Err(Error::ShardCount(opts.shards));
        }
        let per_shard = (opts.max_entries_in_window / opts.shards).max(16);
        let shards = (0..opts.shards)
            .map(|_| Mutex::new(Shard::with_capacity(per_shard)))
            .collect();
        Ok(Self {
            shards,
            mask: (opts.shards - 1) as u64,
            life_window: opts.life_window,
            max_shard_bytes: if opts.max_bytes == 0 {
                0
            } else {
                (opts.max_bytes / opts.shards).max(ENTRY_COST)
            },
            verbose: opts.verbose,
        })
    }

    fn shard(&self, fp: u64) -> &Mutex<Shard> {
        &self.shards[(fp & self.mask) as usize]
    }

    /// Record a fingerprint. Returns `false` when it was already present
    /// within the life window (a duplicate), `true` when newly accepted.
    pub fn insert(&self, fp: u64) -> bool {
        let now = Instant::now();
        let mut shard = self.shard(fp).lock();
        shard.purge_expired(self.life_window, now);

        if shard.entries.contains_key(&fp) {
            return false;
        }

        shard.entries.insert(fp, now);
        shard.order.push_back((fp, now));

        if self.max_shard_bytes > 0 {
            while shard.order.len() * ENTRY_COST > self.max_shard_bytes {
                if let Some(evicted) = shard.evict_front() {
                    if self.verbose {
                        debug!(fingerprint = evicted, "dedup cache evicted entry under size ceiling");
                    }
                } else {
                    break;
                }
            }
        }
        true
    }

    /// Whether a fingerprint is present and unexpired.
    pub fn contains(&self, fp: u64) -> bool {
        let shard = self.shard(fp).lock();
        match shard.entries.get(&fp) {
            Some(inserted) => inserted.elapsed() < self.life_window,
            None => false,
        }
    }

    /// Number of live (possibly expired but unswept) entries.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep(&self) {
        let now = Instant::now();
        for shard in &self.shards {
            shard.lock().purge_expired(self.life_window, now);
        }
    }

    /// Start the periodic expired-entry sweeper. A zero clean window means
    /// no active sweeping is performed.
    pub fn start_sweeper(self: &Arc<Self>, clean_window: Duration) -> Option<tokio::task::JoinHandle<()>> {
        if clean_window.is_zero() {
            return None;
        }
        let cache = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(clean_window);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                cache.sweep();
            }
        }))
    }
}
