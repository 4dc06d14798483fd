//! VectorMap: a sharded, in-memory LFU byte cache.
//!
//! Keys are canonicalised to 16-byte fingerprints and hashed once; the
//! hash picks a shard, and inside the shard a Swiss-table-style index
//! (16-wide SIMD tag matching over 1-byte control rows) locates the
//! record in a single contiguous arena. Values are packed behind
//! 32-bit descriptors in one of three layouts chosen by length, small
//! values keep slack for in-place rewrites, and per-slot saturating
//! counters drive frequency-based eviction. Two rebuild passes (rehash
//! on load, compacting copy on garbage) keep each shard dense without
//! blocking its readers outside the final swap.
//!
//! ```
//! use vectormap_rs::{Config, VectorMap};
//!
//! let map = VectorMap::new(Config { mem_cap: 8 << 20, num_shards: 2, ..Config::default() });
//! assert!(map.reput(b"user:42", b"payload"));
//! let v = map.get(b"user:42").unwrap();
//! assert_eq!(&*v, b"payload");
//! assert!(map.delete(b"user:42"));
//! assert!(map.get(b"user:42").is_none());
//! ```

mod holder;
mod meta;
mod pool;
mod shard;

pub use holder::{LIMIT_VALUE, MAX_SHARD_MEM, OVER_LONG, OVER_SHORT};
pub use meta::{GROUP_SIZE, MAX_AVG_GROUP_LOAD, MAX_COUNT};
pub use pool::PooledValue;
pub use shard::{LfuShard, Skip, Tunables};

use ahash::RandomState;
use md5::{Digest, Md5};

// ================================================================================================
// HASHING
// ================================================================================================

/// Canonical 16-byte form of a key: 16-byte keys pass through, every
/// other length is digested down to 16 bytes.
#[inline]
pub fn fingerprint(key: &[u8]) -> [u8; 16] {
    if key.len() == 16 {
        let mut fp = [0u8; 16];
        fp.copy_from_slice(key);
        fp
    } else {
        Md5::digest(key).into()
    }
}

/// One hashing entry point for dispatch, probing and rebuilds, so a
/// key always lands in the same slot however its hash was produced.
#[inline(always)]
pub(crate) fn hash_bytes(h: &RandomState, bytes: &[u8]) -> u64 {
    h.hash_one(bytes)
}

/// Maps a 32-bit value onto `[0, n)` with a multiply-shift instead of
/// a division.
#[inline(always)]
pub(crate) fn fast_mod_n(x: u32, n: u32) -> u32 {
    ((x as u64 * n as u64) >> 32) as u32
}

// ================================================================================================
// CONFIGURATION
// ================================================================================================

/// Construction parameters for a [`VectorMap`].
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Total memory budget across all shards, in bytes. Each shard's
    /// arena gets `mem_cap / num_shards`, clamped to
    /// [`MAX_SHARD_MEM`].
    pub mem_cap: usize,
    /// Shard count; requests fan out by key hash.
    pub num_shards: usize,
    /// Expected items per shard, sizing the initial group count.
    pub capacity_hint: u32,
    /// Eviction and GC thresholds.
    pub tunables: Tunables,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mem_cap: 256 << 20,
            num_shards: 16,
            capacity_hint: 1 << 16,
            tunables: Tunables::default(),
        }
    }
}

/// What one [`VectorMap::maintain`] sweep accomplished.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MaintainReport {
    /// Shards whose arena was compacted.
    pub gc_passes: usize,
    /// Arena bytes reclaimed across those shards.
    pub gc_reclaimed: usize,
    /// Entries evicted by frequency across all shards.
    pub evicted: usize,
}

// ================================================================================================
// VECTOR MAP
// ================================================================================================

/// The sharded owner: hashes each key once and forwards the call to
/// one independent [`LfuShard`].
pub struct VectorMap {
    shards: Box<[LfuShard]>,
    hasher: RandomState,
}

impl VectorMap {
    pub fn new(cfg: Config) -> Self {
        let num = cfg.num_shards.max(1);
        let hasher = RandomState::new();
        let shards = (0..num)
            .map(|_| {
                LfuShard::new(cfg.capacity_hint, cfg.mem_cap, num, hasher.clone(), cfg.tunables)
            })
            .collect();
        Self { shards, hasher }
    }

    #[inline]
    fn locate(&self, key: &[u8]) -> ([u8; 16], u64, &LfuShard) {
        let fp = fingerprint(key);
        let l = hash_bytes(&self.hasher, &fp);
        let idx = fast_mod_n((l >> 32) as u32, self.shards.len() as u32) as usize;
        (fp, l, &self.shards[idx])
    }

    /// Reports presence and bumps the key's frequency on a hit.
    pub fn has(&self, key: &[u8]) -> bool {
        let (fp, l, shard) = self.locate(key);
        shard.has(l, &fp)
    }

    /// Copies the value for `key` out of its shard.
    pub fn get(&self, key: &[u8]) -> Option<PooledValue> {
        let (fp, l, shard) = self.locate(key);
        shard.get(l, &fp)
    }

    /// Updates an existing key only; absent keys return false.
    pub fn put(&self, key: &[u8], value: &[u8]) -> bool {
        let (fp, l, shard) = self.locate(key);
        shard.put(l, &fp, value)
    }

    /// [`put`](VectorMap::put) of a gathered value whose parts sum to
    /// `vlen` bytes.
    pub fn put_multi(&self, key: &[u8], vlen: u32, vals: &[&[u8]]) -> bool {
        let (fp, l, shard) = self.locate(key);
        shard.put_multi(l, &fp, vlen, vals)
    }

    /// Insert-or-update.
    pub fn reput(&self, key: &[u8], value: &[u8]) -> bool {
        let (fp, l, shard) = self.locate(key);
        shard.reput(l, &fp, value)
    }

    pub fn delete(&self, key: &[u8]) -> bool {
        let (fp, l, shard) = self.locate(key);
        shard.delete(l, &fp)
    }

    pub fn clear(&self) {
        for s in self.shards.iter() {
            s.clear();
        }
    }

    pub fn close(&self) {
        for s in self.shards.iter() {
            s.close();
        }
    }

    /// Runs GC then eviction on every shard; each pass applies its own
    /// guards and skips itself when idle. The intended caller is a
    /// periodic background maintainer.
    pub fn maintain(&self) -> MaintainReport {
        let mut report = MaintainReport::default();
        for s in self.shards.iter() {
            if let Ok((_, reclaimed)) = s.gc_copy() {
                report.gc_passes += 1;
                report.gc_reclaimed += reclaimed;
            }
            if let Ok(evicted) = s.eliminate() {
                report.evicted += evicted;
            }
        }
        report
    }

    // ============================================================================================
    // INTROSPECTION
    // ============================================================================================

    /// Live entries across all shards.
    pub fn items(&self) -> u64 {
        self.shards.iter().map(|s| s.items() as u64).sum()
    }

    /// Occupied slots across all shards; equals [`items`](VectorMap::items).
    pub fn count(&self) -> u64 {
        self.shards.iter().map(|s| s.count() as u64).sum()
    }

    /// Arena bytes written across all shards, garbage included.
    pub fn used_mem(&self) -> u64 {
        self.shards.iter().map(|s| s.used_mem() as u64).sum()
    }

    /// Arena bytes live entries account for.
    pub fn items_used_mem(&self) -> u64 {
        self.shards.iter().map(|s| s.items_used_mem() as u64).sum()
    }

    pub fn query_count(&self) -> u64 {
        self.shards.iter().map(|s| s.query_count()).sum()
    }

    pub fn miss_count(&self) -> u64 {
        self.shards.iter().map(|s| s.miss_count()).sum()
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// The underlying shards, mostly for tests and diagnostics.
    pub fn shards(&self) -> &[LfuShard] {
        &self.shards
    }
}
