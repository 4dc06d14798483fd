//! One LFU cache shard: a Swiss-table-style probing index over the
//! arena, with frequency counters and the rebuild/eviction passes.
//!
//! Three locks coordinate a shard (writers always take `put_lock`
//! before anything else; readers never take it):
//! - `put_lock` serialises every mutating operation, maintenance
//!   included.
//! - the arena gate inside [`KvHolder`] closes the window between a
//!   descriptor and its backing bytes.
//! - `table` (an RW lock) is held shared for every read operation and
//!   exclusive only for the wholesale swap at the end of a rebuild.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use ahash::RandomState;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::holder::{KvHolder, SlotWord, UpdateOutcome, ValueSource, LIMIT_VALUE, MAX_SHARD_MEM};
use crate::meta::{
    build_min_top_counter, next_match, CounterGroup, MetaGroup, EMPTY, GROUP_SIZE,
    MAX_AVG_GROUP_LOAD, TOMBSTONE,
};
use crate::hash_bytes;
use crate::pool::PooledValue;

/// Growth factor applied to the group count on a loaded rehash.
const GROW_FACTOR: f64 = 1.2;

/// Why a maintenance pass did nothing.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Skip {
    /// Eviction: the observed miss rate is below the configured bar.
    MissRateHealthy,
    /// Eviction: live entries sit below the start watermark.
    LowPressure,
    /// Eviction: the computed drop count rounded to zero.
    NothingToDrop,
    /// GC: garbage share of the written region is below the bar.
    LowGarbage,
    /// GC: another rebuild holds the single-flight flag.
    Busy,
}

/// Maintenance thresholds, all ratios in `[0, 1]`.
#[derive(Clone, Copy, Debug)]
pub struct Tunables {
    /// Eviction runs only when `miss_cnt / query_cnt` reaches this.
    pub eliminate_miss_rate: f32,
    /// Live-bytes watermark that arms eviction.
    pub eliminate_start: f32,
    /// Watermark eviction drives live bytes back down to.
    pub eliminate_end: f32,
    /// Garbage share that arms the compacting copy.
    pub garbage_rate: f32,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            eliminate_miss_rate: 0.2,
            eliminate_start: 0.8,
            eliminate_end: 0.7,
            garbage_rate: 0.5,
        }
    }
}

// ================================================================================================
// SLOT GROUPS AND THE SWAPPABLE TABLE
// ================================================================================================

/// 16 descriptor words, one per slot of a group. Stores go through the
/// arena gate (see [`KvHolder`]); loads are relaxed and re-validated
/// against the key bytes.
pub(crate) struct SlotGroup([AtomicU32; GROUP_SIZE]);

impl SlotGroup {
    fn new() -> Self {
        Self(std::array::from_fn(|_| AtomicU32::new(0)))
    }

    #[inline(always)]
    pub fn get(&self, s: usize) -> SlotWord {
        SlotWord(self.0[s].load(Ordering::Relaxed))
    }

    #[inline(always)]
    pub fn cell(&self, s: usize) -> &AtomicU32 {
        &self.0[s]
    }

    fn reset(&self) {
        for w in &self.0 {
            w.store(0, Ordering::Relaxed);
        }
    }
}

/// Everything a rebuild replaces in one swap.
struct Table {
    ctrl: Box<[MetaGroup]>,
    counters: Box<[CounterGroup]>,
    slots: Box<[SlotGroup]>,
    kv: KvHolder,
    limit: u32,
    resident: AtomicU32,
    dead: AtomicU32,
}

impl Table {
    fn with_groups(n: u32, mem: u32) -> Self {
        let n = n as usize;
        Self {
            ctrl: (0..n).map(|_| MetaGroup::new()).collect(),
            counters: (0..n).map(|_| CounterGroup::new()).collect(),
            slots: (0..n).map(|_| SlotGroup::new()).collect(),
            kv: KvHolder::new(mem),
            limit: n as u32 * MAX_AVG_GROUP_LOAD,
            resident: AtomicU32::new(0),
            dead: AtomicU32::new(0),
        }
    }

    fn closed() -> Self {
        Self {
            ctrl: Box::new([]),
            counters: Box::new([]),
            slots: Box::new([]),
            kv: KvHolder::closed(),
            limit: 0,
            resident: AtomicU32::new(0),
            dead: AtomicU32::new(0),
        }
    }

    #[inline(always)]
    fn resident(&self) -> u32 {
        self.resident.load(Ordering::Relaxed)
    }

    #[inline(always)]
    fn dead(&self) -> u32 {
        self.dead.load(Ordering::Relaxed)
    }
}

// ================================================================================================
// SHARD
// ================================================================================================

#[inline(always)]
fn split_hash(l: u64) -> (u64, i8) {
    (l >> 7, (l & 0x7F) as i8)
}

#[inline(always)]
fn probe_start(h1: u64, n_groups: usize) -> usize {
    (h1 % n_groups as u64) as usize
}

fn num_groups(capacity_hint: u32) -> u32 {
    ((capacity_hint + MAX_AVG_GROUP_LOAD - 1) / MAX_AVG_GROUP_LOAD).max(1)
}

/// A fixed-capacity LFU key/value shard.
///
/// Callers pass the precomputed 64-bit key hash (see [`hash_of`]) plus
/// the canonical 16-byte key. The owning map fans requests out over
/// many shards; each shard is fully independent.
///
/// [`hash_of`]: LfuShard::hash_of
pub struct LfuShard {
    table: RwLock<Table>,
    put_lock: Mutex<()>,
    query_cnt: AtomicU64,
    miss_cnt: AtomicU64,
    rehashing: AtomicBool,
    hasher: RandomState,
    tun: Tunables,
}

impl LfuShard {
    /// Builds a shard sized for `capacity_hint` items, with an arena of
    /// `mem_cap / num_shards` bytes clamped to the per-shard maximum.
    /// The hasher must be the one the caller derives key hashes from;
    /// rebuilds recompute placements with it.
    pub fn new(
        capacity_hint: u32,
        mem_cap: usize,
        num_shards: usize,
        hasher: RandomState,
        tun: Tunables,
    ) -> Self {
        let mut mem = if num_shards == 0 { 0 } else { (mem_cap / num_shards) as u64 };
        if mem == 0 || mem > MAX_SHARD_MEM as u64 {
            mem = MAX_SHARD_MEM as u64;
        }
        Self {
            table: RwLock::new(Table::with_groups(num_groups(capacity_hint), mem as u32)),
            put_lock: Mutex::new(()),
            query_cnt: AtomicU64::new(0),
            miss_cnt: AtomicU64::new(0),
            rehashing: AtomicBool::new(false),
            hasher,
            tun,
        }
    }

    /// The 64-bit hash of a canonical key under this shard's hasher.
    #[inline]
    pub fn hash_of(&self, key: &[u8]) -> u64 {
        hash_bytes(&self.hasher, key)
    }

    // ============================================================================================
    // READ PATH
    // ============================================================================================

    /// Reports whether `key` is present, bumping its frequency counter
    /// on a hit.
    pub fn has(&self, l: u64, key: &[u8]) -> bool {
        self.query_cnt.fetch_add(1, Ordering::Relaxed);
        let t = self.table.read();
        if t.ctrl.is_empty() {
            self.miss_cnt.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let (h1, h2) = split_hash(l);
        let n = t.ctrl.len();
        let mut g = probe_start(h1, n);
        loop {
            let mut m = t.ctrl[g].match_h2(h2);
            while m != 0 {
                let s = next_match(&mut m) as usize;
                let hit = {
                    let _arena = t.kv.lock.read();
                    t.kv.key_at(t.slots[g].get(s)).is_some_and(|k| k == key)
                };
                if hit {
                    t.counters[g].bump(s);
                    return true;
                }
            }
            if t.ctrl[g].match_empty() != 0 {
                self.miss_cnt.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            g += 1;
            if g >= n {
                g = 0;
            }
        }
    }

    /// Looks `key` up and copies its value out into a pooled buffer.
    pub fn get(&self, l: u64, key: &[u8]) -> Option<PooledValue> {
        self.query_cnt.fetch_add(1, Ordering::Relaxed);
        let t = self.table.read();
        if t.ctrl.is_empty() {
            self.miss_cnt.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let (h1, h2) = split_hash(l);
        let n = t.ctrl.len();
        let mut g = probe_start(h1, n);
        loop {
            let mut m = t.ctrl[g].match_h2(h2);
            while m != 0 {
                let s = next_match(&mut m) as usize;
                let value = {
                    let _arena = t.kv.lock.read();
                    // Descriptor and bytes must be read under the same
                    // shared hold; the word is re-loaded inside it.
                    let w = t.slots[g].get(s);
                    match t.kv.key_at(w) {
                        Some(k) if k == key => Some(t.kv.read_value(t.kv.value_slot(w))),
                        _ => None,
                    }
                };
                if let Some(v) = value {
                    t.counters[g].bump(s);
                    return Some(v);
                }
            }
            if t.ctrl[g].match_empty() != 0 {
                self.miss_cnt.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            g += 1;
            if g >= n {
                g = 0;
            }
        }
    }

    // ============================================================================================
    // WRITE PATH
    // ============================================================================================

    /// Updates the value of an existing key. Returns false when the key
    /// is absent (nothing is inserted), when the value is oversize, or
    /// when the arena is full; in the latter two cases the slot is
    /// tombstoned and the old value abandoned.
    pub fn put(&self, l: u64, key: &[u8], value: &[u8]) -> bool {
        self.update_existing(l, key, &ValueSource::One(value))
    }

    /// [`put`](LfuShard::put) for a gathered value: stores the
    /// concatenation of `vals`, whose lengths must sum to `vlen`.
    pub fn put_multi(&self, l: u64, key: &[u8], vlen: u32, vals: &[&[u8]]) -> bool {
        let total: u64 = vals.iter().map(|v| v.len() as u64).sum();
        if total != vlen as u64 {
            return false;
        }
        self.update_existing(l, key, &ValueSource::Many { len: vlen, parts: vals })
    }

    fn update_existing(&self, l: u64, key: &[u8], src: &ValueSource<'_>) -> bool {
        let _put = self.put_lock.lock();
        let t = self.table.read();
        if t.ctrl.is_empty() {
            return false;
        }
        let (h1, h2) = split_hash(l);
        let n = t.ctrl.len();
        let mut g = probe_start(h1, n);
        loop {
            let mut m = t.ctrl[g].match_h2(h2);
            while m != 0 {
                let s = next_match(&mut m) as usize;
                if t.kv.key_at(t.slots[g].get(s)) != Some(key) {
                    continue;
                }
                return match t.kv.update(t.slots[g].cell(s), src) {
                    UpdateOutcome::Done => true,
                    UpdateOutcome::Dead => {
                        t.ctrl[g].set(s, TOMBSTONE);
                        t.counters[g].set(s, 0);
                        t.dead.fetch_add(1, Ordering::Relaxed);
                        false
                    }
                };
            }
            if t.ctrl[g].match_empty() != 0 {
                return false;
            }
            g += 1;
            if g >= n {
                g = 0;
            }
        }
    }

    /// Insert-or-update, the only operation that creates keys. Runs a
    /// rehash first when the table is at its load limit; refuses when
    /// the arena has passed its admission mark or a rebuild is in
    /// flight elsewhere.
    pub fn reput(&self, l: u64, key: &[u8], value: &[u8]) -> bool {
        {
            let t = self.table.read();
            if t.kv.tail() >= t.kv.limit() {
                return false;
            }
        }
        if self.rehashing.load(Ordering::Acquire) {
            return false;
        }

        let _put = self.put_lock.lock();
        let at_load_limit = {
            let t = self.table.read();
            t.resident() >= t.limit
        };
        if at_load_limit {
            self.rehashing.store(true, Ordering::Release);
            self.rehash();
            self.rehashing.store(false, Ordering::Release);
        }

        let t = self.table.read();
        if t.ctrl.is_empty() {
            return false;
        }
        let src = ValueSource::One(value);
        let (h1, h2) = split_hash(l);
        let n = t.ctrl.len();
        let mut g = probe_start(h1, n);
        loop {
            let mut m = t.ctrl[g].match_h2(h2);
            while m != 0 {
                let s = next_match(&mut m) as usize;
                if t.kv.key_at(t.slots[g].get(s)) != Some(key) {
                    continue;
                }
                return match t.kv.update(t.slots[g].cell(s), &src) {
                    UpdateOutcome::Done => true,
                    UpdateOutcome::Dead => {
                        t.ctrl[g].set(s, TOMBSTONE);
                        t.counters[g].set(s, 0);
                        t.dead.fetch_add(1, Ordering::Relaxed);
                        false
                    }
                };
            }
            let mut empties = t.ctrl[g].match_empty();
            if empties != 0 {
                let s = next_match(&mut empties) as usize;
                if !t.kv.insert(t.slots[g].cell(s), key, &src) {
                    return false;
                }
                t.ctrl[g].set(s, h2);
                t.counters[g].set(s, 1);
                t.resident.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            g += 1;
            if g >= n {
                g = 0;
            }
        }
    }

    /// Removes `key`. The slot reverts to empty when its group still
    /// has an empty byte, otherwise it becomes a tombstone so probe
    /// sequences through the group stay terminated.
    pub fn delete(&self, l: u64, key: &[u8]) -> bool {
        let _put = self.put_lock.lock();
        let t = self.table.read();
        if t.ctrl.is_empty() {
            return false;
        }
        let (h1, h2) = split_hash(l);
        let n = t.ctrl.len();
        let mut g = probe_start(h1, n);
        loop {
            let mut m = t.ctrl[g].match_h2(h2);
            while m != 0 {
                let s = next_match(&mut m) as usize;
                if t.kv.key_at(t.slots[g].get(s)) != Some(key) {
                    continue;
                }
                t.kv.discard(t.slots[g].cell(s));
                if t.ctrl[g].match_empty() != 0 {
                    t.ctrl[g].set(s, EMPTY);
                    t.resident.fetch_sub(1, Ordering::Relaxed);
                } else {
                    t.ctrl[g].set(s, TOMBSTONE);
                    t.dead.fetch_add(1, Ordering::Relaxed);
                }
                t.counters[g].set(s, 0);
                return true;
            }
            if t.ctrl[g].match_empty() != 0 {
                return false;
            }
            g += 1;
            if g >= n {
                g = 0;
            }
        }
    }

    /// Drops every entry, keeping the table dimensions, and starts a
    /// fresh arena of the same capacity.
    pub fn clear(&self) {
        let _put = self.put_lock.lock();
        let mut t = self.table.write();
        for row in t.ctrl.iter() {
            row.reset();
        }
        for row in t.counters.iter() {
            row.reset();
        }
        for row in t.slots.iter() {
            row.reset();
        }
        t.resident.store(0, Ordering::Relaxed);
        t.dead.store(0, Ordering::Relaxed);
        let cap = t.kv.cap();
        t.kv = KvHolder::new(cap);
        debug!(groups = t.ctrl.len(), "shard cleared");
    }

    /// Releases the table and arena. Subsequent operations miss or
    /// fail cleanly.
    pub fn close(&self) {
        let _put = self.put_lock.lock();
        let mut t = self.table.write();
        *t = Table::closed();
        debug!("shard closed");
    }

    // ============================================================================================
    // MAINTENANCE
    // ============================================================================================

    fn next_size(t: &Table) -> u32 {
        let g = t.ctrl.len() as u32;
        if t.dead() >= t.resident() / 2 {
            // Enough tombstones that reclaiming them alone relieves the
            // load; rebuild at the same width.
            g
        } else {
            (g as f64 * GROW_FACTOR).ceil() as u32
        }
    }

    /// Rebuilds ctrl/counters/slots and the arena into `n` groups,
    /// re-probing every live entry from its recomputed hash. Counter
    /// values survive. Caller holds `put_lock`.
    fn rebuild(&self, n: u32) -> (Table, u32) {
        let old = self.table.read();
        let new = Table::with_groups(n, old.kv.cap());
        let ng = new.ctrl.len();
        let mut copied = 0u32;
        for g in 0..old.ctrl.len() {
            for s in 0..GROUP_SIZE {
                if old.ctrl[g].get(s) < 0 {
                    continue;
                }
                let (k, v) = old.kv.entry_at(old.slots[g].get(s));
                let (h1, h2) = split_hash(hash_bytes(&self.hasher, k));
                let mut gn = probe_start(h1, ng);
                loop {
                    let mut empties = new.ctrl[gn].match_empty();
                    if empties != 0 {
                        let sn = next_match(&mut empties) as usize;
                        new.kv.gc_set(new.slots[gn].cell(sn), k, v);
                        new.ctrl[gn].set(sn, h2);
                        new.counters[gn].set(sn, old.counters[g].get(s));
                        copied += 1;
                        break;
                    }
                    gn += 1;
                    if gn >= ng {
                        gn = 0;
                    }
                }
            }
        }
        new.resident.store(copied, Ordering::Relaxed);
        (new, copied)
    }

    fn rehash(&self) {
        let n = {
            let t = self.table.read();
            Self::next_size(&t)
        };
        let (new, copied) = self.rebuild(n);
        let mut t = self.table.write();
        *t = new;
        debug!(groups = n, resident = copied, "rehash complete");
    }

    /// Compacts the arena in place (table width unchanged), erasing
    /// tombstones and garbage. Returns the tombstone count reclaimed
    /// and the bytes the arena shrank by.
    pub fn gc_copy(&self) -> Result<(usize, usize), Skip> {
        {
            let t = self.table.read();
            if t.kv.garbage_usage() < self.tun.garbage_rate {
                return Err(Skip::LowGarbage);
            }
        }
        if self
            .rehashing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Skip::Busy);
        }

        let _put = self.put_lock.lock();
        let (n, old_tail, dead_count) = {
            let t = self.table.read();
            (t.ctrl.len() as u32, t.kv.tail(), t.dead() as usize)
        };
        let (new, _) = self.rebuild(n);
        let new_tail = new.kv.tail();
        {
            let mut t = self.table.write();
            *t = new;
        }
        self.rehashing.store(false, Ordering::Release);
        let reclaimed = (old_tail - new_tail) as usize;
        debug!(dead = dead_count, reclaimed, "gc copy complete");
        Ok((dead_count, reclaimed))
    }

    /// Evicts the lowest-frequency entries when misses and memory
    /// pressure both warrant it, then ages every counter by the
    /// eviction threshold.
    pub fn eliminate(&self) -> Result<usize, Skip> {
        let qc = self.query_cnt.load(Ordering::Relaxed);
        if qc > 0 && (self.miss_cnt.load(Ordering::Relaxed) as f32 / qc as f32) < self.tun.eliminate_miss_rate
        {
            return Err(Skip::MissRateHealthy);
        }

        let items = {
            let t = self.table.read();
            if t.kv.items_mem_usage() < self.tun.eliminate_start {
                return Err(Skip::LowPressure);
            }
            t.kv.items()
        };
        let want = (items as f32 * (self.tun.eliminate_start - self.tun.eliminate_end)
            / self.tun.eliminate_start)
            .ceil() as usize;
        if want == 0 {
            return Err(Skip::NothingToDrop);
        }

        let _put = self.put_lock.lock();
        let t = self.table.read();
        let (victims, x) = build_min_top_counter(&t.ctrl, &t.counters, want);
        let mut del = 0usize;
        for &(g, s) in &victims {
            let (g, s) = (g as usize, s as usize);
            if t.ctrl[g].get(s) < 0 {
                continue;
            }
            t.kv.discard(t.slots[g].cell(s));
            t.ctrl[g].set(s, TOMBSTONE);
            t.counters[g].set(s, 0);
            t.dead.fetch_add(1, Ordering::Relaxed);
            del += 1;
        }
        for row in t.counters.iter() {
            row.saturating_sub_all(x);
        }
        debug!(evicted = del, threshold = x, "eliminate complete");
        Ok(del)
    }

    // ============================================================================================
    // INTROSPECTION
    // ============================================================================================

    /// Live entries in the arena.
    pub fn items(&self) -> u32 {
        self.table.read().kv.items()
    }

    /// Occupied slots (resident minus tombstones); equals `items`.
    pub fn count(&self) -> u32 {
        let t = self.table.read();
        t.resident() - t.dead()
    }

    /// Slots the table can still admit before rehashing.
    pub fn capacity(&self) -> u32 {
        let t = self.table.read();
        t.limit.saturating_sub(t.resident())
    }

    /// Bytes written into the arena so far, garbage included.
    pub fn used_mem(&self) -> u32 {
        self.table.read().kv.tail()
    }

    /// Bytes live entries account for.
    pub fn items_used_mem(&self) -> u32 {
        self.table.read().kv.items_used()
    }

    pub fn query_count(&self) -> u64 {
        self.query_cnt.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.miss_cnt.load(Ordering::Relaxed)
    }

    pub fn resident(&self) -> u32 {
        self.table.read().resident()
    }

    pub fn dead(&self) -> u32 {
        self.table.read().dead()
    }

    /// Probing groups currently allocated.
    pub fn groups(&self) -> usize {
        self.table.read().ctrl.len()
    }

    pub fn mem_usage(&self) -> f32 {
        self.table.read().kv.mem_usage()
    }

    pub fn items_mem_usage(&self) -> f32 {
        self.table.read().kv.items_mem_usage()
    }

    pub fn garbage_usage(&self) -> f32 {
        self.table.read().kv.garbage_usage()
    }

    /// Current frequency counter of `key`, if present. Does not count
    /// as a query and does not bump the counter.
    pub fn counter_of(&self, l: u64, key: &[u8]) -> Option<u8> {
        let t = self.table.read();
        if t.ctrl.is_empty() {
            return None;
        }
        let (h1, h2) = split_hash(l);
        let n = t.ctrl.len();
        let mut g = probe_start(h1, n);
        loop {
            let mut m = t.ctrl[g].match_h2(h2);
            while m != 0 {
                let s = next_match(&mut m) as usize;
                let hit = {
                    let _arena = t.kv.lock.read();
                    t.kv.key_at(t.slots[g].get(s)).is_some_and(|k| k == key)
                };
                if hit {
                    return Some(t.counters[g].get(s));
                }
            }
            if t.ctrl[g].match_empty() != 0 {
                return None;
            }
            g += 1;
            if g >= n {
                g = 0;
            }
        }
    }

    /// Largest value length a store accepts.
    pub const fn max_value_len() -> u32 {
        LIMIT_VALUE - 1
    }
}
