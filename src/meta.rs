//! Control-byte metadata and LFU counter rows.
//!
//! Each probing group covers 16 slots. A group's metadata is 16 signed
//! control bytes: `EMPTY`, `TOMBSTONE`, or a 7-bit tag in `[0, 127]`
//! taken from the low bits of the key hash. Matching a tag against a
//! whole row is a single 16-byte compare producing a bitmask; on
//! x86-64 this compiles to `pcmpeqb` + `pmovmskb`, elsewhere a scalar
//! loop computes the same mask.

use std::sync::atomic::{AtomicI8, AtomicU8, Ordering};

/// Slots per probing group; one SIMD register row.
pub const GROUP_SIZE: usize = 16;

/// Average per-group load that triggers a rehash (out of 16 slots).
pub const MAX_AVG_GROUP_LOAD: u32 = 14;

/// Control byte of a slot that has never held data (sign bit set).
pub const EMPTY: i8 = -128;

/// Control byte of a deleted slot that still terminates no probe.
pub const TOMBSTONE: i8 = -2;

/// Saturation point of the per-slot frequency counter.
pub const MAX_COUNT: u8 = u8::MAX;

/// One bit per slot in a group, lowest slot first.
pub type Bitset = u16;

/// Pops the lowest set bit and returns its slot index.
#[inline(always)]
pub fn next_match(mask: &mut Bitset) -> u32 {
    let s = mask.trailing_zeros();
    *mask &= *mask - 1;
    s
}

// ================================================================================================
// METADATA ROW
// ================================================================================================

/// 16 control bytes, one per slot of a group.
///
/// Bytes are written through relaxed atomics by mutators holding the
/// shard write gate; the row-wide SIMD load on the read path may race
/// with a single-byte store. A stale byte only produces a redundant
/// key comparison or a transient miss on a slot that is concurrently
/// dying, both of which the surrounding locks resolve.
#[repr(C, align(16))]
pub struct MetaGroup([AtomicI8; GROUP_SIZE]);

impl MetaGroup {
    pub fn new() -> Self {
        Self(std::array::from_fn(|_| AtomicI8::new(EMPTY)))
    }

    #[inline(always)]
    pub fn get(&self, s: usize) -> i8 {
        self.0[s].load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set(&self, s: usize, c: i8) {
        self.0[s].store(c, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        for c in &self.0 {
            c.store(EMPTY, Ordering::Relaxed);
        }
    }

    /// Bitmask of slots whose tag equals `h2`.
    #[inline(always)]
    pub fn match_h2(&self, h2: i8) -> Bitset {
        self.match_byte(h2)
    }

    /// Bitmask of slots that are `EMPTY` (tombstones excluded, so a
    /// non-zero result also terminates probing).
    #[inline(always)]
    pub fn match_empty(&self) -> Bitset {
        self.match_byte(EMPTY)
    }

    #[cfg(target_arch = "x86_64")]
    #[inline(always)]
    fn match_byte(&self, b: i8) -> Bitset {
        use core::arch::x86_64::*;
        // SAFETY: the row is 16-byte aligned and exactly 16 bytes;
        // AtomicI8 is layout-compatible with i8. Racing single-byte
        // stores make this a relaxed-tearing read by design (see type
        // docs).
        unsafe {
            let row = _mm_load_si128(self.0.as_ptr() as *const __m128i);
            let cmp = _mm_cmpeq_epi8(row, _mm_set1_epi8(b));
            _mm_movemask_epi8(cmp) as Bitset
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    #[inline(always)]
    fn match_byte(&self, b: i8) -> Bitset {
        let mut mask: Bitset = 0;
        for (i, c) in self.0.iter().enumerate() {
            if c.load(Ordering::Relaxed) == b {
                mask |= 1 << i;
            }
        }
        mask
    }
}

// ================================================================================================
// COUNTER ROW
// ================================================================================================

/// 16 saturating frequency counters, one per slot of a group.
///
/// Read-path bumps are relaxed load/store pairs; a lost increment
/// underreports frequency, which the eviction policy tolerates.
#[repr(C, align(16))]
pub struct CounterGroup([AtomicU8; GROUP_SIZE]);

impl CounterGroup {
    pub fn new() -> Self {
        Self(std::array::from_fn(|_| AtomicU8::new(0)))
    }

    #[inline(always)]
    pub fn get(&self, s: usize) -> u8 {
        self.0[s].load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set(&self, s: usize, v: u8) {
        self.0[s].store(v, Ordering::Relaxed);
    }

    /// Saturating increment, called from the read path on a hit.
    #[inline(always)]
    pub fn bump(&self, s: usize) {
        let c = self.0[s].load(Ordering::Relaxed);
        if c < MAX_COUNT {
            self.0[s].store(c + 1, Ordering::Relaxed);
        }
    }

    pub fn reset(&self) {
        for c in &self.0 {
            c.store(0, Ordering::Relaxed);
        }
    }

    /// Ages the whole row: every counter drops by `x`, floored at 0.
    ///
    /// Runs under the shard write gate. Concurrent read-path bumps may
    /// be overwritten; that is the same lost-update tolerance as
    /// `bump` itself.
    #[cfg(target_arch = "x86_64")]
    pub fn saturating_sub_all(&self, x: u8) {
        use core::arch::x86_64::*;
        // SAFETY: aligned 16-byte row, AtomicU8 is layout-compatible
        // with u8; see the bump/ageing race note above.
        unsafe {
            let p = self.0.as_ptr() as *mut __m128i;
            let row = _mm_load_si128(p);
            let sub = _mm_subs_epu8(row, _mm_set1_epi8(x as i8));
            _mm_store_si128(p, sub);
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub fn saturating_sub_all(&self, x: u8) {
        for c in &self.0 {
            let v = c.load(Ordering::Relaxed);
            c.store(v.saturating_sub(x), Ordering::Relaxed);
        }
    }
}

// ================================================================================================
// MIN-TOP SELECTION
// ================================================================================================

/// Finds the `n` occupied slots with the smallest counter values.
///
/// Returns the slot coordinates and the threshold (the largest counter
/// among the selected slots), which the caller subtracts from every row
/// to age the survivors. A bounded max-heap keeps the selection at
/// `O(slots * log n)`.
pub fn build_min_top_counter(
    ctrl: &[MetaGroup],
    counters: &[CounterGroup],
    n: usize,
) -> (Vec<(u32, u32)>, u8) {
    use std::collections::BinaryHeap;

    if n == 0 {
        return (Vec::new(), 0);
    }

    let mut heap: BinaryHeap<(u8, u32, u32)> = BinaryHeap::with_capacity(n + 1);
    for (g, row) in ctrl.iter().enumerate() {
        for s in 0..GROUP_SIZE {
            if row.get(s) < 0 {
                continue; // empty or tombstone
            }
            let c = counters[g].get(s);
            if heap.len() < n {
                heap.push((c, g as u32, s as u32));
            } else if let Some(&(top, _, _)) = heap.peek() {
                if c < top {
                    heap.pop();
                    heap.push((c, g as u32, s as u32));
                }
            }
        }
    }

    let x = heap.peek().map(|&(c, _, _)| c).unwrap_or(0);
    let coords = heap.into_iter().map(|(_, g, s)| (g, s)).collect();
    (coords, x)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_h2_finds_all_tags() {
        let m = MetaGroup::new();
        m.set(0, 42);
        m.set(5, 42);
        m.set(9, 7);
        let mut mask = m.match_h2(42);
        assert_eq!(next_match(&mut mask), 0);
        assert_eq!(next_match(&mut mask), 5);
        assert_eq!(mask, 0);
        assert_eq!(m.match_h2(7), 1 << 9);
        assert_eq!(m.match_h2(1), 0);
    }

    #[test]
    fn match_empty_ignores_tombstones() {
        let m = MetaGroup::new();
        assert_eq!(m.match_empty(), 0xFFFF);
        for s in 0..GROUP_SIZE {
            m.set(s, TOMBSTONE);
        }
        assert_eq!(m.match_empty(), 0);
        m.set(3, EMPTY);
        assert_eq!(m.match_empty(), 1 << 3);
    }

    #[test]
    fn counters_saturate_and_age() {
        let c = CounterGroup::new();
        for _ in 0..300 {
            c.bump(2);
        }
        assert_eq!(c.get(2), MAX_COUNT);

        c.set(0, 5);
        c.set(1, 80);
        c.saturating_sub_all(10);
        assert_eq!(c.get(0), 0);
        assert_eq!(c.get(1), 70);
        assert_eq!(c.get(2), MAX_COUNT - 10);
    }

    #[test]
    fn min_top_counter_picks_smallest_and_threshold() {
        let ctrl: Vec<MetaGroup> = (0..2).map(|_| MetaGroup::new()).collect();
        let counters: Vec<CounterGroup> = (0..2).map(|_| CounterGroup::new()).collect();

        ctrl[0].set(0, 1);
        counters[0].set(0, 9);
        ctrl[0].set(1, 2);
        counters[0].set(1, 3);
        ctrl[1].set(4, 3);
        counters[1].set(4, 1);
        // tombstoned slot with a tiny counter must not be selected
        ctrl[1].set(5, TOMBSTONE);
        counters[1].set(5, 0);

        let (coords, x) = build_min_top_counter(&ctrl, &counters, 2);
        assert_eq!(x, 3);
        assert_eq!(coords.len(), 2);
        assert!(coords.contains(&(1, 4)));
        assert!(coords.contains(&(0, 1)));
    }

    #[test]
    fn min_top_counter_wants_more_than_occupied() {
        let ctrl = vec![MetaGroup::new()];
        let counters = vec![CounterGroup::new()];
        ctrl[0].set(0, 10);
        counters[0].set(0, 7);

        let (coords, x) = build_min_top_counter(&ctrl, &counters, 5);
        assert_eq!(coords, vec![(0, 0)]);
        assert_eq!(x, 7);
    }
}
