//! The key/value arena: one contiguous byte buffer per shard holding
//! 16-byte keys and variable-length values densely, addressed by packed
//! 32-bit slot descriptors.
//!
//! Record layout at an entry's key offset: 16 key bytes, then a 4-byte
//! descriptor word locating the value, then (for freshly appended
//! entries) the value bytes themselves. Updates may leave the value
//! elsewhere in the arena; abandoned regions become garbage until a
//! compacting copy rebuilds the buffer.
//!
//! All raw byte access in the crate lives in this module. Callers see
//! typed descriptors and outcome enums.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;

use crate::pool::{self, PooledValue};

/// Values below this length use the inline-capacity layout and can be
/// rewritten in place.
pub const OVER_SHORT: u32 = 256;

/// Values at or above this length carry their size in a 4-byte prefix.
pub const OVER_LONG: u32 = 32_768;

/// Hard per-value cap; a store at or above this is rejected.
pub const LIMIT_VALUE: u32 = 1 << 24;

/// Largest arena a 24-bit offset in 4-byte units can address.
pub const MAX_SHARD_MEM: u32 = 1 << 26;

/// Bytes every entry spends beside its value: 16-byte key + 4-byte
/// value descriptor.
pub const ENTRY_OVERHEAD: u32 = 20;

/// Rounds up to the 4-byte allocation granularity.
#[inline(always)]
pub const fn cap4(n: u32) -> u32 {
    (n + 3) & !3
}

// ================================================================================================
// SLOT DESCRIPTORS
// ================================================================================================

const OFFSET_MASK: u32 = 0x00FF_FFFF;
const SIZED_BIT: u32 = 1 << 31;

/// Word A of a slot: key offset in 4-byte units (bits 0..=23), a
/// 7-bit capacity-or-size field (bits 24..=30), and the layout bit
/// (bit 31). The all-zero word means the slot holds no data, which the
/// arena guarantees by never placing an entry at offset 0.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SlotWord(pub u32);

impl SlotWord {
    pub const EMPTY: SlotWord = SlotWord(0);

    /// Inline-capacity layout: the 7-bit field holds the reserved
    /// value capacity in 4-byte units.
    #[inline(always)]
    fn small(k_off4: u32, cap_units: u32) -> Self {
        SlotWord(k_off4 | cap_units << 24)
    }

    /// Sized layout: the 7-bit field holds the high bits of the value
    /// length; `big == 0` is the long-value sentinel (a real medium
    /// length is never below `OVER_SHORT`).
    #[inline(always)]
    fn sized(k_off4: u32, big: u32) -> Self {
        SlotWord(k_off4 | big << 24 | SIZED_BIT)
    }

    #[inline(always)]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Key offset in bytes.
    #[inline(always)]
    pub fn key_off(self) -> u32 {
        (self.0 & OFFSET_MASK) * 4
    }

    #[inline(always)]
    fn key_off4(self) -> u32 {
        self.0 & OFFSET_MASK
    }

    #[inline(always)]
    fn cap_or_big(self) -> u32 {
        (self.0 >> 24) & 0x7F
    }

    #[inline(always)]
    fn is_sized(self) -> bool {
        self.0 & SIZED_BIT != 0
    }
}

/// A decoded value location. Offsets are in bytes and point directly
/// at the value (the long layout's length prefix already consumed).
#[derive(Clone, Copy, Debug)]
pub(crate) enum ValueSlot {
    Small { off: u32, len: u32, cap: u32 },
    Medium { off: u32, len: u32 },
    Long { off: u32, len: u32 },
}

impl ValueSlot {
    #[inline(always)]
    pub fn off(&self) -> u32 {
        match *self {
            ValueSlot::Small { off, .. } | ValueSlot::Medium { off, .. } | ValueSlot::Long { off, .. } => off,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> u32 {
        match *self {
            ValueSlot::Small { len, .. } | ValueSlot::Medium { len, .. } | ValueSlot::Long { len, .. } => len,
        }
    }

    /// Bytes this value charges against `val_used`: the reserved
    /// capacity for small values, the rounded length for medium, and
    /// the rounded length plus prefix for long.
    #[inline(always)]
    fn charged(&self) -> u32 {
        match *self {
            ValueSlot::Small { cap, .. } => cap,
            ValueSlot::Medium { len, .. } => cap4(len),
            ValueSlot::Long { len, .. } => cap4(len) + 4,
        }
    }
}

/// The bytes of a value being stored: either one slice or a gather
/// list whose total length the caller has already validated.
pub(crate) enum ValueSource<'a> {
    One(&'a [u8]),
    Many { len: u32, parts: &'a [&'a [u8]] },
}

impl ValueSource<'_> {
    #[inline(always)]
    pub fn len(&self) -> u32 {
        match *self {
            ValueSource::One(v) => v.len() as u32,
            ValueSource::Many { len, .. } => len,
        }
    }

    /// # Safety
    /// `dst` must be valid for `self.len()` bytes.
    #[inline(always)]
    unsafe fn copy_to(&self, mut dst: *mut u8) {
        match *self {
            ValueSource::One(v) => std::ptr::copy_nonoverlapping(v.as_ptr(), dst, v.len()),
            ValueSource::Many { parts, .. } => {
                for p in parts {
                    std::ptr::copy_nonoverlapping(p.as_ptr(), dst, p.len());
                    dst = dst.add(p.len());
                }
            }
        }
    }
}

/// What an in-slot value update did.
pub(crate) enum UpdateOutcome {
    /// Value stored (in place or appended); the slot stays live.
    Done,
    /// The slot died: the store was rejected or the arena is full.
    /// The entry's bytes are already uncharged and the slot word
    /// cleared; the caller tombstones the control byte.
    Dead,
}

// ================================================================================================
// KV HOLDER
// ================================================================================================

/// Arena buffer plus its occupancy accounting.
///
/// `lock` is the arena RW gate: readers hold it shared around every
/// byte access that can race with a writer; writers hold it exclusive
/// around every externally observable write (descriptor words and
/// reachable value bytes). Appends into the unpublished tail region
/// need no gate; no descriptor reaches them yet.
///
/// The scalar fields are relaxed atomics: they are only written under
/// the shard's write gate, and read-side consumers (admission checks,
/// introspection) tolerate a stale value.
pub(crate) struct KvHolder {
    data: UnsafeCell<Box<[u8]>>,
    pub lock: RwLock<()>,
    cap: u32,
    limit: u32,
    tail: AtomicU32,
    items: AtomicU32,
    val_used: AtomicU32,
}

// SAFETY: the byte buffer behind `data` is only mutated through the
// locking discipline above; `Box<[u8]>` itself is replaced only when
// the holder is exclusively borrowed.
unsafe impl Send for KvHolder {}
unsafe impl Sync for KvHolder {}

/// First usable byte offset. Burning the first word keeps every real
/// key offset non-zero, so `SlotWord(0)` can mean "no data".
const TAIL_BASE: u32 = 4;

impl KvHolder {
    pub fn new(cap: u32) -> Self {
        Self {
            data: UnsafeCell::new(pool::acquire_arena(cap as usize)),
            lock: RwLock::new(()),
            cap,
            limit: cap.saturating_sub(cap / 16),
            tail: AtomicU32::new(TAIL_BASE),
            items: AtomicU32::new(0),
            val_used: AtomicU32::new(0),
        }
    }

    /// A zero-capacity holder for a closed shard.
    pub fn closed() -> Self {
        Self {
            data: UnsafeCell::new(Box::new([])),
            lock: RwLock::new(()),
            cap: 0,
            limit: 0,
            tail: AtomicU32::new(TAIL_BASE),
            items: AtomicU32::new(0),
            val_used: AtomicU32::new(0),
        }
    }

    #[inline(always)]
    fn ptr(&self) -> *mut u8 {
        // SAFETY: we never hand out a unique reference to the buffer;
        // all access goes through raw pointers below.
        unsafe { (*self.data.get()).as_ptr() as *mut u8 }
    }

    #[inline(always)]
    pub fn cap(&self) -> u32 {
        self.cap
    }

    /// Admission high-water mark checked before inserts.
    #[inline(always)]
    pub fn limit(&self) -> u32 {
        self.limit
    }

    #[inline(always)]
    pub fn tail(&self) -> u32 {
        self.tail.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn items(&self) -> u32 {
        self.items.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn val_used(&self) -> u32 {
        self.val_used.load(Ordering::Relaxed)
    }

    /// Bytes live entries occupy, overhead and reserved slack included.
    #[inline(always)]
    pub fn items_used(&self) -> u32 {
        self.items() * ENTRY_OVERHEAD + self.val_used() + TAIL_BASE
    }

    #[inline(always)]
    pub fn mem_usage(&self) -> f32 {
        if self.cap == 0 {
            return 1.0;
        }
        self.tail() as f32 / self.cap as f32
    }

    #[inline(always)]
    pub fn items_mem_usage(&self) -> f32 {
        if self.cap == 0 {
            return 1.0;
        }
        self.items_used() as f32 / self.cap as f32
    }

    /// Fraction of the written region no live entry reaches.
    #[inline(always)]
    pub fn garbage_usage(&self) -> f32 {
        let tail = self.tail();
        if tail == 0 {
            return 0.0;
        }
        (tail - self.items_used()) as f32 / tail as f32
    }

    // --------------------------------------------------------------------------------------------
    // raw access
    // --------------------------------------------------------------------------------------------

    #[inline(always)]
    fn read_u32(&self, off: u32) -> u32 {
        debug_assert!(off + 4 <= self.cap);
        // SAFETY: offset bounds asserted; see module locking rules.
        unsafe { (self.ptr().add(off as usize) as *const u32).read_unaligned().to_le() }
    }

    #[inline(always)]
    fn write_u32(&self, off: u32, v: u32) {
        debug_assert!(off + 4 <= self.cap);
        // SAFETY: as for read_u32.
        unsafe { (self.ptr().add(off as usize) as *mut u32).write_unaligned(v.to_le()) }
    }

    #[inline(always)]
    fn slice(&self, off: u32, len: u32) -> &[u8] {
        debug_assert!(off + len <= self.cap);
        // SAFETY: offset bounds asserted; the returned bytes are only
        // mutated under the exclusive arena gate.
        unsafe { std::slice::from_raw_parts(self.ptr().add(off as usize), len as usize) }
    }

    #[inline(always)]
    unsafe fn write_bytes(&self, off: u32, src: &ValueSource<'_>) {
        debug_assert!(off + src.len() <= self.cap);
        src.copy_to(self.ptr().add(off as usize));
    }

    // --------------------------------------------------------------------------------------------
    // reads
    // --------------------------------------------------------------------------------------------

    /// The 16-byte key of a live slot. Callers hold the arena gate
    /// shared (readers) or the shard write gate (mutators).
    #[inline(always)]
    pub fn key_at(&self, w: SlotWord) -> Option<&[u8]> {
        if w.is_empty() {
            return None;
        }
        Some(self.slice(w.key_off(), 16))
    }

    /// Decodes a live slot's value location, resolving the long
    /// layout's length prefix.
    #[inline(always)]
    pub fn value_slot(&self, w: SlotWord) -> ValueSlot {
        debug_assert!(!w.is_empty());
        let header = self.read_u32(w.key_off() + 16);
        let v_off = (header & OFFSET_MASK) * 4;
        let small = header >> 24;
        if !w.is_sized() {
            ValueSlot::Small { off: v_off, len: small, cap: w.cap_or_big() * 4 }
        } else {
            let size = w.cap_or_big() << 8 | small;
            if size == 0 {
                let len = self.read_u32(v_off);
                ValueSlot::Long { off: v_off + 4, len }
            } else {
                ValueSlot::Medium { off: v_off, len: size }
            }
        }
    }

    /// Copies a value out into a pooled buffer. The caller holds the
    /// arena gate shared for the duration of the call.
    pub fn read_value(&self, vs: ValueSlot) -> PooledValue {
        let mut out = PooledValue::with_len(vs.len() as usize);
        out.as_mut_slice().copy_from_slice(self.slice(vs.off(), vs.len()));
        out
    }

    /// Key and value slices of a live slot, for rebuild copies. The
    /// caller holds the shard write gate, so nothing mutates the
    /// entry underneath.
    pub fn entry_at(&self, w: SlotWord) -> (&[u8], &[u8]) {
        let vs = self.value_slot(w);
        (self.slice(w.key_off(), 16), self.slice(vs.off(), vs.len()))
    }

    // --------------------------------------------------------------------------------------------
    // writes
    // --------------------------------------------------------------------------------------------

    /// Appends a fresh entry and publishes its descriptor into `slot`.
    /// Returns false when the arena cannot fit it; the slot is left
    /// untouched.
    pub fn insert(&self, slot: &AtomicU32, key: &[u8], src: &ValueSource<'_>) -> bool {
        debug_assert_eq!(key.len(), 16);
        let lv = src.len();
        let tail = self.tail();
        let v_cap = if lv >= OVER_LONG { cap4(lv) + 4 } else { cap4(lv) };
        let ntail = tail + ENTRY_OVERHEAD + v_cap;
        if ntail > self.cap {
            return false;
        }

        let k_off4 = tail / 4;
        let k_end = tail + 16;
        // SAFETY: the region [tail, ntail) is unpublished; no reader
        // can reach it before the descriptor stores below.
        unsafe {
            std::ptr::copy_nonoverlapping(key.as_ptr(), self.ptr().add(tail as usize), 16);
        }
        let (word, header) = if lv >= OVER_LONG {
            let v_off = k_end + 4;
            self.write_u32(v_off, lv);
            unsafe { self.write_bytes(v_off + 4, src) };
            (SlotWord::sized(k_off4, 0), v_off / 4)
        } else if lv >= OVER_SHORT {
            let v_off = k_end + 4;
            unsafe { self.write_bytes(v_off, src) };
            (SlotWord::sized(k_off4, lv >> 8), v_off / 4 | (lv & 0xFF) << 24)
        } else {
            let v_off = k_end + 4;
            unsafe { self.write_bytes(v_off, src) };
            (SlotWord::small(k_off4, v_cap / 4), v_off / 4 | lv << 24)
        };

        {
            let _g = self.lock.write();
            self.write_u32(k_end, header);
            slot.store(word.0, Ordering::Relaxed);
        }

        self.items.fetch_add(1, Ordering::Relaxed);
        self.val_used.fetch_add(v_cap, Ordering::Relaxed);
        self.tail.store(ntail, Ordering::Relaxed);
        true
    }

    /// Replaces the value of the live slot behind `slot`.
    ///
    /// Branch order: reject oversize, append long, append medium,
    /// rewrite small in place when the reserved capacity fits,
    /// otherwise append small. Every append uncharges the old region
    /// first; when the arena cannot take the new value the slot dies
    /// with the old value already abandoned, and the caller sees
    /// `Dead`.
    pub fn update(&self, slot: &AtomicU32, src: &ValueSource<'_>) -> UpdateOutcome {
        let w = SlotWord(slot.load(Ordering::Relaxed));
        debug_assert!(!w.is_empty());
        let vs = self.value_slot(w);
        let lv = src.len();
        let k_end = w.key_off() + 16;

        if lv >= LIMIT_VALUE {
            return self.kill(slot, &vs);
        }

        if lv < OVER_SHORT {
            if let ValueSlot::Small { off, cap, .. } = vs {
                if lv <= cap {
                    // In-place fast path: value bytes stay put, only the
                    // header's length byte moves. No garbage, no tail.
                    let _g = self.lock.write();
                    self.write_u32(k_end, off / 4 | lv << 24);
                    unsafe { self.write_bytes(off, src) };
                    return UpdateOutcome::Done;
                }
            }
        }

        // Append path: the old region becomes garbage either way.
        self.val_used.fetch_sub(vs.charged(), Ordering::Relaxed);
        let tail = self.tail();
        let v_cap = if lv >= OVER_LONG { cap4(lv) + 4 } else { cap4(lv) };
        let ntail = tail + v_cap;
        if ntail > self.cap {
            self.items.fetch_sub(1, Ordering::Relaxed);
            let _g = self.lock.write();
            slot.store(SlotWord::EMPTY.0, Ordering::Relaxed);
            return UpdateOutcome::Dead;
        }

        let k_off4 = w.key_off4();
        let (word, header) = if lv >= OVER_LONG {
            self.write_u32(tail, lv);
            unsafe { self.write_bytes(tail + 4, src) };
            (SlotWord::sized(k_off4, 0), tail / 4)
        } else if lv >= OVER_SHORT {
            unsafe { self.write_bytes(tail, src) };
            (SlotWord::sized(k_off4, lv >> 8), tail / 4 | (lv & 0xFF) << 24)
        } else {
            unsafe { self.write_bytes(tail, src) };
            (SlotWord::small(k_off4, v_cap / 4), tail / 4 | lv << 24)
        };

        {
            let _g = self.lock.write();
            self.write_u32(k_end, header);
            slot.store(word.0, Ordering::Relaxed);
        }

        self.val_used.fetch_add(v_cap, Ordering::Relaxed);
        self.tail.store(ntail, Ordering::Relaxed);
        UpdateOutcome::Done
    }

    /// Uncharges an entry and clears its slot word. Used by oversize
    /// rejection, delete, and eviction.
    fn kill(&self, slot: &AtomicU32, vs: &ValueSlot) -> UpdateOutcome {
        self.val_used.fetch_sub(vs.charged(), Ordering::Relaxed);
        self.items.fetch_sub(1, Ordering::Relaxed);
        let _g = self.lock.write();
        slot.store(SlotWord::EMPTY.0, Ordering::Relaxed);
        UpdateOutcome::Dead
    }

    /// Drops the live entry behind `slot`; its bytes become garbage.
    pub fn discard(&self, slot: &AtomicU32) {
        let w = SlotWord(slot.load(Ordering::Relaxed));
        debug_assert!(!w.is_empty());
        let vs = self.value_slot(w);
        let _ = self.kill(slot, &vs);
    }

    /// Rebuild-path insert into a fresh arena. Compaction never grows
    /// the live byte count, so this cannot fail on a same-capacity
    /// arena; hitting the wall anyway is a corrupted-accounting bug.
    pub fn gc_set(&self, slot: &AtomicU32, key: &[u8], value: &[u8]) {
        if !self.insert(slot, key, &ValueSource::One(value)) {
            unreachable!("compacted entry exceeds arena capacity");
        }
    }
}

impl Drop for KvHolder {
    fn drop(&mut self) {
        pool::release_arena(std::mem::take(self.data.get_mut()));
    }
}
