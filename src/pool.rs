//! Size-classed byte pool for value copies and a slab pool for arenas.
//!
//! `get` hands values out as copies; recycling those buffers keeps the
//! read path allocation-free in steady state. Arenas churn only during
//! rehash/GC/clear, so a small slab pool is enough to make a rebuild
//! swap allocation-free too.

use parking_lot::Mutex;

/// Buffer size classes, smallest first. The top class covers the
/// largest admissible value.
const CLASSES: [usize; 10] = [
    64,
    256,
    1 << 10,
    4 << 10,
    16 << 10,
    64 << 10,
    256 << 10,
    1 << 20,
    4 << 20,
    16 << 20,
];

/// Retained buffers per class; large classes keep only a handful so an
/// idle pool cannot pin hundreds of megabytes.
fn max_pooled(class: usize) -> usize {
    if CLASSES[class] <= 64 << 10 {
        32
    } else {
        4
    }
}

/// Retained arenas; these are large, keep few.
const MAX_POOLED_ARENAS: usize = 4;

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SHELF: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());

static BYTE_POOL: [Mutex<Vec<Vec<u8>>>; CLASSES.len()] = [EMPTY_SHELF; CLASSES.len()];

static ARENA_POOL: Mutex<Vec<Box<[u8]>>> = Mutex::new(Vec::new());

#[inline]
fn class_of(len: usize) -> Option<usize> {
    CLASSES.iter().position(|&c| len <= c)
}

// ================================================================================================
// POOLED VALUE
// ================================================================================================

/// A value copied out of a shard, backed by a pooled buffer.
///
/// Dereferences to the value bytes; dropping it returns the buffer to
/// its size class, so release happens exactly once and cannot be
/// forgotten.
pub struct PooledValue {
    buf: Vec<u8>,
    class: Option<usize>,
}

impl PooledValue {
    /// Takes a buffer of at least `len` bytes from the pool, sized to
    /// exactly `len`. Contents are zeroed only up to `len`.
    pub(crate) fn with_len(len: usize) -> Self {
        let class = class_of(len);
        let mut buf = match class {
            Some(c) => BYTE_POOL[c].lock().pop().unwrap_or_else(|| Vec::with_capacity(CLASSES[c])),
            // Larger than every class: a plain allocation, not recycled.
            None => Vec::with_capacity(len),
        };
        buf.clear();
        buf.resize(len, 0);
        Self { buf, class }
    }

    #[inline]
    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Length of the value in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl std::ops::Deref for PooledValue {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl AsRef<[u8]> for PooledValue {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl std::fmt::Debug for PooledValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledValue").field("len", &self.buf.len()).finish()
    }
}

impl Drop for PooledValue {
    fn drop(&mut self) {
        if let Some(c) = self.class {
            let mut shelf = BYTE_POOL[c].lock();
            if shelf.len() < max_pooled(c) {
                shelf.push(std::mem::take(&mut self.buf));
            }
        }
    }
}

// ================================================================================================
// ARENA SLAB POOL
// ================================================================================================

/// Takes an arena of exactly `cap` bytes, reusing a released one when
/// the size matches. Fresh allocations are zeroed; reused arenas keep
/// stale bytes, which is fine because readers only follow descriptors
/// to regions a writer has filled.
pub(crate) fn acquire_arena(cap: usize) -> Box<[u8]> {
    let mut pool = ARENA_POOL.lock();
    if let Some(i) = pool.iter().position(|a| a.len() == cap) {
        return pool.swap_remove(i);
    }
    drop(pool);
    vec![0u8; cap].into_boxed_slice()
}

pub(crate) fn release_arena(arena: Box<[u8]>) {
    if arena.is_empty() {
        return;
    }
    let mut pool = ARENA_POOL.lock();
    if pool.len() < MAX_POOLED_ARENAS {
        pool.push(arena);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_lookup() {
        assert_eq!(class_of(0), Some(0));
        assert_eq!(class_of(64), Some(0));
        assert_eq!(class_of(65), Some(1));
        assert_eq!(class_of(16 << 20), Some(9));
        assert_eq!(class_of((16 << 20) + 1), None);
    }

    #[test]
    fn pooled_value_round_trip() {
        let mut v = PooledValue::with_len(5);
        v.as_mut_slice().copy_from_slice(b"hello");
        assert_eq!(&*v, b"hello");
        let cap = v.buf.capacity();
        drop(v);

        // The next same-class request reuses the buffer.
        let v2 = PooledValue::with_len(7);
        assert!(v2.buf.capacity() >= cap.min(CLASSES[0]));
        assert_eq!(v2.len(), 7);
        assert!(v2.iter().all(|&b| b == 0));
    }

    #[test]
    fn arena_reuse_by_size() {
        // odd sizes no other test allocates; the pool is process-global
        let a = acquire_arena(5000);
        let p = a.as_ptr();
        release_arena(a);
        let b = acquire_arena(5000);
        assert_eq!(b.as_ptr(), p);
        assert_eq!(acquire_arena(9000).len(), 9000);
        release_arena(b);
    }
}
