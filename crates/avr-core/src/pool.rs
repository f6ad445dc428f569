//! Fixed-capacity pool of transfer segments
//!
//! The pool carves one contiguous backing allocation into `count` segments of
//! `size` bytes. Segments are handed out as [`BufferLease`] values, which are
//! move-only: a lease can be parked inside exactly one in-flight command and
//! has to be given back to [`BufferPool::release`] before the segment can be
//! checked out again.
//!
//! ```text
//! backing: [ seg 0 | seg 1 | seg 2 | ... | seg N-1 ]
//!            ^ lease(0) travels with an ExchangeBuffer command
//! ```
//!
//! `free_count() + leased_count() == capacity()` holds after every call.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{AvrError, AvrResult};

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug)]
struct BufferEntry {
    offset: usize,
    capacity: usize,
    bytes_used: usize,
    free: bool,
}

/// Exclusive claim on one pool segment
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a lease that is dropped leaks its segment until the pool is reset"]
pub struct BufferLease {
    pool: u32,
    index: usize,
}

impl BufferLease {
    /// Index of the leased segment within its pool
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Pool of equally sized, pre-allocated transfer segments
#[derive(Debug)]
pub struct BufferPool {
    id: u32,
    backing: Vec<u8>,
    entries: Vec<BufferEntry>,
    free: usize,
}

impl BufferPool {
    /// Allocate `count` segments of `size` bytes each
    ///
    /// Fails with `ResourceExhausted` if the backing allocation cannot be made.
    pub fn allocate(count: usize, size: usize) -> AvrResult<Self> {
        if count > 0 && size == 0 {
            return Err(AvrError::validation("buffer_size", size, "> 0"));
        }

        let total = count.checked_mul(size).ok_or(AvrError::ResourceExhausted {
            what: "buffer pool",
            requested: usize::MAX,
        })?;

        let mut backing = Vec::new();
        backing
            .try_reserve_exact(total)
            .map_err(|_| AvrError::ResourceExhausted {
                what: "buffer pool",
                requested: total,
            })?;
        backing.resize(total, 0);

        let entries = (0..count)
            .map(|i| BufferEntry {
                offset: i * size,
                capacity: size,
                bytes_used: 0,
                free: true,
            })
            .collect();

        log::debug!("BufferPool: allocated {} x {} bytes", count, size);

        Ok(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            backing,
            entries,
            free: count,
        })
    }

    /// Total number of segments
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Number of segments available for checkout
    pub fn free_count(&self) -> usize {
        self.free
    }

    /// Number of segments currently leased
    pub fn leased_count(&self) -> usize {
        self.entries.len() - self.free
    }

    /// Size of each segment in bytes
    pub fn segment_size(&self) -> usize {
        self.entries.first().map(|e| e.capacity).unwrap_or(0)
    }

    /// Lease the lowest-numbered free segment, or `None` if all are leased
    pub fn checkout(&mut self) -> Option<BufferLease> {
        let index = self.entries.iter().position(|e| e.free)?;
        let entry = &mut self.entries[index];
        entry.free = false;
        entry.bytes_used = 0;
        self.free -= 1;
        Some(BufferLease { pool: self.id, index })
    }

    /// Return a leased segment to the pool
    ///
    /// Releasing a segment that is already free is a protocol violation and is
    /// reported rather than ignored.
    pub fn release(&mut self, lease: BufferLease) -> AvrResult<()> {
        let entry = self.entry_mut(&lease)?;
        if entry.free {
            log::error!("BufferPool: double release of entry {}", lease.index);
            return Err(AvrError::DoubleRelease { index: lease.index });
        }
        entry.free = true;
        self.free += 1;
        Ok(())
    }

    /// Copy `bytes` into the leased segment, truncating to its capacity
    ///
    /// Returns the number of bytes stored.
    pub fn fill(&mut self, lease: &BufferLease, bytes: &[u8]) -> AvrResult<usize> {
        let (offset, capacity) = {
            let entry = self.entry_mut(lease)?;
            let used = bytes.len().min(entry.capacity);
            entry.bytes_used = used;
            (entry.offset, used)
        };
        self.backing[offset..offset + capacity].copy_from_slice(&bytes[..capacity]);
        Ok(capacity)
    }

    /// The used part of a leased segment
    pub fn data(&self, lease: &BufferLease) -> AvrResult<&[u8]> {
        if lease.pool != self.id {
            return Err(AvrError::ForeignLease);
        }
        let entry = &self.entries[lease.index];
        Ok(&self.backing[entry.offset..entry.offset + entry.bytes_used])
    }

    /// Mark the used part of a leased segment as consumed
    pub fn clear(&mut self, lease: &BufferLease) -> AvrResult<()> {
        self.entry_mut(lease)?.bytes_used = 0;
        Ok(())
    }

    fn entry_mut(&mut self, lease: &BufferLease) -> AvrResult<&mut BufferEntry> {
        if lease.pool != self.id {
            return Err(AvrError::ForeignLease);
        }
        self.entries
            .get_mut(lease.index)
            .ok_or(AvrError::ForeignLease)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_balanced(pool: &BufferPool) {
        assert_eq!(pool.free_count() + pool.leased_count(), pool.capacity());
    }

    #[test]
    fn test_checkout_until_exhausted() {
        let mut pool = BufferPool::allocate(3, 64).unwrap();
        assert_balanced(&pool);

        let a = pool.checkout().unwrap();
        let b = pool.checkout().unwrap();
        let c = pool.checkout().unwrap();
        assert_balanced(&pool);
        assert_eq!(pool.free_count(), 0);

        // Fails closed once every entry is leased
        assert!(pool.checkout().is_none());

        pool.release(b).unwrap();
        assert_balanced(&pool);
        let again = pool.checkout().unwrap();
        assert_eq!(again.index(), 1);

        for lease in [a, again, c] {
            pool.release(lease).unwrap();
            assert_balanced(&pool);
        }
        assert_eq!(pool.free_count(), 3);
    }

    #[test]
    fn test_balance_holds_for_many_capacities() {
        for capacity in 0..12 {
            let mut pool = BufferPool::allocate(capacity, 16).unwrap();
            let mut leases = Vec::new();
            while let Some(lease) = pool.checkout() {
                leases.push(lease);
                assert_balanced(&pool);
            }
            assert_eq!(leases.len(), capacity);
            // Release in reverse to exercise non-FIFO returns
            while let Some(lease) = leases.pop() {
                pool.release(lease).unwrap();
                assert_balanced(&pool);
            }
            assert_eq!(pool.free_count(), capacity);
        }
    }

    #[test]
    fn test_double_release_is_detected() {
        let mut pool = BufferPool::allocate(2, 8).unwrap();
        let lease = pool.checkout().unwrap();
        let forged = BufferLease { pool: lease.pool, index: lease.index };
        pool.release(lease).unwrap();

        let err = pool.release(forged).unwrap_err();
        assert!(matches!(err, AvrError::DoubleRelease { index: 0 }));
        assert_eq!(pool.free_count(), 2);
        assert_balanced(&pool);
    }

    #[test]
    fn test_foreign_lease_rejected() {
        let mut first = BufferPool::allocate(1, 8).unwrap();
        let mut second = BufferPool::allocate(1, 8).unwrap();
        let lease = first.checkout().unwrap();
        assert!(matches!(second.release(lease), Err(AvrError::ForeignLease)));
        assert_eq!(second.free_count(), 1);
    }

    #[test]
    fn test_fill_truncates_to_segment() {
        let mut pool = BufferPool::allocate(2, 4).unwrap();
        let lease = pool.checkout().unwrap();
        let stored = pool.fill(&lease, &[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(stored, 4);
        assert_eq!(pool.data(&lease).unwrap(), &[1, 2, 3, 4]);
        pool.clear(&lease).unwrap();
        assert!(pool.data(&lease).unwrap().is_empty());
        pool.release(lease).unwrap();
    }

    #[test]
    fn test_oversized_allocation_fails() {
        let err = BufferPool::allocate(usize::MAX, 2).unwrap_err();
        assert!(matches!(err, AvrError::ResourceExhausted { .. }));
    }
}
