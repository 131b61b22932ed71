//! Session ID allocation. IDs are handed out monotonically; released IDs
//! park in an ordered recycle pool that is only drawn from once it reaches a
//! threshold depth, so a just-released ID is not reissued while async
//! completions for it may still be in flight.

use std::collections::BTreeSet;

use crate::error::Error;

/// Identifies one live connection for its whole lifetime. 0 is reserved as
/// the unassigned/closed sentinel.
pub type SessionId = u32;

pub const DEFAULT_RECYCLE_THRESHOLD: usize = 4096;

pub struct IdAllocator {
    max: SessionId,
    next: SessionId,
    threshold: usize,
    pool: BTreeSet<SessionId>,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new(1, SessionId::MAX)
    }
}

impl IdAllocator {
    pub fn new(min: SessionId, max: SessionId) -> Self {
        Self::with_threshold(min, max, DEFAULT_RECYCLE_THRESHOLD)
    }

    pub fn with_threshold(min: SessionId, max: SessionId, threshold: usize) -> Self {
        assert!(min > 0 && min <= max);
        Self {
            max,
            next: min,
            threshold,
            pool: BTreeSet::new(),
        }
    }

    /// Returns a unique ID. Fails with `Error::IdExhausted` only once the
    /// whole `[min, max]` range has been issued and the recycle pool is
    /// below the threshold depth.
    pub fn acquire(&mut self) -> Result<SessionId, Error> {
        if self.pool.len() >= self.threshold {
            // smallest recycled ID first.
            return Ok(self.pool.pop_first().unwrap());
        }
        if self.next <= self.max {
            let id = self.next;
            self.next += 1;
            return Ok(id);
        }
        Err(Error::IdExhausted)
    }

    /// Returns an ID to the recycle pool. Releasing an ID that is already
    /// pooled is a caller bug.
    pub fn release(&mut self, id: SessionId) {
        debug_assert!(id > 0);
        let inserted = self.pool.insert(id);
        debug_assert!(inserted, "double release of session id {}", id);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    pub fn test_monotonic_from_min() {
        let mut ids = IdAllocator::new(1, 100);
        assert_eq!(ids.acquire().unwrap(), 1);
        assert_eq!(ids.acquire().unwrap(), 2);
        assert_eq!(ids.acquire().unwrap(), 3);
    }

    #[test]
    pub fn test_no_reuse_below_threshold() {
        let mut ids = IdAllocator::with_threshold(1, 1000, 4);
        for _ in 0..3 {
            let id = ids.acquire().unwrap();
            ids.release(id);
        }
        // pool holds {1, 2, 3}, below threshold: fresh IDs keep coming.
        assert_eq!(ids.acquire().unwrap(), 4);
        assert_eq!(ids.acquire().unwrap(), 5);
        ids.release(4);
        // pool {1,2,3,4} reached the threshold: smallest recycled ID drains.
        assert_eq!(ids.acquire().unwrap(), 1);
        // back below threshold, monotonic issue resumes.
        assert_eq!(ids.acquire().unwrap(), 6);
    }

    #[test]
    pub fn test_exhausted_without_releases() {
        let mut ids = IdAllocator::new(1, 5);
        for expect in 1..=5 {
            assert_eq!(ids.acquire().unwrap(), expect);
        }
        assert!(matches!(ids.acquire(), Err(Error::IdExhausted)));
    }

    #[test]
    pub fn test_pool_refills_after_exhaustion() {
        let mut ids = IdAllocator::with_threshold(1, 3, 2);
        for _ in 0..3 {
            ids.acquire().unwrap();
        }
        assert!(ids.acquire().is_err());
        ids.release(2);
        // one pooled ID is still below the threshold of 2.
        assert!(ids.acquire().is_err());
        ids.release(3);
        assert_eq!(ids.acquire().unwrap(), 2);
    }
}
