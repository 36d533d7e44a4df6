//! # Stride Class
//!
//! Proportional-share scheduling. Every member holds a ticket share (a
//! percentage of the CPU) and a stride inversely proportional to it:
//!
//! ```text
//!   stride = STRIDE_CONSTANT / share
//! ```
//!
//! At each decision the scheduler picks the runnable member with the
//! smallest pass and advances that pass by the member's stride, so over
//! time each member runs in proportion to its share.
//!
//! The whole feedback class competes on the same timeline through one
//! aggregate record whose share is whatever the stride members have not
//! reserved. Reserving shrinks the aggregate; a departing member folds its
//! share back into it.

use crate::config::{MAX_STRIDE_SHARE, STRIDE_CONSTANT, TICKET_POOL};
use crate::error::{KernelError, Result};

/// Stride bookkeeping of one stride-class member, or of the feedback
/// aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrideRecord {
    /// Percentage of the ticket pool.
    pub share: u32,
    /// `STRIDE_CONSTANT / share`.
    pub stride: u64,
    /// Virtual time consumed so far. Only ever increases.
    pub pass: u64,
    /// Cleared exactly once, when the member leaves the class.
    pub valid: bool,
}

impl StrideRecord {
    pub const fn new(share: u32, pass: u64) -> Self {
        Self {
            share,
            stride: stride_for(share),
            pass,
            valid: true,
        }
    }

    /// Charge one selection to this record.
    #[inline]
    pub fn advance(&mut self) {
        self.pass = self.pass.saturating_add(self.stride);
    }

    /// Change the share and recompute the stride.
    #[inline]
    fn set_share(&mut self, share: u32) {
        self.share = share;
        self.stride = stride_for(share);
    }
}

/// Stride of a share. A zero share never reaches here: reservations keep
/// the aggregate above `TICKET_POOL - MAX_STRIDE_SHARE`.
#[inline]
pub const fn stride_for(share: u32) -> u64 {
    STRIDE_CONSTANT / share as u64
}

/// Global stride accounting: the feedback aggregate plus the reserved total.
#[derive(Debug, Clone, Copy)]
pub struct StridePool {
    aggregate: StrideRecord,
}

impl StridePool {
    /// A pool where the feedback aggregate owns every ticket.
    pub const fn new() -> Self {
        Self {
            aggregate: StrideRecord::new(TICKET_POOL, 0),
        }
    }

    pub fn aggregate(&self) -> &StrideRecord {
        &self.aggregate
    }

    pub fn aggregate_mut(&mut self) -> &mut StrideRecord {
        &mut self.aggregate
    }

    /// Sum of the shares currently held by stride members.
    #[inline]
    pub fn reserved(&self) -> u32 {
        TICKET_POOL - self.aggregate.share
    }

    /// Share a caller already holding `own` could be granted.
    #[inline]
    pub fn available(&self, own: u32) -> u32 {
        MAX_STRIDE_SHARE.saturating_sub(self.reserved()) + own
    }

    /// Grant `requested` percent to a task whose current record is
    /// `current` (None for a feedback task).
    ///
    /// A task that already holds a share is re-granted: its old share
    /// counts as available. Fails without touching the pool when the
    /// request is zero, larger than the pool, or exceeds what is left.
    /// A fresh member starts at `min_pass` so it cannot monopolize the CPU
    /// to catch up with older members.
    pub fn reserve(
        &mut self,
        requested: u32,
        current: Option<&StrideRecord>,
        min_pass: u64,
    ) -> Result<StrideRecord> {
        if requested == 0 || requested > TICKET_POOL {
            return Err(KernelError::InvalidShare);
        }
        let own = current.filter(|r| r.valid).map_or(0, |r| r.share);
        let available = self.available(own);
        if requested > available {
            return Err(KernelError::ShareExceeded { requested, available });
        }

        let share = self.aggregate.share + own - requested;
        self.aggregate.set_share(share);

        let pass = current.filter(|r| r.valid).map_or(min_pass, |r| r.pass.max(min_pass));
        Ok(StrideRecord::new(requested, pass))
    }

    /// Fold a departing member's share back into the aggregate.
    ///
    /// Returns false, and changes nothing, if the record was already
    /// released.
    pub fn release(&mut self, record: &mut StrideRecord) -> bool {
        if !record.valid {
            return false;
        }
        record.valid = false;
        let share = self.aggregate.share + record.share;
        self.aggregate.set_share(share);
        true
    }
}

impl Default for StridePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_initial_aggregate() {
        let pool = StridePool::new();
        assert_eq!(pool.aggregate().share, TICKET_POOL);
        assert_eq!(pool.aggregate().stride, STRIDE_CONSTANT / TICKET_POOL as u64);
        assert_eq!(pool.reserved(), 0);
    }

    #[test]
    fn test_reserve_shrinks_aggregate() {
        let mut pool = StridePool::new();
        let rec = pool.reserve(30, None, 0).unwrap();
        assert_eq!(rec.share, 30);
        assert_eq!(rec.stride, STRIDE_CONSTANT / 30);
        assert!(rec.valid);
        assert_eq!(pool.aggregate().share, 70);
        assert_eq!(pool.aggregate().stride, STRIDE_CONSTANT / 70);
    }

    #[test]
    fn test_second_sixty_percent_rejected() {
        let mut pool = StridePool::new();
        pool.reserve(60, None, 0).unwrap();
        let err = pool.reserve(60, None, 0).unwrap_err();
        assert_eq!(
            err,
            KernelError::ShareExceeded { requested: 60, available: 20 }
        );
        assert_eq!(pool.reserved(), 60);
        assert_eq!(pool.aggregate().share, 40);
    }

    #[test]
    fn test_invalid_requests() {
        let mut pool = StridePool::new();
        assert_eq!(pool.reserve(0, None, 0), Err(KernelError::InvalidShare));
        assert_eq!(pool.reserve(101, None, 0), Err(KernelError::InvalidShare));
        assert_eq!(pool.reserved(), 0);
    }

    #[test]
    fn test_aggregate_never_reaches_zero() {
        let mut pool = StridePool::new();
        pool.reserve(MAX_STRIDE_SHARE, None, 0).unwrap();
        assert!(pool.reserve(1, None, 0).is_err());
        assert_eq!(pool.aggregate().share, TICKET_POOL - MAX_STRIDE_SHARE);
    }

    #[test]
    fn test_rereserve_counts_own_share() {
        let mut pool = StridePool::new();
        let rec = pool.reserve(50, None, 0).unwrap();
        let rec = pool.reserve(80, Some(&rec), 0).unwrap();
        assert_eq!(rec.share, 80);
        assert_eq!(pool.reserved(), 80);
        let rec = pool.reserve(10, Some(&rec), 0).unwrap();
        assert_eq!(rec.share, 10);
        assert_eq!(pool.reserved(), 10);
    }

    #[test]
    fn test_release_exactly_once() {
        let mut pool = StridePool::new();
        let mut rec = pool.reserve(25, None, 0).unwrap();
        assert!(pool.release(&mut rec));
        assert_eq!(pool.aggregate().share, TICKET_POOL);
        assert_eq!(pool.aggregate().stride, STRIDE_CONSTANT / TICKET_POOL as u64);

        assert!(!pool.release(&mut rec));
        assert_eq!(pool.aggregate().share, TICKET_POOL);
    }

    #[test]
    fn test_fresh_member_starts_at_min_pass() {
        let mut pool = StridePool::new();
        let rec = pool.reserve(10, None, 5_000).unwrap();
        assert_eq!(rec.pass, 5_000);
    }

    #[test]
    fn test_advance() {
        let mut rec = StrideRecord::new(50, 0);
        rec.advance();
        rec.advance();
        assert_eq!(rec.pass, 2 * (STRIDE_CONSTANT / 50));
    }

    proptest! {
        #[test]
        fn prop_pool_never_overcommits(ops in prop::collection::vec((0u32..120, any::<bool>()), 0..100)) {
            let mut pool = StridePool::new();
            let mut members: std::vec::Vec<StrideRecord> = std::vec::Vec::new();
            for (share, leave) in ops {
                if leave && !members.is_empty() {
                    let mut rec = members.remove(0);
                    let before = pool.aggregate().share;
                    prop_assert!(pool.release(&mut rec));
                    prop_assert_eq!(pool.aggregate().share, before + rec.share);
                } else {
                    let before = pool.reserved();
                    match pool.reserve(share, None, 0) {
                        Ok(rec) => members.push(rec),
                        Err(_) => prop_assert_eq!(pool.reserved(), before),
                    }
                }
                let held: u32 = members.iter().filter(|r| r.valid).map(|r| r.share).sum();
                prop_assert_eq!(held + pool.aggregate().share, TICKET_POOL);
                prop_assert!(held <= MAX_STRIDE_SHARE);
                prop_assert_eq!(pool.aggregate().stride, STRIDE_CONSTANT / pool.aggregate().share as u64);
            }
        }
    }
}
