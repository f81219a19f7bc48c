//! The 4-slot ring of raw/work/CDS buffers that overlaps FETCH, deinterlace,
//! and FITS write across an exposure's frames (spec.md §3, §4.8, §5, §9).
//!
//! Each slot owns its own raw image buffer, deinterlaced work buffer, and
//! CDS-result buffer, plus an atomic write-lock and a per-slot completion
//! flag signalled through a shared condvar-equivalent (`Notify`). This
//! mirrors the pool-of-owned-slots shape of `daq-pool::Pool<T>` adapted to a
//! fixed-size ring instead of a free-list, and the seqlock/notify signalling
//! style of the host crate's memory-mapped ring buffer.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::{Notify, RwLock};

use crate::error::{ArchonError, Result};

/// Fixed ring length (`IMAGE_RING_BUFFER_SIZE` in spec.md §3).
pub const RING_SIZE: usize = 4;

/// One ring slot's lifecycle, replacing the original's scattered booleans
/// with a single sum type (spec.md §9, "Per-slot ring").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Reading,
    Deinterlacing,
    Writing,
}

struct Slot {
    image: RwLock<Vec<u8>>,
    work: RwLock<Vec<u8>>,
    cds: RwLock<Vec<u8>>,
    locked: AtomicBool,
    state: RwLock<SlotState>,
    deinterlaced: AtomicBool,
}

impl Slot {
    fn new() -> Self {
        Slot {
            image: RwLock::new(Vec::new()),
            work: RwLock::new(Vec::new()),
            cds: RwLock::new(Vec::new()),
            locked: AtomicBool::new(false),
            state: RwLock::new(SlotState::Empty),
            deinterlaced: AtomicBool::new(false),
        }
    }
}

/// The 4-slot ring. Owned by the controller session alongside the ACF
/// database and FITS writer (spec.md §3, "Ownership").
pub struct Ring {
    slots: [Slot; RING_SIZE],
    ringcount: AtomicUsize,
    deinter_notify: Notify,
}

impl Default for Ring {
    fn default() -> Self {
        Self::new()
    }
}

impl Ring {
    #[must_use]
    pub fn new() -> Self {
        Ring {
            slots: std::array::from_fn(|_| Slot::new()),
            ringcount: AtomicUsize::new(0),
            deinter_notify: Notify::new(),
        }
    }

    /// Current round-robin index, advanced by [`Ring::advance`].
    #[must_use]
    pub fn ringcount(&self) -> usize {
        self.ringcount.load(Ordering::Acquire)
    }

    /// Advances `ringcount` after an exposure frame is dispatched.
    pub fn advance(&self) -> usize {
        self.ringcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some((c + 1) % RING_SIZE)
            })
            .unwrap_or(0)
    }

    /// Resizes a slot's buffers to match `image_bytes`/`work_bytes`/
    /// `cds_bytes`, zeroing in place if sizes are unchanged, reallocating
    /// otherwise (spec.md §3, "Allocation policy").
    pub async fn ensure_capacity(
        &self,
        idx: usize,
        image_bytes: usize,
        work_bytes: usize,
        cds_bytes: usize,
    ) {
        resize_or_zero(&self.slots[idx].image, image_bytes).await;
        resize_or_zero(&self.slots[idx].work, work_bytes).await;
        resize_or_zero(&self.slots[idx].cds, cds_bytes).await;
    }

    /// Acquires slot `idx`'s write lock. Fails with
    /// [`ArchonError::RingOverflow`] if the reader thread has not yet
    /// cleared it from a prior frame (spec.md §4.4, §5).
    pub async fn lock_slot(&self, idx: usize) -> Result<()> {
        if self.slots[idx]
            .locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ArchonError::RingOverflow(idx));
        }
        *self.slots[idx].state.write().await = SlotState::Reading;
        Ok(())
    }

    /// Releases slot `idx`'s write lock after a read completes.
    pub fn unlock_slot(&self, idx: usize) {
        self.slots[idx].locked.store(false, Ordering::Release);
    }

    /// Whether slot `idx` is currently locked (used by invariant checks and
    /// tests — spec.md §8: "after `do_expose` returns, `ringlock[i] ==
    /// false` for all i").
    #[must_use]
    pub fn is_locked(&self, idx: usize) -> bool {
        self.slots[idx].locked.load(Ordering::Acquire)
    }

    /// Sets slot `idx`'s lifecycle state.
    pub async fn set_state(&self, idx: usize, state: SlotState) {
        *self.slots[idx].state.write().await = state;
    }

    /// Reads slot `idx`'s lifecycle state.
    pub async fn state(&self, idx: usize) -> SlotState {
        *self.slots[idx].state.read().await
    }

    /// Takes a write guard over slot `idx`'s raw image buffer (the FETCH
    /// destination).
    pub async fn image_mut(&self, idx: usize) -> tokio::sync::RwLockWriteGuard<'_, Vec<u8>> {
        self.slots[idx].image.write().await
    }

    /// Takes a write guard over slot `idx`'s deinterlaced work buffer.
    pub async fn work_mut(&self, idx: usize) -> tokio::sync::RwLockWriteGuard<'_, Vec<u8>> {
        self.slots[idx].work.write().await
    }

    /// Takes a write guard over slot `idx`'s CDS-result buffer.
    pub async fn cds_mut(&self, idx: usize) -> tokio::sync::RwLockWriteGuard<'_, Vec<u8>> {
        self.slots[idx].cds.write().await
    }

    /// Takes a read guard over slot `idx`'s deinterlaced work buffer (the
    /// FITS writer's source).
    pub async fn work(&self, idx: usize) -> tokio::sync::RwLockReadGuard<'_, Vec<u8>> {
        self.slots[idx].work.read().await
    }

    /// Takes a read guard over slot `idx`'s raw image buffer.
    pub async fn image(&self, idx: usize) -> tokio::sync::RwLockReadGuard<'_, Vec<u8>> {
        self.slots[idx].image.read().await
    }

    /// Clears the deinterlaced flag for slot `idx` (spec.md §4.4, "for mex
    /// runs, clear `ringbuf_deinterlaced[ringcount]`").
    pub fn clear_deinterlaced(&self, idx: usize) {
        self.slots[idx].deinterlaced.store(false, Ordering::Release);
    }

    /// Marks slot `idx` deinterlaced and wakes every waiter — the write
    /// thread for this slot and the CDS aggregator, if any (spec.md §4.5,
    /// §5).
    pub fn mark_deinterlaced(&self, idx: usize) {
        self.slots[idx].deinterlaced.store(true, Ordering::Release);
        self.deinter_notify.notify_waiters();
    }

    /// Waits until slot `idx` is marked deinterlaced. Also used by abort
    /// handling, which broadcasts on this same condvar to release waiters
    /// (spec.md §4.8).
    pub async fn wait_deinterlaced(&self, idx: usize) {
        loop {
            if self.slots[idx].deinterlaced.load(Ordering::Acquire) {
                return;
            }
            let notified = self.deinter_notify.notified();
            if self.slots[idx].deinterlaced.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    /// Wakes every deinterlace waiter without requiring the flag to be set —
    /// used by abort to release threads blocked in [`Ring::wait_deinterlaced`]
    /// (spec.md §4.8: "all waiting threads released by cv broadcast").
    pub fn broadcast_abort(&self) {
        self.deinter_notify.notify_waiters();
    }
}

async fn resize_or_zero(buf: &RwLock<Vec<u8>>, required: usize) {
    let mut guard = buf.write().await;
    if guard.len() == required {
        guard.iter_mut().for_each(|b| *b = 0);
    } else {
        *guard = vec![0u8; required];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_then_overflow_then_unlock() {
        let ring = Ring::new();
        ring.lock_slot(0).await.unwrap();
        let err = ring.lock_slot(0).await.unwrap_err();
        assert!(matches!(err, ArchonError::RingOverflow(0)));
        ring.unlock_slot(0);
        assert!(!ring.is_locked(0));
        ring.lock_slot(0).await.unwrap();
        ring.unlock_slot(0);
    }

    #[tokio::test]
    async fn advance_wraps_around_ring_size() {
        let ring = Ring::new();
        for expected in 1..RING_SIZE {
            ring.advance();
            assert_eq!(ring.ringcount(), expected);
        }
        ring.advance();
        assert_eq!(ring.ringcount(), 0);
    }

    #[tokio::test]
    async fn ensure_capacity_reallocates_on_size_change() {
        let ring = Ring::new();
        ring.ensure_capacity(0, 100, 50, 0).await;
        assert_eq!(ring.image(0).await.len(), 100);
        ring.ensure_capacity(0, 200, 50, 0).await;
        assert_eq!(ring.image(0).await.len(), 200);
    }

    #[tokio::test]
    async fn deinterlace_wait_unblocks_after_mark() {
        let ring = std::sync::Arc::new(Ring::new());
        ring.clear_deinterlaced(0);
        let waiter = {
            let ring = ring.clone();
            tokio::spawn(async move {
                ring.wait_deinterlaced(0).await;
            })
        };
        tokio::task::yield_now().await;
        ring.mark_deinterlaced(0);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter did not wake in time")
            .unwrap();
    }
}
