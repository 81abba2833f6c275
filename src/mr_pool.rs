//! Fixed-capacity registration slot pools.
//!
//! Every link carries one pool for its RDMA transfer windows. A slot must
//! be acquired before a buffer can be registered through it; registration
//! replaces the slot's previous window binding, posting an invalidation for
//! it in the same step unless the remote side is trusted to have done so.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::fabric::{DmaBuf, Fabric, RemoteMem};
use crate::link::NodeId;

/// Slots per pool. The bitmap below relies on this fitting one word.
pub const MR_POOL_SIZE: usize = 64;

/// Default wait for a free slot before giving up.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

struct PoolState {
    /// One bit per slot, set while the slot is held.
    bitmap: u64,
    /// Remote key of each slot's current window binding, if any.
    rkeys: [Option<u32>; MR_POOL_SIZE],
}

/// A pool of [`MR_POOL_SIZE`] registration slots for one peer.
///
/// Acquisition blocks for a bounded time when all slots are held and then
/// fails with [`Error::SlotPoolExhausted`]. Releasing a slot that is not
/// held is a programming error and panics.
pub struct SlotPool {
    fabric: Fabric,
    peer: NodeId,
    acquire_timeout: Duration,
    state: Mutex<PoolState>,
    freed: Condvar,
}

impl SlotPool {
    pub(crate) fn new(fabric: &Fabric, peer: NodeId) -> Self {
        Self {
            fabric: fabric.clone(),
            peer,
            acquire_timeout: ACQUIRE_TIMEOUT,
            state: Mutex::new(PoolState {
                bitmap: 0,
                rkeys: [None; MR_POOL_SIZE],
            }),
            freed: Condvar::new(),
        }
    }

    /// Override how long `acquire` waits for a free slot.
    pub(crate) fn set_acquire_timeout(&mut self, timeout: Duration) {
        self.acquire_timeout = timeout;
    }

    /// Acquire a free slot, waiting up to the pool's bounded timeout.
    pub fn acquire(&self) -> Result<u32> {
        let deadline = Instant::now() + self.acquire_timeout;
        let mut state = self.state.lock();
        loop {
            let slot = (!state.bitmap).trailing_zeros();
            if (slot as usize) < MR_POOL_SIZE {
                state.bitmap |= 1 << slot;
                return Ok(slot);
            }
            log::warn!(
                "registration slots for node {} exhausted, waiting",
                self.peer
            );
            if self.freed.wait_until(&mut state, deadline).timed_out() {
                return Err(Error::SlotPoolExhausted(self.peer));
            }
        }
    }

    /// Release a held slot, waking one waiting acquirer.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not currently held.
    pub fn release(&self, slot: u32) {
        assert!((slot as usize) < MR_POOL_SIZE, "slot {} out of range", slot);
        let mut state = self.state.lock();
        assert!(
            state.bitmap & (1 << slot) != 0,
            "registration slot {} released twice",
            slot
        );
        state.bitmap &= !(1 << slot);
        self.freed.notify_one();
    }

    /// Register `buf[offset..offset + len]` through a held slot, replacing
    /// the slot's previous binding. When `post_invalidate` is set the old
    /// window is invalidated here; otherwise the remote side is trusted to
    /// have invalidated it already.
    pub fn register(
        &self,
        slot: u32,
        buf: &DmaBuf,
        offset: usize,
        len: usize,
        post_invalidate: bool,
    ) -> RemoteMem {
        let mut state = self.state.lock();
        assert!(
            state.bitmap & (1 << slot) != 0,
            "registration through a free slot"
        );
        let prev = state.rkeys[slot as usize].take();
        let invalidate = if post_invalidate { prev } else { None };
        let rkey = self
            .fabric
            .rebind_window(invalidate, buf.clone(), offset, len);
        state.rkeys[slot as usize] = Some(rkey);
        RemoteMem {
            rkey,
            offset: 0,
            len: len as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_cycle() {
        let pool = SlotPool::new(&Fabric::new(), 1);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a, b);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.acquire().unwrap(), a.min(b));
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn test_double_release_panics() {
        let pool = SlotPool::new(&Fabric::new(), 1);
        let slot = pool.acquire().unwrap();
        pool.release(slot);
        pool.release(slot);
    }

    #[test]
    fn test_exhaustion_unblocks_on_release() {
        use std::sync::Arc;
        let pool = Arc::new(SlotPool::new(&Fabric::new(), 2));
        let mut held = Vec::new();
        for _ in 0..MR_POOL_SIZE {
            held.push(pool.acquire().unwrap());
        }
        let releaser = {
            let pool = pool.clone();
            let slot = held.pop().unwrap();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                pool.release(slot);
            })
        };
        // Blocks until the releaser frees a slot.
        let slot = pool.acquire().unwrap();
        releaser.join().unwrap();
        pool.release(slot);
        for slot in held {
            pool.release(slot);
        }
    }

    #[test]
    fn test_exhaustion_times_out_when_nothing_frees() {
        let mut pool = SlotPool::new(&Fabric::new(), 3);
        pool.set_acquire_timeout(Duration::from_millis(20));
        let mut held = Vec::new();
        for _ in 0..MR_POOL_SIZE {
            held.push(pool.acquire().unwrap());
        }
        assert!(matches!(
            pool.acquire(),
            Err(Error::SlotPoolExhausted(3))
        ));
        // The failed acquire must not have claimed anything.
        pool.release(held.pop().unwrap());
        pool.acquire().unwrap();
    }

    #[test]
    fn test_register_rebinds_window() {
        let fabric = Fabric::new();
        let pool = SlotPool::new(&fabric, 1);
        let slot = pool.acquire().unwrap();

        let buf = DmaBuf::from_slice(b"window contents");
        let first = pool.register(slot, &buf, 0, buf.len(), true);
        let second = pool.register(slot, &buf, 0, 6, true);
        assert_ne!(first.rkey, second.rkey);
        assert_eq!(second.len, 6);
        pool.release(slot);
    }
}
