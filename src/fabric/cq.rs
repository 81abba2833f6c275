//! Completion queues and work completions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

/// Opcode of a completed work request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
    Recv,
}

/// Status of a completed work request.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum WcStatus {
    #[error("success")]
    Success,

    /// The work request was flushed from the queue at teardown. Expected
    /// during disconnect, not a failure of the link.
    #[error("work request flushed")]
    WrFlushErr,

    /// An inbound message did not fit the posted receive buffer.
    #[error("local length error")]
    LocLenErr,

    /// The remote key did not name a valid window, or the transfer fell
    /// outside it.
    #[error("remote access error")]
    RemAccessErr,

    /// A message arrived with no receive buffer posted.
    #[error("receiver-not-ready retry exceeded")]
    RnrRetryExcErr,

    #[error("general failure")]
    GeneralErr,
}

/// One work completion.
#[derive(Clone, Copy, Debug)]
pub struct Wc {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub byte_len: usize,
}

impl Wc {
    /// The completed byte count, or the failure status.
    #[inline]
    pub fn ok(&self) -> Result<usize, WcStatus> {
        match self.status {
            WcStatus::Success => Ok(self.byte_len),
            status => Err(status),
        }
    }
}

type CompHandler = Arc<dyn Fn() + Send + Sync>;

struct CqInner {
    queue: Mutex<VecDeque<Wc>>,
    /// Set while the consumer wants to be notified of the next completion.
    /// Cleared when the notification fires; [`Cq::rearm`] sets it again.
    armed: AtomicBool,
    handler: Mutex<Option<CompHandler>>,
}

/// A completion queue with edge-triggered notification.
///
/// Pushing a completion while the queue is armed disarms it and invokes the
/// handler on the pushing thread. The handler is expected to drain with
/// [`Cq::poll`] and then [`Cq::rearm`]; completions that slip in between are
/// reported by `rearm` returning `true`, and the handler must drain again.
#[derive(Clone)]
pub struct Cq {
    inner: Arc<CqInner>,
}

impl Cq {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CqInner {
                queue: Mutex::new(VecDeque::new()),
                armed: AtomicBool::new(false),
                handler: Mutex::new(None),
            }),
        }
    }

    /// Install the notification handler and arm the queue.
    pub fn set_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        *self.inner.handler.lock() = Some(Arc::new(handler));
        self.inner.armed.store(true, Ordering::Release);
    }

    /// Drop the notification handler. Completions still queue up but no
    /// longer notify anyone.
    pub fn clear_handler(&self) {
        self.inner.armed.store(false, Ordering::Release);
        *self.inner.handler.lock() = None;
    }

    pub(crate) fn push(&self, wc: Wc) {
        self.inner.queue.lock().push_back(wc);
        if self.inner.armed.swap(false, Ordering::AcqRel) {
            let handler = self.inner.handler.lock().clone();
            if let Some(handler) = handler {
                handler();
            }
        }
    }

    /// Pop the oldest completion, if any.
    pub fn poll(&self) -> Option<Wc> {
        self.inner.queue.lock().pop_front()
    }

    /// Request notification for the next completion. Returns `true` if
    /// completions are already pending, in which case the caller must poll
    /// again instead of waiting for a notification it may have missed.
    pub fn rearm(&self) -> bool {
        self.inner.armed.store(true, Ordering::Release);
        !self.inner.queue.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.lock().is_empty()
    }
}

impl Default for Cq {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn wc(wr_id: u64) -> Wc {
        Wc {
            wr_id,
            status: WcStatus::Success,
            opcode: WcOpcode::Send,
            byte_len: 0,
        }
    }

    #[test]
    fn test_edge_triggered_notification() {
        let cq = Cq::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        cq.set_handler(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        cq.push(wc(1));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // Disarmed: further pushes stay silent.
        cq.push(wc(2));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        assert_eq!(cq.poll().unwrap().wr_id, 1);
        // An entry is still queued, so rearming must report it.
        assert!(cq.rearm());
        assert_eq!(cq.poll().unwrap().wr_id, 2);
        assert!(!cq.rearm());

        cq.push(wc(3));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
