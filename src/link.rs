//! Per-peer link state.
//!
//! A [`Link`] owns every fabric resource tied to one remote node: the
//! connection-manager id, the queue pair, the completion queue, the posted
//! receive buffers, and the registration slot pool. It also carries the
//! connection state machine and the completion flags the synchronous
//! operation paths block on.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::fabric::{CmId, Cq, DmaBuf, Fabric, Qp};
use crate::mr_pool::SlotPool;

/// Node identifier: an index into the node table.
pub type NodeId = usize;

/// Receive buffers kept posted per link.
pub const MAX_RECV_WR: usize = 128;

/// Send-queue depth per link, tracked for the outstanding-request check.
pub const MAX_SEND_WR: usize = 128;

/// Which side initiated the connection, fixed by the ascending-id rule:
/// the higher-numbered node connects, the lower-numbered node listens.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkRole {
    Connector,
    Listener,
    /// The table entry for the local node itself. Carries no fabric
    /// resources and accepts no traffic.
    Loopback,
}

/// Connection state machine. `Error` is absorbing: a link never leaves it,
/// and every operation on an errored link fails immediately.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkState {
    Idle,
    AddrResolved,
    RouteResolved,
    Connecting,
    ConnectRequest,
    Connected,
    Error,
}

/// The synchronous operation classes a caller can block on. At most one of
/// each is in flight per link, enforced by the per-class locks below.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum OpKind {
    Send,
    Write,
    Read,
}

#[derive(Default)]
struct OpFlags {
    send_done: bool,
    write_done: bool,
    read_done: bool,
    /// Mirrors the error state under the flags lock so a waiter cannot miss
    /// the error wakeup.
    errored: bool,
}

pub struct Link {
    peer: NodeId,
    role: LinkRole,
    state: Mutex<LinkState>,
    state_changed: Condvar,
    ops: Mutex<OpFlags>,
    op_done: Condvar,
    cq: Cq,
    cm: OnceLock<CmId>,
    qp: OnceLock<Qp>,
    recv_bufs: OnceLock<Vec<DmaBuf>>,
    rdma_slots: SlotPool,
    /// Serializes message sends: at most one signaled send in flight.
    pub(crate) send_lock: Mutex<()>,
    /// Serializes active-side RDMA requests.
    pub(crate) active_lock: Mutex<()>,
    /// Serializes passive-side RDMA service.
    pub(crate) passive_lock: Mutex<()>,
    /// Serializes work-request posting against completion accounting.
    pub(crate) post_lock: Mutex<()>,
    outstanding: AtomicUsize,
}

impl Link {
    pub(crate) fn new(fabric: &Fabric, peer: NodeId, role: LinkRole) -> Arc<Self> {
        Arc::new(Self {
            peer,
            role,
            state: Mutex::new(LinkState::Idle),
            state_changed: Condvar::new(),
            ops: Mutex::new(OpFlags::default()),
            op_done: Condvar::new(),
            cq: Cq::new(),
            cm: OnceLock::new(),
            qp: OnceLock::new(),
            recv_bufs: OnceLock::new(),
            rdma_slots: SlotPool::new(fabric, peer),
            send_lock: Mutex::new(()),
            active_lock: Mutex::new(()),
            passive_lock: Mutex::new(()),
            post_lock: Mutex::new(()),
            outstanding: AtomicUsize::new(0),
        })
    }

    #[inline]
    pub fn peer(&self) -> NodeId {
        self.peer
    }

    #[inline]
    pub fn role(&self) -> LinkRole {
        self.role
    }

    #[inline]
    pub(crate) fn cq(&self) -> &Cq {
        &self.cq
    }

    pub(crate) fn set_cm(&self, cm: CmId) {
        if self.cm.set(cm).is_err() {
            log::error!("link {} already has a CM id", self.peer);
        }
    }

    pub(crate) fn cm(&self) -> Option<&CmId> {
        self.cm.get()
    }

    pub(crate) fn set_qp(&self, qp: Qp) {
        if self.qp.set(qp).is_err() {
            log::error!("link {} already has a queue pair", self.peer);
        }
    }

    pub(crate) fn qp(&self) -> Result<&Qp> {
        self.qp.get().ok_or(Error::NotConnected(self.peer))
    }

    pub(crate) fn set_recv_bufs(&self, bufs: Vec<DmaBuf>) {
        if self.recv_bufs.set(bufs).is_err() {
            log::error!("link {} already has receive buffers", self.peer);
        }
    }

    pub(crate) fn recv_bufs(&self) -> &[DmaBuf] {
        self.recv_bufs.get().map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn rdma_slots(&self) -> &SlotPool {
        &self.rdma_slots
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    /// Advance the connection state machine. The error state is absorbing.
    pub(crate) fn set_state(&self, next: LinkState) {
        let mut state = self.state.lock();
        if *state == LinkState::Error {
            return;
        }
        *state = next;
        self.state_changed.notify_all();
    }

    /// Put the link into its terminal error state and wake every waiter.
    pub(crate) fn set_error(&self) {
        {
            let mut state = self.state.lock();
            *state = LinkState::Error;
            self.state_changed.notify_all();
        }
        let mut ops = self.ops.lock();
        ops.errored = true;
        self.op_done.notify_all();
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    #[inline]
    pub fn is_errored(&self) -> bool {
        self.state() == LinkState::Error
    }

    /// Block until the link reaches `want`. Fails on link error or when the
    /// deadline passes.
    pub(crate) fn wait_for_state(
        &self,
        want: LinkState,
        timeout: Duration,
        what: &'static str,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if *state == want {
                return Ok(());
            }
            if *state == LinkState::Error {
                return Err(Error::LinkErrored(self.peer));
            }
            if self
                .state_changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return Err(Error::Timeout(what));
            }
        }
    }

    /// Mark the in-flight operation of class `kind` complete and wake its
    /// waiter.
    pub(crate) fn complete_op(&self, kind: OpKind) {
        let mut ops = self.ops.lock();
        match kind {
            OpKind::Send => ops.send_done = true,
            OpKind::Write => ops.write_done = true,
            OpKind::Read => ops.read_done = true,
        }
        self.op_done.notify_all();
    }

    /// Block until the in-flight operation of class `kind` completes,
    /// consuming the completion flag. The caller must hold the class lock
    /// that made the operation exclusive.
    pub(crate) fn wait_op(&self, kind: OpKind) -> Result<()> {
        let mut ops = self.ops.lock();
        loop {
            if ops.errored {
                return Err(Error::LinkErrored(self.peer));
            }
            let flag = match kind {
                OpKind::Send => &mut ops.send_done,
                OpKind::Write => &mut ops.write_done,
                OpKind::Read => &mut ops.read_done,
            };
            if *flag {
                *flag = false;
                return Ok(());
            }
            self.op_done.wait(&mut ops);
        }
    }

    /// Account one posted work request. Callers hold `post_lock`.
    pub(crate) fn wr_post(&self) {
        let pending = self.outstanding.fetch_add(1, Ordering::Relaxed) + 1;
        debug_assert!(pending <= MAX_SEND_WR, "send queue overcommitted");
        if pending > MAX_SEND_WR {
            log::error!(
                "link {}: {} work requests outstanding (queue depth {})",
                self.peer,
                pending,
                MAX_SEND_WR
            );
        }
    }

    /// Account one completed work request.
    pub(crate) fn wr_complete(&self) {
        let before = self.outstanding.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(before > 0, "work request completed but none posted");
    }

    /// Work requests posted but not yet completed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }
}
