//! Completion dispatch: drains a link's completion queue, wakes synchronous
//! waiters, stages inbound messages, and hands them to the worker pool.

use std::sync::{Arc, Weak};
use std::thread;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::RwLock;

use crate::cm::WR_ID_RECV_BASE;
use crate::error::{Error, Result};
use crate::fabric::{Cq, Wc, WcOpcode, WcStatus};
use crate::link::{Link, NodeId, OpKind};
use crate::msg::{MsgHeader, MsgType, RdmaDescriptor, HDR_SIZE, MAX_MSG_TYPES};
use crate::ring::{RingBuffer, RingRecord};

/// Work-request ids of the three synchronous operation classes. Receive ids
/// start at [`WR_ID_RECV_BASE`] and carry the buffer index.
pub(crate) const WR_ID_SEND: u64 = 1;
pub(crate) const WR_ID_WRITE: u64 = 2;
pub(crate) const WR_ID_READ: u64 = 3;

/// Completions drained per pass before freed receive buffers are re-posted.
const CQ_DRAIN_BUDGET: usize = 16;

/// Bottom-half worker threads shared by all links.
pub(crate) const NR_WORKERS: usize = 4;

enum MsgStore {
    /// Staged in the inbound ring; released back when the message is freed.
    Ring(RingRecord),
    /// Fallback when the ring has no room.
    Heap(Vec<u8>),
}

/// An inbound message as delivered to a handler. Owns its staging storage;
/// dropping the message releases it.
pub struct InboundMsg {
    header: MsgHeader,
    store: MsgStore,
}

impl InboundMsg {
    fn bytes(&self) -> &[u8] {
        match &self.store {
            MsgStore::Ring(rec) => rec.as_slice(),
            MsgStore::Heap(buf) => buf,
        }
    }

    #[inline]
    pub fn header(&self) -> &MsgHeader {
        &self.header
    }

    #[inline]
    pub fn msg_type(&self) -> MsgType {
        self.header.msg_type
    }

    /// The sending node.
    #[inline]
    pub fn from(&self) -> NodeId {
        self.header.from
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes()[HDR_SIZE..HDR_SIZE + self.header.size as usize]
    }

    /// Decode the payload as an RDMA descriptor. Fails unless the message
    /// carries the RDMA flag.
    pub fn rdma_descriptor(&self) -> Result<RdmaDescriptor> {
        if !self.header.is_rdma {
            return Err(Error::Malformed("message carries no RDMA descriptor"));
        }
        RdmaDescriptor::decode(self.payload())
    }
}

pub(crate) type Handler = Arc<dyn Fn(InboundMsg) + Send + Sync>;

/// One handler slot per message type tag.
pub(crate) struct HandlerTable {
    slots: RwLock<Vec<Option<Handler>>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(vec![None; MAX_MSG_TYPES]),
        }
    }

    pub fn register(&self, msg_type: MsgType, handler: Handler) -> Result<()> {
        let mut slots = self.slots.write();
        let slot = slots
            .get_mut(msg_type as usize)
            .ok_or(Error::Malformed("message type out of range"))?;
        if slot.is_some() {
            return Err(Error::HandlerExists(msg_type));
        }
        *slot = Some(handler);
        Ok(())
    }

    pub fn get(&self, msg_type: MsgType) -> Option<Handler> {
        self.slots.read().get(msg_type as usize)?.clone()
    }
}

/// The shared bottom-half worker pool. Workers run registered handlers to
/// completion, one message at a time, and exit once every submission
/// endpoint is gone.
pub(crate) struct WorkerPool {
    jobs: Sender<InboundMsg>,
}

impl WorkerPool {
    pub fn new(nr_workers: usize, handlers: Arc<HandlerTable>) -> Self {
        // The job queue is unbounded: submission happens on the queue-pair
        // engine threads, which also produce the completions handlers block
        // on, so a full-queue stall there could never drain itself. Staged
        // data is already bounded by the ring and the posted receive depth.
        let (jobs, jobs_rx) = unbounded::<InboundMsg>();
        for i in 0..nr_workers {
            let rx = jobs_rx.clone();
            let handlers = handlers.clone();
            thread::Builder::new()
                .name(format!("dkmsg-worker-{}", i))
                .spawn(move || {
                    for msg in rx.iter() {
                        let msg_type = msg.msg_type();
                        match handlers.get(msg_type) {
                            Some(handler) => handler(msg),
                            // Receiving a type nobody registered is a
                            // wiring bug, not a runtime condition.
                            None => panic!(
                                "no handler registered for message type {}",
                                msg_type
                            ),
                        }
                    }
                })
                .expect("failed to spawn a worker thread");
        }
        Self { jobs }
    }

    /// A submission endpoint for one dispatcher.
    pub fn sender(&self) -> Sender<InboundMsg> {
        self.jobs.clone()
    }
}

struct DispatchCtx {
    link: Weak<Link>,
    ring: RingBuffer,
    jobs: Sender<InboundMsg>,
}

/// Install the completion handler for `link`. Runs on the completion
/// notification path; drains, wakes waiters, stages inbound traffic, and
/// re-arms until the queue is verifiably empty.
pub(crate) fn attach(link: &Arc<Link>, ring: RingBuffer, jobs: Sender<InboundMsg>) {
    let ctx = DispatchCtx {
        link: Arc::downgrade(link),
        ring,
        jobs,
    };
    let cq = link.cq().clone();
    link.cq().set_handler(move || drain(&cq, &ctx));
}

fn drain(cq: &Cq, ctx: &DispatchCtx) {
    let Some(link) = ctx.link.upgrade() else {
        return;
    };
    if link.is_errored() {
        // Nothing to deliver on a dead link; just discard.
        while cq.poll().is_some() {}
        return;
    }
    let mut freed: Vec<usize> = Vec::new();
    loop {
        let mut budget = CQ_DRAIN_BUDGET;
        while budget > 0 {
            let Some(wc) = cq.poll() else {
                break;
            };
            budget -= 1;
            match triage(&link, &wc) {
                Triage::Deliver => {}
                Triage::Skip => {
                    // A flushed send/write/read was still posted; keep the
                    // work-request accounting balanced.
                    if wc.opcode != WcOpcode::Recv {
                        link.wr_complete();
                    }
                    continue;
                }
                Triage::Abort => return,
            }
            match wc.opcode {
                WcOpcode::Send => {
                    link.wr_complete();
                    link.complete_op(OpKind::Send);
                }
                WcOpcode::RdmaWrite => {
                    link.wr_complete();
                    link.complete_op(OpKind::Write);
                }
                WcOpcode::RdmaRead => {
                    link.wr_complete();
                    link.complete_op(OpKind::Read);
                }
                WcOpcode::Recv => {
                    if let Some(index) = inbound(&link, ctx, &wc) {
                        freed.push(index);
                    }
                }
            }
        }
        repost(&link, &mut freed);
        if !cq.rearm() {
            return;
        }
    }
}

enum Triage {
    Deliver,
    Skip,
    Abort,
}

/// Classify a completion's status: deliver it, skip it, or stop draining
/// because the link just died.
fn triage(link: &Arc<Link>, wc: &Wc) -> Triage {
    match wc.status {
        WcStatus::Success => Triage::Deliver,
        // Teardown flushes posted receives; not a link failure.
        WcStatus::WrFlushErr => {
            log::debug!("flushed completion on link {}", link.peer());
            Triage::Skip
        }
        status => {
            log::error!(
                "completion failed on link {} (wr {}): {}",
                link.peer(),
                wc.wr_id,
                status
            );
            link.set_error();
            Triage::Abort
        }
    }
}

/// Stage one inbound message and hand it to the worker pool. Returns the
/// receive-buffer index to re-post.
fn inbound(link: &Arc<Link>, ctx: &DispatchCtx, wc: &Wc) -> Option<usize> {
    let index = (wc.wr_id - WR_ID_RECV_BASE) as usize;
    let bufs = link.recv_bufs();
    let Some(buf) = bufs.get(index) else {
        log::error!("receive completion with bad buffer index {}", index);
        link.set_error();
        return None;
    };
    if wc.byte_len < HDR_SIZE {
        log::error!("runt message ({} bytes) from node {}", wc.byte_len, link.peer());
        link.set_error();
        return None;
    }
    let bytes = buf.read(0, wc.byte_len);
    let header = match MsgHeader::decode(&bytes) {
        Ok(header) => header,
        Err(e) => {
            log::error!("undecodable message from node {}: {}", link.peer(), e);
            link.set_error();
            return None;
        }
    };
    if HDR_SIZE + header.size as usize > bytes.len() {
        log::error!(
            "truncated message from node {}: header claims {} payload bytes, {} arrived",
            link.peer(),
            header.size,
            bytes.len() - HDR_SIZE
        );
        link.set_error();
        return None;
    }
    let store = match ctx.ring.acquire(bytes.len()) {
        Some(mut record) => {
            record.copy_from_slice(&bytes);
            MsgStore::Ring(record)
        }
        None => {
            log::warn!("inbound ring full, staging on the heap");
            MsgStore::Heap(bytes)
        }
    };
    // Never blocks; the job queue is unbounded so the engine thread stays
    // free to produce the completions parked handlers wait for.
    let _ = ctx.jobs.send(InboundMsg { header, store });
    Some(index)
}

/// Return freed receive buffers to the queue pair.
fn repost(link: &Arc<Link>, freed: &mut Vec<usize>) {
    if freed.is_empty() {
        return;
    }
    let Ok(qp) = link.qp() else {
        freed.clear();
        return;
    };
    for index in freed.drain(..) {
        let buf = link.recv_bufs()[index].clone();
        if qp.post_recv(buf, WR_ID_RECV_BASE + index as u64).is_err() {
            log::debug!("receive re-post after queue pair teardown");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{DmaBuf, Fabric, Qp};
    use crate::link::{LinkRole, LinkState};
    use crate::msg::Message;
    use crate::ring::RingBuffer;
    use std::time::Duration;

    /// Wire two links back to back, bypassing connection management.
    fn wired_links(
        fabric: &Fabric,
        pool: &WorkerPool,
        ring: &RingBuffer,
        ids: (NodeId, NodeId),
    ) -> (Arc<Link>, Arc<Link>) {
        let a = Link::new(fabric, ids.1, LinkRole::Listener);
        let b = Link::new(fabric, ids.0, LinkRole::Connector);
        let qp_a = Qp::new(fabric.clone(), a.cq().clone());
        let qp_b = Qp::new(fabric.clone(), b.cq().clone());
        qp_a.set_peer(qp_b.inbox());
        qp_b.set_peer(qp_a.inbox());
        for (link, qp) in [(&a, &qp_a), (&b, &qp_b)] {
            let bufs: Vec<DmaBuf> = (0..4).map(|_| DmaBuf::alloc(4096)).collect();
            for (i, buf) in bufs.iter().enumerate() {
                qp.post_recv(buf.clone(), WR_ID_RECV_BASE + i as u64).unwrap();
            }
            link.set_recv_bufs(bufs);
            link.set_qp(qp.clone());
            attach(link, ring.clone(), pool.sender());
            link.set_state(LinkState::Connected);
        }
        (a, b)
    }

    #[test]
    fn test_send_wakes_waiter_and_delivers() {
        let fabric = Fabric::new();
        let handlers = Arc::new(HandlerTable::new());
        let pool = WorkerPool::new(2, handlers.clone());
        let ring = RingBuffer::new(2, 4096);
        let (a, _b) = wired_links(&fabric, &pool, &ring, (0, 1));

        let (tx, rx) = crossbeam_channel::unbounded();
        handlers
            .register(
                5,
                Arc::new(move |msg: InboundMsg| {
                    let _ = tx.send((msg.from(), msg.payload().to_vec()));
                }),
            )
            .unwrap();

        let mut msg = Message::new(5, b"hello".to_vec()).unwrap();
        msg.header.from = 0;
        let _guard = a.send_lock.lock();
        a.wr_post();
        a.qp().unwrap().post_send(msg.to_bytes(), WR_ID_SEND).unwrap();
        a.wait_op(OpKind::Send).unwrap();

        let (from, payload) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(from, 0);
        assert_eq!(payload, b"hello");
        assert_eq!(a.outstanding(), 0);
    }

    #[test]
    fn test_fatal_completion_errors_only_its_link() {
        let fabric = Fabric::new();
        let handlers = Arc::new(HandlerTable::new());
        let pool = WorkerPool::new(2, handlers.clone());
        let ring = RingBuffer::new(2, 4096);
        let (bad, _peer) = wired_links(&fabric, &pool, &ring, (0, 1));
        let (good, _other) = wired_links(&fabric, &pool, &ring, (2, 3));

        let (tx, rx) = crossbeam_channel::unbounded();
        handlers
            .register(
                6,
                Arc::new(move |msg: InboundMsg| {
                    let _ = tx.send(msg.payload().to_vec());
                }),
            )
            .unwrap();

        // A write against a window nobody registered fails remotely and
        // must take down exactly this link.
        {
            let _guard = bad.active_lock.lock();
            bad.wr_post();
            bad.qp()
                .unwrap()
                .post_write(0xbad, 0, vec![0u8; 16], WR_ID_WRITE)
                .unwrap();
            assert!(matches!(
                bad.wait_op(OpKind::Write),
                Err(Error::LinkErrored(_))
            ));
        }
        assert!(bad.is_errored());

        // The unrelated link keeps working.
        assert!(!good.is_errored());
        let mut msg = Message::new(6, b"still up".to_vec()).unwrap();
        msg.header.from = 2;
        let _guard = good.send_lock.lock();
        good.wr_post();
        good.qp()
            .unwrap()
            .post_send(msg.to_bytes(), WR_ID_SEND)
            .unwrap();
        good.wait_op(OpKind::Send).unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            b"still up"
        );
    }

    #[test]
    fn test_parked_handlers_do_not_stall_dispatch() {
        let fabric = Fabric::new();
        let handlers = Arc::new(HandlerTable::new());
        let pool = WorkerPool::new(2, handlers.clone());
        let ring = RingBuffer::new(2, 4096);
        let (a, b) = wired_links(&fabric, &pool, &ring, (0, 1));

        // Every worker parks in a type-7 handler while the backlog grows
        // well past any worker-count multiple.
        let (gate_tx, gate_rx) = crossbeam_channel::unbounded::<()>();
        let (done_tx, done_rx) = crossbeam_channel::unbounded::<()>();
        handlers
            .register(
                7,
                Arc::new(move |_msg: InboundMsg| {
                    let _ = gate_rx.recv();
                    let _ = done_tx.send(());
                }),
            )
            .unwrap();
        handlers.register(8, Arc::new(|_msg| {})).unwrap();

        const BACKLOG: usize = 300;
        for _ in 0..BACKLOG {
            let mut msg = Message::new(7, vec![0u8; 8]).unwrap();
            msg.header.from = 0;
            let _guard = a.send_lock.lock();
            a.wr_post();
            a.qp().unwrap().post_send(msg.to_bytes(), WR_ID_SEND).unwrap();
            a.wait_op(OpKind::Send).unwrap();
        }

        // The receiving engine must still be live: a send in the other
        // direction completes while every handler is parked.
        {
            let mut msg = Message::new(8, b"live".to_vec()).unwrap();
            msg.header.from = 1;
            let _guard = b.send_lock.lock();
            b.wr_post();
            b.qp().unwrap().post_send(msg.to_bytes(), WR_ID_SEND).unwrap();
            b.wait_op(OpKind::Send).unwrap();
        }

        for _ in 0..BACKLOG {
            gate_tx.send(()).unwrap();
        }
        for _ in 0..BACKLOG {
            done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
    }

    #[test]
    fn test_flushed_send_keeps_wr_accounting_balanced() {
        let fabric = Fabric::new();
        let handlers = Arc::new(HandlerTable::new());
        let pool = WorkerPool::new(2, handlers);
        let ring = RingBuffer::new(2, 4096);
        let (a, _b) = wired_links(&fabric, &pool, &ring, (0, 1));

        let _guard = a.send_lock.lock();
        a.wr_post();
        assert_eq!(a.outstanding(), 1);
        a.cq().push(Wc {
            wr_id: WR_ID_SEND,
            status: WcStatus::WrFlushErr,
            opcode: WcOpcode::Send,
            byte_len: 0,
        });
        assert_eq!(a.outstanding(), 0);
        assert!(!a.is_errored());
    }

    #[test]
    fn test_truncated_message_errors_the_link() {
        let fabric = Fabric::new();
        let handlers = Arc::new(HandlerTable::new());
        let pool = WorkerPool::new(2, handlers.clone());
        let ring = RingBuffer::new(2, 4096);
        let (a, _b) = wired_links(&fabric, &pool, &ring, (0, 1));

        let (tx, rx) = crossbeam_channel::unbounded();
        handlers
            .register(
                5,
                Arc::new(move |msg: InboundMsg| {
                    let _ = tx.send(msg.payload().to_vec());
                }),
            )
            .unwrap();

        // A header claiming a 100-byte payload, with only the header on
        // the wire. It must never reach a handler.
        let header = MsgHeader {
            msg_type: 5,
            size: 100,
            from: 1,
            is_rdma: false,
            prio: crate::msg::MsgPriority::Normal,
        };
        a.recv_bufs()[0].write(0, &header.encode());
        a.cq().push(Wc {
            wr_id: WR_ID_RECV_BASE,
            status: WcStatus::Success,
            opcode: WcOpcode::Recv,
            byte_len: HDR_SIZE,
        });

        assert!(a.is_errored());
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_handler_table_rejects_duplicates() {
        let handlers = HandlerTable::new();
        let noop: Handler = Arc::new(|_msg| {});
        handlers.register(1, noop.clone()).unwrap();
        assert!(matches!(
            handlers.register(1, noop),
            Err(Error::HandlerExists(1))
        ));
    }
}
