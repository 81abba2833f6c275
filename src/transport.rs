//! The node-to-node transport: synchronous message sends, the RDMA
//! request/response protocol, and handler registration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::cm;
use crate::config::NodeTable;
use crate::dispatch::{self, HandlerTable, InboundMsg, WorkerPool, NR_WORKERS, WR_ID_READ, WR_ID_SEND, WR_ID_WRITE};
use crate::error::{Error, Result};
use crate::fabric::{DmaBuf, Fabric};
use crate::link::{Link, LinkRole, LinkState, NodeId, OpKind};
use crate::msg::{Message, MsgType, RdmaDescriptor, RdmaDir, MAX_MSG_SIZE, MAX_RDMA_SIZE};
use crate::ring::RingBuffer;

/// How often a parked RDMA requester rechecks its link while waiting for
/// the acknowledgment.
const WAIT_RECHECK: Duration = Duration::from_millis(100);

struct WaitEntry {
    done: Mutex<Option<usize>>,
    cv: Condvar,
}

/// Parks active-side RDMA callers until the passive side's acknowledgment
/// names their token.
struct WaitStation {
    entries: Mutex<HashMap<u64, Arc<WaitEntry>>>,
    next_token: AtomicU64,
}

impl WaitStation {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    fn prepare(&self) -> (u64, Arc<WaitEntry>) {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(WaitEntry {
            done: Mutex::new(None),
            cv: Condvar::new(),
        });
        self.entries.lock().insert(token, entry.clone());
        (token, entry)
    }

    fn complete(&self, token: u64, size: usize) {
        match self.entries.lock().remove(&token) {
            Some(entry) => {
                *entry.done.lock() = Some(size);
                entry.cv.notify_all();
            }
            None => log::warn!("acknowledgment for unknown token {}", token),
        }
    }

    fn cancel(&self, token: u64) {
        self.entries.lock().remove(&token);
    }

    /// Block on `entry` until completed or the link dies.
    fn wait(&self, entry: &WaitEntry, link: &Link) -> Result<usize> {
        let mut done = entry.done.lock();
        loop {
            if let Some(size) = *done {
                return Ok(size);
            }
            if link.is_errored() {
                return Err(Error::LinkErrored(link.peer()));
            }
            // Bounded so a link failure cannot strand the waiter.
            let _ = entry.cv.wait_for(&mut done, WAIT_RECHECK);
        }
    }
}

/// The message transport of one node.
///
/// Owns one link per node-table entry (the local entry is a placeholder
/// that accepts no traffic), the shared inbound staging ring, the worker
/// pool, and the handler table. Created with [`Transport::start`], which
/// blocks until every link is connected.
pub struct Transport {
    table: NodeTable,
    links: Vec<Arc<Link>>,
    handlers: Arc<HandlerTable>,
    waits: WaitStation,
    ring: RingBuffer,
    shut: AtomicBool,
    // Keeps the worker submission endpoint alive for late dispatcher use.
    _pool: WorkerPool,
}

impl Transport {
    /// Bring the transport up against `table`, connecting to every peer.
    ///
    /// Lower-numbered nodes are connected to in ascending order; after
    /// that, one connection is accepted from every higher-numbered node,
    /// also in ascending order. Returns once all links are `Connected`.
    pub fn start(fabric: Fabric, table: NodeTable) -> Result<Arc<Self>> {
        let my_id = table.local_id();
        let links: Vec<Arc<Link>> = (0..table.len())
            .map(|peer| {
                let role = match peer.cmp(&my_id) {
                    std::cmp::Ordering::Less => LinkRole::Connector,
                    std::cmp::Ordering::Equal => LinkRole::Loopback,
                    std::cmp::Ordering::Greater => LinkRole::Listener,
                };
                Link::new(&fabric, peer, role)
            })
            .collect();

        let handlers = Arc::new(HandlerTable::new());
        let pool = WorkerPool::new(NR_WORKERS, handlers.clone());
        let ring = RingBuffer::default();
        for link in &links {
            if link.role() != LinkRole::Loopback {
                dispatch::attach(link, ring.clone(), pool.sender());
            }
        }

        cm::establish_all(&fabric, &table, &links)?;
        log::info!(
            "node {} transport up, {} peers connected",
            my_id,
            table.len() - 1
        );
        Ok(Arc::new(Self {
            table,
            links,
            handlers,
            waits: WaitStation::new(),
            ring,
            shut: AtomicBool::new(false),
            _pool: pool,
        }))
    }

    #[inline]
    pub fn local_id(&self) -> NodeId {
        self.table.local_id()
    }

    #[inline]
    pub fn node_table(&self) -> &NodeTable {
        &self.table
    }

    /// The link to `node`, which must be a remote node in the table.
    fn remote_link(&self, node: NodeId) -> Result<&Arc<Link>> {
        if node == self.local_id() {
            return Err(Error::SelfSend);
        }
        let link = self.links.get(node).ok_or(Error::NoSuchNode(node))?;
        match link.state() {
            LinkState::Connected => Ok(link),
            LinkState::Error => Err(Error::LinkErrored(node)),
            _ => Err(Error::NotConnected(node)),
        }
    }

    /// Register the handler for a message type. Exactly one handler per
    /// type; the slot cannot be re-registered.
    pub fn register_handler(
        &self,
        msg_type: MsgType,
        handler: impl Fn(InboundMsg) + Send + Sync + 'static,
    ) -> Result<()> {
        self.handlers.register(msg_type, Arc::new(handler))
    }

    /// Send `msg` to `dst` and block until the fabric confirms completion.
    ///
    /// The send path stamps the origin and payload size into the header.
    /// At most one send per link is in flight; concurrent senders to the
    /// same node serialize.
    pub fn send(&self, dst: NodeId, msg: &mut Message) -> Result<()> {
        if msg.wire_size() > MAX_MSG_SIZE {
            return Err(Error::MessageTooLarge(msg.wire_size()));
        }
        let link = self.remote_link(dst)?;
        let _send = link.send_lock.lock();
        msg.header.from = self.local_id();
        msg.header.size = msg.payload().len() as u32;
        {
            let _post = link.post_lock.lock();
            link.wr_post();
            link.qp()?.post_send(msg.to_bytes(), WR_ID_SEND)?;
        }
        link.wait_op(OpKind::Send)
    }

    /// Issue an RDMA request: register `size` bytes of `buf` as a window
    /// and ask `dst` to serve it, blocking until the acknowledgment.
    ///
    /// With [`RdmaDir::Write`] the remote side writes its data into the
    /// window (a fetch); the filled buffer is returned. With
    /// [`RdmaDir::Read`] the remote side reads the window (a push) and
    /// nothing is returned.
    ///
    /// `msg_type` routes the request to the remote handler, which must
    /// answer with [`Transport::respond_rdma`]; `response_type` routes the
    /// acknowledgment back to this node's descriptor handler.
    pub fn request_rdma(
        &self,
        dst: NodeId,
        msg_type: MsgType,
        response_type: MsgType,
        dir: RdmaDir,
        buf: DmaBuf,
        size: usize,
    ) -> Result<Option<DmaBuf>> {
        if size == 0 || size > MAX_RDMA_SIZE || size > buf.len() {
            return Err(Error::BadTransferSize(size));
        }
        let link = self.remote_link(dst)?;
        let _active = link.active_lock.lock();

        let pool = link.rdma_slots();
        let slot = pool.acquire()?;
        let window = pool.register(slot, &buf, 0, size, true);
        let (token, entry) = self.waits.prepare();
        let desc = RdmaDescriptor {
            dir,
            ack: false,
            window,
            size: size as u32,
            response_type,
            slot,
            token,
        };
        let mut msg = Message::with_descriptor(msg_type, &desc)?;
        if let Err(e) = self.send(dst, &mut msg) {
            self.waits.cancel(token);
            pool.release(slot);
            return Err(e);
        }
        match self.waits.wait(&entry, link) {
            Ok(_moved) => {}
            Err(e) => {
                // The acknowledgment never came; the slot stays with the
                // dead link.
                self.waits.cancel(token);
                return Err(e);
            }
        }
        Ok(match dir {
            RdmaDir::Write => Some(buf),
            RdmaDir::Read => None,
        })
    }

    /// Serve or complete an RDMA exchange, depending on which half `req`
    /// is.
    ///
    /// For a request (`ack` unset) the caller provides its local buffer:
    /// the transfer is executed against the requester's window, the local
    /// registration released, and the acknowledgment sent. `size` is the
    /// number of bytes this side chooses to move, at most the requested
    /// size.
    ///
    /// For an acknowledgment (`ack` set) the originating slot is released
    /// and the parked requester woken; `buf` is ignored. Register the
    /// acknowledgment type with a handler that forwards here.
    pub fn respond_rdma(&self, req: &InboundMsg, buf: Option<&DmaBuf>, size: usize) -> Result<()> {
        let desc = req.rdma_descriptor()?;
        if desc.ack {
            let link = self.remote_link(req.from())?;
            link.rdma_slots().release(desc.slot);
            self.waits.complete(desc.token, desc.size as usize);
            return Ok(());
        }

        let buf = buf.ok_or(Error::Malformed("serving an RDMA request needs a buffer"))?;
        if size == 0 || size as u64 > desc.window.len || size > buf.len() {
            return Err(Error::BadTransferSize(size));
        }
        let link = self.remote_link(req.from())?;
        let _passive = link.passive_lock.lock();

        let pool = link.rdma_slots();
        let slot = pool.acquire()?;
        pool.register(slot, buf, 0, size, true);
        let moved = match desc.dir {
            RdmaDir::Write => {
                // The requester wants our bytes in its window.
                let bytes = buf.read(0, size);
                {
                    let _post = link.post_lock.lock();
                    link.wr_post();
                    link.qp()?
                        .post_write(desc.window.rkey, desc.window.offset, bytes, WR_ID_WRITE)?;
                }
                link.wait_op(OpKind::Write)
            }
            RdmaDir::Read => {
                // The requester is pushing; pull its window into our buffer.
                {
                    let _post = link.post_lock.lock();
                    link.wr_post();
                    link.qp()?.post_read(
                        desc.window.rkey,
                        desc.window.offset,
                        buf.clone(),
                        size,
                        WR_ID_READ,
                    )?;
                }
                link.wait_op(OpKind::Read)
            }
        };
        pool.release(slot);
        moved?;

        let mut ack = desc.clone();
        ack.ack = true;
        ack.size = size as u32;
        let mut reply = Message::with_descriptor(desc.response_type, &ack)?;
        self.send(req.from(), &mut reply)
    }

    /// Release an inbound message's staging storage. Dropping the message
    /// does the same; this spells the hand-back out at call sites that keep
    /// messages around.
    pub fn free_message(&self, msg: InboundMsg) {
        drop(msg);
    }

    /// Bytes currently held in the inbound staging ring.
    pub fn staging_usage(&self) -> usize {
        self.ring.usage()
    }

    /// Highest inbound staging usage observed since startup.
    pub fn staging_peak(&self) -> usize {
        self.ring.peak_usage()
    }

    /// The connection state of the link to `node`.
    pub fn link_state(&self, node: NodeId) -> Result<LinkState> {
        Ok(self
            .links
            .get(node)
            .ok_or(Error::NoSuchNode(node))?
            .state())
    }

    /// Tear every link down. Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        if self.shut.swap(true, Ordering::SeqCst) {
            return;
        }
        for link in &self.links {
            if link.role() == LinkRole::Loopback {
                continue;
            }
            if let Some(cm) = link.cm() {
                cm.disconnect();
            }
            if let Ok(qp) = link.qp() {
                qp.destroy();
            }
            link.cq().clear_handler();
        }
        log::info!("node {} transport down", self.local_id());
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
