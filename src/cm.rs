//! Cluster bring-up.
//!
//! Node `i` first connects to every node below it in ascending id order,
//! then listens and accepts one connection from every node above it, again
//! in ascending order. Connect requests carry no identity; the listener
//! assigns them to pre-allocated links purely by arrival sequence, which the
//! fabric keeps deterministic by admitting each connector only once all
//! lower-numbered connectors of that listener have been established.
//!
//! Established events likewise carry no identity. Each side resolves them
//! ordinally: the k-th connector-side event belongs to link `k`, the k-th
//! listener-side event to link `local + 1 + k`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::config::NodeTable;
use crate::error::{Error, Result};
use crate::fabric::{CmEvent, CmId, DmaBuf, Fabric, Qp};
use crate::link::{Link, LinkState, NodeId, MAX_RECV_WR};
use crate::msg::MAX_MSG_SIZE;

const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Base work-request id for posted receives; the low bits carry the
/// receive-buffer index.
pub(crate) const WR_ID_RECV_BASE: u64 = 1 << 32;

/// Shared context of the establishment handlers.
struct EstablishCtx {
    my_id: NodeId,
    links: Vec<Weak<Link>>,
    /// Connector-side established events seen so far.
    established_lower: AtomicUsize,
    /// Listener-side established events seen so far.
    established_upper: AtomicUsize,
    accept_tx: Sender<CmId>,
}

impl EstablishCtx {
    fn link(&self, id: NodeId) -> Option<Arc<Link>> {
        self.links.get(id).and_then(Weak::upgrade)
    }
}

fn connector_handler(
    ctx: Arc<EstablishCtx>,
    peer: NodeId,
) -> impl Fn(CmEvent) + Send + Sync + 'static {
    move |event| {
        let Some(link) = ctx.link(peer) else {
            return;
        };
        match event {
            CmEvent::AddrResolved => {
                link.set_state(LinkState::AddrResolved);
                if let Some(cm) = link.cm() {
                    cm.resolve_route();
                }
            }
            CmEvent::RouteResolved => link.set_state(LinkState::RouteResolved),
            CmEvent::Established => {
                // Ordinal resolution: connector links are exactly the ids
                // below ours, connected in ascending order.
                let nth = ctx.established_lower.fetch_add(1, Ordering::SeqCst);
                match ctx.link(nth) {
                    Some(link) => link.set_state(LinkState::Connected),
                    None => log::error!("established event {} has no link", nth),
                }
            }
            CmEvent::Disconnected => {
                log::info!("node {} disconnected", peer);
                link.set_error();
            }
            CmEvent::AddrError
            | CmEvent::RouteError
            | CmEvent::ConnectError
            | CmEvent::Rejected
            | CmEvent::Unreachable => {
                log::error!("connection to node {} failed: {:?}", peer, event);
                link.set_error();
            }
            CmEvent::ConnectRequest(_) => {
                log::error!("connect request on a connector id (node {})", peer);
            }
        }
    }
}

fn listener_handler(ctx: Arc<EstablishCtx>) -> impl Fn(CmEvent) + Send + Sync + 'static {
    move |event| match event {
        CmEvent::ConnectRequest(cm) => {
            let _ = ctx.accept_tx.send(cm);
        }
        CmEvent::Established => {
            let nth = ctx.established_upper.fetch_add(1, Ordering::SeqCst);
            let id = ctx.my_id + 1 + nth;
            match ctx.link(id) {
                Some(link) => link.set_state(LinkState::Connected),
                None => log::error!("established event for unknown node {}", id),
            }
        }
        CmEvent::Disconnected => log::info!("a peer of the listener disconnected"),
        other => {
            // An error during an accept in progress belongs to the next
            // link awaiting its established event.
            let id = ctx.my_id + 1 + ctx.established_upper.load(Ordering::SeqCst);
            log::error!("listener-side failure for node {}: {:?}", id, other);
            if let Some(link) = ctx.link(id) {
                link.set_error();
            }
        }
    }
}

/// Pre-post the full receive ring on a fresh queue pair. Buffer `i`
/// completes with work-request id `WR_ID_RECV_BASE + i`.
fn setup_recv(link: &Link, qp: &Qp) -> Result<()> {
    let bufs: Vec<DmaBuf> = (0..MAX_RECV_WR).map(|_| DmaBuf::alloc(MAX_MSG_SIZE)).collect();
    for (i, buf) in bufs.iter().enumerate() {
        qp.post_recv(buf.clone(), WR_ID_RECV_BASE + i as u64)?;
    }
    link.set_recv_bufs(bufs);
    Ok(())
}

fn connect_failed(node: NodeId, err: Error) -> Error {
    Error::ConnectFailed {
        node,
        reason: err.to_string(),
    }
}

/// Bring up every link in `links` against the cluster in `table`. Returns
/// once all remote links are `Connected`; any failure aborts bring-up.
pub(crate) fn establish_all(
    fabric: &Fabric,
    table: &NodeTable,
    links: &[Arc<Link>],
) -> Result<()> {
    let my_id = table.local_id();
    let (accept_tx, accept_rx) = unbounded();
    let ctx = Arc::new(EstablishCtx {
        my_id,
        links: links.iter().map(Arc::downgrade).collect(),
        established_lower: AtomicUsize::new(0),
        established_upper: AtomicUsize::new(0),
        accept_tx,
    });

    for peer in 0..my_id {
        connect_one(fabric, table, &links[peer], peer, my_id, &ctx)
            .map_err(|e| connect_failed(peer, e))?;
        log::info!("node {} is ready (connected)", peer);
    }

    if my_id + 1 < table.len() {
        let listener = CmId::create(fabric, listener_handler(ctx.clone()));
        listener.listen(table.local_addr())?;
        for peer in my_id + 1..table.len() {
            accept_one(fabric, table, &links[peer], peer, &accept_rx)
                .map_err(|e| connect_failed(peer, e))?;
            log::info!("node {} is ready (accepted)", peer);
        }
    }
    Ok(())
}

fn connect_one(
    fabric: &Fabric,
    table: &NodeTable,
    link: &Arc<Link>,
    peer: NodeId,
    my_id: NodeId,
    ctx: &Arc<EstablishCtx>,
) -> Result<()> {
    let cm = CmId::create(fabric, connector_handler(ctx.clone(), peer));
    link.set_cm(cm.clone());
    cm.resolve_addr(table.addr(peer)?);
    link.wait_for_state(LinkState::RouteResolved, RESOLVE_TIMEOUT, "route resolution")?;

    let qp = cm.create_qp(link.cq());
    setup_recv(link, &qp)?;
    link.set_qp(qp);

    link.set_state(LinkState::Connecting);
    // Our rank among this listener's connectors: the nodes between it and
    // us have to get there first.
    cm.connect(my_id - peer - 1, CONNECT_TIMEOUT)?;
    link.wait_for_state(LinkState::Connected, CONNECT_TIMEOUT, "connection establishment")
}

fn accept_one(
    fabric: &Fabric,
    table: &NodeTable,
    link: &Arc<Link>,
    peer: NodeId,
    accept_rx: &Receiver<CmId>,
) -> Result<()> {
    let cm = accept_rx
        .recv_timeout(ACCEPT_TIMEOUT)
        .map_err(|_| Error::Timeout("connect request"))?;
    link.set_state(LinkState::ConnectRequest);
    link.set_cm(cm.clone());

    let qp = cm.create_qp(link.cq());
    setup_recv(link, &qp)?;
    link.set_qp(qp);

    cm.accept()?;
    link.wait_for_state(LinkState::Connected, CONNECT_TIMEOUT, "connection establishment")?;
    // Admit the next connector in id order.
    fabric.listener_accepted(table.local_addr());
    Ok(())
}
