//! Connection management: ids, events, and the establishment handshake.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Error, Result};

use super::cq::Cq;
use super::qp::Qp;
use super::switch::Fabric;

/// Connection-manager events, delivered one at a time on the fabric's pump
/// thread in the order they were raised.
#[derive(Clone)]
pub enum CmEvent {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    /// A connector reached a listening endpoint. Carries the
    /// connection-scoped id the listener accepts on.
    ConnectRequest(CmId),
    ConnectError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
}

impl fmt::Debug for CmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CmEvent::AddrResolved => "AddrResolved",
            CmEvent::AddrError => "AddrError",
            CmEvent::RouteResolved => "RouteResolved",
            CmEvent::RouteError => "RouteError",
            CmEvent::ConnectRequest(_) => "ConnectRequest",
            CmEvent::ConnectError => "ConnectError",
            CmEvent::Unreachable => "Unreachable",
            CmEvent::Rejected => "Rejected",
            CmEvent::Established => "Established",
            CmEvent::Disconnected => "Disconnected",
        };
        f.write_str(name)
    }
}

pub(crate) type CmHandler = Arc<dyn Fn(CmEvent) + Send + Sync>;

/// The connector half handed to a listener by a connect request: the
/// connector's queue pair to cross-wire and its handler to notify.
struct PeerHalf {
    qp: Qp,
    handler: CmHandler,
}

struct CmIdInner {
    fabric: Fabric,
    handler: CmHandler,
    target: Mutex<Option<String>>,
    qp: Mutex<Option<Qp>>,
    pending: Mutex<Option<PeerHalf>>,
}

/// A connection-manager id. Connector-side ids walk the
/// resolve-address/resolve-route/connect ladder; listener-side ids bind an
/// address and spawn one connection-scoped id per inbound request.
#[derive(Clone)]
pub struct CmId {
    inner: Arc<CmIdInner>,
}

impl fmt::Debug for CmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmId")
            .field("target", &*self.inner.target.lock())
            .finish()
    }
}

const LISTENER_POLL: Duration = Duration::from_millis(2);

impl CmId {
    pub fn create(fabric: &Fabric, handler: impl Fn(CmEvent) + Send + Sync + 'static) -> Self {
        Self::with_handler(fabric, Arc::new(handler))
    }

    fn with_handler(fabric: &Fabric, handler: CmHandler) -> Self {
        Self {
            inner: Arc::new(CmIdInner {
                fabric: fabric.clone(),
                handler,
                target: Mutex::new(None),
                qp: Mutex::new(None),
                pending: Mutex::new(None),
            }),
        }
    }

    fn post(&self, event: CmEvent) {
        self.inner
            .fabric
            .post_cm(self.inner.handler.clone(), event);
    }

    /// Resolve the remote address. Raises `AddrResolved` or `AddrError`.
    pub fn resolve_addr(&self, addr: &str) {
        if addr.is_empty() {
            self.post(CmEvent::AddrError);
        } else {
            *self.inner.target.lock() = Some(addr.to_owned());
            self.post(CmEvent::AddrResolved);
        }
    }

    /// Resolve the route to an already resolved address. Raises
    /// `RouteResolved` or `RouteError`.
    pub fn resolve_route(&self) {
        if self.inner.target.lock().is_some() {
            self.post(CmEvent::RouteResolved);
        } else {
            self.post(CmEvent::RouteError);
        }
    }

    /// Bind this id as a listening endpoint on `addr`.
    pub fn listen(&self, addr: &str) -> Result<()> {
        if self.inner.fabric.bind_listener(addr, self.clone()) {
            Ok(())
        } else {
            Err(Error::Fabric("listen address already bound"))
        }
    }

    /// Create the queue pair for this connection, completing onto `cq`.
    pub fn create_qp(&self, cq: &Cq) -> Qp {
        let qp = Qp::new(self.inner.fabric.clone(), cq.clone());
        *self.inner.qp.lock() = Some(qp.clone());
        qp
    }

    /// Ask the resolved target to connect. `order` is this connector's rank
    /// among all connectors of the target; the request is held back until the
    /// listener has established that many connections, which keeps request
    /// arrival in a fixed order without exchanging identities.
    ///
    /// Raises `Unreachable` if no listener appears within `timeout`;
    /// otherwise a `ConnectRequest` is raised at the listener, and
    /// `Established` here once it accepts.
    pub fn connect(&self, order: usize, timeout: Duration) -> Result<()> {
        let addr = match self.inner.target.lock().clone() {
            Some(addr) => addr,
            None => return Err(Error::Fabric("connect before address resolution")),
        };
        let qp = match self.inner.qp.lock().clone() {
            Some(qp) => qp,
            None => return Err(Error::Fabric("connect without a queue pair")),
        };
        let deadline = Instant::now() + timeout;
        let listener = loop {
            if let Some((cm, accepted)) = self.inner.fabric.listener(&addr) {
                if accepted.load(std::sync::atomic::Ordering::SeqCst) >= order {
                    break cm;
                }
            }
            if Instant::now() >= deadline {
                self.post(CmEvent::Unreachable);
                return Ok(());
            }
            thread::sleep(LISTENER_POLL);
        };
        // The connection-scoped server id inherits the listener's handler,
        // and carries our half so accept can cross-wire the queue pairs.
        let server = CmId::with_handler(&self.inner.fabric, listener.inner.handler.clone());
        *server.inner.pending.lock() = Some(PeerHalf {
            qp,
            handler: self.inner.handler.clone(),
        });
        listener.post(CmEvent::ConnectRequest(server));
        Ok(())
    }

    /// Accept a connect request on a connection-scoped id. Cross-wires the
    /// two queue pairs and raises `Established` on both sides, connector
    /// first.
    pub fn accept(&self) -> Result<()> {
        let server_qp = match self.inner.qp.lock().clone() {
            Some(qp) => qp,
            None => return Err(Error::Fabric("accept without a queue pair")),
        };
        let peer = match self.inner.pending.lock().take() {
            Some(peer) => peer,
            None => return Err(Error::Fabric("accept without a connect request")),
        };
        peer.qp.set_peer(server_qp.inbox());
        server_qp.set_peer(peer.qp.inbox());
        self.inner
            .fabric
            .post_cm(peer.handler, CmEvent::Established);
        self.post(CmEvent::Established);
        Ok(())
    }

    /// Reject a connect request instead of accepting it.
    pub fn reject(&self) {
        if let Some(peer) = self.inner.pending.lock().take() {
            self.inner.fabric.post_cm(peer.handler, CmEvent::Rejected);
        }
    }

    /// Tear the connection down. The peer's queue pair flushes its posted
    /// receives; `Disconnected` is raised locally.
    pub fn disconnect(&self) {
        if let Some(qp) = self.inner.qp.lock().clone() {
            qp.hangup_peer();
        }
        self.post(CmEvent::Disconnected);
    }

    pub fn qp(&self) -> Option<Qp> {
        self.inner.qp.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_connect_accept_handshake() {
        let fabric = Fabric::new();

        let (srv_tx, srv_rx) = unbounded::<CmEvent>();
        let listener = CmId::create(&fabric, move |ev| {
            let _ = srv_tx.send(ev);
        });
        listener.listen("node0").unwrap();

        let (cli_tx, cli_rx) = unbounded::<CmEvent>();
        let client = CmId::create(&fabric, move |ev| {
            let _ = cli_tx.send(ev);
        });
        client.resolve_addr("node0");
        assert!(matches!(
            cli_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            CmEvent::AddrResolved
        ));
        client.resolve_route();
        assert!(matches!(
            cli_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            CmEvent::RouteResolved
        ));

        let client_qp = client.create_qp(&Cq::new());
        client.connect(0, Duration::from_secs(1)).unwrap();

        let server = match srv_rx.recv_timeout(Duration::from_secs(1)).unwrap() {
            CmEvent::ConnectRequest(cm) => cm,
            other => panic!("unexpected event {:?}", other),
        };
        let server_qp = server.create_qp(&Cq::new());
        server.accept().unwrap();

        assert!(matches!(
            cli_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            CmEvent::Established
        ));
        assert!(matches!(
            srv_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            CmEvent::Established
        ));
        assert!(client_qp.is_connected());
        assert!(server_qp.is_connected());

        client_qp.destroy();
        server_qp.destroy();
    }

    #[test]
    fn test_connect_without_listener_is_unreachable() {
        let fabric = Fabric::new();
        let (tx, rx) = unbounded::<CmEvent>();
        let client = CmId::create(&fabric, move |ev| {
            let _ = tx.send(ev);
        });
        client.resolve_addr("nowhere");
        client.create_qp(&Cq::new());
        client.connect(0, Duration::from_millis(20)).unwrap();
        let mut saw_unreachable = false;
        while let Ok(ev) = rx.recv_timeout(Duration::from_secs(1)) {
            if matches!(ev, CmEvent::Unreachable) {
                saw_unreachable = true;
                break;
            }
        }
        assert!(saw_unreachable);
    }
}
