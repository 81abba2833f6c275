//! The process-wide switch: listener registry, window registry, and the
//! connection-manager event pump.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;

use super::cm::{CmEvent, CmHandler, CmId};
use super::mr::DmaBuf;

/// A registered remote-access window over a region of a [`DmaBuf`].
#[derive(Clone)]
pub(crate) struct Window {
    pub buf: DmaBuf,
    pub offset: usize,
    pub len: usize,
}

pub(crate) struct Listener {
    pub cm: CmId,
    /// Number of connections the listening endpoint has fully established.
    /// Connectors use this to take their turn in id order.
    pub accepted: Arc<AtomicUsize>,
}

struct CmWork {
    handler: CmHandler,
    event: CmEvent,
}

struct FabricInner {
    listeners: Mutex<HashMap<String, Listener>>,
    windows: Mutex<HashMap<u32, Window>>,
    next_rkey: AtomicU32,
    cm_tx: Sender<CmWork>,
}

/// The emulated fabric. All endpoints of a cluster share one instance; the
/// instance owns the remote-key namespace, the listening-address namespace,
/// and a single pump thread that delivers connection-manager events in the
/// order they were raised.
#[derive(Clone)]
pub struct Fabric {
    inner: Arc<FabricInner>,
}

impl Fabric {
    pub fn new() -> Self {
        let (cm_tx, cm_rx) = unbounded::<CmWork>();
        // One pump serializes CM event delivery fabric-wide. Connection
        // bring-up counts established events per endpoint, which only works
        // if no two events race each other through different threads.
        thread::Builder::new()
            .name("dkmsg-cm".into())
            .spawn(move || {
                for work in cm_rx.iter() {
                    (work.handler)(work.event);
                }
            })
            .expect("failed to spawn the CM event pump");
        Self {
            inner: Arc::new(FabricInner {
                listeners: Mutex::new(HashMap::new()),
                windows: Mutex::new(HashMap::new()),
                next_rkey: AtomicU32::new(1),
                cm_tx,
            }),
        }
    }

    /// Queue a CM event for delivery to `handler` on the pump thread.
    pub(crate) fn post_cm(&self, handler: CmHandler, event: CmEvent) {
        let _ = self.inner.cm_tx.send(CmWork { handler, event });
    }

    /// Bind a listening endpoint. Returns `false` if the address is taken.
    pub(crate) fn bind_listener(&self, addr: &str, cm: CmId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        if listeners.contains_key(addr) {
            return false;
        }
        listeners.insert(
            addr.to_owned(),
            Listener {
                cm,
                accepted: Arc::new(AtomicUsize::new(0)),
            },
        );
        true
    }

    pub(crate) fn listener(&self, addr: &str) -> Option<(CmId, Arc<AtomicUsize>)> {
        self.inner
            .listeners
            .lock()
            .get(addr)
            .map(|l| (l.cm.clone(), l.accepted.clone()))
    }

    /// Record one more fully established connection at `addr`, releasing the
    /// next connector waiting its turn.
    pub(crate) fn listener_accepted(&self, addr: &str) {
        if let Some(listener) = self.inner.listeners.lock().get(addr) {
            listener.accepted.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Register a window, atomically invalidating a previous binding first
    /// when `invalidate` names one. Returns the new remote key.
    pub(crate) fn rebind_window(
        &self,
        invalidate: Option<u32>,
        buf: DmaBuf,
        offset: usize,
        len: usize,
    ) -> u32 {
        let mut windows = self.inner.windows.lock();
        if let Some(rkey) = invalidate {
            windows.remove(&rkey);
        }
        let rkey = self.inner.next_rkey.fetch_add(1, Ordering::Relaxed);
        windows.insert(rkey, Window { buf, offset, len });
        rkey
    }

    pub(crate) fn window(&self, rkey: u32) -> Option<Window> {
        self.inner.windows.lock().get(&rkey).cloned()
    }
}

impl Default for Fabric {
    fn default() -> Self {
        Self::new()
    }
}
