//! Queue pairs: one engine thread per endpoint executing posted work
//! requests and delivering inbound traffic into pre-posted receive buffers.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{Error, Result};

use super::cq::{Cq, Wc, WcOpcode, WcStatus};
use super::mr::DmaBuf;
use super::switch::Fabric;

/// A posted work request, executed in order by the engine thread.
enum Op {
    Send {
        bytes: Vec<u8>,
        wr_id: u64,
    },
    Write {
        rkey: u32,
        offset: u64,
        bytes: Vec<u8>,
        wr_id: u64,
    },
    Read {
        rkey: u32,
        offset: u64,
        dst: DmaBuf,
        len: usize,
        wr_id: u64,
    },
    Recv {
        buf: DmaBuf,
        wr_id: u64,
    },
    Stop,
}

/// Traffic arriving from the connected peer.
pub(crate) enum Wire {
    Msg(Vec<u8>),
    /// The peer tore the connection down; flush outstanding receives.
    Hangup,
}

struct QpInner {
    cq: Cq,
    ops_tx: Sender<Op>,
    inbox_tx: Sender<Wire>,
    peer: Arc<Mutex<Option<Sender<Wire>>>>,
    engine: Mutex<Option<JoinHandle<()>>>,
}

/// A reliable-connected queue pair.
///
/// Work requests are posted through channels and executed by a dedicated
/// engine thread, so post calls never block on the fabric. Every request
/// produces exactly one completion on the associated [`Cq`], success or
/// failure; the connection itself never retries.
#[derive(Clone)]
pub struct Qp {
    inner: Arc<QpInner>,
}

impl Qp {
    pub(crate) fn new(fabric: Fabric, cq: Cq) -> Self {
        let (ops_tx, ops_rx) = unbounded();
        let (inbox_tx, inbox_rx) = unbounded();
        let peer = Arc::new(Mutex::new(None));
        let engine = Engine {
            fabric,
            cq: cq.clone(),
            peer: peer.clone(),
            ops_rx,
            inbox_rx,
            recvs: VecDeque::new(),
        };
        let handle = thread::Builder::new()
            .name("dkmsg-qp".into())
            .spawn(move || engine.run())
            .expect("failed to spawn a queue pair engine");
        Self {
            inner: Arc::new(QpInner {
                cq,
                ops_tx,
                inbox_tx,
                peer,
                engine: Mutex::new(Some(handle)),
            }),
        }
    }

    #[inline]
    pub fn cq(&self) -> &Cq {
        &self.inner.cq
    }

    fn post(&self, op: Op) -> Result<()> {
        self.inner
            .ops_tx
            .send(op)
            .map_err(|_| Error::Fabric("queue pair is destroyed"))
    }

    /// Post a two-sided send. Completes with opcode `Send`.
    pub fn post_send(&self, bytes: Vec<u8>, wr_id: u64) -> Result<()> {
        self.post(Op::Send { bytes, wr_id })
    }

    /// Post a receive buffer. Consumed in FIFO order by inbound sends.
    pub fn post_recv(&self, buf: DmaBuf, wr_id: u64) -> Result<()> {
        self.post(Op::Recv { buf, wr_id })
    }

    /// Post a one-sided write of `bytes` into the remote window `rkey` at
    /// `offset`. The remote CPU is not involved.
    pub fn post_write(&self, rkey: u32, offset: u64, bytes: Vec<u8>, wr_id: u64) -> Result<()> {
        self.post(Op::Write {
            rkey,
            offset,
            bytes,
            wr_id,
        })
    }

    /// Post a one-sided read of `len` bytes from the remote window `rkey` at
    /// `offset` into the front of `dst`.
    pub fn post_read(
        &self,
        rkey: u32,
        offset: u64,
        dst: DmaBuf,
        len: usize,
        wr_id: u64,
    ) -> Result<()> {
        self.post(Op::Read {
            rkey,
            offset,
            dst,
            len,
            wr_id,
        })
    }

    /// The inbox endpoint a peer posts wire traffic into.
    pub(crate) fn inbox(&self) -> Sender<Wire> {
        self.inner.inbox_tx.clone()
    }

    /// Wire this queue pair to its peer's inbox.
    pub(crate) fn set_peer(&self, tx: Sender<Wire>) {
        *self.inner.peer.lock() = Some(tx);
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.inner.peer.lock().is_some()
    }

    /// Tell the peer the connection is going away.
    pub(crate) fn hangup_peer(&self) {
        if let Some(tx) = self.inner.peer.lock().take() {
            let _ = tx.send(Wire::Hangup);
        }
    }

    /// Stop the engine, flushing outstanding receives, and join it.
    pub fn destroy(&self) {
        let _ = self.inner.ops_tx.send(Op::Stop);
        if let Some(handle) = self.inner.engine.lock().take() {
            let _ = handle.join();
        }
    }
}

struct Engine {
    fabric: Fabric,
    cq: Cq,
    peer: Arc<Mutex<Option<Sender<Wire>>>>,
    ops_rx: Receiver<Op>,
    inbox_rx: Receiver<Wire>,
    recvs: VecDeque<(DmaBuf, u64)>,
}

impl Engine {
    fn run(mut self) {
        loop {
            select! {
                recv(self.ops_rx) -> op => match op {
                    Ok(op) => {
                        if !self.handle_op(op) {
                            break;
                        }
                    }
                    // All Qp handles dropped without an explicit destroy.
                    Err(_) => break,
                },
                recv(self.inbox_rx) -> wire => match wire {
                    Ok(wire) => self.handle_wire(wire),
                    Err(_) => break,
                },
            }
        }
        self.flush_recvs();
    }

    /// Execute one work request. Returns `false` on `Stop`.
    fn handle_op(&mut self, op: Op) -> bool {
        match op {
            Op::Send { bytes, wr_id } => {
                let byte_len = bytes.len();
                let peer = self.peer.lock().clone();
                let sent = match peer {
                    Some(tx) => tx.send(Wire::Msg(bytes)).is_ok(),
                    None => false,
                };
                self.complete(
                    wr_id,
                    if sent {
                        WcStatus::Success
                    } else {
                        WcStatus::GeneralErr
                    },
                    WcOpcode::Send,
                    if sent { byte_len } else { 0 },
                );
            }
            Op::Write {
                rkey,
                offset,
                bytes,
                wr_id,
            } => {
                let status = match self.fabric.window(rkey) {
                    Some(w) if offset as usize + bytes.len() <= w.len => {
                        w.buf.write(w.offset + offset as usize, &bytes);
                        WcStatus::Success
                    }
                    _ => WcStatus::RemAccessErr,
                };
                let byte_len = if status == WcStatus::Success {
                    bytes.len()
                } else {
                    0
                };
                self.complete(wr_id, status, WcOpcode::RdmaWrite, byte_len);
            }
            Op::Read {
                rkey,
                offset,
                dst,
                len,
                wr_id,
            } => {
                let status = match self.fabric.window(rkey) {
                    Some(w) if offset as usize + len <= w.len && len <= dst.len() => {
                        let data = w.buf.read(w.offset + offset as usize, len);
                        dst.write(0, &data);
                        WcStatus::Success
                    }
                    Some(_) => WcStatus::LocLenErr,
                    None => WcStatus::RemAccessErr,
                };
                let byte_len = if status == WcStatus::Success { len } else { 0 };
                self.complete(wr_id, status, WcOpcode::RdmaRead, byte_len);
            }
            Op::Recv { buf, wr_id } => self.recvs.push_back((buf, wr_id)),
            Op::Stop => return false,
        }
        true
    }

    fn handle_wire(&mut self, wire: Wire) {
        match wire {
            Wire::Msg(bytes) => match self.recvs.pop_front() {
                Some((buf, wr_id)) if bytes.len() <= buf.len() => {
                    buf.write(0, &bytes);
                    self.complete(wr_id, WcStatus::Success, WcOpcode::Recv, bytes.len());
                }
                Some((_, wr_id)) => {
                    self.complete(wr_id, WcStatus::LocLenErr, WcOpcode::Recv, 0);
                }
                None => {
                    // Receiver not ready and the connection does not retry.
                    self.complete(0, WcStatus::RnrRetryExcErr, WcOpcode::Recv, 0);
                }
            },
            Wire::Hangup => self.flush_recvs(),
        }
    }

    fn flush_recvs(&mut self) {
        while let Some((_, wr_id)) = self.recvs.pop_front() {
            self.complete(wr_id, WcStatus::WrFlushErr, WcOpcode::Recv, 0);
        }
    }

    fn complete(&self, wr_id: u64, status: WcStatus, opcode: WcOpcode, byte_len: usize) {
        self.cq.push(Wc {
            wr_id,
            status,
            opcode,
            byte_len,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn poll_wait(cq: &Cq) -> Wc {
        for _ in 0..200 {
            if let Some(wc) = cq.poll() {
                return wc;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("no completion arrived");
    }

    fn wired_pair(fabric: &Fabric) -> (Qp, Cq, Qp, Cq) {
        let (cq_a, cq_b) = (Cq::new(), Cq::new());
        let a = Qp::new(fabric.clone(), cq_a.clone());
        let b = Qp::new(fabric.clone(), cq_b.clone());
        a.set_peer(b.inbox());
        b.set_peer(a.inbox());
        (a, cq_a, b, cq_b)
    }

    #[test]
    fn test_send_recv() {
        let fabric = Fabric::new();
        let (a, cq_a, b, cq_b) = wired_pair(&fabric);

        b.post_recv(DmaBuf::alloc(64), 7).unwrap();
        a.post_send(b"ping".to_vec(), 1).unwrap();

        let wc = poll_wait(&cq_a);
        assert_eq!(wc.opcode, WcOpcode::Send);
        assert_eq!(wc.ok().unwrap(), 4);

        let wc = poll_wait(&cq_b);
        assert_eq!(wc.opcode, WcOpcode::Recv);
        assert_eq!(wc.wr_id, 7);
        assert_eq!(wc.ok().unwrap(), 4);

        a.destroy();
        b.destroy();
    }

    #[test]
    fn test_recv_without_buffer_is_rnr() {
        let fabric = Fabric::new();
        let (a, cq_a, b, cq_b) = wired_pair(&fabric);

        a.post_send(b"x".to_vec(), 1).unwrap();
        poll_wait(&cq_a);
        assert_eq!(poll_wait(&cq_b).status, WcStatus::RnrRetryExcErr);

        a.destroy();
        b.destroy();
    }

    #[test]
    fn test_one_sided_write_and_read() {
        let fabric = Fabric::new();
        let (a, cq_a, b, _cq_b) = wired_pair(&fabric);

        let remote = DmaBuf::alloc(128);
        let rkey = fabric.rebind_window(None, remote.clone(), 0, 128);

        a.post_write(rkey, 16, b"payload".to_vec(), 2).unwrap();
        assert_eq!(poll_wait(&cq_a).ok().unwrap(), 7);
        assert_eq!(remote.read(16, 7), b"payload");

        let local = DmaBuf::alloc(7);
        a.post_read(rkey, 16, local.clone(), 7, 3).unwrap();
        let wc = poll_wait(&cq_a);
        assert_eq!(wc.opcode, WcOpcode::RdmaRead);
        assert_eq!(wc.ok().unwrap(), 7);
        assert_eq!(local.read(0, 7), b"payload");

        a.destroy();
        b.destroy();
    }

    #[test]
    fn test_bogus_rkey_fails_remotely() {
        let fabric = Fabric::new();
        let (a, cq_a, b, _cq_b) = wired_pair(&fabric);

        a.post_write(0xdead, 0, vec![0; 8], 4).unwrap();
        assert_eq!(poll_wait(&cq_a).status, WcStatus::RemAccessErr);

        a.destroy();
        b.destroy();
    }

    #[test]
    fn test_destroy_flushes_posted_recvs() {
        let fabric = Fabric::new();
        let cq = Cq::new();
        let qp = Qp::new(fabric, cq.clone());
        qp.post_recv(DmaBuf::alloc(8), 11).unwrap();
        qp.destroy();
        let wc = poll_wait(&cq);
        assert_eq!(wc.status, WcStatus::WrFlushErr);
        assert_eq!(wc.wr_id, 11);
    }
}
