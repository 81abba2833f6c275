//! Cluster-level tests: whole emulated clusters brought up inside the test
//! process, one thread per node.

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::unbounded;

use dkmsg::{DmaBuf, Error, Fabric, Message, NodeTable, RdmaDir, Transport};

fn table(addrs: &[&str], local: usize) -> NodeTable {
    NodeTable::new(addrs.iter().map(|s| s.to_string()).collect(), local).unwrap()
}

#[test]
fn test_two_node_send() -> Result<()> {
    const MSG: u16 = 7;
    let fabric = Fabric::new();
    let ready = Arc::new(Barrier::new(2));
    let done = Arc::new(Barrier::new(2));

    let receiver = {
        let fabric = fabric.clone();
        let ready = ready.clone();
        let done = done.clone();
        thread::spawn(move || -> Result<()> {
            let t = Transport::start(fabric, table(&["n0", "n1"], 1))?;
            let (tx, rx) = unbounded();
            t.register_handler(MSG, move |msg| {
                let _ = tx.send((msg.from(), msg.payload().to_vec()));
            })?;
            ready.wait();
            let (from, payload) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(from, 0);
            assert_eq!(payload, b"over the fabric");
            done.wait();
            Ok(())
        })
    };

    let t = Transport::start(fabric, table(&["n0", "n1"], 0))?;
    ready.wait();
    let mut msg = Message::new(MSG, b"over the fabric".to_vec())?;
    t.send(1, &mut msg)?;
    done.wait();
    receiver.join().unwrap()?;
    Ok(())
}

#[test]
fn test_rdma_write_fetches_remote_data() -> Result<()> {
    const REQ: u16 = 10;
    const ACK: u16 = 11;
    let fabric = Fabric::new();
    let ready = Arc::new(Barrier::new(2));
    let done = Arc::new(Barrier::new(2));

    let server = {
        let fabric = fabric.clone();
        let ready = ready.clone();
        let done = done.clone();
        thread::spawn(move || -> Result<()> {
            let t = Transport::start(fabric, table(&["n0", "n1"], 1))?;
            let handler_t = t.clone();
            t.register_handler(REQ, move |msg| {
                // Serve the fetch with a recognizable pattern.
                let data = DmaBuf::from_slice(&[0xAB; 512]);
                handler_t.respond_rdma(&msg, Some(&data), 512).unwrap();
            })?;
            ready.wait();
            done.wait();
            Ok(())
        })
    };

    let t = Transport::start(fabric, table(&["n0", "n1"], 0))?;
    let ack_t = t.clone();
    t.register_handler(ACK, move |msg| {
        ack_t.respond_rdma(&msg, None, 0).unwrap();
        ack_t.free_message(msg);
    })?;
    ready.wait();

    let buf = DmaBuf::alloc(1024);
    let filled = t
        .request_rdma(1, REQ, ACK, RdmaDir::Write, buf, 512)?
        .expect("a fetch returns the filled buffer");
    assert_eq!(filled.read(0, 512), vec![0xAB; 512]);
    // Bytes beyond the transfer stay untouched.
    assert_eq!(filled.read(512, 512), vec![0u8; 512]);

    done.wait();
    server.join().unwrap()?;
    Ok(())
}

#[test]
fn test_rdma_read_pushes_local_data() -> Result<()> {
    const REQ: u16 = 12;
    const ACK: u16 = 13;
    let fabric = Fabric::new();
    let ready = Arc::new(Barrier::new(2));
    let done = Arc::new(Barrier::new(2));
    let (pulled_tx, pulled_rx) = unbounded::<Vec<u8>>();

    let server = {
        let fabric = fabric.clone();
        let ready = ready.clone();
        let done = done.clone();
        thread::spawn(move || -> Result<()> {
            let t = Transport::start(fabric, table(&["n0", "n1"], 1))?;
            let handler_t = t.clone();
            t.register_handler(REQ, move |msg| {
                let dst = DmaBuf::alloc(256);
                handler_t.respond_rdma(&msg, Some(&dst), 256).unwrap();
                let _ = pulled_tx.send(dst.read(0, 256));
            })?;
            ready.wait();
            done.wait();
            Ok(())
        })
    };

    let t = Transport::start(fabric, table(&["n0", "n1"], 0))?;
    let ack_t = t.clone();
    t.register_handler(ACK, move |msg| {
        ack_t.respond_rdma(&msg, None, 0).unwrap();
    })?;
    ready.wait();

    let payload: Vec<u8> = (0..=255).collect();
    let buf = DmaBuf::from_slice(&payload);
    let returned = t.request_rdma(1, REQ, ACK, RdmaDir::Read, buf, 256)?;
    assert!(returned.is_none(), "a push returns nothing");
    assert_eq!(
        pulled_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        payload
    );

    done.wait();
    server.join().unwrap()?;
    Ok(())
}

#[test]
fn test_three_node_all_pairs() {
    const MSG: u16 = 9;
    const NODES: usize = 3;
    let fabric = Fabric::new();
    let ready = Arc::new(Barrier::new(NODES));
    let done = Arc::new(Barrier::new(NODES));

    let workers: Vec<_> = (0..NODES)
        .map(|id| {
            let fabric = fabric.clone();
            let ready = ready.clone();
            let done = done.clone();
            thread::spawn(move || {
                let t =
                    Transport::start(fabric, table(&["n0", "n1", "n2"], id)).unwrap();
                let (tx, rx) = unbounded();
                t.register_handler(MSG, move |msg| {
                    let _ = tx.send((msg.from(), msg.payload().to_vec()));
                })
                .unwrap();
                ready.wait();

                for peer in 0..NODES {
                    if peer == id {
                        continue;
                    }
                    let mut msg = Message::new(MSG, vec![id as u8]).unwrap();
                    t.send(peer, &mut msg).unwrap();
                }

                let mut seen = HashSet::new();
                for _ in 0..NODES - 1 {
                    let (from, payload) =
                        rx.recv_timeout(Duration::from_secs(5)).unwrap();
                    assert_eq!(payload, vec![from as u8]);
                    seen.insert(from);
                }
                let expected: HashSet<usize> =
                    (0..NODES).filter(|&peer| peer != id).collect();
                assert_eq!(seen, expected);
                done.wait();
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn test_send_validation() -> Result<()> {
    // A single-entry table connects to nobody and starts immediately.
    let t = Transport::start(Fabric::new(), table(&["solo"], 0))?;
    let mut msg = Message::new(1, b"x".to_vec())?;
    assert!(matches!(t.send(0, &mut msg), Err(Error::SelfSend)));
    assert!(matches!(t.send(9, &mut msg), Err(Error::NoSuchNode(9))));
    assert!(matches!(
        t.request_rdma(0, 1, 2, RdmaDir::Write, DmaBuf::alloc(8), 0),
        Err(Error::BadTransferSize(0))
    ));
    assert!(matches!(
        t.request_rdma(0, 1, 2, RdmaDir::Write, DmaBuf::alloc(8), 64),
        Err(Error::BadTransferSize(64))
    ));
    Ok(())
}
