//! Node-to-node message transport of a distributed-kernel platform over a
//! reliable-connected fabric.
//!
//! `dkmsg` gives every node of a small, statically configured cluster a
//! synchronous messaging endpoint: fixed-size control messages delivered to
//! per-type handlers, and a request/response protocol for bulk one-sided
//! RDMA transfers between registered memory windows.
//!
//! All resource holder types ([`Fabric`], [`fabric::Cq`], [`fabric::Qp`],
//! [`DmaBuf`], [`ring::RingBuffer`]) are thin wrappers over an `Arc` and are
//! shared by `clone()`-ing. The fabric itself is emulated in-process: every
//! node of a cluster opens its endpoints against one [`Fabric`] instance,
//! which makes whole clusters testable inside a single test binary.
//!
//! # Example
//!
//! ```rust,no_run
//! use dkmsg::{Fabric, Message, NodeTable, Transport};
//! use anyhow::Result;
//!
//! fn main() -> Result<()> {
//!     let fabric = Fabric::new();
//!     let table = NodeTable::new(vec!["node0".into(), "node1".into()], 0)?;
//!     let transport = Transport::start(fabric, table)?;
//!
//!     transport.register_handler(7, |msg| {
//!         println!("node {} says: {:?}", msg.from(), msg.payload());
//!     })?;
//!
//!     let mut msg = Message::new(7, b"hello".to_vec())?;
//!     transport.send(1, &mut msg)?;
//!     Ok(())
//! }
//! ```

mod cm;
mod dispatch;
mod error;
mod link;
mod mr_pool;
mod transport;

/// The emulated reliable-connected fabric.
pub mod fabric;

/// Node table configuration.
pub mod config;

/// Message model and wire formats.
pub mod msg;

/// The multi-chunk inbound staging ring.
pub mod ring;

pub use config::NodeTable;
pub use dispatch::InboundMsg;
pub use error::{Error, Result};
pub use fabric::{DmaBuf, Fabric};
pub use link::{LinkRole, LinkState, NodeId, MAX_RECV_WR};
pub use mr_pool::MR_POOL_SIZE;
pub use msg::{
    Message, MsgHeader, MsgPriority, MsgType, RdmaDir, MAX_MSG_SIZE, MAX_MSG_TYPES, MAX_RDMA_SIZE,
};
pub use transport::Transport;
