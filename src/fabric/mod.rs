//! In-process emulated reliable-connected fabric.
//!
//! The fabric exposes the verbs-level vocabulary the transport is written
//! against: connection-manager ids and events, queue pairs, completion
//! queues, and remotely addressable memory windows. All resource holder
//! types are thin wrappers over an `Arc` and can be shared by `clone()`-ing.
//!
//! One [`Fabric`] is a process-wide switch: every node of an emulated
//! cluster opens its endpoints against the same instance. One-sided
//! read/write operations act directly on the switch's window registry, so
//! the remote CPU is never involved, mirroring real RDMA semantics. Send
//! traffic travels over per-connection pipes into the peer queue pair's
//! pre-posted receive buffers.

mod cm;
mod cq;
mod mr;
mod qp;
mod switch;

pub use cm::{CmEvent, CmId};
pub use cq::{Cq, Wc, WcOpcode, WcStatus};
pub use mr::{DmaBuf, RemoteMem};
pub use qp::Qp;
pub use switch::Fabric;
