use thiserror::Error;

use crate::link::NodeId;

/// Transport-level error.
///
/// Configuration errors are surfaced immediately at the call site and never
/// retried. Fabric failures are absorbed into the per-link error state; every
/// caller blocked on that link observes [`Error::LinkErrored`] instead of
/// hanging. Programming-contract violations (double slot release, unregistered
/// message type) are not represented here: they panic.
#[derive(Debug, Error)]
pub enum Error {
    /// Message larger than the fixed wire maximum.
    #[error("message of {0} bytes exceeds the maximum message size")]
    MessageTooLarge(usize),

    /// Messages to the local node are a caller error, not a loopback path.
    #[error("cannot send a message to the local node")]
    SelfSend,

    /// RDMA transfer size is zero or above the fixed maximum.
    #[error("transfer size {0} is out of range")]
    BadTransferSize(usize),

    /// Node id outside the node table, or the local id itself where a remote
    /// was expected.
    #[error("no node with id {0} in the node table")]
    NoSuchNode(NodeId),

    /// The link has entered its absorbing error state; all operations on it
    /// fail immediately.
    #[error("link to node {0} is down")]
    LinkErrored(NodeId),

    /// The link never reached the connected state.
    #[error("link to node {0} is not connected")]
    NotConnected(NodeId),

    /// Registration slot acquisition exceeded its bounded wait.
    #[error("registration slot pool for node {0} exhausted")]
    SlotPoolExhausted(NodeId),

    /// Connection establishment failed for one link.
    #[error("connection to node {node} failed: {reason}")]
    ConnectFailed { node: NodeId, reason: String },

    /// A bounded connection-phase wait expired.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// A handler is already registered for the message type.
    #[error("a handler is already registered for message type {0}")]
    HandlerExists(u16),

    /// Inbound bytes that do not decode as a message or descriptor.
    #[error("malformed message: {0}")]
    Malformed(&'static str),

    /// A fabric object was used outside its valid lifecycle.
    #[error("fabric operation failed: {0}")]
    Fabric(&'static str),

    /// Bad node table or configuration file.
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
