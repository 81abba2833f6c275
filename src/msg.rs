//! Message model: the fixed-layout wire header, the fixed-capacity message,
//! and the RDMA descriptor carried by messages whose RDMA flag is set.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fabric::RemoteMem;
use crate::link::NodeId;

/// Maximum on-wire size of one message, header included.
pub const MAX_MSG_SIZE: usize = 4096;

/// Maximum size of one RDMA transfer.
pub const MAX_RDMA_SIZE: usize = 1 << 20;

/// Size of the type-tag space. One handler slot per tag.
pub const MAX_MSG_TYPES: usize = 64;

/// Message type tag, demultiplexed to the registered handler.
pub type MsgType = u16;

/// Wire footprint of [`MsgHeader`].
pub const HDR_SIZE: usize = 16;

const FLAG_RDMA: u8 = 1 << 0;
const FLAG_PRIO_HIGH: u8 = 1 << 1;

/// Message priority. Carried on the wire for collaborators that schedule
/// bottom-half work by urgency.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum MsgPriority {
    #[default]
    Normal,
    High,
}

/// Fixed-layout message header, encoded little-endian.
#[derive(Clone, Debug)]
pub struct MsgHeader {
    /// Type tag; must be one of the registered handler types on the receiver.
    pub msg_type: MsgType,
    /// Payload length in bytes, excluding this header.
    pub size: u32,
    /// Origin node id, stamped by the send path.
    pub from: NodeId,
    /// Set when the payload is an [`RdmaDescriptor`].
    pub is_rdma: bool,
    pub prio: MsgPriority,
}

impl MsgHeader {
    pub fn encode(&self) -> [u8; HDR_SIZE] {
        let mut buf = [0u8; HDR_SIZE];
        buf[0..2].copy_from_slice(&self.msg_type.to_le_bytes());
        buf[2..6].copy_from_slice(&self.size.to_le_bytes());
        buf[6..8].copy_from_slice(&(self.from as u16).to_le_bytes());
        let mut flags = 0u8;
        if self.is_rdma {
            flags |= FLAG_RDMA;
        }
        if self.prio == MsgPriority::High {
            flags |= FLAG_PRIO_HIGH;
        }
        buf[8] = flags;
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HDR_SIZE {
            return Err(Error::Malformed("short header"));
        }
        let msg_type = u16::from_le_bytes([buf[0], buf[1]]);
        let size = u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]);
        let from = u16::from_le_bytes([buf[6], buf[7]]) as NodeId;
        let flags = buf[8];
        if size as usize > MAX_MSG_SIZE - HDR_SIZE {
            return Err(Error::Malformed("payload length exceeds the maximum"));
        }
        Ok(Self {
            msg_type,
            size,
            from,
            is_rdma: flags & FLAG_RDMA != 0,
            prio: if flags & FLAG_PRIO_HIGH != 0 {
                MsgPriority::High
            } else {
                MsgPriority::Normal
            },
        })
    }
}

/// An outbound message: header plus an inline payload of at most
/// `MAX_MSG_SIZE - HDR_SIZE` bytes.
///
/// The send path stamps `header.size` and `header.from` before transmission;
/// callers only choose the type tag, priority, and payload.
#[derive(Clone, Debug)]
pub struct Message {
    pub header: MsgHeader,
    payload: Vec<u8>,
}

impl Message {
    pub fn new(msg_type: MsgType, payload: Vec<u8>) -> Result<Self> {
        if payload.len() > MAX_MSG_SIZE - HDR_SIZE {
            return Err(Error::MessageTooLarge(HDR_SIZE + payload.len()));
        }
        Ok(Self {
            header: MsgHeader {
                msg_type,
                size: payload.len() as u32,
                from: 0,
                is_rdma: false,
                prio: MsgPriority::Normal,
            },
            payload,
        })
    }

    /// Build a message carrying an RDMA descriptor as its payload.
    pub(crate) fn with_descriptor(msg_type: MsgType, desc: &RdmaDescriptor) -> Result<Self> {
        let payload =
            serde_json::to_vec(desc).map_err(|_| Error::Malformed("descriptor encode"))?;
        let mut msg = Self::new(msg_type, payload)?;
        msg.header.is_rdma = true;
        Ok(msg)
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Total wire size of the encoded message.
    #[inline]
    pub fn wire_size(&self) -> usize {
        HDR_SIZE + self.payload.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_size());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Direction of an RDMA transfer, stable across the request/response pair.
///
/// The active side always registers *its own* buffer: a `Write` request asks
/// the passive side to write into it (fetch), a `Read` request asks the
/// passive side to read from it (push).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum RdmaDir {
    Write,
    Read,
}

/// RDMA descriptor, carried as the payload of a message whose RDMA flag is
/// set. `ack` is false on the initiating message and true on the response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RdmaDescriptor {
    pub dir: RdmaDir,
    pub ack: bool,
    /// The active side's registered window.
    pub window: RemoteMem,
    /// Transfer size in bytes. On the response, the size actually moved.
    pub size: u32,
    /// Type tag the passive side uses for its acknowledgment message.
    pub response_type: MsgType,
    /// Active-side registration slot, echoed back so the response can
    /// release it.
    pub slot: u32,
    /// Wait-station token parking the active-side caller.
    pub token: u64,
}

impl RdmaDescriptor {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|_| Error::Malformed("descriptor decode"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let hdr = MsgHeader {
            msg_type: 7,
            size: 1234,
            from: 3,
            is_rdma: true,
            prio: MsgPriority::High,
        };
        let decoded = MsgHeader::decode(&hdr.encode()).unwrap();
        assert_eq!(decoded.msg_type, 7);
        assert_eq!(decoded.size, 1234);
        assert_eq!(decoded.from, 3);
        assert!(decoded.is_rdma);
        assert_eq!(decoded.prio, MsgPriority::High);
    }

    #[test]
    fn test_rejects_oversized_payload() {
        assert!(matches!(
            Message::new(0, vec![0; MAX_MSG_SIZE]),
            Err(Error::MessageTooLarge(_))
        ));
    }

    #[test]
    fn test_descriptor_in_message() {
        let desc = RdmaDescriptor {
            dir: RdmaDir::Write,
            ack: false,
            window: RemoteMem {
                rkey: 42,
                offset: 0,
                len: 4096,
            },
            size: 4096,
            response_type: 9,
            slot: 5,
            token: 77,
        };
        let msg = Message::with_descriptor(3, &desc).unwrap();
        assert!(msg.header.is_rdma);
        let back = RdmaDescriptor::decode(msg.payload()).unwrap();
        assert_eq!(back.window.rkey, 42);
        assert_eq!(back.dir, RdmaDir::Write);
        assert!(!back.ack);
    }
}
