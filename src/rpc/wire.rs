//! Frame layout.
//!
//! Every frame on the wire is a 4-byte big-endian length prefix followed
//! by exactly that many body bytes:
//!
//! ```text
//! +--------+------------+---------+----------------------+
//! | len u32| sender u64 | kind u8 | kind-specific bytes  |
//! +--------+------------+---------+----------------------+
//!
//! Call:  op_len u8 | op bytes | payload
//! Reply: status u8 | payload
//! ```
//!
//! Header fields are decoded and validated in order; no payload byte is
//! interpreted before the header fully parses.

use super::Error;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub(super) const KIND_CALL: u8 = 1;
pub(super) const KIND_REPLY: u8 = 2;

/// Reply status: the handler produced a payload.
pub(super) const STATUS_OK: u8 = 0;
/// Reply status: the handler failed; the payload is its error message.
pub(super) const STATUS_ERROR: u8 = 1;
/// Reply status: no handler is registered; the payload is the operation
/// name.
pub(super) const STATUS_UNKNOWN_OP: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Frame {
    Call {
        sender: u64,
        op: String,
        payload: Bytes,
    },
    Reply {
        sender: u64,
        status: u8,
        payload: Bytes,
    },
}

impl Frame {
    /// Body length, excluding the length prefix.
    pub fn body_len(&self) -> usize {
        match self {
            Frame::Call { op, payload, .. } => 8 + 1 + 1 + op.len() + payload.len(),
            Frame::Reply { payload, .. } => 8 + 1 + 1 + payload.len(),
        }
    }

    /// Serialize the frame, length prefix included.
    pub fn encode(&self) -> Bytes {
        let body = self.body_len();
        let mut buf = BytesMut::with_capacity(4 + body);
        buf.put_u32(body as u32);
        match self {
            Frame::Call {
                sender,
                op,
                payload,
            } => {
                debug_assert!(!op.is_empty() && op.len() <= u8::MAX as usize);
                buf.put_u64(*sender);
                buf.put_u8(KIND_CALL);
                buf.put_u8(op.len() as u8);
                buf.put_slice(op.as_bytes());
                buf.put_slice(payload);
            }
            Frame::Reply {
                sender,
                status,
                payload,
            } => {
                buf.put_u64(*sender);
                buf.put_u8(KIND_REPLY);
                buf.put_u8(*status);
                buf.put_slice(payload);
            }
        }
        buf.freeze()
    }

    /// Parse one frame body (the length prefix already consumed).
    pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
        if buf.remaining() < 8 + 1 {
            return Err(Error::InvalidFrame);
        }
        let sender = buf.get_u64();
        match buf.get_u8() {
            KIND_CALL => {
                if buf.remaining() < 1 {
                    return Err(Error::InvalidFrame);
                }
                let op_len = buf.get_u8() as usize;
                if op_len == 0 || buf.remaining() < op_len {
                    return Err(Error::InvalidFrame);
                }
                let op = String::from_utf8(buf.split_to(op_len).to_vec())
                    .map_err(|_| Error::InvalidFrame)?;
                Ok(Frame::Call {
                    sender,
                    op,
                    payload: buf,
                })
            }
            KIND_REPLY => {
                if buf.remaining() < 1 {
                    return Err(Error::InvalidFrame);
                }
                let status = buf.get_u8();
                Ok(Frame::Reply {
                    sender,
                    status,
                    payload: buf,
                })
            }
            _ => Err(Error::InvalidFrame),
        }
    }
}
