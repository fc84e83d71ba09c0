// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Heartbeat wire protocol.
//!
//! Fixed-size binary message, no length prefix. Framing relies on every
//! message being exactly [`MESSAGE_LEN`] bytes (see [`crate::connection`]).
//!
//! Wire format (big-endian):
//! ```text
//! +----------+-------------------+------------------------------+
//! | Kind (1) | Heartbeat ID (4)  | Timestamp, ns since epoch (8)|
//! +----------+-------------------+------------------------------+
//! ```

use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Size of one encoded heartbeat message.
pub const MESSAGE_LEN: usize = 13;

/// Tag byte of a heartbeat request.
pub const TAG_REQUEST: u8 = 1;

/// Tag byte of a heartbeat response.
pub const TAG_RESPONSE: u8 = 2;

/// Heartbeat message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Client -> server probe.
    Request,
    /// Server -> client acknowledgment.
    Response,
}

impl MessageKind {
    /// Wire tag for this kind.
    pub fn tag(self) -> u8 {
        match self {
            Self::Request => TAG_REQUEST,
            Self::Response => TAG_RESPONSE,
        }
    }

    /// Parse a wire tag.
    pub fn from_tag(tag: u8) -> Result<Self, ProtocolError> {
        match tag {
            TAG_REQUEST => Ok(Self::Request),
            TAG_RESPONSE => Ok(Self::Response),
            kind => Err(ProtocolError::MalformedMessage { kind }),
        }
    }
}

/// A decoded heartbeat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatMessage {
    pub kind: MessageKind,
    pub id: u32,
    /// Sender wall clock, nanoseconds since the Unix epoch.
    pub timestamp: i64,
}

impl HeartbeatMessage {
    /// Build a request stamped with the current wall clock.
    pub fn request(id: u32) -> Self {
        Self {
            kind: MessageKind::Request,
            id,
            timestamp: unix_nanos(),
        }
    }

    /// Acknowledgment for this message; id and timestamp are kept.
    pub fn into_response(self) -> Self {
        Self {
            kind: MessageKind::Response,
            ..self
        }
    }

    /// Encode into the fixed wire layout.
    pub fn encode(&self) -> [u8; MESSAGE_LEN] {
        encode(self)
    }
}

/// Encode a message into its 13-byte wire form.
pub fn encode(msg: &HeartbeatMessage) -> [u8; MESSAGE_LEN] {
    let mut buf = [0u8; MESSAGE_LEN];
    buf[0] = msg.kind.tag();
    buf[1..5].copy_from_slice(&msg.id.to_be_bytes());
    buf[5..13].copy_from_slice(&msg.timestamp.to_be_bytes());
    buf
}

/// Decode a message from the first [`MESSAGE_LEN`] bytes of `buf`.
pub fn decode(buf: &[u8]) -> Result<HeartbeatMessage, ProtocolError> {
    if buf.len() < MESSAGE_LEN {
        return Err(ProtocolError::Truncated { len: buf.len() });
    }

    let kind = MessageKind::from_tag(buf[0])?;

    let mut id = [0u8; 4];
    id.copy_from_slice(&buf[1..5]);
    let mut timestamp = [0u8; 8];
    timestamp.copy_from_slice(&buf[5..13]);

    Ok(HeartbeatMessage {
        kind,
        id: u32::from_be_bytes(id),
        timestamp: i64::from_be_bytes(timestamp),
    })
}

/// Current wall clock as nanoseconds since the Unix epoch.
///
/// Saturates instead of failing if the clock is before 1970 or past 2262.
pub fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Protocol error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Malformed message: unknown kind tag {kind}")]
    MalformedMessage { kind: u8 },

    #[error("Truncated message: {len} of {MESSAGE_LEN} bytes")]
    Truncated { len: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let msg = HeartbeatMessage {
            kind: MessageKind::Request,
            id: 0x0102_0304,
            timestamp: 0x1122_3344_5566_7788,
        };

        let buf = encode(&msg);
        assert_eq!(
            buf,
            [
                0x01, 0x01, 0x02, 0x03, 0x04, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88
            ]
        );
    }

    #[test]
    fn test_roundtrip_extremes() {
        for msg in [
            HeartbeatMessage {
                kind: MessageKind::Request,
                id: 1,
                timestamp: 1_700_000_000_000_000_000,
            },
            HeartbeatMessage {
                kind: MessageKind::Response,
                id: u32::MAX,
                timestamp: i64::MIN,
            },
            HeartbeatMessage {
                kind: MessageKind::Response,
                id: 0,
                timestamp: -1,
            },
        ] {
            assert_eq!(decode(&encode(&msg)).unwrap(), msg);
        }
    }

    #[test]
    fn test_decode_unknown_kind() {
        let mut buf = encode(&HeartbeatMessage::request(7));
        buf[0] = 9;
        assert_eq!(
            decode(&buf),
            Err(ProtocolError::MalformedMessage { kind: 9 })
        );

        buf[0] = 0;
        assert!(decode(&buf).is_err());
    }

    #[test]
    fn test_decode_truncated() {
        let buf = encode(&HeartbeatMessage::request(7));
        assert_eq!(
            decode(&buf[..12]),
            Err(ProtocolError::Truncated { len: 12 })
        );
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn test_into_response_keeps_id_and_timestamp() {
        let req = HeartbeatMessage::request(42);
        let resp = req.into_response();
        assert_eq!(resp.kind, MessageKind::Response);
        assert_eq!(resp.id, 42);
        assert_eq!(resp.timestamp, req.timestamp);

        // Echoing a request is a single tag rewrite.
        let mut wire = req.encode();
        wire[0] = TAG_RESPONSE;
        assert_eq!(wire, resp.encode());
    }

    #[test]
    fn test_request_timestamp_is_recent() {
        let before = unix_nanos();
        let msg = HeartbeatMessage::request(1);
        assert!(msg.timestamp >= before);
        assert!(msg.timestamp > 0);
    }
}
