//! Peer-init catalog: the first frame on a freshly opened peer socket.
//!
//! These use a single-byte opcode where every other catalog uses four.
//! Confusing the two desynchronizes the framing, so this catalog gets its
//! own type.

use bytes::Bytes;

use crate::types::{ConnectionType, Token};
use crate::wire::{MessageReader, MessageWriter, ProtoError};

/// The identifying handshake on a new peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerInitMessage {
    /// Completes a rendezvous the server brokered on our behalf: carries
    /// only the token from the original connect request.
    PierceFirewall { token: Token },
    /// Direct introduction: who we are and what the connection is for.
    PeerInit {
        username: String,
        conn_type: ConnectionType,
        token: Token,
    },
}

impl PeerInitMessage {
    /// Encodes the frame payload (no length prefix).
    pub fn encode(&self) -> Bytes {
        let mut w = MessageWriter::new();
        match self {
            PeerInitMessage::PierceFirewall { token } => {
                w.write_u8(0).write_token(*token);
            }
            PeerInitMessage::PeerInit {
                username,
                conn_type,
                token,
            } => {
                w.write_u8(1)
                    .write_string(username)
                    .write_string(conn_type.as_str())
                    .write_token(*token);
            }
        }
        w.finish()
    }

    /// Decodes a frame payload. `Ok(None)` for unknown opcodes and for
    /// heartbeat-sized payloads (4 bytes or fewer).
    pub fn decode(payload: &[u8]) -> Result<Option<Self>, ProtoError> {
        if payload.len() <= 4 {
            return Ok(None);
        }
        let mut r = MessageReader::new(payload);
        let msg = match r.read_u8()? {
            0 => PeerInitMessage::PierceFirewall {
                token: r.read_token()?,
            },
            1 => {
                let username = r.read_string()?;
                let conn_type = ConnectionType::from_wire(&r.read_string()?)
                    .ok_or(ProtoError::InvalidField("connection type"))?;
                PeerInitMessage::PeerInit {
                    username,
                    conn_type,
                    token: r.read_token()?,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trips() {
        for msg in [
            PeerInitMessage::PierceFirewall {
                token: Token([0xde, 0xad, 0xbe, 0xef]),
            },
            PeerInitMessage::PeerInit {
                username: "alice".into(),
                conn_type: ConnectionType::PeerToPeer,
                token: Token([0, 0, 0, 1]),
            },
            PeerInitMessage::PeerInit {
                username: String::new(),
                conn_type: ConnectionType::FileTransfer,
                token: Token([0xff; 4]),
            },
        ] {
            let back = PeerInitMessage::decode(&msg.encode()).unwrap().unwrap();
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn test_single_byte_opcode() {
        let payload = PeerInitMessage::PierceFirewall {
            token: Token([1, 2, 3, 4]),
        }
        .encode();
        // 1-byte opcode + 4 token bytes, nothing else
        assert_eq!(&payload[..], &[0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_short_payload_is_heartbeat() {
        assert!(PeerInitMessage::decode(&[0, 1, 2, 3]).unwrap().is_none());
    }

    #[test]
    fn test_unknown_opcode_dropped() {
        assert!(PeerInitMessage::decode(&[7, 1, 2, 3, 4]).unwrap().is_none());
    }
}
