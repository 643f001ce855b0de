//! Peer catalog: messages exchanged over established peer connections.
//!
//! 4-byte LE opcodes. Unlike the server catalog, the shapes are the same
//! in both directions, so one type covers sending and receiving.

use std::io::Read;

use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::types::{FileAttribute, FileEntry, Token, TransferDirection};
use crate::wire::{MessageReader, MessageWriter, ProtoError};

/// A message on a peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Ask the peer for its full share listing.
    ///
    /// The encoded payload is opcode-only (4 bytes), which the heartbeat
    /// policy swallows on receive; the variant exists for the outbound
    /// direction.
    SharedFileListRequest,
    /// Results for a search we issued. The body after the opcode is
    /// zlib-compressed on the wire.
    FileSearchResponse {
        username: String,
        token: Token,
        files: Vec<FileEntry>,
        slots_free: bool,
        avg_speed: u32,
        queue_length: u32,
    },
    /// The peer wants to start a transfer. `size` is present exactly when
    /// `direction` is `Upload` (the peer sending to us).
    TransferRequest {
        direction: TransferDirection,
        token: Token,
        filename: String,
        size: Option<u64>,
    },
    /// Grant or deny a transfer request. `reason` is present exactly when
    /// the transfer is denied.
    TransferResponse {
        token: Token,
        allowed: bool,
        reason: Option<String>,
    },
    /// Ask the peer to queue `filename` for upload to us.
    QueueUpload { filename: String },
    /// The peer reports our rank in its upload queue.
    PlaceInQueueResponse { filename: String, place: u32 },
    /// The peer gave up on uploading `filename`.
    UploadFailed { filename: String },
    /// Ask the peer where we currently sit in its queue.
    PlaceInQueueRequest { filename: String },
}

impl PeerMessage {
    /// Encodes the frame payload (no length prefix).
    pub fn encode(&self) -> Bytes {
        let mut w = MessageWriter::new();
        match self {
            PeerMessage::SharedFileListRequest => {
                w.write_u32(4);
            }
            PeerMessage::FileSearchResponse {
                username,
                token,
                files,
                slots_free,
                avg_speed,
                queue_length,
            } => {
                let mut body = MessageWriter::new();
                body.write_string(username)
                    .write_token(*token)
                    .write_u32(files.len() as u32);
                for file in files {
                    body.write_u8(1) // record code
                        .write_string(&file.filename)
                        .write_u64(file.size)
                        .write_string(&file.extension)
                        .write_u32(file.attributes.len() as u32);
                    for (attr, value) in &file.attributes {
                        body.write_u32(attr.to_wire()).write_u32(*value);
                    }
                }
                body.write_u8(u8::from(*slots_free))
                    .write_u32(*avg_speed)
                    .write_u32(*queue_length);

                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                // Writing to a Vec cannot fail.
                std::io::Write::write_all(&mut encoder, &body.finish()).unwrap();
                let compressed = encoder.finish().unwrap();
                w.write_u32(9).write_bytes(&compressed);
            }
            PeerMessage::TransferRequest {
                direction,
                token,
                filename,
                size,
            } => {
                w.write_u32(40)
                    .write_u32(direction.to_wire())
                    .write_token(*token)
                    .write_string(filename);
                if *direction == TransferDirection::Upload {
                    w.write_u64(size.unwrap_or(0));
                }
            }
            PeerMessage::TransferResponse {
                token,
                allowed,
                reason,
            } => {
                w.write_u32(41).write_token(*token).write_u8(u8::from(*allowed));
                if !allowed {
                    w.write_string(reason.as_deref().unwrap_or(""));
                }
            }
            PeerMessage::QueueUpload { filename } => {
                w.write_u32(43).write_string(filename);
            }
            PeerMessage::PlaceInQueueResponse { filename, place } => {
                w.write_u32(44).write_string(filename).write_u32(*place);
            }
            PeerMessage::UploadFailed { filename } => {
                w.write_u32(46).write_string(filename);
            }
            PeerMessage::PlaceInQueueRequest { filename } => {
                w.write_u32(51).write_string(filename);
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
        let code = r.read_u32()?;
        let msg = match code {
            9 => Self::decode_search_response(r.rest())?,
            40 => {
                let direction = TransferDirection::from_wire(r.read_u32()?)
                    .ok_or(ProtoError::InvalidField("transfer direction"))?;
                let token = r.read_token()?;
                let filename = r.read_string()?;
                let size = match direction {
                    TransferDirection::Upload => Some(r.read_u64()?),
                    TransferDirection::Download => None,
                };
                PeerMessage::TransferRequest {
                    direction,
                    token,
                    filename,
                    size,
                }
            }
            41 => {
                let token = r.read_token()?;
                let allowed = r.read_u8()? != 0;
                let reason = if allowed { None } else { Some(r.read_string()?) };
                PeerMessage::TransferResponse {
                    token,
                    allowed,
                    reason,
                }
            }
            43 => PeerMessage::QueueUpload {
                filename: r.read_string()?,
            },
            44 => PeerMessage::PlaceInQueueResponse {
                filename: r.read_string()?,
                place: r.read_u32()?,
            },
            46 => PeerMessage::UploadFailed {
                filename: r.read_string()?,
            },
            51 => PeerMessage::PlaceInQueueRequest {
                filename: r.read_string()?,
            },
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }

    fn decode_search_response(compressed: &[u8]) -> Result<Self, ProtoError> {
        let mut body = Vec::new();
        ZlibDecoder::new(compressed)
            .read_to_end(&mut body)
            .map_err(ProtoError::Decompress)?;

        let mut r = MessageReader::new(&body);
        let username = r.read_string()?;
        let token = r.read_token()?;

        let count = r.read_u32()? as usize;
        let mut files = Vec::with_capacity(count);
        for _ in 0..count {
            r.read_u8()?; // record code
            let filename = r.read_string()?;
            let size = r.read_u64()?;
            let extension = r.read_string()?;
            let attr_count = r.read_u32()? as usize;
            let mut attributes = Vec::with_capacity(attr_count);
            for _ in 0..attr_count {
                let kind = FileAttribute::from_wire(r.read_u32()?);
                attributes.push((kind, r.read_u32()?));
            }
            files.push(FileEntry {
                filename,
                size,
                extension,
                attributes,
            });
        }

        let slots_free = r.read_u8()? != 0;
        let avg_speed = r.read_u32()?;
        let queue_length = r.read_u32()?;

        Ok(PeerMessage::FileSearchResponse {
            username,
            token,
            files,
            slots_free,
            avg_speed,
            queue_length,
        })
    }
}
