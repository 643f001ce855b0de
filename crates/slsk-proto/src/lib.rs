//! Soulseek wire format.
//!
//! Every connection in the network speaks length-prefixed binary frames:
//!
//! ```text
//! +-------------------+-----------------+
//! | Length (u32 LE)   | Payload bytes   |
//! +-------------------+-----------------+
//! ```
//!
//! The payload starts with an opcode (4 bytes LE on the server and peer
//! connections, a single byte on peer-init connections) followed by
//! message-specific fields. This crate holds the frame codec, the field
//! primitives, and the three message catalogs. It performs no I/O of its
//! own beyond implementing the `tokio_util::codec` traits.

pub mod peer;
pub mod peer_init;
pub mod server;
pub mod types;
pub mod wire;

pub use peer::PeerMessage;
pub use peer_init::PeerInitMessage;
pub use server::{ServerMessage, ServerRequest};
pub use types::{ConnectionType, FileAttribute, FileEntry, Token, TransferDirection, UserStatus};
pub use wire::{FrameCodec, MessageReader, MessageWriter, ProtoError};
