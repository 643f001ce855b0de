//! Shared protocol types.

use std::fmt;
use std::str::FromStr;

/// A 4-byte correlation token.
///
/// Tokens tie an asynchronous request to its eventual response: search
/// results, rendezvous handshakes, transfer sockets. They travel as 4 raw
/// bytes and are conventionally rendered as 8 hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub [u8; 4]);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for Token {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 4];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Token(bytes))
    }
}

/// Kind of peer connection being established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    /// Ordinary peer messaging ("P").
    PeerToPeer,
    /// A raw file-transfer socket ("F").
    FileTransfer,
    /// Distributed search overlay ("D").
    Distributed,
}

impl ConnectionType {
    /// The single-letter string the wire uses.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::PeerToPeer => "P",
            ConnectionType::FileTransfer => "F",
            ConnectionType::Distributed => "D",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "P" => Some(ConnectionType::PeerToPeer),
            "F" => Some(ConnectionType::FileTransfer),
            "D" => Some(ConnectionType::Distributed),
            _ => None,
        }
    }
}

/// Presence reported to and by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserStatus {
    Offline,
    Away,
    Online,
}

impl UserStatus {
    pub fn to_wire(self) -> u32 {
        match self {
            UserStatus::Offline => 0,
            UserStatus::Away => 1,
            UserStatus::Online => 2,
        }
    }

    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(UserStatus::Offline),
            1 => Some(UserStatus::Away),
            2 => Some(UserStatus::Online),
            _ => None,
        }
    }
}

/// Whether a transfer request describes the peer sending to us (upload,
/// from their point of view) or requesting from us (download).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Download,
    Upload,
}

impl TransferDirection {
    pub fn to_wire(self) -> u32 {
        match self {
            TransferDirection::Download => 0,
            TransferDirection::Upload => 1,
        }
    }

    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(TransferDirection::Download),
            1 => Some(TransferDirection::Upload),
            _ => None,
        }
    }
}

/// Metadata attribute kinds attached to shared files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileAttribute {
    Bitrate,
    Duration,
    Vbr,
    Encoder,
    SampleRate,
    BitDepth,
    /// Kinds this client does not know about yet.
    Other(u32),
}

impl FileAttribute {
    pub fn to_wire(self) -> u32 {
        match self {
            FileAttribute::Bitrate => 0,
            FileAttribute::Duration => 1,
            FileAttribute::Vbr => 2,
            FileAttribute::Encoder => 3,
            FileAttribute::SampleRate => 4,
            FileAttribute::BitDepth => 5,
            FileAttribute::Other(value) => value,
        }
    }

    pub fn from_wire(value: u32) -> Self {
        match value {
            0 => FileAttribute::Bitrate,
            1 => FileAttribute::Duration,
            2 => FileAttribute::Vbr,
            3 => FileAttribute::Encoder,
            4 => FileAttribute::SampleRate,
            5 => FileAttribute::BitDepth,
            other => FileAttribute::Other(other),
        }
    }
}

/// One file record inside a search response.
///
/// Sizes are 64-bit on the wire; shared libraries routinely exceed 4 GiB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub filename: String,
    pub size: u64,
    pub extension: String,
    pub attributes: Vec<(FileAttribute, u32)>,
}
