//! Server catalog: messages exchanged with the central server.
//!
//! Requests and responses share opcodes (login is 1 in both directions)
//! but carry different payloads, so each direction has its own type.
//! Opcodes are 4 bytes LE at the front of the frame payload.

use std::net::Ipv4Addr;

use bytes::Bytes;
use md5::{Digest, Md5};

use crate::types::{ConnectionType, Token, UserStatus};
use crate::wire::{MessageReader, MessageWriter, ProtoError};

/// Protocol version marker sent with login. Mandated by the network.
const LOGIN_VERSION: u32 = 160;

/// Build-revision marker sent with login. Mandated by the network.
const LOGIN_MINOR_VERSION: u32 = 17;

/// A request sent to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerRequest {
    /// Authenticate. The encoded form carries an MD5 hex digest of
    /// `username + password` alongside the credentials.
    Login { username: String, password: String },
    /// Advertise the port our peer listener is bound to.
    SetWaitPort { port: u32 },
    /// Ask for a user's current address.
    GetPeerAddress { username: String },
    /// Subscribe to a user's status changes.
    WatchUser { username: String },
    /// Ask for a user's current status.
    GetUserStatus { username: String },
    /// Ask for a user's speed and share statistics.
    GetUserStats { username: String },
    /// Ask for the public room directory.
    RoomList,
    /// Ask the server to have `username` connect to us (rendezvous).
    ConnectToPeer {
        token: Token,
        username: String,
        conn_type: ConnectionType,
    },
    /// Start a network-wide file search correlated by `token`.
    FileSearch { token: Token, query: String },
    /// Report our presence.
    SetStatus { status: UserStatus },
    /// Announce how much we share.
    SharedFoldersFiles { dirs: u32, files: u32 },
    /// Announce whether we still need a distributed-search parent.
    HaveNoParents { have_no_parents: bool },
    /// Ask a parent candidate to adopt us.
    SearchParent { host: Ipv4Addr },
    /// Tell the server our outbound connection to a peer failed, so the
    /// peer can fall back to connecting to us instead.
    CantConnectToPeer { token: Token, username: String },
}

impl ServerRequest {
    /// Encodes the frame payload (no length prefix).
    pub fn encode(&self) -> Bytes {
        let mut w = MessageWriter::new();
        match self {
            ServerRequest::Login { username, password } => {
                let mut hasher = Md5::new();
                hasher.update(username.as_bytes());
                hasher.update(password.as_bytes());
                let digest = hex::encode(hasher.finalize());
                w.write_u32(1)
                    .write_string(username)
                    .write_string(password)
                    .write_u32(LOGIN_VERSION)
                    .write_string(&digest)
                    .write_u32(LOGIN_MINOR_VERSION);
            }
            ServerRequest::SetWaitPort { port } => {
                w.write_u32(2).write_u32(*port);
            }
            ServerRequest::GetPeerAddress { username } => {
                w.write_u32(3).write_string(username);
            }
            ServerRequest::WatchUser { username } => {
                w.write_u32(5).write_string(username);
            }
            ServerRequest::GetUserStatus { username } => {
                w.write_u32(7).write_string(username);
            }
            ServerRequest::GetUserStats { username } => {
                w.write_u32(36).write_string(username);
            }
            ServerRequest::RoomList => {
                w.write_u32(64);
            }
            ServerRequest::ConnectToPeer {
                token,
                username,
                conn_type,
            } => {
                w.write_u32(18)
                    .write_token(*token)
                    .write_string(username)
                    .write_string(conn_type.as_str());
            }
            ServerRequest::FileSearch { token, query } => {
                w.write_u32(26).write_token(*token).write_string(query);
            }
            ServerRequest::SetStatus { status } => {
                w.write_u32(28).write_u32(status.to_wire());
            }
            ServerRequest::SharedFoldersFiles { dirs, files } => {
                w.write_u32(35).write_u32(*dirs).write_u32(*files);
            }
            ServerRequest::HaveNoParents { have_no_parents } => {
                w.write_u32(71).write_u32(u32::from(*have_no_parents));
            }
            ServerRequest::SearchParent { host } => {
                w.write_u32(73).write_ipv4(*host);
            }
            ServerRequest::CantConnectToPeer { token, username } => {
                w.write_u32(1001).write_token(*token).write_string(username);
            }
        }
        w.finish()
    }

    /// Decodes a frame payload. `Ok(None)` for unknown opcodes and for
    /// payloads too short to carry one.
    pub fn decode(payload: &[u8]) -> Result<Option<Self>, ProtoError> {
        if payload.len() < 4 {
            return Ok(None);
        }
        let mut r = MessageReader::new(payload);
        let code = r.read_u32()?;
        let msg = match code {
            1 => {
                let username = r.read_string()?;
                let password = r.read_string()?;
                r.read_u32()?; // version
                r.read_string()?; // digest
                r.read_u32()?; // minor version
                ServerRequest::Login { username, password }
            }
            2 => ServerRequest::SetWaitPort {
                port: r.read_u32()?,
            },
            3 => ServerRequest::GetPeerAddress {
                username: r.read_string()?,
            },
            5 => ServerRequest::WatchUser {
                username: r.read_string()?,
            },
            7 => ServerRequest::GetUserStatus {
                username: r.read_string()?,
            },
            36 => ServerRequest::GetUserStats {
                username: r.read_string()?,
            },
            64 => ServerRequest::RoomList,
            18 => {
                let token = r.read_token()?;
                let username = r.read_string()?;
                let conn_type = ConnectionType::from_wire(&r.read_string()?)
                    .ok_or(ProtoError::InvalidField("connection type"))?;
                ServerRequest::ConnectToPeer {
                    token,
                    username,
                    conn_type,
                }
            }
            26 => ServerRequest::FileSearch {
                token: r.read_token()?,
                query: r.read_string()?,
            },
            28 => ServerRequest::SetStatus {
                status: UserStatus::from_wire(r.read_u32()?)
                    .ok_or(ProtoError::InvalidField("status"))?,
            },
            35 => ServerRequest::SharedFoldersFiles {
                dirs: r.read_u32()?,
                files: r.read_u32()?,
            },
            71 => ServerRequest::HaveNoParents {
                have_no_parents: r.read_u32()? != 0,
            },
            73 => ServerRequest::SearchParent {
                host: r.read_ipv4()?,
            },
            1001 => ServerRequest::CantConnectToPeer {
                token: r.read_token()?,
                username: r.read_string()?,
            },
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }
}

/// A message pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Login accepted, with the server's greeting.
    LoginOk { greet: String },
    /// Login rejected, with the server's reason.
    LoginFailed { reason: String },
    /// Answer to a `GetPeerAddress` request.
    PeerAddress {
        username: String,
        host: Ipv4Addr,
        port: u16,
    },
    /// A watched user's status changed (or a status query answered).
    UserStatus { username: String, status: u32 },
    /// A peer wants a connection with us, or is answering our rendezvous
    /// request; `conn_type` distinguishes messaging from transfer sockets.
    ConnectToPeer {
        username: String,
        conn_type: ConnectionType,
        host: Ipv4Addr,
        port: u16,
        token: Token,
    },
    /// Answer to a user-stats query.
    UserStats {
        username: String,
        avg_speed: u32,
        upload_num: u32,
        files: u32,
        dirs: u32,
    },
    /// The public room directory.
    RoomList { rooms: Vec<(String, u32)> },
    /// Candidates for a distributed-search parent.
    PossibleParents { parents: Vec<ParentCandidate> },
}

/// One entry of a `PossibleParents` push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentCandidate {
    pub username: String,
    pub host: Ipv4Addr,
    pub port: u16,
}

impl ServerMessage {
    /// Encodes the frame payload (no length prefix). Used by tests that
    /// script a server.
    pub fn encode(&self) -> Bytes {
        let mut w = MessageWriter::new();
        match self {
            ServerMessage::LoginOk { greet } => {
                w.write_u32(1).write_u8(1).write_string(greet);
            }
            ServerMessage::LoginFailed { reason } => {
                w.write_u32(1).write_u8(0).write_string(reason);
            }
            ServerMessage::PeerAddress {
                username,
                host,
                port,
            } => {
                w.write_u32(3)
                    .write_string(username)
                    .write_ipv4(*host)
                    .write_u32(u32::from(*port));
            }
            ServerMessage::UserStatus { username, status } => {
                w.write_u32(7).write_string(username).write_u32(*status);
            }
            ServerMessage::ConnectToPeer {
                username,
                conn_type,
                host,
                port,
                token,
            } => {
                w.write_u32(18)
                    .write_string(username)
                    .write_string(conn_type.as_str())
                    .write_ipv4(*host)
                    .write_u32(u32::from(*port))
                    .write_token(*token);
            }
            ServerMessage::UserStats {
                username,
                avg_speed,
                upload_num,
                files,
                dirs,
            } => {
                w.write_u32(36)
                    .write_string(username)
                    .write_u32(*avg_speed)
                    .write_u32(*upload_num)
                    .write_u32(0) // unused middle field
                    .write_u32(*files)
                    .write_u32(*dirs);
            }
            ServerMessage::RoomList { rooms } => {
                w.write_u32(64).write_u32(rooms.len() as u32);
                for (name, _) in rooms {
                    w.write_string(name);
                }
                w.write_u32(rooms.len() as u32);
                for (_, users) in rooms {
                    w.write_u32(*users);
                }
            }
            ServerMessage::PossibleParents { parents } => {
                w.write_u32(102).write_u32(parents.len() as u32);
                for parent in parents {
                    w.write_string(&parent.username)
                        .write_ipv4(parent.host)
                        .write_u32(u32::from(parent.port));
                }
            }
        }
        w.finish()
    }

    /// Decodes a frame payload. `Ok(None)` for unknown opcodes and for
    /// payloads too short to carry one.
    pub fn decode(payload: &[u8]) -> Result<Option<Self>, ProtoError> {
        if payload.len() < 4 {
            return Ok(None);
        }
        let mut r = MessageReader::new(payload);
        let code = r.read_u32()?;
        let msg = match code {
            1 => {
                if r.read_u8()? == 1 {
                    ServerMessage::LoginOk {
                        greet: r.read_string()?,
                    }
                } else {
                    ServerMessage::LoginFailed {
                        reason: r.read_string()?,
                    }
                }
            }
            3 => ServerMessage::PeerAddress {
                username: r.read_string()?,
                host: r.read_ipv4()?,
                port: r.read_u32()? as u16,
            },
            7 => ServerMessage::UserStatus {
                username: r.read_string()?,
                status: r.read_u32()?,
            },
            18 => {
                let username = r.read_string()?;
                let conn_type = ConnectionType::from_wire(&r.read_string()?)
                    .ok_or(ProtoError::InvalidField("connection type"))?;
                ServerMessage::ConnectToPeer {
                    username,
                    conn_type,
                    host: r.read_ipv4()?,
                    port: r.read_u32()? as u16,
                    token: r.read_token()?,
                }
            }
            36 => {
                let username = r.read_string()?;
                let avg_speed = r.read_u32()?;
                let upload_num = r.read_u32()?;
                r.read_u32()?; // unused middle field
                ServerMessage::UserStats {
                    username,
                    avg_speed,
                    upload_num,
                    files: r.read_u32()?,
                    dirs: r.read_u32()?,
                }
            }
            64 => {
                let count = r.read_u32()? as usize;
                let mut names = Vec::with_capacity(count);
                for _ in 0..count {
                    names.push(r.read_string()?);
                }
                let user_count = r.read_u32()? as usize;
                let mut rooms = Vec::with_capacity(count);
                for (i, name) in names.into_iter().enumerate() {
                    let users = if i < user_count { r.read_u32()? } else { 0 };
                    rooms.push((name, users));
                }
                ServerMessage::RoomList { rooms }
            }
            102 => {
                let count = r.read_u32()? as usize;
                let mut parents = Vec::with_capacity(count);
                for _ in 0..count {
                    parents.push(ParentCandidate {
                        username: r.read_string()?,
                        host: r.read_ipv4()?,
                        port: r.read_u32()? as u16,
                    });
                }
                ServerMessage::PossibleParents { parents }
            }
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }
}
