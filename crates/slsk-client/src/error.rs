use slsk_proto::ProtoError;

/// Client-level failures.
///
/// Decode problems on a live connection never show up here: the transport
/// drops the offending frame and keeps the connection. What does surface is
/// anything a pending operation was waiting on: timeouts, rejected logins,
/// dead connections, exhausted peer resolution.
#[derive(Debug, thiserror::Error)]
pub enum SlskError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("{what} timed out")]
    Timeout { what: &'static str },

    #[error("login failed: {reason}")]
    LoginFailed { reason: String },

    #[error("not logged in")]
    NotLoggedIn,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("could not reach peer {username}: both connection strategies failed")]
    PeerConnect { username: String },

    #[error("a download of {filename} from {username} is already in progress")]
    DownloadInProgress { username: String, filename: String },
}
