//! Download lifecycle: the per-transfer state machine, the driver that
//! feeds it peer messages, and the raw transfer-socket handler.
//!
//! A download moves `requested → queued → connected → downloading →
//! complete`. Each state carries everything the prior state carried plus
//! what its transition learned; nothing is ever erased. Transitions are
//! pure functions on the state value; all I/O lives in the driver and the
//! socket handler.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use slsk_proto::{PeerInitMessage, PeerMessage, Token, TransferDirection};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::Shared;
use crate::peer::PeerEnvelope;
use crate::SlskError;

/// Bounded capacity of the byte-chunk channel handed to the caller. A slow
/// consumer backpressures the transfer socket instead of growing memory.
const DATA_CHANNEL_CAPACITY: usize = 64;

/// Read size on the transfer socket.
const READ_CHUNK: usize = 64 * 1024;

/// OS receive buffer on the transfer socket (1 MB for throughput).
const TRANSFER_RECV_BUFFER: usize = 1024 * 1024;

/// Key of the live-download table: at most one entry per pair.
pub type DownloadKey = (String, String);

/// Where a download is in its life, plus everything learned so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadState {
    /// Queue-upload and place-in-queue requests sent. `received` starts at
    /// the caller's resume offset.
    Requested { received: u64 },
    /// The peer told us our rank in its upload queue.
    Queued { received: u64, place: u32 },
    /// The peer granted the transfer: we hold the token that will identify
    /// the transfer socket, and the total size. `place` stays `None` when
    /// the peer never answered the queue probe.
    Connected {
        received: u64,
        place: Option<u32>,
        token: Token,
        total: u64,
    },
    /// A transfer socket matched the token; bytes are flowing.
    Downloading {
        received: u64,
        place: Option<u32>,
        token: Token,
        total: u64,
    },
    /// All bytes accounted for.
    Complete {
        received: u64,
        place: Option<u32>,
        token: Token,
        total: u64,
    },
}

impl DownloadState {
    pub fn status(&self) -> &'static str {
        match self {
            DownloadState::Requested { .. } => "requested",
            DownloadState::Queued { .. } => "queued",
            DownloadState::Connected { .. } => "connected",
            DownloadState::Downloading { .. } => "downloading",
            DownloadState::Complete { .. } => "complete",
        }
    }

    /// Bytes received so far, the resume offset included.
    pub fn received(&self) -> u64 {
        match self {
            DownloadState::Requested { received }
            | DownloadState::Queued { received, .. }
            | DownloadState::Connected { received, .. }
            | DownloadState::Downloading { received, .. }
            | DownloadState::Complete { received, .. } => *received,
        }
    }

    /// The transfer token, once negotiated.
    pub fn token(&self) -> Option<Token> {
        match self {
            DownloadState::Requested { .. } | DownloadState::Queued { .. } => None,
            DownloadState::Connected { token, .. }
            | DownloadState::Downloading { token, .. }
            | DownloadState::Complete { token, .. } => Some(*token),
        }
    }

    /// Total expected bytes, once the peer reported them.
    pub fn total(&self) -> Option<u64> {
        match self {
            DownloadState::Requested { .. } | DownloadState::Queued { .. } => None,
            DownloadState::Connected { total, .. }
            | DownloadState::Downloading { total, .. }
            | DownloadState::Complete { total, .. } => Some(*total),
        }
    }

    /// Last reported queue position, if any.
    pub fn queue_place(&self) -> Option<u32> {
        match self {
            DownloadState::Requested { .. } => None,
            DownloadState::Queued { place, .. } => Some(*place),
            DownloadState::Connected { place, .. }
            | DownloadState::Downloading { place, .. }
            | DownloadState::Complete { place, .. } => *place,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, DownloadState::Complete { .. })
    }

    /// A place-in-queue response arrived. Before the transfer is granted
    /// this moves/keeps the download in `queued`; after `connected` it only
    /// refreshes the recorded position; once bytes flow it is stale news
    /// and ignored.
    #[must_use]
    pub fn on_queue_place(self, place: u32) -> DownloadState {
        match self {
            DownloadState::Requested { received } | DownloadState::Queued { received, .. } => {
                DownloadState::Queued { received, place }
            }
            DownloadState::Connected {
                received,
                token,
                total,
                ..
            } => DownloadState::Connected {
                received,
                place: Some(place),
                token,
                total,
            },
            other @ (DownloadState::Downloading { .. } | DownloadState::Complete { .. }) => other,
        }
    }

    /// The peer granted the transfer. Accepted from `requested` too,
    /// peers are not obliged to answer the queue probe first. Returns the
    /// next state and whether the event was accepted.
    #[must_use]
    pub fn on_transfer_granted(self, token: Token, total: u64) -> (DownloadState, bool) {
        match self {
            DownloadState::Requested { received } => (
                DownloadState::Connected {
                    received,
                    place: None,
                    token,
                    total,
                },
                true,
            ),
            DownloadState::Queued { received, place } => (
                DownloadState::Connected {
                    received,
                    place: Some(place),
                    token,
                    total,
                },
                true,
            ),
            other => (other, false),
        }
    }

    /// A transfer socket presented our token.
    #[must_use]
    pub fn on_socket_matched(self) -> (DownloadState, bool) {
        match self {
            DownloadState::Connected {
                received,
                place,
                token,
                total,
            } => (
                DownloadState::Downloading {
                    received,
                    place,
                    token,
                    total,
                },
                true,
            ),
            other => (other, false),
        }
    }

    /// `n` more bytes arrived on the transfer socket. Completes once
    /// received (resume offset included) covers the total.
    #[must_use]
    pub fn on_bytes(self, n: u64) -> DownloadState {
        match self {
            DownloadState::Downloading {
                received,
                place,
                token,
                total,
            } => {
                let received = received + n;
                if received >= total {
                    DownloadState::Complete {
                        received,
                        place,
                        token,
                        total,
                    }
                } else {
                    DownloadState::Downloading {
                        received,
                        place,
                        token,
                        total,
                    }
                }
            }
            other => other,
        }
    }
}

/// Progress notifications delivered on a download's event channel.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    /// The state machine advanced (or refreshed its queue position).
    Status(DownloadState),
    /// More bytes arrived.
    Progress { received: u64, total: u64 },
    /// All bytes delivered; the data channel is closed.
    Complete { received: u64 },
    /// Terminal failure; the data channel is closed and the download has
    /// left the live set, so a fresh `download()` call may retry.
    Failed { reason: String },
}

/// Caller's handle to one download.
///
/// `data` delivers file content in arrival order and closes on completion
/// or failure; where the bytes land is the caller's concern. `events`
/// reports lifecycle changes. Dropping the handle cancels the transfer.
pub struct Download {
    pub username: String,
    pub filename: String,
    pub events: mpsc::UnboundedReceiver<DownloadEvent>,
    pub data: mpsc::Receiver<Bytes>,
}

/// Table-side state of one download.
pub(crate) struct DownloadEntry {
    pub(crate) state: DownloadState,
    events: mpsc::UnboundedSender<DownloadEvent>,
    /// Taken by the transfer-socket handler when streaming starts.
    data: Option<mpsc::Sender<Bytes>>,
}

impl DownloadEntry {
    fn emit_status(&self) {
        let _ = self.events.send(DownloadEvent::Status(self.state.clone()));
    }
}

/// Registers a new download and returns the caller handle. Enforces the
/// one-live-download-per-(username, filename) invariant.
pub(crate) async fn create(
    shared: &Shared,
    username: &str,
    filename: &str,
    start_offset: u64,
) -> Result<Download, SlskError> {
    let key = (username.to_string(), filename.to_string());
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (data_tx, data_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);

    let mut downloads = shared.downloads.write().await;
    if downloads.contains_key(&key) {
        return Err(SlskError::DownloadInProgress {
            username: username.to_string(),
            filename: filename.to_string(),
        });
    }
    let entry = DownloadEntry {
        state: DownloadState::Requested {
            received: start_offset,
        },
        events: events_tx,
        data: Some(data_tx),
    };
    entry.emit_status();
    downloads.insert(key, entry);

    Ok(Download {
        username: username.to_string(),
        filename: filename.to_string(),
        events: events_rx,
        data: data_rx,
    })
}

/// Drops a download from the live set without any notification. Used when
/// the initial requests could not even be sent.
pub(crate) async fn discard(shared: &Shared, key: &DownloadKey) {
    shared.downloads.write().await.remove(key);
}

/// Fails a download: notifies the handle and removes the entry so a fresh
/// `download()` can retry. The handle keeps whatever state it last saw.
pub(crate) async fn fail(shared: &Shared, key: &DownloadKey, reason: String) {
    if let Some(entry) = shared.downloads.write().await.remove(key) {
        warn!(
            "download of {} from {} failed in state {}: {reason}",
            key.1,
            key.0,
            entry.state.status()
        );
        let _ = entry.events.send(DownloadEvent::Failed { reason });
    }
}

/// Fails the download if it has not started streaming within `timeout`.
pub(crate) fn spawn_handshake_watchdog(
    shared: Arc<Shared>,
    key: DownloadKey,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        let stalled = matches!(
            shared.downloads.read().await.get(&key).map(|e| &e.state),
            Some(
                DownloadState::Requested { .. }
                    | DownloadState::Queued { .. }
                    | DownloadState::Connected { .. }
            )
        );
        if stalled {
            fail(&shared, &key, "download handshake timed out".to_string()).await;
        }
    })
}

/// Consumes the shared peer bus and advances download state machines:
/// queue positions, transfer grants (replied to with an allowing transfer
/// response), and upload failures.
pub(crate) fn spawn_driver(shared: Arc<Shared>) -> JoinHandle<()> {
    let mut bus = shared.peer_messages.subscribe();
    tokio::spawn(async move {
        loop {
            match bus.recv().await {
                Ok(envelope) => handle_peer_message(&shared, envelope).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("download driver lagged by {n} peer messages");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn handle_peer_message(shared: &Shared, envelope: PeerEnvelope) {
    match envelope.message {
        PeerMessage::PlaceInQueueResponse { filename, place } => {
            let key = (envelope.username, filename);
            let mut downloads = shared.downloads.write().await;
            if let Some(entry) = downloads.get_mut(&key) {
                entry.state = entry.state.clone().on_queue_place(place);
                entry.emit_status();
            }
        }
        PeerMessage::TransferRequest {
            direction: TransferDirection::Upload,
            token,
            filename,
            size,
        } => {
            let key = (envelope.username.clone(), filename);
            let granted = {
                let mut downloads = shared.downloads.write().await;
                match downloads.get_mut(&key) {
                    Some(entry) => {
                        let (next, accepted) = entry
                            .state
                            .clone()
                            .on_transfer_granted(token, size.unwrap_or(0));
                        if accepted {
                            entry.state = next;
                            entry.emit_status();
                        }
                        accepted
                    }
                    None => false,
                }
            };
            if granted {
                info!(
                    "transfer of {} from {} granted, token {token}",
                    key.1, key.0
                );
                let peer = shared.peers.read().await.get(&envelope.username).cloned();
                match peer {
                    Some(peer) => {
                        let _ = peer.send(&PeerMessage::TransferResponse {
                            token,
                            allowed: true,
                            reason: None,
                        });
                    }
                    None => warn!(
                        "no live connection to {} to answer transfer request",
                        envelope.username
                    ),
                }
            }
        }
        PeerMessage::UploadFailed { filename } => {
            let key = (envelope.username, filename);
            fail(shared, &key, "peer reported the upload failed".to_string()).await;
        }
        _ => {}
    }
}

/// Handles one transfer socket, from the ConnectToPeer(F) push to the last
/// byte: dials the peer, pierces the firewall, reads the 4 raw token
/// bytes, matches them to a pending download, answers with the resume
/// offset, then streams chunks to the caller.
pub(crate) async fn run_transfer_socket(shared: Arc<Shared>, addr: SocketAddr, push_token: Token) {
    if let Err(e) = transfer_socket(&shared, addr, push_token).await {
        warn!("transfer socket {addr}: {e}");
    }
}

async fn transfer_socket(
    shared: &Shared,
    addr: SocketAddr,
    push_token: Token,
) -> Result<(), SlskError> {
    let mut stream = TcpStream::connect(addr).await?;
    let sock = socket2::SockRef::from(&stream);
    sock.set_nodelay(true)?;
    sock.set_recv_buffer_size(TRANSFER_RECV_BUFFER)?;

    // The pierce-firewall frame is the last framed message on this socket;
    // everything after it is raw transfer content.
    let payload = PeerInitMessage::PierceFirewall { token: push_token }.encode();
    stream
        .write_all(&(payload.len() as u32).to_le_bytes())
        .await?;
    stream.write_all(&payload).await?;

    // First 4 raw bytes identify the transfer.
    let mut token_bytes = [0u8; 4];
    stream.read_exact(&mut token_bytes).await?;
    let token = Token(token_bytes);

    let (key, offset, events, data) = {
        let mut downloads = shared.downloads.write().await;
        let matched = downloads
            .iter_mut()
            .find(|(_, entry)| entry.state.token() == Some(token));
        let Some((key, entry)) = matched else {
            warn!("transfer socket from {addr} carries unknown token {token}, closing");
            return Ok(());
        };
        let (next, accepted) = entry.state.clone().on_socket_matched();
        if !accepted {
            warn!(
                "transfer socket token {token} matches a download already {}, closing",
                entry.state.status()
            );
            return Ok(());
        }
        entry.state = next;
        entry.emit_status();
        let Some(data) = entry.data.take() else {
            // A second socket raced us for the same token.
            return Ok(());
        };
        (
            key.clone(),
            entry.state.received(),
            entry.events.clone(),
            data,
        )
    };

    // From the token match on, the entry is ours: any error, the offset
    // write included, must fail the download or it is stranded with its
    // data channel taken.
    let result = match stream.write_all(&offset.to_le_bytes()).await {
        Ok(()) => {
            debug!("transfer {token} started at offset {offset}");
            stream_bytes(shared, &mut stream, &key, &events, &data).await
        }
        Err(e) => Err(e.into()),
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            fail(shared, &key, format!("transfer failed: {e}")).await;
            Err(e)
        }
    }
}

async fn stream_bytes(
    shared: &Shared,
    stream: &mut TcpStream,
    key: &DownloadKey,
    events: &mpsc::UnboundedSender<DownloadEvent>,
    data: &mpsc::Sender<Bytes>,
) -> Result<(), SlskError> {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed the transfer socket early",
            )
            .into());
        }

        let state = {
            let mut downloads = shared.downloads.write().await;
            let Some(entry) = downloads.get_mut(key) else {
                // Failed or cancelled from elsewhere; stop quietly.
                return Ok(());
            };
            entry.state = entry.state.clone().on_bytes(n as u64);
            entry.state.clone()
        };

        // Forward outside the table lock: a slow consumer must stall the
        // socket, not the whole client.
        if data.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "download handle dropped",
            )
            .into());
        }
        let _ = events.send(DownloadEvent::Progress {
            received: state.received(),
            total: state.total().unwrap_or(0),
        });

        if state.is_complete() {
            shared.downloads.write().await.remove(key);
            let _ = events.send(DownloadEvent::Status(state.clone()));
            let _ = events.send(DownloadEvent::Complete {
                received: state.received(),
            });
            info!(
                "download of {} from {} complete ({} bytes)",
                key.1,
                key.0,
                state.received()
            );
            // Dropping the stream closes the socket from our side; dropping
            // `data` (caller side sees channel close) ends the byte stream.
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: Token = Token([0xde, 0xad, 0xbe, 0xef]);

    #[test]
    fn test_full_transition_sequence() {
        let state = DownloadState::Requested { received: 0 };
        assert_eq!(state.status(), "requested");

        let state = state.on_queue_place(3);
        assert_eq!(state.status(), "queued");
        assert_eq!(state.queue_place(), Some(3));

        let (state, accepted) = state.on_transfer_granted(TOKEN, 100);
        assert!(accepted);
        assert_eq!(state.status(), "connected");
        // earlier fields are retained
        assert_eq!(state.queue_place(), Some(3));
        assert_eq!(state.token(), Some(TOKEN));
        assert_eq!(state.total(), Some(100));

        let (state, matched) = state.on_socket_matched();
        assert!(matched);
        assert_eq!(state.status(), "downloading");

        let state = state.on_bytes(60);
        assert_eq!(state.status(), "downloading");
        assert_eq!(state.received(), 60);

        let state = state.on_bytes(40);
        assert!(state.is_complete());
        assert_eq!(state.received(), 100);
        assert_eq!(state.token(), Some(TOKEN));
        assert_eq!(state.queue_place(), Some(3));
    }

    #[test]
    fn test_queue_update_does_not_reset_token() {
        let (state, _) = DownloadState::Requested { received: 0 }.on_transfer_granted(TOKEN, 10);
        let state = state.on_queue_place(7);
        assert_eq!(state.status(), "connected");
        assert_eq!(state.token(), Some(TOKEN));
        assert_eq!(state.total(), Some(10));
        assert_eq!(state.queue_place(), Some(7));
    }

    #[test]
    fn test_queue_update_ignored_once_downloading() {
        let (state, _) = DownloadState::Requested { received: 0 }.on_transfer_granted(TOKEN, 10);
        let (state, _) = state.on_socket_matched();
        let after = state.clone().on_queue_place(99);
        assert_eq!(after, state);
    }

    #[test]
    fn test_transfer_grant_from_requested_has_no_place() {
        let (state, accepted) =
            DownloadState::Requested { received: 5 }.on_transfer_granted(TOKEN, 50);
        assert!(accepted);
        assert_eq!(state.queue_place(), None);
        assert_eq!(state.received(), 5);
    }

    #[test]
    fn test_transfer_grant_rejected_when_already_connected() {
        let (state, _) = DownloadState::Requested { received: 0 }.on_transfer_granted(TOKEN, 10);
        let other = Token([1, 2, 3, 4]);
        let (state, accepted) = state.on_transfer_granted(other, 20);
        assert!(!accepted);
        assert_eq!(state.token(), Some(TOKEN));
        assert_eq!(state.total(), Some(10));
    }

    #[test]
    fn test_socket_match_requires_connected() {
        let (state, matched) = DownloadState::Requested { received: 0 }.on_socket_matched();
        assert!(!matched);
        assert_eq!(state.status(), "requested");

        let (state, _) = state.on_transfer_granted(TOKEN, 10);
        let (state, _) = state.on_socket_matched();
        let (state, matched_again) = state.on_socket_matched();
        assert!(!matched_again);
        assert_eq!(state.status(), "downloading");
    }

    #[test]
    fn test_resume_offset_counts_toward_completion() {
        // Resuming at byte 70 of 100: 30 new bytes finish the download.
        let (state, _) = DownloadState::Requested { received: 70 }.on_transfer_granted(TOKEN, 100);
        let (state, _) = state.on_socket_matched();
        assert_eq!(state.received(), 70);

        let state = state.on_bytes(29);
        assert!(!state.is_complete());
        let state = state.on_bytes(1);
        assert!(state.is_complete());
        assert_eq!(state.received(), 100);
    }

    #[test]
    fn test_bytes_ignored_outside_downloading() {
        let state = DownloadState::Requested { received: 0 }.on_bytes(100);
        assert_eq!(state.received(), 0);
        assert_eq!(state.status(), "requested");
    }
}
