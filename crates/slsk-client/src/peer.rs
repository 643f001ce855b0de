//! Peer connections and the shared peer-message bus.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use slsk_proto::{FrameCodec, PeerInitMessage, PeerMessage};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use tokio_util::codec::{FramedRead, FramedWrite};

/// Distinguishes connection instances so a stale close notification cannot
/// evict a newer connection registered under the same username.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A peer message stamped with the username it came from, as republished on
/// the shared bus.
#[derive(Debug, Clone)]
pub struct PeerEnvelope {
    pub username: String,
    pub message: PeerMessage,
}

/// One outbound messaging connection to a peer.
///
/// Mirrors the server connection (reader task, writer task), but every
/// decoded message is republished on the shared peer bus stamped with this
/// connection's username, and the close of the socket is reported so the
/// owner can drop the table entry.
pub struct PeerConnection {
    pub username: String,
    pub addr: SocketAddr,
    pub(crate) id: u64,
    tx: mpsc::UnboundedSender<Bytes>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

impl PeerConnection {
    pub(crate) async fn connect(
        username: &str,
        addr: SocketAddr,
        bus: broadcast::Sender<PeerEnvelope>,
        closed_tx: mpsc::UnboundedSender<(String, u64)>,
    ) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

        let read_username = username.to_string();
        let read_task = tokio::spawn(async move {
            let mut frames = FramedRead::new(read_half, FrameCodec::new());
            while let Some(frame) = frames.next().await {
                let payload = match frame {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("peer {read_username} read error: {e}");
                        break;
                    }
                };
                match PeerMessage::decode(&payload) {
                    Ok(Some(message)) => {
                        trace!(username = %read_username, ?message, "peer message");
                        let _ = bus.send(PeerEnvelope {
                            username: read_username.clone(),
                            message,
                        });
                    }
                    Ok(None) => {}
                    Err(e) => warn!("dropping undecodable frame from {read_username}: {e}"),
                }
            }
            debug!("peer connection to {read_username} closed");
            let _ = closed_tx.send((read_username, id));
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let write_username = username.to_string();
        let write_task = tokio::spawn(async move {
            let mut sink = FramedWrite::new(write_half, FrameCodec::new());
            while let Some(payload) = rx.recv().await {
                if let Err(e) = sink.send(payload).await {
                    warn!("peer {write_username} write error: {e}");
                    break;
                }
            }
        });

        Ok(Self {
            username: username.to_string(),
            addr,
            id,
            tx,
            read_task,
            write_task,
        })
    }

    /// Queues a peer-catalog message for sending.
    pub fn send(&self, msg: &PeerMessage) -> Result<(), crate::SlskError> {
        self.tx
            .send(msg.encode())
            .map_err(|_| crate::SlskError::ConnectionClosed)
    }

    /// Queues a peer-init handshake frame. Only meaningful as the first
    /// thing sent on a fresh connection.
    pub fn send_init(&self, msg: &PeerInitMessage) -> Result<(), crate::SlskError> {
        self.tx
            .send(msg.encode())
            .map_err(|_| crate::SlskError::ConnectionClosed)
    }

    /// Forcibly tears the connection down. Idempotent.
    pub fn destroy(&self) {
        self.read_task.abort();
        self.write_task.abort();
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.destroy();
    }
}
