//! The single connection to the central server.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use slsk_proto::{FrameCodec, ServerMessage, ServerRequest};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};

/// Fan-out capacity for decoded server messages.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One live connection to the server: a reader task decoding frames into
/// [`ServerMessage`] broadcasts, and a writer task draining a send queue.
///
/// A frame that fails to decode is logged and skipped: one malformed
/// message must not kill the session.
pub struct ServerConnection {
    tx: mpsc::UnboundedSender<ServerRequest>,
    events: broadcast::Sender<ServerMessage>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

impl ServerConnection {
    pub async fn connect(addr: impl ToSocketAddrs) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let events_tx = events.clone();
        let read_task = tokio::spawn(async move {
            let mut frames = FramedRead::new(read_half, FrameCodec::new());
            while let Some(frame) = frames.next().await {
                let payload = match frame {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("server connection read error: {e}");
                        break;
                    }
                };
                match ServerMessage::decode(&payload) {
                    Ok(Some(msg)) => {
                        trace!(?msg, "server message");
                        // No receivers is fine; pushes are droppable.
                        let _ = events_tx.send(msg);
                    }
                    Ok(None) => {}
                    Err(e) => warn!("dropping undecodable server frame: {e}"),
                }
            }
            debug!("server connection closed");
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<ServerRequest>();
        let write_task = tokio::spawn(async move {
            let mut sink = FramedWrite::new(write_half, FrameCodec::new());
            while let Some(req) = rx.recv().await {
                if let Err(e) = sink.send(req.encode()).await {
                    warn!("server connection write error: {e}");
                    break;
                }
            }
        });

        Ok(Self {
            tx,
            events,
            read_task,
            write_task,
        })
    }

    /// Queues a request for sending.
    pub fn send(&self, req: ServerRequest) -> Result<(), crate::SlskError> {
        self.tx
            .send(req)
            .map_err(|_| crate::SlskError::ConnectionClosed)
    }

    /// Subscribes to decoded server messages. Subscribe *before* sending a
    /// request whose answer you intend to wait for.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.events.subscribe()
    }

    /// Waits on an already-open subscription for the first message `f`
    /// accepts, bounded by `timeout`. The subscription is dropped either
    /// way, so no listener outlives its correlation window.
    pub async fn wait_on<T>(
        mut rx: broadcast::Receiver<ServerMessage>,
        what: &'static str,
        timeout: Duration,
        mut f: impl FnMut(ServerMessage) -> Option<T>,
    ) -> Result<T, crate::SlskError> {
        tokio::time::timeout(timeout, async {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        if let Some(value) = f(msg) {
                            return Ok(value);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("server event subscriber lagged by {n} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(crate::SlskError::ConnectionClosed);
                    }
                }
            }
        })
        .await
        .map_err(|_| crate::SlskError::Timeout { what })?
    }

    /// Forcibly tears the connection down. Idempotent.
    pub fn destroy(&self) {
        self.read_task.abort();
        self.write_task.abort();
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        self.destroy();
    }
}
