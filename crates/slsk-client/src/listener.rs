//! The local listener peers reach us on.
//!
//! Inbound sockets speak the peer-init catalog first: a `PierceFirewall`
//! completing a rendezvous we asked the server for, or a `PeerInit` from a
//! peer introducing itself. Each decoded handshake is published together
//! with the address it arrived from; the rendezvous path connects back to
//! that address.

use std::net::SocketAddr;

use futures_util::StreamExt;
use slsk_proto::{FrameCodec, PeerInitMessage};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

pub struct PeerListener {
    /// The port actually bound (relevant when asked for port 0).
    pub port: u16,
    events: broadcast::Sender<(PeerInitMessage, SocketAddr)>,
    accept_task: JoinHandle<()>,
}

impl PeerListener {
    pub async fn bind(port: u16) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let port = listener.local_addr()?.port();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let events_tx = events.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("listener accept error: {e}");
                        continue;
                    }
                };
                debug!("inbound peer connection from {addr}");
                let events_tx = events_tx.clone();
                tokio::spawn(async move {
                    let mut frames = FramedRead::new(stream, FrameCodec::new());
                    while let Some(frame) = frames.next().await {
                        let payload = match frame {
                            Ok(payload) => payload,
                            Err(e) => {
                                warn!("inbound connection from {addr}: {e}");
                                return;
                            }
                        };
                        match PeerInitMessage::decode(&payload) {
                            Ok(Some(msg)) => {
                                let _ = events_tx.send((msg, addr));
                            }
                            Ok(None) => {}
                            Err(e) => {
                                warn!("dropping undecodable peer-init frame from {addr}: {e}")
                            }
                        }
                    }
                });
            }
        });

        Ok(Self {
            port,
            events,
            accept_task,
        })
    }

    /// Subscribes to inbound peer-init handshakes.
    pub fn subscribe(&self) -> broadcast::Receiver<(PeerInitMessage, SocketAddr)> {
        self.events.subscribe()
    }

    /// Stops accepting. Idempotent.
    pub fn destroy(&self) {
        self.accept_task.abort();
    }
}

impl Drop for PeerListener {
    fn drop(&mut self) {
        self.destroy();
    }
}
