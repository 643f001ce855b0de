//! Distributed search: one token per query, replies collected from the
//! peer bus inside a fixed window.

use std::time::Duration;

use slsk_proto::{FileEntry, PeerMessage, Token};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::peer::PeerEnvelope;

/// One peer's answer to a search.
#[derive(Debug, Clone)]
pub struct SearchReply {
    /// Peer that holds the files. Taken from the reply body, not the
    /// connection it arrived on.
    pub username: String,
    pub files: Vec<FileEntry>,
    pub slots_free: bool,
    pub avg_speed: u32,
    pub queue_length: u32,
}

/// Forwards replies carrying `token` from the peer bus into the returned
/// channel until `window` elapses, then drops the subscription. Replies
/// arriving after the window (or after the receiver is dropped) are never
/// observed.
pub(crate) fn spawn_aggregator(
    mut bus: broadcast::Receiver<PeerEnvelope>,
    token: Token,
    window: Duration,
) -> (mpsc::UnboundedReceiver<SearchReply>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                received = bus.recv() => match received {
                    Ok(envelope) => {
                        let PeerMessage::FileSearchResponse {
                            username,
                            token: reply_token,
                            files,
                            slots_free,
                            avg_speed,
                            queue_length,
                        } = envelope.message
                        else {
                            continue;
                        };
                        if reply_token != token {
                            continue;
                        }
                        debug!("search {token}: {} files from {username}", files.len());
                        let reply = SearchReply {
                            username,
                            files,
                            slots_free,
                            avg_speed,
                            queue_length,
                        };
                        if tx.send(reply).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("search {token} lagged by {n} peer messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
    (rx, task)
}
