//! Peer resolution: turn a username into a live message connection.
//!
//! Two strategies run concurrently and the first to produce a connection
//! wins. The rendezvous strategy asks the server to push the peer toward
//! our listener and watches for the matching pierce-firewall; the direct
//! strategy looks up the peer's address and dials it ourselves. Either
//! side being firewalled defeats one strategy but not both.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::select_ok;
use slsk_proto::{ConnectionType, PeerInitMessage, ServerRequest, Token};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::client::{lookup_peer_address, Shared};
use crate::peer::PeerConnection;
use crate::SlskError;

type Resolved = Result<Arc<PeerConnection>, SlskError>;
type Strategy<'a> = Pin<Box<dyn Future<Output = Resolved> + Send + 'a>>;

/// Returns a live connection to `username`, reusing one from the peer
/// table when present, otherwise racing both connection strategies.
/// Concurrent calls for the same username are serialized so losers of the
/// race reuse the winner's connection instead of dialing again.
pub(crate) async fn resolve(
    shared: &Arc<Shared>,
    username: &str,
    timeout: Duration,
) -> Resolved {
    if let Some(peer) = shared.peers.read().await.get(username) {
        return Ok(peer.clone());
    }

    let gate = {
        let mut resolving = shared.resolving.lock().await;
        resolving
            .entry(username.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    };
    let _guard = gate.lock().await;

    // A concurrent resolution may have finished while we waited.
    if let Some(peer) = shared.peers.read().await.get(username) {
        shared.resolving.lock().await.remove(username);
        return Ok(peer.clone());
    }

    let token = shared.tokens.next_token();
    let strategies: Vec<Strategy<'_>> = vec![
        Box::pin(by_rendezvous(shared, username, token)),
        Box::pin(by_direct_dial(shared, username, token)),
    ];
    let raced = tokio::time::timeout(timeout, select_ok(strategies)).await;

    let resolved = match raced {
        Ok(Ok((peer, _remaining))) => {
            shared
                .peers
                .write()
                .await
                .insert(username.to_string(), peer.clone());
            debug!("resolved {username} via {}", peer.addr);
            Ok(peer)
        }
        Ok(Err(e)) => {
            debug!("both connection strategies to {username} failed: {e}");
            Err(SlskError::PeerConnect {
                username: username.to_string(),
            })
        }
        Err(_) => Err(SlskError::Timeout {
            what: "peer resolution",
        }),
    };

    // Dismantle the gate only once the winner is in the table, so a caller
    // arriving now either waits on this gate or hits the table entry.
    shared.resolving.lock().await.remove(username);
    resolved
}

/// Ask the server to push the peer toward our listener, wait for the
/// pierce-firewall carrying our token, then dial the address it came from.
async fn by_rendezvous(shared: &Arc<Shared>, username: &str, token: Token) -> Resolved {
    let mut inbound = shared.listener.subscribe();
    shared.server.send(ServerRequest::ConnectToPeer {
        token,
        username: username.to_string(),
        conn_type: ConnectionType::PeerToPeer,
    })?;

    let addr: SocketAddr = loop {
        match inbound.recv().await {
            Ok((PeerInitMessage::PierceFirewall { token: t }, addr)) if t == token => break addr,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("rendezvous with {username} lagged by {n} inbound messages");
            }
            Err(broadcast::error::RecvError::Closed) => return Err(SlskError::ConnectionClosed),
        }
    };

    let peer = PeerConnection::connect(
        username,
        addr,
        shared.peer_messages.clone(),
        shared.peer_closed.clone(),
    )
    .await?;
    Ok(Arc::new(peer))
}

/// Look the peer's address up at the server and dial it directly,
/// introducing ourselves with a peer-init.
async fn by_direct_dial(shared: &Arc<Shared>, username: &str, token: Token) -> Resolved {
    let own_username = shared
        .username
        .read()
        .await
        .clone()
        .ok_or(SlskError::NotLoggedIn)?;

    let addr = lookup_peer_address(shared, username).await?;
    let peer = PeerConnection::connect(
        username,
        addr,
        shared.peer_messages.clone(),
        shared.peer_closed.clone(),
    )
    .await?;
    peer.send_init(&PeerInitMessage::PeerInit {
        username: own_username,
        conn_type: ConnectionType::PeerToPeer,
        token,
    })?;
    Ok(Arc::new(peer))
}
