//! The session coordinator: owns the server connection, the peer
//! listener, the peer/download tables, and the background tasks that wire
//! them together.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use slsk_proto::{
    ConnectionType, PeerInitMessage, PeerMessage, ServerMessage, ServerRequest, Token, UserStatus,
};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::download::{self, Download, DownloadEntry, DownloadKey};
use crate::listener::PeerListener;
use crate::peer::{PeerConnection, PeerEnvelope};
use crate::resolver;
use crate::search::{self, SearchReply};
use crate::server::ServerConnection;
use crate::token::{RandomTokens, TokenSource};
use crate::SlskError;

const DEFAULT_SERVER_ADDR: &str = "server.slsknet.org:2242";
const DEFAULT_LISTEN_PORT: u16 = 2234;

const LOGIN_TIMEOUT: Duration = Duration::from_secs(10);
const PEER_ADDRESS_TIMEOUT: Duration = Duration::from_secs(10);
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);
const SERVER_REPLY_TIMEOUT: Duration = Duration::from_secs(10);
const SEARCH_WINDOW: Duration = Duration::from_secs(10);
const DOWNLOAD_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Capacity of the peer-message fan-out bus.
const PEER_BUS_CAPACITY: usize = 512;

/// Connection parameters for [`SlskClient::connect`].
pub struct ClientConfig {
    /// Server to log into.
    pub server_addr: String,
    /// Port for the inbound peer listener. `0` picks an ephemeral port.
    pub listen_port: u16,
    /// Token generator. Defaults to random tokens; tests inject a
    /// deterministic source.
    pub token_source: Option<Arc<dyn TokenSource>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: DEFAULT_SERVER_ADDR.to_string(),
            listen_port: DEFAULT_LISTEN_PORT,
            token_source: None,
        }
    }
}

/// State shared between the client handle and its background tasks.
pub(crate) struct Shared {
    pub(crate) server: ServerConnection,
    pub(crate) listener: PeerListener,
    /// Live messaging connections, one per username.
    pub(crate) peers: RwLock<HashMap<String, Arc<PeerConnection>>>,
    /// Per-username gates serializing concurrent resolutions.
    pub(crate) resolving: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Live downloads, at most one per (username, filename).
    pub(crate) downloads: RwLock<HashMap<DownloadKey, DownloadEntry>>,
    /// Fan-out of every decoded peer message, stamped with its sender.
    pub(crate) peer_messages: broadcast::Sender<PeerEnvelope>,
    /// Peer connections report (username, connection id) here on close.
    pub(crate) peer_closed: mpsc::UnboundedSender<(String, u64)>,
    pub(crate) tokens: Arc<dyn TokenSource>,
    /// Set after a successful login; peer-init introductions need it.
    pub(crate) username: RwLock<Option<String>>,
}

/// A Soulseek session.
///
/// Holds one connection to the server plus a table of peer connections
/// opened on demand. All I/O runs on background tasks; the handle's
/// methods send requests and await correlated replies.
pub struct SlskClient {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl SlskClient {
    /// Connects to the server and binds the peer listener. No login is
    /// performed yet.
    pub async fn connect(config: ClientConfig) -> Result<Self, SlskError> {
        let server = ServerConnection::connect(config.server_addr.as_str()).await?;
        let listener = PeerListener::bind(config.listen_port).await?;
        info!(
            "connected to {}, listening for peers on port {}",
            config.server_addr, listener.port
        );

        let (peer_messages, _) = broadcast::channel(PEER_BUS_CAPACITY);
        let (peer_closed_tx, peer_closed_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            server,
            listener,
            peers: RwLock::new(HashMap::new()),
            resolving: Mutex::new(HashMap::new()),
            downloads: RwLock::new(HashMap::new()),
            peer_messages,
            peer_closed: peer_closed_tx,
            tokens: config
                .token_source
                .unwrap_or_else(|| Arc::new(RandomTokens)),
            username: RwLock::new(None),
        });

        let tasks = vec![
            tokio::spawn(run_server_events(shared.clone())),
            tokio::spawn(run_listener_events(shared.clone())),
            download::spawn_driver(shared.clone()),
            tokio::spawn(run_peer_reaper(shared.clone(), peer_closed_rx)),
        ];

        Ok(Self { shared, tasks })
    }

    /// Port the peer listener actually bound.
    pub fn listen_port(&self) -> u16 {
        self.shared.listener.port
    }

    /// Logs into the server. On success the post-login handshake (share
    /// counts, parent opt-out, online status, wait port) runs in the
    /// background.
    pub async fn login(&self, username: &str, password: &str) -> Result<(), SlskError> {
        let rx = self.shared.server.subscribe();
        self.shared.server.send(ServerRequest::Login {
            username: username.to_string(),
            password: password.to_string(),
        })?;
        let outcome = ServerConnection::wait_on(rx, "login", LOGIN_TIMEOUT, |msg| match msg {
            ServerMessage::LoginOk { greet } => Some(Ok(greet)),
            ServerMessage::LoginFailed { reason } => Some(Err(reason)),
            _ => None,
        })
        .await?;

        match outcome {
            Ok(greet) => {
                info!("logged in as {username}: {greet}");
                *self.shared.username.write().await = Some(username.to_string());
                self.shared.server.send(ServerRequest::SetWaitPort {
                    port: u32::from(self.shared.listener.port),
                })?;
                Ok(())
            }
            Err(reason) => Err(SlskError::LoginFailed { reason }),
        }
    }

    /// Looks up a user's current address at the server.
    pub async fn get_peer_address(&self, username: &str) -> Result<SocketAddr, SlskError> {
        lookup_peer_address(&self.shared, username).await
    }

    /// Returns a live messaging connection to `username`, reusing an
    /// existing one or racing both connection strategies.
    pub async fn peer_by_username(
        &self,
        username: &str,
    ) -> Result<Arc<PeerConnection>, SlskError> {
        resolver::resolve(&self.shared, username, RESOLVE_TIMEOUT).await
    }

    /// Searches the network and collects every reply received within the
    /// default window.
    pub async fn search(&self, query: &str) -> Result<Vec<SearchReply>, SlskError> {
        self.search_within(query, SEARCH_WINDOW).await
    }

    /// Searches with an explicit collection window.
    pub async fn search_within(
        &self,
        query: &str,
        window: Duration,
    ) -> Result<Vec<SearchReply>, SlskError> {
        let (_token, mut rx) = self.search_stream(query, window)?;
        let mut replies = Vec::new();
        while let Some(reply) = rx.recv().await {
            replies.push(reply);
        }
        Ok(replies)
    }

    /// Streaming form of [`search`](Self::search): replies are delivered
    /// as they arrive and the channel closes when the window elapses.
    pub fn search_stream(
        &self,
        query: &str,
        window: Duration,
    ) -> Result<(Token, mpsc::UnboundedReceiver<SearchReply>), SlskError> {
        let token = self.shared.tokens.next_token();
        // Subscribe before the request goes out so no reply can slip by.
        let bus = self.shared.peer_messages.subscribe();
        self.shared.server.send(ServerRequest::FileSearch {
            token,
            query: query.to_string(),
        })?;
        debug!("search {token}: {query:?}");
        let (rx, _task) = search::spawn_aggregator(bus, token, window);
        Ok((token, rx))
    }

    /// Starts downloading `filename` from `username` from the beginning.
    pub async fn download(&self, username: &str, filename: &str) -> Result<Download, SlskError> {
        self.download_from(username, filename, 0).await
    }

    /// Starts downloading from `start_offset`, for resuming a partial
    /// file. The offset counts toward completion; the caller receives only
    /// the bytes from `start_offset` on.
    pub async fn download_from(
        &self,
        username: &str,
        filename: &str,
        start_offset: u64,
    ) -> Result<Download, SlskError> {
        let peer = resolver::resolve(&self.shared, username, RESOLVE_TIMEOUT).await?;
        let handle = download::create(&self.shared, username, filename, start_offset).await?;
        let key = (username.to_string(), filename.to_string());

        let requests = peer
            .send(&PeerMessage::QueueUpload {
                filename: filename.to_string(),
            })
            .and_then(|_| {
                peer.send(&PeerMessage::PlaceInQueueRequest {
                    filename: filename.to_string(),
                })
            });
        if let Err(e) = requests {
            download::discard(&self.shared, &key).await;
            return Err(e);
        }

        download::spawn_handshake_watchdog(self.shared.clone(), key, DOWNLOAD_HANDSHAKE_TIMEOUT);
        Ok(handle)
    }

    /// Subscribes to a user's status changes.
    pub fn watch_user(&self, username: &str) -> Result<(), SlskError> {
        self.shared.server.send(ServerRequest::WatchUser {
            username: username.to_string(),
        })
    }

    /// Asks for a user's current status.
    pub async fn get_user_status(&self, username: &str) -> Result<UserStatus, SlskError> {
        let rx = self.shared.server.subscribe();
        self.shared.server.send(ServerRequest::GetUserStatus {
            username: username.to_string(),
        })?;
        let wanted = username.to_string();
        ServerConnection::wait_on(rx, "user status", SERVER_REPLY_TIMEOUT, move |msg| {
            match msg {
                ServerMessage::UserStatus { username, status } if username == wanted => {
                    Some(UserStatus::from_wire(status).unwrap_or(UserStatus::Offline))
                }
                _ => None,
            }
        })
        .await
    }

    /// Asks for a user's speed and share statistics.
    pub async fn get_user_stats(
        &self,
        username: &str,
    ) -> Result<(u32, u32, u32, u32), SlskError> {
        let rx = self.shared.server.subscribe();
        self.shared.server.send(ServerRequest::GetUserStats {
            username: username.to_string(),
        })?;
        let wanted = username.to_string();
        ServerConnection::wait_on(rx, "user stats", SERVER_REPLY_TIMEOUT, move |msg| match msg {
            ServerMessage::UserStats {
                username,
                avg_speed,
                upload_num,
                files,
                dirs,
            } if username == wanted => Some((avg_speed, upload_num, files, dirs)),
            _ => None,
        })
        .await
    }

    /// Fetches the public room directory with user counts.
    pub async fn room_list(&self) -> Result<Vec<(String, u32)>, SlskError> {
        let rx = self.shared.server.subscribe();
        self.shared.server.send(ServerRequest::RoomList)?;
        ServerConnection::wait_on(rx, "room list", SERVER_REPLY_TIMEOUT, |msg| match msg {
            ServerMessage::RoomList { rooms } => Some(rooms),
            _ => None,
        })
        .await
    }

    /// Raw subscription to decoded server messages.
    pub fn server_messages(&self) -> broadcast::Receiver<ServerMessage> {
        self.shared.server.subscribe()
    }

    /// Tears the whole session down: background tasks, server connection,
    /// listener, and every peer connection.
    pub async fn close(&self) {
        for task in &self.tasks {
            task.abort();
        }
        self.shared.server.destroy();
        self.shared.listener.destroy();
        for peer in self.shared.peers.write().await.drain() {
            peer.1.destroy();
        }
        self.shared.downloads.write().await.clear();
    }
}

impl Drop for SlskClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.shared.server.destroy();
        self.shared.listener.destroy();
    }
}

/// Correlated peer-address lookup, shared by the client API, the resolver
/// and the listener handler.
pub(crate) async fn lookup_peer_address(
    shared: &Shared,
    username: &str,
) -> Result<SocketAddr, SlskError> {
    let rx = shared.server.subscribe();
    shared.server.send(ServerRequest::GetPeerAddress {
        username: username.to_string(),
    })?;
    let wanted = username.to_string();
    let (host, port) = ServerConnection::wait_on(
        rx,
        "peer address",
        PEER_ADDRESS_TIMEOUT,
        move |msg| match msg {
            ServerMessage::PeerAddress {
                username,
                host,
                port,
            } if username == wanted => Some((host, port)),
            _ => None,
        },
    )
    .await?;
    Ok(SocketAddr::from((host, port)))
}

/// Reacts to server pushes: finishes the login handshake, adopts search
/// parents, and answers ConnectToPeer pushes per connection type.
async fn run_server_events(shared: Arc<Shared>) {
    let mut rx = shared.server.subscribe();
    loop {
        match rx.recv().await {
            Ok(msg) => handle_server_message(&shared, msg).await,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("server event loop lagged by {n} messages");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("server event loop stopped");
}

async fn handle_server_message(shared: &Arc<Shared>, msg: ServerMessage) {
    match msg {
        ServerMessage::LoginOk { .. } => {
            // Post-login handshake: advertise a minimal share, opt out of
            // the distributed-search tree for now, go online.
            let _ = shared
                .server
                .send(ServerRequest::SharedFoldersFiles { dirs: 1, files: 1 });
            let _ = shared.server.send(ServerRequest::HaveNoParents {
                have_no_parents: true,
            });
            let _ = shared.server.send(ServerRequest::SetStatus {
                status: UserStatus::Online,
            });
        }
        ServerMessage::PossibleParents { parents } => {
            for parent in parents {
                debug!("adopting search parent candidate {}", parent.username);
                let _ = shared
                    .server
                    .send(ServerRequest::SearchParent { host: parent.host });
            }
        }
        ServerMessage::ConnectToPeer {
            username,
            conn_type: ConnectionType::PeerToPeer,
            host,
            port,
            token,
        } => {
            if shared.peers.read().await.contains_key(&username) {
                return;
            }
            let shared = shared.clone();
            tokio::spawn(async move {
                connect_pushed_peer(shared, username, SocketAddr::from((host, port)), token).await;
            });
        }
        ServerMessage::ConnectToPeer {
            conn_type: ConnectionType::FileTransfer,
            host,
            port,
            token,
            ..
        } => {
            let shared = shared.clone();
            tokio::spawn(download::run_transfer_socket(
                shared,
                SocketAddr::from((host, port)),
                token,
            ));
        }
        ServerMessage::ConnectToPeer {
            username,
            conn_type: ConnectionType::Distributed,
            ..
        } => {
            debug!("ignoring distributed connect request from {username}");
        }
        _ => {}
    }
}

/// Outbound half of a peer-initiated rendezvous: the peer could not reach
/// our listener, so we dial them and pierce with their token. If we cannot
/// reach them either, the server is told so the peer can give up.
async fn connect_pushed_peer(shared: Arc<Shared>, username: String, addr: SocketAddr, token: Token) {
    match PeerConnection::connect(
        &username,
        addr,
        shared.peer_messages.clone(),
        shared.peer_closed.clone(),
    )
    .await
    {
        Ok(peer) => {
            let _ = peer.send_init(&PeerInitMessage::PierceFirewall { token });
            shared
                .peers
                .write()
                .await
                .insert(username, Arc::new(peer));
        }
        Err(e) => {
            debug!("could not dial pushed peer {username} at {addr}: {e}");
            let _ = shared
                .server
                .send(ServerRequest::CantConnectToPeer { token, username });
        }
    }
}

/// Reacts to inbound peer-init handshakes on the listener: the remote
/// introduced itself, so we look its address up and open our own outbound
/// messaging connection to it.
async fn run_listener_events(shared: Arc<Shared>) {
    let mut rx = shared.listener.subscribe();
    loop {
        let (msg, addr) = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("listener event loop lagged by {n} messages");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let PeerInitMessage::PeerInit { username, .. } = msg else {
            // Pierce-firewalls are consumed by in-flight resolutions.
            continue;
        };
        debug!("peer-init from {username} at {addr}");
        if shared.peers.read().await.contains_key(&username) {
            continue;
        }
        let shared = shared.clone();
        tokio::spawn(async move {
            let addr = match lookup_peer_address(&shared, &username).await {
                Ok(addr) => addr,
                Err(e) => {
                    debug!("address lookup for inbound peer {username} failed: {e}");
                    return;
                }
            };
            match PeerConnection::connect(
                &username,
                addr,
                shared.peer_messages.clone(),
                shared.peer_closed.clone(),
            )
            .await
            {
                Ok(peer) => {
                    shared
                        .peers
                        .write()
                        .await
                        .entry(username)
                        .or_insert_with(|| Arc::new(peer));
                }
                Err(e) => debug!("could not dial inbound peer {username} back: {e}"),
            }
        });
    }
    debug!("listener event loop stopped");
}

/// Drops closed peer connections from the table. The connection id guards
/// against a stale close notification evicting a fresh replacement that
/// reused the username.
async fn run_peer_reaper(shared: Arc<Shared>, mut closed: mpsc::UnboundedReceiver<(String, u64)>) {
    while let Some((username, id)) = closed.recv().await {
        let mut peers = shared.peers.write().await;
        if peers.get(&username).is_some_and(|peer| peer.id == id) {
            peers.remove(&username);
            debug!("dropped closed peer connection to {username}");
        }
    }
}
