//! End-to-end session tests against a scripted server and scripted peers
//! on localhost, speaking the real wire format through the proto crate.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use slsk_proto::{
    ConnectionType, FileAttribute, FileEntry, FrameCodec, PeerInitMessage, PeerMessage,
    ServerMessage, ServerRequest, Token, TransferDirection, UserStatus,
};
use slsk_client::{ClientConfig, DownloadEvent, SlskClient, SlskError, TokenSource};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Deterministic tokens for scripted exchanges.
struct SeqTokens(AtomicU32);

impl TokenSource for SeqTokens {
    fn next_token(&self) -> Token {
        Token(self.0.fetch_add(1, Ordering::Relaxed).to_le_bytes())
    }
}

/// A scripted server: answers logins and address lookups on its own,
/// reports every decoded request, and pushes whatever the test asks.
struct FakeServer {
    addr: SocketAddr,
    peer_addrs: Arc<Mutex<HashMap<String, SocketAddr>>>,
    seen: mpsc::UnboundedReceiver<ServerRequest>,
    push: mpsc::UnboundedSender<ServerMessage>,
}

impl FakeServer {
    async fn start(reject_login: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer_addrs: Arc<Mutex<HashMap<String, SocketAddr>>> = Arc::default();
        let (seen_tx, seen) = mpsc::unbounded_channel();
        let (push, mut push_rx) = mpsc::unbounded_channel::<ServerMessage>();

        let table = peer_addrs.clone();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, write_half) = socket.into_split();
            let mut frames = FramedRead::new(read_half, FrameCodec::new());
            let mut sink = FramedWrite::new(write_half, FrameCodec::new());
            loop {
                tokio::select! {
                    Some(msg) = push_rx.recv() => {
                        sink.send(msg.encode()).await.unwrap();
                    }
                    frame = frames.next() => {
                        let Some(Ok(payload)) = frame else { break };
                        let Some(request) = ServerRequest::decode(&payload).unwrap() else {
                            continue;
                        };
                        match &request {
                            ServerRequest::Login { .. } => {
                                let reply = if reject_login {
                                    ServerMessage::LoginFailed {
                                        reason: "INVALIDPASS".to_string(),
                                    }
                                } else {
                                    ServerMessage::LoginOk {
                                        greet: "Welcome to the network".to_string(),
                                    }
                                };
                                sink.send(reply.encode()).await.unwrap();
                            }
                            ServerRequest::GetPeerAddress { username } => {
                                let known = table.lock().unwrap().get(username).copied();
                                if let Some(SocketAddr::V4(v4)) = known {
                                    let reply = ServerMessage::PeerAddress {
                                        username: username.clone(),
                                        host: *v4.ip(),
                                        port: v4.port(),
                                    };
                                    sink.send(reply.encode()).await.unwrap();
                                }
                            }
                            _ => {}
                        }
                        let _ = seen_tx.send(request);
                    }
                }
            }
        });

        Self {
            addr,
            peer_addrs,
            seen,
            push,
        }
    }

    fn config(&self) -> ClientConfig {
        ClientConfig {
            server_addr: self.addr.to_string(),
            listen_port: 0,
            token_source: Some(Arc::new(SeqTokens(AtomicU32::new(1)))),
        }
    }

    /// Waits for the next request `f` accepts, skipping others.
    async fn expect<T>(&mut self, mut f: impl FnMut(&ServerRequest) -> Option<T>) -> T {
        loop {
            let request = tokio::time::timeout(TEST_TIMEOUT, self.seen.recv())
                .await
                .expect("timed out waiting for a server request")
                .expect("server connection dropped");
            if let Some(value) = f(&request) {
                return value;
            }
        }
    }
}

fn sample_file(name: &str) -> FileEntry {
    FileEntry {
        filename: format!("@@music\\{name}"),
        size: 4096,
        extension: "flac".to_string(),
        attributes: vec![(FileAttribute::Bitrate, 1411)],
    }
}

#[tokio::test]
async fn test_login_runs_post_login_handshake() {
    let mut server = FakeServer::start(false).await;
    let client = SlskClient::connect(server.config()).await.unwrap();
    client.login("alice", "hunter2").await.unwrap();

    server
        .expect(|r| {
            matches!(r, ServerRequest::Login { username, .. } if username == "alice").then_some(())
        })
        .await;

    // Port advertisement plus the three handshake messages, in any order.
    let mut wait_port = None;
    let mut shares = None;
    let mut no_parents = None;
    let mut status = None;
    for _ in 0..4 {
        server
            .expect(|r| {
                match r {
                    ServerRequest::SetWaitPort { port } => wait_port = Some(*port),
                    ServerRequest::SharedFoldersFiles { dirs, files } => {
                        shares = Some((*dirs, *files))
                    }
                    ServerRequest::HaveNoParents { have_no_parents } => {
                        no_parents = Some(*have_no_parents)
                    }
                    ServerRequest::SetStatus { status: s } => status = Some(*s),
                    _ => return None,
                }
                Some(())
            })
            .await;
    }
    assert_eq!(wait_port, Some(u32::from(client.listen_port())));
    assert_eq!(shares, Some((1, 1)));
    assert_eq!(no_parents, Some(true));
    assert_eq!(status, Some(UserStatus::Online));
}

#[tokio::test]
async fn test_login_rejection_surfaces_the_reason() {
    let server = FakeServer::start(true).await;
    let client = SlskClient::connect(server.config()).await.unwrap();
    let err = client.login("alice", "wrong").await.unwrap_err();
    assert!(matches!(err, SlskError::LoginFailed { reason } if reason == "INVALIDPASS"));
}

#[tokio::test]
async fn test_get_peer_address_resolves_known_users() {
    let server = FakeServer::start(false).await;
    let bob: SocketAddr = "127.0.0.1:7777".parse().unwrap();
    server
        .peer_addrs
        .lock()
        .unwrap()
        .insert("bob".to_string(), bob);

    let client = SlskClient::connect(server.config()).await.unwrap();
    assert_eq!(client.get_peer_address("bob").await.unwrap(), bob);
}

#[tokio::test]
async fn test_search_collects_only_matching_tokens_within_window() {
    let mut server = FakeServer::start(false).await;
    let peer_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_port = peer_listener.local_addr().unwrap().port();

    let client = SlskClient::connect(server.config()).await.unwrap();
    client.login("alice", "hunter2").await.unwrap();

    let (token, mut replies) = client
        .search_stream("autechre", Duration::from_secs(2))
        .unwrap();
    let seen_token = server
        .expect(|r| match r {
            ServerRequest::FileSearch { token, query } if query == "autechre" => Some(*token),
            _ => None,
        })
        .await;
    assert_eq!(seen_token, token);

    // Have the client open a messaging connection to our scripted peer.
    let push_token = Token([9, 9, 9, 9]);
    server
        .push
        .send(ServerMessage::ConnectToPeer {
            username: "uploader".to_string(),
            conn_type: ConnectionType::PeerToPeer,
            host: "127.0.0.1".parse().unwrap(),
            port: peer_port,
            token: push_token,
        })
        .unwrap();

    let (socket, _) = peer_listener.accept().await.unwrap();
    let (read_half, write_half) = socket.into_split();
    let mut frames = FramedRead::new(read_half, FrameCodec::new());
    let mut sink = FramedWrite::new(write_half, FrameCodec::new());

    let pierce = frames.next().await.unwrap().unwrap();
    assert_eq!(
        PeerInitMessage::decode(&pierce).unwrap(),
        Some(PeerInitMessage::PierceFirewall { token: push_token })
    );

    // One reply with the right token, one with a stale token.
    let good = PeerMessage::FileSearchResponse {
        username: "uploader".to_string(),
        token,
        files: vec![sample_file("autechre - gantz graf.flac")],
        slots_free: true,
        avg_speed: 768,
        queue_length: 0,
    };
    let stale = PeerMessage::FileSearchResponse {
        username: "uploader".to_string(),
        token: Token([0xaa, 0xbb, 0xcc, 0xdd]),
        files: vec![sample_file("something else.flac")],
        slots_free: true,
        avg_speed: 768,
        queue_length: 0,
    };
    sink.send(stale.encode()).await.unwrap();
    sink.send(good.encode()).await.unwrap();

    let reply = tokio::time::timeout(TEST_TIMEOUT, replies.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.username, "uploader");
    assert_eq!(reply.files.len(), 1);
    assert!(reply.files[0].filename.contains("gantz graf"));
    assert!(reply.slots_free);

    // The window closes the stream; nothing else was let through.
    let end = tokio::time::timeout(TEST_TIMEOUT, replies.recv()).await.unwrap();
    assert!(end.is_none());
}

#[tokio::test]
async fn test_download_resumes_at_offset_and_completes() {
    const REMOTE: &str = "@@music\\autechre - gantz graf.flac";
    const TOTAL: u64 = 100_000;
    const OFFSET: u64 = 40_000;
    let transfer_token = Token([0xc0, 0xff, 0xee, 0x00]);

    let server = FakeServer::start(false).await;
    let peer_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer_listener.local_addr().unwrap();
    let transfer_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let transfer_port = transfer_listener.local_addr().unwrap().port();
    server
        .peer_addrs
        .lock()
        .unwrap()
        .insert("uploader".to_string(), peer_addr);

    let client = SlskClient::connect(server.config()).await.unwrap();
    client.login("alice", "hunter2").await.unwrap();

    // Scripted uploader: accept the client's direct dial, grant the
    // transfer, and signal once the client has allowed it.
    let (granted_tx, granted_rx) = tokio::sync::oneshot::channel();
    let uploader = tokio::spawn(async move {
        let (socket, _) = peer_listener.accept().await.unwrap();
        let (read_half, write_half) = socket.into_split();
        let mut frames = FramedRead::new(read_half, FrameCodec::new());
        let mut sink = FramedWrite::new(write_half, FrameCodec::new());

        let init = frames.next().await.unwrap().unwrap();
        assert!(matches!(
            PeerInitMessage::decode(&init).unwrap(),
            Some(PeerInitMessage::PeerInit { username, .. }) if username == "alice"
        ));

        let queued = frames.next().await.unwrap().unwrap();
        assert!(matches!(
            PeerMessage::decode(&queued).unwrap(),
            Some(PeerMessage::QueueUpload { filename }) if filename == REMOTE
        ));
        let probe = frames.next().await.unwrap().unwrap();
        assert!(matches!(
            PeerMessage::decode(&probe).unwrap(),
            Some(PeerMessage::PlaceInQueueRequest { filename }) if filename == REMOTE
        ));

        sink.send(
            PeerMessage::PlaceInQueueResponse {
                filename: REMOTE.to_string(),
                place: 1,
            }
            .encode(),
        )
        .await
        .unwrap();
        sink.send(
            PeerMessage::TransferRequest {
                direction: TransferDirection::Upload,
                token: transfer_token,
                filename: REMOTE.to_string(),
                size: Some(TOTAL),
            }
            .encode(),
        )
        .await
        .unwrap();

        let response = frames.next().await.unwrap().unwrap();
        assert!(matches!(
            PeerMessage::decode(&response).unwrap(),
            Some(PeerMessage::TransferResponse {
                token,
                allowed: true,
                reason: None,
            }) if token == transfer_token
        ));
        granted_tx.send(()).unwrap();
        // Keep the messaging socket open until the test ends.
        (frames, sink)
    });

    let mut download = client
        .download_from("uploader", REMOTE, OFFSET)
        .await
        .unwrap();
    tokio::time::timeout(TEST_TIMEOUT, granted_rx)
        .await
        .unwrap()
        .unwrap();

    // Push the out-of-band transfer connection toward our scripted socket.
    let push_token = Token([7, 7, 7, 7]);
    server
        .push
        .send(ServerMessage::ConnectToPeer {
            username: "uploader".to_string(),
            conn_type: ConnectionType::FileTransfer,
            host: "127.0.0.1".parse().unwrap(),
            port: transfer_port,
            token: push_token,
        })
        .unwrap();

    let (mut socket, _) = transfer_listener.accept().await.unwrap();

    // Pierce-firewall frame, then raw bytes only.
    let mut len = [0u8; 4];
    socket.read_exact(&mut len).await.unwrap();
    let mut payload = vec![0u8; u32::from_le_bytes(len) as usize];
    socket.read_exact(&mut payload).await.unwrap();
    assert_eq!(
        PeerInitMessage::decode(&payload).unwrap(),
        Some(PeerInitMessage::PierceFirewall { token: push_token })
    );

    socket.write_all(&transfer_token.0).await.unwrap();
    let mut offset = [0u8; 8];
    socket.read_exact(&mut offset).await.unwrap();
    assert_eq!(u64::from_le_bytes(offset), OFFSET);

    let body = vec![0x5a_u8; (TOTAL - OFFSET) as usize];
    socket.write_all(&body).await.unwrap();

    let mut received = Vec::new();
    while let Some(chunk) = tokio::time::timeout(TEST_TIMEOUT, download.data.recv())
        .await
        .unwrap()
    {
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received.len() as u64, TOTAL - OFFSET);
    assert!(received.iter().all(|b| *b == 0x5a));

    // The event stream walked the whole lifecycle and ended complete.
    let mut statuses = Vec::new();
    let mut completed = None;
    while let Some(event) = download.events.recv().await {
        match event {
            DownloadEvent::Status(state) => statuses.push(state.status()),
            DownloadEvent::Complete { received } => completed = Some(received),
            DownloadEvent::Progress { .. } => {}
            DownloadEvent::Failed { reason } => panic!("download failed: {reason}"),
        }
    }
    assert_eq!(completed, Some(TOTAL));
    assert_eq!(
        statuses,
        ["requested", "queued", "connected", "downloading", "complete"]
    );

    // Held open until here so the messaging connection outlives the test.
    let _uploader_sockets = uploader.await.unwrap();
}

#[tokio::test]
async fn test_unknown_transfer_token_closes_the_socket() {
    let server = FakeServer::start(false).await;
    let transfer_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let transfer_port = transfer_listener.local_addr().unwrap().port();

    let _client = SlskClient::connect(server.config()).await.unwrap();
    server
        .push
        .send(ServerMessage::ConnectToPeer {
            username: "stranger".to_string(),
            conn_type: ConnectionType::FileTransfer,
            host: "127.0.0.1".parse().unwrap(),
            port: transfer_port,
            token: Token([1, 2, 3, 4]),
        })
        .unwrap();

    let (mut socket, _) = transfer_listener.accept().await.unwrap();
    let mut len = [0u8; 4];
    socket.read_exact(&mut len).await.unwrap();
    let mut payload = vec![0u8; u32::from_le_bytes(len) as usize];
    socket.read_exact(&mut payload).await.unwrap();

    // No pending download carries this token: the client closes.
    socket.write_all(&[0xde, 0xad, 0xbe, 0xef]).await.unwrap();
    let n = tokio::time::timeout(TEST_TIMEOUT, socket.read(&mut [0u8; 16]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_rendezvous_strategy_wins_when_address_lookup_stalls() {
    // The scripted server knows no address for "bob", so the direct-dial
    // strategy can never finish; only the rendezvous path can.
    let mut server = FakeServer::start(false).await;
    let client = Arc::new(SlskClient::connect(server.config()).await.unwrap());
    client.login("alice", "hunter2").await.unwrap();
    let client_listener: SocketAddr = ([127, 0, 0, 1], client.listen_port()).into();

    // One local port that both listens and dials, so the client's
    // dial-back to the pierce's origin address lands on a live listener.
    let reusable = |addr: SocketAddr| {
        let socket = TcpSocket::new_v4().unwrap();
        socket.set_reuseaddr(true).unwrap();
        socket.set_reuseport(true).unwrap();
        socket.bind(addr).unwrap();
        socket
    };
    let anchor = reusable("127.0.0.1:0".parse().unwrap());
    let peer_addr = anchor.local_addr().unwrap();
    let dial_back = anchor.listen(8).unwrap();

    let resolving = tokio::spawn({
        let client = client.clone();
        async move { client.peer_by_username("bob").await }
    });

    let token = server
        .expect(|r| match r {
            ServerRequest::ConnectToPeer {
                token,
                username,
                conn_type: ConnectionType::PeerToPeer,
            } if username == "bob" => Some(*token),
            _ => None,
        })
        .await;

    // Pierce from the anchored port; keep the stream open so its source
    // address stays claimed.
    let pierce_stream = reusable(peer_addr).connect(client_listener).await.unwrap();
    let mut pierce = FramedWrite::new(pierce_stream, FrameCodec::new());
    pierce
        .send(PeerInitMessage::PierceFirewall { token }.encode())
        .await
        .unwrap();

    // The client dials back to the pierce's origin.
    let (_back, _) = tokio::time::timeout(TEST_TIMEOUT, dial_back.accept())
        .await
        .unwrap()
        .unwrap();

    let peer = tokio::time::timeout(TEST_TIMEOUT, resolving)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(peer.addr.port(), peer_addr.port());

    // The losing strategy must not register a second connection.
    let again = client.peer_by_username("bob").await.unwrap();
    assert!(Arc::ptr_eq(&peer, &again));
}

#[tokio::test]
async fn test_upload_failed_frees_the_download_for_retry() {
    const REMOTE: &str = "@@music\\gone.flac";

    let server = FakeServer::start(false).await;
    let peer_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer_listener.local_addr().unwrap();
    server
        .peer_addrs
        .lock()
        .unwrap()
        .insert("uploader".to_string(), peer_addr);

    let client = SlskClient::connect(server.config()).await.unwrap();
    client.login("alice", "hunter2").await.unwrap();

    // Scripted uploader: accept the dial, read the download requests, then
    // refuse the upload outright.
    let uploader = tokio::spawn(async move {
        let (socket, _) = peer_listener.accept().await.unwrap();
        let (read_half, write_half) = socket.into_split();
        let mut frames = FramedRead::new(read_half, FrameCodec::new());
        let mut sink = FramedWrite::new(write_half, FrameCodec::new());

        let init = frames.next().await.unwrap().unwrap();
        assert!(PeerInitMessage::decode(&init).unwrap().is_some());
        frames.next().await.unwrap().unwrap(); // queue upload
        frames.next().await.unwrap().unwrap(); // place in queue

        sink.send(
            PeerMessage::UploadFailed {
                filename: REMOTE.to_string(),
            }
            .encode(),
        )
        .await
        .unwrap();
        (frames, sink)
    });

    let mut download = client.download_from("uploader", REMOTE, 0).await.unwrap();

    let mut failure = None;
    while let Some(event) = tokio::time::timeout(TEST_TIMEOUT, download.events.recv())
        .await
        .unwrap()
    {
        if let DownloadEvent::Failed { reason } = event {
            failure = Some(reason);
            break;
        }
    }
    assert!(failure.unwrap().contains("upload failed"));

    // Nothing was streamed and the data channel is closed.
    let end = tokio::time::timeout(TEST_TIMEOUT, download.data.recv())
        .await
        .unwrap();
    assert!(end.is_none());

    // The failed entry left the live set, so the same file can be retried.
    let retry = client.download_from("uploader", REMOTE, 0).await;
    assert!(retry.is_ok());

    let _uploader_sockets = uploader.await.unwrap();
}

#[tokio::test]
async fn test_transfer_socket_closing_midstream_fails_the_download() {
    const REMOTE: &str = "@@music\\truncated.flac";
    const TOTAL: u64 = 50_000;
    const SENT: usize = 10_000;
    let transfer_token = Token([0x01, 0x02, 0x03, 0x04]);

    let server = FakeServer::start(false).await;
    let peer_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer_listener.local_addr().unwrap();
    let transfer_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let transfer_port = transfer_listener.local_addr().unwrap().port();
    server
        .peer_addrs
        .lock()
        .unwrap()
        .insert("uploader".to_string(), peer_addr);

    let client = SlskClient::connect(server.config()).await.unwrap();
    client.login("alice", "hunter2").await.unwrap();

    // Scripted uploader: grant the transfer straight from the queue
    // request, without a place-in-queue answer first.
    let (granted_tx, granted_rx) = tokio::sync::oneshot::channel();
    let uploader = tokio::spawn(async move {
        let (socket, _) = peer_listener.accept().await.unwrap();
        let (read_half, write_half) = socket.into_split();
        let mut frames = FramedRead::new(read_half, FrameCodec::new());
        let mut sink = FramedWrite::new(write_half, FrameCodec::new());

        frames.next().await.unwrap().unwrap(); // peer init
        frames.next().await.unwrap().unwrap(); // queue upload
        frames.next().await.unwrap().unwrap(); // place in queue

        sink.send(
            PeerMessage::TransferRequest {
                direction: TransferDirection::Upload,
                token: transfer_token,
                filename: REMOTE.to_string(),
                size: Some(TOTAL),
            }
            .encode(),
        )
        .await
        .unwrap();

        let response = frames.next().await.unwrap().unwrap();
        assert!(matches!(
            PeerMessage::decode(&response).unwrap(),
            Some(PeerMessage::TransferResponse { allowed: true, .. })
        ));
        granted_tx.send(()).unwrap();
        (frames, sink)
    });

    let mut download = client.download_from("uploader", REMOTE, 0).await.unwrap();
    tokio::time::timeout(TEST_TIMEOUT, granted_rx)
        .await
        .unwrap()
        .unwrap();

    server
        .push
        .send(ServerMessage::ConnectToPeer {
            username: "uploader".to_string(),
            conn_type: ConnectionType::FileTransfer,
            host: "127.0.0.1".parse().unwrap(),
            port: transfer_port,
            token: Token([8, 8, 8, 8]),
        })
        .unwrap();

    let (mut socket, _) = transfer_listener.accept().await.unwrap();
    let mut len = [0u8; 4];
    socket.read_exact(&mut len).await.unwrap();
    let mut payload = vec![0u8; u32::from_le_bytes(len) as usize];
    socket.read_exact(&mut payload).await.unwrap();

    socket.write_all(&transfer_token.0).await.unwrap();
    let mut offset = [0u8; 8];
    socket.read_exact(&mut offset).await.unwrap();
    assert_eq!(u64::from_le_bytes(offset), 0);

    // Deliver a fraction of the promised bytes, then drop the socket.
    socket.write_all(&vec![0x11_u8; SENT]).await.unwrap();
    drop(socket);

    // The partial bytes come through, then the data channel closes.
    let mut received = Vec::new();
    while let Some(chunk) = tokio::time::timeout(TEST_TIMEOUT, download.data.recv())
        .await
        .unwrap()
    {
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received.len(), SENT);

    // The failure is reported and the live entry is gone, so the same
    // download can be retried.
    let mut saw_failed = false;
    while let Some(event) = tokio::time::timeout(TEST_TIMEOUT, download.events.recv())
        .await
        .unwrap()
    {
        if matches!(event, DownloadEvent::Failed { .. }) {
            saw_failed = true;
        }
    }
    assert!(saw_failed);
    assert!(client.download_from("uploader", REMOTE, 0).await.is_ok());

    let _uploader_sockets = uploader.await.unwrap();
}

#[tokio::test]
async fn test_concurrent_resolutions_share_one_connection() {
    let mut server = FakeServer::start(false).await;
    let client = Arc::new(SlskClient::connect(server.config()).await.unwrap());
    client.login("alice", "hunter2").await.unwrap();
    let client_listener: SocketAddr = ([127, 0, 0, 1], client.listen_port()).into();

    let reusable = |addr: SocketAddr| {
        let socket = TcpSocket::new_v4().unwrap();
        socket.set_reuseaddr(true).unwrap();
        socket.set_reuseport(true).unwrap();
        socket.bind(addr).unwrap();
        socket
    };
    let anchor = reusable("127.0.0.1:0".parse().unwrap());
    let peer_addr = anchor.local_addr().unwrap();
    let dial_back = anchor.listen(8).unwrap();

    // Two callers race for the same not-yet-connected user.
    let first = tokio::spawn({
        let client = client.clone();
        async move { client.peer_by_username("bob").await }
    });
    let second = tokio::spawn({
        let client = client.clone();
        async move { client.peer_by_username("bob").await }
    });

    let token = server
        .expect(|r| match r {
            ServerRequest::ConnectToPeer {
                token,
                username,
                conn_type: ConnectionType::PeerToPeer,
            } if username == "bob" => Some(*token),
            _ => None,
        })
        .await;

    let pierce_stream = reusable(peer_addr).connect(client_listener).await.unwrap();
    let mut pierce = FramedWrite::new(pierce_stream, FrameCodec::new());
    pierce
        .send(PeerInitMessage::PierceFirewall { token }.encode())
        .await
        .unwrap();
    let (_back, _) = tokio::time::timeout(TEST_TIMEOUT, dial_back.accept())
        .await
        .unwrap()
        .unwrap();

    let one = tokio::time::timeout(TEST_TIMEOUT, first)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let two = tokio::time::timeout(TEST_TIMEOUT, second)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(Arc::ptr_eq(&one, &two));

    // The waiter reused the winner's connection: one rendezvous ran, total.
    let mut rendezvous_requests = 1;
    while let Ok(request) = server.seen.try_recv() {
        if matches!(request, ServerRequest::ConnectToPeer { .. }) {
            rendezvous_requests += 1;
        }
    }
    assert_eq!(rendezvous_requests, 1);
}
