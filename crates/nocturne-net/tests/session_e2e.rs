//! End-to-end session tests over in-memory transports.
//!
//! Each test wires an outgoing session to an incoming one through
//! `tokio::io::duplex` pipes, with a scripted dialer standing in for the
//! SOCKS proxy.

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use uuid::Uuid;

use nocturne_net::handshake::ConnectData;
use nocturne_net::{
    accept, connect, Dialer, PeerEvent, PeerHandle, PeerStream, SessionConfig, SessionState,
};
use nocturne_shared::protocol::{AckStatus, ChatMessage, UserInfo};
use nocturne_shared::types::ConversationId;
use nocturne_shared::{Identity, DEFAULT_ONION_PORT};
use nocturne_store::{FileRecord, FileState, FileStore, MemoryStore};

// -------------------------------------------------------------------------
// Test plumbing
// -------------------------------------------------------------------------

/// Hands out pre-arranged streams, one per dial.
struct ScriptedDialer {
    streams: Arc<Mutex<VecDeque<PeerStream>>>,
}

impl ScriptedDialer {
    fn new(streams: Vec<PeerStream>) -> Self {
        Self {
            streams: Arc::new(Mutex::new(streams.into_iter().collect())),
        }
    }
}

impl Dialer for ScriptedDialer {
    fn dial(&self, _addr: &nocturne_shared::OnionAddr) -> BoxFuture<'static, io::Result<PeerStream>> {
        let streams = self.streams.clone();
        async move {
            streams
                .lock()
                .expect("dialer lock")
                .pop_front()
                .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no more streams"))
        }
        .boxed()
    }
}

/// Write side fails with BrokenPipe once `budget` bytes have been written;
/// reads pass through. Used to cut a connection deterministically.
struct LimitedWrite<S> {
    inner: S,
    budget: usize,
}

impl<S: AsyncRead + Unpin> AsyncRead for LimitedWrite<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for LimitedWrite<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.budget == 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write budget exhausted",
            )));
        }
        let take = buf.len().min(self.budget);
        match Pin::new(&mut self.inner).poll_write(cx, &buf[..take]) {
            Poll::Ready(Ok(written)) => {
                self.budget -= written;
                Poll::Ready(Ok(written))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

struct Side {
    identity: Arc<Identity>,
    store: Arc<MemoryStore>,
    conversation: ConversationId,
}

impl Side {
    fn new() -> Self {
        Self {
            identity: Arc::new(Identity::generate()),
            store: Arc::new(MemoryStore::new()),
            conversation: ConversationId::new(),
        }
    }
}

fn fast_config() -> SessionConfig {
    SessionConfig {
        reconnect_delay: Duration::from_millis(100),
        file_io_chunk_bytes: 1024,
        ..SessionConfig::default()
    }
}

fn connect_data(client: &Side, server: &Side) -> ConnectData {
    ConnectData {
        conversation: client.conversation,
        local: client.identity.clone(),
        remote_addr: server.identity.onion_address(DEFAULT_ONION_PORT),
        remote_pubkey: None,
    }
}

/// A connected client/server session pair over one duplex pipe.
fn session_pair(
    client: &Side,
    server: &Side,
    config: SessionConfig,
) -> (
    PeerHandle,
    mpsc::Receiver<PeerEvent>,
    PeerHandle,
    mpsc::Receiver<PeerEvent>,
) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let dialer = Arc::new(ScriptedDialer::new(vec![PeerStream::new(a)]));

    let (client_handle, client_events) = connect(
        connect_data(client, server),
        dialer,
        client.store.clone(),
        config.clone(),
    );
    let (server_handle, server_events) = accept(
        PeerStream::new(b),
        server.identity.clone(),
        server.conversation,
        None,
        server.store.clone(),
        config,
    );
    (client_handle, client_events, server_handle, server_events)
}

async fn expect_event<F>(rx: &mut mpsc::Receiver<PeerEvent>, mut pred: F) -> PeerEvent
where
    F: FnMut(&PeerEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event stream ended early");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_connected(rx: &mut mpsc::Receiver<PeerEvent>) {
    expect_event(rx, |e| {
        matches!(
            e,
            PeerEvent::StateChanged {
                new: SessionState::Connected,
                ..
            }
        )
    })
    .await;
}

fn chat(content: &str) -> ChatMessage {
    ChatMessage {
        id: Uuid::new_v4(),
        conversation: ConversationId::new(),
        content: content.into(),
        timestamp: chrono::Utc::now(),
    }
}

fn write_source_file(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

// -------------------------------------------------------------------------
// Scenarios
// -------------------------------------------------------------------------

#[tokio::test]
async fn handshake_then_user_info_is_acked() {
    let client = Side::new();
    let server = Side::new();
    let (client_handle, mut client_events, _server_handle, mut server_events) =
        session_pair(&client, &server, fast_config());

    // Both sides authenticate each other's long-term identity.
    let event = expect_event(&mut client_events, |e| {
        matches!(e, PeerEvent::PeerAuthenticated { .. })
    })
    .await;
    if let PeerEvent::PeerAuthenticated { peer, .. } = event {
        assert_eq!(peer.0, server.identity.public_key_bytes());
    }
    let event = expect_event(&mut server_events, |e| {
        matches!(e, PeerEvent::PeerAuthenticated { .. })
    })
    .await;
    if let PeerEvent::PeerAuthenticated { peer, .. } = event {
        assert_eq!(peer.0, client.identity.public_key_bytes());
    }
    wait_connected(&mut client_events).await;

    client_handle
        .send_user_info(UserInfo {
            nickname: "moth".into(),
            status: "around".into(),
            avatar_hash: None,
        })
        .await
        .unwrap();

    let event = expect_event(&mut server_events, |e| {
        matches!(e, PeerEvent::UserInfoReceived { .. })
    })
    .await;
    if let PeerEvent::UserInfoReceived { request_id, info } = event {
        assert_eq!(request_id, 1);
        assert_eq!(info.nickname, "moth");
    }

    // The first request gets the first ack.
    let event = expect_event(&mut client_events, |e| {
        matches!(e, PeerEvent::AckReceived(_))
    })
    .await;
    if let PeerEvent::AckReceived(ack) = event {
        assert_eq!(ack.ref_id, 1);
        assert_eq!(ack.status, AckStatus::Ok);
    }

    // Request ids are strictly monotonic from 1.
    client_handle.send_message(chat("second")).await.unwrap();
    let event = expect_event(&mut client_events, |e| {
        matches!(e, PeerEvent::AckReceived(_))
    })
    .await;
    if let PeerEvent::AckReceived(ack) = event {
        assert_eq!(ack.ref_id, 2);
    }
}

#[tokio::test]
async fn forged_hello_is_rejected_without_retry_on_the_server() {
    let client = Side::new();
    let server = Side::new();
    let imposter_target = Identity::generate();

    let (a, b) = tokio::io::duplex(64 * 1024);
    let dialer = Arc::new(ScriptedDialer::new(vec![PeerStream::new(a)]));

    // The client signs its HELLO for a different service identity, which
    // is indistinguishable from a forged signature on the server side.
    let mut data = connect_data(&client, &server);
    data.remote_pubkey = Some(imposter_target.public_key_bytes());

    let config = SessionConfig {
        max_reconnects: 0,
        ..fast_config()
    };
    let (_client_handle, mut client_events) =
        connect(data, dialer, client.store.clone(), config.clone());
    let (_server_handle, mut server_events) = accept(
        PeerStream::new(b),
        server.identity.clone(),
        server.conversation,
        None,
        server.store.clone(),
        config,
    );

    let event = expect_event(&mut server_events, |e| {
        matches!(e, PeerEvent::ProtocolViolation { .. })
    })
    .await;
    if let PeerEvent::ProtocolViolation { detail, .. } = event {
        assert!(detail.contains("signature"), "unexpected detail: {detail}");
    }
    expect_event(&mut server_events, |e| matches!(e, PeerEvent::Closed { .. })).await;

    // The client never reaches the encrypted stream.
    expect_event(&mut client_events, |e| {
        matches!(
            e,
            PeerEvent::StateChanged {
                new: SessionState::Failed,
                ..
            }
        )
    })
    .await;
}

#[tokio::test]
async fn small_file_transfer_completes_with_matching_hash() {
    let client = Side::new();
    let server = Side::new();
    let (client_handle, mut client_events, server_handle, mut server_events) =
        session_pair(&client, &server, fast_config());
    wait_connected(&mut client_events).await;

    let dir = tempfile::tempdir().unwrap();
    let content = vec![0xC3u8; 1024];
    let source = write_source_file(&dir, "payload.bin", &content);

    let record = FileRecord::new_outgoing(client.conversation, "payload.bin", &source, 1024);
    let file_id = record.id;
    client.store.insert(record).unwrap();
    client_handle.offer_file(file_id).await.unwrap();

    // Hash is computed off the session loop, then the offer goes out.
    expect_event(&mut client_events, |e| {
        matches!(e, PeerEvent::HashReady { .. })
    })
    .await;

    let event = expect_event(&mut server_events, |e| {
        matches!(e, PeerEvent::FileOffered { .. })
    })
    .await;
    let PeerEvent::FileOffered { record, offer } = event else {
        unreachable!()
    };
    assert_eq!(record.id, file_id);
    assert_eq!(offer.size, 1024);

    let dest = dir.path().join("received.bin");
    server_handle
        .accept_file(file_id, dest.clone(), 0)
        .await
        .unwrap();

    // Receiver verifies the hash and lands on DONE.
    expect_event(&mut server_events, |e| {
        matches!(
            e,
            PeerEvent::FileStateChanged {
                state: FileState::Done,
                ..
            }
        )
    })
    .await;
    // The completion ack flips the sender's record too.
    expect_event(&mut client_events, |e| {
        matches!(
            e,
            PeerEvent::FileStateChanged {
                state: FileState::Done,
                ..
            }
        )
    })
    .await;

    assert_eq!(std::fs::read(&dest).unwrap(), content);

    let server_record = server.store.get(file_id).unwrap();
    assert_eq!(server_record.state, FileState::Done);
    assert_eq!(server_record.bytes_transferred, 1024);

    let client_record = client.store.get(file_id).unwrap();
    assert_eq!(client_record.state, FileState::Done);
    assert_eq!(client_record.bytes_transferred, 1024);
    assert!(client_record.ack_time.is_some());
}

#[tokio::test]
async fn interrupted_transfer_resumes_at_offset() {
    let client = Side::new();
    let server = Side::new();

    let content: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let dir = tempfile::tempdir().unwrap();
    let source = write_source_file(&dir, "big.bin", &content);
    let dest = dir.path().join("received.bin");

    // First connection dies after ~50 KiB of client writes; the second is
    // unrestricted.
    let (a1, b1) = tokio::io::duplex(256 * 1024);
    let (a2, b2) = tokio::io::duplex(256 * 1024);
    let dialer = Arc::new(ScriptedDialer::new(vec![
        PeerStream::new(LimitedWrite {
            inner: a1,
            budget: 50_000,
        }),
        PeerStream::new(a2),
    ]));

    let config = SessionConfig {
        reconnect_delay: Duration::from_millis(300),
        ..fast_config()
    };
    let (client_handle, mut client_events) = connect(
        connect_data(&client, &server),
        dialer,
        client.store.clone(),
        config.clone(),
    );
    let (server_handle_1, mut server_events_1) = accept(
        PeerStream::new(b1),
        server.identity.clone(),
        server.conversation,
        None,
        server.store.clone(),
        config.clone(),
    );
    wait_connected(&mut client_events).await;

    let record =
        FileRecord::new_outgoing(client.conversation, "big.bin", &source, content.len() as u64);
    let file_id = record.id;
    client.store.insert(record).unwrap();
    client_handle.offer_file(file_id).await.unwrap();

    expect_event(&mut server_events_1, |e| {
        matches!(e, PeerEvent::FileOffered { .. })
    })
    .await;

    // Accepting triggers the stream; the write budget cuts it mid-file.
    server_handle_1
        .accept_file(file_id, dest.clone(), 0)
        .await
        .unwrap();

    // The client loses the transport and enters the reconnect wait.
    expect_event(&mut client_events, |e| {
        matches!(
            e,
            PeerEvent::StateChanged {
                new: SessionState::ReconnectWait,
                ..
            }
        )
    })
    .await;
    // Session 1 drains whatever was buffered and dies on the EOF well
    // before the client dials again.
    expect_event(&mut server_events_1, |e| {
        matches!(e, PeerEvent::Closed { .. })
    })
    .await;

    // Interrupted, not reset: both records keep their progress.
    let interrupted = server.store.get(file_id).unwrap();
    assert_eq!(interrupted.state, FileState::Transferring);
    assert!(interrupted.bytes_transferred > 0);
    assert!(interrupted.bytes_transferred < content.len() as u64);
    let resume_offset = interrupted.bytes_transferred;

    // Second connection: the server side accepts a fresh session against
    // the same store; the re-offer resumes without asking the application.
    let (_server_handle_2, mut server_events_2) = accept(
        PeerStream::new(b2),
        server.identity.clone(),
        server.conversation,
        None,
        server.store.clone(),
        config,
    );

    let mut saw_offer = false;
    let event = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = server_events_2.recv().await.expect("event stream ended");
            match event {
                PeerEvent::FileOffered { .. } => saw_offer = true,
                PeerEvent::FileStateChanged {
                    state: FileState::Done,
                    ..
                } => return event,
                _ => {}
            }
        }
    })
    .await
    .expect("resumed transfer did not finish");
    assert!(matches!(event, PeerEvent::FileStateChanged { .. }));
    assert!(!saw_offer, "resume must not surface a new offer");

    // Progress only ever moved forward.
    let finished = server.store.get(file_id).unwrap();
    assert_eq!(finished.state, FileState::Done);
    assert_eq!(finished.bytes_transferred, content.len() as u64);
    assert!(finished.bytes_transferred >= resume_offset);

    // Byte-identical result despite the interruption.
    assert_eq!(std::fs::read(&dest).unwrap(), content);

    expect_event(&mut client_events, |e| {
        matches!(
            e,
            PeerEvent::FileStateChanged {
                state: FileState::Done,
                ..
            }
        )
    })
    .await;
}

#[tokio::test]
async fn rejected_offer_leaves_session_usable() {
    let client = Side::new();
    let server = Side::new();
    let (client_handle, mut client_events, server_handle, mut server_events) =
        session_pair(&client, &server, fast_config());
    wait_connected(&mut client_events).await;

    let dir = tempfile::tempdir().unwrap();
    let source = write_source_file(&dir, "unwanted.bin", &[1, 2, 3, 4]);
    let record = FileRecord::new_outgoing(client.conversation, "unwanted.bin", &source, 4);
    let file_id = record.id;
    client.store.insert(record).unwrap();
    client_handle.offer_file(file_id).await.unwrap();

    expect_event(&mut server_events, |e| {
        matches!(e, PeerEvent::FileOffered { .. })
    })
    .await;
    server_handle
        .reject_file(file_id, Some("disk full".into()))
        .await
        .unwrap();

    expect_event(&mut client_events, |e| {
        matches!(
            e,
            PeerEvent::FileStateChanged {
                state: FileState::Rejected,
                ..
            }
        )
    })
    .await;
    assert_eq!(
        client.store.get(file_id).unwrap().state,
        FileState::Rejected
    );
    // No bytes moved.
    assert_eq!(client.store.get(file_id).unwrap().bytes_transferred, 0);

    // The session carries on.
    client_handle.send_message(chat("still here")).await.unwrap();
    let event = expect_event(&mut server_events, |e| {
        matches!(e, PeerEvent::MessageReceived { .. })
    })
    .await;
    if let PeerEvent::MessageReceived { message, .. } = event {
        assert_eq!(message.content, "still here");
    }
}

#[tokio::test]
async fn avatar_roundtrip() {
    let client = Side::new();
    let server = Side::new();
    let (client_handle, mut client_events, _server_handle, mut server_events) =
        session_pair(&client, &server, fast_config());
    wait_connected(&mut client_events).await;

    let avatar = nocturne_shared::protocol::Avatar::from_bytes(b"tiny png bytes");
    client_handle.send_avatar(avatar.clone()).await.unwrap();

    let event = expect_event(&mut server_events, |e| {
        matches!(e, PeerEvent::AvatarReceived { .. })
    })
    .await;
    if let PeerEvent::AvatarReceived { avatar: received, .. } = event {
        assert_eq!(received, avatar);
        assert_eq!(received.image_bytes().unwrap(), b"tiny png bytes");
    }
}

#[tokio::test]
async fn silent_peer_triggers_local_ack_timeout() {
    let client = Side::new();
    let server = Side::new();

    let (a, b) = tokio::io::duplex(64 * 1024);
    let dialer = Arc::new(ScriptedDialer::new(vec![PeerStream::new(a)]));
    let config = SessionConfig {
        ack_timeout: Some(Duration::from_millis(200)),
        ..fast_config()
    };
    let (client_handle, mut client_events) = connect(
        connect_data(&client, &server),
        dialer,
        client.store.clone(),
        config,
    );

    // The "peer" completes the handshake but never answers anything.
    let mut silent = b;
    let server_identity = server.identity.clone();
    tokio::spawn(async move {
        let _outcome = nocturne_net::handshake::inbound(&mut silent, &server_identity, None)
            .await
            .unwrap();
        // Keep the transport open without ever answering.
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(silent);
    });

    wait_connected(&mut client_events).await;
    client_handle.send_message(chat("anyone there?")).await.unwrap();

    let event = expect_event(&mut client_events, |e| {
        matches!(e, PeerEvent::AckTimeout { .. })
    })
    .await;
    if let PeerEvent::AckTimeout { request_id } = event {
        assert_eq!(request_id, 1);
    }
}

#[tokio::test]
async fn oversized_frame_is_a_protocol_violation() {
    let client = Side::new();
    let server = Side::new();

    let (a, b) = tokio::io::duplex(64 * 1024);
    let (_server_handle, mut server_events) = accept(
        PeerStream::new(b),
        server.identity.clone(),
        server.conversation,
        None,
        server.store.clone(),
        SessionConfig::default(),
    );

    // Honest handshake, then a frame longer than max_chunk_bytes.
    let mut raw = a;
    let data = connect_data(&client, &server);
    nocturne_net::handshake::outbound(&mut raw, &data)
        .await
        .unwrap();

    let length = (SessionConfig::default().max_chunk_bytes + 1) as u16;
    raw.write_all(&length.to_be_bytes()).await.unwrap();

    let event = expect_event(&mut server_events, |e| {
        matches!(e, PeerEvent::ProtocolViolation { .. })
    })
    .await;
    if let PeerEvent::ProtocolViolation { detail, .. } = event {
        assert!(detail.contains("oversized"), "unexpected detail: {detail}");
    }
    expect_event(&mut server_events, |e| matches!(e, PeerEvent::Closed { .. })).await;
}

#[tokio::test]
async fn close_marks_interrupted_transfers_failed() {
    let client = Side::new();
    let server = Side::new();
    let (client_handle, mut client_events, server_handle, mut server_events) =
        session_pair(&client, &server, fast_config());
    wait_connected(&mut client_events).await;

    // Start a transfer, then close the receiving session mid-flight. A
    // file much larger than the pipe guarantees it is still transferring.
    let dir = tempfile::tempdir().unwrap();
    let content = vec![9u8; 8 * 1024 * 1024];
    let source = write_source_file(&dir, "big.bin", &content);
    let record =
        FileRecord::new_outgoing(client.conversation, "big.bin", &source, content.len() as u64);
    let file_id = record.id;
    client.store.insert(record).unwrap();
    client_handle.offer_file(file_id).await.unwrap();

    expect_event(&mut server_events, |e| {
        matches!(e, PeerEvent::FileOffered { .. })
    })
    .await;
    server_handle
        .accept_file(file_id, dir.path().join("dest.bin"), 0)
        .await
        .unwrap();
    expect_event(&mut server_events, |e| {
        matches!(e, PeerEvent::BytesTransferred { .. })
    })
    .await;

    server_handle.close().await.unwrap();
    expect_event(&mut server_events, |e| {
        matches!(
            e,
            PeerEvent::FileStateChanged {
                state: FileState::Failed,
                ..
            }
        )
    })
    .await;
    expect_event(&mut server_events, |e| matches!(e, PeerEvent::Closed { .. })).await;

    let record = server.store.get(file_id).unwrap();
    assert_eq!(record.state, FileState::Failed);
    // Progress is kept even through failure.
    assert!(record.bytes_transferred > 0);
}
