//! Peer session controller.
//!
//! One tokio task per remote peer, multiplexing transport I/O, commands and
//! background jobs in a single `select!` loop. External code talks to the
//! task through a [`PeerHandle`] and reads typed [`PeerEvent`]s from the
//! receiver returned at spawn time; the task never calls back into
//! application code.
//!
//! Outgoing sessions own a dialer and a reconnect budget. All connection
//! state (AEAD streams, channels, pending offers) dies with the transport;
//! the durable transfer progress lives in the file store and survives
//! reconnects.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use nocturne_shared::crypto::ContentHash;
use nocturne_shared::protocol::{
    AbortFile, AcceptFile, Ack, AckStatus, Avatar, ChatMessage, ControlMessage, IncomingFile,
    RejectFile, UserInfo,
};
use nocturne_shared::types::{ConversationId, Direction, FileId, PeerId};
use nocturne_shared::Identity;
use nocturne_store::{FileDirection, FileState, FileStore};

use crate::channel::{ChannelMap, CONTROL_CHANNEL};
use crate::config::SessionConfig;
use crate::error::{FileError, Result, SessionError};
use crate::events::{PeerEvent, SessionState};
use crate::handshake::{self, ConnectData, HandshakeOutcome};
use crate::stream::{EncryptedReader, EncryptedWriter, InboundChunk};
use crate::transfer::{hash_file, InboundFile, OutboundFile};
use crate::transport::{Dialer, Duplex, PeerStream};

type Writer = EncryptedWriter<WriteHalf<Box<dyn Duplex>>>;
type Reader = EncryptedReader<ReadHalf<Box<dyn Duplex>>>;

/// Commands accepted by a running session.
#[derive(Debug)]
pub enum SessionCommand {
    SendMessage(ChatMessage),
    SendUserInfo(UserInfo),
    SendAvatar(Avatar),
    /// Offer a file already present in the store.
    OfferFile(FileId),
    /// Authorize an offered file, writing to `dest` from `offset`.
    AcceptFile {
        file_id: FileId,
        dest: PathBuf,
        offset: u64,
    },
    RejectFile {
        file_id: FileId,
        reason: Option<String>,
    },
    AbortFile(FileId),
    DisableNotifications,
    Close,
}

/// Cloneable handle to one session task.
#[derive(Clone)]
pub struct PeerHandle {
    session: Uuid,
    cmd_tx: mpsc::Sender<SessionCommand>,
}

impl PeerHandle {
    pub fn id(&self) -> Uuid {
        self.session
    }

    pub async fn send_message(&self, message: ChatMessage) -> Result<()> {
        self.send(SessionCommand::SendMessage(message)).await
    }

    pub async fn send_user_info(&self, info: UserInfo) -> Result<()> {
        self.send(SessionCommand::SendUserInfo(info)).await
    }

    pub async fn send_avatar(&self, avatar: Avatar) -> Result<()> {
        self.send(SessionCommand::SendAvatar(avatar)).await
    }

    pub async fn offer_file(&self, file_id: FileId) -> Result<()> {
        self.send(SessionCommand::OfferFile(file_id)).await
    }

    pub async fn accept_file(&self, file_id: FileId, dest: PathBuf, offset: u64) -> Result<()> {
        self.send(SessionCommand::AcceptFile {
            file_id,
            dest,
            offset,
        })
        .await
    }

    pub async fn reject_file(&self, file_id: FileId, reason: Option<String>) -> Result<()> {
        self.send(SessionCommand::RejectFile { file_id, reason }).await
    }

    pub async fn abort_file(&self, file_id: FileId) -> Result<()> {
        self.send(SessionCommand::AbortFile(file_id)).await
    }

    pub async fn disable_notifications(&self) -> Result<()> {
        self.send(SessionCommand::DisableNotifications).await
    }

    pub async fn close(&self) -> Result<()> {
        self.send(SessionCommand::Close).await
    }

    async fn send(&self, cmd: SessionCommand) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| SessionError::Closed)
    }
}

/// Spawn an outgoing session: dial, handshake, reconnect on transport loss.
pub fn connect(
    connect: ConnectData,
    dialer: Arc<dyn Dialer>,
    store: Arc<dyn FileStore>,
    config: SessionConfig,
) -> (PeerHandle, mpsc::Receiver<PeerEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (event_tx, event_rx) = mpsc::channel(256);

    let session = Session::new(
        Direction::Outgoing,
        connect.conversation,
        connect.local.clone(),
        store,
        config,
        cmd_rx,
        event_tx,
    );
    let id = session.id;
    info!(session = %id, peer = %connect.remote_addr, "Spawning outgoing session");
    tokio::spawn(session.run_outgoing(connect, dialer));

    (PeerHandle { session: id, cmd_tx }, event_rx)
}

/// Spawn an incoming session on an accepted stream. With `expected` set the
/// handshake enforces that exact client identity; otherwise the proven
/// identity is reported and authorization is the application's decision.
pub fn accept(
    stream: PeerStream,
    local: Arc<Identity>,
    conversation: ConversationId,
    expected: Option<[u8; 32]>,
    store: Arc<dyn FileStore>,
    config: SessionConfig,
) -> (PeerHandle, mpsc::Receiver<PeerEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (event_tx, event_rx) = mpsc::channel(256);

    let session = Session::new(
        Direction::Incoming,
        conversation,
        local,
        store,
        config,
        cmd_rx,
        event_tx,
    );
    let id = session.id;
    info!(session = %id, "Spawning incoming session");
    tokio::spawn(session.run_incoming(stream, expected));

    (PeerHandle { session: id, cmd_tx }, event_rx)
}

enum Job {
    HashReady {
        file_id: FileId,
        result: std::result::Result<ContentHash, FileError>,
    },
}

enum Flow {
    Continue,
    Shutdown,
}

enum Backoff {
    Retry,
    BudgetExhausted,
    CloseRequested,
}

struct Session {
    id: Uuid,
    direction: Direction,
    conversation: ConversationId,
    local: Arc<Identity>,
    store: Arc<dyn FileStore>,
    config: SessionConfig,

    state: SessionState,
    peer: Option<PeerId>,
    /// Last issued request id; the first outbound chunk carries 1.
    request_id: u64,
    channels: ChannelMap,
    /// Offers we sent, awaiting AcceptFile/RejectFile: file -> channel.
    offers_out: HashMap<FileId, u32>,
    /// Offers we received, awaiting the application's decision.
    offers_in: HashMap<FileId, (IncomingFile, u64)>,
    /// Offer request ids: the completion ack references them.
    offer_acks: HashMap<u64, FileId>,
    /// Control requests awaiting an ack, with their local deadline.
    pending_acks: HashMap<u64, Instant>,
    /// Inbound channels aborted locally; in-flight chunks are discarded
    /// until their FINAL arrives.
    muted_inbound: HashSet<u32>,
    notifications_disabled: bool,

    cmd_rx: mpsc::Receiver<SessionCommand>,
    event_tx: mpsc::Sender<PeerEvent>,
    job_tx: mpsc::Sender<Job>,
    job_rx: mpsc::Receiver<Job>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    fn new(
        direction: Direction,
        conversation: ConversationId,
        local: Arc<Identity>,
        store: Arc<dyn FileStore>,
        config: SessionConfig,
        cmd_rx: mpsc::Receiver<SessionCommand>,
        event_tx: mpsc::Sender<PeerEvent>,
    ) -> Self {
        let (job_tx, job_rx) = mpsc::channel(16);
        Self {
            id: Uuid::new_v4(),
            direction,
            conversation,
            local,
            store,
            config,
            state: SessionState::Dialing,
            peer: None,
            request_id: 0,
            channels: ChannelMap::new(),
            offers_out: HashMap::new(),
            offers_in: HashMap::new(),
            offer_acks: HashMap::new(),
            pending_acks: HashMap::new(),
            muted_inbound: HashSet::new(),
            notifications_disabled: false,
            cmd_rx,
            event_tx,
            job_tx,
            job_rx,
        }
    }

    // -----------------------------------------------------------------
    // Top-level state machines
    // -----------------------------------------------------------------

    async fn run_outgoing(mut self, connect: ConnectData, dialer: Arc<dyn Dialer>) {
        let mut reconnects: u32 = 0;

        // Whether interrupted transfers keep their TRANSFERRING state for a
        // future session. True for transport-type ends; an explicit close or
        // a protocol violation marks them FAILED.
        let preserve_transfers = loop {
            self.set_state(SessionState::Dialing).await;
            let mut stream = tokio::select! {
                result = dialer.dial(&connect.remote_addr) => match result {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(session = %self.id, error = %e, "Dial failed");
                        match self.backoff(&mut reconnects).await {
                            Backoff::Retry => continue,
                            Backoff::BudgetExhausted => break true,
                            Backoff::CloseRequested => break false,
                        }
                    }
                },
                _ = Self::closed(&mut self.cmd_rx) => break false,
            };

            self.set_state(SessionState::Handshaking).await;
            let outcome = tokio::select! {
                result = tokio::time::timeout(
                    self.config.handshake_timeout,
                    handshake::outbound(&mut stream, &connect),
                ) => match result {
                    Err(_) => {
                        warn!(session = %self.id, "Handshake timed out");
                        match self.backoff(&mut reconnects).await {
                            Backoff::Retry => continue,
                            Backoff::BudgetExhausted => break true,
                            Backoff::CloseRequested => break false,
                        }
                    }
                    Ok(Err(e)) if e.is_reconnectable() => {
                        warn!(session = %self.id, error = %e, "Handshake transport failure");
                        match self.backoff(&mut reconnects).await {
                            Backoff::Retry => continue,
                            Backoff::BudgetExhausted => break true,
                            Backoff::CloseRequested => break false,
                        }
                    }
                    Ok(Err(e)) => {
                        self.report_violation(&e).await;
                        break false;
                    }
                    Ok(Ok(outcome)) => outcome,
                },
                _ = Self::closed(&mut self.cmd_rx) => break false,
            };

            match self.run_connected(stream, outcome).await {
                Ok(()) => break false,
                Err(e) if e.is_reconnectable() => {
                    warn!(session = %self.id, error = %e, "Transport lost");
                    match self.backoff(&mut reconnects).await {
                        Backoff::Retry => continue,
                        Backoff::BudgetExhausted => break true,
                        Backoff::CloseRequested => break false,
                    }
                }
                Err(e) => {
                    self.report_violation(&e).await;
                    break false;
                }
            }
        };

        self.shutdown(preserve_transfers).await;
    }

    async fn run_incoming(mut self, mut stream: PeerStream, expected: Option<[u8; 32]>) {
        self.set_state(SessionState::Handshaking).await;

        let outcome = match tokio::time::timeout(
            self.config.handshake_timeout,
            handshake::inbound(&mut stream, &self.local, expected),
        )
        .await
        {
            Err(_) => {
                warn!(session = %self.id, "Inbound handshake timed out");
                self.shutdown(true).await;
                return;
            }
            Ok(Err(e)) => {
                self.report_violation(&e).await;
                self.shutdown(false).await;
                return;
            }
            Ok(Ok(outcome)) => outcome,
        };

        // Incoming sessions never reconnect. Transport loss leaves
        // interrupted transfers resumable by a later session; everything
        // else marks them failed.
        let preserve_transfers = match self.run_connected(stream, outcome).await {
            Ok(()) => false,
            Err(e) if e.is_reconnectable() => {
                warn!(session = %self.id, error = %e, "Transport lost");
                true
            }
            Err(e) => {
                self.report_violation(&e).await;
                false
            }
        };
        self.shutdown(preserve_transfers).await;
    }

    /// One connected epoch: from handshake success to close or transport
    /// loss. Per-connection state does not survive this function.
    async fn run_connected(
        &mut self,
        stream: PeerStream,
        outcome: HandshakeOutcome,
    ) -> Result<()> {
        self.peer = Some(outcome.peer);
        self.emit(PeerEvent::PeerAuthenticated {
            session: self.id,
            peer: outcome.peer,
        })
        .await;
        self.set_state(SessionState::Connected).await;
        info!(session = %self.id, peer = %outcome.peer.short(), "Encrypted stream established");

        let (read_half, write_half) = stream.split();
        let mut reader: Reader =
            EncryptedReader::new(read_half, outcome.pull, self.config.max_chunk_bytes);
        reader.enable();
        let mut writer: Writer =
            EncryptedWriter::new(write_half, outcome.push, self.config.max_chunk_bytes);

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<Result<InboundChunk>>(32);
        let reader_task = tokio::spawn(async move {
            loop {
                let result = reader.read_chunk().await;
                let stop = result.is_err();
                if chunk_tx.send(result).await.is_err() || stop {
                    break;
                }
            }
        });

        let result = self.connected_loop(&mut writer, &mut chunk_rx).await;

        reader_task.abort();
        // Channels and offers are per-connection; file records keep their
        // progress for the next epoch.
        self.channels.drain();
        self.offers_out.clear();
        self.offers_in.clear();
        self.offer_acks.clear();
        self.pending_acks.clear();
        self.muted_inbound.clear();

        result
    }

    async fn connected_loop(
        &mut self,
        writer: &mut Writer,
        chunk_rx: &mut mpsc::Receiver<Result<InboundChunk>>,
    ) -> Result<()> {
        self.reoffer_active(writer).await?;

        let mut ack_sweep = tokio::time::interval(Duration::from_secs(1));
        ack_sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                maybe_cmd = self.cmd_rx.recv() => {
                    match maybe_cmd {
                        None | Some(SessionCommand::Close) => return Ok(()),
                        Some(cmd) => self.handle_command(cmd, writer).await?,
                    }
                }

                Some(job) = self.job_rx.recv() => {
                    self.handle_job(job, writer).await?;
                }

                maybe_chunk = chunk_rx.recv() => {
                    match maybe_chunk {
                        None => {
                            return Err(SessionError::Transport(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "connection closed by peer",
                            )))
                        }
                        Some(Err(e)) => return Err(e),
                        Some(Ok(chunk)) => {
                            if let Flow::Shutdown = self.handle_chunk(chunk, writer).await? {
                                return Ok(());
                            }
                        }
                    }
                }

                _ = ack_sweep.tick(), if self.config.ack_timeout.is_some()
                        && !self.pending_acks.is_empty() => {
                    self.sweep_acks().await;
                }

                _ = std::future::ready(()), if self.channels.has_ready() => {
                    self.pump_outbound(writer).await?;
                }
            }
        }
    }

    /// Wait for a Close (or a dropped handle) while disconnected. Other
    /// commands cannot be serviced without a transport and are dropped.
    async fn closed(cmd_rx: &mut mpsc::Receiver<SessionCommand>) {
        loop {
            match cmd_rx.recv().await {
                None | Some(SessionCommand::Close) => return,
                Some(cmd) => {
                    warn!(?cmd, "Dropping command while disconnected");
                }
            }
        }
    }

    /// Burn one reconnect attempt.
    async fn backoff(&mut self, reconnects: &mut u32) -> Backoff {
        *reconnects += 1;
        if *reconnects > self.config.max_reconnects {
            warn!(session = %self.id, attempts = *reconnects - 1, "Reconnect budget exhausted");
            self.set_state(SessionState::Failed).await;
            return Backoff::BudgetExhausted;
        }

        self.set_state(SessionState::ReconnectWait).await;
        debug!(
            session = %self.id,
            attempt = *reconnects,
            delay_ms = self.config.reconnect_delay.as_millis() as u64,
            "Waiting before reconnect"
        );

        tokio::select! {
            _ = tokio::time::sleep(self.config.reconnect_delay) => Backoff::Retry,
            _ = Self::closed(&mut self.cmd_rx) => Backoff::CloseRequested,
        }
    }

    // -----------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------

    async fn handle_command(&mut self, cmd: SessionCommand, writer: &mut Writer) -> Result<()> {
        match cmd {
            SessionCommand::SendMessage(message) => {
                self.send_control(ControlMessage::Message(message), writer, true)
                    .await?;
            }
            SessionCommand::SendUserInfo(info) => {
                self.send_control(ControlMessage::UserInfo(info), writer, true)
                    .await?;
            }
            SessionCommand::SendAvatar(avatar) => {
                self.send_control(ControlMessage::Avatar(avatar), writer, true)
                    .await?;
            }
            SessionCommand::OfferFile(file_id) => self.offer_file(file_id, writer).await?,
            SessionCommand::AcceptFile {
                file_id,
                dest,
                offset,
            } => self.accept_file(file_id, dest, offset, writer).await?,
            SessionCommand::RejectFile { file_id, reason } => {
                self.offers_in.remove(&file_id);
                self.set_file_state(file_id, FileState::Rejected).await?;
                self.send_control(
                    ControlMessage::RejectFile(RejectFile { file_id, reason }),
                    writer,
                    false,
                )
                .await?;
            }
            SessionCommand::AbortFile(file_id) => {
                self.close_file_channels(file_id);
                self.set_file_state(file_id, FileState::Failed).await?;
                self.send_control(
                    ControlMessage::AbortFile(AbortFile { file_id }),
                    writer,
                    false,
                )
                .await?;
            }
            SessionCommand::DisableNotifications => {
                self.notifications_disabled = true;
            }
            SessionCommand::Close => unreachable!("handled by the select loop"),
        }
        Ok(())
    }

    /// Offer a file from the store. The hash is computed on the worker pool
    /// first if the record does not carry one yet.
    async fn offer_file(&mut self, file_id: FileId, writer: &mut Writer) -> Result<()> {
        let record = match self.store.get(file_id) {
            Ok(record) => record,
            Err(nocturne_store::StoreError::NotFound(_)) => {
                warn!(session = %self.id, file = %file_id, "Offer for unknown file");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        match record.hash {
            Some(hash) => self.send_offer(file_id, hash, writer).await,
            None => {
                let job_tx = self.job_tx.clone();
                let path = record.path.clone();
                debug!(session = %self.id, file = %file_id, "Hashing file for offer");
                tokio::spawn(async move {
                    let result = hash_file(path).await;
                    let _ = job_tx.send(Job::HashReady { file_id, result }).await;
                });
                Ok(())
            }
        }
    }

    async fn handle_job(&mut self, job: Job, writer: &mut Writer) -> Result<()> {
        match job {
            Job::HashReady { file_id, result } => match result {
                Ok(hash) => {
                    match self.store.update(file_id, &mut |r| r.hash = Some(hash)) {
                        Ok(_) => {}
                        Err(nocturne_store::StoreError::NotFound(_)) => {
                            warn!(session = %self.id, file = %file_id, "Hashed file no longer in store");
                            return Ok(());
                        }
                        Err(e) => return Err(e.into()),
                    }
                    self.emit(PeerEvent::HashReady { file_id, hash }).await;
                    self.send_offer(file_id, hash, writer).await?;
                }
                Err(e) => {
                    warn!(session = %self.id, file = %file_id, error = %e, "Hash computation failed");
                    self.set_file_state(file_id, FileState::Failed).await?;
                }
            },
        }
        Ok(())
    }

    async fn send_offer(
        &mut self,
        file_id: FileId,
        hash: ContentHash,
        writer: &mut Writer,
    ) -> Result<()> {
        let record = self.store.get(file_id)?;
        let channel = self.channels.allocate_outbound();
        self.offers_out.insert(file_id, channel);

        let offer = IncomingFile {
            file_id,
            name: record.name.clone(),
            size: record.size,
            hash,
            channel,
            offset: (record.bytes_transferred > 0).then_some(record.bytes_transferred),
        };
        let request_id = self
            .send_control(ControlMessage::IncomingFile(offer), writer, false)
            .await?;
        self.offer_acks.insert(request_id, file_id);
        debug!(session = %self.id, file = %file_id, channel, request_id, "File offered");
        Ok(())
    }

    /// Application accepted an inbound offer: bind the channel and answer
    /// with the resume offset.
    async fn accept_file(
        &mut self,
        file_id: FileId,
        dest: PathBuf,
        offset: u64,
        writer: &mut Writer,
    ) -> Result<()> {
        let Some((offer, offer_request_id)) = self.offers_in.remove(&file_id) else {
            warn!(session = %self.id, file = %file_id, "Accept for unknown offer");
            return Ok(());
        };

        let record = self.store.update(file_id, &mut |r| {
            r.path = dest.clone();
            r.state = FileState::Transferring;
            r.bytes_transferred = offset;
        })?;

        match InboundFile::open(&record, &dest, offset, offer.hash, offer_request_id).await {
            Ok(file) => {
                self.channels.bind_inbound(offer.channel, file)?;
                self.emit(PeerEvent::FileStateChanged {
                    file_id,
                    state: FileState::Transferring,
                })
                .await;
                self.send_control(
                    ControlMessage::AcceptFile(AcceptFile { file_id, offset }),
                    writer,
                    false,
                )
                .await?;
            }
            Err(e) => {
                warn!(session = %self.id, file = %file_id, error = %e, "Cannot open destination");
                self.set_file_state(file_id, FileState::Failed).await?;
                self.send_control(
                    ControlMessage::RejectFile(RejectFile {
                        file_id,
                        reason: Some(e.to_string()),
                    }),
                    writer,
                    false,
                )
                .await?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Inbound chunks
    // -----------------------------------------------------------------

    async fn handle_chunk(&mut self, chunk: InboundChunk, writer: &mut Writer) -> Result<Flow> {
        if chunk.channel == CONTROL_CHANNEL {
            if chunk.is_final {
                // Stream-level half-close from the peer.
                info!(session = %self.id, "Peer closed the stream");
                return Ok(Flow::Shutdown);
            }
            self.handle_control(chunk, writer).await?;
            return Ok(Flow::Continue);
        }

        if self.muted_inbound.contains(&chunk.channel) {
            if chunk.is_final {
                self.muted_inbound.remove(&chunk.channel);
            }
            return Ok(Flow::Continue);
        }

        let Some(file) = self.channels.inbound_mut(chunk.channel) else {
            return Err(SessionError::Protocol(format!(
                "chunk for unknown channel {}",
                chunk.channel
            )));
        };
        let file_id = file.file_id;

        if let Err(e) = file.write_chunk(&chunk.payload).await {
            warn!(session = %self.id, file = %file_id, error = %e, "Write failed, aborting transfer");
            self.channels.take_inbound(chunk.channel);
            if !chunk.is_final {
                self.muted_inbound.insert(chunk.channel);
            }
            self.set_file_state(file_id, FileState::Failed).await?;
            self.send_control(
                ControlMessage::AbortFile(AbortFile { file_id }),
                writer,
                false,
            )
            .await?;
            return Ok(Flow::Continue);
        }

        let record = self.store.update(file_id, &mut |r| {
            r.add_bytes_transferred(chunk.payload.len() as u64);
        })?;
        self.progress(file_id, record.bytes_transferred, record.size)
            .await;

        if chunk.is_final {
            let file = self
                .channels
                .take_inbound(chunk.channel)
                .ok_or_else(|| SessionError::Protocol("channel vanished mid-chunk".into()))?;
            let offer_request_id = file.offer_request_id;

            match file.finish().await {
                Ok(hash) => {
                    self.store.update(file_id, &mut |r| {
                        r.state = FileState::Done;
                        r.touch_ack_time();
                    })?;
                    self.emit(PeerEvent::FileStateChanged {
                        file_id,
                        state: FileState::Done,
                    })
                    .await;
                    info!(session = %self.id, file = %file_id, hash = %hash, "File received");
                    self.send_ack(offer_request_id, AckStatus::Ok, None, writer)
                        .await?;
                }
                Err(FileError::HashMismatch) => {
                    warn!(session = %self.id, file = %file_id, "Content hash mismatch");
                    self.set_file_state(file_id, FileState::Failed).await?;
                    self.send_ack(
                        offer_request_id,
                        AckStatus::Error,
                        Some("hash-mismatch".into()),
                        writer,
                    )
                    .await?;
                }
                Err(e) => {
                    warn!(session = %self.id, file = %file_id, error = %e, "Finalize failed");
                    self.set_file_state(file_id, FileState::Failed).await?;
                    self.send_ack(
                        offer_request_id,
                        AckStatus::Error,
                        Some(e.to_string()),
                        writer,
                    )
                    .await?;
                }
            }
        }

        Ok(Flow::Continue)
    }

    async fn handle_control(&mut self, chunk: InboundChunk, writer: &mut Writer) -> Result<()> {
        let Some(message) = ControlMessage::from_bytes(&chunk.payload)? else {
            warn!(session = %self.id, "Ignoring control message of unknown type");
            return Ok(());
        };
        debug!(session = %self.id, kind = message.type_name(), request_id = chunk.request_id, "Control message");

        match message {
            ControlMessage::Message(message) => {
                self.send_ack(chunk.request_id, AckStatus::Ok, None, writer)
                    .await?;
                self.emit(PeerEvent::MessageReceived {
                    request_id: chunk.request_id,
                    message,
                })
                .await;
            }
            ControlMessage::UserInfo(info) => {
                self.send_ack(chunk.request_id, AckStatus::Ok, None, writer)
                    .await?;
                self.emit(PeerEvent::UserInfoReceived {
                    request_id: chunk.request_id,
                    info,
                })
                .await;
            }
            ControlMessage::Avatar(avatar) => {
                self.send_ack(chunk.request_id, AckStatus::Ok, None, writer)
                    .await?;
                self.emit(PeerEvent::AvatarReceived {
                    request_id: chunk.request_id,
                    avatar,
                })
                .await;
            }
            ControlMessage::Ack(ack) => self.handle_ack(ack).await?,
            ControlMessage::IncomingFile(offer) => {
                self.handle_offer(offer, chunk.request_id, writer).await?
            }
            ControlMessage::AcceptFile(accept) => self.handle_accept(accept, writer).await?,
            ControlMessage::RejectFile(reject) => {
                self.offers_out.remove(&reject.file_id);
                debug!(
                    session = %self.id,
                    file = %reject.file_id,
                    reason = reject.reason.as_deref().unwrap_or("-"),
                    "Offer rejected by peer"
                );
                self.set_file_state(reject.file_id, FileState::Rejected)
                    .await?;
            }
            ControlMessage::AbortFile(abort) => {
                self.offers_out.remove(&abort.file_id);
                self.close_file_channels(abort.file_id);
                self.set_file_state(abort.file_id, FileState::Failed)
                    .await?;
            }
        }
        Ok(())
    }

    async fn handle_ack(&mut self, ack: Ack) -> Result<()> {
        self.pending_acks.remove(&ack.ref_id);

        if let Some(file_id) = self.offer_acks.remove(&ack.ref_id) {
            // Completion report for a file we sent.
            let state = match ack.status {
                AckStatus::Ok => FileState::Done,
                AckStatus::Error => FileState::Failed,
                AckStatus::Rejected => FileState::Rejected,
            };
            self.store.update(file_id, &mut |r| {
                r.state = state;
                r.touch_ack_time();
            })?;
            self.emit(PeerEvent::FileStateChanged {
                file_id,
                state,
            })
            .await;
        }

        self.emit(PeerEvent::AckReceived(ack)).await;
        Ok(())
    }

    /// Peer offered a file. Resume silently when a matching interrupted
    /// record exists; otherwise store it and let the application decide.
    async fn handle_offer(
        &mut self,
        offer: IncomingFile,
        request_id: u64,
        writer: &mut Writer,
    ) -> Result<()> {
        if let Some(existing) = self.store.find_by_hash(self.conversation, &offer.hash)? {
            let resumable = existing.direction == FileDirection::Incoming
                && existing.state == FileState::Transferring
                && !existing.path.as_os_str().is_empty();
            if resumable {
                let offset = existing.bytes_transferred;
                info!(session = %self.id, file = %existing.id, offset, "Resuming interrupted transfer");
                let file =
                    match InboundFile::open(&existing, &existing.path, offset, offer.hash, request_id)
                        .await
                    {
                        Ok(file) => file,
                        Err(e) => {
                            warn!(session = %self.id, file = %existing.id, error = %e, "Resume failed");
                            self.set_file_state(existing.id, FileState::Failed).await?;
                            self.send_control(
                                ControlMessage::RejectFile(RejectFile {
                                    file_id: offer.file_id,
                                    reason: Some(e.to_string()),
                                }),
                                writer,
                                false,
                            )
                            .await?;
                            return Ok(());
                        }
                    };
                self.channels.bind_inbound(offer.channel, file)?;
                self.send_control(
                    ControlMessage::AcceptFile(AcceptFile {
                        file_id: offer.file_id,
                        offset,
                    }),
                    writer,
                    false,
                )
                .await?;
                return Ok(());
            }
            // A different transfer that happens to share content, or a
            // finished one offered again: fall through and treat it as new.
        }

        let mut record = nocturne_store::FileRecord::new_incoming(
            self.conversation,
            offer.name.clone(),
            offer.size,
            offer.hash,
        );
        // Ids correlate across both peers; keep the sender's.
        record.id = offer.file_id;
        let record = match self.store.insert(record.clone()) {
            Ok(()) => record,
            Err(nocturne_store::StoreError::Duplicate(_)) => {
                // Same offer again, e.g. after a reconnect before anyone
                // accepted; refresh the record and ask the application anew.
                self.store.update(offer.file_id, &mut |r| {
                    r.name = offer.name.clone();
                    r.size = offer.size;
                    r.hash = Some(offer.hash);
                    r.state = FileState::Waiting;
                })?
            }
            Err(e) => return Err(e.into()),
        };
        self.offers_in
            .insert(offer.file_id, (offer.clone(), request_id));
        self.emit(PeerEvent::FileOffered { record, offer }).await;
        Ok(())
    }

    /// Peer authorized one of our offers: start streaming from its offset.
    async fn handle_accept(&mut self, accept: AcceptFile, writer: &mut Writer) -> Result<()> {
        let Some(channel) = self.offers_out.remove(&accept.file_id) else {
            warn!(session = %self.id, file = %accept.file_id, "Accept for unknown offer");
            return Ok(());
        };

        let record = match self.store.get(accept.file_id) {
            Ok(record) => record,
            Err(nocturne_store::StoreError::NotFound(_)) => {
                warn!(session = %self.id, file = %accept.file_id, "Accept for unknown file");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if accept.offset > record.size {
            return Err(SessionError::Protocol(format!(
                "accept offset {} beyond file size {}",
                accept.offset, record.size
            )));
        }

        match OutboundFile::open(
            &record,
            channel,
            accept.offset,
            self.config.file_io_chunk_bytes,
        )
        .await
        {
            Ok(file) => {
                self.channels.start_outbound(file);
                self.store.update(accept.file_id, &mut |r| {
                    r.state = FileState::Transferring;
                    // Streaming restarts at the peer's offset; the counter
                    // stays monotone, clamped at `size`.
                    r.bytes_transferred = r.bytes_transferred.max(accept.offset);
                })?;
                self.emit(PeerEvent::FileStateChanged {
                    file_id: accept.file_id,
                    state: FileState::Transferring,
                })
                .await;
                debug!(session = %self.id, file = %accept.file_id, channel, offset = accept.offset, "Transfer started");
            }
            Err(e) => {
                warn!(session = %self.id, file = %accept.file_id, error = %e, "Cannot open source file");
                self.set_file_state(accept.file_id, FileState::Failed)
                    .await?;
                self.send_control(
                    ControlMessage::AbortFile(AbortFile {
                        file_id: accept.file_id,
                    }),
                    writer,
                    false,
                )
                .await?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Outbound file pump
    // -----------------------------------------------------------------

    /// Send one chunk from the next channel in round-robin order.
    async fn pump_outbound(&mut self, writer: &mut Writer) -> Result<()> {
        let Some(channel) = self.channels.next_ready() else {
            return Ok(());
        };
        let Some(file) = self.channels.outbound_mut(channel) else {
            return Ok(());
        };
        let file_id = file.file_id;

        let (data, is_final) = match file.next_chunk().await {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(session = %self.id, file = %file_id, error = %e, "Read failed, aborting transfer");
                self.channels.remove_outbound(channel);
                self.set_file_state(file_id, FileState::Failed).await?;
                self.send_control(
                    ControlMessage::AbortFile(AbortFile { file_id }),
                    writer,
                    false,
                )
                .await?;
                return Ok(());
            }
        };

        let request_id = self.next_request_id();
        writer
            .write_chunk(channel, request_id, &data, is_final)
            .await?;

        let record = self.store.update(file_id, &mut |r| {
            r.add_bytes_transferred(data.len() as u64);
        })?;
        self.progress(file_id, record.bytes_transferred, record.size)
            .await;

        if is_final {
            self.channels.remove_outbound(channel);
            debug!(session = %self.id, file = %file_id, "Last chunk sent, awaiting ack");
        } else {
            self.channels.requeue(channel);
        }
        Ok(())
    }

    /// Re-offer interrupted outgoing transfers after a reconnect; the peer
    /// answers with the offset it actually has.
    async fn reoffer_active(&mut self, writer: &mut Writer) -> Result<()> {
        let records = self.store.list_active()?;
        for record in records {
            let ours = record.conversation == self.conversation
                && record.direction == FileDirection::Outgoing
                && record.state == FileState::Transferring;
            if !ours {
                continue;
            }
            let Some(hash) = record.hash else { continue };
            info!(session = %self.id, file = %record.id, "Re-offering interrupted transfer");
            self.send_offer(record.id, hash, writer).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------

    async fn send_control(
        &mut self,
        message: ControlMessage,
        writer: &mut Writer,
        expects_ack: bool,
    ) -> Result<u64> {
        let request_id = self.next_request_id();
        let payload = message.to_bytes()?;
        writer
            .write_chunk(CONTROL_CHANNEL, request_id, &payload, false)
            .await?;

        if expects_ack {
            if let Some(timeout) = self.config.ack_timeout {
                self.pending_acks
                    .insert(request_id, Instant::now() + timeout);
            }
        }
        Ok(request_id)
    }

    async fn send_ack(
        &mut self,
        ref_id: u64,
        status: AckStatus,
        data: Option<String>,
        writer: &mut Writer,
    ) -> Result<()> {
        self.send_control(
            ControlMessage::Ack(Ack {
                ref_id,
                status,
                data,
            }),
            writer,
            false,
        )
        .await?;
        Ok(())
    }

    async fn sweep_acks(&mut self) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending_acks
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for request_id in expired {
            self.pending_acks.remove(&request_id);
            warn!(session = %self.id, request_id, "No ack within the configured window");
            self.emit(PeerEvent::AckTimeout { request_id }).await;
        }
    }

    fn next_request_id(&mut self) -> u64 {
        self.request_id += 1;
        self.request_id
    }

    fn close_file_channels(&mut self, file_id: FileId) {
        if let Some(channel) = self.channels.find_outbound_by_file(file_id) {
            self.channels.remove_outbound(channel);
        }
        if let Some(channel) = self.channels.find_inbound_by_file(file_id) {
            self.channels.take_inbound(channel);
            self.muted_inbound.insert(channel);
        }
        self.offers_out.remove(&file_id);
        self.offers_in.remove(&file_id);
    }

    async fn set_file_state(&mut self, file_id: FileId, state: FileState) -> Result<()> {
        match self.store.update(file_id, &mut |r| r.state = state) {
            Ok(_) => {
                self.emit(PeerEvent::FileStateChanged { file_id, state }).await;
                Ok(())
            }
            Err(nocturne_store::StoreError::NotFound(_)) => {
                warn!(session = %self.id, file = %file_id, "State change for unknown file");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn set_state(&mut self, new: SessionState) {
        if self.state == new {
            return;
        }
        let old = self.state;
        self.state = new;
        debug!(session = %self.id, ?old, ?new, "Session state changed");
        self.emit(PeerEvent::StateChanged {
            session: self.id,
            old,
            new,
        })
        .await;
    }

    async fn report_violation(&mut self, error: &SessionError) {
        warn!(session = %self.id, error = %error, "Terminal session error");
        self.emit(PeerEvent::ProtocolViolation {
            session: self.id,
            detail: error.to_string(),
        })
        .await;
    }

    async fn progress(&mut self, file_id: FileId, bytes_transferred: u64, size: u64) {
        if self.notifications_disabled {
            return;
        }
        self.emit(PeerEvent::BytesTransferred {
            file_id,
            bytes_transferred,
            size,
        })
        .await;
    }

    async fn emit(&self, event: PeerEvent) {
        // A dropped receiver only mutes events; the session itself is
        // closed through its command channel.
        let _ = self.event_tx.send(event).await;
    }

    /// Release everything and emit the final Closed event.
    ///
    /// With `preserve_transfers` (transport-type end) interrupted records
    /// stay TRANSFERRING so a later session can resume them. Otherwise
    /// they become FAILED, keeping their `bytes_transferred`.
    async fn shutdown(&mut self, preserve_transfers: bool) {
        if self.state != SessionState::Failed {
            self.set_state(SessionState::Closing).await;
        }
        self.channels.drain();

        if !preserve_transfers {
            let active = self.store.list_active().unwrap_or_default();
            for record in active {
                let ours = record.conversation == self.conversation
                    && record.state == FileState::Transferring;
                if !ours {
                    continue;
                }
                match self
                    .store
                    .update(record.id, &mut |r| r.state = FileState::Failed)
                {
                    Ok(_) => {
                        self.emit(PeerEvent::FileStateChanged {
                            file_id: record.id,
                            state: FileState::Failed,
                        })
                        .await;
                    }
                    Err(e) => {
                        warn!(session = %self.id, file = %record.id, error = %e, "Store update failed")
                    }
                }
            }
        }

        let peer = self.peer.map(|p| p.short()).unwrap_or_else(|| "-".into());
        info!(session = %self.id, peer = %peer, "Session closed");
        self.emit(PeerEvent::Closed { session: self.id }).await;
    }
}
