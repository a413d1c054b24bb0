//! Host-driven session engine: PeerSession receives events from the host, returns actions.
//!
//! The host owns the signaling peer, the data and media connections, the media devices
//! and the clock. It forwards their events to the matching `on_*` method, calls the local
//! procedures (`publish_self`, `emit`, `send_file`, `end_call`, ...) on user input, calls
//! [`PeerSession::tick`] periodically, and executes every returned [`Action`] in order.
//! Session state lives in the [`Store`]; subscribe to it to render.

use std::collections::HashMap;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::bridge::{Bridge, BridgeError, Dispatch, HandlerError};
use crate::call::{CallSession, MediaConstraints, MediaSource};
use crate::config::SessionConfig;
use crate::envelope::{self, Envelope};
use crate::identity;
use crate::liveness::{Liveness, Pulse, TypingIndicator};
use crate::protocol::{method, AckChunk, FileChunk, Message, TextEvent};
use crate::store::{CallRole, FileProgress, LogEntry, Session, Status, Store};
use crate::timer::RetrySchedule;
use crate::transfer::{AckOutcome, OutgoingTransfer, StoreOutcome, TransferError, Transfers};
use crate::wire::{self, FrameBuffer, FrameDecodeError};

/// Something the host must do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Register `self_id` with the signaling service.
    Publish { self_id: String },
    /// Destroy the signaling peer.
    DestroyPeer,
    /// Open a data connection to `peer_id`.
    Connect { peer_id: String },
    /// Refuse an inbound data connection.
    RejectConnection { peer_id: String },
    /// Send one frame over the data connection.
    SendData(Vec<u8>),
    CloseData,
    /// Acquire a local media stream and report back via `on_media_acquired`.
    AcquireMedia {
        source: MediaSource,
        constraints: MediaConstraints,
    },
    /// Call `peer_id` with the acquired local stream.
    PlaceCall { peer_id: String },
    /// Answer the offered call with the acquired local stream.
    AnswerCall,
    /// Refuse an offered call.
    RejectCall,
    StopLocalTracks,
    CloseMedia,
    /// An inbound file finished; `bytes` is the full reassembled file.
    FileReceived {
        file_id: String,
        file_name: String,
        bytes: Bytes,
    },
}

/// Result of publishing the self id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Connected,
    AlreadyTaken,
    Error(String),
}

/// Connectivity state reported by a data or media connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("bad frame: {0}")]
    Frame(#[from] FrameDecodeError),
}

/// State the bridge handlers work on.
struct Context {
    config: SessionConfig,
    schedule: RetrySchedule,
    store: Store,
    transfers: Transfers,
    typing: TypingIndicator,
    call: Option<CallSession>,
    actions: Vec<Action>,
    /// Chunks to send once the current event is handled, as `(file_id, index)`.
    queued_chunks: Vec<(String, u32)>,
    /// Request ids of every send of a not yet acknowledged chunk.
    chunk_calls: HashMap<(String, u32), Vec<String>>,
    /// Calls whose chunk was acknowledged through another send; no longer awaited.
    stale_calls: Vec<String>,
    now: u64,
}

impl Context {
    fn status(&self) -> Status {
        self.store.borrow().status
    }

    fn show_progress(&self, file_id: &str, progress: FileProgress) {
        self.store.set(|s| {
            s.file_progress.insert(file_id.to_owned(), progress);
        });
    }

    fn on_text(&mut self, event: TextEvent) {
        self.typing.reset();
        self.store.set(|s| {
            s.is_peer_typing = false;
            s.msgs.push(LogEntry::Text {
                sender_id: event.sender_id,
                created_at: event.created_at,
                msg: event.msg,
            });
        });
    }

    fn on_typing(&mut self) {
        self.typing.notify(self.now);
        self.store.set(|s| s.is_peer_typing = true);
    }

    /// Store one inbound chunk and build its acknowledgement.
    fn on_chunk(&mut self, chunk: FileChunk) -> Result<AckChunk, TransferError> {
        let now = self.now;
        let (transfer, created) = self
            .transfers
            .incoming_for(&chunk, self.config.progress_interval_ms)?;
        let outcome = transfer.store(chunk.chunk_index, chunk.chunk.clone(), now)?;
        let ack = transfer.ack(chunk.chunk_index);
        let progress = match outcome {
            StoreOutcome::Duplicate => None,
            _ => transfer.offer_progress(now),
        };
        let finished = match outcome {
            StoreOutcome::Completed => transfer.assemble(),
            _ => None,
        };
        debug!(
            file_id = %chunk.file_id,
            chunk = chunk.chunk_index,
            received = ack.bytes_received,
            total = chunk.total_bytes,
            "chunk received"
        );
        if created {
            info!(file_id = %chunk.file_id, name = %chunk.file_name, "incoming file");
            self.store.set(|s| {
                s.msgs.push(LogEntry::File {
                    sender_id: chunk.sender_id.clone(),
                    created_at: chunk.created_at,
                    file_id: chunk.file_id.clone(),
                    file_name: chunk.file_name.clone(),
                    total_bytes: chunk.total_bytes,
                })
            });
        }
        if let Some(p) = progress {
            self.show_progress(&chunk.file_id, p);
        }
        if let Some(bytes) = finished {
            info!(file_id = %chunk.file_id, bytes = bytes.len(), "file received");
            self.actions.push(Action::FileReceived {
                file_id: chunk.file_id,
                file_name: chunk.file_name,
                bytes,
            });
        }
        Ok(ack)
    }

    fn on_ack(&mut self, ack: AckChunk) -> Result<(), TransferError> {
        let now = self.now;
        let Some(transfer) = self.transfers.outgoing_mut(&ack.file_id) else {
            error!(file_id = %ack.file_id, "acknowledgement for unknown transfer");
            return Err(TransferError::UnknownTransfer(ack.file_id));
        };
        let outcome = transfer.on_ack(ack.chunk_index_received, ack.bytes_received, now);
        if let Some(ids) = self
            .chunk_calls
            .remove(&(ack.file_id.clone(), ack.chunk_index_received))
        {
            self.stale_calls.extend(ids);
        }
        let progress = match outcome {
            AckOutcome::Duplicate => None,
            _ => transfer.offer_progress(now),
        };
        match outcome {
            AckOutcome::Next(index) => self.queued_chunks.push((ack.file_id.clone(), index)),
            AckOutcome::Done => info!(file_id = %ack.file_id, "file sent"),
            AckOutcome::Waiting => {}
            AckOutcome::Duplicate => {
                debug!(file_id = %ack.file_id, chunk = ack.chunk_index_received, "duplicate ack")
            }
        }
        if let Some(p) = progress {
            self.show_progress(&ack.file_id, p);
        }
        Ok(())
    }

    /// Release everything the current call holds and fall back to `Connected`.
    /// Returns false when there was no call.
    fn teardown_call(&mut self) -> bool {
        let Some(call) = self.call.take() else {
            return false;
        };
        if call.local_stream {
            self.actions.push(Action::StopLocalTracks);
        }
        if call.media_connection {
            self.actions.push(Action::CloseMedia);
        }
        self.store.set(|s| {
            if s.status.in_call() {
                s.status = Status::Connected;
            }
            s.call_role = None;
        });
        info!("call ended");
        true
    }
}

fn malformed(method: &str) -> HandlerError {
    format!("malformed {method} payload").into()
}

fn register_handlers(bridge: &mut Bridge<Context>) {
    bridge.register_notification(method::TEXT, |ctx: &mut Context, data, _| match data {
        Some(Message::Text(event)) => {
            ctx.on_text(event);
            Ok(())
        }
        _ => Err(malformed(method::TEXT)),
    });
    bridge.register(method::FILE_CHUNK, |ctx: &mut Context, data, _| match data {
        Some(Message::FileChunk(chunk)) => Ok(Some(Message::AckChunk(ctx.on_chunk(chunk)?))),
        _ => Err(malformed(method::FILE_CHUNK)),
    });
    bridge.register_notification(method::ACK_CHUNK, |ctx: &mut Context, data, _| match data {
        Some(Message::AckChunk(ack)) => Ok(ctx.on_ack(ack)?),
        _ => Err(malformed(method::ACK_CHUNK)),
    });
    bridge.register_notification(method::TYPING, |ctx: &mut Context, _, _| {
        ctx.on_typing();
        Ok(())
    });
    bridge.register_notification(method::HEARTBEAT, |_: &mut Context, _, _| Ok(()));
    bridge.register_notification(method::END_CALL, |ctx: &mut Context, _, meta: &Envelope| {
        if ctx.teardown_call() {
            info!(from = %meta.from_client_id, "peer hung up");
        }
        Ok(())
    });
}

/// One peer session: identity, data connection, calls and file transfers.
pub struct PeerSession {
    bridge: Bridge<Context>,
    ctx: Context,
    liveness: Liveness,
    /// Partial frames received so far.
    inbound: FrameBuffer,
    /// Peer to connect to as soon as the identity is published.
    auto_connect: Option<String>,
}

impl PeerSession {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_session(config, Session::initial())
    }

    /// Start with a specific self id (sanitized).
    pub fn with_self_id(config: SessionConfig, self_id: &str) -> Self {
        Self::with_session(config, Session::with_self_id(identity::sanitize_id(self_id)))
    }

    fn with_session(config: SessionConfig, session: Session) -> Self {
        let mut bridge = Bridge::new(envelope::new_id());
        register_handlers(&mut bridge);
        let ctx = Context {
            schedule: RetrySchedule::new(config.retry_delays_ms.clone()),
            store: Store::new(session),
            transfers: Transfers::new(config.max_active_transfers, config.transfer_grace_ms),
            typing: TypingIndicator::new(config.typing_timeout_ms),
            call: None,
            actions: Vec::new(),
            queued_chunks: Vec::new(),
            chunk_calls: HashMap::new(),
            stale_calls: Vec::new(),
            now: 0,
            config,
        };
        let liveness = Liveness::new(
            ctx.config.heartbeat_interval_ms,
            ctx.config.liveness_timeout_ms,
        );
        Self {
            bridge,
            ctx,
            liveness,
            inbound: FrameBuffer::new(),
            auto_connect: None,
        }
    }

    pub fn store(&self) -> &Store {
        &self.ctx.store
    }

    pub fn snapshot(&self) -> Session {
        self.ctx.store.get()
    }

    pub fn status(&self) -> Status {
        self.ctx.status()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.ctx.config
    }

    pub fn transfers(&self) -> &Transfers {
        &self.ctx.transfers
    }

    /// Reassembled bytes of a finished inbound file, while it is retained.
    pub fn download(&self, file_id: &str) -> Option<Bytes> {
        self.ctx.transfers.incoming(file_id)?.assemble()
    }

    /// Calls still waiting for the peer's response.
    pub fn pending_calls(&self) -> usize {
        self.bridge.pending_count()
    }

    /// Edit the self id. Ignored once publishing has started.
    pub fn set_self_id(&mut self, raw: &str) {
        if self.status() != Status::EnteringSelfId {
            return;
        }
        let id = identity::sanitize_id(raw);
        self.ctx.store.set(|s| s.self_id = id);
    }

    pub fn set_peer_id(&mut self, raw: &str) {
        let id = identity::sanitize_id(raw);
        self.ctx.store.set(|s| s.peer_id = id);
    }

    /// Edit the text being typed. While connected this is the keystroke that tells the
    /// peer we are typing.
    pub fn set_draft(&mut self, text: &str, now: u64) -> Result<Vec<Action>, SessionError> {
        self.ctx.store.set(|s| s.draft = text.to_owned());
        if self.status().has_peer() && !text.is_empty() {
            self.bridge.notify(Message::Typing, now)?;
        }
        Ok(self.finish())
    }

    /// Publish the self id. An empty id keeps the session where it is.
    pub fn publish_self(&mut self) -> Vec<Action> {
        let session = self.snapshot();
        if session.status != Status::EnteringSelfId {
            return vec![];
        }
        if session.self_id.is_empty() {
            warn!("cannot publish an empty id");
            self.ctx
                .store
                .set(|s| s.notice = Some("enter an id first".to_owned()));
            return vec![];
        }
        info!(self_id = %session.self_id, "publishing identity");
        self.ctx.store.set(|s| {
            s.status = Status::PublishingSelf;
            s.notice = None;
        });
        vec![Action::Publish {
            self_id: session.self_id,
        }]
    }

    /// Connect to `raw` as soon as possible: now if awaiting a peer, otherwise right after
    /// the identity is published.
    pub fn auto_connect(&mut self, raw: &str) -> Vec<Action> {
        let peer = identity::sanitize_id(raw);
        if peer.is_empty() {
            return vec![];
        }
        self.set_peer_id(&peer);
        if self.status() == Status::AwaitingPeer {
            return self.connect_peer();
        }
        self.auto_connect = Some(peer);
        vec![]
    }

    pub fn connect_peer(&mut self) -> Vec<Action> {
        let session = self.snapshot();
        if session.status != Status::AwaitingPeer {
            return vec![];
        }
        if session.peer_id.is_empty() || session.peer_id == session.self_id {
            warn!(peer_id = %session.peer_id, "refusing to connect");
            self.ctx
                .store
                .set(|s| s.notice = Some("enter the id of another peer".to_owned()));
            return vec![];
        }
        info!(peer_id = %session.peer_id, "connecting");
        self.auto_connect = None;
        self.ctx.store.set(|s| {
            s.status = Status::ConnectingPeer;
            s.notice = None;
        });
        vec![Action::Connect {
            peer_id: session.peer_id,
        }]
    }

    /// Send the draft as a text event. An empty draft does nothing.
    pub fn emit(&mut self, now: u64) -> Result<Vec<Action>, SessionError> {
        let session = self.snapshot();
        if session.draft.is_empty() {
            return Ok(vec![]);
        }
        let event = TextEvent {
            sender_id: session.self_id,
            created_at: now,
            msg: session.draft,
        };
        self.bridge.notify(Message::Text(event.clone()), now)?;
        self.ctx.store.set(|s| {
            s.draft.clear();
            s.msgs.push(LogEntry::Text {
                sender_id: event.sender_id,
                created_at: event.created_at,
                msg: event.msg,
            });
        });
        Ok(self.finish())
    }

    /// Start sending a file. Returns its id; chunk 0 is among the returned actions.
    pub fn send_file(
        &mut self,
        file_name: &str,
        blob: Bytes,
        now: u64,
    ) -> Result<(String, Vec<Action>), SessionError> {
        if !self.bridge.is_attached() {
            return Err(BridgeError::NotAttached.into());
        }
        let self_id = self.snapshot().self_id;
        let mut created_at = now;
        let mut file_id = format!("{self_id}-{created_at}");
        while self.ctx.transfers.contains(&file_id) {
            created_at += 1;
            file_id = format!("{self_id}-{created_at}");
        }
        let total_bytes = blob.len() as u64;
        let transfer = OutgoingTransfer::new(
            file_id.clone(),
            file_name.to_owned(),
            self_id.clone(),
            created_at,
            blob,
            self.ctx.config.chunk_size,
            self.ctx.config.progress_interval_ms,
        )?;
        let first = transfer.next_pending();
        self.ctx.transfers.insert_outgoing(transfer)?;
        info!(file_id = %file_id, name = %file_name, bytes = total_bytes, "sending file");
        self.ctx.store.set(|s| {
            s.msgs.push(LogEntry::File {
                sender_id: self_id,
                created_at,
                file_id: file_id.clone(),
                file_name: file_name.to_owned(),
                total_bytes,
            });
        });
        if let Some(progress) = self
            .ctx
            .transfers
            .outgoing_mut(&file_id)
            .and_then(|t| t.offer_progress(now))
        {
            self.ctx.show_progress(&file_id, progress);
        }
        if let Some(index) = first {
            self.send_chunk(&file_id, index, now)?;
        }
        Ok((file_id, self.finish()))
    }

    /// Begin placing a call: pick media next.
    pub fn request_call(&mut self) -> Vec<Action> {
        if self.status() != Status::Connected {
            return vec![];
        }
        self.ctx.call = Some(CallSession::requested());
        self.ctx.store.set(|s| {
            s.status = Status::SelectMedia;
            s.call_role = Some(CallRole::Requestor);
            s.notice = None;
        });
        vec![]
    }

    /// The user picked a media source (or cancelled) while in `SelectMedia`.
    pub fn select_media(&mut self, source: MediaSource) -> Vec<Action> {
        if self.status() != Status::SelectMedia {
            return vec![];
        }
        match source.constraints() {
            Some(constraints) => vec![Action::AcquireMedia {
                source,
                constraints,
            }],
            None => self.abandon_call(),
        }
    }

    /// Give up on a call before it was placed or answered. The peer never learned of a
    /// call we requested; one offered to us is refused.
    fn abandon_call(&mut self) -> Vec<Action> {
        let Some(call) = self.ctx.call.as_mut() else {
            return vec![];
        };
        let grantor = call.role == CallRole::Grantor;
        // A refused offer is closed by RejectCall, not CloseMedia.
        call.media_connection = false;
        self.ctx.teardown_call();
        if grantor {
            self.ctx.actions.push(Action::RejectCall);
        }
        self.finish()
    }

    /// Hang up locally. A no-op when there is no call.
    pub fn end_call(&mut self, now: u64) -> Vec<Action> {
        if !self.ctx.teardown_call() {
            return vec![];
        }
        if let Err(e) = self.bridge.notify(Message::EndCall, now) {
            error!(error = %e, "could not signal hangup");
        }
        self.finish()
    }

    /// Leave the current peer and go back to choosing one. The identity stays published.
    pub fn back_to_peer_selection(&mut self) -> Vec<Action> {
        let mut actions = self.drop_peer(None);
        let session = self.snapshot();
        if matches!(
            session.status,
            Status::EnteringSelfId | Status::PublishingSelf
        ) {
            return actions;
        }
        self.auto_connect = None;
        let mut next = Session::with_self_id(session.self_id);
        next.status = Status::AwaitingPeer;
        self.ctx.store.reset(next);
        actions.extend(self.finish());
        actions
    }

    /// Tear everything down and reset to initial values.
    pub fn dispose(&mut self) -> Vec<Action> {
        if self.status() == Status::EnteringSelfId {
            return vec![];
        }
        let mut actions = self.drop_peer(None);
        actions.push(Action::DestroyPeer);
        self.auto_connect = None;
        self.ctx.store.reset(Session::initial());
        info!("session disposed");
        actions
    }

    pub fn on_published(&mut self, outcome: PublishOutcome) -> Vec<Action> {
        if self.status() != Status::PublishingSelf {
            return vec![];
        }
        match outcome {
            PublishOutcome::Connected => {
                info!("identity published");
                self.ctx.store.set(|s| s.status = Status::AwaitingPeer);
                match self.auto_connect.take() {
                    Some(peer) => {
                        self.set_peer_id(&peer);
                        self.connect_peer()
                    }
                    None => vec![],
                }
            }
            PublishOutcome::AlreadyTaken => {
                warn!("identity already taken");
                self.ctx.store.set(|s| {
                    s.status = Status::EnteringSelfId;
                    s.notice = Some(format!("{} is already taken", s.self_id));
                });
                vec![Action::DestroyPeer]
            }
            PublishOutcome::Error(e) => self.on_provider_error(&e),
        }
    }

    /// Fatal signaling error: back to entering an id, from any state.
    pub fn on_provider_error(&mut self, message: &str) -> Vec<Action> {
        warn!(error = %message, "identity provider failed");
        let mut actions = self.drop_peer(None);
        let self_id = self.snapshot().self_id;
        let mut next = Session::with_self_id(self_id);
        next.notice = Some(message.to_owned());
        self.ctx.store.reset(next);
        actions.push(Action::DestroyPeer);
        actions
    }

    pub fn on_incoming_connection(&mut self, raw_peer: &str, now: u64) -> Vec<Action> {
        let peer_id = identity::sanitize_id(raw_peer);
        if self.status() != Status::AwaitingPeer {
            warn!(peer_id = %peer_id, "rejecting connection, already busy");
            return vec![Action::RejectConnection { peer_id }];
        }
        info!(peer_id = %peer_id, "peer connected to us");
        self.open_data(now);
        self.ctx.store.set(|s| {
            s.status = Status::Connected;
            s.peer_id = peer_id;
            s.notice = None;
        });
        vec![]
    }

    pub fn on_connection_open(&mut self, now: u64) -> Vec<Action> {
        if self.status() != Status::ConnectingPeer {
            return vec![];
        }
        info!("connected to peer");
        self.open_data(now);
        self.ctx.store.set(|s| s.status = Status::Connected);
        vec![]
    }

    pub fn on_connection_closed(&mut self) -> Vec<Action> {
        self.drop_peer(None)
    }

    pub fn on_connection_error(&mut self, message: &str) -> Vec<Action> {
        warn!(error = %message, "data connection failed");
        self.drop_peer(Some(message.to_owned()))
    }

    pub fn on_connection_ice(&mut self, state: IceState) -> Vec<Action> {
        match state {
            IceState::Failed | IceState::Closed => {
                warn!(?state, "data connection lost");
                self.drop_peer(Some("connection lost".to_owned()))
            }
            _ => vec![],
        }
    }

    /// Bytes arrived on the data connection: whole frames or any split of the stream.
    ///
    /// Processing stops at the first error. Actions produced before it, and frames still
    /// buffered behind it, come out of the next call.
    pub fn on_data(&mut self, bytes: &[u8], now: u64) -> Result<Vec<Action>, SessionError> {
        if !self.status().has_peer() {
            debug!("ignoring data without a peer");
            return Ok(vec![]);
        }
        self.inbound.push(bytes);
        self.ctx.now = now;
        while let Some(envelope) = self.inbound.next_envelope()? {
            self.liveness.touch(now);
            let dispatch = self.bridge.receive(envelope, &mut self.ctx, now)?;
            if let Dispatch::Resolved { method, data, .. } = dispatch {
                if method == method::FILE_CHUNK {
                    match data {
                        Some(Message::AckChunk(ack)) => self.ctx.on_ack(ack)?,
                        _ => warn!("file chunk answered without an acknowledgement"),
                    }
                }
            }
            for request_id in std::mem::take(&mut self.ctx.stale_calls) {
                self.bridge.forget(&request_id);
            }
            self.send_queued_chunks(now)?;
        }
        Ok(self.finish())
    }

    pub fn on_incoming_call(&mut self, raw_peer: &str) -> Vec<Action> {
        let peer_id = identity::sanitize_id(raw_peer);
        let session = self.snapshot();
        if session.status != Status::Connected || session.peer_id != peer_id {
            warn!(peer_id = %peer_id, "rejecting call");
            return vec![Action::RejectCall];
        }
        info!(peer_id = %peer_id, "incoming call");
        self.ctx.call = Some(CallSession::offered());
        self.ctx.store.set(|s| {
            s.status = Status::SelectMedia;
            s.call_role = Some(CallRole::Grantor);
        });
        vec![]
    }

    /// Result of an `AcquireMedia` action.
    pub fn on_media_acquired(&mut self, result: Result<(), String>) -> Vec<Action> {
        if self.status() != Status::SelectMedia {
            // The call went away while the device prompt was open.
            return match result {
                Ok(()) => vec![Action::StopLocalTracks],
                Err(_) => vec![],
            };
        }
        let Some(call) = self.ctx.call.as_mut() else {
            return vec![];
        };
        match result {
            Ok(()) => {
                let role = call.role;
                call.local_stream = true;
                if role == CallRole::Requestor {
                    call.media_connection = true;
                }
                match role {
                    CallRole::Requestor => {
                        let peer_id = self.snapshot().peer_id;
                        info!(peer_id = %peer_id, "placing call");
                        self.ctx.store.set(|s| s.status = Status::CallingPeer);
                        vec![Action::PlaceCall { peer_id }]
                    }
                    CallRole::Grantor => {
                        info!("answering call");
                        self.ctx.store.set(|s| s.status = Status::Answering);
                        vec![Action::AnswerCall]
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "media unavailable, abandoning call");
                self.ctx
                    .store
                    .set(|s| s.notice = Some(format!("could not access media: {e}")));
                self.abandon_call()
            }
        }
    }

    pub fn on_remote_stream(&mut self) -> Vec<Action> {
        if !matches!(self.status(), Status::CallingPeer | Status::Answering) {
            return vec![];
        }
        if let Some(call) = self.ctx.call.as_mut() {
            call.remote_stream = true;
        }
        info!("call connected");
        self.ctx.store.set(|s| s.status = Status::CallConnected);
        vec![]
    }

    /// The media connection closed (usually the peer hung up).
    pub fn on_media_closed(&mut self) -> Vec<Action> {
        if let Some(call) = self.ctx.call.as_mut() {
            call.media_connection = false;
        }
        self.ctx.teardown_call();
        self.finish()
    }

    pub fn on_media_error(&mut self, message: &str, now: u64) -> Vec<Action> {
        warn!(error = %message, "media connection failed");
        self.end_call(now)
    }

    pub fn on_media_ice(&mut self, state: IceState, now: u64) -> Vec<Action> {
        match state {
            IceState::Failed | IceState::Closed => self.end_call(now),
            _ => vec![],
        }
    }

    /// The page went to the background.
    pub fn on_visibility_hidden(&mut self, now: u64) -> Vec<Action> {
        if self.status() != Status::CallConnected {
            return vec![];
        }
        self.end_call(now)
    }

    /// Drive timers: heartbeat and liveness, typing expiry, chunk retries, throttled
    /// progress and eviction of finished transfers.
    pub fn tick(&mut self, now: u64) -> Result<Vec<Action>, SessionError> {
        self.ctx.now = now;
        match self.liveness.poll(now) {
            Pulse::Expired => {
                warn!("peer went silent, dropping connection");
                return Ok(self.drop_peer(Some("peer stopped responding".to_owned())));
            }
            Pulse::SendHeartbeat => {
                self.bridge.notify(Message::Heartbeat, now)?;
            }
            Pulse::Idle => {}
        }
        if self.ctx.typing.expired(now) {
            self.ctx.store.set(|s| s.is_peer_typing = false);
        }
        for (file_id, index) in self.ctx.transfers.due_retries(now, &self.ctx.schedule) {
            debug!(file_id = %file_id, chunk = index, "resending unacknowledged chunk");
            self.send_chunk(&file_id, index, now)?;
        }
        for (file_id, progress) in self.ctx.transfers.flush_progress(now) {
            self.ctx.show_progress(&file_id, progress);
        }
        for file_id in self.ctx.transfers.evict_finished(now) {
            debug!(file_id = %file_id, "evicted finished transfer");
        }
        Ok(self.finish())
    }

    fn open_data(&mut self, now: u64) {
        self.bridge.attach();
        self.liveness.start(now);
    }

    /// Close the data connection and everything riding on it; back to `AwaitingPeer`
    /// with the message log cleared. A no-op without a connection.
    fn drop_peer(&mut self, notice: Option<String>) -> Vec<Action> {
        let status = self.status();
        if !status.has_peer() && status != Status::ConnectingPeer {
            return vec![];
        }
        self.ctx.teardown_call();
        self.bridge.detach();
        self.liveness.stop();
        self.inbound.clear();
        self.ctx.transfers.clear();
        self.ctx.typing.reset();
        self.ctx.queued_chunks.clear();
        self.ctx.chunk_calls.clear();
        self.ctx.stale_calls.clear();
        self.ctx.actions.push(Action::CloseData);
        self.ctx.store.set(|s| {
            s.status = Status::AwaitingPeer;
            s.peer_id.clear();
            s.msgs.clear();
            s.file_progress.clear();
            s.is_peer_typing = false;
            s.call_role = None;
            s.notice = notice;
        });
        info!("peer dropped");
        self.finish()
    }

    fn send_chunk(&mut self, file_id: &str, index: u32, now: u64) -> Result<(), SessionError> {
        let transfer = self
            .ctx
            .transfers
            .outgoing_mut(file_id)
            .ok_or_else(|| TransferError::UnknownTransfer(file_id.to_owned()))?;
        let chunk = transfer
            .chunk_message(index)
            .ok_or_else(|| TransferError::ChunkOutOfRange {
                file_id: file_id.to_owned(),
                index,
                total: transfer.total_chunks(),
            })?;
        let request_id = self.bridge.send(Message::FileChunk(chunk), now)?;
        transfer.mark_sent(index, now, &self.ctx.schedule);
        self.ctx
            .chunk_calls
            .entry((file_id.to_owned(), index))
            .or_default()
            .push(request_id);
        debug!(file_id = %file_id, chunk = index, "chunk sent");
        Ok(())
    }

    fn send_queued_chunks(&mut self, now: u64) -> Result<(), SessionError> {
        for (file_id, index) in std::mem::take(&mut self.ctx.queued_chunks) {
            self.send_chunk(&file_id, index, now)?;
        }
        Ok(())
    }

    /// Collect pending actions followed by encoded outgoing frames.
    fn finish(&mut self) -> Vec<Action> {
        let mut actions = std::mem::take(&mut self.ctx.actions);
        for envelope in self.bridge.take_outgoing() {
            match wire::encode_frame(&envelope) {
                Ok(frame) => actions.push(Action::SendData(frame)),
                Err(e) => error!(method = %envelope.method, error = %e, "dropping envelope"),
            }
        }
        actions
    }
}
