use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use threadline_types::api::ThreadResponse;
use threadline_types::events::{ClientFrame, ServerFrame};
use threadline_types::models::{Message, MessageId, ThreadId};

use crate::api::ThreadApi;
use crate::backoff::{ConnectionState, Reconnector, RetryDecision};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::identity::Identity;
use crate::presence::PresenceTracker;
use crate::receipts::ReadReceiptBatcher;
use crate::timeline::Timeline;
use crate::transport::{Connector, SocketEvent, SocketPair, redact_token};
use crate::typing::{TypingThrottle, TypingTracker};

/// Capacity of the inbound frame fan-out. Slow subscribers lag rather than
/// stall the session.
const FRAME_FANOUT_CAPACITY: usize = 256;

/// Shown when retries are exhausted.
pub const CONNECTION_LOST: &str = "Connection lost. Please reconnect.";

/// Shown when the server refuses our token.
pub const AUTH_REJECTED: &str = "Authentication rejected. Please sign in again.";

/// Immutable snapshot of a thread session, published after every event.
#[derive(Debug, Clone)]
pub struct ThreadView {
    pub thread_id: ThreadId,
    pub state: ConnectionState,
    pub messages: Arc<Vec<Message>>,
    pub online: Vec<String>,
    pub typing: Vec<String>,
    pub unread: usize,
    pub pending_reads: usize,
    /// Persistent user-visible failure notice, set once the session fails.
    pub error: Option<String>,
}

enum Command {
    Send {
        frame: ClientFrame,
        reply: oneshot::Sender<Result<()>>,
    },
    Typing {
        reply: oneshot::Sender<Result<bool>>,
    },
    Visible(MessageId),
    PageVisibility(bool),
    FlushReads,
    ReconcileAllRead {
        reply: oneshot::Sender<usize>,
    },
    Reconnect,
}

/// Entry point for opening a live thread session.
pub struct ThreadSession;

impl ThreadSession {
    /// Seed a session from the loaded thread and start connecting.
    ///
    /// Spawns the session task on the current tokio runtime. Every message in
    /// `seed` counts as pre-existing history and is never auto-marked read.
    pub fn open<C: Connector>(
        config: SyncConfig,
        connector: Arc<C>,
        seed: ThreadResponse,
        token: &str,
        identity: Identity,
    ) -> Result<SessionHandle> {
        let thread_id = seed.id;
        let url = config.socket_url(thread_id, token)?;

        let timeline = Timeline::seed(seed.messages);
        let receipts = ReadReceiptBatcher::new(
            identity.username.clone(),
            timeline.ids(),
            config.read_debounce,
        );

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (frames, _) = broadcast::channel(FRAME_FANOUT_CAPACITY);
        let cancel = CancellationToken::new();

        let mut actor = SessionActor {
            thread_id,
            url,
            connector,
            state: ConnectionState::Connecting,
            reconnector: Reconnector::new(config.reconnect),
            retry_at: None,
            connecting: None,
            socket: None,
            presence: PresenceTracker::new(),
            typing: TypingTracker::new(config.typing_ttl),
            typing_throttle: TypingThrottle::new(config.typing_throttle),
            timeline,
            receipts,
            identity,
            error: None,
            frames: frames.clone(),
            view: watch::Sender::new(Arc::new(ThreadView {
                thread_id,
                state: ConnectionState::Connecting,
                messages: Arc::new(Vec::new()),
                online: Vec::new(),
                typing: Vec::new(),
                unread: 0,
                pending_reads: 0,
                error: None,
            })),
        };
        actor.publish();
        let view = actor.view.subscribe();

        if actor.timeline.is_empty() {
            info!("opening thread {} as {} (no history)", thread_id, actor.identity.username);
        } else {
            info!(
                "opening thread {} as {} ({} messages in history)",
                thread_id,
                actor.identity.username,
                actor.timeline.len()
            );
        }
        let task = tokio::spawn(actor.run(commands, cancel.clone()));

        Ok(SessionHandle {
            thread_id,
            commands: commands_tx,
            frames,
            view,
            cancel,
            task: Some(task),
        })
    }
}

/// Caller-side handle to a running thread session. Dropping it tears the
/// session down.
pub struct SessionHandle {
    thread_id: ThreadId,
    commands: mpsc::UnboundedSender<Command>,
    frames: broadcast::Sender<ServerFrame>,
    view: watch::Receiver<Arc<ThreadView>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Send an outbound frame. Fails with `InvalidSend` unless the socket is
    /// open; nothing is queued.
    pub async fn send(&self, frame: ClientFrame) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Send { frame, reply })?;
        rx.await.map_err(|_| SyncError::SessionClosed)?
    }

    /// Fails with `EmptyMessage` for blank or whitespace-only content.
    pub async fn send_text(&self, content: impl Into<String>) -> Result<()> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        self.send(ClientFrame::Text { content }).await
    }

    pub async fn send_structured(&self, structured: Map<String, Value>) -> Result<()> {
        if structured.is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        self.send(ClientFrame::Structured { structured }).await
    }

    /// Report a local input change. Returns whether a typing frame went out
    /// (false when throttled).
    pub async fn notify_typing(&self) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Typing { reply })?;
        rx.await.map_err(|_| SyncError::SessionClosed)?
    }

    /// A rendered message crossed the visibility threshold.
    pub fn element_became_visible(&self, id: MessageId) -> Result<()> {
        self.command(Command::Visible(id))
    }

    /// The page/tab was hidden or shown. Showing it flushes pending receipts.
    pub fn page_visibility_changed(&self, visible: bool) -> Result<()> {
        self.command(Command::PageVisibility(visible))
    }

    /// Flush pending read receipts now instead of waiting out the debounce.
    pub fn flush_reads(&self) -> Result<()> {
        self.command(Command::FlushReads)
    }

    /// Bring local state in line after a successful bulk "mark all read".
    /// Returns how many messages were newly marked.
    pub async fn reconcile_all_read(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::ReconcileAllRead { reply })?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }

    /// Mark the whole thread read through the REST API, then reconcile.
    pub async fn mark_all_read(&self, api: &ThreadApi) -> Result<usize> {
        api.mark_all_read(self.thread_id).await?;
        self.reconcile_all_read().await
    }

    /// Start over after the session reached `Failed`.
    pub fn reconnect(&self) -> Result<()> {
        self.command(Command::Reconnect)
    }

    /// Subscribe to inbound frames after the session applied them. A redelivered
    /// `message` frame is not fanned out again. Render from [`SessionHandle::view`],
    /// which holds the ordered log.
    pub fn frames(&self) -> broadcast::Receiver<ServerFrame> {
        self.frames.subscribe()
    }

    pub fn view(&self) -> watch::Receiver<Arc<ThreadView>> {
        self.view.clone()
    }

    pub fn current(&self) -> Arc<ThreadView> {
        self.view.borrow().clone()
    }

    /// Flush pending receipts, close the socket and cancel every timer.
    /// Returns once the session task has finished.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("thread {} session task ended abnormally: {}", self.thread_id, e);
            }
        }
    }

    fn command(&self, cmd: Command) -> Result<()> {
        self.commands.send(cmd).map_err(|_| SyncError::SessionClosed)
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Owns all state of one thread session. Runs as a single task, so every
/// inbound frame, command and timer is handled in order.
struct SessionActor<C> {
    thread_id: ThreadId,
    url: Url,
    connector: Arc<C>,

    state: ConnectionState,
    reconnector: Reconnector,
    retry_at: Option<Instant>,
    connecting: Option<JoinHandle<Result<SocketPair>>>,
    socket: Option<SocketPair>,

    timeline: Timeline,
    presence: PresenceTracker,
    typing: TypingTracker,
    typing_throttle: TypingThrottle,
    receipts: ReadReceiptBatcher,

    identity: Identity,
    error: Option<String>,

    frames: broadcast::Sender<ServerFrame>,
    view: watch::Sender<Arc<ThreadView>>,
}

impl<C: Connector> SessionActor<C> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, cancel: CancellationToken) {
        self.start_connect();
        self.publish();

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                result = connect_outcome(&mut self.connecting) => {
                    self.connecting = None;
                    self.on_connect_result(result);
                }
                event = next_socket_event(&mut self.socket) => self.on_socket_event(event),
                _ = sleep_until_deadline(deadline) => self.on_timer(Instant::now()),
            }
            self.publish();
        }

        // Commands issued before close still count, e.g. a last visibility signal.
        while let Ok(cmd) = commands.try_recv() {
            self.handle_command(cmd);
        }
        self.shutdown();
    }

    // -- Connection lifecycle --

    fn start_connect(&mut self) {
        self.state = ConnectionState::Connecting;
        self.retry_at = None;
        let connector = Arc::clone(&self.connector);
        let url = self.url.clone();
        debug!("thread {} connecting to {}", self.thread_id, redact_token(&url));
        self.connecting = Some(tokio::spawn(async move { connector.connect(url).await }));
    }

    fn on_connect_result(&mut self, result: Result<SocketPair>) {
        match result {
            Ok(socket) => {
                self.socket = Some(socket);
                self.state = ConnectionState::Open;
                self.reconnector.on_open();
                self.error = None;
                info!("thread {} socket open", self.thread_id);
                if self.receipts.pending_len() > 0 {
                    self.flush_reads();
                }
            }
            Err(e) => {
                warn!("thread {} connect failed: {}", self.thread_id, e);
                self.on_closed(e.is_auth());
            }
        }
    }

    fn on_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Text(raw) => self.handle_frame(&raw),
            SocketEvent::Closed(close) => {
                self.socket = None;
                let auth = close.as_ref().is_some_and(|c| c.is_auth_rejection());
                match &close {
                    Some(c) => info!("thread {} socket closed: {} {}", self.thread_id, c.code, c.reason),
                    None => info!("thread {} socket closed", self.thread_id),
                }
                self.on_closed(auth);
            }
        }
    }

    fn on_closed(&mut self, auth_rejected: bool) {
        self.state = ConnectionState::Closed;
        // The server replays current presence on every connect.
        self.presence.clear();

        match self.reconnector.on_closed(auth_rejected) {
            RetryDecision::Retry { attempt, delay } => {
                info!(
                    "thread {} reconnecting in {}ms (attempt {})",
                    self.thread_id,
                    delay.as_millis(),
                    attempt
                );
                self.state = ConnectionState::WaitingToRetry;
                self.retry_at = Some(Instant::now() + delay);
            }
            RetryDecision::GiveUp => {
                let notice = if auth_rejected { AUTH_REJECTED } else { CONNECTION_LOST };
                error!("thread {} giving up: {}", self.thread_id, notice);
                self.state = ConnectionState::Failed;
                self.error = Some(notice.to_string());
            }
        }
    }

    // -- Inbound frames --

    fn handle_frame(&mut self, raw: &str) {
        let frame: ServerFrame = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(e) => {
                let err = SyncError::Parse(e);
                warn!(
                    "thread {} dropping frame: {} -- raw: {}",
                    self.thread_id,
                    err,
                    raw.chars().take(200).collect::<String>()
                );
                return;
            }
        };
        debug!("thread {} <- {}", self.thread_id, frame.kind());

        match &frame {
            ServerFrame::Message(wire) => {
                // Redeliveries are not fanned out again.
                if !self.timeline.insert(Message::from(wire.clone())) {
                    return;
                }
            }
            ServerFrame::Typing { user } => {
                self.typing.on_typing(user, Instant::now());
            }
            ServerFrame::Read {
                message_id,
                user,
                timestamp,
                ..
            } => {
                let at = timestamp.unwrap_or_else(Utc::now);
                self.timeline.apply_read(*message_id, user, at);
                if *user == self.identity.username {
                    self.receipts.forget(*message_id);
                }
            }
            ServerFrame::Presence { user, online } => {
                self.presence.apply(user, *online);
            }
            ServerFrame::Confirmation { status, message_id } => {
                debug!("thread {} message {} {}", self.thread_id, message_id, status);
            }
            ServerFrame::Error { detail } => {
                warn!("thread {} server error: {}", self.thread_id, detail);
            }
        }

        // No subscribers is fine.
        let _ = self.frames.send(frame);
    }

    // -- Commands --

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send { frame, reply } => {
                let _ = reply.send(self.send_frame(&frame));
            }
            Command::Typing { reply } => {
                let now = Instant::now();
                let result = if self.typing_throttle.should_send(now) {
                    self.send_frame(&ClientFrame::Typing).map(|()| {
                        self.typing_throttle.mark_sent(now);
                        true
                    })
                } else {
                    Ok(false)
                };
                let _ = reply.send(result);
            }
            Command::Visible(id) => {
                self.receipts
                    .element_became_visible(id, &self.timeline, Instant::now());
            }
            Command::PageVisibility(visible) => {
                if self.receipts.set_page_visible(visible) {
                    self.flush_reads();
                }
            }
            Command::FlushReads => self.flush_reads(),
            Command::ReconcileAllRead { reply } => {
                let marked = self.reconcile_all_read();
                let _ = reply.send(marked);
            }
            Command::Reconnect => {
                if self.state == ConnectionState::Failed {
                    info!("thread {} reconnecting on request", self.thread_id);
                    self.reconnector.reset();
                    self.error = None;
                    self.start_connect();
                } else {
                    debug!("thread {} ignoring reconnect while {}", self.thread_id, self.state);
                }
            }
        }
    }

    fn send_frame(&self, frame: &ClientFrame) -> Result<()> {
        let socket = match (&self.socket, self.state) {
            (Some(socket), ConnectionState::Open) => socket,
            (_, state) => {
                warn!("thread {} refusing {} frame while {}", self.thread_id, frame.kind(), state);
                return Err(SyncError::InvalidSend { state });
            }
        };
        let text = serde_json::to_string(frame)?;
        socket
            .outbound
            .send(text)
            .map_err(|_| SyncError::Connection("socket writer has shut down".into()))
    }

    /// Emit one read frame per pending id. Ids that could not be sent stay
    /// pending for the next flush.
    fn flush_reads(&mut self) {
        let ids = self.receipts.flush();
        if ids.is_empty() {
            return;
        }
        if self.state != ConnectionState::Open {
            debug!(
                "thread {} holding {} read receipts until the socket reopens",
                self.thread_id,
                ids.len()
            );
            return;
        }

        let mut sent = 0;
        for id in ids {
            match self.send_frame(&ClientFrame::Read { message_id: id }) {
                Ok(()) => {
                    self.receipts.complete(id);
                    sent += 1;
                }
                Err(e) => {
                    warn!("thread {} read receipt flush interrupted: {}", self.thread_id, e);
                    break;
                }
            }
        }
        debug!("thread {} flushed {} read receipts", self.thread_id, sent);
    }

    fn reconcile_all_read(&mut self) -> usize {
        let ids = self.receipts.reconcile_all_read(&self.timeline);
        let now = Utc::now();
        for &id in &ids {
            self.timeline.apply_read(id, &self.identity.username, now);
        }
        if self.state == ConnectionState::Open {
            for &id in &ids {
                if let Err(e) = self.send_frame(&ClientFrame::Read { message_id: id }) {
                    warn!("thread {} could not announce bulk read: {}", self.thread_id, e);
                    break;
                }
            }
        }
        info!("thread {} marked {} messages read", self.thread_id, ids.len());
        ids.len()
    }

    // -- Timers --

    fn next_deadline(&self) -> Option<Instant> {
        [self.retry_at, self.receipts.deadline(), self.typing.next_deadline()]
            .into_iter()
            .flatten()
            .min()
    }

    fn on_timer(&mut self, now: Instant) {
        if self.retry_at.is_some_and(|at| at <= now) {
            self.start_connect();
        }
        for user in self.typing.expire(now) {
            debug!("thread {} {} stopped typing", self.thread_id, user);
        }
        if self.receipts.is_due(now) {
            self.flush_reads();
        }
    }

    // -- Teardown / publishing --

    fn shutdown(&mut self) {
        if self.state == ConnectionState::Open {
            self.flush_reads();
        }
        if let Some(connecting) = self.connecting.take() {
            connecting.abort();
        }
        self.socket = None;
        self.retry_at = None;
        self.typing.clear();
        self.receipts.clear();
        self.state = ConnectionState::Closed;
        self.publish();
        info!("thread {} session closed", self.thread_id);
    }

    fn publish(&self) {
        let me = &self.identity.username;
        self.view.send_replace(Arc::new(ThreadView {
            thread_id: self.thread_id,
            state: self.state,
            messages: self.timeline.snapshot(),
            online: self.presence.online(),
            typing: self.typing.users(),
            unread: self.timeline.unread_count(me),
            pending_reads: self.receipts.pending_len(),
            error: self.error.clone(),
        }));
    }
}

async fn connect_outcome(pending: &mut Option<JoinHandle<Result<SocketPair>>>) -> Result<SocketPair> {
    match pending {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(e) => Err(SyncError::Connection(format!("connect task failed: {}", e))),
        },
        None => std::future::pending().await,
    }
}

async fn next_socket_event(socket: &mut Option<SocketPair>) -> SocketEvent {
    match socket {
        Some(socket) => socket.inbound.recv().await.unwrap_or(SocketEvent::Closed(None)),
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
