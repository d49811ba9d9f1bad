//! Signaling channel (C3): owns one full-duplex socket to the directory and
//! exposes a typed event surface plus a send API.

use crate::emitter::{Emitter, ListenerId};
use crate::error::{ChannelTerminated, ValidationError};
use crate::ids::{AgentId, SessionId};
use crate::socket::{ReadyState, Socket, SocketEvent, SocketSubscription};
use crate::sync_util::lock;
use crate::token::Token;
use crate::wire::{
    self, ControlDirective, HeartbeatBroadcast, OutboundCommand, OutboundPayload, ParsedEvent,
    QuicAnswerData, QuicOfferData, SessionLifecycleEvent, SignalingEvent,
};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;

const CONNECTING: u8 = 0;
const OPEN: u8 = 1;
const CLOSED: u8 = 2;

/// Terminal error substrings (lower-cased) per spec §4.3. Matching one of
/// these means the socket is already effectively dead: it is recovered
/// locally rather than surfaced on `error`.
const TERMINAL_ERROR_MARKERS: &[&str] = &[
    "connection closed",
    "websocket is not open",
    "already closed",
    "econnreset",
    "epipe",
    "ebadf",
];

fn is_terminal_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TERMINAL_ERROR_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Keys for the channel's event bus. One bucket per named event in §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelEventKind {
    /// Socket handshake completed.
    Open,
    /// Channel entered the terminal `closed` state.
    Close,
    /// A non-terminal socket error.
    Error,
    /// A decoded `signaling` frame.
    Signaling,
    /// A decoded `session` frame.
    Session,
    /// A decoded `control` frame.
    Control,
    /// A decoded `heartbeat` frame.
    Heartbeat,
    /// Every successfully decoded frame, regardless of family.
    Raw,
}

/// Payload delivered to listeners, keyed by [`ChannelEventKind`].
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// See [`ChannelEventKind::Open`].
    Open,
    /// See [`ChannelEventKind::Close`].
    Close {
        /// Close code, if any.
        code: Option<u16>,
        /// Close reason, if any.
        reason: Option<String>,
    },
    /// See [`ChannelEventKind::Error`].
    Error(String),
    /// See [`ChannelEventKind::Signaling`].
    Signaling(SignalingEvent),
    /// See [`ChannelEventKind::Session`].
    Session(SessionLifecycleEvent),
    /// See [`ChannelEventKind::Control`].
    Control(ControlDirective),
    /// See [`ChannelEventKind::Heartbeat`].
    Heartbeat(HeartbeatBroadcast),
    /// See [`ChannelEventKind::Raw`].
    Raw(ParsedEvent),
}

#[derive(Debug, Clone)]
enum ReadyStatus {
    Pending,
    Ready,
    Failed(String),
}

/// Owns one full-duplex text-framed socket to the directory.
///
/// Single-use: once closed, further sends are rejected with
/// [`ValidationError::ChannelClosed`].
pub struct SignalingChannel {
    agent_id: AgentId,
    socket: Arc<dyn Socket>,
    token: Option<Token>,
    state: AtomicU8,
    ready_tx: watch::Sender<ReadyStatus>,
    pending: Mutex<VecDeque<String>>,
    emitter: Emitter<ChannelEventKind, ChannelEvent>,
    subscription: Mutex<Option<SocketSubscription>>,
}

impl SignalingChannel {
    /// Open a channel over `socket`, identifying as `agent_id`. `token` is
    /// stored for callers that want to hand the same value to a relay
    /// transport's bind call (spec §3: "one token is normally shared...").
    #[must_use]
    pub fn open(agent_id: AgentId, socket: Arc<dyn Socket>, token: Option<Token>) -> Arc<Self> {
        let (ready_tx, _ready_rx) = watch::channel(ReadyStatus::Pending);
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak_for_listener = weak.clone();
            let subscription = socket.subscribe(Box::new(move |event| {
                if let Some(channel) = weak_for_listener.upgrade() {
                    channel.handle_socket_event(event);
                }
            }));
            let initial_state = match socket.ready_state() {
                ReadyState::Open => OPEN,
                _ => CONNECTING,
            };
            Self {
                agent_id,
                socket,
                token,
                state: AtomicU8::new(initial_state),
                ready_tx,
                pending: Mutex::new(VecDeque::new()),
                emitter: Emitter::new(),
                subscription: Mutex::new(Some(subscription)),
            }
        })
    }

    /// The agent this channel is authenticated as.
    #[must_use]
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// The bearer token this channel was opened with, if any.
    #[must_use]
    pub fn token(&self) -> Option<&Token> {
        self.token.as_ref()
    }

    /// Resolves once on socket open; fails on the first terminal error or
    /// on close before open (spec §3 invariant).
    ///
    /// # Errors
    ///
    /// Returns [`ChannelTerminated`] if the channel closed, or reached a
    /// non-terminal error, before becoming ready.
    #[tracing::instrument(skip(self), fields(agent = %self.agent_id))]
    pub async fn ready(&self) -> Result<(), ChannelTerminated> {
        let mut rx = self.ready_tx.subscribe();
        loop {
            match &*rx.borrow() {
                ReadyStatus::Ready => return Ok(()),
                ReadyStatus::Failed(reason) => {
                    return Err(ChannelTerminated {
                        code: None,
                        reason: Some(reason.clone()),
                    })
                }
                ReadyStatus::Pending => {}
            }
            if rx.changed().await.is_err() {
                return Err(ChannelTerminated {
                    code: None,
                    reason: Some("channel dropped before ready".to_string()),
                });
            }
        }
    }

    /// Register a listener for `kind`.
    pub fn on(
        &self,
        kind: ChannelEventKind,
        listener: impl Fn(&ChannelEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.emitter.on(kind, listener)
    }

    /// Remove a listener previously registered with [`SignalingChannel::on`].
    pub fn off(&self, kind: ChannelEventKind, id: ListenerId) -> bool {
        self.emitter.off(&kind, id)
    }

    /// Subscribe to every decoded `signaling` event.
    pub fn on_signaling(
        &self,
        listener: impl Fn(&SignalingEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.on(ChannelEventKind::Signaling, move |event| {
            if let ChannelEvent::Signaling(ev) = event {
                listener(ev);
            }
        })
    }

    /// Send a `quic_offer` with no session id (the server assigns one).
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if `to` is empty or the channel is closed.
    pub fn send_quic_offer(&self, to: &str, offer: QuicOfferData) -> Result<(), ValidationError> {
        let to = AgentId::new(to)?;
        self.send_command(OutboundCommand {
            to: to.as_str().to_string(),
            session_id: None,
            payload: OutboundPayload::QuicOffer(offer),
        })
    }

    /// Send a `quic_answer` on `session_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if `session_id`/`to` are empty or the
    /// channel is closed.
    pub fn send_quic_answer(
        &self,
        session_id: &str,
        to: &str,
        answer: QuicAnswerData,
    ) -> Result<(), ValidationError> {
        let session_id = SessionId::new(session_id)?;
        let to = AgentId::new(to)?;
        self.send_command(OutboundCommand {
            to: to.as_str().to_string(),
            session_id: Some(session_id.as_str().to_string()),
            payload: OutboundPayload::QuicAnswer(answer),
        })
    }

    /// Send a `quic_candidate` hint on `session_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if `session_id`/`to` are empty or the
    /// channel is closed.
    pub fn send_quic_candidate(
        &self,
        session_id: &str,
        to: &str,
        candidate: Value,
    ) -> Result<(), ValidationError> {
        let session_id = SessionId::new(session_id)?;
        let to = AgentId::new(to)?;
        self.send_command(OutboundCommand {
            to: to.as_str().to_string(),
            session_id: Some(session_id.as_str().to_string()),
            payload: OutboundPayload::QuicCandidate(candidate),
        })
    }

    /// Send a `disconnect` on `session_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if `session_id`/`to` are empty or the
    /// channel is closed.
    pub fn disconnect_session(
        &self,
        session_id: &str,
        to: &str,
        reason: Option<String>,
    ) -> Result<(), ValidationError> {
        let session_id = SessionId::new(session_id)?;
        let to = AgentId::new(to)?;
        self.send_command(OutboundCommand {
            to: to.as_str().to_string(),
            session_id: Some(session_id.as_str().to_string()),
            payload: OutboundPayload::Disconnect { reason },
        })
    }

    fn send_command(&self, command: OutboundCommand) -> Result<(), ValidationError> {
        self.send_raw(command.to_wire_string())
    }

    /// Enqueue (or, if open, write) one raw text frame.
    fn send_raw(&self, text: String) -> Result<(), ValidationError> {
        match self.state.load(Ordering::SeqCst) {
            CLOSED => Err(ValidationError::ChannelClosed),
            OPEN => {
                if let Err(e) = self.socket.send(text) {
                    tracing::warn!(error = %e, "signaling socket send failed");
                }
                Ok(())
            }
            _ => {
                lock(&self.pending).push_back(text);
                Ok(())
            }
        }
    }

    /// Idempotent local teardown: closes the socket and transitions this
    /// channel to `closed`.
    pub fn close(&self, code: Option<u16>, reason: Option<String>) {
        self.socket.close(code, reason.clone());
        self.enter_closed(code, reason);
    }

    fn handle_socket_event(&self, event: SocketEvent) {
        match event {
            SocketEvent::Open => self.on_socket_open(),
            SocketEvent::Message(text) => self.on_socket_message(&text),
            SocketEvent::Error(message) => self.on_socket_error(message),
            SocketEvent::Close { code, reason } => self.enter_closed(code, reason),
        }
    }

    fn on_socket_open(&self) {
        if self
            .state
            .compare_exchange(CONNECTING, OPEN, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.drain_pending();
            let _ = self.ready_tx.send(ReadyStatus::Ready);
            self.emitter.emit(&ChannelEventKind::Open, &ChannelEvent::Open);
        }
    }

    fn drain_pending(&self) {
        let queued: VecDeque<String> = std::mem::take(&mut *lock(&self.pending));
        for frame in queued {
            if let Err(e) = self.socket.send(frame) {
                tracing::warn!(error = %e, "failed to flush queued signaling frame");
            }
        }
    }

    fn on_socket_message(&self, text: &str) {
        let Some(parsed) = wire::parse_frame(text) else {
            tracing::debug!("dropped malformed signaling frame");
            return;
        };
        self.emitter
            .emit(&ChannelEventKind::Raw, &ChannelEvent::Raw(parsed.clone()));
        match parsed {
            ParsedEvent::Signaling(event) => self.emitter.emit(
                &ChannelEventKind::Signaling,
                &ChannelEvent::Signaling(event),
            ),
            ParsedEvent::Session(event) => {
                self.emitter
                    .emit(&ChannelEventKind::Session, &ChannelEvent::Session(event))
            }
            ParsedEvent::Control(event) => {
                self.emitter
                    .emit(&ChannelEventKind::Control, &ChannelEvent::Control(event))
            }
            ParsedEvent::Heartbeat(event) => self.emitter.emit(
                &ChannelEventKind::Heartbeat,
                &ChannelEvent::Heartbeat(event),
            ),
        }
    }

    fn on_socket_error(&self, message: String) {
        if is_terminal_error(&message) {
            if self.socket.ready_state() != ReadyState::Open {
                self.enter_closed(None, None);
            }
            return;
        }
        let failed_ready = self.ready_tx.send_if_modified(|status| {
            if matches!(status, ReadyStatus::Pending) {
                *status = ReadyStatus::Failed(message.clone());
                true
            } else {
                false
            }
        });
        if !failed_ready {
            self.emitter
                .emit(&ChannelEventKind::Error, &ChannelEvent::Error(message));
        }
    }

    fn enter_closed(&self, code: Option<u16>, reason: Option<String>) {
        if self.state.swap(CLOSED, Ordering::SeqCst) == CLOSED {
            return;
        }
        if let Some(token) = lock(&self.subscription).take() {
            self.socket.unsubscribe(token);
        }
        let _ = self.ready_tx.send_if_modified(|status| {
            if matches!(status, ReadyStatus::Pending) {
                *status = ReadyStatus::Failed(
                    reason.clone().unwrap_or_else(|| "channel closed".to_string()),
                );
                true
            } else {
                false
            }
        });
        self.emitter.emit(
            &ChannelEventKind::Close,
            &ChannelEvent::Close { code, reason },
        );
        self.emitter.clear();
    }
}


#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::tests_support::MockSocket;
    use super::*;

    fn agent(name: &str) -> AgentId {
        AgentId::new(name).unwrap()
    }

    #[tokio::test]
    async fn sends_before_open_are_queued_and_flushed_in_order() {
        let socket = Arc::new(MockSocket::default());
        let channel = SignalingChannel::open(agent("peer-a"), socket.clone(), None);

        channel
            .disconnect_session("S5", "peer-b", Some("bye".to_string()))
            .unwrap();
        assert!(socket.sent.lock().unwrap().is_empty());

        socket.open();
        channel.ready().await.unwrap();

        let sent = socket.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let frame: Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(frame["session_id"], "S5");
        assert_eq!(frame["to"], "peer-b");
        assert_eq!(frame["payload"]["kind"], "disconnect");
        assert_eq!(frame["payload"]["reason"], "bye");
    }

    #[tokio::test]
    async fn send_on_closed_channel_is_rejected() {
        let socket = Arc::new(MockSocket::default());
        let channel = SignalingChannel::open(agent("peer-a"), socket.clone(), None);
        socket.open();
        channel.ready().await.unwrap();
        channel.close(None, None);

        let err = channel.send_quic_offer("peer-b", QuicOfferData::default());
        assert!(matches!(err, Err(ValidationError::ChannelClosed)));
        assert!(socket.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_target_is_rejected_before_any_frame_is_written() {
        let socket = Arc::new(MockSocket::default());
        let channel = SignalingChannel::open(agent("peer-a"), socket.clone(), None);
        socket.open();
        channel.ready().await.unwrap();

        let err = channel.send_quic_offer("", QuicOfferData::default());
        assert!(matches!(err, Err(ValidationError::EmptyId { .. })));
        assert!(socket.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_session_id_is_rejected() {
        let socket = Arc::new(MockSocket::default());
        let channel = SignalingChannel::open(agent("peer-a"), socket.clone(), None);
        socket.open();
        channel.ready().await.unwrap();

        let err = channel.send_quic_answer("", "peer-b", QuicAnswerData::default());
        assert!(matches!(err, Err(ValidationError::EmptyId { .. })));
    }

    #[tokio::test]
    async fn terminal_error_while_not_open_closes_without_error_event() {
        let socket = Arc::new(MockSocket::default());
        let channel = SignalingChannel::open(agent("peer-a"), socket.clone(), None);

        let error_calls = Arc::new(Mutex::new(0u32));
        let close_calls = Arc::new(Mutex::new(0u32));
        {
            let error_calls = Arc::clone(&error_calls);
            channel.on(ChannelEventKind::Error, move |_| {
                *error_calls.lock().unwrap() += 1;
            });
        }
        {
            let close_calls = Arc::clone(&close_calls);
            channel.on(ChannelEventKind::Close, move |_| {
                *close_calls.lock().unwrap() += 1;
            });
        }

        socket.error("ECONNRESET");

        assert_eq!(*error_calls.lock().unwrap(), 0);
        assert_eq!(*close_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn multiple_close_calls_emit_close_exactly_once() {
        let socket = Arc::new(MockSocket::default());
        let channel = SignalingChannel::open(agent("peer-a"), socket.clone(), None);
        socket.open();
        channel.ready().await.unwrap();

        let close_calls = Arc::new(Mutex::new(0u32));
        {
            let close_calls = Arc::clone(&close_calls);
            channel.on(ChannelEventKind::Close, move |_| {
                *close_calls.lock().unwrap() += 1;
            });
        }

        channel.close(Some(1000), Some("bye".to_string()));
        channel.close(Some(1000), Some("bye".to_string()));
        assert_eq!(*close_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn close_before_open_fails_ready() {
        let socket = Arc::new(MockSocket::default());
        let channel = SignalingChannel::open(agent("peer-a"), socket.clone(), None);
        channel.close(None, Some("shutdown".to_string()));
        let err = channel.ready().await.unwrap_err();
        assert_eq!(err.reason.as_deref(), Some("shutdown"));
    }

    #[tokio::test]
    async fn signaling_frames_dispatch_typed_and_raw_events() {
        let socket = Arc::new(MockSocket::default());
        let channel = SignalingChannel::open(agent("peer-a"), socket.clone(), None);
        socket.open();
        channel.ready().await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_inner = Arc::clone(&seen);
        channel.on_signaling(move |ev| seen_inner.lock().unwrap().push(ev.from.clone()));

        socket.receive(
            r#"{"event":"signaling","payload":{"session_id":"s1","from":"peer-b","to":"peer-a","expires_at":"2030-01-01T00:00:00Z","payload":{"kind":"disconnect","reason":"done"}}}"#,
        );

        assert_eq!(*seen.lock().unwrap(), vec!["peer-b".to_string()]);
    }
}
