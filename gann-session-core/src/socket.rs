//! Runtime-polymorphic socket capability (Design Notes).
//!
//! The signaling channel depends only on this trait, not on any particular
//! socket library. A concrete [`TungsteniteSocket`] adapter is provided
//! behind the `net` feature; tests pair the channel with an in-memory mock
//! instead.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lifecycle state of the underlying socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Handshake in progress.
    Connecting,
    /// Ready to send and receive.
    Open,
    /// Terminally closed.
    Closed,
}

/// Events a [`Socket`] reports to its listeners.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// The handshake completed.
    Open,
    /// A text frame arrived.
    Message(String),
    /// A non-terminal error occurred; the socket may still be open.
    Error(String),
    /// The socket closed.
    Close {
        /// Close code, if the peer sent one.
        code: Option<u16>,
        /// Close reason, if the peer sent one.
        reason: Option<String>,
    },
}

/// Token returned by [`Socket::subscribe`], used to detach the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketSubscription(u64);

impl SocketSubscription {
    /// Mint a token from a caller-managed counter. For [`Socket`]
    /// implementations outside this crate that need to allocate their own
    /// subscription ids (the in-crate [`TungsteniteSocket`] uses
    /// [`next_subscription_id`] instead).
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

pub(crate) fn next_subscription_id(counter: &AtomicU64) -> SocketSubscription {
    SocketSubscription(counter.fetch_add(1, Ordering::Relaxed))
}

/// The capability set a signaling channel needs from its transport: event
/// subscription, a synchronous (non-suspending) send, close, and a
/// queryable ready state.
pub trait Socket: Send + Sync {
    /// Current lifecycle state.
    fn ready_state(&self) -> ReadyState;

    /// Write one text frame. Must not suspend the scheduler: if the
    /// underlying transport would block, it should buffer internally and
    /// surface failures asynchronously via an `Error`/`Close` event rather
    /// than blocking here.
    fn send(&self, text: String) -> Result<(), String>;

    /// Request the socket close with an optional code/reason.
    fn close(&self, code: Option<u16>, reason: Option<String>);

    /// Register an event listener. Returns a token usable with
    /// [`Socket::unsubscribe`].
    fn subscribe(&self, listener: Box<dyn Fn(SocketEvent) + Send + Sync>) -> SocketSubscription;

    /// Detach a previously registered listener.
    fn unsubscribe(&self, token: SocketSubscription);
}

#[cfg(feature = "net")]
pub use tungstenite_socket::TungsteniteSocket;

#[cfg(feature = "net")]
mod tungstenite_socket {
    use super::{next_subscription_id, ReadyState, Socket, SocketEvent, SocketSubscription};
    use crate::sync_util::lock;
    use futures_util::{SinkExt, StreamExt};
    use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    const CONNECTING: u8 = 0;
    const OPEN: u8 = 1;
    const CLOSED: u8 = 2;

    type Listener = Arc<dyn Fn(SocketEvent) + Send + Sync>;

    /// A [`Socket`] backed by `tokio-tungstenite`.
    ///
    /// Connects in the background; `send` before the handshake completes
    /// is rejected by the caller's queueing layer
    /// ([`crate::channel::SignalingChannel`]), not here — this adapter only
    /// reports its honest `readyState`.
    pub struct TungsteniteSocket {
        state: Arc<AtomicU8>,
        listeners: Arc<Mutex<Vec<(SocketSubscription, Listener)>>>,
        next_id: Arc<AtomicU64>,
        outbound: mpsc::UnboundedSender<Message>,
    }

    impl TungsteniteSocket {
        /// Connect to `url` and start the background read/write loop.
        pub async fn connect(url: &str) -> Result<Self, String> {
            let (ws, _response) = tokio_tungstenite::connect_async(url)
                .await
                .map_err(|e| format!("websocket connect failed: {e}"))?;
            let (mut write, mut read) = ws.split();
            let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

            let state = Arc::new(AtomicU8::new(OPEN));
            let listeners: Arc<Mutex<Vec<(SocketSubscription, Listener)>>> =
                Arc::new(Mutex::new(Vec::new()));

            let write_listeners = Arc::clone(&listeners);
            let write_state = Arc::clone(&state);
            tokio::spawn(async move {
                while let Some(msg) = outbound_rx.recv().await {
                    if let Err(e) = write.send(msg).await {
                        write_state.store(CLOSED, Ordering::SeqCst);
                        notify(
                            &write_listeners,
                            SocketEvent::Error(format!("send failed: {e}")),
                        );
                        break;
                    }
                }
            });

            let read_listeners = Arc::clone(&listeners);
            let read_state = Arc::clone(&state);
            tokio::spawn(async move {
                notify(&read_listeners, SocketEvent::Open);
                while let Some(msg) = read.next().await {
                    match msg {
                        Ok(Message::Text(text)) => {
                            notify(&read_listeners, SocketEvent::Message(text.to_string()));
                        }
                        Ok(Message::Close(frame)) => {
                            read_state.store(CLOSED, Ordering::SeqCst);
                            notify(
                                &read_listeners,
                                SocketEvent::Close {
                                    code: frame.as_ref().map(|f| f.code.into()),
                                    reason: frame.map(|f| f.reason.to_string()),
                                },
                            );
                            return;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            notify(&read_listeners, SocketEvent::Error(e.to_string()));
                        }
                    }
                }
                read_state.store(CLOSED, Ordering::SeqCst);
                notify(
                    &read_listeners,
                    SocketEvent::Close {
                        code: None,
                        reason: None,
                    },
                );
            });

            Ok(Self {
                state,
                listeners,
                next_id: Arc::new(AtomicU64::new(0)),
                outbound: outbound_tx,
            })
        }
    }

    fn notify(listeners: &Arc<Mutex<Vec<(SocketSubscription, Listener)>>>, event: SocketEvent) {
        let snapshot: Vec<Listener> = lock(listeners)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in snapshot {
            listener(event.clone());
        }
    }

    impl Socket for TungsteniteSocket {
        fn ready_state(&self) -> ReadyState {
            match self.state.load(Ordering::SeqCst) {
                CONNECTING => ReadyState::Connecting,
                OPEN => ReadyState::Open,
                _ => ReadyState::Closed,
            }
        }

        fn send(&self, text: String) -> Result<(), String> {
            self.outbound
                .send(Message::Text(text.into()))
                .map_err(|_| "connection closed".to_string())
        }

        fn close(&self, code: Option<u16>, reason: Option<String>) {
            self.state.store(CLOSED, Ordering::SeqCst);
            let close_frame = code.map(|c| tokio_tungstenite::tungstenite::protocol::CloseFrame {
                code: c.into(),
                reason: reason.unwrap_or_default().into(),
            });
            let _ = self.outbound.send(Message::Close(close_frame));
        }

        fn subscribe(
            &self,
            listener: Box<dyn Fn(SocketEvent) + Send + Sync>,
        ) -> SocketSubscription {
            let token = next_subscription_id(&self.next_id);
            lock(&self.listeners).push((token, Arc::from(listener)));
            token
        }

        fn unsubscribe(&self, token: SocketSubscription) {
            lock(&self.listeners).retain(|(id, _)| *id != token);
        }
    }
}
