//! An in-process loopback transport used only by `gann demo` (see
//! `main.rs`). It is not a QUIC implementation: spec §1 treats the native
//! QUIC/relay transport as an opaque external collaborator, so this module
//! stands in for it with channel-backed plumbing good enough to exercise
//! [`gann_session_core::negotiation`] end-to-end on one machine without a
//! real network.

use async_trait::async_trait;
use bytes::Bytes;
use gann_session_core::error::TransportError;
use gann_session_core::transport::{
    Connection, PeerClient, PeerServer, RelayClient, RelayDataFrame, RelayTransport, Stream,
    TransportFactory,
};
use gann_session_core::wire::{QuicOfferData, RelayInfo};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};

/// A bidirectional stream backed by an in-memory byte channel. Unused by
/// the demo (it only negotiates and prints the resulting handle) but kept
/// real rather than `unimplemented!` so the loopback transport is a
/// faithful, if minimal, [`Connection`].
struct LoopbackStream {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl Stream for LoopbackStream {
    async fn write(&mut self, bytes: Bytes) -> Result<(), TransportError> {
        self.tx
            .send(bytes)
            .map_err(|_| TransportError("loopback stream closed".to_string()))
    }

    async fn finish(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn read(&mut self, _max_bytes: Option<usize>) -> Result<Option<Bytes>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

/// A loopback "connection": closing it is the only operation the demo
/// exercises.
struct LoopbackConnection {
    closed: Arc<std::sync::atomic::AtomicBool>,
}

#[async_trait]
impl Connection for LoopbackConnection {
    async fn open_bi(&self) -> Result<Box<dyn Stream>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Box::new(LoopbackStream { tx, rx }))
    }

    async fn accept_bi(&self) -> Result<Box<dyn Stream>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Box::new(LoopbackStream { tx, rx }))
    }

    async fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

/// The initiator side: hands its one `accept()` caller a connection once
/// the paired [`LoopbackPeerClient::connect`] fires.
pub struct LoopbackPeerServer {
    accept_rx: Mutex<Option<oneshot::Receiver<Box<dyn Connection>>>>,
}

#[async_trait]
impl PeerServer for LoopbackPeerServer {
    async fn offer(&self, advertised: Option<&[String]>) -> Result<QuicOfferData, TransportError> {
        Ok(QuicOfferData {
            candidates: advertised
                .map(<[String]>::to_vec)
                .unwrap_or_else(|| vec!["0.0.0.0:4433".to_string()]),
            cert_der_b64: "loopback".to_string(),
            fingerprint_sha256: "loopback".to_string(),
            alpn: "gann/1".to_string(),
            server_name: "loopback".to_string(),
            e2ee_pubkey_b64: None,
        })
    }

    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError> {
        let rx = self
            .accept_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| TransportError("loopback server already accepted once".to_string()))?;
        rx.await
            .map_err(|_| TransportError("loopback peer never connected".to_string()))
    }

    async fn close(&self) {}
}

/// The responder side: dialling it resolves the paired server's `accept()`.
pub struct LoopbackPeerClient {
    connect_tx: Mutex<Option<oneshot::Sender<Box<dyn Connection>>>>,
}

#[async_trait]
impl PeerClient for LoopbackPeerClient {
    async fn connect(&self, _offer: &QuicOfferData) -> Result<Box<dyn Connection>, TransportError> {
        let server_side = LoopbackConnection {
            closed: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        };
        let client_side = LoopbackConnection {
            closed: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        };
        if let Some(tx) = self.connect_tx.lock().await.take() {
            let _ = tx.send(Box::new(server_side));
        }
        Ok(Box::new(client_side))
    }
}

/// Build a connected `(PeerServer, PeerClient)` pair sharing one channel.
#[must_use]
pub fn connected_pair() -> (Arc<LoopbackPeerServer>, Arc<LoopbackPeerClient>) {
    let (tx, rx) = oneshot::channel();
    (
        Arc::new(LoopbackPeerServer {
            accept_rx: Mutex::new(Some(rx)),
        }),
        Arc::new(LoopbackPeerClient {
            connect_tx: Mutex::new(Some(tx)),
        }),
    )
}

/// An in-memory relay: bind/send/recv scoped by session id, shared by both
/// agents in the same process.
#[derive(Default)]
struct LoopbackRelayState {
    bound: HashMap<String, u8>,
    inbox: HashMap<String, mpsc::UnboundedSender<RelayDataFrame>>,
}

pub struct LoopbackRelay {
    state: Arc<Mutex<LoopbackRelayState>>,
    inbox_rx: Mutex<mpsc::UnboundedReceiver<RelayDataFrame>>,
}

#[async_trait]
impl RelayTransport for LoopbackRelay {
    async fn relay_bind(&self, _token: &str, session_id: &str) -> Result<bool, TransportError> {
        let mut state = self.state.lock().await;
        let count = state.bound.entry(session_id.to_string()).or_insert(0);
        *count += 1;
        Ok(*count >= 2)
    }

    async fn relay_send(
        &self,
        _token: &str,
        session_id: &str,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        let state = self.state.lock().await;
        if let Some(sender) = state.inbox.get(session_id) {
            let _ = sender.send(RelayDataFrame {
                session_id: session_id.to_string(),
                from: "peer".to_string(),
                to: "self".to_string(),
                payload,
            });
        }
        Ok(())
    }

    async fn recv_relay_data(&self) -> Result<RelayDataFrame, TransportError> {
        self.inbox_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| TransportError("loopback relay closed".to_string()))
    }

    async fn close(&self) {}
}

pub struct LoopbackRelayClient {
    state: Arc<Mutex<LoopbackRelayState>>,
}

impl LoopbackRelayClient {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LoopbackRelayState::default())),
        }
    }
}

impl Default for LoopbackRelayClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayClient for LoopbackRelayClient {
    async fn connect_transport(&self, relay: &RelayInfo) -> Result<Box<dyn RelayTransport>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .await
            .inbox
            .insert(relay.session_id.clone(), tx);
        Ok(Box::new(LoopbackRelay {
            state: Arc::clone(&self.state),
            inbox_rx: Mutex::new(rx),
        }))
    }
}

/// A [`TransportFactory`] wired to one pre-built [`PeerServer`]/[`PeerClient`]
/// pair, sharing one relay registry. `gann demo` builds two of these (one
/// per simulated agent) from the same [`connected_pair`] and relay client.
pub struct LoopbackTransportFactory {
    peer_server: Arc<LoopbackPeerServer>,
    peer_client: Arc<LoopbackPeerClient>,
    relay_client: Arc<LoopbackRelayClient>,
}

impl LoopbackTransportFactory {
    #[must_use]
    pub fn new(
        peer_server: Arc<LoopbackPeerServer>,
        peer_client: Arc<LoopbackPeerClient>,
        relay_client: Arc<LoopbackRelayClient>,
    ) -> Self {
        Self {
            peer_server,
            peer_client,
            relay_client,
        }
    }
}

#[async_trait]
impl TransportFactory for LoopbackTransportFactory {
    async fn create_peer_server(&self, _bind_addr: &str) -> Result<Arc<dyn PeerServer>, TransportError> {
        Ok(Arc::clone(&self.peer_server) as Arc<dyn PeerServer>)
    }

    async fn create_peer_client(&self, _bind_addr: &str) -> Result<Arc<dyn PeerClient>, TransportError> {
        Ok(Arc::clone(&self.peer_client) as Arc<dyn PeerClient>)
    }

    async fn create_relay_client(&self, _bind_addr: &str) -> Result<Arc<dyn RelayClient>, TransportError> {
        Ok(Arc::clone(&self.relay_client) as Arc<dyn RelayClient>)
    }
}
