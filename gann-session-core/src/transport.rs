//! Transport adapter (C5): a thin, opaque wrapper over the native
//! QUIC/relay transport primitives.
//!
//! The negotiation core never talks to QUIC or a relay socket directly —
//! it only depends on these traits, mirroring how the teacher crate's
//! [`crate::ids`]-adjacent `LinkTransport` abstraction decouples WebRTC
//! logic from the concrete `ant-quic` API. A production integrator
//! supplies concrete implementations; this crate ships only the contract.

use crate::error::TransportError as CoreTransportError;
use crate::wire::{QuicOfferData, RelayInfo};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// A bidirectional QUIC stream, abstracted over whatever concrete
/// implementation the transport adapter provides.
#[async_trait]
pub trait Stream: Send + Sync {
    /// Write `bytes` to the stream.
    async fn write(&mut self, bytes: Bytes) -> Result<(), CoreTransportError>;

    /// Signal no more data will be written.
    async fn finish(&mut self) -> Result<(), CoreTransportError>;

    /// Read up to `max_bytes` (or an implementation default if `None`).
    /// Returns `None` on a clean end-of-stream.
    async fn read(&mut self, max_bytes: Option<usize>) -> Result<Option<Bytes>, CoreTransportError>;
}

/// An established QUIC connection, direct or via relay, capable of opening
/// and accepting bidirectional streams.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a new bidirectional stream.
    async fn open_bi(&self) -> Result<Box<dyn Stream>, CoreTransportError>;

    /// Accept the next bidirectional stream the peer opens.
    async fn accept_bi(&self) -> Result<Box<dyn Stream>, CoreTransportError>;

    /// Tear down the connection.
    async fn close(&self);
}

/// The initiator's local QUIC listener: generates an offer and waits for a
/// direct handshake.
#[async_trait]
pub trait PeerServer: Send + Sync {
    /// Build a [`QuicOfferData`] advertising `candidates` (or this
    /// server's own bound addresses if `None`). Implementations should
    /// normalise "any-address" candidates the way
    /// [`normalize_candidates`] does; the initiator re-applies it
    /// regardless, so every offer it emits is normalised even if this
    /// implementation does not (spec testable property 3).
    async fn offer(
        &self,
        advertised_candidates: Option<&[String]>,
    ) -> Result<QuicOfferData, CoreTransportError>;

    /// Accept the next inbound direct QUIC handshake.
    async fn accept(&self) -> Result<Box<dyn Connection>, CoreTransportError>;

    /// Stop listening.
    async fn close(&self);
}

/// The responder's local QUIC endpoint: dials the offer's candidates.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Attempt a direct connection to the peer described by `offer`.
    async fn connect(&self, offer: &QuicOfferData) -> Result<Box<dyn Connection>, CoreTransportError>;
}

/// One frame of relayed application data.
#[derive(Debug, Clone)]
pub struct RelayDataFrame {
    /// Session this frame belongs to.
    pub session_id: String,
    /// Sending agent.
    pub from: String,
    /// Target agent.
    pub to: String,
    /// Opaque payload bytes.
    pub payload: Bytes,
}

/// Factory for relay-mediated transports.
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Connect to the relay described by `relay`.
    async fn connect_transport(
        &self,
        relay: &RelayInfo,
    ) -> Result<Box<dyn RelayTransport>, CoreTransportError>;
}

/// A QUIC connection to a directory-operated relay that forwards frames
/// keyed by session id.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Bind this session on the relay. Returns `true` iff the peer is
    /// already bound; `false` is a signal to retry (spec §4.5).
    async fn relay_bind(&self, token: &str, session_id: &str) -> Result<bool, CoreTransportError>;

    /// Send `payload` to the session's peer via the relay.
    async fn relay_send(
        &self,
        token: &str,
        session_id: &str,
        payload: Bytes,
    ) -> Result<(), CoreTransportError>;

    /// Receive the next frame addressed to this session.
    async fn recv_relay_data(&self) -> Result<RelayDataFrame, CoreTransportError>;

    /// End-to-end encrypted variant of [`RelayTransport::relay_send`].
    async fn relay_send_e2ee(
        &self,
        token: &str,
        session_id: &str,
        payload: Bytes,
    ) -> Result<(), CoreTransportError> {
        self.relay_send(token, session_id, payload).await
    }

    /// End-to-end encrypted variant of [`RelayTransport::recv_relay_data`].
    async fn recv_relay_data_e2ee(&self) -> Result<RelayDataFrame, CoreTransportError> {
        self.recv_relay_data().await
    }

    /// Tear down the relay transport.
    async fn close(&self);
}

/// Factory for the bound, address-specific transport endpoints the
/// negotiation drivers construct per attempt (spec §4.5:
/// `PeerServer.create(bindAddr)`, `PeerClient.create(bindAddr)`,
/// `RelayClient.create(bindAddr)`). Kept separate from the endpoint traits
/// themselves so a concrete adapter can own whatever shared state (e.g. one
/// `ant-quic` endpoint) those constructors need.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Build a [`PeerServer`] bound to `bind_addr`.
    async fn create_peer_server(&self, bind_addr: &str) -> Result<Arc<dyn PeerServer>, CoreTransportError>;

    /// Build a [`PeerClient`] bound to `bind_addr`.
    async fn create_peer_client(&self, bind_addr: &str) -> Result<Arc<dyn PeerClient>, CoreTransportError>;

    /// Build a [`RelayClient`] bound to `bind_addr`.
    async fn create_relay_client(&self, bind_addr: &str) -> Result<Arc<dyn RelayClient>, CoreTransportError>;
}

impl fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn Connection")
    }
}

impl fmt::Debug for dyn RelayTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn RelayTransport")
    }
}

/// Normalise "any-address" candidates so a remote peer receives a
/// reachable address: `0.0.0.0:P` → `127.0.0.1:P`, `[::]:P` → `[::1]:P`.
/// Every other candidate passes through unchanged (spec §4.5, testable
/// property 3).
#[must_use]
pub fn normalize_candidates(candidates: &[String]) -> Vec<String> {
    candidates.iter().map(|c| normalize_candidate(c)).collect()
}

fn normalize_candidate(candidate: &str) -> String {
    if let Some(port) = candidate.strip_prefix("0.0.0.0:") {
        return format!("127.0.0.1:{port}");
    }
    if let Some(port) = candidate.strip_prefix("[::]:") {
        return format!("[::1]:{port}");
    }
    candidate.to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_ipv4_any_address() {
        let out = normalize_candidates(&["0.0.0.0:9000".to_string(), "10.0.0.5:9000".to_string()]);
        assert_eq!(out, vec!["127.0.0.1:9000".to_string(), "10.0.0.5:9000".to_string()]);
    }

    #[test]
    fn normalizes_ipv6_any_address() {
        let out = normalize_candidates(&["[::]:9000".to_string()]);
        assert_eq!(out, vec!["[::1]:9000".to_string()]);
    }

    #[test]
    fn leaves_routable_candidates_untouched() {
        let out = normalize_candidates(&["203.0.113.5:51820".to_string()]);
        assert_eq!(out, vec!["203.0.113.5:51820".to_string()]);
    }
}
