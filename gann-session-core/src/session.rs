//! Session handle (C8): a uniform contract for application payload
//! exchange over either a direct QUIC connection or a relay transport.

use crate::ids::{AgentId, SessionId};
use crate::token::Token;
use crate::transport::{Connection, RelayTransport};
use crate::wire::RelayInfo;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Which transport a negotiated session ended up using.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// An end-to-end QUIC connection between the two agents.
    Direct,
    /// A relay-mediated QUIC connection to a directory-operated relay.
    Relay,
}

enum SessionHandleInner {
    Direct {
        connection: Arc<dyn Connection>,
    },
    Relay {
        relay: RelayInfo,
        transport: Arc<dyn RelayTransport>,
        peer_ready: bool,
        token: Token,
    },
}

/// The outcome of a direct-first negotiation: either a direct connection
/// or a relay-mediated one, exposed behind one façade.
///
/// Exclusively owns the transport resource it refers to. Closing the
/// handle closes that resource; it does not affect the signaling channel
/// that negotiated it.
pub struct SessionHandle {
    session_id: SessionId,
    peer_agent_id: AgentId,
    inner: SessionHandleInner,
    closed: AtomicBool,
}

impl SessionHandle {
    /// Build a `Direct` handle.
    #[must_use]
    pub fn direct(session_id: SessionId, peer_agent_id: AgentId, connection: Arc<dyn Connection>) -> Self {
        Self {
            session_id,
            peer_agent_id,
            inner: SessionHandleInner::Direct { connection },
            closed: AtomicBool::new(false),
        }
    }

    /// Build a `Relay` handle.
    #[must_use]
    pub fn relay(
        session_id: SessionId,
        peer_agent_id: AgentId,
        relay: RelayInfo,
        transport: Arc<dyn RelayTransport>,
        peer_ready: bool,
        token: Token,
    ) -> Self {
        Self {
            session_id,
            peer_agent_id,
            inner: SessionHandleInner::Relay {
                relay,
                transport,
                peer_ready,
                token,
            },
            closed: AtomicBool::new(false),
        }
    }

    /// Which transport this session ended up using.
    #[must_use]
    pub fn mode(&self) -> SessionMode {
        match &self.inner {
            SessionHandleInner::Direct { .. } => SessionMode::Direct,
            SessionHandleInner::Relay { .. } => SessionMode::Relay,
        }
    }

    /// The negotiated session id.
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// The other party in this session.
    #[must_use]
    pub fn peer_agent_id(&self) -> &AgentId {
        &self.peer_agent_id
    }

    /// The underlying direct connection, if [`SessionHandle::mode`] is
    /// [`SessionMode::Direct`].
    #[must_use]
    pub fn connection(&self) -> Option<&Arc<dyn Connection>> {
        match &self.inner {
            SessionHandleInner::Direct { connection } => Some(connection),
            SessionHandleInner::Relay { .. } => None,
        }
    }

    /// The relay coordinates and transport, if [`SessionHandle::mode`] is
    /// [`SessionMode::Relay`].
    #[must_use]
    pub fn relay(&self) -> Option<(&RelayInfo, &Arc<dyn RelayTransport>)> {
        match &self.inner {
            SessionHandleInner::Relay { relay, transport, .. } => Some((relay, transport)),
            SessionHandleInner::Direct { .. } => None,
        }
    }

    /// Whether the relay peer had already bound by the time this handle
    /// was returned. `false` is not an error: it signals the caller may
    /// wait the peer out or proceed with a best-effort send. Meaningless
    /// (always `false`) for a `Direct` handle.
    #[must_use]
    pub fn peer_ready(&self) -> bool {
        matches!(
            &self.inner,
            SessionHandleInner::Relay { peer_ready: true, .. }
        )
    }

    /// The bearer token shared with the relay bind call, if this is a
    /// `Relay` handle.
    #[must_use]
    pub fn token(&self) -> Option<&Token> {
        match &self.inner {
            SessionHandleInner::Relay { token, .. } => Some(token),
            SessionHandleInner::Direct { .. } => None,
        }
    }

    /// Idempotently close the underlying transport resource.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        match &self.inner {
            SessionHandleInner::Direct { connection } => connection.close().await,
            SessionHandleInner::Relay { transport, .. } => transport.close().await,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::transport::{Connection, Stream};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering as O};

    struct CountingConnection {
        closes: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Connection for CountingConnection {
        async fn open_bi(&self) -> Result<Box<dyn Stream>, crate::error::TransportError> {
            unimplemented!("not exercised by this test")
        }
        async fn accept_bi(&self) -> Result<Box<dyn Stream>, crate::error::TransportError> {
            unimplemented!("not exercised by this test")
        }
        async fn close(&self) {
            self.closes.fetch_add(1, O::SeqCst);
        }
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let closes = Arc::new(AtomicU32::new(0));
        let connection: Arc<dyn Connection> = Arc::new(CountingConnection {
            closes: Arc::clone(&closes),
        });
        let handle = SessionHandle::direct(
            SessionId::new("s1").unwrap(),
            AgentId::new("peer-b").unwrap(),
            connection,
        );
        handle.close().await;
        handle.close().await;
        assert_eq!(closes.load(O::SeqCst), 1);
    }
}
