//! Error kinds for the session negotiation core.

use thiserror::Error;

/// Rejected input at an API boundary: empty identifiers, malformed offers,
/// sends attempted on an already-closed channel.
#[derive(Error, Debug, Clone)]
pub enum ValidationError {
    /// An `AgentId` or `SessionId` was empty or whitespace-only.
    #[error("{field} must not be empty")]
    EmptyId {
        /// Name of the field that failed validation.
        field: &'static str,
    },

    /// A send was attempted after the channel was closed.
    #[error("signaling channel is closed")]
    ChannelClosed,

    /// An offer or answer payload was missing a required inner field.
    #[error("malformed {kind}: {reason}")]
    MalformedPayload {
        /// The payload kind that failed to parse (`quic_offer`, `quic_answer`, ...).
        kind: &'static str,
        /// Human-readable reason.
        reason: String,
    },
}

/// The signaling socket reached a terminal state.
#[derive(Error, Debug, Clone)]
#[error("signaling channel terminated (code={code:?}, reason={reason:?})")]
pub struct ChannelTerminated {
    /// Close code reported by the socket, if any.
    pub code: Option<u16>,
    /// Close reason reported by the socket, if any.
    pub reason: Option<String>,
}

/// A timed wait in the negotiation protocol elapsed without resolving.
#[derive(Error, Debug, Clone)]
#[error("Timed out waiting for {label}")]
pub struct NegotiationTimeout {
    /// One of the labels enumerated in spec §5: `direct QUIC accept`,
    /// `direct QUIC connect`, `session id`, `quic_offer`, `signaling event`.
    pub label: String,
}

impl NegotiationTimeout {
    /// Build a timeout error carrying the given wait label.
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into() }
    }
}

/// The directory refused or failed to mint a signaling token.
#[derive(Error, Debug, Clone)]
#[error("token error: {0}")]
pub struct TokenError(pub String);

/// An error propagated verbatim from the native transport (QUIC / relay),
/// or from a spawned negotiation task that panicked or was cancelled
/// before it could report its own result.
#[derive(Error, Debug, Clone)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

/// Aggregate error type for the fallible public entry points of the
/// negotiation core (the initiator and responder drivers can fail for any
/// of the reasons below; lower layers return their own narrower error type).
#[derive(Error, Debug, Clone)]
pub enum GannError {
    /// See [`ValidationError`].
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// See [`ChannelTerminated`].
    #[error(transparent)]
    ChannelTerminated(#[from] ChannelTerminated),

    /// See [`NegotiationTimeout`].
    #[error(transparent)]
    Timeout(#[from] NegotiationTimeout),

    /// See [`TokenError`].
    #[error(transparent)]
    Token(#[from] TokenError),

    /// See [`TransportError`].
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Convenience alias for fallible negotiation operations.
pub type GannResult<T> = Result<T, GannError>;
