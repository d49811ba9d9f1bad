//! Session negotiation core for the `gann` agent directory SDK.
//!
//! This crate is the hard-engineering core of a client-side SDK that lets
//! independent agents, registered against a central directory service,
//! establish peer-to-peer data sessions over QUIC with transparent
//! fallback to a server-mediated relay. It implements:
//!
//! - A **signaling channel** ([`channel::SignalingChannel`]) that
//!   demultiplexes four event families (`signaling`, `session`, `control`,
//!   `heartbeat`) over one persistent bidirectional socket, queueing sends
//!   submitted before the socket is ready.
//! - A **direct-first negotiation protocol**
//!   ([`negotiation::dial`]/[`negotiation::respond`]/[`negotiation::accept_any`])
//!   that races a direct QUIC connection attempt against a relay-fallback
//!   path and coordinates two peers through asynchronous signaling messages.
//! - A **session handle** ([`session::SessionHandle`]) giving application
//!   code a uniform view over either transport once negotiation finishes.
//!
//! The directory's HTTP surface, the native QUIC/relay transport, and
//! payload schema validation are treated as external collaborators: this
//! crate depends only on the [`token::TokenIssuer`], [`socket::Socket`],
//! and [`transport`] traits, not on any concrete implementation of them
//! (`reqwest`/`tokio-tungstenite`-backed defaults ship behind the `net`
//! feature for integrators who don't want to supply their own).
//!
//! # Example
//!
//! ```rust,no_run
//! use gann_session_core::channel::SignalingChannel;
//! use gann_session_core::ids::AgentId;
//! use gann_session_core::negotiation::{self, InitiatorOptions};
//! use gann_session_core::token::Token;
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     socket: Arc<dyn gann_session_core::socket::Socket>,
//! #     factory: Arc<dyn gann_session_core::transport::TransportFactory>,
//! # ) -> gann_session_core::error::GannResult<()> {
//! let agent_id = AgentId::new("agent-a")?;
//! let channel = SignalingChannel::open(agent_id, socket, None);
//! channel.ready().await?;
//!
//! let token = Token::parse("tok", "2030-01-01T00:00:00Z")?;
//! let handle = negotiation::dial(
//!     channel,
//!     AgentId::new("agent-b")?,
//!     factory,
//!     InitiatorOptions::new(token),
//! )
//! .await?;
//! handle.close().await;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Signaling channel (C3): lifecycle, send queue, event dispatch.
pub mod channel;
/// Typed multi-listener fan-out with unsubscribe tokens (C2).
pub mod emitter;
/// Error kinds for the session negotiation core (spec §7).
pub mod error;
/// Opaque agent/session identifiers (spec §3).
pub mod ids;
/// The direct-first negotiation protocol (C6, C7, §4.9).
pub mod negotiation;
/// The session handle abstraction (C8).
pub mod session;
/// Runtime-polymorphic socket capability (Design Notes).
pub mod socket;
/// Short-lived signaling bearer tokens (C4).
pub mod token;
/// The transport adapter contract (C5).
pub mod transport;
/// Wire codec: frame parsing and command serialisation (C1).
pub mod wire;

mod sync_util;

pub use channel::{ChannelEvent, ChannelEventKind, SignalingChannel};
pub use error::{GannError, GannResult};
pub use ids::{AgentId, SessionId};
pub use negotiation::{accept_any, dial, respond, AcceptOptions, InitiatorOptions, ResponderOptions, SessionIdPolicy};
pub use session::{SessionHandle, SessionMode};
pub use token::Token;

/// Convenience re-exports for integrators pulling in the whole public
/// surface at once.
pub mod prelude {
    pub use crate::channel::{ChannelEvent, ChannelEventKind, SignalingChannel};
    pub use crate::error::{GannError, GannResult};
    pub use crate::ids::{AgentId, SessionId};
    pub use crate::negotiation::{
        accept_any, dial, respond, AcceptOptions, InitiatorOptions, ResponderOptions,
        SessionIdPolicy,
    };
    pub use crate::session::{SessionHandle, SessionMode};
    pub use crate::token::Token;
    pub use crate::transport::TransportFactory;
}
