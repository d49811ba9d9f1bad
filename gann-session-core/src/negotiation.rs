//! Direct-first QUIC negotiation: the initiator driver (C6), the responder
//! driver (C7), and the accept-any dispatcher (§4.9) that feeds it an
//! inbound offer.
//!
//! Both drivers race a direct QUIC attempt against the directory's relay
//! announcement without cancelling either side (Design Notes: "not true
//! task cancellation"). Each wait is spawned onto its own task so the
//! loser keeps running in the background and can still be awaited once the
//! winner's outcome is known.

use crate::channel::{ChannelEvent, ChannelEventKind, SignalingChannel};
use crate::error::{
    ChannelTerminated, GannError, GannResult, NegotiationTimeout, TransportError, ValidationError,
};
use crate::ids::{AgentId, SessionId};
use crate::session::SessionHandle;
use crate::sync_util::lock;
use crate::token::Token;
use crate::transport::{
    normalize_candidates, Connection, RelayTransport, TransportFactory,
};
use crate::wire::{QuicAnswerData, RelayInfo, SignalingEvent, SignalingPayload};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Resolution for the open question in spec §9: whether a direct
/// connection that succeeds without a resolved session id should be kept
/// as-is or abandoned in favour of relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionIdPolicy {
    /// Default, documented behaviour: treat a grace timeout as a failure
    /// to bind the session id and fall through to the relay path, closing
    /// the (viable) direct connection.
    FallBackIfSessionIdMissing,
    /// Keep the direct connection, assigning it a locally-generated
    /// placeholder session id instead of falling back.
    UseDirectWithoutSessionId,
}

impl Default for SessionIdPolicy {
    fn default() -> Self {
        Self::FallBackIfSessionIdMissing
    }
}

/// Options for [`dial`] (spec §4.6, options table in §6).
#[derive(Debug, Clone)]
pub struct InitiatorOptions {
    /// Deadline for the direct QUIC accept. Default 5000ms.
    pub direct_timeout: Duration,
    /// Local UDP bind address for the direct `PeerServer`. Default `0.0.0.0:0`.
    pub direct_bind_addr: String,
    /// Local UDP bind address for the relay transport. Default `0.0.0.0:0`.
    pub relay_bind_addr: String,
    /// Candidate overrides advertised in the offer, if any.
    pub advertised_candidates: Option<Vec<String>>,
    /// Bearer token for signaling and relay bind.
    pub token: Token,
    /// See [`SessionIdPolicy`].
    pub session_id_policy: SessionIdPolicy,
}

impl InitiatorOptions {
    /// Defaults from spec §6, scoped to `token` (no default bearer token
    /// exists).
    #[must_use]
    pub fn new(token: Token) -> Self {
        Self {
            direct_timeout: Duration::from_millis(5000),
            direct_bind_addr: "0.0.0.0:0".to_string(),
            relay_bind_addr: "0.0.0.0:0".to_string(),
            advertised_candidates: None,
            token,
            session_id_policy: SessionIdPolicy::default(),
        }
    }
}

/// Options for [`respond`] (spec §4.7).
#[derive(Debug, Clone)]
pub struct ResponderOptions {
    /// Deadline for the direct QUIC connect attempt. Default 5000ms.
    pub direct_timeout: Duration,
    /// Local UDP bind address for the direct `PeerClient`. Default `0.0.0.0:0`.
    pub direct_bind_addr: String,
    /// Local UDP bind address for the relay transport. Default `0.0.0.0:0`.
    pub relay_bind_addr: String,
    /// Bearer token for relay bind.
    pub token: Token,
}

impl ResponderOptions {
    /// Defaults from spec §6, scoped to `token`.
    #[must_use]
    pub fn new(token: Token) -> Self {
        Self {
            direct_timeout: Duration::from_millis(5000),
            direct_bind_addr: "0.0.0.0:0".to_string(),
            relay_bind_addr: "0.0.0.0:0".to_string(),
            token,
        }
    }
}

/// Options for [`accept_any`] (spec §4.9).
#[derive(Debug, Clone)]
pub struct AcceptOptions {
    /// Bound on the overall wait for an inbound offer. Default 30000ms.
    pub offer_timeout: Duration,
}

impl Default for AcceptOptions {
    fn default() -> Self {
        Self {
            offer_timeout: Duration::from_millis(30_000),
        }
    }
}

/// Convert a spawned task's join failure (panic or cancellation) into the
/// aggregate error type, instead of panicking the awaiting caller too.
fn join_err(label: &'static str, e: tokio::task::JoinError) -> GannError {
    GannError::from(TransportError(format!("{label} task failed: {e}")))
}

/// One fully decoded inbound event matching an awaited predicate, or a
/// signal that the channel went away first.
enum WaitOutcome<T> {
    Matched(T),
    Terminated(Option<u16>, Option<String>),
}

/// Subscribe to `kind`, resolving the first event for which `predicate`
/// returns `Some`, or rejecting if the channel closes/errors first.
/// Always unsubscribes before returning (spec S6: "no subscriptions remain
/// on the channel").
async fn wait_for<T, P>(
    channel: &Arc<SignalingChannel>,
    deadline: Duration,
    label: &'static str,
    predicate: P,
) -> GannResult<T>
where
    T: Send + 'static,
    P: Fn(&SignalingEvent) -> Option<T> + Send + Sync + 'static,
{
    let (tx, rx) = tokio::sync::oneshot::channel::<WaitOutcome<T>>();
    let tx = Arc::new(Mutex::new(Some(tx)));

    let tx_sig = Arc::clone(&tx);
    let sig_id = channel.on(ChannelEventKind::Signaling, move |event| {
        if let ChannelEvent::Signaling(ev) = event {
            if let Some(matched) = predicate(ev) {
                if let Some(tx) = lock(&tx_sig).take() {
                    let _ = tx.send(WaitOutcome::Matched(matched));
                }
            }
        }
    });
    let tx_close = Arc::clone(&tx);
    let close_id = channel.on(ChannelEventKind::Close, move |event| {
        if let ChannelEvent::Close { code, reason } = event {
            if let Some(tx) = lock(&tx_close).take() {
                let _ = tx.send(WaitOutcome::Terminated(*code, reason.clone()));
            }
        }
    });
    let tx_err = Arc::clone(&tx);
    let err_id = channel.on(ChannelEventKind::Error, move |event| {
        if let ChannelEvent::Error(message) = event {
            if let Some(tx) = lock(&tx_err).take() {
                let _ = tx.send(WaitOutcome::Terminated(None, Some(message.clone())));
            }
        }
    });

    let outcome = tokio::time::timeout(deadline, rx).await;
    channel.off(ChannelEventKind::Signaling, sig_id);
    channel.off(ChannelEventKind::Close, close_id);
    channel.off(ChannelEventKind::Error, err_id);

    match outcome {
        Ok(Ok(WaitOutcome::Matched(value))) => Ok(value),
        Ok(Ok(WaitOutcome::Terminated(code, reason))) => {
            Err(GannError::from(ChannelTerminated { code, reason }))
        }
        Ok(Err(_)) | Err(_) => Err(GannError::from(NegotiationTimeout::new(label))),
    }
}

fn relay_info_of(event: &SignalingEvent) -> Option<RelayInfo> {
    match &event.payload {
        SignalingPayload::QuicRelay { relay } => Some(relay.clone()),
        _ => None,
    }
}

async fn direct_accept(
    peer_server: Arc<dyn crate::transport::PeerServer>,
    timeout: Duration,
) -> GannResult<Box<dyn Connection>> {
    match tokio::time::timeout(timeout, peer_server.accept()).await {
        Ok(Ok(connection)) => Ok(connection),
        Ok(Err(e)) => Err(GannError::from(e)),
        Err(_) => Err(GannError::from(NegotiationTimeout::new("direct QUIC accept"))),
    }
}

/// Bind a session on the relay, polling every 100ms until the peer is
/// bound or `deadline` elapses (spec §4.6: "poll every 100 ms").
async fn bind_relay_with_retry(
    transport: &dyn RelayTransport,
    token: &str,
    session_id: &str,
    deadline: Duration,
) -> GannResult<bool> {
    let start = std::time::Instant::now();
    let mut peer_ready = transport
        .relay_bind(token, session_id)
        .await
        .map_err(GannError::from)?;
    while !peer_ready && start.elapsed() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
        peer_ready = transport
            .relay_bind(token, session_id)
            .await
            .map_err(GannError::from)?;
    }
    Ok(peer_ready)
}

async fn connect_relay(
    factory: &Arc<dyn TransportFactory>,
    relay_bind_addr: &str,
    relay_info: RelayInfo,
    session_id: SessionId,
    peer_agent_id: AgentId,
    token: Token,
    bind_deadline: Duration,
) -> GannResult<SessionHandle> {
    let relay_client = factory
        .create_relay_client(relay_bind_addr)
        .await
        .map_err(GannError::from)?;
    let transport = relay_client
        .connect_transport(&relay_info)
        .await
        .map_err(GannError::from)?;
    let transport: Arc<dyn RelayTransport> = Arc::from(transport);
    let peer_ready = bind_relay_with_retry(
        transport.as_ref(),
        token.value(),
        session_id.as_str(),
        bind_deadline,
    )
    .await?;
    Ok(SessionHandle::relay(
        session_id,
        peer_agent_id,
        relay_info,
        transport,
        peer_ready,
        token,
    ))
}

/// Direct-first initiator (C6, spec §4.6).
///
/// # Errors
///
/// Fatal per spec §4.6: the signaling channel closes/errors before the
/// relay event arrives and the direct attempt has already failed, or the
/// relay bind itself errors.
#[tracing::instrument(skip(channel, peer_agent_id, factory, options), fields(peer = %peer_agent_id))]
pub async fn dial(
    channel: Arc<SignalingChannel>,
    peer_agent_id: AgentId,
    factory: Arc<dyn TransportFactory>,
    options: InitiatorOptions,
) -> GannResult<SessionHandle> {
    let peer_server = factory
        .create_peer_server(&options.direct_bind_addr)
        .await
        .map_err(GannError::from)?;

    let mut offer = peer_server
        .offer(options.advertised_candidates.as_deref())
        .await
        .map_err(GannError::from)?;
    offer.candidates = normalize_candidates(&offer.candidates);

    channel.send_quic_offer(peer_agent_id.as_str(), offer)?;

    let relay_deadline = options.direct_timeout.max(Duration::from_millis(2000));
    let relay_peer = peer_agent_id.clone();
    let relay_channel = Arc::clone(&channel);
    let mut relay_handle = tokio::spawn(async move {
        wait_for(&relay_channel, relay_deadline, "signaling event", move |ev| {
            if ev.from.trim() != relay_peer.as_str() {
                return None;
            }
            relay_info_of(ev)
        })
        .await
    });

    let direct_handle = tokio::spawn(direct_accept(
        Arc::clone(&peer_server),
        options.direct_timeout,
    ));
    let direct_result = direct_handle
        .await
        .map_err(|e| join_err("direct accept", e))?;

    match direct_result {
        Ok(connection) => {
            let connection: Arc<dyn Connection> = Arc::from(connection);
            let grace = Duration::from_millis(2000);
            match tokio::time::timeout(grace, &mut relay_handle).await {
                Ok(join_result) => {
                    let relay = join_result.map_err(|e| join_err("relay wait", e))??;
                    let session_id =
                        SessionId::new(relay.session_id.clone()).map_err(GannError::from)?;
                    Ok(SessionHandle::direct(session_id, peer_agent_id, connection))
                }
                Err(_) => match options.session_id_policy {
                    SessionIdPolicy::UseDirectWithoutSessionId => {
                        tracing::warn!(
                            peer = peer_agent_id.as_str(),
                            "direct session established without a resolved session id"
                        );
                        let session_id = SessionId::new(format!(
                            "unresolved-{}",
                            uuid::Uuid::new_v4()
                        ))
                        .map_err(GannError::from)?;
                        Ok(SessionHandle::direct(session_id, peer_agent_id, connection))
                    }
                    SessionIdPolicy::FallBackIfSessionIdMissing => {
                        tracing::warn!(
                            peer = peer_agent_id.as_str(),
                            "session id grace elapsed on a viable direct connection; falling back to relay"
                        );
                        connection.close().await;
                        let relay = relay_handle
                            .await
                            .map_err(|e| join_err("relay wait", e))??;
                        let session_id =
                            SessionId::new(relay.session_id.clone()).map_err(GannError::from)?;
                        connect_relay(
                            &factory,
                            &options.relay_bind_addr,
                            relay,
                            session_id,
                            peer_agent_id,
                            options.token,
                            relay_deadline,
                        )
                        .await
                    }
                },
            }
        }
        Err(_direct_err) => {
            let relay = relay_handle
                .await
                .map_err(|e| join_err("relay wait", e))??;
            let session_id = SessionId::new(relay.session_id.clone()).map_err(GannError::from)?;
            connect_relay(
                &factory,
                &options.relay_bind_addr,
                relay,
                session_id,
                peer_agent_id,
                options.token,
                relay_deadline,
            )
            .await
        }
    }
}

/// Direct-first responder (C7, spec §4.7).
///
/// `offer_event` must carry a [`SignalingPayload::QuicOffer`]; `cached_relay`
/// is the optimisation described in §4.9: a `quic_relay` event for the same
/// session id the accept dispatcher may have already observed.
///
/// # Errors
///
/// Returns [`ValidationError::MalformedPayload`] if `offer_event` does not
/// carry a `QuicOffer`, or any error from the relay path per spec §7.
#[tracing::instrument(
    skip(channel, offer_event, cached_relay, factory, options),
    fields(peer = %offer_event.from, session_id = %offer_event.session_id)
)]
pub async fn respond(
    channel: Arc<SignalingChannel>,
    offer_event: SignalingEvent,
    cached_relay: Option<SignalingEvent>,
    factory: Arc<dyn TransportFactory>,
    options: ResponderOptions,
) -> GannResult<SessionHandle> {
    let offer = match &offer_event.payload {
        SignalingPayload::QuicOffer { offer } => offer.clone(),
        _ => {
            return Err(GannError::from(ValidationError::MalformedPayload {
                kind: "quic_offer",
                reason: "expected a QuicOffer payload".to_string(),
            }))
        }
    };
    let session_id_raw = offer_event.session_id.clone();
    let peer_agent_id = AgentId::new(offer_event.from.clone()).map_err(GannError::from)?;

    let peer_client = factory
        .create_peer_client(&options.direct_bind_addr)
        .await
        .map_err(GannError::from)?;

    let direct_result = tokio::time::timeout(options.direct_timeout, peer_client.connect(&offer))
        .await
        .map_err(|_| GannError::from(NegotiationTimeout::new("direct QUIC connect")))
        .and_then(|r| r.map_err(GannError::from));

    match direct_result {
        Ok(connection) => {
            let connection: Arc<dyn Connection> = Arc::from(connection);
            let session_id = SessionId::new(session_id_raw).map_err(GannError::from)?;
            channel.send_quic_answer(
                session_id.as_str(),
                peer_agent_id.as_str(),
                QuicAnswerData {
                    accepted: true,
                    mode: Some("direct".to_string()),
                    reason: None,
                },
            )?;
            Ok(SessionHandle::direct(session_id, peer_agent_id, connection))
        }
        Err(_) => {
            let relay_deadline =
                Duration::from_millis(10_000).max(options.direct_timeout.saturating_mul(5));
            let relay = if let Some(event) = cached_relay.as_ref().and_then(relay_info_of) {
                event
            } else {
                let target_session = session_id_raw.clone();
                wait_for(&channel, relay_deadline, "signaling event", move |ev| {
                    if ev.session_id.trim() != target_session.trim() {
                        return None;
                    }
                    relay_info_of(ev)
                })
                .await?
            };
            let session_id = SessionId::new(relay.session_id.clone()).map_err(GannError::from)?;
            let bind_deadline = options.direct_timeout.max(Duration::from_millis(2000));
            let handle = connect_relay(
                &factory,
                &options.relay_bind_addr,
                relay,
                session_id.clone(),
                peer_agent_id.clone(),
                options.token,
                bind_deadline,
            )
            .await?;
            channel.send_quic_answer(
                session_id.as_str(),
                peer_agent_id.as_str(),
                QuicAnswerData {
                    accepted: true,
                    mode: Some("relay".to_string()),
                    reason: None,
                },
            )?;
            Ok(handle)
        }
    }
}

/// Accept-any dispatcher (§4.9): subscribes to every inbound signaling
/// event, caching `quic_relay` events by session id until the first
/// `quic_offer` arrives, then hands both to [`respond`].
///
/// # Errors
///
/// [`NegotiationTimeout`] labelled `quic_offer` if `accept_options.offer_timeout`
/// elapses first; otherwise whatever [`respond`] returns.
#[tracing::instrument(skip(channel, factory, responder_options, accept_options))]
pub async fn accept_any(
    channel: Arc<SignalingChannel>,
    factory: Arc<dyn TransportFactory>,
    responder_options: ResponderOptions,
    accept_options: AcceptOptions,
) -> GannResult<SessionHandle> {
    let relay_cache: Arc<Mutex<HashMap<String, SignalingEvent>>> =
        Arc::new(Mutex::new(HashMap::new()));

    let cache_for_predicate = Arc::clone(&relay_cache);
    let offer_event = wait_for(
        &channel,
        accept_options.offer_timeout,
        "quic_offer",
        move |ev| {
            match &ev.payload {
                SignalingPayload::QuicRelay { .. } => {
                    lock(&cache_for_predicate).insert(ev.session_id.clone(), ev.clone());
                    None
                }
                SignalingPayload::QuicOffer { .. } => Some(ev.clone()),
                _ => None,
            }
        },
    )
    .await?;

    let cached_relay = lock(&relay_cache).get(&offer_event.session_id).cloned();

    respond(channel, offer_event, cached_relay, factory, responder_options).await
}
