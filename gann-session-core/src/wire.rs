//! Wire codec (C1): parses inbound frames into typed events and serialises
//! outbound commands.
//!
//! Inbound frames are UTF-8 JSON objects of shape `{ event, payload }`.
//! Decoding is lenient: unknown fields are ignored, missing fields are
//! defaulted, and any frame that is not a well-formed JSON object with a
//! recognised `event` and a non-null `payload` is dropped (returns `None`)
//! rather than erroring — the channel has no caller to report a parse
//! failure to.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One fully decoded inbound event, tagged by which of the four families
/// (§1) it belongs to.
#[derive(Debug, Clone)]
pub enum ParsedEvent {
    /// A `signaling` frame.
    Signaling(SignalingEvent),
    /// A `session` frame (lifecycle transition).
    Session(SessionLifecycleEvent),
    /// A `control` frame (server-initiated directive).
    Control(ControlDirective),
    /// A `heartbeat` frame.
    Heartbeat(HeartbeatBroadcast),
}

/// A decoded `signaling` event.
///
/// `from`/`to`/`session_id` are carried as raw strings rather than the
/// validated [`crate::ids::AgentId`]/[`crate::ids::SessionId`] types: the
/// wire is untrusted and decoding must never fail just because a peer sent
/// a blank id. Validation happens where these values cross back into the
/// typed API (outbound sends, negotiation drivers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingEvent {
    /// Session this event belongs to. Empty for a freshly minted
    /// `quic_offer` the directory hasn't assigned an id to yet.
    #[serde(default)]
    pub session_id: String,
    /// Sending agent.
    #[serde(default)]
    pub from: String,
    /// Target agent.
    #[serde(default)]
    pub to: String,
    /// Expiry of this signaling event.
    pub expires_at: DateTime<Utc>,
    /// The decoded payload.
    pub payload: SignalingPayload,
}

/// Tagged sum of signaling payload kinds (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SignalingPayload {
    /// Initiator-advertised QUIC offer.
    QuicOffer {
        /// The offer body.
        offer: QuicOfferData,
    },
    /// Responder's accept/reject reply.
    QuicAnswer {
        /// The answer body.
        answer: QuicAnswerData,
    },
    /// Additional candidate hint. Reserved; passed through opaquely.
    QuicCandidate {
        /// Opaque candidate payload.
        candidate: Value,
    },
    /// Server-provided relay coordinates.
    QuicRelay {
        /// The relay body.
        relay: RelayInfo,
    },
    /// Peer-initiated teardown.
    Disconnect {
        /// Optional human-readable reason.
        reason: Option<String>,
    },
    /// Server-initiated refusal (also the fallback for unrecognised kinds).
    Reject {
        /// Reason for the refusal.
        reason: String,
    },
}

/// QUIC offer parameters (opaque to signaling, interpreted by the
/// transport adapter).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QuicOfferData {
    /// Advertised `host:port` candidates.
    #[serde(default)]
    pub candidates: Vec<String>,
    /// Base64-encoded DER certificate.
    #[serde(default)]
    pub cert_der_b64: String,
    /// SHA-256 fingerprint of the certificate.
    #[serde(default)]
    pub fingerprint_sha256: String,
    /// Negotiated ALPN identifier.
    #[serde(default)]
    pub alpn: String,
    /// TLS server name.
    #[serde(default)]
    pub server_name: String,
    /// Optional E2EE public key, base64-encoded.
    #[serde(default)]
    pub e2ee_pubkey_b64: Option<String>,
}

/// QUIC answer body: an opaque accept/reject reply carrying the chosen
/// transport mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QuicAnswerData {
    /// Whether the responder accepted the offer.
    #[serde(default)]
    pub accepted: bool,
    /// The chosen transport mode (`"direct"` or `"relay"`), if accepted.
    #[serde(default)]
    pub mode: Option<String>,
    /// Rejection reason, if not accepted.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Server-assigned relay coordinates for a session (spec §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RelayInfo {
    /// The session these coordinates belong to.
    #[serde(default)]
    pub session_id: String,
    /// Relay's QUIC-reachable address.
    #[serde(default)]
    pub quic_addr: String,
    /// SHA-256 fingerprint of the relay's certificate.
    #[serde(default)]
    pub server_fingerprint_sha256: String,
    /// Optional ALPN override.
    #[serde(default)]
    pub alpn: Option<String>,
    /// Optional TLS server name override.
    #[serde(default)]
    pub server_name: Option<String>,
}

/// Lifecycle state of a negotiated session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionLifecycleState {
    /// Negotiation in progress.
    Pending,
    /// Transport established.
    Active,
    /// Session torn down.
    Terminated,
}

/// A `session` frame: a lifecycle transition the directory is reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLifecycleEvent {
    /// Session the transition applies to.
    #[serde(default)]
    pub session_id: String,
    /// The agent this event is addressed to.
    #[serde(default)]
    pub target_agent: String,
    /// The other party in the session.
    #[serde(default)]
    pub peer_agent: String,
    /// New lifecycle state.
    pub state: SessionLifecycleState,
    /// Expiry of this lifecycle record.
    pub expires_at: DateTime<Utc>,
    /// Optional reason for the transition (e.g. termination cause).
    #[serde(default)]
    pub reason: Option<String>,
}

/// Server-initiated directive action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    /// Refuse a pending session.
    Reject,
    /// Tear down an active session.
    Disconnect,
    /// A wait elapsed server-side.
    Timeout,
    /// Emergency full stop.
    KillSwitch,
}

/// A `control` frame: a server-initiated directive targeting one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlDirective {
    /// Agent this directive targets.
    #[serde(default)]
    pub target_agent: String,
    /// The directive.
    pub action: ControlAction,
    /// Human-readable reason.
    #[serde(default)]
    pub reason: String,
    /// Session this directive scopes to, if any.
    #[serde(default)]
    pub session_id: Option<String>,
}

/// A `heartbeat` frame broadcasting an agent's liveness and load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatBroadcast {
    /// The reporting agent.
    #[serde(default)]
    pub agent_id: String,
    /// When the heartbeat was recorded.
    pub timestamp: DateTime<Utc>,
    /// Load in `[0, 1]`.
    #[serde(default)]
    pub load: f64,
    /// Free-form status string.
    #[serde(default)]
    pub status: String,
}

/// An outbound command, always `{ type: "signal", session_id?, to, payload }`.
#[derive(Debug, Clone)]
pub struct OutboundCommand {
    /// Target agent.
    pub to: String,
    /// Session id. Omitted on the wire for `quic_offer`.
    pub session_id: Option<String>,
    /// The command payload.
    pub payload: OutboundPayload,
}

/// Outbound payload kinds (a strict subset of [`SignalingPayload`]: a client
/// never emits `quic_relay` or a bare `reject`).
#[derive(Debug, Clone)]
pub enum OutboundPayload {
    /// `quic_offer` — `session_id` MUST be omitted on the wire.
    QuicOffer(QuicOfferData),
    /// `quic_answer` — `session_id` MUST be present.
    QuicAnswer(QuicAnswerData),
    /// `quic_candidate` — `session_id` MUST be present.
    QuicCandidate(Value),
    /// `disconnect` — `session_id` MUST be present.
    Disconnect {
        /// Optional human-readable reason.
        reason: Option<String>,
    },
}

impl OutboundCommand {
    /// Serialise to the wire JSON shape described in spec §6.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let (kind, body): (&str, Value) = match &self.payload {
            OutboundPayload::QuicOffer(offer) => {
                ("quic_offer", serde_json::json!({ "offer": offer }))
            }
            OutboundPayload::QuicAnswer(answer) => {
                ("quic_answer", serde_json::json!({ "answer": answer }))
            }
            OutboundPayload::QuicCandidate(candidate) => {
                ("quic_candidate", serde_json::json!({ "candidate": candidate }))
            }
            OutboundPayload::Disconnect { reason } => {
                ("disconnect", serde_json::json!({ "reason": reason }))
            }
        };
        let mut payload = body;
        if let Value::Object(ref mut map) = payload {
            map.insert("kind".to_string(), Value::String(kind.to_string()));
        }
        let mut frame = serde_json::json!({
            "type": "signal",
            "to": self.to,
            "payload": payload,
        });
        if let Some(session_id) = &self.session_id {
            frame["session_id"] = Value::String(session_id.clone());
        }
        frame
    }

    /// Serialise to a UTF-8 JSON string ready to hand to the socket.
    #[must_use]
    pub fn to_wire_string(&self) -> String {
        self.to_json().to_string()
    }
}

/// Parse one inbound text frame.
///
/// Returns `None` for anything that isn't a JSON object with a recognised
/// `event` field and a non-null `payload` — per the frame is silently
/// dropped rather than surfaced as an error (spec §3, testable property 2).
#[must_use]
pub fn parse_frame(text: &str) -> Option<ParsedEvent> {
    let root: Value = serde_json::from_str(text).ok()?;
    let obj = root.as_object()?;
    let event = obj.get("event")?.as_str()?;
    let payload = obj.get("payload")?;
    if payload.is_null() {
        return None;
    }

    match event {
        "signaling" => Some(ParsedEvent::Signaling(decode_signaling_event(payload))),
        "session" => decode_session_event(payload).map(ParsedEvent::Session),
        "control" => decode_control_directive(payload).map(ParsedEvent::Control),
        "heartbeat" => Some(ParsedEvent::Heartbeat(decode_heartbeat(payload))),
        _ => None,
    }
}

fn str_field(obj: &Value, key: &str) -> String {
    obj.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn parse_timestamp(value: Option<&Value>) -> DateTime<Utc> {
    match value {
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single())
            .unwrap_or_else(Utc::now),
        _ => Utc::now(),
    }
}

fn decode_signaling_event(root: &Value) -> SignalingEvent {
    let session_id = str_field(root, "session_id");
    let from = str_field(root, "from");
    let to = str_field(root, "to");
    let expires_at = parse_timestamp(root.get("expires_at"));
    let empty = Value::Object(serde_json::Map::new());
    let payload = root.get("payload").unwrap_or(&empty);
    SignalingEvent {
        session_id,
        from,
        to,
        expires_at,
        payload: decode_signaling_payload(payload),
    }
}

/// Pick the nested payload value for a QUIC kind, trying the kind-named
/// key, then `payload`, then the whole object, in that priority (spec
/// §4.1).
fn select_nested<'a>(payload: &'a Value, key: &str) -> &'a Value {
    if let Some(v) = payload.get(key) {
        if !v.is_null() {
            return v;
        }
    }
    if let Some(v) = payload.get("payload") {
        if !v.is_null() {
            return v;
        }
    }
    payload
}

fn decode_signaling_payload(payload: &Value) -> SignalingPayload {
    let kind = payload
        .get("kind")
        .or_else(|| payload.get("type"))
        .and_then(Value::as_str)
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match kind.as_str() {
        "quic_offer" => {
            let nested = select_nested(payload, "offer");
            let offer = serde_json::from_value(nested.clone()).unwrap_or_default();
            SignalingPayload::QuicOffer { offer }
        }
        "quic_answer" => {
            let nested = select_nested(payload, "answer");
            let answer = serde_json::from_value(nested.clone()).unwrap_or_default();
            SignalingPayload::QuicAnswer { answer }
        }
        "quic_candidate" => {
            let nested = select_nested(payload, "candidate");
            SignalingPayload::QuicCandidate {
                candidate: nested.clone(),
            }
        }
        "quic_relay" => {
            let nested = select_nested(payload, "relay");
            let relay = serde_json::from_value(nested.clone()).unwrap_or_default();
            SignalingPayload::QuicRelay { relay }
        }
        "disconnect" => SignalingPayload::Disconnect {
            reason: payload
                .get("reason")
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        "reject" => SignalingPayload::Reject {
            reason: payload
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
        },
        _ => SignalingPayload::Reject {
            reason: payload
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
        },
    }
}

fn decode_session_event(payload: &Value) -> Option<SessionLifecycleEvent> {
    let state = match payload.get("state").and_then(Value::as_str) {
        Some("pending") => SessionLifecycleState::Pending,
        Some("active") => SessionLifecycleState::Active,
        Some("terminated") => SessionLifecycleState::Terminated,
        _ => return None,
    };
    Some(SessionLifecycleEvent {
        session_id: str_field(payload, "session_id"),
        target_agent: str_field(payload, "target_agent"),
        peer_agent: str_field(payload, "peer_agent"),
        state,
        expires_at: parse_timestamp(payload.get("expires_at")),
        reason: payload
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

fn decode_control_directive(payload: &Value) -> Option<ControlDirective> {
    let action = match payload.get("action").and_then(Value::as_str) {
        Some("reject") => ControlAction::Reject,
        Some("disconnect") => ControlAction::Disconnect,
        Some("timeout") => ControlAction::Timeout,
        Some("kill_switch") => ControlAction::KillSwitch,
        _ => return None,
    };
    Some(ControlDirective {
        target_agent: str_field(payload, "target_agent"),
        action,
        reason: str_field(payload, "reason"),
        session_id: payload
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

fn decode_heartbeat(payload: &Value) -> HeartbeatBroadcast {
    HeartbeatBroadcast {
        agent_id: str_field(payload, "agent_id"),
        timestamp: parse_timestamp(payload.get("timestamp")),
        load: payload.get("load").and_then(Value::as_f64).unwrap_or(0.0),
        status: str_field(payload, "status"),
    }
}
