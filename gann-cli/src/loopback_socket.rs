//! A tiny in-process directory hub that `gann demo` uses to move signaling
//! frames between its two simulated agents.
//!
//! A real directory assigns the session id for a freshly offered session
//! and emits `quic_relay` info to both parties "on every session regardless
//! of the eventual mode" (spec §4.6 step 3). This hub mimics exactly that
//! one behaviour — session id assignment plus relay-info fan-out — so the
//! loopback demo's direct path has a session id to resolve within its
//! grace window instead of hanging until the negotiation times out.

use gann_session_core::socket::{ReadyState, Socket, SocketEvent, SocketSubscription};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type Listener = Arc<dyn Fn(SocketEvent) + Send + Sync>;

struct Hub {
    agents: Mutex<HashMap<String, Vec<(SocketSubscription, Listener)>>>,
    next_listener_id: AtomicU64,
    next_session_id: AtomicU64,
}

impl Hub {
    fn new() -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            next_listener_id: AtomicU64::new(0),
            next_session_id: AtomicU64::new(0),
        }
    }

    fn deliver(&self, agent_id: &str, event: SocketEvent) {
        let agents = self.agents.lock().expect("hub mutex poisoned");
        if let Some(listeners) = agents.get(agent_id) {
            for (_, listener) in listeners {
                listener(event.clone());
            }
        }
    }

    fn mint_session_id(&self) -> String {
        format!("loopback-session-{}", self.next_session_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// One agent's view of the [`Hub`]. Always reports `ReadyState::Open`:
/// there is no handshake to wait for in-process.
pub struct LoopbackSocket {
    agent_id: String,
    hub: Arc<Hub>,
}

fn signaling_frame(session_id: &str, from: &str, to: &str, payload: Value) -> String {
    json!({
        "event": "signaling",
        "payload": {
            "session_id": session_id,
            "from": from,
            "to": to,
            "expires_at": "2099-01-01T00:00:00Z",
            "payload": payload,
        }
    })
    .to_string()
}

impl Socket for LoopbackSocket {
    fn ready_state(&self) -> ReadyState {
        ReadyState::Open
    }

    fn send(&self, text: String) -> Result<(), String> {
        let command: Value = serde_json::from_str(&text).map_err(|e| e.to_string())?;
        let to = command
            .get("to")
            .and_then(Value::as_str)
            .ok_or_else(|| "loopback command missing `to`".to_string())?
            .to_string();
        let payload = command
            .get("payload")
            .cloned()
            .ok_or_else(|| "loopback command missing `payload`".to_string())?;
        let kind = payload.get("kind").and_then(Value::as_str).unwrap_or_default();

        if kind == "quic_offer" {
            let session_id = self.hub.mint_session_id();
            self.hub.deliver(
                &to,
                SocketEvent::Message(signaling_frame(&session_id, &self.agent_id, &to, payload)),
            );
            let relay_payload = json!({
                "kind": "quic_relay",
                "relay": {
                    "session_id": session_id,
                    "quic_addr": "127.0.0.1:4433",
                    "server_fingerprint_sha256": "loopback",
                },
            });
            // Tagged `from` the other party on each side, per spec §4.6
            // step 3 ("a SignalingEvent from peerAgentId with QuicRelay
            // payload").
            self.hub.deliver(
                &self.agent_id,
                SocketEvent::Message(signaling_frame(&session_id, &to, &self.agent_id, relay_payload.clone())),
            );
            self.hub.deliver(
                &to,
                SocketEvent::Message(signaling_frame(&session_id, &self.agent_id, &to, relay_payload)),
            );
        } else {
            let session_id = command
                .get("session_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            self.hub.deliver(
                &to,
                SocketEvent::Message(signaling_frame(&session_id, &self.agent_id, &to, payload)),
            );
        }
        Ok(())
    }

    fn close(&self, code: Option<u16>, reason: Option<String>) {
        self.hub.deliver(&self.agent_id, SocketEvent::Close { code, reason });
    }

    fn subscribe(&self, listener: Box<dyn Fn(SocketEvent) + Send + Sync>) -> SocketSubscription {
        let id = self.hub.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let token = SocketSubscription::new(id);
        let listener: Listener = Arc::from(listener);
        self.hub
            .agents
            .lock()
            .expect("hub mutex poisoned")
            .entry(self.agent_id.clone())
            .or_default()
            .push((token, Arc::clone(&listener)));
        // Mirrors `TungsteniteSocket`: the channel that just subscribed is
        // still mid-construction (`Arc::new_cyclic`'s weak ref cannot
        // upgrade yet), so `Open` has to reach it on a later poll.
        tokio::spawn(async move {
            listener(SocketEvent::Open);
        });
        token
    }

    fn unsubscribe(&self, token: SocketSubscription) {
        if let Some(listeners) = self
            .hub
            .agents
            .lock()
            .expect("hub mutex poisoned")
            .get_mut(&self.agent_id)
        {
            listeners.retain(|(id, _)| *id != token);
        }
    }
}

/// Build two [`Socket`]s, each already open, routed through one in-process
/// directory hub keyed by agent id.
#[must_use]
pub fn pair(agent_a: impl Into<String>, agent_b: impl Into<String>) -> (Arc<dyn Socket>, Arc<dyn Socket>) {
    let hub = Arc::new(Hub::new());
    (
        Arc::new(LoopbackSocket {
            agent_id: agent_a.into(),
            hub: Arc::clone(&hub),
        }) as Arc<dyn Socket>,
        Arc::new(LoopbackSocket {
            agent_id: agent_b.into(),
            hub,
        }) as Arc<dyn Socket>,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn quic_offer_assigns_a_session_id_and_fans_out_relay_info() {
        let (a, b) = pair("agent-a", "agent-b");

        let a_messages: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let b_messages: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        {
            let a_messages = Arc::clone(&a_messages);
            a.subscribe(Box::new(move |event| {
                if let SocketEvent::Message(text) = event {
                    a_messages.lock().unwrap().push(text);
                }
            }));
        }
        {
            let b_messages = Arc::clone(&b_messages);
            b.subscribe(Box::new(move |event| {
                if let SocketEvent::Message(text) = event {
                    b_messages.lock().unwrap().push(text);
                }
            }));
        }

        a.send(
            json!({"type": "signal", "to": "agent-b", "payload": {"kind": "quic_offer", "offer": {}}})
                .to_string(),
        )
        .unwrap();

        // The offer reaches b; relay info fans out to both a and b tagged
        // with the same session id.
        let b_msgs = b_messages.lock().unwrap();
        assert_eq!(b_msgs.len(), 2);
        let offer_frame: Value = serde_json::from_str(&b_msgs[0]).unwrap();
        assert_eq!(offer_frame["payload"]["payload"]["kind"], "quic_offer");
        let relay_to_b: Value = serde_json::from_str(&b_msgs[1]).unwrap();
        assert_eq!(relay_to_b["payload"]["payload"]["kind"], "quic_relay");

        let a_msgs = a_messages.lock().unwrap();
        assert_eq!(a_msgs.len(), 1);
        let relay_to_a: Value = serde_json::from_str(&a_msgs[0]).unwrap();
        assert_eq!(relay_to_a["payload"]["payload"]["kind"], "quic_relay");
        assert_eq!(
            relay_to_a["payload"]["payload"]["relay"]["session_id"],
            relay_to_b["payload"]["payload"]["relay"]["session_id"]
        );
    }
}
