//! Demonstration harness for `gann-session-core`.
//!
//! This binary is not the product: it is a thin driver that opens a
//! signaling channel and runs one negotiation to completion, printing the
//! resulting session handle. See `gann demo --help` for the loopback mode
//! that needs no directory service to try out.

mod loopback;
mod loopback_socket;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gann_session_core::prelude::*;
use gann_session_core::socket::TungsteniteSocket;
use gann_session_core::token::ReqwestDirectoryClient;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "gann", about = "Demonstration CLI for the gann session-negotiation core")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a signaling token from a directory and print it.
    Token {
        /// Directory base URL, e.g. https://directory.example
        #[arg(long, env = "GANN_DIRECTORY_URL")]
        directory_url: String,
        /// Directory API key.
        #[arg(long, env = "GANN_API_KEY")]
        api_key: String,
        /// This agent's id.
        #[arg(long, env = "GANN_AGENT_ID")]
        agent_id: String,
    },
    /// Open a signaling channel against a directory. Proves out signaling
    /// connectivity; wiring a real `TransportFactory` into
    /// `negotiation::dial` is left to the integrator (spec §1 treats QUIC
    /// and relay transport as external collaborators).
    Dial {
        /// Directory base URL.
        #[arg(long, env = "GANN_DIRECTORY_URL")]
        directory_url: String,
        /// Directory API key.
        #[arg(long, env = "GANN_API_KEY")]
        api_key: String,
        /// This agent's id.
        #[arg(long, env = "GANN_AGENT_ID")]
        agent_id: String,
        /// The peer agent id to dial.
        #[arg(long)]
        peer_agent_id: String,
    },
    /// Run one full negotiation (initiator and responder) in a single
    /// process over a loopback transport, with no directory or network
    /// required. Prints both resulting `SessionHandle`s.
    Demo {
        /// Make the initiator give up on a resolved session id quickly,
        /// forcing a relay fallback instead of a direct session.
        #[arg(long)]
        force_relay: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Token {
            directory_url,
            api_key,
            agent_id,
        } => run_token(&directory_url, &api_key, &agent_id).await,
        Commands::Dial {
            directory_url,
            api_key,
            agent_id,
            peer_agent_id,
        } => run_dial(&directory_url, &api_key, &agent_id, &peer_agent_id).await,
        Commands::Demo { force_relay } => run_demo(force_relay).await,
    }
}

async fn run_token(directory_url: &str, api_key: &str, agent_id: &str) -> Result<()> {
    let agent_id = AgentId::new(agent_id).context("invalid --agent-id")?;
    let client = ReqwestDirectoryClient::new(directory_url, api_key);
    let token = client
        .issue_signaling_token(&agent_id)
        .await
        .context("token request failed")?;
    println!("token: {}", token.value());
    println!("expires_at: {}", token.raw_expires_at());
    println!("signaling_url: {}", client.signaling_url(&token));
    Ok(())
}

async fn run_dial(
    directory_url: &str,
    api_key: &str,
    agent_id: &str,
    peer_agent_id: &str,
) -> Result<()> {
    let agent_id = AgentId::new(agent_id).context("invalid --agent-id")?;
    let peer_agent_id = AgentId::new(peer_agent_id).context("invalid --peer-agent-id")?;

    let client = ReqwestDirectoryClient::new(directory_url, api_key);
    let token = client
        .issue_signaling_token(&agent_id)
        .await
        .context("token request failed")?;
    let url = client.signaling_url(&token);

    let socket = TungsteniteSocket::connect(&url)
        .await
        .map_err(anyhow::Error::msg)
        .context("signaling socket connect failed")?;
    let channel = SignalingChannel::open(agent_id, Arc::new(socket), Some(token));
    channel.ready().await.context("channel never became ready")?;
    tracing::info!(peer = peer_agent_id.as_str(), "channel ready, dialling peer");

    println!(
        "connected as {} to {}. Wire in a TransportFactory to run negotiation::dial(); \
         this subcommand only proves out signaling connectivity.",
        channel.agent_id(),
        peer_agent_id
    );
    Ok(())
}

async fn run_demo(force_relay: bool) -> Result<()> {
    let (peer_server, peer_client) = loopback::connected_pair();
    let relay_client = Arc::new(loopback::LoopbackRelayClient::new());

    let initiator_factory = Arc::new(loopback::LoopbackTransportFactory::new(
        Arc::clone(&peer_server),
        Arc::clone(&peer_client),
        Arc::clone(&relay_client),
    ));
    let responder_factory = Arc::new(loopback::LoopbackTransportFactory::new(
        peer_server,
        peer_client,
        relay_client,
    ));

    let initiator_id = AgentId::new("agent-initiator")?;
    let responder_id = AgentId::new("agent-responder")?;
    let token = Token::parse("demo-token", "2099-01-01T00:00:00Z")?;

    let mut initiator_options = InitiatorOptions::new(token.clone());
    if force_relay {
        initiator_options.direct_timeout = Duration::from_millis(1);
        initiator_options.session_id_policy = SessionIdPolicy::FallBackIfSessionIdMissing;
    }
    let responder_options = ResponderOptions::new(token);

    let (initiator_socket, responder_socket) =
        loopback_socket::pair(initiator_id.as_str(), responder_id.as_str());
    let initiator_channel = SignalingChannel::open(initiator_id, initiator_socket, None);
    let responder_channel = SignalingChannel::open(responder_id.clone(), responder_socket, None);
    initiator_channel
        .ready()
        .await
        .context("initiator channel never opened")?;
    responder_channel
        .ready()
        .await
        .context("responder channel never opened")?;

    let accept_options = AcceptOptions {
        offer_timeout: Duration::from_secs(5),
    };

    let responder_task = tokio::spawn(gann_session_core::accept_any(
        Arc::clone(&responder_channel),
        responder_factory,
        responder_options,
        accept_options,
    ));

    let initiator_handle = gann_session_core::dial(
        initiator_channel,
        responder_id,
        initiator_factory,
        initiator_options,
    )
    .await
    .context("initiator negotiation failed")?;

    let responder_handle = responder_task
        .await
        .context("responder task panicked")?
        .context("responder negotiation failed")?;

    println!(
        "initiator: mode={:?} session_id={} peer={}",
        initiator_handle.mode(),
        initiator_handle.session_id(),
        initiator_handle.peer_agent_id()
    );
    println!(
        "responder: mode={:?} session_id={} peer={}",
        responder_handle.mode(),
        responder_handle.session_id(),
        responder_handle.peer_agent_id()
    );

    initiator_handle.close().await;
    responder_handle.close().await;
    Ok(())
}
