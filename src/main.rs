mod config;
mod device;
mod events;
mod generator;
mod mcp;
mod midi;
mod ollama;
mod scheduler;
mod sequence;
mod session;
mod state;
mod transport;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use config::{Args, InputChoice, TransportChoice};
use device::ControlInput;
use events::SessionEvent;
use mcp::McpTransport;
use ollama::OllamaClient;
use session::Session;
use transport::{LogTransport, MidiOutTransport, PlaybackTransport};

/// Boxed future returned by the object-safe collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_tracing()?;

    if args.list_ports {
        return list_ports();
    }

    let ollama = OllamaClient::new(
        &args.ollama_url,
        &args.ollama_model,
        Duration::from_secs(args.proposal_timeout_secs),
    )?;
    if args.skip_health_check {
        warn!("Skipping Ollama health check");
    } else {
        ollama
            .health_check()
            .await
            .with_context(|| format!("Ollama is not reachable at {}", ollama.base_url()))?;
        info!("Ollama reachable at {} (model {})", ollama.base_url(), ollama.model());
    }

    let (transport, mcp): (Arc<dyn PlaybackTransport>, Option<Arc<McpTransport>>) =
        match args.transport() {
            TransportChoice::Mcp { command, args: mcp_args, cwd } => {
                let mcp = Arc::new(McpTransport::spawn(&command, &mcp_args, cwd.as_deref()).await?);
                (mcp.clone(), Some(mcp))
            }
            TransportChoice::MidiOut { port } => {
                let out = MidiOutTransport::connect(port)?;
                info!("Playing through MIDI output: {}", out.port_name());
                (Arc::new(out), None)
            }
            TransportChoice::Log => {
                warn!("No playback target configured, sequences will only be logged");
                (Arc::new(LogTransport), None)
            }
        };

    let initial = args.initial_parameters();
    let (session, handle) =
        Session::new(initial, Arc::new(ollama), transport, args.session_config());
    let session_task = session.spawn();
    tokio::spawn(log_events(handle.subscribe()));

    let mut input = ControlInput::new(handle.control_sender());
    match args.input() {
        InputChoice::Raw(path) => input.open_raw(&path).await?,
        InputChoice::Port(index) => input.open_port(index)?,
        InputChoice::None => warn!("No control input configured, parameters stay at {}", initial),
    }

    handle.start()?;
    info!("Playing. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl+C")?;
    info!("Stopping");

    handle.stop()?;
    if let Some(source) = input.current() {
        debug!("closing control input {}", source);
    }
    input.close();
    let last = handle.snapshot().await?;
    info!("Final parameters: {}", last.parameters);
    handle.shutdown()?;
    if let Err(err) = session_task.await {
        error!("session task failed: {err}");
    }
    if let Some(mcp) = mcp {
        mcp.shutdown().await;
    }
    Ok(())
}

fn setup_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|err: Box<dyn std::error::Error + Send + Sync>| {
            anyhow!("failed to initialise tracing: {err}")
        })?;
    Ok(())
}

fn list_ports() -> Result<()> {
    info!("Available MIDI input ports:");
    for (i, name) in device::list_input_ports()?.iter().enumerate() {
        info!("Port {}: {}", i, name);
    }
    info!("Available MIDI output ports:");
    for (i, name) in transport::list_output_ports()?.iter().enumerate() {
        info!("Port {}: {}", i, name);
    }
    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::ParametersChanged(params)) => debug!("Parameters: {}", params),
            Ok(SessionEvent::SequenceGenerated { sequence, source, .. }) => {
                debug!("{:?} sequence ready: {:?}", source, sequence.summary());
            }
            Ok(SessionEvent::PlaybackStarted(params)) => {
                debug!("Playback started at {} BPM", params.tempo);
            }
            Ok(SessionEvent::PlaybackStopped) => debug!("Playback stopped"),
            Ok(SessionEvent::ProposalFailed(reason)) => debug!("Proposal failed: {}", reason),
            Ok(SessionEvent::TransportFailed(reason)) => debug!("Playback failed: {}", reason),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event log fell behind, skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
