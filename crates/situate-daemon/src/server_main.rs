//! Capture server.
//!
//! Hosts the rendezvous directory and consumes capture sessions from a
//! capture client:
//!
//!   situate-server --port 13331 --advertise 192.168.1.20

use clap::Parser;
use situate_core::DEFAULT_RENDEZVOUS_PORT;
use situate_session::{CaptureServer, ServerEvent, SessionSettings};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "situate-server", about = "Situate capture server")]
struct Args {
    /// Interface to listen on.
    #[arg(long, env = "SITUATE_BIND", default_value = "0.0.0.0")]
    bind: String,
    /// Rendezvous port.
    #[arg(long, short, env = "SITUATE_RENDEZVOUS_PORT", default_value_t = DEFAULT_RENDEZVOUS_PORT)]
    port: u16,
    /// Host clients should use to reach this server's streams.
    #[arg(long, env = "SITUATE_ADVERTISE", default_value = "127.0.0.1")]
    advertise: String,
    /// Session settings (TOML).
    #[arg(long, env = "SITUATE_SETTINGS")]
    settings: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("situate=info".parse()?))
        .init();

    let args = Args::parse();
    let mut settings = SessionSettings::load_or_default(args.settings.as_deref())?;
    settings.bind_host = args.bind.clone();

    let server = CaptureServer::start(settings, (args.bind.as_str(), args.port), args.advertise)
        .await?;
    tracing::info!("Capture server ready on {}", server.local_addr());

    let mut events = server.subscribe();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                signal?;
                tracing::info!("Shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(ServerEvent::SessionStarted { client }) => {
                    tracing::info!("Capturing from {}", client);
                }
                Ok(ServerEvent::SessionEnded { client, error: None }) => {
                    tracing::info!("Session with {} finished", client);
                }
                Ok(ServerEvent::SessionEnded { client, error: Some(error) }) => {
                    tracing::warn!("Session with {} failed: {}", client, error);
                }
                Ok(ServerEvent::Rejected { process, reason }) => {
                    tracing::warn!("Rejected {}: {}", process, reason);
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }

    server.shutdown().await;
    Ok(())
}
