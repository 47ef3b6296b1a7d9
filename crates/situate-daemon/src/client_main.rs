//! Capture client.
//!
//! Runs a capture session against a capture server, fed by the synthetic
//! test-pattern device. Server address and auto start come from the
//! connection file, which is created with defaults on first run.
//!
//! Commands on stdin: `start`, `stop`, `ack`, `quit`.

use clap::Parser;
use situate_core::session::{Event, SessionMachine, SessionState};
use situate_session::{CaptureClient, SessionDriver, SessionSettings, SyntheticDevice};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Driver ticks per second.
const FRAME_RATE: f64 = 60.0;

#[derive(Parser, Debug)]
#[command(name = "situate-client", about = "Situate capture client")]
struct Args {
    /// Connection file (`Key:Value` lines).
    #[arg(long, env = "SITUATE_CONNECTION", default_value = "situate-connection.txt")]
    connection: PathBuf,
    /// Session settings (TOML).
    #[arg(long, env = "SITUATE_SETTINGS")]
    settings: Option<PathBuf>,
    /// Start without waiting for `start`, and exit when the session stops.
    #[arg(long)]
    auto_start: bool,
    /// Synthetic capture rate.
    #[arg(long, default_value_t = 30.0)]
    fps: f64,
    /// Stop capturing after this many frames.
    #[arg(long)]
    frames: Option<u64>,
}

fn parse_command(line: &str) -> Option<Event> {
    match line.trim().to_ascii_lowercase().as_str() {
        "start" => Some(Event::Start),
        "stop" => Some(Event::Stop),
        "ack" | "ok" => Some(Event::Acknowledge),
        "quit" | "exit" => Some(Event::Exit),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("situate=info".parse()?))
        .init();

    let args = Args::parse();
    let settings = SessionSettings::load_or_default(args.settings.as_deref())?;

    let mut device = SyntheticDevice::new(args.fps);
    if let Some(frames) = args.frames {
        device = device.with_frame_limit(frames);
    }
    let machine = SessionMachine::new(settings.thresholds(), args.auto_start);
    let host = Arc::new(CaptureClient::new(settings, args.connection, device));
    let mut driver = SessionDriver::new(host, machine);

    let commands = driver.events();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match parse_command(&line) {
                Some(event) => {
                    if !commands.send(event) {
                        return;
                    }
                }
                None => tracing::warn!("Unknown command {:?} (start, stop, ack, quit)", line.trim()),
            }
        }
    });

    let mut frame = tokio::time::interval(Duration::from_secs_f64(1.0 / FRAME_RATE));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut interrupted = false;
    let mut shown = driver.state();

    loop {
        tokio::select! {
            _ = frame.tick() => {
                let state = driver.tick();
                if state != shown {
                    shown = state;
                    match (state, driver.error()) {
                        (SessionState::WaitingToStart, _) => {
                            tracing::info!("Ready, type `start` to begin");
                        }
                        (SessionState::Stopped, Some(error)) => {
                            tracing::warn!("Stopped: {} (type `ack` to continue)", error);
                        }
                        (SessionState::Exited, _) => break,
                        (state, _) => tracing::info!("Session {}", state),
                    }
                }
            }
            signal = &mut shutdown, if !interrupted => {
                signal?;
                interrupted = true;
                tracing::info!("Interrupted, stopping session");
                driver.send(Event::Exit);
            }
        }
    }

    driver.shutdown().await;
    Ok(())
}
