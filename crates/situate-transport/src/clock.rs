//! Reference clock export and import.
//!
//! The exporter answers time requests with its own clock. The importer sends
//! its local time `t0`, receives the exporter's `ts`, stamps the arrival as
//! `t1`, and estimates the offset as `ts - (t0 + t1) / 2`. Of several
//! samples the one with the shortest round trip wins. After that,
//! [`SyncedClock::now`] on the importer reads the exporter's timeline.
//!
//! ```text
//! importer -> i64 t0                     (little endian)
//! exporter -> i64 t0, i64 ts
//! ```

use crate::{Error, Result};
use situate_core::{Endpoint, Micros, now_micros};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

/// Exchanges taken when importing.
pub const DEFAULT_SAMPLES: usize = 5;

/// How long an importer waits for the first synchronization.
pub const DEFAULT_SYNC_WAIT: Duration = Duration::from_secs(10);

pub struct ClockExporter {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ClockExporter {
    pub async fn bind(addr: impl tokio::net::ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::debug!("Clock exporter listening on {}", local_addr);

        // Importer connections belong to the accept task and end with it.
        let task = tokio::spawn(async move {
            let mut importers = JoinSet::new();
            loop {
                let (socket, peer) = tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("Clock exporter accept failed: {}", e);
                            continue;
                        }
                    },
                    Some(_) = importers.join_next(), if !importers.is_empty() => continue,
                };
                importers.spawn(async move {
                    if let Err(e) = serve(socket).await {
                        tracing::debug!("Clock importer {} left: {}", peer, e);
                    }
                });
            }
        });

        Ok(Self { local_addr, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Endpoint advertising this exporter at `host`.
    pub fn endpoint(&self, host: &str) -> Endpoint {
        Endpoint::clock_exporter(host, self.local_addr.port())
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for ClockExporter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut socket: TcpStream) -> Result<()> {
    socket.set_nodelay(true)?;
    loop {
        let t0 = match socket.read_i64_le().await {
            Ok(t0) => t0,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let mut reply = [0u8; 16];
        reply[..8].copy_from_slice(&t0.to_le_bytes());
        reply[8..].copy_from_slice(&now_micros().to_le_bytes());
        socket.write_all(&reply).await?;
    }
}

/// Local clock corrected onto a remote reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncedClock {
    offset: Micros,
    round_trip: Micros,
}

impl SyncedClock {
    /// Pick the tightest `(t0, ts, t1)` exchange.
    pub fn estimate(samples: &[(Micros, Micros, Micros)]) -> Option<Self> {
        samples
            .iter()
            .filter(|(t0, _, t1)| t1 >= t0)
            .min_by_key(|(t0, _, t1)| t1 - t0)
            .map(|&(t0, ts, t1)| Self {
                offset: ts - (t0 + (t1 - t0) / 2),
                round_trip: t1 - t0,
            })
    }

    pub fn offset(&self) -> Micros {
        self.offset
    }

    pub fn round_trip(&self) -> Micros {
        self.round_trip
    }

    /// Current time on the reference timeline.
    pub fn now(&self) -> Micros {
        self.to_reference(now_micros())
    }

    pub fn to_reference(&self, local: Micros) -> Micros {
        local + self.offset
    }
}

/// Synchronize with the exporter at `host:port`, giving up after `wait`.
pub async fn import_clock(host: &str, port: u16, wait: Duration) -> Result<SyncedClock> {
    let clock = tokio::time::timeout(wait, sample(host, port, DEFAULT_SAMPLES))
        .await
        .map_err(|_| Error::ClockSyncTimeout(wait))??;
    tracing::info!(
        "Clock synchronized with {}:{} (offset {}us, round trip {}us)",
        host,
        port,
        clock.offset(),
        clock.round_trip()
    );
    Ok(clock)
}

async fn sample(host: &str, port: u16, count: usize) -> Result<SyncedClock> {
    let mut socket = TcpStream::connect((host, port)).await?;
    socket.set_nodelay(true)?;

    let mut samples = Vec::with_capacity(count);
    for _ in 0..count {
        let t0 = now_micros();
        socket.write_all(&t0.to_le_bytes()).await?;
        let echoed = socket.read_i64_le().await?;
        let ts = socket.read_i64_le().await?;
        let t1 = now_micros();
        if echoed == t0 {
            samples.push((t0, ts, t1));
        }
    }

    SyncedClock::estimate(&samples).ok_or(Error::Closed)
}
