//! Capture server: hosts the rendezvous and consumes capture sessions.
//!
//! The server waits for the capture client's process to appear. For each
//! one it imports the client's clock, checks every advertised stream
//! against its dispatch table, subscribes to them, and only then registers
//! its own process with a heartbeat stream. The heartbeat reports the video
//! and depth rates the server currently receives.
//!
//! A stream type the table does not know ends the session with
//! `Unknown stream type: <name> (<tag>)`; the server process is never
//! registered for it, so the client never sees a heartbeat.

use crate::settings::SessionSettings;
use crate::teardown::TeardownReason;
use anyhow::{Context, bail};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use situate_core::{Endpoint, Heartbeat, Process, RendezvousEvent, StreamDescriptor};
use situate_rendezvous::RendezvousServer;
use situate_transport::{
    DeliveryPolicy, DepthFrame, DispatchTable, ImageFrame, ImuSample, Pose, StreamKind,
    StreamPayload, StreamPublisher, SyncedClock, import_clock, subscribe_endpoint,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};

/// What happened to a capture session, for observers.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Streams are wired and heartbeats are flowing.
    SessionStarted { client: String },
    SessionEnded {
        client: String,
        error: Option<String>,
    },
    /// A process that cannot be served appeared in the directory.
    Rejected { process: String, reason: String },
}

/// A received stream, ready to be drained.
struct WiredStream {
    rate: watch::Receiver<Option<f64>>,
    drain: BoxFuture<'static, situate_transport::Result<()>>,
}

type Wire = fn(Endpoint, StreamDescriptor) -> BoxFuture<'static, situate_transport::Result<WiredStream>>;

fn wire<T: StreamPayload>(
    endpoint: Endpoint,
    stream: StreamDescriptor,
) -> BoxFuture<'static, situate_transport::Result<WiredStream>> {
    async move {
        let mut subscription = subscribe_endpoint::<T>(&endpoint, &stream.name).await?;
        let rate = subscription.rate_updates();
        let drain = async move {
            loop {
                match subscription.recv().await {
                    Ok(envelope) => tracing::trace!(
                        "{} #{} at {}",
                        stream.name,
                        envelope.sequence,
                        envelope.originating_time
                    ),
                    Err(situate_transport::Error::Closed) => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
        }
        .boxed();
        Ok(WiredStream { rate, drain })
    }
    .boxed()
}

fn dispatch_table() -> DispatchTable<Wire> {
    DispatchTable::new()
        .with(StreamKind::Image, wire::<ImageFrame> as Wire)
        .with(StreamKind::Depth, wire::<DepthFrame> as Wire)
        .with(StreamKind::Imu, wire::<ImuSample> as Wire)
        .with(StreamKind::Pose, wire::<Pose> as Wire)
        .with(StreamKind::Text, wire::<String> as Wire)
}

struct ServerContext {
    settings: SessionSettings,
    advertise_host: String,
    rendezvous: Arc<RendezvousServer>,
    table: DispatchTable<Wire>,
    events: broadcast::Sender<ServerEvent>,
}

impl ServerContext {
    fn emit(&self, event: ServerEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}

struct ServerSession {
    client: String,
    stop: oneshot::Sender<TeardownReason>,
    task: JoinHandle<()>,
}

impl ServerSession {
    async fn stop(self, reason: TeardownReason) {
        tracing::debug!("Stopping session with {} on {}", self.client, reason);
        // Already finished on its own if the receiver is gone.
        let _ = self.stop.send(reason);
        if let Err(e) = self.task.await {
            tracing::warn!("Session with {} ended abnormally: {}", self.client, e);
        }
    }
}

pub struct CaptureServer {
    context: Arc<ServerContext>,
    current: Arc<Mutex<Option<ServerSession>>>,
    supervisor: JoinHandle<()>,
}

impl CaptureServer {
    /// Bind the rendezvous server and start waiting for clients. The server's
    /// own endpoints are advertised at `advertise_host`.
    pub async fn start(
        settings: SessionSettings,
        rendezvous_addr: impl tokio::net::ToSocketAddrs,
        advertise_host: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let rendezvous = RendezvousServer::bind(rendezvous_addr)
            .await
            .context("binding rendezvous server")?;
        let (events, _) = broadcast::channel(64);
        let context = Arc::new(ServerContext {
            settings,
            advertise_host: advertise_host.into(),
            rendezvous: Arc::new(rendezvous),
            table: dispatch_table(),
            events,
        });

        let current = Arc::new(Mutex::new(None));
        let supervisor = tokio::spawn(supervise(context.clone(), current.clone()));
        Ok(Self {
            context,
            current,
            supervisor,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.context.rendezvous.local_addr()
    }

    pub fn rendezvous(&self) -> &RendezvousServer {
        &self.context.rendezvous
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.context.events.subscribe()
    }

    /// End the current session and stop serving.
    pub async fn shutdown(&self) {
        self.supervisor.abort();
        if let Some(session) = self.current.lock().await.take() {
            session.stop(TeardownReason::Exit).await;
        }
        self.context.rendezvous.shutdown();
    }
}

impl Drop for CaptureServer {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

async fn supervise(context: Arc<ServerContext>, current: Arc<Mutex<Option<ServerSession>>>) {
    let settings = &context.settings;
    let (snapshot, mut updates) = context.rendezvous.subscribe().await;
    for process in snapshot {
        on_added(&context, &current, process).await;
    }

    loop {
        match updates.recv().await {
            Ok(RendezvousEvent::ProcessAdded(process)) => {
                on_added(&context, &current, process).await;
            }
            Ok(RendezvousEvent::ProcessRemoved(process)) => {
                if process.name == settings.client_process {
                    tracing::info!("{} left", process.name);
                    if let Some(session) = current.lock().await.take() {
                        session.stop(TeardownReason::Completion).await;
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Capture server missed {} directory updates", n);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn on_added(
    context: &Arc<ServerContext>,
    current: &Mutex<Option<ServerSession>>,
    process: Process,
) {
    let settings = &context.settings;
    if process.name == settings.server_process {
        return;
    }

    let rejection = if process.name != settings.client_process {
        Some(format!("Unexpected process: {}", process.name))
    } else if process.version != settings.version {
        Some(format!(
            "Version mismatch: {} advertises version {}, expected {}",
            process.name, process.version, settings.version
        ))
    } else {
        None
    };
    if let Some(reason) = rejection {
        tracing::error!("{}", reason);
        context.emit(ServerEvent::Rejected {
            process: process.name,
            reason,
        });
        return;
    }

    let mut current = current.lock().await;
    if let Some(previous) = current.take() {
        previous.stop(TeardownReason::Completion).await;
    }

    tracing::info!("{} appeared, starting session", process);
    let (stop, stopped) = oneshot::channel();
    let client = process.name.clone();
    let task = tokio::spawn(run_session(context.clone(), process, stopped));
    *current = Some(ServerSession { client, stop, task });
}

/// What a session holds, released when it ends.
#[derive(Default)]
struct Wiring {
    streams: JoinSet<situate_transport::Result<()>>,
    heartbeat: Option<StreamPublisher<Heartbeat>>,
    registered: bool,
}

async fn run_session(
    context: Arc<ServerContext>,
    client: Process,
    stopped: oneshot::Receiver<TeardownReason>,
) {
    let mut wiring = Wiring::default();
    let outcome = tokio::select! {
        outcome = serve(&context, &client, &mut wiring) => outcome,
        reason = stopped => {
            tracing::info!(
                "Session with {} ending on {}",
                client.name,
                reason.unwrap_or(TeardownReason::Exit)
            );
            Ok(())
        }
    };

    wiring.streams.abort_all();
    if let Some(heartbeat) = wiring.heartbeat.take() {
        heartbeat.shutdown();
    }
    if wiring.registered {
        context
            .rendezvous
            .try_remove_process(&context.settings.server_process)
            .await;
    }

    let error = match outcome {
        Ok(()) => {
            tracing::info!("Session with {} ended", client.name);
            None
        }
        Err(e) => {
            tracing::error!("Session with {} failed: {:#}", client.name, e);
            Some(e.root_cause().to_string())
        }
    };
    context.emit(ServerEvent::SessionEnded {
        client: client.name,
        error,
    });
}

async fn serve(context: &ServerContext, client: &Process, wiring: &mut Wiring) -> anyhow::Result<()> {
    let settings = &context.settings;

    let (clock_host, clock_port) = client
        .clock_exporter()
        .with_context(|| format!("{client} advertises no clock"))?;
    let clock = import_clock(clock_host, clock_port, settings.clock_sync_wait())
        .await
        .context("importing clock")?;

    // Reject the whole process before connecting to anything.
    let mut plan = Vec::new();
    for (endpoint, stream) in client.streams() {
        let (kind, wire) = context.table.lookup(stream)?;
        plan.push((kind, *wire, endpoint.clone(), stream.clone()));
    }

    let mut video_rates = Vec::new();
    let mut depth_rates = Vec::new();
    for (kind, wire, endpoint, stream) in plan {
        let name = stream.name.clone();
        let wired = wire(endpoint, stream)
            .await
            .with_context(|| format!("subscribing to {name}"))?;
        match kind {
            StreamKind::Image => video_rates.push(wired.rate),
            StreamKind::Depth => depth_rates.push(wired.rate),
            _ => {}
        }
        wiring.streams.spawn(wired.drain);
        tracing::debug!("Receiving {} from {}", name, client.name);
    }

    let heartbeat = StreamPublisher::<Heartbeat>::bind(
        (settings.bind_host.as_str(), 0u16),
        settings.heartbeat_stream.as_str(),
        DeliveryPolicy::LatestOnly,
    )
    .await
    .context("binding heartbeat stream")?;
    let process = Process::new(&settings.server_process, &settings.version)
        .with_endpoint(heartbeat.endpoint(&context.advertise_host));
    wiring.heartbeat = Some(heartbeat);

    context.rendezvous.try_remove_process(&process.name).await;
    if !context.rendezvous.try_add_process(process).await {
        bail!("process {} is already registered", settings.server_process);
    }
    wiring.registered = true;
    context.emit(ServerEvent::SessionStarted {
        client: client.name.clone(),
    });

    beat(settings, &clock, &video_rates, &depth_rates, wiring).await
}

/// Send heartbeats until a stream ends or fails.
async fn beat(
    settings: &SessionSettings,
    clock: &SyncedClock,
    video_rates: &[watch::Receiver<Option<f64>>],
    depth_rates: &[watch::Receiver<Option<f64>>],
    wiring: &mut Wiring,
) -> anyhow::Result<()> {
    let Some(heartbeat) = wiring.heartbeat.as_ref() else {
        bail!("heartbeat stream not bound");
    };
    let mut ticker = tokio::time::interval(settings.heartbeat_period());

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let beat = Heartbeat {
                    video_rate: fastest(video_rates),
                    depth_rate: fastest(depth_rates),
                    originating_time: clock.now(),
                };
                heartbeat.post(&beat, beat.originating_time).await?;
            }
            Some(ended) = wiring.streams.join_next() => {
                return match ended {
                    Ok(Ok(())) => {
                        tracing::info!("Client closed a stream");
                        Ok(())
                    }
                    Ok(Err(e)) => Err(e.into()),
                    Err(e) => Err(anyhow::anyhow!("stream task failed: {e}")),
                };
            }
        }
    }
}

fn fastest(rates: &[watch::Receiver<Option<f64>>]) -> f64 {
    rates
        .iter()
        .filter_map(|rate| *rate.borrow())
        .fold(0.0, f64::max)
}
