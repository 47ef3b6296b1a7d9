//! Capture client: the producing side of a capture session.
//!
//! Sensors sit behind [`CaptureDevice`]. The client publishes their output
//! on TCP stream endpoints, exports its clock as the session's reference,
//! registers itself with the rendezvous server and then waits for the
//! capture server to show up and start sending heartbeats.

use crate::driver::{EventSender, SessionHost};
use crate::settings::SessionSettings;
use crate::teardown::{TeardownGuard, TeardownReason};
use anyhow::{Context, bail};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use situate_core::session::Event;
use situate_core::{
    ConnectionConfig, Endpoint, Heartbeat, Process, RendezvousEvent, StreamDescriptor, now_micros,
};
use situate_rendezvous::{ClientEvent, RendezvousClient};
use situate_transport::{
    ClockExporter, DeliveryPolicy, DepthFrame, ImageFrame, ImuSample, Pose, StreamPublisher,
    subscribe_endpoint,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

pub const VIDEO_STREAM: &str = "Video";
pub const DEPTH_STREAM: &str = "Depth";
pub const IMU_STREAM: &str = "Imu";
pub const HEAD_STREAM: &str = "Head";

/// Sensor hardware behind the capture client.
pub trait CaptureDevice: Send + Sync + 'static {
    /// Find the spatial anchor all poses are expressed against.
    fn locate_world_anchor(&self) -> BoxFuture<'static, anyhow::Result<Pose>>;

    fn calibrate_cameras(&self) -> BoxFuture<'static, anyhow::Result<()>>;

    /// Produce samples into `sink`. Returning `Ok` means the capture ran to
    /// completion on its own.
    fn capture(&self, sink: CaptureSink) -> BoxFuture<'static, anyhow::Result<()>>;

    /// Text streams advertised next to the standard sensor streams.
    fn extra_streams(&self) -> Vec<StreamDescriptor> {
        Vec::new()
    }
}

/// Stream endpoints of one capture pipeline.
pub struct CaptureOutputs {
    video: StreamPublisher<ImageFrame>,
    depth: StreamPublisher<DepthFrame>,
    imu: StreamPublisher<ImuSample>,
    head: StreamPublisher<Pose>,
    extra: Vec<StreamPublisher<String>>,
    anchor: Option<Pose>,
}

impl CaptureOutputs {
    async fn bind(
        host: &str,
        extra: Vec<StreamDescriptor>,
        anchor: Option<Pose>,
    ) -> situate_transport::Result<Self> {
        let addr = (host, 0u16);
        let video = StreamPublisher::bind(addr, VIDEO_STREAM, DeliveryPolicy::LatestOnly).await?;
        let depth = StreamPublisher::bind(addr, DEPTH_STREAM, DeliveryPolicy::LatestOnly).await?;
        let imu = StreamPublisher::bind(addr, IMU_STREAM, DeliveryPolicy::Throttle).await?;
        let head = StreamPublisher::bind(addr, HEAD_STREAM, DeliveryPolicy::Unlimited).await?;

        let mut extras = Vec::with_capacity(extra.len());
        for descriptor in extra {
            extras.push(StreamPublisher::bind_as(addr, descriptor, DeliveryPolicy::Unlimited).await?);
        }

        Ok(Self {
            video,
            depth,
            imu,
            head,
            extra: extras,
            anchor,
        })
    }

    /// One endpoint per stream, advertised at `host`.
    pub fn endpoints(&self, host: &str) -> Vec<Endpoint> {
        let mut endpoints = vec![
            self.video.endpoint(host),
            self.depth.endpoint(host),
            self.imu.endpoint(host),
            self.head.endpoint(host),
        ];
        endpoints.extend(self.extra.iter().map(|p| p.endpoint(host)));
        endpoints
    }

    fn shutdown(&self) {
        self.video.shutdown();
        self.depth.shutdown();
        self.imu.shutdown();
        self.head.shutdown();
        for publisher in &self.extra {
            publisher.shutdown();
        }
    }
}

/// Where a [`CaptureDevice`] writes its samples. Timestamps are taken from
/// the local clock, which is the session's reference.
#[derive(Clone)]
pub struct CaptureSink {
    outputs: Arc<CaptureOutputs>,
}

impl CaptureSink {
    pub fn anchor(&self) -> Option<Pose> {
        self.outputs.anchor
    }

    pub async fn post_video(&self, frame: &ImageFrame) -> situate_transport::Result<()> {
        self.outputs.video.post(frame, now_micros()).await
    }

    pub async fn post_depth(&self, frame: &DepthFrame) -> situate_transport::Result<()> {
        self.outputs.depth.post(frame, now_micros()).await
    }

    pub async fn post_imu(&self, sample: &ImuSample) -> situate_transport::Result<()> {
        self.outputs.imu.post(sample, now_micros()).await
    }

    pub async fn post_head(&self, pose: &Pose) -> situate_transport::Result<()> {
        self.outputs.head.post(pose, now_micros()).await
    }

    pub async fn post_text(&self, stream: &str, text: &str) -> situate_transport::Result<()> {
        let publisher = self
            .outputs
            .extra
            .iter()
            .find(|p| p.descriptor().name == stream)
            .ok_or_else(|| situate_transport::Error::UnknownStream(stream.to_string()))?;
        publisher.post(&text.to_string(), now_micros()).await
    }
}

pub struct CapturePipeline {
    outputs: Arc<CaptureOutputs>,
    run: Option<JoinHandle<()>>,
}

impl CapturePipeline {
    pub fn outputs(&self) -> &CaptureOutputs {
        &self.outputs
    }

    pub fn is_running(&self) -> bool {
        self.run.as_ref().is_some_and(|run| !run.is_finished())
    }
}

/// Everything one connection attempt holds on the rendezvous side.
#[derive(Default)]
struct Registration {
    clock: Option<ClockExporter>,
    rendezvous: Option<Arc<RendezvousClient>>,
    process: Option<String>,
    tasks: Vec<JoinHandle<()>>,
}

struct ClientSession {
    guard: TeardownGuard,
    closed: watch::Sender<bool>,
    registration: tokio::sync::Mutex<Registration>,
}

impl ClientSession {
    fn new() -> Self {
        Self {
            guard: TeardownGuard::new(),
            closed: watch::Sender::new(false),
            registration: tokio::sync::Mutex::new(Registration::default()),
        }
    }

    async fn teardown(&self, reason: TeardownReason) {
        if self.guard.try_begin(reason) {
            self.closed.send_replace(true);
            self.release().await;
        }
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Withdraw the process, stop the client, drop the clock. Safe to call
    /// again; later calls find nothing left.
    async fn release(&self) {
        let mut registration = self.registration.lock().await;
        for task in registration.tasks.drain(..) {
            task.abort();
        }
        if let Some(rendezvous) = registration.rendezvous.take() {
            if let Some(name) = registration.process.take() {
                match rendezvous.try_remove_process(&name).await {
                    Ok(_) => tracing::info!("Withdrew process {}", name),
                    Err(e) => tracing::warn!("Could not withdraw process {}: {}", name, e),
                }
            }
            rendezvous.stop().await;
        }
        if let Some(clock) = registration.clock.take() {
            clock.shutdown();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct CaptureClient<D> {
    settings: SessionSettings,
    config_path: PathBuf,
    device: Arc<D>,
    config: Mutex<ConnectionConfig>,
    anchor: Mutex<Option<Pose>>,
    session: Mutex<Option<Arc<ClientSession>>>,
}

impl<D: CaptureDevice> CaptureClient<D> {
    pub fn new(settings: SessionSettings, config_path: impl Into<PathBuf>, device: D) -> Self {
        Self {
            settings,
            config_path: config_path.into(),
            device: Arc::new(device),
            config: Mutex::new(ConnectionConfig::default()),
            anchor: Mutex::new(None),
            session: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Connection settings from the last configuration load.
    pub fn connection(&self) -> ConnectionConfig {
        lock(&self.config).clone()
    }
}

impl<D: CaptureDevice> SessionHost for CaptureClient<D> {
    type Pipeline = CapturePipeline;

    fn load_configuration(self: Arc<Self>) -> BoxFuture<'static, anyhow::Result<bool>> {
        async move {
            let path = self.config_path.clone();
            let loaded =
                tokio::task::spawn_blocking(move || ConnectionConfig::load_or_init(&path)).await?;
            // A broken file never stops the session; fall back to defaults.
            let config = match loaded {
                Ok((config, warnings)) => {
                    for warning in warnings {
                        tracing::warn!("{}: {}", self.config_path.display(), warning);
                    }
                    config
                }
                Err(e) => {
                    tracing::warn!("Using default connection settings: {}", e);
                    ConnectionConfig::default()
                }
            };
            tracing::info!(
                "Rendezvous server {}:{}{}",
                config.server_address,
                config.rendezvous_port,
                if config.auto_start { ", auto start" } else { "" }
            );
            let auto_start = config.auto_start;
            *lock(&self.config) = config;
            Ok(auto_start)
        }
        .boxed()
    }

    fn locate_world_anchor(self: Arc<Self>) -> BoxFuture<'static, anyhow::Result<()>> {
        let locate = self.device.locate_world_anchor();
        async move {
            let anchor = locate.await.context("locating world anchor")?;
            tracing::info!("World anchor at {:?}", anchor.position);
            *lock(&self.anchor) = Some(anchor);
            Ok(())
        }
        .boxed()
    }

    fn construct_pipeline(self: Arc<Self>) -> BoxFuture<'static, anyhow::Result<CapturePipeline>> {
        async move {
            let anchor = *lock(&self.anchor);
            let outputs =
                CaptureOutputs::bind(&self.settings.bind_host, self.device.extra_streams(), anchor)
                    .await
                    .context("binding stream endpoints")?;
            Ok(CapturePipeline {
                outputs: Arc::new(outputs),
                run: None,
            })
        }
        .boxed()
    }

    fn calibrate_cameras(
        self: Arc<Self>,
        _pipeline: &CapturePipeline,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        let calibrate = self.device.calibrate_cameras();
        async move { calibrate.await.context("calibrating cameras") }.boxed()
    }

    fn connect_to_server(
        self: Arc<Self>,
        pipeline: &CapturePipeline,
        events: EventSender<CapturePipeline>,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        let session = Arc::new(ClientSession::new());
        if let Some(previous) = lock(&self.session).replace(session.clone()) {
            tokio::spawn(async move { previous.teardown(TeardownReason::Completion).await });
        }
        let outputs = pipeline.outputs.clone();

        async move {
            let result = tokio::select! {
                result = connect(&self, &session, &outputs, &events) => result,
                _ = session.closed() => Err(anyhow::anyhow!("session torn down while connecting")),
            };
            if session.guard.is_done() {
                // Anything registered after the teardown ran.
                session.release().await;
            }
            result
        }
        .boxed()
    }

    fn start_pipeline(
        &self,
        pipeline: &mut CapturePipeline,
        events: EventSender<CapturePipeline>,
    ) -> anyhow::Result<()> {
        if pipeline.is_running() {
            bail!("pipeline already running");
        }
        let capture = self.device.capture(CaptureSink {
            outputs: pipeline.outputs.clone(),
        });
        let session = lock(&self.session).clone();

        pipeline.run = Some(tokio::spawn(async move {
            let result = capture.await;
            let reason = match &result {
                Ok(()) => TeardownReason::Completion,
                Err(_) => TeardownReason::Failure,
            };
            if let Some(session) = session {
                session.teardown(reason).await;
            }
            match result {
                Ok(()) => {
                    tracing::info!("Capture completed");
                    events.send(Event::PipelineCompleted);
                }
                Err(e) => {
                    tracing::error!("Capture failed: {:#}", e);
                    events.fail(&e);
                }
            }
        }));
        Ok(())
    }

    fn dispose_pipeline(
        self: Arc<Self>,
        pipeline: CapturePipeline,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        async move {
            if let Some(run) = pipeline.run {
                run.abort();
                let _ = run.await;
            }
            pipeline.outputs.shutdown();
            tracing::debug!("Pipeline disposed");
            Ok(())
        }
        .boxed()
    }

    fn teardown(self: Arc<Self>, reason: TeardownReason) -> BoxFuture<'static, ()> {
        let session = lock(&self.session).clone();
        async move {
            if let Some(session) = session {
                session.teardown(reason).await;
            }
        }
        .boxed()
    }
}

/// Export the clock, register, wait for the server and wire its heartbeat.
async fn connect<D: CaptureDevice>(
    client: &CaptureClient<D>,
    session: &ClientSession,
    outputs: &CaptureOutputs,
    events: &EventSender<CapturePipeline>,
) -> anyhow::Result<()> {
    let settings = &client.settings;
    let config = client.connection();

    let clock = ClockExporter::bind((settings.bind_host.as_str(), 0u16))
        .await
        .context("exporting clock")?;

    let server = format!("{}:{}", config.server_address, config.rendezvous_port);
    let rendezvous = Arc::new(RendezvousClient::start(server.clone()));
    // Subscribe before the handshake so the initial directory is included.
    let mut directory = rendezvous.subscribe();
    {
        let mut registration = session.registration.lock().await;
        registration.rendezvous = Some(rendezvous.clone());
    }
    let host = rendezvous
        .connected()
        .await
        .with_context(|| format!("connecting to rendezvous server {server}"))?;
    tracing::info!("Connected to rendezvous server {} as {}", server, host);

    let mut process = Process::new(&settings.client_process, &settings.version)
        .with_endpoint(clock.endpoint(&host));
    for endpoint in outputs.endpoints(&host) {
        process = process.with_endpoint(endpoint);
    }
    session.registration.lock().await.clock = Some(clock);

    // Clear a registration left behind by a previous run.
    rendezvous.try_remove_process(&process.name).await?;
    session.registration.lock().await.process = Some(settings.client_process.clone());
    if !rendezvous.try_add_process(process).await? {
        bail!("process {} is already registered", settings.client_process);
    }
    tracing::info!("Registered {}, waiting for {}", settings.client_process, settings.server_process);

    let peer = wait_for_server(settings, &mut directory).await?;
    let (endpoint, _) = peer
        .find_stream(&settings.heartbeat_stream)
        .with_context(|| format!("{} has no {} stream", peer.name, settings.heartbeat_stream))?;
    let heartbeats = subscribe_endpoint::<Heartbeat>(endpoint, &settings.heartbeat_stream)
        .await
        .context("subscribing to heartbeat")?;
    tracing::info!("Heartbeat from {} wired", peer);

    let forward = tokio::spawn(forward_heartbeats(heartbeats, events.clone()));
    let watch = tokio::spawn(watch_rendezvous(directory, events.clone()));
    session.registration.lock().await.tasks.extend([forward, watch]);
    Ok(())
}

async fn wait_for_server(
    settings: &SessionSettings,
    directory: &mut broadcast::Receiver<ClientEvent>,
) -> anyhow::Result<Process> {
    loop {
        let event = match directory.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Missed {} rendezvous updates", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => bail!("rendezvous client stopped"),
        };
        match event {
            ClientEvent::Rendezvous(RendezvousEvent::ProcessAdded(process)) => {
                if process.name == settings.client_process {
                    continue;
                }
                if process.name != settings.server_process {
                    bail!("Unexpected process: {}", process.name);
                }
                if process.version != settings.version {
                    bail!(
                        "Version mismatch: {} advertises version {}, expected {}",
                        process.name,
                        process.version,
                        settings.version
                    );
                }
                return Ok(process);
            }
            ClientEvent::Rendezvous(RendezvousEvent::ProcessRemoved(_)) => {}
            ClientEvent::Error(message) => bail!(message),
            ClientEvent::Disconnected => bail!("rendezvous server closed the connection"),
        }
    }
}

async fn forward_heartbeats(
    mut heartbeats: situate_transport::StreamSubscription<Heartbeat>,
    events: EventSender<CapturePipeline>,
) {
    loop {
        match heartbeats.recv().await {
            Ok(beat) => {
                tracing::trace!(
                    "Server receives video at {:.1}/s, depth at {:.1}/s",
                    beat.payload.video_rate,
                    beat.payload.depth_rate
                );
                if !events.send(Event::Heartbeat(Instant::now())) {
                    return;
                }
            }
            Err(e) => {
                // The monitor notices the silence.
                tracing::warn!("Heartbeat stream ended: {}", e);
                return;
            }
        }
    }
}

/// Protocol errors after registration end the session.
async fn watch_rendezvous(
    mut directory: broadcast::Receiver<ClientEvent>,
    events: EventSender<CapturePipeline>,
) {
    loop {
        match directory.recv().await {
            Ok(ClientEvent::Error(message)) => {
                events.send(Event::Failed(message));
                return;
            }
            Ok(ClientEvent::Disconnected) => {
                tracing::warn!("Rendezvous server closed the connection");
                return;
            }
            Ok(ClientEvent::Rendezvous(event)) => tracing::debug!("Rendezvous: {:?}", event),
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
