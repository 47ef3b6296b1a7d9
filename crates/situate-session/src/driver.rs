//! Effect interpreter around [`SessionMachine`].
//!
//! The driver owns the machine, the session's pipeline and the host that
//! does the real work. [`SessionDriver::tick`] is called once per frame: it
//! drains the completion channel, polls the machine and starts whatever
//! background work the resulting effects ask for. It never waits.

use crate::teardown::TeardownReason;
use futures_util::future::BoxFuture;
use situate_core::session::{Effect, Event, SessionMachine, SessionState};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Collaborators the session reaches out to.
///
/// Async operations return `'static` futures so the driver can run them on
/// background tasks; anything they need from the host is cloned out of the
/// `Arc` before the future is built.
pub trait SessionHost: Send + Sync + Sized + 'static {
    type Pipeline: Send + 'static;

    /// Read the connection file. Returns whether to start without the user.
    fn load_configuration(self: Arc<Self>) -> BoxFuture<'static, anyhow::Result<bool>>;

    fn locate_world_anchor(self: Arc<Self>) -> BoxFuture<'static, anyhow::Result<()>>;

    fn construct_pipeline(self: Arc<Self>) -> BoxFuture<'static, anyhow::Result<Self::Pipeline>>;

    fn calibrate_cameras(
        self: Arc<Self>,
        pipeline: &Self::Pipeline,
    ) -> BoxFuture<'static, anyhow::Result<()>>;

    /// Resolve once the peer process is found and its heartbeat stream is
    /// wired. Heartbeats, and any later failure, are reported on `events`.
    fn connect_to_server(
        self: Arc<Self>,
        pipeline: &Self::Pipeline,
        events: EventSender<Self::Pipeline>,
    ) -> BoxFuture<'static, anyhow::Result<()>>;

    /// Start the dataflow. Runs in the background; completion or failure is
    /// reported on `events`.
    fn start_pipeline(
        &self,
        pipeline: &mut Self::Pipeline,
        events: EventSender<Self::Pipeline>,
    ) -> anyhow::Result<()>;

    fn dispose_pipeline(
        self: Arc<Self>,
        pipeline: Self::Pipeline,
    ) -> BoxFuture<'static, anyhow::Result<()>>;

    /// Withdraw the session from the rendezvous. Must tolerate repeated and
    /// concurrent calls; only the first one per session does anything.
    fn teardown(self: Arc<Self>, reason: TeardownReason) -> BoxFuture<'static, ()>;
}

enum Completion<P> {
    Event(Event),
    Constructed(P),
}

/// Handle for background work to report back to the driver.
pub struct EventSender<P> {
    tx: mpsc::UnboundedSender<Completion<P>>,
}

impl<P> Clone for EventSender<P> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<P> EventSender<P> {
    /// False once the driver is gone.
    pub fn send(&self, event: Event) -> bool {
        self.tx.send(Completion::Event(event)).is_ok()
    }

    /// Report a failure by its root cause.
    pub fn fail(&self, error: &anyhow::Error) -> bool {
        self.send(Event::Failed(error.root_cause().to_string()))
    }
}

pub struct SessionDriver<H: SessionHost> {
    host: Arc<H>,
    machine: SessionMachine,
    pipeline: Option<H::Pipeline>,
    tx: mpsc::UnboundedSender<Completion<H::Pipeline>>,
    rx: mpsc::UnboundedReceiver<Completion<H::Pipeline>>,
}

impl<H: SessionHost> SessionDriver<H> {
    pub fn new(host: Arc<H>, machine: SessionMachine) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            host,
            machine,
            pipeline: None,
            tx,
            rx,
        }
    }

    pub fn host(&self) -> &Arc<H> {
        &self.host
    }

    pub fn machine(&self) -> &SessionMachine {
        &self.machine
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    pub fn error(&self) -> Option<&str> {
        self.machine.error()
    }

    pub fn has_pipeline(&self) -> bool {
        self.pipeline.is_some()
    }

    pub fn events(&self) -> EventSender<H::Pipeline> {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    /// Queue an event for the next tick.
    pub fn send(&self, event: Event) {
        // The receiver lives in self.
        let _ = self.tx.send(Completion::Event(event));
    }

    /// Advance one frame.
    pub fn tick(&mut self) -> SessionState {
        let now = Instant::now();

        while let Ok(completion) = self.rx.try_recv() {
            let before = self.machine.state();
            let effects = match completion {
                Completion::Event(event) => self.machine.handle(event, now),
                Completion::Constructed(pipeline) => self.adopt(pipeline, now),
            };
            self.apply(before, effects);
        }

        let before = self.machine.state();
        let effects = self.machine.poll(now);
        self.apply(before, effects);

        self.machine.state()
    }

    /// Release whatever the session still holds. Call once the machine has
    /// exited, before the runtime goes away.
    pub async fn shutdown(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            if let Err(e) = self.host.clone().dispose_pipeline(pipeline).await {
                tracing::warn!("Pipeline disposal failed: {:#}", e);
            }
        }
        self.host.clone().teardown(TeardownReason::Exit).await;
    }

    fn adopt(&mut self, pipeline: H::Pipeline, now: Instant) -> Vec<Effect> {
        if self.machine.state() != SessionState::ConstructingPipeline {
            tracing::debug!("Disposing pipeline constructed for a finished session");
            tokio::spawn(dispose_quietly(self.host.clone(), pipeline));
            return vec![];
        }
        if let Some(stale) = self.pipeline.replace(pipeline) {
            tokio::spawn(dispose_quietly(self.host.clone(), stale));
        }
        self.machine.handle(Event::PipelineConstructed, now)
    }

    fn apply(&mut self, before: SessionState, effects: Vec<Effect>) {
        let after = self.machine.state();
        if after != before {
            tracing::debug!("Session {} -> {}", before, after);
            if after == SessionState::Stopped {
                let reason = match self.machine.error() {
                    Some(error) => {
                        tracing::error!("Session stopped: {}", error);
                        TeardownReason::Failure
                    }
                    None => TeardownReason::Completion,
                };
                tokio::spawn(self.host.clone().teardown(reason));
            }
        }

        for effect in effects {
            self.run(effect);
        }
    }

    fn run(&mut self, effect: Effect) {
        let host = self.host.clone();
        match effect {
            Effect::LoadConfiguration => self.spawn(host.load_configuration(), |auto_start| {
                Completion::Event(Event::ConfigurationLoaded { auto_start })
            }),
            Effect::LocateWorldAnchor => self.spawn(host.locate_world_anchor(), |()| {
                Completion::Event(Event::WorldAnchorLocated)
            }),
            Effect::ConstructPipeline => {
                self.spawn(host.construct_pipeline(), Completion::Constructed)
            }
            Effect::CalibrateCameras => match self.pipeline.as_ref() {
                Some(pipeline) => self.spawn(host.calibrate_cameras(pipeline), |()| {
                    Completion::Event(Event::CamerasCalibrated)
                }),
                None => self.send(Event::Failed("no pipeline to calibrate".to_string())),
            },
            Effect::ConnectToServer => match self.pipeline.as_ref() {
                Some(pipeline) => {
                    let work = host.connect_to_server(pipeline, self.events());
                    self.spawn(work, |()| Completion::Event(Event::ServerConnected))
                }
                None => self.send(Event::Failed("no pipeline to connect".to_string())),
            },
            Effect::StartPipeline => {
                let events = self.events();
                let started = match self.pipeline.as_mut() {
                    Some(pipeline) => host.start_pipeline(pipeline, events),
                    None => Err(anyhow::anyhow!("no pipeline to start")),
                };
                match started {
                    Ok(()) => tracing::info!("Pipeline started"),
                    Err(e) => {
                        tracing::warn!("Pipeline start failed: {:#}", e);
                        self.events().fail(&e);
                    }
                }
            }
            Effect::DisposePipeline => match self.pipeline.take() {
                Some(pipeline) => self.spawn(host.dispose_pipeline(pipeline), |()| {
                    Completion::Event(Event::PipelineDisposed)
                }),
                None => self.send(Event::PipelineDisposed),
            },
            Effect::Exit => tracing::info!("Session exited"),
        }
    }

    fn spawn<T: Send + 'static>(
        &self,
        work: BoxFuture<'static, anyhow::Result<T>>,
        done: impl FnOnce(T) -> Completion<H::Pipeline> + Send + 'static,
    ) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let completion = match work.await {
                Ok(value) => done(value),
                Err(e) => {
                    tracing::warn!("Session task failed: {:#}", e);
                    Completion::Event(Event::Failed(e.root_cause().to_string()))
                }
            };
            let _ = tx.send(completion);
        });
    }
}

async fn dispose_quietly<H: SessionHost>(host: Arc<H>, pipeline: H::Pipeline) {
    if let Err(e) = host.dispose_pipeline(pipeline).await {
        tracing::warn!("Stale pipeline disposal failed: {:#}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use situate_core::HeartbeatThresholds;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct FakeHost {
        auto_start: bool,
        fail_construct: bool,
        construct_gate: Option<Arc<Notify>>,
        started: AtomicUsize,
        disposed: AtomicUsize,
        teardowns: Mutex<Vec<TeardownReason>>,
    }

    struct FakePipeline;

    impl SessionHost for FakeHost {
        type Pipeline = FakePipeline;

        fn load_configuration(self: Arc<Self>) -> BoxFuture<'static, anyhow::Result<bool>> {
            async move { Ok(self.auto_start) }.boxed()
        }

        fn locate_world_anchor(self: Arc<Self>) -> BoxFuture<'static, anyhow::Result<()>> {
            async { Ok(()) }.boxed()
        }

        fn construct_pipeline(self: Arc<Self>) -> BoxFuture<'static, anyhow::Result<FakePipeline>> {
            async move {
                if let Some(gate) = &self.construct_gate {
                    gate.notified().await;
                }
                if self.fail_construct {
                    return Err(anyhow::anyhow!("camera missing").context("constructing pipeline"));
                }
                Ok(FakePipeline)
            }
            .boxed()
        }

        fn calibrate_cameras(
            self: Arc<Self>,
            _pipeline: &FakePipeline,
        ) -> BoxFuture<'static, anyhow::Result<()>> {
            async { Ok(()) }.boxed()
        }

        fn connect_to_server(
            self: Arc<Self>,
            _pipeline: &FakePipeline,
            events: EventSender<FakePipeline>,
        ) -> BoxFuture<'static, anyhow::Result<()>> {
            async move {
                events.send(Event::Heartbeat(Instant::now()));
                Ok(())
            }
            .boxed()
        }

        fn start_pipeline(
            &self,
            _pipeline: &mut FakePipeline,
            _events: EventSender<FakePipeline>,
        ) -> anyhow::Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn dispose_pipeline(
            self: Arc<Self>,
            _pipeline: FakePipeline,
        ) -> BoxFuture<'static, anyhow::Result<()>> {
            async move {
                self.disposed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        }

        fn teardown(self: Arc<Self>, reason: TeardownReason) -> BoxFuture<'static, ()> {
            async move {
                self.teardowns.lock().unwrap().push(reason);
            }
            .boxed()
        }
    }

    fn driver(host: FakeHost) -> SessionDriver<FakeHost> {
        let thresholds = HeartbeatThresholds {
            never_arrived_timeout: Duration::from_secs(30),
            lost_timeout: Duration::from_secs(30),
            ignore_loss: false,
        };
        SessionDriver::new(Arc::new(host), SessionMachine::new(thresholds, false))
    }

    async fn tick_until(
        driver: &mut SessionDriver<FakeHost>,
        done: impl Fn(&SessionDriver<FakeHost>) -> bool,
    ) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(driver) {
            assert!(Instant::now() < deadline, "stuck in {}", driver.state());
            driver.tick();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn auto_start_runs_and_exits_after_stop() {
        let mut driver = driver(FakeHost {
            auto_start: true,
            ..Default::default()
        });
        tick_until(&mut driver, |d| d.state() == SessionState::Running).await;
        assert_eq!(driver.host().started.load(Ordering::SeqCst), 1);
        assert!(driver.machine().run_started().is_some());

        driver.send(Event::Stop);
        tick_until(&mut driver, |d| d.state() == SessionState::Exited).await;
        assert_eq!(driver.host().disposed.load(Ordering::SeqCst), 1);
        assert!(!driver.has_pipeline());
        assert_eq!(driver.error(), None);

        // Let the teardown spawned on entering Stopped run first.
        tokio::time::sleep(Duration::from_millis(20)).await;
        driver.shutdown().await;
        let teardowns = driver.host().teardowns.lock().unwrap().clone();
        assert!(teardowns.contains(&TeardownReason::Completion));
        assert_eq!(teardowns.last(), Some(&TeardownReason::Exit));
    }

    #[tokio::test]
    async fn failure_reports_root_cause_and_waits_for_ack() {
        let mut driver = driver(FakeHost {
            fail_construct: true,
            ..Default::default()
        });
        tick_until(&mut driver, |d| d.state() == SessionState::WaitingToStart).await;
        driver.send(Event::Start);
        tick_until(&mut driver, |d| d.state() == SessionState::Stopped).await;
        assert_eq!(driver.error(), Some("camera missing"));

        // Interactive sessions hold the error until it is acknowledged.
        for _ in 0..5 {
            driver.tick();
        }
        assert_eq!(driver.state(), SessionState::Stopped);

        driver.send(Event::Acknowledge);
        tick_until(&mut driver, |d| d.state() == SessionState::WaitingToStart).await;
        assert_eq!(driver.error(), None);
    }

    #[tokio::test]
    async fn late_pipeline_is_disposed() {
        let gate = Arc::new(Notify::new());
        let mut driver = driver(FakeHost {
            auto_start: true,
            construct_gate: Some(gate.clone()),
            ..Default::default()
        });
        tick_until(&mut driver, |d| d.state() == SessionState::ConstructingPipeline).await;

        driver.send(Event::Exit);
        tick_until(&mut driver, |d| d.state() == SessionState::Exited).await;

        gate.notify_one();
        tick_until(&mut driver, |d| {
            d.host().disposed.load(Ordering::SeqCst) == 1
        })
        .await;
        assert_eq!(driver.state(), SessionState::Exited);
        assert!(!driver.has_pipeline());
        assert_eq!(driver.host().started.load(Ordering::SeqCst), 0);
    }
}
