//! Session lifecycle state machine.
//!
//! The machine is pure: it never performs I/O or spawns work. The driver
//! feeds it [`Event`]s (user input and completions of background work) and
//! calls [`SessionMachine::poll`] once per frame; both return the
//! [`Effect`]s the driver must carry out.
//!
//! ```text
//! Initial -> LoadingConfiguration -> WaitingToStart
//!   -> LocateWorldAnchor -> LocatingWorldAnchor
//!   -> ConstructPipeline -> ConstructingPipeline
//!   -> CalibrateCameras -> CalibratingCameras
//!   -> ConnectToServer -> ConnectingToServer
//!   -> Running -> StoppingPipeline -> Stopped -> Initial | Exited
//! ```
//!
//! Every state that launches background work moves to its "...ing" partner
//! in the same step, so a poll never waits. Any failure lands in `Stopped`
//! with a message; nothing is ever left pending.

use crate::{HeartbeatMonitor, HeartbeatThresholds};
use std::fmt;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Initial,
    LoadingConfiguration,
    WaitingToStart,
    LocateWorldAnchor,
    LocatingWorldAnchor,
    ConstructPipeline,
    ConstructingPipeline,
    CalibrateCameras,
    CalibratingCameras,
    ConnectToServer,
    ConnectingToServer,
    Running,
    StoppingPipeline,
    Stopped,
    Exited,
}

impl SessionState {
    /// States waiting on a background task.
    pub const PENDING: [SessionState; 6] = [
        Self::LoadingConfiguration,
        Self::LocatingWorldAnchor,
        Self::ConstructingPipeline,
        Self::CalibratingCameras,
        Self::ConnectingToServer,
        Self::StoppingPipeline,
    ];

    pub fn is_pending(self) -> bool {
        Self::PENDING.contains(&self)
    }

    /// No further transitions happen from here except a restart.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Exited)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Inputs to the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The connection file was read (or defaulted).
    ConfigurationLoaded { auto_start: bool },
    /// User asked to start.
    Start,
    /// User asked to stop a running session.
    Stop,
    /// User dismissed the error message.
    Acknowledge,
    /// The process is shutting down.
    Exit,
    WorldAnchorLocated,
    PipelineConstructed,
    CamerasCalibrated,
    /// The peer process appeared and its heartbeat stream is wired.
    ServerConnected,
    Heartbeat(Instant),
    /// The pipeline ran to completion on its own.
    PipelineCompleted,
    PipelineDisposed,
    /// A background task failed; carries the root cause.
    Failed(String),
}

/// Work the driver performs on behalf of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    LoadConfiguration,
    LocateWorldAnchor,
    ConstructPipeline,
    CalibrateCameras,
    ConnectToServer,
    StartPipeline,
    DisposePipeline,
    Exit,
}

#[derive(Debug, Clone)]
pub struct SessionMachine {
    state: SessionState,
    error: Option<String>,
    auto_start: bool,
    exit_requested: bool,
    thresholds: HeartbeatThresholds,
    monitor: Option<HeartbeatMonitor>,
    run_started: Option<Instant>,
    has_pipeline: bool,
}

impl SessionMachine {
    pub fn new(thresholds: HeartbeatThresholds, auto_start: bool) -> Self {
        Self {
            state: SessionState::Initial,
            error: None,
            auto_start,
            exit_requested: false,
            thresholds,
            monitor: None,
            run_started: None,
            has_pipeline: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn auto_start(&self) -> bool {
        self.auto_start
    }

    pub fn run_started(&self) -> Option<Instant> {
        self.run_started
    }

    pub fn monitor(&self) -> Option<&HeartbeatMonitor> {
        self.monitor.as_ref()
    }

    /// Apply an event. Events that do not fit the current state are stale
    /// completions and are dropped.
    pub fn handle(&mut self, event: Event, now: Instant) -> Vec<Effect> {
        use SessionState as S;

        match (self.state, event) {
            (S::LoadingConfiguration, Event::ConfigurationLoaded { auto_start }) => {
                self.auto_start |= auto_start;
                self.state = S::WaitingToStart;
                vec![]
            }
            (S::WaitingToStart, Event::Start) => {
                self.state = S::LocateWorldAnchor;
                vec![]
            }
            (S::LocatingWorldAnchor, Event::WorldAnchorLocated) => {
                self.state = S::ConstructPipeline;
                vec![]
            }
            (S::ConstructingPipeline, Event::PipelineConstructed) => {
                self.has_pipeline = true;
                self.state = S::CalibrateCameras;
                vec![]
            }
            (S::CalibratingCameras, Event::CamerasCalibrated) => {
                self.state = S::ConnectToServer;
                vec![]
            }
            (S::ConnectingToServer, Event::ServerConnected) => {
                self.state = S::Running;
                self.run_started = Some(now);
                vec![Effect::StartPipeline]
            }
            (S::ConnectingToServer | S::Running, Event::Heartbeat(at)) => {
                if let Some(monitor) = self.monitor.as_mut() {
                    monitor.record(at);
                }
                vec![]
            }
            (S::ConnectingToServer | S::Running, Event::Stop)
            | (S::Running, Event::PipelineCompleted) => self.begin_stop(),
            (S::StoppingPipeline, Event::PipelineDisposed) => {
                self.has_pipeline = false;
                self.state = S::Stopped;
                vec![]
            }
            (_, Event::PipelineDisposed) => {
                self.has_pipeline = false;
                vec![]
            }
            (S::Stopped, Event::Acknowledge) => {
                self.error = None;
                if !self.exits_when_stopped() {
                    self.reset();
                }
                vec![]
            }
            (state, Event::Failed(message)) if !state.is_terminal() => self.fail(message),
            (state, Event::Exit) => {
                self.exit_requested = true;
                match state {
                    S::Exited | S::Stopped | S::StoppingPipeline => vec![],
                    _ if self.has_pipeline => self.begin_stop(),
                    _ => {
                        self.state = S::Stopped;
                        vec![]
                    }
                }
            }
            _ => vec![],
        }
    }

    /// Advance on the polling thread. Call once per frame.
    pub fn poll(&mut self, now: Instant) -> Vec<Effect> {
        use SessionState as S;

        match self.state {
            S::Initial => {
                self.error = None;
                self.monitor = None;
                self.run_started = None;
                self.state = S::LoadingConfiguration;
                vec![Effect::LoadConfiguration]
            }
            S::WaitingToStart if self.auto_start => {
                self.state = S::LocateWorldAnchor;
                vec![]
            }
            S::LocateWorldAnchor => {
                self.state = S::LocatingWorldAnchor;
                vec![Effect::LocateWorldAnchor]
            }
            S::ConstructPipeline => {
                self.state = S::ConstructingPipeline;
                vec![Effect::ConstructPipeline]
            }
            S::CalibrateCameras => {
                self.state = S::CalibratingCameras;
                vec![Effect::CalibrateCameras]
            }
            S::ConnectToServer => {
                self.monitor = Some(HeartbeatMonitor::new(self.thresholds, now));
                self.state = S::ConnectingToServer;
                vec![Effect::ConnectToServer]
            }
            S::ConnectingToServer | S::Running => {
                let status = self
                    .monitor
                    .as_ref()
                    .map(|m| m.evaluate(now))
                    .and_then(|s| s.message());
                match status {
                    Some(message) => {
                        self.error = Some(message.to_string());
                        self.begin_stop()
                    }
                    None => vec![],
                }
            }
            S::Stopped if self.exits_when_stopped() => {
                self.state = S::Exited;
                vec![Effect::Exit]
            }
            S::Stopped if self.error.is_none() => {
                self.reset();
                vec![]
            }
            _ => vec![],
        }
    }

    fn exits_when_stopped(&self) -> bool {
        self.auto_start || self.exit_requested
    }

    fn reset(&mut self) {
        self.state = SessionState::Initial;
    }

    fn begin_stop(&mut self) -> Vec<Effect> {
        if self.has_pipeline {
            self.state = SessionState::StoppingPipeline;
            vec![Effect::DisposePipeline]
        } else {
            self.state = SessionState::Stopped;
            vec![]
        }
    }

    /// Single failure path: record the message, stop, release the pipeline.
    fn fail(&mut self, message: String) -> Vec<Effect> {
        if self.error.is_none() {
            self.error = Some(message);
        }
        let dispose = self.has_pipeline && self.state != SessionState::StoppingPipeline;
        self.has_pipeline = false;
        self.state = SessionState::Stopped;
        if dispose {
            vec![Effect::DisposePipeline]
        } else {
            vec![]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn thresholds() -> HeartbeatThresholds {
        HeartbeatThresholds {
            never_arrived_timeout: Duration::from_secs(10),
            lost_timeout: Duration::from_secs(2),
            ignore_loss: false,
        }
    }

    /// Completion event that moves a pending state forward.
    fn completion(state: SessionState) -> Event {
        match state {
            SessionState::LoadingConfiguration => Event::ConfigurationLoaded { auto_start: false },
            SessionState::LocatingWorldAnchor => Event::WorldAnchorLocated,
            SessionState::ConstructingPipeline => Event::PipelineConstructed,
            SessionState::CalibratingCameras => Event::CamerasCalibrated,
            SessionState::ConnectingToServer => Event::ServerConnected,
            SessionState::StoppingPipeline => Event::PipelineDisposed,
            other => panic!("{other} is not pending"),
        }
    }

    /// Drive a fresh machine until it sits in `target`.
    fn drive_to(target: SessionState, auto_start: bool, now: Instant) -> SessionMachine {
        let mut machine = SessionMachine::new(thresholds(), auto_start);
        for _ in 0..64 {
            if machine.state() == target {
                return machine;
            }
            match machine.state() {
                SessionState::WaitingToStart if !auto_start => {
                    machine.handle(Event::Start, now);
                }
                SessionState::Running => {
                    machine.handle(Event::Stop, now);
                }
                state if state.is_pending() => {
                    machine.handle(completion(state), now);
                }
                _ => {
                    machine.poll(now);
                }
            }
        }
        panic!("never reached {target}");
    }

    #[test]
    fn happy_path_effects() {
        let now = Instant::now();
        let mut machine = SessionMachine::new(thresholds(), true);
        let mut effects = Vec::new();

        effects.extend(machine.poll(now));
        effects.extend(machine.handle(Event::ConfigurationLoaded { auto_start: false }, now));
        effects.extend(machine.poll(now));
        effects.extend(machine.poll(now));
        effects.extend(machine.handle(Event::WorldAnchorLocated, now));
        effects.extend(machine.poll(now));
        effects.extend(machine.handle(Event::PipelineConstructed, now));
        effects.extend(machine.poll(now));
        effects.extend(machine.handle(Event::CamerasCalibrated, now));
        effects.extend(machine.poll(now));
        effects.extend(machine.handle(Event::ServerConnected, now));

        assert_eq!(machine.state(), SessionState::Running);
        assert_eq!(machine.run_started(), Some(now));
        assert_eq!(
            effects,
            [
                Effect::LoadConfiguration,
                Effect::LocateWorldAnchor,
                Effect::ConstructPipeline,
                Effect::CalibrateCameras,
                Effect::ConnectToServer,
                Effect::StartPipeline,
            ]
        );
    }

    #[test]
    fn interactive_waits_for_start() {
        let now = Instant::now();
        let mut machine = drive_to(SessionState::WaitingToStart, false, now);
        assert!(machine.poll(now).is_empty());
        assert_eq!(machine.state(), SessionState::WaitingToStart);
        machine.handle(Event::Start, now);
        assert_eq!(machine.state(), SessionState::LocateWorldAnchor);
    }

    #[test]
    fn config_can_enable_auto_start() {
        let now = Instant::now();
        let mut machine = drive_to(SessionState::LoadingConfiguration, false, now);
        machine.handle(Event::ConfigurationLoaded { auto_start: true }, now);
        machine.poll(now);
        assert_eq!(machine.state(), SessionState::LocateWorldAnchor);
    }

    #[test]
    fn failure_in_every_pending_state_stops() {
        for auto_start in [false, true] {
            for pending in SessionState::PENDING {
                let now = Instant::now();
                let mut machine = drive_to(pending, auto_start, now);
                machine.handle(Event::Failed("boom".into()), now);
                machine.poll(now);

                let expected = if auto_start {
                    SessionState::Exited
                } else {
                    SessionState::Stopped
                };
                assert_eq!(machine.state(), expected, "from {pending}");
                assert_eq!(machine.error(), Some("boom"), "from {pending}");
            }
        }
    }

    #[test]
    fn failure_with_pipeline_disposes_it() {
        let now = Instant::now();
        let mut machine = drive_to(SessionState::CalibratingCameras, false, now);
        let effects = machine.handle(Event::Failed("camera unplugged".into()), now);
        assert_eq!(effects, [Effect::DisposePipeline]);
        assert_eq!(machine.state(), SessionState::Stopped);

        // The late disposal completion must not disturb the stopped state.
        machine.handle(Event::PipelineDisposed, now);
        assert_eq!(machine.state(), SessionState::Stopped);
    }

    #[test]
    fn failure_before_pipeline_disposes_nothing() {
        let now = Instant::now();
        let mut machine = drive_to(SessionState::LocatingWorldAnchor, false, now);
        assert!(machine.handle(Event::Failed("no anchor".into()), now).is_empty());
    }

    #[test]
    fn first_error_wins() {
        let now = Instant::now();
        let mut machine = drive_to(SessionState::ConnectingToServer, false, now);
        machine.handle(Event::Failed("first".into()), now);
        machine.handle(Event::Failed("second".into()), now);
        assert_eq!(machine.error(), Some("first"));
    }

    #[test]
    fn interactive_error_needs_acknowledgment() {
        let now = Instant::now();
        let mut machine = drive_to(SessionState::ConnectingToServer, false, now);
        machine.handle(Event::Failed("refused".into()), now);
        for _ in 0..5 {
            machine.poll(now);
            assert_eq!(machine.state(), SessionState::Stopped);
        }
        machine.handle(Event::Acknowledge, now);
        assert_eq!(machine.state(), SessionState::Initial);
        assert_eq!(machine.error(), None);
    }

    #[test]
    fn interactive_clean_stop_restarts() {
        let now = Instant::now();
        let mut machine = drive_to(SessionState::Running, false, now);
        assert_eq!(machine.handle(Event::Stop, now), [Effect::DisposePipeline]);
        machine.handle(Event::PipelineDisposed, now);
        assert_eq!(machine.state(), SessionState::Stopped);
        machine.poll(now);
        assert_eq!(machine.state(), SessionState::Initial);
    }

    #[test]
    fn auto_start_always_exits() {
        let now = Instant::now();
        let mut clean = drive_to(SessionState::Running, true, now);
        clean.handle(Event::PipelineCompleted, now);
        clean.handle(Event::PipelineDisposed, now);
        assert_eq!(clean.poll(now), [Effect::Exit]);
        assert_eq!(clean.state(), SessionState::Exited);

        let mut failed = drive_to(SessionState::Running, true, now);
        failed.handle(Event::Failed("x".into()), now);
        assert_eq!(failed.poll(now), [Effect::Exit]);
        assert_eq!(failed.state(), SessionState::Exited);
    }

    #[test]
    fn heartbeat_never_arrived_while_connecting() {
        let start = Instant::now();
        let mut machine = drive_to(SessionState::ConnectingToServer, false, start);
        assert!(machine.poll(start + Duration::from_secs(9)).is_empty());

        let effects = machine.poll(start + Duration::from_secs(11));
        assert_eq!(effects, [Effect::DisposePipeline]);
        assert_eq!(machine.state(), SessionState::StoppingPipeline);
        assert_eq!(machine.error(), Some("Heartbeat never arrived."));

        machine.handle(Event::PipelineDisposed, start + Duration::from_secs(12));
        assert_eq!(machine.state(), SessionState::Stopped);
    }

    #[test]
    fn heartbeat_lost_while_running() {
        let start = Instant::now();
        let mut machine = drive_to(SessionState::Running, false, start);
        machine.handle(Event::Heartbeat(start + Duration::from_secs(1)), start);
        assert!(machine.poll(start + Duration::from_secs(2)).is_empty());
        machine.poll(start + Duration::from_secs(4));
        assert_eq!(machine.state(), SessionState::StoppingPipeline);
        assert_eq!(machine.error(), Some("Heartbeat lost."));
    }

    #[test]
    fn stale_completions_are_ignored() {
        let now = Instant::now();
        let mut machine = drive_to(SessionState::Stopped, false, now);
        for event in [
            Event::WorldAnchorLocated,
            Event::PipelineConstructed,
            Event::CamerasCalibrated,
            Event::ServerConnected,
        ] {
            assert!(machine.handle(event, now).is_empty());
        }
        assert_eq!(machine.state(), SessionState::Stopped);
    }

    #[test]
    fn exit_request_stops_then_exits() {
        let now = Instant::now();
        let mut machine = drive_to(SessionState::Running, false, now);
        assert_eq!(machine.handle(Event::Exit, now), [Effect::DisposePipeline]);
        machine.handle(Event::PipelineDisposed, now);
        assert_eq!(machine.poll(now), [Effect::Exit]);

        let mut idle = drive_to(SessionState::WaitingToStart, false, now);
        idle.handle(Event::Exit, now);
        assert_eq!(idle.poll(now), [Effect::Exit]);
    }
}
