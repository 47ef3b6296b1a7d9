//! Heartbeats and the liveness monitor.
//!
//! The server sends a small [`Heartbeat`] at a fixed low rate once a session
//! is wired up. The client feeds each arrival into a [`HeartbeatMonitor`] and
//! evaluates it on every poll. Two thresholds apply: a long grace period for
//! the first heartbeat (peer start-up, network negotiation) and a shorter
//! keep-alive window once heartbeats are flowing.

use crate::Micros;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Liveness message, carrying the receive rates the peer currently observes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub video_rate: f64,
    pub depth_rate: f64,
    pub originating_time: Micros,
}

/// When the last heartbeat was seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastHeartbeat {
    NeverSeen,
    SeenAt(Instant),
}

/// Outcome of evaluating the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    Healthy,
    /// No heartbeat within the grace period after the session started.
    NeverArrived,
    /// Heartbeats stopped for longer than the keep-alive window.
    Lost,
}

impl HeartbeatStatus {
    pub fn is_fatal(self) -> bool {
        !matches!(self, Self::Healthy)
    }

    /// User-facing explanation for a fatal status.
    pub fn message(self) -> Option<&'static str> {
        match self {
            Self::Healthy => None,
            Self::NeverArrived => Some("Heartbeat never arrived."),
            Self::Lost => Some("Heartbeat lost."),
        }
    }
}

/// Timeouts governing the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatThresholds {
    pub never_arrived_timeout: Duration,
    pub lost_timeout: Duration,
    /// Keep running when heartbeats stop after having arrived.
    pub ignore_loss: bool,
}

impl Default for HeartbeatThresholds {
    fn default() -> Self {
        Self {
            never_arrived_timeout: Duration::from_secs(20),
            lost_timeout: Duration::from_secs(5),
            ignore_loss: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    thresholds: HeartbeatThresholds,
    session_start: Instant,
    last: LastHeartbeat,
}

impl HeartbeatMonitor {
    pub fn new(thresholds: HeartbeatThresholds, session_start: Instant) -> Self {
        Self {
            thresholds,
            session_start,
            last: LastHeartbeat::NeverSeen,
        }
    }

    pub fn thresholds(&self) -> HeartbeatThresholds {
        self.thresholds
    }

    pub fn last(&self) -> LastHeartbeat {
        self.last
    }

    /// Record a heartbeat arrival. Arrivals never move the clock backwards.
    pub fn record(&mut self, at: Instant) {
        self.last = match self.last {
            LastHeartbeat::SeenAt(prev) if prev > at => LastHeartbeat::SeenAt(prev),
            _ => LastHeartbeat::SeenAt(at),
        };
    }

    pub fn evaluate(&self, now: Instant) -> HeartbeatStatus {
        match self.last {
            LastHeartbeat::NeverSeen => {
                if now.saturating_duration_since(self.session_start)
                    > self.thresholds.never_arrived_timeout
                {
                    HeartbeatStatus::NeverArrived
                } else {
                    HeartbeatStatus::Healthy
                }
            }
            LastHeartbeat::SeenAt(at) => {
                if !self.thresholds.ignore_loss
                    && now.saturating_duration_since(at) > self.thresholds.lost_timeout
                {
                    HeartbeatStatus::Lost
                } else {
                    HeartbeatStatus::Healthy
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds(ignore_loss: bool) -> HeartbeatThresholds {
        HeartbeatThresholds {
            never_arrived_timeout: Duration::from_secs(10),
            lost_timeout: Duration::from_secs(2),
            ignore_loss,
        }
    }

    #[test]
    fn never_arrived_after_grace_period() {
        let start = Instant::now();
        let monitor = HeartbeatMonitor::new(thresholds(false), start);
        assert_eq!(monitor.evaluate(start + Duration::from_secs(9)), HeartbeatStatus::Healthy);
        assert_eq!(
            monitor.evaluate(start + Duration::from_secs(11)),
            HeartbeatStatus::NeverArrived
        );
    }

    #[test]
    fn lost_after_keepalive_window() {
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::new(thresholds(false), start);
        let t0 = start + Duration::from_secs(1);
        monitor.record(t0);
        assert_eq!(monitor.evaluate(t0 + Duration::from_secs(1)), HeartbeatStatus::Healthy);
        assert_eq!(monitor.evaluate(t0 + Duration::from_secs(3)), HeartbeatStatus::Lost);
        // The grace period no longer matters once a heartbeat arrived.
        assert_eq!(monitor.evaluate(t0 + Duration::from_secs(30)), HeartbeatStatus::Lost);
    }

    #[test]
    fn ignore_loss_stays_healthy() {
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::new(thresholds(true), start);
        monitor.record(start);
        assert_eq!(monitor.evaluate(start + Duration::from_secs(60)), HeartbeatStatus::Healthy);
    }

    #[test]
    fn heartbeat_at_session_start_counts_as_seen() {
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::new(thresholds(false), start);
        monitor.record(start);
        assert_eq!(monitor.last(), LastHeartbeat::SeenAt(start));
        assert_eq!(monitor.evaluate(start + Duration::from_secs(3)), HeartbeatStatus::Lost);
    }

    #[test]
    fn messages_are_distinct() {
        assert_ne!(
            HeartbeatStatus::NeverArrived.message(),
            HeartbeatStatus::Lost.message()
        );
        assert!(HeartbeatStatus::Healthy.message().is_none());
    }
}
