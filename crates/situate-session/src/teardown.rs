//! Run-once guard for session teardown.
//!
//! Teardown (withdraw the process, stop the rendezvous client, drop the clock
//! exporter) can be requested from several places at once: process exit, a
//! pipeline failure and pipeline completion. Only the first request does the
//! work.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    /// The process is shutting down.
    Exit,
    /// Something in the session failed.
    Failure,
    /// The pipeline finished or was stopped.
    Completion,
}

impl fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::Exit => "process exit",
            Self::Failure => "failure",
            Self::Completion => "completion",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Default)]
pub struct TeardownGuard {
    done: AtomicBool,
}

impl TeardownGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the teardown. True for exactly one caller.
    pub fn try_begin(&self, reason: TeardownReason) -> bool {
        let won = self
            .done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            tracing::debug!("Tearing down session on {}", reason);
        } else {
            tracing::trace!("Session already torn down, ignoring {}", reason);
        }
        won
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}
