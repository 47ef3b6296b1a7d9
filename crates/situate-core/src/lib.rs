//! Core types for Situate.
//!
//! This crate holds everything two peers must agree on without an async
//! runtime: the process/endpoint model advertised through the rendezvous
//! directory, type-tag normalization, heartbeats, and the pure session state
//! machine that the session driver interprets.

mod config;
mod directory;
mod heartbeat;
mod process;
mod rate;
pub mod session;
mod time;
pub mod type_tag;

pub use config::{ConfigError, ConnectionConfig};
pub use directory::{Rendezvous, RendezvousEvent};
pub use heartbeat::{Heartbeat, HeartbeatMonitor, HeartbeatStatus, HeartbeatThresholds, LastHeartbeat};
pub use process::{
    Endpoint, EndpointKind, Process, StreamDescriptor, TransportKind, UnknownEndpointKind,
    UnknownTransportKind,
};
pub use rate::FrameRateTracker;
pub use time::{Micros, now_micros};

/// Well-known TCP port of the rendezvous server.
pub const DEFAULT_RENDEZVOUS_PORT: u16 = 13331;
