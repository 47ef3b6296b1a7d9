//! Capture sessions on top of the Situate rendezvous and transport.
//!
//! [`SessionDriver`] runs the session state machine against a
//! [`SessionHost`]. [`CaptureClient`] is the host for the producing side;
//! [`CaptureServer`] is the consuming side and also hosts the rendezvous.

mod capture_client;
mod capture_server;
mod driver;
mod settings;
mod synthetic;
mod teardown;

pub use capture_client::{
    CaptureClient, CaptureDevice, CaptureOutputs, CapturePipeline, CaptureSink, DEPTH_STREAM,
    HEAD_STREAM, IMU_STREAM, VIDEO_STREAM,
};
pub use capture_server::{CaptureServer, ServerEvent};
pub use driver::{EventSender, SessionDriver, SessionHost};
pub use settings::{SessionSettings, SettingsError};
pub use synthetic::SyntheticDevice;
pub use teardown::{TeardownGuard, TeardownReason};
