//! Point-to-point transport between Situate processes.
//!
//! Processes find each other through the rendezvous directory, then talk
//! directly: a reference clock is imported from the peer's clock exporter and
//! typed streams are pulled from its TCP sources.

mod clock;
mod dispatch;
mod error;
mod stream;

pub use clock::{
    ClockExporter, DEFAULT_SAMPLES, DEFAULT_SYNC_WAIT, SyncedClock, import_clock,
};
pub use dispatch::{
    DepthFrame, DispatchTable, ImageFrame, ImuSample, Pose, StreamKind, StreamPayload,
};
pub use error::{Error, Result};
pub use stream::{
    DeliveryPolicy, Envelope, MAX_FRAME, MAX_LARGE_FRAME, StreamPublisher, StreamSubscription,
    frame_limit, subscribe, subscribe_endpoint,
};
