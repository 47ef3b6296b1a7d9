use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed stream message: {0}")]
    Json(#[from] serde_json::Error),
    /// No dispatch entry for an advertised type-tag. A contract violation
    /// between peers, never transient.
    #[error("Unknown stream type: {name} ({type_tag})")]
    UnknownStreamType { name: String, type_tag: String },
    #[error("stream {0} is not advertised on this endpoint")]
    UnknownStream(String),
    #[error("endpoint has no host and port")]
    NoSocketAddress,
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("clock synchronization did not complete within {0:?}")]
    ClockSyncTimeout(Duration),
    #[error("stream closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;
