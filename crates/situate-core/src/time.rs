use std::time::{SystemTime, UNIX_EPOCH};

/// Microseconds since the UNIX epoch.
pub type Micros = i64;

pub fn now_micros() -> Micros {
    // A clock before 1970 is clamped to the epoch.
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as Micros)
        .unwrap_or(0)
}
