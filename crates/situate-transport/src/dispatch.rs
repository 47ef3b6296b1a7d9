//! Stream kinds and the receiver-side dispatch table.
//!
//! Every payload type has a stable wire identifier assigned here; it is not
//! derived from any runtime type name. Tags advertised by peers are
//! normalized with [`type_tag::simplify`] before lookup so decorated names
//! still match.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use situate_core::{Heartbeat, StreamDescriptor, type_tag};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Heartbeat,
    Image,
    Depth,
    Imu,
    Pose,
    Text,
}

impl StreamKind {
    pub const ALL: [StreamKind; 6] = [
        Self::Heartbeat,
        Self::Image,
        Self::Depth,
        Self::Imu,
        Self::Pose,
        Self::Text,
    ];

    pub fn type_tag(self) -> &'static str {
        match self {
            Self::Heartbeat => "situate.heartbeat",
            Self::Image => "situate.image",
            Self::Depth => "situate.depth",
            Self::Imu => "situate.imu",
            Self::Pose => "situate.pose",
            Self::Text => "situate.text",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        let tag = type_tag::simplify(tag);
        Self::ALL.into_iter().find(|k| k.type_tag() == tag)
    }

    /// Payloads big enough to need the large-frame path.
    pub fn is_large(self) -> bool {
        matches!(self, Self::Image | Self::Depth)
    }

    pub fn descriptor(self, name: impl Into<String>) -> StreamDescriptor {
        StreamDescriptor {
            name: name.into(),
            type_tag: self.type_tag().to_string(),
            large_messages: self.is_large(),
        }
    }
}

/// Binds a Rust payload type to its wire kind.
pub trait StreamPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: StreamKind;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageFrame {
    pub width: u32,
    pub height: u32,
    /// Pixel layout, e.g. `bgra8` or `jpeg`.
    pub encoding: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthFrame {
    pub width: u32,
    pub height: u32,
    /// Millimetres, row major.
    pub data: Vec<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImuSample {
    pub acceleration: [f64; 3],
    pub angular_velocity: [f64; 3],
}

/// Position in metres and orientation as a unit quaternion (w, x, y, z).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: [f64; 3],
    pub orientation: [f64; 4],
}

impl StreamPayload for Heartbeat {
    const KIND: StreamKind = StreamKind::Heartbeat;
}

impl StreamPayload for ImageFrame {
    const KIND: StreamKind = StreamKind::Image;
}

impl StreamPayload for DepthFrame {
    const KIND: StreamKind = StreamKind::Depth;
}

impl StreamPayload for ImuSample {
    const KIND: StreamKind = StreamKind::Imu;
}

impl StreamPayload for Pose {
    const KIND: StreamKind = StreamKind::Pose;
}

impl StreamPayload for String {
    const KIND: StreamKind = StreamKind::Text;
}

/// Maps stream kinds to the action that wires a received stream up.
///
/// Lookup fails fast on a tag with no entry; receivers must treat that as
/// fatal rather than skipping the stream.
pub struct DispatchTable<A> {
    actions: HashMap<StreamKind, A>,
}

impl<A> DispatchTable<A> {
    pub fn new() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }

    pub fn with(mut self, kind: StreamKind, action: A) -> Self {
        self.actions.insert(kind, action);
        self
    }

    pub fn lookup(&self, stream: &StreamDescriptor) -> Result<(StreamKind, &A)> {
        StreamKind::from_tag(&stream.type_tag)
            .and_then(|kind| self.actions.get(&kind).map(|action| (kind, action)))
            .ok_or_else(|| Error::UnknownStreamType {
                name: stream.name.clone(),
                type_tag: stream.type_tag.clone(),
            })
    }
}

impl<A> Default for DispatchTable<A> {
    fn default() -> Self {
        Self::new()
    }
}
