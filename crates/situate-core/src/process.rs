//! Processes and the endpoints they advertise.
//!
//! A process is identified by its name. It carries an ordered list of
//! endpoints, and each endpoint lists the streams reachable through it.
//! Endpoints are immutable once published: changing the stream set means
//! removing the process and adding it again.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A named, typed stream offered by an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub name: String,
    /// Stable wire identifier of the payload type.
    pub type_tag: String,
    /// Messages are large (images, depth maps) and need bigger frames.
    #[serde(default)]
    pub large_messages: bool,
}

impl StreamDescriptor {
    pub fn new(name: impl Into<String>, type_tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_tag: type_tag.into(),
            large_messages: false,
        }
    }

    /// Mark the stream as carrying large messages.
    pub fn large(mut self) -> Self {
        self.large_messages = true;
        self
    }
}

/// Transport used by a remote exporter endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Tcp,
    Udp,
    NamedPipes,
}

impl From<TransportKind> for i32 {
    fn from(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Tcp => 0,
            TransportKind::Udp => 1,
            TransportKind::NamedPipes => 2,
        }
    }
}

impl TryFrom<i32> for TransportKind {
    type Error = UnknownTransportKind;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Tcp),
            1 => Ok(Self::Udp),
            2 => Ok(Self::NamedPipes),
            other => Err(UnknownTransportKind(other)),
        }
    }
}

/// Transport kind value outside the known range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown transport kind: {0}")]
pub struct UnknownTransportKind(pub i32);

/// Discriminant of an [`Endpoint`], as written on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    TcpSource,
    NetMqSource,
    RemoteExporter,
    RemoteClockExporter,
}

impl EndpointKind {
    pub fn tag(self) -> u8 {
        match self {
            Self::TcpSource => 0,
            Self::NetMqSource => 1,
            Self::RemoteExporter => 2,
            Self::RemoteClockExporter => 3,
        }
    }
}

impl TryFrom<u8> for EndpointKind {
    type Error = UnknownEndpointKind;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Self::TcpSource),
            1 => Ok(Self::NetMqSource),
            2 => Ok(Self::RemoteExporter),
            3 => Ok(Self::RemoteClockExporter),
            other => Err(UnknownEndpointKind(other)),
        }
    }
}

/// Endpoint tag byte that names no known endpoint type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown type of endpoint: {0}")]
pub struct UnknownEndpointKind(pub u8);

/// A network endpoint advertised by a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "endpoint", rename_all = "snake_case")]
pub enum Endpoint {
    /// Plain TCP stream source; subscribers connect to `host:port`.
    TcpSource {
        host: String,
        port: u16,
        streams: Vec<StreamDescriptor>,
    },
    /// NetMQ/ZeroMQ publisher at `address`.
    NetMqSource {
        address: String,
        streams: Vec<StreamDescriptor>,
    },
    /// Remote store exporter.
    RemoteExporter {
        host: String,
        port: u16,
        transport: TransportKind,
        streams: Vec<StreamDescriptor>,
    },
    /// Reference clock exporter. Never carries streams.
    RemoteClockExporter { host: String, port: u16 },
}

impl Endpoint {
    pub fn tcp_source(host: impl Into<String>, port: u16, streams: Vec<StreamDescriptor>) -> Self {
        Self::TcpSource {
            host: host.into(),
            port,
            streams,
        }
    }

    pub fn clock_exporter(host: impl Into<String>, port: u16) -> Self {
        Self::RemoteClockExporter {
            host: host.into(),
            port,
        }
    }

    pub fn kind(&self) -> EndpointKind {
        match self {
            Self::TcpSource { .. } => EndpointKind::TcpSource,
            Self::NetMqSource { .. } => EndpointKind::NetMqSource,
            Self::RemoteExporter { .. } => EndpointKind::RemoteExporter,
            Self::RemoteClockExporter { .. } => EndpointKind::RemoteClockExporter,
        }
    }

    pub fn streams(&self) -> &[StreamDescriptor] {
        match self {
            Self::TcpSource { streams, .. }
            | Self::NetMqSource { streams, .. }
            | Self::RemoteExporter { streams, .. } => streams,
            Self::RemoteClockExporter { .. } => &[],
        }
    }

    /// Host and port, for the endpoint kinds that have them.
    pub fn socket_address(&self) -> Option<(&str, u16)> {
        match self {
            Self::TcpSource { host, port, .. }
            | Self::RemoteExporter { host, port, .. }
            | Self::RemoteClockExporter { host, port } => Some((host, *port)),
            Self::NetMqSource { .. } => None,
        }
    }
}

/// A named participant in the rendezvous directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub name: String,
    pub version: String,
    pub endpoints: Vec<Endpoint>,
}

impl Process {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            endpoints: Vec::new(),
        }
    }

    /// Append an endpoint. Only valid before the process is published.
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    /// Every stream of every endpoint, paired with its endpoint.
    pub fn streams(&self) -> impl Iterator<Item = (&Endpoint, &StreamDescriptor)> {
        self.endpoints
            .iter()
            .flat_map(|e| e.streams().iter().map(move |s| (e, s)))
    }

    /// Find a stream by name.
    pub fn find_stream(&self, name: &str) -> Option<(&Endpoint, &StreamDescriptor)> {
        self.streams().find(|(_, s)| s.name == name)
    }

    /// The first clock exporter endpoint, if any.
    pub fn clock_exporter(&self) -> Option<(&str, u16)> {
        self.endpoints.iter().find_map(|e| match e {
            Endpoint::RemoteClockExporter { host, port } => Some((host.as_str(), *port)),
            _ => None,
        })
    }
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}", self.name, self.version)
    }
}
