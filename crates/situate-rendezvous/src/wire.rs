//! Rendezvous wire format.
//!
//! Integers are little endian. Strings are a 7-bit variable-length byte
//! count followed by UTF-8 bytes.
//!
//! ```text
//! handshake   client -> i16 version
//!             server -> i16 version, string client-address,
//!                       i32 count, count x update(add)
//! update      u8 action: 0 disconnect | 1 add + process | 2 remove + name
//! process     string name, string version, i32 count, count x endpoint
//! endpoint    u8 tag, variant fields, i32 count, count x stream
//!               0 tcp source        string host, i32 port
//!               1 netmq source      string address
//!               2 remote exporter   string host, i32 port, i32 transport
//!               3 clock exporter    string host, i32 port
//! stream      string name, string type-tag, u8 large-messages
//! ```
//!
//! The trailing large-messages byte is not part of version 2, so version 2
//! peers cannot parse our endpoints and we cannot parse theirs. Both sides
//! send their version first and refuse the other on a mismatch, which keeps
//! a version 2 peer from ever reaching the endpoint data.

use crate::{Error, Result};
use situate_core::{Endpoint, EndpointKind, Process, StreamDescriptor, TransportKind};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Version exchanged in the handshake. Version 3 added the per-stream
/// large-messages flag and is not wire compatible with version 2.
pub const PROTOCOL_VERSION: i16 = 3;

const MAX_STRING: usize = 64 * 1024;
const MAX_COUNT: i32 = 4096;

const ACTION_DISCONNECT: u8 = 0;
const ACTION_ADD: u8 = 1;
const ACTION_REMOVE: u8 = 2;

/// A directory change travelling over the control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    Disconnect,
    AddProcess(Process),
    RemoveProcess(String),
}

pub async fn write_version<W: AsyncWrite + Unpin>(w: &mut W) -> Result<()> {
    w.write_all(&PROTOCOL_VERSION.to_le_bytes()).await?;
    w.flush().await?;
    Ok(())
}

/// Read the peer's version and reject anything but ours.
pub async fn read_version<R: AsyncRead + Unpin>(r: &mut R) -> Result<()> {
    let actual = r.read_i16_le().await?;
    if actual != PROTOCOL_VERSION {
        return Err(Error::ProtocolMismatch {
            expected: PROTOCOL_VERSION,
            actual,
        });
    }
    Ok(())
}

pub async fn write_string<W: AsyncWrite + Unpin>(w: &mut W, s: &str) -> Result<()> {
    let mut buf = Vec::with_capacity(s.len() + 2);
    put_string(&mut buf, s);
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

pub async fn write_update<W: AsyncWrite + Unpin>(w: &mut W, update: &Update) -> Result<()> {
    let mut buf = Vec::new();
    put_update(&mut buf, update);
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

/// Initial directory contents sent by the server after the address.
pub async fn write_snapshot<W: AsyncWrite + Unpin>(w: &mut W, processes: &[Process]) -> Result<()> {
    let mut buf = Vec::new();
    put_i32(&mut buf, processes.len() as i32);
    for process in processes {
        put_update(&mut buf, &Update::AddProcess(process.clone()));
    }
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_snapshot<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<Update>> {
    let count = read_count(r, "process").await?;
    let mut updates = Vec::with_capacity(count);
    for _ in 0..count {
        updates.push(read_update(r).await?);
    }
    Ok(updates)
}

pub fn put_update(buf: &mut Vec<u8>, update: &Update) {
    match update {
        Update::Disconnect => buf.push(ACTION_DISCONNECT),
        Update::AddProcess(process) => {
            buf.push(ACTION_ADD);
            put_process(buf, process);
        }
        Update::RemoveProcess(name) => {
            buf.push(ACTION_REMOVE);
            put_string(buf, name);
        }
    }
}

fn put_process(buf: &mut Vec<u8>, process: &Process) {
    put_string(buf, &process.name);
    put_string(buf, &process.version);
    put_i32(buf, process.endpoints.len() as i32);
    for endpoint in &process.endpoints {
        put_endpoint(buf, endpoint);
    }
}

fn put_endpoint(buf: &mut Vec<u8>, endpoint: &Endpoint) {
    buf.push(endpoint.kind().tag());
    match endpoint {
        Endpoint::TcpSource { host, port, .. } | Endpoint::RemoteClockExporter { host, port } => {
            put_string(buf, host);
            put_i32(buf, i32::from(*port));
        }
        Endpoint::NetMqSource { address, .. } => put_string(buf, address),
        Endpoint::RemoteExporter {
            host,
            port,
            transport,
            ..
        } => {
            put_string(buf, host);
            put_i32(buf, i32::from(*port));
            put_i32(buf, i32::from(*transport));
        }
    }
    let streams = endpoint.streams();
    put_i32(buf, streams.len() as i32);
    for stream in streams {
        put_string(buf, &stream.name);
        put_string(buf, &stream.type_tag);
        buf.push(u8::from(stream.large_messages));
    }
}

fn put_i32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    let mut len = s.len();
    loop {
        let byte = (len & 0x7f) as u8;
        len >>= 7;
        if len == 0 {
            buf.push(byte);
            break;
        }
        buf.push(byte | 0x80);
    }
    buf.extend_from_slice(s.as_bytes());
}

pub async fn read_update<R: AsyncRead + Unpin>(r: &mut R) -> Result<Update> {
    match r.read_u8().await? {
        ACTION_DISCONNECT => Ok(Update::Disconnect),
        ACTION_ADD => Ok(Update::AddProcess(read_process(r).await?)),
        ACTION_REMOVE => Ok(Update::RemoveProcess(read_string(r).await?)),
        other => Err(Error::UnexpectedAction(other)),
    }
}

async fn read_process<R: AsyncRead + Unpin>(r: &mut R) -> Result<Process> {
    let name = read_string(r).await?;
    let version = read_string(r).await?;
    let count = read_count(r, "endpoint").await?;
    let mut endpoints = Vec::with_capacity(count);
    for _ in 0..count {
        endpoints.push(read_endpoint(r).await?);
    }
    Ok(Process {
        name,
        version,
        endpoints,
    })
}

async fn read_endpoint<R: AsyncRead + Unpin>(r: &mut R) -> Result<Endpoint> {
    let kind = EndpointKind::try_from(r.read_u8().await?)?;
    let endpoint = match kind {
        EndpointKind::TcpSource => {
            let host = read_string(r).await?;
            let port = read_port(r).await?;
            Endpoint::TcpSource {
                host,
                port,
                streams: read_streams(r).await?,
            }
        }
        EndpointKind::NetMqSource => {
            let address = read_string(r).await?;
            Endpoint::NetMqSource {
                address,
                streams: read_streams(r).await?,
            }
        }
        EndpointKind::RemoteExporter => {
            let host = read_string(r).await?;
            let port = read_port(r).await?;
            let transport = TransportKind::try_from(r.read_i32_le().await?)?;
            Endpoint::RemoteExporter {
                host,
                port,
                transport,
                streams: read_streams(r).await?,
            }
        }
        EndpointKind::RemoteClockExporter => {
            let host = read_string(r).await?;
            let port = read_port(r).await?;
            // Clock exporters advertise an empty stream list.
            read_streams(r).await?;
            Endpoint::RemoteClockExporter { host, port }
        }
    };
    Ok(endpoint)
}

async fn read_streams<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<StreamDescriptor>> {
    let count = read_count(r, "stream").await?;
    let mut streams = Vec::with_capacity(count);
    for _ in 0..count {
        let name = read_string(r).await?;
        let type_tag = read_string(r).await?;
        let large_messages = r.read_u8().await? != 0;
        streams.push(StreamDescriptor {
            name,
            type_tag,
            large_messages,
        });
    }
    Ok(streams)
}

async fn read_port<R: AsyncRead + Unpin>(r: &mut R) -> Result<u16> {
    let port = r.read_i32_le().await?;
    u16::try_from(port).map_err(|_| Error::InvalidPort(port))
}

async fn read_count<R: AsyncRead + Unpin>(r: &mut R, what: &'static str) -> Result<usize> {
    let count = r.read_i32_le().await?;
    if !(0..=MAX_COUNT).contains(&count) {
        return Err(Error::InvalidCount { what, count });
    }
    Ok(count as usize)
}

pub async fn read_string<R: AsyncRead + Unpin>(r: &mut R) -> Result<String> {
    let mut len = 0usize;
    let mut shift = 0;
    loop {
        let byte = r.read_u8().await?;
        len |= usize::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 28 {
            return Err(Error::StringTooLong(len));
        }
    }
    if len > MAX_STRING {
        return Err(Error::StringTooLong(len));
    }
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes).await?;
    Ok(String::from_utf8(bytes)?)
}
