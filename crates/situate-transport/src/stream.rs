//! Typed message streams over TCP.
//!
//! A [`StreamPublisher`] owns one listening socket and serves one stream. A
//! subscriber connects, names the stream it wants, and then receives frames:
//!
//! ```text
//! subscriber -> u32 len, stream name (utf-8)      (big endian)
//! publisher  -> { u32 len, json Envelope }*
//! ```
//!
//! The publisher closes the connection when the requested name is not the
//! one it serves. Every subscriber gets its own outbox, shaped by the
//! publisher's [`DeliveryPolicy`].

use crate::dispatch::{StreamKind, StreamPayload};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use situate_core::{Endpoint, FrameRateTracker, Micros, StreamDescriptor};
use std::fmt;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

/// Largest accepted frame on an ordinary stream.
pub const MAX_FRAME: usize = 1 << 20;
/// Largest accepted frame on a stream flagged as carrying large messages.
pub const MAX_LARGE_FRAME: usize = 64 << 20;

const MAX_REQUEST: usize = 64 * 1024;

pub fn frame_limit(large_messages: bool) -> usize {
    if large_messages { MAX_LARGE_FRAME } else { MAX_FRAME }
}

fn read_buffer_size(large_messages: bool) -> usize {
    if large_messages { 1 << 20 } else { 64 * 1024 }
}

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub sequence: u64,
    pub originating_time: Micros,
    pub payload: T,
}

/// How a publisher treats a subscriber that falls behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryPolicy {
    /// Queue every message.
    #[default]
    Unlimited,
    /// Keep only the newest message; older unsent ones are dropped.
    LatestOnly,
    /// Hold the producer until the subscriber has room.
    Throttle,
}

/// Length-prefixed, serialized envelope shared by all outboxes.
type Frame = Arc<Vec<u8>>;

#[derive(Clone)]
enum Outbox {
    Unlimited(mpsc::UnboundedSender<Frame>),
    LatestOnly(Arc<watch::Sender<Option<Frame>>>),
    Throttle(mpsc::Sender<Frame>),
}

enum Inbox {
    Unlimited(mpsc::UnboundedReceiver<Frame>),
    LatestOnly(watch::Receiver<Option<Frame>>),
    Throttle(mpsc::Receiver<Frame>),
}

fn outbox(policy: DeliveryPolicy) -> (Outbox, Inbox) {
    match policy {
        DeliveryPolicy::Unlimited => {
            let (tx, rx) = mpsc::unbounded_channel();
            (Outbox::Unlimited(tx), Inbox::Unlimited(rx))
        }
        DeliveryPolicy::LatestOnly => {
            let (tx, rx) = watch::channel(None);
            (Outbox::LatestOnly(Arc::new(tx)), Inbox::LatestOnly(rx))
        }
        DeliveryPolicy::Throttle => {
            let (tx, rx) = mpsc::channel(1);
            (Outbox::Throttle(tx), Inbox::Throttle(rx))
        }
    }
}

impl Outbox {
    fn is_closed(&self) -> bool {
        match self {
            Self::Unlimited(tx) => tx.is_closed(),
            Self::LatestOnly(tx) => tx.is_closed(),
            Self::Throttle(tx) => tx.is_closed(),
        }
    }

    /// Returns false once the subscriber is gone.
    async fn deliver(&self, frame: Frame) -> bool {
        match self {
            Self::Unlimited(tx) => tx.send(frame).is_ok(),
            Self::LatestOnly(tx) => {
                tx.send_replace(Some(frame));
                !tx.is_closed()
            }
            Self::Throttle(tx) => tx.send(frame).await.is_ok(),
        }
    }
}

impl Inbox {
    async fn next(&mut self) -> Option<Frame> {
        match self {
            Self::Unlimited(rx) => rx.recv().await,
            Self::Throttle(rx) => rx.recv().await,
            Self::LatestOnly(rx) => loop {
                rx.changed().await.ok()?;
                if let Some(frame) = rx.borrow_and_update().clone() {
                    return Some(frame);
                }
            },
        }
    }
}

struct Shared {
    descriptor: StreamDescriptor,
    policy: DeliveryPolicy,
    subscribers: Mutex<Vec<Outbox>>,
}

pub struct StreamPublisher<T> {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    sequence: AtomicU64,
    accept_task: JoinHandle<()>,
    _payload: PhantomData<fn(&T)>,
}

impl<T: StreamPayload> StreamPublisher<T> {
    /// Serve stream `name`, advertised with the payload's own kind.
    pub async fn bind(
        addr: impl tokio::net::ToSocketAddrs,
        name: impl Into<String>,
        policy: DeliveryPolicy,
    ) -> Result<Self> {
        Self::bind_as(addr, T::KIND.descriptor(name), policy).await
    }

    /// Serve a stream under an explicit descriptor.
    pub async fn bind_as(
        addr: impl tokio::net::ToSocketAddrs,
        descriptor: StreamDescriptor,
        policy: DeliveryPolicy,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::debug!(
            "Publishing stream {} ({}) on {}",
            descriptor.name,
            descriptor.type_tag,
            local_addr
        );

        let shared = Arc::new(Shared {
            descriptor,
            policy,
            subscribers: Mutex::new(Vec::new()),
        });
        let accept_task = tokio::spawn(accept_loop(listener, shared.clone()));

        Ok(Self {
            shared,
            local_addr,
            sequence: AtomicU64::new(0),
            accept_task,
            _payload: PhantomData,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn descriptor(&self) -> &StreamDescriptor {
        &self.shared.descriptor
    }

    /// Endpoint advertising this stream at `host`.
    pub fn endpoint(&self, host: &str) -> Endpoint {
        Endpoint::tcp_source(
            host,
            self.local_addr.port(),
            vec![self.shared.descriptor.clone()],
        )
    }

    /// Send `payload` to every current subscriber.
    pub async fn post(&self, payload: &T, originating_time: Micros) -> Result<()> {
        let envelope = Envelope {
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            originating_time,
            payload,
        };
        let frame = encode_frame(&envelope, frame_limit(self.shared.descriptor.large_messages))?;

        let outboxes = {
            let mut subscribers = self.shared.subscribers.lock().await;
            subscribers.retain(|s| !s.is_closed());
            subscribers.clone()
        };
        for outbox in outboxes {
            outbox.deliver(frame.clone()).await;
        }
        Ok(())
    }

    pub async fn subscriber_count(&self) -> usize {
        let mut subscribers = self.shared.subscribers.lock().await;
        subscribers.retain(|s| !s.is_closed());
        subscribers.len()
    }

    /// Stop accepting and close every subscriber connection.
    pub fn shutdown(&self) {
        self.accept_task.abort();
    }
}

impl<T> Drop for StreamPublisher<T> {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

fn encode_frame<P: Serialize>(envelope: &Envelope<P>, limit: usize) -> Result<Frame> {
    let mut frame = vec![0u8; 4];
    serde_json::to_writer(&mut frame, envelope)?;
    let size = frame.len() - 4;
    if size > limit {
        return Err(Error::FrameTooLarge { size, limit });
    }
    // limit is well below u32::MAX
    frame[..4].copy_from_slice(&(size as u32).to_be_bytes());
    Ok(Arc::new(frame))
}

/// Connections live in `connections`; aborting this task drops the set and
/// with it every subscriber socket.
async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    let mut connections = JoinSet::new();
    loop {
        let (socket, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Stream accept failed: {}", e);
                    continue;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => continue,
        };
        let shared = shared.clone();

        connections.spawn(async move {
            if let Err(e) = serve(socket, peer, shared).await {
                tracing::debug!("Stream subscriber {} left: {}", peer, e);
            }
        });
    }
}

async fn serve(mut socket: TcpStream, peer: SocketAddr, shared: Arc<Shared>) -> Result<()> {
    socket.set_nodelay(true)?;

    let requested = read_request(&mut socket).await?;
    if requested != shared.descriptor.name {
        tracing::warn!(
            "{} asked for stream {}, this endpoint serves {}",
            peer,
            requested,
            shared.descriptor.name
        );
        return Err(Error::UnknownStream(requested));
    }

    let (tx, mut inbox) = outbox(shared.policy);
    shared.subscribers.lock().await.push(tx);
    tracing::debug!("{} subscribed to {}", peer, shared.descriptor.name);

    while let Some(frame) = inbox.next().await {
        socket.write_all(&frame).await?;
    }
    Ok(())
}

async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_REQUEST {
        return Err(Error::FrameTooLarge {
            size: len,
            limit: MAX_REQUEST,
        });
    }
    let mut name = vec![0u8; len];
    reader.read_exact(&mut name).await?;
    String::from_utf8(name).map_err(|e| {
        Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })
}

/// Receiving end of a stream.
pub struct StreamSubscription<T> {
    descriptor: StreamDescriptor,
    messages: mpsc::UnboundedReceiver<Result<Envelope<T>>>,
    rate: watch::Receiver<Option<f64>>,
    task: JoinHandle<()>,
}

impl<T: StreamPayload> StreamSubscription<T> {
    pub fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    /// Next message. After the stream ends every call returns an error.
    pub async fn recv(&mut self) -> Result<Envelope<T>> {
        self.messages.recv().await.unwrap_or(Err(Error::Closed))
    }

    /// Rolling receive rate in messages per second, by originating time.
    pub fn rate(&self) -> Option<f64> {
        *self.rate.borrow()
    }

    /// Feed of rate updates.
    pub fn rate_updates(&self) -> watch::Receiver<Option<f64>> {
        self.rate.clone()
    }
}

impl<T> fmt::Debug for StreamSubscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSubscription")
            .field("descriptor", &self.descriptor)
            .field("rate", &*self.rate.borrow())
            .finish_non_exhaustive()
    }
}

impl<T> Drop for StreamSubscription<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Subscribe to `stream` on the TCP source at `host:port`.
///
/// The stream's type-tag must resolve to `T`'s kind.
pub async fn subscribe<T: StreamPayload>(
    host: &str,
    port: u16,
    stream: &StreamDescriptor,
) -> Result<StreamSubscription<T>> {
    if StreamKind::from_tag(&stream.type_tag) != Some(T::KIND) {
        return Err(Error::UnknownStreamType {
            name: stream.name.clone(),
            type_tag: stream.type_tag.clone(),
        });
    }

    let mut socket = TcpStream::connect((host, port)).await?;
    socket.set_nodelay(true)?;

    let mut request = Vec::with_capacity(4 + stream.name.len());
    request.extend_from_slice(&(stream.name.len() as u32).to_be_bytes());
    request.extend_from_slice(stream.name.as_bytes());
    socket.write_all(&request).await?;

    let (messages_tx, messages) = mpsc::unbounded_channel();
    let (rate_tx, rate) = watch::channel(None);
    let reader = BufReader::with_capacity(read_buffer_size(stream.large_messages), socket);
    let task = tokio::spawn(read_loop(
        reader,
        frame_limit(stream.large_messages),
        stream.name.clone(),
        messages_tx,
        rate_tx,
    ));

    tracing::debug!("Subscribed to {} at {}:{}", stream.name, host, port);
    Ok(StreamSubscription {
        descriptor: stream.clone(),
        messages,
        rate,
        task,
    })
}

/// Subscribe to the stream named `name` advertised by `endpoint`.
pub async fn subscribe_endpoint<T: StreamPayload>(
    endpoint: &Endpoint,
    name: &str,
) -> Result<StreamSubscription<T>> {
    let stream = endpoint
        .streams()
        .iter()
        .find(|s| s.name == name)
        .ok_or_else(|| Error::UnknownStream(name.to_string()))?;
    let (host, port) = endpoint.socket_address().ok_or(Error::NoSocketAddress)?;
    subscribe(host, port, stream).await
}

async fn read_loop<T: StreamPayload, R: AsyncRead + Unpin>(
    mut reader: R,
    limit: usize,
    name: String,
    messages: mpsc::UnboundedSender<Result<Envelope<T>>>,
    rate: watch::Sender<Option<f64>>,
) {
    let mut tracker = FrameRateTracker::default();
    loop {
        let result = read_frame::<T, R>(&mut reader, limit).await;
        if let Ok(envelope) = &result {
            let updated = tracker.record(envelope.originating_time);
            rate.send_replace(updated);
        }
        let failed = result.is_err();
        if let Err(e) = &result {
            tracing::debug!("Stream {} ended: {}", name, e);
        }
        if messages.send(result).is_err() || failed {
            return;
        }
    }
}

async fn read_frame<T: StreamPayload, R: AsyncRead + Unpin>(
    reader: &mut R,
    limit: usize,
) -> Result<Envelope<T>> {
    let size = match reader.read_u32().await {
        Ok(size) => size as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(Error::Closed),
        Err(e) => return Err(e.into()),
    };
    if size > limit {
        return Err(Error::FrameTooLarge { size, limit });
    }
    let mut body = vec![0u8; size];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use situate_core::Heartbeat;
    use std::time::Duration;

    async fn wait_for_subscribers<T: StreamPayload>(publisher: &StreamPublisher<T>, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while publisher.subscriber_count().await < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("subscriber never registered");
    }

    async fn pair<T: StreamPayload>(
        policy: DeliveryPolicy,
    ) -> (StreamPublisher<T>, StreamSubscription<T>) {
        let publisher = StreamPublisher::<T>::bind("127.0.0.1:0", "Stream", policy)
            .await
            .unwrap();
        let endpoint = publisher.endpoint("127.0.0.1");
        let subscription = subscribe_endpoint::<T>(&endpoint, "Stream").await.unwrap();
        wait_for_subscribers(&publisher, 1).await;
        (publisher, subscription)
    }

    #[tokio::test]
    async fn unlimited_delivers_everything_in_order() {
        let (publisher, mut subscription) = pair::<String>(DeliveryPolicy::Unlimited).await;
        for i in 0..20 {
            publisher.post(&format!("message {i}"), i * 1_000).await.unwrap();
        }
        for i in 0..20u64 {
            let envelope = subscription.recv().await.unwrap();
            assert_eq!(envelope.sequence, i);
            assert_eq!(envelope.payload, format!("message {i}"));
        }
    }

    #[tokio::test]
    async fn latest_only_ends_on_newest() {
        let (publisher, mut subscription) = pair::<String>(DeliveryPolicy::LatestOnly).await;
        for i in 0..200 {
            publisher.post(&i.to_string(), i).await.unwrap();
        }

        let mut received = 0;
        let last = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let envelope = subscription.recv().await.unwrap();
                received += 1;
                if envelope.sequence == 199 {
                    return envelope;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(last.payload, "199");
        assert!(received <= 200);
    }

    #[tokio::test]
    async fn throttle_loses_nothing() {
        let (publisher, mut subscription) = pair::<String>(DeliveryPolicy::Throttle).await;
        let producer = tokio::spawn(async move {
            for i in 0..50 {
                publisher.post(&i.to_string(), i).await.unwrap();
            }
            publisher
        });
        for i in 0..50u64 {
            assert_eq!(subscription.recv().await.unwrap().sequence, i);
        }
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn heartbeat_rate_follows_originating_time() {
        let (publisher, mut subscription) = pair::<Heartbeat>(DeliveryPolicy::Unlimited).await;
        for t in [0, 200_000, 400_000] {
            let beat = Heartbeat {
                video_rate: 30.0,
                depth_rate: 15.0,
                originating_time: t,
            };
            publisher.post(&beat, t).await.unwrap();
        }
        for _ in 0..3 {
            subscription.recv().await.unwrap();
        }
        assert_eq!(subscription.rate(), Some(5.0));
    }

    #[tokio::test]
    async fn shutdown_closes_connected_subscribers() {
        let (publisher, mut subscription) = pair::<String>(DeliveryPolicy::Unlimited).await;
        publisher.post(&"one".to_string(), 0).await.unwrap();
        assert_eq!(subscription.recv().await.unwrap().payload, "one");

        publisher.shutdown();
        let ended = tokio::time::timeout(Duration::from_secs(3), subscription.recv())
            .await
            .expect("subscriber still connected after shutdown");
        assert!(matches!(ended, Err(Error::Closed)), "{ended:?}");

        tokio::time::timeout(Duration::from_secs(3), async {
            while publisher.subscriber_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("outbox outlived its connection");
    }

    #[tokio::test]
    async fn dropping_the_publisher_closes_subscribers() {
        let (publisher, mut subscription) = pair::<String>(DeliveryPolicy::LatestOnly).await;
        drop(publisher);
        let ended = tokio::time::timeout(Duration::from_secs(3), subscription.recv())
            .await
            .expect("subscriber still connected after drop");
        assert!(ended.is_err());
    }

    #[tokio::test]
    async fn wrong_stream_name_is_refused() {
        let publisher =
            StreamPublisher::<String>::bind("127.0.0.1:0", "Text", DeliveryPolicy::Unlimited)
                .await
                .unwrap();
        let port = publisher.local_addr().port();
        let other = StreamKind::Text.descriptor("Other");
        let mut subscription = subscribe::<String>("127.0.0.1", port, &other).await.unwrap();
        assert!(subscription.recv().await.is_err());
        assert_eq!(publisher.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn mismatched_kind_is_rejected_before_connecting() {
        let stream = StreamDescriptor::new("Thing", "Foo");
        // Nothing listens on port 1; the tag check fails first.
        let err = subscribe::<String>("127.0.0.1", 1, &stream).await.unwrap_err();
        assert_eq!(err.to_string(), "Unknown stream type: Thing (Foo)");
    }

    #[tokio::test]
    async fn oversized_frames_need_the_large_flag() {
        let small =
            StreamPublisher::<String>::bind("127.0.0.1:0", "Text", DeliveryPolicy::Unlimited)
                .await
                .unwrap();
        let big = "x".repeat(MAX_FRAME + 1);
        assert!(matches!(
            small.post(&big, 0).await,
            Err(Error::FrameTooLarge { limit: MAX_FRAME, .. })
        ));

        let large = StreamPublisher::<String>::bind_as(
            "127.0.0.1:0",
            StreamKind::Text.descriptor("Text").large(),
            DeliveryPolicy::Unlimited,
        )
        .await
        .unwrap();
        assert!(large.post(&big, 0).await.is_ok());
    }
}
