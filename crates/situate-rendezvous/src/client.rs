//! Rendezvous client.
//!
//! [`RendezvousClient::start`] returns immediately and performs the
//! handshake in the background; [`RendezvousClient::connected`] is the wait
//! handle. The client keeps a replica of the server's directory and raises
//! [`ClientEvent`]s for every change, including the processes present at
//! connection time.
//!
//! Local changes are applied to the replica first and then announced. The
//! server echoes accepted changes back; the replica remembers what it
//! announced so those echoes are not applied twice. An add the server
//! refuses comes back as the entry the server kept.

use crate::wire::{self, Update};
use crate::{Error, Result};
use situate_core::{Process, Rendezvous, RendezvousEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::BufWriter;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, broadcast, oneshot, watch};
use tokio::task::JoinHandle;

/// Connection progress, observable through [`RendezvousClient::connected`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    /// Handshake done. `client_address` is this host as the server sees it.
    Connected { client_address: String },
    Failed(String),
    Stopped,
}

/// Notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Rendezvous(RendezvousEvent),
    /// The server broke protocol; the replica is no longer trustworthy.
    Error(String),
    Disconnected,
}

struct Replica {
    directory: Rendezvous,
    /// Names we removed whose echo has not arrived.
    removing: Vec<String>,
    /// Processes we announced, waiting for the server's verdict.
    adding: HashMap<String, (Process, oneshot::Sender<bool>)>,
}

impl Replica {
    fn new() -> Self {
        Self {
            directory: Rendezvous::new(),
            removing: Vec::new(),
            adding: HashMap::new(),
        }
    }

    fn apply(&mut self, update: Update) -> Result<()> {
        match update {
            Update::AddProcess(process) => match self.adding.remove(&process.name) {
                Some((announced, verdict)) => {
                    let accepted = announced == process;
                    if !accepted {
                        // Someone else holds the name; adopt their entry.
                        self.directory.try_remove_process(&process.name);
                        self.directory.try_add_process(process);
                    }
                    let _ = verdict.send(accepted);
                }
                None => {
                    self.directory.try_add_process(process);
                }
            },
            Update::RemoveProcess(name) => {
                if let Some(index) = self.removing.iter().position(|n| *n == name) {
                    self.removing.swap_remove(index);
                } else {
                    self.directory.try_remove_process(&name);
                }
            }
            Update::Disconnect => return Err(Error::UnexpectedAction(0)),
        }
        Ok(())
    }

    /// Fail every add still waiting for the server.
    fn abandon(&mut self) {
        self.removing.clear();
        self.adding.clear();
    }
}

struct Shared {
    replica: Mutex<Replica>,
    writer: Mutex<Option<BufWriter<OwnedWriteHalf>>>,
    status: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<ClientEvent>,
}

impl Shared {
    async fn mutate<T>(&self, f: impl FnOnce(&mut Replica) -> T) -> T {
        let mut replica = self.replica.lock().await;
        let result = f(&mut *replica);
        for event in replica.directory.take_events() {
            let _ = self.events.send(ClientEvent::Rendezvous(event));
        }
        result
    }

    async fn send(&self, update: &Update) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(Error::NotConnected)?;
        wire::write_update(writer, update).await
    }
}

pub struct RendezvousClient {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl RendezvousClient {
    /// Begin connecting to `server` (`host:port`) in the background.
    pub fn start(server: impl Into<String>) -> Self {
        let server = server.into();
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        let (events, _) = broadcast::channel(256);
        let shared = Arc::new(Shared {
            replica: Mutex::new(Replica::new()),
            writer: Mutex::new(None),
            status,
            events,
        });

        let task = tokio::spawn(run(server, shared.clone()));
        Self { shared, task }
    }

    /// Wait for the handshake. Returns the client address seen by the server.
    pub async fn connected(&self) -> Result<String> {
        let mut rx = self.shared.status.subscribe();
        loop {
            let status = rx.borrow_and_update().clone();
            match status {
                ConnectionStatus::Connected { client_address } => return Ok(client_address),
                ConnectionStatus::Failed(message) => return Err(Error::ConnectFailed(message)),
                ConnectionStatus::Stopped => return Err(Error::Closed),
                ConnectionStatus::Connecting => {}
            }
            if rx.changed().await.is_err() {
                return Err(Error::Closed);
            }
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.borrow().clone()
    }

    /// Subscribe to directory changes. Subscribing before the handshake
    /// completes also yields the initial processes.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    pub async fn processes(&self) -> Vec<Process> {
        self.shared.replica.lock().await.directory.processes().to_vec()
    }

    pub async fn process(&self, name: &str) -> Option<Process> {
        self.shared.replica.lock().await.directory.get(name).cloned()
    }

    /// Add a process and wait for the server to accept it.
    ///
    /// `Ok(false)` when the name is taken, either in the local replica
    /// (nothing is sent; remove the stale entry first) or on the server, in
    /// which case the replica now holds the server's entry.
    pub async fn try_add_process(&self, process: Process) -> Result<bool> {
        let name = process.name.clone();
        let update = Update::AddProcess(process.clone());
        let (verdict_tx, verdict) = oneshot::channel();
        let added = self
            .shared
            .mutate(|r| {
                let added = r.directory.try_add_process(process.clone());
                if added {
                    r.adding.insert(name.clone(), (process, verdict_tx));
                }
                added
            })
            .await;
        if !added {
            return Ok(false);
        }
        if let Err(e) = self.shared.send(&update).await {
            self.shared.replica.lock().await.adding.remove(&name);
            return Err(e);
        }
        verdict.await.map_err(|_| Error::Closed)
    }

    /// Remove a process locally and ask the server to remove it too.
    ///
    /// The request is sent even when the local replica has no such entry,
    /// so a stale registration left by a crashed predecessor is cleared.
    pub async fn try_remove_process(&self, name: &str) -> Result<bool> {
        let removed = self
            .shared
            .mutate(|r| {
                let removed = r.directory.try_remove_process(name);
                if removed {
                    r.removing.push(name.to_string());
                }
                removed
            })
            .await;
        if let Err(e) = self.shared.send(&Update::RemoveProcess(name.to_string())).await {
            if removed {
                let mut replica = self.shared.replica.lock().await;
                if let Some(index) = replica.removing.iter().position(|n| n == name) {
                    replica.removing.swap_remove(index);
                }
            }
            return Err(e);
        }
        Ok(removed)
    }

    /// Say goodbye and close the control connection.
    pub async fn stop(&self) {
        if let Err(e) = self.shared.send(&Update::Disconnect).await {
            tracing::debug!("Rendezvous disconnect not sent: {}", e);
        }
        self.shared.writer.lock().await.take();
        self.task.abort();
        self.shared.replica.lock().await.abandon();
        self.shared.status.send_replace(ConnectionStatus::Stopped);
    }
}

impl Drop for RendezvousClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(server: String, shared: Arc<Shared>) {
    let reader = match handshake(&server, &shared).await {
        Ok(reader) => reader,
        Err(e) => {
            tracing::warn!("Rendezvous connection to {} failed: {}", server, e);
            shared
                .status
                .send_replace(ConnectionStatus::Failed(e.to_string()));
            return;
        }
    };

    match read_updates(reader, &shared).await {
        Ok(()) => tracing::info!("Rendezvous server {} disconnected", server),
        Err(e) => {
            tracing::warn!("Rendezvous protocol error from {}: {}", server, e);
            let _ = shared.events.send(ClientEvent::Error(e.to_string()));
        }
    }
    shared.writer.lock().await.take();
    shared.replica.lock().await.abandon();
    shared.status.send_replace(ConnectionStatus::Stopped);
    let _ = shared.events.send(ClientEvent::Disconnected);
}

async fn handshake(server: &str, shared: &Shared) -> Result<OwnedReadHalf> {
    let stream = TcpStream::connect(server).await?;
    let (mut reader, writer) = stream.into_split();
    let mut writer = BufWriter::new(writer);

    wire::write_version(&mut writer).await?;
    wire::read_version(&mut reader).await?;
    let client_address = wire::read_string(&mut reader).await?;

    for update in wire::read_snapshot(&mut reader).await? {
        shared.mutate(|r| r.apply(update)).await?;
    }

    *shared.writer.lock().await = Some(writer);
    tracing::info!(
        "Connected to rendezvous server {} as {}",
        server,
        client_address
    );
    shared
        .status
        .send_replace(ConnectionStatus::Connected { client_address });
    Ok(reader)
}

async fn read_updates(mut reader: OwnedReadHalf, shared: &Shared) -> Result<()> {
    loop {
        match wire::read_update(&mut reader).await {
            Ok(Update::Disconnect) => return Ok(()),
            Ok(update) => shared.mutate(|r| r.apply(update)).await?,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RendezvousServer;
    use situate_core::{Endpoint, StreamDescriptor};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next_rendezvous(rx: &mut broadcast::Receiver<ClientEvent>) -> RendezvousEvent {
        loop {
            let event = timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out")
                .expect("channel closed");
            if let ClientEvent::Rendezvous(event) = event {
                return event;
            }
        }
    }

    fn client_process() -> Process {
        Process::new("CaptureClient", "1").with_endpoint(Endpoint::tcp_source(
            "127.0.0.1",
            30000,
            vec![StreamDescriptor::new("Video", "situate.image").large()],
        ))
    }

    #[tokio::test]
    async fn handshake_reports_address_and_snapshot() {
        let server = RendezvousServer::bind("127.0.0.1:0").await.unwrap();
        assert!(server.try_add_process(Process::new("CaptureServer", "1")).await);

        let client = RendezvousClient::start(server.local_addr().to_string());
        let mut rx = client.subscribe();
        let address = client.connected().await.unwrap();
        assert_eq!(address, "127.0.0.1");

        let event = next_rendezvous(&mut rx).await;
        assert!(matches!(event, RendezvousEvent::ProcessAdded(p) if p.name == "CaptureServer"));
        assert!(client.process("CaptureServer").await.is_some());
    }

    #[tokio::test]
    async fn add_and_remove_reach_other_clients() {
        let server = RendezvousServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().to_string();

        let producer = RendezvousClient::start(addr.clone());
        let observer = RendezvousClient::start(addr);
        producer.connected().await.unwrap();
        let mut rx = observer.subscribe();
        observer.connected().await.unwrap();

        assert!(producer.try_add_process(client_process()).await.unwrap());
        let added = next_rendezvous(&mut rx).await;
        assert_eq!(added, RendezvousEvent::ProcessAdded(client_process()));

        assert!(producer.try_remove_process("CaptureClient").await.unwrap());
        let removed = next_rendezvous(&mut rx).await;
        assert!(matches!(removed, RendezvousEvent::ProcessRemoved(p) if p.name == "CaptureClient"));
        assert!(observer.processes().await.is_empty());
    }

    #[tokio::test]
    async fn stale_entry_is_replaced() {
        let server = RendezvousServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().to_string();

        // A previous instance registered and then vanished without cleanup.
        let crashed = RendezvousClient::start(addr.clone());
        crashed.connected().await.unwrap();
        crashed.try_add_process(client_process()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(crashed);

        let fresh = RendezvousClient::start(addr);
        fresh.connected().await.unwrap();
        assert!(!fresh.try_add_process(client_process()).await.unwrap());
        assert!(fresh.try_remove_process("CaptureClient").await.unwrap());
        assert!(fresh.try_add_process(client_process()).await.unwrap());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.processes().await, vec![client_process()]);
    }

    #[tokio::test]
    async fn replacing_own_entry_raises_no_echo_events() {
        let server = RendezvousServer::bind("127.0.0.1:0").await.unwrap();
        let stale = Process::new("CaptureClient", "0");
        assert!(server.try_add_process(stale.clone()).await);

        let client = RendezvousClient::start(server.local_addr().to_string());
        let mut rx = client.subscribe();
        client.connected().await.unwrap();
        assert_eq!(
            next_rendezvous(&mut rx).await,
            RendezvousEvent::ProcessAdded(stale.clone())
        );

        assert!(client.try_remove_process("CaptureClient").await.unwrap());
        // Returns once the add echo is back; the remove echo came before it.
        assert!(client.try_add_process(client_process()).await.unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ClientEvent::Rendezvous(event) = event {
                seen.push(event);
            }
        }
        assert_eq!(
            seen,
            vec![
                RendezvousEvent::ProcessRemoved(stale),
                RendezvousEvent::ProcessAdded(client_process()),
            ]
        );
        assert_eq!(client.processes().await, vec![client_process()]);
    }

    #[tokio::test]
    async fn name_taken_on_the_server_is_not_ours() {
        let server = RendezvousServer::bind("127.0.0.1:0").await.unwrap();
        let client = RendezvousClient::start(server.local_addr().to_string());
        client.connected().await.unwrap();

        let kept = Process::new("CaptureClient", "1")
            .with_endpoint(Endpoint::clock_exporter("10.0.0.9", 4000));
        assert!(server.try_add_process(kept.clone()).await);

        // Whether or not the replica has caught up, the add loses.
        assert!(!client.try_add_process(client_process()).await.unwrap());
        assert_eq!(client.process("CaptureClient").await, Some(kept.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.processes().await, vec![kept]);
    }

    #[tokio::test]
    async fn refused_add_adopts_the_server_entry() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let kept = Process::new("CaptureClient", "1")
            .with_endpoint(Endpoint::clock_exporter("10.0.0.9", 4000));
        let reply = kept.clone();
        let fake = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            wire::read_version(&mut socket).await.unwrap();
            wire::write_version(&mut socket).await.unwrap();
            wire::write_string(&mut socket, "127.0.0.1").await.unwrap();
            wire::write_snapshot(&mut socket, &[]).await.unwrap();
            let request = wire::read_update(&mut socket).await.unwrap();
            assert!(matches!(request, Update::AddProcess(p) if p.name == "CaptureClient"));
            wire::write_update(&mut socket, &Update::AddProcess(reply)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let client = RendezvousClient::start(addr);
        client.connected().await.unwrap();
        assert!(!client.try_add_process(client_process()).await.unwrap());
        assert_eq!(client.process("CaptureClient").await, Some(kept));
        fake.await.unwrap();
    }

    #[tokio::test]
    async fn remove_of_unknown_name_is_harmless() {
        let server = RendezvousServer::bind("127.0.0.1:0").await.unwrap();
        let client = RendezvousClient::start(server.local_addr().to_string());
        client.connected().await.unwrap();
        assert!(!client.try_remove_process("nobody").await.unwrap());
        assert!(!server.try_remove_process("nobody").await);
        assert_eq!(
            client.status(),
            ConnectionStatus::Connected {
                client_address: "127.0.0.1".into()
            }
        );
    }

    #[tokio::test]
    async fn refused_connection_fails_the_wait() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = RendezvousClient::start(addr);
        assert!(matches!(client.connected().await, Err(Error::ConnectFailed(_))));
    }

    #[tokio::test]
    async fn protocol_violation_is_reported() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let fake = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.read_i16_le().await.unwrap();
            let mut hello = Vec::new();
            hello.extend_from_slice(&wire::PROTOCOL_VERSION.to_le_bytes());
            hello.extend_from_slice(&[1, b'x']);
            hello.extend_from_slice(&0i32.to_le_bytes());
            hello.push(9);
            socket.write_all(&hello).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let client = RendezvousClient::start(addr);
        let mut rx = client.subscribe();
        client.connected().await.unwrap();
        let event = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(event, ClientEvent::Error("unexpected rendezvous action: 9".into()));
        fake.await.unwrap();
    }
}
