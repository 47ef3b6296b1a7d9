//! Rendezvous server.
//!
//! Accepts control connections, keeps the authoritative directory and
//! broadcasts every change to all connected clients, the originator
//! included. The server also acts as a local participant: the process that
//! hosts it can add and remove its own processes directly.
//!
//! A client disconnecting does not withdraw the processes it added. Peers
//! replace stale entries by removing them before adding. An add for a name
//! that is already taken is answered, to that client only, with the entry
//! the server kept.

use crate::wire::{self, Update};
use crate::{Error, Result};
use situate_core::{Process, Rendezvous, RendezvousEvent};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::BufWriter;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;

struct Shared {
    directory: Mutex<Rendezvous>,
    events: broadcast::Sender<RendezvousEvent>,
}

impl Shared {
    /// Apply a mutation and publish its events while the lock is held, so
    /// subscribers observe changes in directory order.
    async fn mutate<T>(&self, f: impl FnOnce(&mut Rendezvous) -> T) -> T {
        let mut directory = self.directory.lock().await;
        let result = f(&mut *directory);
        for event in directory.take_events() {
            // No receivers is fine.
            let _ = self.events.send(event);
        }
        result
    }
}

pub struct RendezvousServer {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl RendezvousServer {
    /// Bind and start accepting clients.
    pub async fn bind(addr: impl tokio::net::ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (events, _) = broadcast::channel(256);
        let shared = Arc::new(Shared {
            directory: Mutex::new(Rendezvous::new()),
            events,
        });

        tracing::info!("Rendezvous server listening on {}", local_addr);
        let accept_task = tokio::spawn(accept_loop(listener, shared.clone()));

        Ok(Self {
            shared,
            local_addr,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Add a process hosted by this server. Fails on a duplicate name.
    pub async fn try_add_process(&self, process: Process) -> bool {
        self.shared.mutate(|d| d.try_add_process(process)).await
    }

    /// Remove a process by name. Absent names are a no-op.
    pub async fn try_remove_process(&self, name: &str) -> bool {
        self.shared.mutate(|d| d.try_remove_process(name)).await
    }

    pub async fn processes(&self) -> Vec<Process> {
        self.shared.directory.lock().await.processes().to_vec()
    }

    /// Current directory plus a feed of every later change, with no gap
    /// between the two.
    pub async fn subscribe(&self) -> (Vec<Process>, broadcast::Receiver<RendezvousEvent>) {
        let directory = self.shared.directory.lock().await;
        let rx = self.shared.events.subscribe();
        (directory.processes().to_vec(), rx)
    }

    /// Stop accepting clients. Open connections end when their peers leave.
    pub fn shutdown(&self) {
        self.accept_task.abort();
    }
}

impl Drop for RendezvousServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        let (stream, client_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("Rendezvous accept failed: {}", e);
                continue;
            }
        };
        let shared = shared.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, client_addr, shared).await {
                tracing::warn!("Rendezvous connection error from {}: {}", client_addr, e);
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
) -> Result<()> {
    let (mut reader, writer) = stream.into_split();
    let mut writer = BufWriter::new(writer);

    tracing::debug!("New rendezvous connection from {}", addr);

    // Answer with our version even on mismatch so the client can report it.
    let version = wire::read_version(&mut reader).await;
    wire::write_version(&mut writer).await?;
    version?;

    wire::write_string(&mut writer, &addr.ip().to_string()).await?;

    let (snapshot, mut updates) = {
        let directory = shared.directory.lock().await;
        (directory.processes().to_vec(), shared.events.subscribe())
    };
    wire::write_snapshot(&mut writer, &snapshot).await?;

    let (replies_tx, mut replies) = mpsc::unbounded_channel();
    let mut read_task = tokio::spawn(read_loop(reader, addr, shared.clone(), replies_tx));

    let result = loop {
        tokio::select! {
            // Broadcasts queued before a reply was produced go out first.
            biased;

            read = &mut read_task => {
                break match read {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::warn!("Rendezvous reader for {} ended abnormally: {}", addr, e);
                        Err(Error::Closed)
                    }
                };
            }

            event = updates.recv() => {
                let update = match event {
                    Ok(RendezvousEvent::ProcessAdded(p)) => Update::AddProcess(p),
                    Ok(RendezvousEvent::ProcessRemoved(p)) => Update::RemoveProcess(p.name),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // The replica is now inconsistent; make the client reconnect.
                        tracing::warn!("Rendezvous client {} lagged by {} updates", addr, n);
                        read_task.abort();
                        break Err(Error::Closed);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        read_task.abort();
                        break Ok(());
                    }
                };
                if let Err(e) = wire::write_update(&mut writer, &update).await {
                    read_task.abort();
                    break Err(e);
                }
            }

            Some(reply) = replies.recv() => {
                if let Err(e) = wire::write_update(&mut writer, &reply).await {
                    read_task.abort();
                    break Err(e);
                }
            }
        }
    };

    let _ = wire::write_update(&mut writer, &Update::Disconnect).await;
    tracing::debug!("Rendezvous connection closed: {}", addr);
    result
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    addr: SocketAddr,
    shared: Arc<Shared>,
    replies: mpsc::UnboundedSender<Update>,
) -> Result<()> {
    loop {
        match wire::read_update(&mut reader).await {
            Ok(Update::Disconnect) => return Ok(()),
            Ok(Update::AddProcess(process)) => {
                let name = process.name.clone();
                let kept = shared
                    .mutate(|d| {
                        if d.try_add_process(process) {
                            None
                        } else {
                            d.get(&name).cloned()
                        }
                    })
                    .await;
                match kept {
                    None => tracing::info!("{} added process {}", addr, name),
                    Some(kept) => {
                        tracing::warn!("{} tried to add {}, which is already registered", addr, name);
                        let _ = replies.send(Update::AddProcess(kept));
                    }
                }
            }
            Ok(Update::RemoveProcess(name)) => {
                if shared.mutate(|d| d.try_remove_process(&name)).await {
                    tracing::info!("{} removed process {}", addr, name);
                }
            }
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}
