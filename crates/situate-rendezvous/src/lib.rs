//! Rendezvous over TCP.
//!
//! A rendezvous server keeps the directory of [`Process`]es and relays every
//! addition and removal to all connected clients. Clients use it to discover
//! each other's stream and clock endpoints before connecting directly.
//!
//! [`Process`]: situate_core::Process

mod client;
mod error;
mod server;
pub mod wire;

pub use client::{ClientEvent, ConnectionStatus, RendezvousClient};
pub use error::{Error, Result};
pub use server::RendezvousServer;
