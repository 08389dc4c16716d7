//! # Position Relay Server Library
//!
//! This library implements a real-time presence and position relay. Clients
//! connect over a WebSocket, announce themselves, stream position updates and
//! receive the updates of every other connected client.
//!
//! ## Core Responsibilities
//!
//! ### Presence Tracking
//! The registry holds one entry per open connection, created on connect and
//! removed on disconnect, together with the last position the client reported.
//! Nothing outlives the process.
//!
//! ### Fan-out
//! Each inbound event is turned into registry mutations and outbound messages:
//! - `connected` to the new client, `player_joined` to everybody else
//! - `player_left` to every remaining client on disconnect
//! - `player_move` echoed to every client, the sender included
//! - `players_list` to the requesting client only
//!
//! ## Module Organization
//!
//! ### Registry Module (`registry`)
//! Connection table with internal locking and point-in-time snapshots.
//!
//! ### Relay Module (`relay`)
//! Event handlers and the [`relay::Channel`] seam through which the transport
//! delivers messages to a single connection. Broadcasts are computed here over
//! a registry snapshot, one send per recipient, so a failing connection is
//! skipped rather than aborting the fan-out.
//!
//! ### Network Module (`network`)
//! WebSocket listener, per-connection reader/writer tasks, bounded outbound
//! queues and idle detection. Turns socket activity into relay events.
//!
//! ### Error Module (`error`)
//! Typed errors for each failure kind and how each one is reported.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::{Server, ServerSettings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let server = Server::bind("0.0.0.0:3001", ServerSettings::default())
//!         .await
//!         .map_err(|e| e.to_string())?;
//!     server.run().await
//! }
//! ```
//!
//! ## Concurrency
//!
//! Connections are served by independent tasks, so events from different
//! clients are handled concurrently while each client's own events are
//! handled in arrival order. Registry operations are atomic; a broadcast uses
//! whatever set of connections exists when it starts, so a client leaving
//! mid-broadcast may or may not see that message.

pub mod error;
pub mod network;
pub mod registry;
pub mod relay;

pub use error::{ChannelError, ErrorKind, RegistryError, RelayError};
pub use registry::{Connection, ConnectionId, Registry};
pub use relay::{Channel, Event, Relay};
