//! Connection registry for the relay server
//!
//! Tracks which clients are currently connected and the last position each
//! of them reported. An entry exists exactly while the transport connection
//! is open: it is created on connect, overwritten in place by position
//! updates and removed on disconnect.
//!
//! All operations take the registry lock once, so each one is atomic with
//! respect to the whole table.

use crate::error::RegistryError;
use log::{debug, info};
use rand::distributions::Alphanumeric;
use rand::Rng;
use shared::{PlayerRecord, Position};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;

const CONNECTION_ID_LEN: usize = 20;

/// Opaque identifier assigned by the transport when a connection opens
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Draws a fresh random alphanumeric id
    pub fn generate() -> Self {
        let id = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(CONNECTION_ID_LEN)
            .map(char::from)
            .collect::<String>();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Last-known state of one connected client
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub id: ConnectionId,
    /// `None` until the client sends its first position update
    pub position: Option<Position>,
}

impl Connection {
    pub fn new(id: ConnectionId) -> Self {
        Self { id, position: None }
    }

    /// Converts the entry into its `players_list` wire form
    pub fn to_record(&self) -> PlayerRecord {
        PlayerRecord {
            id: self.id.to_string(),
            x: self.position.as_ref().map(|p| p.x.clone()),
            y: self.position.as_ref().map(|p| p.y.clone()),
        }
    }
}

/// Process-wide table of live connections
///
/// Owned by whoever builds the relay and shared behind an `Arc`; there is no
/// global instance. Synchronization is internal, so callers only ever see
/// whole operations.
#[derive(Debug, Default)]
pub struct Registry {
    connections: RwLock<HashMap<ConnectionId, Connection>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection with no position
    ///
    /// An id that is already present is rejected and the existing entry is
    /// left untouched.
    pub async fn register(&self, id: ConnectionId) -> Result<(), RegistryError> {
        let mut connections = self.connections.write().await;
        if connections.contains_key(&id) {
            return Err(RegistryError::DuplicateConnection(id));
        }

        info!("Player connected: {}", id);
        connections.insert(id.clone(), Connection::new(id));
        Ok(())
    }

    /// Removes a connection. Returns false if it was already gone, which is
    /// not an error since disconnect signals may be repeated.
    pub async fn unregister(&self, id: &ConnectionId) -> bool {
        let removed = self.connections.write().await.remove(id).is_some();
        if removed {
            info!("Player disconnected: {}", id);
        } else {
            debug!("Unregister for unknown connection {}", id);
        }
        removed
    }

    /// Overwrites the stored position of a connection
    ///
    /// Only registered ids can move. An update for an id that was never
    /// registered (or has already left) fails with
    /// [`RegistryError::UnknownConnection`] and changes nothing.
    pub async fn update_position(
        &self,
        id: &ConnectionId,
        position: Position,
    ) -> Result<(), RegistryError> {
        let mut connections = self.connections.write().await;
        match connections.get_mut(id) {
            Some(connection) => {
                connection.position = Some(position);
                Ok(())
            }
            None => Err(RegistryError::UnknownConnection(id.clone())),
        }
    }

    /// Point-in-time copy of every connection, ordered by id
    pub async fn snapshot(&self) -> Vec<Connection> {
        let mut connections: Vec<Connection> =
            self.connections.read().await.values().cloned().collect();
        connections.sort_by(|a, b| a.id.cmp(&b.id));
        connections
    }

    /// Ids of every connection at call time. Used as the recipient set for
    /// broadcasts.
    pub async fn ids(&self) -> Vec<ConnectionId> {
        self.connections.read().await.keys().cloned().collect()
    }

    /// Returns true if the id is currently registered
    pub async fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.read().await.contains_key(id)
    }

    /// Last reported position of a connection
    ///
    /// `None` both for unknown ids and for clients that have not moved yet;
    /// use [`Registry::contains`] to tell the two apart.
    pub async fn position(&self, id: &ConnectionId) -> Option<Position> {
        self.connections
            .read()
            .await
            .get(id)
            .and_then(|connection| connection.position.clone())
    }

    /// Returns the number of currently connected clients
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Returns true if no clients are currently connected
    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}
