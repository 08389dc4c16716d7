//! Event relay: turns connection lifecycle events and client messages into
//! registry mutations and outbound messages.

use crate::error::{ChannelError, ErrorKind, RelayError};
use crate::registry::{ConnectionId, Registry};
use log::{debug, error, warn};
use shared::{ClientMessage, PlayerMove, ServerMessage};
use std::sync::Arc;

/// Delivery of one message to one connection, supplied by the transport
///
/// Implementations must not block: a slow connection should fail fast
/// (e.g. with [`ChannelError::Full`]) rather than stall the caller.
pub trait Channel: Send + Sync {
    fn send(&self, to: &ConnectionId, message: &ServerMessage) -> Result<(), ChannelError>;
}

impl<C: Channel + ?Sized> Channel for Arc<C> {
    fn send(&self, to: &ConnectionId, message: &ServerMessage) -> Result<(), ChannelError> {
        (**self).send(to, message)
    }
}

/// Inbound events delivered by the transport for a single connection
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connect,
    Disconnect,
    Message(ClientMessage),
}

/// Who receives a fan-out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Audience<'a> {
    Everyone,
    EveryoneExcept(&'a ConnectionId),
}

pub struct Relay<C> {
    registry: Arc<Registry>,
    channel: C,
}

impl<C: Channel> Relay<C> {
    /// Creates a relay over an existing registry and outbound channel
    ///
    /// The registry is shared so the transport (and tests) can inspect it
    /// while the relay is running. The relay never closes connections
    /// itself; it only reacts to the events the transport feeds it.
    pub fn new(registry: Arc<Registry>, channel: C) -> Self {
        Self { registry, channel }
    }

    /// Registry backing this relay
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Runs the handler for `event` and reports any failure to `id`
    pub async fn dispatch(&self, id: &ConnectionId, event: Event) {
        let result = match event {
            Event::Connect => self.on_connect(id).await,
            Event::Disconnect => {
                self.on_disconnect(id).await;
                Ok(())
            }
            Event::Message(ClientMessage::PlayerMove(player_move)) => {
                self.on_position_update(id, player_move).await
            }
            Event::Message(ClientMessage::GetPlayers) => self.on_get_players(id).await,
        };

        if let Err(err) = result {
            self.report(id, &err);
        }
    }

    /// Parses one text frame from `id` and dispatches it
    pub async fn handle_frame(&self, id: &ConnectionId, text: &str) {
        match ClientMessage::parse(text) {
            Ok(message) => self.dispatch(id, Event::Message(message)).await,
            Err(err) => self.report(id, &RelayError::from(err)),
        }
    }

    /// Registers the connection, confirms it to the client and announces it
    /// to everyone else
    pub async fn on_connect(&self, id: &ConnectionId) -> Result<(), RelayError> {
        self.registry.register(id.clone()).await?;

        if let Err(err) = self.channel.send(id, &ServerMessage::connected(id.as_str())) {
            warn!("Failed to confirm connection {}: {}", id, err);
        }

        let joined = ServerMessage::PlayerJoined {
            player_id: id.to_string(),
        };
        self.broadcast(&joined, Audience::EveryoneExcept(id)).await;
        Ok(())
    }

    /// Removes the connection and tells the remaining clients
    ///
    /// The `player_left` notice goes out even when the id was not
    /// registered, because peers may still believe it is present.
    pub async fn on_disconnect(&self, id: &ConnectionId) {
        self.registry.unregister(id).await;

        let left = ServerMessage::PlayerLeft {
            player_id: id.to_string(),
        };
        self.broadcast(&left, Audience::Everyone).await;
    }

    /// Stores the sender's new position and echoes the move to every client,
    /// the sender included
    pub async fn on_position_update(
        &self,
        id: &ConnectionId,
        player_move: PlayerMove,
    ) -> Result<(), RelayError> {
        self.registry
            .update_position(id, player_move.position())
            .await?;

        debug!(
            "Player {} moved to ({}, {})",
            player_move.player_id, player_move.x, player_move.y
        );

        self.broadcast(&ServerMessage::PlayerMove(player_move), Audience::Everyone)
            .await;
        Ok(())
    }

    /// Sends the current roster to the requesting client only
    pub async fn on_get_players(&self, id: &ConnectionId) -> Result<(), RelayError> {
        let players = self
            .registry
            .snapshot()
            .await
            .iter()
            .map(|connection| connection.to_record())
            .collect();

        self.channel
            .send(id, &ServerMessage::PlayersList { players })?;
        Ok(())
    }

    /// Sends `message` to every registered connection in `audience`.
    ///
    /// Recipients come from a registry snapshot taken now. A failed send is
    /// logged and skipped so one bad connection never blocks the others.
    /// Returns the number of successful deliveries.
    async fn broadcast(&self, message: &ServerMessage, audience: Audience<'_>) -> usize {
        let recipients = self.registry.ids().await;
        let mut delivered = 0;

        for recipient in &recipients {
            if let Audience::EveryoneExcept(excluded) = audience {
                if recipient == excluded {
                    continue;
                }
            }

            match self.channel.send(recipient, message) {
                Ok(()) => delivered += 1,
                Err(err) => warn!("Failed to send to client {}: {}", recipient, err),
            }
        }

        delivered
    }

    /// Logs a failed event and, where appropriate, tells the client about it
    fn report(&self, id: &ConnectionId, err: &RelayError) {
        match err.kind() {
            ErrorKind::Validation => warn!("Rejected message from {}: {}", id, err),
            ErrorKind::UnknownConnection => {
                warn!("Ignoring event from unregistered connection {}: {}", id, err)
            }
            ErrorKind::DuplicateConnection => error!("Rejected connect for {}: {}", id, err),
            ErrorKind::Unexpected => error!("Error handling event from {}: {}", id, err),
        }

        if let Some(message) = err.client_message() {
            if let Err(send_err) = self.channel.send(id, &ServerMessage::error(message)) {
                warn!("Failed to report error to {}: {}", id, send_err);
            }
        }
    }
}
