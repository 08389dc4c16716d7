//! Wire protocol shared by the relay server and its clients.
//!
//! Every WebSocket text frame carries one JSON envelope of the form
//! `{"event": <name>, "data": <payload>}`. Inbound frames are parsed into the
//! closed set of [`ClientMessage`] variants; anything that does not fit is
//! rejected with a [`ProtocolError`] before it can touch server state.

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 3001;
pub const CONNECTED_MESSAGE: &str = "Successfully connected to server";
pub const PLAYER_MOVE_FIELDS: &[&str] = &["playerId", "x", "y"];

/// A 2D position. Coordinates are kept as raw JSON numbers so that integers
/// and floats are echoed back exactly as the client sent them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: Number,
    pub y: Number,
}

impl Position {
    pub fn new(x: impl Into<Number>, y: impl Into<Number>) -> Self {
        Self {
            x: x.into(),
            y: y.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerMove {
    #[serde(rename = "playerId")]
    pub player_id: String,
    pub x: Number,
    pub y: Number,
}

impl PlayerMove {
    pub fn new(player_id: impl Into<String>, x: impl Into<Number>, y: impl Into<Number>) -> Self {
        Self {
            player_id: player_id.into(),
            x: x.into(),
            y: y.into(),
        }
    }

    pub fn position(&self) -> Position {
        Position {
            x: self.x.clone(),
            y: self.y.clone(),
        }
    }
}

/// One entry of a `players_list` reply. `x`/`y` are omitted until the
/// player has sent its first accepted move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<Number>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<Number>,
}

/// Raw envelope as it appears on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// Messages sent by clients
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    PlayerMove(PlayerMove),
    GetPlayers,
}

impl ClientMessage {
    /// Parses a text frame. Fails closed: a frame is either a fully typed
    /// message or an error, never something in between.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        match envelope.event.as_str() {
            "player_move" => {
                let complete = envelope
                    .data
                    .as_object()
                    .map(|fields| PLAYER_MOVE_FIELDS.iter().all(|key| fields.contains_key(*key)))
                    .unwrap_or(false);
                if !complete {
                    return Err(ProtocolError::MissingFields {
                        event: "player_move",
                        required: PLAYER_MOVE_FIELDS,
                    });
                }

                serde_json::from_value(envelope.data)
                    .map(ClientMessage::PlayerMove)
                    .map_err(|source| ProtocolError::InvalidPayload {
                        action: "player move",
                        source,
                    })
            }
            "get_players" => Ok(ClientMessage::GetPlayers),
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Messages sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        message: String,
        #[serde(rename = "playerId")]
        player_id: String,
    },
    PlayerJoined {
        #[serde(rename = "playerId")]
        player_id: String,
    },
    PlayerLeft {
        #[serde(rename = "playerId")]
        player_id: String,
    },
    PlayerMove(PlayerMove),
    PlayersList {
        players: Vec<PlayerRecord>,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn connected(player_id: impl Into<String>) -> Self {
        ServerMessage::Connected {
            message: CONNECTED_MESSAGE.to_string(),
            player_id: player_id.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("Invalid {event} data. Required: {}", .required.join(", "))]
    MissingFields {
        event: &'static str,
        required: &'static [&'static str],
    },

    #[error("Error processing {action}: {source}")]
    InvalidPayload {
        action: &'static str,
        source: serde_json::Error,
    },
}
