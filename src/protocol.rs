//! Wire protocol between clients, gateways, and engine workers.
//!
//! Clients talk JSON over WebSocket; the gateway republishes inbound frames
//! onto the room's `game:{stake}:incoming` channel and relays events from
//! `game:{stake}:events` back to matching sockets.

use crate::types::{CardGrid, SelectedPlayer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pub/sub channel carrying client requests into the engine.
pub fn incoming_channel(stake: &str) -> String {
    format!("game:{stake}:incoming")
}

/// Pub/sub channel carrying engine events out to gateways.
pub fn events_channel(stake: &str) -> String {
    format!("game:{stake}:events")
}

/// Durable channel consumed by the persistence worker.
pub fn db_events_channel(stake: &str) -> String {
    format!("game:{stake}:db_events")
}

/// Messages a client may send. Internally tagged on `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join the room with one or more cards.
    SelectNumber {
        #[serde(rename = "player_id")]
        player_id: i64,
        #[serde(rename = "card_id")]
        card_ids: Vec<i64>,
    },
    /// Leave the room, releasing held cards.
    RemoveNumber {
        #[serde(rename = "userId")]
        user_id: i64,
    },
    /// Claim a win against the current game.
    Bingo {
        #[serde(rename = "userId")]
        user_id: i64,
        #[serde(rename = "calledNumbers", default)]
        called_numbers: Vec<u8>,
        #[serde(rename = "gameId")]
        game_id: i64,
    },
    /// Fetch the full grids for the caller's selected cards.
    CardData {
        #[serde(rename = "userId")]
        user_id: i64,
    },
    GetStakeStat,
    /// Register presence on the bingo page for this stake.
    JoinedBingo {
        #[serde(rename = "userId")]
        user_id: i64,
    },
    BlockUser {
        #[serde(rename = "userId")]
        user_id: i64,
    },
    FetchActiveGame,
    /// Sent by the gateway itself when a socket connects to an idle room.
    RequestGameStart,
}

/// Per-card payload for `card_data` responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CardData {
    pub id: i64,
    pub numbers: CardGrid,
}

/// One row of a `result` broadcast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_name: Option<i64>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub user_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card: Option<CardGrid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub winning_numbers: Vec<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub called_numbers: Vec<u8>,
    #[serde(default)]
    pub bones_won: f64,
}

/// Summary of one stake room for the `active_game_data` overview.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveGameEntry {
    pub is_running: bool,
    pub remaining_seconds: u64,
    pub winner_price: f64,
    pub bonus: bool,
}

/// Events published by the engine. Internally tagged on `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    PlayerList {
        player_list: Vec<SelectedPlayer>,
    },
    GameStat {
        running: bool,
        number_of_players: u32,
        stake: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        winner_price: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        bonus: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        game_id: Option<i64>,
        #[serde(default)]
        remaining_seconds: u64,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        called_numbers: Vec<u8>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        player_list: Vec<SelectedPlayer>,
    },
    GameStarted {
        game_id: i64,
        stake: u32,
        player_list: Vec<SelectedPlayer>,
    },
    RandomNumber {
        random_number: u8,
        game_id: i64,
    },
    Result {
        data: Vec<ResultEntry>,
        game_id: i64,
    },
    Error {
        message: String,
    },
    Success {
        message: String,
    },
    TimerMessage {
        remaining_seconds: u64,
    },
    ActiveGameData {
        data: BTreeMap<String, ActiveGameEntry>,
    },
    CardData {
        cards: Vec<CardData>,
    },
    NoCards {
        message: String,
    },
    GameInProgress {
        game_id: i64,
    },
}

/// Envelope for the outbound events channel. A `target_client_id` of `None`
/// means broadcast to the whole room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    pub event: ServerEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_client_id: Option<String>,
}

/// Envelope for the inbound channel, stamped by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEnvelope {
    pub client_id: String,
    pub stake: String,
    pub payload: ClientMessage,
}
