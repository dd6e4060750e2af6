//! Core domain types: cards, games, player selections.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Sentinel user id for synthetic (bot) players.
pub const BOT_USER_ID: i64 = 0;

/// Numbers drawable in one game, 1..=75.
pub const DRAW_POOL_SIZE: u8 = 75;

/// A 5x5 bingo card grid. The center cell holds the free value 0.
pub type CardGrid = [[u8; 5]; 5];

/// Persistent, immutable bingo card. Referenced by id everywhere else.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Card {
    pub id: i64,
    pub numbers: CardGrid,
}

/// A player's selection inside one stake room: which cards they hold.
///
/// Serialized only at the store boundary; in memory this is always the
/// explicit struct, never loose JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectedPlayer {
    #[serde(rename = "user")]
    pub user_id: i64,
    #[serde(rename = "card")]
    pub card_ids: Vec<i64>,
}

impl SelectedPlayer {
    pub fn is_bot(&self) -> bool {
        self.user_id == BOT_USER_ID
    }
}

/// Total cards held across a selection list. This is the room player count
/// broadcast to clients (a user holding two cards counts twice).
pub fn total_cards(players: &[SelectedPlayer]) -> u32 {
    players.iter().map(|p| p.card_ids.len() as u32).sum()
}

/// Card ids already held within a selection list.
pub fn used_card_ids(players: &[SelectedPlayer]) -> HashSet<i64> {
    players
        .iter()
        .flat_map(|p| p.card_ids.iter().copied())
        .collect()
}

/// Game lifecycle. Transitions only move forward:
/// Created -> Started -> Playing -> Closed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GameStatus {
    Created,
    Started,
    Playing,
    Closed,
}

impl GameStatus {
    /// Whether `next` is a legal forward transition from `self`.
    pub fn can_transition_to(self, next: GameStatus) -> bool {
        (next as u8) >= (self as u8)
    }
}

impl fmt::Display for GameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameStatus::Created => write!(f, "created"),
            GameStatus::Started => write!(f, "started"),
            GameStatus::Playing => write!(f, "playing"),
            GameStatus::Closed => write!(f, "closed"),
        }
    }
}

/// Authoritative game record. Created by the scheduler at round start,
/// mutated by the number caller and settlement, closed exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Game {
    pub id: i64,
    pub stake: u32,
    /// Snapshot of selections at game start (post stake collection).
    pub players: Vec<SelectedPlayer>,
    pub number_of_players: u32,
    /// Pre-shuffled permutation of 1..=75.
    pub draw_sequence: Vec<u8>,
    pub called_numbers: Vec<u8>,
    pub total_calls: u32,
    pub status: GameStatus,
    pub winner_price: f64,
    pub admin_cut: f64,
    pub bonus: f64,
    pub winner_id: Option<i64>,
    pub winner_card: Option<i64>,
    pub winner_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

impl Game {
    /// Card ids held by a given user in this game, in selection order.
    pub fn cards_of(&self, user_id: i64) -> Vec<i64> {
        self.players
            .iter()
            .filter(|p| p.user_id == user_id)
            .flat_map(|p| p.card_ids.iter().copied())
            .collect()
    }

    pub fn is_finalized(&self) -> bool {
        self.status == GameStatus::Closed || self.winner_id.is_some()
    }
}

/// One winner's share of a settled game.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WinnerShare {
    pub user_id: i64,
    pub card_id: i64,
    pub name: String,
    /// Prize share plus any bonus, rounded to cents.
    pub amount: f64,
    pub bonus: f64,
    pub winning_cells: Vec<u8>,
}

/// Durable settlement event consumed by the persistence worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum DomainEvent {
    #[serde(rename = "GAME_ENDED")]
    GameEnded {
        game_id: i64,
        stake: u32,
        winners: Vec<WinnerShare>,
        total_calls: u32,
        called_numbers: Vec<u8>,
    },
}

/// Round monetary amounts to cents at domain boundaries.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_never_transitions_backward() {
        assert!(GameStatus::Created.can_transition_to(GameStatus::Started));
        assert!(GameStatus::Started.can_transition_to(GameStatus::Playing));
        assert!(GameStatus::Playing.can_transition_to(GameStatus::Closed));
        assert!(!GameStatus::Closed.can_transition_to(GameStatus::Playing));
        assert!(!GameStatus::Playing.can_transition_to(GameStatus::Started));
    }

    #[test]
    fn test_selected_player_store_shape() {
        // The store boundary keeps the legacy wire field names.
        let p = SelectedPlayer {
            user_id: 42,
            card_ids: vec![3, 7],
        };
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, r#"{"user":42,"card":[3,7]}"#);
        let back: SelectedPlayer = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn test_total_cards_counts_cards_not_users() {
        let players = vec![
            SelectedPlayer {
                user_id: 1,
                card_ids: vec![1, 2],
            },
            SelectedPlayer {
                user_id: 2,
                card_ids: vec![3],
            },
        ];
        assert_eq!(total_cards(&players), 3);
        assert_eq!(used_card_ids(&players).len(), 3);
    }

    #[test]
    fn test_game_ended_event_tag() {
        let event = DomainEvent::GameEnded {
            game_id: 9,
            stake: 10,
            winners: vec![],
            total_calls: 12,
            called_numbers: vec![1, 2, 3],
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event":"GAME_ENDED""#));
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(10.005), 10.01);
        assert_eq!(round2(33.333333), 33.33);
    }
}
