//! Shared state store abstraction.
//!
//! A thin key/value + pub/sub surface over an external, multi-process-visible
//! store. Besides plain get/set the trait carries exactly two conditional
//! primitives (set-if-absent with TTL, delete-if-value-matches); both must be
//! atomic in every implementation since the draw-loop lease is built on them.

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use crate::errors::EngineResult;
use crate::protocol::{db_events_channel, events_channel, OutboundEnvelope, ServerEvent};
use crate::types::{DomainEvent, Game, SelectedPlayer};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// A message delivered on a subscribed channel.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: String,
}

/// Stream of messages for one subscription.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<ChannelMessage>,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<ChannelMessage>) -> Self {
        Self { rx }
    }

    /// Receive the next message; `None` when the subscription is closed.
    pub async fn next_message(&mut self) -> Option<ChannelMessage> {
        self.rx.recv().await
    }
}

/// Key/value + pub/sub store shared by all worker and gateway processes.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> EngineResult<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> EngineResult<()>;

    async fn delete(&self, key: &str) -> EngineResult<()>;

    /// Set `key` to `value` only if absent, with a TTL. Atomic.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> EngineResult<bool>;

    /// Extend the TTL of an existing key. Returns false if the key is gone.
    async fn expire(&self, key: &str, ttl: Duration) -> EngineResult<bool>;

    /// Delete `key` only if it currently holds `value`. Atomic; a plain
    /// check-then-delete would let a stale owner destroy a newer lease.
    async fn delete_if_eq(&self, key: &str, value: &str) -> EngineResult<bool>;

    async fn publish(&self, channel: &str, payload: &str) -> EngineResult<()>;

    /// Subscribe to a channel pattern (`*` wildcards supported).
    async fn subscribe(&self, pattern: &str) -> EngineResult<Subscription>;
}

/// Store keys for one stake room and its games. Kept in one place so the
/// gateway, workers, and tests agree on the layout.
pub mod keys {
    pub fn selected_players(stake: &str) -> String {
        format!("selected_players_{stake}")
    }

    pub fn player_count(stake: &str) -> String {
        format!("player_count_{stake}")
    }

    pub fn stake_state(stake: &str, field: &str) -> String {
        format!("stake_state_{stake}_{field}")
    }

    pub fn game_state(game_id: i64, field: &str) -> String {
        format!("game_state_{game_id}_{field}")
    }

    pub fn game_data(game_id: i64) -> String {
        format!("game_data:{game_id}")
    }

    pub fn bot_liquidity(stake: &str) -> String {
        format!("bot_liquidity_{stake}")
    }

    pub fn bingo_page_users(stake: &str) -> String {
        format!("bingo_page_users_{stake}")
    }

    pub fn draw_lease(game_id: i64) -> String {
        format!("game:{game_id}:draw_lease")
    }
}

/// TTL applied to the one-time bingo latch; long enough to outlive any game.
const BINGO_LATCH_TTL: Duration = Duration::from_secs(3600);

/// Typed accessors for one stake room's ephemeral state.
///
/// All JSON encoding happens here; callers only ever see domain types.
#[derive(Clone)]
pub struct RoomState {
    store: Arc<dyn StateStore>,
    stake: String,
}

impl RoomState {
    pub fn new(store: Arc<dyn StateStore>, stake: impl Into<String>) -> Self {
        Self {
            store,
            stake: stake.into(),
        }
    }

    pub fn stake(&self) -> &str {
        &self.stake
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        Arc::clone(&self.store)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> EngineResult<Option<T>> {
        match self.store.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T: serde::Serialize>(&self, key: &str, value: &T) -> EngineResult<()> {
        let raw = serde_json::to_string(value)?;
        self.store.set(key, &raw).await
    }

    // --- Player selection ---

    pub async fn selected_players(&self) -> EngineResult<Vec<SelectedPlayer>> {
        Ok(self
            .get_json(&keys::selected_players(&self.stake))
            .await?
            .unwrap_or_default())
    }

    pub async fn set_selected_players(&self, players: &[SelectedPlayer]) -> EngineResult<()> {
        self.set_json(&keys::selected_players(&self.stake), &players)
            .await
    }

    pub async fn player_count(&self) -> EngineResult<u32> {
        Ok(self
            .get_json(&keys::player_count(&self.stake))
            .await?
            .unwrap_or(0))
    }

    pub async fn set_player_count(&self, count: u32) -> EngineResult<()> {
        self.set_json(&keys::player_count(&self.stake), &count).await
    }

    // --- Stake state ---

    pub async fn current_game_id(&self) -> EngineResult<Option<i64>> {
        self.get_json(&keys::stake_state(&self.stake, "current_game_id"))
            .await
            .map(Option::flatten)
    }

    pub async fn set_current_game_id(&self, game_id: Option<i64>) -> EngineResult<()> {
        self.set_json(&keys::stake_state(&self.stake, "current_game_id"), &game_id)
            .await
    }

    pub async fn next_game_start(&self) -> EngineResult<Option<i64>> {
        self.get_json(&keys::stake_state(&self.stake, "next_game_start"))
            .await
            .map(Option::flatten)
    }

    pub async fn set_next_game_start(&self, timestamp: i64) -> EngineResult<()> {
        self.set_json(
            &keys::stake_state(&self.stake, "next_game_start"),
            &Some(timestamp),
        )
        .await
    }

    /// Seconds until the scheduled start, zero if none or already due.
    pub async fn remaining_seconds(&self) -> EngineResult<u64> {
        let Some(next_start) = self.next_game_start().await? else {
            return Ok(0);
        };
        let now = Utc::now().timestamp();
        Ok(next_start.saturating_sub(now).max(0) as u64)
    }

    // --- Game state flags ---

    pub async fn is_running(&self, game_id: i64) -> EngineResult<bool> {
        Ok(self
            .get_json(&keys::game_state(game_id, "is_running"))
            .await?
            .unwrap_or(false))
    }

    pub async fn set_is_running(&self, game_id: i64, running: bool) -> EngineResult<()> {
        self.set_json(&keys::game_state(game_id, "is_running"), &running)
            .await
    }

    /// Acquire the one-time bingo latch for a game. Returns true exactly once
    /// per game across all workers; the winner of this race performs the
    /// settlement credit.
    pub async fn try_set_bingo(&self, game_id: i64) -> EngineResult<bool> {
        self.store
            .set_nx_ex(&keys::game_state(game_id, "bingo"), "true", BINGO_LATCH_TTL)
            .await
    }

    pub async fn bingo_latched(&self, game_id: i64) -> EngineResult<bool> {
        Ok(self
            .store
            .get(&keys::game_state(game_id, "bingo"))
            .await?
            .is_some())
    }

    pub async fn called_numbers(&self, game_id: i64) -> EngineResult<Vec<u8>> {
        Ok(self
            .get_json(&keys::game_state(game_id, "called_numbers"))
            .await?
            .unwrap_or_default())
    }

    /// Append one number to the authoritative accumulator. Only the worker
    /// holding the draw lease writes here, so read-modify-write is safe.
    pub async fn push_called_number(&self, game_id: i64, number: u8) -> EngineResult<Vec<u8>> {
        let mut called = self.called_numbers(game_id).await?;
        called.push(number);
        self.set_json(&keys::game_state(game_id, "called_numbers"), &called)
            .await?;
        Ok(called)
    }

    pub async fn last_sent_number(&self, game_id: i64) -> EngineResult<Option<u8>> {
        self.get_json(&keys::game_state(game_id, "last_sent_number"))
            .await
            .map(Option::flatten)
    }

    pub async fn set_last_sent_number(&self, game_id: i64, number: u8) -> EngineResult<()> {
        self.set_json(&keys::game_state(game_id, "last_sent_number"), &Some(number))
            .await
    }

    // --- Game snapshot mirror ---

    pub async fn save_game_snapshot(&self, game: &Game) -> EngineResult<()> {
        self.set_json(&keys::game_data(game.id), game).await
    }

    pub async fn game_snapshot(&self, game_id: i64) -> EngineResult<Option<Game>> {
        self.get_json(&keys::game_data(game_id)).await
    }

    /// Clear ephemeral per-game state after closure.
    pub async fn end_game(&self, game_id: i64) -> EngineResult<()> {
        self.set_is_running(game_id, false).await?;
        self.set_current_game_id(None).await
    }

    // --- Bot liquidity ---

    pub async fn bot_liquidity(&self) -> EngineResult<f64> {
        Ok(self
            .get_json(&keys::bot_liquidity(&self.stake))
            .await?
            .unwrap_or(0.0))
    }

    pub async fn set_bot_liquidity(&self, balance: f64) -> EngineResult<()> {
        self.set_json(&keys::bot_liquidity(&self.stake), &balance)
            .await
    }

    // --- Bingo page presence ---

    pub async fn bingo_page_users(&self) -> EngineResult<Vec<i64>> {
        Ok(self
            .get_json(&keys::bingo_page_users(&self.stake))
            .await?
            .unwrap_or_default())
    }

    pub async fn add_bingo_page_user(&self, user_id: i64) -> EngineResult<()> {
        let mut users = self.bingo_page_users().await?;
        if !users.contains(&user_id) {
            users.push(user_id);
        }
        self.set_json(&keys::bingo_page_users(&self.stake), &users)
            .await
    }

    // --- Publishing ---

    /// Publish an event on this room's outbound channel. `target` limits
    /// delivery to a single gateway client.
    pub async fn publish_event(
        &self,
        event: ServerEvent,
        target: Option<&str>,
    ) -> EngineResult<()> {
        let envelope = OutboundEnvelope {
            event,
            target_client_id: target.map(str::to_string),
        };
        let payload = serde_json::to_string(&envelope)?;
        self.store
            .publish(&events_channel(&self.stake), &payload)
            .await
    }

    /// Publish on the durable settlement channel.
    pub async fn publish_db_event(&self, event: &DomainEvent) -> EngineResult<()> {
        let payload = serde_json::to_string(event)?;
        self.store
            .publish(&db_events_channel(&self.stake), &payload)
            .await
    }
}

impl std::fmt::Debug for RoomState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomState").field("stake", &self.stake).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_room_state_selection_roundtrip() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let room = RoomState::new(store, "10");

        assert!(room.selected_players().await.unwrap().is_empty());

        let players = vec![SelectedPlayer {
            user_id: 5,
            card_ids: vec![1, 2],
        }];
        room.set_selected_players(&players).await.unwrap();
        room.set_player_count(2).await.unwrap();

        assert_eq!(room.selected_players().await.unwrap(), players);
        assert_eq!(room.player_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_bingo_latch_fires_once() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let room = RoomState::new(store, "10");

        assert!(room.try_set_bingo(7).await.unwrap());
        assert!(!room.try_set_bingo(7).await.unwrap());
        assert!(room.bingo_latched(7).await.unwrap());
        // Other games are unaffected.
        assert!(room.try_set_bingo(8).await.unwrap());
    }

    #[tokio::test]
    async fn test_called_numbers_append_only() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let room = RoomState::new(store, "20");

        assert_eq!(room.push_called_number(1, 14).await.unwrap(), vec![14]);
        assert_eq!(room.push_called_number(1, 3).await.unwrap(), vec![14, 3]);
        assert_eq!(room.called_numbers(1).await.unwrap(), vec![14, 3]);
    }

    #[tokio::test]
    async fn test_remaining_seconds() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let room = RoomState::new(store, "10");

        assert_eq!(room.remaining_seconds().await.unwrap(), 0);
        room.set_next_game_start(Utc::now().timestamp() + 30)
            .await
            .unwrap();
        let remaining = room.remaining_seconds().await.unwrap();
        assert!((28..=30).contains(&remaining));
    }
}
