//! Room lifecycle: player selection, scheduling, and inbound dispatch.
//!
//! One `GameManager` exists per stake tier per worker process. All room state
//! lives in the shared store, so any worker's manager can serve any request;
//! only the draw loop itself is single-owner (see `lease`).

use crate::caller::{generate_draw_sequence, NumberCaller};
use crate::config::GameConfig;
use crate::errors::{EngineError, EngineResult, GameError};
use crate::protocol::{
    incoming_channel, ActiveGameEntry, ClientMessage, InboundEnvelope, ServerEvent,
};
use crate::services::Services;
use crate::settlement::{self, potential_prize};
use crate::store::{RoomState, StateStore};
use crate::types::{total_cards, used_card_ids, Game, GameStatus, SelectedPlayer};
use chrono::Utc;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Fresh game record in `Created` state, id assigned on insert.
pub fn new_game_record(stake: u32, players: Vec<SelectedPlayer>, draw_sequence: Vec<u8>) -> Game {
    let now = Utc::now();
    Game {
        id: 0,
        stake,
        number_of_players: total_cards(&players),
        players,
        draw_sequence,
        called_numbers: Vec::new(),
        total_calls: 0,
        status: GameStatus::Created,
        winner_price: 0.0,
        admin_cut: 0.0,
        bonus: 0.0,
        winner_id: None,
        winner_card: None,
        winner_name: None,
        created_at: now,
        started_at: now,
    }
}

/// Schedule the next round for a room if one is due.
///
/// Returns the new game id when a round was scheduled. `None` means a game is
/// already pending or running, or nobody has selected a card yet. A game
/// stuck past `stuck_game_secs` is closed without a winner and replaced.
pub async fn schedule_round(
    room: &RoomState,
    services: &Services,
    config: &GameConfig,
    stake: u32,
) -> EngineResult<Option<i64>> {
    if let Some(game_id) = room.current_game_id().await? {
        match room.game_snapshot(game_id).await? {
            Some(snapshot) if snapshot.is_finalized() => {
                // Stale pointer from a worker that died mid-cleanup.
                room.end_game(game_id).await?;
            }
            Some(snapshot) => {
                let age = Utc::now()
                    .signed_duration_since(snapshot.started_at)
                    .num_seconds();
                if age <= config.stuck_game_secs {
                    return Ok(None);
                }
                warn!(game_id, stake, age, "expiring stuck game");
                settlement::close_without_winner(room, services, &snapshot).await?;
            }
            None => {
                // Dangling pointer from a crashed worker.
                room.set_current_game_id(None).await?;
            }
        }
    }

    let players = room.selected_players().await?;
    if players.is_empty() {
        return Ok(None);
    }

    let mut game = new_game_record(stake, players, generate_draw_sequence());
    let game_id = services.games.insert(&game).await?;
    game.id = game_id;
    room.save_game_snapshot(&game).await?;
    room.set_current_game_id(Some(game_id)).await?;
    room.set_next_game_start(Utc::now().timestamp() + config.countdown_secs as i64)
        .await?;
    info!(game_id, stake, "round scheduled");
    Ok(Some(game_id))
}

/// Room overview across every configured stake, for the lobby screen.
pub async fn active_games_overview(
    store: Arc<dyn StateStore>,
    config: &GameConfig,
) -> EngineResult<BTreeMap<String, ActiveGameEntry>> {
    let mut overview = BTreeMap::new();
    for &stake in &config.stakes {
        let room = RoomState::new(Arc::clone(&store), stake.to_string());
        let running = match room.current_game_id().await? {
            Some(game_id) => room.is_running(game_id).await?,
            None => false,
        };
        let count = room.player_count().await?;
        let pot = count as f64 * stake as f64;
        overview.insert(
            stake.to_string(),
            ActiveGameEntry {
                is_running: running,
                remaining_seconds: room.remaining_seconds().await?,
                winner_price: potential_prize(pot),
                bonus: config.is_bonus_stake(stake) && count >= config.bonus_min_players,
            },
        );
    }
    Ok(overview)
}

pub struct GameManager {
    stake: u32,
    room: RoomState,
    services: Services,
    config: GameConfig,
    caller: Arc<NumberCaller>,
}

impl GameManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        services: Services,
        config: GameConfig,
        stake: u32,
    ) -> Arc<Self> {
        let room = RoomState::new(store, stake.to_string());
        let caller = NumberCaller::new(room.clone(), services.clone(), config.clone(), stake);
        Arc::new(Self {
            stake,
            room,
            services,
            config,
            caller,
        })
    }

    pub fn room(&self) -> &RoomState {
        &self.room
    }

    /// Handle one inbound frame. Validation failures go back to the sender as
    /// targeted `error` events; infrastructure failures are logged and the
    /// room keeps running.
    pub async fn handle(&self, envelope: InboundEnvelope) {
        let client_id = envelope.client_id.clone();
        if let Err(e) = self.dispatch(&client_id, envelope.payload).await {
            match e {
                EngineError::Game(game_err) => {
                    let _ = self
                        .room
                        .publish_event(
                            ServerEvent::Error {
                                message: game_err.to_string(),
                            },
                            Some(&client_id),
                        )
                        .await;
                }
                EngineError::Settlement(settle_err) => {
                    let _ = self
                        .room
                        .publish_event(
                            ServerEvent::Error {
                                message: settle_err.to_string(),
                            },
                            Some(&client_id),
                        )
                        .await;
                }
                other => {
                    error!(stake = self.stake, error = %other, "request failed");
                }
            }
        }
    }

    async fn dispatch(&self, client_id: &str, message: ClientMessage) -> EngineResult<()> {
        match message {
            ClientMessage::SelectNumber {
                player_id,
                card_ids,
            } => self.add_player(client_id, player_id, card_ids).await,
            ClientMessage::RemoveNumber { user_id } => self.remove_player(user_id).await,
            ClientMessage::Bingo {
                user_id,
                called_numbers,
                game_id,
            } => {
                settlement::check_bingo(
                    &self.room,
                    &self.services,
                    &self.config,
                    client_id,
                    user_id,
                    game_id,
                    &called_numbers,
                )
                .await
            }
            ClientMessage::CardData { user_id } => self.send_card_data(client_id, user_id).await,
            ClientMessage::GetStakeStat => self.send_stake_stat(Some(client_id)).await,
            ClientMessage::JoinedBingo { user_id } => {
                self.room.add_bingo_page_user(user_id).await
            }
            ClientMessage::BlockUser { user_id } => {
                self.services.users.set_active(user_id, false).await?;
                self.room
                    .publish_event(
                        ServerEvent::Success {
                            message: "User blocked.".to_string(),
                        },
                        Some(client_id),
                    )
                    .await
            }
            ClientMessage::FetchActiveGame => {
                let data =
                    active_games_overview(self.room.store(), &self.config).await?;
                self.room
                    .publish_event(ServerEvent::ActiveGameData { data }, Some(client_id))
                    .await
            }
            ClientMessage::RequestGameStart => self.try_start_game().await,
        }
    }

    /// Join the room with one or more cards.
    async fn add_player(
        &self,
        client_id: &str,
        user_id: i64,
        card_ids: Vec<i64>,
    ) -> EngineResult<()> {
        if card_ids.is_empty() {
            return Err(GameError::MissingField.into());
        }

        if let Some(game_id) = self.room.current_game_id().await? {
            if self.room.is_running(game_id).await? {
                self.room
                    .publish_event(ServerEvent::GameInProgress { game_id }, Some(client_id))
                    .await?;
                return Err(GameError::GameInProgress.into());
            }
        }

        // Card conflicts are reported before any account checks.
        let mut players = self.room.selected_players().await?;
        let held_by_others = used_card_ids(
            &players
                .iter()
                .filter(|p| p.user_id != user_id)
                .cloned()
                .collect::<Vec<_>>(),
        );
        let conflicts: Vec<i64> = card_ids
            .iter()
            .copied()
            .filter(|id| held_by_others.contains(id))
            .collect();
        if !conflicts.is_empty() {
            return Err(GameError::CardConflict(conflicts).into());
        }

        let user = self
            .services
            .users
            .user(user_id)
            .await?
            .ok_or(GameError::UserNotFound)?;
        if !user.is_active {
            return Err(GameError::UserInactive.into());
        }

        let required = self.stake as f64 * card_ids.len() as f64;
        let available = user.wallet + user.bonus;
        if available < required {
            return Err(GameError::InsufficientFunds {
                required,
                available,
            }
            .into());
        }

        // Re-selection replaces the user's previous cards.
        players.retain(|p| p.user_id != user_id);
        players.push(SelectedPlayer { user_id, card_ids });
        self.room.set_selected_players(&players).await?;
        self.room.set_player_count(total_cards(&players)).await?;

        self.room
            .publish_event(
                ServerEvent::Success {
                    message: "Card selection confirmed.".to_string(),
                },
                Some(client_id),
            )
            .await?;
        self.broadcast_room_state(&players).await?;
        self.try_start_game().await
    }

    /// Leave the room, releasing held cards. No-op between rounds if the user
    /// holds nothing.
    async fn remove_player(&self, user_id: i64) -> EngineResult<()> {
        if let Some(game_id) = self.room.current_game_id().await? {
            // Selections are locked into the game snapshot once it runs.
            if self.room.is_running(game_id).await? {
                return Ok(());
            }
        }
        let mut players = self.room.selected_players().await?;
        let before = players.len();
        players.retain(|p| p.user_id != user_id);
        if players.len() == before {
            return Ok(());
        }
        self.room.set_selected_players(&players).await?;
        self.room.set_player_count(total_cards(&players)).await?;
        self.broadcast_room_state(&players).await
    }

    async fn broadcast_room_state(&self, players: &[SelectedPlayer]) -> EngineResult<()> {
        self.room
            .publish_event(
                ServerEvent::PlayerList {
                    player_list: players.to_vec(),
                },
                None,
            )
            .await?;
        self.send_stake_stat(None).await
    }

    /// Current room snapshot as a `game_stat` event.
    pub async fn stake_stat_event(&self) -> EngineResult<ServerEvent> {
        let players = self.room.selected_players().await?;
        let count = total_cards(&players);
        let current = self.room.current_game_id().await?;

        let mut running = false;
        let mut called_numbers = Vec::new();
        let mut winner_price = potential_prize(count as f64 * self.stake as f64);
        if let Some(game_id) = current {
            running = self.room.is_running(game_id).await?;
            if running {
                called_numbers = self.room.called_numbers(game_id).await?;
                if let Some(snapshot) = self.room.game_snapshot(game_id).await? {
                    winner_price = snapshot.winner_price;
                }
            }
        }

        let bonus_eligible = self.config.is_bonus_stake(self.stake)
            && count >= self.config.bonus_min_players;
        Ok(ServerEvent::GameStat {
            running,
            number_of_players: count,
            stake: self.stake,
            winner_price: Some(winner_price),
            bonus: bonus_eligible.then(|| "active".to_string()),
            game_id: current,
            remaining_seconds: self.room.remaining_seconds().await?,
            called_numbers,
            player_list: players,
        })
    }

    async fn send_stake_stat(&self, target: Option<&str>) -> EngineResult<()> {
        let event = self.stake_stat_event().await?;
        self.room.publish_event(event, target).await
    }

    async fn send_card_data(&self, client_id: &str, user_id: i64) -> EngineResult<()> {
        let players = self.room.selected_players().await?;
        let card_ids: Vec<i64> = players
            .iter()
            .filter(|p| p.user_id == user_id)
            .flat_map(|p| p.card_ids.iter().copied())
            .collect();
        if card_ids.is_empty() {
            return self
                .room
                .publish_event(
                    ServerEvent::NoCards {
                        message: "No cards selected.".to_string(),
                    },
                    Some(client_id),
                )
                .await;
        }
        let cards = self.services.cards.cards(&card_ids).await?;
        let cards = cards
            .into_iter()
            .map(|c| crate::protocol::CardData {
                id: c.id,
                numbers: c.numbers,
            })
            .collect();
        self.room
            .publish_event(ServerEvent::CardData { cards }, Some(client_id))
            .await
    }

    /// Pick up where a previous worker left off: rejoin an unfinished round
    /// or schedule a fresh one. Called once at boot.
    pub async fn resume(&self) -> EngineResult<()> {
        if let Some(game_id) = self.room.current_game_id().await? {
            if let Some(snapshot) = self.room.game_snapshot(game_id).await? {
                if !snapshot.is_finalized() {
                    info!(game_id, stake = self.stake, "resuming unfinished round");
                    Arc::clone(&self.caller).spawn_round(game_id);
                    return Ok(());
                }
            }
        }
        self.try_start_game().await
    }

    /// Schedule a round when one is due and hand it to the number caller.
    pub async fn try_start_game(&self) -> EngineResult<()> {
        if let Some(game_id) =
            schedule_round(&self.room, &self.services, &self.config, self.stake).await?
        {
            self.send_stake_stat(None).await?;
            Arc::clone(&self.caller).spawn_round(game_id);
        }
        Ok(())
    }
}

/// Route inbound envelopes from `game:*:incoming` to the matching room.
/// Runs until the subscription closes.
pub async fn run_dispatcher(
    store: Arc<dyn StateStore>,
    managers: HashMap<String, Arc<GameManager>>,
) -> EngineResult<()> {
    let mut subscription = store.subscribe(&incoming_channel("*")).await?;
    info!(rooms = managers.len(), "dispatcher listening");
    while let Some(message) = subscription.next_message().await {
        let envelope: InboundEnvelope = match serde_json::from_str(&message.payload) {
            Ok(env) => env,
            Err(e) => {
                warn!(channel = %message.channel, error = %e, "dropping malformed frame");
                continue;
            }
        };
        match managers.get(&envelope.stake) {
            Some(manager) => {
                let manager = Arc::clone(manager);
                tokio::spawn(async move { manager.handle(envelope).await });
            }
            None => warn!(stake = %envelope.stake, "frame for unknown stake"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::UserProfile;
    use crate::store::MemoryStore;

    fn test_config() -> GameConfig {
        GameConfig {
            countdown_secs: 1,
            draw_interval_ms: 10,
            pre_draw_delay_secs: 0,
            ..GameConfig::default()
        }
    }

    fn manager_fixture() -> (Arc<GameManager>, Arc<crate::services::InMemoryUsers>) {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let (services, users, _games) = Services::in_memory(120);
        users.add(UserProfile {
            id: 1,
            name: "ana".to_string(),
            wallet: 100.0,
            bonus: 0.0,
            is_active: true,
        });
        users.add(UserProfile {
            id: 2,
            name: "bekele".to_string(),
            wallet: 100.0,
            bonus: 0.0,
            is_active: true,
        });
        (GameManager::new(store, services, test_config(), 10), users)
    }

    #[tokio::test]
    async fn test_add_player_records_selection() {
        let (manager, _) = manager_fixture();
        manager
            .add_player("c1", 1, vec![3, 7])
            .await
            .unwrap();

        let players = manager.room().selected_players().await.unwrap();
        assert_eq!(players.len(), 1);
        assert_eq!(players[0].card_ids, vec![3, 7]);
        assert_eq!(manager.room().player_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_card_conflict_rejected() {
        let (manager, _) = manager_fixture();
        manager.add_player("c1", 1, vec![3]).await.unwrap();

        let err = manager.add_player("c2", 2, vec![3, 4]).await.unwrap_err();
        match err {
            EngineError::Game(GameError::CardConflict(cards)) => assert_eq!(cards, vec![3]),
            other => panic!("unexpected: {other}"),
        }
        // Conflicting request changed nothing.
        assert_eq!(manager.room().player_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reselection_replaces_previous_cards() {
        let (manager, _) = manager_fixture();
        manager.add_player("c1", 1, vec![3]).await.unwrap();
        manager.add_player("c1", 1, vec![5, 6]).await.unwrap();

        let players = manager.room().selected_players().await.unwrap();
        assert_eq!(players.len(), 1);
        assert_eq!(players[0].card_ids, vec![5, 6]);
    }

    #[tokio::test]
    async fn test_insufficient_balance_rejected() {
        let (manager, users) = manager_fixture();
        users.add(UserProfile {
            id: 3,
            name: "poor".to_string(),
            wallet: 5.0,
            bonus: 0.0,
            is_active: true,
        });
        let err = manager.add_player("c1", 3, vec![9]).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Game(GameError::InsufficientFunds { .. })
        ));
    }

    #[tokio::test]
    async fn test_selection_rejected_while_running() {
        let (manager, _) = manager_fixture();
        manager.add_player("c1", 1, vec![3]).await.unwrap();

        let game_id = manager.room().current_game_id().await.unwrap().unwrap();
        manager.room().set_is_running(game_id, true).await.unwrap();

        let err = manager.add_player("c2", 2, vec![4]).await.unwrap_err();
        assert!(matches!(err, EngineError::Game(GameError::GameInProgress)));
    }

    #[tokio::test]
    async fn test_remove_player_clears_selection() {
        let (manager, _) = manager_fixture();
        manager.add_player("c1", 1, vec![3]).await.unwrap();
        manager.remove_player(1).await.unwrap();

        assert!(manager.room().selected_players().await.unwrap().is_empty());
        assert_eq!(manager.room().player_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_conflict_reported_before_balance() {
        let (manager, users) = manager_fixture();
        users.add(UserProfile {
            id: 3,
            name: "poor".to_string(),
            wallet: 5.0,
            bonus: 0.0,
            is_active: true,
        });
        manager.add_player("c1", 1, vec![3]).await.unwrap();

        // Underfunded and conflicting: the conflict wins.
        let err = manager.add_player("c2", 3, vec![3]).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Game(GameError::CardConflict(_))
        ));
    }

    #[tokio::test]
    async fn test_stuck_game_expiry_keys_on_start_time() {
        let (manager, _) = manager_fixture();
        manager.add_player("c1", 1, vec![3]).await.unwrap();
        manager.add_player("c2", 2, vec![4]).await.unwrap();

        let game_id = manager.room().current_game_id().await.unwrap().unwrap();
        let mut snapshot = manager.room().game_snapshot(game_id).await.unwrap().unwrap();
        // Freshly created record, but the round started far in the past.
        snapshot.status = crate::types::GameStatus::Playing;
        snapshot.started_at = Utc::now() - chrono::Duration::seconds(500);
        manager.room().save_game_snapshot(&snapshot).await.unwrap();
        manager.room().set_is_running(game_id, true).await.unwrap();

        // Expiry closes the round and resets the room; the next round forms
        // from fresh selections.
        let next = schedule_round(
            manager.room(),
            &manager.services,
            &manager.config,
            manager.stake,
        )
        .await
        .unwrap();
        assert_eq!(next, None);
        assert_eq!(manager.room().current_game_id().await.unwrap(), None);

        let expired = manager.room().game_snapshot(game_id).await.unwrap().unwrap();
        assert_eq!(expired.status, crate::types::GameStatus::Closed);
        assert_eq!(expired.winner_id, None);
    }

    #[tokio::test]
    async fn test_schedule_round_only_once() {
        let (manager, _) = manager_fixture();
        manager.add_player("c1", 1, vec![3]).await.unwrap();

        let first = manager.room().current_game_id().await.unwrap();
        assert!(first.is_some());

        // A second selection does not replace the pending round.
        manager.add_player("c2", 2, vec![4]).await.unwrap();
        assert_eq!(manager.room().current_game_id().await.unwrap(), first);
    }
}
