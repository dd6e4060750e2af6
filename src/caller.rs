//! The number caller: runs one round from countdown to closure.
//!
//! Scheduling may happen on any worker, but stake collection, bot top-up,
//! and the draw all run under a single per-game lease, so exactly one worker
//! ever touches wallets for a round. Every draw goes through the shared
//! store first and is broadcast second, so a crashed caller never leaves
//! clients ahead of the authoritative state.

use crate::config::GameConfig;
use crate::errors::{EngineResult, GameError};
use crate::lease::Lease;
use crate::manager;
use crate::protocol::ServerEvent;
use crate::services::Services;
use crate::settlement::{self, commission, potential_prize, ClaimOutcome};
use crate::store::{keys, RoomState};
use crate::types::{round2, total_cards, Game, GameStatus, SelectedPlayer, BOT_USER_ID,
    DRAW_POOL_SIZE};
use chrono::Utc;
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Pre-shuffled permutation of the full draw pool.
pub fn generate_draw_sequence() -> Vec<u8> {
    let mut sequence: Vec<u8> = (1..=DRAW_POOL_SIZE).collect();
    sequence.shuffle(&mut OsRng);
    sequence
}

pub struct NumberCaller {
    stake: u32,
    room: RoomState,
    services: Services,
    config: GameConfig,
}

impl NumberCaller {
    pub fn new(
        room: RoomState,
        services: Services,
        config: GameConfig,
        stake: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            stake,
            room,
            services,
            config,
        })
    }

    /// Run a scheduled round on a background task.
    pub fn spawn_round(self: Arc<Self>, game_id: i64) {
        tokio::spawn(async move {
            if let Err(e) = Arc::clone(&self).run_round(game_id).await {
                error!(game_id, stake = self.stake, error = %e, "round failed");
            }
        });
    }

    async fn run_round(self: Arc<Self>, game_id: i64) -> EngineResult<()> {
        if !self.countdown(game_id).await? {
            return Ok(());
        }

        // Win the round lease before touching any money. A second worker
        // reaching this point (boot-time resume, duplicate schedule) backs
        // off here and never collects stakes.
        let ttl = Duration::from_secs(self.config.lease_ttl_secs);
        let Some(lease) =
            Lease::acquire(self.room.store(), &keys::draw_lease(game_id), ttl).await?
        else {
            debug!(game_id, "another worker owns this round");
            return Ok(());
        };
        let outcome = self.call_round(game_id, &lease).await;
        lease.release().await?;

        if outcome? {
            // Players who selected during the round form the next one.
            if let Some(next) =
                manager::schedule_round(&self.room, &self.services, &self.config, self.stake)
                    .await?
            {
                Arc::clone(&self).spawn_round(next);
            }
        }
        Ok(())
    }

    /// Everything between winning and releasing the round lease. Returns true
    /// when the round ran through to settlement or exhaustion.
    async fn call_round(&self, game_id: i64, lease: &Lease) -> EngineResult<bool> {
        if !self.room.is_running(game_id).await? {
            self.add_bot_players().await?;
        }
        let Some(mut game) = self.start_game(game_id).await? else {
            return Ok(false);
        };
        sleep(Duration::from_secs(self.config.pre_draw_delay_secs)).await;
        if !lease.renew().await? {
            warn!(game_id, "round lease lost before the first draw");
            return Ok(false);
        }
        self.run_draw_loop(&mut game, lease).await?;
        Ok(true)
    }

    /// Tick the countdown once per second. Returns false when the round was
    /// superseded while waiting.
    async fn countdown(&self, game_id: i64) -> EngineResult<bool> {
        loop {
            if self.room.current_game_id().await? != Some(game_id) {
                debug!(game_id, "round superseded during countdown");
                return Ok(false);
            }
            let remaining = self.room.remaining_seconds().await?;
            self.room
                .publish_event(
                    ServerEvent::TimerMessage {
                        remaining_seconds: remaining,
                    },
                    None,
                )
                .await?;
            if remaining == 0 {
                return Ok(true);
            }
            sleep(Duration::from_secs(1).min(Duration::from_secs(remaining))).await;
        }
    }

    /// Top the room up with synthetic players on unused cards, when this
    /// stake is configured for them.
    async fn add_bot_players(&self) -> EngineResult<()> {
        let Some(bot_config) = self.config.bot_config(self.stake) else {
            return Ok(());
        };
        let mut players = self.room.selected_players().await?;
        let used = crate::types::used_card_ids(&players);

        let mut free_cards: Vec<i64> = (1..=self.config.total_cards)
            .filter(|id| !used.contains(id))
            .collect();
        // Thread-local rng must not live across an await.
        let count = {
            let mut rng = rand::thread_rng();
            free_cards.shuffle(&mut rng);
            let target = bot_config.target_players;
            rng.gen_range(target.saturating_sub(2)..=target + 2) as usize
        };
        let added = free_cards.len().min(count);
        for card_id in free_cards.into_iter().take(added) {
            players.push(SelectedPlayer {
                user_id: BOT_USER_ID,
                card_ids: vec![card_id],
            });
        }
        if added > 0 {
            debug!(stake = self.stake, added, "bots joined");
            self.room.set_selected_players(&players).await?;
            self.room.set_player_count(total_cards(&players)).await?;
        }
        Ok(())
    }

    /// Collect stakes and move the game to `Started`. Returns `None` when the
    /// round cannot start, with every collected stake refunded. Caller holds
    /// the round lease.
    async fn start_game(&self, game_id: i64) -> EngineResult<Option<Game>> {
        if self.room.current_game_id().await? != Some(game_id) {
            return Ok(None);
        }
        let Some(mut game) = self.room.game_snapshot(game_id).await? else {
            return Ok(None);
        };
        if self.room.is_running(game_id).await? {
            // Started by a worker that died mid-draw; stakes are already
            // collected, so resume calling from the stored state.
            return Ok(Some(game));
        }

        let selections = self.room.selected_players().await?;
        let funded = self.collect_stakes(&selections).await?;

        let distinct_users: std::collections::HashSet<i64> =
            funded.iter().map(|p| p.user_id).collect();
        if distinct_users.len() < 2 {
            warn!(game_id, stake = self.stake, "not enough funded players");
            self.refund_stakes(&funded).await?;
            self.room.set_current_game_id(None).await?;
            self.room
                .publish_event(
                    ServerEvent::Error {
                        message: GameError::NotEnoughPlayers.to_string(),
                    },
                    None,
                )
                .await?;
            return Ok(None);
        }

        let count = total_cards(&funded);
        let pot = count as f64 * self.stake as f64;
        game.players = funded.clone();
        game.number_of_players = count;
        game.status = GameStatus::Started;
        game.started_at = Utc::now();
        game.admin_cut = commission(pot);
        game.winner_price = potential_prize(pot);
        self.services.games.update(&game).await?;
        self.room.save_game_snapshot(&game).await?;
        self.room.set_selected_players(&funded).await?;
        self.room.set_player_count(count).await?;
        self.room.set_is_running(game_id, true).await?;

        info!(
            game_id,
            stake = self.stake,
            players = count,
            pot,
            "game started"
        );
        self.room
            .publish_event(
                ServerEvent::GameStarted {
                    game_id,
                    stake: self.stake,
                    player_list: funded,
                },
                None,
            )
            .await?;
        Ok(Some(game))
    }

    /// Debit each entry's stake, wallet first then bonus; bots draw on the
    /// shared liquidity pool. Underfunded entries are dropped.
    async fn collect_stakes(
        &self,
        selections: &[SelectedPlayer],
    ) -> EngineResult<Vec<SelectedPlayer>> {
        let mut funded = Vec::with_capacity(selections.len());
        let mut bot_pool = self.room.bot_liquidity().await?;
        for player in selections {
            let due = self.stake as f64 * player.card_ids.len() as f64;
            if player.is_bot() {
                if bot_pool >= due {
                    bot_pool = round2(bot_pool - due);
                    funded.push(player.clone());
                } else {
                    debug!(stake = self.stake, "bot pool exhausted, dropping bot");
                }
            } else if self.services.wallets.try_debit(player.user_id, due).await? {
                funded.push(player.clone());
            } else {
                warn!(
                    user_id = player.user_id,
                    stake = self.stake,
                    "dropping underfunded player"
                );
            }
        }
        self.room.set_bot_liquidity(bot_pool).await?;
        Ok(funded)
    }

    async fn refund_stakes(&self, funded: &[SelectedPlayer]) -> EngineResult<()> {
        let mut bot_pool = self.room.bot_liquidity().await?;
        for player in funded {
            let due = self.stake as f64 * player.card_ids.len() as f64;
            if player.is_bot() {
                bot_pool = round2(bot_pool + due);
            } else {
                self.services.wallets.credit(player.user_id, due).await?;
            }
        }
        self.room.set_bot_liquidity(bot_pool).await
    }

    /// Draw numbers until the game settles or the pool is exhausted. Caller
    /// holds the round lease.
    async fn run_draw_loop(&self, game: &mut Game, lease: &Lease) -> EngineResult<()> {
        if game.status != GameStatus::Playing {
            game.status = GameStatus::Playing;
            self.services.games.update(game).await?;
            self.room.save_game_snapshot(game).await?;
        }

        let called = self.room.called_numbers(game.id).await?;
        self.reannounce_missed_broadcast(game.id, &called).await?;
        let has_bots = game.players.iter().any(SelectedPlayer::is_bot);

        for &number in game.draw_sequence.iter().skip(called.len()) {
            if !self.room.is_running(game.id).await? {
                break;
            }
            if !lease.renew().await? {
                warn!(game_id = game.id, "draw lease lost, stopping");
                return Ok(());
            }

            // Store first, broadcast second; `last_sent_number` trails the
            // broadcast so a resuming worker knows what clients have seen.
            self.room.push_called_number(game.id, number).await?;
            self.room
                .publish_event(
                    ServerEvent::RandomNumber {
                        random_number: number,
                        game_id: game.id,
                    },
                    None,
                )
                .await?;
            self.room.set_last_sent_number(game.id, number).await?;

            if has_bots && self.bot_claim(game.id).await? {
                break;
            }

            sleep(Duration::from_millis(self.config.draw_interval_ms)).await;
        }

        if self.room.is_running(game.id).await? {
            // Pool exhausted without a verified win.
            if let Some(snapshot) = self.room.game_snapshot(game.id).await? {
                settlement::close_without_winner(&self.room, &self.services, &snapshot).await?;
            }
        }
        Ok(())
    }

    /// A crash between storing a draw and broadcasting it leaves
    /// `last_sent_number` behind `called_numbers`; repeat the stored tail so
    /// clients catch up before fresh draws continue.
    async fn reannounce_missed_broadcast(
        &self,
        game_id: i64,
        called: &[u8],
    ) -> EngineResult<()> {
        let Some(&last) = called.last() else {
            return Ok(());
        };
        if self.room.last_sent_number(game_id).await? == Some(last) {
            return Ok(());
        }
        self.room
            .publish_event(
                ServerEvent::RandomNumber {
                    random_number: last,
                    game_id,
                },
                None,
            )
            .await?;
        self.room.set_last_sent_number(game_id, last).await
    }

    /// Claim on behalf of the bots after a draw. True when a bot settled the
    /// game.
    async fn bot_claim(&self, game_id: i64) -> EngineResult<bool> {
        match settlement::try_claim(
            &self.room,
            &self.services,
            &self.config,
            BOT_USER_ID,
            game_id,
            &[],
        )
        .await
        {
            Ok(ClaimOutcome::Settled) => Ok(true),
            Ok(_) => Ok(false),
            // A human claim can settle the game between the draw and this
            // check; that is not an error for the draw loop.
            Err(crate::errors::EngineError::Settlement(_)) => Ok(true),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::UserProfile;
    use crate::store::{MemoryStore, StateStore};

    #[test]
    fn test_draw_sequence_is_a_permutation() {
        let sequence = generate_draw_sequence();
        assert_eq!(sequence.len(), 75);
        let mut sorted = sequence.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (1..=75).collect::<Vec<u8>>());
    }

    #[test]
    fn test_draw_sequences_differ() {
        // Two freshly generated sequences agreeing fully would mean the
        // shuffle is broken.
        assert_ne!(generate_draw_sequence(), generate_draw_sequence());
    }

    fn caller_fixture(stake: u32) -> (Arc<NumberCaller>, crate::services::Services, RoomState) {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let (services, users, _games) = crate::services::Services::in_memory(120);
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
            wallet: 5.0,
            bonus: 3.0,
            is_active: true,
        });
        let room = RoomState::new(store, stake.to_string());
        let config = GameConfig {
            countdown_secs: 1,
            pre_draw_delay_secs: 0,
            draw_interval_ms: 5,
            ..GameConfig::default()
        };
        let caller = NumberCaller::new(room.clone(), services.clone(), config, stake);
        (caller, services, room)
    }

    #[tokio::test]
    async fn test_collect_stakes_drops_underfunded() {
        let (caller, _services, _room) = caller_fixture(10);
        let selections = vec![
            SelectedPlayer {
                user_id: 1,
                card_ids: vec![1, 2],
            },
            // Wallet 5 + bonus 3 cannot cover a 10 stake.
            SelectedPlayer {
                user_id: 2,
                card_ids: vec![3],
            },
        ];
        let funded = caller.collect_stakes(&selections).await.unwrap();
        assert_eq!(funded.len(), 1);
        assert_eq!(funded[0].user_id, 1);
    }

    #[tokio::test]
    async fn test_collect_stakes_spends_wallet_then_bonus() {
        let (caller, services, _room) = caller_fixture(5);
        let selections = vec![SelectedPlayer {
            user_id: 2,
            card_ids: vec![3],
        }];
        let funded = caller.collect_stakes(&selections).await.unwrap();
        assert_eq!(funded.len(), 1);
        assert_eq!(services.wallets.balances(2).await.unwrap(), Some((0.0, 3.0)));
    }

    #[tokio::test]
    async fn test_bots_debit_shared_pool() {
        let (caller, _services, room) = caller_fixture(10);
        room.set_bot_liquidity(15.0).await.unwrap();
        let selections = vec![
            SelectedPlayer {
                user_id: BOT_USER_ID,
                card_ids: vec![50],
            },
            SelectedPlayer {
                user_id: BOT_USER_ID,
                card_ids: vec![51],
            },
        ];
        let funded = caller.collect_stakes(&selections).await.unwrap();
        // Pool covers one bot, the second is dropped.
        assert_eq!(funded.len(), 1);
        assert_eq!(room.bot_liquidity().await.unwrap(), 5.0);
    }

    #[tokio::test]
    async fn test_bot_players_use_unused_cards() {
        let (caller, _services, room) = caller_fixture(10);
        let humans = vec![SelectedPlayer {
            user_id: 1,
            card_ids: vec![1, 2, 3],
        }];
        room.set_selected_players(&humans).await.unwrap();

        caller.add_bot_players().await.unwrap();

        let players = room.selected_players().await.unwrap();
        let used = crate::types::used_card_ids(&players);
        // No duplicates across the whole room.
        assert_eq!(used.len() as u32, total_cards(&players));
        assert!(players.iter().any(SelectedPlayer::is_bot));
    }

    #[test]
    fn test_round_future_is_send() {
        fn require_send<T: Send>(_: &T) {}
        let (caller, _services, _room) = caller_fixture(10);
        let future = Arc::clone(&caller).run_round(1);
        require_send(&future);
    }

    #[tokio::test]
    async fn test_round_without_lease_never_touches_wallets() {
        let (caller, services, room) = caller_fixture(10);
        room.set_selected_players(&[SelectedPlayer {
            user_id: 1,
            card_ids: vec![1, 2],
        }])
        .await
        .unwrap();
        room.set_current_game_id(Some(7)).await.unwrap();
        room.set_next_game_start(chrono::Utc::now().timestamp()).await.unwrap();

        // Another worker already owns the round.
        let held = Lease::acquire(
            room.store(),
            &keys::draw_lease(7),
            Duration::from_secs(30),
        )
        .await
        .unwrap()
        .unwrap();

        Arc::clone(&caller).run_round(7).await.unwrap();

        assert_eq!(
            services.wallets.balances(1).await.unwrap(),
            Some((100.0, 0.0))
        );
        assert!(!room.is_running(7).await.unwrap());
        held.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_resume_repeats_unbroadcast_number() {
        use crate::protocol::{events_channel, OutboundEnvelope};

        let (caller, _services, room) = caller_fixture(10);
        let mut events = room
            .store()
            .subscribe(&events_channel("10"))
            .await
            .unwrap();

        // The last stored number was never broadcast.
        room.push_called_number(3, 41).await.unwrap();
        room.push_called_number(3, 12).await.unwrap();
        room.set_last_sent_number(3, 41).await.unwrap();

        let called = room.called_numbers(3).await.unwrap();
        caller.reannounce_missed_broadcast(3, &called).await.unwrap();

        let message = events.next_message().await.unwrap();
        let envelope: OutboundEnvelope = serde_json::from_str(&message.payload).unwrap();
        match envelope.event {
            ServerEvent::RandomNumber { random_number, game_id } => {
                assert_eq!(random_number, 12);
                assert_eq!(game_id, 3);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(room.last_sent_number(3).await.unwrap(), Some(12));

        // In sync: nothing further goes out.
        caller.reannounce_missed_broadcast(3, &called).await.unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(50), events.next_message())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_refund_restores_balances() {
        let (caller, services, room) = caller_fixture(10);
        room.set_bot_liquidity(20.0).await.unwrap();
        let selections = vec![
            SelectedPlayer {
                user_id: 1,
                card_ids: vec![1],
            },
            SelectedPlayer {
                user_id: BOT_USER_ID,
                card_ids: vec![2],
            },
        ];
        let funded = caller.collect_stakes(&selections).await.unwrap();
        assert_eq!(funded.len(), 2);
        caller.refund_stakes(&funded).await.unwrap();

        assert_eq!(services.wallets.balances(1).await.unwrap(), Some((100.0, 0.0)));
        assert_eq!(room.bot_liquidity().await.unwrap(), 20.0);
    }
}
