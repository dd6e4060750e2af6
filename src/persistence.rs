//! Persistence worker: consumes `GAME_ENDED` events and makes the system of
//! record catch up with settlement.
//!
//! The happy path already closed the game row and credited the winner, so
//! the usual outcome here is participation bookkeeping only. When the row is
//! still open (a settlement worker died mid-way) this worker applies the
//! closure and the credit itself. Either way `close_if_open` is the barrier:
//! an event delivered twice credits exactly once.

use crate::errors::EngineResult;
use crate::protocol::db_events_channel;
use crate::services::{GameClosure, Participation, Services};
use crate::settlement::commission;
use crate::store::{RoomState, StateStore};
use crate::types::{round2, DomainEvent, GameStatus, WinnerShare, BOT_USER_ID};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Consume settlement events until the subscription closes.
pub async fn run_persistence(
    store: Arc<dyn StateStore>,
    services: Services,
) -> EngineResult<()> {
    let mut subscription = store.subscribe(&db_events_channel("*")).await?;
    info!("persistence worker listening");
    while let Some(message) = subscription.next_message().await {
        let event: DomainEvent = match serde_json::from_str(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(channel = %message.channel, error = %e, "dropping malformed event");
                continue;
            }
        };
        if let Err(e) = apply(&store, &services, &event).await {
            error!(error = %e, "failed to apply settlement event");
        }
    }
    Ok(())
}

/// Apply one settlement event. Safe to call any number of times per event.
pub async fn apply(
    store: &Arc<dyn StateStore>,
    services: &Services,
    event: &DomainEvent,
) -> EngineResult<()> {
    let DomainEvent::GameEnded {
        game_id,
        stake,
        winners,
        total_calls,
        called_numbers,
    } = event;

    let Some(game) = services.games.fetch(*game_id).await? else {
        warn!(game_id, "settlement event for unknown game");
        return Ok(());
    };

    if game.status != GameStatus::Closed {
        // Recovery: the settling worker died before closing the row. The
        // barrier makes this branch run at most once per game.
        let claimant = winners.first();
        let prize_pool: f64 = round2(winners.iter().map(|w| w.amount).sum());
        let pot = game.number_of_players as f64 * game.stake as f64;
        let closure = GameClosure {
            winner_id: claimant.map(|w| w.user_id),
            winner_card: claimant.map(|w| w.card_id),
            winner_name: claimant.map(|w| w.name.clone()),
            winner_price: prize_pool,
            admin_cut: commission(pot),
            bonus: claimant.map(|w| w.bonus).unwrap_or(0.0),
            total_calls: *total_calls,
            called_numbers: called_numbers.clone(),
        };
        if services.games.close_if_open(*game_id, &closure).await? {
            info!(game_id, stake, "recovered unclosed game, applying credits");
            credit_winners(store, services, stake, winners).await?;
        }
    }

    // Participation rows, humans only; upsert keeps redelivery harmless.
    for player in &game.players {
        if player.user_id == BOT_USER_ID {
            continue;
        }
        let win = winners.iter().find(|w| w.user_id == player.user_id);
        services
            .games
            .record_participation(&Participation {
                game_id: *game_id,
                user_id: player.user_id,
                card_ids: player.card_ids.clone(),
                won: win.is_some(),
                amount_won: win.map(|w| w.amount).unwrap_or(0.0),
            })
            .await?;
    }
    Ok(())
}

async fn credit_winners(
    store: &Arc<dyn StateStore>,
    services: &Services,
    stake: &u32,
    winners: &[WinnerShare],
) -> EngineResult<()> {
    let room = RoomState::new(Arc::clone(store), stake.to_string());
    for winner in winners {
        if winner.user_id == BOT_USER_ID {
            let pool = room.bot_liquidity().await?;
            room.set_bot_liquidity(round2(pool + winner.amount)).await?;
        } else {
            services.wallets.credit(winner.user_id, winner.amount).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::new_game_record;
    use crate::services::{
        GameRepository, InMemoryGames, InMemoryUsers, UserProfile, WalletService,
    };
    use crate::store::MemoryStore;
    use crate::types::SelectedPlayer;

    fn winner(user_id: i64, card_id: i64, amount: f64) -> WinnerShare {
        WinnerShare {
            user_id,
            card_id,
            name: format!("user{user_id}"),
            amount,
            bonus: 0.0,
            winning_cells: vec![1, 2, 3, 4, 5],
        }
    }

    async fn fixture(
        close_first: bool,
    ) -> (
        Arc<dyn StateStore>,
        Services,
        Arc<InMemoryGames>,
        Arc<InMemoryUsers>,
        DomainEvent,
    ) {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let (services, users, games) = Services::in_memory(120);
        users.add(UserProfile {
            id: 1,
            name: "ana".to_string(),
            wallet: 0.0,
            bonus: 0.0,
            is_active: true,
        });
        users.add(UserProfile {
            id: 2,
            name: "bekele".to_string(),
            wallet: 0.0,
            bonus: 0.0,
            is_active: true,
        });
        let players = vec![
            SelectedPlayer {
                user_id: 1,
                card_ids: vec![7],
            },
            SelectedPlayer {
                user_id: 2,
                card_ids: vec![8],
            },
        ];
        let mut game = new_game_record(10, players, vec![]);
        game.status = crate::types::GameStatus::Playing;
        let id = games.insert(&game).await.unwrap();

        if close_first {
            let closure = GameClosure {
                winner_id: Some(1),
                winner_card: Some(7),
                winner_name: Some("ana".to_string()),
                winner_price: 20.0,
                admin_cut: 0.0,
                bonus: 0.0,
                total_calls: 9,
                called_numbers: vec![1, 2, 3],
            };
            games.close_if_open(id, &closure).await.unwrap();
        }

        let event = DomainEvent::GameEnded {
            game_id: id,
            stake: 10,
            winners: vec![winner(1, 7, 20.0)],
            total_calls: 9,
            called_numbers: vec![1, 2, 3],
        };
        (store, services, games, users, event)
    }

    #[tokio::test]
    async fn test_closed_game_only_records_participation() {
        let (store, services, games, users, event) = fixture(true).await;

        apply(&store, &services, &event).await.unwrap();
        apply(&store, &services, &event).await.unwrap();

        // No credit here; the fast path already paid.
        assert_eq!(users.balances(1).await.unwrap().unwrap().0, 0.0);

        let rows = games.participations();
        assert_eq!(rows.len(), 2);
        let winner_row = rows.iter().find(|r| r.user_id == 1).unwrap();
        assert!(winner_row.won);
        assert_eq!(winner_row.amount_won, 20.0);
        let loser_row = rows.iter().find(|r| r.user_id == 2).unwrap();
        assert!(!loser_row.won);
    }

    #[tokio::test]
    async fn test_unclosed_game_recovers_exactly_once() {
        let (store, services, games, users, event) = fixture(false).await;

        // Delivered twice; the closure barrier admits one application.
        apply(&store, &services, &event).await.unwrap();
        apply(&store, &services, &event).await.unwrap();

        // Exactly one credit despite the duplicate.
        assert_eq!(users.balances(1).await.unwrap().unwrap().0, 20.0);

        let DomainEvent::GameEnded { game_id, .. } = &event;
        let stored = games.fetch(*game_id).await.unwrap().unwrap();
        assert_eq!(stored.status, crate::types::GameStatus::Closed);
        assert_eq!(stored.winner_id, Some(1));
        assert_eq!(stored.winner_price, 20.0);
    }

    #[tokio::test]
    async fn test_bot_winner_recovery_credits_liquidity() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let (services, _users, games) = Services::in_memory(120);
        let players = vec![
            SelectedPlayer {
                user_id: BOT_USER_ID,
                card_ids: vec![7],
            },
            SelectedPlayer {
                user_id: BOT_USER_ID,
                card_ids: vec![8],
            },
        ];
        let mut game = new_game_record(10, players, vec![]);
        game.status = crate::types::GameStatus::Playing;
        let id = games.insert(&game).await.unwrap();

        let room = RoomState::new(Arc::clone(&store), "10".to_string());
        room.set_bot_liquidity(50.0).await.unwrap();

        let event = DomainEvent::GameEnded {
            game_id: id,
            stake: 10,
            winners: vec![winner(BOT_USER_ID, 7, 20.0)],
            total_calls: 5,
            called_numbers: vec![1, 2, 3, 4, 5],
        };
        apply(&store, &services, &event).await.unwrap();
        apply(&store, &services, &event).await.unwrap();

        assert_eq!(room.bot_liquidity().await.unwrap(), 70.0);
        // Bots never get participation rows.
        assert!(games.participations().is_empty());
    }
}
