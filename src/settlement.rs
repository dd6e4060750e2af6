//! Win claims, prize math, and the single-settlement guarantee.
//!
//! Every path that ends a game funnels through `finalize`: a human `bingo`
//! claim, a bot card completing a pattern, and pool exhaustion. The one-time
//! latch in the shared store decides which concurrent claimant settles; the
//! losers of that race see `AlreadySettled` and touch nothing.

use crate::config::GameConfig;
use crate::errors::{EngineResult, GameError, SettlementError};
use crate::protocol::{ResultEntry, ServerEvent};
use crate::services::{GameClosure, Services};
use crate::store::RoomState;
use crate::types::{round2, DomainEvent, Game, GameStatus, WinnerShare, BOT_USER_ID};
use crate::verifier::has_bingo;
use tracing::{info, warn};

/// House commission on a pot: 20% from 100, 10% from 50, free below.
pub fn commission(pot: f64) -> f64 {
    if pot >= 100.0 {
        round2(pot * 0.2)
    } else if pot >= 50.0 {
        round2(pot * 0.1)
    } else {
        0.0
    }
}

/// Prize a pot of this size would pay out after commission.
pub fn potential_prize(pot: f64) -> f64 {
    round2(pot - commission(pot))
}

/// Early-bingo bonus for a winning claim: stake times a multiplier that
/// decays with the call count. Zero for non-bonus stakes, small rooms, or
/// wins past fifteen calls.
pub fn bonus_amount(config: &GameConfig, stake: u32, player_count: u32, total_calls: u32) -> f64 {
    if !config.is_bonus_stake(stake) || player_count < config.bonus_min_players {
        return 0.0;
    }
    let multiplier = match total_calls {
        0..=5 => 10,
        6 => 9,
        7 => 8,
        8 => 7,
        9 => 6,
        10 => 5,
        11 => 4,
        12 | 13 => 3,
        14 | 15 => 2,
        _ => 0,
    };
    stake as f64 * multiplier as f64
}

/// Outcome of a win claim.
#[derive(Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The claim won the settlement race; payouts are done.
    Settled,
    /// None of the claimant's cards completes a pattern.
    NoWin,
    /// Another claim settled this game first.
    AlreadySettled,
}

/// Handle a client `bingo` frame. Outcomes that are not wins go back to the
/// claimant as targeted events; participant and finality violations surface
/// as errors for the dispatcher to report.
pub async fn check_bingo(
    room: &RoomState,
    services: &Services,
    config: &GameConfig,
    client_id: &str,
    user_id: i64,
    game_id: i64,
    claimed: &[u8],
) -> EngineResult<()> {
    if room.current_game_id().await?.is_none() {
        return Err(GameError::NoActiveGame.into());
    }
    match try_claim(room, services, config, user_id, game_id, claimed).await? {
        ClaimOutcome::Settled => Ok(()),
        ClaimOutcome::NoWin => {
            room.publish_event(
                ServerEvent::Error {
                    message: "No winning pattern on your cards.".to_string(),
                },
                Some(client_id),
            )
            .await
        }
        ClaimOutcome::AlreadySettled => {
            room.publish_event(
                ServerEvent::Error {
                    message: "Game already settled.".to_string(),
                },
                Some(client_id),
            )
            .await
        }
    }
}

/// Verify a claim against the authoritative called set and, if it wins the
/// settlement race, pay out and close the game.
pub async fn try_claim(
    room: &RoomState,
    services: &Services,
    config: &GameConfig,
    user_id: i64,
    game_id: i64,
    claimed: &[u8],
) -> EngineResult<ClaimOutcome> {
    let game = match room.game_snapshot(game_id).await? {
        Some(game) => game,
        None => services
            .games
            .fetch(game_id)
            .await?
            .ok_or(GameError::GameNotFound)?,
    };
    if game.is_finalized() {
        return Err(SettlementError::AlreadyFinalized(game_id).into());
    }

    let claimant_cards = game.cards_of(user_id);
    if claimant_cards.is_empty() {
        return Err(SettlementError::NotAParticipant { user_id, game_id }.into());
    }

    // Only the numbers the engine actually called count; the client's own
    // list is logged when it disagrees but never trusted.
    let called = room.called_numbers(game_id).await?;
    if !claimed.is_empty() && claimed != called.as_slice() {
        warn!(
            game_id,
            user_id,
            claimed = claimed.len(),
            called = called.len(),
            "claim called-number list diverges from authoritative set"
        );
    }

    let claimant_win = first_winning_card(services, &claimant_cards, &called).await?;
    let Some(claimant_win) = claimant_win else {
        return Ok(ClaimOutcome::NoWin);
    };

    if !room.try_set_bingo(game_id).await? {
        return Ok(ClaimOutcome::AlreadySettled);
    }

    settle(room, services, config, &game, user_id, claimant_win, &called).await?;
    Ok(ClaimOutcome::Settled)
}

/// First card in selection order that completes a pattern, with its cells.
async fn first_winning_card(
    services: &Services,
    card_ids: &[i64],
    called: &[u8],
) -> EngineResult<Option<(i64, Vec<u8>)>> {
    for &card_id in card_ids {
        if let Some(card) = services.cards.card(card_id).await? {
            let cells = has_bingo(&card.numbers, called);
            if !cells.is_empty() {
                return Ok(Some((card_id, cells)));
            }
        }
    }
    Ok(None)
}

/// Pay out a verified win. Caller must hold the bingo latch.
///
/// Every participant is rescanned against the called set so simultaneous
/// completions split the pot; the pot divides into equal cent-floored shares
/// with the rounding remainder and the bonus going to the claimant.
async fn settle(
    room: &RoomState,
    services: &Services,
    config: &GameConfig,
    game: &Game,
    claimant_id: i64,
    claimant_win: (i64, Vec<u8>),
    called: &[u8],
) -> EngineResult<()> {
    room.set_is_running(game.id, false).await?;

    let total_calls = called.len() as u32;
    let pot = game.number_of_players as f64 * game.stake as f64;
    let admin_cut = commission(pot);
    let prize_pool = round2(pot - admin_cut);
    let bonus = bonus_amount(config, game.stake, game.number_of_players, total_calls);

    // All simultaneous winners, claimant first.
    let mut winner_rows: Vec<(i64, i64, Vec<u8>)> =
        vec![(claimant_id, claimant_win.0, claimant_win.1)];
    for player in &game.players {
        if player.user_id == claimant_id {
            continue;
        }
        if let Some((card_id, cells)) =
            first_winning_card(services, &player.card_ids, called).await?
        {
            winner_rows.push((player.user_id, card_id, cells));
        }
    }

    let share = floor_cents(prize_pool / winner_rows.len() as f64);
    let remainder = round2(prize_pool - share * winner_rows.len() as f64);

    let mut winners = Vec::with_capacity(winner_rows.len());
    for (i, (user_id, card_id, cells)) in winner_rows.iter().enumerate() {
        let mut amount = share;
        if i == 0 {
            amount = round2(amount + remainder + bonus);
        }
        let name = winner_name(services, *user_id).await?;
        credit_winner(room, services, *user_id, amount).await?;
        winners.push(WinnerShare {
            user_id: *user_id,
            card_id: *card_id,
            name,
            amount,
            bonus: if i == 0 { bonus } else { 0.0 },
            winning_cells: cells.clone(),
        });
    }

    info!(
        game_id = game.id,
        stake = game.stake,
        winners = winners.len(),
        total_calls,
        prize_pool,
        "game settled"
    );

    finalize(room, services, game, winners, called.to_vec(), admin_cut, prize_pool, bonus).await
}

async fn winner_name(services: &Services, user_id: i64) -> EngineResult<String> {
    if user_id == BOT_USER_ID {
        return Ok("Bot".to_string());
    }
    Ok(services
        .users
        .user(user_id)
        .await?
        .map(|u| u.name)
        .unwrap_or_else(|| format!("user{user_id}")))
}

/// Winnings go to the wallet; bot winnings flow back into the shared
/// liquidity pool.
async fn credit_winner(
    room: &RoomState,
    services: &Services,
    user_id: i64,
    amount: f64,
) -> EngineResult<()> {
    if user_id == BOT_USER_ID {
        let pool = room.bot_liquidity().await?;
        room.set_bot_liquidity(round2(pool + amount)).await
    } else {
        services.wallets.credit(user_id, amount).await
    }
}

/// Close a game whose draw pool ran out or that got stuck: nobody is paid,
/// the pot is forfeited.
pub async fn close_without_winner(
    room: &RoomState,
    services: &Services,
    game: &Game,
) -> EngineResult<()> {
    if !room.try_set_bingo(game.id).await? {
        // A claim settled concurrently; nothing left to do.
        return Ok(());
    }
    room.set_is_running(game.id, false).await?;
    let called = room.called_numbers(game.id).await?;
    warn!(game_id = game.id, stake = game.stake, "closing without winner");
    finalize(room, services, game, Vec::new(), called, 0.0, 0.0, 0.0).await
}

/// Shared closing path: persist the closure, broadcast the result, emit the
/// durable settlement event, and reset the room for the next round.
#[allow(clippy::too_many_arguments)]
async fn finalize(
    room: &RoomState,
    services: &Services,
    game: &Game,
    winners: Vec<WinnerShare>,
    called: Vec<u8>,
    admin_cut: f64,
    prize_pool: f64,
    bonus: f64,
) -> EngineResult<()> {
    let total_calls = called.len() as u32;
    let claimant = winners.first();
    let closure = GameClosure {
        winner_id: claimant.map(|w| w.user_id),
        winner_card: claimant.map(|w| w.card_id),
        winner_name: claimant.map(|w| w.name.clone()),
        winner_price: prize_pool,
        admin_cut,
        bonus,
        total_calls,
        called_numbers: called.clone(),
    };
    services.games.close_if_open(game.id, &closure).await?;

    let mut snapshot = game.clone();
    snapshot.status = GameStatus::Closed;
    snapshot.winner_id = closure.winner_id;
    snapshot.winner_card = closure.winner_card;
    snapshot.winner_name = closure.winner_name.clone();
    snapshot.winner_price = prize_pool;
    snapshot.admin_cut = admin_cut;
    snapshot.bonus = bonus;
    snapshot.total_calls = total_calls;
    snapshot.called_numbers = called.clone();
    room.save_game_snapshot(&snapshot).await?;

    let data = if winners.is_empty() {
        vec![ResultEntry {
            card_name: None,
            message: "No winner this round.".to_string(),
            name: None,
            user_id: 0,
            card: None,
            winning_numbers: Vec::new(),
            called_numbers: called.clone(),
            bones_won: 0.0,
        }]
    } else {
        let mut rows = Vec::with_capacity(winners.len());
        for winner in &winners {
            let grid = services
                .cards
                .card(winner.card_id)
                .await?
                .map(|c| c.numbers);
            rows.push(ResultEntry {
                card_name: Some(winner.card_id),
                message: format!("Bingo! {} won {:.2}.", winner.name, winner.amount),
                name: Some(winner.name.clone()),
                user_id: winner.user_id,
                card: grid,
                winning_numbers: winner.winning_cells.clone(),
                called_numbers: called.clone(),
                bones_won: winner.amount,
            });
        }
        rows
    };
    room.publish_event(
        ServerEvent::Result {
            data,
            game_id: game.id,
        },
        None,
    )
    .await?;

    room.publish_db_event(&DomainEvent::GameEnded {
        game_id: game.id,
        stake: game.stake,
        winners,
        total_calls,
        called_numbers: called,
    })
    .await?;

    // Reset the room; the next round forms from fresh selections.
    room.end_game(game.id).await?;
    room.set_selected_players(&[]).await?;
    room.set_player_count(0).await?;
    room.publish_event(
        ServerEvent::PlayerList {
            player_list: Vec::new(),
        },
        None,
    )
    .await
}

fn floor_cents(value: f64) -> f64 {
    (value * 100.0).floor() / 100.0
}
