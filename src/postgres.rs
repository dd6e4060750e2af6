//! Postgres-backed services: users, wallets, games, cards.
//!
//! All queries are plain runtime queries over a shared pool. The two writes
//! that carry money invariants are single conditional UPDATEs, so the
//! database itself enforces them: a stake debit never overdraws and a game
//! row closes at most once.

use crate::config::DatabaseConfig;
use crate::errors::{EngineError, EngineResult};
use crate::services::{
    CardRepository, GameClosure, GameRepository, Participation, Services, UserDirectory,
    UserProfile, WalletService,
};
use crate::types::{Card, Game, GameStatus};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::sync::Arc;
use tracing::info;

pub struct PostgresServices {
    pool: PgPool,
}

impl PostgresServices {
    pub async fn connect(config: &DatabaseConfig) -> EngineResult<Arc<Self>> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        info!(max_connections = config.max_connections, "database pool ready");
        Ok(Arc::new(Self { pool }))
    }

    pub async fn run_migrations(&self) -> EngineResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))
    }

    pub fn services(self: &Arc<Self>) -> Services {
        Services {
            users: Arc::clone(self) as Arc<dyn UserDirectory>,
            wallets: Arc::clone(self) as Arc<dyn WalletService>,
            games: Arc::clone(self) as Arc<dyn GameRepository>,
            cards: Arc::clone(self) as Arc<dyn CardRepository>,
        }
    }
}

fn status_str(status: GameStatus) -> &'static str {
    match status {
        GameStatus::Created => "created",
        GameStatus::Started => "started",
        GameStatus::Playing => "playing",
        GameStatus::Closed => "closed",
    }
}

fn parse_status(raw: &str) -> EngineResult<GameStatus> {
    match raw {
        "created" => Ok(GameStatus::Created),
        "started" => Ok(GameStatus::Started),
        "playing" => Ok(GameStatus::Playing),
        "closed" => Ok(GameStatus::Closed),
        other => Err(EngineError::Persistence(format!(
            "unknown game status '{other}'"
        ))),
    }
}

fn game_from_row(row: &PgRow) -> EngineResult<Game> {
    let status: String = row.try_get("status")?;
    Ok(Game {
        id: row.try_get("id")?,
        stake: row.try_get::<i32, _>("stake")? as u32,
        players: serde_json::from_value(row.try_get("players")?)?,
        number_of_players: row.try_get::<i32, _>("number_of_players")? as u32,
        draw_sequence: serde_json::from_value(row.try_get("draw_sequence")?)?,
        called_numbers: serde_json::from_value(row.try_get("called_numbers")?)?,
        total_calls: row.try_get::<i32, _>("total_calls")? as u32,
        status: parse_status(&status)?,
        winner_price: row.try_get("winner_price")?,
        admin_cut: row.try_get("admin_cut")?,
        bonus: row.try_get("bonus")?,
        winner_id: row.try_get("winner_id")?,
        winner_card: row.try_get("winner_card")?,
        winner_name: row.try_get("winner_name")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
    })
}

#[async_trait]
impl UserDirectory for PostgresServices {
    async fn user(&self, user_id: i64) -> EngineResult<Option<UserProfile>> {
        let row = sqlx::query(
            "SELECT id, name, wallet, bonus, is_active FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            Ok(UserProfile {
                id: r.try_get("id")?,
                name: r.try_get("name")?,
                wallet: r.try_get("wallet")?,
                bonus: r.try_get("bonus")?,
                is_active: r.try_get("is_active")?,
            })
        })
        .transpose()
    }

    async fn set_active(&self, user_id: i64, active: bool) -> EngineResult<()> {
        sqlx::query("UPDATE users SET is_active = $2 WHERE id = $1")
            .bind(user_id)
            .bind(active)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl WalletService for PostgresServices {
    async fn try_debit(&self, user_id: i64, amount: f64) -> EngineResult<bool> {
        // Wallet first, bonus for the remainder, and only when the combined
        // balance covers the amount. One statement keeps it atomic.
        let result = sqlx::query(
            "UPDATE users SET \
                 wallet = wallet - LEAST(wallet, $2), \
                 bonus = bonus - ($2 - LEAST(wallet, $2)) \
             WHERE id = $1 AND wallet + bonus >= $2",
        )
        .bind(user_id)
        .bind(amount)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn credit(&self, user_id: i64, amount: f64) -> EngineResult<()> {
        sqlx::query("UPDATE users SET wallet = wallet + $2 WHERE id = $1")
            .bind(user_id)
            .bind(amount)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn balances(&self, user_id: i64) -> EngineResult<Option<(f64, f64)>> {
        let row = sqlx::query("SELECT wallet, bonus FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Ok((r.try_get("wallet")?, r.try_get("bonus")?)))
            .transpose()
    }
}

#[async_trait]
impl GameRepository for PostgresServices {
    async fn insert(&self, game: &Game) -> EngineResult<i64> {
        let row = sqlx::query(
            "INSERT INTO games \
                 (stake, players, number_of_players, draw_sequence, called_numbers, \
                  total_calls, status, winner_price, admin_cut, bonus, \
                  created_at, started_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             RETURNING id",
        )
        .bind(game.stake as i32)
        .bind(serde_json::to_value(&game.players)?)
        .bind(game.number_of_players as i32)
        .bind(serde_json::to_value(&game.draw_sequence)?)
        .bind(serde_json::to_value(&game.called_numbers)?)
        .bind(game.total_calls as i32)
        .bind(status_str(game.status))
        .bind(game.winner_price)
        .bind(game.admin_cut)
        .bind(game.bonus)
        .bind(game.created_at)
        .bind(game.started_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn fetch(&self, game_id: i64) -> EngineResult<Option<Game>> {
        let row = sqlx::query("SELECT * FROM games WHERE id = $1")
            .bind(game_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(game_from_row).transpose()
    }

    async fn update(&self, game: &Game) -> EngineResult<()> {
        sqlx::query(
            "UPDATE games SET \
                 players = $2, number_of_players = $3, called_numbers = $4, \
                 total_calls = $5, status = $6, winner_price = $7, \
                 admin_cut = $8, bonus = $9, started_at = $10 \
             WHERE id = $1",
        )
        .bind(game.id)
        .bind(serde_json::to_value(&game.players)?)
        .bind(game.number_of_players as i32)
        .bind(serde_json::to_value(&game.called_numbers)?)
        .bind(game.total_calls as i32)
        .bind(status_str(game.status))
        .bind(game.winner_price)
        .bind(game.admin_cut)
        .bind(game.bonus)
        .bind(game.started_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn close_if_open(&self, game_id: i64, closure: &GameClosure) -> EngineResult<bool> {
        let result = sqlx::query(
            "UPDATE games SET \
                 status = 'closed', winner_id = $2, winner_card = $3, \
                 winner_name = $4, winner_price = $5, admin_cut = $6, \
                 bonus = $7, total_calls = $8, called_numbers = $9 \
             WHERE id = $1 AND status <> 'closed'",
        )
        .bind(game_id)
        .bind(closure.winner_id)
        .bind(closure.winner_card)
        .bind(closure.winner_name.as_deref())
        .bind(closure.winner_price)
        .bind(closure.admin_cut)
        .bind(closure.bonus)
        .bind(closure.total_calls as i32)
        .bind(serde_json::to_value(&closure.called_numbers)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_participation(&self, participation: &Participation) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO participations (game_id, user_id, card_ids, won, amount_won) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (game_id, user_id) DO UPDATE SET \
                 card_ids = EXCLUDED.card_ids, \
                 won = EXCLUDED.won, \
                 amount_won = EXCLUDED.amount_won",
        )
        .bind(participation.game_id)
        .bind(participation.user_id)
        .bind(serde_json::to_value(&participation.card_ids)?)
        .bind(participation.won)
        .bind(participation.amount_won)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CardRepository for PostgresServices {
    async fn card(&self, card_id: i64) -> EngineResult<Option<Card>> {
        let row = sqlx::query("SELECT id, numbers FROM cards WHERE id = $1")
            .bind(card_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            Ok(Card {
                id: r.try_get("id")?,
                numbers: serde_json::from_value(r.try_get("numbers")?)?,
            })
        })
        .transpose()
    }

    async fn cards(&self, card_ids: &[i64]) -> EngineResult<Vec<Card>> {
        let rows = sqlx::query("SELECT id, numbers FROM cards WHERE id = ANY($1)")
            .bind(card_ids)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| {
                Ok(Card {
                    id: r.try_get("id")?,
                    numbers: serde_json::from_value(r.try_get("numbers")?)?,
                })
            })
            .collect()
    }
}
