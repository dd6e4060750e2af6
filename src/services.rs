//! Service traits the engine depends on: user directory, wallets, the game
//! record store, and the card catalogue.
//!
//! Production wires these to Postgres (`postgres` module); tests and local
//! runs use the in-memory implementations below, which keep the same
//! atomicity guarantees behind a mutex.

use crate::errors::EngineResult;
use crate::types::{Card, CardGrid, Game, GameStatus};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// Bundle of the backing services a room needs.
#[derive(Clone)]
pub struct Services {
    pub users: Arc<dyn UserDirectory>,
    pub wallets: Arc<dyn WalletService>,
    pub games: Arc<dyn GameRepository>,
    pub cards: Arc<dyn CardRepository>,
}

impl Services {
    /// Fully in-memory bundle backed by `count` generated cards. Users and
    /// games start empty.
    pub fn in_memory(card_count: i64) -> (Self, Arc<InMemoryUsers>, Arc<InMemoryGames>) {
        let users = Arc::new(InMemoryUsers::new());
        let games = Arc::new(InMemoryGames::new());
        let services = Self {
            users: Arc::clone(&users) as Arc<dyn UserDirectory>,
            wallets: Arc::clone(&users) as Arc<dyn WalletService>,
            games: Arc::clone(&games) as Arc<dyn GameRepository>,
            cards: Arc::new(InMemoryCards::generate(card_count)),
        };
        (services, users, games)
    }
}

/// Account data the engine needs about a player.
#[derive(Debug, Clone, PartialEq)]
pub struct UserProfile {
    pub id: i64,
    pub name: String,
    pub wallet: f64,
    pub bonus: f64,
    pub is_active: bool,
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn user(&self, user_id: i64) -> EngineResult<Option<UserProfile>>;

    /// Deactivate or reactivate an account (`block_user`).
    async fn set_active(&self, user_id: i64, active: bool) -> EngineResult<()>;
}

#[async_trait]
pub trait WalletService: Send + Sync {
    /// Debit a stake, spending wallet balance first and bonus balance for the
    /// remainder. Returns false when the combined balance cannot cover the
    /// amount; no partial debit happens in that case.
    async fn try_debit(&self, user_id: i64, amount: f64) -> EngineResult<bool>;

    /// Credit winnings to the wallet balance.
    async fn credit(&self, user_id: i64, amount: f64) -> EngineResult<()>;

    async fn balances(&self, user_id: i64) -> EngineResult<Option<(f64, f64)>>;
}

/// Winner fields applied when a game closes.
#[derive(Debug, Clone)]
pub struct GameClosure {
    pub winner_id: Option<i64>,
    pub winner_card: Option<i64>,
    pub winner_name: Option<String>,
    pub winner_price: f64,
    pub admin_cut: f64,
    pub bonus: f64,
    pub total_calls: u32,
    pub called_numbers: Vec<u8>,
}

/// One user's participation row for a finished game.
#[derive(Debug, Clone)]
pub struct Participation {
    pub game_id: i64,
    pub user_id: i64,
    pub card_ids: Vec<i64>,
    pub won: bool,
    pub amount_won: f64,
}

#[async_trait]
pub trait GameRepository: Send + Sync {
    /// Persist a new game record, returning its assigned id.
    async fn insert(&self, game: &Game) -> EngineResult<i64>;

    async fn fetch(&self, game_id: i64) -> EngineResult<Option<Game>>;

    async fn update(&self, game: &Game) -> EngineResult<()>;

    /// Apply winner fields and move the game to `Closed`, but only if it is
    /// not closed yet. Atomic; this is the idempotency barrier that keeps a
    /// redelivered settlement event from paying twice.
    async fn close_if_open(&self, game_id: i64, closure: &GameClosure) -> EngineResult<bool>;

    async fn record_participation(&self, participation: &Participation) -> EngineResult<()>;
}

#[async_trait]
pub trait CardRepository: Send + Sync {
    async fn card(&self, card_id: i64) -> EngineResult<Option<Card>>;

    async fn cards(&self, card_ids: &[i64]) -> EngineResult<Vec<Card>>;
}

// --- In-memory implementations ---

#[derive(Default)]
pub struct InMemoryUsers {
    users: Mutex<HashMap<i64, UserProfile>>,
}

impl InMemoryUsers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, profile: UserProfile) {
        self.users.lock().unwrap().insert(profile.id, profile);
    }
}

#[async_trait]
impl UserDirectory for InMemoryUsers {
    async fn user(&self, user_id: i64) -> EngineResult<Option<UserProfile>> {
        Ok(self.users.lock().unwrap().get(&user_id).cloned())
    }

    async fn set_active(&self, user_id: i64, active: bool) -> EngineResult<()> {
        if let Some(profile) = self.users.lock().unwrap().get_mut(&user_id) {
            profile.is_active = active;
        }
        Ok(())
    }
}

#[async_trait]
impl WalletService for InMemoryUsers {
    async fn try_debit(&self, user_id: i64, amount: f64) -> EngineResult<bool> {
        let mut users = self.users.lock().unwrap();
        let Some(profile) = users.get_mut(&user_id) else {
            return Ok(false);
        };
        if profile.wallet + profile.bonus < amount {
            return Ok(false);
        }
        let from_wallet = profile.wallet.min(amount);
        profile.wallet -= from_wallet;
        profile.bonus -= amount - from_wallet;
        Ok(true)
    }

    async fn credit(&self, user_id: i64, amount: f64) -> EngineResult<()> {
        if let Some(profile) = self.users.lock().unwrap().get_mut(&user_id) {
            profile.wallet += amount;
        }
        Ok(())
    }

    async fn balances(&self, user_id: i64) -> EngineResult<Option<(f64, f64)>> {
        Ok(self
            .users
            .lock()
            .unwrap()
            .get(&user_id)
            .map(|p| (p.wallet, p.bonus)))
    }
}

pub struct InMemoryGames {
    games: Mutex<HashMap<i64, Game>>,
    participations: Mutex<Vec<Participation>>,
    next_id: AtomicI64,
}

impl InMemoryGames {
    pub fn new() -> Self {
        Self {
            games: Mutex::new(HashMap::new()),
            participations: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn participations(&self) -> Vec<Participation> {
        self.participations.lock().unwrap().clone()
    }
}

#[async_trait]
impl GameRepository for InMemoryGames {
    async fn insert(&self, game: &Game) -> EngineResult<i64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut stored = game.clone();
        stored.id = id;
        self.games.lock().unwrap().insert(id, stored);
        Ok(id)
    }

    async fn fetch(&self, game_id: i64) -> EngineResult<Option<Game>> {
        Ok(self.games.lock().unwrap().get(&game_id).cloned())
    }

    async fn update(&self, game: &Game) -> EngineResult<()> {
        self.games.lock().unwrap().insert(game.id, game.clone());
        Ok(())
    }

    async fn close_if_open(&self, game_id: i64, closure: &GameClosure) -> EngineResult<bool> {
        let mut games = self.games.lock().unwrap();
        let Some(game) = games.get_mut(&game_id) else {
            return Ok(false);
        };
        if game.status == GameStatus::Closed {
            return Ok(false);
        }
        game.status = GameStatus::Closed;
        game.winner_id = closure.winner_id;
        game.winner_card = closure.winner_card;
        game.winner_name = closure.winner_name.clone();
        game.winner_price = closure.winner_price;
        game.admin_cut = closure.admin_cut;
        game.bonus = closure.bonus;
        game.total_calls = closure.total_calls;
        game.called_numbers = closure.called_numbers.clone();
        Ok(true)
    }

    async fn record_participation(&self, participation: &Participation) -> EngineResult<()> {
        let mut rows = self.participations.lock().unwrap();
        // Upsert on (game_id, user_id).
        if let Some(existing) = rows
            .iter_mut()
            .find(|p| p.game_id == participation.game_id && p.user_id == participation.user_id)
        {
            *existing = participation.clone();
        } else {
            rows.push(participation.clone());
        }
        Ok(())
    }
}

pub struct InMemoryCards {
    cards: HashMap<i64, Card>,
}

impl InMemoryCards {
    pub fn with_cards(cards: Vec<Card>) -> Self {
        Self {
            cards: cards.into_iter().map(|c| (c.id, c)).collect(),
        }
    }

    /// Build a catalogue of `count` cards with ids 1..=count. Grids follow
    /// the standard column ranges (B 1-15 through O 61-75) with a free
    /// center, generated deterministically from the card id.
    pub fn generate(count: i64) -> Self {
        Self::with_cards((1..=count).map(generate_card).collect())
    }
}

#[async_trait]
impl CardRepository for InMemoryCards {
    async fn card(&self, card_id: i64) -> EngineResult<Option<Card>> {
        Ok(self.cards.get(&card_id).cloned())
    }

    async fn cards(&self, card_ids: &[i64]) -> EngineResult<Vec<Card>> {
        Ok(card_ids
            .iter()
            .filter_map(|id| self.cards.get(id).cloned())
            .collect())
    }
}

/// Deterministic card grid keyed by card id.
pub fn generate_card(card_id: i64) -> Card {
    let mut rng = rand::rngs::StdRng::seed_from_u64(card_id as u64);
    let mut numbers: CardGrid = [[0; 5]; 5];
    for col in 0..5 {
        let low = (col as u8) * 15 + 1;
        let mut pool: Vec<u8> = (low..low + 15).collect();
        pool.shuffle(&mut rng);
        for row in 0..5 {
            numbers[row][col] = pool[row];
        }
    }
    numbers[2][2] = 0;
    Card {
        id: card_id,
        numbers,
    }
}
