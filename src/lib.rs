//! Cartela: a distributed, real-time multiplayer bingo engine.
//!
//! Three processes share nothing but Redis and Postgres: the gateway bridges
//! WebSockets to pub/sub, the worker runs rooms and calls numbers under a
//! per-game lease, and the dbworker persists settlement events idempotently.

pub mod caller;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod lease;
pub mod manager;
pub mod persistence;
pub mod postgres;
pub mod protocol;
pub mod services;
pub mod settlement;
pub mod store;
pub mod types;
pub mod verifier;

pub use config::{CartelaConfig, ConfigLoader};
pub use errors::{EngineError, EngineResult};
