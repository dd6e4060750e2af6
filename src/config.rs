//! Configuration for the Cartela engine.
//!
//! TOML file plus `CARTELA_*` environment overrides, with validation of the
//! values the game loop depends on.

use crate::errors::{ConfigError, EngineResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

/// Top-level configuration shared by all three binaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartelaConfig {
    pub store: StoreConfig,
    pub database: DatabaseConfig,
    pub gateway: GatewayConfig,
    pub game: GameConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL for the shared state store and pub/sub.
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres connection URL for the system of record.
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub listen_address: String,
    pub port: u16,
}

/// Synthetic-liquidity settings for one stake tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotStakeConfig {
    pub stake: u32,
    /// Target number of bot entries; the actual count is randomized around it.
    pub target_players: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameConfig {
    /// Stake tiers the engine runs rooms for.
    pub stakes: Vec<u32>,
    /// Stakes eligible for the early-bingo bonus multiplier.
    pub bonus_stakes: Vec<u32>,
    /// Minimum room size (in cards) before the bonus applies.
    pub bonus_min_players: u32,
    /// Countdown between scheduling and game start.
    pub countdown_secs: u64,
    /// Pause after `game_stat` before the first number is drawn.
    pub pre_draw_delay_secs: u64,
    /// Interval between drawn numbers. Domain constant, 2-5s in production.
    pub draw_interval_ms: u64,
    /// TTL of the draw-loop lease; renewed every iteration.
    pub lease_ttl_secs: u64,
    /// A "running" game older than this is considered stuck and expired.
    pub stuck_game_secs: i64,
    /// Size of the card catalogue; bot selections draw from 1..=total_cards.
    pub total_cards: i64,
    /// Per-stake synthetic player settings. Absent stake means no bots.
    pub bots: Vec<BotStakeConfig>,
}

impl Default for CartelaConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig {
                url: "redis://127.0.0.1:6379".to_string(),
            },
            database: DatabaseConfig {
                url: "postgres://localhost/cartela".to_string(),
                max_connections: 10,
            },
            gateway: GatewayConfig {
                listen_address: "0.0.0.0".to_string(),
                port: 9000,
            },
            game: GameConfig::default(),
        }
    }
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            stakes: vec![10, 20, 30, 40, 50, 100, 150, 200],
            bonus_stakes: vec![10, 20, 50],
            bonus_min_players: 10,
            countdown_secs: 30,
            pre_draw_delay_secs: 5,
            draw_interval_ms: 4000,
            lease_ttl_secs: 10,
            stuck_game_secs: 400,
            total_cards: 120,
            bots: vec![
                BotStakeConfig {
                    stake: 10,
                    target_players: 6,
                },
                BotStakeConfig {
                    stake: 20,
                    target_players: 4,
                },
            ],
        }
    }
}

impl GameConfig {
    pub fn bot_config(&self, stake: u32) -> Option<&BotStakeConfig> {
        self.bots.iter().find(|b| b.stake == stake)
    }

    pub fn is_bonus_stake(&self, stake: u32) -> bool {
        self.bonus_stakes.contains(&stake)
    }
}

/// Configuration loader with environment variable support.
pub struct ConfigLoader {
    config_path: Option<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Load configuration from file and environment variables.
    pub fn load(&self) -> EngineResult<CartelaConfig> {
        let mut config = if let Some(ref path) = self.config_path {
            self.load_from_file(path)?
        } else {
            CartelaConfig::default()
        };

        self.apply_env_overrides(&mut config)?;
        self.validate(&config)?;

        Ok(config)
    }

    fn load_from_file(&self, path: &str) -> EngineResult<CartelaConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::LoadFailed(format!("Failed to read {}: {}", path, e))
        })?;

        toml::from_str(&content)
            .map_err(|e| ConfigError::LoadFailed(format!("Failed to parse TOML: {}", e)).into())
    }

    fn apply_env_overrides(&self, config: &mut CartelaConfig) -> EngineResult<()> {
        if let Ok(url) = env::var("CARTELA_REDIS_URL") {
            config.store.url = url;
        }
        if let Ok(url) = env::var("CARTELA_DATABASE_URL") {
            config.database.url = url;
        }
        if let Ok(addr) = env::var("CARTELA_GATEWAY_ADDRESS") {
            config.gateway.listen_address = addr;
        }
        if let Ok(port) = env::var("CARTELA_GATEWAY_PORT") {
            config.gateway.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                field: "CARTELA_GATEWAY_PORT".to_string(),
                value: port,
                reason: "Invalid port number".to_string(),
            })?;
        }
        if let Ok(secs) = env::var("CARTELA_COUNTDOWN_SECS") {
            config.game.countdown_secs =
                secs.parse().map_err(|_| ConfigError::InvalidValue {
                    field: "CARTELA_COUNTDOWN_SECS".to_string(),
                    value: secs,
                    reason: "Invalid duration".to_string(),
                })?;
        }
        if let Ok(ms) = env::var("CARTELA_DRAW_INTERVAL_MS") {
            config.game.draw_interval_ms =
                ms.parse().map_err(|_| ConfigError::InvalidValue {
                    field: "CARTELA_DRAW_INTERVAL_MS".to_string(),
                    value: ms,
                    reason: "Invalid duration".to_string(),
                })?;
        }
        Ok(())
    }

    fn validate(&self, config: &CartelaConfig) -> EngineResult<()> {
        if config.gateway.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "gateway.port".to_string(),
                value: "0".to_string(),
                reason: "Port cannot be zero".to_string(),
            }
            .into());
        }
        if config.store.url.is_empty() {
            return Err(ConfigError::MissingRequired("store.url".to_string()).into());
        }
        if config.game.stakes.is_empty() {
            return Err(ConfigError::MissingRequired("game.stakes".to_string()).into());
        }
        if config.game.countdown_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "game.countdown_secs".to_string(),
                value: "0".to_string(),
                reason: "Countdown must be positive".to_string(),
            }
            .into());
        }
        if config.game.draw_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "game.draw_interval_ms".to_string(),
                value: "0".to_string(),
                reason: "Draw interval must be positive".to_string(),
            }
            .into());
        }
        if config.game.lease_ttl_secs < 2 {
            return Err(ConfigError::InvalidValue {
                field: "game.lease_ttl_secs".to_string(),
                value: config.game.lease_ttl_secs.to_string(),
                reason: "Lease TTL must cover at least one draw interval".to_string(),
            }
            .into());
        }
        for bot in &config.game.bots {
            if !config.game.stakes.contains(&bot.stake) {
                return Err(ConfigError::InvalidValue {
                    field: "game.bots.stake".to_string(),
                    value: bot.stake.to_string(),
                    reason: "Bot stake not in configured stakes".to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, config: &CartelaConfig, path: &str) -> EngineResult<()> {
        let toml_string = toml::to_string_pretty(config)
            .map_err(|e| ConfigError::SaveFailed(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, toml_string)
            .map_err(|e| ConfigError::SaveFailed(format!("Failed to write to {}: {}", path, e)).into())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = CartelaConfig::default();
        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.game.countdown_secs, 30);
        assert_eq!(config.game.stakes.len(), 8);
        assert!(config.game.is_bonus_stake(10));
        assert!(!config.game.is_bonus_stake(100));
    }

    #[test]
    fn test_config_validation() {
        let loader = ConfigLoader::new();
        let mut config = CartelaConfig::default();
        assert!(loader.validate(&config).is_ok());

        config.game.countdown_secs = 0;
        assert!(loader.validate(&config).is_err());

        config = CartelaConfig::default();
        config.game.bots.push(BotStakeConfig {
            stake: 999,
            target_players: 2,
        });
        assert!(loader.validate(&config).is_err());
    }

    #[test]
    fn test_bot_config_lookup() {
        let game = GameConfig::default();
        assert_eq!(game.bot_config(10).map(|b| b.target_players), Some(6));
        assert!(game.bot_config(200).is_none());
    }

    #[test]
    fn test_save_and_load_config() -> EngineResult<()> {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let original = CartelaConfig::default();
        let loader = ConfigLoader::new();
        loader.save(&original, path)?;

        let loaded = ConfigLoader::new().with_path(path).load()?;
        assert_eq!(loaded.gateway.port, original.gateway.port);
        assert_eq!(loaded.game.stakes, original.game.stakes);

        Ok(())
    }
}
