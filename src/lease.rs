//! Distributed lease over the state store.
//!
//! A lease is a key holding a random token with a TTL. Whoever wins the
//! set-if-absent race owns the guarded section until the TTL lapses or the
//! owner releases. The number caller acquires one per game so that exactly
//! one worker collects stakes and calls numbers even when several schedule
//! the same round.

use crate::errors::EngineResult;
use crate::store::StateStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

pub struct Lease {
    store: Arc<dyn StateStore>,
    key: String,
    token: String,
    ttl: Duration,
}

impl Lease {
    /// Try to take the lease. `None` means another owner currently holds it.
    pub async fn acquire(
        store: Arc<dyn StateStore>,
        key: &str,
        ttl: Duration,
    ) -> EngineResult<Option<Lease>> {
        let token = Uuid::new_v4().to_string();
        if store.set_nx_ex(key, &token, ttl).await? {
            debug!(key, "lease acquired");
            Ok(Some(Lease {
                store,
                key: key.to_string(),
                token,
                ttl,
            }))
        } else {
            Ok(None)
        }
    }

    /// Push the expiry forward. Returns false when ownership was lost, in
    /// which case the caller must stop the guarded work immediately.
    pub async fn renew(&self) -> EngineResult<bool> {
        match self.store.get(&self.key).await? {
            Some(held) if held == self.token => self.store.expire(&self.key, self.ttl).await,
            _ => Ok(false),
        }
    }

    /// Release the lease if still held by us. A stale owner releasing after
    /// expiry must not delete a successor's token, hence the conditional
    /// delete.
    pub async fn release(self) -> EngineResult<bool> {
        let released = self.store.delete_if_eq(&self.key, &self.token).await?;
        debug!(key = %self.key, released, "lease released");
        Ok(released)
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}
