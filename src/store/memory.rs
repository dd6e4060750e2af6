//! In-memory `StateStore` used by tests and single-process runs.
//!
//! Per-key atomicity comes from the DashMap entry API, so the conditional
//! primitives behave exactly like their Redis counterparts. Pub/sub patterns
//! support `*` wildcards matching any substring, channel separators included.

use super::{ChannelMessage, StateStore, Subscription};
use crate::errors::EngineResult;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn live(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(deadline) if Instant::now() >= deadline)
    }
}

struct Subscriber {
    pattern: String,
    tx: mpsc::UnboundedSender<ChannelMessage>,
}

/// Process-local store with the same semantics as the Redis-backed one.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Glob match where `*` spans any substring.
fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == channel,
        Some((prefix, rest)) => {
            let Some(remainder) = channel.strip_prefix(prefix) else {
                return false;
            };
            if rest.is_empty() {
                return true;
            }
            // Try every position the next literal segment could start at.
            (0..=remainder.len()).any(|i| pattern_matches(rest, &remainder[i..]))
        }
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> EngineResult<Option<String>> {
        if let Some(stored) = self.entries.get(key) {
            if !stored.is_expired() {
                return Ok(Some(stored.value.clone()));
            }
        }
        // Lazy expiry, mirroring how we never rely on eager eviction.
        self.entries.remove_if(key, |_, v| v.is_expired());
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str) -> EngineResult<()> {
        self.entries
            .insert(key.to_string(), StoredValue::live(value, None));
        Ok(())
    }

    async fn delete(&self, key: &str) -> EngineResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> EngineResult<bool> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(StoredValue::live(value, Some(ttl)));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::live(value, Some(ttl)));
                Ok(true)
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> EngineResult<bool> {
        match self.entries.get_mut(key) {
            Some(mut stored) if !stored.is_expired() => {
                stored.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if_eq(&self, key: &str, value: &str) -> EngineResult<bool> {
        Ok(self
            .entries
            .remove_if(key, |_, stored| {
                !stored.is_expired() && stored.value == value
            })
            .is_some())
    }

    async fn publish(&self, channel: &str, payload: &str) -> EngineResult<()> {
        let message = ChannelMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|sub| {
            if !pattern_matches(&sub.pattern, channel) {
                return true;
            }
            // Drop subscribers whose receiving side is gone.
            sub.tx.send(message.clone()).is_ok()
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> EngineResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(Subscriber {
            pattern: pattern.to_string(),
            tx,
        });
        Ok(Subscription::new(rx))
    }
}
