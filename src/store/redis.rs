//! Redis-backed `StateStore`.
//!
//! One multiplexed connection is shared for commands; each subscription gets
//! its own pub/sub connection with a pump task feeding an mpsc channel.

use super::{ChannelMessage, StateStore, Subscription};
use crate::errors::EngineResult;
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Deletes a key only when it still holds the expected value. Running this
/// server-side keeps the compare and the delete in one step.
const DELETE_IF_EQ: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

pub struct RedisStore {
    client: Client,
    connection: MultiplexedConnection,
    delete_if_eq: Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> EngineResult<Self> {
        let client = Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        debug!(url, "connected to state store");
        Ok(Self {
            client,
            connection,
            delete_if_eq: Script::new(DELETE_IF_EQ),
        })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.connection.clone()
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get(&self, key: &str) -> EngineResult<Option<String>> {
        let mut conn = self.conn();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> EngineResult<()> {
        let mut conn = self.conn();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> EngineResult<()> {
        let mut conn = self.conn();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> EngineResult<bool> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> EngineResult<bool> {
        let mut conn = self.conn();
        let applied: bool = conn.expire(key, ttl.as_secs().max(1) as i64).await?;
        Ok(applied)
    }

    async fn delete_if_eq(&self, key: &str, value: &str) -> EngineResult<bool> {
        let mut conn = self.conn();
        let deleted: i32 = self
            .delete_if_eq
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn publish(&self, channel: &str, payload: &str) -> EngineResult<()> {
        let mut conn = self.conn();
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> EngineResult<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;

        let pattern = pattern.to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(%channel, error = %e, "dropping undecodable message");
                        continue;
                    }
                };
                if tx.send(ChannelMessage { channel, payload }).is_err() {
                    break;
                }
            }
            debug!(pattern, "subscription closed");
        });

        Ok(Subscription::new(rx))
    }
}
