//! Coordination store abstraction.
//!
//! The admission controller needs four primitives from its shared store:
//! get, single-key compare-and-set, publish, and subscribe. Anything
//! offering those satisfies the contract, so the store is a trait with
//! two implementations: Redis for multi-process deployments and an
//! in-memory variant for single-process use and tests.

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::stream::{self, Stream, StreamExt};
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tokio::sync::Mutex;

use crate::error::StoreError;

pub type MessageStream = Pin<Box<dyn Stream<Item = String> + Send>>;

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Atomically replace `key` when it currently holds `expected`
    /// (`None` means the key must be absent). Returns false when the
    /// observed value differs, leaving the key untouched.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, StoreError>;

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError>;

    /// Subscribe to `channel`. Messages published after this call
    /// returns are delivered in order; earlier ones are not replayed.
    async fn subscribe(&self, channel: &str) -> Result<MessageStream, StoreError>;
}

/// Single-process store backed by a mutexed map and tokio broadcast
/// channels. Used by tests and single-node deployments.
#[derive(Default)]
pub struct InMemoryStore {
    keys: Mutex<HashMap<String, String>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.keys.lock().await.get(key).cloned())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, StoreError> {
        let mut keys = self.keys.lock().await;
        let matches = match (keys.get(key), expected) {
            (None, None) => true,
            (Some(current), Some(expected)) => current == expected,
            _ => false,
        };
        if matches {
            keys.insert(key.to_string(), new.to_string());
        }
        Ok(matches)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        if let Some(tx) = self.channels.lock().await.get(channel) {
            // No receivers is fine; the message is simply dropped.
            let _ = tx.send(message.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, StoreError> {
        let mut channels = self.channels.lock().await;
        let tx = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(64).0);
        let rx = tx.subscribe();
        let messages = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(message) => return Some((message, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(messages))
    }
}

const CAS_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('SET', KEYS[1], ARGV[2])
  return 1
end
return 0
"#;

/// Redis-backed store for multi-process deployments. Commands go
/// through a shared `ConnectionManager`; each subscription gets its own
/// pub/sub connection.
pub struct RedisStore {
    client: redis::Client,
    conn: redis::aio::ConnectionManager,
    cas: redis::Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(StoreError::from)?;
        let conn = redis::aio::ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, conn, cas: redis::Script::new(CAS_SCRIPT) })
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        match expected {
            None => {
                let created: bool = conn.set_nx(key, new).await?;
                Ok(created)
            }
            Some(expected) => {
                let swapped: i32 = self
                    .cas
                    .key(key)
                    .arg(expected)
                    .arg(new)
                    .invoke_async(&mut conn)
                    .await?;
                Ok(swapped == 1)
            }
        }
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.publish(channel, message).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, StoreError> {
        let conn = self.client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(channel).await?;
        let messages = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() });
        Ok(Box::pin(messages))
    }
}
