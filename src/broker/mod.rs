//! Event broker adapter: pub/sub over named channels plus small TTL'd
//! key-value and hash state. Three backends — Redis for production,
//! an in-process bus for tests and single-node runs, and a disabled
//! stub for degraded mode (no `REDIS_URL`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

mod memory;

pub mod channels;

use memory::MemoryBus;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable")]
    Unavailable,
    #[error("broker error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// A live subscription to one broker channel. Dropping it tears down the
/// backing receive loop.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
}

impl Subscription {
    /// Receive the next published payload. Returns `None` when the
    /// subscription has been closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Non-blocking receive. Returns `None` when nothing is pending.
    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Clone)]
enum Backend {
    Redis {
        client: redis::Client,
        conn: MultiplexedConnection,
    },
    Memory(Arc<MemoryBus>),
    Disabled,
}

/// Handle to the event broker. Cheap to clone; all clones share the same
/// backend.
#[derive(Clone)]
pub struct Broker {
    backend: Backend,
}

impl Broker {
    /// Connect to Redis at `url`. Fails fast if the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            backend: Backend::Redis { client, conn },
        })
    }

    /// An in-process broker. Clones share one bus, so two components (or
    /// two presence managers in a test) see each other's events.
    pub fn memory() -> Self {
        Self {
            backend: Backend::Memory(Arc::new(MemoryBus::new())),
        }
    }

    /// Degraded-mode broker: every operation fails with
    /// [`BrokerError::Unavailable`].
    pub fn disabled() -> Self {
        Self {
            backend: Backend::Disabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.backend, Backend::Disabled)
    }

    /// Publish a payload to a channel.
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        match &self.backend {
            Backend::Redis { conn, .. } => {
                let mut conn = conn.clone();
                let _: () = conn.publish(channel, payload).await?;
                Ok(())
            }
            Backend::Memory(bus) => {
                bus.publish(channel, payload);
                Ok(())
            }
            Backend::Disabled => Err(BrokerError::Unavailable),
        }
    }

    /// Serialize `value` and publish it to a channel.
    pub async fn publish_json<T: Serialize>(
        &self,
        channel: &str,
        value: &T,
    ) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(value)?;
        self.publish(channel, &payload).await
    }

    /// Subscribe to a channel. The returned subscription yields payloads
    /// in publish order until dropped.
    pub async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError> {
        match &self.backend {
            Backend::Redis { client, .. } => {
                let (tx, rx) = mpsc::unbounded_channel();
                let cancel = CancellationToken::new();
                let task_cancel = cancel.clone();
                let client = client.clone();
                let channel = channel.to_string();

                tokio::spawn(async move {
                    let mut pubsub = match client.get_async_pubsub().await {
                        Ok(p) => p,
                        Err(e) => {
                            error!(%channel, error = %e, "failed to open pubsub connection");
                            return;
                        }
                    };
                    if let Err(e) = pubsub.subscribe(&channel).await {
                        error!(%channel, error = %e, "failed to subscribe");
                        return;
                    }

                    let mut stream = pubsub.into_on_message();
                    loop {
                        tokio::select! {
                            _ = task_cancel.cancelled() => break,
                            msg = stream.next() => match msg {
                                Some(msg) => {
                                    let payload: String = match msg.get_payload() {
                                        Ok(p) => p,
                                        Err(_) => continue,
                                    };
                                    if tx.send(payload).is_err() {
                                        break;
                                    }
                                }
                                None => break,
                            },
                        }
                    }
                    debug!(%channel, "subscription closed");
                });

                Ok(Subscription { rx, cancel })
            }
            Backend::Memory(bus) => {
                let (tx, rx) = mpsc::unbounded_channel();
                bus.add_subscriber(channel, tx);
                Ok(Subscription {
                    rx,
                    cancel: CancellationToken::new(),
                })
            }
            Backend::Disabled => Err(BrokerError::Unavailable),
        }
    }

    /// Store a JSON value under `key` with a TTL.
    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(value)?;
        match &self.backend {
            Backend::Redis { conn, .. } => {
                let mut conn = conn.clone();
                let _: () = conn.set_ex(key, payload, ttl.as_secs()).await?;
                Ok(())
            }
            Backend::Memory(bus) => {
                bus.set(key, payload, ttl);
                Ok(())
            }
            Backend::Disabled => Err(BrokerError::Unavailable),
        }
    }

    /// Fetch and deserialize the JSON value under `key`, if present.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, BrokerError> {
        let raw = match &self.backend {
            Backend::Redis { conn, .. } => {
                let mut conn = conn.clone();
                conn.get::<_, Option<String>>(key).await?
            }
            Backend::Memory(bus) => bus.get(key),
            Backend::Disabled => return Err(BrokerError::Unavailable),
        };

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Delete a key.
    pub async fn delete(&self, key: &str) -> Result<(), BrokerError> {
        match &self.backend {
            Backend::Redis { conn, .. } => {
                let mut conn = conn.clone();
                let _: () = conn.del(key).await?;
                Ok(())
            }
            Backend::Memory(bus) => {
                bus.delete(key);
                Ok(())
            }
            Backend::Disabled => Err(BrokerError::Unavailable),
        }
    }

    /// Set a field in a hash.
    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), BrokerError> {
        match &self.backend {
            Backend::Redis { conn, .. } => {
                let mut conn = conn.clone();
                let _: () = conn.hset(key, field, value).await?;
                Ok(())
            }
            Backend::Memory(bus) => {
                bus.hset(key, field, value);
                Ok(())
            }
            Backend::Disabled => Err(BrokerError::Unavailable),
        }
    }

    /// Remove a field from a hash.
    pub async fn hdel(&self, key: &str, field: &str) -> Result<(), BrokerError> {
        match &self.backend {
            Backend::Redis { conn, .. } => {
                let mut conn = conn.clone();
                let _: () = conn.hdel(key, field).await?;
                Ok(())
            }
            Backend::Memory(bus) => {
                bus.hdel(key, field);
                Ok(())
            }
            Backend::Disabled => Err(BrokerError::Unavailable),
        }
    }

    /// Fetch all fields of a hash. Missing keys yield an empty map.
    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, BrokerError> {
        match &self.backend {
            Backend::Redis { conn, .. } => {
                let mut conn = conn.clone();
                Ok(conn.hgetall(key).await?)
            }
            Backend::Memory(bus) => Ok(bus.hgetall(key)),
            Backend::Disabled => Err(BrokerError::Unavailable),
        }
    }

    /// Refresh the TTL on a key.
    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BrokerError> {
        match &self.backend {
            Backend::Redis { conn, .. } => {
                let mut conn = conn.clone();
                let _: () = conn.expire(key, ttl.as_secs() as i64).await?;
                Ok(())
            }
            Backend::Memory(bus) => {
                bus.expire(key, ttl);
                Ok(())
            }
            Backend::Disabled => Err(BrokerError::Unavailable),
        }
    }
}
