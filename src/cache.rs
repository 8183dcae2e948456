//! TTL-capable key-value store shared by every node.
//!
//! `RedisStore` is the production backend. `MemoryStore` keeps the same
//! semantics in process and backs the test suite and single-node runs.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::RwLock;

use crate::error::{AppError, Result};

/// Operations the session store and rate limiter need from the shared cache.
///
/// Every call is a network round trip in production; implementations bound
/// each one by a latency budget and surface a timeout as an error.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Stores `value` with a TTL in whole seconds (minimum 1).
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Like [`set_ex`](Self::set_ex) but only overwrites a key that still
    /// exists. Returns `false`, writing nothing, when the key is gone.
    async fn set_ex_existing(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn del(&self, key: &str) -> Result<()>;

    /// Refreshes the TTL of an existing key. Returns `false` when the key is gone.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn set_add(&self, key: &str, member: &str) -> Result<()>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<()>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Increments a counter, starting its window on the first hit. A counter
    /// found without a TTL gets the window re-armed.
    /// Returns the new value and the remaining window in seconds.
    async fn incr_window(&self, key: &str, window: Duration) -> Result<(u64, u64)>;
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Redis-backed store.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
    timeout: Duration,
}

impl RedisStore {
    /// Opens a pooled connection manager to `url`.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let redis = ConnectionManager::new(client).await?;
        tracing::info!("✅ Redis Connection Manager initialized (pooled)");
        Ok(Self { redis, timeout })
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(AppError::from),
            Err(_) => {
                tracing::error!("❌ Redis {} exceeded {:?}", op, self.timeout);
                Err(AppError::Store(format!("{} timed out", op)))
            }
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.redis.clone();
        self.bounded("GET", conn.get(key)).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.redis.clone();
        self.bounded("SETEX", conn.set_ex(key, value, ttl_secs(ttl))).await
    }

    async fn set_ex_existing(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.redis.clone();
        let reply: Option<String> = self
            .bounded(
                "SET XX",
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("EX")
                    .arg(ttl_secs(ttl))
                    .arg("XX")
                    .query_async(&mut conn),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        self.bounded("DEL", conn.del(key)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.redis.clone();
        self.bounded("EXPIRE", conn.expire(key, ttl_secs(ttl) as i64)).await
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        self.bounded("SADD", conn.sadd(key, member)).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        self.bounded("SREM", conn.srem(key, member)).await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.redis.clone();
        self.bounded("SMEMBERS", conn.smembers(key)).await
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<(u64, u64)> {
        let mut conn = self.redis.clone();
        let window_secs = ttl_secs(window);

        // EXPIRE NX (Redis 7+) arms the window once and repairs a counter
        // whose expiry was lost, in the same transaction as the INCR.
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("EXPIRE")
            .arg(key)
            .arg(window_secs)
            .arg("NX")
            .ignore()
            .cmd("TTL")
            .arg(key);
        let (count, ttl): (u64, i64) = self
            .bounded("INCR window", pipe.query_async(&mut conn))
            .await?;

        let remaining = if ttl > 0 { ttl as u64 } else { window_secs };
        Ok((count, remaining))
    }
}

#[derive(Debug, Clone)]
enum Entry {
    Value(String),
    Set(HashSet<String>),
    Counter(u64),
}

#[derive(Debug, Clone)]
struct Slot {
    entry: Entry,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-process store with lazy TTL expiry.
#[derive(Clone, Default)]
pub struct MemoryStore {
    slots: Arc<RwLock<HashMap<String, Slot>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys, used by tests to assert on storage layout.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.slots.read().await.values().filter(|s| s.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let slots = self.slots.read().await;
        match slots.get(key) {
            Some(slot) if slot.is_live(now) => match &slot.entry {
                Entry::Value(v) => Ok(Some(v.clone())),
                Entry::Counter(c) => Ok(Some(c.to_string())),
                Entry::Set(_) => Err(AppError::Store(format!("{} holds a set", key))),
            },
            _ => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut slots = self.slots.write().await;
        slots.insert(
            key.to_string(),
            Slot {
                entry: Entry::Value(value.to_string()),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs(ttl))),
            },
        );
        Ok(())
    }

    async fn set_ex_existing(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut slots = self.slots.write().await;
        match slots.get_mut(key) {
            Some(slot) if slot.is_live(now) => {
                *slot = Slot {
                    entry: Entry::Value(value.to_string()),
                    expires_at: Some(now + Duration::from_secs(ttl_secs(ttl))),
                };
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.slots.write().await.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut slots = self.slots.write().await;
        match slots.get_mut(key) {
            Some(slot) if slot.is_live(now) => {
                slot.expires_at = Some(now + Duration::from_secs(ttl_secs(ttl)));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let now = Instant::now();
        let mut slots = self.slots.write().await;
        let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
            entry: Entry::Set(HashSet::new()),
            expires_at: None,
        });
        if !slot.is_live(now) {
            *slot = Slot {
                entry: Entry::Set(HashSet::new()),
                expires_at: None,
            };
        }
        match &mut slot.entry {
            Entry::Set(members) => {
                members.insert(member.to_string());
                Ok(())
            }
            _ => Err(AppError::Store(format!("{} is not a set", key))),
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut slots = self.slots.write().await;
        let drained = match slots.get_mut(key) {
            Some(Slot {
                entry: Entry::Set(members),
                ..
            }) => {
                members.remove(member);
                members.is_empty()
            }
            _ => false,
        };
        if drained {
            slots.remove(key);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let slots = self.slots.read().await;
        match slots.get(key) {
            Some(slot) if slot.is_live(now) => match &slot.entry {
                Entry::Set(members) => Ok(members.iter().cloned().collect()),
                _ => Err(AppError::Store(format!("{} is not a set", key))),
            },
            _ => Ok(Vec::new()),
        }
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<(u64, u64)> {
        let now = Instant::now();
        let mut slots = self.slots.write().await;
        let window_secs = ttl_secs(window);

        let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
            entry: Entry::Counter(0),
            expires_at: Some(now + Duration::from_secs(window_secs)),
        });
        if !slot.is_live(now) {
            *slot = Slot {
                entry: Entry::Counter(0),
                expires_at: Some(now + Duration::from_secs(window_secs)),
            };
        }
        if slot.expires_at.is_none() {
            slot.expires_at = Some(now + Duration::from_secs(window_secs));
        }

        let count = match &mut slot.entry {
            Entry::Counter(c) => {
                *c += 1;
                *c
            }
            _ => return Err(AppError::Store(format!("{} is not a counter", key))),
        };

        let remaining = slot
            .expires_at
            .map(|at| at.saturating_duration_since(now).as_secs().max(1))
            .unwrap_or(window_secs);

        Ok((count, remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_membership_survives_until_last_member_removed() {
        let store = MemoryStore::new();
        store.set_add("s", "a").await.unwrap();
        store.set_add("s", "b").await.unwrap();
        store.set_remove("s", "a").await.unwrap();

        assert_eq!(store.set_members("s").await.unwrap(), vec!["b".to_string()]);

        store.set_remove("s", "b").await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn counter_window_counts_up() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(60);

        assert_eq!(store.incr_window("c", window).await.unwrap().0, 1);
        assert_eq!(store.incr_window("c", window).await.unwrap().0, 2);
        let (count, remaining) = store.incr_window("c", window).await.unwrap();
        assert_eq!(count, 3);
        assert!(remaining <= 60 && remaining >= 1);
    }

    #[tokio::test]
    async fn counter_without_expiry_gets_window_rearmed() {
        let store = MemoryStore::new();
        store.slots.write().await.insert(
            "stuck".to_string(),
            Slot {
                entry: Entry::Counter(7),
                expires_at: None,
            },
        );

        let (count, remaining) = store
            .incr_window("stuck", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(count, 8);
        assert!(remaining >= 1 && remaining <= 60);
        assert!(store.slots.read().await["stuck"].expires_at.is_some());
    }

    #[tokio::test]
    async fn conditional_write_never_recreates_a_deleted_key() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(30);

        assert!(!store.set_ex_existing("gone", "v", ttl).await.unwrap());
        assert_eq!(store.get("gone").await.unwrap(), None);

        store.set_ex("k", "v1", ttl).await.unwrap();
        assert!(store.set_ex_existing("k", "v2", ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));

        store.del("k").await.unwrap();
        assert!(!store.set_ex_existing("k", "v3", ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expire_reports_missing_keys() {
        let store = MemoryStore::new();
        assert!(!store.expire("missing", Duration::from_secs(5)).await.unwrap());

        store.set_ex("k", "v", Duration::from_secs(5)).await.unwrap();
        assert!(store.expire("k", Duration::from_secs(10)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }
}
