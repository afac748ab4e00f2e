use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use moka::ops::compute::{CompResult, Op};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tracing::info;

use crate::error::StoreError;

/// Minimal key-value capability shared by the quota store and the content cache.
#[async_trait]
pub trait KvBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store `value` under `key`, replacing any previous value and expiry.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Increment a counter and return the new value. The expiry is set only
    /// when the key has none, so it is never pushed back by later increments.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Remaining time to live, `None` for missing keys or keys without expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;
}

/// INCR and EXPIRE in one step, so a crash between them cannot leave a
/// counter that never resets.
const INCR_WITH_EXPIRY_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if redis.call('TTL', KEYS[1]) == -1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

pub struct RedisBackend {
    conn: MultiplexedConnection,
    incr_script: redis::Script,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("connected to Redis");
        Ok(Self {
            conn,
            incr_script: redis::Script::new(INCR_WITH_EXPIRY_SCRIPT),
        })
    }
}

#[async_trait]
impl KvBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let count: u64 = self
            .incr_script
            .key(key)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.conn.clone();
        let remaining: i64 = conn.ttl(key).await?;
        Ok(u64::try_from(remaining).ok().map(Duration::from_secs))
    }
}

const MEMORY_CAPACITY: u64 = 100_000;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// Each entry lives until its own deadline. Counter increments carry the
/// deadline over, so the window stays anchored at the first increment.
struct DeadlineExpiry;

impl Expiry<String, Entry> for DeadlineExpiry {
    fn expire_after_create(&self, _key: &String, value: &Entry, created_at: Instant) -> Option<Duration> {
        Some(value.expires_at.saturating_duration_since(created_at))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.expires_at.saturating_duration_since(updated_at))
    }
}

/// Process-local backend. Volatile: everything is lost on restart. Expired
/// entries are evicted by the cache itself.
#[derive(Clone)]
pub struct MemoryBackend {
    entries: Cache<String, Entry>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(MEMORY_CAPACITY)
                .expire_after(DeadlineExpiry)
                .build(),
        }
    }

    #[cfg(test)]
    pub async fn resident_entries(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).await.map(|entry| entry.value))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.entries
            .insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: Instant::now() + ttl,
                },
            )
            .await;
        Ok(())
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let result = self
            .entries
            .entry(key.to_string())
            .and_try_compute_with(|current| async move {
                let next = match current.map(|e| e.into_value()) {
                    Some(entry) => {
                        let count: u64 = entry.value.parse().map_err(|_| StoreError::NotACounter {
                            key: key.to_string(),
                            value: entry.value.clone(),
                        })?;
                        Entry {
                            value: (count + 1).to_string(),
                            expires_at: entry.expires_at,
                        }
                    }
                    None => Entry {
                        value: "1".to_string(),
                        expires_at: Instant::now() + ttl,
                    },
                };
                Ok::<_, StoreError>(Op::Put(next))
            })
            .await?;

        let entry = match result {
            CompResult::Inserted(e) | CompResult::ReplacedWith(e) | CompResult::Unchanged(e) => e.into_value(),
            CompResult::Removed(_) | CompResult::StillNone(_) => {
                return Err(StoreError::NotACounter {
                    key: key.to_string(),
                    value: String::new(),
                });
            }
        };
        entry.value.parse().map_err(|_| StoreError::NotACounter {
            key: key.to_string(),
            value: entry.value,
        })
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .await
            .map(|entry| entry.expires_at.saturating_duration_since(now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);
    const SHORT: Duration = Duration::from_millis(80);

    #[tokio::test]
    async fn memory_values_expire() {
        let kv = MemoryBackend::new();
        kv.set_ex("k", "v", SHORT).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(SHORT * 2).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_replaces_value_and_expiry() {
        let kv = MemoryBackend::new();
        kv.set_ex("k", "first", SHORT).await.unwrap();
        kv.set_ex("k", "second", HOUR).await.unwrap();

        tokio::time::sleep(SHORT * 2).await;
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn memory_incr_keeps_first_expiry() {
        let window = Duration::from_millis(300);
        let kv = MemoryBackend::new();
        assert_eq!(kv.incr_with_expiry("c", window).await.unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(kv.incr_with_expiry("c", window).await.unwrap(), 2);
        let remaining = kv.ttl("c").await.unwrap().unwrap();
        assert!(remaining <= Duration::from_millis(150), "window moved: {remaining:?}");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(kv.get("c").await.unwrap(), None);
        assert_eq!(kv.incr_with_expiry("c", window).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_key_has_no_ttl() {
        let kv = MemoryBackend::new();
        assert_eq!(kv.ttl("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_incr_rejects_non_counter() {
        let kv = MemoryBackend::new();
        kv.set_ex("c", "hello", HOUR).await.unwrap();
        assert!(matches!(
            kv.incr_with_expiry("c", HOUR).await,
            Err(StoreError::NotACounter { .. })
        ));
        assert_eq!(kv.get("c").await.unwrap().as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let kv = MemoryBackend::new();
        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let kv = kv.clone();
                tokio::spawn(async move { kv.incr_with_expiry("c", HOUR).await.unwrap() })
            })
            .collect();
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(kv.get("c").await.unwrap().as_deref(), Some("50"));
    }

    /// Runs against a real server when `PAMPHLET_TEST_REDIS_URL` is set.
    #[tokio::test]
    async fn redis_counter_always_gets_expiry() {
        let Ok(url) = std::env::var("PAMPHLET_TEST_REDIS_URL") else {
            return;
        };
        let kv = RedisBackend::connect(&url).await.unwrap();
        let key = format!("pamphlet-test:{}", uuid::Uuid::new_v4());

        // a counter left without expiry by an earlier crash is repaired
        let mut conn = kv.conn.clone();
        let _: () = conn.set(&key, 5).await.unwrap();
        assert_eq!(kv.incr_with_expiry(&key, HOUR).await.unwrap(), 6);
        let remaining = kv.ttl(&key).await.unwrap().unwrap();
        assert!(remaining > Duration::from_secs(3500));

        let _: () = conn.del(&key).await.unwrap();
    }
}
