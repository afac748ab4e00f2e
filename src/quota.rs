use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, warn};

use crate::error::StoreError;
use crate::kv::{KvBackend, MemoryBackend};
use crate::models::UsageCounter;

fn counter_key(user_id: i64) -> String {
    format!("user_requests:{user_id}:daily")
}

/// Per-user request counters over a rolling window that starts at the first
/// increment. Backend failures never reach the caller: the operation is
/// served from a process-local fallback instead.
pub struct QuotaStore {
    backend: Arc<dyn KvBackend>,
    fallback: MemoryBackend,
    window: Duration,
}

impl QuotaStore {
    pub fn new(backend: Arc<dyn KvBackend>, window: Duration) -> Self {
        Self {
            backend,
            fallback: MemoryBackend::new(),
            window,
        }
    }

    fn degraded(&self, op: &'static str, user_id: i64, err: &StoreError) {
        warn!(
            backend = self.backend.name(),
            op,
            user_id,
            error = %err,
            "quota backend unavailable, using in-process fallback (degraded mode)"
        );
    }

    pub async fn daily_count(&self, user_id: i64) -> u64 {
        let key = counter_key(user_id);
        let raw = match self.backend.get(&key).await {
            Ok(v) => v,
            Err(e) => {
                self.degraded("get", user_id, &e);
                self.fallback.get(&key).await.ok().flatten()
            }
        };
        match raw.map(|v| v.parse::<u64>()) {
            None => 0,
            Some(Ok(count)) => count,
            Some(Err(e)) => {
                error!(user_id, error = %e, "quota counter holds a non-numeric value, treating as 0");
                0
            }
        }
    }

    pub async fn increment(&self, user_id: i64) {
        let key = counter_key(user_id);
        let count = match self.backend.incr_with_expiry(&key, self.window).await {
            Ok(count) => count,
            Err(e) => {
                self.degraded("incr", user_id, &e);
                match self.fallback.incr_with_expiry(&key, self.window).await {
                    Ok(count) => count,
                    Err(e) => {
                        error!(user_id, error = %e, "fallback quota increment failed");
                        return;
                    }
                }
            }
        };
        debug!(user_id, count, "quota counter incremented");
    }

    pub async fn usage(&self, user_id: i64) -> UsageCounter {
        let count = self.daily_count(user_id).await;
        let key = counter_key(user_id);
        let ttl = match self.backend.ttl(&key).await {
            Ok(ttl) => ttl,
            Err(e) => {
                self.degraded("ttl", user_id, &e);
                self.fallback.ttl(&key).await.ok().flatten()
            }
        };
        let reset_at = ttl
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| Utc::now() + d);
        UsageCounter {
            user_id,
            count,
            reset_at,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use async_trait::async_trait;

    use super::*;

    const DAY: Duration = Duration::from_secs(24 * 3600);

    /// Backend whose every call fails, as when Redis goes away mid-run.
    pub(crate) struct UnreachableBackend;

    fn unreachable() -> StoreError {
        StoreError::Redis(redis::RedisError::from((
            redis::ErrorKind::IoError,
            "connection refused",
        )))
    }

    #[async_trait]
    impl KvBackend for UnreachableBackend {
        fn name(&self) -> &'static str {
            "unreachable"
        }
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(unreachable())
        }
        async fn set_ex(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), StoreError> {
            Err(unreachable())
        }
        async fn incr_with_expiry(&self, _key: &str, _ttl: Duration) -> Result<u64, StoreError> {
            Err(unreachable())
        }
        async fn ttl(&self, _key: &str) -> Result<Option<Duration>, StoreError> {
            Err(unreachable())
        }
    }

    #[tokio::test]
    async fn fresh_user_has_zero_count() {
        let quota = QuotaStore::new(Arc::new(MemoryBackend::new()), DAY);
        assert_eq!(quota.daily_count(7).await, 0);
        let usage = quota.usage(7).await;
        assert_eq!(usage.count, 0);
        assert_eq!(usage.reset_at, None);
    }

    #[tokio::test]
    async fn counter_resets_after_rolling_window() {
        let window = Duration::from_millis(300);
        let quota = QuotaStore::new(Arc::new(MemoryBackend::new()), window);
        quota.increment(7).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        quota.increment(7).await;
        assert_eq!(quota.daily_count(7).await, 2);

        // window counts from the first increment, not the last
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(quota.daily_count(7).await, 0);
    }

    #[tokio::test]
    async fn counters_are_per_user() {
        let quota = QuotaStore::new(Arc::new(MemoryBackend::new()), DAY);
        quota.increment(1).await;
        assert_eq!(quota.daily_count(1).await, 1);
        assert_eq!(quota.daily_count(2).await, 0);
    }

    #[tokio::test]
    async fn fails_open_to_fallback() {
        let quota = QuotaStore::new(Arc::new(UnreachableBackend), DAY);
        assert_eq!(quota.daily_count(7).await, 0);
        quota.increment(7).await;
        assert_eq!(quota.daily_count(7).await, 1);
        assert!(quota.usage(7).await.reset_at.is_some());
    }

    #[tokio::test]
    async fn fallback_counters_are_evicted_after_window() {
        let window = Duration::from_millis(500);
        let quota = QuotaStore::new(Arc::new(UnreachableBackend), window);
        for user_id in 0..1000 {
            quota.increment(user_id).await;
        }
        assert_eq!(quota.fallback.resident_entries().await, 1000);

        // eviction runs on a coarse timer wheel, not at the exact deadline
        tokio::time::sleep(window + Duration::from_millis(2500)).await;
        assert_eq!(quota.fallback.resident_entries().await, 0);
        assert_eq!(quota.daily_count(1).await, 0);
    }
}
