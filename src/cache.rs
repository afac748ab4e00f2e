use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tracing::{debug, warn};

use crate::kv::KvBackend;
use crate::models::ContentSource;

fn cache_key(fingerprint: &str) -> String {
    format!("cache:{fingerprint}")
}

/// Upper bound on fingerprints being filled at the same time.
const MAX_PENDING_FILLS: u64 = 10_000;

/// Generated text keyed by prompt fingerprint, with a fixed time to live.
/// An unavailable backend behaves like an empty cache.
pub struct ContentCache {
    backend: Arc<dyn KvBackend>,
    ttl: Duration,
    /// Coalesces concurrent misses on one fingerprint into a single fill.
    /// Entries only live while a fill is being handed out.
    fills: Cache<String, (String, ContentSource)>,
}

impl ContentCache {
    pub fn new(backend: Arc<dyn KvBackend>, ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            fills: Cache::builder().max_capacity(MAX_PENDING_FILLS).build(),
        }
    }

    pub async fn get(&self, fingerprint: &str) -> Option<String> {
        match self.backend.get(&cache_key(fingerprint)).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(backend = self.backend.name(), error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    pub async fn put(&self, fingerprint: &str, content: &str) {
        match self.backend.set_ex(&cache_key(fingerprint), content, self.ttl).await {
            Ok(()) => debug!(fingerprint, "content cached"),
            Err(e) => warn!(backend = self.backend.name(), error = %e, "cache write failed, skipping"),
        }
    }

    /// Cached content for `fingerprint`, or the result of `fill`, which is
    /// stored before being returned. Identical concurrent calls share one
    /// `fill`; a failed fill is shared too and nothing is stored.
    pub async fn get_or_fill<F, E>(&self, fingerprint: &str, fill: F) -> Result<(String, ContentSource), Arc<E>>
    where
        F: Future<Output = Result<String, E>>,
        E: Send + Sync + 'static,
    {
        let loaded = self
            .fills
            .try_get_with(fingerprint.to_string(), async move {
                if let Some(hit) = self.get(fingerprint).await {
                    return Ok((hit, ContentSource::CacheHit));
                }
                let content = fill.await?;
                self.put(fingerprint, &content).await;
                Ok((content, ContentSource::Generated))
            })
            .await;
        // the backend holds the content from here on, with its own TTL
        self.fills.invalidate(fingerprint).await;
        loaded
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::kv::MemoryBackend;
    use crate::quota::tests::UnreachableBackend;

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn hit_within_ttl_miss_after() {
        let ttl = Duration::from_millis(80);
        let cache = ContentCache::new(Arc::new(MemoryBackend::new()), ttl);
        cache.put("fp", "text").await;
        assert_eq!(cache.get("fp").await.as_deref(), Some("text"));

        tokio::time::sleep(ttl * 2).await;
        assert_eq!(cache.get("fp").await, None);
    }

    #[tokio::test]
    async fn last_writer_wins() {
        let cache = ContentCache::new(Arc::new(MemoryBackend::new()), HOUR);
        cache.put("fp", "first").await;
        cache.put("fp", "second").await;
        assert_eq!(cache.get("fp").await.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn unavailable_backend_is_always_miss() {
        let cache = ContentCache::new(Arc::new(UnreachableBackend), HOUR);
        cache.put("fp", "text").await;
        assert_eq!(cache.get("fp").await, None);
    }

    #[tokio::test]
    async fn fill_then_hit() {
        let cache = ContentCache::new(Arc::new(MemoryBackend::new()), HOUR);

        let first = cache
            .get_or_fill("fp", async { Ok::<_, String>("fresh".to_string()) })
            .await
            .unwrap();
        assert_eq!(first, ("fresh".to_string(), ContentSource::Generated));

        let second = cache
            .get_or_fill("fp", async { Err::<String, _>("must not run".to_string()) })
            .await
            .unwrap();
        assert_eq!(second, ("fresh".to_string(), ContentSource::CacheHit));
    }

    #[tokio::test]
    async fn concurrent_fills_share_one_call() {
        let cache = Arc::new(ContentCache::new(Arc::new(MemoryBackend::new()), HOUR));
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_fill("fp", async {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(30)).await;
                            Ok::<_, String>("generated once".to_string())
                        })
                        .await
                })
            })
            .collect();

        for t in tasks {
            assert_eq!(t.await.unwrap().unwrap().0, "generated once");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_fill_stores_nothing() {
        let cache = ContentCache::new(Arc::new(MemoryBackend::new()), HOUR);
        let err = cache
            .get_or_fill("fp", async { Err::<String, _>("provider down".to_string()) })
            .await
            .unwrap_err();
        assert_eq!(err.as_str(), "provider down");
        assert_eq!(cache.get("fp").await, None);
    }
}
