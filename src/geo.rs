//! Geo resolver contract (spec §4.5). The core only specifies the
//! interface; implementations may cache and rate-limit as they see fit.
//! No lookup may block the tick indefinitely.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use anyhow::Result;
use futures::{FutureExt, future::BoxFuture};

#[derive(Clone, Debug, PartialEq)]
pub struct GeoInfo {
    pub lat: f64,
    pub lng: f64,
    pub city: String,
    pub country: String,
    pub isp: String,
}

pub trait GeoResolver: Send + Sync {
    fn lookup(&self, ip: &str) -> BoxFuture<'_, Result<Option<GeoInfo>>>;
}

struct CacheEntry {
    value: Option<GeoInfo>,
    expires_at: Instant,
}

/// Wraps any [`GeoResolver`] with an in-process TTL cache, the way the
/// media adapters wrap a raw `reqwest::Client` behind a typed one. A
/// reasonable default for the "implementations may cache" clause rather
/// than a mandated one.
pub struct CachingResolver<R> {
    inner: R,
    ttl: Duration,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl<R: GeoResolver> CachingResolver<R> {
    pub fn new(inner: R, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl<R: GeoResolver> GeoResolver for CachingResolver<R> {
    fn lookup(&self, ip: &str) -> BoxFuture<'_, Result<Option<GeoInfo>>> {
        async move {
            if let Some(entry) = self.cache.lock().unwrap().get(ip) {
                if entry.expires_at > Instant::now() {
                    return Ok(entry.value.clone());
                }
            }

            let value = self.inner.lookup(ip).await?;
            self.cache.lock().unwrap().insert(
                ip.to_string(),
                CacheEntry {
                    value: value.clone(),
                    expires_at: Instant::now() + self.ttl,
                },
            );
            Ok(value)
        }
        .boxed()
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Counting {
        calls: AtomicUsize,
        value: GeoInfo,
    }

    impl GeoResolver for Counting {
        fn lookup(&self, _ip: &str) -> BoxFuture<'_, Result<Option<GeoInfo>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let value = self.value.clone();
            async move { Ok(Some(value)) }.boxed()
        }
    }

    #[tokio::test]
    async fn caches_within_ttl() {
        let inner = Counting {
            calls: AtomicUsize::new(0),
            value: GeoInfo {
                lat: 1.0,
                lng: 1.0,
                city: "Testville".into(),
                country: "US".into(),
                isp: "Testnet".into(),
            },
        };
        let resolver = CachingResolver::new(inner, Duration::from_secs(60));
        resolver.lookup("1.2.3.4").await.unwrap();
        resolver.lookup("1.2.3.4").await.unwrap();
        assert_eq!(resolver.inner.calls.load(Ordering::SeqCst), 1);
    }
}
