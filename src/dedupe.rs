//! Request deduplication
//!
//! Concurrent callers asking for the same key share a single execution of the
//! fetch function and all observe the same outcome, success or failure. The
//! entry is removed as soon as the fetch settles, so the next call after that
//! starts a new fetch. Nothing is cached.

use crate::error::{CacheError, Result};
use crate::metrics::CacheMetrics;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

type SharedFetch<T> = Shared<BoxFuture<'static, Result<T>>>;

/// An in-flight request, tagged so a settle step only removes its own entry
struct InFlight<T> {
    id: u64,
    shared: SharedFetch<T>,
}

type InFlightMap<T> = Arc<Mutex<HashMap<String, InFlight<T>>>>;

/// Remove `full_key` only if it still belongs to request `id`
fn remove_entry<T>(in_flight: &Mutex<HashMap<String, InFlight<T>>>, full_key: &str, id: u64) {
    let mut in_flight = in_flight.lock();
    if in_flight.get(full_key).map_or(false, |entry| entry.id == id) {
        in_flight.remove(full_key);
    }
}

/// Outcome of looking a key up in the in-flight map
enum Claim<T> {
    Joined(SharedFetch<T>),
    Started {
        id: u64,
        sender: oneshot::Sender<Result<T>>,
        shared: SharedFetch<T>,
    },
}

/// Drops a just-registered entry if `fetch` unwinds before returning its future
struct Registration<T> {
    in_flight: InFlightMap<T>,
    full_key: String,
    id: u64,
    armed: bool,
}

impl<T> Registration<T> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<T> Drop for Registration<T> {
    fn drop(&mut self) {
        if self.armed {
            remove_entry(&self.in_flight, &self.full_key, self.id);
        }
    }
}

/// Per-call options for [`RequestDeduplicator::dedupe`]
#[derive(Debug, Clone)]
pub struct DedupeOptions {
    /// Namespace segment prepended to the key
    pub prefix: String,
    /// How long callers wait before the shared request is abandoned
    pub timeout: Duration,
}

impl Default for DedupeOptions {
    fn default() -> Self {
        Self {
            prefix: "dedup".to_string(),
            timeout: Duration::from_millis(30_000),
        }
    }
}

impl DedupeOptions {
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Coalesces concurrent requests for the same key
///
/// Cloning shares the in-flight map.
pub struct RequestDeduplicator<T> {
    in_flight: InFlightMap<T>,
    next_id: Arc<AtomicU64>,
    metrics: Arc<CacheMetrics>,
    default_timeout: Duration,
}

impl<T> Clone for RequestDeduplicator<T> {
    fn clone(&self) -> Self {
        Self {
            in_flight: Arc::clone(&self.in_flight),
            next_id: Arc::clone(&self.next_id),
            metrics: Arc::clone(&self.metrics),
            default_timeout: self.default_timeout,
        }
    }
}

impl<T> RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(metrics: Arc<CacheMetrics>) -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
            metrics,
            default_timeout: DedupeOptions::default().timeout,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Options carrying this deduplicator's default timeout
    pub fn options(&self) -> DedupeOptions {
        DedupeOptions::default().timeout(self.default_timeout)
    }

    /// Run `fetch` for `key` unless a request for it is already in flight
    ///
    /// Late joiners never call their own `fetch`. When the timeout elapses
    /// every waiter receives [`CacheError::DeduplicationTimeout`]; the fetch
    /// itself keeps running detached and its result is discarded.
    ///
    /// The entry is registered before `fetch` is called and the in-flight lock
    /// is released first, so `fetch` may use this deduplicator.
    pub async fn dedupe<F, Fut>(&self, key: &str, fetch: F, options: &DedupeOptions) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let full_key = format!("{}:{}", options.prefix, key);

        let claim = {
            let mut in_flight = self.in_flight.lock();

            if let Some(existing) = in_flight.get(&full_key) {
                debug!("Deduplicated request: {}", full_key);
                self.metrics.record_dedupe(true);
                Claim::Joined(existing.shared.clone())
            } else {
                self.metrics.record_dedupe(false);
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (sender, receiver) = oneshot::channel();
                let shared = async move {
                    receiver.await.unwrap_or_else(|_| {
                        Err(CacheError::Other("Deduplicated fetch was abandoned".to_string()))
                    })
                }
                .boxed()
                .shared();
                in_flight.insert(
                    full_key.clone(),
                    InFlight {
                        id,
                        shared: shared.clone(),
                    },
                );
                Claim::Started { id, sender, shared }
            }
        };

        let (id, sender, shared) = match claim {
            Claim::Joined(shared) => return shared.await,
            Claim::Started { id, sender, shared } => (id, sender, shared),
        };

        let registration = Registration {
            in_flight: Arc::clone(&self.in_flight),
            full_key: full_key.clone(),
            id,
            armed: true,
        };
        let future = fetch();
        registration.disarm();

        self.start(id, full_key, future, options.timeout, sender);
        shared.await
    }

    /// Spawn the fetch and a settle step that clears the in-flight entry and
    /// publishes the outcome to every waiter
    fn start<Fut>(
        &self,
        id: u64,
        full_key: String,
        fetch: Fut,
        timeout: Duration,
        sender: oneshot::Sender<Result<T>>,
    ) where
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let in_flight = Arc::clone(&self.in_flight);
        let metrics = Arc::clone(&self.metrics);

        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(timeout, tokio::spawn(fetch)).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_error)) => Err(CacheError::Upstream(format!(
                    "Deduplicated fetch for {} panicked: {}",
                    full_key, join_error
                ))),
                Err(_) => {
                    warn!("Deduplicated request timed out: {}", full_key);
                    metrics.record_dedupe_timeout();
                    Err(CacheError::DeduplicationTimeout {
                        key: full_key.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
            };

            remove_entry(&in_flight, &full_key, id);
            let _ = sender.send(outcome);
        });
    }

    /// Number of requests currently in flight
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Full keys (`<prefix>:<key>`) of requests currently in flight
    pub fn in_flight_keys(&self) -> Vec<String> {
        self.in_flight.lock().keys().cloned().collect()
    }

    /// Forget every in-flight request
    ///
    /// Existing waiters still receive their outcome; new callers start fresh.
    pub fn clear(&self) {
        self.in_flight.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicU32;

    fn deduplicator() -> RequestDeduplicator<Value> {
        RequestDeduplicator::new(Arc::new(CacheMetrics::new()))
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let dedupe = deduplicator();
        let calls = Arc::new(AtomicU32::new(0));
        let options = DedupeOptions::default();

        let requests = (0..10).map(|_| {
            let calls = Arc::clone(&calls);
            let dedupe = dedupe.clone();
            let options = options.clone();
            async move {
                dedupe
                    .dedupe(
                        "species:1",
                        move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(json!({"id": 1}))
                        },
                        &options,
                    )
                    .await
            }
        });

        let results = join_all(requests).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap(), json!({"id": 1}));
        }
        assert_eq!(dedupe.in_flight_count(), 0);
        assert_eq!(dedupe.metrics.snapshot().dedupe_hits, 9);
    }

    #[tokio::test]
    async fn test_rejection_is_shared() {
        let dedupe = deduplicator();
        let calls = Arc::new(AtomicU32::new(0));
        let options = DedupeOptions::default();

        let make = |calls: Arc<AtomicU32>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err::<Value, _>(CacheError::upstream("502"))
            }
        };

        let (a, b) = tokio::join!(
            dedupe.dedupe("k", make(Arc::clone(&calls)), &options),
            dedupe.dedupe("k", make(Arc::clone(&calls)), &options),
        );

        assert_eq!(a.unwrap_err(), CacheError::Upstream("502".to_string()));
        assert_eq!(b.unwrap_err(), CacheError::Upstream("502".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dedupe.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_sequential_calls_fetch_again() {
        let dedupe = deduplicator();
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            dedupe
                .dedupe(
                    "k",
                    move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(json!(1))
                    },
                    &DedupeOptions::default(),
                )
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_prefix_separates_keys() {
        let dedupe = deduplicator();
        let calls = Arc::new(AtomicU32::new(0));

        let fetch = |calls: Arc<AtomicU32>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(json!(1))
            }
        };

        let a_opts = DedupeOptions::default().prefix("a");
        let b_opts = DedupeOptions::default().prefix("b");
        let (a, b) = tokio::join!(
            dedupe.dedupe("k", fetch(Arc::clone(&calls)), &a_opts),
            dedupe.dedupe("k", fetch(Arc::clone(&calls)), &b_opts),
        );

        assert!(a.is_ok() && b.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_timeout_rejects_waiters_and_clears_entry() {
        let dedupe = deduplicator();
        let options = DedupeOptions::default().timeout(Duration::from_millis(30));

        let result = dedupe
            .dedupe(
                "slow",
                || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(json!(1))
                },
                &options,
            )
            .await;

        assert!(matches!(
            result,
            Err(CacheError::DeduplicationTimeout { timeout_ms: 30, .. })
        ));
        assert_eq!(dedupe.in_flight_count(), 0);
        assert_eq!(dedupe.metrics.snapshot().dedupe_timeouts, 1);
    }

    #[tokio::test]
    async fn test_in_flight_introspection() {
        let dedupe = deduplicator();
        let options = DedupeOptions::default();

        let pending = {
            let dedupe = dedupe.clone();
            let options = options.clone();
            tokio::spawn(async move {
                dedupe
                    .dedupe(
                        "obs:1",
                        || async {
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok(json!(1))
                        },
                        &options,
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dedupe.in_flight_keys(), vec!["dedup:obs:1".to_string()]);

        dedupe.clear();
        assert_eq!(dedupe.in_flight_count(), 0);
        assert_eq!(pending.await.unwrap().unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_fetch_may_inspect_the_deduplicator() {
        let dedupe = deduplicator();
        let observer = dedupe.clone();

        let result = dedupe
            .dedupe(
                "obs:1",
                move || {
                    let in_flight = observer.in_flight_count();
                    async move { Ok(json!(in_flight)) }
                },
                &DedupeOptions::default(),
            )
            .await;

        assert_eq!(result.unwrap(), json!(1));
        assert_eq!(dedupe.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_panicking_fetch_closure_releases_key() {
        let dedupe = deduplicator();

        let caller = {
            let dedupe = dedupe.clone();
            tokio::spawn(async move {
                dedupe
                    .dedupe(
                        "obs:1",
                        || -> futures::future::Ready<Result<Value>> { panic!("bad closure") },
                        &DedupeOptions::default(),
                    )
                    .await
            })
        };

        assert!(caller.await.is_err());
        assert_eq!(dedupe.in_flight_count(), 0);

        let retry = dedupe
            .dedupe("obs:1", || async { Ok(json!(2)) }, &DedupeOptions::default())
            .await;
        assert_eq!(retry.unwrap(), json!(2));
    }
}
