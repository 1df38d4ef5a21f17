//! Tracked background work
//!
//! Revalidations and prefetches are detached from the request that triggered
//! them. [`BackgroundTasks`] counts them so shutdown and tests can wait for
//! the system to go quiet, and [`KeyGuard`] releases a per-key claim when the
//! task finishes, including when it panics.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct Inner {
    outstanding: AtomicUsize,
    idle: Notify,
}

/// Registry of detached tasks; clones share the same count
#[derive(Debug, Clone, Default)]
pub struct BackgroundTasks {
    inner: Arc<Inner>,
}

struct Outstanding(Arc<Inner>);

impl Drop for Outstanding {
    fn drop(&mut self) {
        if self.0.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` on the runtime and track it until it completes
    pub fn spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        let guard = Outstanding(Arc::clone(&self.inner));

        tokio::spawn(async move {
            let _guard = guard;
            task.await;
        })
    }

    /// Number of tasks that have not finished yet
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Wait until no tracked task is running
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait until idle or until `timeout` elapses; returns whether idle was reached
    pub async fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_idle()).await.is_ok()
    }
}

/// Set of keys with work in progress, shared between a service and its tasks
pub type KeySet = Arc<Mutex<HashSet<String>>>;

/// Claim on a key in a [`KeySet`], released on drop
#[derive(Debug)]
pub struct KeyGuard {
    keys: KeySet,
    key: String,
}

impl KeyGuard {
    /// Claim `key`, or return `None` if it is already claimed
    pub fn try_claim(keys: &KeySet, key: &str) -> Option<Self> {
        if keys.lock().insert(key.to_string()) {
            Some(Self {
                keys: Arc::clone(keys),
                key: key.to_string(),
            })
        } else {
            None
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.keys.lock().remove(&self.key);
    }
}
