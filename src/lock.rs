//! Distributed locks
//!
//! Leases are fencing tokens, not mutexes: every release and extension must
//! present the holder's token, and a lease whose TTL expired is lost — its
//! holder must not assume it still owns the resource. The in-memory store
//! covers single-instance deployments and tests; the Redis store (behind the
//! `redis` feature) covers horizontal scale.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::{CoreError, CoreResult};

/// Coordination-store operations every lease backend must provide.
///
/// `try_acquire` is atomic set-if-absent with TTL; `release` and `extend`
/// are compare-and-delete / compare-and-expire fenced by the holder token.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Returns the fencing token on success, `None` when the key is held.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> CoreResult<Option<String>>;

    /// Deletes the key only while it still holds `token`. Returns whether
    /// the delete happened.
    async fn release(&self, key: &str, token: &str) -> CoreResult<bool>;

    /// Pushes the expiry out by `ttl` only while the key still holds
    /// `token`. Returns whether the lease was still ours.
    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> CoreResult<bool>;
}

// ============================================================================
// In-memory lease store
// ============================================================================

#[derive(Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> CoreResult<Option<String>> {
        let mut leases = self.leases.lock().map_err(poisoned)?;
        let now = Instant::now();
        if let Some((_, expires)) = leases.get(key) {
            if *expires > now {
                return Ok(None);
            }
        }
        let token = Uuid::new_v4().to_string();
        leases.insert(key.to_string(), (token.clone(), now + ttl));
        Ok(Some(token))
    }

    async fn release(&self, key: &str, token: &str) -> CoreResult<bool> {
        let mut leases = self.leases.lock().map_err(poisoned)?;
        match leases.get(key) {
            Some((held, _)) if held == token => {
                leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> CoreResult<bool> {
        let mut leases = self.leases.lock().map_err(poisoned)?;
        match leases.get_mut(key) {
            Some((held, expires)) if held == token && *expires > Instant::now() => {
                *expires = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> CoreError {
    CoreError::Storage("lease store mutex poisoned".to_string())
}

// ============================================================================
// Lock manager
// ============================================================================

/// Lease acquisition, auto-extension and guaranteed release around critical
/// sections. Every store call is bounded by `lock.op_timeout_seconds`; a
/// timeout surfaces as `TransientUnavailable`.
pub struct LockManager {
    store: Arc<dyn LeaseStore>,
    config: LockConfig,
}

impl LockManager {
    pub fn new(store: Arc<dyn LeaseStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.config.default_ttl_seconds)
    }

    /// Run `fut` under the lease for `key` if it can be acquired right now;
    /// return `Ok(None)` when another holder has it (callers skip silently).
    pub async fn run_if_acquired<T, F>(
        &self,
        key: &str,
        ttl: Duration,
        fut: F,
    ) -> CoreResult<Option<T>>
    where
        F: Future<Output = CoreResult<T>>,
    {
        let token = match self.bounded(self.store.try_acquire(key, ttl)).await? {
            Some(token) => token,
            None => {
                debug!(key, "lease busy, skipping");
                return Ok(None);
            }
        };
        self.run_with_token(key, token, ttl, fut).await.map(Some)
    }

    /// Acquire the lease for `key` (waiting with jittered backoff up to
    /// `lock.wait_timeout_seconds`), then run `fut` under it.
    pub async fn with_lock_waiting<T, F>(&self, key: &str, fut: F) -> CoreResult<T>
    where
        F: Future<Output = CoreResult<T>>,
    {
        let ttl = self.default_ttl();
        let token = self
            .wait_for_lock(key, Duration::from_secs(self.config.wait_timeout_seconds))
            .await?;
        self.run_with_token(key, token, ttl, fut).await
    }

    /// Retry `try_acquire` with jittered backoff until `timeout` elapses.
    pub async fn wait_for_lock(&self, key: &str, timeout: Duration) -> CoreResult<String> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(token) = self
                .bounded(self.store.try_acquire(key, self.default_ttl()))
                .await?
            {
                return Ok(token);
            }
            if Instant::now() >= deadline {
                return Err(CoreError::TransientUnavailable(format!(
                    "lock wait timed out: {key}"
                )));
            }
            let jitter = rand::thread_rng().gen_range(25..75);
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }
    }

    /// Release a token acquired through `wait_for_lock`.
    pub async fn release(&self, key: &str, token: &str) -> CoreResult<bool> {
        self.bounded(self.store.release(key, token)).await
    }

    async fn run_with_token<T, F>(
        &self,
        key: &str,
        token: String,
        ttl: Duration,
        fut: F,
    ) -> CoreResult<T>
    where
        F: Future<Output = CoreResult<T>>,
    {
        // Watcher extends the lease at a quarter-TTL cadence and flags loss.
        let lost = CancellationToken::new();
        let watcher = {
            let store = Arc::clone(&self.store);
            let key = key.to_string();
            let token = token.clone();
            let lost = lost.clone();
            let interval = Duration::from_secs_f64(
                (ttl.as_secs_f64() * self.config.extend_interval_ratio).max(0.25),
            );
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    match store.extend(&key, &token, ttl).await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(key, "lease lost before extension");
                            lost.cancel();
                            return;
                        }
                        Err(err) => {
                            warn!(key, %err, "lease extension failed");
                            lost.cancel();
                            return;
                        }
                    }
                }
            })
        };

        tokio::pin!(fut);
        let result = tokio::select! {
            res = &mut fut => res,
            _ = lost.cancelled() => Err(CoreError::TransientUnavailable(format!(
                "lease lost mid-section: {key}"
            ))),
        };

        watcher.abort();
        match self.bounded(self.store.release(key, &token)).await {
            Ok(true) => {}
            Ok(false) => debug!(key, "lease already expired at release"),
            Err(err) => warn!(key, %err, "lease release failed"),
        }
        result
    }

    async fn bounded<T, F>(&self, fut: F) -> CoreResult<T>
    where
        F: Future<Output = CoreResult<T>>,
    {
        tokio::time::timeout(Duration::from_secs(self.config.op_timeout_seconds), fut)
            .await
            .map_err(|_| {
                CoreError::TransientUnavailable("coordination store timeout".to_string())
            })?
    }
}
