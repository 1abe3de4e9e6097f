//! Ownership-marker bookkeeping: claim, refresh, release.
//!
//! A claim is a leaf `tasks/<id>/owner` created with a short TTL. For every
//! held claim a refresher task renews the marker at half the TTL; if a
//! renewal cannot land before the marker's deadline the claim is reported
//! lost through [`CoordinatorContext::lost`] and local bookkeeping is
//! dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::coordinator::CoordinatorContext;
use crate::error::StoreError;
use crate::kv::store::KeyStore;
use crate::kv::{OwnerValue, OWNER_KEY};

/// Pause between refresh retries within one deadline window.
const RETRY_PAUSE: Duration = Duration::from_millis(250);

struct ClaimsInner {
    store: Arc<dyn KeyStore>,
    task_path: String,
    node_id: String,
    claim_ttl: Duration,

    ctx: OnceLock<Arc<dyn CoordinatorContext>>,
    /// Per-claim cancellation for the refresher tasks.
    held: Mutex<HashMap<String, CancellationToken>>,
    stop: CancellationToken,
}

/// Tracks claims held by this node and keeps their markers alive.
#[derive(Clone)]
pub(crate) struct ClaimManager {
    inner: Arc<ClaimsInner>,
}

impl ClaimManager {
    pub(crate) fn new(
        store: Arc<dyn KeyStore>,
        task_path: String,
        node_id: String,
        claim_ttl: Duration,
        stop: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(ClaimsInner {
                store,
                task_path,
                node_id,
                claim_ttl,
                ctx: OnceLock::new(),
                held: Mutex::new(HashMap::new()),
                stop,
            }),
        }
    }

    pub(crate) fn set_ctx(&self, ctx: Arc<dyn CoordinatorContext>) {
        let _ = self.inner.ctx.set(ctx);
    }

    fn owner_key(&self, task_id: &str) -> String {
        format!("{}/{}/{}", self.inner.task_path, task_id, OWNER_KEY)
    }

    /// Attempts the exclusive claim; on success starts the marker
    /// refresher.
    pub(crate) async fn claim(&self, task_id: &str) -> bool {
        let owner_key = self.owner_key(task_id);
        let value = OwnerValue::json(&self.inner.node_id);

        match self
            .inner
            .store
            .create(&owner_key, &value, Some(self.inner.claim_ttl))
            .await
        {
            Ok(_) => {}
            Err(StoreError::AlreadyExists { .. }) => {
                debug!(task = %task_id, "task already claimed");
                return false;
            }
            Err(err) => {
                warn!(task = %task_id, error = %err, "claim attempt failed");
                return false;
            }
        }

        let token = CancellationToken::new();
        self.inner
            .held
            .lock()
            .expect("claims lock poisoned")
            .insert(task_id.to_string(), token.clone());

        self.spawn_refresher(task_id.to_string(), owner_key, token);
        true
    }

    fn spawn_refresher(&self, task_id: String, owner_key: String, token: CancellationToken) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let half = inner.claim_ttl / 2;
            loop {
                tokio::select! {
                    _ = inner.stop.cancelled() => return,
                    _ = token.cancelled() => return,
                    _ = sleep(half) => {}
                }

                // The marker must be renewed before its current TTL lapses.
                let deadline = Instant::now() + inner.claim_ttl;
                if !refresh_until(&inner, &owner_key, &token, deadline).await {
                    error!(task = %task_id, "could not refresh claim before deadline; lost");
                    inner
                        .held
                        .lock()
                        .expect("claims lock poisoned")
                        .remove(&task_id);
                    if let Some(ctx) = inner.ctx.get() {
                        ctx.lost(&task_id);
                    }
                    return;
                }
            }
        });
    }

    /// Stops refreshing and removes the marker (`done = false`) or the
    /// whole task subtree (`done = true`). Best effort: the marker's TTL is
    /// the backstop.
    pub(crate) async fn release(&self, task_id: &str, done: bool) {
        let token = self
            .inner
            .held
            .lock()
            .expect("claims lock poisoned")
            .remove(task_id);
        if let Some(token) = token {
            token.cancel();
        }

        if done {
            let task_key = format!("{}/{}", self.inner.task_path, task_id);
            match self.inner.store.delete(&task_key, true).await {
                Ok(_) | Err(StoreError::NotFound { .. }) => {}
                Err(err) => warn!(task = %task_id, error = %err, "error deleting finished task"),
            }
            return;
        }

        // Delete only a marker this node wrote; losing the race to a TTL
        // expiry plus reclaim must not evict the new owner.
        let owner_key = self.owner_key(task_id);
        let value = OwnerValue::json(&self.inner.node_id);
        match self.inner.store.compare_and_delete(&owner_key, &value).await {
            Ok(_) | Err(StoreError::NotFound { .. }) => {}
            Err(StoreError::CompareFailed { .. }) => {
                warn!(task = %task_id, "owner marker changed hands; leaving it")
            }
            Err(err) => warn!(task = %task_id, error = %err, "error releasing claim"),
        }
    }

    /// Cancels every refresher. Held markers are left to their TTLs; the
    /// consumer's shutdown releases tasks individually afterwards.
    pub(crate) fn shutdown(&self) {
        let mut held = self.inner.held.lock().expect("claims lock poisoned");
        for (_, token) in held.drain() {
            token.cancel();
        }
    }
}

/// Retries the refresh until it lands or the deadline passes. Returns true
/// on success or when the claim was concurrently released.
async fn refresh_until(
    inner: &ClaimsInner,
    owner_key: &str,
    token: &CancellationToken,
    deadline: Instant,
) -> bool {
    loop {
        if inner.stop.is_cancelled() || token.is_cancelled() {
            return true;
        }
        match inner.store.refresh(owner_key, inner.claim_ttl).await {
            Ok(_) => return true,
            Err(StoreError::NotFound { .. }) => {
                // Marker vanished underneath us: expired or externally
                // deleted.
                return false;
            }
            Err(err) => {
                warn!(key = %owner_key, error = %err, "claim refresh error");
                if Instant::now() + RETRY_PAUSE >= deadline {
                    return false;
                }
                sleep(RETRY_PAUSE).await;
            }
        }
    }
}
