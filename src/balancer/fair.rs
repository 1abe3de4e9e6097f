//! # Fair balancer: shed load above a multiple of the cluster average.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::time::Instant;
use tracing::warn;

use crate::balancer::{Balancer, ClaimVerdict};
use crate::coordinator::BalancerContext;
use crate::error::CoordinatorError;
use crate::task::Task;

/// Default release threshold: 120% of the cluster average.
pub const DEFAULT_RELEASE_THRESHOLD: f64 = 1.2;

/// Cluster-wide view required by the [`FairBalancer`].
#[async_trait]
pub trait ClusterState: Send + Sync + 'static {
    /// Current number of claimed tasks per node.
    async fn node_task_count(&self) -> Result<HashMap<String, usize>, CoordinatorError>;
}

/// Releases randomly chosen tasks whenever this node holds more than
/// `threshold ×` the cluster-average task count.
///
/// After a balance run that released tasks, claims are rejected for one
/// second per released task so the shed work is not immediately reclaimed
/// by the same node.
pub struct FairBalancer {
    node_id: String,
    cluster: Arc<dyn ClusterState>,
    release_threshold: f64,

    ctx: OnceLock<Arc<dyn BalancerContext>>,
    delay: Mutex<Option<Instant>>,
}

impl FairBalancer {
    /// Creates a fair balancer with the default 120% release threshold.
    pub fn new(node_id: impl Into<String>, cluster: Arc<dyn ClusterState>) -> Self {
        Self::with_threshold(node_id, cluster, DEFAULT_RELEASE_THRESHOLD)
    }

    /// Creates a fair balancer with a custom release threshold.
    pub fn with_threshold(
        node_id: impl Into<String>,
        cluster: Arc<dyn ClusterState>,
        release_threshold: f64,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            cluster,
            release_threshold,
            ctx: OnceLock::new(),
            delay: Mutex::new(None),
        }
    }

    /// Desired maximum count for this node given current cluster counts.
    fn desired_count(&self, counts: &HashMap<String, usize>) -> usize {
        let total: usize = counts.values().sum();
        let avg = if counts.is_empty() {
            0
        } else {
            total / counts.len()
        };
        (avg as f64 * self.release_threshold).ceil() as usize
    }
}

#[async_trait]
impl Balancer for FairBalancer {
    fn init(&self, ctx: Arc<dyn BalancerContext>) {
        let _ = self.ctx.set(ctx);
    }

    async fn can_claim(&self, _task: &Task) -> ClaimVerdict {
        let delay = self.delay.lock().expect("delay lock poisoned");
        match *delay {
            // Still cooling down from the last release.
            Some(until) if until > Instant::now() => ClaimVerdict::DeferUntil(until),
            _ => ClaimVerdict::Accept,
        }
    }

    async fn balance(&self) -> Vec<String> {
        *self.delay.lock().expect("delay lock poisoned") = None;

        let Some(ctx) = self.ctx.get() else {
            return Vec::new();
        };
        let local = ctx.tasks();

        // A node holding a single task never rebalances.
        if local.len() < 2 {
            return Vec::new();
        }

        let counts = match self.cluster.node_task_count().await {
            Ok(counts) => counts,
            Err(err) => {
                warn!(error = %err, "error retrieving cluster state");
                return Vec::new();
            }
        };

        let held = counts.get(&self.node_id).copied().unwrap_or(0);
        let desired = self.desired_count(&counts);
        if held <= desired {
            return Vec::new();
        }
        let shed = held - desired;

        let mut ids: Vec<String> = local.into_iter().map(|t| t.id).collect();
        let mut rng = rand::rng();
        let (victims, _) = ids.partial_shuffle(&mut rng, shed);
        let release: Vec<String> = victims.to_vec();

        *self.delay.lock().expect("delay lock poisoned") =
            Some(Instant::now() + Duration::from_secs(release.len() as u64));
        release
    }
}
