//! # Resource balancer: gate claims and releases on a reported resource.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tracing::info;

use crate::balancer::{Balancer, ClaimVerdict};
use crate::coordinator::BalancerContext;
use crate::error::ConsumerError;
use crate::task::Task;

/// Reports the resource the [`ResourceBalancer`] balances on.
pub trait ResourceReporter: Send + Sync + 'static {
    /// Amount of the resource in use and the total available.
    fn used(&self) -> (u64, u64);

    /// Unit the resource is reported in, for logs.
    fn unit(&self) -> &str;
}

/// Two-threshold balancer driven by a [`ResourceReporter`].
///
/// Above the claim limit no new work is claimed; above the release limit
/// the oldest task not already stopping is shed. Below the claim limit,
/// claims are still delayed by the usage percentage in milliseconds so
/// less-loaded nodes win races.
pub struct ResourceBalancer {
    reporter: Arc<dyn ResourceReporter>,
    claim_limit: u32,
    release_limit: u32,

    ctx: OnceLock<Arc<dyn BalancerContext>>,
}

impl ResourceBalancer {
    /// Creates a resource balancer.
    ///
    /// Limits are percentages between 1 and 100 inclusive, and the claim
    /// limit must be below the release limit (otherwise claims would
    /// continue just to have the work rebalanced).
    pub fn new(
        reporter: Arc<dyn ResourceReporter>,
        claim_limit: u32,
        release_limit: u32,
    ) -> Result<Self, ConsumerError> {
        let valid = (1..=100).contains(&claim_limit)
            && (1..=100).contains(&release_limit)
            && claim_limit < release_limit;
        if !valid {
            return Err(ConsumerError::InvalidLimits {
                claim: claim_limit,
                release: release_limit,
            });
        }

        Ok(Self {
            reporter,
            claim_limit,
            release_limit,
            ctx: OnceLock::new(),
        })
    }

    fn usage_percent(&self) -> u32 {
        let (used, total) = self.reporter.used();
        if total == 0 {
            return 100;
        }
        ((used as f64 / total as f64) * 100.0) as u32
    }
}

#[async_trait]
impl Balancer for ResourceBalancer {
    fn init(&self, ctx: Arc<dyn BalancerContext>) {
        let _ = self.ctx.set(ctx);
    }

    async fn can_claim(&self, _task: &Task) -> ClaimVerdict {
        let usage = self.usage_percent();
        if usage >= self.claim_limit {
            let until =
                Instant::now() + Duration::from_millis(u64::from(100 + usage - self.claim_limit));
            info!(
                usage,
                limit = self.claim_limit,
                unit = self.reporter.unit(),
                "over the claim limit; deferring"
            );
            return ClaimVerdict::DeferUntil(until);
        }

        // Handicap claims by current usage to give less loaded nodes a
        // head start.
        sleep(Duration::from_millis(u64::from(usage))).await;
        ClaimVerdict::Accept
    }

    async fn balance(&self) -> Vec<String> {
        let usage = self.usage_percent();
        if usage < self.release_limit {
            return Vec::new();
        }

        let Some(ctx) = self.ctx.get() else {
            return Vec::new();
        };

        // Shed the oldest task that isn't already stopping; young tasks are
        // the cheapest to move but rebalancing them repeatedly churns the
        // cluster.
        let oldest = ctx
            .tasks()
            .into_iter()
            .filter(|t| !t.is_stopping())
            .min_by_key(|t| t.started_instant);

        match oldest {
            Some(task) => {
                info!(
                    task = %task.id,
                    usage,
                    limit = self.release_limit,
                    unit = self.reporter.unit(),
                    "releasing oldest task over the release limit"
                );
                vec![task.id]
            }
            None => Vec::new(),
        }
    }
}
