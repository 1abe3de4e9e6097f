//! # Task balancing policies.
//!
//! Clusters have no master: every node runs a [`Balancer`] that decides
//! locally whether to accept a candidate ([`Balancer::can_claim`]) and which
//! of its running tasks to shed ([`Balancer::balance`]). The consumer
//! serializes all verdicts through its main loop, so implementations never
//! see concurrent calls.
//!
//! Implementations provided here:
//! - [`DumbBalancer`] accepts everything, releases nothing.
//! - [`FairBalancer`] sheds load above a multiple of the cluster average.
//! - [`ResourceBalancer`] gates on a reported resource such as memory.
//! - [`BalancerMux`] chains several balancers into one.

mod fair;
mod resource;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;

pub use fair::{ClusterState, FairBalancer};
pub use resource::{ResourceBalancer, ResourceReporter};

use crate::coordinator::BalancerContext;
use crate::task::Task;

/// Outcome of a [`Balancer::can_claim`] check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClaimVerdict {
    /// Claim the task now.
    Accept,
    /// Skip the task and do not reconsider it before the given instant.
    DeferUntil(Instant),
}

impl ClaimVerdict {
    /// True for [`ClaimVerdict::Accept`].
    pub fn is_accept(&self) -> bool {
        matches!(self, ClaimVerdict::Accept)
    }
}

/// Cooperative balancing policy.
#[async_trait]
pub trait Balancer: Send + Sync + 'static {
    /// Receives the read-only consumer view before the consumer starts.
    fn init(&self, _ctx: Arc<dyn BalancerContext>) {}

    /// Decides whether to admit a single candidate task.
    async fn can_claim(&self, task: &Task) -> ClaimVerdict;

    /// Returns the IDs of running tasks to release now. The selection
    /// criteria are entirely up to the implementation.
    async fn balance(&self) -> Vec<String>;
}

/// The simplest balancer: accept every task, never release any.
#[derive(Clone, Copy, Debug, Default)]
pub struct DumbBalancer;

#[async_trait]
impl Balancer for DumbBalancer {
    async fn can_claim(&self, _task: &Task) -> ClaimVerdict {
        ClaimVerdict::Accept
    }

    async fn balance(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Chains balancers: the first deferral wins a claim check; balance returns
/// the deduplicated union of every inner release set.
pub struct BalancerMux {
    inner: Vec<Arc<dyn Balancer>>,
}

impl BalancerMux {
    /// Creates a mux over the given balancers, consulted in order.
    pub fn new(inner: Vec<Arc<dyn Balancer>>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Balancer for BalancerMux {
    fn init(&self, ctx: Arc<dyn BalancerContext>) {
        for balancer in &self.inner {
            balancer.init(ctx.clone());
        }
    }

    async fn can_claim(&self, task: &Task) -> ClaimVerdict {
        for balancer in &self.inner {
            if let ClaimVerdict::DeferUntil(until) = balancer.can_claim(task).await {
                return ClaimVerdict::DeferUntil(until);
            }
        }
        ClaimVerdict::Accept
    }

    async fn balance(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut release = Vec::new();
        for balancer in &self.inner {
            for id in balancer.balance().await {
                if seen.insert(id.clone()) {
                    release.push(id);
                }
            }
        }
        release
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        verdict: ClaimVerdict,
        release: Vec<String>,
    }

    #[async_trait]
    impl Balancer for Fixed {
        async fn can_claim(&self, _task: &Task) -> ClaimVerdict {
            self.verdict
        }

        async fn balance(&self) -> Vec<String> {
            self.release.clone()
        }
    }

    #[tokio::test]
    async fn dumb_balancer_accepts_everything() {
        let b = DumbBalancer;
        assert!(b.can_claim(&Task::new("t1")).await.is_accept());
        assert!(b.balance().await.is_empty());
    }

    #[tokio::test]
    async fn mux_first_deferral_wins() {
        let until = Instant::now() + std::time::Duration::from_secs(60);
        let mux = BalancerMux::new(vec![
            Arc::new(Fixed {
                verdict: ClaimVerdict::Accept,
                release: vec![],
            }),
            Arc::new(Fixed {
                verdict: ClaimVerdict::DeferUntil(until),
                release: vec![],
            }),
        ]);
        assert_eq!(
            mux.can_claim(&Task::new("t1")).await,
            ClaimVerdict::DeferUntil(until)
        );
    }

    #[tokio::test]
    async fn mux_balance_unions_and_dedupes() {
        let mux = BalancerMux::new(vec![
            Arc::new(Fixed {
                verdict: ClaimVerdict::Accept,
                release: vec!["a".into(), "b".into()],
            }),
            Arc::new(Fixed {
                verdict: ClaimVerdict::Accept,
                release: vec!["b".into(), "c".into()],
            }),
        ]);
        assert_eq!(mux.balance().await, vec!["a", "b", "c"]);
    }
}
