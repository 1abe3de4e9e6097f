//! # Coordinator contract.
//!
//! A [`Coordinator`] adapts a broker to the consumer: it surfaces claimable
//! task candidates, arbitrates exclusive claims, releases or finishes them,
//! and delivers per-node control commands. The consumer treats every
//! implementation as honoring the semantics documented on each method.
//!
//! The [`CoordinatorContext`] is the deliberately narrow view of consumer
//! state handed to a coordinator at init time; keeping it to two operations
//! breaks the reference cycle between consumer and coordinator.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::command::Command;
use crate::error::CoordinatorError;
use crate::task::{Task, TaskSnapshot};

/// Read-only consumer state exposed to collaborators.
pub trait BalancerContext: Send + Sync + 'static {
    /// Snapshots of the tasks this consumer is currently running, in
    /// lexicographic ID order.
    fn tasks(&self) -> Vec<TaskSnapshot>;
}

/// Consumer state exposed to coordinators.
pub trait CoordinatorContext: BalancerContext {
    /// Reports that ownership of a still-running task was involuntarily
    /// lost (TTL expiry, external delete). The consumer stops the task
    /// locally; the claim itself is already gone.
    fn lost(&self, task_id: &str);
}

/// Adapter between a broker and the consumer.
#[async_trait]
pub trait Coordinator: Send + Sync + 'static {
    /// One-time setup. Called by [`Consumer::new`](crate::Consumer::new);
    /// failure makes the consumer construction fail.
    async fn init(&self, ctx: Arc<dyn CoordinatorContext>) -> Result<(), CoordinatorError>;

    /// Streams claimable task candidates into `out` until [`close`] is
    /// called (then returns `Ok`) or a fatal error occurs (returns it; the
    /// consumer shuts down).
    ///
    /// A candidate is not a reservation: several nodes may receive the same
    /// task and must race through [`claim`].
    ///
    /// [`close`]: Coordinator::close
    /// [`claim`]: Coordinator::claim
    async fn watch(&self, out: mpsc::Sender<Task>) -> Result<(), CoordinatorError>;

    /// Atomically attempts to acquire exclusive ownership of a task.
    ///
    /// On `true` the coordinator keeps the ownership marker alive until
    /// [`release`]/[`done`] or loss; on loss it must invoke
    /// [`CoordinatorContext::lost`].
    ///
    /// [`release`]: Coordinator::release
    /// [`done`]: Coordinator::done
    async fn claim(&self, task_id: &str) -> bool;

    /// Relinquishes ownership so another node may claim the task.
    async fn release(&self, task_id: &str);

    /// Marks the task completed; its identity is removed from the broker.
    async fn done(&self, task_id: &str);

    /// Blocks until the next command for this node arrives. Returns
    /// `Ok(None)` once the coordinator has shut down.
    async fn command(&self) -> Result<Option<Command>, CoordinatorError>;

    /// Shuts the coordinator down, unblocking [`watch`] and [`command`].
    /// Idempotent. Does not release outstanding claims; the consumer's
    /// shutdown sequence does that per task.
    ///
    /// [`watch`]: Coordinator::watch
    /// [`command`]: Coordinator::command
    async fn close(&self);
}
