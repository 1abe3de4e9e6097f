//! # Handler contracts and the function-backed handler.
//!
//! A [`Handler`] runs exactly one claimed task: `run` blocks until the work
//! completes (`true`) or a requested stop took effect (`false`), and `stop`
//! asks a running handler to wind down. The consumer allocates a fresh
//! handler per claimed task through a [`HandlerFactory`].
//!
//! [`FnHandler`] adapts a closure into a handler: the closure receives the
//! task and a [`CancellationToken`] that `stop` cancels.
//!
//! # Example
//! ```
//! use taskherd::{handler_fn, Task};
//! use tokio_util::sync::CancellationToken;
//!
//! let factory = handler_fn(|task: Task, stop: CancellationToken| async move {
//!     // do work until done or asked to stop...
//!     if stop.is_cancelled() {
//!         return false; // released, another node may claim
//!     }
//!     println!("processed {}", task.id());
//!     true // done, the task is finished for good
//! });
//! # let _ = factory;
//! ```

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::task::Task;

/// A worker for one claimed task.
///
/// `run` is invoked on its own task and may block indefinitely; `stop` may
/// be called concurrently (and repeatedly) from other tasks and must be
/// idempotent. Returning `true` finishes the task permanently; `false`
/// releases it for other nodes to claim.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Executes the task until completion or until a stop takes effect.
    async fn run(&self, task: Task) -> bool;

    /// Signals the handler to stop. Safe to call more than once.
    async fn stop(&self);
}

/// Allocates a fresh [`Handler`] per claimed task.
pub trait HandlerFactory: Send + Sync + 'static {
    /// Returns a new handler instance.
    fn handler(&self) -> Arc<dyn Handler>;
}

impl<F> HandlerFactory for F
where
    F: Fn() -> Arc<dyn Handler> + Send + Sync + 'static,
{
    fn handler(&self) -> Arc<dyn Handler> {
        (self)()
    }
}

/// Function-backed [`Handler`].
///
/// The closure receives the claimed [`Task`] and a per-handler
/// [`CancellationToken`]; [`Handler::stop`] cancels the token. Use
/// [`handler_fn`] to turn a closure into a ready-made factory.
pub struct FnHandler<F> {
    func: F,
    stop: CancellationToken,
}

impl<F> FnHandler<F> {
    /// Creates a new function-backed handler.
    pub fn new(func: F) -> Self {
        Self {
            func,
            stop: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Task, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    async fn run(&self, task: Task) -> bool {
        (self.func)(task, self.stop.clone()).await
    }

    async fn stop(&self) {
        self.stop.cancel();
    }
}

/// Wraps a closure into a [`HandlerFactory`] producing one [`FnHandler`]
/// per claimed task.
pub fn handler_fn<F, Fut>(func: F) -> Arc<dyn HandlerFactory>
where
    F: Fn(Task, CancellationToken) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    Arc::new(move || Arc::new(FnHandler::new(func.clone())) as Arc<dyn Handler>)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fn_handler_observes_stop() {
        let factory = handler_fn(|_task, stop: CancellationToken| async move {
            stop.cancelled().await;
            false
        });

        let handler = factory.handler();
        let run = {
            let handler = handler.clone();
            tokio::spawn(async move { handler.run(Task::new("t1")).await })
        };

        handler.stop().await;
        assert!(!run.await.expect("join"));
    }

    #[tokio::test]
    async fn factory_yields_independent_handlers() {
        let factory = handler_fn(|_task, stop: CancellationToken| async move {
            !stop.is_cancelled()
        });

        let first = factory.handler();
        let second = factory.handler();
        first.stop().await;

        // Only the stopped instance sees the cancellation.
        assert!(!first.run(Task::new("a")).await);
        assert!(second.run(Task::new("b")).await);
    }
}
