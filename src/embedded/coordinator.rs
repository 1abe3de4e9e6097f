//! Channel-backed coordinator.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::command::Command;
use crate::coordinator::{Coordinator, CoordinatorContext};
use crate::error::CoordinatorError;
use crate::task::Task;

/// Coordinator which listens for tasks and commands on in-process channels.
///
/// Claims always succeed: receiving a task off the channel is already
/// exclusive. Ownership is therefore never lost and
/// [`CoordinatorContext::lost`] is never invoked.
pub struct EmbeddedCoordinator {
    node_id: String,

    inbound: tokio::sync::Mutex<mpsc::Receiver<Task>>,
    commands: tokio::sync::Mutex<mpsc::Receiver<Command>>,

    /// Sender side of the task channel, used to re-enqueue releases.
    resubmit: mpsc::Sender<Task>,

    /// Tasks seen by the watcher, so releases can re-enqueue the value.
    tasks: DashMap<String, Task>,

    stop: CancellationToken,
}

impl EmbeddedCoordinator {
    pub(crate) fn new(
        node_id: impl Into<String>,
        inbound: mpsc::Receiver<Task>,
        resubmit: mpsc::Sender<Task>,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            inbound: tokio::sync::Mutex::new(inbound),
            commands: tokio::sync::Mutex::new(commands),
            resubmit,
            tasks: DashMap::new(),
            stop: CancellationToken::new(),
        }
    }

    /// The node this coordinator serves.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

#[async_trait]
impl Coordinator for EmbeddedCoordinator {
    async fn init(&self, _ctx: Arc<dyn CoordinatorContext>) -> Result<(), CoordinatorError> {
        Ok(())
    }

    async fn watch(&self, out: mpsc::Sender<Task>) -> Result<(), CoordinatorError> {
        let mut inbound = self.inbound.lock().await;
        loop {
            let task = tokio::select! {
                _ = self.stop.cancelled() => return Ok(()),
                task = inbound.recv() => match task {
                    Some(task) => task,
                    None => {
                        return Err(CoordinatorError::Stream {
                            reason: "task input closed".into(),
                        })
                    }
                },
            };

            self.tasks.insert(task.id().to_string(), task.clone());
            tokio::select! {
                _ = self.stop.cancelled() => return Ok(()),
                res = out.send(task) => {
                    if res.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn claim(&self, _task_id: &str) -> bool {
        // This node received the task off the channel; nobody else did.
        true
    }

    async fn release(&self, task_id: &str) {
        let Some(task) = self.tasks.get(task_id).map(|t| t.value().clone()) else {
            warn!(task = %task_id, "release of a task this broker never saw");
            return;
        };

        // Re-enqueue asynchronously to avoid deadlocking the releasing
        // handler against a full task channel.
        let resubmit = self.resubmit.clone();
        let stop = self.stop.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = resubmit.send(task) => {}
            }
        });
    }

    async fn done(&self, task_id: &str) {
        self.tasks.remove(task_id);
    }

    async fn command(&self) -> Result<Option<Command>, CoordinatorError> {
        let mut commands = self.commands.lock().await;
        tokio::select! {
            _ = self.stop.cancelled() => Ok(None),
            cmd = commands.recv() => match cmd {
                Some(cmd) => Ok(Some(cmd)),
                None => Err(CoordinatorError::Stream {
                    reason: "command input closed".into(),
                }),
            },
        }
    }

    async fn close(&self) {
        self.stop.cancel();
    }
}
