//! # In-process broker for tests and embedded scenarios.
//!
//! A channel-backed [`Coordinator`](crate::Coordinator)/[`Client`](crate::Client)
//! pair wired directly together: tasks flow over one buffered channel,
//! commands over another, and a claim is trivially exclusive because only
//! one receiver pulls each task. Releases re-enqueue the task
//! asynchronously, mirroring how real brokers re-surface released work.

mod client;
mod coordinator;

pub use client::EmbeddedClient;
pub use coordinator::EmbeddedCoordinator;

use std::sync::Arc;

use tokio::sync::mpsc;

/// Returns a connected coordinator/client pair for a single node.
pub fn embedded_pair(node_id: impl Into<String>) -> (Arc<EmbeddedCoordinator>, EmbeddedClient) {
    let (task_tx, task_rx) = mpsc::channel(64);
    let (cmd_tx, cmd_rx) = mpsc::channel(64);

    let coord = Arc::new(EmbeddedCoordinator::new(node_id, task_rx, task_tx.clone(), cmd_rx));
    let client = EmbeddedClient::new(task_tx, cmd_tx);
    (coord, client)
}
