//! # Submission contract for producers.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::command::Command;
use crate::error::ClientError;

/// Submits work and control commands to the broker.
#[async_trait]
pub trait Client: Send + Sync {
    /// Submits a task for consumers to claim. The ID must be unique;
    /// resubmitting an existing ID fails with
    /// [`ClientError::DuplicateTask`] where the broker can tell.
    async fn submit_task(
        &self,
        id: &str,
        props: HashMap<String, String>,
    ) -> Result<(), ClientError>;

    /// Submits a command to a particular node.
    async fn submit_command(&self, node_id: &str, command: Command) -> Result<(), ClientError>;
}
