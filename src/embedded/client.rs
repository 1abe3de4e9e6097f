//! Channel-backed client.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use tokio::sync::mpsc;
use tracing::debug;

use crate::client::Client;
use crate::command::Command;
use crate::error::ClientError;
use crate::task::{Task, SUBMITTED_PROP};

/// Submits tasks and commands straight onto the paired coordinator's
/// channels.
///
/// The channel broker keeps no global task registry, so duplicate IDs are
/// not rejected here; only the distributed client enforces uniqueness.
#[derive(Clone)]
pub struct EmbeddedClient {
    tasks: mpsc::Sender<Task>,
    commands: mpsc::Sender<Command>,
}

impl EmbeddedClient {
    pub(crate) fn new(tasks: mpsc::Sender<Task>, commands: mpsc::Sender<Command>) -> Self {
        Self { tasks, commands }
    }
}

#[async_trait]
impl Client for EmbeddedClient {
    async fn submit_task(
        &self,
        id: &str,
        mut props: HashMap<String, String>,
    ) -> Result<(), ClientError> {
        props.insert(
            SUBMITTED_PROP.to_string(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
        );

        self.tasks
            .send(Task::with_props(id, props))
            .await
            .map_err(|_| ClientError::Closed)?;
        debug!(task = %id, "task submitted");
        Ok(())
    }

    async fn submit_command(&self, node_id: &str, command: Command) -> Result<(), ClientError> {
        debug!(node = %node_id, command = %command, "command submitted");
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::Closed)
    }
}
