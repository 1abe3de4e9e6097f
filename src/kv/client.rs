//! Submission client over a [`KeyStore`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use tracing::debug;

use crate::client::Client;
use crate::command::Command;
use crate::config::Config;
use crate::error::{ClientError, StoreError};
use crate::kv::store::KeyStore;
use crate::kv::{commands_path, normalize_namespace, tasks_path, PROPS_KEY};
use crate::task::SUBMITTED_PROP;

/// Submits tasks and per-node commands into the broker's key layout.
pub struct KvClient {
    store: Arc<dyn KeyStore>,
    namespace: String,
    command_ttl: Duration,
}

impl KvClient {
    /// Creates a client for the given namespace.
    pub fn new(store: Arc<dyn KeyStore>, namespace: &str, cfg: &Config) -> Self {
        Self {
            store,
            namespace: normalize_namespace(namespace),
            command_ttl: cfg.command_ttl,
        }
    }

    fn props_key(&self, task_id: &str) -> String {
        format!("{}/{}/{}", tasks_path(&self.namespace), task_id, PROPS_KEY)
    }
}

#[async_trait]
impl Client for KvClient {
    async fn submit_task(
        &self,
        id: &str,
        mut props: HashMap<String, String>,
    ) -> Result<(), ClientError> {
        props.insert(
            SUBMITTED_PROP.to_string(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
        );
        let body = serde_json::to_string(&props).expect("props serialization");

        match self.store.create(&self.props_key(id), &body, None).await {
            Ok(_) => {
                debug!(task = %id, "task submitted");
                Ok(())
            }
            Err(StoreError::AlreadyExists { .. }) => Err(ClientError::DuplicateTask {
                id: id.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn submit_command(&self, node_id: &str, command: Command) -> Result<(), ClientError> {
        self.store
            .add_child(
                &commands_path(&self.namespace, node_id),
                &command.to_json(),
                Some(self.command_ttl),
            )
            .await?;
        debug!(node = %node_id, command = %command, "command submitted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;

    #[tokio::test]
    async fn submit_stamps_and_rejects_duplicates() {
        let store = MemoryStore::new();
        let client = KvClient::new(Arc::new(store.clone()), "herd", &Config::default());

        client
            .submit_task("t1", HashMap::from([("k".into(), "v".into())]))
            .await
            .unwrap();

        let (node, _) = store.get("/herd/tasks/t1/props", false).await.unwrap();
        let props: HashMap<String, String> =
            serde_json::from_str(node.value.as_deref().unwrap()).unwrap();
        assert_eq!(props.get("k").map(String::as_str), Some("v"));
        assert!(props.contains_key(SUBMITTED_PROP));

        let dup = client.submit_task("t1", HashMap::new()).await;
        assert!(matches!(dup, Err(ClientError::DuplicateTask { .. })));
    }

    #[tokio::test]
    async fn submit_command_appends_a_child() {
        let store = MemoryStore::new();
        let client = KvClient::new(Arc::new(store.clone()), "herd", &Config::default());

        client
            .submit_command("n1", Command::balance())
            .await
            .unwrap();
        client
            .submit_command("n1", Command::freeze())
            .await
            .unwrap();

        let (dir, _) = store.get("/herd/nodes/n1/commands", false).await.unwrap();
        assert_eq!(dir.children.len(), 2);
    }
}
