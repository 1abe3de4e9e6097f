//! Cluster view for the fair balancer, read straight off the key store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::balancer::ClusterState;
use crate::error::{CoordinatorError, StoreError};
use crate::kv::store::KeyStore;
use crate::kv::{normalize_namespace, tasks_path, OwnerValue, METADATA_KEY, NODES_DIR, OWNER_KEY};

/// Counts claimed tasks per live node by scanning the namespace.
pub struct KvClusterState {
    store: Arc<dyn KeyStore>,
    namespace: String,
}

impl KvClusterState {
    /// Creates a cluster view over the given namespace.
    pub fn new(store: Arc<dyn KeyStore>, namespace: &str) -> Self {
        Self {
            store,
            namespace: normalize_namespace(namespace),
        }
    }
}

#[async_trait]
impl ClusterState for KvClusterState {
    async fn node_task_count(&self) -> Result<HashMap<String, usize>, CoordinatorError> {
        let mut counts = HashMap::new();

        // Every live node counts, even with zero tasks: the average depends
        // on the fleet size.
        let nodes_path = format!("{}/{}", self.namespace, NODES_DIR);
        match self.store.get(&nodes_path, false).await {
            Ok((dir, _)) => {
                for node in dir.children {
                    if node.name() != METADATA_KEY {
                        counts.insert(node.name().to_string(), 0);
                    }
                }
            }
            Err(StoreError::NotFound { .. }) => {}
            Err(err) => return Err(err.into()),
        }

        let (tasks, _) = match self.store.get(&tasks_path(&self.namespace), true).await {
            Ok(read) => read,
            Err(StoreError::NotFound { .. }) => return Ok(counts),
            Err(err) => return Err(err.into()),
        };
        for task in tasks.children {
            let Some(owner) = task.child(OWNER_KEY).and_then(|o| o.value.clone()) else {
                continue;
            };
            match serde_json::from_str::<OwnerValue>(&owner) {
                Ok(owner) => *counts.entry(owner.node).or_insert(0) += 1,
                Err(err) => {
                    warn!(task = %task.name(), error = %err, "unparseable owner value")
                }
            }
        }

        Ok(counts)
    }
}
