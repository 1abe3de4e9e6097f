//! # Distributed broker adapter over a hierarchical key store.
//!
//! The consumer's distributed mode runs against any strongly-consistent
//! hierarchical key store with ephemeral (TTL) keys and change
//! notifications, abstracted by the [`KeyStore`] trait. The key layout
//! under a configurable namespace:
//!
//! ```text
//! <ns>/
//!   tasks/
//!     <taskID>/
//!       props         JSON string→string map (optional)
//!       owner         ephemeral JSON {"node": <nodeID>}, TTL-refreshed
//!   nodes/
//!     <nodeID>/       ephemeral, TTL-refreshed
//!       commands/
//!         <cmdID>     JSON command, TTL ~1 week
//! ```
//!
//! [`KvCoordinator`] surfaces a candidate for every task directory lacking
//! an `owner` child and whenever an `owner` key is removed for a
//! still-existing task. Claiming creates `owner` with a short TTL and
//! refreshes it at half the TTL; a refresh that cannot land before the
//! deadline reports the task lost. [`MemoryStore`] is a complete in-memory
//! implementation for tests and single-process clusters.

mod claims;
mod client;
mod cluster;
mod coordinator;
mod memory;
mod store;

pub use client::KvClient;
pub use cluster::KvClusterState;
pub use coordinator::KvCoordinator;
pub use memory::MemoryStore;
pub use store::{KeyEvent, KeyEventKind, KeyNode, KeyStore};

use serde::{Deserialize, Serialize};

/// Directory of task entries under the namespace.
pub const TASKS_DIR: &str = "tasks";

/// Directory of node entries under the namespace.
pub const NODES_DIR: &str = "nodes";

/// Per-node directory of pending commands.
pub const COMMANDS_DIR: &str = "commands";

/// Name of the ownership marker key under a task directory.
pub const OWNER_KEY: &str = "owner";

/// Name of the properties key under a task directory.
pub const PROPS_KEY: &str = "props";

/// Hidden marker written when a directory is first set up; watchers skip it.
pub const METADATA_KEY: &str = "_meta";

/// Value stored in an ownership marker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct OwnerValue {
    pub(crate) node: String,
}

impl OwnerValue {
    pub(crate) fn json(node: &str) -> String {
        serde_json::to_string(&OwnerValue {
            node: node.to_string(),
        })
        .expect("owner value serialization")
    }
}

/// Normalizes a namespace to an absolute path with no trailing slash.
pub(crate) fn normalize_namespace(namespace: &str) -> String {
    format!("/{}", namespace.trim_matches(|c| c == '/' || c == ' '))
}

pub(crate) fn tasks_path(namespace: &str) -> String {
    format!("{namespace}/{TASKS_DIR}")
}

pub(crate) fn node_path(namespace: &str, node_id: &str) -> String {
    format!("{namespace}/{NODES_DIR}/{node_id}")
}

pub(crate) fn commands_path(namespace: &str, node_id: &str) -> String {
    format!("{namespace}/{NODES_DIR}/{node_id}/{COMMANDS_DIR}")
}

/// Last segment of a key.
pub(crate) fn key_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_is_normalized() {
        assert_eq!(normalize_namespace("herd"), "/herd");
        assert_eq!(normalize_namespace("/herd/"), "/herd");
        assert_eq!(normalize_namespace(" /deep/ns "), "/deep/ns");
    }

    #[test]
    fn layout_paths() {
        assert_eq!(tasks_path("/ns"), "/ns/tasks");
        assert_eq!(node_path("/ns", "n1"), "/ns/nodes/n1");
        assert_eq!(commands_path("/ns", "n1"), "/ns/nodes/n1/commands");
        assert_eq!(key_name("/ns/tasks/t1/owner"), "owner");
    }
}
