//! The distributed coordinator over a [`KeyStore`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::command::Command;
use crate::config::Config;
use crate::coordinator::{Coordinator, CoordinatorContext};
use crate::error::{CoordinatorError, StoreError};
use crate::kv::claims::ClaimManager;
use crate::kv::store::{KeyEvent, KeyNode, KeyStore};
use crate::kv::{
    commands_path, key_name, node_path, normalize_namespace, tasks_path, METADATA_KEY, OWNER_KEY,
    PROPS_KEY,
};
use crate::task::Task;

/// Pause between node-key refresh retries within one deadline window.
const RETRY_PAUSE: Duration = Duration::from_millis(500);

/// Coordinator implementation backed by an etcd-style hierarchical key
/// store. See the [module docs](crate::kv) for the key layout.
pub struct KvCoordinator {
    store: Arc<dyn KeyStore>,
    node_id: String,
    namespace: String,

    task_path: String,
    node_path: String,
    command_path: String,

    node_ttl: Duration,
    claims: ClaimManager,
    stop: CancellationToken,
}

impl KvCoordinator {
    /// Creates a coordinator for `node_id` under `namespace`. An empty
    /// node ID gets a generated one.
    pub fn new(
        store: Arc<dyn KeyStore>,
        namespace: &str,
        node_id: &str,
        cfg: &Config,
    ) -> Self {
        let namespace = normalize_namespace(namespace);
        let node_id = if node_id.trim_matches('/').is_empty() {
            format!("node-{}", Uuid::new_v4())
        } else {
            node_id.trim_matches('/').to_string()
        };

        let task_path = tasks_path(&namespace);
        let stop = CancellationToken::new();
        let claims = ClaimManager::new(
            store.clone(),
            task_path.clone(),
            node_id.clone(),
            cfg.claim_ttl,
            stop.clone(),
        );

        Self {
            node_path: node_path(&namespace, &node_id),
            command_path: commands_path(&namespace, &node_id),
            task_path,
            store,
            node_id,
            namespace,
            node_ttl: cfg.node_ttl,
            claims,
            stop,
        }
    }

    /// The node this coordinator registers in the broker.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Ensures a directory exists, writing the hidden metadata marker when
    /// this node is the one creating it.
    async fn upsert_dir(&self, path: &str) {
        if self.store.get(path, false).await.is_ok() {
            return;
        }
        if let Err(err) = self.store.create_dir(path, None).await {
            if !matches!(err, StoreError::AlreadyExists { .. }) {
                debug!(path, error = %err, "error creating directory");
                return;
            }
        }
        let marker = json!({
            "node": self.node_id,
            "created": Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
        })
        .to_string();
        let _ = self
            .store
            .create(&format!("{path}/{METADATA_KEY}"), &marker, None)
            .await;
    }

    fn spawn_node_refresher(&self) {
        let store = self.store.clone();
        let stop = self.stop.clone();
        let claims = self.claims.clone();
        let node_path = self.node_path.clone();
        let ttl = self.node_ttl;

        tokio::spawn(async move {
            let half = ttl / 2;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = sleep(half) => {}
                }

                // Refreshes must land before the node key's TTL lapses or
                // the whole coordinator is in a bad state.
                let deadline = Instant::now() + ttl;
                let mut ok = false;
                while Instant::now() < deadline {
                    if stop.is_cancelled() {
                        return;
                    }
                    match store.refresh(&node_path, ttl).await {
                        Ok(_) => {
                            ok = true;
                            break;
                        }
                        Err(err) => {
                            warn!(error = %err, "unexpected error updating node key");
                            sleep(RETRY_PAUSE).await;
                        }
                    }
                }

                if !ok {
                    error!("unable to refresh node key before deadline; closing coordinator");
                    close_node(&store, &stop, &claims, &node_path).await;
                    return;
                }
            }
        });
    }

    /// Extracts a claimable task from a task directory node, or `None` when
    /// the task is claimed or malformed.
    fn task_from_dir(node: &KeyNode) -> Option<Task> {
        if !node.dir || node.name() == METADATA_KEY {
            return None;
        }
        let id = node.name().to_string();

        if node.child(OWNER_KEY).is_some() {
            debug!(task = %id, "ignoring task as it's already claimed");
            return None;
        }

        let props = match node.child(PROPS_KEY).and_then(|p| p.value.as_deref()) {
            Some(raw) => match serde_json::from_str::<HashMap<String, String>>(raw) {
                Ok(props) => props,
                Err(err) => {
                    error!(task = %id, error = %err, "error unmarshalling task props");
                    return None;
                }
            },
            None => HashMap::new(),
        };

        debug!(task = %id, "received task");
        Some(Task::with_props(id, props))
    }

    /// Interprets one watch event as a claimable-task candidate.
    async fn task_from_event(&self, event: &KeyEvent) -> Option<Task> {
        let rel = event
            .key
            .strip_prefix(self.task_path.as_str())?
            .trim_matches('/');
        if rel.is_empty() {
            // The tasks directory itself.
            return None;
        }
        let parts: Vec<&str> = rel.split('/').collect();

        // New task directory: check its children before surfacing.
        if event.kind.is_new() && parts.len() == 1 && event.dir {
            let (node, _) = self.store.get(&event.key, true).await.ok()?;
            return Self::task_from_dir(&node);
        }

        // New props file.
        if event.kind.is_new() && parts.len() == 2 && parts[1] == PROPS_KEY {
            let props = match event.value.as_deref() {
                Some(raw) => match serde_json::from_str::<HashMap<String, String>>(raw) {
                    Ok(props) => props,
                    Err(err) => {
                        error!(task = %parts[0], error = %err, "error unmarshalling task props");
                        return None;
                    }
                },
                None => HashMap::new(),
            };
            debug!(task = %parts[0], "received task");
            return Some(Task::with_props(parts[0], props));
        }

        // Removed owner marker: the task is claimable again if it still
        // exists and hasn't been reclaimed already.
        if event.kind.is_removal() && parts.len() == 2 && parts[1] == OWNER_KEY {
            let task_key = format!("{}/{}", self.task_path, parts[0]);
            match self.store.get(&task_key, true).await {
                Ok((node, _)) => return Self::task_from_dir(&node),
                Err(StoreError::NotFound { .. }) => return None,
                Err(err) => {
                    error!(task = %parts[0], error = %err, "failed retrieving released task");
                    return None;
                }
            }
        }

        // Metadata markers, task deletions, owner creations: not claimable.
        None
    }

    async fn send_candidate(&self, out: &mpsc::Sender<Task>, task: Task) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            res = out.send(task) => res.is_ok(),
        }
    }

    /// Deletes a handled command key and parses its body. At-least-once:
    /// the delete lands before the command is surfaced.
    async fn take_command(&self, key: &str, value: Option<&str>) -> Option<Command> {
        if let Err(err) = self.store.delete(key, false).await {
            if !matches!(err, StoreError::NotFound { .. }) {
                error!(key, error = %err, "error deleting handled command");
            }
        }
        let raw = value?;
        match Command::from_json(raw) {
            Ok(cmd) => Some(cmd),
            Err(err) => {
                error!(key, error = %err, "invalid command");
                None
            }
        }
    }
}

#[async_trait]
impl Coordinator for KvCoordinator {
    async fn init(&self, ctx: Arc<dyn CoordinatorContext>) -> Result<(), CoordinatorError> {
        debug!(namespace = %self.namespace, node = %self.node_id, "initializing coordinator");
        self.claims.set_ctx(ctx);

        self.upsert_dir(&self.namespace).await;
        self.upsert_dir(&self.task_path).await;

        // The node entry is exclusive: a second coordinator with the same
        // ID must fail its setup.
        self.store
            .create_dir(&self.node_path, Some(self.node_ttl))
            .await
            .map_err(CoordinatorError::from)?;
        self.spawn_node_refresher();
        self.upsert_dir(&self.command_path).await;

        Ok(())
    }

    async fn watch(&self, out: mpsc::Sender<Task>) -> Result<(), CoordinatorError> {
        if self.stop.is_cancelled() {
            return Ok(());
        }

        'resync: loop {
            // Read all current tasks, then watch from that index so nothing
            // between the read and the watch is missed.
            let read = tokio::select! {
                _ = self.stop.cancelled() => return Ok(()),
                read = self.store.get(&self.task_path, true) => read,
            };
            let (root, mut index) = match read {
                Ok(read) => read,
                Err(StoreError::Closed) => return Ok(()),
                Err(err) => {
                    error!(path = %self.task_path, error = %err, "error getting existing tasks");
                    return Err(err.into());
                }
            };

            for child in &root.children {
                if let Some(task) = Self::task_from_dir(child) {
                    if !self.send_candidate(&out, task).await {
                        return Ok(());
                    }
                }
            }

            loop {
                let event = tokio::select! {
                    _ = self.stop.cancelled() => return Ok(()),
                    event = self.store.watch(&self.task_path, index) => event,
                };
                match event {
                    Ok(event) => {
                        index = event.index;
                        if let Some(task) = self.task_from_event(&event).await {
                            if !self.send_candidate(&out, task).await {
                                return Ok(());
                            }
                        }
                    }
                    Err(StoreError::IndexTooOld { .. }) => {
                        debug!("too many events since the last index; restarting watch");
                        continue 'resync;
                    }
                    Err(StoreError::Closed) => return Ok(()),
                    Err(err) => {
                        // Transient: keep retrying; the node refresher closes
                        // the coordinator if the store stays unreachable.
                        warn!(error = %err, "retrying task watch after error");
                    }
                }
            }
        }
    }

    async fn claim(&self, task_id: &str) -> bool {
        self.claims.claim(task_id).await
    }

    async fn release(&self, task_id: &str) {
        self.claims.release(task_id, false).await;
    }

    async fn done(&self, task_id: &str) {
        self.claims.release(task_id, true).await;
    }

    async fn command(&self) -> Result<Option<Command>, CoordinatorError> {
        if self.stop.is_cancelled() {
            return Ok(None);
        }

        'resync: loop {
            let read = tokio::select! {
                _ = self.stop.cancelled() => return Ok(None),
                read = self.store.get(&self.command_path, true) => read,
            };
            let (root, mut index) = match read {
                Ok(read) => read,
                Err(StoreError::Closed) => return Ok(None),
                Err(err) => {
                    error!(path = %self.command_path, error = %err, "error getting existing commands");
                    return Err(err.into());
                }
            };

            for child in &root.children {
                if child.name() == METADATA_KEY {
                    continue;
                }
                if let Some(cmd) = self.take_command(&child.key, child.value.as_deref()).await {
                    return Ok(Some(cmd));
                }
            }

            loop {
                let event = tokio::select! {
                    _ = self.stop.cancelled() => return Ok(None),
                    event = self.store.watch(&self.command_path, index) => event,
                };
                match event {
                    Ok(event) => {
                        index = event.index;
                        if !event.kind.is_new() || event.dir || key_name(&event.key) == METADATA_KEY
                        {
                            continue;
                        }
                        if let Some(cmd) =
                            self.take_command(&event.key, event.value.as_deref()).await
                        {
                            return Ok(Some(cmd));
                        }
                    }
                    Err(StoreError::IndexTooOld { .. }) => continue 'resync,
                    Err(StoreError::Closed) => return Ok(None),
                    Err(err) => {
                        warn!(error = %err, "retrying command watch after error");
                    }
                }
            }
        }
    }

    async fn close(&self) {
        if self.stop.is_cancelled() {
            return;
        }
        close_node(&self.store, &self.stop, &self.claims, &self.node_path).await;
    }
}

/// Shared teardown for `close` and a failed node refresher: signal stop,
/// cancel claim refreshers, remove the node entry. Claims themselves are
/// not released here; the consumer's shutdown does that per task.
async fn close_node(
    store: &Arc<dyn KeyStore>,
    stop: &CancellationToken,
    claims: &ClaimManager,
    node_path: &str,
) {
    stop.cancel();
    claims.shutdown();

    match store.delete(node_path, true).await {
        // The TTL beat us to it or it was never created; nothing to do.
        Ok(_) | Err(StoreError::NotFound { .. }) => {}
        Err(err) => error!(path = %node_path, error = %err, "error deleting node path"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{MemoryStore, OwnerValue};
    use crate::task::TaskSnapshot;

    struct NoopCtx;

    impl crate::coordinator::BalancerContext for NoopCtx {
        fn tasks(&self) -> Vec<TaskSnapshot> {
            Vec::new()
        }
    }

    impl CoordinatorContext for NoopCtx {
        fn lost(&self, _task_id: &str) {}
    }

    fn coordinator(store: &MemoryStore, node: &str) -> KvCoordinator {
        let mut cfg = Config::default();
        cfg.claim_ttl = Duration::from_millis(200);
        cfg.node_ttl = Duration::from_secs(2);
        KvCoordinator::new(Arc::new(store.clone()), "herd", node, &cfg)
    }

    #[tokio::test]
    async fn init_registers_the_node() {
        let store = MemoryStore::new();
        let coord = coordinator(&store, "n1");
        coord.init(Arc::new(NoopCtx)).await.unwrap();

        assert!(store.get("/herd/nodes/n1", false).await.is_ok());
        assert!(store.get("/herd/tasks", false).await.is_ok());
        assert!(store.get("/herd/nodes/n1/commands", false).await.is_ok());

        // The same node ID cannot register twice.
        let twin = coordinator(&store, "n1");
        assert!(twin.init(Arc::new(NoopCtx)).await.is_err());

        coord.close().await;
        assert!(matches!(
            store.get("/herd/nodes/n1", false).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn claim_is_exclusive_and_released_markers_reopen() {
        let store = MemoryStore::new();
        let c1 = coordinator(&store, "n1");
        let c2 = coordinator(&store, "n2");
        c1.init(Arc::new(NoopCtx)).await.unwrap();
        c2.init(Arc::new(NoopCtx)).await.unwrap();

        assert!(c1.claim("t1").await);
        assert!(!c2.claim("t1").await);

        c1.release("t1").await;
        assert!(c2.claim("t1").await);

        c1.close().await;
        c2.close().await;
    }

    #[tokio::test]
    async fn done_removes_the_task_subtree() {
        let store = MemoryStore::new();
        let coord = coordinator(&store, "n1");
        coord.init(Arc::new(NoopCtx)).await.unwrap();

        store
            .create("/herd/tasks/t1/props", "{}", None)
            .await
            .unwrap();
        assert!(coord.claim("t1").await);
        coord.done("t1").await;

        assert!(matches!(
            store.get("/herd/tasks/t1", false).await,
            Err(StoreError::NotFound { .. })
        ));
        coord.close().await;
    }

    #[tokio::test]
    async fn watch_surfaces_unowned_tasks_and_owner_removals() {
        let store = MemoryStore::new();
        let coord = Arc::new(coordinator(&store, "n1"));
        coord.init(Arc::new(NoopCtx)).await.unwrap();

        // Pre-existing: one claimable, one claimed.
        store
            .create("/herd/tasks/t1/props", r#"{"k":"v"}"#, None)
            .await
            .unwrap();
        store
            .create("/herd/tasks/claimed/props", "{}", None)
            .await
            .unwrap();
        store
            .create("/herd/tasks/claimed/owner", &OwnerValue::json("n9"), None)
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let watcher = {
            let coord = coord.clone();
            tokio::spawn(async move { coord.watch(tx).await })
        };

        let first = rx.recv().await.expect("existing candidate");
        assert_eq!(first.id(), "t1");
        assert_eq!(first.prop("k"), Some("v"));

        // A newly submitted task surfaces...
        store
            .create("/herd/tasks/t2/props", "{}", None)
            .await
            .unwrap();
        assert_eq!(rx.recv().await.expect("new candidate").id(), "t2");

        // ...and so does a released one.
        store
            .delete("/herd/tasks/claimed/owner", false)
            .await
            .unwrap();
        assert_eq!(rx.recv().await.expect("released candidate").id(), "claimed");

        coord.close().await;
        watcher.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn command_is_delivered_and_deleted() {
        let store = MemoryStore::new();
        let coord = Arc::new(coordinator(&store, "n1"));
        coord.init(Arc::new(NoopCtx)).await.unwrap();

        store
            .add_child(
                "/herd/nodes/n1/commands",
                &Command::freeze().to_json(),
                None,
            )
            .await
            .unwrap();

        let cmd = coord.command().await.unwrap().expect("command");
        assert_eq!(cmd, Command::freeze());

        // Handled commands are removed from the broker.
        let (dir, _) = store.get("/herd/nodes/n1/commands", false).await.unwrap();
        assert!(dir.children.iter().all(|c| c.name() == METADATA_KEY));

        // A malformed command is dropped, a later valid one delivered.
        store
            .add_child("/herd/nodes/n1/commands", "not json", None)
            .await
            .unwrap();
        store
            .add_child(
                "/herd/nodes/n1/commands",
                &Command::stop_task("t1").to_json(),
                None,
            )
            .await
            .unwrap();
        let cmd = coord.command().await.unwrap().expect("command");
        assert_eq!(cmd.stop_task_target(), Some("t1"));

        coord.close().await;
        assert!(coord.command().await.unwrap().is_none());
    }
}
