//! The key-store contract the broker adapter is written against.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// What happened to a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyEventKind {
    /// The key was created.
    Create,
    /// The key's value was replaced.
    Set,
    /// The key was deleted.
    Delete,
    /// The key's TTL lapsed.
    Expire,
}

impl KeyEventKind {
    /// True for events that remove a key.
    pub fn is_removal(self) -> bool {
        matches!(self, KeyEventKind::Delete | KeyEventKind::Expire)
    }

    /// True for events that introduce a key or value.
    pub fn is_new(self) -> bool {
        matches!(self, KeyEventKind::Create | KeyEventKind::Set)
    }
}

/// A single change observed through [`KeyStore::watch`].
#[derive(Clone, Debug)]
pub struct KeyEvent {
    /// What happened.
    pub kind: KeyEventKind,
    /// Absolute key the event applies to.
    pub key: String,
    /// Value at the time of the event, if the key is a leaf.
    pub value: Option<String>,
    /// Whether the key is a directory.
    pub dir: bool,
    /// Monotonic store index of this event; pass it back to resume.
    pub index: u64,
}

/// A key with its value and (for directories) children.
#[derive(Clone, Debug)]
pub struct KeyNode {
    /// Absolute key.
    pub key: String,
    /// Leaf value; `None` for directories.
    pub value: Option<String>,
    /// Whether the key is a directory.
    pub dir: bool,
    /// Child nodes, populated for directories per the `recursive` flag.
    pub children: Vec<KeyNode>,
}

impl KeyNode {
    /// Finds a direct child by its last path segment.
    pub fn child(&self, name: &str) -> Option<&KeyNode> {
        self.children
            .iter()
            .find(|c| super::key_name(&c.key) == name)
    }

    /// Last path segment of this node's key.
    pub fn name(&self) -> &str {
        super::key_name(&self.key)
    }
}

/// A strongly-consistent hierarchical key store with ephemeral keys and
/// change notifications.
///
/// Keys are absolute `/`-separated paths. Creating a leaf implicitly
/// creates its parent directories. Every mutation carries a monotonically
/// increasing store index; watches deliver events strictly in index order.
#[async_trait]
pub trait KeyStore: Send + Sync + 'static {
    /// Reads a key. For directories, children are included one level deep,
    /// or the whole subtree when `recursive`. Also returns the store index
    /// at read time, suitable as a watch starting point.
    async fn get(&self, key: &str, recursive: bool) -> Result<(KeyNode, u64), StoreError>;

    /// Creates a leaf key. Fails with [`StoreError::AlreadyExists`] if the
    /// key is present; this is the primitive claims race on.
    async fn create(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> Result<u64, StoreError>;

    /// Creates a directory key.
    async fn create_dir(&self, key: &str, ttl: Option<Duration>) -> Result<u64, StoreError>;

    /// Resets a key's TTL without touching its value and without waking
    /// watchers.
    async fn refresh(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Deletes a key, and its subtree when `recursive`.
    async fn delete(&self, key: &str, recursive: bool) -> Result<u64, StoreError>;

    /// Deletes a leaf only if its current value equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<u64, StoreError>;

    /// Creates a uniquely named child under `dir` and returns its key.
    async fn add_child(
        &self,
        dir: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<String, StoreError>;

    /// Blocks until an event with index greater than `after_index` occurs
    /// at or under `prefix`. Returns [`StoreError::IndexTooOld`] when the
    /// requested window has been compacted (re-read and resume), and
    /// [`StoreError::Closed`] once the store shuts down.
    async fn watch(&self, prefix: &str, after_index: u64) -> Result<KeyEvent, StoreError>;
}
