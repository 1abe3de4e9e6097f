//! In-memory [`KeyStore`]: strongly consistent, TTL-sweeping, watchable.
//!
//! Cloning a [`MemoryStore`] shares the underlying tree, so one store can
//! back several coordinators and clients to form a single-process cluster
//! in tests.

use std::collections::{BTreeMap, VecDeque};
use std::pin::pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;
use crate::kv::store::{KeyEvent, KeyEventKind, KeyNode, KeyStore};

/// Retained event window; watchers further behind get `IndexTooOld`.
const LOG_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
struct Entry {
    value: Option<String>,
    dir: bool,
    expires: Option<Instant>,
}

struct State {
    entries: BTreeMap<String, Entry>,
    log: VecDeque<KeyEvent>,
    index: u64,
}

impl State {
    fn record(&mut self, kind: KeyEventKind, key: String, value: Option<String>, dir: bool) {
        self.index += 1;
        self.log.push_back(KeyEvent {
            kind,
            key,
            value,
            dir,
            index: self.index,
        });
        while self.log.len() > LOG_CAPACITY {
            self.log.pop_front();
        }
    }

    /// Index of the oldest retained event.
    fn first_logged(&self) -> u64 {
        self.log.front().map(|e| e.index).unwrap_or(self.index + 1)
    }

    /// Removes lapsed entries (with their subtrees) and records one expire
    /// event per lapsed key.
    fn purge_expired(&mut self, now: Instant) {
        let lapsed: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires.is_some_and(|at| at <= now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in lapsed {
            // The subtree may already be gone via an expired ancestor.
            let Some(entry) = self.entries.remove(&key) else {
                continue;
            };
            self.remove_subtree(&key);
            self.record(KeyEventKind::Expire, key, None, entry.dir);
        }
    }

    fn remove_subtree(&mut self, key: &str) {
        let prefix = format!("{key}/");
        let descendants: Vec<String> = self
            .entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for k in descendants {
            self.entries.remove(&k);
        }
    }

    fn has_children(&self, key: &str) -> bool {
        let prefix = format!("{key}/");
        self.entries
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(&prefix))
    }

    /// Creates missing ancestor directories without emitting events.
    fn ensure_parents(&mut self, key: &str) -> Result<(), StoreError> {
        let mut path = String::new();
        let segments: Vec<&str> = key.trim_matches('/').split('/').collect();
        for segment in &segments[..segments.len().saturating_sub(1)] {
            path.push('/');
            path.push_str(segment);
            match self.entries.get(&path) {
                Some(entry) if !entry.dir => {
                    return Err(StoreError::Transport {
                        reason: format!("{path} is not a directory"),
                    })
                }
                Some(_) => {}
                None => {
                    self.entries.insert(
                        path.clone(),
                        Entry {
                            value: None,
                            dir: true,
                            expires: None,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    fn build_node(&self, key: &str, recursive: bool) -> Option<KeyNode> {
        let entry = self.entries.get(key)?;
        let mut node = KeyNode {
            key: key.to_string(),
            value: entry.value.clone(),
            dir: entry.dir,
            children: Vec::new(),
        };
        if entry.dir {
            let prefix = format!("{key}/");
            let direct: Vec<String> = self
                .entries
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .filter(|(k, _)| !k[prefix.len()..].contains('/'))
                .map(|(k, _)| k.clone())
                .collect();
            for child in direct {
                if recursive {
                    if let Some(child_node) = self.build_node(&child, true) {
                        node.children.push(child_node);
                    }
                } else {
                    let e = &self.entries[&child];
                    node.children.push(KeyNode {
                        key: child,
                        value: e.value.clone(),
                        dir: e.dir,
                        children: Vec::new(),
                    });
                }
            }
        }
        Some(node)
    }
}

struct Inner {
    state: Mutex<State>,
    /// Wakes blocked watchers after every recorded event.
    changed: Notify,
    /// Wakes the TTL sweeper to recompute its deadline.
    ttl_rearm: Notify,
    stop: CancellationToken,
}

/// Shared in-memory key store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store and starts its TTL sweeper.
    pub fn new() -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                entries: BTreeMap::new(),
                log: VecDeque::new(),
                index: 0,
            }),
            changed: Notify::new(),
            ttl_rearm: Notify::new(),
            stop: CancellationToken::new(),
        });

        let sweeper = inner.clone();
        tokio::spawn(async move {
            loop {
                let next = {
                    let mut st = sweeper.state.lock().expect("state lock poisoned");
                    let before = st.index;
                    st.purge_expired(Instant::now());
                    let dirty = st.index != before;
                    let next = st.entries.values().filter_map(|e| e.expires).min();
                    if dirty {
                        sweeper.changed.notify_waiters();
                    }
                    next
                };
                tokio::select! {
                    _ = sweeper.stop.cancelled() => return,
                    _ = sweeper.ttl_rearm.notified() => {}
                    _ = wait_until(next) => {}
                }
            }
        });

        Self { inner }
    }

    /// Shuts the store down; blocked watches return [`StoreError::Closed`].
    pub fn close(&self) {
        self.inner.stop.cancel();
    }

    /// Runs `f` with the locked state; wakes watchers and the sweeper when
    /// events were recorded.
    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let (result, dirty) = {
            let mut st = self.inner.state.lock().expect("state lock poisoned");
            let before = st.index;
            st.purge_expired(Instant::now());
            let result = f(&mut st);
            (result, st.index != before)
        };
        if dirty {
            self.inner.changed.notify_waiters();
            self.inner.ttl_rearm.notify_one();
        }
        result
    }
}

fn norm(key: &str) -> String {
    format!("/{}", key.trim_matches('/'))
}

fn under(key: &str, prefix: &str) -> bool {
    key == prefix || key.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl KeyStore for MemoryStore {
    async fn get(&self, key: &str, recursive: bool) -> Result<(KeyNode, u64), StoreError> {
        let key = norm(key);
        self.with_state(|st| match st.build_node(&key, recursive) {
            Some(node) => Ok((node, st.index)),
            None => Err(StoreError::NotFound { key: key.clone() }),
        })
    }

    async fn create(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<u64, StoreError> {
        let key = norm(key);
        let value = value.to_string();
        self.with_state(|st| {
            if st.entries.contains_key(&key) {
                return Err(StoreError::AlreadyExists { key: key.clone() });
            }
            st.ensure_parents(&key)?;
            st.entries.insert(
                key.clone(),
                Entry {
                    value: Some(value.clone()),
                    dir: false,
                    expires: ttl.map(|t| Instant::now() + t),
                },
            );
            st.record(KeyEventKind::Create, key.clone(), Some(value), false);
            Ok(st.index)
        })
    }

    async fn create_dir(&self, key: &str, ttl: Option<Duration>) -> Result<u64, StoreError> {
        let key = norm(key);
        self.with_state(|st| {
            if st.entries.contains_key(&key) {
                return Err(StoreError::AlreadyExists { key: key.clone() });
            }
            st.ensure_parents(&key)?;
            st.entries.insert(
                key.clone(),
                Entry {
                    value: None,
                    dir: true,
                    expires: ttl.map(|t| Instant::now() + t),
                },
            );
            st.record(KeyEventKind::Create, key.clone(), None, true);
            Ok(st.index)
        })
    }

    async fn refresh(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let key = norm(key);
        self.with_state(|st| {
            let entry = st
                .entries
                .get_mut(&key)
                .ok_or(StoreError::NotFound { key: key.clone() })?;
            // TTL reset only: watchers are deliberately not woken.
            entry.expires = Some(Instant::now() + ttl);
            Ok(st.index)
        })
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<u64, StoreError> {
        let key = norm(key);
        self.with_state(|st| {
            let entry = st
                .entries
                .get(&key)
                .cloned()
                .ok_or(StoreError::NotFound { key: key.clone() })?;
            if entry.dir && !recursive && st.has_children(&key) {
                return Err(StoreError::Transport {
                    reason: format!("{key} is a non-empty directory"),
                });
            }
            st.entries.remove(&key);
            st.remove_subtree(&key);
            st.record(KeyEventKind::Delete, key.clone(), None, entry.dir);
            Ok(st.index)
        })
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<u64, StoreError> {
        let key = norm(key);
        self.with_state(|st| {
            let entry = st
                .entries
                .get(&key)
                .ok_or(StoreError::NotFound { key: key.clone() })?;
            if entry.dir {
                return Err(StoreError::Transport {
                    reason: format!("{key} is a directory"),
                });
            }
            if entry.value.as_deref() != Some(expected) {
                return Err(StoreError::CompareFailed { key: key.clone() });
            }
            st.entries.remove(&key);
            st.record(KeyEventKind::Delete, key.clone(), None, false);
            Ok(st.index)
        })
    }

    async fn add_child(
        &self,
        dir: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<String, StoreError> {
        let dir = norm(dir);
        let value = value.to_string();
        self.with_state(|st| {
            // The directory itself is created on demand.
            st.ensure_parents(&format!("{dir}/x"))?;
            let key = format!("{dir}/{:020}", st.index + 1);
            st.entries.insert(
                key.clone(),
                Entry {
                    value: Some(value.clone()),
                    dir: false,
                    expires: ttl.map(|t| Instant::now() + t),
                },
            );
            st.record(KeyEventKind::Create, key.clone(), Some(value), false);
            Ok(key)
        })
    }

    async fn watch(&self, prefix: &str, after_index: u64) -> Result<KeyEvent, StoreError> {
        let prefix = norm(prefix);
        loop {
            let mut notified = pin!(self.inner.changed.notified());
            let outcome = {
                let mut st = self.inner.state.lock().expect("state lock poisoned");
                let before = st.index;
                st.purge_expired(Instant::now());
                let dirty = st.index != before;

                let outcome = if st.index <= after_index {
                    None
                } else if st.first_logged() > after_index + 1 {
                    Some(Err(StoreError::IndexTooOld { current: st.index }))
                } else {
                    st.log
                        .iter()
                        .find(|e| e.index > after_index && under(&e.key, &prefix))
                        .cloned()
                        .map(Ok)
                };

                if outcome.is_none() {
                    // Register before releasing the lock so an event recorded
                    // in between still wakes this watcher.
                    notified.as_mut().enable();
                }
                drop(st);
                if dirty {
                    self.inner.changed.notify_waiters();
                    self.inner.ttl_rearm.notify_one();
                }
                outcome
            };

            match outcome {
                Some(result) => return result,
                None => tokio::select! {
                    _ = self.inner.stop.cancelled() => return Err(StoreError::Closed),
                    _ = &mut notified => {}
                },
            }
        }
    }
}
