//! # Deferred-retry set for balancer-rejected tasks.
//!
//! When a balancer turns a candidate down it names the instant at which the
//! task becomes eligible again. The ignore manager remembers those entries,
//! sleeps until the earliest deadline, and re-injects expired tasks into the
//! consumer's inbound channel so the main loop reconsiders them.
//!
//! ```text
//!   balancer ──(defer until)──► IgnoreManager ──(deadline hit)──► task channel
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::task::Task;

/// Tracks `(task, until)` entries and re-submits them once expired.
#[derive(Clone)]
pub(crate) struct IgnoreManager {
    entries: Arc<Mutex<HashMap<String, (Task, Instant)>>>,
    rearm: Arc<Notify>,
}

impl IgnoreManager {
    /// Starts the manager task. It owns the earliest-deadline timer and
    /// exits when `stop` is cancelled.
    pub(crate) fn spawn(resubmit: mpsc::Sender<Task>, stop: CancellationToken) -> Self {
        let mgr = Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            rearm: Arc::new(Notify::new()),
        };

        let entries = mgr.entries.clone();
        let rearm = mgr.rearm.clone();
        tokio::spawn(async move {
            loop {
                let next = entries
                    .lock()
                    .expect("ignore lock poisoned")
                    .values()
                    .map(|(_, until)| *until)
                    .min();

                tokio::select! {
                    _ = stop.cancelled() => return,
                    // A sooner deadline arrived; recompute the timer.
                    _ = rearm.notified() => continue,
                    _ = wait_until(next) => {}
                }

                let now = Instant::now();
                let expired: Vec<Task> = {
                    let mut entries = entries.lock().expect("ignore lock poisoned");
                    let ids: Vec<String> = entries
                        .iter()
                        .filter(|(_, (_, until))| *until <= now)
                        .map(|(id, _)| id.clone())
                        .collect();
                    ids.iter()
                        .filter_map(|id| entries.remove(id))
                        .map(|(task, _)| task)
                        .collect()
                };

                for task in expired {
                    debug!(task = %task.id(), "ignore expired; resubmitting");
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        res = resubmit.send(task) => {
                            if res.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        mgr
    }

    /// Records or updates an entry. Rearms the timer when the new deadline
    /// is sooner than the pending one.
    pub(crate) fn add(&self, task: Task, until: Instant) {
        self.entries
            .lock()
            .expect("ignore lock poisoned")
            .insert(task.id().to_string(), (task, until));
        self.rearm.notify_one();
    }

    /// True iff an entry exists and its deadline has not passed.
    pub(crate) fn is_ignored(&self, task_id: &str) -> bool {
        self.entries
            .lock()
            .expect("ignore lock poisoned")
            .get(task_id)
            .is_some_and(|(_, until)| *until > Instant::now())
    }

    /// Sorted snapshot of the currently ignored task IDs.
    pub(crate) fn all(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .lock()
            .expect("ignore lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort_unstable();
        ids
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn resubmits_after_deadline() {
        let (tx, mut rx) = mpsc::channel(4);
        let stop = CancellationToken::new();
        let mgr = IgnoreManager::spawn(tx, stop.clone());

        mgr.add(Task::new("t1"), Instant::now() + Duration::from_millis(20));
        assert!(mgr.is_ignored("t1"));
        assert_eq!(mgr.all(), vec!["t1".to_string()]);

        let task = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("deadline")
            .expect("task");
        assert_eq!(task.id(), "t1");
        assert!(!mgr.is_ignored("t1"));

        stop.cancel();
    }

    #[tokio::test]
    async fn sooner_deadline_rearms_timer() {
        let (tx, mut rx) = mpsc::channel(4);
        let stop = CancellationToken::new();
        let mgr = IgnoreManager::spawn(tx, stop.clone());

        mgr.add(Task::new("slow"), Instant::now() + Duration::from_secs(300));
        mgr.add(Task::new("fast"), Instant::now() + Duration::from_millis(20));

        let task = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("deadline")
            .expect("task");
        assert_eq!(task.id(), "fast");
        assert!(mgr.is_ignored("slow"));

        stop.cancel();
    }

    #[tokio::test]
    async fn expired_entries_are_not_ignored() {
        let (tx, _rx) = mpsc::channel(4);
        let mgr = IgnoreManager::spawn(tx, CancellationToken::new());

        // An entry whose deadline already passed no longer gates admission,
        // even before the timer removes it.
        mgr.add(Task::new("t1"), Instant::now());
        assert!(!mgr.is_ignored("t1"));
    }
}
