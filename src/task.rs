//! # Task values and per-task running state.
//!
//! [`Task`] is the immutable value coordinators surface to the consumer: a
//! unique ID plus an opaque string property map. Property keys beginning
//! with an underscore are reserved for the framework (see [`SUBMITTED_PROP`]
//! and [`TYPE_PROP`]).
//!
//! [`RunningTask`] is the consumer's per-task bookkeeping once a task has
//! been claimed: the handler instance, when the task was admitted, and when
//! (if ever) a stop was first requested. [`TaskSnapshot`] is the cheap,
//! serializable view handed to balancers and introspection callers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::handler::Handler;

/// Reserved property holding the RFC3339 submission timestamp.
pub const SUBMITTED_PROP: &str = "_submitted";

/// Reserved property used by the type multiplexer to route tasks.
pub const TYPE_PROP: &str = "_type";

/// An immutable work item: a unique ID and an opaque property map.
///
/// Tasks are cheap to clone; the payload is shared.
#[derive(Clone, Debug)]
pub struct Task {
    inner: Arc<TaskInner>,
}

#[derive(Debug)]
struct TaskInner {
    id: String,
    props: HashMap<String, String>,
}

impl Task {
    /// Creates a task with an empty property map.
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_props(id, HashMap::new())
    }

    /// Creates a task with the given properties.
    pub fn with_props(id: impl Into<String>, props: HashMap<String, String>) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                id: id.into(),
                props,
            }),
        }
    }

    /// Returns the unique task identifier.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Returns the metadata property map. It is never mutated after
    /// submission.
    pub fn props(&self) -> &HashMap<String, String> {
        &self.inner.props
    }

    /// Returns a single property value.
    pub fn prop(&self, key: &str) -> Option<&str> {
        self.inner.props.get(key).map(String::as_str)
    }

    /// Returns the routing type ([`TYPE_PROP`]), if any.
    pub fn task_type(&self) -> Option<&str> {
        self.prop(TYPE_PROP)
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id && self.inner.props == other.inner.props
    }
}

impl Eq for Task {}

/// A claimed task paired with its handler and lifecycle timestamps.
///
/// `stopped` is set exactly once, on the first stop request; repeated stop
/// requests only re-signal the handler.
pub struct RunningTask {
    task: Task,
    handler: Arc<dyn Handler>,

    started: Instant,
    started_at: DateTime<Utc>,

    // Serializes Handler::stop calls so implementations don't have to.
    stop_gate: tokio::sync::Mutex<()>,
    stopped: Mutex<Option<(Instant, DateTime<Utc>)>>,
}

impl RunningTask {
    pub(crate) fn new(task: Task, handler: Arc<dyn Handler>) -> Self {
        Self {
            task,
            handler,
            started: Instant::now(),
            started_at: Utc::now(),
            stop_gate: tokio::sync::Mutex::new(()),
            stopped: Mutex::new(None),
        }
    }

    /// The underlying task value.
    pub fn task(&self) -> &Task {
        &self.task
    }

    pub(crate) fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    /// When the consumer admitted the task.
    pub fn started(&self) -> Instant {
        self.started
    }

    /// The instant stop was first requested, or `None` if it never was.
    pub fn stopped(&self) -> Option<Instant> {
        self.stopped.lock().expect("stopped lock poisoned").map(|(i, _)| i)
    }

    /// Requests the handler to stop. The first call records the stop
    /// instant; every call forwards to [`Handler::stop`], serialized.
    pub(crate) async fn stop(&self) {
        let _gate = self.stop_gate.lock().await;
        {
            let mut stopped = self.stopped.lock().expect("stopped lock poisoned");
            if stopped.is_none() {
                *stopped = Some((Instant::now(), Utc::now()));
            }
        }
        self.handler.stop().await;
    }

    /// A serializable point-in-time view of this task.
    pub fn snapshot(&self) -> TaskSnapshot {
        let stopped = self.stopped.lock().expect("stopped lock poisoned");
        TaskSnapshot {
            id: self.task.id().to_string(),
            props: self.task.props().clone(),
            started: self.started_at,
            stopped: stopped.map(|(_, at)| at),
            started_instant: self.started,
            stopping: stopped.is_some(),
        }
    }
}

/// Point-in-time view of a running task, safe to hold outside the
/// consumer's locks.
#[derive(Clone, Debug, Serialize)]
pub struct TaskSnapshot {
    /// Task identifier.
    pub id: String,
    /// Task properties as submitted (plus reserved entries).
    pub props: HashMap<String, String>,
    /// Wall-clock admission time.
    pub started: DateTime<Utc>,
    /// Wall-clock time stop was first requested, if it was.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped: Option<DateTime<Utc>>,

    /// Monotonic admission time, for age comparisons.
    #[serde(skip)]
    pub(crate) started_instant: Instant,
    /// Whether a stop has been requested.
    #[serde(skip)]
    pub(crate) stopping: bool,
}

impl TaskSnapshot {
    /// True once a stop has been requested for the task.
    pub fn is_stopping(&self) -> bool {
        self.stopping
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    struct CountingHandler {
        stops: AtomicUsize,
    }

    #[async_trait]
    impl Handler for CountingHandler {
        async fn run(&self, _task: Task) -> bool {
            true
        }

        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn stop_records_first_instant_only() {
        let handler = Arc::new(CountingHandler {
            stops: AtomicUsize::new(0),
        });
        let rt = RunningTask::new(Task::new("t1"), handler.clone());
        assert!(rt.stopped().is_none());

        rt.stop().await;
        let first = rt.stopped().expect("stopped set");

        rt.stop().await;
        assert_eq!(rt.stopped(), Some(first));
        assert_eq!(handler.stops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn snapshot_serializes_without_stopped() {
        let rt = RunningTask::new(
            Task::with_props("t1", HashMap::from([("k".into(), "v".into())])),
            Arc::new(CountingHandler {
                stops: AtomicUsize::new(0),
            }),
        );
        let js = serde_json::to_value(rt.snapshot()).expect("serialize");
        assert_eq!(js["id"], "t1");
        assert_eq!(js["props"]["k"], "v");
        assert!(js.get("stopped").is_none());
    }

    #[test]
    fn reserved_type_prop_is_exposed() {
        let task = Task::with_props("t1", HashMap::from([(TYPE_PROP.into(), "email".into())]));
        assert_eq!(task.task_type(), Some("email"));
        assert!(Task::new("t2").task_type().is_none());
    }
}
