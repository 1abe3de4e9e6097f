//! # Type multiplexer: route tasks by their `_type` property.
//!
//! [`TypeMux`] pairs a balancer and a handler factory per task type and
//! dispatches on the reserved [`TYPE_PROP`](crate::task::TYPE_PROP)
//! property. It implements both [`Balancer`] and [`HandlerFactory`], so a
//! single mux is handed to the consumer twice:
//!
//! ```text
//!             ┌─────────────┐
//!   task ───► │   TypeMux   │──► route by _type
//!             └──────┬──────┘
//!        (balancer, handler factory) per type
//! ```
//!
//! Tasks without a `_type` use the default route. Tasks with an unknown
//! `_type` are deferred forever: submit only types the fleet knows, or
//! register [`AlwaysReject`] as the default to refuse untyped tasks.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::balancer::{Balancer, ClaimVerdict};
use crate::coordinator::BalancerContext;
use crate::handler::{Handler, HandlerFactory};
use crate::task::Task;

/// A balancer which ignores every task forever. Useful as a mux default to
/// switch the fallback from accept-everything to reject-everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysReject;

#[async_trait]
impl Balancer for AlwaysReject {
    async fn can_claim(&self, _task: &Task) -> ClaimVerdict {
        ClaimVerdict::DeferUntil(Instant::now() + Duration::from_secs(86_400 * 365 * 100))
    }

    async fn balance(&self) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Clone)]
struct Route {
    factory: Arc<dyn HandlerFactory>,
    balancer: Arc<dyn Balancer>,
}

struct MuxShared {
    routes: RwLock<HashMap<String, Route>>,
    default_route: Route,
}

impl MuxShared {
    fn get(&self, task_type: Option<&str>) -> Option<Route> {
        match task_type {
            None => Some(self.default_route.clone()),
            Some(typ) => self
                .routes
                .read()
                .expect("routes lock poisoned")
                .get(typ)
                .cloned(),
        }
    }
}

/// Routes tasks to per-type `(balancer, handler)` pairs.
#[derive(Clone)]
pub struct TypeMux {
    shared: Arc<MuxShared>,
}

impl TypeMux {
    /// Creates a mux with the route used for tasks carrying no `_type`.
    pub fn new(
        default_factory: Arc<dyn HandlerFactory>,
        default_balancer: Arc<dyn Balancer>,
    ) -> Self {
        Self {
            shared: Arc::new(MuxShared {
                routes: RwLock::new(HashMap::new()),
                default_route: Route {
                    factory: default_factory,
                    balancer: default_balancer,
                },
            }),
        }
    }

    /// Registers the route for a task type. Register all routes before the
    /// consumer starts so `init` reaches every balancer.
    pub fn add(
        &self,
        task_type: impl Into<String>,
        factory: Arc<dyn HandlerFactory>,
        balancer: Arc<dyn Balancer>,
    ) {
        self.shared
            .routes
            .write()
            .expect("routes lock poisoned")
            .insert(task_type.into(), Route { factory, balancer });
    }

    fn balancers(&self) -> Vec<Arc<dyn Balancer>> {
        let routes = self.shared.routes.read().expect("routes lock poisoned");
        let mut distinct: Vec<Arc<dyn Balancer>> =
            vec![self.shared.default_route.balancer.clone()];
        for route in routes.values() {
            if !distinct.iter().any(|b| Arc::ptr_eq(b, &route.balancer)) {
                distinct.push(route.balancer.clone());
            }
        }
        distinct
    }
}

#[async_trait]
impl Balancer for TypeMux {
    /// Initializes every registered balancer. A balancer reused across
    /// types is initialized once.
    fn init(&self, ctx: Arc<dyn BalancerContext>) {
        for balancer in self.balancers() {
            balancer.init(ctx.clone());
        }
    }

    async fn can_claim(&self, task: &Task) -> ClaimVerdict {
        match self.shared.get(task.task_type()) {
            Some(route) => route.balancer.can_claim(task).await,
            None => {
                debug!(task = %task.id(), task_type = ?task.task_type(), "no route; ignoring forever");
                ClaimVerdict::DeferUntil(Instant::now() + Duration::from_secs(86_400 * 365 * 100))
            }
        }
    }

    async fn balance(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut release = Vec::new();
        for balancer in self.balancers() {
            for id in balancer.balance().await {
                if seen.insert(id.clone()) {
                    release.push(id);
                }
            }
        }
        release
    }
}

impl HandlerFactory for TypeMux {
    fn handler(&self) -> Arc<dyn Handler> {
        Arc::new(MuxHandler {
            shared: self.shared.clone(),
            state: tokio::sync::Mutex::new(MuxHandlerState {
                stopped: false,
                inner: None,
            }),
        })
    }
}

struct MuxHandlerState {
    stopped: bool,
    inner: Option<Arc<dyn Handler>>,
}

/// Handler that resolves its route when the task arrives and forwards
/// `stop` to the routed handler.
struct MuxHandler {
    shared: Arc<MuxShared>,
    state: tokio::sync::Mutex<MuxHandlerState>,
}

#[async_trait]
impl Handler for MuxHandler {
    async fn run(&self, task: Task) -> bool {
        let Some(route) = self.shared.get(task.task_type()) else {
            // The routing balancer never admits unknown types; reaching
            // here means the mux was paired with a foreign balancer.
            error!(task = %task.id(), task_type = ?task.task_type(), "no handler route");
            return false;
        };

        let inner = {
            let mut state = self.state.lock().await;
            if state.stopped {
                return false;
            }
            let handler = route.factory.handler();
            state.inner = Some(handler.clone());
            handler
        };

        inner.run(task).await
    }

    async fn stop(&self) {
        let inner = {
            let mut state = self.state.lock().await;
            state.stopped = true;
            state.inner.clone()
        };
        if let Some(handler) = inner {
            handler.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::balancer::DumbBalancer;
    use crate::handler::handler_fn;
    use crate::task::TYPE_PROP;

    fn typed(id: &str, typ: &str) -> Task {
        Task::with_props(id, HashMap::from([(TYPE_PROP.to_string(), typ.to_string())]))
    }

    fn echo_factory(tag: &'static str, log: tokio::sync::mpsc::UnboundedSender<String>) -> Arc<dyn HandlerFactory> {
        handler_fn(move |task: Task, _stop: CancellationToken| {
            let log = log.clone();
            async move {
                let _ = log.send(format!("{tag}:{}", task.id()));
                true
            }
        })
    }

    #[tokio::test]
    async fn routes_claims_by_type() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mux = TypeMux::new(echo_factory("default", tx.clone()), Arc::new(DumbBalancer));
        mux.add("email", echo_factory("email", tx), Arc::new(AlwaysReject));

        assert!(mux.can_claim(&Task::new("untyped")).await.is_accept());
        assert!(!mux.can_claim(&typed("t1", "email")).await.is_accept());
    }

    #[tokio::test]
    async fn unknown_type_is_deferred_forever() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mux = TypeMux::new(echo_factory("default", tx), Arc::new(DumbBalancer));

        match mux.can_claim(&typed("t1", "mystery")).await {
            ClaimVerdict::DeferUntil(until) => {
                assert!(until > Instant::now() + std::time::Duration::from_secs(3600))
            }
            ClaimVerdict::Accept => panic!("unknown type must not be claimable"),
        }
    }

    #[tokio::test]
    async fn handler_resolves_route_at_run_time() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mux = TypeMux::new(echo_factory("default", tx.clone()), Arc::new(DumbBalancer));
        mux.add("email", echo_factory("email", tx), Arc::new(DumbBalancer));

        let handler = mux.handler();
        assert!(handler.run(typed("t1", "email")).await);
        assert_eq!(rx.recv().await.unwrap(), "email:t1");

        let handler = mux.handler();
        assert!(handler.run(Task::new("t2")).await);
        assert_eq!(rx.recv().await.unwrap(), "default:t2");
    }

    #[tokio::test]
    async fn stop_before_run_short_circuits() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mux = TypeMux::new(echo_factory("default", tx), Arc::new(DumbBalancer));

        let handler = mux.handler();
        handler.stop().await;
        assert!(!handler.run(Task::new("t1")).await);
        assert!(rx.try_recv().is_err());
    }
}
