//! # The consumer core: watch, claim, run, rebalance.
//!
//! [`Consumer`] owns the running-task map and a strictly single-threaded
//! main loop that serializes every admission and balancing decision. Around
//! it run a handful of subordinate tasks:
//!
//! ```text
//!   Coordinator ──watch──► task channel ──┐
//!   Coordinator ──command──► cmd channel ─┼──► main loop ──► claim ──► handler task
//!   balance ticker ──► balance channel ───┘        │
//!   IgnoreManager ◄── deferred tasks ◄─────────────┘
//! ```
//!
//! The stop signal is a [`CancellationToken`] closed exactly once; handler
//! tasks are joined through a [`TaskTracker`] on shutdown. No lock is ever
//! held across coordinator I/O or user handler code.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::balancer::{Balancer, ClaimVerdict};
use crate::command::{self, Command};
use crate::config::Config;
use crate::coordinator::{BalancerContext, Coordinator, CoordinatorContext};
use crate::error::ConsumerError;
use crate::handler::HandlerFactory;
use crate::ignore::IgnoreManager;
use crate::task::{RunningTask, Task, TaskSnapshot};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    Exited,
}

/// Consumer state shared with subordinate tasks and the context adapter.
struct Shared {
    /// task ID → running task. Claims are the only producer; handler exit
    /// is the only remover.
    running: Mutex<HashMap<String, Arc<RunningTask>>>,

    /// One-shot stop signal observable from every subsystem.
    stop: CancellationToken,

    /// Live handler tasks, joined on shutdown.
    handlers: TaskTracker,
}

impl Shared {
    /// Closes the stop signal. The running-map lock serializes this with
    /// the admission path's stop re-check.
    fn close(&self) {
        let _guard = self.running.lock().expect("running lock poisoned");
        if !self.stop.is_cancelled() {
            debug!("stopping run loop");
            self.stop.cancel();
        }
    }

    /// Snapshots of all running tasks in lexicographic ID order.
    fn snapshots(&self) -> Vec<TaskSnapshot> {
        let running = self.running.lock().expect("running lock poisoned");
        let mut tasks: Vec<TaskSnapshot> = running.values().map(|rt| rt.snapshot()).collect();
        tasks.sort_unstable_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    /// Asynchronously requests a running task's handler to stop. Stop calls
    /// are serialized per task by the running task itself.
    fn stop_task(&self, task_id: &str) {
        let rt = {
            let running = self.running.lock().expect("running lock poisoned");
            running.get(task_id).cloned()
        };

        // Tasks may complete between a balance decision and the stop
        // request; that is not an error.
        let Some(rt) = rt else {
            warn!(task = %task_id, "tried to stop a non-running task");
            return;
        };

        let task_id = task_id.to_string();
        tokio::spawn(async move {
            // The inner spawn contains a panicking Handler::stop.
            let join = tokio::spawn({
                let rt = rt.clone();
                async move { rt.stop().await }
            });
            if let Err(err) = join.await {
                if err.is_panic() {
                    error!(task = %task_id, error = %err, "handler panicked on stop");
                }
            }
        });
    }
}

/// Narrow read-only view of the consumer handed to the balancer and the
/// coordinator; keeping it to two operations breaks the reference cycle.
struct ConsumerCtx {
    shared: Arc<Shared>,
}

impl BalancerContext for ConsumerCtx {
    fn tasks(&self) -> Vec<TaskSnapshot> {
        self.shared.snapshots()
    }
}

impl CoordinatorContext for ConsumerCtx {
    fn lost(&self, task_id: &str) {
        warn!(task = %task_id, "task ownership lost; stopping it locally");
        self.shared.stop_task(task_id);
    }
}

/// The core task runner. See the [module docs](self) for the event flow.
pub struct Consumer {
    cfg: Config,
    coord: Arc<dyn Coordinator>,
    factory: Arc<dyn HandlerFactory>,
    balancer: Arc<dyn Balancer>,

    shared: Arc<Shared>,
    ignores: IgnoreManager,

    tasks_tx: mpsc::Sender<Task>,
    tasks_rx: Mutex<Option<mpsc::Receiver<Task>>>,

    frozen: Mutex<bool>,
    run_state: watch::Sender<RunState>,
}

impl Consumer {
    /// Creates a consumer and initializes the balancer and coordinator, in
    /// that order. Fails if the coordinator's setup fails.
    pub async fn new(
        cfg: Config,
        coord: Arc<dyn Coordinator>,
        factory: Arc<dyn HandlerFactory>,
        balancer: Arc<dyn Balancer>,
    ) -> Result<Arc<Self>, ConsumerError> {
        // Capacity 1: while the main loop is frozen or busy, candidates
        // queue at the coordinator, not here.
        let (tasks_tx, tasks_rx) = mpsc::channel(1);

        let shared = Arc::new(Shared {
            running: Mutex::new(HashMap::new()),
            stop: CancellationToken::new(),
            handlers: TaskTracker::new(),
        });
        let ignores = IgnoreManager::spawn(tasks_tx.clone(), shared.stop.clone());

        let ctx = Arc::new(ConsumerCtx {
            shared: shared.clone(),
        });
        balancer.init(ctx.clone());
        if let Err(err) = coord.init(ctx).await {
            shared.stop.cancel();
            return Err(ConsumerError::Init(err));
        }

        let (run_state, _) = watch::channel(RunState::Idle);

        Ok(Arc::new(Self {
            cfg,
            coord,
            factory,
            balancer,
            shared,
            ignores,
            tasks_tx,
            tasks_rx: Mutex::new(Some(tasks_rx)),
            frozen: Mutex::new(false),
            run_state,
        }))
    }

    /// Runs the consumer until [`shutdown`](Consumer::shutdown) is called
    /// or the coordinator fails.
    pub async fn run(&self) {
        let Some(mut tasks_rx) = self
            .tasks_rx
            .lock()
            .expect("tasks receiver lock poisoned")
            .take()
        else {
            warn!("run called more than once");
            return;
        };

        debug!("starting consumer");
        self.run_state.send_replace(RunState::Running);

        let (balance_tx, mut balance_rx) = mpsc::channel::<()>(1);
        self.spawn_balance_ticker(balance_tx);
        self.spawn_watcher();
        let mut cmd_rx = self.spawn_command_poller();

        // Main loop: every admission and balancing decision is serialized
        // here. While frozen only stop and commands are consumed.
        loop {
            if self.frozen() {
                tokio::select! {
                    _ = self.shared.stop.cancelled() => break,
                    cmd = cmd_rx.recv() => match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            debug!("command channel closed; exiting main loop");
                            break;
                        }
                    }
                }
                continue;
            }

            tokio::select! {
                _ = self.shared.stop.cancelled() => break,
                Some(()) = balance_rx.recv() => self.balance().await,
                Some(task) = tasks_rx.recv() => self.on_task(task).await,
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        debug!("command channel closed; exiting main loop");
                        break;
                    }
                }
            }
        }

        self.finish().await;
        self.run_state.send_replace(RunState::Exited);
    }

    /// Stops the main loop, asks every handler to stop, and waits for the
    /// handlers and [`run`](Consumer::run) to finish. Running tasks are
    /// released for other nodes to claim. Idempotent.
    pub async fn shutdown(&self) {
        self.shared.close();

        self.shared.handlers.close();
        self.shared.handlers.wait().await;

        // Wait for run() to exit fully so the coordinator has been closed
        // and every previously running task released before returning.
        let mut state = self.run_state.subscribe();
        let _ = state.wait_for(|s| *s != RunState::Running).await;
    }

    /// Lexicographically sorted snapshots of the currently running tasks.
    pub fn tasks(&self) -> Vec<TaskSnapshot> {
        self.shared.snapshots()
    }

    /// Sorted IDs of all currently ignored tasks.
    pub fn ignores(&self) -> Vec<String> {
        self.ignores.all()
    }

    /// True while the consumer is frozen: running tasks continue but no new
    /// tasks are claimed and no balancing runs. Frozen state is not
    /// persisted across restarts.
    pub fn frozen(&self) -> bool {
        *self.frozen.lock().expect("frozen lock poisoned")
    }

    fn spawn_balance_ticker(&self, balance_tx: mpsc::Sender<()>) {
        let stop = self.shared.stop.clone();
        let interval = self.cfg.balance_interval;
        let jitter_max = self.cfg.balance_jitter;

        tokio::spawn(async move {
            loop {
                let wait = jittered(interval, jitter_max);
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = sleep(wait) => {}
                }
                info!("balance tick");
                tokio::select! {
                    _ = stop.cancelled() => return,
                    res = balance_tx.send(()) => {
                        if res.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }

    fn spawn_watcher(&self) {
        let coord = self.coord.clone();
        let shared = self.shared.clone();
        let out = self.tasks_tx.clone();

        tokio::spawn(async move {
            if let Err(err) = coord.watch(out).await {
                error!(error = %err, "exiting: coordinator watch failed");
            }
            // The watcher ending for any reason closes the consumer.
            shared.close();
        });
    }

    fn spawn_command_poller(&self) -> mpsc::Receiver<Command> {
        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(1);
        let coord = self.coord.clone();
        let stop = self.shared.stop.clone();

        tokio::spawn(async move {
            loop {
                let cmd = match coord.command().await {
                    Err(err) => {
                        error!(error = %err, "exiting: coordinator command stream failed");
                        return;
                    }
                    Ok(None) => {
                        debug!("command coordinator exited");
                        return;
                    }
                    Ok(Some(cmd)) => cmd,
                };
                tokio::select! {
                    _ = stop.cancelled() => return,
                    res = cmd_tx.send(cmd) => {
                        if res.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        cmd_rx
    }

    async fn on_task(&self, task: Task) {
        let tid = task.id().to_string();

        if self.ignores.is_ignored(&tid) {
            debug!(task = %tid, "task ignored");
            return;
        }

        match self.balancer.can_claim(&task).await {
            ClaimVerdict::DeferUntil(until) => {
                info!(task = %tid, until = ?until, "balancer rejected task");
                self.ignores.add(task, until);
                return;
            }
            ClaimVerdict::Accept => {}
        }

        if !self.coord.claim(&tid).await {
            debug!(task = %tid, "unable to claim task");
            return;
        }

        self.claimed(task);
    }

    /// Starts a handler for a claimed task. Sole producer for the running
    /// map.
    fn claimed(&self, task: Task) {
        let handler = self.factory.handler();
        let rt = Arc::new(RunningTask::new(task, handler));
        let tid = rt.task().id().to_string();

        debug!(task = %tid, "attempting to start task");

        // The stop re-check and the handler spawn share this locked region
        // so shutdown cannot start joining handlers while an admission is
        // in flight.
        let mut running = self.shared.running.lock().expect("running lock poisoned");
        if self.shared.stop.is_cancelled() {
            // Shutting down; the unclaimed marker is left to lapse.
            return;
        }
        if running.contains_key(&tid) {
            // A coordinator re-surfacing a claimed task is a broker bug.
            warn!(task = %tid, "attempted to claim an already running task");
            return;
        }
        running.insert(tid, rt.clone());

        self.shared
            .handlers
            .spawn(run_task(self.shared.clone(), self.coord.clone(), rt));
    }

    async fn balance(&self) {
        let release = self.balancer.balance().await;
        if !release.is_empty() {
            info!(tasks = ?release, "balancer releasing");
        }
        for task_id in release {
            self.shared.stop_task(&task_id);
        }
    }

    async fn handle_command(&self, cmd: Command) {
        debug!(command = %cmd, "received command");
        match cmd.name() {
            command::FREEZE => {
                let mut frozen = self.frozen.lock().expect("frozen lock poisoned");
                if *frozen {
                    info!("ignoring freeze command: already frozen");
                    return;
                }
                info!("freezing");
                *frozen = true;
            }
            command::UNFREEZE => {
                let mut frozen = self.frozen.lock().expect("frozen lock poisoned");
                if !*frozen {
                    info!("ignoring unfreeze command: not frozen");
                    return;
                }
                info!("unfreezing");
                *frozen = false;
            }
            command::RUN_BALANCE => {
                info!("balancing due to command");
                self.balance().await;
            }
            command::STOP_TASK => match cmd.stop_task_target() {
                Some(task_id) => {
                    info!(task = %task_id, "stopping task due to command");
                    self.shared.stop_task(task_id);
                }
                None => error!("stop_task command did not contain a valid task"),
            },
            other => warn!(command = %other, "discarding unknown command"),
        }
    }

    /// Run-exit cleanup: close the coordinator, stop what is still running,
    /// join the handlers.
    async fn finish(&self) {
        debug!("closing coordinator");
        self.coord.close().await;

        let tasks = self.tasks();
        info!(handlers = tasks.len(), "coordinator closed; sending stop signals");
        for task in &tasks {
            self.shared.stop_task(&task.id);
        }

        info!("waiting for handlers to exit");
        self.shared.handlers.close();
        self.shared.handlers.wait().await;
    }
}

/// Drives one handler to completion and settles the claim. Handler panics
/// are contained here: a crashing task is finalized, never rescheduled.
async fn run_task(shared: Arc<Shared>, coord: Arc<dyn Coordinator>, rt: Arc<RunningTask>) {
    let tid = rt.task().id().to_string();
    info!(task = %tid, "task started");

    let join = tokio::spawn({
        let rt = rt.clone();
        async move {
            let task = rt.task().clone();
            rt.handler().run(task).await
        }
    });

    let done = match join.await {
        Ok(done) => done,
        Err(err) => {
            error!(task = %tid, error = %err, "handler aborted; finalizing task");
            true
        }
    };

    // Sole remover for the running map; the entry is gone before the
    // coordinator learns the outcome.
    shared
        .running
        .lock()
        .expect("running lock poisoned")
        .remove(&tid);

    let status = if done {
        coord.done(&tid).await;
        "done"
    } else {
        coord.release(&tid).await;
        "released"
    };

    match rt.stopped() {
        None => info!(task = %tid, status, "task exited"),
        Some(stopped) => {
            info!(task = %tid, status, elapsed = ?stopped.elapsed(), "task exited after stop")
        }
    }
}

fn jittered(interval: Duration, jitter_max: Duration) -> Duration {
    let max_ms = jitter_max.as_millis() as u64;
    if max_ms == 0 {
        return interval;
    }
    let jitter = {
        let mut rng = rand::rng();
        rng.random_range(0..=max_ms)
    };
    interval + Duration::from_millis(jitter)
}
