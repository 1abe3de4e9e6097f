//! End-to-end scenarios: single consumers over the embedded broker and
//! multi-node clusters over a shared in-memory key store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use taskherd::kv::{KeyStore, KvClient, KvClusterState, KvCoordinator, MemoryStore};
use taskherd::{
    embedded, handler_fn, Balancer, Client, Command, Config, Consumer, DumbBalancer,
    FairBalancer, HandlerFactory, Task,
};

fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.claim_ttl = Duration::from_secs(5);
    cfg.node_ttl = Duration::from_secs(5);
    cfg
}

/// Handlers that report their task on a channel and block until stopped.
fn tracking_factory(done: bool) -> (Arc<dyn HandlerFactory>, mpsc::UnboundedReceiver<Task>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let factory = handler_fn(move |task: Task, stop: CancellationToken| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(task);
            stop.cancelled().await;
            done
        }
    });
    (factory, rx)
}

async fn start_kv_consumer(
    store: &MemoryStore,
    namespace: &str,
    node_id: &str,
    factory: Arc<dyn HandlerFactory>,
    balancer: Arc<dyn Balancer>,
) -> (Arc<Consumer>, JoinHandle<()>) {
    let coord = Arc::new(KvCoordinator::new(
        Arc::new(store.clone()),
        namespace,
        node_id,
        &test_config(),
    ));
    let consumer = Consumer::new(test_config(), coord, factory, balancer)
        .await
        .expect("consumer construction");
    let runner = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.run().await })
    };
    (consumer, runner)
}

async fn next_task(rx: &mut mpsc::UnboundedReceiver<Task>, what: &str) -> Task {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
        .unwrap_or_else(|| panic!("channel closed waiting for {what}"))
}

async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn ids(consumer: &Consumer) -> Vec<String> {
    consumer.tasks().into_iter().map(|t| t.id).collect()
}

// --- Embedded broker -------------------------------------------------------

#[tokio::test]
async fn embedded_watch_pickup() {
    init_logs();
    let (coord, client) = embedded::embedded_pair("node-1");
    let (factory, mut started) = tracking_factory(false);

    let consumer = Consumer::new(test_config(), coord, factory, Arc::new(DumbBalancer))
        .await
        .expect("consumer");
    let runner = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.run().await })
    };

    client.submit_task("t1", HashMap::new()).await.unwrap();

    let task = next_task(&mut started, "handler start").await;
    assert_eq!(task.id(), "t1");
    assert_eq!(ids(&consumer), vec!["t1"]);

    consumer.shutdown().await;
    runner.await.unwrap();
}

#[tokio::test]
async fn embedded_freeze_holds_tasks_back() {
    let (coord, client) = embedded::embedded_pair("node-1");
    let (factory, mut started) = tracking_factory(false);

    let consumer = Consumer::new(test_config(), coord, factory, Arc::new(DumbBalancer))
        .await
        .expect("consumer");
    let runner = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.run().await })
    };

    client.submit_task("t1", HashMap::new()).await.unwrap();
    next_task(&mut started, "t1 start").await;

    client
        .submit_command("node-1", Command::freeze())
        .await
        .unwrap();
    wait_for("freeze to land", || consumer.frozen()).await;

    client.submit_task("t2", HashMap::new()).await.unwrap();
    assert!(
        timeout(Duration::from_millis(300), started.recv()).await.is_err(),
        "frozen consumer must not claim"
    );
    assert_eq!(ids(&consumer), vec!["t1"]);

    client
        .submit_command("node-1", Command::unfreeze())
        .await
        .unwrap();
    let task = next_task(&mut started, "t2 after unfreeze").await;
    assert_eq!(task.id(), "t2");

    consumer.shutdown().await;
    runner.await.unwrap();
}

#[tokio::test]
async fn embedded_release_requeues_the_task() {
    let (coord, client) = embedded::embedded_pair("node-1");
    let (factory, mut started) = tracking_factory(false);

    let consumer = Consumer::new(test_config(), coord, factory, Arc::new(DumbBalancer))
        .await
        .expect("consumer");
    let runner = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.run().await })
    };

    client.submit_task("t1", HashMap::new()).await.unwrap();
    next_task(&mut started, "first claim").await;

    // stop_task releases, the embedded broker re-enqueues, and the same
    // consumer claims it afresh.
    client
        .submit_command("node-1", Command::stop_task("t1"))
        .await
        .unwrap();
    let task = next_task(&mut started, "reclaim").await;
    assert_eq!(task.id(), "t1");

    consumer.shutdown().await;
    runner.await.unwrap();
}

// --- Distributed broker over a shared in-memory store ----------------------

#[tokio::test]
async fn kv_submitted_props_round_trip() {
    let store = MemoryStore::new();
    let client = KvClient::new(Arc::new(store.clone()), "herd", &test_config());
    let (factory, mut started) = tracking_factory(false);

    let (consumer, runner) =
        start_kv_consumer(&store, "herd", "n1", factory, Arc::new(DumbBalancer)).await;

    client
        .submit_task("t1", HashMap::from([("color".into(), "teal".into())]))
        .await
        .unwrap();

    let task = next_task(&mut started, "handler start").await;
    assert_eq!(task.id(), "t1");
    assert_eq!(task.prop("color"), Some("teal"));
    assert!(task.prop(taskherd::SUBMITTED_PROP).is_some());

    consumer.shutdown().await;
    runner.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn kv_claim_race_has_one_winner() {
    let store = MemoryStore::new();
    let client = KvClient::new(Arc::new(store.clone()), "herd", &test_config());

    let (f1, mut s1) = tracking_factory(false);
    let (f2, mut s2) = tracking_factory(false);
    let (c1, r1) = start_kv_consumer(&store, "herd", "n1", f1, Arc::new(DumbBalancer)).await;
    let (c2, r2) = start_kv_consumer(&store, "herd", "n2", f2, Arc::new(DumbBalancer)).await;

    client.submit_task("t1", HashMap::new()).await.unwrap();

    // Exactly one consumer wins the claim and runs the handler.
    wait_for("one claim", || c1.tasks().len() + c2.tasks().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(c1.tasks().len() + c2.tasks().len(), 1);

    let winner_started = if c1.tasks().len() == 1 { &mut s1 } else { &mut s2 };
    assert_eq!(next_task(winner_started, "winner").await.id(), "t1");

    c1.shutdown().await;
    c2.shutdown().await;
    r1.await.unwrap();
    r2.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn kv_shutdown_releases_for_reclaim() {
    let store = MemoryStore::new();
    let client = KvClient::new(Arc::new(store.clone()), "herd", &test_config());

    let (f1, mut s1) = tracking_factory(false);
    let (c1, r1) = start_kv_consumer(&store, "herd", "n1", f1, Arc::new(DumbBalancer)).await;

    client.submit_task("t1", HashMap::new()).await.unwrap();
    next_task(&mut s1, "first claim").await;
    assert_eq!(ids(&c1), vec!["t1"]);

    // A second consumer watching the same namespace picks the task up once
    // the first releases it on shutdown.
    let (f2, mut s2) = tracking_factory(false);
    let (c2, r2) = start_kv_consumer(&store, "herd", "n2", f2, Arc::new(DumbBalancer)).await;

    c1.shutdown().await;
    r1.await.unwrap();
    assert!(c1.tasks().is_empty());

    assert_eq!(next_task(&mut s2, "reclaim").await.id(), "t1");
    assert_eq!(ids(&c2), vec!["t1"]);

    c2.shutdown().await;
    r2.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn kv_fair_balance_splits_four_two() {
    init_logs();
    let store = MemoryStore::new();
    let client = KvClient::new(Arc::new(store.clone()), "herd", &test_config());

    let (f1, mut s1) = tracking_factory(false);
    let b1 = Arc::new(FairBalancer::new(
        "n1",
        Arc::new(KvClusterState::new(Arc::new(store.clone()), "herd")),
    ));
    let (c1, r1) = start_kv_consumer(&store, "herd", "n1", f1, b1).await;

    for id in ["t1", "t2", "t3", "t4", "t5", "t6"] {
        client.submit_task(id, HashMap::new()).await.unwrap();
    }
    for _ in 0..6 {
        next_task(&mut s1, "initial claims").await;
    }
    assert_eq!(c1.tasks().len(), 6);

    // A second node joins, then the first is told to rebalance.
    let (f2, _s2) = tracking_factory(false);
    let b2 = Arc::new(FairBalancer::new(
        "n2",
        Arc::new(KvClusterState::new(Arc::new(store.clone()), "herd")),
    ));
    let (c2, r2) = start_kv_consumer(&store, "herd", "n2", f2, b2).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    client
        .submit_command("n1", Command::balance())
        .await
        .unwrap();

    // desired = ceil(3 * 1.2) = 4, so the first node sheds two tasks.
    wait_for("4/2 split", || c1.tasks().len() == 4 && c2.tasks().len() == 2).await;

    // Balancing the under-loaded node is a no-op.
    client
        .submit_command("n2", Command::balance())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(c1.tasks().len(), 4);
    assert_eq!(c2.tasks().len(), 2);

    c1.shutdown().await;
    c2.shutdown().await;
    r1.await.unwrap();
    r2.await.unwrap();
}

#[tokio::test]
async fn kv_crashing_handler_finishes_the_task() {
    let store = MemoryStore::new();
    let client = KvClient::new(Arc::new(store.clone()), "herd", &test_config());

    let factory = handler_fn(|_task: Task, _stop: CancellationToken| async {
        panic!("first call always fails");
        #[allow(unreachable_code)]
        false
    });

    let (consumer, runner) =
        start_kv_consumer(&store, "herd", "n1", factory, Arc::new(DumbBalancer)).await;

    client.submit_task("t1", HashMap::new()).await.unwrap();

    // The crash counts as done: the task identity disappears from the
    // broker instead of being released for another try.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        match store.get("/herd/tasks/t1", false).await {
            Err(taskherd::StoreError::NotFound { .. }) => break,
            _ if tokio::time::Instant::now() > deadline => panic!("task was not finalized"),
            _ => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    assert!(consumer.tasks().is_empty());

    consumer.shutdown().await;
    runner.await.unwrap();
}
