//! # taskherd
//!
//! **Taskherd** is a cooperatively balanced distributed task consumer.
//!
//! Worker nodes watch a shared broker for tasks, claim them via exclusive
//! ephemeral ownership markers, run user-supplied handlers, shed work when
//! they hold more than their fair share, and answer out-of-band control
//! commands. There is no master: every node balances itself.
//!
//! ## Features
//!
//! | Area | Description | Key types / traits |
//! |------|-------------|--------------------|
//! | **Consumer** | Single-threaded orchestration loop: claim, run, rebalance, shutdown. | [`Consumer`], [`Config`] |
//! | **Handlers** | User workers, one fresh instance per claimed task. | [`Handler`], [`HandlerFactory`], [`handler_fn`] |
//! | **Balancers** | Local claim/release policies. | [`Balancer`], [`FairBalancer`], [`ResourceBalancer`], [`TypeMux`] |
//! | **Coordinators** | Broker adapters: candidate streams, claims, commands. | [`Coordinator`], [`kv::KvCoordinator`], [`embedded`] |
//! | **Clients** | Task and command submission. | [`Client`], [`kv::KvClient`] |
//! | **Errors** | Typed errors per subsystem. | [`ConsumerError`], [`StoreError`] |
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use taskherd::{
//!     embedded, handler_fn, Client, Config, Consumer, DumbBalancer, Task,
//! };
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (coord, client) = embedded::embedded_pair("node-1");
//!
//!     // One fresh handler per claimed task.
//!     let factory = handler_fn(|task: Task, stop: CancellationToken| async move {
//!         println!("working on {}", task.id());
//!         stop.cancelled().await;
//!         false // released, not done
//!     });
//!
//!     let consumer = Consumer::new(
//!         Config::default(),
//!         coord,
//!         factory,
//!         Arc::new(DumbBalancer),
//!     )
//!     .await?;
//!
//!     client.submit_task("greet", Default::default()).await?;
//!
//!     let runner = consumer.clone();
//!     tokio::spawn(async move { runner.run().await });
//!     // ... later:
//!     consumer.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ---

mod balancer;
mod client;
mod command;
mod config;
mod consumer;
mod coordinator;
mod error;
mod handler;
mod ignore;
mod mux;
mod task;

pub mod embedded;
pub mod kv;

// ---- Public re-exports ----

pub use balancer::{
    Balancer, BalancerMux, ClaimVerdict, ClusterState, DumbBalancer, FairBalancer,
    ResourceBalancer, ResourceReporter,
};
pub use client::Client;
pub use command::{Command, FREEZE, RUN_BALANCE, STOP_TASK, UNFREEZE};
pub use config::Config;
pub use consumer::Consumer;
pub use coordinator::{BalancerContext, Coordinator, CoordinatorContext};
pub use error::{ClientError, ConsumerError, CoordinatorError, StoreError};
pub use handler::{handler_fn, FnHandler, Handler, HandlerFactory};
pub use mux::{AlwaysReject, TypeMux};
pub use task::{RunningTask, Task, TaskSnapshot, SUBMITTED_PROP, TYPE_PROP};
