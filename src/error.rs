//! # Error types used by the consumer, coordinators, and clients.
//!
//! This module defines the crate's error enums:
//!
//! - [`ConsumerError`] errors raised while constructing or running a consumer.
//! - [`CoordinatorError`] errors surfaced by coordinator implementations.
//! - [`ClientError`] errors surfaced to task/command submitters.
//! - [`StoreError`] errors from the hierarchical key store backing the
//!   distributed coordinator.
//!
//! Transient broker errors are retried inside the adapters and never reach
//! the consumer; only loss of broker connectivity propagates far enough to
//! shut the consumer down.

use thiserror::Error;

/// Errors produced while constructing or driving a [`Consumer`](crate::Consumer).
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// The coordinator failed its one-time setup; the consumer is unusable.
    #[error("coordinator initialization failed: {0}")]
    Init(#[source] CoordinatorError),

    /// Resource balancer limits were out of range or inverted.
    #[error("limits must be between 1 and 100 with claim < release: claim={claim} release={release}")]
    InvalidLimits {
        /// Claim threshold percentage.
        claim: u32,
        /// Release threshold percentage.
        release: u32,
    },
}

/// Errors surfaced by [`Coordinator`](crate::Coordinator) implementations.
///
/// A coordinator returning an error from `watch` or `command` is fatal to the
/// consumer: the watcher closes the stop signal and an orderly shutdown
/// follows.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// The backing key store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A watch or command stream terminated abnormally.
    #[error("coordinator stream failed: {reason}")]
    Stream {
        /// Human-readable failure description.
        reason: String,
    },
}

/// Errors returned to task and command submitters.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ClientError {
    /// A task with the same ID has already been submitted.
    #[error("task {id:?} already exists")]
    DuplicateTask {
        /// The duplicate task ID.
        id: String,
    },

    /// The broker rejected the submission.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The broker side of the submission channel is gone.
    #[error("submission channel closed")]
    Closed,
}

/// Errors produced by [`KeyStore`](crate::kv::KeyStore) implementations.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum StoreError {
    /// The key does not exist.
    #[error("key not found: {key}")]
    NotFound {
        /// The missing key.
        key: String,
    },

    /// Creation failed because the key already exists.
    #[error("key already exists: {key}")]
    AlreadyExists {
        /// The conflicting key.
        key: String,
    },

    /// A compare-and-delete found a different value than expected.
    #[error("compare failed for key: {key}")]
    CompareFailed {
        /// The contested key.
        key: String,
    },

    /// The requested watch index fell out of the store's event window.
    ///
    /// Watchers must re-read the tree recursively and resume from the
    /// returned index.
    #[error("watch index expired; current index {current}")]
    IndexTooOld {
        /// The store's current index to resume from.
        current: u64,
    },

    /// The store has been closed; blocked watches return this.
    #[error("store closed")]
    Closed,

    /// A transient transport failure; callers may retry.
    #[error("transport error: {reason}")]
    Transport {
        /// Human-readable failure description.
        reason: String,
    },
}
