//! # Consumer and broker-adapter configuration.
//!
//! [`Config`] gathers the tunables that were process-wide mutable state in
//! earlier iterations of this design into a single construction-time record:
//! balance cadence and jitter for the consumer, TTLs for the distributed
//! broker adapter.
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use taskherd::Config;
//!
//! let mut cfg = Config::default();
//! cfg.balance_interval = Duration::from_secs(60);
//! cfg.claim_ttl = Duration::from_secs(30);
//!
//! assert_eq!(cfg.balance_interval, Duration::from_secs(60));
//! ```

use std::time::Duration;

/// Construction-time options for a [`Consumer`](crate::Consumer) and the
/// broker adapters it drives.
///
/// The consumer reads `balance_interval` and `balance_jitter`; the TTLs are
/// consumed by the distributed coordinator and client.
#[derive(Clone, Debug)]
pub struct Config {
    /// Base interval between periodic balance runs.
    pub balance_interval: Duration,

    /// Upper bound of the uniform random jitter added to every balance
    /// interval so a fleet started together does not rebalance in lockstep.
    pub balance_jitter: Duration,

    /// TTL on a task's ownership marker. The coordinator refreshes the
    /// marker at half this interval; if it cannot refresh before the TTL
    /// lapses the claim is lost.
    pub claim_ttl: Duration,

    /// TTL on the node liveness entry. Refreshed at half this interval;
    /// failure to refresh before the deadline closes the coordinator.
    pub node_ttl: Duration,

    /// TTL on submitted commands so commands sent to departed nodes are not
    /// orphaned in the broker forever.
    pub command_ttl: Duration,
}

impl Default for Config {
    /// Provides the default configuration:
    /// - `balance_interval = 15m`
    /// - `balance_jitter = 10s`
    /// - `claim_ttl = 120s`
    /// - `node_ttl = 20s`
    /// - `command_ttl = 7d`
    fn default() -> Self {
        Self {
            balance_interval: Duration::from_secs(15 * 60),
            balance_jitter: Duration::from_secs(10),
            claim_ttl: Duration::from_secs(120),
            node_ttl: Duration::from_secs(20),
            command_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}
