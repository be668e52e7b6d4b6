//! # Chainloc Async Lookup Client
//!
//! Purpose: Client for a chain-replicated object-location service. A pool of
//! persistent TCP connections runs the text wire protocol, a scheduler
//! load-balances and retries queries, and completed results are routed to
//! the consumer on a dedicated delivery task.
//!
//! ## Design Principles
//! 1. **One Strand Per Socket**: Each connection is a task; its state machine
//!    and outstanding table need no locks.
//! 2. **Failures Recycle, Results Deliver**: Connection faults requeue their
//!    queries; only timeouts and exhausted retries surface as failures.
//! 3. **Decoupled Delivery**: Consumer callbacks can block without stalling a
//!    single socket read.

mod client;
mod config;
mod connection;
mod metrics;
mod outstanding;
mod router;
mod scheduler;
mod sink;

pub use client::LookupClient;
pub use config::{ClientConfig, Endpoint};
pub use metrics::{ClientMetrics, MetricsSnapshot};
pub use router::ResultConsumer;
pub use sink::{ErrorSink, ReadyObserver};

// Re-export the shared data model so consumers depend on one crate.
pub use chainloc_common::{
    ChainlocError, ChainlocResult, ConnectionState, DataKey, Entry, OperationResult, Query,
    QueryKind, KEY_WIDTH,
};
