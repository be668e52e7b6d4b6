//! Capability interfaces a connection needs from its owner.
//!
//! Connections are constructed with these rather than a reference to the
//! scheduler's full type, so the dependency points one way only.

use chainloc_common::{ConnectionState, Query};

/// Receiver for queries whose in-flight write failed.
///
/// The implementor decides what failure means; the scheduler requeues until
/// the retry budget runs out.
pub trait ErrorSink: Send + Sync {
    fn errored_query(&self, query: Query);
}

/// Notified whenever a connection's observable state changes.
///
/// The scheduler uses this to drain its queue the moment a connection turns
/// `Ready` and to trigger reconnects when one reports `NeedSocket`.
pub trait ReadyObserver: Send + Sync {
    fn ready_state_changed(&self, conn: usize, state: ConnectionState);
}
