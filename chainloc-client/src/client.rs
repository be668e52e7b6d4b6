//! # Lookup Client Facade
//!
//! Purpose: Expose a compact API over the two pools and the result router.
//! Callers enqueue GET/SET queries and receive every answer through their
//! `ResultConsumer`, exactly once per query.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chainloc_common::{ChainlocError, ChainlocResult, DataKey, Entry, Query};

use crate::config::ClientConfig;
use crate::metrics::{ClientMetrics, MetricsSnapshot};
use crate::router::{self, ResultConsumer};
use crate::scheduler::{Scheduler, SchedulerHandle};

/// Asynchronous client for the chain-replicated lookup service.
///
/// Owns one pool of connections for GET traffic and one for SET traffic.
/// `get`/`set` only enqueue; results arrive later on the consumer's
/// callbacks, which run on a delivery task separate from all socket I/O.
pub struct LookupClient {
    get_pool: SchedulerHandle,
    set_pool: SchedulerHandle,
    metrics: Arc<ClientMetrics>,
    next_tracking_id: AtomicU64,
}

impl LookupClient {
    /// Starts the pools and the router. Must be called within a tokio
    /// runtime; the tasks stop when the client is dropped.
    pub fn new(config: ClientConfig, consumer: Arc<dyn ResultConsumer>) -> ChainlocResult<Self> {
        config.validate()?;
        let metrics = Arc::new(ClientMetrics::new());
        let router = router::spawn(consumer, metrics.clone());

        let get_pool = Scheduler::spawn(
            "get-pool",
            config.get_connections,
            config.endpoints.clone(),
            config.get_timeout,
            config.max_retries,
            router.clone(),
            metrics.clone(),
        );
        // SETs carry no deadline: a write must eventually be answered or
        // retried, never silently dropped on a timer.
        let set_pool = Scheduler::spawn(
            "set-pool",
            config.set_connections,
            config.endpoints,
            None,
            config.max_retries,
            router,
            metrics.clone(),
        );

        Ok(LookupClient {
            get_pool,
            set_pool,
            metrics,
            next_tracking_id: AtomicU64::new(1),
        })
    }

    /// Enqueues a lookup for `key`. The answer arrives via `on_get_result`;
    /// a missing assignment is a successful result with a null entry.
    pub fn get(&self, key: DataKey) -> ChainlocResult<()> {
        self.metrics.record_enqueued();
        if self.get_pool.enqueue(Query::get(key)) {
            Ok(())
        } else {
            Err(ChainlocError::Closed)
        }
    }

    /// Enqueues an assignment write. With `tracking` the returned ID is
    /// echoed back on the matching `on_set_result`; untracked sets return 0.
    pub fn set(&self, key: DataKey, entry: Entry, tracking: bool) -> ChainlocResult<u64> {
        let tracking_id = if tracking {
            self.next_tracking_id.fetch_add(1, Ordering::Relaxed)
        } else {
            0
        };
        self.metrics.record_enqueued();
        if self
            .set_pool
            .enqueue(Query::set(key, entry, tracking, tracking_id))
        {
            Ok(tracking_id)
        } else {
            Err(ChainlocError::Closed)
        }
    }

    /// Queries waiting in the FIFOs, not yet handed to any connection.
    pub fn queue_size(&self) -> usize {
        self.get_pool.queue_size() + self.set_pool.queue_size()
    }

    /// Queries submitted to a connection and still awaiting their result.
    pub fn num_still_processing(&self) -> usize {
        self.get_pool.num_still_processing() + self.set_pool.num_still_processing()
    }

    /// Point-in-time counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl Drop for LookupClient {
    fn drop(&mut self) {
        self.get_pool.shutdown();
        self.set_pool.shutdown();
    }
}
