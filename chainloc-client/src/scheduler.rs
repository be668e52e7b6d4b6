//! # Connection Pool Scheduler
//!
//! Purpose: Own a fixed-size pool of query connections and a FIFO of pending
//! queries, hand queries to ready connections, and recycle queries whose
//! connection failed.
//!
//! ## Design Principles
//! 1. **Single Owner**: The FIFO and the connection array belong to one task;
//!    everything else talks to it through messages, never shared mutation.
//! 2. **Random Ready Pick**: Dispatch chooses uniformly among ready
//!    connections so bursts do not pile onto the first slot in the array.
//! 3. **Bounded Retries**: A query is requeued on connection failure until
//!    its retry budget runs out, then dead-lettered as a failure result so a
//!    permanently down node cannot starve the queue silently.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chainloc_common::{ConnectionState, Entry, OperationResult, Query};
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, warn};

use crate::config::Endpoint;
use crate::connection::{ConnectionHandle, QueryConnection};
use crate::metrics::ClientMetrics;
use crate::router::RouterHandle;
use crate::sink::{ErrorSink, ReadyObserver};

/// Cadence of the periodic pass that reconnects dead sockets and drains the
/// queue when no event has done it already. Also the effective backoff
/// between connect attempts to a down node.
const DRAIN_INTERVAL: Duration = Duration::from_millis(50);

enum SchedulerMsg {
    Enqueue(Query),
    Errored(Query),
    StateChanged { conn: usize, state: ConnectionState },
    Shutdown,
}

/// Message endpoint handed to connections as their `ErrorSink` and
/// `ReadyObserver`; it only knows how to post back to the scheduler task.
struct SchedulerLink {
    tx: mpsc::UnboundedSender<SchedulerMsg>,
}

impl ErrorSink for SchedulerLink {
    fn errored_query(&self, query: Query) {
        let _ = self.tx.send(SchedulerMsg::Errored(query));
    }
}

impl ReadyObserver for SchedulerLink {
    fn ready_state_changed(&self, conn: usize, state: ConnectionState) {
        let _ = self.tx.send(SchedulerMsg::StateChanged { conn, state });
    }
}

/// Caller-side handle to one pool.
#[derive(Clone)]
pub(crate) struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerMsg>,
    queue_depth: Arc<AtomicUsize>,
    connections: Vec<ConnectionHandle>,
}

impl SchedulerHandle {
    /// Appends a query to the pool's FIFO. Returns false after shutdown.
    pub fn enqueue(&self, query: Query) -> bool {
        self.tx.send(SchedulerMsg::Enqueue(query)).is_ok()
    }

    /// Queries waiting in the FIFO, not yet handed to a connection.
    pub fn queue_size(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    /// Queries in flight across every connection of this pool.
    pub fn num_still_processing(&self) -> usize {
        self.connections
            .iter()
            .map(ConnectionHandle::num_outstanding)
            .sum()
    }

    /// Stops the pool task; connections wind down when their command
    /// channels close, which closes their sockets and fails in-flight I/O
    /// fast.
    pub fn shutdown(&self) {
        let _ = self.tx.send(SchedulerMsg::Shutdown);
    }
}

pub(crate) struct Scheduler {
    pool: &'static str,
    connections: Vec<ConnectionHandle>,
    endpoints: Vec<Endpoint>,
    queue: VecDeque<Query>,
    /// Guards against double-initializing a connection whose task has not
    /// yet acknowledged the previous `Initialize`.
    connecting: Vec<bool>,
    max_retries: u32,
    router: RouterHandle,
    metrics: Arc<ClientMetrics>,
    queue_depth: Arc<AtomicUsize>,
}

impl Scheduler {
    /// Builds the pool's connections, spawns the scheduler task, and returns
    /// the handle callers enqueue through.
    pub(crate) fn spawn(
        pool: &'static str,
        pool_size: usize,
        endpoints: Vec<Endpoint>,
        query_timeout: Option<Duration>,
        max_retries: u32,
        router: RouterHandle,
        metrics: Arc<ClientMetrics>,
    ) -> SchedulerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue_depth = Arc::new(AtomicUsize::new(0));

        let sink: Arc<dyn ErrorSink> = Arc::new(SchedulerLink { tx: tx.clone() });
        let observer: Arc<dyn ReadyObserver> = Arc::new(SchedulerLink { tx: tx.clone() });
        let connections: Vec<ConnectionHandle> = (0..pool_size)
            .map(|id| {
                QueryConnection::spawn(
                    pool,
                    id,
                    query_timeout,
                    sink.clone(),
                    observer.clone(),
                    router.clone(),
                    metrics.clone(),
                )
            })
            .collect();

        let scheduler = Scheduler {
            pool,
            connections: connections.clone(),
            endpoints,
            queue: VecDeque::new(),
            connecting: vec![false; pool_size],
            max_retries,
            router,
            metrics,
            queue_depth: queue_depth.clone(),
        };
        tokio::spawn(scheduler.run(rx));

        SchedulerHandle {
            tx,
            queue_depth,
            connections,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SchedulerMsg>) {
        // Bring every connection up before traffic arrives.
        for idx in 0..self.connections.len() {
            self.reconnect(idx).await;
        }

        let mut tick = time::interval(DRAIN_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(SchedulerMsg::Enqueue(query)) => {
                        self.queue.push_back(query);
                        self.drain();
                    }
                    Some(SchedulerMsg::Errored(query)) => self.handle_errored(query),
                    Some(SchedulerMsg::StateChanged { conn, state }) => {
                        self.connecting[conn] = false;
                        // A connection that turned ready can take more work
                        // right away; one that lost its socket waits for the
                        // next maintenance pass, which spaces out connect
                        // attempts to a down node.
                        if state == ConnectionState::Ready {
                            self.drain();
                        }
                    }
                    Some(SchedulerMsg::Shutdown) | None => {
                        debug!(pool = self.pool, "scheduler stopped");
                        return;
                    }
                },
                _ = tick.tick() => self.maintain().await,
            }
        }
    }

    async fn maintain(&mut self) {
        for idx in 0..self.connections.len() {
            if self.connections[idx].ready() == ConnectionState::NeedSocket && !self.connecting[idx]
            {
                self.reconnect(idx).await;
            }
        }
        self.drain();
    }

    /// Hands queued queries to ready connections, at most one per connection
    /// per pass; each completed write flips the connection back to ready,
    /// which triggers the next pass.
    fn drain(&mut self) {
        let mut ready: Vec<usize> = (0..self.connections.len())
            .filter(|&idx| self.connections[idx].ready() == ConnectionState::Ready)
            .collect();
        while !self.queue.is_empty() && !ready.is_empty() {
            let pick = ready.swap_remove(fastrand::usize(..ready.len()));
            let Some(query) = self.queue.pop_front() else {
                break;
            };
            if let Err(query) = self.connections[pick].submit(query) {
                // Raced with a state change; the query goes back to the front.
                self.queue.push_front(query);
            }
        }
        self.publish_depth();
    }

    /// The only retry path for write-phase failures: requeue at the back
    /// until the budget runs out, then surface a terminal failure.
    fn handle_errored(&mut self, mut query: Query) {
        query.retries += 1;
        if query.retries > self.max_retries {
            warn!(
                pool = self.pool,
                key = %query.key,
                retries = query.retries,
                "retry budget exhausted, dead-lettering query"
            );
            self.metrics.record_dead_lettered();
            self.router
                .deliver(OperationResult::from_query(&query, Entry::null(), false));
            return;
        }
        debug!(
            pool = self.pool,
            key = %query.key,
            attempt = query.retries,
            "requeueing errored query"
        );
        self.metrics.record_requeued();
        self.queue.push_back(query);
        self.drain();
    }

    async fn reconnect(&mut self, idx: usize) {
        // Endpoints spread round-robin when connections outnumber endpoints.
        let endpoint = self.endpoints[idx % self.endpoints.len()].clone();
        match endpoint.resolve().await {
            Ok(addr) => {
                self.connecting[idx] = true;
                if !self.connections[idx].initialize(addr) {
                    self.connecting[idx] = false;
                }
            }
            Err(err) => {
                warn!(
                    pool = self.pool,
                    conn = idx,
                    endpoint = %endpoint,
                    %err,
                    "endpoint resolution failed"
                );
            }
        }
    }

    fn publish_depth(&self) {
        self.queue_depth.store(self.queue.len(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{self, ResultConsumer};
    use chainloc_common::{DataKey, KEY_WIDTH};
    use std::sync::Mutex;
    use tokio::time::sleep;

    #[derive(Default)]
    struct Recording {
        results: Mutex<Vec<OperationResult>>,
    }

    impl ResultConsumer for Recording {
        fn on_get_result(&self, result: OperationResult) {
            self.results.lock().unwrap().push(result);
        }

        fn on_set_result(&self, result: OperationResult) {
            self.results.lock().unwrap().push(result);
        }
    }

    fn bare_scheduler(max_retries: u32, consumer: Arc<Recording>) -> (Scheduler, Arc<ClientMetrics>) {
        let metrics = Arc::new(ClientMetrics::new());
        let router = router::spawn(consumer, metrics.clone());
        let scheduler = Scheduler {
            pool: "test-pool",
            connections: Vec::new(),
            endpoints: vec![Endpoint::new("127.0.0.1", 1)],
            queue: VecDeque::new(),
            connecting: Vec::new(),
            max_retries,
            router,
            metrics: metrics.clone(),
            queue_depth: Arc::new(AtomicUsize::new(0)),
        };
        (scheduler, metrics)
    }

    #[tokio::test]
    async fn errored_query_requeues_then_dead_letters() {
        let consumer = Arc::new(Recording::default());
        let (mut scheduler, metrics) = bare_scheduler(2, consumer.clone());
        let key = DataKey::new(&[b'0'; KEY_WIDTH]).unwrap();
        let query = Query::set(key, Entry::new(3), true, 42);

        scheduler.handle_errored(query);
        let first = scheduler.queue.pop_front().unwrap();
        assert_eq!(first.retries, 1);
        assert_eq!(first.tracking_id, 42);

        scheduler.handle_errored(first);
        let second = scheduler.queue.pop_front().unwrap();
        assert_eq!(second.retries, 2);

        // Third failure exceeds the budget; the query becomes a failure
        // result instead of going back on the queue.
        scheduler.handle_errored(second);
        assert!(scheduler.queue.is_empty());

        for _ in 0..100 {
            if !consumer.results.lock().unwrap().is_empty() {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        let results = consumer.results.lock().unwrap().clone();
        assert_eq!(results.len(), 1);
        assert!(!results[0].succeeded);
        assert_eq!(results[0].tracking_id, 42);
        assert_eq!(metrics.snapshot().requeued, 2);
        assert_eq!(metrics.snapshot().dead_lettered, 1);
    }
}
