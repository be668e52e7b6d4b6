//! # Query Connection
//!
//! Purpose: Own one TCP socket to one lookup node and run its protocol state
//! machine: connect, write queries, decode responses, and recycle the socket
//! on any fault without losing the queries it was carrying.
//!
//! ## Design Principles
//! 1. **One Task, One Socket**: Each connection runs on its own task, so
//!    connect/write/read are strictly serialized and the outstanding table
//!    needs no lock.
//! 2. **The Table Outlives the Socket**: `initialize` installs a fresh socket
//!    but never clears the outstanding table; queries awaiting a response are
//!    re-sent once the connection is ready again.
//! 3. **Mid-Write Queries Go Back**: A query whose write failed is reported
//!    to the `ErrorSink` for rescheduling on another connection; it never
//!    just disappears.
//! 4. **Deadlines Settle Races By Removal**: Whichever of response arrival
//!    and deadline firing removes the table entry first wins; the loser finds
//!    nothing and does nothing.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chainloc_common::{
    encode_get, encode_set, ConnectionState, DataKey, Entry, OperationResult, Query, QueryKind,
    RawResponse, ResponseDecoder,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

use crate::metrics::ClientMetrics;
use crate::outstanding::{OutstandingTable, PendingQuery, QueryHandle};
use crate::router::RouterHandle;
use crate::sink::{ErrorSink, ReadyObserver};

const READ_BUFFER_CAPACITY: usize = 8 * 1024;

pub(crate) enum ConnCommand {
    /// Install a new socket: connect to the address and arm the read loop.
    Initialize(SocketAddr),
    /// Write one query. Accepted only in the `Ready` state.
    Submit(Query),
}

/// Scheduler-side handle to one connection task.
#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    cmd_tx: mpsc::UnboundedSender<ConnCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    outstanding: Arc<AtomicUsize>,
}

impl ConnectionHandle {
    /// Observable state for the pool's scheduling decision.
    pub fn ready(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Queries currently in flight on this connection.
    pub fn num_outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Submits a query if the connection is ready, handing it back otherwise
    /// so the caller can requeue it.
    pub fn submit(&self, query: Query) -> Result<(), Query> {
        if self.ready() != ConnectionState::Ready {
            return Err(query);
        }
        if self.cmd_tx.send(ConnCommand::Submit(query.clone())).is_ok() {
            Ok(())
        } else {
            Err(query)
        }
    }

    /// Asks the task to install a new socket for `addr`.
    pub fn initialize(&self, addr: SocketAddr) -> bool {
        self.cmd_tx.send(ConnCommand::Initialize(addr)).is_ok()
    }
}

pub(crate) struct QueryConnection {
    pool: &'static str,
    id: usize,
    state_tx: watch::Sender<ConnectionState>,
    table: OutstandingTable,
    decoder: ResponseDecoder,
    deadlines: VecDeque<(Instant, QueryHandle)>,
    query_timeout: Option<Duration>,
    error_sink: Arc<dyn ErrorSink>,
    observer: Arc<dyn ReadyObserver>,
    router: RouterHandle,
    metrics: Arc<ClientMetrics>,
    outstanding_gauge: Arc<AtomicUsize>,
    pending_socket: Option<TcpStream>,
}

impl QueryConnection {
    /// Spawns the connection task and returns its handle. The task starts in
    /// `NeedSocket` and waits for the scheduler to send `Initialize`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        pool: &'static str,
        id: usize,
        query_timeout: Option<Duration>,
        error_sink: Arc<dyn ErrorSink>,
        observer: Arc<dyn ReadyObserver>,
        router: RouterHandle,
        metrics: Arc<ClientMetrics>,
    ) -> ConnectionHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::NeedSocket);
        let outstanding_gauge = Arc::new(AtomicUsize::new(0));

        let connection = QueryConnection {
            pool,
            id,
            state_tx,
            table: OutstandingTable::new(),
            decoder: ResponseDecoder::new(),
            deadlines: VecDeque::new(),
            query_timeout,
            error_sink,
            observer,
            router,
            metrics,
            outstanding_gauge: outstanding_gauge.clone(),
            pending_socket: None,
        };
        tokio::spawn(connection.run(cmd_rx));

        ConnectionHandle {
            cmd_tx,
            state_rx,
            outstanding: outstanding_gauge,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<ConnCommand>) {
        loop {
            let alive = if self.pending_socket.is_some() {
                self.run_connected(&mut cmd_rx).await
            } else {
                self.run_disconnected(&mut cmd_rx).await
            };
            if !alive {
                break;
            }
        }
        debug!(pool = self.pool, conn = self.id, "connection task stopped");
    }

    /// Waits for a socket while still honoring query deadlines; a query does
    /// not get extra time just because its connection is down.
    async fn run_disconnected(&mut self, cmd_rx: &mut mpsc::UnboundedReceiver<ConnCommand>) -> bool {
        loop {
            let next = self.deadlines.front().map(|(at, _)| *at);
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(ConnCommand::Initialize(addr)) => {
                        self.connect(addr).await;
                        if self.pending_socket.is_some() {
                            return true;
                        }
                    }
                    Some(ConnCommand::Submit(query)) => {
                        // Lost the race with a state change; hand it back.
                        self.error_sink.errored_query(query);
                    }
                    None => return false,
                },
                _ = sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                    self.fire_due_deadlines();
                }
            }
        }
    }

    async fn run_connected(&mut self, cmd_rx: &mut mpsc::UnboundedReceiver<ConnCommand>) -> bool {
        let Some(mut stream) = self.pending_socket.take() else {
            return true;
        };
        if !self.requery_all(&mut stream).await {
            return true;
        }

        let mut read_buf = BytesMut::with_capacity(READ_BUFFER_CAPACITY);
        loop {
            let next = self.deadlines.front().map(|(at, _)| *at);
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(ConnCommand::Submit(query)) => {
                        if !self.handle_submit(&mut stream, query).await {
                            return true;
                        }
                    }
                    Some(ConnCommand::Initialize(addr)) => {
                        // The scheduler decided this socket is stale; replace it.
                        drop(stream);
                        self.connect(addr).await;
                        return true;
                    }
                    None => return false,
                },
                read = stream.read_buf(&mut read_buf) => match read {
                    Ok(0) => {
                        self.kill_sequence("peer closed connection");
                        return true;
                    }
                    Ok(_) => {
                        let alive = self.process_read(&read_buf);
                        read_buf.clear();
                        if !alive {
                            return true;
                        }
                    }
                    Err(err) => {
                        warn!(pool = self.pool, conn = self.id, %err, "read failed");
                        self.kill_sequence("read failed");
                        return true;
                    }
                },
                _ = sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                    self.fire_due_deadlines();
                }
            }
        }
    }

    async fn connect(&mut self, addr: SocketAddr) {
        self.set_state(ConnectionState::Connecting);
        // Any buffered fragment belongs to the previous socket's stream.
        self.decoder.reset();
        self.metrics.record_connect();
        debug!(pool = self.pool, conn = self.id, %addr, "connecting");

        match TcpStream::connect(addr).await {
            Ok(stream) => {
                if let Err(err) = stream.set_nodelay(true) {
                    warn!(pool = self.pool, conn = self.id, %err, "failed to configure socket");
                    self.set_state(ConnectionState::NeedSocket);
                    return;
                }
                self.pending_socket = Some(stream);
                self.set_state(ConnectionState::Ready);
                debug!(pool = self.pool, conn = self.id, %addr, "connected");
            }
            Err(err) => {
                warn!(pool = self.pool, conn = self.id, %addr, %err, "connect failed");
                self.set_state(ConnectionState::NeedSocket);
            }
        }
    }

    /// Re-sends the unmodified request for every still-outstanding query.
    ///
    /// Idempotent by construction: only wire writes happen here, the table is
    /// untouched, so a repeated pass cannot duplicate bookkeeping.
    async fn requery_all(&mut self, stream: &mut TcpStream) -> bool {
        let handles = self.table.handles();
        if handles.is_empty() {
            return true;
        }
        debug!(
            pool = self.pool,
            conn = self.id,
            count = handles.len(),
            "re-issuing outstanding queries"
        );
        for handle in handles {
            let Some(request) = self.table.get(handle).map(|p| p.request.clone()) else {
                continue;
            };
            if let Err(err) = stream.write_all(&request).await {
                warn!(pool = self.pool, conn = self.id, %err, "requery write failed");
                if let Some(pending) = self.table.remove(handle) {
                    self.error_sink.errored_query(pending.query);
                }
                self.sync_gauge();
                self.kill_sequence("requery write failed");
                return false;
            }
        }
        true
    }

    /// Writes one query. Returns false when the write killed the connection.
    async fn handle_submit(&mut self, stream: &mut TcpStream, query: Query) -> bool {
        if *self.state_tx.borrow() != ConnectionState::Ready {
            self.error_sink.errored_query(query);
            return true;
        }

        let request = Bytes::from(match query.kind {
            QueryKind::Get => encode_get(&query.key),
            QueryKind::Set => encode_set(&query.key, &query.value),
        });
        self.set_state(ConnectionState::Processing);

        let is_get = query.kind == QueryKind::Get;
        let handle = self.table.insert(PendingQuery {
            query,
            request: request.clone(),
        });
        self.sync_gauge();
        if is_get {
            if let Some(timeout) = self.query_timeout {
                self.deadlines.push_back((Instant::now() + timeout, handle));
            }
        }

        match stream.write_all(&request).await {
            Ok(()) => {
                self.set_state(ConnectionState::Ready);
                true
            }
            Err(err) => {
                warn!(pool = self.pool, conn = self.id, %err, "write failed mid-query");
                if let Some(pending) = self.table.remove(handle) {
                    self.error_sink.errored_query(pending.query);
                }
                self.sync_gauge();
                self.kill_sequence("write failed");
                false
            }
        }
    }

    /// Decodes whatever arrived and resolves each response against the table.
    /// Returns false when the connection must be recycled.
    fn process_read(&mut self, chunk: &[u8]) -> bool {
        match self.decoder.feed(chunk) {
            Ok(responses) => {
                let mut fatal = false;
                for response in responses {
                    match response {
                        RawResponse::Value { key, entry } => {
                            self.resolve(key, QueryKind::Get, Some(entry));
                        }
                        RawResponse::NotFound { key } => {
                            self.resolve(key, QueryKind::Get, None);
                        }
                        RawResponse::Stored { key } => {
                            self.resolve(key, QueryKind::Set, None);
                        }
                        RawResponse::Error { raw } => {
                            warn!(
                                pool = self.pool,
                                conn = self.id,
                                raw = %String::from_utf8_lossy(&raw),
                                "error response from lookup node"
                            );
                            fatal = true;
                        }
                    }
                }
                if fatal {
                    // The protocol never names the key that erred, so the only
                    // safe move is to recycle the connection; its outstanding
                    // queries are re-sent after reconnect.
                    self.kill_sequence("error response");
                    return false;
                }
                true
            }
            Err(err) => {
                warn!(pool = self.pool, conn = self.id, %err, "response stream desynchronized");
                self.kill_sequence("decode failure");
                false
            }
        }
    }

    /// Pops every matching query for `key` of `kind` and delivers one result
    /// per query. A response with no matching query is only logged; its query
    /// may already have timed out.
    fn resolve(&mut self, key: DataKey, kind: QueryKind, entry: Option<Entry>) {
        let matched = self.table.take_matching(&key, kind);
        if matched.is_empty() {
            trace!(pool = self.pool, conn = self.id, %key, ?kind, "response with no matching query");
            return;
        }
        for pending in matched {
            let entry = match kind {
                QueryKind::Get => entry.unwrap_or_else(Entry::null),
                QueryKind::Set => pending.query.value,
            };
            self.router
                .deliver(OperationResult::from_query(&pending.query, entry, true));
        }
        self.sync_gauge();
    }

    fn fire_due_deadlines(&mut self) {
        let now = Instant::now();
        while let Some(&(at, handle)) = self.deadlines.front() {
            if at > now {
                break;
            }
            self.deadlines.pop_front();
            if let Some(pending) = self.table.remove(handle) {
                // Definitive answer for the caller; a late response becomes a
                // no-op because the table entry is gone.
                debug!(
                    pool = self.pool,
                    conn = self.id,
                    key = %pending.query.key,
                    "query deadline passed"
                );
                self.metrics.record_timed_out();
                self.router
                    .deliver(OperationResult::from_query(&pending.query, Entry::null(), false));
            }
        }
        self.sync_gauge();
    }

    /// Tears the socket down (the caller drops it) and flags the connection
    /// for reconnect. Queries awaiting a response stay in the table.
    fn kill_sequence(&mut self, reason: &str) {
        warn!(
            pool = self.pool,
            conn = self.id,
            reason,
            outstanding = self.table.len(),
            "connection kill sequence"
        );
        self.set_state(ConnectionState::NeedSocket);
    }

    fn set_state(&self, state: ConnectionState) {
        if *self.state_tx.borrow() == state {
            return;
        }
        self.state_tx.send_replace(state);
        self.observer.ready_state_changed(self.id, state);
    }

    fn sync_gauge(&self) {
        self.outstanding_gauge
            .store(self.table.len(), Ordering::Relaxed);
    }
}
