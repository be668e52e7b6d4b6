//! # Core Data Model
//!
//! Purpose: Define the key, entry, query, and result types moved between the
//! scheduler, the connections, and the consumer.
//!
//! ## Design Principles
//! 1. **Fixed Widths**: Keys and entries have compile-time sizes matching the
//!    wire protocol, so encoding never truncates and lookups never alias.
//! 2. **Exclusive Ownership**: A `Query` lives in exactly one connection's
//!    outstanding table at a time; a terminal `OperationResult` is produced
//!    exactly once per query.
//! 3. **Byte-Exact Comparison**: Keys compare by exact byte value, nothing
//!    smarter.

use std::fmt;
use std::time::Instant;

use crate::error::{ChainlocError, ChainlocResult};

/// Exact width of a lookup key in bytes.
///
/// Callers must not rely on any byte past this width; the wire form appends a
/// terminator on top of it.
pub const KEY_WIDTH: usize = 33;

/// Server ID used by [`Entry::null`] to mean "no assignment".
pub const NULL_SERVER_ID: u32 = 0;

/// Fixed-width opaque object identifier.
///
/// Keys are compared and looked up by exact byte value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataKey {
    bytes: [u8; KEY_WIDTH],
}

impl DataKey {
    /// Creates a key from a byte slice of exactly [`KEY_WIDTH`] bytes.
    ///
    /// Shorter slices are rejected rather than padded: padding would make
    /// distinct identifiers collide on the wire.
    pub fn new(data: &[u8]) -> ChainlocResult<Self> {
        if data.len() != KEY_WIDTH {
            return Err(ChainlocError::KeyLength {
                expected: KEY_WIDTH,
                actual: data.len(),
            });
        }
        let mut bytes = [0u8; KEY_WIDTH];
        bytes.copy_from_slice(data);
        Ok(DataKey { bytes })
    }

    /// Returns the key bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataKey({})", String::from_utf8_lossy(&self.bytes))
    }
}

impl fmt::Display for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.bytes))
    }
}

/// A server assignment record stored against a key.
///
/// `Entry::null()` is the distinguished "no assignment" value; a `NOT_FOUND`
/// response materializes as a successful result carrying it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    server_id: u32,
}

impl Entry {
    /// Creates an assignment to the given server.
    pub fn new(server_id: u32) -> Self {
        Entry { server_id }
    }

    /// The distinguished "no assignment" entry.
    pub fn null() -> Self {
        Entry {
            server_id: NULL_SERVER_ID,
        }
    }

    /// Returns true when this entry represents "no assignment".
    #[inline]
    pub fn is_null(&self) -> bool {
        self.server_id == NULL_SERVER_ID
    }

    /// The hosting server's ID.
    #[inline]
    pub fn server_id(&self) -> u32 {
        self.server_id
    }
}

/// Whether a query reads or writes an assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Get,
    Set,
}

/// One submitted lookup or update, owned by whichever connection currently
/// serves it.
#[derive(Debug, Clone)]
pub struct Query {
    pub key: DataKey,
    pub kind: QueryKind,
    /// Value being written; `Entry::null()` for GET queries.
    pub value: Entry,
    /// Whether the caller asked for the tracking ID to be echoed back.
    pub tracking: bool,
    pub tracking_id: u64,
    pub admitted_at: Instant,
    /// Times this query has been requeued after a connection failure.
    pub retries: u32,
}

impl Query {
    /// Builds a GET query for `key`.
    pub fn get(key: DataKey) -> Self {
        Query {
            key,
            kind: QueryKind::Get,
            value: Entry::null(),
            tracking: false,
            tracking_id: 0,
            admitted_at: Instant::now(),
            retries: 0,
        }
    }

    /// Builds a SET query writing `value` under `key`.
    pub fn set(key: DataKey, value: Entry, tracking: bool, tracking_id: u64) -> Self {
        Query {
            key,
            kind: QueryKind::Set,
            value,
            tracking,
            tracking_id,
            admitted_at: Instant::now(),
            retries: 0,
        }
    }
}

/// Terminal outcome of one query, delivered to the consumer exactly once.
#[derive(Debug, Clone)]
pub struct OperationResult {
    pub key: DataKey,
    pub entry: Entry,
    pub tracking_id: u64,
    pub tracking: bool,
    pub succeeded: bool,
    pub kind: QueryKind,
}

impl OperationResult {
    /// Builds the result for `query` with the given entry and outcome.
    pub fn from_query(query: &Query, entry: Entry, succeeded: bool) -> Self {
        OperationResult {
            key: query.key,
            entry,
            tracking_id: query.tracking_id,
            tracking: query.tracking,
            succeeded,
            kind: query.kind,
        }
    }
}

/// Lifecycle of one pooled connection.
///
/// The connection object is reused across reconnects; only the socket is
/// replaced. The outstanding table survives every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No usable socket; waiting for the scheduler to trigger a reconnect.
    NeedSocket,
    /// An async connect is in flight.
    Connecting,
    /// Connected and accepting submissions.
    Ready,
    /// A write is in flight; submissions bounce back to the scheduler.
    Processing,
}
