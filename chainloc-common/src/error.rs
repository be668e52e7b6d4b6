//! Error taxonomy shared by the client crates.
//!
//! Everything recoverable stays inside the scheduler (requeue); the variants
//! here surface only where a caller handed us something unusable or the
//! response stream itself went bad.

use thiserror::Error;

/// Result alias used throughout the workspace.
pub type ChainlocResult<T> = Result<T, ChainlocError>;

/// Errors produced by the lookup client and the wire codec.
#[derive(Debug, Error)]
pub enum ChainlocError {
    /// Network or IO failure while connecting, reading, or writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The response byte stream no longer lines up with the protocol.
    ///
    /// This is fatal for the connection that observed it; recovering in place
    /// would risk matching responses against the wrong keys.
    #[error("response stream desynchronized: {0}")]
    Desync(&'static str),

    /// A key of the wrong width was supplied.
    #[error("key must be exactly {expected} bytes, got {actual}")]
    KeyLength { expected: usize, actual: usize },

    /// A server ID that does not fit the fixed-width wire encoding.
    #[error("server id {0} does not fit the wire encoding")]
    EntryRange(u64),

    /// An endpoint could not be resolved to a socket address.
    #[error("invalid endpoint address: {0}")]
    InvalidAddress(String),

    /// The client's background tasks have shut down.
    #[error("lookup client is shut down")]
    Closed,
}
