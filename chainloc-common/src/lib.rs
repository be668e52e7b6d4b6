// chainloc-common - Shared data model and wire protocol for the lookup client
//
// This crate defines the key/entry/query types and the text wire codec.

pub mod error;
pub mod types;
pub mod wire;

// Re-export for convenience
pub use error::*;
pub use types::*;
pub use wire::*;
