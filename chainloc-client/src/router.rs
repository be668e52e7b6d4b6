//! # Result Router
//!
//! Purpose: Fan completed results in from every connection and hand them to
//! the consumer on a dedicated task, so a slow or reentrant consumer callback
//! can never stall a socket read.

use std::sync::Arc;

use chainloc_common::{OperationResult, QueryKind};
use tokio::sync::mpsc;
use tracing::trace;

use crate::metrics::ClientMetrics;

/// Consumer-facing delivery interface.
///
/// Exactly one callback fires per submitted query: success, not-found
/// (success with a null entry), or terminal failure once scheduler-level
/// retries are exhausted or a deadline passes.
pub trait ResultConsumer: Send + Sync {
    fn on_get_result(&self, result: OperationResult);
    fn on_set_result(&self, result: OperationResult);
}

/// Cloneable sender side of the router, held by every connection and by the
/// schedulers for dead-letter delivery.
#[derive(Clone)]
pub(crate) struct RouterHandle {
    tx: mpsc::UnboundedSender<OperationResult>,
}

impl RouterHandle {
    /// Hands a result over for delivery. During shutdown the router may
    /// already be gone; the result is dropped with it.
    pub fn deliver(&self, result: OperationResult) {
        let _ = self.tx.send(result);
    }
}

/// Spawns the delivery task and returns its handle.
pub(crate) fn spawn(
    consumer: Arc<dyn ResultConsumer>,
    metrics: Arc<ClientMetrics>,
) -> RouterHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<OperationResult>();
    tokio::spawn(async move {
        while let Some(result) = rx.recv().await {
            trace!(key = %result.key, kind = ?result.kind, succeeded = result.succeeded, "delivering result");
            metrics.record_delivered();
            match result.kind {
                QueryKind::Get => consumer.on_get_result(result),
                QueryKind::Set => consumer.on_set_result(result),
            }
        }
    });
    RouterHandle { tx }
}
