use std::future::Future;
use std::time::Duration;

use recall_core::{MemoryError, Result};

/// Run a tier call, failing with [`MemoryError::Timeout`] once `after`
/// elapses. Dropping the future cancels the call.
pub(crate) async fn bounded<T>(
    operation: &str,
    after: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(MemoryError::Timeout {
            operation: operation.to_string(),
            after,
        }),
    }
}
