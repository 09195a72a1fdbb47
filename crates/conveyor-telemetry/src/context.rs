//! Correlation-id propagation for background work.
//!
//! # Design
//! - Keeps the correlation id in task-local storage so any log statement
//!   emitted inside a queue iteration or cron fire can reach it.
//! - Callers wrap each unit of work with [`with_correlation_id`]; the value
//!   vanishes when the wrapped future resolves.

use std::future::Future;

use uuid::Uuid;

/// Retrieve the correlation id for the current unit of work, if one is set.
#[must_use]
pub fn current_correlation_id() -> Option<Uuid> {
    ACTIVE_CORRELATION_ID.try_with(|id| *id).ok()
}

/// Execute the provided future with the supplied correlation id available to
/// downstream code.
pub async fn with_correlation_id<Fut, T>(correlation_id: Uuid, fut: Fut) -> T
where
    Fut: Future<Output = T>,
{
    ACTIVE_CORRELATION_ID.scope(correlation_id, fut).await
}

tokio::task_local! {
    static ACTIVE_CORRELATION_ID: Uuid;
}
