//! Fail-open helpers for infrastructure side effects
//!
//! Task log writes and similar bookkeeping must never abort a request or a
//! reclaim. Failures are logged and swallowed.
//!
//! Do not use this for anything that decides the task's outcome.

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Run `f`, logging and discarding any error.
///
/// Returns `None` when the operation failed.
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}
