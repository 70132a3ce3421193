/// Small helpers shared across the core
use crate::error::{Result, SyncError};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Guards are never held across an await point.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bound a REST call. Elapsing maps to `SyncError::Timeout`.
pub async fn with_timeout<T, F>(limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Timeout(format!(
            "{} did not finish within {:?}",
            what, limit
        ))),
    }
}
