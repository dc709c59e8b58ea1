//! Async runtime helpers for blocking callers.
//!
//! The engine drives steps synchronously while the process layer is built on
//! Tokio. These helpers run a future to completion from synchronous code, reusing
//! the current runtime when one is available, and optionally bound it by a
//! wall-clock limit.

use std::future::Future;
use std::time::Duration;

use anyhow::anyhow;
use thiserror::Error;
use tokio::{runtime::Handle, task};

/// Returned inside the `anyhow` chain when [`block_on_with_timeout`] expires.
#[derive(Debug, Error)]
#[error("operation timed out after {}s", .0.as_secs_f64())]
pub struct DeadlineExceeded(pub Duration);

/// Execute an async future from synchronous code.
///
/// # Notes
/// - Reuses the current runtime when available.
/// - Falls back to a single-threaded runtime for call sites outside Tokio.
pub fn block_on_future<F, T>(future: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    if let Ok(handle) = Handle::try_current() {
        task::block_in_place(|| handle.block_on(future))
    } else {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|error| anyhow!(error))?
            .block_on(future)
    }
}

/// Execute an async future from synchronous code, abandoning it after `limit`.
///
/// The future is dropped on expiry, so resources it owns (for example a child
/// process spawned with `kill_on_drop`) are released. The error downcasts to
/// [`DeadlineExceeded`].
pub fn block_on_with_timeout<F, T>(future: F, limit: Option<Duration>) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    match limit {
        None => block_on_future(future),
        Some(limit) => block_on_future(async move {
            match tokio::time::timeout(limit, future).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::Error::new(DeadlineExceeded(limit))),
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_on_future_outside_runtime() {
        let value = block_on_future(async { Ok::<_, anyhow::Error>(41 + 1) }).expect("future result");
        assert_eq!(value, 42);
    }

    #[test]
    fn block_on_with_timeout_reports_deadline() {
        let error = block_on_with_timeout(
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, anyhow::Error>(())
            },
            Some(Duration::from_millis(20)),
        )
        .expect_err("should time out");
        assert!(error.downcast_ref::<DeadlineExceeded>().is_some());
    }

    #[test]
    fn block_on_with_timeout_without_limit_completes() {
        let value = block_on_with_timeout(async { Ok::<_, anyhow::Error>("done") }, None).expect("future result");
        assert_eq!(value, "done");
    }
}
