//! Cancellation-aware future helpers.
//!
//! Every remote call and tool dispatch in this crate threads a
//! [`CancellationToken`] through; these helpers race a future against
//! the token so cancellation is honored at the first suspension point
//! instead of being polled manually.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Race `fut` against `cancel`.
///
/// Returns the future's output, or [`Error::Cancelled`] if the token is
/// cancelled first (or was already cancelled on entry).
pub async fn or_cancel<F: Future>(fut: F, cancel: &CancellationToken) -> Result<F::Output> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        out = fut => Ok(out),
    }
}

/// Sleep for `duration`, waking early with [`Error::Cancelled`] if the
/// token fires.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    or_cancel(tokio::time::sleep(duration), cancel).await
}
