//! Cooperative cancellation for handlers.
//!
//! `requestCancel` only sets a flag on the row; the processor's heartbeat
//! reads the flag back and fires the token it handed to the handler. A
//! handler that never consults its token is allowed to finish normally -
//! the runtime cannot forcibly stop it.

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Error a handler raises to surface a cancellation check. The processor
/// finalises the job as `cancelled` (not `failed`) when it sees this in the
/// error chain.
#[derive(Debug, Error)]
#[error("job cancelled")]
pub struct JobCancelled;

/// Token handed to a running handler.
///
/// Consult it at safe points - at least at I/O boundaries:
///
/// ```ignore
/// loop {
///     ctx.cancel.ensure_active()?;
///     process_next_chunk().await?;
/// }
/// ```
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: CancellationToken,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the token. Called by the processor when the row's
    /// `cancel_requested` flag comes back true.
    pub fn trigger(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Resolves when cancellation is requested. Lets handlers race long
    /// waits against cancellation with `select!`.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await;
    }

    /// Bail out with [`JobCancelled`] if cancellation was requested.
    pub fn ensure_active(&self) -> Result<(), JobCancelled> {
        if self.is_cancelled() {
            Err(JobCancelled)
        } else {
            Ok(())
        }
    }
}
