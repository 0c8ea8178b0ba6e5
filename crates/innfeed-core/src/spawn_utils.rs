//! Task-spawning helpers, grounded on the teacher's
//! `librqbit_core::spawn_utils`: every long-lived task gets a tracing span
//! and is cancellable via a shared [`CancellationToken`] rather than a
//! detached `tokio::spawn` nobody can stop.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

pub fn spawn<F>(span: Span, fut: F) -> JoinHandle<anyhow::Result<()>>
where
    F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(
        async move {
            if let Err(e) = fut.await {
                tracing::error!(error = ?e, "task failed");
                return Err(e);
            }
            Ok(())
        }
        .instrument(span),
    )
}

pub fn spawn_with_cancel<F>(
    span: Span,
    cancel: CancellationToken,
    fut: F,
) -> JoinHandle<anyhow::Result<()>>
where
    F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    spawn(span, async move {
        tokio::select! {
            res = fut => res,
            _ = cancel.cancelled() => Ok(()),
        }
    })
}
