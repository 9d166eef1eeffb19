use anyhow::bail;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, trace};

/// Spawns a future with tracing instrumentation.
pub fn spawn(
    span: tracing::Span,
    fut: impl std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    let fut = async move {
        trace!("started");
        tokio::pin!(fut);
        let mut trace_interval = tokio::time::interval(std::time::Duration::from_secs(5));

        loop {
            tokio::select! {
                _ = trace_interval.tick() => {
                    trace!("still running");
                },
                r = &mut fut => {
                    match r {
                        Ok(_) => {
                            trace!("finished");
                        }
                        Err(e) => {
                            error!("finished with error: {:#}", e)
                        }
                    }
                    return;
                }
            }
        }
    }
    .instrument(span);
    tokio::task::spawn(fut)
}

/// Like [`spawn`], but the future is dropped as soon as `cancellation_token` fires.
pub fn spawn_with_cancel(
    span: tracing::Span,
    cancellation_token: CancellationToken,
    fut: impl std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    spawn(span, async move {
        tokio::select! {
            _ = cancellation_token.cancelled() => {
                debug!("cancelled");
                bail!("cancelled");
            },
            r = fut => r
        }
    })
}

/// Runs blocking work (piece hashing, store I/O) from async code.
#[derive(Clone, Copy, Debug)]
pub struct BlockingSpawner {
    allow_block_in_place: bool,
}

impl BlockingSpawner {
    pub fn new(allow_block_in_place: bool) -> Self {
        Self {
            allow_block_in_place,
        }
    }

    /// `block_in_place` panics on the current-thread runtime, so only use it when the
    /// runtime is multi-threaded.
    pub fn from_current_runtime() -> Self {
        let allow = tokio::runtime::Handle::try_current()
            .map(|h| h.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread)
            .unwrap_or(false);
        Self::new(allow)
    }

    pub fn spawn_block_in_place<F: FnOnce() -> R, R>(&self, f: F) -> R {
        if self.allow_block_in_place {
            return tokio::task::block_in_place(f);
        }
        f()
    }
}

impl Default for BlockingSpawner {
    fn default() -> Self {
        Self::new(true)
    }
}
