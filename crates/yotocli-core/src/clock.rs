//! Injectable sleeping for the polling loops.
//!
//! Both the transcode poll and the device-authorization poll wait between
//! attempts through a [`Sleeper`], so tests can record the requested delays
//! instead of waiting them out (see `test_support::RecordingSleeper`).

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Something that can suspend the current task for a while.
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Wait for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Real sleeper backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Sleep unless `cancel` fires first, in which case fail with
/// [`Error::Cancelled`].
pub async fn sleep_or_cancel(
    sleeper: &dyn Sleeper,
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        () = sleeper.sleep(duration) => Ok(()),
    }
}
