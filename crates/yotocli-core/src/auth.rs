//! OAuth device-code authorization.
//!
//! ```text
//! Init -> AwaitingUserCode -> Polling -> Authorized
//!                               |
//!                               +-> Failed
//! ```
//!
//! `authorization_pending` keeps polling at the current interval, `slow_down`
//! adds [`SLOW_DOWN_STEP`] to it. Any other answer is terminal. The interval
//! starts at the server's suggestion but never below [`MIN_POLL_INTERVAL`].

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{Sleeper, TokioSleeper, sleep_or_cancel};
use crate::error::{Error, Result};
use crate::gateway::{DeviceAuthorization, LibraryGateway, TokenPair, TokenPoll};

/// Lower bound for the poll interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Added to the interval on every `slow_down`.
pub const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);

/// What the poll loop does after one token response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStep {
    /// Sleep for this long and ask again.
    Wait(Duration),
    /// Tokens issued.
    Authorized(TokenPair),
    /// Terminal error code.
    Failed(String),
}

/// Transition function of the polling state.
#[must_use]
pub fn next_step(interval: Duration, poll: TokenPoll) -> PollStep {
    match poll {
        TokenPoll::Granted(tokens) => PollStep::Authorized(tokens),
        TokenPoll::Pending => PollStep::Wait(interval),
        TokenPoll::SlowDown => PollStep::Wait(interval + SLOW_DOWN_STEP),
        TokenPoll::Failed(code) => PollStep::Failed(code),
    }
}

/// Initial poll interval for a server suggestion in seconds.
#[must_use]
pub fn initial_interval(suggested_secs: u64) -> Duration {
    Duration::from_secs(suggested_secs).max(MIN_POLL_INTERVAL)
}

/// Drives the device-code grant against a gateway.
#[derive(Clone)]
pub struct DeviceAuthFlow {
    gateway: Arc<dyn LibraryGateway>,
    client_id: String,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for DeviceAuthFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceAuthFlow")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl DeviceAuthFlow {
    /// Flow for `client_id` using real sleeps.
    pub fn new(gateway: Arc<dyn LibraryGateway>, client_id: impl Into<String>) -> Self {
        Self {
            gateway,
            client_id: client_id.into(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Replace the sleeper used between polls.
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// `Init -> AwaitingUserCode`: obtain the codes to show the user.
    pub async fn start(&self) -> Result<DeviceAuthorization> {
        if self.client_id.is_empty() {
            return Err(Error::Auth("no client ID configured".to_string()));
        }
        let authorization = self.gateway.start_device_auth(&self.client_id).await?;
        info!(
            user_code = %authorization.user_code,
            verification_uri = %authorization.verification_uri,
            interval = authorization.interval,
            "Device authorization started"
        );
        Ok(authorization)
    }

    /// `Polling` until tokens are issued, an error is returned or `cancel`
    /// fires.
    pub async fn poll(
        &self,
        authorization: &DeviceAuthorization,
        cancel: &CancellationToken,
    ) -> Result<TokenPair> {
        let mut interval = initial_interval(authorization.interval);
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            attempt += 1;

            let poll = self
                .gateway
                .poll_token(&authorization.device_code, &self.client_id)
                .await?;

            match next_step(interval, poll) {
                PollStep::Authorized(tokens) => {
                    info!(attempt, "Device authorized");
                    return Ok(tokens);
                }
                PollStep::Failed(code) => {
                    error!(attempt, code = %code, "Device authorization failed");
                    return Err(Error::Auth(code));
                }
                PollStep::Wait(next) => {
                    if next > interval {
                        warn!(attempt, interval_secs = next.as_secs(), "Server asked to slow down");
                    } else {
                        debug!(attempt, interval_secs = next.as_secs(), "Authorization pending");
                    }
                    interval = next;
                    sleep_or_cancel(self.sleeper.as_ref(), interval, cancel).await?;
                }
            }
        }
    }

    /// Full login: start, hand the codes to `show`, then poll.
    pub async fn login(
        &self,
        show: impl FnOnce(&DeviceAuthorization) + Send,
        cancel: &CancellationToken,
    ) -> Result<TokenPair> {
        let authorization = self.start().await?;
        show(&authorization);
        self.poll(&authorization, cancel).await
    }

    /// Exchange a refresh token for a new pair. Single shot, no retry.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        if refresh_token.is_empty() {
            return Err(Error::Auth("no refresh token available".to_string()));
        }
        let mut tokens = self
            .gateway
            .refresh_token(refresh_token, &self.client_id)
            .await?;
        if tokens.refresh_token.is_empty() {
            // Some grants do not rotate the refresh token
            tokens.refresh_token = refresh_token.to_string();
        }
        info!("Access token refreshed");
        Ok(tokens)
    }
}
