//! Retry utilities with exponential backoff and jitter.
//!
//! Platform RPCs fail transiently while the platform reconciles its own
//! resources. [`retry_rpc`] re-runs a call for transient status codes with
//! bounded exponential backoff and surfaces everything else immediately.
//!
//! # Example
//!
//! ```ignore
//! use akp_common::retry::{retry_rpc, RetryConfig};
//!
//! let instance = retry_rpc(&ctx, &RetryConfig::default(), "get instance", || {
//!     gateway.get_instance(&org_id, &instance_id)
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::context::CallContext;
use crate::rpc::RpcError;
use crate::Error;

/// Configuration for platform calls that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Jitter as a fraction of the current delay (0.1 = ±10%)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// Create a config with a given number of retries
    pub fn with_max_retries(retries: u32) -> Self {
        Self {
            max_retries: retries,
            ..Default::default()
        }
    }

    /// A config that never retries
    pub fn none() -> Self {
        Self::with_max_retries(0)
    }

    /// Delay before retry `n` (1-based) without jitter
    pub fn base_delay(&self, retry: u32) -> Duration {
        let mut delay = self.initial_delay.as_secs_f64();
        for _ in 1..retry {
            delay = (delay * self.backoff_multiplier).min(self.max_delay.as_secs_f64());
        }
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        Duration::from_secs_f64(delay.as_secs_f64() * factor)
    }
}

/// Execute a platform RPC with classified retries.
///
/// Attempt 0 runs immediately. Each later attempt first sleeps the current
/// delay with jitter; the delay grows by `backoff_multiplier` after every
/// failure, capped at `max_delay`. Non-retryable statuses return at once as
/// [`Error::Rpc`]; running out of attempts returns
/// [`Error::RetriesExhausted`] with the last status. Cancellation of `ctx`
/// interrupts both the call and the backoff sleep.
pub async fn retry_rpc<F, Fut, T>(
    ctx: &CallContext,
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RpcError>>,
{
    let mut attempt = 0u32;

    loop {
        if attempt > 0 {
            let delay = config.jittered(config.base_delay(attempt));
            ctx.sleep(operation_name, delay).await?;
        }

        let err = match ctx.run(operation_name, operation()).await? {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !err.is_retryable() {
            return Err(Error::rpc(operation_name, err));
        }

        if attempt >= config.max_retries {
            error!(
                operation = %operation_name,
                attempts = attempt + 1,
                error = %err,
                "Operation failed after max retries"
            );
            return Err(Error::RetriesExhausted {
                operation: operation_name.to_string(),
                attempts: attempt + 1,
                source: err,
            });
        }

        attempt += 1;
        warn!(
            operation = %operation_name,
            attempt = attempt,
            error = %err,
            delay_ms = config.base_delay(attempt).as_millis() as u64,
            "Operation failed, retrying"
        );
    }
}
