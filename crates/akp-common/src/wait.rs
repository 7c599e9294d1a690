//! Status-wait kernel
//!
//! Polls a platform entity until an extracted status enters a target set.
//! Health and reconciliation waits share this loop and differ only in the
//! status extractor and the target set they pass in.

use std::fmt::{Debug, Display};
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::context::CallContext;
use crate::rpc::RpcError;
use crate::Error;

/// Default timeout for instance and agent status waits
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Default interval between polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Timing for one status wait
#[derive(Clone, Debug)]
pub struct WaitConfig {
    /// Deadline applied when the caller's context has none
    pub timeout: Duration,
    /// Delay between polls
    pub poll_interval: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_WAIT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl WaitConfig {
    /// Build a config with explicit timing
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }
}

/// Render a target set for messages, e.g. `HEALTHY, DEGRADED`
pub fn format_targets<S: Display>(targets: &[S]) -> String {
    targets
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Poll `get_resource` until `get_status` of the result is one of `targets`.
///
/// * NotFound from `get_resource` keeps polling: the entity may not be
///   visible yet.
/// * Any other RPC error ends the wait with [`Error::Rpc`].
/// * Running past the deadline (the caller's, or one derived from
///   `config.timeout`) returns [`Error::Timeout`] naming `label` and the
///   target set. Cancellation returns [`Error::Cancelled`].
///
/// Returns the resource observed in a target status.
pub async fn wait_for_status<T, S, F, Fut, G>(
    ctx: &CallContext,
    config: &WaitConfig,
    label: &str,
    targets: &[S],
    mut get_resource: F,
    get_status: G,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RpcError>>,
    G: Fn(&T) -> S,
    S: PartialEq + Debug + Display,
{
    let ctx = ctx.with_default_timeout(config.timeout);
    let start = Instant::now();
    let timeout = |start: Instant| Error::Timeout {
        label: label.to_string(),
        targets: format_targets(targets),
        elapsed: start.elapsed(),
    };

    loop {
        let polled = match ctx.run(label, get_resource()).await {
            Ok(polled) => polled,
            Err(Error::DeadlineExceeded { .. }) => return Err(timeout(start)),
            Err(e) => return Err(e),
        };

        match polled {
            Ok(resource) => {
                let status = get_status(&resource);
                if targets.contains(&status) {
                    debug!(label = %label, status = %status, "Status reached");
                    return Ok(resource);
                }
                debug!(
                    label = %label,
                    status = %status,
                    targets = %format_targets(targets),
                    "Status not reached yet"
                );
            }
            Err(e) if e.is_not_found() => {
                debug!(label = %label, error = %e, "Resource not visible yet, polling");
            }
            Err(e) => return Err(Error::rpc(label, e)),
        }

        match ctx.sleep(label, config.poll_interval).await {
            Ok(()) => {}
            Err(Error::DeadlineExceeded { .. }) => return Err(timeout(start)),
            Err(e) => return Err(e),
        }
    }
}
