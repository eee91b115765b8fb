//! Watch consumer loop
//!
//! Registers a watch on one resource kind and hands every event to a
//! callback. The loop never gives up: failed registrations are retried after
//! a fixed delay, broken streams are re-registered, and every stream is
//! dropped and re-registered after the refresh interval so a silently dead
//! connection cannot stall reconciliation. Re-registration replays the
//! current resources as `Added` events.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fabrik_common::config::PollerSettings;
use fabrik_common::resource::{ResourceKind, StateQuery, WatchEvent};
use fabrik_common::retry::{retry_with_backoff, RetryConfig};
use fabrik_common::store::ResourceStore;

/// Watch timing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchConfig {
    /// How long one stream is consumed before it is re-registered
    pub refresh_interval: Duration,
    /// Delay between failed registration attempts
    pub error_delay: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self::from(&PollerSettings::default())
    }
}

impl From<&PollerSettings> for WatchConfig {
    fn from(settings: &PollerSettings) -> Self {
        Self {
            refresh_interval: settings.watch_refresh_interval(),
            error_delay: settings.watcher_error_delay(),
        }
    }
}

/// Spawn a watch loop on `kind`, calling `handler` for every event until
/// `shutdown` is cancelled
pub fn spawn_watch_loop<F>(
    store: Arc<dyn ResourceStore>,
    kind: ResourceKind,
    query: StateQuery,
    config: WatchConfig,
    shutdown: CancellationToken,
    handler: F,
) -> JoinHandle<()>
where
    F: FnMut(WatchEvent) + Send + 'static,
{
    tokio::spawn(run_watch_loop(store, kind, query, config, shutdown, handler))
}

/// Run the watch loop on the current task
pub async fn run_watch_loop<F>(
    store: Arc<dyn ResourceStore>,
    kind: ResourceKind,
    query: StateQuery,
    config: WatchConfig,
    shutdown: CancellationToken,
    mut handler: F,
) where
    F: FnMut(WatchEvent) + Send + 'static,
{
    let retry = RetryConfig::fixed_forever(config.error_delay);
    let operation = format!("register watch on {kind}");

    loop {
        let registration = retry_with_backoff(&retry, &operation, || store.watch(&kind, &query));
        let mut stream = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = registration => match result {
                Ok(stream) => stream,
                // Unreachable with an infinite schedule, but never spin
                Err(e) => {
                    warn!(kind = %kind, error = %e, "Watch registration gave up");
                    tokio::time::sleep(config.error_delay).await;
                    continue;
                }
            },
        };
        info!(kind = %kind, "Watch registered");

        let refresh = tokio::time::sleep(config.refresh_interval);
        tokio::pin!(refresh);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(kind = %kind, "Watch loop stopped");
                    return;
                }
                _ = &mut refresh => {
                    debug!(kind = %kind, "Refreshing watch");
                    break;
                }
                item = stream.next() => match item {
                    Some(Ok(event)) => handler(event),
                    Some(Err(e)) => {
                        warn!(kind = %kind, error = %e, "Watch stream failed, re-registering");
                        break;
                    }
                    None => {
                        debug!(kind = %kind, "Watch stream ended, re-registering");
                        break;
                    }
                },
            }
        }
    }
    debug!(kind = %kind, "Watch loop stopped");
}
