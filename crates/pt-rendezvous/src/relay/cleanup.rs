//! Relay token expiry task
//!
//! Periodically retires reservations nobody claimed within the token TTL and
//! forgets tombstones that have outlived it. A retired token is rejected by
//! the relay endpoint for at least one TTL after its session ended.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::hub::RelayHub;

/// Run the token expiry task until cancelled.
///
/// # Arguments
///
/// * `hub` - The relay token table
/// * `ttl` - Lifetime of reservations and tombstones
/// * `interval` - Time between sweeps
/// * `cancel` - Cancellation token for graceful shutdown
pub async fn run_token_cleanup(
    hub: Arc<RelayHub>,
    ttl: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);

    tracing::info!(
        "Starting relay token cleanup task (ttl: {:?}, check interval: {:?})",
        ttl,
        interval
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let (expired, forgotten) = hub.expire(ttl);
                if expired > 0 || forgotten > 0 {
                    tracing::info!(
                        "Relay cleanup: {} unclaimed tokens expired, {} tombstones dropped ({} active bridges)",
                        expired,
                        forgotten,
                        hub.active_count()
                    );
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Relay token cleanup task shutting down");
                break;
            }
        }
    }
}
