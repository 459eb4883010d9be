//! Change-driven metrics reporting.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::metrics::PoolMetrics;
use super::registry::PoolRegistry;

/// How often a reporter inspects its pool.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Minimum spacing between two emissions for the same pool.
const EMIT_INTERVAL: Duration = Duration::from_secs(1);

/// Spawn one reporter task per pool.
///
/// The tasks exit when the registry is shut down; the returned handles let
/// callers await that exit.
pub fn spawn_reporters(registry: &PoolRegistry) -> Vec<JoinHandle<()>> {
    registry
        .pools()
        .map(|pool| {
            let metrics = Arc::clone(pool.metrics());
            let shutdown = registry.shutdown_token();
            tokio::spawn(report(metrics, shutdown))
        })
        .collect()
}

/// Poll the pool's dirty flag and emit at most one state line per second.
///
/// Logging every admission event floods the output under load, while plain
/// polling loses transients; the dirty flag plus the minimum interval bounds
/// volume and still reports every settled state.
async fn report(metrics: Arc<PoolMetrics>, shutdown: CancellationToken) {
    let mut poll = tokio::time::interval(POLL_INTERVAL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_emit: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = poll.tick() => {
                if let Some(at) = last_emit {
                    if at.elapsed() < EMIT_INTERVAL {
                        continue;
                    }
                }
                if let Some(state) = metrics.take_dirty() {
                    info!(
                        model = %metrics.model(),
                        queued = state.queued,
                        processing = state.processing,
                        "pool state"
                    );
                    last_emit = Some(Instant::now());
                }
            }
        }
    }
}
