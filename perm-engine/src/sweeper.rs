// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use perm_store::EntryStore;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::Permissions;

/// Periodically removes expired entries and memberships until `token` is cancelled.
///
/// The first sweep runs right away. Failed sweeps are logged and retried with the next tick.
pub fn spawn_sweeper<S>(
    engine: Arc<Permissions<S>>,
    period: Duration,
    token: CancellationToken,
) -> JoinHandle<()>
where
    S: EntryStore,
{
    tokio::spawn(async move {
        let mut ticks = interval(period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    debug!("expiry sweeper received shutdown signal");
                    break;
                }
                _ = ticks.tick() => {
                    match engine.sweep_expired().await {
                        Ok(0) => (),
                        Ok(removed) => info!(removed, "swept expired permissions"),
                        Err(err) => warn!("failed sweeping expired permissions: {err}"),
                    }
                }
            }
        }
    })
}
