//! Periodic sweep that releases bindings whose index entry has aged past
//! the lease horizon. Restores the bit/binding invariant after clients
//! disappear without sending RELEASE.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::lease::{LeaseAllocator, now_unix_ns};

pub struct Reaper {
    allocator: Arc<LeaseAllocator>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Reaper {
    pub fn new(
        allocator: Arc<LeaseAllocator>,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            allocator,
            interval,
            shutdown,
        }
    }

    /// Runs sweeps until the shutdown signal fires. Sweep failures are
    /// logged and the loop keeps going; only shutdown ends it.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; wait a full period instead.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let horizon = self.allocator.lease_duration();
                    match self.allocator.reap_expired(now_unix_ns(), horizon).await {
                        Ok(0) => debug!("expiry sweep found nothing to release"),
                        Ok(count) => info!(count, "released expired leases"),
                        Err(error) => warn!(%error, "expiry sweep failed"),
                    }
                }
                _ = self.shutdown.changed() => {
                    debug!("reaper shutting down");
                    return;
                }
            }
        }
    }
}
