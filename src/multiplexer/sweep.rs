//! Background Timeout Sweeper
//!
//! One task per multiplexer wakes on a fixed interval and sweeps every
//! endpoint:
//!
//! 1. Pending messages held past the disconnected grace period, or queued
//!    past their own timeout, are failed.
//! 2. Written messages past their deadline are failed with `Timeout` and
//!    counted; they stay in the FIFO so the late reply still lines up.
//! 3. Idle connections get a heartbeat `PING`.
//!
//! Replies never wait on the sweeper, and the sweeper never waits on I/O.

use crate::endpoint::Endpoint;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, trace};

/// A handle to the running sweeper.
///
/// When this handle is dropped, the sweeper task will be stopped.
#[derive(Debug)]
pub struct TimeoutSweeper {
    shutdown_tx: watch::Sender<bool>,
}

impl TimeoutSweeper {
    /// Starts sweeping `endpoints` every `interval` on `runtime`.
    pub(crate) fn start(
        endpoints: Arc<RwLock<Vec<Arc<Endpoint>>>>,
        interval: Duration,
        runtime: &Handle,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        runtime.spawn(sweeper_loop(endpoints, interval, shutdown_rx));

        info!(interval_ms = interval.as_millis() as u64, "Timeout sweeper started");

        Self { shutdown_tx }
    }

    /// Stops the sweeper. Called automatically on drop.
    pub fn stop(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        info!("Timeout sweeper stopped");
    }
}

impl Drop for TimeoutSweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sweeper_loop(
    endpoints: Arc<RwLock<Vec<Arc<Endpoint>>>>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Timeout sweeper received shutdown signal");
                    return;
                }
            }
        }

        // Snapshot so the lock is not held while bridges fail messages and
        // run continuations.
        let snapshot: Vec<Arc<Endpoint>> = endpoints.read().clone();
        let now = Instant::now();

        for endpoint in snapshot {
            let outcome = endpoint.sweep(now);
            if outcome.timed_out > 0 || outcome.expired_held > 0 || outcome.torn_down {
                debug!(
                    endpoint = %endpoint.address(),
                    timed_out = outcome.timed_out,
                    expired_held = outcome.expired_held,
                    torn_down = outcome.torn_down,
                    "Sweep failed messages"
                );
            } else if outcome.heartbeat {
                trace!(endpoint = %endpoint.address(), "Sweep queued heartbeat");
            }
        }
    }
}
