//! Background tasks driving a [`Dispatcher`].

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::Dispatcher;

/// Periodically detect silent workers and reclaim their buckets.
pub fn spawn_aliveness_sweep(
    dispatcher: Arc<Dispatcher>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(period_secs = period.as_secs(), "Aliveness sweep started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Aliveness sweep shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let transitions = dispatcher.sweep().await;
                    if !transitions.is_empty() {
                        debug!(transitions = transitions.len(), "Aliveness sweep changed workers");
                    }
                }
            }
        }
    })
}

/// Cancel `shutdown` once the termination policy allows the server to exit.
pub fn spawn_termination_watcher(
    dispatcher: Arc<Dispatcher>,
    poll: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if dispatcher.may_terminate().await {
                        info!(
                            idle_secs = dispatcher.idle_for().as_secs(),
                            "Queue is idle, shutting down"
                        );
                        shutdown.cancel();
                        break;
                    }
                }
            }
        }
    })
}
