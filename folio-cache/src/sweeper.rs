//! Background eviction of unobserved entries.

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::client::QueryClient;

/// Sweep `client` every `sweep_interval` until `shutdown_rx` flips to true
/// or its sender is dropped. Returns the total number of evicted entries.
pub async fn sweep_task(client: QueryClient, mut shutdown_rx: watch::Receiver<bool>) -> u64 {
    let period = client.config().sweep_interval;
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        sweep_interval_ms = period.as_millis() as u64,
        gc_after_ms = client.config().gc_after.as_millis() as u64,
        "cache sweeper started"
    );

    let mut evicted = 0u64;
    let mut cycles = 0u64;
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("cache sweeper shutting down");
                    break;
                }
            }
            _ = ticker.tick() => {
                cycles += 1;
                evicted += client.sweep(Utc::now()) as u64;
            }
        }
    }

    tracing::info!(cycles, evicted, "cache sweeper completed");
    evicted
}

/// Spawn [`sweep_task`] onto the runtime.
pub fn spawn_sweeper(client: QueryClient, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<u64> {
    tokio::spawn(sweep_task(client, shutdown_rx))
}
