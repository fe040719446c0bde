//! Miner lifecycle
//!
//! Wires the feed, coordinator, fan-out and hashrate reporter together over
//! the update and result channels, and joins them on shutdown.

use crate::coordinator::MiningCoordinator;
use crate::engine::SealEngine;
use crate::fanout::ResultFanout;
use crate::feed::PendingHeaderSource;
use crate::utils::format_hash_rate;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the update and result channels
pub const CHANNEL_CAPACITY: usize = 10;

/// A configured miner ready to run
pub struct Miner {
    source: Arc<dyn PendingHeaderSource>,
    engine: Arc<dyn SealEngine>,
    hashrate_interval: Duration,
}

impl Miner {
    /// Create a miner over a header source and a sealing engine
    pub fn new(
        source: Arc<dyn PendingHeaderSource>,
        engine: Arc<dyn SealEngine>,
        hashrate_interval: Duration,
    ) -> Self {
        Self {
            source,
            engine,
            hashrate_interval,
        }
    }

    /// Mine until `shutdown` fires or a worker fails
    ///
    /// Every worker is joined before returning. The first worker error is
    /// returned after cancelling the others.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let (update_tx, update_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (result_tx, result_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let coordinator = MiningCoordinator::new(Arc::clone(&self.engine), result_tx);
        let fanout = ResultFanout::new(
            Arc::clone(&self.source),
            update_tx.clone(),
            coordinator.subscribe(),
        );

        let mut workers: JoinSet<(&'static str, Result<()>)> = JoinSet::new();

        let source = Arc::clone(&self.source);
        let token = shutdown.clone();
        workers.spawn(async move { ("feed", source.start(update_tx, token).await) });

        let token = shutdown.clone();
        workers.spawn(async move { ("coordinator", coordinator.run(update_rx, token).await) });

        let token = shutdown.clone();
        workers.spawn(async move { ("fan-out", fanout.run(result_rx, token).await) });

        let engine = Arc::clone(&self.engine);
        let token = shutdown.clone();
        let every = self.hashrate_interval;
        workers.spawn(async move { ("hashrate", report_hashrate(engine, every, token).await) });

        info!("Miner started");

        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    if shutdown.is_cancelled() {
                        debug!("{} stopped", name);
                    } else {
                        warn!("{} stopped before shutdown", name);
                    }
                }
                Ok((name, Err(Error::Cancelled { .. }))) => debug!("{} cancelled", name),
                Ok((name, Err(e))) => {
                    error!(category = e.category(), "{} failed: {}", name, e);
                    shutdown.cancel();
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!("Worker task panicked: {}", e);
                    shutdown.cancel();
                }
            }
        }

        info!("Miner stopped");
        first_error.map_or(Ok(()), Err)
    }
}

/// Log the engine hashrate every `every` until `shutdown` fires
pub async fn report_hashrate(
    engine: Arc<dyn SealEngine>,
    every: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = ticker.tick() => {
                let rate = engine.hashrate();
                info!(hashrate = rate, "Current hashrate: {}", format_hash_rate(rate));
            }
        }
    }
}
