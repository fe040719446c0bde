//! Mining coordinator
//!
//! Serializes sealing attempts against the stream of pending headers. At most
//! one attempt is in flight; a different header interrupts it and starts a
//! new one, an identical header is ignored.

use crate::engine::SealEngine;
use crate::types::{Hash32, Header, Tier, HIERARCHY_DEPTH};
use crate::utils::{current_timestamp_secs, format_numbers};
use crate::Result;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The sealing attempt currently handed to the engine
#[derive(Debug, Clone)]
pub struct InFlight {
    /// Header as dispatched, time stamped
    pub header: Header,
    /// Identity of the header, independent of time and nonce
    pub seal_hash: Hash32,
    /// Cancels the attempt; cancelling twice is harmless
    pub stop: CancellationToken,
}

impl InFlight {
    /// Whether the engine may still be working on this attempt
    pub fn is_active(&self) -> bool {
        !self.stop.is_cancelled()
    }
}

/// Shared view of the in-flight attempt
pub type CurrentWork = watch::Receiver<Option<InFlight>>;

/// What the coordinator did with a header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Same header as the active attempt, ignored
    Duplicate,
    /// Handed to the engine
    Started,
    /// The engine refused it; nothing is in flight
    Rejected,
}

/// Most-global tier whose block number differs between two headers
pub fn changed_tier(
    previous: &[u64; HIERARCHY_DEPTH],
    next: &[u64; HIERARCHY_DEPTH],
) -> Option<Tier> {
    Tier::ALL
        .into_iter()
        .find(|tier| previous[tier.index()] != next[tier.index()])
}

/// Drives the sealing engine from the update channel
pub struct MiningCoordinator {
    engine: Arc<dyn SealEngine>,
    results: mpsc::Sender<Header>,
    current: watch::Sender<Option<InFlight>>,
    previous_numbers: [u64; HIERARCHY_DEPTH],
}

impl MiningCoordinator {
    /// Create an idle coordinator sending solutions to `results`
    pub fn new(engine: Arc<dyn SealEngine>, results: mpsc::Sender<Header>) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            engine,
            results,
            current,
            previous_numbers: [0; HIERARCHY_DEPTH],
        }
    }

    /// Watch the in-flight attempt
    pub fn subscribe(&self) -> CurrentWork {
        self.current.subscribe()
    }

    /// The in-flight attempt, if any
    pub fn current(&self) -> Option<InFlight> {
        self.current.borrow().clone()
    }

    /// Act on one pending header
    pub fn handle_header(&mut self, mut header: Header) -> Dispatch {
        let seal_hash = header.seal_hash();

        let previous = self.current.borrow().clone();
        if let Some(previous) = previous {
            if previous.is_active() && previous.seal_hash == seal_hash {
                debug!("Ignoring duplicate pending header");
                return Dispatch::Duplicate;
            }
            previous.stop.cancel();
        }

        self.log_numbers(&header);

        header.set_time(current_timestamp_secs());
        let stop = CancellationToken::new();

        match self
            .engine
            .seal(header.clone(), self.results.clone(), stop.clone())
        {
            Ok(()) => {
                self.current.send_replace(Some(InFlight {
                    header,
                    seal_hash,
                    stop,
                }));
                Dispatch::Started
            }
            Err(e) => {
                warn!("Block sealing failed: {}", e);
                stop.cancel();
                self.current.send_replace(None);
                Dispatch::Rejected
            }
        }
    }

    fn log_numbers(&mut self, header: &Header) {
        let numbers = header.number;
        if let Some(tier) = changed_tier(&self.previous_numbers, &numbers) {
            let difficulty: Vec<String> = header.difficulty.iter().map(|d| d.to_string()).collect();
            info!(
                changed = %tier,
                numbers = %format_numbers(&numbers),
                location = %header.location,
                difficulty = ?difficulty,
                "Mining block"
            );
        }
        self.previous_numbers = numbers;
    }

    /// Consume headers until the channel closes or `shutdown` fires
    ///
    /// Headers queued behind the newest one are skipped.
    pub async fn run(
        mut self,
        mut updates: mpsc::Receiver<Header>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        loop {
            let mut header = tokio::select! {
                _ = shutdown.cancelled() => break,
                header = updates.recv() => match header {
                    Some(header) => header,
                    None => break,
                },
            };

            while let Ok(newer) = updates.try_recv() {
                header = newer;
            }

            self.handle_header(header);
        }

        if let Some(active) = self.current() {
            active.stop.cancel();
        }
        debug!("Mining coordinator stopped");
        Ok(())
    }
}
