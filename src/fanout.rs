//! Result fan-out
//!
//! Classifies sealed headers and submits them wherever they count, then puts
//! the current work back on the update channel so hashing resumes at once.

use crate::coordinator::CurrentWork;
use crate::feed::{PendingHeaderSource, SubmitOutcome};
use crate::order;
use crate::types::{hash_hex, Header};
use crate::utils::format_numbers;
use crate::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Routes sealed headers to the header source
pub struct ResultFanout {
    source: Arc<dyn PendingHeaderSource>,
    updates: mpsc::Sender<Header>,
    current: CurrentWork,
}

impl ResultFanout {
    /// Create a fan-out re-injecting `current` work onto `updates`
    pub fn new(
        source: Arc<dyn PendingHeaderSource>,
        updates: mpsc::Sender<Header>,
        current: CurrentWork,
    ) -> Self {
        Self {
            source,
            updates,
            current,
        }
    }

    /// Handle one sealed header
    ///
    /// Returns the submission task when the header satisfies some tier. The
    /// current work is re-injected without waiting for it.
    pub async fn handle_result(&self, header: Header) -> Option<JoinHandle<Vec<SubmitOutcome>>> {
        let submission = match order::resolve(Some(&header)) {
            Ok(order) => {
                info!(
                    tier = %order,
                    numbers = %format_numbers(&header.number),
                    hash = %hash_hex(&header.hash()),
                    "Mined {} block",
                    order
                );

                let source = Arc::clone(&self.source);
                let solved = header.clone();
                Some(tokio::spawn(async move {
                    let outcomes = source.submit(&solved, order).await;
                    for outcome in &outcomes {
                        match &outcome.result {
                            Ok(()) => debug!(endpoint = %outcome.endpoint, "Submitted mined header"),
                            Err(e) => warn!(endpoint = %outcome.endpoint, "Error submitting block: {}", e),
                        }
                    }
                    outcomes
                }))
            }
            Err(e) => {
                warn!("Block mined has an invalid order: {}", e);
                None
            }
        };

        self.reinject(&header).await;
        submission
    }

    async fn reinject(&self, solved: &Header) {
        let current = self.current.borrow().clone();
        let Some(current) = current else {
            debug!("No work in flight to resume");
            return;
        };

        // The solved attempt is over; let the coordinator start it afresh
        if current.seal_hash == solved.seal_hash() {
            current.stop.cancel();
        }

        if self.updates.send(current.header).await.is_err() {
            debug!("Update channel closed, not resuming work");
        }
    }

    /// Consume sealed headers until the channel closes or `shutdown` fires
    ///
    /// Outstanding submissions are awaited before returning.
    pub async fn run(
        self,
        mut results: mpsc::Receiver<Header>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut submissions: Vec<JoinHandle<Vec<SubmitOutcome>>> = Vec::new();

        loop {
            let header = tokio::select! {
                _ = shutdown.cancelled() => break,
                header = results.recv() => match header {
                    Some(header) => header,
                    None => break,
                },
            };

            submissions.retain(|handle| !handle.is_finished());
            if let Some(handle) = self.handle_result(header).await {
                submissions.push(handle);
            }
        }

        for handle in submissions {
            if let Err(e) = handle.await {
                warn!("Submission task failed: {}", e);
            }
        }
        debug!("Result fan-out stopped");
        Ok(())
    }
}
