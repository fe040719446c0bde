//! Pending header feed
//!
//! Produces candidate headers on the update channel from one of two sources,
//! chosen once at startup: the node set of the slice being mined, or a single
//! mining proxy. Sources also carry solved headers back to wherever they
//! belong.

use crate::client::TierClients;
use crate::proxy::ProxySession;
use crate::types::{Header, Tier};
use crate::utils::ExponentialBackoff;
use crate::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Retry `op` until it succeeds, doubling the delay from one second up to
/// `max_delay`
///
/// Never gives up; only `shutdown` ends the loop, with [`Error::Cancelled`].
pub async fn retry_with_backoff<T, F, Fut>(
    operation: &str,
    max_delay: Duration,
    shutdown: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = ExponentialBackoff::doubling(max_delay);

    loop {
        let outcome = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(Error::cancelled(operation)),
            outcome = op() => outcome,
        };

        let err = match outcome {
            Ok(value) => {
                if backoff.attempt() > 0 {
                    debug!("{} succeeded after {} retries", operation, backoff.attempt());
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        let delay = backoff.next_delay();
        warn!(
            error = %err,
            category = err.category(),
            "{} failed, retrying in {:?}",
            operation,
            delay
        );

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(Error::cancelled(operation)),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Where a solved header was submitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// A node of the slice
    Tier(Tier),
    /// The mining proxy
    Proxy,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tier(tier) => write!(f, "{}", tier),
            Endpoint::Proxy => f.write_str("proxy"),
        }
    }
}

/// Outcome of one submission
#[derive(Debug)]
pub struct SubmitOutcome {
    pub endpoint: Endpoint,
    pub result: Result<()>,
}

/// Source of pending headers and sink for solved ones
#[async_trait]
pub trait PendingHeaderSource: Send + Sync {
    /// Publish headers onto `updates` until `shutdown` fires
    async fn start(&self, updates: mpsc::Sender<Header>, shutdown: CancellationToken) -> Result<()>;

    /// Ask for the next header
    ///
    /// Sources that answer asynchronously return `None`; their header arrives
    /// through the running feed.
    async fn next_header(&self) -> Result<Option<Header>>;

    /// Submit a solved header of the given order
    async fn submit(&self, header: &Header, order: Tier) -> Vec<SubmitOutcome>;
}

async fn publish(
    updates: &mpsc::Sender<Header>,
    header: Header,
    shutdown: &CancellationToken,
) -> Result<()> {
    tokio::select! {
        _ = shutdown.cancelled() => Err(Error::cancelled("publish header")),
        sent = updates.send(header) => sent.map_err(|_| Error::channel_closed("update")),
    }
}

/// Headers straight from the nodes of the slice
pub struct DirectSource {
    clients: TierClients,
    max_retry_delay: Duration,
}

impl DirectSource {
    /// Create a source over connected tier clients
    pub fn new(clients: TierClients, max_retry_delay: Duration) -> Self {
        Self {
            clients,
            max_retry_delay,
        }
    }
}

#[async_trait]
impl PendingHeaderSource for DirectSource {
    async fn start(&self, updates: mpsc::Sender<Header>, shutdown: CancellationToken) -> Result<()> {
        let zone = self.clients.zone()?;

        // One fetch up front so mining starts before the first push
        let header = retry_with_backoff("fetch pending header", self.max_retry_delay, &shutdown, || async {
            self.next_header()
                .await?
                .ok_or_else(|| Error::rpc(zone.endpoint(), "no pending header"))
        })
        .await?;
        publish(&updates, header, &shutdown).await?;

        let subscription = retry_with_backoff(
            "subscribe to pending headers",
            self.max_retry_delay,
            &shutdown,
            || zone.subscribe_pending_header(updates.clone(), shutdown.clone()),
        )
        .await?;

        info!("Subscribed to pending headers from {}", zone.endpoint());
        subscription.closed().await;
        debug!("Pending header subscription ended");
        Ok(())
    }

    async fn next_header(&self) -> Result<Option<Header>> {
        let header = self.clients.zone()?.get_pending_header().await?;
        Ok(Some(header))
    }

    async fn submit(&self, header: &Header, order: Tier) -> Vec<SubmitOutcome> {
        let submissions = order.and_below().map(|tier| async move {
            let result = match self.clients.get(tier) {
                Some(client) => client.receive_mined_header(header).await,
                None => Err(Error::config(format!("no {} endpoint configured", tier))),
            };
            SubmitOutcome {
                endpoint: Endpoint::Tier(tier),
                result,
            }
        });
        futures::future::join_all(submissions).await
    }
}

/// Headers from a mining proxy
pub struct ProxySource {
    session: Arc<ProxySession>,
    reward_address: String,
    password: String,
    refresh_interval: Duration,
    max_retry_delay: Duration,
}

impl ProxySource {
    /// Create a source over a proxy session
    pub fn new(
        session: Arc<ProxySession>,
        reward_address: impl Into<String>,
        password: impl Into<String>,
        refresh_interval: Duration,
        max_retry_delay: Duration,
    ) -> Self {
        Self {
            session,
            reward_address: reward_address.into(),
            password: password.into(),
            refresh_interval,
            max_retry_delay,
        }
    }

    async fn open(&self) -> Result<crate::proxy::ProxyReader> {
        let reader = self.session.connect().await?;
        self.session.login(&self.reward_address, &self.password).await?;
        self.session.request_pending_header().await?;
        Ok(reader)
    }

    /// Re-request the pending header on a fixed interval in case a push was missed
    async fn refresh(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.next_header().await {
                debug!("Pending header refresh failed: {}", e);
            }
        }
    }
}

#[async_trait]
impl PendingHeaderSource for ProxySource {
    async fn start(&self, updates: mpsc::Sender<Header>, shutdown: CancellationToken) -> Result<()> {
        let mut reconnect = ExponentialBackoff::doubling(self.max_retry_delay);

        loop {
            let operation = format!("connect to proxy {}", self.session.endpoint());
            let reader =
                match retry_with_backoff(&operation, self.max_retry_delay, &shutdown, || self.open()).await {
                    Ok(reader) => reader,
                    Err(Error::Cancelled { .. }) => return Ok(()),
                    Err(e) => return Err(e),
                };

            let session_token = shutdown.child_token();
            let outcome = tokio::select! {
                _ = shutdown.cancelled() => None,
                _ = self.refresh(session_token.clone()) => None,
                outcome = self.session.listen(reader, &updates) => Some(outcome),
            };
            session_token.cancel();
            self.session.disconnect().await;

            match outcome {
                None => return Ok(()),
                Some(Ok(forwarded)) => {
                    if forwarded > 0 {
                        reconnect.reset();
                    }
                }
                Some(Err(e @ Error::ChannelClosed { .. })) => return Err(e),
                Some(Err(e)) => warn!("Proxy session ended: {}", e),
            }

            let delay = reconnect.next_delay();
            info!("Reconnecting to proxy in {:?}", delay);
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn next_header(&self) -> Result<Option<Header>> {
        self.session.request_pending_header().await?;
        Ok(None)
    }

    async fn submit(&self, header: &Header, _order: Tier) -> Vec<SubmitOutcome> {
        let result = self.session.submit_mined_header(header).await.map(|_| ());
        vec![SubmitOutcome {
            endpoint: Endpoint::Proxy,
            result,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_between_attempts() {
        let shutdown = CancellationToken::new();
        let attempts = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let start = Instant::now();

        let value = retry_with_backoff("fetch", Duration::from_secs(3600), &shutdown, || {
            let attempts = attempts.clone();
            async move {
                let mut attempts = attempts.lock();
                attempts.push(start.elapsed());
                if attempts.len() < 4 {
                    Err(Error::rpc("zone", "not ready"))
                } else {
                    Ok(attempts.len())
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 4);
        let attempts = attempts.lock();
        let gaps: Vec<_> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_respects_ceiling() {
        let shutdown = CancellationToken::new();
        let calls = AtomicUsize::new(0);
        let start = Instant::now();

        let result: Result<()> = retry_with_backoff("fetch", Duration::from_secs(2), &shutdown, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 4 {
                    Err(Error::rpc("zone", "not ready"))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        // 1 + 2 + 2 + 2
        assert_eq!(start.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_cancelled_by_shutdown() {
        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            trigger.cancel();
        });

        let result: Result<()> =
            retry_with_backoff("fetch", Duration::from_secs(3600), &shutdown, || async {
                Err(Error::rpc("zone", "down"))
            })
            .await;

        assert!(matches!(result, Err(Error::Cancelled { .. })));
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::Tier(Tier::Region).to_string(), "region");
        assert_eq!(Endpoint::Proxy.to_string(), "proxy");
    }
}
