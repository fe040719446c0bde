//! Quai node client for mining operations
//!
//! Handles communication with the Prime, Region and Zone nodes of a slice:
//! pending header requests, mined header submission and the pending header
//! stream.

use crate::feed::retry_with_backoff;
use crate::rpc::{JsonRpcRequest, JsonRpcResponse};
use crate::types::{Hash32, Header, Tier, HIERARCHY_DEPTH};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, ClientBuilder};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Handle to a running pending header stream
#[derive(Debug)]
pub struct Subscription {
    handle: JoinHandle<()>,
    token: CancellationToken,
}

impl Subscription {
    /// Wrap a streaming task and the token that stops it
    pub fn new(handle: JoinHandle<()>, token: CancellationToken) -> Self {
        Self { handle, token }
    }

    /// Stop the stream
    pub fn unsubscribe(&self) {
        self.token.cancel();
    }

    /// Wait for the stream to end
    pub async fn closed(self) {
        if let Err(e) = self.handle.await {
            warn!("Pending header stream task failed: {}", e);
        }
    }
}

/// Node RPC operations used by the miner
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Endpoint the client talks to
    fn endpoint(&self) -> &str;

    /// Fetch the node's current pending header
    async fn get_pending_header(&self) -> Result<Header>;

    /// Submit a sealed header to the node
    async fn receive_mined_header(&self, header: &Header) -> Result<()>;

    /// Forward every new pending header onto `updates` until `shutdown` fires
    async fn subscribe_pending_header(
        &self,
        updates: mpsc::Sender<Header>,
        shutdown: CancellationToken,
    ) -> Result<Subscription>;
}

/// Settings shared by every node connection
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub max_retry_delay: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(4 * 60 * 60),
        }
    }
}

/// HTTP JSON-RPC client for a single Quai node
#[derive(Debug, Clone)]
pub struct RpcClient {
    client: Client,
    url: Url,
    next_id: Arc<AtomicU64>,
    poll_interval: Duration,
}

impl RpcClient {
    /// Create a new node client
    pub fn new(url: impl AsRef<str>, settings: &ClientSettings) -> Result<Self> {
        let url = Url::parse(url.as_ref())
            .map_err(|e| Error::config(format!("Invalid node URL {}: {}", url.as_ref(), e)))?;

        let client = ClientBuilder::new()
            .timeout(settings.timeout)
            .build()
            .map_err(Error::from)?;

        Ok(Self {
            client,
            url,
            next_id: Arc::new(AtomicU64::new(1)),
            poll_interval: settings.poll_interval,
        })
    }

    /// Create a client and confirm the node answers
    #[instrument(skip(settings))]
    pub async fn dial(url: &str, settings: &ClientSettings) -> Result<Self> {
        let client = Self::new(url, settings)?;
        let version = client
            .call("web3_clientVersion", Vec::new())
            .await
            .map_err(|e| Error::connection(url, e.to_string()))?;
        info!("Connected to node {} ({})", url, version);
        Ok(client)
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);

        debug!("Calling {} on {}", method, self.url);

        let response = self
            .client
            .post(self.url.clone())
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        let response: JsonRpcResponse = response.json().await?;
        if let Some(error) = response.error {
            return Err(Error::rpc(self.url.as_str(), error.to_string()));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl NodeClient for RpcClient {
    fn endpoint(&self) -> &str {
        self.url.as_str()
    }

    async fn get_pending_header(&self) -> Result<Header> {
        let result = self.call("quai_getPendingHeader", Vec::new()).await?;
        if result.is_null() {
            return Err(Error::rpc(self.url.as_str(), "no pending header"));
        }
        Ok(serde_json::from_value(result)?)
    }

    async fn receive_mined_header(&self, header: &Header) -> Result<()> {
        let params = vec![serde_json::to_value(header)?];
        self.call("quai_receiveMinedHeader", params).await?;
        Ok(())
    }

    async fn subscribe_pending_header(
        &self,
        updates: mpsc::Sender<Header>,
        shutdown: CancellationToken,
    ) -> Result<Subscription> {
        if self.poll_interval.is_zero() {
            return Err(Error::config("poll interval must be non-zero"));
        }

        let client = self.clone();
        let token = shutdown.child_token();
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(client.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_seal: Option<Hash32> = None;
            let mut failures: u64 = 0;

            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let header = match client.get_pending_header().await {
                    Ok(header) => header,
                    Err(e) => {
                        failures += 1;
                        log_poll_failure(client.url.as_str(), failures, &e);
                        continue;
                    }
                };
                if failures > 0 {
                    info!("Pending header polls on {} recovered after {} failures", client.url, failures);
                    failures = 0;
                }

                let seal = header.seal_hash();
                if last_seal == Some(seal) {
                    continue;
                }
                last_seal = Some(seal);

                tokio::select! {
                    _ = task_token.cancelled() => break,
                    sent = updates.send(header) => {
                        if sent.is_err() {
                            debug!("Update channel closed, ending pending header stream");
                            break;
                        }
                    }
                }
            }
        });

        Ok(Subscription::new(handle, token))
    }
}

/// Log a failed poll, returning whether it was raised as a warning
///
/// The first failure of a run is a warning; the rest stay at debug.
fn log_poll_failure(endpoint: &str, failures: u64, error: &Error) -> bool {
    if failures == 1 {
        warn!(endpoint, error = %error, "Pending header poll failed");
        true
    } else {
        debug!(endpoint, failures, error = %error, "Pending header poll failed");
        false
    }
}

/// Node connections for the slice being mined, indexed by tier
#[derive(Clone, Default)]
pub struct TierClients {
    clients: [Option<Arc<dyn NodeClient>>; HIERARCHY_DEPTH],
}

impl TierClients {
    /// Build from per-tier clients
    pub fn new(clients: [Option<Arc<dyn NodeClient>>; HIERARCHY_DEPTH]) -> Self {
        Self { clients }
    }

    /// Client for a tier, if one is configured
    pub fn get(&self, tier: Tier) -> Option<&Arc<dyn NodeClient>> {
        self.clients[tier.index()].as_ref()
    }

    /// The Zone client, which supplies pending headers
    pub fn zone(&self) -> Result<&Arc<dyn NodeClient>> {
        self.get(Tier::Zone)
            .ok_or_else(|| Error::config("no zone endpoint configured"))
    }
}

impl std::fmt::Debug for TierClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut list = f.debug_map();
        for tier in Tier::ALL {
            list.entry(&tier, &self.get(tier).map(|c| c.endpoint().to_string()));
        }
        list.finish()
    }
}

/// Connect to every configured tier endpoint of the slice
///
/// Each tier is dialed until it answers, backing off between failures.
/// Tiers without an endpoint stay disconnected.
pub async fn connect_to_slice(
    endpoints: &[Option<String>; HIERARCHY_DEPTH],
    settings: &ClientSettings,
    shutdown: &CancellationToken,
) -> Result<TierClients> {
    let mut clients: [Option<Arc<dyn NodeClient>>; HIERARCHY_DEPTH] = Default::default();

    for tier in Tier::ALL {
        let Some(url) = endpoints[tier.index()].as_deref() else {
            debug!(%tier, "No endpoint configured");
            continue;
        };

        let operation = format!("connect to {} node {}", tier, url);
        let client = retry_with_backoff(&operation, settings.max_retry_delay, shutdown, || {
            RpcClient::dial(url, settings)
        })
        .await?;
        clients[tier.index()] = Some(Arc::new(client));
    }

    Ok(TierClients::new(clients))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_poll_failure_is_a_warning() {
        let err = Error::connection("http://zone:8610", "refused");
        assert!(log_poll_failure("http://zone:8610", 1, &err));
        assert!(!log_poll_failure("http://zone:8610", 2, &err));
        assert!(!log_poll_failure("http://zone:8610", 50, &err));
    }

    #[test]
    fn test_client_creation() {
        let client = RpcClient::new("http://localhost:8610", &ClientSettings::default());
        assert!(client.is_ok());
        assert_eq!(client.unwrap().endpoint(), "http://localhost:8610/");
    }

    #[test]
    fn test_invalid_url_is_config_error() {
        let err = RpcClient::new("not a url", &ClientSettings::default()).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[tokio::test]
    async fn test_zero_poll_interval_rejected() {
        let settings = ClientSettings {
            poll_interval: Duration::ZERO,
            ..ClientSettings::default()
        };
        let client = RpcClient::new("http://localhost:8610", &settings).unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let result = client
            .subscribe_pending_header(tx, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_missing_zone_client() {
        let clients = TierClients::default();
        assert!(clients.get(Tier::Prime).is_none());
        assert!(matches!(clients.zone(), Err(Error::Config { .. })));
    }

    #[tokio::test]
    async fn test_connect_skips_unconfigured_tiers() {
        let clients = connect_to_slice(
            &[None, None, None],
            &ClientSettings::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(Tier::ALL.iter().all(|t| clients.get(*t).is_none()));
    }

    #[tokio::test]
    async fn test_connect_stops_on_shutdown() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let endpoints = [None, None, Some("http://127.0.0.1:1".to_string())];
        let result = connect_to_slice(&endpoints, &ClientSettings::default(), &shutdown).await;
        assert!(matches!(result, Err(Error::Cancelled { .. })));
    }
}
