//! Mining proxy session
//!
//! A persistent TCP connection to a pooled-mining proxy speaking
//! newline-delimited JSON-RPC. Requests are written under a single lock that
//! also orders the request IDs; replies are read one bounded line at a time.

use crate::rpc::{JsonRpcRequest, JsonRpcResponse, ProxyMethod};
use crate::types::Header;
use crate::{Error, Result};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info, warn};

/// Longest inbound line accepted from the proxy
pub const MAX_LINE_LENGTH: usize = 4096;

/// Most requests tracked while awaiting a reply; the oldest are forgotten first
pub const MAX_OUTSTANDING: usize = 64;

/// Inbound half of a proxy connection
pub type ProxyReader = FramedRead<OwnedReadHalf, LinesCodec>;

type ProxyWriter = FramedWrite<OwnedWriteHalf, LinesCodec>;

/// Connection to a mining proxy
#[derive(Debug)]
pub struct ProxySession {
    endpoint: String,
    writer: Mutex<Option<ProxyWriter>>,
    next_id: AtomicU64,
    pending: DashMap<u64, ProxyMethod>,
}

impl ProxySession {
    /// Create a disconnected session for `endpoint` (`host:port`)
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            writer: Mutex::new(None),
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
        }
    }

    /// Proxy address
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Open the TCP connection, replacing any previous one
    ///
    /// Returns the read half for [`ProxySession::listen`].
    pub async fn connect(&self) -> Result<ProxyReader> {
        let stream = TcpStream::connect(&self.endpoint)
            .await
            .map_err(|e| Error::connection(&self.endpoint, e.to_string()))?;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let reader = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

        let mut writer = self.writer.lock().await;
        *writer = Some(FramedWrite::new(write_half, LinesCodec::new()));
        self.pending.clear();

        info!("Connected to mining proxy {}", self.endpoint);
        Ok(reader)
    }

    /// Drop the write half; later requests fail until the next connect
    pub async fn disconnect(&self) {
        self.writer.lock().await.take();
        self.pending.clear();
    }

    /// Write one request line, returning its ID
    pub async fn send_request(&self, method: ProxyMethod, params: Vec<Value>) -> Result<u64> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| Error::proxy(format!("not connected to {}", self.endpoint)))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = serde_json::to_string(&JsonRpcRequest::new(id, method.as_str(), params))?;

        self.track(id, method);
        if let Err(e) = writer.send(line).await {
            self.pending.remove(&id);
            return Err(e.into());
        }

        debug!(id, %method, "Sent proxy request");
        Ok(id)
    }

    /// Authenticate with the reward address and password
    pub async fn login(&self, reward_address: &str, password: &str) -> Result<u64> {
        let params = vec![Value::from(reward_address), Value::from(password)];
        self.send_request(ProxyMethod::SubmitLogin, params).await
    }

    /// Ask the proxy for its current pending header
    pub async fn request_pending_header(&self) -> Result<u64> {
        self.send_request(ProxyMethod::GetPendingHeader, Vec::new()).await
    }

    /// Hand a sealed header to the proxy
    pub async fn submit_mined_header(&self, header: &Header) -> Result<u64> {
        let params = vec![serde_json::to_value(header)?];
        self.send_request(ProxyMethod::ReceiveMinedHeader, params).await
    }

    /// Number of requests still awaiting a reply
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    // Called with the writer lock held, so IDs arrive in increasing order
    fn track(&self, id: u64, method: ProxyMethod) {
        self.pending.insert(id, method);
        while self.pending.len() > MAX_OUTSTANDING {
            let Some(oldest) = self.pending.iter().map(|entry| *entry.key()).min() else {
                break;
            };
            self.pending.remove(&oldest);
            debug!(id = oldest, "Forgetting unanswered proxy request");
        }
    }

    /// Header replies supersede every earlier header request
    fn settle_header_requests(&self, answered: u64) {
        self.pending
            .retain(|id, method| !(*method == ProxyMethod::GetPendingHeader && *id < answered));
    }

    /// Read replies until the proxy disconnects
    ///
    /// Header-bearing replies and unsolicited pushes are forwarded to
    /// `updates`. Returns the number of headers forwarded on a clean
    /// disconnect. An error reply, an over-length line or undecodable JSON
    /// ends the loop with an error.
    pub async fn listen(&self, mut reader: ProxyReader, updates: &mpsc::Sender<Header>) -> Result<u64> {
        let mut forwarded = 0;

        while let Some(line) = reader.next().await {
            let line = line.inspect_err(|e| warn!("Proxy read failed on {}: {}", self.endpoint, e))?;
            if line.trim().is_empty() {
                continue;
            }

            let response: JsonRpcResponse = serde_json::from_str(&line)
                .map_err(|e| Error::framing(format!("Unable to decode RPC response: {}", e)))?;

            let id = response.numeric_id();
            let method = id
                .and_then(|id| self.pending.remove(&id))
                .map(|(_, method)| method);

            if let Some(error) = response.error {
                warn!("Error received from proxy: {}", error);
                return Err(Error::proxy(error.message));
            }

            match method {
                Some(ProxyMethod::SubmitLogin) => {
                    info!("Logged in to proxy {}", self.endpoint);
                    continue;
                }
                Some(ProxyMethod::ReceiveMinedHeader) => {
                    info!("Proxy accepted mined header");
                    continue;
                }
                Some(ProxyMethod::GetPendingHeader) => {
                    if let Some(id) = id {
                        self.settle_header_requests(id);
                    }
                }
                None => {}
            }

            let Some(result) = response.result.filter(|r| !r.is_null()) else {
                debug!("Ignoring proxy reply without a header");
                continue;
            };
            if method.is_none() && !result.is_object() {
                debug!(?id, "Ignoring reply to a forgotten proxy request");
                continue;
            }

            let header: Header = serde_json::from_value(result)
                .map_err(|e| Error::framing(format!("Unable to decode header: {}", e)))?;

            updates
                .send(header)
                .await
                .map_err(|_| Error::channel_closed("update"))?;
            forwarded += 1;
        }

        info!("Proxy {} disconnected", self.endpoint);
        Ok(forwarded)
    }
}
