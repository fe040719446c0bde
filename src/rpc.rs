//! JSON-RPC message definitions
//!
//! Envelopes shared by the HTTP node client and the line-delimited proxy
//! session.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Methods spoken to a mining proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyMethod {
    /// Authenticate with reward address and password
    SubmitLogin,
    /// Ask for the current pending header
    GetPendingHeader,
    /// Hand a solved header to the proxy
    ReceiveMinedHeader,
}

impl ProxyMethod {
    /// Parse method from string
    pub fn parse_method(s: &str) -> Option<Self> {
        match s {
            "quai_submitLogin" => Some(Self::SubmitLogin),
            "quai_getPendingHeader" => Some(Self::GetPendingHeader),
            "quai_receiveMinedHeader" => Some(Self::ReceiveMinedHeader),
            _ => None,
        }
    }

    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SubmitLogin => "quai_submitLogin",
            Self::GetPendingHeader => "quai_getPendingHeader",
            Self::ReceiveMinedHeader => "quai_receiveMinedHeader",
        }
    }
}

impl fmt::Display for ProxyMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Protocol version, always "2.0"
    pub jsonrpc: String,
    /// Request ID
    pub id: u64,
    /// Method name
    pub method: String,
    /// Method parameters
    pub params: Vec<Value>,
}

impl JsonRpcRequest {
    /// Create a new request
    pub fn new(id: u64, method: &str, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// JSON-RPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Request ID this responds to; absent on pushes
    #[serde(default)]
    pub id: Option<Value>,
    /// Result if successful
    #[serde(default)]
    pub result: Option<Value>,
    /// Error if failed
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Numeric request ID, if the response carries one
    pub fn numeric_id(&self) -> Option<u64> {
        self.id.as_ref().and_then(Value::as_u64)
    }
}
