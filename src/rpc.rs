//! JSON-RPC 2.0 over HTTP
//!
//! Shared by the signer client, the signer endpoint and the chain gateway
//! client.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    #[serde(default)]
    pub id: Value,
}

impl JsonRpcResponse {
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

/// Application error returned by the remote side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("rpc error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

/// The request never produced a usable response
#[derive(Debug, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

#[derive(Clone, Debug)]
pub struct JsonRpcClient {
    http_client: reqwest::Client,
    url: String,
    request_id: Arc<AtomicU64>,
}

impl JsonRpcClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError(e.to_string()))?;

        Ok(Self {
            http_client,
            url: url.into(),
            request_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Call `method`; the outer error is transport, the inner one is the
    /// remote application error
    pub async fn call<P, R>(
        &self,
        method: &str,
        params: P,
    ) -> Result<Result<R, RpcError>, TransportError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params: serde_json::to_value(params).map_err(|e| TransportError(e.to_string()))?,
            id: Value::from(id),
        };

        trace!(url = %self.url, method, id, "rpc request");

        let response = self
            .http_client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| TransportError(format!("{} {}: {}", method, self.url, e)))?;

        if !response.status().is_success() {
            return Err(TransportError(format!(
                "{} {}: http status {}",
                method,
                self.url,
                response.status()
            )));
        }

        let body: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| TransportError(format!("{}: invalid response: {}", method, e)))?;

        if let Some(error) = body.error {
            return Ok(Err(error));
        }

        let result = body.result.unwrap_or(Value::Null);
        serde_json::from_value(result)
            .map(Ok)
            .map_err(|e| TransportError(format!("{}: unexpected result: {}", method, e)))
    }
}
