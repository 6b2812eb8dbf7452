//! Chain gateway client
//!
//! Chains without a native client are reached through a gateway service that
//! speaks JSON-RPC and also builds their bridge transactions.

use crate::asset::{Asset, ChainKind};
use crate::config::ChainConfig;
use crate::coordination::{BuildRequest, BuiltTx, TxBuilder};
use crate::error::{RelayerError, RelayerResult};
use crate::multisig::SigPayload;
use crate::rpc::{JsonRpcClient, RpcError, TransportError};

use super::{BlockHeader, ChainClient, ChainEvent, SignedTx, TxStatus};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::warn;

pub struct GatewayClient {
    chain: ChainKind,
    endpoints: Vec<JsonRpcClient>,
    current: AtomicUsize,
}

impl GatewayClient {
    pub fn new(chain: ChainKind, url: &str, timeout: Duration) -> RelayerResult<Self> {
        Self::with_urls(chain, std::slice::from_ref(&url.to_string()), timeout)
    }

    pub fn from_config(config: &ChainConfig, timeout: Duration) -> RelayerResult<Self> {
        Self::with_urls(config.kind, &config.rpc_urls, timeout)
    }

    fn with_urls(chain: ChainKind, urls: &[String], timeout: Duration) -> RelayerResult<Self> {
        let endpoints = urls
            .iter()
            .map(|url| JsonRpcClient::new(url.as_str(), timeout))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RelayerError::chain_rpc(chain, e))?;

        if endpoints.is_empty() {
            return Err(RelayerError::chain_rpc(chain, "No gateway URLs"));
        }

        Ok(Self {
            chain,
            endpoints,
            current: AtomicUsize::new(0),
        })
    }

    fn failover(&self) {
        let next = (self.current.load(Ordering::Relaxed) + 1) % self.endpoints.len();
        self.current.store(next, Ordering::Relaxed);
        warn!(chain = %self.chain, "Failover to gateway {}", next);
    }

    /// Call with failover on transport errors; remote errors are returned as is
    async fn request<P, R>(&self, method: &str, params: P) -> RelayerResult<Result<R, RpcError>>
    where
        P: Serialize + Clone,
        R: DeserializeOwned,
    {
        let mut last: Option<TransportError> = None;
        for _ in 0..self.endpoints.len() {
            let idx = self.current.load(Ordering::Relaxed) % self.endpoints.len();
            match self.endpoints[idx].call(method, params.clone()).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    warn!(chain = %self.chain, method, error = %e, "Gateway call failed");
                    last = Some(e);
                    self.failover();
                }
            }
        }

        Err(RelayerError::chain_rpc(
            self.chain,
            last.map(|e| e.0).unwrap_or_default(),
        ))
    }

    /// Read call: remote errors are as transient as transport ones
    async fn read<P, R>(&self, method: &str, params: P) -> RelayerResult<R>
    where
        P: Serialize + Clone,
        R: DeserializeOwned,
    {
        self.request(method, params)
            .await?
            .map_err(|e| RelayerError::chain_rpc(self.chain, e))
    }

    async fn build_call<P, R>(&self, method: &str, params: P) -> RelayerResult<R>
    where
        P: Serialize + Clone,
        R: DeserializeOwned,
    {
        self.request(method, params)
            .await?
            .map_err(|e| RelayerError::TxBuild(format!("{} on {}: {}", method, self.chain, e)))
    }
}

#[async_trait]
impl ChainClient for GatewayClient {
    fn chain(&self) -> ChainKind {
        self.chain
    }

    async fn tip_height(&self) -> RelayerResult<u64> {
        self.read("tipHeight", json!([])).await
    }

    async fn get_block(&self, height: u64) -> RelayerResult<Option<BlockHeader>> {
        self.read("getBlock", json!([height])).await
    }

    async fn get_events(&self, from: u64, to: u64) -> RelayerResult<Vec<ChainEvent>> {
        self.read("getEvents", json!([from, to])).await
    }

    async fn broadcast(&self, tx: &SignedTx) -> RelayerResult<String> {
        self.request("broadcast", json!([tx.raw]))
            .await?
            .map_err(|e| RelayerError::TxBuild(format!("broadcast rejected: {}", e)))
    }

    async fn get_status(&self, tx_hash: &str) -> RelayerResult<TxStatus> {
        self.read("getStatus", json!([tx_hash])).await
    }
}

#[async_trait]
impl TxBuilder for GatewayClient {
    async fn build(&self, request: &BuildRequest) -> RelayerResult<BuiltTx> {
        self.build_call("buildTx", json!([request])).await
    }

    async fn digest(&self, payload: &SigPayload) -> RelayerResult<String> {
        self.build_call("digestTx", json!([payload])).await
    }

    async fn assemble(
        &self,
        skeleton: &serde_json::Value,
        signatures: &[String],
    ) -> RelayerResult<SignedTx> {
        let raw = self
            .build_call("assembleTx", json!([skeleton, signatures]))
            .await?;
        Ok(SignedTx { raw })
    }

    async fn unregistered_assets(&self, assets: &[Asset]) -> RelayerResult<Vec<Asset>> {
        self.read("unregisteredAssets", json!([assets])).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::EventKind;
    use crate::multisig::TransferItem;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mock_method(server: &MockServer, name: &str, body: serde_json::Value) {
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": name })))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_chain_reads() {
        let server = MockServer::start().await;
        mock_method(&server, "tipHeight", json!({"jsonrpc": "2.0", "id": 1, "result": 120})).await;
        mock_method(
            &server,
            "getBlock",
            json!({"jsonrpc": "2.0", "id": 2, "result": {
                "number": 120, "hash": "0xb120", "parentHash": "0xb119"
            }}),
        )
        .await;
        mock_method(
            &server,
            "getEvents",
            json!({"jsonrpc": "2.0", "id": 3, "result": [{
                "txHash": "0xt1", "logIndex": 0, "blockNumber": 120, "blockHash": "0xb120",
                "kind": {"type": "lock", "asset": "trx", "amount": "10",
                         "sender": "T1", "recipient": "ckt1"}
            }]}),
        )
        .await;
        mock_method(
            &server,
            "getStatus",
            json!({"jsonrpc": "2.0", "id": 4, "result": {"status": "failed", "reason": "out of gas"}}),
        )
        .await;

        let client = GatewayClient::new(ChainKind::Tron, &server.uri(), Duration::from_secs(5)).unwrap();

        assert_eq!(client.tip_height().await.unwrap(), 120);
        let block = client.get_block(120).await.unwrap().unwrap();
        assert_eq!(block.parent_hash, "0xb119");

        let events = client.get_events(110, 120).await.unwrap();
        assert!(matches!(events[0].kind, EventKind::Lock { .. }));

        assert_eq!(
            client.get_status("0xt1").await.unwrap(),
            TxStatus::Failed("out of gas".into())
        );
    }

    #[tokio::test]
    async fn test_build_errors_are_not_transient() {
        let server = MockServer::start().await;
        mock_method(
            &server,
            "buildTx",
            json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32000, "message": "no capacity"}}),
        )
        .await;

        let client =
            GatewayClient::new(ChainKind::Nervos, &server.uri(), Duration::from_secs(5)).unwrap();
        let request = BuildRequest::Mint(vec![TransferItem {
            id: "0xaa-0".into(),
            asset: Asset::Tron("trx".into()),
            amount: 5,
            recipient: "ckt1".into(),
        }]);

        let err = client.build(&request).await.unwrap_err();
        assert!(matches!(err, RelayerError::TxBuild(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_digest_recomputed_by_gateway() {
        let server = MockServer::start().await;
        mock_method(
            &server,
            "digestTx",
            json!({"jsonrpc": "2.0", "id": 1, "result": "0xd1"}),
        )
        .await;

        let client =
            GatewayClient::new(ChainKind::Nervos, &server.uri(), Duration::from_secs(5)).unwrap();
        let payload = SigPayload::Mint {
            items: vec![],
            skeleton: json!({"outputs": []}),
        };
        assert_eq!(client.digest(&payload).await.unwrap(), "0xd1");

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["params"][0]["skeleton"], json!({"outputs": []}));
    }

    #[tokio::test]
    async fn test_unreachable_gateway_is_transient() {
        let client = GatewayClient::new(
            ChainKind::Eos,
            "http://127.0.0.1:9",
            Duration::from_millis(200),
        )
        .unwrap();
        let err = client.tip_height().await.unwrap_err();
        assert!(err.is_retryable());
    }
}
