//! Signer RPC client

use super::{SignerError, SigningSession};
use crate::asset::ChainKind;
use crate::error::{RelayerError, RelayerResult};
use crate::rpc::JsonRpcClient;

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

/// Answer of a signer to `signTx`
#[derive(Debug, Clone, PartialEq)]
pub enum SignResponse {
    Signature(String),
    Rejected(SignerError),
}

/// One remote signer
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SignerClient: Send + Sync {
    async fn sign_tx(&self, session: &SigningSession) -> RelayerResult<SignResponse>;

    /// Session the signer signed for `chain` that has not settled yet
    async fn pending_tx(&self, chain: ChainKind) -> RelayerResult<Option<SigningSession>>;
}

pub struct HttpSignerClient {
    host: String,
    rpc: JsonRpcClient,
}

impl HttpSignerClient {
    pub fn new(host: impl Into<String>, url: &str, timeout: Duration) -> RelayerResult<Self> {
        let host = host.into();
        let rpc = JsonRpcClient::new(url, timeout).map_err(|e| RelayerError::SignerTransport {
            host: host.clone(),
            message: e.to_string(),
        })?;
        Ok(Self { host, rpc })
    }

    fn transport(&self, message: impl ToString) -> RelayerError {
        RelayerError::SignerTransport {
            host: self.host.clone(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl SignerClient for HttpSignerClient {
    async fn sign_tx(&self, session: &SigningSession) -> RelayerResult<SignResponse> {
        let answer = self
            .rpc
            .call::<_, String>("signTx", session)
            .await
            .map_err(|e| self.transport(e))?;

        Ok(match answer {
            Ok(signature) => SignResponse::Signature(signature),
            Err(e) => SignResponse::Rejected(e.into()),
        })
    }

    async fn pending_tx(&self, chain: ChainKind) -> RelayerResult<Option<SigningSession>> {
        self.rpc
            .call("pendingTx", json!({ "chain": chain }))
            .await
            .map_err(|e| self.transport(e))?
            .map_err(|e| self.transport(e))
    }
}
