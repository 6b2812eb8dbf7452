//! Chain module - chain clients, confirmation math and block observation
//!
//! This module provides:
//! - The `ChainClient` seam every watched chain is reached through
//! - A native EVM client with multi-RPC failover
//! - A JSON-RPC gateway client for the remaining chains
//! - `ChainObserver`, which advances a cursor and repairs forks

pub mod finality;
pub mod gateway;
pub mod observer;
pub mod provider;
#[cfg(test)]
pub(crate) mod testing;

pub use gateway::GatewayClient;
pub use observer::ChainObserver;
pub use provider::EvmClient;

use crate::asset::ChainKind;
use crate::config::{ClientKind, Settings};
use crate::coordination::TxBuilder;
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
}

/// A bridge-contract event as reported by a chain client. Amounts are
/// decimal strings and are validated during classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainEvent {
    pub tx_hash: String,
    pub log_index: u64,
    pub block_number: u64,
    pub block_hash: String,
    pub kind: EventKind,
}

impl ChainEvent {
    /// Stable identity of the event across re-observation
    pub fn unique_id(&self) -> String {
        format!("{}-{}", self.tx_hash, self.log_index)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EventKind {
    /// Deposit of a native asset into the bridge
    Lock {
        asset: String,
        amount: String,
        sender: String,
        recipient: String,
        #[serde(default)]
        extra_data: String,
    },
    /// Burn of a mirrored asset on Nervos
    Burn {
        asset_chain: ChainKind,
        asset: String,
        amount: String,
        sender: String,
        recipient: String,
    },
    /// Mint or unlock executed for an earlier source event
    Settlement {
        source_id: String,
        asset_chain: ChainKind,
        asset: String,
        amount: String,
        recipient: String,
    },
    #[serde(other)]
    Other,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Lock { .. } => "lock",
            EventKind::Burn { .. } => "burn",
            EventKind::Settlement { .. } => "settlement",
            EventKind::Other => "other",
        }
    }
}

/// Chain-specific serialized transaction ready for broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedTx {
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Committed,
    Failed(String),
    Unknown,
}

/// RPC facade of one watched chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain(&self) -> ChainKind;

    async fn tip_height(&self) -> RelayerResult<u64>;

    async fn get_block(&self, height: u64) -> RelayerResult<Option<BlockHeader>>;

    /// Bridge events in the inclusive block range
    async fn get_events(&self, from: u64, to: u64) -> RelayerResult<Vec<ChainEvent>>;

    async fn broadcast(&self, tx: &SignedTx) -> RelayerResult<String>;

    async fn get_status(&self, tx_hash: &str) -> RelayerResult<TxStatus>;
}

/// Clients and transaction builders of every enabled chain
pub struct ChainManager {
    clients: DashMap<ChainKind, Arc<dyn ChainClient>>,
    builders: DashMap<ChainKind, Arc<dyn TxBuilder>>,
}

impl ChainManager {
    pub async fn new(settings: &Settings) -> RelayerResult<Self> {
        let clients: DashMap<ChainKind, Arc<dyn ChainClient>> = DashMap::new();
        let builders: DashMap<ChainKind, Arc<dyn TxBuilder>> = DashMap::new();
        let timeout = Duration::from_secs(30);

        for (name, chain_config) in settings.enabled_chains() {
            info!(chain = %chain_config.kind, "Initializing chain {}", name);

            match chain_config.client {
                ClientKind::Evm => {
                    let client = EvmClient::new(chain_config)?;
                    clients.insert(chain_config.kind, Arc::new(client));

                    match &chain_config.builder_url {
                        Some(url) => {
                            let builder = GatewayClient::new(chain_config.kind, url, timeout)?;
                            builders.insert(chain_config.kind, Arc::new(builder));
                        }
                        None => warn!(
                            chain = %chain_config.kind,
                            "No builder_url configured, actions to this chain cannot execute"
                        ),
                    }
                }
                ClientKind::Gateway => {
                    let client = Arc::new(GatewayClient::from_config(chain_config, timeout)?);
                    clients.insert(chain_config.kind, client.clone());
                    builders.insert(chain_config.kind, client);
                }
            }
        }

        Ok(Self { clients, builders })
    }

    pub fn from_parts(
        clients: Vec<Arc<dyn ChainClient>>,
        builders: Vec<(ChainKind, Arc<dyn TxBuilder>)>,
    ) -> Self {
        Self {
            clients: clients.into_iter().map(|c| (c.chain(), c)).collect(),
            builders: builders.into_iter().collect(),
        }
    }

    pub fn client(&self, chain: ChainKind) -> RelayerResult<Arc<dyn ChainClient>> {
        self.clients
            .get(&chain)
            .map(|c| c.clone())
            .ok_or_else(|| RelayerError::Config(format!("chain {} is not configured", chain)))
    }

    pub fn builder(&self, chain: ChainKind) -> RelayerResult<Arc<dyn TxBuilder>> {
        self.builders
            .get(&chain)
            .map(|b| b.clone())
            .ok_or_else(|| RelayerError::Config(format!("no tx builder for {}", chain)))
    }

    pub fn chains(&self) -> Vec<ChainKind> {
        let mut chains: Vec<_> = self.clients.iter().map(|e| *e.key()).collect();
        chains.sort();
        chains
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(ChainKind, bool)> {
        let mut results = Vec::new();

        for chain in self.chains() {
            let healthy = match self.client(chain) {
                Ok(client) => match client.tip_height().await {
                    Ok(_) => true,
                    Err(e) => {
                        warn!(chain = %chain, error = %e, "Health check failed");
                        false
                    }
                },
                Err(_) => false,
            };
            crate::metrics::record_chain_health(chain, healthy);
            results.push((chain, healthy));
        }

        results
    }
}
