//! EVM chain client with multi-RPC support and automatic failover

use crate::asset::ChainKind;
use crate::config::ChainConfig;
use crate::error::{RelayerError, RelayerResult};

use super::{BlockHeader, ChainClient, ChainEvent, EventKind, SignedTx, TxStatus};

use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use lazy_static::lazy_static;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

lazy_static! {
    static ref LOCKED_TOPIC: H256 =
        H256::from(ethers::utils::keccak256("Locked(address,address,uint256,bytes,bytes)"));
    static ref UNLOCKED_TOPIC: H256 =
        H256::from(ethers::utils::keccak256("Unlocked(address,address,address,uint256,bytes)"));
}

/// Bridge contract client with failover across HTTP endpoints
pub struct EvmClient {
    chain: ChainKind,
    contract: Address,
    http_providers: Vec<Provider<Http>>,
    current_provider: AtomicUsize,
}

impl EvmClient {
    pub fn new(config: &ChainConfig) -> RelayerResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    http_providers.push(provider.interval(Duration::from_millis(100)));
                    debug!(chain = %config.kind, "Added HTTP provider {}", url);
                }
                Err(e) => warn!("Failed to create provider for {}: {}", url, e),
            }
        }

        if http_providers.is_empty() {
            return Err(RelayerError::chain_rpc(config.kind, "No valid RPC providers"));
        }

        let contract = Address::from_str(&config.contract_address)
            .map_err(|e| RelayerError::Config(format!("Invalid contract address: {}", e)))?;

        Ok(Self {
            chain: config.kind,
            contract,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!(chain = %self.chain, "Failover to provider {}", next);
    }

    fn rpc_error(&self, e: impl ToString) -> RelayerError {
        RelayerError::chain_rpc(self.chain, e)
    }
}

#[async_trait]
impl ChainClient for EvmClient {
    fn chain(&self) -> ChainKind {
        self.chain
    }

    async fn tip_height(&self) -> RelayerResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!(chain = %self.chain, "Failed to get block number: {}", e);
                    self.failover();
                }
            }
        }

        Err(self.rpc_error("All providers failed"))
    }

    async fn get_block(&self, height: u64) -> RelayerResult<Option<BlockHeader>> {
        let block = self
            .http()
            .get_block(height)
            .await
            .map_err(|e| self.rpc_error(e))?;

        Ok(block.and_then(|b| {
            Some(BlockHeader {
                number: b.number?.as_u64(),
                hash: format!("{:?}", b.hash?),
                parent_hash: format!("{:?}", b.parent_hash),
            })
        }))
    }

    async fn get_events(&self, from: u64, to: u64) -> RelayerResult<Vec<ChainEvent>> {
        let filter = Filter::new()
            .address(self.contract)
            .topic0(vec![*LOCKED_TOPIC, *UNLOCKED_TOPIC])
            .from_block(from)
            .to_block(to);

        for _ in 0..self.http_providers.len() {
            match self.http().get_logs(&filter).await {
                Ok(logs) => {
                    let mut events = Vec::with_capacity(logs.len());
                    for log in &logs {
                        match decode_log(log) {
                            Ok(event) => events.push(event),
                            Err(e) => warn!(chain = %self.chain, "Undecodable bridge log: {}", e),
                        }
                    }
                    return Ok(events);
                }
                Err(e) => {
                    warn!(chain = %self.chain, "Failed to get logs: {}", e);
                    self.failover();
                }
            }
        }

        Err(self.rpc_error("All providers failed to get logs"))
    }

    async fn broadcast(&self, tx: &SignedTx) -> RelayerResult<String> {
        let raw = tx
            .raw
            .as_str()
            .ok_or_else(|| RelayerError::TxBuild("EVM transaction must be a hex string".into()))?;
        let bytes: Bytes = raw
            .parse()
            .map_err(|e| RelayerError::TxBuild(format!("invalid raw transaction: {}", e)))?;

        let pending = self
            .http()
            .send_raw_transaction(bytes)
            .await
            .map_err(|e| self.rpc_error(e))?;

        Ok(format!("{:?}", pending.tx_hash()))
    }

    async fn get_status(&self, tx_hash: &str) -> RelayerResult<TxStatus> {
        let hash = H256::from_str(tx_hash)
            .map_err(|e| RelayerError::Internal(format!("invalid tx hash {}: {}", tx_hash, e)))?;

        let receipt = self
            .http()
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| self.rpc_error(e))?;

        Ok(match receipt {
            Some(r) if r.status == Some(1.into()) => TxStatus::Committed,
            Some(_) => TxStatus::Failed("transaction reverted".to_string()),
            None => match self.http().get_transaction(hash).await {
                Ok(Some(_)) => TxStatus::Pending,
                Ok(None) => TxStatus::Unknown,
                Err(e) => return Err(self.rpc_error(e)),
            },
        })
    }
}

fn topic_address(log: &Log, index: usize) -> RelayerResult<String> {
    let topic = log
        .topics
        .get(index)
        .ok_or_else(|| RelayerError::Internal(format!("missing topic {}", index)))?;
    Ok(format!("{:?}", Address::from_slice(&topic.0[12..32])))
}

/// Decode a `Locked` or `Unlocked` log of the bridge contract
pub(crate) fn decode_log(log: &Log) -> RelayerResult<ChainEvent> {
    let topic = log.topics.first().copied().unwrap_or_default();
    let decode_err = |e: abi::Error| RelayerError::Internal(format!("abi decode: {}", e));

    let kind = if topic == *LOCKED_TOPIC {
        let tokens = abi::decode(
            &[ParamType::Uint(256), ParamType::Bytes, ParamType::Bytes],
            &log.data,
        )
        .map_err(decode_err)?;
        match tokens.as_slice() {
            [Token::Uint(amount), Token::Bytes(recipient), Token::Bytes(extra)] => EventKind::Lock {
                asset: topic_address(log, 1)?,
                sender: topic_address(log, 2)?,
                amount: amount.to_string(),
                recipient: String::from_utf8_lossy(recipient).into_owned(),
                extra_data: format!("0x{}", hex::encode(extra)),
            },
            _ => return Err(RelayerError::Internal("unexpected Locked layout".into())),
        }
    } else if topic == *UNLOCKED_TOPIC {
        let tokens = abi::decode(&[ParamType::Uint(256), ParamType::Bytes], &log.data)
            .map_err(decode_err)?;
        match tokens.as_slice() {
            [Token::Uint(amount), Token::Bytes(source_id)] => EventKind::Settlement {
                source_id: String::from_utf8(source_id.clone())
                    .unwrap_or_else(|_| format!("0x{}", hex::encode(source_id))),
                asset_chain: ChainKind::Ethereum,
                asset: topic_address(log, 1)?,
                amount: amount.to_string(),
                recipient: topic_address(log, 2)?,
            },
            _ => return Err(RelayerError::Internal("unexpected Unlocked layout".into())),
        }
    } else {
        EventKind::Other
    };

    Ok(ChainEvent {
        tx_hash: format!("{:?}", log.transaction_hash.unwrap_or_default()),
        log_index: log.log_index.map(|i| i.as_u64()).unwrap_or_default(),
        block_number: log.block_number.map(|b| b.as_u64()).unwrap_or_default(),
        block_hash: format!("{:?}", log.block_hash.unwrap_or_default()),
        kind,
    })
}
