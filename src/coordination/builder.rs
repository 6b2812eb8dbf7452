//! Destination transaction building
//!
//! Chain-specific transaction layout lives behind `TxBuilder`; the relayer
//! only sees a digest to sign and an opaque skeleton to assemble later.

use crate::asset::Asset;
use crate::chain::SignedTx;
use crate::error::RelayerResult;
use crate::multisig::{SigPayload, TransferItem};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TxKind {
    Mint,
    BridgeAssetCreate,
    Unlock,
}

/// Asset to register on Nervos together with its bridge lock arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBridgeAsset {
    pub asset: Asset,
    pub bridge_args: String,
}

impl NewBridgeAsset {
    pub fn new(asset: Asset, owner_lock_hash: &str) -> RelayerResult<Self> {
        let bridge_args = asset.bridge_args(owner_lock_hash)?;
        Ok(Self { asset, bridge_args })
    }
}

/// Kind of transaction together with its batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "items", rename_all = "kebab-case")]
pub enum BuildRequest {
    Mint(Vec<TransferItem>),
    BridgeAssetCreate(Vec<NewBridgeAsset>),
    Unlock(Vec<TransferItem>),
}

impl BuildRequest {
    pub fn kind(&self) -> TxKind {
        match self {
            BuildRequest::Mint(_) => TxKind::Mint,
            BuildRequest::BridgeAssetCreate(_) => TxKind::BridgeAssetCreate,
            BuildRequest::Unlock(_) => TxKind::Unlock,
        }
    }

    /// Signing payload for the built transaction
    pub fn into_payload(self, skeleton: serde_json::Value) -> SigPayload {
        match self {
            BuildRequest::Mint(items) => SigPayload::Mint { items, skeleton },
            BuildRequest::BridgeAssetCreate(assets) => SigPayload::CreateAsset {
                assets: assets.into_iter().map(|a| a.asset).collect(),
                skeleton,
            },
            BuildRequest::Unlock(items) => SigPayload::Unlock { items, skeleton },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuiltTx {
    /// 0x-prefixed digest the signers sign
    pub raw_digest: String,
    pub skeleton: serde_json::Value,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TxBuilder: Send + Sync {
    async fn build(&self, request: &BuildRequest) -> RelayerResult<BuiltTx>;

    /// Recompute the digest of a payload's skeleton; fails when the skeleton
    /// does not carry exactly the payload's transfers or assets
    async fn digest(&self, payload: &SigPayload) -> RelayerResult<String>;

    /// Combine the skeleton with collected signatures into a broadcastable tx
    async fn assemble(
        &self,
        skeleton: &serde_json::Value,
        signatures: &[String],
    ) -> RelayerResult<SignedTx>;

    /// Assets that have no bridge registration on the destination yet
    async fn unregistered_assets(&self, assets: &[Asset]) -> RelayerResult<Vec<Asset>>;
}
