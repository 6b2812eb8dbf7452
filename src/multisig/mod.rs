//! Threshold multisig
//!
//! The collector asks N independent signer services to authorize each
//! destination transaction and proceeds once M of them have signed.

pub mod auth;
pub mod client;
pub mod coordinator;

pub use auth::{CollectorAuth, SignerKey};
pub use client::{HttpSignerClient, SignResponse, SignerClient};
pub use coordinator::{CollectOutcome, MultisigCoordinator};

use crate::asset::{amount_str, Asset, ChainKind};
use crate::ledger::DestAction;
use crate::rpc::RpcError;

use serde::{Deserialize, Serialize};
use std::fmt;

/// One transfer inside a batch transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferItem {
    /// Unique id of the source event
    pub id: String,
    pub asset: Asset,
    #[serde(with = "amount_str")]
    pub amount: u128,
    pub recipient: String,
}

impl From<&DestAction> for TransferItem {
    fn from(action: &DestAction) -> Self {
        Self {
            id: action.id.clone(),
            asset: action.asset.clone(),
            amount: action.amount,
            recipient: action.recipient.clone(),
        }
    }
}

/// What a signing session asks signers to authorize
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "sigType", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SigPayload {
    Mint {
        items: Vec<TransferItem>,
        skeleton: serde_json::Value,
    },
    CreateAsset {
        assets: Vec<Asset>,
        skeleton: serde_json::Value,
    },
    Unlock {
        items: Vec<TransferItem>,
        skeleton: serde_json::Value,
    },
}

impl SigPayload {
    pub fn name(&self) -> &'static str {
        match self {
            SigPayload::Mint { .. } => "mint",
            SigPayload::CreateAsset { .. } => "create_asset",
            SigPayload::Unlock { .. } => "unlock",
        }
    }

    pub fn items(&self) -> &[TransferItem] {
        match self {
            SigPayload::Mint { items, .. } | SigPayload::Unlock { items, .. } => items,
            SigPayload::CreateAsset { .. } => &[],
        }
    }

    pub fn skeleton(&self) -> &serde_json::Value {
        match self {
            SigPayload::Mint { skeleton, .. }
            | SigPayload::CreateAsset { skeleton, .. }
            | SigPayload::Unlock { skeleton, .. } => skeleton,
        }
    }
}

/// A request for signatures over one destination transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningSession {
    /// Chain the transaction executes on
    pub chain: ChainKind,
    /// 0x-prefixed 32 byte digest to sign
    pub raw_data: String,
    pub payload: SigPayload,
    /// Collector signature over the session with this field blank
    #[serde(default)]
    pub collector_sig: String,
}

/// Wire error codes of the signer RPC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SigErrorCode {
    InvalidParams,
    InvalidRecord,
    DuplicateSign,
    TxNotFound,
    TxUnconfirmed,
    BlockSyncIncomplete,
    TxCompleted,
    UnknownError,
}

impl SigErrorCode {
    pub fn code(&self) -> i64 {
        match self {
            SigErrorCode::InvalidParams => 1000,
            SigErrorCode::InvalidRecord => 1001,
            SigErrorCode::DuplicateSign => 1002,
            SigErrorCode::TxNotFound => 1003,
            SigErrorCode::TxUnconfirmed => 1004,
            SigErrorCode::BlockSyncIncomplete => 1005,
            SigErrorCode::TxCompleted => 1006,
            SigErrorCode::UnknownError => 9999,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            1000 => SigErrorCode::InvalidParams,
            1001 => SigErrorCode::InvalidRecord,
            1002 => SigErrorCode::DuplicateSign,
            1003 => SigErrorCode::TxNotFound,
            1004 => SigErrorCode::TxUnconfirmed,
            1005 => SigErrorCode::BlockSyncIncomplete,
            1006 => SigErrorCode::TxCompleted,
            _ => SigErrorCode::UnknownError,
        }
    }

    /// The signer may answer differently once it catches up
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SigErrorCode::TxNotFound
                | SigErrorCode::TxUnconfirmed
                | SigErrorCode::BlockSyncIncomplete
                | SigErrorCode::UnknownError
        )
    }
}

/// Error answer of a signer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerError {
    pub code: SigErrorCode,
    pub message: String,
}

impl SignerError {
    pub fn new(code: SigErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for SignerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code.code())
    }
}

impl From<RpcError> for SignerError {
    fn from(e: RpcError) -> Self {
        Self::new(SigErrorCode::from_code(e.code), e.message)
    }
}

impl From<SignerError> for RpcError {
    fn from(e: SignerError) -> Self {
        RpcError {
            code: e.code.code(),
            message: e.message,
        }
    }
}
