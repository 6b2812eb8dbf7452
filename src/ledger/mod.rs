//! Transfer ledger
//!
//! Durable record of observed source events and the destination actions they
//! owe. Every mutation is idempotent per row so that a partially applied batch
//! can simply be issued again.

mod memory;
mod postgres;

pub use memory::MemoryLedger;
pub use postgres::PostgresLedger;

use crate::asset::{Asset, ChainKind};
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Whether a source event deposits into or redeems out of Nervos
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    /// lock on an external chain, owed a mint on Nervos
    Lock,
    /// burn on Nervos, owed an unlock on the asset's chain
    Burn,
}

impl TransferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferKind::Lock => "lock",
            TransferKind::Burn => "burn",
        }
    }
}

impl FromStr for TransferKind {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lock" => Ok(TransferKind::Lock),
            "burn" => Ok(TransferKind::Burn),
            other => Err(RelayerError::Internal(format!("unknown transfer kind {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmStatus {
    Unconfirmed,
    Confirmed,
}

impl ConfirmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmStatus::Unconfirmed => "unconfirmed",
            ConfirmStatus::Confirmed => "confirmed",
        }
    }
}

impl FromStr for ConfirmStatus {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unconfirmed" => Ok(ConfirmStatus::Unconfirmed),
            "confirmed" => Ok(ConfirmStatus::Confirmed),
            other => Err(RelayerError::Internal(format!("unknown confirm status {}", other))),
        }
    }
}

/// A lock or burn observed on its source chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEvent {
    /// source tx hash and log index
    pub unique_id: String,
    pub source_chain: ChainKind,
    pub kind: TransferKind,
    pub asset: Asset,
    pub amount: u128,
    pub sender: String,
    pub recipient: String,
    pub block_number: u64,
    pub block_hash: String,
    pub confirm_number: u64,
    pub confirm_status: ConfirmStatus,
    pub bridge_fee: u128,
    pub created_at: DateTime<Utc>,
}

impl SourceEvent {
    /// Chain on which the owed action executes
    pub fn dest_chain(&self) -> ChainKind {
        match self.kind {
            TransferKind::Lock => ChainKind::Nervos,
            TransferKind::Burn => self.asset.chain(),
        }
    }

    /// Amount credited on the destination
    pub fn dest_amount(&self) -> u128 {
        self.amount.saturating_sub(self.bridge_fee)
    }

    /// The destination action this event owes, ready to execute
    pub fn to_dest_action(&self) -> DestAction {
        let now = Utc::now();
        DestAction {
            id: self.unique_id.clone(),
            source_chain: self.source_chain,
            dest_chain: self.dest_chain(),
            kind: self.kind,
            asset: self.asset.clone(),
            amount: self.dest_amount(),
            recipient: self.recipient.clone(),
            status: ActionStatus::Todo,
            message: None,
            exec_tx_hash: None,
            block_number: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Todo,
    Pending,
    Success,
    Error,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Todo => "todo",
            ActionStatus::Pending => "pending",
            ActionStatus::Success => "success",
            ActionStatus::Error => "error",
        }
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionStatus {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(ActionStatus::Todo),
            "pending" => Ok(ActionStatus::Pending),
            "success" => Ok(ActionStatus::Success),
            "error" => Ok(ActionStatus::Error),
            other => Err(RelayerError::Internal(format!("unknown action status {}", other))),
        }
    }
}

/// A mint or unlock owed for a confirmed source event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestAction {
    /// equals the source event's unique id
    pub id: String,
    pub source_chain: ChainKind,
    pub dest_chain: ChainKind,
    pub kind: TransferKind,
    pub asset: Asset,
    pub amount: u128,
    pub recipient: String,
    pub status: ActionStatus,
    pub message: Option<String>,
    pub exec_tx_hash: Option<String>,
    /// Destination block the settlement was observed in
    pub block_number: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A mint or unlock observed on the destination chain
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub source_id: String,
    pub source_chain: ChainKind,
    pub dest_chain: ChainKind,
    pub kind: TransferKind,
    pub asset: Asset,
    pub amount: u128,
    pub recipient: String,
    pub tx_hash: String,
    pub block_number: u64,
}

impl Settlement {
    pub fn to_dest_action(&self) -> DestAction {
        let now = Utc::now();
        DestAction {
            id: self.source_id.clone(),
            source_chain: self.source_chain,
            dest_chain: self.dest_chain,
            kind: self.kind,
            asset: self.asset.clone(),
            amount: self.amount,
            recipient: self.recipient.clone(),
            status: ActionStatus::Success,
            message: None,
            exec_tx_hash: Some(self.tx_hash.clone()),
            block_number: Some(self.block_number),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Last block a chain observer fully handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainCursor {
    pub height: u64,
    pub hash: String,
}

impl ChainCursor {
    pub fn new(height: u64, hash: impl Into<String>) -> Self {
        Self {
            height,
            hash: hash.into(),
        }
    }

    /// `<height>,<hash>`
    pub fn encode(&self) -> String {
        format!("{},{}", self.height, self.hash)
    }

    pub fn decode(value: &str) -> RelayerResult<Self> {
        let (height, hash) = value
            .split_once(',')
            .ok_or_else(|| RelayerError::Internal(format!("malformed cursor {:?}", value)))?;
        let height = height
            .parse()
            .map_err(|_| RelayerError::Internal(format!("malformed cursor height {:?}", value)))?;
        Ok(Self::new(height, hash))
    }
}

/// Which tables a rollback may touch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackScope {
    SourceEventsOnly,
    SourceEventsAndActions,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollbackReport {
    pub source_events: u64,
    pub dest_actions: u64,
}

/// Row counts served by the status endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub unconfirmed: u64,
    pub confirmed: u64,
    pub todo: u64,
    pub pending: u64,
    pub success: u64,
    pub error: u64,
}

#[async_trait]
pub trait TransferLedger: Send + Sync {
    /// Insert the event, or only raise its confirm number if it exists.
    /// Returns true when a new row was created.
    async fn upsert_source_event(&self, event: &SourceEvent) -> RelayerResult<bool>;

    async fn source_events(&self, ids: &[String]) -> RelayerResult<Vec<SourceEvent>>;

    async fn unconfirmed_events(&self, chain: ChainKind) -> RelayerResult<Vec<SourceEvent>>;

    /// Never lowers an existing confirm number
    async fn update_confirm_number(&self, id: &str, confirm_number: u64) -> RelayerResult<()>;

    async fn mark_confirmed(&self, ids: &[String]) -> RelayerResult<()>;

    /// Insert actions whose id is not present yet; returns how many were new
    async fn create_dest_actions(&self, actions: &[DestAction]) -> RelayerResult<u64>;

    /// Record an observed settlement as a successful action
    async fn record_settlement(&self, settlement: &Settlement) -> RelayerResult<()>;

    /// Oldest first
    async fn list_dest_actions(
        &self,
        dest_chain: Option<ChainKind>,
        status: ActionStatus,
        limit: usize,
    ) -> RelayerResult<Vec<DestAction>>;

    async fn dest_actions(&self, ids: &[String]) -> RelayerResult<Vec<DestAction>>;

    /// todo/error -> pending
    async fn mark_pending(&self, ids: &[String]) -> RelayerResult<()>;

    /// Returns false when the row is missing or already succeeded
    async fn mark_success(&self, id: &str, exec_tx_hash: &str) -> RelayerResult<bool>;

    /// Returns false when the row is missing or already succeeded
    async fn mark_error(&self, id: &str, message: &str) -> RelayerResult<bool>;

    /// Delete rows above `after_height` that belong to `chain`
    async fn rollback(
        &self,
        chain: ChainKind,
        after_height: u64,
        scope: RollbackScope,
    ) -> RelayerResult<RollbackReport>;

    async fn cursor(&self, chain: ChainKind) -> RelayerResult<Option<ChainCursor>>;

    async fn save_cursor(&self, chain: ChainKind, cursor: &ChainCursor) -> RelayerResult<()>;

    async fn stats(&self) -> RelayerResult<LedgerStats>;

    async fn health_check(&self) -> RelayerResult<()>;
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_cursor_encoding() {
        let cursor = ChainCursor::new(100, "0xabc");
        assert_eq!(cursor.encode(), "100,0xabc");
        assert_eq!(ChainCursor::decode("100,0xabc").unwrap(), cursor);
        assert_eq!(ChainCursor::decode("7,").unwrap(), ChainCursor::new(7, ""));
        assert!(ChainCursor::decode("garbage").is_err());
    }

    #[test]
    fn test_dest_action_from_lock() {
        let action = lock_event("0xaa-0", 100).to_dest_action();
        assert_eq!(action.id, "0xaa-0");
        assert_eq!(action.dest_chain, ChainKind::Nervos);
        assert_eq!(action.amount, 990);
        assert_eq!(action.status, ActionStatus::Todo);
    }

    #[test]
    fn test_burn_targets_asset_chain() {
        let mut event = lock_event("0xbb-1", 5);
        event.source_chain = ChainKind::Nervos;
        event.kind = TransferKind::Burn;
        event.asset = Asset::Tron("trx".into());
        assert_eq!(event.dest_chain(), ChainKind::Tron);

        event.bridge_fee = 5_000;
        assert_eq!(event.dest_amount(), 0);
    }
}
