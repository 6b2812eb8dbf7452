//! Event classification
//!
//! Turns raw bridge events into ledger records. Events that fail validation
//! or policy are rejected permanently; they are never stored or retried.

use crate::asset::{parse_amount, Asset, AssetWhitelist, ChainKind, Direction};
use crate::chain::{ChainEvent, EventKind};
use crate::ledger::{ConfirmStatus, Settlement, SourceEvent, TransferKind};

use chrono::Utc;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Source(SourceEvent),
    Settlement(Settlement),
    Rejected(RejectReason),
    Irrelevant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    MalformedAmount(String),
    InvalidAsset(String),
    NotWhitelisted(Asset),
    BelowMinimum { amount: u128, minimal: u128 },
    InvalidRecipient(String),
    /// e.g. a lock reported by the Nervos observer
    WrongChain(&'static str),
}

impl RejectReason {
    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            RejectReason::MalformedAmount(_) => "malformed_amount",
            RejectReason::InvalidAsset(_) => "invalid_asset",
            RejectReason::NotWhitelisted(_) => "not_whitelisted",
            RejectReason::BelowMinimum { .. } => "below_minimum",
            RejectReason::InvalidRecipient(_) => "invalid_recipient",
            RejectReason::WrongChain(_) => "wrong_chain",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::MalformedAmount(raw) => write!(f, "malformed amount {:?}", raw),
            RejectReason::InvalidAsset(e) => write!(f, "invalid asset: {}", e),
            RejectReason::NotWhitelisted(asset) => write!(f, "asset {} not whitelisted", asset),
            RejectReason::BelowMinimum { amount, minimal } => {
                write!(f, "amount {} below minimum {}", amount, minimal)
            }
            RejectReason::InvalidRecipient(why) => write!(f, "invalid recipient: {}", why),
            RejectReason::WrongChain(kind) => write!(f, "{} event on unexpected chain", kind),
        }
    }
}

/// Classifier bound to one observed chain
pub struct EventClassifier {
    chain: ChainKind,
    whitelist: Arc<AssetWhitelist>,
    max_recipient_len: usize,
}

impl EventClassifier {
    pub fn new(chain: ChainKind, whitelist: Arc<AssetWhitelist>, max_recipient_len: usize) -> Self {
        Self {
            chain,
            whitelist,
            max_recipient_len,
        }
    }

    pub fn classify(&self, event: &ChainEvent) -> Classified {
        let outcome = match &event.kind {
            EventKind::Lock {
                asset,
                amount,
                sender,
                recipient,
                ..
            } => {
                if self.chain.is_nervos() {
                    return Classified::Rejected(RejectReason::WrongChain("lock"));
                }
                self.source(event, TransferKind::Lock, self.chain, asset, amount, sender, recipient)
            }
            EventKind::Burn {
                asset_chain,
                asset,
                amount,
                sender,
                recipient,
            } => {
                if !self.chain.is_nervos() {
                    return Classified::Rejected(RejectReason::WrongChain("burn"));
                }
                self.source(event, TransferKind::Burn, *asset_chain, asset, amount, sender, recipient)
            }
            EventKind::Settlement {
                source_id,
                asset_chain,
                asset,
                amount,
                recipient,
            } => self.settlement(event, source_id, *asset_chain, asset, amount, recipient),
            EventKind::Other => return Classified::Irrelevant,
        };

        outcome.unwrap_or_else(Classified::Rejected)
    }

    #[allow(clippy::too_many_arguments)]
    fn source(
        &self,
        event: &ChainEvent,
        kind: TransferKind,
        asset_chain: ChainKind,
        asset: &str,
        amount: &str,
        sender: &str,
        recipient: &str,
    ) -> Result<Classified, RejectReason> {
        let asset = Asset::for_chain(asset_chain, asset)
            .map_err(|e| RejectReason::InvalidAsset(e.to_string()))?;
        let amount =
            parse_amount(amount).ok_or_else(|| RejectReason::MalformedAmount(amount.to_string()))?;

        if !self.whitelist.is_whitelisted(&asset) {
            return Err(RejectReason::NotWhitelisted(asset));
        }

        let minimal = asset.minimal_amount(&self.whitelist);
        if amount < minimal {
            return Err(RejectReason::BelowMinimum { amount, minimal });
        }

        self.check_recipient(recipient)?;

        let direction = match kind {
            TransferKind::Lock => Direction::In,
            TransferKind::Burn => Direction::Out,
        };

        Ok(Classified::Source(SourceEvent {
            unique_id: event.unique_id(),
            source_chain: self.chain,
            kind,
            bridge_fee: asset.bridge_fee(direction, &self.whitelist),
            asset,
            amount,
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            block_number: event.block_number,
            block_hash: event.block_hash.clone(),
            confirm_number: 0,
            confirm_status: ConfirmStatus::Unconfirmed,
            created_at: Utc::now(),
        }))
    }

    fn settlement(
        &self,
        event: &ChainEvent,
        source_id: &str,
        asset_chain: ChainKind,
        asset: &str,
        amount: &str,
        recipient: &str,
    ) -> Result<Classified, RejectReason> {
        let asset = Asset::for_chain(asset_chain, asset)
            .map_err(|e| RejectReason::InvalidAsset(e.to_string()))?;
        let amount =
            parse_amount(amount).ok_or_else(|| RejectReason::MalformedAmount(amount.to_string()))?;

        // a mint on Nervos settles a lock, an unlock elsewhere settles a burn
        let (source_chain, kind) = if self.chain.is_nervos() {
            (asset.chain(), TransferKind::Lock)
        } else {
            (ChainKind::Nervos, TransferKind::Burn)
        };

        Ok(Classified::Settlement(Settlement {
            source_id: source_id.to_string(),
            source_chain,
            dest_chain: self.chain,
            kind,
            asset,
            amount,
            recipient: recipient.to_string(),
            tx_hash: event.tx_hash.clone(),
            block_number: event.block_number,
        }))
    }

    fn check_recipient(&self, recipient: &str) -> Result<(), RejectReason> {
        if recipient.is_empty() {
            return Err(RejectReason::InvalidRecipient("empty".into()));
        }
        if recipient.len() > self.max_recipient_len {
            return Err(RejectReason::InvalidRecipient(format!(
                "{} bytes exceeds {}",
                recipient.len(),
                self.max_recipient_len
            )));
        }
        Ok(())
    }
}
