//! Confirmation depth tracking
//!
//! Chains differ in how deep an event must be buried before it is safe to act on:
//! - Ethereum: probabilistic, a dozen or more blocks
//! - Nervos: probabilistic, longer uncle-heavy tail
//! - EOS / Tron: irreversible-block based, effectively instant once reported
//! - Bitcoin / Cardano: probabilistic, few but slow blocks

use crate::asset::ChainKind;
use crate::ledger::SourceEvent;

/// Blocks on top of `block_number` at the given tip
pub fn confirm_number(tip: u64, block_number: u64) -> u64 {
    tip.saturating_sub(block_number)
}

/// Height whose records survive a fork detected at `fork_height`
pub fn confirmed_height(fork_height: u64, threshold: u64) -> u64 {
    fork_height.saturating_sub(threshold)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationUpdate {
    pub unique_id: String,
    pub confirm_number: u64,
    /// Reached the threshold during this evaluation
    pub newly_confirmed: bool,
}

/// Recompute confirmation depth of unconfirmed events. A lagging tip never
/// lowers a previously recorded depth.
pub fn evaluate(events: &[SourceEvent], tip: u64, threshold: u64) -> Vec<ConfirmationUpdate> {
    events
        .iter()
        .map(|event| {
            let depth = confirm_number(tip, event.block_number).max(event.confirm_number);
            ConfirmationUpdate {
                unique_id: event.unique_id.clone(),
                confirm_number: depth,
                newly_confirmed: depth >= threshold,
            }
        })
        .collect()
}

/// Get recommended confirmation blocks for a chain
pub fn recommended_confirmations(chain: ChainKind) -> u64 {
    match chain {
        ChainKind::Ethereum => 12,
        ChainKind::Nervos => 15,
        ChainKind::Bitcoin => 6,
        ChainKind::Cardano => 10,
        // irreversible blocks only
        ChainKind::Eos | ChainKind::Tron => 0,
    }
}
