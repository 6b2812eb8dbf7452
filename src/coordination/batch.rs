//! When queued destination actions are worth a transaction

use crate::config::{CollectorConfig, Network};
use crate::ledger::DestAction;

use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BatchPolicy {
    batch_number: usize,
    max_wait: Duration,
    network: Network,
}

impl BatchPolicy {
    pub fn new(batch_number: usize, max_wait: Duration, network: Network) -> Self {
        Self {
            batch_number: batch_number.max(1),
            max_wait,
            network,
        }
    }

    pub fn from_config(config: &CollectorConfig, network: Network) -> Self {
        Self::new(
            config.batch_number,
            Duration::from_secs(config.max_wait_secs),
            network,
        )
    }

    /// Largest batch put into one transaction
    pub fn limit(&self) -> usize {
        self.batch_number
    }

    /// A full batch, or the oldest action waited long enough. Testnets never wait.
    pub fn ready(&self, queued: &[DestAction], now: DateTime<Utc>) -> bool {
        let Some(oldest) = queued.iter().map(|a| a.created_at).min() else {
            return false;
        };
        if self.network == Network::Testnet || queued.len() >= self.batch_number {
            return true;
        }
        let waited = now.signed_duration_since(oldest).to_std().unwrap_or_default();
        waited >= self.max_wait
    }
}
