//! Process roles
//!
//! Watchers and verifiers only observe and record. Collectors additionally
//! turn confirmed events into destination actions and execute them.

use crate::error::RelayerResult;
use crate::ledger::{RollbackScope, Settlement, SourceEvent, TransferLedger};

use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Watcher,
    Verifier,
    Collector,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Watcher => "watcher",
            Role::Verifier => "verifier",
            Role::Collector => "collector",
        };
        f.write_str(name)
    }
}

/// Hooks a role performs while chains are observed
#[async_trait]
pub trait RoleStrategy: Send + Sync {
    fn role(&self) -> Role;

    /// Called once for the events that just reached the confirm threshold
    async fn on_confirmed(
        &self,
        _ledger: &dyn TransferLedger,
        _events: &[SourceEvent],
    ) -> RelayerResult<()> {
        Ok(())
    }

    /// Called for every mint/unlock observed on a destination chain
    async fn on_settlement(
        &self,
        ledger: &dyn TransferLedger,
        settlement: &Settlement,
    ) -> RelayerResult<()> {
        ledger.record_settlement(settlement).await
    }

    /// Tables a fork on an observed chain may delete from
    fn rollback_scope(&self) -> RollbackScope {
        RollbackScope::SourceEventsAndActions
    }

    fn executes_actions(&self) -> bool {
        false
    }

    fn serves_signatures(&self) -> bool {
        false
    }
}

pub struct Watcher;

#[async_trait]
impl RoleStrategy for Watcher {
    fn role(&self) -> Role {
        Role::Watcher
    }
}

pub struct Verifier;

#[async_trait]
impl RoleStrategy for Verifier {
    fn role(&self) -> Role {
        Role::Verifier
    }

    fn serves_signatures(&self) -> bool {
        true
    }
}

pub struct Collector;

#[async_trait]
impl RoleStrategy for Collector {
    fn role(&self) -> Role {
        Role::Collector
    }

    async fn on_confirmed(
        &self,
        ledger: &dyn TransferLedger,
        events: &[SourceEvent],
    ) -> RelayerResult<()> {
        let actions: Vec<_> = events.iter().map(SourceEvent::to_dest_action).collect();
        let created = ledger.create_dest_actions(&actions).await?;
        if created > 0 {
            info!(created, "Queued destination actions");
        }
        Ok(())
    }

    async fn on_settlement(
        &self,
        ledger: &dyn TransferLedger,
        settlement: &Settlement,
    ) -> RelayerResult<()> {
        if ledger
            .mark_success(&settlement.source_id, &settlement.tx_hash)
            .await?
        {
            debug!(unique_id = %settlement.source_id, "Settlement observed");
        } else if ledger
            .dest_actions(std::slice::from_ref(&settlement.source_id))
            .await?
            .is_empty()
        {
            warn!(
                unique_id = %settlement.source_id,
                tx_hash = %settlement.tx_hash,
                "Settlement for unknown action"
            );
        }
        Ok(())
    }

    // destination actions are collector-owned and survive source forks
    fn rollback_scope(&self) -> RollbackScope {
        RollbackScope::SourceEventsOnly
    }

    fn executes_actions(&self) -> bool {
        true
    }
}

pub fn strategy_for(role: Role) -> Arc<dyn RoleStrategy> {
    match role {
        Role::Watcher => Arc::new(Watcher),
        Role::Verifier => Arc::new(Verifier),
        Role::Collector => Arc::new(Collector),
    }
}
