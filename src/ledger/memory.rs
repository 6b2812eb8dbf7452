//! In-memory ledger backend for development networks and tests

use super::*;

use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    seq: u64,
    source_events: HashMap<String, SourceEvent>,
    dest_actions: HashMap<String, (u64, DestAction)>,
    kv: HashMap<String, String>,
}

/// Ledger kept in process memory
#[derive(Default)]
pub struct MemoryLedger {
    inner: RwLock<Inner>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransferLedger for MemoryLedger {
    async fn upsert_source_event(&self, event: &SourceEvent) -> RelayerResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.source_events.get_mut(&event.unique_id) {
            Some(existing) => {
                existing.confirm_number = existing.confirm_number.max(event.confirm_number);
                Ok(false)
            }
            None => {
                inner
                    .source_events
                    .insert(event.unique_id.clone(), event.clone());
                Ok(true)
            }
        }
    }

    async fn source_events(&self, ids: &[String]) -> RelayerResult<Vec<SourceEvent>> {
        let inner = self.inner.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| inner.source_events.get(id).cloned())
            .collect())
    }

    async fn unconfirmed_events(&self, chain: ChainKind) -> RelayerResult<Vec<SourceEvent>> {
        let inner = self.inner.read().await;
        let mut events: Vec<_> = inner
            .source_events
            .values()
            .filter(|e| e.source_chain == chain && e.confirm_status == ConfirmStatus::Unconfirmed)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.block_number);
        Ok(events)
    }

    async fn update_confirm_number(&self, id: &str, confirm_number: u64) -> RelayerResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(event) = inner.source_events.get_mut(id) {
            event.confirm_number = event.confirm_number.max(confirm_number);
        }
        Ok(())
    }

    async fn mark_confirmed(&self, ids: &[String]) -> RelayerResult<()> {
        let mut inner = self.inner.write().await;
        for id in ids {
            if let Some(event) = inner.source_events.get_mut(id) {
                event.confirm_status = ConfirmStatus::Confirmed;
            }
        }
        Ok(())
    }

    async fn create_dest_actions(&self, actions: &[DestAction]) -> RelayerResult<u64> {
        let mut inner = self.inner.write().await;
        let mut created = 0;
        for action in actions {
            if inner.dest_actions.contains_key(&action.id) {
                continue;
            }
            inner.seq += 1;
            let seq = inner.seq;
            inner
                .dest_actions
                .insert(action.id.clone(), (seq, action.clone()));
            created += 1;
        }
        Ok(created)
    }

    async fn record_settlement(&self, settlement: &Settlement) -> RelayerResult<()> {
        let mut inner = self.inner.write().await;
        match inner.dest_actions.get_mut(&settlement.source_id) {
            Some((_, action)) => {
                if action.status != ActionStatus::Success {
                    action.status = ActionStatus::Success;
                    action.exec_tx_hash = Some(settlement.tx_hash.clone());
                    action.message = None;
                }
                action.block_number = Some(settlement.block_number);
                action.updated_at = Utc::now();
            }
            None => {
                inner.seq += 1;
                let seq = inner.seq;
                inner
                    .dest_actions
                    .insert(settlement.source_id.clone(), (seq, settlement.to_dest_action()));
            }
        }
        Ok(())
    }

    async fn list_dest_actions(
        &self,
        dest_chain: Option<ChainKind>,
        status: ActionStatus,
        limit: usize,
    ) -> RelayerResult<Vec<DestAction>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<_> = inner
            .dest_actions
            .values()
            .filter(|(_, a)| a.status == status && dest_chain.map_or(true, |c| a.dest_chain == c))
            .collect();
        rows.sort_by_key(|(seq, _)| *seq);
        Ok(rows
            .into_iter()
            .take(limit)
            .map(|(_, a)| a.clone())
            .collect())
    }

    async fn dest_actions(&self, ids: &[String]) -> RelayerResult<Vec<DestAction>> {
        let inner = self.inner.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| inner.dest_actions.get(id).map(|(_, a)| a.clone()))
            .collect())
    }

    async fn mark_pending(&self, ids: &[String]) -> RelayerResult<()> {
        let mut inner = self.inner.write().await;
        for id in ids {
            if let Some((_, action)) = inner.dest_actions.get_mut(id) {
                if matches!(action.status, ActionStatus::Todo | ActionStatus::Error) {
                    action.status = ActionStatus::Pending;
                    action.updated_at = Utc::now();
                }
            }
        }
        Ok(())
    }

    async fn mark_success(&self, id: &str, exec_tx_hash: &str) -> RelayerResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.dest_actions.get_mut(id) {
            Some((_, action)) if action.status != ActionStatus::Success => {
                action.status = ActionStatus::Success;
                action.exec_tx_hash = Some(exec_tx_hash.to_string());
                action.message = None;
                action.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_error(&self, id: &str, message: &str) -> RelayerResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.dest_actions.get_mut(id) {
            Some((_, action)) if action.status != ActionStatus::Success => {
                action.status = ActionStatus::Error;
                action.message = Some(message.to_string());
                action.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn rollback(
        &self,
        chain: ChainKind,
        after_height: u64,
        scope: RollbackScope,
    ) -> RelayerResult<RollbackReport> {
        let mut inner = self.inner.write().await;
        let mut report = RollbackReport::default();

        let before = inner.source_events.len();
        inner
            .source_events
            .retain(|_, e| !(e.source_chain == chain && e.block_number > after_height));
        report.source_events = (before - inner.source_events.len()) as u64;

        if scope == RollbackScope::SourceEventsAndActions {
            let before = inner.dest_actions.len();
            inner.dest_actions.retain(|_, (_, a)| {
                !(a.dest_chain == chain && a.block_number.map_or(false, |b| b > after_height))
            });
            report.dest_actions = (before - inner.dest_actions.len()) as u64;
        }

        Ok(report)
    }

    async fn cursor(&self, chain: ChainKind) -> RelayerResult<Option<ChainCursor>> {
        let inner = self.inner.read().await;
        inner
            .kv
            .get(&chain.cursor_key())
            .map(|v| ChainCursor::decode(v))
            .transpose()
    }

    async fn save_cursor(&self, chain: ChainKind, cursor: &ChainCursor) -> RelayerResult<()> {
        let mut inner = self.inner.write().await;
        inner.kv.insert(chain.cursor_key(), cursor.encode());
        Ok(())
    }

    async fn stats(&self) -> RelayerResult<LedgerStats> {
        let inner = self.inner.read().await;
        let mut stats = LedgerStats::default();
        for event in inner.source_events.values() {
            match event.confirm_status {
                ConfirmStatus::Unconfirmed => stats.unconfirmed += 1,
                ConfirmStatus::Confirmed => stats.confirmed += 1,
            }
        }
        for (_, action) in inner.dest_actions.values() {
            match action.status {
                ActionStatus::Todo => stats.todo += 1,
                ActionStatus::Pending => stats.pending += 1,
                ActionStatus::Success => stats.success += 1,
                ActionStatus::Error => stats.error += 1,
            }
        }
        Ok(stats)
    }

    async fn health_check(&self) -> RelayerResult<()> {
        Ok(())
    }
}
