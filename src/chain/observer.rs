//! Per-chain block observer
//!
//! Each tick advances the persisted cursor by at most one batch of blocks,
//! records classified events, refreshes confirmation depth and repairs forks.
//! The cursor is saved last, so an interrupted tick is simply repeated.

use crate::asset::ChainKind;
use crate::error::{RelayerError, RelayerResult};
use crate::events::{Classified, EventClassifier};
use crate::ledger::{ChainCursor, SourceEvent, TransferLedger};
use crate::role::RoleStrategy;

use super::finality;
use super::{BlockHeader, ChainClient, ChainEvent};

use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// First run, cursor placed at `height`
    Initialized { height: u64 },
    /// No new block
    Idle,
    Advanced { to: u64 },
    /// Fork repaired, cursor rewound to `to`
    Rewound { to: u64 },
}

pub struct ChainObserver {
    chain: ChainKind,
    client: Arc<dyn ChainClient>,
    ledger: Arc<dyn TransferLedger>,
    strategy: Arc<dyn RoleStrategy>,
    classifier: EventClassifier,
    confirm_threshold: u64,
    batch_size: u64,
    start_block_height: u64,
}

impl ChainObserver {
    pub fn new(
        client: Arc<dyn ChainClient>,
        ledger: Arc<dyn TransferLedger>,
        strategy: Arc<dyn RoleStrategy>,
        classifier: EventClassifier,
        confirm_threshold: u64,
        batch_size: u64,
    ) -> Self {
        let chain = client.chain();
        let recommended = finality::recommended_confirmations(chain);
        if confirm_threshold < recommended {
            warn!(
                chain = %chain,
                confirm_threshold,
                recommended,
                "Confirm threshold below recommended depth"
            );
        }

        Self {
            chain,
            client,
            ledger,
            strategy,
            classifier,
            confirm_threshold,
            batch_size: batch_size.max(1),
            start_block_height: 0,
        }
    }

    /// First block to process when no cursor is persisted yet
    pub fn with_start_block_height(mut self, height: u64) -> Self {
        self.start_block_height = height;
        self
    }

    /// Chains without confirmation depth are treated as final
    fn fork_checks_enabled(&self) -> bool {
        self.confirm_threshold > 0
    }

    pub async fn tick(&self) -> RelayerResult<TickOutcome> {
        let tip = self.client.tip_height().await?;

        let cursor = match self.ledger.cursor(self.chain).await? {
            Some(cursor) => cursor,
            None => return self.init_cursor(tip).await,
        };

        if tip <= cursor.height {
            if let Some(fork_height) = self.stale_cursor_check(&cursor, tip).await? {
                return self.rewind(fork_height).await;
            }
            self.update_confirmations(tip).await?;
            return Ok(TickOutcome::Idle);
        }

        let to = tip.min(cursor.height + self.batch_size);
        let headers = match self.fetch_headers(&cursor, to).await? {
            Ok(headers) => headers,
            Err(fork_height) => return self.rewind(fork_height).await,
        };

        let events = self.client.get_events(cursor.height + 1, to).await?;
        self.verify_event_blocks(&events, &headers, cursor.height + 1)?;
        self.record_events(&events).await?;
        self.update_confirmations(tip).await?;

        let last = headers
            .last()
            .ok_or_else(|| RelayerError::Internal("empty block range".into()))?;
        self.ledger
            .save_cursor(self.chain, &ChainCursor::new(last.number, last.hash.clone()))
            .await?;

        crate::metrics::record_blocks_processed(self.chain, last.number);
        debug!(chain = %self.chain, from = cursor.height + 1, to, tip, "Processed blocks");

        Ok(TickOutcome::Advanced { to: last.number })
    }

    async fn block(&self, height: u64) -> RelayerResult<BlockHeader> {
        self.client
            .get_block(height)
            .await?
            .ok_or_else(|| RelayerError::BlockNotFound {
                chain: self.chain.to_string(),
                height,
            })
    }

    async fn init_cursor(&self, tip: u64) -> RelayerResult<TickOutcome> {
        // processing resumes at cursor + 1
        let height = if self.start_block_height > 0 {
            self.start_block_height - 1
        } else {
            tip
        };
        let block = self.block(height).await?;
        self.ledger
            .save_cursor(self.chain, &ChainCursor::new(height, block.hash))
            .await?;

        info!(chain = %self.chain, height, "Initialized chain cursor");
        Ok(TickOutcome::Initialized { height })
    }

    /// The tip fell below the cursor, or the cursor block was replaced
    async fn stale_cursor_check(&self, cursor: &ChainCursor, tip: u64) -> RelayerResult<Option<u64>> {
        if !self.fork_checks_enabled() || cursor.hash.is_empty() {
            return Ok(None);
        }
        if tip < cursor.height {
            return Ok(Some(tip));
        }

        match self.client.get_block(cursor.height).await? {
            Some(block) if block.hash == cursor.hash => Ok(None),
            _ => Ok(Some(cursor.height)),
        }
    }

    /// Fetch headers `cursor+1..=to`, checking every parent link.
    /// `Err(height)` reports the first block that does not extend the cursor.
    async fn fetch_headers(
        &self,
        cursor: &ChainCursor,
        to: u64,
    ) -> RelayerResult<Result<Vec<BlockHeader>, u64>> {
        let mut headers: Vec<BlockHeader> = Vec::with_capacity((to - cursor.height) as usize);

        for height in cursor.height + 1..=to {
            let block = self.block(height).await?;
            let parent = headers.last().map_or(cursor.hash.as_str(), |h| h.hash.as_str());

            if self.fork_checks_enabled() && !parent.is_empty() && block.parent_hash != parent {
                warn!(
                    chain = %self.chain,
                    height,
                    expected_parent = parent,
                    parent_hash = %block.parent_hash,
                    "Fork detected"
                );
                return Ok(Err(height));
            }
            headers.push(block);
        }

        Ok(Ok(headers))
    }

    /// Events must come from the blocks just verified; a mismatch means the
    /// chain moved between the two queries and the tick is retried
    fn verify_event_blocks(
        &self,
        events: &[ChainEvent],
        headers: &[BlockHeader],
        first: u64,
    ) -> RelayerResult<()> {
        for event in events {
            let header = event
                .block_number
                .checked_sub(first)
                .and_then(|offset| headers.get(offset as usize));
            match header {
                Some(h) if h.hash == event.block_hash || event.block_hash.is_empty() => {}
                _ => {
                    return Err(RelayerError::chain_rpc(
                        self.chain,
                        format!(
                            "event {} from block {} outside verified range",
                            event.unique_id(),
                            event.block_number
                        ),
                    ))
                }
            }
        }
        Ok(())
    }

    async fn record_events(&self, events: &[ChainEvent]) -> RelayerResult<()> {
        for event in events {
            match self.classifier.classify(event) {
                Classified::Source(source) => {
                    if self.ledger.upsert_source_event(&source).await? {
                        crate::metrics::record_event(self.chain, source.kind.as_str());
                        info!(
                            chain = %self.chain,
                            unique_id = %source.unique_id,
                            kind = source.kind.as_str(),
                            amount = %source.amount,
                            block = source.block_number,
                            "Observed source event"
                        );
                    }
                }
                Classified::Settlement(settlement) => {
                    self.strategy
                        .on_settlement(self.ledger.as_ref(), &settlement)
                        .await?;
                }
                Classified::Rejected(reason) => {
                    crate::metrics::record_rejected(self.chain, reason.label());
                    warn!(
                        chain = %self.chain,
                        unique_id = %event.unique_id(),
                        reason = %reason,
                        "Dropped bridge event"
                    );
                }
                Classified::Irrelevant => {}
            }
        }
        Ok(())
    }

    async fn update_confirmations(&self, tip: u64) -> RelayerResult<()> {
        let pending = self.ledger.unconfirmed_events(self.chain).await?;
        if pending.is_empty() {
            return Ok(());
        }

        let updates = finality::evaluate(&pending, tip, self.confirm_threshold);
        let mut confirmed: Vec<SourceEvent> = Vec::new();

        for (mut event, update) in pending.into_iter().zip(updates) {
            if update.confirm_number != event.confirm_number {
                self.ledger
                    .update_confirm_number(&update.unique_id, update.confirm_number)
                    .await?;
                event.confirm_number = update.confirm_number;
            }
            if update.newly_confirmed {
                confirmed.push(event);
            }
        }

        if confirmed.is_empty() {
            return Ok(());
        }

        // hooks first: a crash before the flip re-runs them, and they are idempotent
        self.strategy
            .on_confirmed(self.ledger.as_ref(), &confirmed)
            .await?;
        let ids: Vec<String> = confirmed.iter().map(|e| e.unique_id.clone()).collect();
        self.ledger.mark_confirmed(&ids).await?;

        info!(chain = %self.chain, count = ids.len(), tip, "Events confirmed");
        Ok(())
    }

    async fn rewind(&self, fork_height: u64) -> RelayerResult<TickOutcome> {
        let confirmed_height = finality::confirmed_height(fork_height, self.confirm_threshold);
        let report = self
            .ledger
            .rollback(self.chain, confirmed_height, self.strategy.rollback_scope())
            .await?;

        let block = self.block(confirmed_height).await?;
        self.ledger
            .save_cursor(self.chain, &ChainCursor::new(confirmed_height, block.hash))
            .await?;

        crate::metrics::record_reorg(self.chain);
        warn!(
            chain = %self.chain,
            fork_height,
            confirmed_height,
            source_events = report.source_events,
            dest_actions = report.dest_actions,
            "Rolled back fork"
        );

        Ok(TickOutcome::Rewound {
            to: confirmed_height,
        })
    }
}
