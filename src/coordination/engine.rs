//! Collector-side execution of destination actions
//!
//! Destination chains are served one after another and each gets at most one
//! batch in flight. Before building anything new for a chain the executor
//! asks the signers for a session they still hold, so a restarted collector
//! finishes its previous transaction instead of creating a second one.

use super::batch::BatchPolicy;
use super::builder::{BuildRequest, NewBridgeAsset, TxBuilder};
use crate::asset::{Asset, ChainKind};
use crate::chain::{ChainClient, ChainManager, TxStatus};
use crate::error::RelayerResult;
use crate::ledger::{ActionStatus, DestAction, TransferLedger};
use crate::metrics;
use crate::multisig::{CollectOutcome, MultisigCoordinator, SigPayload, TransferItem};

use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How a submitted transaction ended up
#[derive(Debug, Clone, PartialEq)]
enum Submission {
    Committed(String),
    Failed(String),
    TimedOut(String),
    AlreadyCompleted,
}

pub struct ActionExecutor {
    ledger: Arc<dyn TransferLedger>,
    chains: Arc<ChainManager>,
    coordinators: BTreeMap<ChainKind, Arc<MultisigCoordinator>>,
    policy: BatchPolicy,
    owner_lock_hash: String,
    commit_timeout: Duration,
    status_poll_interval: Duration,
    /// Raw data of sessions this process already submitted
    submitted: Mutex<HashSet<String>>,
}

impl ActionExecutor {
    pub fn new(
        ledger: Arc<dyn TransferLedger>,
        chains: Arc<ChainManager>,
        coordinators: Vec<MultisigCoordinator>,
        policy: BatchPolicy,
    ) -> Self {
        Self {
            ledger,
            chains,
            coordinators: coordinators
                .into_iter()
                .map(|c| (c.chain(), Arc::new(c)))
                .collect(),
            policy,
            owner_lock_hash: String::new(),
            commit_timeout: Duration::from_secs(200),
            status_poll_interval: Duration::from_secs(1),
            submitted: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_owner_lock_hash(mut self, owner_lock_hash: impl Into<String>) -> Self {
        self.owner_lock_hash = owner_lock_hash.into();
        self
    }

    pub fn with_commit_wait(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.commit_timeout = timeout;
        self.status_poll_interval = poll_interval;
        self
    }

    /// Serve every destination chain once
    pub async fn tick(&self) -> RelayerResult<()> {
        let mut first_error = None;
        for (chain, coordinator) in &self.coordinators {
            if let Err(e) = self.process_chain(*chain, coordinator).await {
                error!(chain = %chain, error = %e, "Destination processing failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn process_chain(
        &self,
        chain: ChainKind,
        coordinator: &MultisigCoordinator,
    ) -> RelayerResult<()> {
        if self.reconcile(chain, coordinator).await? {
            return Ok(());
        }

        let mut queued = self
            .ledger
            .list_dest_actions(Some(chain), ActionStatus::Todo, self.policy.limit())
            .await?;
        queued.extend(
            self.ledger
                .list_dest_actions(Some(chain), ActionStatus::Error, self.policy.limit())
                .await?,
        );
        queued.sort_by_key(|a| a.created_at);
        queued.truncate(self.policy.limit());

        if !self.policy.ready(&queued, Utc::now()) {
            if !queued.is_empty() {
                debug!(chain = %chain, queued = queued.len(), "Waiting for a fuller batch");
            }
            return Ok(());
        }

        let builder = self.chains.builder(chain)?;
        if chain.is_nervos()
            && !self
                .register_assets(chain, coordinator, &builder, &queued)
                .await?
        {
            return Ok(());
        }

        self.execute_batch(chain, coordinator, &builder, &queued).await
    }

    /// Resume a session the signers still hold; true when one was handled
    async fn reconcile(
        &self,
        chain: ChainKind,
        coordinator: &MultisigCoordinator,
    ) -> RelayerResult<bool> {
        let Some(session) = coordinator.pending_session().await? else {
            return Ok(false);
        };
        if self.already_submitted(&session.raw_data) {
            return Ok(false);
        }

        let ids = item_ids(session.payload.items());
        let actions = self.ledger.dest_actions(&ids).await?;
        if actions.len() != ids.len() {
            warn!(
                chain = %chain,
                raw_data = %session.raw_data,
                "Pending session references unknown actions, skipping"
            );
            self.mark_submitted(&session.raw_data);
            return Ok(false);
        }
        if actions.iter().all(|a| a.status == ActionStatus::Success) {
            self.mark_submitted(&session.raw_data);
            return Ok(false);
        }

        info!(chain = %chain, raw_data = %session.raw_data, "Resuming session after restart");
        self.ledger.mark_pending(&ids).await?;

        let skeleton = session.payload.skeleton().clone();
        let builder = self.chains.builder(chain)?;
        let outcome = self
            .submit(chain, coordinator, &builder, session.raw_data, session.payload, skeleton)
            .await;
        self.settle(chain, &ids, outcome).await?;
        Ok(true)
    }

    /// Register assets Nervos does not know yet; true when the mint may proceed
    async fn register_assets(
        &self,
        chain: ChainKind,
        coordinator: &MultisigCoordinator,
        builder: &Arc<dyn TxBuilder>,
        queued: &[DestAction],
    ) -> RelayerResult<bool> {
        let mut assets: Vec<Asset> = Vec::new();
        for action in queued {
            if !assets.contains(&action.asset) {
                assets.push(action.asset.clone());
            }
        }

        let unregistered = builder.unregistered_assets(&assets).await?;
        if unregistered.is_empty() {
            return Ok(true);
        }

        info!(chain = %chain, count = unregistered.len(), "Creating bridge assets");
        let new_assets = unregistered
            .into_iter()
            .map(|asset| NewBridgeAsset::new(asset, &self.owner_lock_hash))
            .collect::<RelayerResult<Vec<_>>>()?;
        let request = BuildRequest::BridgeAssetCreate(new_assets);
        let built = builder.build(&request).await?;
        let skeleton = built.skeleton.clone();

        let payload = request.into_payload(built.skeleton);
        match self
            .submit(chain, coordinator, builder, built.raw_digest, payload, skeleton)
            .await?
        {
            Submission::Committed(tx_hash) => {
                info!(chain = %chain, tx_hash = %tx_hash, "Bridge assets created");
                Ok(true)
            }
            Submission::AlreadyCompleted => Ok(true),
            Submission::Failed(reason) => {
                warn!(chain = %chain, reason = %reason, "Bridge asset creation failed");
                Ok(false)
            }
            Submission::TimedOut(tx_hash) => {
                warn!(chain = %chain, tx_hash = %tx_hash, "Bridge asset creation not committed yet");
                Ok(false)
            }
        }
    }

    async fn execute_batch(
        &self,
        chain: ChainKind,
        coordinator: &MultisigCoordinator,
        builder: &Arc<dyn TxBuilder>,
        queued: &[DestAction],
    ) -> RelayerResult<()> {
        let items: Vec<TransferItem> = queued.iter().map(TransferItem::from).collect();
        let ids = item_ids(&items);

        let request = if chain.is_nervos() {
            BuildRequest::Mint(items)
        } else {
            BuildRequest::Unlock(items)
        };

        info!(chain = %chain, kind = ?request.kind(), count = ids.len(), "Executing destination batch");
        self.ledger.mark_pending(&ids).await?;

        let built = match builder.build(&request).await {
            Ok(built) => built,
            Err(e) => {
                self.fail_all(chain, &ids, &e.to_string()).await?;
                return Err(e);
            }
        };

        let skeleton = built.skeleton.clone();
        let payload = request.into_payload(built.skeleton);
        let outcome = self
            .submit(chain, coordinator, builder, built.raw_digest, payload, skeleton)
            .await;
        self.settle(chain, &ids, outcome).await
    }

    /// Collect signatures, assemble, broadcast and wait for the commit
    async fn submit(
        &self,
        chain: ChainKind,
        coordinator: &MultisigCoordinator,
        builder: &Arc<dyn TxBuilder>,
        raw_data: String,
        payload: SigPayload,
        skeleton: serde_json::Value,
    ) -> RelayerResult<Submission> {
        let signatures = match coordinator.collect(raw_data.clone(), payload).await? {
            CollectOutcome::Signatures(signatures) => signatures,
            CollectOutcome::AlreadyCompleted => {
                self.mark_submitted(&raw_data);
                return Ok(Submission::AlreadyCompleted);
            }
        };
        let signatures: Vec<String> = signatures.into_iter().map(|s| s.signature).collect();

        // submitted only once the chain answered; transient failures resume via reconcile
        let signed = builder.assemble(&skeleton, &signatures).await?;
        let client = self.chains.client(chain)?;
        let tx_hash = match client.broadcast(&signed).await {
            Ok(tx_hash) => tx_hash,
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                self.mark_submitted(&raw_data);
                return Ok(Submission::Failed(e.to_string()));
            }
        };
        self.mark_submitted(&raw_data);
        info!(chain = %chain, tx_hash = %tx_hash, "Transaction broadcast");

        self.wait_commit(client.as_ref(), tx_hash).await
    }

    async fn wait_commit(
        &self,
        client: &dyn ChainClient,
        tx_hash: String,
    ) -> RelayerResult<Submission> {
        let deadline = Instant::now() + self.commit_timeout;
        loop {
            match client.get_status(&tx_hash).await {
                Ok(TxStatus::Committed) => return Ok(Submission::Committed(tx_hash)),
                Ok(TxStatus::Failed(reason)) => return Ok(Submission::Failed(reason)),
                Ok(TxStatus::Pending) | Ok(TxStatus::Unknown) => {}
                Err(e) => warn!(tx_hash = %tx_hash, error = %e, "Status query failed"),
            }
            if Instant::now() >= deadline {
                return Ok(Submission::TimedOut(tx_hash));
            }
            tokio::time::sleep(self.status_poll_interval).await;
        }
    }

    /// Apply a submission outcome to the batch rows
    async fn settle(
        &self,
        chain: ChainKind,
        ids: &[String],
        outcome: RelayerResult<Submission>,
    ) -> RelayerResult<()> {
        match outcome {
            Ok(Submission::Committed(tx_hash)) => {
                for id in ids {
                    self.ledger.mark_success(id, &tx_hash).await?;
                }
                info!(chain = %chain, tx_hash = %tx_hash, count = ids.len(), "Batch committed");
                record_actions(chain, "success", ids.len());
                Ok(())
            }
            Ok(Submission::Failed(reason)) => self.fail_all(chain, ids, &reason).await,
            Ok(Submission::TimedOut(tx_hash)) => {
                // rows stay pending until the destination observer sees the settlement
                warn!(chain = %chain, tx_hash = %tx_hash, "Commit wait timed out");
                record_actions(chain, "timeout", ids.len());
                Ok(())
            }
            Ok(Submission::AlreadyCompleted) => {
                info!(chain = %chain, count = ids.len(), "Batch already executed elsewhere");
                record_actions(chain, "completed", ids.len());
                Ok(())
            }
            Err(e) => {
                // back to error so the next tick picks the rows up again
                self.fail_all(chain, ids, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    async fn fail_all(
        &self,
        chain: ChainKind,
        ids: &[String],
        message: &str,
    ) -> RelayerResult<()> {
        warn!(chain = %chain, count = ids.len(), message, "Marking batch as failed");
        for id in ids {
            self.ledger.mark_error(id, message).await?;
        }
        record_actions(chain, "error", ids.len());
        Ok(())
    }

    fn already_submitted(&self, raw_data: &str) -> bool {
        self.submitted
            .lock()
            .map(|s| s.contains(raw_data))
            .unwrap_or(false)
    }

    fn mark_submitted(&self, raw_data: &str) {
        if let Ok(mut submitted) = self.submitted.lock() {
            submitted.insert(raw_data.to_string());
        }
    }
}

fn item_ids(items: &[TransferItem]) -> Vec<String> {
    items.iter().map(|i| i.id.clone()).collect()
}

fn record_actions(chain: ChainKind, outcome: &str, count: usize) {
    for _ in 0..count {
        metrics::record_action(chain, outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::FakeChain;
    use crate::chain::SignedTx;
    use crate::config::Network;
    use crate::coordination::builder::{BuiltTx, MockTxBuilder};
    use crate::ledger::fixtures::{eth_asset, lock_event};
    use crate::ledger::{ConfirmStatus, MemoryLedger};
    use crate::multisig::auth::tests::collector_auth;
    use crate::multisig::coordinator::tests::{endpoint, rejected, sig, ScriptedSigner};
    use crate::multisig::{SigErrorCode, SigningSession};
    use serde_json::json;

    const DIGEST: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";

    struct Harness {
        ledger: Arc<MemoryLedger>,
        nervos: Arc<FakeChain>,
        signers: Vec<Arc<ScriptedSigner>>,
    }

    impl Harness {
        fn new(responses: Vec<SignResponseScript>) -> Self {
            Self {
                ledger: Arc::new(MemoryLedger::new()),
                nervos: Arc::new(FakeChain::new(ChainKind::Nervos, 10)),
                signers: responses.into_iter().map(ScriptedSigner::new).collect(),
            }
        }

        fn executor(&self, builder: MockTxBuilder) -> ActionExecutor {
            let endpoints = self
                .signers
                .iter()
                .enumerate()
                .map(|(i, s)| endpoint(&format!("s{}", i), s.clone()))
                .collect();
            let coordinator = MultisigCoordinator::new(
                ChainKind::Nervos,
                endpoints,
                2,
                Arc::new(collector_auth()),
                Duration::from_millis(100),
            )
            .with_max_rounds(3);

            let chains = ChainManager::from_parts(
                vec![self.nervos.clone() as Arc<dyn ChainClient>],
                vec![(ChainKind::Nervos, Arc::new(builder) as Arc<dyn TxBuilder>)],
            );

            ActionExecutor::new(
                self.ledger.clone(),
                Arc::new(chains),
                vec![coordinator],
                BatchPolicy::new(10, Duration::from_secs(60), Network::Testnet),
            )
            .with_owner_lock_hash("0xaabb")
            .with_commit_wait(Duration::from_secs(5), Duration::from_secs(1))
        }

        async fn queue(&self, id: &str) {
            let mut event = lock_event(id, 100);
            event.confirm_status = ConfirmStatus::Confirmed;
            self.ledger.upsert_source_event(&event).await.unwrap();
            self.ledger
                .create_dest_actions(&[event.to_dest_action()])
                .await
                .unwrap();
        }

        async fn action(&self, id: &str) -> DestAction {
            self.ledger
                .dest_actions(&[id.to_string()])
                .await
                .unwrap()
                .remove(0)
        }
    }

    type SignResponseScript = Vec<(u64, crate::multisig::SignResponse)>;

    fn signing() -> Vec<SignResponseScript> {
        vec![vec![(10, sig("0xs0"))], vec![(20, sig("0xs1"))], vec![(30, sig("0xs2"))]]
    }

    fn builder(unregistered: Vec<Asset>) -> MockTxBuilder {
        let mut builder = MockTxBuilder::new();
        builder
            .expect_unregistered_assets()
            .returning(move |_| Ok(unregistered.clone()));
        builder.expect_build().returning(|request| {
            Ok(BuiltTx {
                raw_digest: DIGEST.into(),
                skeleton: json!({"kind": request.kind()}),
            })
        });
        builder.expect_assemble().returning(|skeleton, signatures| {
            Ok(SignedTx {
                raw: json!({"skeleton": skeleton.clone(), "signatures": signatures.to_vec()}),
            })
        });
        builder
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_commits_and_marks_success() {
        let harness = Harness::new(signing());
        harness.queue("0xaa-0").await;
        harness.queue("0xbb-0").await;
        harness.nervos.set_status("0xtx1", TxStatus::Committed);

        harness.executor(builder(vec![])).tick().await.unwrap();

        let broadcasts = harness.nervos.broadcasts();
        assert_eq!(broadcasts.len(), 1);
        assert_eq!(broadcasts[0].raw["skeleton"]["kind"], "mint");
        assert_eq!(broadcasts[0].raw["signatures"], json!(["0xs0", "0xs1"]));

        for id in ["0xaa-0", "0xbb-0"] {
            let action = harness.action(id).await;
            assert_eq!(action.status, ActionStatus::Success);
            assert_eq!(action.exec_tx_hash.as_deref(), Some("0xtx1"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregistered_asset_is_created_first() {
        let harness = Harness::new(signing());
        harness.queue("0xaa-0").await;
        harness.nervos.set_status("0xtx1", TxStatus::Committed);
        harness.nervos.set_status("0xtx2", TxStatus::Committed);

        harness.executor(builder(vec![eth_asset()])).tick().await.unwrap();

        let broadcasts = harness.nervos.broadcasts();
        assert_eq!(broadcasts.len(), 2);
        assert_eq!(broadcasts[0].raw["skeleton"]["kind"], "bridge-asset-create");
        assert_eq!(broadcasts[1].raw["skeleton"]["kind"], "mint");
        assert_eq!(harness.action("0xaa-0").await.status, ActionStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_transaction_marks_error_and_is_retried() {
        let harness = Harness::new(signing());
        harness.queue("0xaa-0").await;
        harness
            .nervos
            .set_status("0xtx1", TxStatus::Failed("reverted".into()));

        let executor = harness.executor(builder(vec![]));
        executor.tick().await.unwrap();

        let action = harness.action("0xaa-0").await;
        assert_eq!(action.status, ActionStatus::Error);
        assert_eq!(action.message.as_deref(), Some("reverted"));
        assert_eq!(action.exec_tx_hash, None);

        harness.nervos.set_status("0xtx2", TxStatus::Committed);
        executor.tick().await.unwrap();
        let action = harness.action("0xaa-0").await;
        assert_eq!(action.status, ActionStatus::Success);
        assert_eq!(action.exec_tx_hash.as_deref(), Some("0xtx2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_timeout_leaves_rows_pending() {
        let harness = Harness::new(signing());
        harness.queue("0xaa-0").await;

        harness.executor(builder(vec![])).tick().await.unwrap();

        assert_eq!(harness.nervos.broadcasts().len(), 1);
        assert_eq!(harness.action("0xaa-0").await.status, ActionStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_completed_skips_broadcast() {
        let completed = vec![(10, rejected(SigErrorCode::TxCompleted))];
        let harness = Harness::new(vec![completed.clone(), completed.clone(), completed]);
        harness.queue("0xaa-0").await;

        harness.executor(builder(vec![])).tick().await.unwrap();

        assert!(harness.nervos.broadcasts().is_empty());
        assert_eq!(harness.action("0xaa-0").await.status, ActionStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_rounds_mark_error() {
        let refused = vec![(10, rejected(SigErrorCode::TxUnconfirmed))];
        let harness = Harness::new(vec![refused.clone(), refused.clone(), refused]);
        harness.queue("0xaa-0").await;

        assert!(harness.executor(builder(vec![])).tick().await.is_err());
        assert_eq!(harness.action("0xaa-0").await.status, ActionStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_broadcast_failure_is_retried() {
        let harness = Harness::new(signing());
        harness.queue("0xaa-0").await;
        harness.nervos.fail_broadcasts(1);

        let executor = harness.executor(builder(vec![]));
        assert!(executor.tick().await.is_err());

        let action = harness.action("0xaa-0").await;
        assert_eq!(action.status, ActionStatus::Error);
        assert!(action.message.as_deref().unwrap_or_default().contains("timeout"));
        assert!(harness.nervos.broadcasts().is_empty());

        // the signers still hold the session that never reached the chain
        let mut session = SigningSession {
            chain: ChainKind::Nervos,
            raw_data: DIGEST.into(),
            payload: SigPayload::Mint {
                items: vec![TransferItem::from(&action)],
                skeleton: json!({"kind": "mint"}),
            },
            collector_sig: String::new(),
        };
        collector_auth().sign(&mut session).unwrap();
        for signer in &harness.signers {
            signer.set_pending(Some(session.clone()));
        }
        harness.nervos.set_status("0xtx1", TxStatus::Committed);

        executor.tick().await.unwrap();

        assert_eq!(harness.nervos.broadcasts().len(), 1);
        let action = harness.action("0xaa-0").await;
        assert_eq!(action.status, ActionStatus::Success);
        assert_eq!(action.exec_tx_hash.as_deref(), Some("0xtx1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_resumes_pending_session() {
        let harness = Harness::new(signing());
        harness.queue("0xaa-0").await;

        let action = harness.action("0xaa-0").await;
        let mut session = SigningSession {
            chain: ChainKind::Nervos,
            raw_data: DIGEST.into(),
            payload: SigPayload::Mint {
                items: vec![TransferItem::from(&action)],
                skeleton: json!({"kind": "resumed"}),
            },
            collector_sig: String::new(),
        };
        collector_auth().sign(&mut session).unwrap();
        for signer in &harness.signers {
            signer.set_pending(Some(session.clone()));
        }
        harness.nervos.set_status("0xtx1", TxStatus::Committed);

        // a fresh build would panic: the mock has no build expectation
        let mut builder = MockTxBuilder::new();
        builder.expect_assemble().returning(|skeleton, signatures| {
            Ok(SignedTx {
                raw: json!({"skeleton": skeleton.clone(), "signatures": signatures.to_vec()}),
            })
        });
        let executor = harness.executor(builder);
        executor.tick().await.unwrap();

        let broadcasts = harness.nervos.broadcasts();
        assert_eq!(broadcasts.len(), 1);
        assert_eq!(broadcasts[0].raw["skeleton"]["kind"], "resumed");
        assert_eq!(harness.action("0xaa-0").await.status, ActionStatus::Success);

        // the same session is not submitted twice by one process
        executor.tick().await.unwrap();
        assert_eq!(harness.nervos.broadcasts().len(), 1);
    }
}
