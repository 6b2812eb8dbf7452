//! Signer service run by verifiers
//!
//! A verifier signs a destination transaction only after checking, against
//! its own ledger, that every transfer in the batch was observed and
//! confirmed and matches what the collector asks for, and that the digest it
//! is asked to sign is the one of the transaction skeleton carrying exactly
//! those transfers. Sessions it signed stay
//! pending per chain until the transfers settle, so a restarted collector can
//! resume them through `pendingTx` instead of building a conflicting
//! transaction.

use crate::asset::{AssetWhitelist, ChainKind};
use crate::chain::ChainManager;
use crate::error::{RelayerError, RelayerResult};
use crate::ledger::{ActionStatus, ConfirmStatus, TransferLedger};
use crate::multisig::{
    CollectorAuth, SigErrorCode, SigPayload, SignerError, SignerKey, SigningSession, TransferItem,
};
use crate::rpc::{JsonRpcRequest, JsonRpcResponse, RpcError};

use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long an unsettled signed session blocks conflicting ones
pub const PENDING_SESSION_TTL: Duration = Duration::from_secs(600);

const METHOD_NOT_FOUND: i64 = -32601;

struct PendingSession {
    session: SigningSession,
    signed_at: Instant,
}

pub struct SignerService {
    ledger: Arc<dyn TransferLedger>,
    whitelist: Arc<AssetWhitelist>,
    chains: Arc<ChainManager>,
    auth: CollectorAuth,
    key: SignerKey,
    pending: Mutex<HashMap<ChainKind, PendingSession>>,
    pending_ttl: Duration,
}

#[derive(Deserialize)]
struct PendingTxParams {
    chain: ChainKind,
}

impl SignerService {
    pub fn new(
        ledger: Arc<dyn TransferLedger>,
        whitelist: Arc<AssetWhitelist>,
        chains: Arc<ChainManager>,
        auth: CollectorAuth,
        key: SignerKey,
    ) -> Self {
        Self {
            ledger,
            whitelist,
            chains,
            auth,
            key,
            pending: Mutex::new(HashMap::new()),
            pending_ttl: PENDING_SESSION_TTL,
        }
    }

    pub fn with_pending_ttl(mut self, ttl: Duration) -> Self {
        self.pending_ttl = ttl;
        self
    }

    /// Validate `session` and sign its raw data
    pub async fn sign_tx(&self, session: SigningSession) -> Result<String, SignerError> {
        if let Err(e) = self.auth.verify(&session) {
            warn!(error = %e, "Rejecting unauthenticated session");
            return Err(SignerError::new(SigErrorCode::InvalidParams, e.to_string()));
        }

        let mut pending = self.pending.lock().await;

        match &session.payload {
            SigPayload::CreateAsset { assets, .. } => {
                if assets.is_empty() {
                    return Err(invalid_params("no assets to create"));
                }
                if let Some(asset) = assets.iter().find(|a| !self.whitelist.is_whitelisted(a)) {
                    return Err(SignerError::new(
                        SigErrorCode::InvalidRecord,
                        format!("asset {} is not whitelisted", asset),
                    ));
                }
            }
            SigPayload::Mint { items, .. } | SigPayload::Unlock { items, .. } => {
                self.check_transfers(&session, items).await?;
                self.check_conflicts(&mut pending, &session).await?;
            }
        }
        self.check_digest(&session).await?;

        let signature = self
            .key
            .sign_digest(&session.raw_data)
            .map_err(|e| invalid_params(e.to_string()))?;

        info!(
            chain = %session.chain,
            raw_data = %session.raw_data,
            sig_type = session.payload.name(),
            "Signed session"
        );

        if !session.payload.items().is_empty() {
            pending.insert(
                session.chain,
                PendingSession {
                    session,
                    signed_at: Instant::now(),
                },
            );
        }
        Ok(signature)
    }

    /// Signed session for `chain` whose transfers have not all settled
    pub async fn pending_tx(&self, chain: ChainKind) -> RelayerResult<Option<SigningSession>> {
        let mut pending = self.pending.lock().await;
        let Some(entry) = pending.get(&chain) else {
            return Ok(None);
        };

        if self.all_settled(entry.session.payload.items()).await? {
            debug!(chain = %chain, raw_data = %entry.session.raw_data, "Pending session settled");
            pending.remove(&chain);
            return Ok(None);
        }
        Ok(Some(entry.session.clone()))
    }

    /// Dispatch one JSON-RPC request
    pub async fn handle(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.clone();
        let outcome = match request.method.as_str() {
            "signTx" => match parse_params::<SigningSession>(request.params) {
                Ok(session) => self
                    .sign_tx(session)
                    .await
                    .map(Value::String)
                    .map_err(RpcError::from),
                Err(e) => Err(e.into()),
            },
            "pendingTx" => match parse_params::<PendingTxParams>(request.params) {
                Ok(params) => match self.pending_tx(params.chain).await {
                    Ok(session) => serde_json::to_value(session)
                        .map_err(|e| internal(e.into()).into()),
                    Err(e) => Err(internal(e).into()),
                },
                Err(e) => Err(e.into()),
            },
            other => Err(RpcError {
                code: METHOD_NOT_FOUND,
                message: format!("method {} not found", other),
            }),
        };

        match outcome {
            Ok(result) => JsonRpcResponse::result(id, result),
            Err(error) => JsonRpcResponse::error(id, error),
        }
    }

    async fn check_transfers(
        &self,
        session: &SigningSession,
        items: &[TransferItem],
    ) -> Result<(), SignerError> {
        if items.is_empty() {
            return Err(invalid_params("empty transfer batch"));
        }

        let mut seen = HashSet::new();
        for item in items {
            if !seen.insert(item.id.as_str()) {
                return Err(invalid_params(format!("duplicate item {}", item.id)));
            }
            let expected_chain = match session.payload {
                SigPayload::Mint { .. } => ChainKind::Nervos,
                _ => item.asset.chain(),
            };
            if session.chain != expected_chain {
                return Err(invalid_params(format!(
                    "item {} cannot execute on {}",
                    item.id, session.chain
                )));
            }
        }

        if self.all_settled(items).await.map_err(internal)? {
            return Err(SignerError::new(
                SigErrorCode::TxCompleted,
                "all transfers already settled",
            ));
        }

        let ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
        let events: HashMap<String, _> = self
            .ledger
            .source_events(&ids)
            .await
            .map_err(internal)?
            .into_iter()
            .map(|e| (e.unique_id.clone(), e))
            .collect();

        for item in items {
            let Some(event) = events.get(&item.id) else {
                let source_chain = match session.payload {
                    SigPayload::Mint { .. } => item.asset.chain(),
                    _ => ChainKind::Nervos,
                };
                let synced = self.ledger.cursor(source_chain).await.map_err(internal)?;
                let code = if synced.is_none() {
                    SigErrorCode::BlockSyncIncomplete
                } else {
                    SigErrorCode::TxNotFound
                };
                return Err(SignerError::new(code, format!("{} not observed", item.id)));
            };

            if event.confirm_status != ConfirmStatus::Confirmed {
                return Err(SignerError::new(
                    SigErrorCode::TxUnconfirmed,
                    format!("{} has {} confirmations", item.id, event.confirm_number),
                ));
            }

            let mismatch = if event.dest_chain() != session.chain {
                Some("destination chain")
            } else if event.asset != item.asset {
                Some("asset")
            } else if event.recipient != item.recipient {
                Some("recipient")
            } else if event.dest_amount() != item.amount {
                Some("amount")
            } else {
                None
            };
            if let Some(field) = mismatch {
                warn!(unique_id = %item.id, field, "Session does not match observed transfer");
                return Err(SignerError::new(
                    SigErrorCode::InvalidRecord,
                    format!("{} {} mismatch", item.id, field),
                ));
            }
        }
        Ok(())
    }

    /// `raw_data` must be the digest of the skeleton the payload carries
    async fn check_digest(&self, session: &SigningSession) -> Result<(), SignerError> {
        let builder = self
            .chains
            .builder(session.chain)
            .map_err(|e| invalid_params(e.to_string()))?;

        let digest = match builder.digest(&session.payload).await {
            Ok(digest) => digest,
            Err(e) if e.is_retryable() => return Err(internal(e)),
            Err(e) => {
                warn!(chain = %session.chain, error = %e, "Skeleton does not match payload");
                return Err(SignerError::new(SigErrorCode::InvalidRecord, e.to_string()));
            }
        };

        if !digest.eq_ignore_ascii_case(&session.raw_data) {
            warn!(
                chain = %session.chain,
                raw_data = %session.raw_data,
                digest = %digest,
                "Raw data does not match skeleton"
            );
            return Err(SignerError::new(
                SigErrorCode::InvalidRecord,
                format!("raw data {} is not the skeleton digest", session.raw_data),
            ));
        }
        Ok(())
    }

    /// An unsettled session over the same transfers with different raw data
    async fn check_conflicts(
        &self,
        pending: &mut HashMap<ChainKind, PendingSession>,
        session: &SigningSession,
    ) -> Result<(), SignerError> {
        let Some(existing) = pending.get(&session.chain) else {
            return Ok(());
        };
        if existing.session.raw_data == session.raw_data {
            return Ok(());
        }

        let expired = existing.signed_at.elapsed() >= self.pending_ttl;
        let settled = self
            .all_settled(existing.session.payload.items())
            .await
            .map_err(internal)?;
        if expired || settled {
            pending.remove(&session.chain);
            return Ok(());
        }

        let signed: HashSet<&str> = existing
            .session
            .payload
            .items()
            .iter()
            .map(|i| i.id.as_str())
            .collect();
        if let Some(item) = session
            .payload
            .items()
            .iter()
            .find(|i| signed.contains(i.id.as_str()))
        {
            return Err(SignerError::new(
                SigErrorCode::DuplicateSign,
                format!(
                    "{} already signed in {}",
                    item.id, existing.session.raw_data
                ),
            ));
        }
        Ok(())
    }

    async fn all_settled(&self, items: &[TransferItem]) -> RelayerResult<bool> {
        if items.is_empty() {
            return Ok(false);
        }
        let ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
        let actions = self.ledger.dest_actions(&ids).await?;
        Ok(actions.len() == ids.len()
            && actions.iter().all(|a| a.status == ActionStatus::Success))
    }
}

/// Accept both `{..}` and `[{..}]` parameter shapes
fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, SignerError> {
    let params = match params {
        Value::Array(mut values) if values.len() == 1 => values.remove(0),
        other => other,
    };
    serde_json::from_value(params).map_err(|e| invalid_params(e.to_string()))
}

fn invalid_params(message: impl Into<String>) -> SignerError {
    SignerError::new(SigErrorCode::InvalidParams, message)
}

fn internal(e: RelayerError) -> SignerError {
    SignerError::new(SigErrorCode::UnknownError, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::tests::whitelist;
    use crate::coordination::builder::MockTxBuilder;
    use crate::coordination::TxBuilder;
    use crate::ledger::fixtures::{eth_asset, lock_event};
    use crate::ledger::{ChainCursor, MemoryLedger, Settlement, TransferKind};
    use crate::asset::Asset;
    use crate::multisig::auth::tests::{collector_auth, COLLECTOR_ADDRESS, OTHER_KEY};
    use serde_json::json;

    const DIGEST_A: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";
    const DIGEST_B: &str = "0x2222222222222222222222222222222222222222222222222222222222222222";

    async fn service() -> (SignerService, Arc<MemoryLedger>) {
        let ledger = Arc::new(MemoryLedger::new());
        ledger
            .save_cursor(ChainKind::Ethereum, &ChainCursor::new(200, "0xb200"))
            .await
            .unwrap();

        let auth = CollectorAuth::new(None, &[COLLECTOR_ADDRESS.to_string()]).unwrap();
        let key = SignerKey::from_private_key(OTHER_KEY).unwrap();
        let service = SignerService::new(ledger.clone(), whitelist(), chains(), auth, key);
        (service, ledger)
    }

    /// Builder whose digest is the skeleton's `digest` field; a skeleton
    /// without one does not carry the payload
    fn chains() -> Arc<ChainManager> {
        let mut builder = MockTxBuilder::new();
        builder.expect_digest().returning(|payload| {
            payload.skeleton()["digest"]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| RelayerError::TxBuild("skeleton misses transfers".into()))
        });
        Arc::new(ChainManager::from_parts(
            vec![],
            vec![(ChainKind::Nervos, Arc::new(builder) as Arc<dyn TxBuilder>)],
        ))
    }

    async fn confirmed(ledger: &MemoryLedger, id: &str) {
        let mut event = lock_event(id, 100);
        event.confirm_status = ConfirmStatus::Confirmed;
        event.confirm_number = 15;
        ledger.upsert_source_event(&event).await.unwrap();
    }

    fn item(id: &str) -> TransferItem {
        TransferItem {
            id: id.into(),
            asset: eth_asset(),
            amount: 990,
            recipient: "ckt1recipient".into(),
        }
    }

    fn mint(raw_data: &str, items: Vec<TransferItem>) -> SigningSession {
        mint_over(raw_data, json!({ "digest": raw_data }), items)
    }

    fn mint_over(raw_data: &str, skeleton: Value, items: Vec<TransferItem>) -> SigningSession {
        let mut session = SigningSession {
            chain: ChainKind::Nervos,
            raw_data: raw_data.into(),
            payload: SigPayload::Mint { items, skeleton },
            collector_sig: String::new(),
        };
        collector_auth().sign(&mut session).unwrap();
        session
    }

    fn code(result: Result<String, SignerError>) -> SigErrorCode {
        result.unwrap_err().code
    }

    #[tokio::test]
    async fn test_signs_confirmed_transfer_and_remembers_it() {
        let (service, ledger) = service().await;
        confirmed(&ledger, "0xaa-0").await;

        let signature = service
            .sign_tx(mint(DIGEST_A, vec![item("0xaa-0")]))
            .await
            .unwrap();
        assert!(signature.starts_with("0x"));

        let pending = service.pending_tx(ChainKind::Nervos).await.unwrap().unwrap();
        assert_eq!(pending.raw_data, DIGEST_A);

        ledger
            .record_settlement(&Settlement {
                source_id: "0xaa-0".into(),
                source_chain: ChainKind::Ethereum,
                dest_chain: ChainKind::Nervos,
                kind: TransferKind::Lock,
                asset: eth_asset(),
                amount: 990,
                recipient: "ckt1recipient".into(),
                tx_hash: "0xmint".into(),
                block_number: 30,
            })
            .await
            .unwrap();
        assert_eq!(service.pending_tx(ChainKind::Nervos).await.unwrap(), None);
        assert_eq!(
            code(service.sign_tx(mint(DIGEST_A, vec![item("0xaa-0")])).await),
            SigErrorCode::TxCompleted
        );
    }

    #[tokio::test]
    async fn test_ledger_checks() {
        let (service, ledger) = service().await;

        assert_eq!(
            code(service.sign_tx(mint(DIGEST_A, vec![item("0xaa-0")])).await),
            SigErrorCode::TxNotFound
        );

        ledger.upsert_source_event(&lock_event("0xaa-0", 100)).await.unwrap();
        assert_eq!(
            code(service.sign_tx(mint(DIGEST_A, vec![item("0xaa-0")])).await),
            SigErrorCode::TxUnconfirmed
        );

        confirmed(&ledger, "0xbb-0").await;
        let mut inflated = item("0xbb-0");
        inflated.amount = 1_000;
        assert_eq!(
            code(service.sign_tx(mint(DIGEST_A, vec![inflated])).await),
            SigErrorCode::InvalidRecord
        );

        let mut redirected = item("0xbb-0");
        redirected.recipient = "ckt1attacker".into();
        assert_eq!(
            code(service.sign_tx(mint(DIGEST_A, vec![redirected])).await),
            SigErrorCode::InvalidRecord
        );
    }

    #[tokio::test]
    async fn test_raw_data_must_match_skeleton() {
        let (service, ledger) = service().await;
        confirmed(&ledger, "0xaa-0").await;

        let swapped = mint_over(DIGEST_B, json!({ "digest": DIGEST_A }), vec![item("0xaa-0")]);
        assert_eq!(code(service.sign_tx(swapped).await), SigErrorCode::InvalidRecord);

        let hollow = mint_over(DIGEST_A, json!({}), vec![item("0xaa-0")]);
        assert_eq!(code(service.sign_tx(hollow).await), SigErrorCode::InvalidRecord);

        // nothing was signed, so nothing is pending
        assert_eq!(service.pending_tx(ChainKind::Nervos).await.unwrap(), None);

        assert!(service.sign_tx(mint(DIGEST_A, vec![item("0xaa-0")])).await.is_ok());
    }

    #[tokio::test]
    async fn test_unsynced_source_chain() {
        let (service, _ledger) = service().await;
        let mut tron = item("0xcc-0");
        tron.asset = Asset::Tron("trx".into());
        assert_eq!(
            code(service.sign_tx(mint(DIGEST_A, vec![tron])).await),
            SigErrorCode::BlockSyncIncomplete
        );
    }

    #[tokio::test]
    async fn test_untrusted_and_conflicting_sessions() {
        let (service, ledger) = service().await;
        confirmed(&ledger, "0xaa-0").await;
        confirmed(&ledger, "0xbb-0").await;

        let mut forged = mint(DIGEST_A, vec![item("0xaa-0")]);
        forged.collector_sig = String::new();
        CollectorAuth::new(Some(OTHER_KEY), &[])
            .unwrap()
            .sign(&mut forged)
            .unwrap();
        assert_eq!(code(service.sign_tx(forged).await), SigErrorCode::InvalidParams);

        service
            .sign_tx(mint(DIGEST_A, vec![item("0xaa-0")]))
            .await
            .unwrap();
        // re-signing the same digest is fine
        service
            .sign_tx(mint(DIGEST_A, vec![item("0xaa-0")]))
            .await
            .unwrap();
        assert_eq!(
            code(
                service
                    .sign_tx(mint(DIGEST_B, vec![item("0xaa-0"), item("0xbb-0")]))
                    .await
            ),
            SigErrorCode::DuplicateSign
        );
    }

    #[tokio::test]
    async fn test_expired_pending_session_no_longer_conflicts() {
        let (service, ledger) = service().await;
        let service = service.with_pending_ttl(Duration::ZERO);
        confirmed(&ledger, "0xaa-0").await;

        service
            .sign_tx(mint(DIGEST_A, vec![item("0xaa-0")]))
            .await
            .unwrap();
        service
            .sign_tx(mint(DIGEST_B, vec![item("0xaa-0")]))
            .await
            .unwrap();
        let pending = service.pending_tx(ChainKind::Nervos).await.unwrap().unwrap();
        assert_eq!(pending.raw_data, DIGEST_B);
    }

    #[tokio::test]
    async fn test_json_rpc_dispatch() {
        let (service, ledger) = service().await;
        confirmed(&ledger, "0xaa-0").await;

        let request = |method: &str, params: Value| JsonRpcRequest {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id: json!(7),
        };

        let session = serde_json::to_value(mint(DIGEST_A, vec![item("0xaa-0")])).unwrap();
        let response = service.handle(request("signTx", json!([session]))).await;
        assert!(response.error.is_none());
        assert_eq!(response.id, json!(7));

        let response = service
            .handle(request("pendingTx", json!({"chain": "nervos"})))
            .await;
        assert_eq!(response.result.unwrap()["rawData"], DIGEST_A);

        let response = service.handle(request("signTx", json!({"bogus": true}))).await;
        assert_eq!(response.error.unwrap().code, 1000);

        let response = service.handle(request("dropTables", Value::Null)).await;
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
    }
}
