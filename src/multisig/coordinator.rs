//! M-of-N signature collection
//!
//! Each round sends the session to every host still in play and waits for
//! all of them. Valid signatures are kept across rounds, hosts answering with
//! a retryable error are asked again next round, hosts answering with a hard
//! error sit out the rest of the attempt. `TxCompleted` answers feed a
//! separate counter: once `threshold` hosts report the transaction as already
//! done, collection stops without signatures. The two counters never mix.

use super::{
    CollectorAuth, HttpSignerClient, SigErrorCode, SigPayload, SignResponse, SignerClient,
    SigningSession,
};
use crate::asset::ChainKind;
use crate::config::MultisigConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::metrics;
use crate::supervisor::{Clock, TokioClock};

use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct SignerEndpoint {
    pub name: String,
    /// Address the signer signs with
    pub address: String,
    pub client: Arc<dyn SignerClient>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectedSignature {
    pub host: String,
    pub signature: String,
    pub latency: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CollectOutcome {
    /// Exactly `threshold` signatures, fastest first
    Signatures(Vec<CollectedSignature>),
    /// Enough signers report the transaction as already executed
    AlreadyCompleted,
}

pub struct MultisigCoordinator {
    chain: ChainKind,
    signers: Vec<SignerEndpoint>,
    threshold: usize,
    auth: Arc<CollectorAuth>,
    round_interval: Duration,
    max_rounds: Option<u32>,
    clock: Arc<dyn Clock>,
}

impl MultisigCoordinator {
    pub fn new(
        chain: ChainKind,
        signers: Vec<SignerEndpoint>,
        threshold: usize,
        auth: Arc<CollectorAuth>,
        round_interval: Duration,
    ) -> Self {
        Self {
            chain,
            signers,
            threshold,
            auth,
            round_interval,
            max_rounds: None,
            clock: Arc::new(TokioClock),
        }
    }

    /// HTTP signers for every configured host
    pub fn from_config(
        chain: ChainKind,
        config: &MultisigConfig,
        auth: Arc<CollectorAuth>,
    ) -> RelayerResult<Self> {
        let signers = config
            .hosts
            .iter()
            .map(|host| {
                let client = HttpSignerClient::new(&host.name, &host.url, Duration::from_secs(30))?;
                Ok(SignerEndpoint {
                    name: host.name.clone(),
                    address: host.address.clone(),
                    client: Arc::new(client),
                })
            })
            .collect::<RelayerResult<Vec<_>>>()?;

        Ok(Self::new(
            chain,
            signers,
            config.threshold,
            auth,
            Duration::from_millis(config.round_interval_ms),
        ))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = Some(max_rounds);
        self
    }

    pub fn chain(&self) -> ChainKind {
        self.chain
    }

    /// Collect `threshold` signatures over `raw_data`
    pub async fn collect(
        &self,
        raw_data: String,
        payload: SigPayload,
    ) -> RelayerResult<CollectOutcome> {
        let mut session = SigningSession {
            chain: self.chain,
            raw_data,
            payload,
            collector_sig: String::new(),
        };
        self.auth.sign(&mut session)?;

        info!(
            chain = %self.chain,
            raw_data = %session.raw_data,
            sig_type = session.payload.name(),
            "Collecting signatures"
        );

        let mut signatures: Vec<CollectedSignature> = Vec::new();
        let mut completed: HashSet<usize> = HashSet::new();
        let mut hosts: Vec<usize> = (0..self.signers.len()).collect();
        let mut round = 0u32;

        loop {
            round += 1;
            metrics::record_signature_round(self.chain);

            let responses = join_all(hosts.iter().map(|&index| {
                let session = &session;
                async move {
                    let signer = &self.signers[index];
                    let started = self.clock.now();
                    let response = signer.client.sign_tx(session).await;
                    (index, response, self.clock.now().duration_since(started))
                }
            }))
            .await;

            let mut retry = Vec::new();
            for (index, response, latency) in responses {
                let host = &self.signers[index].name;
                match response {
                    Ok(SignResponse::Signature(signature)) => {
                        let address = &self.signers[index].address;
                        debug!(host = %host, address = %address, round, ?latency, "Signature received");
                        metrics::record_signer_latency(host, latency.as_secs_f64());
                        signatures.push(CollectedSignature {
                            host: host.clone(),
                            signature,
                            latency,
                        });
                    }
                    Ok(SignResponse::Rejected(e)) if e.code == SigErrorCode::TxCompleted => {
                        debug!(host = %host, round, "Signer reports transaction completed");
                        completed.insert(index);
                    }
                    Ok(SignResponse::Rejected(e)) if e.code.is_retryable() => {
                        debug!(host = %host, round, error = %e, "Signer not ready");
                        retry.push(index);
                    }
                    Ok(SignResponse::Rejected(e)) => {
                        warn!(host = %host, round, error = %e, "Signer refused, dropping host");
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(host = %host, round, error = %e, "Signer unreachable");
                        retry.push(index);
                    }
                    Err(e) => {
                        warn!(host = %host, round, error = %e, "Signer failed, dropping host");
                    }
                }
            }

            if completed.len() >= self.threshold {
                info!(chain = %self.chain, round, "Transaction already completed by signers");
                metrics::record_signature_outcome(self.chain, "completed");
                return Ok(CollectOutcome::AlreadyCompleted);
            }

            if signatures.len() >= self.threshold {
                signatures.sort_by_key(|s| s.latency);
                signatures.truncate(self.threshold);
                info!(chain = %self.chain, round, "Signature threshold reached");
                metrics::record_signature_outcome(self.chain, "signed");
                return Ok(CollectOutcome::Signatures(signatures));
            }

            if self.max_rounds.map_or(false, |max| round >= max) {
                metrics::record_signature_outcome(self.chain, "exhausted");
                return Err(RelayerError::RoundsExhausted {
                    chain: self.chain.to_string(),
                    rounds: round,
                });
            }

            if retry.is_empty() {
                // every remaining host refused; start over with those that have not answered yet
                let signed: HashSet<&str> = signatures.iter().map(|s| s.host.as_str()).collect();
                retry = (0..self.signers.len())
                    .filter(|i| {
                        !completed.contains(i) && !signed.contains(self.signers[*i].name.as_str())
                    })
                    .collect();
                warn!(
                    chain = %self.chain,
                    collected = signatures.len(),
                    threshold = self.threshold,
                    "No retryable signers left, restarting attempt"
                );
            }

            debug!(
                chain = %self.chain,
                round,
                collected = signatures.len(),
                retrying = retry.len(),
                "Signature round incomplete"
            );
            hosts = retry;
            self.clock.sleep(self.round_interval).await;
        }
    }

    /// Session the signers still consider pending for this chain
    ///
    /// Sessions whose collector signature does not verify are ignored. When
    /// hosts disagree the raw data reported by most hosts wins, ties going to
    /// the host configured first.
    pub async fn pending_session(&self) -> RelayerResult<Option<SigningSession>> {
        let responses = join_all(
            self.signers
                .iter()
                .map(|signer| signer.client.pending_tx(self.chain)),
        )
        .await;

        let mut votes: HashMap<String, (usize, usize, SigningSession)> = HashMap::new();
        for (index, response) in responses.into_iter().enumerate() {
            let host = &self.signers[index].name;
            let session = match response {
                Ok(Some(session)) => session,
                Ok(None) => continue,
                Err(e) => {
                    warn!(host = %host, error = %e, "pendingTx failed");
                    continue;
                }
            };

            if session.chain != self.chain {
                warn!(host = %host, chain = %session.chain, "Ignoring pending session for another chain");
                continue;
            }
            if let Err(e) = self.auth.verify(&session) {
                warn!(host = %host, error = %e, "Ignoring unauthenticated pending session");
                continue;
            }

            votes
                .entry(session.raw_data.clone())
                .and_modify(|(count, _, _)| *count += 1)
                .or_insert((1, index, session));
        }

        let winner = votes
            .into_values()
            .max_by(|(a_count, a_first, _), (b_count, b_first, _)| {
                a_count.cmp(b_count).then(b_first.cmp(a_first))
            })
            .map(|(count, _, session)| {
                info!(
                    chain = %self.chain,
                    raw_data = %session.raw_data,
                    hosts = count,
                    "Resuming pending session"
                );
                session
            });

        Ok(winner)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::multisig::auth::tests::{collector_auth, session, OTHER_KEY};
    use crate::multisig::client::MockSignerClient;
    use crate::multisig::SignerError;
    use crate::supervisor::tests::RecordingClock;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Answers `signTx` from a script of (delay, response) pairs; the last
    /// entry repeats
    pub(crate) struct ScriptedSigner {
        script: Mutex<VecDeque<(Duration, SignResponse)>>,
        pub calls: Mutex<Vec<SigningSession>>,
        pending: Mutex<Option<SigningSession>>,
    }

    impl ScriptedSigner {
        pub(crate) fn new(script: Vec<(u64, SignResponse)>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(
                    script
                        .into_iter()
                        .map(|(ms, r)| (Duration::from_millis(ms), r))
                        .collect(),
                ),
                calls: Mutex::new(Vec::new()),
                pending: Mutex::new(None),
            })
        }

        pub(crate) fn set_pending(&self, session: Option<SigningSession>) {
            *self.pending.lock().unwrap() = session;
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl SignerClient for ScriptedSigner {
        async fn sign_tx(&self, session: &SigningSession) -> RelayerResult<SignResponse> {
            self.calls.lock().unwrap().push(session.clone());
            let (delay, response) = {
                let mut script = self.script.lock().unwrap();
                if script.len() > 1 {
                    script.pop_front().unwrap()
                } else {
                    script.front().cloned().unwrap()
                }
            };
            tokio::time::sleep(delay).await;
            Ok(response)
        }

        async fn pending_tx(&self, _chain: ChainKind) -> RelayerResult<Option<SigningSession>> {
            Ok(self.pending.lock().unwrap().clone())
        }
    }

    pub(crate) fn sig(s: &str) -> SignResponse {
        SignResponse::Signature(s.into())
    }

    pub(crate) fn rejected(code: SigErrorCode) -> SignResponse {
        SignResponse::Rejected(SignerError::new(code, "scripted"))
    }

    pub(crate) fn endpoint(name: &str, client: Arc<dyn SignerClient>) -> SignerEndpoint {
        SignerEndpoint {
            name: name.into(),
            address: format!("0x{}", name),
            client,
        }
    }

    fn coordinator(signers: Vec<SignerEndpoint>, threshold: usize) -> MultisigCoordinator {
        MultisigCoordinator::new(
            ChainKind::Nervos,
            signers,
            threshold,
            Arc::new(collector_auth()),
            Duration::from_secs(3),
        )
    }

    fn payload() -> SigPayload {
        session("0x00").payload
    }

    fn hosts(outcome: CollectOutcome) -> Vec<String> {
        match outcome {
            CollectOutcome::Signatures(sigs) => sigs.into_iter().map(|s| s.host).collect(),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_of_three_returns_fastest() {
        let a = ScriptedSigner::new(vec![(50, sig("0xa"))]);
        let b = ScriptedSigner::new(vec![
            (10, rejected(SigErrorCode::TxUnconfirmed)),
            (100, sig("0xb")),
        ]);
        let c = ScriptedSigner::new(vec![(80, sig("0xc"))]);

        let coordinator = coordinator(
            vec![endpoint("a", a.clone()), endpoint("b", b.clone()), endpoint("c", c.clone())],
            2,
        );
        let outcome = coordinator.collect("0x01".into(), payload()).await.unwrap();

        assert_eq!(hosts(outcome), vec!["a", "c"]);
        let sent = &a.calls.lock().unwrap()[0];
        assert!(collector_auth().verify(sent).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_hosts_are_asked_again() {
        let a = ScriptedSigner::new(vec![(50, sig("0xa"))]);
        let b = ScriptedSigner::new(vec![
            (10, rejected(SigErrorCode::TxUnconfirmed)),
            (20, sig("0xb")),
        ]);
        let c = ScriptedSigner::new(vec![(80, sig("0xc"))]);

        let coordinator = coordinator(
            vec![endpoint("a", a.clone()), endpoint("b", b.clone()), endpoint("c", c.clone())],
            3,
        );
        let outcome = coordinator.collect("0x01".into(), payload()).await.unwrap();

        // collected signatures survive the retry round and are ordered by latency
        assert_eq!(hosts(outcome), vec!["b", "a", "c"]);
        assert_eq!(a.call_count(), 1);
        assert_eq!(b.call_count(), 2);
        assert_eq!(c.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_counter_is_independent() {
        let a = ScriptedSigner::new(vec![(10, sig("0xa"))]);
        let b = ScriptedSigner::new(vec![(10, rejected(SigErrorCode::TxCompleted))]);
        let c = ScriptedSigner::new(vec![(10, rejected(SigErrorCode::TxCompleted))]);

        let completed_elsewhere = coordinator(
            vec![endpoint("a", a), endpoint("b", b), endpoint("c", c)],
            2,
        );
        assert_eq!(
            completed_elsewhere.collect("0x01".into(), payload()).await.unwrap(),
            CollectOutcome::AlreadyCompleted
        );

        // one completion plus one signature is not a quorum of either
        let a = ScriptedSigner::new(vec![(10, sig("0xa"))]);
        let b = ScriptedSigner::new(vec![(10, rejected(SigErrorCode::TxCompleted))]);
        let c = ScriptedSigner::new(vec![(10, rejected(SigErrorCode::TxNotFound))]);
        let clock = Arc::new(RecordingClock::default());
        let mixed = coordinator(
            vec![endpoint("a", a.clone()), endpoint("b", b.clone()), endpoint("c", c.clone())],
            2,
        )
        .with_clock(clock.clone())
        .with_max_rounds(3);
        assert!(matches!(
            mixed.collect("0x01".into(), payload()).await,
            Err(RelayerError::RoundsExhausted { rounds: 3, .. })
        ));

        // only the host that was not found keeps being asked
        assert_eq!(a.call_count(), 1);
        assert_eq!(b.call_count(), 1);
        assert_eq!(c.call_count(), 3);
        assert_eq!(
            *clock.sleeps.lock().unwrap(),
            vec![Duration::from_secs(3), Duration::from_secs(3)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refusing_host_sits_out_the_attempt() {
        let a = ScriptedSigner::new(vec![(10, sig("0xa"))]);
        let b = ScriptedSigner::new(vec![(10, rejected(SigErrorCode::InvalidRecord))]);
        let c = ScriptedSigner::new(vec![(10, rejected(SigErrorCode::BlockSyncIncomplete))]);

        let coordinator = coordinator(
            vec![endpoint("a", a.clone()), endpoint("b", b.clone()), endpoint("c", c.clone())],
            2,
        )
        .with_max_rounds(4);
        assert!(coordinator.collect("0x01".into(), payload()).await.is_err());

        assert_eq!(a.call_count(), 1);
        assert_eq!(b.call_count(), 1);
        assert_eq!(c.call_count(), 4);
    }

    #[tokio::test]
    async fn test_pending_session_majority_and_trust() {
        let auth = collector_auth();
        let mut first = session("0x01");
        auth.sign(&mut first).unwrap();
        let mut second = session("0x02");
        auth.sign(&mut second).unwrap();
        let mut forged = session("0x03");
        CollectorAuth::new(Some(OTHER_KEY), &[])
            .unwrap()
            .sign(&mut forged)
            .unwrap();

        let signers: Vec<_> = [
            Some(second.clone()),
            Some(first.clone()),
            Some(first.clone()),
            Some(forged.clone()),
            Some(forged.clone()),
            Some(forged),
            None,
        ]
        .into_iter()
        .enumerate()
        .map(|(i, pending)| {
            let signer = ScriptedSigner::new(vec![(0, sig("0x"))]);
            signer.set_pending(pending);
            endpoint(&format!("h{}", i), signer)
        })
        .collect();

        let coordinator = coordinator(signers, 2);
        let resumed = coordinator.pending_session().await.unwrap().unwrap();
        assert_eq!(resumed.raw_data, "0x01");
    }

    #[tokio::test]
    async fn test_pending_session_tie_prefers_first_host() {
        let auth = collector_auth();
        let mut first = session("0x01");
        auth.sign(&mut first).unwrap();
        let mut second = session("0x02");
        auth.sign(&mut second).unwrap();

        let mut a = MockSignerClient::new();
        let reported = second.clone();
        a.expect_pending_tx()
            .returning(move |_| Ok(Some(reported.clone())));
        let mut b = MockSignerClient::new();
        let reported = first.clone();
        b.expect_pending_tx()
            .returning(move |_| Ok(Some(reported.clone())));
        let mut c = MockSignerClient::new();
        c.expect_pending_tx().returning(|_| {
            Err(RelayerError::SignerTransport {
                host: "c".into(),
                message: "down".into(),
            })
        });

        let coordinator = coordinator(
            vec![
                endpoint("a", Arc::new(a)),
                endpoint("b", Arc::new(b)),
                endpoint("c", Arc::new(c)),
            ],
            2,
        );
        let resumed = coordinator.pending_session().await.unwrap().unwrap();
        assert_eq!(resumed.raw_data, "0x02");
    }
}
