//! Collector authentication and signer keys
//!
//! A collector signs every session it sends out: the session is serialized
//! with `collector_sig` blank, hashed with keccak256 and signed with the
//! collector's secp256k1 key. Signers and reconciling collectors recover the
//! signing address and accept the session only if that address is in the
//! configured trust set.

use super::SigningSession;
use crate::error::{RelayerError, RelayerResult};

use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Signature, H256};
use sha3::{Digest, Keccak256};
use std::collections::HashSet;

/// keccak256 of the session with its collector signature blanked
pub fn session_digest(session: &SigningSession) -> RelayerResult<H256> {
    let mut unsigned = session.clone();
    unsigned.collector_sig = String::new();
    let bytes = serde_json::to_vec(&unsigned)?;
    Ok(H256::from_slice(&Keccak256::digest(&bytes)))
}

fn parse_wallet(private_key: &str) -> RelayerResult<LocalWallet> {
    private_key
        .trim_start_matches("0x")
        .parse::<LocalWallet>()
        .map_err(|e| RelayerError::Wallet(format!("Invalid private key: {}", e)))
}

fn encode_signature(signature: &Signature) -> String {
    format!("0x{}", hex::encode(signature.to_vec()))
}

fn key_hash(address: &Address) -> String {
    format!("{:?}", address)
}

/// Signs outgoing sessions and checks incoming ones against the trust set
pub struct CollectorAuth {
    wallet: Option<LocalWallet>,
    trusted: HashSet<String>,
}

impl CollectorAuth {
    /// `private_key` is only needed to sign; verifying needs the trust set
    pub fn new(private_key: Option<&str>, trusted: &[String]) -> RelayerResult<Self> {
        let wallet = private_key.map(parse_wallet).transpose()?;
        Ok(Self {
            wallet,
            trusted: trusted.iter().map(|h| h.to_lowercase()).collect(),
        })
    }

    /// Also trust sessions signed with our own key
    pub fn with_self_trusted(mut self) -> Self {
        if let Some(address) = self.address() {
            self.trusted.insert(key_hash(&address));
        }
        self
    }

    pub fn address(&self) -> Option<Address> {
        self.wallet.as_ref().map(|w| w.address())
    }

    /// Fill in `collector_sig`
    pub fn sign(&self, session: &mut SigningSession) -> RelayerResult<()> {
        let wallet = self
            .wallet
            .as_ref()
            .ok_or_else(|| RelayerError::Wallet("no collector key configured".into()))?;
        let digest = session_digest(session)?;
        let signature = wallet
            .sign_hash(digest)
            .map_err(|e| RelayerError::Wallet(e.to_string()))?;
        session.collector_sig = encode_signature(&signature);
        Ok(())
    }

    /// Recover the collector address and require it to be trusted
    pub fn verify(&self, session: &SigningSession) -> RelayerResult<Address> {
        if session.collector_sig.is_empty() {
            return Err(RelayerError::Unauthorized("missing collector signature".into()));
        }
        let signature: Signature = session
            .collector_sig
            .parse()
            .map_err(|e| RelayerError::Unauthorized(format!("malformed signature: {}", e)))?;
        let digest = session_digest(session)?;
        let signer = signature
            .recover(digest)
            .map_err(|e| RelayerError::Unauthorized(e.to_string()))?;

        if !self.trusted.contains(&key_hash(&signer)) {
            return Err(RelayerError::Unauthorized(format!(
                "collector {} is not trusted",
                key_hash(&signer)
            )));
        }
        Ok(signer)
    }
}

/// A signer's own key, used to authorize destination transactions
pub struct SignerKey {
    wallet: LocalWallet,
}

impl SignerKey {
    pub fn from_private_key(private_key: &str) -> RelayerResult<Self> {
        Ok(Self {
            wallet: parse_wallet(private_key)?,
        })
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    /// Sign a 0x-prefixed 32 byte digest
    pub fn sign_digest(&self, raw_data: &str) -> RelayerResult<String> {
        let bytes = hex::decode(raw_data.trim_start_matches("0x"))
            .map_err(|e| RelayerError::Wallet(format!("raw data is not hex: {}", e)))?;
        if bytes.len() != 32 {
            return Err(RelayerError::Wallet(format!(
                "raw data must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let signature = self
            .wallet
            .sign_hash(H256::from_slice(&bytes))
            .map_err(|e| RelayerError::Wallet(e.to_string()))?;
        Ok(encode_signature(&signature))
    }
}
