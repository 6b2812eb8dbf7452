//! Error types for the bridge relayer

use thiserror::Error;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain RPC error on {chain}: {message}")]
    ChainRpc { chain: String, message: String },

    #[error("Signer transport error for {host}: {message}")]
    SignerTransport { host: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Signature verification failed: {0}")]
    Unauthorized(String),

    #[error("Block {height} not found on {chain}")]
    BlockNotFound { chain: String, height: u64 },

    #[error("Transfer {unique_id} not found")]
    TransferNotFound { unique_id: String },

    #[error("Invalid state transition for {unique_id} from {from} to {to}")]
    InvalidStateTransition {
        unique_id: String,
        from: String,
        to: String,
    },

    #[error("Transaction build error: {0}")]
    TxBuild(String),

    #[error("Signature collection for {chain} gave up after {rounds} rounds")]
    RoundsExhausted { chain: String, rounds: u32 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    /// Check if error is a transient infrastructure failure
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayerError::ChainRpc { .. }
                | RelayerError::SignerTransport { .. }
                | RelayerError::BlockNotFound { .. }
                | RelayerError::Database(_)
        )
    }

    pub fn chain_rpc(chain: impl ToString, message: impl ToString) -> Self {
        RelayerError::ChainRpc {
            chain: chain.to_string(),
            message: message.to_string(),
        }
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(RelayerError::chain_rpc("ethereum", "timeout").is_retryable());
        assert!(RelayerError::BlockNotFound {
            chain: "nervos".into(),
            height: 7
        }
        .is_retryable());
        assert!(!RelayerError::Unauthorized("bad sig".into()).is_retryable());
        assert!(!RelayerError::Config("missing".into()).is_retryable());
    }
}
