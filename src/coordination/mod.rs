//! Destination execution for the collector role
//!
//! The collector:
//! 1. Picks up confirmed transfers queued as destination actions
//! 2. Batches them per destination chain
//! 3. Builds the transaction and collects M-of-N signatures
//! 4. Broadcasts and waits for the commit

pub mod batch;
pub mod builder;
pub mod engine;

pub use batch::BatchPolicy;
pub use builder::{BuildRequest, BuiltTx, TxBuilder};
pub use engine::ActionExecutor;
