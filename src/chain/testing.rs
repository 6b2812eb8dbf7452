//! Scripted in-memory chain for tests

use super::*;

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Default)]
struct State {
    tip: u64,
    blocks: BTreeMap<u64, (BlockHeader, Vec<ChainEvent>)>,
    broadcasts: Vec<SignedTx>,
    statuses: HashMap<String, TxStatus>,
    failing_broadcasts: usize,
}

/// A linear chain whose blocks can be extended or replaced by a fork
pub struct FakeChain {
    chain: ChainKind,
    state: Mutex<State>,
}

pub fn block_hash(branch: &str, height: u64) -> String {
    format!("0x{}{}", branch, height)
}

impl FakeChain {
    /// Blocks `0..=tip` on branch `a`
    pub fn new(chain: ChainKind, tip: u64) -> Self {
        let fake = Self {
            chain,
            state: Mutex::new(State::default()),
        };
        fake.extend("a", tip);
        fake
    }

    /// Mine empty blocks on `branch` up to `tip`
    pub fn extend(&self, branch: &str, tip: u64) {
        let mut state = self.state.lock().unwrap();
        let start = state.blocks.keys().next_back().map_or(0, |h| h + 1);
        for height in start..=tip {
            let parent_hash = match height.checked_sub(1) {
                Some(parent) => state.blocks[&parent].0.hash.clone(),
                None => String::new(),
            };
            let header = BlockHeader {
                number: height,
                hash: block_hash(branch, height),
                parent_hash,
            };
            state.blocks.insert(height, (header, Vec::new()));
        }
        state.tip = tip;
    }

    /// Drop every block from `height` on and mine `branch` up to `tip`
    pub fn fork(&self, height: u64, branch: &str, tip: u64) {
        self.state.lock().unwrap().blocks.split_off(&height);
        self.extend(branch, tip);
    }

    /// Attach an event to an existing block, filling in block coordinates
    pub fn add_event(&self, mut event: ChainEvent) {
        let mut state = self.state.lock().unwrap();
        let (header, events) = state
            .blocks
            .get_mut(&event.block_number)
            .expect("block exists");
        event.block_hash = header.hash.clone();
        events.push(event);
    }

    pub fn set_status(&self, tx_hash: &str, status: TxStatus) {
        self.state
            .lock()
            .unwrap()
            .statuses
            .insert(tx_hash.to_string(), status);
    }

    /// The next `count` broadcasts fail with a transient RPC error
    pub fn fail_broadcasts(&self, count: usize) {
        self.state.lock().unwrap().failing_broadcasts = count;
    }

    pub fn broadcasts(&self) -> Vec<SignedTx> {
        self.state.lock().unwrap().broadcasts.clone()
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    fn chain(&self) -> ChainKind {
        self.chain
    }

    async fn tip_height(&self) -> RelayerResult<u64> {
        Ok(self.state.lock().unwrap().tip)
    }

    async fn get_block(&self, height: u64) -> RelayerResult<Option<BlockHeader>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .blocks
            .get(&height)
            .filter(|_| height <= state.tip)
            .map(|(header, _)| header.clone()))
    }

    async fn get_events(&self, from: u64, to: u64) -> RelayerResult<Vec<ChainEvent>> {
        let state = self.state.lock().unwrap();
        let to = to.min(state.tip);
        if from > to {
            return Ok(Vec::new());
        }
        Ok(state
            .blocks
            .range(from..=to)
            .flat_map(|(_, (_, events))| events.clone())
            .collect())
    }

    async fn broadcast(&self, tx: &SignedTx) -> RelayerResult<String> {
        let mut state = self.state.lock().unwrap();
        if state.failing_broadcasts > 0 {
            state.failing_broadcasts -= 1;
            return Err(RelayerError::chain_rpc(self.chain, "timeout"));
        }
        state.broadcasts.push(tx.clone());
        Ok(format!("0xtx{}", state.broadcasts.len()))
    }

    async fn get_status(&self, tx_hash: &str) -> RelayerResult<TxStatus> {
        let state = self.state.lock().unwrap();
        Ok(state
            .statuses
            .get(tx_hash)
            .cloned()
            .unwrap_or(TxStatus::Pending))
    }
}
