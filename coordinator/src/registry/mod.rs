//! Validator-set snapshots anchored to block references
//!
//! A `ValidatorSet` is the quorum of keys a chain considered authoritative at
//! one specific block. Snapshots are immutable and shared as `Arc`s; a later
//! block yields a new snapshot, never an update of an old one. Lookups for a
//! block the chain does not know fail with `UnknownBlock` instead of falling
//! back to another block.

use crate::chain::observer::{BlockRef, ChainObserver};
use crate::error::{SwapError, SwapResult};

use dashmap::DashMap;
use ethers::types::{Address, H256};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Keep at most this many snapshots per chain
const MAX_SNAPSHOTS: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidatorSet {
    pub chain_id: u64,
    pub block_number: u64,
    pub block_hash: H256,
    pub weights: BTreeMap<Address, u64>,
}

impl ValidatorSet {
    pub fn total_weight(&self) -> u64 {
        self.weights.values().fold(0u64, |acc, w| acc.saturating_add(*w))
    }

    /// Zero for keys outside the set
    pub fn weight_of(&self, key: &Address) -> u64 {
        self.weights.get(key).copied().unwrap_or(0)
    }

    pub fn contains(&self, key: &Address) -> bool {
        self.weight_of(key) > 0
    }

    /// Byzantine quorum: strictly more than two thirds of the total weight
    pub fn quorum_weight(&self) -> u64 {
        let total = self.total_weight();
        total / 3 * 2 + total % 3 * 2 / 3 + 1
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

/// Read-through cache of validator sets for one chain
pub struct ValidatorRegistry {
    observer: Arc<dyn ChainObserver>,
    snapshots: DashMap<H256, Arc<ValidatorSet>>,
}

impl ValidatorRegistry {
    pub fn new(observer: Arc<dyn ChainObserver>) -> Self {
        Self {
            observer,
            snapshots: DashMap::new(),
        }
    }

    /// Chain id reported by the underlying observer
    pub fn chain_id(&self) -> u64 {
        self.observer.chain_id()
    }

    /// Validator set in force at `block`; `None` means the latest block
    pub async fn get_validator_set(&self, block: Option<BlockRef>) -> SwapResult<Arc<ValidatorSet>> {
        let block = block.unwrap_or(BlockRef::Latest);

        if let BlockRef::Hash(hash) = block {
            if let Some(snapshot) = self.snapshots.get(&hash) {
                return Ok(snapshot.clone());
            }
        }

        let info = match self.observer.get_block(block, false).await {
            Ok(info) => info,
            Err(SwapError::NotFound { .. }) => {
                return Err(SwapError::UnknownBlock {
                    chain_id: self.chain_id(),
                    block: block.to_string(),
                })
            }
            Err(e) => return Err(e),
        };

        if let Some(snapshot) = self.snapshots.get(&info.hash) {
            return Ok(snapshot.clone());
        }

        let weights = self.observer.get_validators(&info).await?;
        let snapshot = Arc::new(ValidatorSet {
            chain_id: self.chain_id(),
            block_number: info.number,
            block_hash: info.hash,
            weights,
        });

        debug!(
            "Chain {}: {} validators at block {}",
            snapshot.chain_id,
            snapshot.len(),
            snapshot.block_number
        );

        self.evict();
        self.snapshots.insert(info.hash, snapshot.clone());
        Ok(snapshot)
    }

    /// Whether `key` carries weight in the set in force at `block`
    pub async fn is_authorized(&self, block: Option<BlockRef>, key: Address) -> SwapResult<bool> {
        Ok(self.get_validator_set(block).await?.contains(&key))
    }

    pub fn cached_snapshots(&self) -> usize {
        self.snapshots.len()
    }

    // Drop the oldest half once the cache is full
    fn evict(&self) {
        if self.snapshots.len() < MAX_SNAPSHOTS {
            return;
        }
        let mut heights: Vec<(u64, H256)> = self
            .snapshots
            .iter()
            .map(|e| (e.value().block_number, *e.key()))
            .collect();
        heights.sort();
        for (_, hash) in heights.into_iter().take(MAX_SNAPSHOTS / 2) {
            self.snapshots.remove(&hash);
        }
    }
}
