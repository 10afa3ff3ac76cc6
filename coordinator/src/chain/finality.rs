//! Confirmation depth tracking
//!
//! A chain fact is only acted upon once it is `confirmation_blocks` deep. The
//! permissioned ledger finalizes immediately (depth 0); public EVM chains need
//! a deeper margin.

use super::observer::{ChainObserver, ReceiptLookup};
use crate::error::{SwapError, SwapResult};

use ethers::types::H256;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Inclusion status of a submitted transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Included { block_number: u64, confirmations: u64 },
    Finalized { block_number: u64 },
    /// Mined but reverted by the contract
    Failed { block_number: u64 },
}

/// Tracks finality for transactions on a specific chain
pub struct FinalityTracker {
    chain_id: u64,
    confirmation_blocks: u64,
    observer: Arc<dyn ChainObserver>,
    /// Pending transactions: tx_hash -> block_number
    pending: RwLock<HashMap<H256, u64>>,
    /// Finalized transactions (cached to avoid re-checking)
    finalized: RwLock<HashSet<H256>>,
}

impl FinalityTracker {
    pub fn new(confirmation_blocks: u64, observer: Arc<dyn ChainObserver>) -> Self {
        Self {
            chain_id: observer.chain_id(),
            confirmation_blocks,
            observer,
            pending: RwLock::new(HashMap::new()),
            finalized: RwLock::new(HashSet::new()),
        }
    }

    pub fn confirmation_blocks(&self) -> u64 {
        self.confirmation_blocks
    }

    /// Highest block whose contents are final
    pub async fn finalized_height(&self) -> SwapResult<u64> {
        let latest = self.observer.latest_block_number().await?;
        Ok(latest.saturating_sub(self.confirmation_blocks))
    }

    /// Current inclusion status of `tx_hash`
    pub async fn status(&self, tx_hash: H256) -> SwapResult<TxStatus> {
        if self.finalized.read().await.contains(&tx_hash) {
            let block_number = self.pending.read().await.get(&tx_hash).copied().unwrap_or(0);
            return Ok(TxStatus::Finalized { block_number });
        }

        let receipt = match self.observer.get_receipt(tx_hash).await? {
            ReceiptLookup::Pending => return Ok(TxStatus::Pending),
            ReceiptLookup::Confirmed(receipt) => receipt,
        };

        let block_number = receipt
            .block_number
            .map(|b| b.as_u64())
            .ok_or_else(|| SwapError::not_found(format!("block of receipt {:?}", tx_hash)))?;

        if receipt.status != Some(1.into()) {
            return Ok(TxStatus::Failed { block_number });
        }

        let current_block = self.observer.latest_block_number().await?;
        let confirmations = current_block.saturating_sub(block_number);

        if confirmations >= self.confirmation_blocks {
            self.pending.write().await.insert(tx_hash, block_number);
            self.finalized.write().await.insert(tx_hash);
            info!(
                "Transaction {:?} finalized on chain {} ({} confirmations)",
                tx_hash, self.chain_id, confirmations
            );
            return Ok(TxStatus::Finalized { block_number });
        }

        self.pending.write().await.insert(tx_hash, block_number);
        debug!(
            "Transaction {:?} has {} / {} confirmations on chain {}",
            tx_hash, confirmations, self.confirmation_blocks, self.chain_id
        );
        Ok(TxStatus::Included {
            block_number,
            confirmations,
        })
    }

    /// Check if a transaction has reached finality
    pub async fn is_finalized(&self, tx_hash: H256) -> SwapResult<bool> {
        Ok(matches!(self.status(tx_hash).await?, TxStatus::Finalized { .. }))
    }

    /// Get pending transaction count
    pub async fn pending_count(&self) -> usize {
        let finalized = self.finalized.read().await;
        self.pending
            .read()
            .await
            .keys()
            .filter(|h| !finalized.contains(*h))
            .count()
    }

    /// Clear old cache entries (call periodically)
    pub async fn cleanup_cache(&self, max_entries: usize) {
        let mut finalized = self.finalized.write().await;
        if finalized.len() > max_entries {
            let to_remove: Vec<_> = finalized.iter().take(finalized.len() / 2).cloned().collect();
            let mut pending = self.pending.write().await;
            for k in to_remove {
                finalized.remove(&k);
                pending.remove(&k);
            }
        }
    }
}
