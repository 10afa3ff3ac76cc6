//! Read-only view of a remote chain
//!
//! Every chain fact the coordinator acts on is obtained through this trait and
//! can be re-queried at any time. Implementations do not retry: a transport
//! failure surfaces as `SwapError::Unavailable` and an absent object as
//! `SwapError::NotFound`, so staleness stays visible to the caller.

use crate::error::SwapResult;

use async_trait::async_trait;
use ethers::types::{Address, Log, Transaction, TransactionReceipt, H256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Block reference by height, hash, or the current head
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockRef {
    Latest,
    Number(u64),
    Hash(H256),
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockRef::Latest => f.write_str("latest"),
            BlockRef::Number(n) => write!(f, "#{}", n),
            BlockRef::Hash(h) => write!(f, "{:?}", h),
        }
    }
}

/// Block header summary, with full transactions when requested
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockInfo {
    pub number: u64,
    pub hash: H256,
    pub parent_hash: H256,
    pub timestamp: u64,
    pub transaction_hashes: Vec<H256>,
    /// Empty unless the block was fetched with transactions
    pub transactions: Vec<Transaction>,
}

/// Outcome of a receipt query for a known transaction
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiptLookup {
    Confirmed(TransactionReceipt),
    /// Known to the node but not yet included in a block
    Pending,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainObserver: Send + Sync {
    fn chain_id(&self) -> u64;

    async fn latest_block_number(&self) -> SwapResult<u64>;

    async fn get_block(&self, block: BlockRef, with_transactions: bool) -> SwapResult<BlockInfo>;

    async fn get_transaction(&self, hash: H256) -> SwapResult<Transaction>;

    async fn get_receipt(&self, hash: H256) -> SwapResult<ReceiptLookup>;

    /// Logs emitted by `address` in `[from_block, to_block]`. Re-querying the
    /// same range returns the same logs.
    async fn get_logs(&self, address: Address, from_block: u64, to_block: u64) -> SwapResult<Vec<Log>>;

    async fn get_block_receipts(&self, block_number: u64) -> SwapResult<Vec<TransactionReceipt>>;

    /// Validator weights in force at `block`
    async fn get_validators(&self, block: &BlockInfo) -> SwapResult<BTreeMap<Address, u64>>;
}
