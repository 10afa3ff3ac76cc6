//! JSON-RPC chain observer with multi-endpoint failover

use super::observer::{BlockInfo, BlockRef, ChainObserver, ReceiptLookup};
use crate::config::ChainConfig;
use crate::error::{SwapError, SwapResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// QBFT validator query, answered by permissioned EVM clients
const VALIDATORS_BY_HASH: &str = "qbft_getValidatorsByBlockHash";

/// Multi-provider wrapper with failover.
///
/// A failed call is not retried here: the next endpoint is selected for the
/// following call and the failure is returned as `Unavailable`.
pub struct ChainProvider {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// Last known block number
    last_block: RwLock<u64>,
}

impl ChainProvider {
    /// Create a new chain provider
    pub async fn new(config: ChainConfig) -> SwapResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(SwapError::unavailable(config.chain_id, "No valid RPC providers"));
        }

        Self::verify_chain_id(&config, &http_providers).await?;

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
            last_block: RwLock::new(0),
        })
    }

    /// Require an endpoint to confirm the configured chain id. A node
    /// answering for another chain is a configuration error; if no node
    /// answers the chain is unavailable and the provider is not built.
    async fn verify_chain_id(config: &ChainConfig, providers: &[Provider<Http>]) -> SwapResult<()> {
        let expected = U256::from(config.chain_id);
        let mut last_error = None;

        for provider in providers {
            match provider.get_chainid().await {
                Ok(id) if id == expected => {
                    info!("Connected to chain {} ({})", config.name, config.chain_id);
                    return Ok(());
                }
                Ok(id) => {
                    return Err(SwapError::Config(format!(
                        "Chain {} endpoint reports chain id {}",
                        config.chain_id, id
                    )))
                }
                Err(e) => {
                    warn!("Could not verify chain id for chain {}: {}", config.chain_id, e);
                    last_error = Some(e.to_string());
                }
            }
        }

        Err(SwapError::unavailable(
            config.chain_id,
            format!(
                "no endpoint confirmed chain id: {}",
                last_error.unwrap_or_else(|| "no endpoints".to_string())
            ),
        ))
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        if self.http_providers.len() > 1 {
            warn!("Chain {} failover to provider {}", self.config.chain_id, next);
        }
    }

    /// Last block number returned by the node
    pub async fn last_seen_block(&self) -> u64 {
        *self.last_block.read().await
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.latest_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.chain_id, e);
                false
            }
        }
    }

    fn unavailable(&self, e: impl std::fmt::Display) -> SwapError {
        self.failover();
        SwapError::unavailable(self.config.chain_id, e)
    }

    fn block_id(block: BlockRef) -> BlockId {
        match block {
            BlockRef::Latest => BlockId::Number(BlockNumber::Latest),
            BlockRef::Number(n) => BlockId::Number(BlockNumber::Number(n.into())),
            BlockRef::Hash(h) => BlockId::Hash(h),
        }
    }

    fn summarize<TX>(&self, block: &Block<TX>, requested: BlockRef) -> SwapResult<BlockInfo> {
        let (number, hash) = match (block.number, block.hash) {
            (Some(number), Some(hash)) => (number.as_u64(), hash),
            // pending blocks carry no number/hash yet
            _ => return Err(SwapError::not_found(format!("block {}", requested))),
        };

        Ok(BlockInfo {
            number,
            hash,
            parent_hash: block.parent_hash,
            timestamp: block.timestamp.low_u64(),
            ..Default::default()
        })
    }
}

#[async_trait]
impl ChainObserver for ChainProvider {
    /// Confirmed by a node when the provider was built
    fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    async fn latest_block_number(&self) -> SwapResult<u64> {
        let block = self
            .http()
            .get_block_number()
            .await
            .map_err(|e| self.unavailable(e))?
            .as_u64();
        *self.last_block.write().await = block;
        crate::metrics::record_block_height(self.config.chain_id, block);
        Ok(block)
    }

    async fn get_block(&self, block: BlockRef, with_transactions: bool) -> SwapResult<BlockInfo> {
        let id = Self::block_id(block);

        if with_transactions {
            let full = self
                .http()
                .get_block_with_txs(id)
                .await
                .map_err(|e| self.unavailable(e))?
                .ok_or_else(|| SwapError::not_found(format!("block {}", block)))?;
            let mut info = self.summarize(&full, block)?;
            info.transaction_hashes = full.transactions.iter().map(|tx| tx.hash).collect();
            info.transactions = full.transactions;
            Ok(info)
        } else {
            let header = self
                .http()
                .get_block(id)
                .await
                .map_err(|e| self.unavailable(e))?
                .ok_or_else(|| SwapError::not_found(format!("block {}", block)))?;
            let mut info = self.summarize(&header, block)?;
            info.transaction_hashes = header.transactions;
            Ok(info)
        }
    }

    async fn get_transaction(&self, hash: H256) -> SwapResult<Transaction> {
        self.http()
            .get_transaction(hash)
            .await
            .map_err(|e| self.unavailable(e))?
            .ok_or_else(|| SwapError::not_found(format!("transaction {:?}", hash)))
    }

    async fn get_receipt(&self, hash: H256) -> SwapResult<ReceiptLookup> {
        let receipt = self
            .http()
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| self.unavailable(e))?;

        match receipt {
            Some(receipt) if receipt.block_number.is_some() => Ok(ReceiptLookup::Confirmed(receipt)),
            // no receipt yet: distinguish a queued transaction from an unknown one
            _ => {
                self.get_transaction(hash).await?;
                Ok(ReceiptLookup::Pending)
            }
        }
    }

    async fn get_logs(&self, address: Address, from_block: u64, to_block: u64) -> SwapResult<Vec<Log>> {
        let filter = Filter::new()
            .address(address)
            .from_block(from_block)
            .to_block(to_block);

        self.http()
            .get_logs(&filter)
            .await
            .map_err(|e| self.unavailable(e))
    }

    async fn get_block_receipts(&self, block_number: u64) -> SwapResult<Vec<TransactionReceipt>> {
        self.http()
            .get_block_receipts(block_number)
            .await
            .map_err(|e| self.unavailable(e))
    }

    async fn get_validators(&self, block: &BlockInfo) -> SwapResult<BTreeMap<Address, u64>> {
        let validators: Vec<Address> = self
            .http()
            .request(VALIDATORS_BY_HASH, [block.hash])
            .await
            .map_err(|e| self.unavailable(e))?;

        // QBFT validators carry equal voting weight
        Ok(validators.into_iter().map(|v| (v, 1)).collect())
    }
}
