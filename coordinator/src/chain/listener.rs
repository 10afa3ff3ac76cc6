//! Escrow event watcher with HTTP polling
//!
//! The watcher only announces finalized escrow events. It is a wake-up
//! signal for the coordinator, which re-derives every leg from its own log
//! queries, so a missed or duplicated notification never changes an outcome.

use super::finality::FinalityTracker;
use super::observer::ChainObserver;
use crate::error::SwapResult;
use crate::events::{EscrowEvent, EventParser};
use crate::state::SwapStore;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

/// Polls one chain's escrow contract for finalized events
pub struct EscrowWatcher {
    chain_id: u64,
    observer: Arc<dyn ChainObserver>,
    finality: Arc<FinalityTracker>,
    parser: EventParser,
    /// Event broadcast channel
    event_tx: broadcast::Sender<EscrowEvent>,
    /// Store for checkpoint persistence
    store: Arc<dyn SwapStore>,
    /// Last processed block
    last_processed_block: RwLock<u64>,
    batch_size: u64,
    poll_interval: Duration,
}

impl EscrowWatcher {
    pub async fn new(
        observer: Arc<dyn ChainObserver>,
        finality: Arc<FinalityTracker>,
        parser: EventParser,
        event_tx: broadcast::Sender<EscrowEvent>,
        store: Arc<dyn SwapStore>,
        batch_size: u64,
        poll_interval: Duration,
    ) -> SwapResult<Self> {
        let chain_id = observer.chain_id();

        // Resume from the last checkpoint, or from the current head on first start
        let last_block = match store.get_checkpoint(chain_id).await? {
            Some(block) => block,
            None => match finality.finalized_height().await {
                Ok(height) => height,
                Err(e) => {
                    warn!("Chain {}: no checkpoint and head unknown ({}), starting at genesis", chain_id, e);
                    0
                }
            },
        };

        info!("Escrow watcher for chain {} starting after block {}", chain_id, last_block);

        Ok(Self {
            chain_id,
            observer,
            finality,
            parser,
            event_tx,
            store,
            last_processed_block: RwLock::new(last_block),
            batch_size: batch_size.max(1),
            poll_interval,
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub async fn last_processed_block(&self) -> u64 {
        *self.last_processed_block.read().await
    }

    /// Main polling loop. Errors are logged and the range retried.
    pub async fn listen(&self) -> SwapResult<()> {
        loop {
            match self.poll_once().await {
                Ok(0) => {}
                Ok(n) => debug!("Chain {}: announced {} escrow events", self.chain_id, n),
                Err(e) => warn!("Chain {}: escrow poll failed: {}", self.chain_id, e),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Process the next finalized block range, returning the number of
    /// events announced
    pub async fn poll_once(&self) -> SwapResult<usize> {
        let finalized = self.finality.finalized_height().await?;
        let last_block = *self.last_processed_block.read().await;

        if finalized <= last_block {
            return Ok(0);
        }

        // Calculate block range (limit to prevent huge queries)
        let from_block = last_block + 1;
        let to_block = std::cmp::min(finalized, from_block + self.batch_size - 1);

        debug!(
            "Chain {}: scanning blocks {} to {}",
            self.chain_id, from_block, to_block
        );

        let logs = self
            .observer
            .get_logs(self.parser.contract_address(), from_block, to_block)
            .await?;
        let events = self.parser.parse_logs(&logs)?;

        for event in &events {
            crate::metrics::record_event(self.chain_id, event.name());
            // No receivers is fine
            let _ = self.event_tx.send(event.clone());
        }

        *self.last_processed_block.write().await = to_block;
        if let Err(e) = self.store.save_checkpoint(self.chain_id, to_block).await {
            warn!("Failed to save checkpoint: {}", e);
        }

        Ok(events.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::memory::InMemoryChain;
    use crate::escrow::{EscrowExecutor, Secret};
    use crate::state::MemorySwapStore;
    use ethers::types::{Address, H256};

    fn escrow() -> Address {
        Address::repeat_byte(0xee)
    }

    async fn watcher(
        chain: Arc<InMemoryChain>,
        store: Arc<MemorySwapStore>,
        depth: u64,
        batch: u64,
    ) -> (EscrowWatcher, broadcast::Receiver<EscrowEvent>) {
        let (tx, rx) = broadcast::channel(64);
        let finality = Arc::new(FinalityTracker::new(depth, chain.clone()));
        let watcher = EscrowWatcher::new(
            chain,
            finality,
            EventParser::for_address(1337, escrow()),
            tx,
            store,
            batch,
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        (watcher, rx)
    }

    #[tokio::test]
    async fn test_announces_only_final_events() {
        let chain = Arc::new(InMemoryChain::new(1337, escrow()));
        let store = Arc::new(MemorySwapStore::new());
        let (watcher, mut rx) = watcher(chain.clone(), store.clone(), 2, 100).await;

        let leg = H256::repeat_byte(1);
        chain
            .submit_lock(Address::repeat_byte(1), leg, Secret::generate().hash(), 50, Address::repeat_byte(2))
            .await
            .unwrap();

        // mined at block 1, final at block 3
        assert_eq!(watcher.poll_once().await.unwrap(), 0);
        chain.advance_to(3).await;
        assert_eq!(watcher.poll_once().await.unwrap(), 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.leg_id, leg);
        assert_eq!(event.block_number, 1);
        assert_eq!(store.get_checkpoint(1337).await.unwrap(), Some(1));

        // nothing is announced twice
        chain.advance_to(10).await;
        assert_eq!(watcher.poll_once().await.unwrap(), 0);
        assert_eq!(watcher.last_processed_block().await, 8);
    }

    #[tokio::test]
    async fn test_resumes_from_checkpoint_in_batches() {
        let chain = Arc::new(InMemoryChain::new(1337, escrow()));
        chain.advance_to(30).await;
        let store = Arc::new(MemorySwapStore::new());
        store.save_checkpoint(1337, 5).await.unwrap();

        let (watcher, _rx) = watcher(chain, store.clone(), 0, 10).await;
        watcher.poll_once().await.unwrap();
        assert_eq!(watcher.last_processed_block().await, 15);
        watcher.poll_once().await.unwrap();
        watcher.poll_once().await.unwrap();
        assert_eq!(store.get_checkpoint(1337).await.unwrap(), Some(30));
    }

    #[tokio::test]
    async fn test_outage_keeps_position() {
        let chain = Arc::new(InMemoryChain::new(1337, escrow()));
        let store = Arc::new(MemorySwapStore::new());
        let (watcher, _rx) = watcher(chain.clone(), store, 0, 10).await;

        chain.advance_to(4).await;
        chain.set_available(false).await;
        assert!(watcher.poll_once().await.unwrap_err().is_retryable());
        assert_eq!(watcher.last_processed_block().await, 0);

        chain.set_available(true).await;
        watcher.poll_once().await.unwrap();
        assert_eq!(watcher.last_processed_block().await, 4);
    }
}
