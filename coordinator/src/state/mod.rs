//! Durable swap state
//!
//! Handles:
//! - Swap records, written after every transition
//! - The local pre-image vault (never shared with the counterparty)
//! - Block checkpoints for the escrow watchers

mod manager;
mod memory;

pub use manager::PgSwapStore;
pub use memory::MemorySwapStore;

use crate::config::{DatabaseConfig, StorageBackend};
use crate::error::SwapResult;
use crate::escrow::Secret;
use crate::swap::{SwapId, SwapInstance};

use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait SwapStore: Send + Sync {
    async fn save_swap(&self, swap: &SwapInstance) -> SwapResult<()>;

    async fn load_swap(&self, swap_id: SwapId) -> SwapResult<Option<SwapInstance>>;

    /// Swaps that have not reached a terminal status
    async fn load_active(&self) -> SwapResult<Vec<SwapInstance>>;

    /// Remove a finished swap together with its pre-image
    async fn delete_swap(&self, swap_id: SwapId) -> SwapResult<()>;

    async fn save_preimage(&self, swap_id: SwapId, secret: &Secret) -> SwapResult<()>;

    async fn load_preimage(&self, swap_id: SwapId) -> SwapResult<Option<Secret>>;

    async fn save_checkpoint(&self, chain_id: u64, block_number: u64) -> SwapResult<()>;

    async fn get_checkpoint(&self, chain_id: u64) -> SwapResult<Option<u64>>;

    async fn health_check(&self) -> SwapResult<()>;
}

/// Open the configured store, running migrations for Postgres
pub async fn open(config: &DatabaseConfig) -> SwapResult<Arc<dyn SwapStore>> {
    match config.backend {
        StorageBackend::Postgres => {
            let store = PgSwapStore::new(config).await?;
            store.run_migrations().await?;
            Ok(Arc::new(store))
        }
        StorageBackend::Memory => Ok(Arc::new(MemorySwapStore::new())),
    }
}
