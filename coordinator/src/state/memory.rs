//! In-process swap store

use super::SwapStore;
use crate::error::SwapResult;
use crate::escrow::Secret;
use crate::swap::{SwapId, SwapInstance};

use async_trait::async_trait;
use dashmap::DashMap;

/// Swap store that lives as long as the process. Used by the `memory`
/// backend and by tests; clones of a shared `Arc` survive a coordinator
/// restart within the same process.
#[derive(Default)]
pub struct MemorySwapStore {
    swaps: DashMap<SwapId, SwapInstance>,
    preimages: DashMap<SwapId, Secret>,
    checkpoints: DashMap<u64, u64>,
}

impl MemorySwapStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn swap_count(&self) -> usize {
        self.swaps.len()
    }
}

#[async_trait]
impl SwapStore for MemorySwapStore {
    async fn save_swap(&self, swap: &SwapInstance) -> SwapResult<()> {
        self.swaps.insert(swap.swap_id, swap.clone());
        Ok(())
    }

    async fn load_swap(&self, swap_id: SwapId) -> SwapResult<Option<SwapInstance>> {
        Ok(self.swaps.get(&swap_id).map(|s| s.clone()))
    }

    async fn load_active(&self) -> SwapResult<Vec<SwapInstance>> {
        let mut active: Vec<SwapInstance> = self
            .swaps
            .iter()
            .filter(|s| !s.status.is_terminal())
            .map(|s| s.clone())
            .collect();
        active.sort_by_key(|s| s.created_at);
        Ok(active)
    }

    async fn delete_swap(&self, swap_id: SwapId) -> SwapResult<()> {
        self.preimages.remove(&swap_id);
        self.swaps.remove(&swap_id);
        Ok(())
    }

    async fn save_preimage(&self, swap_id: SwapId, secret: &Secret) -> SwapResult<()> {
        self.preimages.entry(swap_id).or_insert(*secret);
        Ok(())
    }

    async fn load_preimage(&self, swap_id: SwapId) -> SwapResult<Option<Secret>> {
        Ok(self.preimages.get(&swap_id).map(|s| *s))
    }

    async fn save_checkpoint(&self, chain_id: u64, block_number: u64) -> SwapResult<()> {
        self.checkpoints.insert(chain_id, block_number);
        Ok(())
    }

    async fn get_checkpoint(&self, chain_id: u64) -> SwapResult<Option<u64>> {
        Ok(self.checkpoints.get(&chain_id).map(|b| *b))
    }

    async fn health_check(&self) -> SwapResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_preimage_is_write_once() {
        let store = MemorySwapStore::new();
        let id = SwapId::new_v4();
        let first = Secret::generate();

        store.save_preimage(id, &first).await.unwrap();
        store.save_preimage(id, &Secret::generate()).await.unwrap();
        assert_eq!(store.load_preimage(id).await.unwrap(), Some(first));

        store.delete_swap(id).await.unwrap();
        assert_eq!(store.load_preimage(id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_checkpoints() {
        let store = MemorySwapStore::new();
        assert_eq!(store.get_checkpoint(1).await.unwrap(), None);
        store.save_checkpoint(1, 42).await.unwrap();
        store.save_checkpoint(1, 43).await.unwrap();
        assert_eq!(store.get_checkpoint(1).await.unwrap(), Some(43));
    }
}
