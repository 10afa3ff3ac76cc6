//! Chain module - connections to the ledgers hosting the escrows
//!
//! This module provides:
//! - The read-only `ChainObserver` interface and its JSON-RPC and in-process implementations
//! - Confirmation depth tracking
//! - Escrow event watchers that wake the coordinator
//! - Per-chain handles bundling observer, executor, validator registry and identity

pub mod finality;
pub mod listener;
pub mod memory;
pub mod observer;
pub mod provider;

pub use finality::{FinalityTracker, TxStatus};
pub use listener::EscrowWatcher;
pub use memory::InMemoryChain;
pub use observer::{BlockInfo, BlockRef, ChainObserver, ReceiptLookup};
pub use provider::ChainProvider;

use crate::config::{ChainBackend, ChainConfig, CoordinatorConfig, Settings};
use crate::error::{SwapError, SwapResult};
use crate::escrow::{EscrowExecutor, EvmEscrowExecutor};
use crate::events::{EscrowEvent, EventParser};
use crate::identity::{Deployment, IdentityAuthorizer, RemoteIdentity};
use crate::registry::ValidatorRegistry;
use crate::state::SwapStore;
use crate::swap::Backoff;

use dashmap::DashMap;
use ethers::signers::LocalWallet;
use ethers::types::Address;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info, warn};

/// Connection attempts per chain at startup
const CONNECT_ATTEMPTS: u32 = 5;

/// Everything the coordinator needs to act on one chain
pub struct ChainHandle {
    pub name: String,
    pub identity: RemoteIdentity,
    pub observer: Arc<dyn ChainObserver>,
    pub executor: Arc<dyn EscrowExecutor>,
    pub finality: Arc<FinalityTracker>,
    pub registry: Arc<ValidatorRegistry>,
    pub log_batch_size: u64,
    /// Set for the in-process backend
    pub memory: Option<Arc<InMemoryChain>>,
}

impl ChainHandle {
    pub fn new(
        name: impl Into<String>,
        identity: RemoteIdentity,
        observer: Arc<dyn ChainObserver>,
        executor: Arc<dyn EscrowExecutor>,
        confirmation_blocks: u64,
        log_batch_size: u64,
    ) -> Self {
        Self {
            name: name.into(),
            identity,
            finality: Arc::new(FinalityTracker::new(confirmation_blocks, observer.clone())),
            registry: Arc::new(ValidatorRegistry::new(observer.clone())),
            observer,
            executor,
            log_batch_size,
            memory: None,
        }
    }

    /// Handle over an in-process chain
    pub fn in_memory(
        name: impl Into<String>,
        chain: Arc<InMemoryChain>,
        deployer: Address,
        confirmation_blocks: u64,
    ) -> Self {
        let name = name.into();
        let identity = RemoteIdentity {
            rpc_endpoint: format!("memory://{}", name),
            chain_id: chain.chain_id(),
            escrow_contract: chain.escrow_address(),
            deployer,
        };
        let mut handle = Self::new(
            name,
            identity,
            chain.clone(),
            chain.clone(),
            confirmation_blocks,
            1000,
        );
        handle.memory = Some(chain);
        handle
    }

    pub fn chain_id(&self) -> u64 {
        self.identity.chain_id
    }

    pub fn deployment(&self) -> Deployment {
        Deployment {
            escrow_contract: self.identity.escrow_contract,
            deployer: self.identity.deployer,
        }
    }

    fn parser(&self) -> EventParser {
        EventParser::for_address(self.chain_id(), self.identity.escrow_contract)
    }
}

/// Manages connections to all configured chains
pub struct ChainManager {
    chains: DashMap<u64, Arc<ChainHandle>>,
    watchers: DashMap<u64, Arc<EscrowWatcher>>,
    /// Event broadcast channel
    event_tx: broadcast::Sender<EscrowEvent>,
    /// Shutdown signal
    shutdown: Arc<RwLock<bool>>,
}

impl Default for ChainManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainManager {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(10000);
        Self {
            chains: DashMap::new(),
            watchers: DashMap::new(),
            event_tx,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Connect to every enabled chain in `settings`
    pub async fn from_settings(
        settings: &Settings,
        store: Arc<dyn SwapStore>,
        wallet: Option<LocalWallet>,
    ) -> SwapResult<Self> {
        let manager = Self::new();
        let poll_interval = Duration::from_millis(settings.coordinator.poll_interval_ms);

        for (name, chain_config) in settings.enabled_chains() {
            info!(
                "Initializing chain {} (ID: {})",
                chain_config.name, chain_config.chain_id
            );

            let handle = Self::connect_with_retry(chain_config, wallet.clone(), &settings.coordinator).await?;
            manager.add_chain(handle, store.clone(), poll_interval).await?;

            info!("Chain {} initialized successfully", name);
        }

        Ok(manager)
    }

    /// `connect`, retrying transient failures with backoff. A chain whose
    /// identity cannot be confirmed is never added.
    async fn connect_with_retry(
        config: &ChainConfig,
        wallet: Option<LocalWallet>,
        coordinator: &CoordinatorConfig,
    ) -> SwapResult<ChainHandle> {
        let mut backoff = Backoff::from_millis(coordinator.retry_delay_ms, coordinator.max_retry_delay_ms);
        loop {
            match Self::connect(config, wallet.clone()).await {
                Err(e) if e.is_retryable() && backoff.failures() + 1 < CONNECT_ATTEMPTS => {
                    let delay = backoff.fail();
                    warn!(
                        "Chain {} not reachable ({}), attempt {} of {}, retrying in {:?}",
                        config.name,
                        e,
                        backoff.failures(),
                        CONNECT_ATTEMPTS,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    async fn connect(config: &ChainConfig, wallet: Option<LocalWallet>) -> SwapResult<ChainHandle> {
        let escrow = parse_address(&config.escrow_contract_address)?;
        let deployer = parse_address(&config.deployer_address)?;

        match config.backend {
            ChainBackend::Memory => {
                let validators = config
                    .validators
                    .iter()
                    .map(|v| parse_address(v))
                    .collect::<SwapResult<Vec<_>>>()?;
                if validators.is_empty() {
                    warn!("Memory chain {} has no validators; every identity will be rejected", config.name);
                }

                let chain = Arc::new(InMemoryChain::with_validators(config.chain_id, escrow, &validators));
                let mut handle =
                    ChainHandle::in_memory(config.name.clone(), chain, deployer, config.confirmation_blocks);
                handle.log_batch_size = config.log_batch_size;
                Ok(handle)
            }
            ChainBackend::Rpc => {
                let wallet = wallet.ok_or_else(|| {
                    SwapError::Wallet(format!("chain {} needs a signing wallet", config.name))
                })?;

                let provider = Arc::new(ChainProvider::new(config.clone()).await?);
                let executor = Arc::new(EvmEscrowExecutor::new(
                    provider.http().clone(),
                    wallet,
                    config.chain_id,
                    escrow,
                ));
                let identity = RemoteIdentity {
                    rpc_endpoint: config.rpc_urls.first().cloned().unwrap_or_default(),
                    chain_id: config.chain_id,
                    escrow_contract: escrow,
                    deployer,
                };

                Ok(ChainHandle::new(
                    config.name.clone(),
                    identity,
                    provider,
                    executor,
                    config.confirmation_blocks,
                    config.log_batch_size,
                ))
            }
        }
    }

    /// Register a chain and its escrow watcher
    pub async fn add_chain(
        &self,
        handle: ChainHandle,
        store: Arc<dyn SwapStore>,
        poll_interval: Duration,
    ) -> SwapResult<Arc<ChainHandle>> {
        let chain_id = handle.chain_id();
        let watcher = EscrowWatcher::new(
            handle.observer.clone(),
            handle.finality.clone(),
            handle.parser(),
            self.event_tx.clone(),
            store,
            handle.log_batch_size,
            poll_interval,
        )
        .await?;

        let handle = Arc::new(handle);
        self.chains.insert(chain_id, handle.clone());
        self.watchers.insert(chain_id, Arc::new(watcher));
        Ok(handle)
    }

    /// Authorizer trusting exactly the deployments of the registered chains
    pub fn authorizer(&self, signer: LocalWallet) -> IdentityAuthorizer {
        let mut authorizer = IdentityAuthorizer::new(signer);
        for entry in self.chains.iter() {
            let handle = entry.value();
            authorizer.register_chain(handle.chain_id(), handle.registry.clone(), handle.deployment());
        }
        authorizer
    }

    /// Start all escrow watchers
    pub async fn start_watchers(&self) -> SwapResult<()> {
        let mut handles = Vec::new();

        for entry in self.watchers.iter() {
            let watcher = entry.value().clone();
            let shutdown = self.shutdown.clone();

            let handle = tokio::spawn(async move {
                loop {
                    if *shutdown.read().await {
                        break;
                    }

                    if let Err(e) = watcher.listen().await {
                        error!("Watcher error for chain {}: {}", watcher.chain_id(), e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            });

            handles.push(handle);
        }

        futures::future::join_all(handles).await;
        Ok(())
    }

    /// Produce blocks on in-process chains at their configured interval
    pub async fn run_block_producers(&self, settings: &Settings) {
        let mut handles = Vec::new();

        for entry in self.chains.iter() {
            let Some(chain) = entry.value().memory.clone() else {
                continue;
            };
            let block_time = settings
                .get_chain_by_id(chain.chain_id())
                .map(|c| c.block_time_ms)
                .unwrap_or(1000);
            let shutdown = self.shutdown.clone();

            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(block_time));
                while !*shutdown.read().await {
                    ticker.tick().await;
                    chain.mine_block().await;
                }
            }));
        }

        futures::future::join_all(handles).await;
    }

    /// Subscribe to escrow events from all chains
    pub fn subscribe_events(&self) -> broadcast::Receiver<EscrowEvent> {
        self.event_tx.subscribe()
    }

    pub fn get(&self, chain_id: u64) -> SwapResult<Arc<ChainHandle>> {
        self.chains
            .get(&chain_id)
            .map(|c| c.clone())
            .ok_or(SwapError::ChainNotFound { chain_id })
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(u64, bool)> {
        let handles: Vec<_> = self.chains.iter().map(|e| e.value().clone()).collect();
        let mut results = Vec::new();

        for handle in handles {
            let healthy = match handle.observer.latest_block_number().await {
                Ok(_) => true,
                Err(e) => {
                    warn!("Health check failed for chain {}: {}", handle.chain_id(), e);
                    false
                }
            };
            results.push((handle.chain_id(), healthy));

            crate::metrics::record_chain_health(handle.chain_id(), healthy);
        }

        results.sort();
        results
    }

    /// Trim per-chain caches
    pub async fn cleanup_caches(&self) {
        let trackers: Vec<_> = self.chains.iter().map(|e| e.value().finality.clone()).collect();
        for tracker in trackers {
            tracker.cleanup_cache(10000).await;
        }
    }

    /// Get all connected chain IDs
    pub fn connected_chains(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.chains.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Stop all chain watchers
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("Chain manager stopped");
    }
}

fn parse_address(value: &str) -> SwapResult<Address> {
    Address::from_str(value).map_err(|e| SwapError::Config(format!("Invalid address {}: {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemorySwapStore;

    #[tokio::test]
    async fn test_registered_chains_are_authorized() {
        let manager = ChainManager::new();
        let store = Arc::new(MemorySwapStore::new());
        let member = Address::repeat_byte(0x01);

        for (id, name) in [(1337u64, "ledger"), (2018, "evm")] {
            let chain = Arc::new(InMemoryChain::with_validators(
                id,
                Address::repeat_byte(0xee),
                &[member],
            ));
            let handle = ChainHandle::in_memory(name, chain, Address::repeat_byte(0xdd), 0);
            manager
                .add_chain(handle, store.clone(), Duration::from_millis(10))
                .await
                .unwrap();
        }

        assert_eq!(manager.connected_chains(), vec![1337, 2018]);
        assert!(matches!(manager.get(1), Err(SwapError::ChainNotFound { chain_id: 1 })));

        let evm = manager.get(2018).unwrap();
        let authorizer = manager.authorizer(LocalWallet::new(&mut ethers::core::rand::thread_rng()));
        assert!(authorizer.authorize(&evm.identity, member).await.is_ok());
        assert_eq!(manager.health_check().await, vec![(1337, true), (2018, true)]);
    }

    #[tokio::test]
    async fn test_unconfirmed_rpc_chain_is_not_added() {
        let config = ChainConfig {
            chain_id: 2018,
            name: "evm".to_string(),
            backend: ChainBackend::Rpc,
            rpc_urls: vec!["http://127.0.0.1:1".to_string()],
            escrow_contract_address: format!("{:?}", Address::repeat_byte(0xe2)),
            deployer_address: format!("{:?}", Address::repeat_byte(0xd2)),
            confirmation_blocks: 2,
            log_batch_size: 1000,
            validators: Vec::new(),
            block_time_ms: 1000,
            enabled: true,
        };
        let coordinator = CoordinatorConfig {
            instance_id: "test".to_string(),
            poll_interval_ms: 10,
            retry_delay_ms: 1,
            max_retry_delay_ms: 2,
            health_check_interval_secs: 30,
            settlement_system_id: "test".to_string(),
        };
        let wallet = LocalWallet::new(&mut ethers::core::rand::thread_rng());

        let result = ChainManager::connect_with_retry(&config, Some(wallet), &coordinator).await;
        assert!(matches!(result, Err(SwapError::Unavailable { chain_id: 2018, .. })));

        let result = ChainManager::connect_with_retry(&config, None, &coordinator).await;
        assert!(matches!(result, Err(SwapError::Wallet(_))));
    }

    #[test]
    fn test_parse_address() {
        assert!(parse_address("0x00000000000000000000000000000000000000aa").is_ok());
        assert!(matches!(parse_address("nope"), Err(SwapError::Config(_))));
    }
}
