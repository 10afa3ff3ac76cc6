//! Two in-process chains shared by independently running coordinators

#![allow(dead_code)]

use ethers::signers::LocalWallet;
use ethers::types::Address;
use htlc_coordinator::chain::{ChainHandle, ChainManager, InMemoryChain};
use htlc_coordinator::config::{CoordinatorConfig, SwapPolicyConfig};
use htlc_coordinator::settlement::MemorySettlementRecorder;
use htlc_coordinator::state::MemorySwapStore;
use htlc_coordinator::swap::{LegRequest, Role, SwapCoordinator, SwapRequest};
use std::sync::Arc;
use std::time::Duration;

pub const LEDGER: u64 = 1337;
pub const EVM: u64 = 2018;

/// Initiator: locks on the ledger, receives on the EVM chain
pub fn alice() -> Address {
    Address::repeat_byte(0xa1)
}

/// Responder: locks on the EVM chain, receives on the ledger
pub fn bob() -> Address {
    Address::repeat_byte(0xb0)
}

pub fn mallory() -> Address {
    Address::repeat_byte(0x66)
}

pub struct Network {
    pub ledger: Arc<InMemoryChain>,
    pub evm: Arc<InMemoryChain>,
}

pub struct Party {
    pub coordinator: Arc<SwapCoordinator>,
    pub chains: Arc<ChainManager>,
    pub store: Arc<MemorySwapStore>,
    pub settlement: Arc<MemorySettlementRecorder>,
}

impl Network {
    pub fn new(validators: &[Address]) -> Self {
        Self {
            ledger: Arc::new(InMemoryChain::with_validators(LEDGER, Address::repeat_byte(0xe1), validators)),
            evm: Arc::new(InMemoryChain::with_validators(EVM, Address::repeat_byte(0xe2), validators)),
        }
    }

    /// A coordinator with a fresh store
    pub async fn party(&self) -> Party {
        self.party_with(Arc::new(MemorySwapStore::new()), 0).await
    }

    /// A coordinator over `store`, trusting logs `confirmation_blocks` deep
    pub async fn party_with(&self, store: Arc<MemorySwapStore>, confirmation_blocks: u64) -> Party {
        let chains = Arc::new(ChainManager::new());
        for (name, chain, deployer) in [
            ("ledger", &self.ledger, Address::repeat_byte(0xd1)),
            ("evm", &self.evm, Address::repeat_byte(0xd2)),
        ] {
            let handle = ChainHandle::in_memory(name, chain.clone(), deployer, confirmation_blocks);
            chains
                .add_chain(handle, store.clone(), Duration::from_millis(10))
                .await
                .unwrap();
        }

        let authorizer = Arc::new(chains.authorizer(LocalWallet::new(&mut ethers::core::rand::thread_rng())));
        let settlement = Arc::new(MemorySettlementRecorder::new());
        let coordinator = Arc::new(SwapCoordinator::new(
            chains.clone(),
            authorizer,
            store.clone(),
            settlement.clone(),
            config(),
            SwapPolicyConfig::default(),
        ));

        Party {
            coordinator,
            chains,
            store,
            settlement,
        }
    }
}

pub fn config() -> CoordinatorConfig {
    CoordinatorConfig {
        instance_id: "test".to_string(),
        poll_interval_ms: 10,
        retry_delay_ms: 0,
        max_retry_delay_ms: 0,
        health_check_interval_secs: 30,
        settlement_system_id: "test-system".to_string(),
    }
}

/// Alice swaps ledger assets for Bob's EVM assets
pub fn request(expiry_a: u64, expiry_b: u64) -> SwapRequest {
    SwapRequest {
        trade_id: Some("trade-42".to_string()),
        side_a: LegRequest {
            chain_id: LEDGER,
            locker: alice(),
            counterparty: bob(),
            expiry: expiry_a,
        },
        side_b: LegRequest {
            chain_id: EVM,
            locker: bob(),
            counterparty: alice(),
            expiry: expiry_b,
        },
        role: Role::Initiator,
    }
}
