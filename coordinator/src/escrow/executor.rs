//! Submission of escrow calls
//!
//! The coordinator never mutates an escrow itself: it asks an execution
//! context to submit `lock`/`release`/`revert` and then observes the outcome
//! through the chain observer.

use super::abi::EscrowCall;
use super::secret::{Secret, SecretHash};
use crate::error::{SwapError, SwapResult};

use async_trait::async_trait;
use ethers::middleware::SignerMiddleware;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::signers::{LocalWallet, Signer};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Execution context for escrow calls on one chain
#[async_trait]
pub trait EscrowExecutor: Send + Sync {
    fn chain_id(&self) -> u64;

    async fn submit_lock(
        &self,
        from: Address,
        leg_id: H256,
        secret_hash: SecretHash,
        expiry: u64,
        counterparty: Address,
    ) -> SwapResult<H256>;

    async fn submit_release(&self, from: Address, leg_id: H256, secret: Secret) -> SwapResult<H256>;

    async fn submit_revert(&self, from: Address, leg_id: H256) -> SwapResult<H256>;
}

/// Load the signing wallet from the environment
pub fn load_wallet(env_var: &str) -> SwapResult<LocalWallet> {
    let key = std::env::var(env_var).map_err(|_| {
        SwapError::Wallet(format!("No wallet configured. Set {}", env_var))
    })?;

    key.parse::<LocalWallet>()
        .map_err(|e| SwapError::Wallet(format!("Invalid private key: {}", e)))
}

/// Map a node's rejection message onto the escrow error taxonomy
pub(crate) fn classify_rejection(chain_id: u64, message: &str) -> SwapError {
    if message.contains("AlreadyLocked") {
        SwapError::AlreadyLocked
    } else if message.contains("BadSecret") {
        SwapError::BadSecret
    } else if message.contains("NotYetExpired") {
        // the contract does not report heights
        SwapError::NotYetExpired { expiry: 0, height: 0 }
    } else if message.contains("Expired") {
        SwapError::Expired { expiry: 0, height: 0 }
    } else if message.contains("Unauthorized") {
        SwapError::Unauthorized(message.to_string())
    } else {
        SwapError::unavailable(chain_id, message)
    }
}

/// Submits escrow calls to an EVM chain with a local wallet
pub struct EvmEscrowExecutor {
    chain_id: u64,
    escrow: Address,
    client: SignerMiddleware<Provider<Http>, LocalWallet>,
    send_timeout: Duration,
}

impl EvmEscrowExecutor {
    pub fn new(provider: Provider<Http>, wallet: LocalWallet, chain_id: u64, escrow: Address) -> Self {
        let wallet = wallet.with_chain_id(chain_id);
        info!(
            "Escrow executor for chain {} using wallet {:?}",
            chain_id,
            wallet.address()
        );

        Self {
            chain_id,
            escrow,
            client: SignerMiddleware::new(provider, wallet),
            send_timeout: Duration::from_secs(30),
        }
    }

    pub fn wallet_address(&self) -> Address {
        self.client.signer().address()
    }

    async fn submit(&self, from: Address, call: EscrowCall) -> SwapResult<H256> {
        if from != self.wallet_address() {
            return Err(SwapError::Unauthorized(format!(
                "wallet {:?} cannot sign for {:?}",
                self.wallet_address(),
                from
            )));
        }

        let tx = TransactionRequest::new()
            .from(from)
            .to(self.escrow)
            .data(call.encode());

        debug!(
            "Submitting {} for leg {:?} on chain {}",
            call.name(),
            call.leg_id(),
            self.chain_id
        );

        match timeout(self.send_timeout, self.client.send_transaction(tx, None)).await {
            Ok(Ok(pending)) => {
                let tx_hash = pending.tx_hash();
                info!(
                    "Escrow {} sent on chain {}: {:?}",
                    call.name(),
                    self.chain_id,
                    tx_hash
                );
                crate::metrics::record_submission(self.chain_id, call.name());
                Ok(tx_hash)
            }
            Ok(Err(e)) => {
                let err = classify_rejection(self.chain_id, &e.to_string());
                warn!("Escrow {} rejected on chain {}: {}", call.name(), self.chain_id, err);
                Err(err)
            }
            Err(_) => Err(SwapError::unavailable(
                self.chain_id,
                format!("timeout sending {}", call.name()),
            )),
        }
    }
}

#[async_trait]
impl EscrowExecutor for EvmEscrowExecutor {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn submit_lock(
        &self,
        from: Address,
        leg_id: H256,
        secret_hash: SecretHash,
        expiry: u64,
        counterparty: Address,
    ) -> SwapResult<H256> {
        self.submit(
            from,
            EscrowCall::Lock {
                leg_id,
                secret_hash,
                expiry,
                counterparty,
            },
        )
        .await
    }

    async fn submit_release(&self, from: Address, leg_id: H256, secret: Secret) -> SwapResult<H256> {
        self.submit(from, EscrowCall::Release { leg_id, secret }).await
    }

    async fn submit_revert(&self, from: Address, leg_id: H256) -> SwapResult<H256> {
        self.submit(from, EscrowCall::Revert { leg_id }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rejection() {
        assert!(matches!(
            classify_rejection(1, "execution reverted: AlreadyLocked"),
            SwapError::AlreadyLocked
        ));
        assert!(matches!(
            classify_rejection(1, "execution reverted: NotYetExpired"),
            SwapError::NotYetExpired { .. }
        ));
        assert!(matches!(
            classify_rejection(1, "execution reverted: Expired"),
            SwapError::Expired { .. }
        ));
        assert!(matches!(
            classify_rejection(1, "connection refused"),
            SwapError::Unavailable { chain_id: 1, .. }
        ));
    }

    #[test]
    fn test_wallet_from_env() {
        std::env::set_var(
            "HTLC_TEST_WALLET_KEY",
            "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318",
        );
        assert!(load_wallet("HTLC_TEST_WALLET_KEY").is_ok());
        assert!(matches!(
            load_wallet("HTLC_TEST_WALLET_MISSING"),
            Err(SwapError::Wallet(_))
        ));
    }
}
