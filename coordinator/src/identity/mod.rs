//! Validator-backed identity authorization
//!
//! Before the coordinator submits a call against a remote ledger it needs
//! evidence that (a) the ledger is the one it claims to be and runs the
//! expected escrow deployment, and (b) the key acting on it is backed by the
//! ledger's validator quorum. `IdentityAuthorizer::authorize` checks both
//! against the validator-set snapshot of a block (the latest unless one is
//! given) and issues a signed `Attestation` anchored to that block.
//! Every failed check is reported as `Unauthorized`; only transport failures
//! pass through unchanged so the caller can retry them.

use crate::error::{SwapError, SwapResult};
use crate::chain::observer::BlockRef;
use crate::registry::ValidatorRegistry;

use ethers::abi::{self, Token};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Signature, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Domain separator mixed into every attestation digest
pub const ATTESTATION_DOMAIN: &[u8] = b"HTLC_IDENTITY_ATTESTATION_V1";

/// Claimed identity of a remote ledger
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteIdentity {
    pub rpc_endpoint: String,
    pub chain_id: u64,
    pub escrow_contract: Address,
    pub deployer: Address,
}

impl fmt::Display for RemoteIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chain {} escrow {:?}", self.chain_id, self.escrow_contract)
    }
}

/// Escrow deployment known to be genuine for a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub escrow_contract: Address,
    pub deployer: Address,
}

/// Signed statement that `key` held validator weight on `identity` at a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub identity: RemoteIdentity,
    pub key: Address,
    pub block_number: u64,
    pub block_hash: H256,
    pub key_weight: u64,
    pub total_weight: u64,
    pub quorum_weight: u64,
    pub issuer: Address,
    pub signature: Signature,
}

impl Attestation {
    /// Digest covered by the issuer's signature
    pub fn digest(&self) -> H256 {
        attestation_digest(
            &self.identity,
            self.key,
            self.block_number,
            self.block_hash,
            self.key_weight,
            self.total_weight,
        )
    }

    /// Check that `issuer` signed exactly these contents
    pub fn verify(&self, issuer: Address) -> SwapResult<()> {
        if self.issuer != issuer {
            return Err(SwapError::Unauthorized(format!(
                "attestation issued by {:?}, expected {:?}",
                self.issuer, issuer
            )));
        }

        let signer = self
            .signature
            .recover(self.digest())
            .map_err(|e| SwapError::Unauthorized(format!("bad attestation signature: {}", e)))?;

        if signer != issuer {
            return Err(SwapError::Unauthorized(format!(
                "attestation signed by {:?}, expected {:?}",
                signer, issuer
            )));
        }
        Ok(())
    }
}

fn attestation_digest(
    identity: &RemoteIdentity,
    key: Address,
    block_number: u64,
    block_hash: H256,
    key_weight: u64,
    total_weight: u64,
) -> H256 {
    let encoded = abi::encode(&[
        Token::FixedBytes(keccak256(ATTESTATION_DOMAIN).to_vec()),
        Token::Uint(U256::from(identity.chain_id)),
        Token::Address(identity.escrow_contract),
        Token::Address(identity.deployer),
        Token::FixedBytes(keccak256(identity.rpc_endpoint.as_bytes()).to_vec()),
        Token::Address(key),
        Token::Uint(U256::from(block_number)),
        Token::FixedBytes(block_hash.as_bytes().to_vec()),
        Token::Uint(U256::from(key_weight)),
        Token::Uint(U256::from(total_weight)),
    ]);
    H256(keccak256(encoded))
}

pub struct IdentityAuthorizer {
    registries: HashMap<u64, Arc<ValidatorRegistry>>,
    deployments: HashMap<u64, Deployment>,
    signer: LocalWallet,
}

impl IdentityAuthorizer {
    pub fn new(signer: LocalWallet) -> Self {
        info!("Identity attestations signed by {:?}", signer.address());
        Self {
            registries: HashMap::new(),
            deployments: HashMap::new(),
            signer,
        }
    }

    /// Trust `deployment` on the chain served by `registry`
    pub fn register_chain(&mut self, chain_id: u64, registry: Arc<ValidatorRegistry>, deployment: Deployment) {
        self.registries.insert(chain_id, registry);
        self.deployments.insert(chain_id, deployment);
    }

    /// Address attestations are signed with
    pub fn issuer(&self) -> Address {
        self.signer.address()
    }

    pub fn registry(&self, chain_id: u64) -> SwapResult<Arc<ValidatorRegistry>> {
        self.registries
            .get(&chain_id)
            .cloned()
            .ok_or(SwapError::ChainNotFound { chain_id })
    }

    /// Attest that `claimed_key` is backed by the latest validator set of `identity`
    pub async fn authorize(&self, identity: &RemoteIdentity, claimed_key: Address) -> SwapResult<Attestation> {
        self.authorize_at(identity, claimed_key, None).await
    }

    /// Attest against the validator set in force at `block`; `None` means
    /// the latest block. Re-issuing an attestation at its original block
    /// reproduces the original decision.
    pub async fn authorize_at(
        &self,
        identity: &RemoteIdentity,
        claimed_key: Address,
        block: Option<BlockRef>,
    ) -> SwapResult<Attestation> {
        let result = self.check(identity, claimed_key, block).await;
        match &result {
            Ok(att) => debug!(
                "Authorized {:?} on {} at block {} (weight {}/{})",
                claimed_key, identity, att.block_number, att.key_weight, att.total_weight
            ),
            Err(SwapError::Unavailable { .. }) => {}
            Err(e) => warn!("Rejected {:?} on {}: {}", claimed_key, identity, e),
        }
        result
    }

    async fn check(
        &self,
        identity: &RemoteIdentity,
        claimed_key: Address,
        block: Option<BlockRef>,
    ) -> SwapResult<Attestation> {
        let registry = self.registries.get(&identity.chain_id).ok_or_else(|| {
            SwapError::Unauthorized(format!("no validator registry for chain {}", identity.chain_id))
        })?;

        if registry.chain_id() != identity.chain_id {
            return Err(SwapError::Unauthorized(format!(
                "endpoint serves chain {}, identity claims {}",
                registry.chain_id(),
                identity.chain_id
            )));
        }

        let set = match registry.get_validator_set(block).await {
            Ok(set) => set,
            Err(e @ SwapError::Unavailable { .. }) => return Err(e),
            Err(e) => {
                return Err(SwapError::Unauthorized(format!(
                    "no validator set for chain {}: {}",
                    identity.chain_id, e
                )))
            }
        };

        let total_weight = set.total_weight();
        if total_weight == 0 {
            return Err(SwapError::Unauthorized(format!(
                "chain {} reports an empty validator set",
                identity.chain_id
            )));
        }

        let key_weight = set.weight_of(&claimed_key);
        if key_weight == 0 {
            return Err(SwapError::Unauthorized(format!(
                "{:?} is not a validator of chain {} at block {}",
                claimed_key, identity.chain_id, set.block_number
            )));
        }

        let known = self.deployments.get(&identity.chain_id).ok_or_else(|| {
            SwapError::Unauthorized(format!("no known deployment on chain {}", identity.chain_id))
        })?;
        if known.escrow_contract != identity.escrow_contract || known.deployer != identity.deployer {
            return Err(SwapError::Unauthorized(format!(
                "escrow {:?} by {:?} is not the known deployment on chain {}",
                identity.escrow_contract, identity.deployer, identity.chain_id
            )));
        }

        let digest = attestation_digest(
            identity,
            claimed_key,
            set.block_number,
            set.block_hash,
            key_weight,
            total_weight,
        );
        let signature = self
            .signer
            .sign_hash(digest)
            .map_err(|e| SwapError::Wallet(e.to_string()))?;

        Ok(Attestation {
            identity: identity.clone(),
            key: claimed_key,
            block_number: set.block_number,
            block_hash: set.block_hash,
            key_weight,
            total_weight,
            quorum_weight: set.quorum_weight(),
            issuer: self.issuer(),
            signature,
        })
    }

    /// Check an attestation issued by this authorizer for `identity` and `key`
    pub fn verify(&self, attestation: &Attestation, identity: &RemoteIdentity, key: Address) -> SwapResult<()> {
        if attestation.identity != *identity || attestation.key != key {
            return Err(SwapError::Unauthorized(format!(
                "attestation for {:?} on {} does not cover {:?} on {}",
                attestation.key, attestation.identity, key, identity
            )));
        }
        attestation.verify(self.issuer())
    }
}
