//! In-process chain hosting the HTLC escrow contract
//!
//! Blocks, transactions, receipts and logs are produced exactly as a node
//! would report them, so the coordinator observes this chain through the same
//! `ChainObserver` queries it uses against a JSON-RPC endpoint. The escrow
//! rules are enforced with `HtlcStateMachine`.
//!
//! With automine enabled (the default) every accepted call is mined alone in
//! the next block and a rejected call returns its protocol error without
//! touching the chain. With automine disabled calls queue in the mempool and
//! `mine_block` executes them in submission order; rejected calls are still
//! included, with a failed receipt, which is how concurrent release/revert
//! races near expiry are settled.

use super::observer::{BlockInfo, BlockRef, ChainObserver, ReceiptLookup};
use crate::error::{SwapError, SwapResult};
use crate::escrow::abi::{
    encode_locked_data, encode_released_data, EscrowCall, LOCKED_TOPIC, RELEASED_TOPIC,
    REVERTED_TOPIC,
};
use crate::escrow::{EscrowExecutor, HtlcStateMachine, LockTerms, Secret, SecretHash};

use async_trait::async_trait;
use ethers::types::{Address, Bytes, Log, Transaction, TransactionReceipt, H256, U256, U64};
use ethers::utils::keccak256;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const GENESIS_TIMESTAMP: u64 = 1_700_000_000;
const BLOCK_TIME_SECS: u64 = 2;

#[derive(Debug, Clone)]
struct MinedBlock {
    number: u64,
    hash: H256,
    parent_hash: H256,
    timestamp: u64,
    transactions: Vec<H256>,
}

#[derive(Default)]
struct ChainState {
    blocks: Vec<MinedBlock>,
    mempool: Vec<(Address, EscrowCall, H256)>,
    escrows: HashMap<H256, HtlcStateMachine>,
    transactions: HashMap<H256, Transaction>,
    receipts: HashMap<H256, TransactionReceipt>,
    logs: Vec<Log>,
    /// Validator weights keyed by the height they take effect
    validators: BTreeMap<u64, BTreeMap<Address, u64>>,
    automine: bool,
    outage: bool,
    nonce: u64,
}

impl ChainState {
    fn height(&self) -> u64 {
        self.blocks.last().map(|b| b.number).unwrap_or(0)
    }
}

/// Simulated chain with an escrow contract at a fixed address
pub struct InMemoryChain {
    chain_id: u64,
    escrow: Address,
    state: Mutex<ChainState>,
}

impl InMemoryChain {
    /// Chain at genesis (height 0) with automine enabled
    pub fn new(chain_id: u64, escrow: Address) -> Self {
        let genesis = MinedBlock {
            number: 0,
            hash: block_hash(chain_id, 0),
            parent_hash: H256::zero(),
            timestamp: GENESIS_TIMESTAMP,
            transactions: Vec::new(),
        };

        Self {
            chain_id,
            escrow,
            state: Mutex::new(ChainState {
                blocks: vec![genesis],
                automine: true,
                ..Default::default()
            }),
        }
    }

    /// Chain with an initial validator set of equal weights
    pub fn with_validators(chain_id: u64, escrow: Address, validators: &[Address]) -> Self {
        let mut chain = Self::new(chain_id, escrow);
        chain
            .state
            .get_mut()
            .validators
            .insert(0, validators.iter().map(|v| (*v, 1)).collect());
        chain
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn escrow_address(&self) -> Address {
        self.escrow
    }

    pub async fn height(&self) -> u64 {
        self.state.lock().await.height()
    }

    pub async fn set_automine(&self, enabled: bool) {
        self.state.lock().await.automine = enabled;
    }

    /// Simulate a transport failure: every query and submission returns
    /// `Unavailable` until the chain is made available again
    pub async fn set_available(&self, available: bool) {
        self.state.lock().await.outage = !available;
        if available {
            info!("Chain {} reachable again", self.chain_id);
        } else {
            warn!("Chain {} is now unreachable", self.chain_id);
        }
    }

    /// Replace the validator set from `height` onwards
    pub async fn set_validators_from(&self, height: u64, weights: BTreeMap<Address, u64>) {
        self.state.lock().await.validators.insert(height, weights);
    }

    /// Mine the next block, executing queued calls in submission order
    pub async fn mine_block(&self) -> u64 {
        let mut state = self.state.lock().await;
        self.mine(&mut state)
    }

    /// Mine blocks until the head reaches `height`
    pub async fn advance_to(&self, height: u64) {
        let mut state = self.state.lock().await;
        while state.height() < height {
            self.mine(&mut state);
        }
        debug!("Chain {} advanced to block {}", self.chain_id, height);
    }

    /// Lock state of an escrow as the contract sees it
    pub async fn escrow_state(&self, leg_id: H256) -> HtlcStateMachine {
        self.state
            .lock()
            .await
            .escrows
            .get(&leg_id)
            .cloned()
            .unwrap_or_default()
    }

    fn reachable(&self, state: &ChainState) -> SwapResult<()> {
        if state.outage {
            return Err(SwapError::unavailable(self.chain_id, "connection refused"));
        }
        Ok(())
    }

    async fn submit(&self, from: Address, call: EscrowCall) -> SwapResult<H256> {
        let mut state = self.state.lock().await;
        self.reachable(&state)?;

        let nonce = state.nonce;
        let input = call.encode();
        let hash = tx_hash(self.chain_id, from, nonce, &input);

        if state.automine {
            // rejected calls never reach a block
            let height = state.height() + 1;
            let log = self.execute(&mut state, from, &call, height)?;
            state.nonce += 1;
            state.transactions.insert(hash, self.transaction(hash, from, nonce, input));
            let mined = self.mine_with(&mut state, vec![(from, call.clone(), hash, Some(log))]);
            debug!(
                "Chain {}: {} for leg {:?} mined in block {}",
                self.chain_id,
                call.name(),
                call.leg_id(),
                mined
            );
        } else {
            state.nonce += 1;
            state.transactions.insert(hash, self.transaction(hash, from, nonce, input));
            state.mempool.push((from, call.clone(), hash));
            debug!(
                "Chain {}: {} for leg {:?} queued",
                self.chain_id,
                call.name(),
                call.leg_id()
            );
        }

        Ok(hash)
    }

    fn transaction(&self, hash: H256, from: Address, nonce: u64, input: Bytes) -> Transaction {
        Transaction {
            hash,
            nonce: U256::from(nonce),
            from,
            to: Some(self.escrow),
            input,
            chain_id: Some(U256::from(self.chain_id)),
            ..Default::default()
        }
    }

    /// Apply `call` to the escrow at `height`, returning the emitted log
    /// (topic, data). State is only changed on success.
    fn execute(
        &self,
        state: &mut ChainState,
        from: Address,
        call: &EscrowCall,
        height: u64,
    ) -> SwapResult<(H256, Bytes)> {
        let mut htlc = state.escrows.get(&call.leg_id()).cloned().unwrap_or_default();

        let log = match call {
            EscrowCall::Lock {
                secret_hash,
                expiry,
                counterparty,
                ..
            } => {
                htlc.lock(
                    LockTerms {
                        secret_hash: *secret_hash,
                        expiry: *expiry,
                        counterparty: *counterparty,
                        locker: from,
                    },
                    height,
                )?;
                (
                    *LOCKED_TOPIC,
                    encode_locked_data(secret_hash, *expiry, *counterparty, from),
                )
            }
            EscrowCall::Release { secret, .. } => {
                let revealed = htlc.release(*secret, height)?;
                (*RELEASED_TOPIC, encode_released_data(&revealed))
            }
            EscrowCall::Revert { .. } => {
                htlc.revert(from, height)?;
                (*REVERTED_TOPIC, Bytes::default())
            }
        };

        state.escrows.insert(call.leg_id(), htlc);
        Ok(log)
    }

    fn mine(&self, state: &mut ChainState) -> u64 {
        let queued = std::mem::take(&mut state.mempool)
            .into_iter()
            .map(|(from, call, hash)| (from, call, hash, None))
            .collect();
        self.mine_with(state, queued)
    }

    /// Seal a block with `txs`. Entries carrying a precomputed log were
    /// already executed; the rest are executed now.
    fn mine_with(
        &self,
        state: &mut ChainState,
        txs: Vec<(Address, EscrowCall, H256, Option<(H256, Bytes)>)>,
    ) -> u64 {
        let number = state.height() + 1;
        let hash = block_hash(self.chain_id, number);
        let parent_hash = state.blocks.last().map(|b| b.hash).unwrap_or_default();
        let mut log_index = 0u64;
        let mut included = Vec::with_capacity(txs.len());

        for (index, (from, call, tx, executed)) in txs.into_iter().enumerate() {
            state.mempool.retain(|(_, _, h)| *h != tx);

            let outcome = match executed {
                Some(log) => Ok(log),
                None => self.execute(state, from, &call, number),
            };

            let logs = match &outcome {
                Ok((topic, data)) => {
                    let log = Log {
                        address: self.escrow,
                        topics: vec![*topic, call.leg_id()],
                        data: data.clone(),
                        block_hash: Some(hash),
                        block_number: Some(U64::from(number)),
                        transaction_hash: Some(tx),
                        transaction_index: Some(U64::from(index)),
                        log_index: Some(U256::from(log_index)),
                        removed: Some(false),
                        ..Default::default()
                    };
                    log_index += 1;
                    state.logs.push(log.clone());
                    vec![log]
                }
                Err(e) => {
                    debug!(
                        "Chain {}: {} for leg {:?} failed in block {}: {}",
                        self.chain_id,
                        call.name(),
                        call.leg_id(),
                        number,
                        e
                    );
                    Vec::new()
                }
            };

            if let Some(t) = state.transactions.get_mut(&tx) {
                t.block_number = Some(U64::from(number));
                t.block_hash = Some(hash);
                t.transaction_index = Some(U64::from(index));
            }

            state.receipts.insert(
                tx,
                TransactionReceipt {
                    transaction_hash: tx,
                    transaction_index: U64::from(index),
                    block_hash: Some(hash),
                    block_number: Some(U64::from(number)),
                    from,
                    to: Some(self.escrow),
                    logs,
                    status: Some(U64::from(outcome.is_ok() as u64)),
                    ..Default::default()
                },
            );
            included.push(tx);
        }

        state.blocks.push(MinedBlock {
            number,
            hash,
            parent_hash,
            timestamp: GENESIS_TIMESTAMP + number * BLOCK_TIME_SECS,
            transactions: included,
        });
        number
    }

    fn find_block<'a>(state: &'a ChainState, block: BlockRef) -> Option<&'a MinedBlock> {
        match block {
            BlockRef::Latest => state.blocks.last(),
            BlockRef::Number(n) => state.blocks.get(n as usize),
            BlockRef::Hash(h) => state.blocks.iter().find(|b| b.hash == h),
        }
    }
}

fn block_hash(chain_id: u64, number: u64) -> H256 {
    let mut preimage = [0u8; 16];
    preimage[..8].copy_from_slice(&chain_id.to_be_bytes());
    preimage[8..].copy_from_slice(&number.to_be_bytes());
    H256(keccak256(preimage))
}

fn tx_hash(chain_id: u64, from: Address, nonce: u64, input: &Bytes) -> H256 {
    let mut preimage = Vec::with_capacity(36 + input.len());
    preimage.extend_from_slice(&chain_id.to_be_bytes());
    preimage.extend_from_slice(from.as_bytes());
    preimage.extend_from_slice(&nonce.to_be_bytes());
    preimage.extend_from_slice(input);
    H256(keccak256(preimage))
}

#[async_trait]
impl ChainObserver for InMemoryChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn latest_block_number(&self) -> SwapResult<u64> {
        let state = self.state.lock().await;
        self.reachable(&state)?;
        Ok(state.height())
    }

    async fn get_block(&self, block: BlockRef, with_transactions: bool) -> SwapResult<BlockInfo> {
        let state = self.state.lock().await;
        self.reachable(&state)?;

        let mined = Self::find_block(&state, block)
            .ok_or_else(|| SwapError::not_found(format!("block {}", block)))?;

        let transactions = if with_transactions {
            mined
                .transactions
                .iter()
                .filter_map(|h| state.transactions.get(h).cloned())
                .collect()
        } else {
            Vec::new()
        };

        Ok(BlockInfo {
            number: mined.number,
            hash: mined.hash,
            parent_hash: mined.parent_hash,
            timestamp: mined.timestamp,
            transaction_hashes: mined.transactions.clone(),
            transactions,
        })
    }

    async fn get_transaction(&self, hash: H256) -> SwapResult<Transaction> {
        let state = self.state.lock().await;
        self.reachable(&state)?;
        state
            .transactions
            .get(&hash)
            .cloned()
            .ok_or_else(|| SwapError::not_found(format!("transaction {:?}", hash)))
    }

    async fn get_receipt(&self, hash: H256) -> SwapResult<ReceiptLookup> {
        let state = self.state.lock().await;
        self.reachable(&state)?;

        if let Some(receipt) = state.receipts.get(&hash) {
            return Ok(ReceiptLookup::Confirmed(receipt.clone()));
        }
        if state.transactions.contains_key(&hash) {
            return Ok(ReceiptLookup::Pending);
        }
        Err(SwapError::not_found(format!("transaction {:?}", hash)))
    }

    async fn get_logs(&self, address: Address, from_block: u64, to_block: u64) -> SwapResult<Vec<Log>> {
        let state = self.state.lock().await;
        self.reachable(&state)?;

        Ok(state
            .logs
            .iter()
            .filter(|log| log.address == address)
            .filter(|log| {
                log.block_number
                    .map(|n| (from_block..=to_block).contains(&n.as_u64()))
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn get_block_receipts(&self, block_number: u64) -> SwapResult<Vec<TransactionReceipt>> {
        let state = self.state.lock().await;
        self.reachable(&state)?;

        let block = Self::find_block(&state, BlockRef::Number(block_number))
            .ok_or_else(|| SwapError::not_found(format!("block #{}", block_number)))?;

        Ok(block
            .transactions
            .iter()
            .filter_map(|h| state.receipts.get(h).cloned())
            .collect())
    }

    async fn get_validators(&self, block: &BlockInfo) -> SwapResult<BTreeMap<Address, u64>> {
        let state = self.state.lock().await;
        self.reachable(&state)?;

        match Self::find_block(&state, BlockRef::Number(block.number)) {
            Some(mined) if mined.hash == block.hash => {}
            _ => {
                return Err(SwapError::UnknownBlock {
                    chain_id: self.chain_id,
                    block: format!("{:?}", block.hash),
                })
            }
        }

        Ok(state
            .validators
            .range(..=block.number)
            .next_back()
            .map(|(_, weights)| weights.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl EscrowExecutor for InMemoryChain {
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
    use crate::escrow::LockState;
    use crate::events::{EscrowEventKind, EventParser};

    fn escrow() -> Address {
        Address::repeat_byte(0xee)
    }

    fn alice() -> Address {
        Address::repeat_byte(0xa1)
    }

    fn bob() -> Address {
        Address::repeat_byte(0xb0)
    }

    #[tokio::test]
    async fn test_lock_is_mined_with_log() {
        let chain = InMemoryChain::new(1337, escrow());
        let secret = Secret::generate();
        let leg = H256::repeat_byte(1);

        let tx = chain
            .submit_lock(alice(), leg, secret.hash(), 100, bob())
            .await
            .unwrap();
        assert_eq!(chain.height().await, 1);

        let receipt = match chain.get_receipt(tx).await.unwrap() {
            ReceiptLookup::Confirmed(r) => r,
            ReceiptLookup::Pending => panic!("automined tx still pending"),
        };
        assert_eq!(receipt.status, Some(U64::from(1)));
        assert_eq!(receipt.block_number, Some(U64::from(1)));

        let logs = chain.get_logs(escrow(), 0, 1).await.unwrap();
        let events = EventParser::for_address(1337, escrow()).parse_logs(&logs).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].kind,
            EscrowEventKind::Locked {
                secret_hash: secret.hash(),
                expiry: 100,
                counterparty: bob(),
                locker: alice(),
            }
        );
    }

    #[tokio::test]
    async fn test_rejected_call_is_not_mined() {
        let chain = InMemoryChain::new(1337, escrow());
        let secret = Secret::generate();
        let leg = H256::repeat_byte(1);

        chain.submit_lock(alice(), leg, secret.hash(), 100, bob()).await.unwrap();
        let err = chain
            .submit_lock(alice(), leg, secret.hash(), 100, bob())
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::AlreadyLocked));
        assert_eq!(chain.height().await, 1);

        let err = chain.submit_revert(alice(), leg).await.unwrap_err();
        assert!(matches!(err, SwapError::NotYetExpired { expiry: 100, height: 2 }));
    }

    #[tokio::test]
    async fn test_release_and_revert_race_is_ordered_by_the_chain() {
        let chain = InMemoryChain::new(1337, escrow());
        let secret = Secret::generate();
        let leg = H256::repeat_byte(1);

        chain.submit_lock(alice(), leg, secret.hash(), 10, bob()).await.unwrap();
        chain.advance_to(9).await;
        chain.set_automine(false).await;

        // both land in block 10, where the escrow has expired
        let release = chain.submit_release(bob(), leg, secret).await.unwrap();
        let revert = chain.submit_revert(alice(), leg).await.unwrap();
        assert_eq!(chain.get_receipt(release).await.unwrap(), ReceiptLookup::Pending);

        assert_eq!(chain.mine_block().await, 10);
        let status = |lookup: ReceiptLookup| match lookup {
            ReceiptLookup::Confirmed(r) => r.status,
            ReceiptLookup::Pending => None,
        };
        assert_eq!(status(chain.get_receipt(release).await.unwrap()), Some(U64::from(0)));
        assert_eq!(status(chain.get_receipt(revert).await.unwrap()), Some(U64::from(1)));
        assert_eq!(chain.escrow_state(leg).await.state(), LockState::Reverted);
    }

    #[tokio::test]
    async fn test_outage_surfaces_unavailable() {
        let chain = InMemoryChain::new(2018, escrow());
        chain.set_available(false).await;

        assert!(matches!(
            chain.latest_block_number().await,
            Err(SwapError::Unavailable { chain_id: 2018, .. })
        ));
        assert!(chain
            .submit_revert(alice(), H256::zero())
            .await
            .unwrap_err()
            .is_retryable());

        chain.set_available(true).await;
        assert_eq!(chain.latest_block_number().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_validator_history() {
        let chain = InMemoryChain::with_validators(2018, escrow(), &[alice()]);
        chain.advance_to(20).await;
        chain
            .set_validators_from(10, [(bob(), 3)].into_iter().collect())
            .await;

        let early = chain.get_block(BlockRef::Number(5), false).await.unwrap();
        let late = chain.get_block(BlockRef::Latest, false).await.unwrap();
        assert_eq!(chain.get_validators(&early).await.unwrap().get(&alice()), Some(&1));
        assert_eq!(chain.get_validators(&late).await.unwrap().get(&bob()), Some(&3));

        let forged = BlockInfo {
            number: 5,
            hash: H256::repeat_byte(9),
            ..Default::default()
        };
        assert!(matches!(
            chain.get_validators(&forged).await,
            Err(SwapError::UnknownBlock { .. })
        ));
        assert!(chain.get_block(BlockRef::Number(21), false).await.unwrap_err().is_retryable());
    }
}
