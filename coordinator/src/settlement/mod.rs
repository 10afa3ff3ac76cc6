//! Settlement bookkeeping boundary
//!
//! The coordinator reports each finished leg to the bookkeeping service as a
//! settlement instruction. Instructions are written only once a swap is
//! terminal and never drive state transitions.

use crate::error::SwapResult;
use crate::escrow::LockState;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ethers::types::{Address, H256};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Outcome of one leg as recorded by the bookkeeping service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementInstruction {
    pub system_id: String,
    pub trade_id: String,
    pub from_account: Address,
    pub to_account: Address,
    pub operation_id: String,
    pub chain_id: u64,
    pub leg_id: H256,
    /// `Released` or `Reverted`, or `Unlocked` for a leg that never locked
    pub outcome: LockState,
    pub created_at: DateTime<Utc>,
}

impl SettlementInstruction {
    /// Key under which the bookkeeping service stores the instruction
    pub fn key(&self) -> (String, String, Address, Address, String) {
        (
            self.system_id.clone(),
            self.trade_id.clone(),
            self.from_account,
            self.to_account,
            self.operation_id.clone(),
        )
    }
}

#[async_trait]
pub trait SettlementRecorder: Send + Sync {
    /// Persist an instruction. Re-creating an existing key is a no-op.
    async fn create_instruction(&self, instruction: SettlementInstruction) -> SwapResult<()>;
}

/// Writes instructions to the log
pub struct LoggingSettlementRecorder;

#[async_trait]
impl SettlementRecorder for LoggingSettlementRecorder {
    async fn create_instruction(&self, instruction: SettlementInstruction) -> SwapResult<()> {
        info!(
            system_id = %instruction.system_id,
            trade_id = %instruction.trade_id,
            operation_id = %instruction.operation_id,
            chain_id = instruction.chain_id,
            outcome = %instruction.outcome,
            "Settlement instruction {:?} -> {:?}",
            instruction.from_account,
            instruction.to_account
        );
        Ok(())
    }
}

/// Keeps instructions in memory, keyed like the bookkeeping service
#[derive(Default)]
pub struct MemorySettlementRecorder {
    instructions: DashMap<(String, String, Address, Address, String), SettlementInstruction>,
}

impl MemorySettlementRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instructions(&self) -> Vec<SettlementInstruction> {
        let mut all: Vec<_> = self.instructions.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.operation_id.cmp(&b.operation_id));
        all
    }

    pub fn for_trade(&self, trade_id: &str) -> Vec<SettlementInstruction> {
        self.instructions()
            .into_iter()
            .filter(|i| i.trade_id == trade_id)
            .collect()
    }
}

#[async_trait]
impl SettlementRecorder for MemorySettlementRecorder {
    async fn create_instruction(&self, instruction: SettlementInstruction) -> SwapResult<()> {
        self.instructions
            .entry(instruction.key())
            .or_insert(instruction);
        Ok(())
    }
}
