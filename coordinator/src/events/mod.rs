//! Escrow contract events and parsing
//!
//! Logs are decoded into `EscrowEvent`s carrying their chain position so that
//! consumers can replay them in canonical order (block number, then log index)
//! regardless of the order in which they were received.

use crate::error::{SwapError, SwapResult};
use crate::escrow::abi::{
    decode_locked_data, decode_released_data, LOCKED_TOPIC, RELEASED_TOPIC, REVERTED_TOPIC,
};
use crate::escrow::{Secret, SecretHash};

use ethers::types::{Address, Log, H256};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// What happened to an escrow leg
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowEventKind {
    Locked {
        secret_hash: SecretHash,
        expiry: u64,
        counterparty: Address,
        locker: Address,
    },
    Released {
        secret: Secret,
    },
    Reverted,
}

/// Escrow event with its position on the emitting chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowEvent {
    pub chain_id: u64,
    pub leg_id: H256,
    pub kind: EscrowEventKind,
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: H256,
}

impl EscrowEvent {
    /// Get event name for metrics
    pub fn name(&self) -> &'static str {
        match self.kind {
            EscrowEventKind::Locked { .. } => "htlc_locked",
            EscrowEventKind::Released { .. } => "htlc_released",
            EscrowEventKind::Reverted => "htlc_reverted",
        }
    }

    /// Canonical ordering key
    pub fn position(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }
}

/// Sort events into chain order
pub fn sort_canonical(events: &mut [EscrowEvent]) {
    events.sort_by_key(|e| e.position());
}

/// Event parser for the escrow contract of one chain
pub struct EventParser {
    chain_id: u64,
    contract_address: Address,
}

impl EventParser {
    /// Create a new event parser
    pub fn new(chain_id: u64, contract_address: &str) -> SwapResult<Self> {
        let address = Address::from_str(contract_address)
            .map_err(|e| SwapError::Config(format!("Invalid address: {}", e)))?;

        Ok(Self::for_address(chain_id, address))
    }

    pub fn for_address(chain_id: u64, contract_address: Address) -> Self {
        Self {
            chain_id,
            contract_address,
        }
    }

    pub fn contract_address(&self) -> Address {
        self.contract_address
    }

    /// Parse a log entry. Logs from other contracts, unknown topics and
    /// removed (reorged) logs yield `None`.
    pub fn parse_log(&self, log: &Log) -> SwapResult<Option<EscrowEvent>> {
        if log.address != self.contract_address || log.removed == Some(true) {
            return Ok(None);
        }

        let topic = match log.topics.first() {
            Some(topic) => *topic,
            None => return Ok(None),
        };

        let kind = if topic == *LOCKED_TOPIC {
            let (secret_hash, expiry, counterparty, locker) = decode_locked_data(&log.data)?;
            EscrowEventKind::Locked {
                secret_hash,
                expiry,
                counterparty,
                locker,
            }
        } else if topic == *RELEASED_TOPIC {
            EscrowEventKind::Released {
                secret: decode_released_data(&log.data)?,
            }
        } else if topic == *REVERTED_TOPIC {
            EscrowEventKind::Reverted
        } else {
            return Ok(None);
        };

        // Parse indexed leg id from topics
        let leg_id = log
            .topics
            .get(1)
            .copied()
            .ok_or_else(|| SwapError::Internal("escrow event without leg id".into()))?;

        let block_number = log
            .block_number
            .map(|b| b.as_u64())
            .ok_or_else(|| SwapError::Internal("escrow event from a pending block".into()))?;

        Ok(Some(EscrowEvent {
            chain_id: self.chain_id,
            leg_id,
            kind,
            block_number,
            log_index: log.log_index.map(|i| i.low_u64()).unwrap_or(0),
            tx_hash: log.transaction_hash.unwrap_or_default(),
        }))
    }

    /// Parse and order a batch of logs, skipping foreign entries
    pub fn parse_logs(&self, logs: &[Log]) -> SwapResult<Vec<EscrowEvent>> {
        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            if let Some(event) = self.parse_log(log)? {
                events.push(event);
            }
        }
        sort_canonical(&mut events);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escrow::abi::{encode_locked_data, encode_released_data};
    use ethers::types::{U256, U64};

    fn escrow() -> Address {
        Address::repeat_byte(0xee)
    }

    fn log(topic: H256, leg: H256, data: ethers::types::Bytes, block: u64, index: u64) -> Log {
        Log {
            address: escrow(),
            topics: vec![topic, leg],
            data,
            block_number: Some(U64::from(block)),
            log_index: Some(U256::from(index)),
            transaction_hash: Some(H256::from_low_u64_be(block * 100 + index)),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_locked_and_released() {
        let parser = EventParser::for_address(7, escrow());
        let leg = H256::repeat_byte(1);
        let secret = Secret::generate();

        let locked = log(
            *LOCKED_TOPIC,
            leg,
            encode_locked_data(&secret.hash(), 900, Address::repeat_byte(2), Address::repeat_byte(3)),
            5,
            0,
        );
        let released = log(*RELEASED_TOPIC, leg, encode_released_data(&secret), 9, 1);

        let event = parser.parse_log(&locked).unwrap().unwrap();
        assert_eq!(event.chain_id, 7);
        assert_eq!(event.leg_id, leg);
        assert_eq!(
            event.kind,
            EscrowEventKind::Locked {
                secret_hash: secret.hash(),
                expiry: 900,
                counterparty: Address::repeat_byte(2),
                locker: Address::repeat_byte(3),
            }
        );

        let event = parser.parse_log(&released).unwrap().unwrap();
        assert_eq!(event.kind, EscrowEventKind::Released { secret });
        assert_eq!(event.position(), (9, 1));
    }

    #[test]
    fn test_foreign_and_removed_logs_are_skipped() {
        let parser = EventParser::for_address(7, escrow());
        let leg = H256::repeat_byte(1);

        let mut foreign = log(*REVERTED_TOPIC, leg, Default::default(), 3, 0);
        foreign.address = Address::repeat_byte(0x01);
        assert!(parser.parse_log(&foreign).unwrap().is_none());

        let mut removed = log(*REVERTED_TOPIC, leg, Default::default(), 3, 0);
        removed.removed = Some(true);
        assert!(parser.parse_log(&removed).unwrap().is_none());

        let unknown = log(H256::repeat_byte(0x99), leg, Default::default(), 3, 0);
        assert!(parser.parse_log(&unknown).unwrap().is_none());
    }

    #[test]
    fn test_out_of_order_arrival_is_reordered() {
        let parser = EventParser::for_address(7, escrow());
        let leg = H256::repeat_byte(1);
        let logs = vec![
            log(*REVERTED_TOPIC, leg, Default::default(), 12, 0),
            log(*REVERTED_TOPIC, leg, Default::default(), 4, 3),
            log(*REVERTED_TOPIC, leg, Default::default(), 4, 1),
        ];

        let positions: Vec<_> = parser
            .parse_logs(&logs)
            .unwrap()
            .iter()
            .map(|e| e.position())
            .collect();
        assert_eq!(positions, vec![(4, 1), (4, 3), (12, 0)]);
    }
}
