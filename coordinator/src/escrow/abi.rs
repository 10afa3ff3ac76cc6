//! ABI of the HTLC escrow contract
//!
//! Calldata for `lock`/`release`/`revert` and the topics of the events the
//! contract emits. Shared by the EVM executor, the event parser and the
//! in-process chain.

use super::secret::{Secret, SecretHash};
use crate::error::{SwapError, SwapResult};

use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::{id, keccak256};
use lazy_static::lazy_static;

pub const LOCK_FN: &str = "lock(bytes32,bytes32,uint64,address)";
pub const RELEASE_FN: &str = "release(bytes32,bytes32)";
pub const REVERT_FN: &str = "revert(bytes32)";

pub const LOCKED_EVENT: &str = "HtlcLocked(bytes32,bytes32,uint64,address,address)";
pub const RELEASED_EVENT: &str = "HtlcReleased(bytes32,bytes32)";
pub const REVERTED_EVENT: &str = "HtlcReverted(bytes32)";

lazy_static! {
    pub static ref LOCKED_TOPIC: H256 = H256::from(keccak256(LOCKED_EVENT));
    pub static ref RELEASED_TOPIC: H256 = H256::from(keccak256(RELEASED_EVENT));
    pub static ref REVERTED_TOPIC: H256 = H256::from(keccak256(REVERTED_EVENT));
}

/// A call into the escrow contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscrowCall {
    Lock {
        leg_id: H256,
        secret_hash: SecretHash,
        expiry: u64,
        counterparty: Address,
    },
    Release {
        leg_id: H256,
        secret: Secret,
    },
    Revert {
        leg_id: H256,
    },
}

impl EscrowCall {
    pub fn leg_id(&self) -> H256 {
        match self {
            EscrowCall::Lock { leg_id, .. }
            | EscrowCall::Release { leg_id, .. }
            | EscrowCall::Revert { leg_id } => *leg_id,
        }
    }

    /// Name used in logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            EscrowCall::Lock { .. } => "lock",
            EscrowCall::Release { .. } => "release",
            EscrowCall::Revert { .. } => "revert",
        }
    }

    /// Selector followed by ABI-encoded arguments
    pub fn encode(&self) -> Bytes {
        let (signature, tokens) = match self {
            EscrowCall::Lock {
                leg_id,
                secret_hash,
                expiry,
                counterparty,
            } => (
                LOCK_FN,
                vec![
                    Token::FixedBytes(leg_id.as_bytes().to_vec()),
                    Token::FixedBytes(secret_hash.as_bytes().to_vec()),
                    Token::Uint(U256::from(*expiry)),
                    Token::Address(*counterparty),
                ],
            ),
            EscrowCall::Release { leg_id, secret } => (
                RELEASE_FN,
                vec![
                    Token::FixedBytes(leg_id.as_bytes().to_vec()),
                    Token::FixedBytes(secret.as_bytes().to_vec()),
                ],
            ),
            EscrowCall::Revert { leg_id } => (
                REVERT_FN,
                vec![Token::FixedBytes(leg_id.as_bytes().to_vec())],
            ),
        };

        let mut data = id(signature).to_vec();
        data.extend(abi::encode(&tokens));
        Bytes::from(data)
    }

    pub fn decode(input: &[u8]) -> SwapResult<Self> {
        if input.len() < 4 {
            return Err(SwapError::Internal("calldata shorter than a selector".into()));
        }
        let (selector, args) = input.split_at(4);

        if selector == id(LOCK_FN) {
            let tokens = decode_args(
                &[
                    ParamType::FixedBytes(32),
                    ParamType::FixedBytes(32),
                    ParamType::Uint(64),
                    ParamType::Address,
                ],
                args,
            )?;
            Ok(EscrowCall::Lock {
                leg_id: H256(word(&tokens[0])?),
                secret_hash: SecretHash::from_bytes(word(&tokens[1])?),
                expiry: uint64(&tokens[2])?,
                counterparty: address(&tokens[3])?,
            })
        } else if selector == id(RELEASE_FN) {
            let tokens = decode_args(&[ParamType::FixedBytes(32), ParamType::FixedBytes(32)], args)?;
            Ok(EscrowCall::Release {
                leg_id: H256(word(&tokens[0])?),
                secret: Secret::from_bytes(word(&tokens[1])?),
            })
        } else if selector == id(REVERT_FN) {
            let tokens = decode_args(&[ParamType::FixedBytes(32)], args)?;
            Ok(EscrowCall::Revert {
                leg_id: H256(word(&tokens[0])?),
            })
        } else {
            Err(SwapError::Internal(format!(
                "unknown escrow selector 0x{}",
                hex::encode(selector)
            )))
        }
    }
}

/// Data section of `HtlcLocked`
pub fn encode_locked_data(
    secret_hash: &SecretHash,
    expiry: u64,
    counterparty: Address,
    locker: Address,
) -> Bytes {
    Bytes::from(abi::encode(&[
        Token::FixedBytes(secret_hash.as_bytes().to_vec()),
        Token::Uint(U256::from(expiry)),
        Token::Address(counterparty),
        Token::Address(locker),
    ]))
}

/// Data section of `HtlcReleased`
pub fn encode_released_data(secret: &Secret) -> Bytes {
    Bytes::from(abi::encode(&[Token::FixedBytes(secret.as_bytes().to_vec())]))
}

pub(crate) fn decode_locked_data(data: &[u8]) -> SwapResult<(SecretHash, u64, Address, Address)> {
    let tokens = decode_args(
        &[
            ParamType::FixedBytes(32),
            ParamType::Uint(64),
            ParamType::Address,
            ParamType::Address,
        ],
        data,
    )?;
    Ok((
        SecretHash::from_bytes(word(&tokens[0])?),
        uint64(&tokens[1])?,
        address(&tokens[2])?,
        address(&tokens[3])?,
    ))
}

pub(crate) fn decode_released_data(data: &[u8]) -> SwapResult<Secret> {
    let tokens = decode_args(&[ParamType::FixedBytes(32)], data)?;
    Ok(Secret::from_bytes(word(&tokens[0])?))
}

fn decode_args(types: &[ParamType], data: &[u8]) -> SwapResult<Vec<Token>> {
    abi::decode(types, data).map_err(|e| SwapError::Internal(format!("abi decode: {}", e)))
}

fn word(token: &Token) -> SwapResult<[u8; 32]> {
    match token {
        Token::FixedBytes(bytes) if bytes.len() == 32 => {
            let mut out = [0u8; 32];
            out.copy_from_slice(bytes);
            Ok(out)
        }
        other => Err(SwapError::Internal(format!("expected bytes32, got {:?}", other))),
    }
}

fn uint64(token: &Token) -> SwapResult<u64> {
    match token {
        Token::Uint(value) if *value <= U256::from(u64::MAX) => Ok(value.as_u64()),
        other => Err(SwapError::Internal(format!("expected uint64, got {:?}", other))),
    }
}

fn address(token: &Token) -> SwapResult<Address> {
    match token {
        Token::Address(addr) => Ok(*addr),
        other => Err(SwapError::Internal(format!("expected address, got {:?}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_calldata_layout() {
        let call = EscrowCall::Lock {
            leg_id: H256::repeat_byte(0x11),
            secret_hash: SecretHash::from_bytes([0x22; 32]),
            expiry: 1000,
            counterparty: Address::repeat_byte(0x33),
        };
        let data = call.encode();

        assert_eq!(&data[..4], &id(LOCK_FN));
        // selector + four static words
        assert_eq!(data.len(), 4 + 4 * 32);
        assert_eq!(EscrowCall::decode(&data).unwrap(), call);
    }

    #[test]
    fn test_unknown_selector_rejected() {
        assert!(EscrowCall::decode(&[0xde, 0xad, 0xbe, 0xef]).is_err());
        assert!(EscrowCall::decode(&[0x01]).is_err());
    }

    #[test]
    fn test_event_topics_are_distinct() {
        assert_ne!(*LOCKED_TOPIC, *RELEASED_TOPIC);
        assert_ne!(*RELEASED_TOPIC, *REVERTED_TOPIC);
        assert_eq!(*REVERTED_TOPIC, H256::from(keccak256("HtlcReverted(bytes32)")));
    }
}
