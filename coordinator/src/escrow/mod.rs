//! Hashed-timelock escrow
//!
//! - `htlc`: lock/release/revert rules for a single leg
//! - `abi`: calldata and event layout of the escrow contract
//! - `executor`: submission of escrow calls to a chain
//! - `secret`: pre-images and their commitments

pub mod abi;
pub mod executor;
pub mod htlc;
pub mod secret;

pub use abi::EscrowCall;
pub use executor::{load_wallet, EscrowExecutor, EvmEscrowExecutor};
pub use htlc::{HtlcStateMachine, LockState, LockTerms};
pub use secret::{Secret, SecretHash};
