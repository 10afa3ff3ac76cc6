//! Hashed-timelock escrow rules
//!
//! One `HtlcStateMachine` describes a single escrow leg:
//!
//! ```text
//! Unlocked --lock--> Locked --release(secret)--> Released
//!                          \--revert----------> Reverted
//! ```
//!
//! Heights are block heights of the chain hosting the escrow. A release is
//! accepted strictly before `expiry`; a revert only at or after it. The same
//! rules are enforced by the in-process chain and replayed by the coordinator
//! when it applies observed escrow events, so a chain fact that breaks them is
//! rejected instead of trusted.

use super::secret::{Secret, SecretHash};
use crate::error::{SwapError, SwapResult};

use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lock state of one escrow leg
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    #[default]
    Unlocked,
    Locked,
    Released,
    Reverted,
}

impl LockState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LockState::Released | LockState::Reverted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LockState::Unlocked => "unlocked",
            LockState::Locked => "locked",
            LockState::Released => "released",
            LockState::Reverted => "reverted",
        }
    }

    /// Only forward moves are legal
    pub fn can_transition_to(&self, next: LockState) -> bool {
        matches!(
            (self, next),
            (LockState::Unlocked, LockState::Locked)
                | (LockState::Locked, LockState::Released)
                | (LockState::Locked, LockState::Reverted)
        )
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters fixed by `lock` for the remaining lifetime of the leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockTerms {
    pub secret_hash: SecretHash,
    pub expiry: u64,
    /// Receives the asset on release
    pub counterparty: Address,
    /// Escrowed the asset; receives it back on revert
    pub locker: Address,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtlcStateMachine {
    state: LockState,
    terms: Option<LockTerms>,
    revealed: Option<Secret>,
}

impl HtlcStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn terms(&self) -> Option<&LockTerms> {
        self.terms.as_ref()
    }

    /// Secret published by a successful release
    pub fn revealed_secret(&self) -> Option<&Secret> {
        self.revealed.as_ref()
    }

    /// Escrow the asset. Any second lock, identical or not, is rejected.
    pub fn lock(&mut self, terms: LockTerms, height: u64) -> SwapResult<()> {
        if self.state != LockState::Unlocked {
            return Err(SwapError::AlreadyLocked);
        }
        if terms.expiry <= height {
            return Err(SwapError::Expired {
                expiry: terms.expiry,
                height,
            });
        }

        self.transition(LockState::Locked)?;
        self.terms = Some(terms);
        Ok(())
    }

    /// Claim the asset for the counterparty by presenting the pre-image.
    /// Returns the secret, which becomes public through the release event.
    pub fn release(&mut self, secret: Secret, height: u64) -> SwapResult<Secret> {
        let terms = self.locked_terms(LockState::Released)?;

        if !terms.secret_hash.matches(&secret) {
            return Err(SwapError::BadSecret);
        }
        if height >= terms.expiry {
            return Err(SwapError::Expired {
                expiry: terms.expiry,
                height,
            });
        }

        self.transition(LockState::Released)?;
        self.revealed = Some(secret);
        Ok(secret)
    }

    /// Return the asset to the locker once the timelock has passed
    pub fn revert(&mut self, caller: Address, height: u64) -> SwapResult<()> {
        let terms = self.locked_terms(LockState::Reverted)?;

        if height < terms.expiry {
            return Err(SwapError::NotYetExpired {
                expiry: terms.expiry,
                height,
            });
        }
        if caller != terms.locker {
            return Err(SwapError::Unauthorized(format!(
                "{:?} is not the locker of this escrow",
                caller
            )));
        }

        self.transition(LockState::Reverted)
    }

    fn locked_terms(&self, target: LockState) -> SwapResult<LockTerms> {
        match (self.state, self.terms) {
            (LockState::Locked, Some(terms)) => Ok(terms),
            (state, _) => Err(SwapError::InvalidStateTransition {
                from: state.to_string(),
                to: target.to_string(),
            }),
        }
    }

    fn transition(&mut self, next: LockState) -> SwapResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(SwapError::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPIRY: u64 = 1000;

    fn locker() -> Address {
        Address::from_low_u64_be(0xa1)
    }

    fn counterparty() -> Address {
        Address::from_low_u64_be(0xb2)
    }

    fn locked(secret: &Secret) -> HtlcStateMachine {
        let mut htlc = HtlcStateMachine::new();
        htlc.lock(
            LockTerms {
                secret_hash: secret.hash(),
                expiry: EXPIRY,
                counterparty: counterparty(),
                locker: locker(),
            },
            10,
        )
        .unwrap();
        htlc
    }

    #[test]
    fn test_release_with_preimage() {
        let secret = Secret::generate();
        let mut htlc = locked(&secret);

        let revealed = htlc.release(secret, 400).unwrap();
        assert_eq!(revealed, secret);
        assert_eq!(htlc.state(), LockState::Released);
        assert_eq!(htlc.revealed_secret(), Some(&secret));
    }

    #[test]
    fn test_release_with_wrong_secret_leaves_state() {
        let secret = Secret::generate();
        let mut htlc = locked(&secret);
        let before = htlc.clone();

        for _ in 0..16 {
            let wrong = Secret::generate();
            assert!(matches!(htlc.release(wrong, 400), Err(SwapError::BadSecret)));
        }
        assert_eq!(htlc, before);
    }

    #[test]
    fn test_release_at_expiry_fails() {
        let secret = Secret::generate();
        let mut htlc = locked(&secret);

        assert!(matches!(
            htlc.release(secret, EXPIRY),
            Err(SwapError::Expired { .. })
        ));
        assert_eq!(htlc.state(), LockState::Locked);
        // last block before expiry still wins
        assert!(htlc.release(secret, EXPIRY - 1).is_ok());
    }

    #[test]
    fn test_revert_before_expiry_fails() {
        let secret = Secret::generate();
        let mut htlc = locked(&secret);

        for height in [11, 500, EXPIRY - 1] {
            assert!(matches!(
                htlc.revert(locker(), height),
                Err(SwapError::NotYetExpired { .. })
            ));
        }
        assert_eq!(htlc.state(), LockState::Locked);
    }

    #[test]
    fn test_revert_at_and_after_expiry() {
        let secret = Secret::generate();

        let mut at = locked(&secret);
        at.revert(locker(), EXPIRY).unwrap();
        assert_eq!(at.state(), LockState::Reverted);

        let mut after = locked(&secret);
        after.revert(locker(), EXPIRY + 500).unwrap();
        assert_eq!(after.state(), LockState::Reverted);
    }

    #[test]
    fn test_revert_requires_locker() {
        let secret = Secret::generate();
        let mut htlc = locked(&secret);

        assert!(matches!(
            htlc.revert(counterparty(), EXPIRY + 1),
            Err(SwapError::Unauthorized(_))
        ));
        assert_eq!(htlc.state(), LockState::Locked);
    }

    #[test]
    fn test_second_lock_is_rejected() {
        let secret = Secret::generate();
        let mut htlc = locked(&secret);
        let terms = *htlc.terms().unwrap();

        assert!(matches!(htlc.lock(terms, 20), Err(SwapError::AlreadyLocked)));
        assert_eq!(htlc.terms(), Some(&terms));
        assert_eq!(htlc.state(), LockState::Locked);
    }

    #[test]
    fn test_lock_with_past_expiry() {
        let secret = Secret::generate();
        let mut htlc = HtlcStateMachine::new();
        let terms = LockTerms {
            secret_hash: secret.hash(),
            expiry: 50,
            counterparty: counterparty(),
            locker: locker(),
        };

        assert!(matches!(htlc.lock(terms, 50), Err(SwapError::Expired { .. })));
        assert_eq!(htlc.state(), LockState::Unlocked);
    }

    #[test]
    fn test_terminal_states_never_relock() {
        let secret = Secret::generate();

        let mut released = locked(&secret);
        released.release(secret, 100).unwrap();
        let mut reverted = locked(&secret);
        reverted.revert(locker(), EXPIRY).unwrap();

        for htlc in [&mut released, &mut reverted] {
            let terms = *htlc.terms().unwrap();
            let state = htlc.state();
            assert!(htlc.lock(terms, 0).is_err());
            assert!(htlc.release(secret, 0).is_err());
            assert!(htlc.revert(locker(), EXPIRY + 1).is_err());
            assert_eq!(htlc.state(), state);
        }
    }

    #[test]
    fn test_transition_table_is_monotonic() {
        use LockState::*;
        let all = [Unlocked, Locked, Released, Reverted];
        for from in all {
            for to in all {
                if from.is_terminal() {
                    assert!(!from.can_transition_to(to));
                }
                if to == Unlocked {
                    assert!(!from.can_transition_to(to));
                }
            }
        }
    }

    #[test]
    fn test_release_on_unlocked() {
        let mut htlc = HtlcStateMachine::new();
        assert!(matches!(
            htlc.release(Secret::generate(), 1),
            Err(SwapError::InvalidStateTransition { .. })
        ));
    }
}
