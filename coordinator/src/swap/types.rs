//! Swap instances, legs and negotiation messages

use crate::error::{SwapError, SwapResult};
use crate::escrow::secret::keccak256;
use crate::escrow::{HtlcStateMachine, LockState, LockTerms, Secret, SecretHash};
use crate::identity::{Attestation, RemoteIdentity};

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type SwapId = Uuid;

/// Which half of the swap a leg is. The initiator locks A, the responder B.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    A,
    B,
}

impl Side {
    pub fn other(&self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::A => "a",
            Side::B => "b",
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Side::A => 0,
            Side::B => 1,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Escrow key of one leg: `keccak256(swap_id || side)`
pub fn leg_id(swap_id: SwapId, side: Side) -> H256 {
    let mut preimage = [0u8; 17];
    preimage[..16].copy_from_slice(swap_id.as_bytes());
    preimage[16] = side.tag();
    H256(keccak256(&preimage))
}

/// Which parties this process acts for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Initiator,
    Responder,
    Both,
}

impl Role {
    /// Locks and, after expiry, reverts this side
    pub fn owns(&self, side: Side) -> bool {
        matches!(
            (self, side),
            (Role::Both, _) | (Role::Initiator, Side::A) | (Role::Responder, Side::B)
        )
    }

    /// Receives the asset escrowed on this side
    pub fn claims(&self, side: Side) -> bool {
        self.owns(side.other())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
            Role::Both => "both",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapStatus {
    Pending,
    LockedBoth,
    Revealed,
    Released,
    Reverted,
    /// A leg expired while locked; its revert is outstanding
    Expired,
    /// Cancelled before any lock was confirmed
    Abandoned,
    /// An identity check failed; nothing further is done automatically
    Rejected,
}

impl SwapStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SwapStatus::Released | SwapStatus::Reverted | SwapStatus::Abandoned | SwapStatus::Rejected
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SwapStatus::Pending => "pending",
            SwapStatus::LockedBoth => "locked_both",
            SwapStatus::Revealed => "revealed",
            SwapStatus::Released => "released",
            SwapStatus::Reverted => "reverted",
            SwapStatus::Expired => "expired",
            SwapStatus::Abandoned => "abandoned",
            SwapStatus::Rejected => "rejected",
        }
    }

    pub const ALL: [SwapStatus; 8] = [
        SwapStatus::Pending,
        SwapStatus::LockedBoth,
        SwapStatus::Revealed,
        SwapStatus::Released,
        SwapStatus::Reverted,
        SwapStatus::Expired,
        SwapStatus::Abandoned,
        SwapStatus::Rejected,
    ];
}

impl fmt::Display for SwapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One chain-side half of a swap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowLeg {
    pub side: Side,
    pub identity: RemoteIdentity,
    pub leg_id: H256,
    pub locker: Address,
    pub counterparty: Address,
    /// Block height on this leg's chain
    pub expiry: u64,
    /// Replay of the confirmed escrow events for `leg_id`
    pub htlc: HtlcStateMachine,
    pub lock_tx_ref: Option<H256>,
    /// Last call submitted by this process and not yet observed
    pub submitted_tx: Option<H256>,
    pub scan_from: u64,
    pub attestation: Option<Attestation>,
}

impl EscrowLeg {
    pub fn lock_state(&self) -> LockState {
        self.htlc.state()
    }

    pub fn chain_id(&self) -> u64 {
        self.identity.chain_id
    }

    /// Terms the on-chain lock must carry
    pub fn expected_terms(&self, secret_hash: SecretHash) -> LockTerms {
        LockTerms {
            secret_hash,
            expiry: self.expiry,
            counterparty: self.counterparty,
            locker: self.locker,
        }
    }

    pub fn is_expired_at(&self, height: u64) -> bool {
        height >= self.expiry
    }

    fn terms(&self) -> LegTerms {
        LegTerms {
            identity: self.identity.clone(),
            locker: self.locker,
            counterparty: self.counterparty,
            expiry: self.expiry,
            scan_from: self.scan_from,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapInstance {
    pub swap_id: SwapId,
    pub trade_id: String,
    pub role: Role,
    pub secret_hash: SecretHash,
    secret: Option<Secret>,
    pub side_a: EscrowLeg,
    pub side_b: EscrowLeg,
    pub status: SwapStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SwapInstance {
    /// Build an instance from agreed terms. Rejects `T_B >= T_A`.
    pub fn from_terms(terms: &SwapTerms, role: Role) -> SwapResult<Self> {
        terms.check_expiry_order()?;

        let leg = |side: Side, t: &LegTerms| EscrowLeg {
            side,
            identity: t.identity.clone(),
            leg_id: leg_id(terms.swap_id, side),
            locker: t.locker,
            counterparty: t.counterparty,
            expiry: t.expiry,
            htlc: HtlcStateMachine::new(),
            lock_tx_ref: None,
            submitted_tx: None,
            scan_from: t.scan_from,
            attestation: None,
        };

        let now = Utc::now();
        Ok(Self {
            swap_id: terms.swap_id,
            trade_id: terms.trade_id.clone(),
            role,
            secret_hash: terms.secret_hash,
            secret: None,
            side_a: leg(Side::A, &terms.side_a),
            side_b: leg(Side::B, &terms.side_b),
            status: SwapStatus::Pending,
            created_at: now,
            updated_at: now,
        })
    }

    /// Pre-image, once it has been revealed on-chain
    pub fn secret(&self) -> Option<&Secret> {
        self.secret.as_ref()
    }

    /// Record the revealed pre-image; it must match `secret_hash`
    pub fn reveal(&mut self, secret: Secret) -> SwapResult<()> {
        if !self.secret_hash.matches(&secret) {
            return Err(SwapError::BadSecret);
        }
        self.secret = Some(secret);
        Ok(())
    }

    pub fn leg(&self, side: Side) -> &EscrowLeg {
        match side {
            Side::A => &self.side_a,
            Side::B => &self.side_b,
        }
    }

    pub fn leg_mut(&mut self, side: Side) -> &mut EscrowLeg {
        match side {
            Side::A => &mut self.side_a,
            Side::B => &mut self.side_b,
        }
    }

    pub fn legs(&self) -> [&EscrowLeg; 2] {
        [&self.side_a, &self.side_b]
    }

    /// Terms to hand to the counterparty. Never contains the secret.
    pub fn terms(&self) -> SwapTerms {
        SwapTerms {
            swap_id: self.swap_id,
            trade_id: self.trade_id.clone(),
            secret_hash: self.secret_hash,
            side_a: self.side_a.terms(),
            side_b: self.side_b.terms(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Per-leg part of `SwapTerms`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegTerms {
    pub identity: RemoteIdentity,
    pub locker: Address,
    pub counterparty: Address,
    pub expiry: u64,
    /// Height from which escrow logs for this leg are scanned
    pub scan_from: u64,
}

/// Negotiated swap parameters exchanged off-chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapTerms {
    pub swap_id: SwapId,
    pub trade_id: String,
    pub secret_hash: SecretHash,
    pub side_a: LegTerms,
    pub side_b: LegTerms,
}

impl SwapTerms {
    /// The responder's window must close strictly before the initiator's
    pub fn check_expiry_order(&self) -> SwapResult<()> {
        if self.side_b.expiry >= self.side_a.expiry {
            return Err(SwapError::InvalidExpiry(format!(
                "side B expiry {} must be earlier than side A expiry {}",
                self.side_b.expiry, self.side_a.expiry
            )));
        }
        Ok(())
    }
}

/// One leg of a swap request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegRequest {
    pub chain_id: u64,
    pub locker: Address,
    pub counterparty: Address,
    pub expiry: u64,
}

/// Request to start a swap as initiator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapRequest {
    /// Trade reference for settlement; defaults to the swap id
    #[serde(default)]
    pub trade_id: Option<String>,
    pub side_a: LegRequest,
    pub side_b: LegRequest,
    /// `Initiator`, or `Both` when this process also plays the responder
    #[serde(default = "default_initiator")]
    pub role: Role,
}

fn default_initiator() -> Role {
    Role::Initiator
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(chain_id: u64) -> RemoteIdentity {
        RemoteIdentity {
            rpc_endpoint: format!("memory://{}", chain_id),
            chain_id,
            escrow_contract: Address::repeat_byte(0xee),
            deployer: Address::repeat_byte(0xdd),
        }
    }

    fn terms(expiry_a: u64, expiry_b: u64) -> SwapTerms {
        let leg = |chain_id, expiry| LegTerms {
            identity: identity(chain_id),
            locker: Address::repeat_byte(chain_id as u8),
            counterparty: Address::repeat_byte(chain_id as u8 + 1),
            expiry,
            scan_from: 0,
        };
        SwapTerms {
            swap_id: Uuid::new_v4(),
            trade_id: "t-1".into(),
            secret_hash: Secret::generate().hash(),
            side_a: leg(1, expiry_a),
            side_b: leg(2, expiry_b),
        }
    }

    #[test]
    fn test_asymmetric_expiry_is_enforced() {
        assert!(SwapInstance::from_terms(&terms(1000, 500), Role::Initiator).is_ok());
        for (a, b) in [(500, 500), (500, 1000)] {
            assert!(matches!(
                SwapInstance::from_terms(&terms(a, b), Role::Initiator),
                Err(SwapError::InvalidExpiry(_))
            ));
        }
    }

    #[test]
    fn test_leg_ids_are_distinct_per_side_and_swap() {
        let id = Uuid::new_v4();
        assert_ne!(leg_id(id, Side::A), leg_id(id, Side::B));
        assert_ne!(leg_id(id, Side::A), leg_id(Uuid::new_v4(), Side::A));
        assert_eq!(leg_id(id, Side::B), leg_id(id, Side::B));
    }

    #[test]
    fn test_reveal_checks_hash() {
        let secret = Secret::generate();
        let mut t = terms(1000, 500);
        t.secret_hash = secret.hash();
        let mut swap = SwapInstance::from_terms(&t, Role::Responder).unwrap();

        assert!(matches!(swap.reveal(Secret::generate()), Err(SwapError::BadSecret)));
        assert!(swap.secret().is_none());
        swap.reveal(secret).unwrap();
        assert_eq!(swap.secret(), Some(&secret));
    }

    #[test]
    fn test_terms_round_trip_without_secret() {
        let t = terms(1000, 500);
        let swap = SwapInstance::from_terms(&t, Role::Initiator).unwrap();
        assert_eq!(swap.terms(), t);
        assert!(!serde_json::to_string(&swap.terms()).unwrap().contains("secret\""));
    }

    #[test]
    fn test_roles() {
        assert!(Role::Initiator.owns(Side::A));
        assert!(Role::Initiator.claims(Side::B));
        assert!(Role::Responder.owns(Side::B));
        assert!(Role::Responder.claims(Side::A));
        assert!(Role::Both.owns(Side::A) && Role::Both.claims(Side::A));
    }
}
