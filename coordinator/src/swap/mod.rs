//! Atomic swap orchestration
//!
//! A swap is two escrow legs sharing one secret hash. The initiator locks
//! side A, the responder locks side B with an earlier expiry, the initiator
//! claims B by revealing the secret, and the responder uses the revealed
//! secret to claim A. If anything stalls, each locker reverts its own leg
//! once that leg has expired.

pub mod coordinator;
pub mod retry;
pub mod types;

pub use coordinator::SwapCoordinator;
pub use retry::Backoff;
pub use types::{
    leg_id, EscrowLeg, LegRequest, LegTerms, Role, Side, SwapId, SwapInstance, SwapRequest,
    SwapStatus, SwapTerms,
};
