//! End-to-end swaps between an initiator and a responder process

mod common;

use common::{alice, bob, mallory, request, Network, EVM, LEDGER};
use ethers::types::Address;
use htlc_coordinator::escrow::{EscrowExecutor, LockState};
use htlc_coordinator::state::{MemorySwapStore, SwapStore};
use htlc_coordinator::swap::{Side, SwapStatus};
use htlc_coordinator::SwapError;
use std::sync::Arc;

#[tokio::test]
async fn test_swap_completes_when_secret_is_revealed() {
    let net = Network::new(&[alice(), bob()]);
    let initiator = net.party().await;
    let responder = net.party().await;

    let (swap, terms) = initiator.coordinator.initiate(request(1000, 500)).await.unwrap();
    let id = swap.swap_id;
    responder.coordinator.accept(terms).await.unwrap();

    // Alice locks A, Bob sees it and locks B
    assert_eq!(initiator.coordinator.advance(id).await.unwrap(), SwapStatus::Pending);
    assert_eq!(net.ledger.escrow_state(swap.side_a.leg_id).await.state(), LockState::Locked);
    responder.coordinator.advance(id).await.unwrap();
    assert_eq!(net.evm.escrow_state(swap.side_b.leg_id).await.state(), LockState::Locked);

    // Alice claims B at block 400, revealing the secret
    net.evm.advance_to(399).await;
    assert_eq!(initiator.coordinator.advance(id).await.unwrap(), SwapStatus::LockedBoth);
    assert_eq!(net.evm.height().await, 400);
    let b = net.evm.escrow_state(swap.side_b.leg_id).await;
    assert_eq!(b.state(), LockState::Released);

    // Bob learns the secret from the chain and claims A well before 1000
    assert_eq!(responder.coordinator.advance(id).await.unwrap(), SwapStatus::Revealed);
    let a = net.ledger.escrow_state(swap.side_a.leg_id).await;
    assert_eq!(a.state(), LockState::Released);
    assert!(net.ledger.height().await < 1000);
    assert_eq!(a.revealed_secret(), b.revealed_secret());

    assert_eq!(responder.coordinator.advance(id).await.unwrap(), SwapStatus::Released);
    assert_eq!(initiator.coordinator.advance(id).await.unwrap(), SwapStatus::Released);

    for party in [&initiator, &responder] {
        let instructions = party.settlement.for_trade("trade-42");
        assert_eq!(instructions.len(), 2);
        assert!(instructions.iter().all(|i| i.outcome == LockState::Released));
        assert_eq!(instructions[0].from_account, alice());
        assert_eq!(instructions[0].to_account, bob());
        assert_eq!(instructions[1].from_account, bob());
        assert_eq!(instructions[1].to_account, alice());
        assert_eq!(party.store.swap_count(), 0);
        assert_eq!(party.coordinator.active_count(), 0);
    }
}

#[tokio::test]
async fn test_both_legs_revert_when_initiator_disappears() {
    let net = Network::new(&[alice(), bob()]);
    let initiator = net.party().await;
    let responder = net.party().await;

    let (swap, terms) = initiator.coordinator.initiate(request(1000, 500)).await.unwrap();
    let id = swap.swap_id;
    responder.coordinator.accept(terms).await.unwrap();
    initiator.coordinator.advance(id).await.unwrap();
    responder.coordinator.advance(id).await.unwrap();

    // Alice never claims. Bob cannot revert before his expiry; a call sent
    // at 498 would land in block 499.
    net.evm.advance_to(498).await;
    assert!(matches!(
        responder.coordinator.revert_leg(id, Side::B).await,
        Err(SwapError::NotYetExpired { .. })
    ));
    responder.coordinator.advance(id).await.unwrap();
    assert_eq!(net.evm.escrow_state(swap.side_b.leg_id).await.state(), LockState::Locked);

    net.evm.advance_to(500).await;
    assert_eq!(responder.coordinator.advance(id).await.unwrap(), SwapStatus::Expired);
    assert_eq!(net.evm.height().await, 501);
    assert_eq!(net.evm.escrow_state(swap.side_b.leg_id).await.state(), LockState::Reverted);

    // Alice's leg stays locked until its own expiry
    net.ledger.advance_to(999).await;
    assert_eq!(initiator.coordinator.advance(id).await.unwrap(), SwapStatus::Expired);
    assert_eq!(net.ledger.escrow_state(swap.side_a.leg_id).await.state(), LockState::Locked);

    net.ledger.advance_to(1000).await;
    initiator.coordinator.advance(id).await.unwrap();
    assert_eq!(net.ledger.escrow_state(swap.side_a.leg_id).await.state(), LockState::Reverted);
    assert!(net.ledger.height().await > 1000);

    assert_eq!(initiator.coordinator.advance(id).await.unwrap(), SwapStatus::Reverted);
    assert_eq!(responder.coordinator.advance(id).await.unwrap(), SwapStatus::Reverted);

    let instructions = responder.settlement.for_trade("trade-42");
    assert_eq!(instructions.len(), 2);
    assert!(instructions
        .iter()
        .all(|i| i.outcome == LockState::Reverted && i.from_account == i.to_account));
}

#[tokio::test]
async fn test_unauthorized_key_never_locks() {
    let net = Network::new(&[alice(), bob()]);
    let initiator = net.party().await;

    let mut req = request(1000, 500);
    req.side_b.locker = mallory();
    let result = initiator.coordinator.initiate(req).await;

    assert!(matches!(result, Err(SwapError::Unauthorized(_))));
    assert_eq!(initiator.store.swap_count(), 0);
    assert_eq!(initiator.coordinator.active_count(), 0);
    assert_eq!(net.ledger.height().await, 0);
    assert_eq!(net.evm.height().await, 0);
}

#[tokio::test]
async fn test_responder_rejects_unknown_deployment() {
    let net = Network::new(&[alice(), bob()]);
    let initiator = net.party().await;
    let responder = net.party().await;

    let (_, mut terms) = initiator.coordinator.initiate(request(1000, 500)).await.unwrap();
    terms.side_b.identity.escrow_contract = Address::repeat_byte(0x99);

    assert!(matches!(
        responder.coordinator.accept(terms).await,
        Err(SwapError::Unauthorized(_))
    ));
    assert_eq!(responder.store.swap_count(), 0);
}

#[tokio::test]
async fn test_responder_rejects_inverted_expiries() {
    let net = Network::new(&[alice(), bob()]);
    let initiator = net.party().await;
    let responder = net.party().await;

    let (_, mut terms) = initiator.coordinator.initiate(request(1000, 500)).await.unwrap();
    terms.side_b.expiry = 1200;

    assert!(matches!(
        responder.coordinator.accept(terms).await,
        Err(SwapError::InvalidExpiry(_))
    ));
}

#[tokio::test]
async fn test_secret_never_leaves_the_vault() {
    let net = Network::new(&[alice(), bob()]);
    let initiator = net.party().await;

    let (swap, terms) = initiator.coordinator.initiate(request(1000, 500)).await.unwrap();
    let secret = initiator.store.load_preimage(swap.swap_id).await.unwrap().unwrap();

    assert!(swap.secret().is_none());
    assert_eq!(terms.secret_hash, secret.hash());
    let wire = serde_json::to_string(&terms).unwrap();
    assert!(!wire.contains(&hex::encode(secret.as_bytes())));
}

#[tokio::test]
async fn test_initiator_resumes_after_restart() {
    let net = Network::new(&[alice(), bob()]);
    let store = Arc::new(MemorySwapStore::new());
    let initiator = net.party_with(store.clone(), 0).await;
    let responder = net.party().await;

    let (swap, terms) = initiator.coordinator.initiate(request(1000, 500)).await.unwrap();
    let id = swap.swap_id;
    responder.coordinator.accept(terms).await.unwrap();
    initiator.coordinator.advance(id).await.unwrap();
    drop(initiator);

    responder.coordinator.advance(id).await.unwrap();

    let restarted = net.party_with(store, 0).await;
    assert_eq!(restarted.coordinator.resume().await.unwrap(), 1);

    // the persisted pre-image lets the new process claim B
    assert_eq!(restarted.coordinator.advance(id).await.unwrap(), SwapStatus::LockedBoth);
    assert_eq!(net.evm.escrow_state(swap.side_b.leg_id).await.state(), LockState::Released);

    responder.coordinator.advance(id).await.unwrap();
    assert_eq!(responder.coordinator.advance(id).await.unwrap(), SwapStatus::Released);
    assert_eq!(restarted.coordinator.advance(id).await.unwrap(), SwapStatus::Released);
}

#[tokio::test]
async fn test_duplicate_lock_after_lost_write_is_harmless() {
    let net = Network::new(&[alice(), bob()]);
    let store = Arc::new(MemorySwapStore::new());
    let initiator = net.party_with(store.clone(), 2).await;

    let (swap, _) = initiator.coordinator.initiate(request(1000, 500)).await.unwrap();
    let id = swap.swap_id;
    let before_lock = store.load_swap(id).await.unwrap().unwrap();

    initiator.coordinator.advance(id).await.unwrap();
    assert_eq!(net.ledger.escrow_state(swap.side_a.leg_id).await.state(), LockState::Locked);

    // crash before the submission was recorded
    drop(initiator);
    store.save_swap(&before_lock).await.unwrap();
    let restarted = net.party_with(store, 2).await;
    restarted.coordinator.resume().await.unwrap();

    // the lock is not final yet, so it is resubmitted and rejected
    assert_eq!(restarted.coordinator.advance(id).await.unwrap(), SwapStatus::Pending);
    assert_eq!(net.ledger.height().await, 1);

    net.ledger.advance_to(3).await;
    restarted.coordinator.advance(id).await.unwrap();
    let view = restarted.coordinator.get_swap(id).await.unwrap();
    assert_eq!(view.side_a.lock_state(), LockState::Locked);
    assert!(view.side_a.lock_tx_ref.is_some());
}

#[tokio::test]
async fn test_outage_delays_but_does_not_break_swap() {
    let net = Network::new(&[alice(), bob()]);
    let initiator = net.party().await;
    let responder = net.party().await;

    let (swap, terms) = initiator.coordinator.initiate(request(1000, 500)).await.unwrap();
    let id = swap.swap_id;
    responder.coordinator.accept(terms).await.unwrap();
    initiator.coordinator.advance(id).await.unwrap();

    net.evm.set_available(false).await;
    assert_eq!(responder.coordinator.advance(id).await.unwrap(), SwapStatus::Pending);
    assert_eq!(net.evm.escrow_state(swap.side_b.leg_id).await.state(), LockState::Unlocked);

    net.evm.set_available(true).await;
    responder.coordinator.advance(id).await.unwrap();
    assert_eq!(net.evm.escrow_state(swap.side_b.leg_id).await.state(), LockState::Locked);
    assert_eq!(
        responder.chains.health_check().await,
        vec![(LEDGER, true), (EVM, true)]
    );
}

#[tokio::test]
async fn test_initiator_never_releases_into_a_foreign_lock() {
    let net = Network::new(&[alice(), bob()]);
    let initiator = net.party().await;

    let (swap, _) = initiator.coordinator.initiate(request(1000, 500)).await.unwrap();
    let id = swap.swap_id;
    initiator.coordinator.advance(id).await.unwrap();

    // Bob locks B to himself instead of to Alice
    net.evm
        .submit_lock(bob(), swap.side_b.leg_id, swap.secret_hash, 500, bob())
        .await
        .unwrap();
    initiator.coordinator.advance(id).await.unwrap();
    assert_eq!(net.evm.height().await, 1);

    assert!(matches!(
        initiator.coordinator.claim(id).await,
        Err(SwapError::TermsMismatch(_))
    ));
    let b = net.evm.escrow_state(swap.side_b.leg_id).await;
    assert_eq!(b.state(), LockState::Locked);
    assert!(b.revealed_secret().is_none());

    // Alice's own lock is refunded once it expires
    net.ledger.advance_to(1000).await;
    initiator.coordinator.advance(id).await.unwrap();
    assert_eq!(net.ledger.escrow_state(swap.side_a.leg_id).await.state(), LockState::Reverted);
}

#[tokio::test]
async fn test_restart_after_validator_rotation_still_reverts() {
    let net = Network::new(&[alice(), bob()]);
    let store = Arc::new(MemorySwapStore::new());
    let initiator = net.party_with(store.clone(), 0).await;

    let (swap, _) = initiator.coordinator.initiate(request(1000, 500)).await.unwrap();
    let id = swap.swap_id;
    initiator.coordinator.advance(id).await.unwrap();
    drop(initiator);

    // Alice leaves the ledger's validator set after locking
    net.ledger
        .set_validators_from(2, [(bob(), 1)].into_iter().collect())
        .await;
    net.ledger.advance_to(1000).await;

    let restarted = net.party_with(store, 0).await;
    restarted.coordinator.resume().await.unwrap();
    assert_eq!(restarted.coordinator.advance(id).await.unwrap(), SwapStatus::Expired);
    assert_eq!(net.ledger.escrow_state(swap.side_a.leg_id).await.state(), LockState::Reverted);
    assert_eq!(restarted.coordinator.advance(id).await.unwrap(), SwapStatus::Reverted);
}

#[tokio::test]
async fn test_lost_authorization_ends_the_swap() {
    let net = Network::new(&[alice(), bob()]);
    let store = Arc::new(MemorySwapStore::new());
    let initiator = net.party_with(store.clone(), 0).await;

    let (swap, _) = initiator.coordinator.initiate(request(1000, 500)).await.unwrap();
    let id = swap.swap_id;
    drop(initiator);

    // a record without an attestation has to be authorized afresh
    let mut record = store.load_swap(id).await.unwrap().unwrap();
    record.side_a.attestation = None;
    store.save_swap(&record).await.unwrap();
    net.ledger
        .set_validators_from(1, [(bob(), 1)].into_iter().collect())
        .await;
    net.ledger.advance_to(1).await;

    let restarted = net.party_with(store.clone(), 0).await;
    restarted.coordinator.resume().await.unwrap();
    assert_eq!(restarted.coordinator.advance(id).await.unwrap(), SwapStatus::Rejected);
    assert_eq!(restarted.coordinator.advance(id).await.unwrap(), SwapStatus::Rejected);

    assert_eq!(net.ledger.height().await, 1);
    assert_eq!(net.ledger.escrow_state(swap.side_a.leg_id).await.state(), LockState::Unlocked);
    assert_eq!(store.swap_count(), 0);
    assert_eq!(restarted.coordinator.active_count(), 0);
    let instructions = restarted.settlement.for_trade("trade-42");
    assert_eq!(instructions.len(), 2);
    assert!(instructions.iter().all(|i| i.outcome == LockState::Unlocked));
}
