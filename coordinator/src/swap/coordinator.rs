//! Swap coordinator
//!
//! Drives every active swap through its escrow legs. Each call to `advance`
//! is one step for one swap, taken under that swap's mutex:
//!
//! 1. re-derive both legs from finalized escrow logs, in chain order
//! 2. derive the swap status and persist it if anything changed
//! 3. take at most one action per leg for the roles this process plays
//!
//! Nothing is inferred from local timers. A leg changes state only when its
//! chain reports the corresponding escrow event, so restarting the process,
//! losing a notification or racing the counterparty never changes an outcome.

use super::retry::Backoff;
use super::types::{
    LegRequest, LegTerms, Role, Side, SwapId, SwapInstance, SwapRequest, SwapStatus, SwapTerms,
};
use crate::chain::observer::BlockRef;
use crate::chain::{ChainHandle, ChainManager, TxStatus};
use crate::config::{CoordinatorConfig, SwapPolicyConfig};
use crate::error::{SwapError, SwapResult};
use crate::escrow::{LockState, LockTerms, Secret};
use crate::events::{EscrowEvent, EscrowEventKind, EventParser};
use crate::identity::IdentityAuthorizer;
use crate::settlement::{SettlementInstruction, SettlementRecorder};
use crate::state::SwapStore;

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use ethers::types::H256;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long finished swaps stay queryable after garbage collection
const FINISHED_RETENTION_SECS: i64 = 3600;

struct ActiveSwap {
    instance: SwapInstance,
    backoff: Backoff,
    /// Local pre-image vault entry; only the initiator has one
    vault: Option<Secret>,
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Lock,
    Release(Secret),
    Revert,
}

impl Action {
    fn name(&self) -> &'static str {
        match self {
            Action::Lock => "lock",
            Action::Release(_) => "release",
            Action::Revert => "revert",
        }
    }
}

pub struct SwapCoordinator {
    chains: Arc<ChainManager>,
    authorizer: Arc<IdentityAuthorizer>,
    store: Arc<dyn SwapStore>,
    settlement: Arc<dyn SettlementRecorder>,
    config: CoordinatorConfig,
    policy: SwapPolicyConfig,
    active: DashMap<SwapId, Arc<Mutex<ActiveSwap>>>,
    /// leg_id -> swap, for routing escrow notifications
    legs: DashMap<H256, SwapId>,
    finished: DashMap<SwapId, SwapInstance>,
    shutdown: Arc<RwLock<bool>>,
}

impl SwapCoordinator {
    pub fn new(
        chains: Arc<ChainManager>,
        authorizer: Arc<IdentityAuthorizer>,
        store: Arc<dyn SwapStore>,
        settlement: Arc<dyn SettlementRecorder>,
        config: CoordinatorConfig,
        policy: SwapPolicyConfig,
    ) -> Self {
        Self {
            chains,
            authorizer,
            store,
            settlement,
            config,
            policy,
            active: DashMap::new(),
            legs: DashMap::new(),
            finished: DashMap::new(),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff::from_millis(self.config.retry_delay_ms, self.config.max_retry_delay_ms)
    }

    /// Start a swap as initiator. The generated pre-image goes to the local
    /// vault only; the returned terms are what the counterparty receives.
    pub async fn initiate(&self, request: SwapRequest) -> SwapResult<(SwapInstance, SwapTerms)> {
        if request.role == Role::Responder {
            return Err(SwapError::TermsMismatch(
                "a swap can only be initiated by the initiator".to_string(),
            ));
        }

        let handle_a = self.chains.get(request.side_a.chain_id)?;
        let handle_b = self.chains.get(request.side_b.chain_id)?;
        let height_a = handle_a.observer.latest_block_number().await?;
        let height_b = handle_b.observer.latest_block_number().await?;

        let secret = Secret::generate();
        let swap_id = Uuid::new_v4();
        let leg = |handle: &ChainHandle, req: &LegRequest, height: u64| LegTerms {
            identity: handle.identity.clone(),
            locker: req.locker,
            counterparty: req.counterparty,
            expiry: req.expiry,
            scan_from: height,
        };
        let terms = SwapTerms {
            swap_id,
            trade_id: request.trade_id.clone().unwrap_or_else(|| swap_id.to_string()),
            secret_hash: secret.hash(),
            side_a: leg(&handle_a, &request.side_a, height_a),
            side_b: leg(&handle_b, &request.side_b, height_b),
        };

        let instance = self.admit(&terms, request.role, [height_a, height_b]).await?;

        // vault first, so a persisted swap always has its pre-image
        self.store.save_preimage(swap_id, &secret).await?;
        self.store.save_swap(&instance).await?;
        self.insert(instance.clone(), Some(secret));

        info!(
            "Initiated swap {} (trade {}): A on chain {} expires at {}, B on chain {} expires at {}",
            swap_id,
            instance.trade_id,
            instance.side_a.chain_id(),
            instance.side_a.expiry,
            instance.side_b.chain_id(),
            instance.side_b.expiry
        );
        crate::metrics::record_swap_status(instance.status.as_str());

        Ok((instance, terms))
    }

    /// Join a swap proposed by the initiator
    pub async fn accept(&self, terms: SwapTerms) -> SwapResult<SwapInstance> {
        if let Some(entry) = self.entry(terms.swap_id) {
            let existing = entry.lock().await.instance.clone();
            if existing.terms() != terms {
                return Err(SwapError::TermsMismatch(format!(
                    "swap {} is already known with different terms",
                    terms.swap_id
                )));
            }
            return Ok(existing);
        }

        let handle_a = self.chains.get(terms.side_a.identity.chain_id)?;
        let handle_b = self.chains.get(terms.side_b.identity.chain_id)?;
        let height_a = handle_a.observer.latest_block_number().await?;
        let height_b = handle_b.observer.latest_block_number().await?;

        let instance = self.admit(&terms, Role::Responder, [height_a, height_b]).await?;

        self.store.save_swap(&instance).await?;
        self.insert(instance.clone(), None);

        info!("Accepted swap {} (trade {})", instance.swap_id, instance.trade_id);
        crate::metrics::record_swap_status(instance.status.as_str());

        Ok(instance)
    }

    /// Validate expiries and authorize both legs, producing the new instance
    async fn admit(&self, terms: &SwapTerms, role: Role, heights: [u64; 2]) -> SwapResult<SwapInstance> {
        terms.check_expiry_order()?;

        let gap = terms.side_a.expiry - terms.side_b.expiry;
        if gap < self.policy.min_expiry_gap_blocks {
            return Err(SwapError::InvalidExpiry(format!(
                "expiry gap {} is below the minimum of {} blocks",
                gap, self.policy.min_expiry_gap_blocks
            )));
        }

        for (leg, height) in [(&terms.side_a, heights[0]), (&terms.side_b, heights[1])] {
            let earliest = height + self.policy.min_expiry_delta_blocks;
            if leg.expiry < earliest {
                return Err(SwapError::InvalidExpiry(format!(
                    "expiry {} on chain {} must be at least {} (current height {})",
                    leg.expiry, leg.identity.chain_id, earliest, height
                )));
            }
        }

        let attestation_a = self.authorizer.authorize(&terms.side_a.identity, terms.side_a.locker).await?;
        let attestation_b = self.authorizer.authorize(&terms.side_b.identity, terms.side_b.locker).await?;

        let mut instance = SwapInstance::from_terms(terms, role)?;
        instance.side_a.attestation = Some(attestation_a);
        instance.side_b.attestation = Some(attestation_b);
        Ok(instance)
    }

    fn insert(&self, instance: SwapInstance, vault: Option<Secret>) {
        let swap_id = instance.swap_id;
        for leg in instance.legs() {
            self.legs.insert(leg.leg_id, swap_id);
        }
        self.active.insert(
            swap_id,
            Arc::new(Mutex::new(ActiveSwap {
                instance,
                backoff: self.backoff(),
                vault,
            })),
        );
        crate::metrics::set_active_swaps(self.active.len());
    }

    fn entry(&self, swap_id: SwapId) -> Option<Arc<Mutex<ActiveSwap>>> {
        self.active.get(&swap_id).map(|e| e.value().clone())
    }

    /// Reload unfinished swaps after a restart
    pub async fn resume(&self) -> SwapResult<usize> {
        let swaps = self.store.load_active().await?;
        let count = swaps.len();

        for instance in swaps {
            let vault = self.store.load_preimage(instance.swap_id).await?;
            debug!("Resuming swap {} in status {}", instance.swap_id, instance.status);
            self.insert(instance, vault);
        }

        if count > 0 {
            info!("Resumed {} active swaps", count);
        }
        Ok(count)
    }

    /// Take one step for `swap_id` and return its status afterwards.
    ///
    /// Transient chain failures are absorbed: the swap is rescheduled with
    /// backoff and its current status returned.
    pub async fn advance(&self, swap_id: SwapId) -> SwapResult<SwapStatus> {
        let Some(entry) = self.entry(swap_id) else {
            return self
                .finished
                .get(&swap_id)
                .map(|s| s.status)
                .ok_or_else(|| SwapError::SwapNotFound(swap_id.to_string()));
        };

        let mut swap = entry.lock().await;

        if !swap.instance.status.is_terminal() {
            if !swap.backoff.ready() {
                return Ok(swap.instance.status);
            }

            match self.step(&mut swap).await {
                Ok(()) => swap.backoff.succeed(),
                Err(e) if e.is_retryable() => {
                    let delay = swap.backoff.fail();
                    crate::metrics::record_retry(e.kind());
                    warn!(
                        "Swap {}: {} (attempt {}, retrying in {:?})",
                        swap_id,
                        e,
                        swap.backoff.failures(),
                        delay
                    );
                    return Ok(swap.instance.status);
                }
                Err(SwapError::Unauthorized(reason)) => self.reject(&mut swap.instance, &reason).await?,
                Err(e) => return Err(e),
            }
        }

        let status = swap.instance.status;
        if status.is_terminal() {
            self.finish(&swap.instance).await?;
        }
        Ok(status)
    }

    async fn step(&self, swap: &mut ActiveSwap) -> SwapResult<()> {
        let heights = self.refresh(&mut swap.instance).await?;

        for side in [Side::A, Side::B] {
            let Some(action) = self.next_action(swap, side, heights) else {
                continue;
            };
            self.attest(&mut swap.instance, side).await?;
            match self.submit(&swap.instance, side, action).await {
                Ok(tx_hash) => {
                    swap.instance.leg_mut(side).submitted_tx = Some(tx_hash);
                    swap.instance.touch();
                    self.store.save_swap(&swap.instance).await?;
                }
                Err(e) if e.is_protocol_violation() => {
                    // the chain knows better than our last read
                    warn!(
                        "Swap {}: {} on leg {} rejected: {}",
                        swap.instance.swap_id,
                        action.name(),
                        side,
                        e
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Stop driving a swap whose identity checks no longer pass
    async fn reject(&self, instance: &mut SwapInstance, reason: &str) -> SwapResult<()> {
        error!("Swap {} rejected: {}", instance.swap_id, reason);
        for leg in instance.legs() {
            if instance.role.owns(leg.side) && leg.lock_state() == LockState::Locked {
                error!(
                    "Swap {}: leg {} (chain {}) stays locked until reverted manually",
                    instance.swap_id,
                    leg.side,
                    leg.chain_id()
                );
            }
        }

        instance.status = SwapStatus::Rejected;
        instance.touch();
        self.store.save_swap(instance).await?;
        crate::metrics::record_swap_status(SwapStatus::Rejected.as_str());
        Ok(())
    }

    /// Re-read both legs from their chains, persisting any change. Returns
    /// the latest height of each leg's chain.
    async fn refresh(&self, instance: &mut SwapInstance) -> SwapResult<[u64; 2]> {
        let before = instance.clone();
        let mut heights = [0u64; 2];

        for (i, side) in [Side::A, Side::B].into_iter().enumerate() {
            heights[i] = self.refresh_leg(instance, side).await?;
        }

        let status = derive_status(instance, heights);
        if status != instance.status {
            info!("Swap {}: {} -> {}", instance.swap_id, instance.status, status);
            instance.status = status;
            crate::metrics::record_swap_status(status.as_str());
        }

        if *instance != before {
            instance.touch();
            self.store.save_swap(instance).await?;
        }

        Ok(heights)
    }

    async fn refresh_leg(&self, instance: &mut SwapInstance, side: Side) -> SwapResult<u64> {
        let leg = instance.leg(side);
        let handle = self.chains.get(leg.chain_id())?;
        let leg_id = leg.leg_id;
        let parser = EventParser::for_address(leg.chain_id(), leg.identity.escrow_contract);

        let latest = handle.observer.latest_block_number().await?;
        let finalized = latest.saturating_sub(handle.finality.confirmation_blocks());
        let batch = handle.log_batch_size.max(1);

        let mut from = leg.scan_from;
        while from <= finalized {
            let to = std::cmp::min(finalized, from + batch - 1);
            let logs = handle
                .observer
                .get_logs(parser.contract_address(), from, to)
                .await?;

            for event in parser.parse_logs(&logs)? {
                if event.leg_id == leg_id {
                    apply_event(instance, side, &event);
                }
            }

            from = to + 1;
            instance.leg_mut(side).scan_from = from;
        }

        if let Some(tx_hash) = instance.leg(side).submitted_tx {
            let settled = match handle.finality.status(tx_hash).await {
                Ok(TxStatus::Pending) | Ok(TxStatus::Included { .. }) => false,
                Ok(TxStatus::Finalized { .. }) => true,
                Ok(TxStatus::Failed { block_number }) => {
                    warn!(
                        "Swap {}: call {:?} on leg {} failed in block {}",
                        instance.swap_id, tx_hash, side, block_number
                    );
                    true
                }
                Err(SwapError::NotFound { .. }) => {
                    warn!("Swap {}: call {:?} on leg {} was dropped", instance.swap_id, tx_hash, side);
                    true
                }
                Err(e) => return Err(e),
            };
            if settled {
                instance.leg_mut(side).submitted_tx = None;
            }
        }

        Ok(latest)
    }

    /// The single action this process should take on `side` now, if any
    fn next_action(&self, swap: &ActiveSwap, side: Side, heights: [u64; 2]) -> Option<Action> {
        let instance = &swap.instance;
        let leg = instance.leg(side);
        let other = instance.leg(side.other());
        let height = heights[side_index(side)];
        let margin = self.policy.claim_margin_blocks;

        if leg.submitted_tx.is_some() || instance.status.is_terminal() {
            return None;
        }

        match leg.lock_state() {
            LockState::Unlocked if instance.role.owns(side) => {
                if height + margin >= leg.expiry {
                    return None;
                }
                let ready = match side {
                    Side::A => instance.status == SwapStatus::Pending && other.lock_state() == LockState::Unlocked,
                    Side::B => other.lock_state() == LockState::Locked && terms_match(instance, side.other()),
                };
                ready.then_some(Action::Lock)
            }
            LockState::Locked if instance.role.owns(side) && leg.is_expired_at(height) => Some(Action::Revert),
            LockState::Locked => self.claimable(swap, side, heights).map(Action::Release),
            _ => None,
        }
    }

    /// Secret this process may release `side` with now. B is only claimed
    /// while A holds the negotiated lock and B's expiry is beyond the claim
    /// margin; both legs must carry the negotiated terms.
    fn claimable(&self, swap: &ActiveSwap, side: Side, heights: [u64; 2]) -> Option<Secret> {
        let instance = &swap.instance;
        let leg = instance.leg(side);
        let height = heights[side_index(side)];

        if !instance.role.claims(side) || leg.lock_state() != LockState::Locked || !terms_match(instance, side) {
            return None;
        }

        match side {
            Side::B => {
                let secret = instance.secret().copied().or(swap.vault)?;
                let a_locked = matches!(instance.side_a.lock_state(), LockState::Locked | LockState::Released);
                (a_locked && terms_match(instance, Side::A) && height + self.policy.claim_margin_blocks < leg.expiry)
                    .then_some(secret)
            }
            Side::A => {
                let secret = instance.secret().copied()?;
                (height < leg.expiry).then_some(secret)
            }
        }
    }

    /// Make sure `side` carries an attestation this process can verify.
    /// Attestations from an earlier run are re-issued against the validator
    /// set of the block they were anchored to.
    async fn attest(&self, instance: &mut SwapInstance, side: Side) -> SwapResult<()> {
        let leg = instance.leg(side);
        let valid = leg
            .attestation
            .as_ref()
            .map_or(false, |att| self.authorizer.verify(att, &leg.identity, leg.locker).is_ok());
        if valid {
            return Ok(());
        }

        let anchor = leg.attestation.as_ref().map(|att| BlockRef::Hash(att.block_hash));
        debug!("Swap {}: re-attesting leg {} at {:?}", instance.swap_id, side, anchor);
        let attestation = self
            .authorizer
            .authorize_at(&leg.identity, leg.locker, anchor)
            .await?;
        instance.leg_mut(side).attestation = Some(attestation);
        Ok(())
    }

    /// Send `action` for `side`, after checking the leg's attestation
    async fn submit(&self, instance: &SwapInstance, side: Side, action: Action) -> SwapResult<H256> {
        let leg = instance.leg(side);
        let handle = self.chains.get(leg.chain_id())?;

        let attestation = leg.attestation.as_ref().ok_or_else(|| {
            SwapError::Unauthorized(format!("leg {} of swap {} has no attestation", side, instance.swap_id))
        })?;
        self.authorizer.verify(attestation, &leg.identity, leg.locker)?;

        let tx_hash = match action {
            Action::Lock => {
                handle
                    .executor
                    .submit_lock(leg.locker, leg.leg_id, instance.secret_hash, leg.expiry, leg.counterparty)
                    .await?
            }
            Action::Release(secret) => {
                handle
                    .executor
                    .submit_release(leg.counterparty, leg.leg_id, secret)
                    .await?
            }
            Action::Revert => handle.executor.submit_revert(leg.locker, leg.leg_id).await?,
        };

        info!(
            "Swap {}: submitted {} on leg {} (chain {}): {:?}",
            instance.swap_id,
            action.name(),
            side,
            leg.chain_id(),
            tx_hash
        );
        Ok(tx_hash)
    }

    /// Cancel a swap before any lock is confirmed or in flight
    pub async fn abandon(&self, swap_id: SwapId) -> SwapResult<SwapInstance> {
        let entry = self
            .entry(swap_id)
            .ok_or_else(|| SwapError::SwapNotFound(swap_id.to_string()))?;
        let mut swap = entry.lock().await;
        let instance = &mut swap.instance;

        let untouched = instance
            .legs()
            .iter()
            .all(|l| l.lock_state() == LockState::Unlocked && l.submitted_tx.is_none());
        if !instance.role.owns(Side::A) || !untouched || instance.status.is_terminal() {
            return Err(SwapError::InvalidStateTransition {
                from: instance.status.to_string(),
                to: SwapStatus::Abandoned.to_string(),
            });
        }

        instance.status = SwapStatus::Abandoned;
        instance.touch();
        self.store.save_swap(instance).await?;
        info!("Swap {} abandoned", swap_id);
        crate::metrics::record_swap_status(SwapStatus::Abandoned.as_str());

        let instance = instance.clone();
        drop(swap);
        self.finish(&instance).await?;
        Ok(instance)
    }

    /// Revert one of this process's legs now. Fails with `NotYetExpired`
    /// before the leg's expiry.
    pub async fn revert_leg(&self, swap_id: SwapId, side: Side) -> SwapResult<H256> {
        let entry = self
            .entry(swap_id)
            .ok_or_else(|| SwapError::SwapNotFound(swap_id.to_string()))?;
        let mut swap = entry.lock().await;
        let heights = self.refresh(&mut swap.instance).await?;

        let leg = swap.instance.leg(side);
        if !swap.instance.role.owns(side) {
            return Err(SwapError::Unauthorized(format!(
                "{} does not own leg {}",
                swap.instance.role.as_str(),
                side
            )));
        }
        if leg.submitted_tx.is_some() {
            return Err(SwapError::InvalidStateTransition {
                from: "submitted".to_string(),
                to: LockState::Reverted.to_string(),
            });
        }
        // the call lands in the next block at the earliest
        leg.htlc.clone().revert(leg.locker, heights[side_index(side)] + 1)?;

        self.attest(&mut swap.instance, side).await?;
        let tx_hash = self.submit(&swap.instance, side, Action::Revert).await?;
        swap.instance.leg_mut(side).submitted_tx = Some(tx_hash);
        swap.instance.touch();
        self.store.save_swap(&swap.instance).await?;
        Ok(tx_hash)
    }

    /// Release every leg this process can claim now
    pub async fn claim(&self, swap_id: SwapId) -> SwapResult<Vec<H256>> {
        let entry = self
            .entry(swap_id)
            .ok_or_else(|| SwapError::SwapNotFound(swap_id.to_string()))?;
        let mut swap = entry.lock().await;
        let heights = self.refresh(&mut swap.instance).await?;

        let mut submitted = Vec::new();
        let mut foreign = None;
        for side in [Side::B, Side::A] {
            let leg = swap.instance.leg(side);
            if leg.submitted_tx.is_some() {
                continue;
            }
            if swap.instance.role.claims(side)
                && leg.lock_state() == LockState::Locked
                && !terms_match(&swap.instance, side)
            {
                foreign = Some(side);
                continue;
            }
            let Some(secret) = self.claimable(&swap, side, heights) else {
                continue;
            };
            leg.htlc.clone().release(secret, heights[side_index(side)] + 1)?;

            self.attest(&mut swap.instance, side).await?;
            let tx_hash = self.submit(&swap.instance, side, Action::Release(secret)).await?;
            swap.instance.leg_mut(side).submitted_tx = Some(tx_hash);
            submitted.push(tx_hash);
        }

        if let (true, Some(side)) = (submitted.is_empty(), foreign) {
            return Err(SwapError::TermsMismatch(format!(
                "leg {} of swap {} is locked with terms other than the negotiated ones",
                side, swap_id
            )));
        }
        if submitted.is_empty() {
            return Err(SwapError::InvalidStateTransition {
                from: swap.instance.status.to_string(),
                to: SwapStatus::Released.to_string(),
            });
        }

        swap.instance.touch();
        self.store.save_swap(&swap.instance).await?;
        Ok(submitted)
    }

    /// Report a terminal swap and drop it from the active set
    async fn finish(&self, instance: &SwapInstance) -> SwapResult<()> {
        for leg in instance.legs() {
            let outcome = leg.lock_state();
            let to_account = if outcome == LockState::Released {
                leg.counterparty
            } else {
                leg.locker
            };
            self.settlement
                .create_instruction(SettlementInstruction {
                    system_id: self.config.settlement_system_id.clone(),
                    trade_id: instance.trade_id.clone(),
                    from_account: leg.locker,
                    to_account,
                    operation_id: format!("{}:{}", instance.swap_id, leg.side),
                    chain_id: leg.chain_id(),
                    leg_id: leg.leg_id,
                    outcome,
                    created_at: Utc::now(),
                })
                .await?;
        }

        self.store.delete_swap(instance.swap_id).await?;
        self.active.remove(&instance.swap_id);
        for leg in instance.legs() {
            self.legs.remove(&leg.leg_id);
        }
        self.finished.insert(instance.swap_id, instance.clone());
        crate::metrics::set_active_swaps(self.active.len());

        info!("Swap {} finished as {}", instance.swap_id, instance.status);
        Ok(())
    }

    /// Current view of a swap, active or recently finished
    pub async fn get_swap(&self, swap_id: SwapId) -> SwapResult<SwapInstance> {
        if let Some(entry) = self.entry(swap_id) {
            return Ok(entry.lock().await.instance.clone());
        }
        if let Some(instance) = self.finished.get(&swap_id) {
            return Ok(instance.clone());
        }
        self.store
            .load_swap(swap_id)
            .await?
            .ok_or_else(|| SwapError::SwapNotFound(swap_id.to_string()))
    }

    pub fn active_swaps(&self) -> Vec<SwapId> {
        self.active.iter().map(|e| *e.key()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Main coordination loop
    pub async fn run(&self) -> SwapResult<()> {
        let mut event_rx = self.chains.subscribe_events();
        let mut poll_interval = interval(Duration::from_millis(self.config.poll_interval_ms));
        let mut cleanup_interval = interval(Duration::from_secs(300));

        info!("Swap coordinator {} started", self.config.instance_id);

        loop {
            if *self.shutdown.read().await {
                break;
            }

            tokio::select! {
                Ok(event) = event_rx.recv() => {
                    self.handle_event(event).await;
                }

                _ = poll_interval.tick() => {
                    self.advance_all().await;
                }

                _ = cleanup_interval.tick() => {
                    self.cleanup().await;
                }
            }
        }

        info!("Swap coordinator stopped");
        Ok(())
    }

    async fn handle_event(&self, event: EscrowEvent) {
        let Some(swap_id) = self.legs.get(&event.leg_id).map(|e| *e.value()) else {
            return;
        };
        debug!("Escrow event {} for swap {}", event.name(), swap_id);

        if let Err(e) = self.advance(swap_id).await {
            error!("Error advancing swap {}: {}", swap_id, e);
        }
    }

    /// Advance every active swap concurrently
    pub async fn advance_all(&self) {
        let ids = self.active_swaps();
        let results = futures::future::join_all(ids.iter().map(|id| self.advance(*id))).await;

        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                error!("Error advancing swap {}: {}", id, e);
            }
        }
    }

    /// Drop old finished swaps and trim chain caches
    pub async fn cleanup(&self) {
        let cutoff = Utc::now() - ChronoDuration::seconds(FINISHED_RETENTION_SECS);
        self.finished.retain(|_, s| s.updated_at > cutoff);
        self.chains.cleanup_caches().await;
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }
}

fn side_index(side: Side) -> usize {
    match side {
        Side::A => 0,
        Side::B => 1,
    }
}

/// Whether the lock observed on `side` carries the negotiated terms
fn terms_match(instance: &SwapInstance, side: Side) -> bool {
    let leg = instance.leg(side);
    leg.htlc.terms() == Some(&leg.expected_terms(instance.secret_hash))
}

/// Replay one finalized escrow event onto its leg. Events the escrow rules
/// reject are logged and skipped.
fn apply_event(instance: &mut SwapInstance, side: Side, event: &EscrowEvent) {
    let swap_id = instance.swap_id;
    let expected = instance.leg(side).expected_terms(instance.secret_hash);
    let leg = instance.leg_mut(side);

    let result: SwapResult<Option<Secret>> = match &event.kind {
        EscrowEventKind::Locked {
            secret_hash,
            expiry,
            counterparty,
            locker,
        } => {
            let terms = LockTerms {
                secret_hash: *secret_hash,
                expiry: *expiry,
                counterparty: *counterparty,
                locker: *locker,
            };
            if terms != expected {
                warn!(
                    "Swap {}: leg {} locked with unexpected terms {:?}",
                    swap_id, side, terms
                );
            }
            leg.htlc.lock(terms, event.block_number).map(|_| {
                leg.lock_tx_ref = Some(event.tx_hash);
                None
            })
        }
        EscrowEventKind::Released { secret } => leg.htlc.release(*secret, event.block_number).map(Some),
        EscrowEventKind::Reverted => {
            let locker = leg.htlc.terms().map(|t| t.locker).unwrap_or(leg.locker);
            leg.htlc.revert(locker, event.block_number).map(|_| None)
        }
    };

    match result {
        Ok(revealed) => {
            leg.submitted_tx = None;
            debug!(
                "Swap {}: leg {} is {} (block {})",
                swap_id,
                side,
                leg.lock_state(),
                event.block_number
            );
            if let Some(secret) = revealed {
                if let Err(e) = instance.reveal(secret) {
                    warn!("Swap {}: release on leg {} revealed a foreign secret: {}", swap_id, side, e);
                }
            }
        }
        Err(e) => error!(
            "Swap {}: ignoring {} on leg {} at block {}: {}",
            swap_id,
            event.name(),
            side,
            event.block_number,
            e
        ),
    }
}

/// Swap status implied by the legs' lock states and the chain heights
fn derive_status(instance: &SwapInstance, heights: [u64; 2]) -> SwapStatus {
    use LockState::*;

    if matches!(instance.status, SwapStatus::Abandoned | SwapStatus::Rejected) {
        return instance.status;
    }

    let (a, b) = (instance.side_a.lock_state(), instance.side_b.lock_state());
    match (a, b) {
        (Released, Released) => SwapStatus::Released,
        (Released, Reverted) | (Reverted, Released) => {
            warn!(
                "Swap {} settled one leg and reverted the other (A {}, B {})",
                instance.swap_id, a, b
            );
            SwapStatus::Released
        }
        (Reverted, Reverted) | (Reverted, Unlocked) | (Unlocked, Reverted) => SwapStatus::Reverted,
        _ if instance.secret().is_some() => SwapStatus::Revealed,
        (Locked, Locked)
            if !instance.side_a.is_expired_at(heights[0]) && !instance.side_b.is_expired_at(heights[1]) =>
        {
            SwapStatus::LockedBoth
        }
        _ => {
            let expired = instance
                .legs()
                .iter()
                .zip(heights)
                .any(|(leg, h)| leg.lock_state() == Locked && leg.is_expired_at(h));
            if expired || a == Reverted || b == Reverted {
                SwapStatus::Expired
            } else {
                SwapStatus::Pending
            }
        }
    }
}
