// Liquidity Pool Manager
//
// One pool per configured currency, each behind its own tokio mutex that is
// held across collaborator awaits. Operations on different currencies never
// contend. Address rotation sets sit beside the pools under parking_lot
// locks and are only touched while the matching pool lock is held or for a
// single atomic claim.

pub mod liquidity;
pub mod optimizer;
pub mod rotation;
pub mod routing;
pub mod selection;

pub use liquidity::{LiquidityPool, LiquidityStatus, PoolHealth, PoolStatistics};
pub use optimizer::{OptimizationPlan, RebalanceAction, SkewReport};
pub use rotation::AddressRotation;
pub use routing::RoutePlanner;
pub use selection::{select_participants, Selection};

use crate::collaborators::Collaborators;
use crate::config::MixerConfig;
use crate::error::{MixerError, Result};
use crate::events::PoolEvent;
use crate::model::{
    Amount, Currency, EntryId, EntryStatus, KeyId, MixId, MixRequest, MixStatus, MixingRecord,
    MixingTransaction, PoolEntry, RoutingPath, SessionId, SourceAllocation, TransactionId,
    TransactionStatus,
};
use crate::state::Lifecycle;
use crate::tx::{sign_and_broadcast, TxInput, TxOutput, TxPurpose, UnsignedTransaction};
use crate::util::retry::bounded;
use crate::util::time::Clock;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// In-flight mixing round. Dropping it before `commit` puts every
/// participant back and frees the claimed hop addresses, including when
/// the round future itself is dropped mid-await.
struct RoundRollback<'a> {
    pool: &'a mut LiquidityPool,
    rotation: &'a AddressRotation,
    snapshot: Vec<PoolEntry>,
    claimed: Vec<(String, KeyId)>,
    armed: bool,
}

impl<'a> RoundRollback<'a> {
    fn begin(pool: &'a mut LiquidityPool, rotation: &'a AddressRotation, snapshot: Vec<PoolEntry>) -> Self {
        for participant in &snapshot {
            if let Some(entry) = pool.entry_mut(&participant.id) {
                entry.status = EntryStatus::Mixing;
            }
        }
        Self {
            pool,
            rotation,
            snapshot,
            claimed: Vec::new(),
            armed: true,
        }
    }

    fn commit(mut self) -> (Vec<PoolEntry>, Vec<(String, KeyId)>) {
        self.armed = false;
        (
            std::mem::take(&mut self.snapshot),
            std::mem::take(&mut self.claimed),
        )
    }
}

impl Drop for RoundRollback<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for (address, _) in &self.claimed {
            self.rotation.release(address);
        }
        for previous in self.snapshot.drain(..) {
            let id = previous.id;
            if let Some(entry) = self.pool.entry_mut(&id) {
                *entry = previous;
            }
        }
        self.pool.recompute();
        self.pool.set_needs_mixing(true);
    }
}

pub struct PoolManager {
    config: MixerConfig,
    collaborators: Collaborators,
    clock: Arc<dyn Clock>,
    pools: BTreeMap<Currency, Mutex<LiquidityPool>>,
    rotations: HashMap<Currency, AddressRotation>,
    transactions: RwLock<HashMap<TransactionId, MixingTransaction>>,
    router: RoutePlanner,
    events: mpsc::UnboundedSender<PoolEvent>,
}

impl PoolManager {
    pub fn new(
        config: MixerConfig,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
        events: mpsc::UnboundedSender<PoolEvent>,
    ) -> Result<Self> {
        config.validate()?;
        let now = clock.now_ms();
        let pools = config
            .currencies
            .iter()
            .map(|(currency, limits)| {
                let pool = LiquidityPool::new(currency.clone(), limits.clone(), now);
                (currency.clone(), Mutex::new(pool))
            })
            .collect();
        let rotations = config
            .currencies
            .keys()
            .map(|currency| (currency.clone(), AddressRotation::new()))
            .collect();
        let router = RoutePlanner::new(config.pool.routing)?;
        Ok(Self {
            config,
            collaborators,
            clock,
            pools,
            rotations,
            transactions: RwLock::new(HashMap::new()),
            router,
            events,
        })
    }

    pub fn currencies(&self) -> impl Iterator<Item = &Currency> {
        self.pools.keys()
    }

    fn pool(&self, currency: &Currency) -> Result<&Mutex<LiquidityPool>> {
        self.pools
            .get(currency)
            .ok_or_else(|| MixerError::Validation(format!("unsupported currency {}", currency)))
    }

    fn rotation(&self, currency: &Currency) -> Result<&AddressRotation> {
        self.rotations
            .get(currency)
            .ok_or_else(|| MixerError::Validation(format!("unsupported currency {}", currency)))
    }

    fn publish(&self, event: PoolEvent) {
        if self.events.send(event).is_err() {
            debug!("pool event dropped, no receiver");
        }
    }

    /// Upper bound on a single collaborator call.
    fn call_limit(&self) -> Duration {
        self.config.orchestrator.retry.timeout
    }

    async fn save_entry(&self, entry: &PoolEntry) -> Result<()> {
        bounded(
            self.call_limit(),
            "persistence",
            self.collaborators.persistence.save_entry(entry),
        )
        .await
    }

    async fn persist(&self, entry: &PoolEntry) {
        if let Err(e) = self.save_entry(entry).await {
            error!("failed to persist pool entry {}: {}", entry.id, e);
        }
    }

    async fn mint_address(&self, currency: &Currency) -> Result<(String, KeyId)> {
        let limit = self.call_limit();
        let custody = self.collaborators.custody.as_ref();
        let key_id = bounded(limit, "key custody", custody.generate_key(currency)).await?;
        let public_key = bounded(limit, "key custody", custody.get_public_key(&key_id)).await?;
        let address = bounded(
            limit,
            "blockchain address",
            self.collaborators.chain.generate_address(currency, &public_key),
        )
        .await?;
        debug!("minted {} rotation address {}", currency, address);
        Ok((address, key_id))
    }

    /// Claim a free rotating address, minting one when the set is exhausted.
    async fn claim_address(&self, currency: &Currency) -> Result<(String, KeyId)> {
        let rotation = self.rotation(currency)?;
        if let Some(claimed) = rotation.claim() {
            return Ok(claimed);
        }
        let (address, key_id) = self.mint_address(currency).await?;
        rotation.insert_claimed(address.clone(), key_id.clone());
        Ok((address, key_id))
    }

    async fn hop_candidates(
        &self,
        currency: &Currency,
        count: usize,
        exclude: &[String],
    ) -> Result<Vec<String>> {
        let rotation = self.rotation(currency)?;
        let mut hops = rotation.least_used(count, exclude);
        while hops.len() < count {
            let (address, key_id) = self.mint_address(currency).await?;
            rotation.insert_free(address.clone(), key_id);
            hops.push(address);
        }
        Ok(hops)
    }

    /// Admit a deposit into its currency pool.
    ///
    /// An entry for a mix still waiting for its deposit is held out of
    /// selection and counted as reserved until `confirm_deposit`.
    pub async fn add_to_pool(&self, request: &MixRequest) -> Result<PoolEntry> {
        let currency = &request.currency;
        let mut pool = self.pool(currency)?.lock().await;
        if pool.entries().iter().any(|e| e.mix_id == request.id) {
            return Err(MixerError::Validation(format!(
                "mix {} already has a pool entry",
                request.id
            )));
        }
        pool.check_capacity(request.amount)?;

        let (address, key_id) = self.claim_address(currency).await?;
        let now = self.clock.now_ms();
        let entry = PoolEntry {
            id: EntryId::new(),
            mix_id: request.id,
            currency: currency.clone(),
            amount: request.amount,
            original_amount: request.amount,
            address,
            key_id,
            status: EntryStatus::Active,
            history: Vec::new(),
            anonymity_score: 0,
            rounds_completed: 0,
            rounds_required: request.anonymity.mixing_rounds(
                self.config.pool.base_mixing_rounds,
                self.config.pool.high_anonymity_extra_rounds,
            ),
            deposited_at: now,
            awaiting_deposit: request.status == MixStatus::PendingDeposit,
            reserved: 0,
            stale: false,
        };

        if let Err(e) = self.save_entry(&entry).await {
            // A timed-out write may still land; overwrite it so restore skips it
            let mut tombstone = entry.clone();
            tombstone.status = EntryStatus::Withdrawn;
            self.persist(&tombstone).await;
            self.rotation(currency)?.release(&entry.address);
            return Err(e);
        }
        pool.insert(entry.clone(), now);
        if let Err(e) = pool.verify() {
            error!("pool invariant violated after deposit: {}", e);
        }
        info!(
            "{} entry {} added for mix {} ({} units, total {})",
            currency,
            entry.id,
            entry.mix_id,
            entry.amount,
            pool.total()
        );
        drop(pool);

        if !entry.awaiting_deposit {
            self.mix_opportunistically(currency).await;
        }
        Ok(entry)
    }

    /// Release the deposit hold and run any round the pool now supports.
    ///
    /// Round failures are logged and left to the next sweep.
    pub async fn confirm_deposit(&self, currency: &Currency, entry_id: &EntryId) -> Result<PoolEntry> {
        let updated = self.release_hold(currency, entry_id).await?;
        self.mix_opportunistically(currency).await;
        Ok(updated)
    }

    /// Release the deposit hold once funds arrived on chain. Idempotent.
    ///
    /// Never starts a round, so a caller may retry it freely.
    pub async fn release_hold(&self, currency: &Currency, entry_id: &EntryId) -> Result<PoolEntry> {
        let mut pool = self.pool(currency)?.lock().await;
        let now = self.clock.now_ms();
        let entry = pool
            .entry_mut(entry_id)
            .ok_or_else(|| MixerError::not_found("pool entry", entry_id))?;
        if !entry.awaiting_deposit {
            return Ok(entry.clone());
        }
        if entry.status != EntryStatus::Active {
            return Err(MixerError::invalid_state(entry.status, EntryStatus::Active));
        }
        let previous = entry.clone();
        entry.awaiting_deposit = false;
        entry.deposited_at = now;
        let updated = entry.clone();

        if let Err(e) = self.save_entry(&updated).await {
            if let Some(entry) = pool.entry_mut(entry_id) {
                *entry = previous;
            }
            return Err(e);
        }
        pool.touch(now);
        pool.recompute();
        debug!("{} entry {} deposit confirmed", currency, entry_id);
        Ok(updated)
    }

    /// Remove an entry that never entered a round. Its address is retired.
    pub async fn withdraw_entry(&self, currency: &Currency, entry_id: &EntryId) -> Result<PoolEntry> {
        let mut pool = self.pool(currency)?.lock().await;
        let entry = pool
            .entry_mut(entry_id)
            .ok_or_else(|| MixerError::not_found("pool entry", entry_id))?;
        if entry.status != EntryStatus::Active || entry.rounds_completed > 0 || entry.reserved > 0 {
            return Err(MixerError::invalid_state(
                format!("{} after {} rounds", entry.status, entry.rounds_completed),
                EntryStatus::Withdrawn,
            ));
        }
        let previous = entry.clone();
        entry.status = EntryStatus::Withdrawn;
        entry.awaiting_deposit = false;
        let withdrawn = entry.clone();

        if let Err(e) = self.save_entry(&withdrawn).await {
            if let Some(entry) = pool.entry_mut(entry_id) {
                *entry = previous;
            }
            return Err(e);
        }
        self.rotation(currency)?.retire(&withdrawn.address);
        pool.archive_terminal();
        pool.touch(self.clock.now_ms());
        info!(
            "{} entry {} withdrawn ({} units released)",
            currency, entry_id, withdrawn.amount
        );
        Ok(withdrawn)
    }

    async fn mix_opportunistically(&self, currency: &Currency) {
        if let Err(e) = self.try_mix(currency).await {
            warn!("{} opportunistic mixing failed: {}", currency, e);
        }
    }

    /// Run as many rounds as the pool currently supports.
    ///
    /// Returns the number of rounds executed. Too few candidates is not an
    /// error: the pool is flagged and retried by the next sweep.
    pub async fn try_mix(&self, currency: &Currency) -> Result<usize> {
        let mut pool = self.pool(currency)?.lock().await;
        let mix_target = pool.limits().mix_target;
        let mut used = HashSet::new();
        let mut rounds = 0;

        loop {
            match select_participants(pool.entries(), mix_target, &self.config.selection, &used) {
                Selection::Ready(ids) => {
                    used.extend(ids.iter().copied());
                    if let Err(e) = self.process_chunk(&mut pool, &ids).await {
                        pool.set_needs_mixing(true);
                        return Err(e);
                    }
                    rounds += 1;
                }
                Selection::Insufficient { candidates } => {
                    if rounds == 0 && candidates > 0 && !pool.needs_mixing() {
                        debug!(
                            "{} round deferred: {} candidates below the participant minimum",
                            currency, candidates
                        );
                        self.publish(PoolEvent::RoundDeferred {
                            currency: currency.clone(),
                            candidates,
                        });
                    }
                    pool.set_needs_mixing(rounds == 0 && candidates > 0);
                    break;
                }
            }
        }
        Ok(rounds)
    }

    /// Execute one mixing round over `ids`, restoring every participant on failure.
    async fn process_chunk(&self, pool: &mut LiquidityPool, ids: &[EntryId]) -> Result<MixingTransaction> {
        let currency = pool.currency().clone();
        let snapshot: Vec<PoolEntry> = ids.iter().filter_map(|id| pool.entry(id).cloned()).collect();
        if snapshot.len() != ids.len() {
            return Err(MixerError::not_found("pool entry", "selected participant"));
        }
        for participant in &snapshot {
            participant.status.validate_transition(EntryStatus::Mixing)?;
        }

        let rotation = self.rotation(&currency)?;
        let session_id = SessionId::new();
        let mut round = RoundRollback::begin(pool, rotation, snapshot);
        let outcome = self
            .route_and_broadcast(&currency, &round.snapshot, session_id, &mut round.claimed)
            .await;
        let (routing, tx_hash) = match outcome {
            Ok(done) => done,
            Err(e) => {
                drop(round);
                warn!("{} mixing round rolled back: {}", currency, e);
                return Err(e);
            }
        };
        let (snapshot, claimed) = round.commit();

        let now = self.clock.now_ms();
        let transaction_id = TransactionId::new();
        let increment = self.config.pool.score_increment;
        let mut participants = Vec::with_capacity(snapshot.len());
        let mut finished = Vec::new();
        let mut updated = Vec::with_capacity(snapshot.len());

        for ((previous, path), (final_hop, final_key)) in snapshot.iter().zip(&routing).zip(claimed) {
            let Some(entry) = pool.entry_mut(&previous.id) else {
                continue;
            };
            rotation.release(&entry.address);
            entry.address = final_hop;
            entry.key_id = final_key;
            entry.rounds_completed += 1;
            entry.anonymity_score = entry.anonymity_score.saturating_add(increment);
            entry.history.push(MixingRecord {
                session_id,
                transaction_id,
                round: entry.rounds_completed,
                anonymity_set: snapshot.len(),
                score_after: entry.anonymity_score,
                at: now,
            });
            debug_assert_eq!(path.final_hop(), Some(entry.address.as_str()));
            if entry.rounds_remaining() > 0 {
                entry.status = EntryStatus::Active;
            } else {
                finished.push((entry.mix_id, entry.id));
            }
            participants.push(entry.mix_id);
            updated.push(entry.clone());
        }
        for entry in &updated {
            self.persist(entry).await;
        }

        let volume: Amount = snapshot.iter().map(|e| e.amount).sum();
        let transaction = MixingTransaction {
            id: transaction_id,
            session_id,
            currency: currency.clone(),
            participants: ids.to_vec(),
            input_amount: volume,
            output_amount: volume,
            routing,
            tx_hash: Some(tx_hash),
            status: TransactionStatus::Completed,
            created_at: now,
        };
        let saved = bounded(
            self.call_limit(),
            "persistence",
            self.collaborators.persistence.save_transaction(&transaction),
        )
        .await;
        if let Err(e) = saved {
            error!("failed to persist mixing transaction {}: {}", transaction.id, e);
        }
        self.transactions
            .write()
            .insert(transaction.id, transaction.clone());

        pool.record_round(volume, now);
        pool.recompute();
        if let Err(e) = pool.verify() {
            error!("pool invariant violated after round: {}", e);
        }
        info!(
            "{} round {} mixed {} units across {} participants ({} finished)",
            currency,
            transaction.id,
            volume,
            participants.len(),
            finished.len()
        );
        self.publish(PoolEvent::RoundCompleted {
            currency,
            transaction_id,
            participants,
            finished,
        });
        Ok(transaction)
    }

    async fn route_and_broadcast(
        &self,
        currency: &Currency,
        participants: &[PoolEntry],
        session_id: SessionId,
        claimed: &mut Vec<(String, KeyId)>,
    ) -> Result<(Vec<RoutingPath>, String)> {
        let mut routing = Vec::with_capacity(participants.len());
        for participant in participants {
            let hop_count = self.router.select_hop_count();
            let (final_hop, final_key) = self.claim_address(currency).await?;
            claimed.push((final_hop.clone(), final_key));
            let exclude = [participant.address.clone(), final_hop.clone()];
            let intermediates = self.hop_candidates(currency, hop_count - 1, &exclude).await?;
            routing.push(self.router.build(participant.id, intermediates, final_hop)?);
        }

        let body = UnsignedTransaction {
            currency: currency.clone(),
            inputs: participants
                .iter()
                .map(|p| TxInput {
                    address: p.address.clone(),
                    amount: p.amount,
                    key_id: p.key_id.clone(),
                })
                .collect(),
            outputs: participants
                .iter()
                .zip(&claimed[..])
                .map(|(p, (address, _))| TxOutput {
                    address: address.clone(),
                    amount: p.amount,
                })
                .collect(),
            purpose: TxPurpose::MixingRound(session_id),
        };
        let hash = sign_and_broadcast(
            self.collaborators.custody.as_ref(),
            self.collaborators.chain.as_ref(),
            body,
            self.call_limit(),
        )
        .await?;
        Ok((routing, hash))
    }

    /// Earmark settled funds covering `amount`, highest anonymity score first.
    pub async fn reserve_sources(&self, currency: &Currency, amount: Amount) -> Result<Vec<SourceAllocation>> {
        if amount == 0 {
            return Err(MixerError::Validation(
                "cannot reserve a zero amount".to_string(),
            ));
        }
        let mut pool = self.pool(currency)?.lock().await;
        let min_score = self.config.pool.min_distribution_score;

        let mut eligible: Vec<&PoolEntry> = pool
            .entries()
            .iter()
            .filter(|e| e.is_settled() && e.available() > 0 && e.anonymity_score >= min_score)
            .collect();
        let available: Amount = eligible.iter().map(|e| e.available()).sum();
        if available < amount {
            return Err(MixerError::InsufficientFunds {
                currency: currency.clone(),
                requested: amount,
                available,
            });
        }
        eligible.sort_by(|a, b| {
            b.anonymity_score
                .cmp(&a.anonymity_score)
                .then(a.deposited_at.cmp(&b.deposited_at))
        });

        let mut remaining = amount;
        let mut allocations = Vec::new();
        for entry in eligible {
            let take = entry.available().min(remaining);
            allocations.push(SourceAllocation {
                entry_id: entry.id,
                address: entry.address.clone(),
                key_id: entry.key_id.clone(),
                amount: take,
            });
            remaining -= take;
            if remaining == 0 {
                break;
            }
        }

        let mut touched = Vec::with_capacity(allocations.len());
        for allocation in &allocations {
            if let Some(entry) = pool.entry_mut(&allocation.entry_id) {
                entry.reserved += allocation.amount;
                touched.push(entry.clone());
            }
        }
        for (saved, entry) in touched.iter().enumerate() {
            if let Err(e) = self.save_entry(entry).await {
                for allocation in &allocations {
                    if let Some(entry) = pool.entry_mut(&allocation.entry_id) {
                        entry.reserved = entry.reserved.saturating_sub(allocation.amount);
                    }
                }
                for persisted in &touched[..saved] {
                    if let Some(current) = pool.entry(&persisted.id).cloned() {
                        self.persist(&current).await;
                    }
                }
                pool.recompute();
                return Err(e);
            }
        }
        pool.recompute();
        if let Err(e) = pool.verify() {
            error!("pool invariant violated after reservation: {}", e);
        }
        debug!(
            "{} reserved {} units from {} entries",
            currency,
            amount,
            allocations.len()
        );
        Ok(allocations)
    }

    /// Debit allocations whose release was broadcast. Emptied entries are archived.
    pub async fn settle_sources(&self, currency: &Currency, allocations: &[SourceAllocation]) -> Result<()> {
        let mut pool = self.pool(currency)?.lock().await;
        let rotation = self.rotation(currency)?;
        let mut missing = None;
        let mut updated = Vec::with_capacity(allocations.len());

        for allocation in allocations {
            let Some(entry) = pool.entry_mut(&allocation.entry_id) else {
                missing = Some(allocation.entry_id);
                continue;
            };
            entry.reserved = entry.reserved.saturating_sub(allocation.amount);
            entry.amount = entry.amount.saturating_sub(allocation.amount);
            if entry.amount == 0 && entry.status.can_transition_to(EntryStatus::Distributed) {
                entry.status = EntryStatus::Distributed;
                rotation.release(&entry.address);
            }
            updated.push(entry.clone());
        }
        for entry in &updated {
            self.persist(entry).await;
        }
        let archived = pool.archive_terminal();
        pool.touch(self.clock.now_ms());
        if let Err(e) = pool.verify() {
            error!("pool invariant violated after settlement: {}", e);
        }
        if !archived.is_empty() {
            debug!("{} archived {} distributed entries", currency, archived.len());
        }
        match missing {
            Some(id) => Err(MixerError::not_found("pool entry", id)),
            None => Ok(()),
        }
    }

    /// Return reservations of a release that will not happen.
    pub async fn release_sources(&self, currency: &Currency, allocations: &[SourceAllocation]) -> Result<()> {
        let mut pool = self.pool(currency)?.lock().await;
        let mut updated = Vec::with_capacity(allocations.len());
        for allocation in allocations {
            if let Some(entry) = pool.entry_mut(&allocation.entry_id) {
                entry.reserved = entry.reserved.saturating_sub(allocation.amount);
                updated.push(entry.clone());
            }
        }
        for entry in &updated {
            self.persist(entry).await;
        }
        pool.recompute();
        Ok(())
    }

    /// Unreserved settled funds that could back a payout or consolidation.
    pub async fn distributable(&self, currency: &Currency) -> Result<Amount> {
        let pool = self.pool(currency)?.lock().await;
        Ok(pool.distributable(self.config.pool.min_distribution_score))
    }

    pub async fn pool_statistics(&self, currency: &Currency) -> Result<PoolStatistics> {
        let pool = self.pool(currency)?.lock().await;
        let mut stats = pool.statistics(self.clock.now_ms());
        stats.rotation_addresses = self.rotation(currency)?.len();
        Ok(stats)
    }

    pub async fn liquidity_status(&self, currency: &Currency) -> Result<LiquidityStatus> {
        Ok(self.pool(currency)?.lock().await.status())
    }

    pub async fn entries(&self, currency: &Currency) -> Result<Vec<PoolEntry>> {
        Ok(self.pool(currency)?.lock().await.entries().to_vec())
    }

    pub async fn entry(&self, currency: &Currency, id: &EntryId) -> Result<Option<PoolEntry>> {
        Ok(self.pool(currency)?.lock().await.entry(id).cloned())
    }

    /// Live entry owned by a mix, if it is still pooled.
    pub async fn entry_for_mix(&self, currency: &Currency, mix_id: &MixId) -> Result<Option<PoolEntry>> {
        let pool = self.pool(currency)?.lock().await;
        Ok(pool.entries().iter().find(|e| e.mix_id == *mix_id).cloned())
    }

    pub fn transaction(&self, id: &TransactionId) -> Option<MixingTransaction> {
        self.transactions.read().get(id).cloned()
    }

    /// Attempt rounds in every pool. Failures are logged per currency.
    pub async fn sweep(&self) -> usize {
        let mut rounds = 0;
        for currency in self.pools.keys() {
            match self.try_mix(currency).await {
                Ok(n) => rounds += n,
                Err(e) => warn!("{} mixing sweep failed: {}", currency, e),
            }
        }
        rounds
    }

    /// Analyze every pool and act on the plans outside the pool locks.
    pub async fn optimize(&self) -> Vec<OptimizationPlan> {
        let now = self.clock.now_ms();
        let mut plans = Vec::with_capacity(self.pools.len());
        for (currency, lock) in &self.pools {
            let plan = {
                let mut pool = lock.lock().await;
                let stale = optimizer::mark_stale(&mut pool, now, &self.config.pool);
                if let Err(e) = pool.verify() {
                    error!("{} pool invariant violated: {}", currency, e);
                }
                optimizer::analyze(&pool, stale, &self.config.pool)
            };

            if !plan.stale.is_empty() {
                warn!(
                    "{} has {} entries older than the maximum pool age",
                    currency,
                    plan.stale.len()
                );
            }
            if plan.skew.skewed {
                warn!(
                    "{} pool size distribution skewed (cv {:.2}, largest share {:.2})",
                    currency, plan.skew.coefficient_of_variation, plan.skew.largest_share
                );
            }
            if let Some(action) = plan.action {
                info!("{} rebalance needed: {:?}", currency, action);
                self.publish(PoolEvent::Rebalance(plan.clone()));
            }
            if plan.requeue {
                self.mix_opportunistically(currency).await;
            }
            plans.push(plan);
        }
        plans
    }

    /// Rebuild pools from persisted live entries. Pools that already hold
    /// entries are left alone.
    pub async fn restore(&self) -> Result<usize> {
        let mut restored = 0;
        for (currency, lock) in &self.pools {
            let mut pool = lock.lock().await;
            if !pool.entries().is_empty() {
                continue;
            }
            let persistence = &self.collaborators.persistence;
            let mut entries = persistence
                .entries_by_status(currency, EntryStatus::Active)
                .await?;
            entries.extend(
                persistence
                    .entries_by_status(currency, EntryStatus::Mixing)
                    .await?,
            );
            entries.sort_by_key(|e| (e.deposited_at, e.id));

            let rotation = self.rotation(currency)?;
            let now = self.clock.now_ms();
            for entry in entries {
                rotation.insert_claimed(entry.address.clone(), entry.key_id.clone());
                pool.insert(entry, now);
                restored += 1;
            }
            if let Err(e) = pool.verify() {
                error!("{} restored pool inconsistent: {}", currency, e);
            }
        }
        if restored > 0 {
            info!("restored {} pool entries from persistence", restored);
        }
        Ok(restored)
    }
}
