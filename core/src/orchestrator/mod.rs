// Mix Orchestrator
//
// Public entry point of the engine. Owns per-mix tracking state and drives
// the pool manager and scheduler. The tracker lock is never held across a
// pool call that can wait behind a mixing round: state is read, the lock is
// dropped for the pool or scheduler call, then status is re-checked under a
// fresh lock before transitioning. Pool and scheduler events are dispatched
// one at a time. Lifecycle events are emitted while the tracker lock that
// performed the transition is held.

pub mod admission;
pub mod pipeline;
pub mod tracker;

pub use admission::{AdmissionGate, AdmissionSlot};
pub use pipeline::{MixPhase, PhasePlan};
pub use tracker::{OrchestratorStatistics, TrackedMix, Tracker};

use crate::collaborators::{CollaboratorRegistry, Collaborators};
use crate::config::MixerConfig;
use crate::error::{MixerError, Result};
use crate::events::{EventBus, LifecycleEvent, PoolEvent, SchedulerEvent};
use crate::model::{
    Amount, CoinJoinParticipant, CoinJoinRequest, ConsolidationRequest, Currency, Destination,
    DistributionRequest, EntryId, MixId, MixOrder, MixRequest, MixStatus, OperationId,
    OperationStatus, ScheduledOperation, SourceAllocation,
};
use crate::pool::{OptimizationPlan, PoolManager, RebalanceAction};
use crate::scheduler::OperationScheduler;
use crate::state::Lifecycle;
use crate::util::retry::{retry, with_retry};
use crate::util::time::{duration_ms, Clock, SystemClock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Buffered lifecycle events per subscriber before it lags
const EVENT_CAPACITY: usize = 1024;

/// What one background cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub deposits_confirmed: usize,
    pub expired: usize,
    pub rounds: usize,
    pub operations_executed: usize,
    pub events_handled: usize,
}

/// Payout work prepared without the tracker lock and recorded under it.
#[derive(Default)]
struct PayoutPlan {
    scheduled: Vec<(OperationId, MixId, Vec<Destination>)>,
    ready: Vec<MixId>,
    failed: Vec<(MixId, String)>,
}

struct Driver {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct MixOrchestrator {
    config: MixerConfig,
    collaborators: Collaborators,
    clock: Arc<dyn Clock>,
    pools: PoolManager,
    scheduler: OperationScheduler,
    admission: Arc<AdmissionGate>,
    events: EventBus,
    tracker: Mutex<Tracker>,
    pool_events: Mutex<mpsc::UnboundedReceiver<PoolEvent>>,
    scheduler_events: Mutex<mpsc::UnboundedReceiver<SchedulerEvent>>,
    dispatch: Mutex<()>,
    driver: Mutex<Option<Driver>>,
    restored: AtomicBool,
    created_at: u64,
    last_optimization: AtomicU64,
}

impl MixOrchestrator {
    pub fn new(config: MixerConfig, registry: &CollaboratorRegistry) -> Result<Arc<Self>> {
        Self::with_clock(config, registry, Arc::new(SystemClock))
    }

    /// Build the engine. Fails with a configuration error on invalid settings
    /// or a missing collaborator.
    pub fn with_clock(
        config: MixerConfig,
        registry: &CollaboratorRegistry,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let collaborators = registry.resolve()?;
        let (pool_tx, pool_rx) = mpsc::unbounded_channel();
        let (scheduler_tx, scheduler_rx) = mpsc::unbounded_channel();
        let pools = PoolManager::new(config.clone(), collaborators.clone(), clock.clone(), pool_tx)?;
        let scheduler = OperationScheduler::new(
            &config.scheduler,
            collaborators.clone(),
            clock.clone(),
            scheduler_tx,
        )?
        .with_call_timeout(config.orchestrator.retry.timeout);
        let events = EventBus::new(EVENT_CAPACITY, collaborators.events.clone());
        let now = clock.now_ms();
        Ok(Arc::new(Self {
            admission: AdmissionGate::new(config.orchestrator.max_concurrent_mixes),
            config,
            collaborators,
            clock,
            pools,
            scheduler,
            events,
            tracker: Mutex::new(Tracker::default()),
            pool_events: Mutex::new(pool_rx),
            scheduler_events: Mutex::new(scheduler_rx),
            dispatch: Mutex::new(()),
            driver: Mutex::new(None),
            restored: AtomicBool::new(false),
            created_at: now,
            last_optimization: AtomicU64::new(now),
        }))
    }

    pub fn config(&self) -> &MixerConfig {
        &self.config
    }

    pub fn pool_manager(&self) -> &PoolManager {
        &self.pools
    }

    pub fn scheduler(&self) -> &OperationScheduler {
        &self.scheduler
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub async fn is_running(&self) -> bool {
        self.driver.lock().await.is_some()
    }

    /// Restore persisted state on first start and spawn the driver task.
    /// Starting a running orchestrator is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut driver = self.driver.lock().await;
        if driver.is_some() {
            warn!("orchestrator already running");
            return Ok(());
        }
        self.config.validate()?;
        if !self.restored.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.restore().await {
                self.restored.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }

        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(self).drive(rx));
        *driver = Some(Driver { shutdown, handle });
        info!(
            "orchestrator started: {} currencies, tick every {}ms",
            self.config.currencies.len(),
            duration_ms(self.config.orchestrator.tick_interval)
        );
        Ok(())
    }

    /// Signal the driver task and wait for it to finish its current tick.
    pub async fn stop(&self) {
        let Some(driver) = self.driver.lock().await.take() else {
            debug!("orchestrator not running");
            return;
        };
        let _ = driver.shutdown.send(true);
        if let Err(e) = driver.handle.await {
            error!("orchestrator driver task failed: {}", e);
        }
        info!("orchestrator stopped");
    }

    async fn drive(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.orchestrator.tick_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    if report != TickReport::default() {
                        debug!("tick: {:?}", report);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    fn retry_policy(&self) -> &crate::util::retry::RetryPolicy {
        &self.config.orchestrator.retry
    }

    fn net_amount(&self, amount: Amount) -> Amount {
        let fee = (amount as u128 * self.config.orchestrator.fee_bps as u128 / 10_000) as Amount;
        amount - fee.min(amount)
    }

    /// Accept a mix order.
    ///
    /// Returns the new mix id once the deposit address is assigned. A
    /// rejected order leaves no live record behind.
    pub async fn process(&self, order: MixOrder) -> Result<MixId> {
        let slot = self.admission.try_acquire()?;
        let policy = self.retry_policy();

        let verdict = with_retry(policy, "validator", || {
            self.collaborators.validator.validate(&order)
        })
        .await?;
        if !verdict.valid {
            return Err(MixerError::Validation(
                verdict
                    .reason
                    .unwrap_or_else(|| "order rejected".to_string()),
            ));
        }

        let delay_policy = self.scheduler.policy();
        let requested = order
            .delay_ms
            .map(|ms| delay_policy.check_requested(Duration::from_millis(ms), false))
            .transpose()?;
        let assessment = with_retry(policy, "risk assessor", || {
            self.collaborators.risk.analyze_risk(&order)
        })
        .await?;
        let delay = match requested {
            Some(delay) => delay,
            None => delay_policy.clamp(
                with_retry(policy, "risk assessor", || {
                    self.collaborators.risk.generate_optimal_delay()
                })
                .await?,
            ),
        };

        let plan = PhasePlan::for_level(
            order.anonymity,
            &self.config.orchestrator.phases,
            self.config.pool.high_anonymity_extra_rounds,
        );
        let now = self.clock.now_ms();
        let mut request = MixRequest {
            id: MixId::new(),
            currency: order.currency.clone(),
            amount: order.amount,
            payouts: order.payouts.clone(),
            requested_delay_ms: order.delay_ms,
            effective_delay_ms: duration_ms(delay),
            anonymity: order.anonymity,
            status: MixStatus::PendingDeposit,
            risk_score: assessment.score,
            created_at: now,
            expires_at: now.saturating_add(duration_ms(self.config.orchestrator.deposit_window)),
            expected_completion_at: plan.expected_completion(now, delay),
            deposit_address: None,
            failure_reason: None,
            completed_at: None,
        };

        let entry = retry(policy, "pool admission", || self.pools.add_to_pool(&request)).await?;
        request.deposit_address = Some(entry.address.clone());
        if let Err(e) = with_retry(policy, "persistence", || {
            self.collaborators.persistence.save_request(&request)
        })
        .await
        {
            if let Err(undo) = self.pools.withdraw_entry(&request.currency, &entry.id).await {
                error!("failed to withdraw entry {} of rejected mix: {}", entry.id, undo);
            }
            // A timed-out write may still land; restore must not track it
            let mut tombstone = request.clone();
            tombstone.status = MixStatus::Cancelled;
            tombstone.failure_reason = Some(e.to_string());
            if let Err(undo) = with_retry(policy, "persistence", || {
                self.collaborators.persistence.save_request(&tombstone)
            })
            .await
            {
                error!("failed to persist rejection of mix {}: {}", request.id, undo);
            }
            return Err(e);
        }

        let id = request.id;
        let event = LifecycleEvent::MixStarted {
            mix_id: id,
            currency: request.currency.clone(),
            amount: request.amount,
            deposit_address: entry.address.clone(),
            at: now,
        };
        info!(
            "mix {} accepted: {} {} units, risk {} {:?}, delay {}ms",
            id,
            request.currency,
            request.amount,
            assessment.score,
            assessment.flags,
            request.effective_delay_ms
        );
        let mut tracker = self.tracker.lock().await;
        tracker.insert(TrackedMix::new(request, Some(entry.id), Some(slot)));
        self.events.emit(event);
        Ok(id)
    }

    /// Current status of a mix, `None` for an unknown id.
    pub async fn get_status(&self, id: &MixId) -> Option<MixStatus> {
        self.tracker.lock().await.get(id).map(|m| m.request.status)
    }

    pub async fn mix(&self, id: &MixId) -> Option<MixRequest> {
        self.tracker.lock().await.get(id).map(|m| m.request.clone())
    }

    pub async fn statistics(&self) -> OrchestratorStatistics {
        let uptime = self.clock.now_ms().saturating_sub(self.created_at);
        self.tracker
            .lock()
            .await
            .statistics(self.admission.active(), uptime)
    }

    /// Cancel a mix that has not entered a round yet.
    pub async fn cancel(&self, id: &MixId) -> Result<()> {
        let (currency, entry_id) = {
            let tracker = self.tracker.lock().await;
            let mix = tracker
                .get(id)
                .ok_or_else(|| MixerError::not_found("mix", id))?;
            let status = mix.request.status;
            if !status.is_cancellable() {
                return Err(MixerError::invalid_state(status, MixStatus::Cancelled));
            }
            (mix.request.currency.clone(), mix.entry_id)
        };
        // Withdrawal fails for an entry already in a round
        if let Some(entry_id) = entry_id {
            self.pools.withdraw_entry(&currency, &entry_id).await?;
        }

        let mut tracker = self.tracker.lock().await;
        let status = tracker
            .get(id)
            .map(|m| m.request.status)
            .ok_or_else(|| MixerError::not_found("mix", id))?;
        if !status.is_cancellable() {
            return Err(MixerError::invalid_state(status, MixStatus::Cancelled));
        }
        self.transition(&mut tracker, id, MixStatus::Cancelled, None)
            .await
    }

    /// Check the deposit address and release the pool hold once funded.
    pub async fn confirm_deposit(&self, id: &MixId) -> Result<MixStatus> {
        let (currency, address, amount) = {
            let tracker = self.tracker.lock().await;
            let mix = tracker
                .get(id)
                .ok_or_else(|| MixerError::not_found("mix", id))?;
            if mix.request.status != MixStatus::PendingDeposit {
                return Ok(mix.request.status);
            }
            let address = mix.request.deposit_address.clone().ok_or_else(|| {
                MixerError::invalid_state("mix without deposit address", MixStatus::DepositReceived)
            })?;
            (mix.request.currency.clone(), address, mix.request.amount)
        };

        let balance = with_retry(self.retry_policy(), "blockchain balance", || {
            self.collaborators.chain.get_balance(&currency, &address)
        })
        .await?;
        if balance < amount {
            return Ok(MixStatus::PendingDeposit);
        }

        let entry_id = {
            let tracker = self.tracker.lock().await;
            let mix = tracker
                .get(id)
                .ok_or_else(|| MixerError::not_found("mix", id))?;
            if mix.request.status != MixStatus::PendingDeposit {
                return Ok(mix.request.status);
            }
            mix.entry_id
                .ok_or_else(|| MixerError::not_found("pool entry", id))?
        };
        retry(self.retry_policy(), "pool admission", || {
            self.pools.release_hold(&currency, &entry_id)
        })
        .await?;

        // Re-check: the mix may have been cancelled, expired or swept into a
        // round while the tracker was released.
        {
            let mut tracker = self.tracker.lock().await;
            let status = tracker
                .get(id)
                .map(|m| m.request.status)
                .ok_or_else(|| MixerError::not_found("mix", id))?;
            if status != MixStatus::PendingDeposit {
                return Ok(status);
            }
            self.transition(&mut tracker, id, MixStatus::DepositReceived, None)
                .await?;
        }

        if let Err(e) = self.pools.try_mix(&currency).await {
            warn!("{} mixing after deposit of {} failed: {}", currency, id, e);
        }
        Ok(MixStatus::DepositReceived)
    }

    /// Move a tracked mix to `to`, persist it and emit the matching event.
    async fn transition(
        &self,
        tracker: &mut Tracker,
        id: &MixId,
        to: MixStatus,
        reason: Option<String>,
    ) -> Result<()> {
        let now = self.clock.now_ms();
        let mix = tracker
            .get_mut(id)
            .ok_or_else(|| MixerError::not_found("mix", id))?;
        let from = mix.request.status;
        if from == to {
            return Ok(());
        }
        from.validate_transition(to)?;

        let mut updated = mix.request.clone();
        updated.status = to;
        if to == MixStatus::Completed {
            updated.completed_at = Some(now);
        }
        if reason.is_some() {
            updated.failure_reason = reason.clone();
        }
        with_retry(self.retry_policy(), "persistence", || {
            self.collaborators.persistence.save_request(&updated)
        })
        .await?;

        mix.request = updated;
        if to.is_terminal() {
            mix.slot = None;
        }
        let snapshot = mix.request.clone();
        if to.is_terminal() {
            tracker.record_terminal(&snapshot);
        }

        let event = match to {
            MixStatus::Completed => LifecycleEvent::MixCompleted { mix_id: *id, at: now },
            MixStatus::Failed => LifecycleEvent::MixFailed {
                mix_id: *id,
                reason: reason.unwrap_or_default(),
                at: now,
            },
            MixStatus::Cancelled => LifecycleEvent::MixCancelled { mix_id: *id, at: now },
            MixStatus::Expired => LifecycleEvent::MixExpired { mix_id: *id, at: now },
            _ => LifecycleEvent::MixStatusChanged {
                mix_id: *id,
                from,
                to,
                at: now,
            },
        };
        info!("mix {} {} -> {}", id, from, to);
        self.events.emit(event);
        Ok(())
    }

    async fn expire(&self, id: &MixId) -> Result<bool> {
        let (currency, entry_id) = {
            let tracker = self.tracker.lock().await;
            let Some(mix) = tracker.get(id) else {
                return Ok(false);
            };
            if mix.request.status != MixStatus::PendingDeposit
                || self.clock.now_ms() < mix.request.expires_at
            {
                return Ok(false);
            }
            (mix.request.currency.clone(), mix.entry_id)
        };
        if let Some(entry_id) = entry_id {
            match self.pools.withdraw_entry(&currency, &entry_id).await {
                Ok(_) | Err(MixerError::NotFound { .. }) => {}
                Err(e) => {
                    warn!("failed to withdraw entry of expired mix {}: {}", id, e);
                    return Ok(false);
                }
            }
        }

        let mut tracker = self.tracker.lock().await;
        let status = tracker.get(id).map(|m| m.request.status);
        if status != Some(MixStatus::PendingDeposit) {
            warn!("mix {} left PENDING_DEPOSIT while expiring", id);
            return Ok(false);
        }
        self.transition(&mut tracker, id, MixStatus::Expired, None)
            .await?;
        Ok(true)
    }

    /// One background cycle. Failures are logged and never stop the cycle.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        let pending = self
            .tracker
            .lock()
            .await
            .ids_with_status(MixStatus::PendingDeposit);
        for id in pending {
            match self.expire(&id).await {
                Ok(true) => {
                    report.expired += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("expiry of mix {} failed: {}", id, e);
                    continue;
                }
            }
            match self.confirm_deposit(&id).await {
                Ok(MixStatus::DepositReceived) => report.deposits_confirmed += 1,
                Ok(_) => {}
                Err(e) => warn!("deposit check for mix {} failed: {}", id, e),
            }
        }

        report.rounds = self.pools.sweep().await;
        report.operations_executed = self.scheduler.run_due().await;
        report.events_handled += self.drain_events().await;

        let now = self.clock.now_ms();
        let interval = duration_ms(self.config.pool.optimization_interval);
        let last = self.last_optimization.load(Ordering::SeqCst);
        if now.saturating_sub(last) >= interval
            && self
                .last_optimization
                .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            self.pools.optimize().await;
            report.events_handled += self.drain_events().await;
        }
        report
    }

    async fn drain_events(&self) -> usize {
        // Payouts are planned between two tracker locks; a completion must not
        // be handled before its operation is linked.
        let _dispatch = self.dispatch.lock().await;
        let mut handled = 0;
        loop {
            let next = self.pool_events.lock().await.try_recv().ok();
            let Some(event) = next else {
                break;
            };
            self.handle_pool_event(event).await;
            handled += 1;
        }
        loop {
            let next = self.scheduler_events.lock().await.try_recv().ok();
            let Some(event) = next else {
                break;
            };
            self.handle_scheduler_event(event).await;
            handled += 1;
        }
        handled
    }

    async fn handle_pool_event(&self, event: PoolEvent) {
        match event {
            PoolEvent::RoundCompleted {
                currency,
                transaction_id,
                participants,
                finished,
            } => {
                debug!(
                    "{} round {}: {} participants, {} finished",
                    currency,
                    transaction_id,
                    participants.len(),
                    finished.len()
                );
                let finished: Vec<MixId> = finished.into_iter().map(|(mix_id, _)| mix_id).collect();
                let requests = {
                    let mut tracker = self.tracker.lock().await;
                    for mix_id in &participants {
                        self.enter_mixing(&mut tracker, mix_id).await;
                    }
                    finished
                        .iter()
                        .filter_map(|mix_id| Self::mixing_request(&tracker, mix_id))
                        .collect::<Vec<_>>()
                };

                let mut plan = PayoutPlan::default();
                let coinjoin = self.config.orchestrator.coinjoin_payouts
                    && requests.len() >= self.config.scheduler.min_coinjoin_participants;
                if coinjoin {
                    self.plan_coinjoin(&currency, &requests, &mut plan).await;
                } else {
                    for request in &requests {
                        self.plan_payouts(request, &mut plan).await;
                    }
                }
                self.commit_payouts(plan).await;
            }
            PoolEvent::RoundDeferred {
                currency,
                candidates,
            } => {
                debug!(
                    "{} round deferred with {} candidates",
                    currency, candidates
                );
            }
            PoolEvent::Rebalance(plan) => self.rebalance(plan).await,
        }
    }

    /// Split a finished mix's net amount across its payout addresses.
    fn payout_outputs(&self, request: &MixRequest) -> Vec<Destination> {
        request
            .payout_split(self.net_amount(request.amount))
            .into_iter()
            .filter(|(_, share)| *share > 0)
            .map(|(address, amount)| Destination {
                address,
                amount,
                mix_id: Some(request.id),
            })
            .collect()
    }

    /// Reserve pool funds for `outputs` and schedule one distribution.
    async fn schedule_payout(&self, request: &MixRequest, outputs: Vec<Destination>) -> Result<OperationId> {
        let amount: Amount = outputs.iter().map(|d| d.amount).sum();
        let sources = self.pools.reserve_sources(&request.currency, amount).await?;
        let distribution = DistributionRequest {
            currency: request.currency.clone(),
            mix_id: request.id,
            sources: sources.clone(),
            destinations: outputs,
            delay_ms: Some(request.effective_delay_ms),
        };
        match self.scheduler.schedule_distribution(distribution).await {
            Ok(id) => Ok(id),
            Err(e) => {
                self.release(&request.currency, &sources).await;
                Err(e)
            }
        }
    }

    async fn release(&self, currency: &Currency, sources: &[SourceAllocation]) {
        if let Err(e) = self.pools.release_sources(currency, sources).await {
            error!("failed to release {} reservations: {}", currency, e);
        }
    }

    /// Move a round participant to MIXING. A mix swept into a round before
    /// its deposit confirmation landed passes through DEPOSIT_RECEIVED.
    async fn enter_mixing(&self, tracker: &mut Tracker, mix_id: &MixId) {
        let Some(status) = tracker.get(mix_id).map(|m| m.request.status) else {
            return;
        };
        let steps: &[MixStatus] = match status {
            MixStatus::PendingDeposit => &[MixStatus::DepositReceived, MixStatus::Mixing],
            MixStatus::DepositReceived => &[MixStatus::Mixing],
            _ => &[],
        };
        for step in steps {
            if let Err(e) = self.transition(tracker, mix_id, *step, None).await {
                error!("mix {} could not enter {}: {}", mix_id, step, e);
                return;
            }
        }
    }

    fn mixing_request(tracker: &Tracker, mix_id: &MixId) -> Option<MixRequest> {
        let mix = tracker.get(mix_id)?;
        if mix.request.status != MixStatus::Mixing {
            warn!(
                "mix {} finished mixing while {}, payouts not planned",
                mix_id, mix.request.status
            );
            return None;
        }
        Some(mix.request.clone())
    }

    /// Schedule one distribution per payout address of `request`.
    async fn plan_payouts(&self, request: &MixRequest, plan: &mut PayoutPlan) {
        let mut scheduled = Vec::new();
        for output in self.payout_outputs(request) {
            match self.schedule_payout(request, vec![output.clone()]).await {
                Ok(operation) => scheduled.push((operation, request.id, vec![output])),
                Err(e) => {
                    for (operation, _, _) in &scheduled {
                        if let Some(cancelled) = self.cancel_payout(operation, &request.id).await {
                            self.release(&cancelled.currency, &cancelled.sources).await;
                        }
                    }
                    plan.failed
                        .push((request.id, format!("payout planning failed: {}", e)));
                    return;
                }
            }
        }
        plan.scheduled.extend(scheduled);
        plan.ready.push(request.id);
    }

    /// Pay out several finished mixes in one operation, falling back to
    /// individual distributions when the coinjoin cannot be scheduled.
    async fn plan_coinjoin(&self, currency: &Currency, requests: &[MixRequest], plan: &mut PayoutPlan) {
        let mut participants = Vec::with_capacity(requests.len());
        let mut delay_ms = 0;
        let mut failure = None;
        for request in requests {
            let outputs = self.payout_outputs(request);
            let amount: Amount = outputs.iter().map(|d| d.amount).sum();
            delay_ms = delay_ms.max(request.effective_delay_ms);
            match self.pools.reserve_sources(currency, amount).await {
                Ok(sources) => participants.push(CoinJoinParticipant {
                    mix_id: request.id,
                    sources,
                    destinations: outputs,
                }),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let scheduled = match failure {
            Some(e) => Err(e),
            None => {
                self.scheduler
                    .schedule_coinjoin(CoinJoinRequest {
                        currency: currency.clone(),
                        participants: participants.clone(),
                        delay_ms: Some(delay_ms),
                    })
                    .await
            }
        };
        match scheduled {
            Ok(operation) => {
                for participant in participants {
                    plan.scheduled
                        .push((operation, participant.mix_id, participant.destinations));
                    plan.ready.push(participant.mix_id);
                }
            }
            Err(e) => {
                warn!("{} coinjoin payout not scheduled, paying out individually: {}", currency, e);
                for participant in &participants {
                    self.release(currency, &participant.sources).await;
                }
                for request in requests {
                    self.plan_payouts(request, plan).await;
                }
            }
        }
    }

    /// Record planned payouts against their mixes.
    ///
    /// Reservations of payouts cancelled on the way are released after the
    /// tracker lock is dropped.
    async fn commit_payouts(&self, plan: PayoutPlan) {
        let cancelled = {
            let mut tracker = self.tracker.lock().await;
            for (operation, mix_id, outputs) in plan.scheduled {
                tracker.link_operation(operation, mix_id, outputs);
            }
            for mix_id in &plan.ready {
                if let Err(e) = self
                    .transition(&mut tracker, mix_id, MixStatus::Distributing, None)
                    .await
                {
                    error!("mix {} could not enter DISTRIBUTING: {}", mix_id, e);
                }
            }
            let mut cancelled = Vec::new();
            for (mix_id, reason) in plan.failed {
                cancelled.extend(self.fail_mix(&mut tracker, &mix_id, reason).await);
            }
            cancelled
        };
        for operation in cancelled {
            self.release(&operation.currency, &operation.sources).await;
        }
    }

    async fn handle_scheduler_event(&self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::Completed(operation) => {
                if let Err(e) = self
                    .pools
                    .settle_sources(&operation.currency, &operation.sources)
                    .await
                {
                    error!("failed to settle operation {}: {}", operation.id, e);
                }
                let mut tracker = self.tracker.lock().await;
                for (mix_id, _) in tracker.unlink_operation(&operation.id) {
                    self.finish_if_paid(&mut tracker, &mix_id).await;
                }
            }
            SchedulerEvent::Failed(operation) => {
                self.release(&operation.currency, &operation.sources).await;
                let reason = operation
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| format!("{} failed", operation.kind));
                let mut plan = PayoutPlan::default();
                let retries = {
                    let mut tracker = self.tracker.lock().await;
                    let unlinked = tracker.unlink_operation(&operation.id);
                    self.payout_retries(&mut tracker, unlinked, &reason, &mut plan)
                };
                for (request, outputs) in retries {
                    match self.schedule_payout(&request, outputs.clone()).await {
                        Ok(id) => plan.scheduled.push((id, request.id, outputs)),
                        Err(e) => plan
                            .failed
                            .push((request.id, format!("{}; re-schedule failed: {}", reason, e))),
                    }
                }
                self.commit_payouts(plan).await;
            }
        }
    }

    async fn finish_if_paid(&self, tracker: &mut Tracker, mix_id: &MixId) {
        let Some(mix) = tracker.get(mix_id) else {
            return;
        };
        if !mix.pending.is_empty() {
            return;
        }
        let status = mix.request.status;
        let steps: &[MixStatus] = match status {
            MixStatus::Mixing => &[MixStatus::Distributing, MixStatus::Completed],
            MixStatus::Distributing => &[MixStatus::Completed],
            _ => &[],
        };
        for step in steps {
            if let Err(e) = self.transition(tracker, mix_id, *step, None).await {
                error!("mix {} could not move to {}: {}", mix_id, step, e);
                return;
            }
        }
    }

    /// Pick the failed payouts that get another attempt. Mixes out of
    /// retries are queued to fail in `plan`.
    fn payout_retries(
        &self,
        tracker: &mut Tracker,
        unlinked: Vec<(MixId, Vec<Destination>)>,
        reason: &str,
        plan: &mut PayoutPlan,
    ) -> Vec<(MixRequest, Vec<Destination>)> {
        let limit = self.config.orchestrator.max_distribution_retries;
        let mut retries = Vec::new();
        for (mix_id, outputs) in unlinked {
            let Some(mix) = tracker.get_mut(&mix_id) else {
                continue;
            };
            if mix.request.is_terminal() {
                continue;
            }
            if mix.payout_retries >= limit {
                plan.failed.push((mix_id, reason.to_string()));
                continue;
            }
            mix.payout_retries += 1;
            warn!(
                "re-scheduling payout of mix {} (retry {}/{}): {}",
                mix_id, mix.payout_retries, limit, reason
            );
            retries.push((mix.request.clone(), outputs));
        }
        retries
    }

    async fn cancel_payout(&self, operation: &OperationId, mix_id: &MixId) -> Option<ScheduledOperation> {
        match self.scheduler.cancel(operation).await {
            Ok(cancelled) => Some(cancelled),
            Err(e) => {
                warn!("payout {} of failing mix {} left running: {}", operation, mix_id, e);
                None
            }
        }
    }

    /// Mark a mix FAILED, cancelling the payouts only it depends on.
    ///
    /// Returns the cancelled operations; the caller releases their
    /// reservations once the tracker lock is dropped.
    async fn fail_mix(&self, tracker: &mut Tracker, mix_id: &MixId, reason: String) -> Vec<ScheduledOperation> {
        let pending: Vec<OperationId> = tracker
            .get(mix_id)
            .map(|m| m.pending.keys().copied().collect())
            .unwrap_or_default();
        let mut cancelled = Vec::new();
        for operation in pending {
            let shared = tracker
                .operations
                .get(&operation)
                .map(|mixes| mixes.len() > 1)
                .unwrap_or(false);
            if shared {
                continue;
            }
            if let Some(op) = self.cancel_payout(&operation, mix_id).await {
                tracker.unlink_operation(&operation);
                cancelled.push(op);
            }
        }
        if let Err(e) = self
            .transition(tracker, mix_id, MixStatus::Failed, Some(reason))
            .await
        {
            error!("mix {} could not be marked FAILED: {}", mix_id, e);
        }
        cancelled
    }

    async fn rebalance(&self, plan: OptimizationPlan) {
        let currency = plan.currency;
        match plan.action {
            Some(RebalanceAction::Increase { shortfall }) => {
                warn!(
                    "{} pool below minimum, {} units of outside liquidity needed",
                    currency, shortfall
                );
            }
            Some(RebalanceAction::Decrease { excess }) => {
                if let Err(e) = self.consolidate(&currency, excess).await {
                    warn!("{} consolidation not scheduled: {}", currency, e);
                }
            }
            None => {}
        }
    }

    /// Sweep up to `excess` settled, unreserved funds to the cold address.
    async fn consolidate(&self, currency: &Currency, excess: Amount) -> Result<()> {
        let Some(destination) = self
            .config
            .currency(currency)?
            .consolidation_address
            .clone()
        else {
            debug!("{} has no consolidation address", currency);
            return Ok(());
        };
        let status = self.pools.liquidity_status(currency).await?;
        let distributable = self.pools.distributable(currency).await?;
        let amount = excess.saturating_sub(status.reserved).min(distributable);
        if amount == 0 {
            return Ok(());
        }

        let sources = self.pools.reserve_sources(currency, amount).await?;
        let request = ConsolidationRequest {
            currency: currency.clone(),
            sources: sources.clone(),
            destination,
            delay_ms: Some(0),
        };
        match self.scheduler.schedule_consolidation(request).await {
            Ok(id) => {
                info!("{} consolidation {} of {} units scheduled", currency, id, amount);
                Ok(())
            }
            Err(e) => {
                self.release(currency, &sources).await;
                Err(e)
            }
        }
    }

    /// Rebuild pools, tracking state and queued payouts from persistence.
    pub async fn restore(&self) -> Result<usize> {
        self.pools.restore().await?;
        let currencies: Vec<Currency> = self.pools.currencies().cloned().collect();
        let persistence = &self.collaborators.persistence;
        let mut tracker = self.tracker.lock().await;
        let mut restored = 0;

        for currency in &currencies {
            for status in [
                MixStatus::PendingDeposit,
                MixStatus::DepositReceived,
                MixStatus::Mixing,
                MixStatus::Distributing,
            ] {
                for request in persistence.requests_by_status(currency, status).await? {
                    if tracker.get(&request.id).is_some() {
                        continue;
                    }
                    let slot = match self.admission.try_acquire() {
                        Ok(slot) => Some(slot),
                        Err(e) => {
                            warn!("restored mix {} tracked without a slot: {}", request.id, e);
                            None
                        }
                    };
                    let entry_id: Option<EntryId> = self
                        .pools
                        .entry_for_mix(currency, &request.id)
                        .await?
                        .map(|e| e.id);
                    tracker.insert(TrackedMix::new(request, entry_id, slot));
                    restored += 1;
                }
            }

            for status in [OperationStatus::Scheduled, OperationStatus::Executing] {
                for operation in persistence.operations_by_status(currency, status).await? {
                    for mix_id in &operation.mix_ids {
                        if tracker.get(mix_id).is_none() {
                            continue;
                        }
                        let outputs = operation
                            .destinations
                            .iter()
                            .filter(|d| d.mix_id == Some(*mix_id))
                            .cloned()
                            .collect();
                        tracker.link_operation(operation.id, *mix_id, outputs);
                    }
                }
            }
        }
        self.scheduler.restore(&currencies).await?;

        // Mixes whose round or payout outcome was lost with the process
        let mut unplanned = Vec::new();
        let mut paid = Vec::new();
        for mix in tracker.mixes.values() {
            if !mix.pending.is_empty() {
                continue;
            }
            match mix.request.status {
                MixStatus::Mixing => {
                    let settled = match mix.entry_id {
                        Some(entry_id) => self
                            .pools
                            .entry(&mix.request.currency, &entry_id)
                            .await?
                            .map(|e| e.is_settled())
                            .unwrap_or(false),
                        None => false,
                    };
                    if settled {
                        unplanned.push(mix.request.clone());
                    }
                }
                MixStatus::Distributing => paid.push(mix.request.id),
                _ => {}
            }
        }
        for mix_id in &paid {
            self.finish_if_paid(&mut tracker, mix_id).await;
        }
        drop(tracker);

        let mut plan = PayoutPlan::default();
        for request in &unplanned {
            self.plan_payouts(request, &mut plan).await;
        }
        self.commit_payouts(plan).await;

        if restored > 0 {
            info!("restored {} in-flight mixes", restored);
        }
        Ok(restored)
    }
}
