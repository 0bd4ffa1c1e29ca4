// Operation Scheduler
//
// Turns an approved release into a delayed, cancellable operation. Records
// live in a parking_lot map and ids in a due-time queue; neither lock is held
// across an await. Execution happens only from `run_due`.

pub mod delay;
pub mod queue;

pub use delay::{compute_jitter, DelayPolicy, JitterConfig, JitterDistribution};
pub use queue::DueQueue;

use crate::collaborators::Collaborators;
use crate::config::SchedulerConfig;
use crate::error::{MixerError, Result};
use crate::events::SchedulerEvent;
use crate::model::{
    CoinJoinRequest, ConsolidationRequest, Currency, Destination, DistributionRequest, MixId,
    OperationId, OperationKind, OperationStatus, ScheduledOperation, SourceAllocation,
};
use crate::state::Lifecycle;
use crate::tx::{sign_and_broadcast, TxInput, TxOutput, TxPurpose, UnsignedTransaction};
use crate::util::retry::{bounded, RetryPolicy};
use crate::util::time::{duration_ms, Clock};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStatistics {
    pub scheduled: usize,
    pub executing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub queue_depth: usize,
    pub next_due_at: Option<u64>,
    /// Mean of executed_at - created_at over completed operations
    pub average_delay_ms: f64,
}

pub struct OperationScheduler {
    policy: DelayPolicy,
    min_coinjoin_participants: usize,
    collaborators: Collaborators,
    clock: Arc<dyn Clock>,
    call_timeout: Duration,
    operations: RwLock<HashMap<OperationId, ScheduledOperation>>,
    queue: Mutex<DueQueue>,
    events: mpsc::UnboundedSender<SchedulerEvent>,
}

/// Shared checks for every release: non-empty, positive and balanced legs.
fn check_legs(sources: &[SourceAllocation], destinations: &[Destination]) -> Result<()> {
    if sources.is_empty() {
        return Err(MixerError::Validation("release has no sources".to_string()));
    }
    if destinations.is_empty() {
        return Err(MixerError::Validation(
            "release has no destinations".to_string(),
        ));
    }
    if sources.iter().any(|s| s.amount == 0) || destinations.iter().any(|d| d.amount == 0) {
        return Err(MixerError::Validation(
            "release amounts must be positive".to_string(),
        ));
    }
    if destinations.iter().any(|d| d.address.trim().is_empty()) {
        return Err(MixerError::Validation(
            "destination address is empty".to_string(),
        ));
    }
    let source_total = sources.iter().try_fold(0u64, |acc, s| acc.checked_add(s.amount));
    let destination_total = destinations
        .iter()
        .try_fold(0u64, |acc, d| acc.checked_add(d.amount));
    match (source_total, destination_total) {
        (Some(s), Some(d)) if s == d => Ok(()),
        (Some(s), Some(d)) => Err(MixerError::Validation(format!(
            "sources total {} but destinations total {}",
            s, d
        ))),
        _ => Err(MixerError::Validation("release amount overflow".to_string())),
    }
}

impl OperationScheduler {
    pub fn new(
        config: &SchedulerConfig,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
        events: mpsc::UnboundedSender<SchedulerEvent>,
    ) -> Result<Self> {
        config.jitter.validate()?;
        Ok(Self {
            policy: DelayPolicy::new(config.min_delay, config.max_delay)?,
            min_coinjoin_participants: config.min_coinjoin_participants,
            collaborators,
            clock,
            call_timeout: RetryPolicy::default().timeout,
            operations: RwLock::new(HashMap::new()),
            queue: Mutex::new(DueQueue::new()),
            events,
        })
    }

    /// Bound every custody, chain and persistence call by `limit`.
    pub fn with_call_timeout(mut self, limit: Duration) -> Self {
        self.call_timeout = limit;
        self
    }

    async fn save_operation(&self, operation: &ScheduledOperation) -> Result<()> {
        bounded(
            self.call_timeout,
            "persistence",
            self.collaborators.persistence.save_operation(operation),
        )
        .await
    }

    pub fn policy(&self) -> DelayPolicy {
        self.policy
    }

    async fn effective_delay(&self, requested: Option<u64>, allow_zero: bool) -> Result<Duration> {
        match requested {
            Some(ms) => self
                .policy
                .check_requested(Duration::from_millis(ms), allow_zero),
            None => {
                let generated = bounded(
                    self.call_timeout,
                    "risk assessor",
                    self.collaborators.risk.generate_optimal_delay(),
                )
                .await?;
                Ok(self.policy.clamp(generated))
            }
        }
    }

    async fn enqueue(
        &self,
        kind: OperationKind,
        currency: Currency,
        mix_ids: Vec<MixId>,
        sources: Vec<SourceAllocation>,
        destinations: Vec<Destination>,
        delay: Duration,
    ) -> Result<OperationId> {
        let now = self.clock.now_ms();
        let delay_ms = duration_ms(delay);
        let operation = ScheduledOperation {
            id: OperationId::new(),
            kind,
            currency,
            mix_ids,
            sources,
            destinations,
            delay_ms,
            created_at: now,
            scheduled_at: now.saturating_add(delay_ms),
            status: OperationStatus::Scheduled,
            tx_hash: None,
            failure_reason: None,
            executed_at: None,
        };
        if let Err(e) = self.save_operation(&operation).await {
            // A timed-out write may still land; restore must not queue it
            let mut tombstone = operation.clone();
            tombstone.status = OperationStatus::Cancelled;
            if let Err(undo) = self.save_operation(&tombstone).await {
                error!("failed to void unscheduled {}: {}", tombstone.id, undo);
            }
            return Err(e);
        }

        let id = operation.id;
        let due_at = operation.scheduled_at;
        info!(
            "{} {} scheduled: {} units to {} destinations in {}ms",
            operation.kind,
            id,
            operation.destination_total(),
            operation.destinations.len(),
            delay_ms
        );
        self.operations.write().insert(id, operation);
        self.queue.lock().push(due_at, id);
        Ok(id)
    }

    /// Schedule a direct payout of one mix.
    pub async fn schedule_distribution(&self, request: DistributionRequest) -> Result<OperationId> {
        check_legs(&request.sources, &request.destinations)?;
        let delay = self.effective_delay(request.delay_ms, false).await?;
        let mix_id = request.mix_id;
        let destinations = request
            .destinations
            .into_iter()
            .map(|d| Destination {
                mix_id: Some(mix_id),
                ..d
            })
            .collect();
        self.enqueue(
            OperationKind::Distribution,
            request.currency,
            vec![mix_id],
            request.sources,
            destinations,
            delay,
        )
        .await
    }

    /// Schedule one transaction paying out several mixes together.
    pub async fn schedule_coinjoin(&self, request: CoinJoinRequest) -> Result<OperationId> {
        let mix_ids: Vec<MixId> = request.participants.iter().map(|p| p.mix_id).collect();
        let distinct: HashSet<&MixId> = mix_ids.iter().collect();
        if distinct.len() < self.min_coinjoin_participants {
            return Err(MixerError::Scheduling(format!(
                "coinjoin needs at least {} distinct mixes, got {}",
                self.min_coinjoin_participants,
                distinct.len()
            )));
        }
        if distinct.len() != mix_ids.len() {
            return Err(MixerError::Validation(
                "coinjoin lists a mix more than once".to_string(),
            ));
        }
        for participant in &request.participants {
            check_legs(&participant.sources, &participant.destinations)?;
        }

        let mut sources = Vec::new();
        let mut destinations = Vec::new();
        for participant in request.participants {
            sources.extend(participant.sources);
            destinations.extend(participant.destinations.into_iter().map(|mut d| {
                d.mix_id = Some(participant.mix_id);
                d
            }));
        }
        check_legs(&sources, &destinations)?;
        let delay = self.effective_delay(request.delay_ms, false).await?;
        self.enqueue(
            OperationKind::CoinJoin,
            request.currency,
            mix_ids,
            sources,
            destinations,
            delay,
        )
        .await
    }

    /// Schedule a sweep of pool funds to one address. Zero delay is allowed.
    pub async fn schedule_consolidation(&self, request: ConsolidationRequest) -> Result<OperationId> {
        let total = request
            .sources
            .iter()
            .try_fold(0u64, |acc, s| acc.checked_add(s.amount))
            .ok_or_else(|| MixerError::Validation("release amount overflow".to_string()))?;
        let destinations = vec![Destination {
            address: request.destination,
            amount: total,
            mix_id: None,
        }];
        check_legs(&request.sources, &destinations)?;
        let delay = self.effective_delay(request.delay_ms, true).await?;
        self.enqueue(
            OperationKind::Consolidation,
            request.currency,
            Vec::new(),
            request.sources,
            destinations,
            delay,
        )
        .await
    }

    /// Cancel an operation that has not started executing.
    pub async fn cancel(&self, id: &OperationId) -> Result<ScheduledOperation> {
        let cancelled = {
            let mut operations = self.operations.write();
            let operation = operations
                .get_mut(id)
                .ok_or_else(|| MixerError::not_found("operation", id))?;
            if operation.status != OperationStatus::Scheduled {
                return Err(MixerError::invalid_state(
                    operation.status,
                    OperationStatus::Cancelled,
                ));
            }
            operation.status = OperationStatus::Cancelled;
            self.queue.lock().remove(operation.scheduled_at, id);
            operation.clone()
        };
        if let Err(e) = self.save_operation(&cancelled).await {
            error!("failed to persist cancellation of {}: {}", id, e);
        }
        info!("{} {} cancelled", cancelled.kind, id);
        Ok(cancelled)
    }

    pub fn status(&self, id: &OperationId) -> Option<OperationStatus> {
        self.operations.read().get(id).map(|op| op.status)
    }

    pub fn operation(&self, id: &OperationId) -> Option<ScheduledOperation> {
        self.operations.read().get(id).cloned()
    }

    pub fn next_due(&self) -> Option<u64> {
        self.queue.lock().next_due()
    }

    pub fn statistics(&self) -> SchedulerStatistics {
        let mut stats = SchedulerStatistics::default();
        let mut delay_sum: u64 = 0;
        {
            let operations = self.operations.read();
            for operation in operations.values() {
                match operation.status {
                    OperationStatus::Scheduled => stats.scheduled += 1,
                    OperationStatus::Executing => stats.executing += 1,
                    OperationStatus::Completed => {
                        stats.completed += 1;
                        if let Some(at) = operation.executed_at {
                            delay_sum += at.saturating_sub(operation.created_at);
                        }
                    }
                    OperationStatus::Failed => stats.failed += 1,
                    OperationStatus::Cancelled => stats.cancelled += 1,
                }
            }
        }
        let queue = self.queue.lock();
        stats.queue_depth = queue.len();
        stats.next_due_at = queue.next_due();
        if stats.completed > 0 {
            stats.average_delay_ms = delay_sum as f64 / stats.completed as f64;
        }
        stats
    }

    /// Execute every operation whose delay has elapsed. Returns how many ran.
    pub async fn run_due(&self) -> usize {
        let due = self.queue.lock().pop_due(self.clock.now_ms());
        if due.is_empty() {
            return 0;
        }

        let mut claimed = Vec::with_capacity(due.len());
        {
            let mut operations = self.operations.write();
            for id in due {
                let Some(operation) = operations.get_mut(&id) else {
                    continue;
                };
                if operation.status.validate_transition(OperationStatus::Executing).is_ok() {
                    operation.status = OperationStatus::Executing;
                    claimed.push(operation.clone());
                }
            }
        }
        for operation in &claimed {
            if let Err(e) = self.save_operation(operation).await {
                error!("failed to persist {} as executing: {}", operation.id, e);
            }
        }

        let count = claimed.len();
        join_all(claimed.into_iter().map(|op| self.execute(op))).await;
        count
    }

    async fn execute(&self, operation: ScheduledOperation) {
        debug!("executing {} {}", operation.kind, operation.id);
        let outcome = self.broadcast(&operation).await;
        self.finish(operation, outcome).await;
    }

    async fn broadcast(&self, operation: &ScheduledOperation) -> Result<String> {
        let body = UnsignedTransaction {
            currency: operation.currency.clone(),
            inputs: operation
                .sources
                .iter()
                .map(|s| TxInput {
                    address: s.address.clone(),
                    amount: s.amount,
                    key_id: s.key_id.clone(),
                })
                .collect(),
            outputs: operation
                .destinations
                .iter()
                .map(|d| TxOutput {
                    address: d.address.clone(),
                    amount: d.amount,
                })
                .collect(),
            purpose: TxPurpose::Release(operation.id, operation.kind),
        };
        sign_and_broadcast(
            self.collaborators.custody.as_ref(),
            self.collaborators.chain.as_ref(),
            body,
            self.call_timeout,
        )
        .await
    }

    async fn finish(&self, mut operation: ScheduledOperation, outcome: Result<String>) {
        let now = self.clock.now_ms();
        operation.executed_at = Some(now);
        match outcome {
            Ok(hash) => {
                operation.status = OperationStatus::Completed;
                info!(
                    "{} {} broadcast as {} after {}ms",
                    operation.kind,
                    operation.id,
                    hash,
                    now.saturating_sub(operation.created_at)
                );
                operation.tx_hash = Some(hash);
            }
            Err(e) => {
                operation.status = OperationStatus::Failed;
                warn!("{} {} failed: {}", operation.kind, operation.id, e);
                operation.failure_reason = Some(e.to_string());
            }
        }

        self.operations
            .write()
            .insert(operation.id, operation.clone());
        if let Err(e) = self.save_operation(&operation).await {
            error!("failed to persist outcome of {}: {}", operation.id, e);
        }
        let event = if operation.status == OperationStatus::Completed {
            SchedulerEvent::Completed(operation)
        } else {
            SchedulerEvent::Failed(operation)
        };
        if self.events.send(event).is_err() {
            debug!("scheduler event dropped, no receiver");
        }
    }

    /// Reload unfinished operations for `currencies`.
    ///
    /// SCHEDULED operations are queued again. Operations caught mid-execution
    /// are marked FAILED and reported so their reservations can be released.
    pub async fn restore(&self, currencies: &[Currency]) -> Result<usize> {
        let persistence = &self.collaborators.persistence;
        let mut restored = 0;
        for currency in currencies {
            for operation in persistence
                .operations_by_status(currency, OperationStatus::Scheduled)
                .await?
            {
                if self.operations.read().contains_key(&operation.id) {
                    continue;
                }
                let (id, due_at) = (operation.id, operation.scheduled_at);
                self.operations.write().insert(id, operation);
                self.queue.lock().push(due_at, id);
                restored += 1;
            }

            for mut operation in persistence
                .operations_by_status(currency, OperationStatus::Executing)
                .await?
            {
                if self.operations.read().contains_key(&operation.id) {
                    continue;
                }
                warn!("{} {} interrupted during execution", operation.kind, operation.id);
                operation.status = OperationStatus::Failed;
                operation.failure_reason = Some("interrupted during execution".to_string());
                operation.executed_at = Some(self.clock.now_ms());
                persistence.save_operation(&operation).await?;
                self.operations
                    .write()
                    .insert(operation.id, operation.clone());
                if self.events.send(SchedulerEvent::Failed(operation)).is_err() {
                    debug!("scheduler event dropped, no receiver");
                }
            }
        }
        if restored > 0 {
            info!("restored {} scheduled operations", restored);
        }
        Ok(restored)
    }
}
