// Per-mix tracking state owned by the orchestrator

use super::admission::AdmissionSlot;
use crate::model::{Destination, EntryId, MixId, MixRequest, MixStatus, OperationId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug)]
pub struct TrackedMix {
    pub request: MixRequest,
    /// Pool entry holding the deposit, absent once it was archived
    pub entry_id: Option<EntryId>,
    /// Released when the mix reaches a terminal state
    pub slot: Option<AdmissionSlot>,
    /// Scheduled payouts still outstanding, with this mix's outputs in each
    pub pending: HashMap<OperationId, Vec<Destination>>,
    pub payout_retries: u32,
}

impl TrackedMix {
    pub fn new(request: MixRequest, entry_id: Option<EntryId>, slot: Option<AdmissionSlot>) -> Self {
        Self {
            request,
            entry_id,
            slot,
            pending: HashMap::new(),
            payout_retries: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorStatistics {
    /// Mixes holding an admission slot
    pub active_mixes: usize,
    /// Mixes waiting for a deposit or for their first round
    pub queue_length: usize,
    pub total_mixes: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub expired: u64,
    pub uptime_ms: u64,
    pub average_mixing_time_ms: f64,
    /// completed / (completed + failed) in percent, 0 when nothing finished
    pub success_rate: f64,
}

#[derive(Debug, Default)]
pub struct Tracker {
    pub mixes: HashMap<MixId, TrackedMix>,
    /// Mixes paid out by each outstanding operation
    pub operations: HashMap<OperationId, Vec<MixId>>,
    completed: u64,
    failed: u64,
    cancelled: u64,
    expired: u64,
    mixing_time_ms: u64,
}

impl Tracker {
    pub fn get(&self, id: &MixId) -> Option<&TrackedMix> {
        self.mixes.get(id)
    }

    pub fn get_mut(&mut self, id: &MixId) -> Option<&mut TrackedMix> {
        self.mixes.get_mut(id)
    }

    pub fn insert(&mut self, mix: TrackedMix) {
        self.mixes.insert(mix.request.id, mix);
    }

    pub fn link_operation(&mut self, operation: OperationId, mix_id: MixId, outputs: Vec<Destination>) {
        self.operations.entry(operation).or_default().push(mix_id);
        if let Some(mix) = self.mixes.get_mut(&mix_id) {
            mix.pending.insert(operation, outputs);
        }
    }

    /// Forget an operation, returning each linked mix with its outputs.
    pub fn unlink_operation(&mut self, operation: &OperationId) -> Vec<(MixId, Vec<Destination>)> {
        let mix_ids = self.operations.remove(operation).unwrap_or_default();
        mix_ids
            .into_iter()
            .filter_map(|mix_id| {
                let outputs = self.mixes.get_mut(&mix_id)?.pending.remove(operation)?;
                Some((mix_id, outputs))
            })
            .collect()
    }

    pub fn ids_with_status(&self, status: MixStatus) -> Vec<MixId> {
        self.mixes
            .values()
            .filter(|m| m.request.status == status)
            .map(|m| m.request.id)
            .collect()
    }

    /// Account for a mix that just reached a terminal status.
    pub fn record_terminal(&mut self, request: &MixRequest) {
        match request.status {
            MixStatus::Completed => {
                self.completed += 1;
                if let Some(done) = request.completed_at {
                    self.mixing_time_ms += done.saturating_sub(request.created_at);
                }
            }
            MixStatus::Failed => self.failed += 1,
            MixStatus::Cancelled => self.cancelled += 1,
            MixStatus::Expired => self.expired += 1,
            _ => {}
        }
    }

    pub fn statistics(&self, active_mixes: usize, uptime_ms: u64) -> OrchestratorStatistics {
        let queue_length = self
            .mixes
            .values()
            .filter(|m| {
                matches!(
                    m.request.status,
                    MixStatus::PendingDeposit | MixStatus::DepositReceived
                )
            })
            .count();
        let finished = self.completed + self.failed;
        OrchestratorStatistics {
            active_mixes,
            queue_length,
            total_mixes: self.mixes.len(),
            completed: self.completed,
            failed: self.failed,
            cancelled: self.cancelled,
            expired: self.expired,
            uptime_ms,
            average_mixing_time_ms: if self.completed == 0 {
                0.0
            } else {
                self.mixing_time_ms as f64 / self.completed as f64
            },
            success_rate: if finished == 0 {
                0.0
            } else {
                self.completed as f64 / finished as f64 * 100.0
            },
        }
    }
}
