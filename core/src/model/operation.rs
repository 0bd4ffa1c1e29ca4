// Scheduled releases and the requests that create them.

use super::{Amount, Currency, EntryId, KeyId, MixId, OperationId};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Distribution,
    CoinJoin,
    Consolidation,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Distribution => "DISTRIBUTION",
            OperationKind::CoinJoin => "COINJOIN",
            OperationKind::Consolidation => "CONSOLIDATION",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Scheduled,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationStatus::Scheduled => "SCHEDULED",
            OperationStatus::Executing => "EXECUTING",
            OperationStatus::Completed => "COMPLETED",
            OperationStatus::Failed => "FAILED",
            OperationStatus::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Portion of a pool entry earmarked as the input of a release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAllocation {
    pub entry_id: EntryId,
    pub address: String,
    pub key_id: KeyId,
    pub amount: Amount,
}

/// One output of a release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub address: String,
    pub amount: Amount,
    /// Mix the output pays out, absent for consolidation
    pub mix_id: Option<MixId>,
}

/// A planned, cancellable release of pooled funds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledOperation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub currency: Currency,
    pub mix_ids: Vec<MixId>,
    pub sources: Vec<SourceAllocation>,
    pub destinations: Vec<Destination>,
    pub delay_ms: u64,
    pub created_at: u64,
    pub scheduled_at: u64,
    pub status: OperationStatus,
    pub tx_hash: Option<String>,
    pub failure_reason: Option<String>,
    pub executed_at: Option<u64>,
}

impl ScheduledOperation {
    pub fn source_total(&self) -> Amount {
        self.sources.iter().map(|s| s.amount).sum()
    }

    pub fn destination_total(&self) -> Amount {
        self.destinations.iter().map(|d| d.amount).sum()
    }
}

/// Direct payout of one mix to one or more addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionRequest {
    pub currency: Currency,
    pub mix_id: MixId,
    pub sources: Vec<SourceAllocation>,
    pub destinations: Vec<Destination>,
    pub delay_ms: Option<u64>,
}

/// One mix's share of a coordinated multi-party release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinJoinParticipant {
    pub mix_id: MixId,
    pub sources: Vec<SourceAllocation>,
    pub destinations: Vec<Destination>,
}

/// All-or-nothing release combining several mixes in one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinJoinRequest {
    pub currency: Currency,
    pub participants: Vec<CoinJoinParticipant>,
    pub delay_ms: Option<u64>,
}

/// Sweep of pool funds to a single address, zero delay allowed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsolidationRequest {
    pub currency: Currency,
    pub sources: Vec<SourceAllocation>,
    pub destination: String,
    pub delay_ms: Option<u64>,
}
