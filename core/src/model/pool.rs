// Pool entries and the mixing rounds they take part in.

use super::{Amount, Currency, EntryId, KeyId, MixId, SessionId, TransactionId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a deposit inside a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    /// Waiting in the pool for a round (or for its next round)
    Active,
    /// Inside a round, or mixed and waiting to be paid out
    Mixing,
    /// Fully paid out and archived
    Distributed,
    /// Removed before mixing (cancelled or expired order)
    Withdrawn,
}

impl EntryStatus {
    /// Whether the entry's amount still counts toward the pool total.
    pub fn counts_toward_total(&self) -> bool {
        matches!(self, EntryStatus::Active | EntryStatus::Mixing)
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntryStatus::Active => "ACTIVE",
            EntryStatus::Mixing => "MIXING",
            EntryStatus::Distributed => "DISTRIBUTED",
            EntryStatus::Withdrawn => "WITHDRAWN",
        };
        f.write_str(name)
    }
}

/// One line of an entry's append-only mixing history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixingRecord {
    pub session_id: SessionId,
    pub transaction_id: TransactionId,
    pub round: u32,
    pub anonymity_set: usize,
    pub score_after: u32,
    pub at: u64,
}

/// A deposit held in a currency pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub id: EntryId,
    pub mix_id: MixId,
    pub currency: Currency,
    /// Funds currently attributed to this entry
    pub amount: Amount,
    /// Amount at deposit time
    pub original_amount: Amount,
    /// Rotating address currently holding the funds
    pub address: String,
    pub key_id: KeyId,
    pub status: EntryStatus,
    pub history: Vec<MixingRecord>,
    pub anonymity_score: u32,
    pub rounds_completed: u32,
    pub rounds_required: u32,
    pub deposited_at: u64,
    /// Held out of selection until the deposit is confirmed on chain
    pub awaiting_deposit: bool,
    /// Portion earmarked for releases that have not settled yet
    pub reserved: Amount,
    pub stale: bool,
}

impl PoolEntry {
    /// Funds not earmarked for an in-flight release.
    pub fn available(&self) -> Amount {
        self.amount.saturating_sub(self.reserved)
    }

    /// Amount this entry contributes to the pool's reserved counter.
    pub fn held_amount(&self) -> Amount {
        if self.awaiting_deposit {
            self.amount
        } else {
            self.reserved
        }
    }

    /// Eligible for the next mixing round.
    pub fn is_selectable(&self) -> bool {
        self.status == EntryStatus::Active && !self.awaiting_deposit && self.reserved == 0
    }

    pub fn rounds_remaining(&self) -> u32 {
        self.rounds_required.saturating_sub(self.rounds_completed)
    }

    /// Mixed through every required round and still holding funds.
    pub fn is_settled(&self) -> bool {
        self.status == EntryStatus::Mixing && self.rounds_remaining() == 0 && !self.awaiting_deposit
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.deposited_at)
    }
}

/// Intermediate addresses one participant's funds were routed through
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingPath {
    pub entry_id: EntryId,
    pub hops: Vec<String>,
}

impl RoutingPath {
    /// Address the funds rest at after the round.
    pub fn final_hop(&self) -> Option<&str> {
        self.hops.last().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Completed => "COMPLETED",
            TransactionStatus::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Record of one executed mixing round over a chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixingTransaction {
    pub id: TransactionId,
    pub session_id: SessionId,
    pub currency: Currency,
    pub participants: Vec<EntryId>,
    pub input_amount: Amount,
    pub output_amount: Amount,
    pub routing: Vec<RoutingPath>,
    pub tx_hash: Option<String>,
    pub status: TransactionStatus,
    pub created_at: u64,
}
