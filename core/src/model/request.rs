// Mix orders and their tracked lifecycle.

use super::{Amount, Currency, MixId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// One weighted payout destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutAddress {
    pub address: String,
    /// Share of the net payout, 1..=100
    pub percentage: u8,
}

impl PayoutAddress {
    pub fn new(address: impl Into<String>, percentage: u8) -> Self {
        Self {
            address: address.into(),
            percentage,
        }
    }
}

/// Requested strength of unlinkability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AnonymityLevel {
    Low,
    #[default]
    Medium,
    High,
}

impl AnonymityLevel {
    /// Mixing rounds an entry at this level must complete before payout.
    pub fn mixing_rounds(&self, base_rounds: u32, high_extra_rounds: u32) -> u32 {
        match self {
            AnonymityLevel::High => base_rounds + high_extra_rounds,
            AnonymityLevel::Low | AnonymityLevel::Medium => base_rounds,
        }
    }
}

/// Tracked status of a mix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MixStatus {
    PendingDeposit,
    DepositReceived,
    Mixing,
    Distributing,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl MixStatus {
    /// Statuses from which the user may still withdraw the order.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, MixStatus::PendingDeposit | MixStatus::DepositReceived)
    }
}

impl fmt::Display for MixStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MixStatus::PendingDeposit => "PENDING_DEPOSIT",
            MixStatus::DepositReceived => "DEPOSIT_RECEIVED",
            MixStatus::Mixing => "MIXING",
            MixStatus::Distributing => "DISTRIBUTING",
            MixStatus::Completed => "COMPLETED",
            MixStatus::Failed => "FAILED",
            MixStatus::Cancelled => "CANCELLED",
            MixStatus::Expired => "EXPIRED",
        };
        f.write_str(name)
    }
}

/// Caller input to `process`, before any validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixOrder {
    pub currency: Currency,
    pub amount: Amount,
    pub payouts: Vec<PayoutAddress>,
    /// Requested hold time before payout; generated when absent
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub anonymity: AnonymityLevel,
}

impl MixOrder {
    pub fn new(currency: impl Into<Currency>, amount: Amount, payouts: Vec<PayoutAddress>) -> Self {
        Self {
            currency: currency.into(),
            amount,
            payouts,
            delay_ms: None,
            anonymity: AnonymityLevel::default(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = Some(crate::util::time::duration_ms(delay));
        self
    }

    pub fn with_anonymity(mut self, level: AnonymityLevel) -> Self {
        self.anonymity = level;
        self
    }
}

/// An accepted order as tracked by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixRequest {
    pub id: MixId,
    pub currency: Currency,
    pub amount: Amount,
    pub payouts: Vec<PayoutAddress>,
    pub requested_delay_ms: Option<u64>,
    pub effective_delay_ms: u64,
    pub anonymity: AnonymityLevel,
    pub status: MixStatus,
    pub risk_score: u32,
    pub created_at: u64,
    pub expires_at: u64,
    pub expected_completion_at: u64,
    /// Rotating address the user deposits to, assigned by the pool
    pub deposit_address: Option<String>,
    pub failure_reason: Option<String>,
    pub completed_at: Option<u64>,
}

impl MixRequest {
    /// Split `net` across the payout addresses by percentage.
    ///
    /// Integer division rounds every share down; the remainder goes to the
    /// last address so the shares always add up to `net` exactly.
    pub fn payout_split(&self, net: Amount) -> Vec<(String, Amount)> {
        let mut shares = Vec::with_capacity(self.payouts.len());
        let mut allocated: Amount = 0;
        for (i, payout) in self.payouts.iter().enumerate() {
            let share = if i + 1 == self.payouts.len() {
                net - allocated
            } else {
                ((net as u128 * payout.percentage as u128) / 100) as Amount
            };
            allocated += share;
            shares.push((payout.address.clone(), share));
        }
        shares
    }

    pub fn is_terminal(&self) -> bool {
        use crate::state::Lifecycle;
        self.status.is_terminal()
    }
}
