// Per-currency pool state
//
// `total` and `reserved` are cached counters recomputed from the entries
// after every mutation; `verify` checks they still agree.

use crate::config::CurrencyConfig;
use crate::error::{MixerError, Result};
use crate::model::{Amount, Currency, EntryId, EntryStatus, PoolEntry};
use crate::state::Lifecycle;
use serde::{Deserialize, Serialize};

/// Coarse health of a pool against its configured bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolHealth {
    Depleted,
    Low,
    Healthy,
    Overflow,
}

/// Fraction of the target a pool needs to count as healthy
const HEALTHY_RATIO: f64 = 0.8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidityStatus {
    pub currency: Currency,
    pub status: PoolHealth,
    pub total: Amount,
    pub reserved: Amount,
    pub available: Amount,
    pub participants: usize,
    /// total / target as a percentage, capped at 100
    pub utilization: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStatistics {
    pub currency: Currency,
    pub total: Amount,
    pub reserved: Amount,
    pub participants: usize,
    pub active_entries: usize,
    pub mixing_entries: usize,
    pub settled_entries: usize,
    pub awaiting_deposit: usize,
    pub stale_entries: usize,
    pub archived_entries: u64,
    pub rounds_executed: u64,
    pub volume_mixed: Amount,
    pub average_anonymity_score: f64,
    pub oldest_entry_age_ms: u64,
    pub last_activity: u64,
    pub rotation_addresses: usize,
}

#[derive(Debug)]
pub struct LiquidityPool {
    currency: Currency,
    limits: CurrencyConfig,
    entries: Vec<PoolEntry>,
    total: Amount,
    reserved: Amount,
    last_activity: u64,
    rounds_executed: u64,
    volume_mixed: Amount,
    archived: u64,
    needs_mixing: bool,
}

impl LiquidityPool {
    pub fn new(currency: Currency, limits: CurrencyConfig, now_ms: u64) -> Self {
        Self {
            currency,
            limits,
            entries: Vec::new(),
            total: 0,
            reserved: 0,
            last_activity: now_ms,
            rounds_executed: 0,
            volume_mixed: 0,
            archived: 0,
            needs_mixing: false,
        }
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn limits(&self) -> &CurrencyConfig {
        &self.limits
    }

    pub fn total(&self) -> Amount {
        self.total
    }

    pub fn reserved(&self) -> Amount {
        self.reserved
    }

    pub fn entries(&self) -> &[PoolEntry] {
        &self.entries
    }

    pub fn participant_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.status.counts_toward_total())
            .count()
    }

    pub fn entry(&self, id: &EntryId) -> Option<&PoolEntry> {
        self.entries.iter().find(|e| e.id == *id)
    }

    pub fn entry_mut(&mut self, id: &EntryId) -> Option<&mut PoolEntry> {
        self.entries.iter_mut().find(|e| e.id == *id)
    }

    pub fn needs_mixing(&self) -> bool {
        self.needs_mixing
    }

    pub fn set_needs_mixing(&mut self, flagged: bool) {
        self.needs_mixing = flagged;
    }

    /// Refuse a deposit that would push the pool over its ceiling.
    pub fn check_capacity(&self, amount: Amount) -> Result<()> {
        match self.total.checked_add(amount) {
            Some(next) if next <= self.limits.max_pool => Ok(()),
            _ => Err(MixerError::PoolOverflow {
                currency: self.currency.clone(),
                total: self.total,
                amount,
                max: self.limits.max_pool,
            }),
        }
    }

    pub fn insert(&mut self, entry: PoolEntry, now_ms: u64) {
        self.entries.push(entry);
        self.touch(now_ms);
        self.recompute();
    }

    pub fn touch(&mut self, now_ms: u64) {
        self.last_activity = self.last_activity.max(now_ms);
    }

    pub fn record_round(&mut self, volume: Amount, now_ms: u64) {
        self.rounds_executed += 1;
        self.volume_mixed = self.volume_mixed.saturating_add(volume);
        self.touch(now_ms);
    }

    pub fn recompute(&mut self) {
        let counted = self
            .entries
            .iter()
            .filter(|e| e.status.counts_toward_total());
        let (total, reserved) = counted.fold((0u64, 0u64), |(t, r), e| {
            (t.saturating_add(e.amount), r.saturating_add(e.held_amount()))
        });
        self.total = total;
        self.reserved = reserved;
    }

    /// Drop terminal entries from the live set and return them.
    pub fn archive_terminal(&mut self) -> Vec<PoolEntry> {
        let (archived, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.status.is_terminal());
        self.entries = live;
        self.archived += archived.len() as u64;
        self.recompute();
        archived
    }

    /// Unreserved funds of settled entries eligible to fund payouts.
    pub fn distributable(&self, min_score: u32) -> Amount {
        self.entries
            .iter()
            .filter(|e| e.is_settled() && e.anonymity_score >= min_score)
            .map(|e| e.available())
            .sum()
    }

    pub fn verify(&self) -> Result<()> {
        let expected: Amount = self
            .entries
            .iter()
            .filter(|e| e.status.counts_toward_total())
            .map(|e| e.amount)
            .sum();
        if expected != self.total {
            return Err(MixerError::InvalidState {
                from: format!("{} total {}", self.currency, self.total),
                to: format!("entry sum {}", expected),
            });
        }
        if self.reserved > self.total {
            return Err(MixerError::InvalidState {
                from: format!("{} reserved {}", self.currency, self.reserved),
                to: format!("total {}", self.total),
            });
        }
        Ok(())
    }

    pub fn health(&self) -> PoolHealth {
        if self.total > self.limits.max_pool {
            PoolHealth::Overflow
        } else if self.total < self.limits.min_pool {
            PoolHealth::Depleted
        } else if self.total as f64 >= HEALTHY_RATIO * self.limits.target_pool as f64 {
            PoolHealth::Healthy
        } else {
            PoolHealth::Low
        }
    }

    pub fn utilization(&self) -> f64 {
        if self.limits.target_pool == 0 {
            return 100.0;
        }
        (self.total as f64 / self.limits.target_pool as f64 * 100.0).min(100.0)
    }

    pub fn status(&self) -> LiquidityStatus {
        LiquidityStatus {
            currency: self.currency.clone(),
            status: self.health(),
            total: self.total,
            reserved: self.reserved,
            available: self.total - self.reserved.min(self.total),
            participants: self.participant_count(),
            utilization: self.utilization(),
        }
    }

    pub fn statistics(&self, now_ms: u64) -> PoolStatistics {
        let live: Vec<&PoolEntry> = self
            .entries
            .iter()
            .filter(|e| e.status.counts_toward_total())
            .collect();
        let score_sum: u64 = live.iter().map(|e| u64::from(e.anonymity_score)).sum();
        PoolStatistics {
            currency: self.currency.clone(),
            total: self.total,
            reserved: self.reserved,
            participants: live.len(),
            active_entries: live
                .iter()
                .filter(|e| e.status == EntryStatus::Active)
                .count(),
            mixing_entries: live
                .iter()
                .filter(|e| e.status == EntryStatus::Mixing)
                .count(),
            settled_entries: live.iter().filter(|e| e.is_settled()).count(),
            awaiting_deposit: live.iter().filter(|e| e.awaiting_deposit).count(),
            stale_entries: live.iter().filter(|e| e.stale).count(),
            archived_entries: self.archived,
            rounds_executed: self.rounds_executed,
            volume_mixed: self.volume_mixed,
            average_anonymity_score: if live.is_empty() {
                0.0
            } else {
                score_sum as f64 / live.len() as f64
            },
            oldest_entry_age_ms: live.iter().map(|e| e.age_ms(now_ms)).max().unwrap_or(0),
            last_activity: self.last_activity,
            rotation_addresses: 0,
        }
    }
}
