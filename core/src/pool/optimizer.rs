// Periodic pool analysis
//
// Produces a plan from a snapshot under the pool lock; the manager acts on
// the plan after the lock is released.

use super::liquidity::LiquidityPool;
use crate::config::PoolConfig;
use crate::model::{Amount, Currency, EntryId};
use crate::util::time::duration_ms;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RebalanceAction {
    /// Pool below its minimum, needs outside liquidity
    Increase { shortfall: Amount },
    /// Pool above target, excess can be consolidated
    Decrease { excess: Amount },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkewReport {
    pub coefficient_of_variation: f64,
    /// Largest selectable entry as a share of all selectable funds
    pub largest_share: f64,
    pub skewed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationPlan {
    pub currency: Currency,
    pub action: Option<RebalanceAction>,
    /// Entries newly flagged as stale in this pass
    pub stale: Vec<EntryId>,
    pub skew: SkewReport,
    /// Run a mixing attempt once the lock is released
    pub requeue: bool,
}

/// Size-distribution skew of the amounts waiting for a round.
pub fn size_skew(amounts: &[Amount], cv_threshold: f64, dominant_share: f64) -> SkewReport {
    if amounts.len() < 2 {
        return SkewReport {
            coefficient_of_variation: 0.0,
            largest_share: if amounts.is_empty() { 0.0 } else { 1.0 },
            skewed: false,
        };
    }
    let n = amounts.len() as f64;
    let sum: f64 = amounts.iter().map(|a| *a as f64).sum();
    let mean = sum / n;
    let variance = amounts
        .iter()
        .map(|a| {
            let d = *a as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    let cv = if mean > 0.0 { variance.sqrt() / mean } else { 0.0 };
    let largest = amounts.iter().copied().max().unwrap_or(0) as f64;
    let share = if sum > 0.0 { largest / sum } else { 0.0 };
    SkewReport {
        coefficient_of_variation: cv,
        largest_share: share,
        skewed: cv > cv_threshold || share > dominant_share,
    }
}

/// Flag entries older than `max_pool_age`, returning the newly flagged ones.
pub fn mark_stale(pool: &mut LiquidityPool, now_ms: u64, config: &PoolConfig) -> Vec<EntryId> {
    let max_age = duration_ms(config.max_pool_age);
    let ids: Vec<EntryId> = pool
        .entries()
        .iter()
        .filter(|e| !e.stale && e.status.counts_toward_total() && e.age_ms(now_ms) > max_age)
        .map(|e| e.id)
        .collect();
    for id in &ids {
        if let Some(entry) = pool.entry_mut(id) {
            entry.stale = true;
        }
    }
    ids
}

pub fn analyze(pool: &LiquidityPool, stale: Vec<EntryId>, config: &PoolConfig) -> OptimizationPlan {
    let limits = pool.limits();
    let total = pool.total();
    let action = if total < limits.min_pool {
        Some(RebalanceAction::Increase {
            shortfall: limits.target_pool - total,
        })
    } else if total > limits.target_pool {
        Some(RebalanceAction::Decrease {
            excess: total - limits.target_pool,
        })
    } else {
        None
    };

    let waiting: Vec<Amount> = pool
        .entries()
        .iter()
        .filter(|e| e.is_selectable())
        .map(|e| e.amount)
        .collect();
    let skew = size_skew(&waiting, config.skew_threshold, config.dominant_share);

    OptimizationPlan {
        currency: pool.currency().clone(),
        action,
        stale,
        skew,
        requeue: pool.needs_mixing() && !waiting.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CurrencyConfig;
    use crate::pool::liquidity::tests::entry;

    const BTC: Amount = 100_000_000;

    fn pool_with(amounts: &[Amount]) -> LiquidityPool {
        let mut pool = LiquidityPool::new(Currency::new("BTC"), CurrencyConfig::bitcoin(), 0);
        for (i, amount) in amounts.iter().enumerate() {
            pool.insert(entry(*amount, i as u64 * 120_000), 0);
        }
        pool
    }

    #[test]
    fn test_uniform_sizes_not_skewed() {
        let report = size_skew(&[BTC, BTC, BTC, BTC], 1.0, 0.5);
        assert_eq!(report.coefficient_of_variation, 0.0);
        assert_eq!(report.largest_share, 0.25);
        assert!(!report.skewed);
    }

    #[test]
    fn test_dominant_entry_is_skewed() {
        let report = size_skew(&[BTC / 10, BTC / 10, 2 * BTC], 5.0, 0.5);
        assert!(report.largest_share > 0.9);
        assert!(report.skewed);
    }

    #[test]
    fn test_increase_when_depleted() {
        let pool = pool_with(&[BTC / 10]);
        let plan = analyze(&pool, Vec::new(), &PoolConfig::default());
        assert_eq!(
            plan.action,
            Some(RebalanceAction::Increase {
                shortfall: 10 * BTC - BTC / 10
            })
        );
    }

    #[test]
    fn test_decrease_above_target() {
        let pool = pool_with(&[6 * BTC, 6 * BTC]);
        let plan = analyze(&pool, Vec::new(), &PoolConfig::default());
        assert_eq!(
            plan.action,
            Some(RebalanceAction::Decrease { excess: 2 * BTC })
        );
    }

    #[test]
    fn test_stale_entries_flagged_once() {
        let mut pool = pool_with(&[BTC, BTC]);
        let day = 24 * 60 * 60 * 1_000;
        let config = PoolConfig::default();
        let flagged = mark_stale(&mut pool, day + 60_000, &config);
        assert_eq!(flagged.len(), 1);
        assert!(mark_stale(&mut pool, day + 60_000, &config).is_empty());
        assert_eq!(pool.statistics(day).stale_entries, 1);
    }

    #[test]
    fn test_requeue_only_when_flagged_with_candidates() {
        let mut pool = pool_with(&[BTC]);
        assert!(!analyze(&pool, Vec::new(), &PoolConfig::default()).requeue);
        pool.set_needs_mixing(true);
        assert!(analyze(&pool, Vec::new(), &PoolConfig::default()).requeue);
    }
}
