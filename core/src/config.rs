//! Engine configuration.
//!
//! Every threshold the pool manager, scheduler and orchestrator act on is a
//! named value here. Durations serialize as integer milliseconds.

use crate::error::{MixerError, Result};
use crate::model::{Amount, Currency};
use crate::scheduler::delay::JitterConfig;
use crate::util::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

const SATOSHI: Amount = 100_000_000;
const GWEI_PER_ETH: Amount = 1_000_000_000;

/// Limits for one currency pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyConfig {
    /// Decimal places of one whole coin in base units
    pub decimals: u8,
    /// Below this the pool is DEPLETED
    pub min_pool: Amount,
    pub target_pool: Amount,
    /// Hard ceiling, deposits that would exceed it are refused
    pub max_pool: Amount,
    /// Reference amount for candidate selection
    pub mix_target: Amount,
    pub min_deposit: Amount,
    pub max_deposit: Amount,
    /// Destination for excess liquidity when the pool runs over target
    #[serde(default)]
    pub consolidation_address: Option<String>,
}

impl CurrencyConfig {
    pub fn bitcoin() -> Self {
        Self {
            decimals: 8,
            min_pool: SATOSHI / 2,
            target_pool: 10 * SATOSHI,
            max_pool: 100 * SATOSHI,
            mix_target: SATOSHI,
            min_deposit: SATOSHI / 1_000,
            max_deposit: 20 * SATOSHI,
            consolidation_address: None,
        }
    }

    /// Ether accounted in gwei so every pool bound fits a u64.
    pub fn ether() -> Self {
        Self {
            decimals: 9,
            min_pool: 5 * GWEI_PER_ETH,
            target_pool: 100 * GWEI_PER_ETH,
            max_pool: 1_000 * GWEI_PER_ETH,
            mix_target: 10 * GWEI_PER_ETH,
            min_deposit: GWEI_PER_ETH / 100,
            max_deposit: 200 * GWEI_PER_ETH,
            consolidation_address: None,
        }
    }

    fn validate(&self, currency: &Currency) -> Result<()> {
        let fail = |what: &str| {
            Err(MixerError::Configuration(format!(
                "{}: {}",
                currency, what
            )))
        };
        if self.decimals > 18 {
            return fail("decimals must be at most 18");
        }
        if !(self.min_pool <= self.target_pool && self.target_pool <= self.max_pool) {
            return fail("pool bounds must satisfy min <= target <= max");
        }
        if self.max_pool == 0 || self.mix_target == 0 {
            return fail("max_pool and mix_target must be positive");
        }
        if self.min_deposit == 0 || self.min_deposit > self.max_deposit {
            return fail("deposit bounds must satisfy 0 < min_deposit <= max_deposit");
        }
        if self.max_deposit > self.max_pool {
            return fail("max_deposit must not exceed max_pool");
        }
        if matches!(&self.consolidation_address, Some(addr) if addr.trim().is_empty()) {
            return fail("consolidation_address must not be empty");
        }
        Ok(())
    }
}

/// Candidate selection thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Smallest candidate as a fraction of the mix target
    pub min_amount_ratio: f64,
    /// Largest candidate as a multiple of the mix target
    pub max_amount_ratio: f64,
    /// Accumulated amount needed, as a fraction of the mix target
    pub target_fill_ratio: f64,
    /// Two selected deposits must be at least this far apart in time
    #[serde(with = "crate::util::time::serde_millis")]
    pub min_deposit_separation: Duration,
    pub min_mix_participants: usize,
    pub max_mix_participants: usize,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            min_amount_ratio: 0.1,
            max_amount_ratio: 2.0,
            target_fill_ratio: 0.8,
            min_deposit_separation: Duration::from_secs(60),
            min_mix_participants: 3,
            max_mix_participants: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub min_hops: usize,
    pub max_hops: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            min_hops: 2,
            max_hops: 4,
        }
    }
}

/// Pool maintenance and scoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Entries older than this are flagged stale
    #[serde(with = "crate::util::time::serde_millis")]
    pub max_pool_age: Duration,
    /// Anonymity score gained per completed round
    pub score_increment: u32,
    /// Lowest score an entry may have to fund a payout
    pub min_distribution_score: u32,
    pub base_mixing_rounds: u32,
    pub high_anonymity_extra_rounds: u32,
    pub routing: RoutingConfig,
    /// Coefficient of variation of entry sizes above which the pool is skewed
    pub skew_threshold: f64,
    /// Share of the pool one entry may hold before the pool is skewed
    pub dominant_share: f64,
    #[serde(with = "crate::util::time::serde_millis")]
    pub optimization_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_age: Duration::from_secs(24 * 60 * 60),
            score_increment: 10,
            min_distribution_score: 10,
            base_mixing_rounds: 1,
            high_anonymity_extra_rounds: 1,
            routing: RoutingConfig::default(),
            skew_threshold: 1.0,
            dominant_share: 0.5,
            optimization_interval: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(with = "crate::util::time::serde_millis")]
    pub min_delay: Duration,
    #[serde(with = "crate::util::time::serde_millis")]
    pub max_delay: Duration,
    pub min_coinjoin_participants: usize,
    /// Shape of generated delays
    pub jitter: JitterConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(72 * 60 * 60),
            min_coinjoin_participants: 3,
            jitter: JitterConfig::default(),
        }
    }
}

/// Expected duration of each processing phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseEstimates {
    #[serde(with = "crate::util::time::serde_millis")]
    pub deposit_confirmation: Duration,
    #[serde(with = "crate::util::time::serde_millis")]
    pub pool_assembly: Duration,
    #[serde(with = "crate::util::time::serde_millis")]
    pub mixing_round: Duration,
    #[serde(with = "crate::util::time::serde_millis")]
    pub distribution: Duration,
}

impl Default for PhaseEstimates {
    fn default() -> Self {
        Self {
            deposit_confirmation: Duration::from_secs(30 * 60),
            pool_assembly: Duration::from_secs(15 * 60),
            mixing_round: Duration::from_secs(10 * 60),
            distribution: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub max_concurrent_mixes: usize,
    /// Service fee in basis points of the input amount
    pub fee_bps: u32,
    /// How long a mix may wait for its deposit
    #[serde(with = "crate::util::time::serde_millis")]
    pub deposit_window: Duration,
    pub phases: PhaseEstimates,
    /// Retry budget for collaborator calls
    pub retry: RetryPolicy,
    #[serde(with = "crate::util::time::serde_millis")]
    pub tick_interval: Duration,
    /// Re-schedules of a failed payout before the mix fails
    pub max_distribution_retries: u32,
    /// Combine payouts of mixes finishing together into one COINJOIN
    pub coinjoin_payouts: bool,
    pub max_payout_addresses: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_mixes: 100,
            fee_bps: 50,
            deposit_window: Duration::from_secs(24 * 60 * 60),
            phases: PhaseEstimates::default(),
            retry: RetryPolicy::default(),
            tick_interval: Duration::from_secs(1),
            max_distribution_retries: 2,
            coinjoin_payouts: false,
            max_payout_addresses: 5,
        }
    }
}

/// Thresholds of the heuristic risk assessor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Orders scoring above this are refused outright
    pub block_score: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self { block_score: 90 }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixerConfig {
    pub currencies: BTreeMap<Currency, CurrencyConfig>,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub risk: RiskConfig,
}

impl Default for MixerConfig {
    fn default() -> Self {
        let mut currencies = BTreeMap::new();
        currencies.insert(Currency::new("BTC"), CurrencyConfig::bitcoin());
        currencies.insert(Currency::new("ETH"), CurrencyConfig::ether());
        Self {
            currencies,
            selection: SelectionConfig::default(),
            pool: PoolConfig::default(),
            scheduler: SchedulerConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            risk: RiskConfig::default(),
        }
    }
}

impl MixerConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| MixerError::Configuration(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| MixerError::Configuration(format!("cannot serialize config: {}", e)))
    }

    /// Limits of a configured currency, or a validation error for an unknown one.
    pub fn currency(&self, currency: &Currency) -> Result<&CurrencyConfig> {
        self.currencies
            .get(currency)
            .ok_or_else(|| MixerError::Validation(format!("unsupported currency {}", currency)))
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(MixerError::Configuration(msg.to_string()));

        if self.currencies.is_empty() {
            return invalid("at least one currency must be configured");
        }
        for (currency, limits) in &self.currencies {
            limits.validate(currency)?;
        }

        let sel = &self.selection;
        if !(sel.min_amount_ratio > 0.0
            && sel.min_amount_ratio <= 1.0
            && sel.max_amount_ratio >= 1.0)
        {
            return invalid("selection ratios must satisfy 0 < min <= 1 <= max");
        }
        if !(sel.target_fill_ratio > 0.0 && sel.target_fill_ratio <= 1.0) {
            return invalid("target_fill_ratio must be in (0, 1]");
        }
        if sel.min_mix_participants < 2 {
            return invalid("min_mix_participants must be at least 2");
        }
        if sel.max_mix_participants < sel.min_mix_participants {
            return invalid("max_mix_participants must not be below min_mix_participants");
        }

        let pool = &self.pool;
        if pool.score_increment == 0 {
            return invalid("score_increment must be positive");
        }
        if pool.base_mixing_rounds == 0 {
            return invalid("base_mixing_rounds must be at least 1");
        }
        if pool.routing.min_hops == 0 || pool.routing.min_hops > pool.routing.max_hops {
            return invalid("routing hops must satisfy 1 <= min_hops <= max_hops");
        }
        if pool.skew_threshold <= 0.0 || !(pool.dominant_share > 0.0 && pool.dominant_share <= 1.0)
        {
            return invalid("skew thresholds must be positive and dominant_share in (0, 1]");
        }
        if pool.optimization_interval.is_zero() {
            return invalid("optimization_interval must be positive");
        }

        let sched = &self.scheduler;
        if sched.min_delay.is_zero() || sched.min_delay > sched.max_delay {
            return invalid("scheduler delays must satisfy 0 < min_delay <= max_delay");
        }
        if sched.min_coinjoin_participants < 2 {
            return invalid("min_coinjoin_participants must be at least 2");
        }
        sched.jitter.validate()?;

        let orch = &self.orchestrator;
        if orch.max_concurrent_mixes == 0 {
            return invalid("max_concurrent_mixes must be positive");
        }
        if orch.fee_bps >= 10_000 {
            return invalid("fee_bps must be below 10000");
        }
        if orch.deposit_window.is_zero() || orch.tick_interval.is_zero() {
            return invalid("deposit_window and tick_interval must be positive");
        }
        if orch.retry.attempts == 0 || orch.retry.timeout.is_zero() {
            return invalid("retry policy needs at least one attempt and a positive timeout");
        }
        if orch.max_payout_addresses == 0 {
            return invalid("max_payout_addresses must be positive");
        }
        if self.risk.block_score > 100 {
            return invalid("risk block_score must be at most 100");
        }
        Ok(())
    }
}
