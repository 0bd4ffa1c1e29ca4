// Heuristic risk scoring
//
// Scores are additive and capped at 100. Large amounts relative to the
// currency's mix target, whole-coin amounts and wide payout fan-out all stand
// out in a pool and raise the score.

use crate::collaborators::{RiskAssessment, RiskAssessor};
use crate::config::MixerConfig;
use crate::error::{MixerError, Result};
use crate::model::MixOrder;
use crate::scheduler::delay::{compute_jitter, DelayPolicy};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

const BASE_SCORE: u32 = 10;

pub struct HeuristicRiskAssessor {
    config: MixerConfig,
    delays: DelayPolicy,
}

impl HeuristicRiskAssessor {
    pub fn new(config: MixerConfig) -> Result<Self> {
        let delays = DelayPolicy::new(config.scheduler.min_delay, config.scheduler.max_delay)?;
        Ok(Self { config, delays })
    }

    fn score(&self, order: &MixOrder) -> Result<RiskAssessment> {
        let limits = self.config.currency(&order.currency)?;
        let mut score = BASE_SCORE;
        let mut flags = Vec::new();

        let ratio = order.amount as f64 / limits.mix_target as f64;
        if ratio > 5.0 {
            score += 40;
            flags.push("large_amount".to_string());
        } else if ratio > 2.0 {
            score += 20;
            flags.push("above_target".to_string());
        }

        let whole_coin = 10u64.saturating_pow(u32::from(limits.decimals));
        if order.amount >= whole_coin && order.amount % whole_coin == 0 {
            score += 10;
            flags.push("round_amount".to_string());
        }

        if order.payouts.len() >= 4 {
            score += 15;
            flags.push("high_fanout".to_string());
        }

        Ok(RiskAssessment {
            score: score.min(100),
            flags,
        })
    }
}

#[async_trait]
impl RiskAssessor for HeuristicRiskAssessor {
    async fn analyze_risk(&self, order: &MixOrder) -> Result<RiskAssessment> {
        let assessment = self.score(order)?;
        debug!(
            "risk score {} for {} {} ({:?})",
            assessment.score, order.amount, order.currency, assessment.flags
        );
        if assessment.score > self.config.risk.block_score {
            return Err(MixerError::Security(format!(
                "risk score {} exceeds {}",
                assessment.score, self.config.risk.block_score
            )));
        }
        Ok(assessment)
    }

    async fn generate_optimal_delay(&self) -> Result<Duration> {
        Ok(self.delays.clamp(compute_jitter(&self.config.scheduler.jitter)))
    }
}
