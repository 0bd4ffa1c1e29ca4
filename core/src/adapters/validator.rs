use crate::collaborators::{ValidationOutcome, Validator};
use crate::config::MixerConfig;
use crate::error::Result;
use crate::model::MixOrder;
use async_trait::async_trait;
use std::collections::HashSet;

/// Structural order checks against the configured currency limits
pub struct PolicyValidator {
    config: MixerConfig,
}

impl PolicyValidator {
    pub fn new(config: MixerConfig) -> Self {
        Self { config }
    }

    fn check(&self, order: &MixOrder) -> std::result::Result<(), String> {
        let limits = self
            .config
            .currencies
            .get(&order.currency)
            .ok_or_else(|| format!("unsupported currency {}", order.currency))?;

        if order.amount < limits.min_deposit {
            return Err(format!(
                "amount {} is below the minimum deposit {}",
                order.amount, limits.min_deposit
            ));
        }
        if order.amount > limits.max_deposit {
            return Err(format!(
                "amount {} exceeds the maximum deposit {}",
                order.amount, limits.max_deposit
            ));
        }

        let max_payouts = self.config.orchestrator.max_payout_addresses;
        if order.payouts.is_empty() {
            return Err("at least one payout address is required".to_string());
        }
        if order.payouts.len() > max_payouts {
            return Err(format!("at most {} payout addresses are allowed", max_payouts));
        }

        let mut seen = HashSet::new();
        let mut total: u32 = 0;
        for payout in &order.payouts {
            let address = payout.address.trim();
            if address.is_empty() {
                return Err("payout address must not be empty".to_string());
            }
            if !seen.insert(address) {
                return Err(format!("duplicate payout address {}", address));
            }
            if payout.percentage == 0 || payout.percentage > 100 {
                return Err(format!(
                    "payout percentage {} is outside 1..=100",
                    payout.percentage
                ));
            }
            total += u32::from(payout.percentage);
        }
        if total != 100 {
            return Err(format!("payout percentages sum to {}, expected 100", total));
        }
        Ok(())
    }
}

#[async_trait]
impl Validator for PolicyValidator {
    async fn validate(&self, order: &MixOrder) -> Result<ValidationOutcome> {
        Ok(match self.check(order) {
            Ok(()) => ValidationOutcome::accept(),
            Err(reason) => ValidationOutcome::reject(reason),
        })
    }
}
