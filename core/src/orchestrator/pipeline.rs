// Phase pipeline used to estimate when a mix completes

use crate::config::PhaseEstimates;
use crate::model::AnonymityLevel;
use crate::util::time::duration_ms;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MixPhase {
    DepositConfirmation,
    PoolAssembly,
    Mixing,
    Distribution,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhasePlan {
    phases: Vec<(MixPhase, Duration)>,
}

impl PhasePlan {
    /// Phases for a mix at `level`. HIGH repeats the mixing phase
    /// `extra_rounds` times.
    pub fn for_level(level: AnonymityLevel, estimates: &PhaseEstimates, extra_rounds: u32) -> Self {
        let mut phases = vec![
            (MixPhase::DepositConfirmation, estimates.deposit_confirmation),
            (MixPhase::PoolAssembly, estimates.pool_assembly),
            (MixPhase::Mixing, estimates.mixing_round),
        ];
        if level == AnonymityLevel::High {
            for _ in 0..extra_rounds {
                phases.push((MixPhase::Mixing, estimates.mixing_round));
            }
        }
        phases.push((MixPhase::Distribution, estimates.distribution));
        Self { phases }
    }

    pub fn phases(&self) -> &[(MixPhase, Duration)] {
        &self.phases
    }

    pub fn total(&self) -> Duration {
        self.phases.iter().map(|(_, d)| *d).sum()
    }

    /// now + every phase + the release delay
    pub fn expected_completion(&self, now_ms: u64, delay: Duration) -> u64 {
        now_ms
            .saturating_add(duration_ms(self.total()))
            .saturating_add(duration_ms(delay))
    }
}
