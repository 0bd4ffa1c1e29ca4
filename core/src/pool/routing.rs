// Route planning: intermediate hops for each participant of a round
//
// A route is a random number of hops in [min_hops, max_hops]. Every hop is a
// distinct address, the final hop is where the funds rest after the round
// and becomes the entry's new address.

use crate::config::RoutingConfig;
use crate::error::{MixerError, Result};
use crate::model::{EntryId, RoutingPath};
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct RoutePlanner {
    config: RoutingConfig,
}

impl RoutePlanner {
    pub fn new(config: RoutingConfig) -> Result<Self> {
        if config.min_hops == 0 || config.min_hops > config.max_hops {
            return Err(MixerError::Configuration(
                "routing hops must satisfy 1 <= min_hops <= max_hops".to_string(),
            ));
        }
        Ok(Self { config })
    }

    /// Select number of hops randomly between min and max
    pub fn select_hop_count(&self) -> usize {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        rng.gen_range(self.config.min_hops..=self.config.max_hops)
    }

    /// Assemble a path from shuffled intermediates and the claimed final hop.
    pub fn build(
        &self,
        entry_id: EntryId,
        mut intermediates: Vec<String>,
        final_hop: String,
    ) -> Result<RoutingPath> {
        use rand::seq::SliceRandom;

        let hop_count = intermediates.len() + 1;
        if hop_count < self.config.min_hops || hop_count > self.config.max_hops {
            return Err(MixerError::Configuration(format!(
                "route with {} hops outside [{}, {}]",
                hop_count, self.config.min_hops, self.config.max_hops
            )));
        }

        let mut seen = HashSet::new();
        for hop in intermediates.iter().chain(std::iter::once(&final_hop)) {
            if !seen.insert(hop.as_str()) {
                return Err(MixerError::Validation(format!(
                    "duplicate hop {} in route",
                    hop
                )));
            }
        }

        intermediates.shuffle(&mut rand::thread_rng());
        intermediates.push(final_hop);
        Ok(RoutingPath {
            entry_id,
            hops: intermediates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner() -> RoutePlanner {
        RoutePlanner::new(RoutingConfig {
            min_hops: 2,
            max_hops: 4,
        })
        .unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(RoutePlanner::new(RoutingConfig {
            min_hops: 0,
            max_hops: 3
        })
        .is_err());
        assert!(RoutePlanner::new(RoutingConfig {
            min_hops: 5,
            max_hops: 3
        })
        .is_err());
    }

    #[test]
    fn test_hop_count_in_range() {
        let planner = planner();
        for _ in 0..100 {
            let n = planner.select_hop_count();
            assert!((2..=4).contains(&n));
        }
    }

    #[test]
    fn test_final_hop_is_last() {
        let path = planner()
            .build(
                EntryId::new(),
                vec!["a".into(), "b".into()],
                "final".into(),
            )
            .unwrap();
        assert_eq!(path.hops.len(), 3);
        assert_eq!(path.final_hop(), Some("final"));
    }

    #[test]
    fn test_duplicate_hops_rejected() {
        let err = planner()
            .build(EntryId::new(), vec!["a".into()], "a".into())
            .unwrap_err();
        assert!(matches!(err, MixerError::Validation(_)));
    }

    #[test]
    fn test_hop_count_bounds_enforced() {
        assert!(planner().build(EntryId::new(), vec![], "f".into()).is_err());
        let many = (0..4).map(|i| format!("h{}", i)).collect();
        assert!(planner().build(EntryId::new(), many, "f".into()).is_err());
    }
}
