// Reference collaborator implementations
//
// Enough to run the engine end to end in-process: policy validation,
// heuristic risk scoring, software key custody and a simulated ledger.

pub mod chain;
pub mod custody;
pub mod risk;
pub mod sink;
pub mod validator;

pub use chain::SimulatedChain;
pub use custody::SoftwareKeyCustody;
pub use risk::HeuristicRiskAssessor;
pub use sink::TracingEventSink;
pub use validator::PolicyValidator;

use crate::collaborators::{BlockchainClient, CollaboratorRegistry, Persistence};
use crate::config::MixerConfig;
use crate::error::Result;
use std::sync::Arc;

/// Registry wired with the reference adapters around the given chain and store.
pub fn reference_registry(
    config: &MixerConfig,
    chain: Arc<dyn BlockchainClient>,
    persistence: Arc<dyn Persistence>,
) -> Result<CollaboratorRegistry> {
    Ok(CollaboratorRegistry::new()
        .with_validator(Arc::new(PolicyValidator::new(config.clone())))
        .with_risk_assessor(Arc::new(HeuristicRiskAssessor::new(config.clone())?))
        .with_key_custody(Arc::new(SoftwareKeyCustody::new()))
        .with_blockchain(chain)
        .with_persistence(persistence)
        .with_event_sink(Arc::new(TracingEventSink)))
}
