// Veil Core: mixing coordination engine
//
// "Does this help break the link between a deposit and its payouts?"
//
// Three components share one set of collaborators: the orchestrator owns
// mix lifecycles, the pool manager owns per-currency liquidity and mixing
// rounds, the scheduler owns time-delayed payouts. Key custody, ledger
// access, validation, risk scoring and persistence sit behind traits.

pub mod adapters;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod orchestrator;
pub mod pool;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod tx;
pub mod util;

pub use collaborators::{
    BlockchainClient, CollaboratorRegistry, Collaborators, EventSink, KeyCustody, Persistence,
    RiskAssessment, RiskAssessor, ValidationOutcome, Validator,
};
pub use config::MixerConfig;
pub use error::{MixerError, Result};
pub use events::LifecycleEvent;
pub use model::{
    Amount, AnonymityLevel, Currency, MixId, MixOrder, MixRequest, MixStatus, OperationId,
    PayoutAddress,
};
pub use orchestrator::{MixOrchestrator, OrchestratorStatistics, TickReport};
pub use pool::PoolManager;
pub use scheduler::OperationScheduler;
pub use state::Lifecycle;
pub use util::time::{Clock, ManualClock, SystemClock};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{reference_registry, SimulatedChain};
    use crate::store::{KvPersistence, MemoryStorage};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_reference_engine_accepts_order() {
        let config = MixerConfig::default();
        let registry = reference_registry(
            &config,
            Arc::new(SimulatedChain::new()),
            Arc::new(KvPersistence::new(MemoryStorage::new())),
        )
        .unwrap();
        let engine = MixOrchestrator::new(config, &registry).unwrap();
        let order = MixOrder::new(
            "btc",
            50_000_000,
            vec![PayoutAddress::new("bc1qdest", 100)],
        );
        let id = engine.process(order).await.unwrap();
        assert_eq!(engine.get_status(&id).await, Some(MixStatus::PendingDeposit));
        assert_eq!(engine.get_status(&MixId::new()).await, None);
    }
}
