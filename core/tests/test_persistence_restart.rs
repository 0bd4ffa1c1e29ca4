use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use veil_core::adapters::{
    HeuristicRiskAssessor, PolicyValidator, SimulatedChain, SoftwareKeyCustody, TracingEventSink,
};
use veil_core::store::{KvPersistence, SledStorage, StorageBackend};
use veil_core::{
    Amount, CollaboratorRegistry, Currency, ManualClock, MixId, MixOrchestrator, MixOrder,
    MixStatus, MixerConfig, PayoutAddress,
};

const BTC: Amount = 100_000_000;

/// Everything that outlives a process: the ledger, custody and the clock.
struct World {
    chain: Arc<SimulatedChain>,
    custody: Arc<SoftwareKeyCustody>,
    clock: Arc<ManualClock>,
}

fn config() -> MixerConfig {
    let mut config = MixerConfig::default();
    // Keep the background driver idle; the test ticks by hand
    config.orchestrator.tick_interval = Duration::from_secs(3600);
    config
}

fn boot(
    world: &World,
    path: &Path,
) -> (Arc<MixOrchestrator>, Arc<KvPersistence<SledStorage>>) {
    let config = config();
    let persistence = Arc::new(KvPersistence::new(SledStorage::open(path).unwrap()));
    let registry = CollaboratorRegistry::new()
        .with_validator(Arc::new(PolicyValidator::new(config.clone())))
        .with_risk_assessor(Arc::new(HeuristicRiskAssessor::new(config.clone()).unwrap()))
        .with_key_custody(world.custody.clone())
        .with_blockchain(world.chain.clone())
        .with_persistence(persistence.clone())
        .with_event_sink(Arc::new(TracingEventSink));
    let orchestrator = MixOrchestrator::with_clock(config, &registry, world.clock.clone()).unwrap();
    (orchestrator, persistence)
}

#[tokio::test]
async fn test_in_flight_mixes_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let btc = Currency::new("BTC");
    let world = World {
        chain: Arc::new(SimulatedChain::new()),
        custody: Arc::new(SoftwareKeyCustody::new()),
        clock: Arc::new(ManualClock::new(1_700_000_000_000)),
    };

    let mut mixing: Vec<MixId> = Vec::new();
    let pending: MixId;

    // First process: three mixes reach DISTRIBUTING, one waits for its deposit
    {
        let (orchestrator, persistence) = boot(&world, dir.path());
        for i in 0..3 {
            let order = MixOrder::new(
                "BTC",
                BTC,
                vec![PayoutAddress::new(format!("bc1qafter{}", i), 100)],
            )
            .with_delay(Duration::from_secs(60));
            let id = orchestrator.process(order).await.unwrap();
            let address = orchestrator.mix(&id).await.unwrap().deposit_address.unwrap();
            world.chain.credit(&btc, &address, BTC);
            world.clock.advance(Duration::from_secs(61));
            orchestrator.confirm_deposit(&id).await.unwrap();
            mixing.push(id);
        }
        pending = orchestrator
            .process(MixOrder::new(
                "BTC",
                BTC,
                vec![PayoutAddress::new("bc1qlater", 100)],
            ))
            .await
            .unwrap();
        orchestrator.tick().await;
        for id in &mixing {
            assert_eq!(
                orchestrator.get_status(id).await,
                Some(MixStatus::Distributing)
            );
        }
        persistence.backend().flush().unwrap();
    }

    // Second process over the same store
    let (orchestrator, _persistence) = boot(&world, dir.path());
    orchestrator.start().await.unwrap();
    assert!(orchestrator.is_running().await);

    for id in &mixing {
        assert_eq!(
            orchestrator.get_status(id).await,
            Some(MixStatus::Distributing)
        );
    }
    assert_eq!(
        orchestrator.get_status(&pending).await,
        Some(MixStatus::PendingDeposit)
    );
    let stats = orchestrator.statistics().await;
    assert_eq!(stats.active_mixes, 4);
    assert_eq!(orchestrator.scheduler().statistics().scheduled, 3);
    assert_eq!(
        orchestrator
            .pool_manager()
            .liquidity_status(&btc)
            .await
            .unwrap()
            .total,
        4 * BTC
    );

    world.clock.advance(Duration::from_secs(61));
    orchestrator.tick().await;
    for (i, id) in mixing.iter().enumerate() {
        assert_eq!(orchestrator.get_status(id).await, Some(MixStatus::Completed));
        assert_eq!(
            world.chain.balance(&btc, &format!("bc1qafter{}", i)),
            99_500_000
        );
    }

    // Restarting a running engine is a no-op
    orchestrator.start().await.unwrap();
    assert_eq!(orchestrator.statistics().await.completed, 3);
    orchestrator.stop().await;
}
