use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use veil_core::adapters::{reference_registry, SimulatedChain};
use veil_core::store::{KvPersistence, MemoryStorage};
use veil_core::{
    Amount, Currency, LifecycleEvent, ManualClock, MixId, MixOrchestrator, MixOrder, MixStatus,
    MixerConfig, MixerError, PayoutAddress,
};

const BTC: Amount = 100_000_000;

struct Engine {
    orchestrator: Arc<MixOrchestrator>,
    chain: Arc<SimulatedChain>,
    clock: Arc<ManualClock>,
}

fn engine(config: MixerConfig) -> Engine {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("veil_core=debug")
        .with_test_writer()
        .try_init();
    let chain = Arc::new(SimulatedChain::new());
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let registry = reference_registry(
        &config,
        chain.clone(),
        Arc::new(KvPersistence::new(MemoryStorage::new())),
    )
    .unwrap();
    let orchestrator = MixOrchestrator::with_clock(config, &registry, clock.clone()).unwrap();
    Engine {
        orchestrator,
        chain,
        clock,
    }
}

fn order(payouts: Vec<PayoutAddress>) -> MixOrder {
    MixOrder::new("BTC", BTC, payouts).with_delay(Duration::from_secs(60))
}

impl Engine {
    /// Fund each mix's deposit address and confirm them one minute apart.
    async fn fund(&self, ids: &[MixId]) {
        let btc = Currency::new("BTC");
        for id in ids {
            let mix = self.orchestrator.mix(id).await.unwrap();
            self.chain
                .credit(&btc, mix.deposit_address.as_deref().unwrap(), mix.amount);
            self.clock.advance(Duration::from_secs(61));
            assert_eq!(
                self.orchestrator.confirm_deposit(id).await.unwrap(),
                MixStatus::DepositReceived
            );
        }
    }

    async fn submit(&self, count: usize) -> Vec<MixId> {
        let mut ids = Vec::new();
        for i in 0..count {
            let payouts = vec![PayoutAddress::new(format!("bc1qdest{}", i), 100)];
            ids.push(self.orchestrator.process(order(payouts)).await.unwrap());
        }
        ids
    }
}

#[tokio::test]
async fn test_three_mixes_complete_with_fee_deducted_split() {
    let engine = engine(MixerConfig::default());
    let btc = Currency::new("BTC");
    let mut events = engine.orchestrator.subscribe();

    let split = engine
        .orchestrator
        .process(order(vec![
            PayoutAddress::new("bc1qsixty", 60),
            PayoutAddress::new("bc1qforty", 40),
        ]))
        .await
        .unwrap();
    let mut ids = vec![split];
    ids.extend(engine.submit(2).await);
    engine.fund(&ids).await;

    // The third confirmation runs the round; the next tick plans payouts
    engine.orchestrator.tick().await;
    for id in &ids {
        assert_eq!(
            engine.orchestrator.get_status(id).await,
            Some(MixStatus::Distributing)
        );
    }
    assert_eq!(engine.orchestrator.scheduler().statistics().scheduled, 4);

    engine.clock.advance(Duration::from_secs(61));
    let report = engine.orchestrator.tick().await;
    assert_eq!(report.operations_executed, 4);
    for id in &ids {
        assert_eq!(
            engine.orchestrator.get_status(id).await,
            Some(MixStatus::Completed)
        );
    }

    assert_eq!(engine.chain.balance(&btc, "bc1qsixty"), 59_700_000);
    assert_eq!(engine.chain.balance(&btc, "bc1qforty"), 39_800_000);
    assert_eq!(
        engine.chain.balance(&btc, "bc1qsixty") + engine.chain.balance(&btc, "bc1qforty"),
        99_500_000
    );

    let stats = engine.orchestrator.statistics().await;
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.active_mixes, 0);
    assert_eq!(stats.success_rate, 100.0);

    // Fee residue stays behind as pool liquidity
    let pool = engine
        .orchestrator
        .pool_manager()
        .liquidity_status(&btc)
        .await
        .unwrap();
    assert_eq!(pool.total, 3 * (BTC - 99_500_000));
    assert_eq!(pool.reserved, 0);

    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.mix_id() == split {
            statuses.push(event.name());
        }
    }
    assert_eq!(statuses.first(), Some(&"mix_started"));
    assert_eq!(statuses.last(), Some(&"mix_completed"));
    assert_eq!(statuses.len(), 5);
}

#[tokio::test]
async fn test_admission_limit_is_exact_under_concurrency() {
    let mut config = MixerConfig::default();
    config.orchestrator.max_concurrent_mixes = 5;
    let engine = engine(config);

    let attempts = (0..6).map(|i| {
        let orchestrator = engine.orchestrator.clone();
        async move {
            orchestrator
                .process(MixOrder::new(
                    "BTC",
                    BTC,
                    vec![PayoutAddress::new(format!("bc1qc{}", i), 100)],
                ))
                .await
        }
    });
    let results = join_all(attempts).await;
    let accepted = results.iter().filter(|r| r.is_ok()).count();
    let refused: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();
    assert_eq!(accepted, 5);
    assert_eq!(refused, vec![&MixerError::ConcurrencyLimit]);
    assert_eq!(
        MixerError::ConcurrencyLimit.to_string(),
        "maximum concurrent mixes reached"
    );

    // A terminal mix gives its slot back
    let first = results[0].as_ref().unwrap();
    engine.orchestrator.cancel(first).await.unwrap();
    assert!(engine
        .orchestrator
        .process(MixOrder::new(
            "BTC",
            BTC,
            vec![PayoutAddress::new("bc1qlate", 100)],
        ))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_cancel_only_before_mixing() {
    let engine = engine(MixerConfig::default());
    let btc = Currency::new("BTC");
    let ids = engine.submit(4).await;
    engine.fund(&ids[..3]).await;
    engine.orchestrator.tick().await;

    let err = engine.orchestrator.cancel(&ids[0]).await.unwrap_err();
    assert!(matches!(err, MixerError::InvalidState { .. }));
    assert_eq!(
        engine.orchestrator.get_status(&ids[0]).await,
        Some(MixStatus::Distributing)
    );

    let before = engine
        .orchestrator
        .pool_manager()
        .liquidity_status(&btc)
        .await
        .unwrap();
    engine.orchestrator.cancel(&ids[3]).await.unwrap();
    let after = engine
        .orchestrator
        .pool_manager()
        .liquidity_status(&btc)
        .await
        .unwrap();
    assert_eq!(after.total, before.total - BTC);
    assert_eq!(after.reserved, before.reserved - BTC);
    assert_eq!(
        engine.orchestrator.get_status(&ids[3]).await,
        Some(MixStatus::Cancelled)
    );

    let missing = engine.orchestrator.cancel(&MixId::new()).await.unwrap_err();
    assert!(matches!(missing, MixerError::NotFound { .. }));
}

#[tokio::test]
async fn test_status_query_is_idempotent() -> anyhow::Result<()> {
    let engine = engine(MixerConfig::default());
    let ids = engine.submit(3).await;
    assert_eq!(
        engine.orchestrator.get_status(&ids[0]).await,
        Some(MixStatus::PendingDeposit)
    );
    engine.fund(&ids).await;
    engine.orchestrator.tick().await;
    engine.clock.advance(Duration::from_secs(61));
    engine.orchestrator.tick().await;

    let before = engine
        .orchestrator
        .mix(&ids[0])
        .await
        .ok_or_else(|| anyhow::anyhow!("mix {} vanished", ids[0]))?;
    for _ in 0..3 {
        assert_eq!(
            engine.orchestrator.get_status(&ids[0]).await,
            Some(MixStatus::Completed)
        );
    }
    let after = engine
        .orchestrator
        .mix(&ids[0])
        .await
        .ok_or_else(|| anyhow::anyhow!("mix {} vanished", ids[0]))?;
    assert_eq!(before.completed_at, after.completed_at);
    assert_eq!(engine.orchestrator.get_status(&MixId::new()).await, None);
    Ok(())
}

#[tokio::test]
async fn test_payout_failures_exhaust_retries_then_fail() {
    let engine = engine(MixerConfig::default());
    let btc = Currency::new("BTC");
    let ids = engine.submit(3).await;
    engine.fund(&ids).await;
    engine.orchestrator.tick().await;
    engine.chain.set_fail_broadcasts(true);

    // One initial attempt plus two re-schedules
    for _ in 0..3 {
        engine.clock.advance(Duration::from_secs(61));
        engine.orchestrator.tick().await;
    }

    for id in &ids {
        let mix = engine.orchestrator.mix(id).await.unwrap();
        assert_eq!(mix.status, MixStatus::Failed);
        assert!(mix.failure_reason.unwrap().contains("broadcast rejected"));
    }
    let pool = engine
        .orchestrator
        .pool_manager()
        .liquidity_status(&btc)
        .await
        .unwrap();
    assert_eq!(pool.reserved, 0);
    assert_eq!(pool.total, 3 * BTC);
    assert_eq!(engine.orchestrator.statistics().await.failed, 3);
}

#[tokio::test]
async fn test_coinjoin_payouts_share_one_operation() {
    let mut config = MixerConfig::default();
    config.orchestrator.coinjoin_payouts = true;
    let engine = engine(config);
    let ids = engine.submit(3).await;
    engine.fund(&ids).await;
    engine.orchestrator.tick().await;

    let stats = engine.orchestrator.scheduler().statistics();
    assert_eq!(stats.scheduled, 1);

    engine.clock.advance(Duration::from_secs(61));
    engine.orchestrator.tick().await;
    let btc = Currency::new("BTC");
    for (i, id) in ids.iter().enumerate() {
        assert_eq!(
            engine.orchestrator.get_status(id).await,
            Some(MixStatus::Completed)
        );
        assert_eq!(
            engine.chain.balance(&btc, &format!("bc1qdest{}", i)),
            99_500_000
        );
    }
}

#[tokio::test]
async fn test_expired_deposit_never_reaches_pool_round() {
    let engine = engine(MixerConfig::default());
    let ids = engine.submit(1).await;
    let mut events = engine.orchestrator.subscribe();

    engine.clock.advance(Duration::from_secs(25 * 60 * 60));
    let report = engine.orchestrator.tick().await;
    assert_eq!(report.expired, 1);
    assert_eq!(
        engine.orchestrator.get_status(&ids[0]).await,
        Some(MixStatus::Expired)
    );
    assert!(matches!(
        events.try_recv(),
        Ok(LifecycleEvent::MixExpired { .. })
    ));
}
