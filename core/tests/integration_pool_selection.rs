use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use veil_core::adapters::{reference_registry, SimulatedChain};
use veil_core::events::PoolEvent;
use veil_core::model::{EntryStatus, PoolEntry};
use veil_core::store::{KvPersistence, MemoryStorage};
use veil_core::{
    Amount, AnonymityLevel, Currency, ManualClock, MixId, MixRequest, MixStatus, MixerConfig,
    MixerError, PayoutAddress, PoolManager,
};

const BTC: Amount = 100_000_000;

struct Pools {
    manager: PoolManager,
    chain: Arc<SimulatedChain>,
    clock: Arc<ManualClock>,
    events: mpsc::UnboundedReceiver<PoolEvent>,
}

fn pools() -> Pools {
    let config = MixerConfig::default();
    let chain = Arc::new(SimulatedChain::new());
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let collaborators = reference_registry(
        &config,
        chain.clone(),
        Arc::new(KvPersistence::new(MemoryStorage::new())),
    )
    .unwrap()
    .resolve()
    .unwrap();
    let (tx, events) = mpsc::unbounded_channel();
    let manager = PoolManager::new(config, collaborators, clock.clone(), tx).unwrap();
    Pools {
        manager,
        chain,
        clock,
        events,
    }
}

fn request(amount: Amount, anonymity: AnonymityLevel) -> MixRequest {
    MixRequest {
        id: MixId::new(),
        currency: Currency::new("BTC"),
        amount,
        payouts: vec![PayoutAddress::new("bc1qpayout", 100)],
        requested_delay_ms: None,
        effective_delay_ms: 60_000,
        anonymity,
        status: MixStatus::PendingDeposit,
        risk_score: 10,
        created_at: 0,
        expires_at: 0,
        expected_completion_at: 0,
        deposit_address: None,
        failure_reason: None,
        completed_at: None,
    }
}

impl Pools {
    async fn deposit(&self, amount: Amount, anonymity: AnonymityLevel) -> PoolEntry {
        let entry = self
            .manager
            .add_to_pool(&request(amount, anonymity))
            .await
            .unwrap();
        self.chain.credit(&entry.currency, &entry.address, amount);
        self.clock.advance(Duration::from_secs(61));
        self.manager
            .confirm_deposit(&entry.currency, &entry.id)
            .await
            .unwrap()
    }

    async fn current(&self, entry: &PoolEntry) -> PoolEntry {
        self.manager
            .entry(&entry.currency, &entry.id)
            .await
            .unwrap()
            .unwrap()
    }
}

#[tokio::test]
async fn test_three_participants_mix_with_score_increment() {
    let mut pools = pools();
    let btc = Currency::new("BTC");
    let deposits = vec![
        pools.deposit(BTC, AnonymityLevel::Medium).await,
        pools.deposit(BTC * 12 / 10, AnonymityLevel::Medium).await,
        pools.deposit(BTC * 9 / 10, AnonymityLevel::Medium).await,
    ];

    let (transaction_id, finished) = loop {
        match pools.events.try_recv().unwrap() {
            PoolEvent::RoundCompleted {
                transaction_id,
                finished,
                ..
            } => break (transaction_id, finished),
            _ => continue,
        }
    };
    assert_eq!(finished.len(), 3);

    let transaction = pools.manager.transaction(&transaction_id).unwrap();
    assert_eq!(transaction.participants.len(), 3);
    assert_eq!(transaction.input_amount, transaction.output_amount);

    for before in &deposits {
        let after = pools.current(before).await;
        assert_eq!(after.anonymity_score, before.anonymity_score + 10);
        assert_eq!(after.rounds_completed, 1);
        assert_eq!(after.history.len(), 1);
        assert_eq!(after.history[0].anonymity_set, 3);
        assert_ne!(after.address, before.address);
        assert_eq!(pools.chain.balance(&btc, &before.address), 0);
        assert_eq!(pools.chain.balance(&btc, &after.address), before.amount);
        assert!(after.is_settled());
    }

    let status = pools.manager.liquidity_status(&btc).await.unwrap();
    assert_eq!(status.total, BTC + BTC * 12 / 10 + BTC * 9 / 10);
}

#[tokio::test]
async fn test_two_participants_defer_the_round() {
    let mut pools = pools();
    let first = pools.deposit(BTC, AnonymityLevel::Medium).await;
    pools.deposit(BTC, AnonymityLevel::Medium).await;

    assert!(matches!(
        pools.events.try_recv(),
        Ok(PoolEvent::RoundDeferred { .. })
    ));
    assert_eq!(pools.current(&first).await.status, EntryStatus::Active);
    assert_eq!(pools.manager.sweep().await, 0);

    pools.deposit(BTC, AnonymityLevel::Medium).await;
    assert_eq!(pools.current(&first).await.rounds_completed, 1);
}

#[tokio::test]
async fn test_out_of_window_amounts_are_not_selected() {
    let pools = pools();
    // Above twice the mix target
    let large = pools.deposit(3 * BTC, AnonymityLevel::Medium).await;
    for _ in 0..3 {
        pools.deposit(BTC, AnonymityLevel::Medium).await;
    }
    let large = pools.current(&large).await;
    assert_eq!(large.status, EntryStatus::Active);
    assert_eq!(large.rounds_completed, 0);
}

#[tokio::test]
async fn test_high_anonymity_needs_a_second_round() {
    let pools = pools();
    let mut deposits = Vec::new();
    for _ in 0..3 {
        deposits.push(pools.deposit(BTC, AnonymityLevel::High).await);
    }
    let after_first = pools.current(&deposits[0]).await;
    assert_eq!(after_first.rounds_completed, 1);
    assert_eq!(after_first.status, EntryStatus::Active);
    assert!(!after_first.is_settled());

    assert_eq!(pools.manager.sweep().await, 1);
    for entry in &deposits {
        let done = pools.current(entry).await;
        assert_eq!(done.rounds_completed, 2);
        assert_eq!(done.anonymity_score, 20);
        assert!(done.is_settled());
    }
}

#[tokio::test]
async fn test_overflow_leaves_pool_unchanged() {
    let pools = pools();
    let btc = Currency::new("BTC");
    for _ in 0..5 {
        pools
            .manager
            .add_to_pool(&request(20 * BTC, AnonymityLevel::Medium))
            .await
            .unwrap();
    }
    let before = pools.manager.liquidity_status(&btc).await.unwrap();
    let entries_before = pools.manager.entries(&btc).await.unwrap().len();

    let err = pools
        .manager
        .add_to_pool(&request(1, AnonymityLevel::Medium))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MixerError::PoolOverflow { total, amount: 1, .. } if total == 100 * BTC
    ));
    assert!(err.is_capacity());
    assert_eq!(pools.manager.liquidity_status(&btc).await.unwrap(), before);
    assert_eq!(pools.manager.entries(&btc).await.unwrap().len(), entries_before);
}

#[tokio::test]
async fn test_unknown_currency_is_rejected() {
    let pools = pools();
    let mut doge = request(BTC, AnonymityLevel::Low);
    doge.currency = Currency::new("DOGE");
    assert!(pools.manager.add_to_pool(&doge).await.is_err());
}
