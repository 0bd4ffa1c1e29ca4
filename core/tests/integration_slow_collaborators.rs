use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use veil_core::adapters::{reference_registry, SimulatedChain};
use veil_core::collaborators::ChainTxStatus;
use veil_core::model::{
    EntryId, EntryStatus, MixingTransaction, OperationId, OperationStatus, PoolEntry,
    ScheduledOperation, TransactionId, TransactionStatus,
};
use veil_core::store::{KvPersistence, MemoryStorage};
use veil_core::tx::SignedTransaction;
use veil_core::{
    Amount, BlockchainClient, Currency, ManualClock, MixId, MixOrchestrator, MixOrder, MixRequest,
    MixStatus, MixerConfig, MixerError, PayoutAddress, Persistence, Result,
};

const BTC: Amount = 100_000_000;

/// Node that stalls before accepting a broadcast. A stalled call that is
/// abandoned never reaches the ledger.
struct SlowChain {
    inner: Arc<SimulatedChain>,
    stall_ms: AtomicU64,
    broadcasts: AtomicUsize,
}

impl SlowChain {
    fn stall(&self, delay: Duration) {
        self.stall_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlockchainClient for SlowChain {
    async fn generate_address(&self, currency: &Currency, public_key: &[u8]) -> Result<String> {
        self.inner.generate_address(currency, public_key).await
    }

    async fn get_balance(&self, currency: &Currency, address: &str) -> Result<Amount> {
        self.inner.get_balance(currency, address).await
    }

    async fn broadcast_transaction(&self, tx: &SignedTransaction) -> Result<String> {
        self.broadcasts.fetch_add(1, Ordering::SeqCst);
        let stall = self.stall_ms.load(Ordering::SeqCst);
        if stall > 0 {
            tokio::time::sleep(Duration::from_millis(stall)).await;
        }
        self.inner.broadcast_transaction(tx).await
    }

    async fn get_transaction_status(&self, currency: &Currency, hash: &str) -> Result<ChainTxStatus> {
        self.inner.get_transaction_status(currency, hash).await
    }
}

/// Store whose entry and operation writes land, then stall before returning.
struct SlowStore {
    inner: KvPersistence<MemoryStorage>,
    stall_ms: AtomicU64,
}

impl SlowStore {
    async fn stall(&self) {
        let stall = self.stall_ms.load(Ordering::SeqCst);
        if stall > 0 {
            tokio::time::sleep(Duration::from_millis(stall)).await;
        }
    }
}

#[async_trait]
impl Persistence for SlowStore {
    async fn save_request(&self, request: &MixRequest) -> Result<()> {
        self.inner.save_request(request).await
    }

    async fn load_request(&self, id: &MixId) -> Result<Option<MixRequest>> {
        self.inner.load_request(id).await
    }

    async fn requests_by_status(&self, currency: &Currency, status: MixStatus) -> Result<Vec<MixRequest>> {
        self.inner.requests_by_status(currency, status).await
    }

    async fn save_entry(&self, entry: &PoolEntry) -> Result<()> {
        self.inner.save_entry(entry).await?;
        self.stall().await;
        Ok(())
    }

    async fn load_entry(&self, id: &EntryId) -> Result<Option<PoolEntry>> {
        self.inner.load_entry(id).await
    }

    async fn entries_by_status(&self, currency: &Currency, status: EntryStatus) -> Result<Vec<PoolEntry>> {
        self.inner.entries_by_status(currency, status).await
    }

    async fn save_operation(&self, operation: &ScheduledOperation) -> Result<()> {
        self.inner.save_operation(operation).await?;
        self.stall().await;
        Ok(())
    }

    async fn load_operation(&self, id: &OperationId) -> Result<Option<ScheduledOperation>> {
        self.inner.load_operation(id).await
    }

    async fn operations_by_status(
        &self,
        currency: &Currency,
        status: OperationStatus,
    ) -> Result<Vec<ScheduledOperation>> {
        self.inner.operations_by_status(currency, status).await
    }

    async fn save_transaction(&self, tx: &MixingTransaction) -> Result<()> {
        self.inner.save_transaction(tx).await
    }

    async fn load_transaction(&self, id: &TransactionId) -> Result<Option<MixingTransaction>> {
        self.inner.load_transaction(id).await
    }

    async fn transactions_by_status(
        &self,
        currency: &Currency,
        status: TransactionStatus,
    ) -> Result<Vec<MixingTransaction>> {
        self.inner.transactions_by_status(currency, status).await
    }
}

struct Engine {
    orchestrator: Arc<MixOrchestrator>,
    ledger: Arc<SimulatedChain>,
    chain: Arc<SlowChain>,
    store: Arc<SlowStore>,
    clock: Arc<ManualClock>,
}

fn engine(call_timeout: Duration) -> Engine {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("veil_core=debug")
        .with_test_writer()
        .try_init();
    let mut config = MixerConfig::default();
    config.orchestrator.retry.timeout = call_timeout;
    config.orchestrator.retry.backoff = Duration::from_millis(1);

    let ledger = Arc::new(SimulatedChain::new());
    let chain = Arc::new(SlowChain {
        inner: ledger.clone(),
        stall_ms: AtomicU64::new(0),
        broadcasts: AtomicUsize::new(0),
    });
    let store = Arc::new(SlowStore {
        inner: KvPersistence::new(MemoryStorage::new()),
        stall_ms: AtomicU64::new(0),
    });
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let registry = reference_registry(&config, chain.clone(), store.clone()).unwrap();
    let orchestrator = MixOrchestrator::with_clock(config, &registry, clock.clone()).unwrap();
    Engine {
        orchestrator,
        ledger,
        chain,
        store,
        clock,
    }
}

impl Engine {
    async fn submit(&self, count: usize) -> Vec<MixId> {
        let mut ids = Vec::new();
        for i in 0..count {
            let order = MixOrder::new(
                "BTC",
                BTC,
                vec![PayoutAddress::new(format!("bc1qdest{}", i), 100)],
            )
            .with_delay(Duration::from_secs(60));
            ids.push(self.orchestrator.process(order).await.unwrap());
        }
        ids
    }

    /// Put each deposit on chain, one minute apart.
    async fn credit(&self, ids: &[MixId]) {
        let btc = Currency::new("BTC");
        for id in ids {
            let mix = self.orchestrator.mix(id).await.unwrap();
            self.ledger
                .credit(&btc, mix.deposit_address.as_deref().unwrap(), mix.amount);
            self.clock.advance(Duration::from_secs(61));
        }
    }

    async fn entries(&self) -> Vec<PoolEntry> {
        self.orchestrator
            .pool_manager()
            .entries(&Currency::new("BTC"))
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_stalled_round_broadcast_rolls_back_and_retries() {
    let engine = engine(Duration::from_millis(50));
    let btc = Currency::new("BTC");
    let ids = engine.submit(3).await;
    engine.chain.stall(Duration::from_millis(300));

    engine.credit(&ids[..1]).await;
    engine.orchestrator.confirm_deposit(&ids[0]).await.unwrap();
    engine.credit(&ids[1..2]).await;
    engine.orchestrator.confirm_deposit(&ids[1]).await.unwrap();
    engine.credit(&ids[2..]).await;
    // The third deposit starts a round whose broadcast never answers in time
    assert_eq!(
        engine.orchestrator.confirm_deposit(&ids[2]).await.unwrap(),
        MixStatus::DepositReceived
    );
    assert!(engine.chain.broadcasts.load(Ordering::SeqCst) >= 1);

    let entries = engine.entries().await;
    assert_eq!(entries.len(), 3);
    for entry in &entries {
        assert_eq!(entry.status, EntryStatus::Active);
        assert_eq!(entry.rounds_completed, 0);
        assert!(entry.history.is_empty());
    }
    for id in &ids {
        assert_eq!(
            engine.orchestrator.get_status(id).await,
            Some(MixStatus::DepositReceived)
        );
    }
    let persisted = engine
        .store
        .entries_by_status(&btc, EntryStatus::Mixing)
        .await
        .unwrap();
    assert!(persisted.is_empty());
    let pool = engine
        .orchestrator
        .pool_manager()
        .liquidity_status(&btc)
        .await
        .unwrap();
    assert_eq!((pool.total, pool.reserved), (3 * BTC, 0));

    // Once the node answers again the next sweep runs the round
    engine.chain.stall(Duration::ZERO);
    let report = engine.orchestrator.tick().await;
    assert_eq!(report.rounds, 1);
    for id in &ids {
        assert_eq!(
            engine.orchestrator.get_status(id).await,
            Some(MixStatus::Distributing)
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_status_reads_do_not_wait_for_a_round() {
    let engine = engine(Duration::from_secs(5));
    let ids = engine.submit(3).await;
    engine.credit(&ids).await;
    engine.orchestrator.confirm_deposit(&ids[0]).await.unwrap();
    engine.orchestrator.confirm_deposit(&ids[1]).await.unwrap();
    engine.chain.stall(Duration::from_millis(300));

    let orchestrator = engine.orchestrator.clone();
    let last = ids[2];
    let round = tokio::spawn(async move { orchestrator.confirm_deposit(&last).await });
    while engine.chain.broadcasts.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let started = tokio::time::Instant::now();
    assert_eq!(
        engine.orchestrator.get_status(&ids[0]).await,
        Some(MixStatus::DepositReceived)
    );
    engine.orchestrator.statistics().await;
    assert!(started.elapsed() < Duration::from_millis(100));

    assert_eq!(round.await.unwrap().unwrap(), MixStatus::DepositReceived);
    engine.orchestrator.tick().await;
    for id in &ids {
        assert_eq!(
            engine.orchestrator.get_status(id).await,
            Some(MixStatus::Distributing)
        );
    }
}

#[tokio::test]
async fn test_stalled_entry_write_leaves_no_live_entry() {
    let engine = engine(Duration::from_millis(50));
    let btc = Currency::new("BTC");
    engine.store.stall_ms.store(300, Ordering::SeqCst);

    let order = MixOrder::new("BTC", BTC, vec![PayoutAddress::new("bc1qdest", 100)]);
    let err = engine.orchestrator.process(order).await.unwrap_err();
    assert!(matches!(err, MixerError::Timeout(_)));

    // Each attempt's write landed late and was overwritten as withdrawn
    let live = engine
        .store
        .entries_by_status(&btc, EntryStatus::Active)
        .await
        .unwrap();
    assert!(live.is_empty());
    assert!(!engine
        .store
        .entries_by_status(&btc, EntryStatus::Withdrawn)
        .await
        .unwrap()
        .is_empty());

    assert!(engine.entries().await.is_empty());
    let stats = engine.orchestrator.statistics().await;
    assert_eq!((stats.total_mixes, stats.active_mixes), (0, 0));
    let pool = engine
        .orchestrator
        .pool_manager()
        .liquidity_status(&btc)
        .await
        .unwrap();
    assert_eq!((pool.total, pool.reserved), (0, 0));
}

#[tokio::test]
async fn test_stalled_payout_broadcast_is_rescheduled() {
    let engine = engine(Duration::from_millis(50));
    let btc = Currency::new("BTC");
    let ids = engine.submit(3).await;
    engine.credit(&ids).await;
    for id in &ids {
        engine.orchestrator.confirm_deposit(id).await.unwrap();
    }
    engine.orchestrator.tick().await;
    assert_eq!(engine.orchestrator.scheduler().statistics().scheduled, 3);

    engine.chain.stall(Duration::from_millis(300));
    engine.clock.advance(Duration::from_secs(61));
    let report = engine.orchestrator.tick().await;
    assert_eq!(report.operations_executed, 3);

    let failed = engine
        .store
        .operations_by_status(&btc, OperationStatus::Failed)
        .await
        .unwrap();
    assert_eq!(failed.len(), 3);
    for operation in &failed {
        assert!(operation
            .failure_reason
            .as_deref()
            .unwrap_or_default()
            .contains("timed out"));
    }
    let stats = engine.orchestrator.scheduler().statistics();
    assert_eq!((stats.failed, stats.scheduled), (3, 3));
    for id in &ids {
        assert_eq!(
            engine.orchestrator.get_status(id).await,
            Some(MixStatus::Distributing)
        );
    }

    engine.chain.stall(Duration::ZERO);
    engine.clock.advance(Duration::from_secs(61));
    engine.orchestrator.tick().await;
    for (i, id) in ids.iter().enumerate() {
        assert_eq!(
            engine.orchestrator.get_status(id).await,
            Some(MixStatus::Completed)
        );
        assert_eq!(
            engine.ledger.balance(&btc, &format!("bc1qdest{}", i)),
            99_500_000
        );
    }
}
