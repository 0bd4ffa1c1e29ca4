// Collaborator seams
//
// The engine never talks to storage, key custody, chains or policy code
// directly. Each dependency is one async trait; a registry collects them and
// refuses to start while one is missing.

use crate::error::{MixerError, Result};
use crate::events::LifecycleEvent;
use crate::model::{
    Amount, Currency, EntryId, EntryStatus, KeyId, MixId, MixOrder, MixRequest, MixStatus,
    MixingTransaction, OperationId, OperationStatus, PoolEntry, ScheduledOperation, TransactionId,
    TransactionStatus,
};
use crate::tx::SignedTransaction;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Verdict of structural order validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub reason: Option<String>,
}

impl ValidationOutcome {
    pub fn accept() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// Risk score in 0..=100 plus the heuristics that contributed to it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub score: u32,
    pub flags: Vec<String>,
}

/// On-chain state of a broadcast transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainTxStatus {
    Unknown,
    Pending,
    Confirmed,
    Failed,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, order: &MixOrder) -> Result<ValidationOutcome>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RiskAssessor: Send + Sync {
    /// Score an order. Returning `MixerError::Security` refuses it.
    async fn analyze_risk(&self, order: &MixOrder) -> Result<RiskAssessment>;

    /// Release delay to use when the caller did not request one.
    async fn generate_optimal_delay(&self) -> Result<Duration>;
}

/// Key custody: raw key material never leaves the implementation.
#[async_trait]
pub trait KeyCustody: Send + Sync {
    async fn generate_key(&self, currency: &Currency) -> Result<KeyId>;
    async fn get_public_key(&self, key: &KeyId) -> Result<Vec<u8>>;
    async fn sign(&self, key: &KeyId, digest: &[u8]) -> Result<Vec<u8>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlockchainClient: Send + Sync {
    async fn generate_address(&self, currency: &Currency, public_key: &[u8]) -> Result<String>;
    async fn get_balance(&self, currency: &Currency, address: &str) -> Result<Amount>;
    /// Hand a signed transaction to the network, returning its hash.
    async fn broadcast_transaction(&self, tx: &SignedTransaction) -> Result<String>;
    async fn get_transaction_status(&self, currency: &Currency, hash: &str)
        -> Result<ChainTxStatus>;
}

/// Durable records keyed by id and by currency + status.
///
/// A read must observe every write that returned before it.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn save_request(&self, request: &MixRequest) -> Result<()>;
    async fn load_request(&self, id: &MixId) -> Result<Option<MixRequest>>;
    async fn requests_by_status(
        &self,
        currency: &Currency,
        status: MixStatus,
    ) -> Result<Vec<MixRequest>>;

    async fn save_entry(&self, entry: &PoolEntry) -> Result<()>;
    async fn load_entry(&self, id: &EntryId) -> Result<Option<PoolEntry>>;
    async fn entries_by_status(
        &self,
        currency: &Currency,
        status: EntryStatus,
    ) -> Result<Vec<PoolEntry>>;

    async fn save_operation(&self, operation: &ScheduledOperation) -> Result<()>;
    async fn load_operation(&self, id: &OperationId) -> Result<Option<ScheduledOperation>>;
    async fn operations_by_status(
        &self,
        currency: &Currency,
        status: OperationStatus,
    ) -> Result<Vec<ScheduledOperation>>;

    async fn save_transaction(&self, tx: &MixingTransaction) -> Result<()>;
    async fn load_transaction(&self, id: &TransactionId) -> Result<Option<MixingTransaction>>;
    async fn transactions_by_status(
        &self,
        currency: &Currency,
        status: TransactionStatus,
    ) -> Result<Vec<MixingTransaction>>;
}

/// Best-effort external event sink. Must not block.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &LifecycleEvent);
}

/// Resolved set of collaborators shared by every component
#[derive(Clone)]
pub struct Collaborators {
    pub validator: Arc<dyn Validator>,
    pub risk: Arc<dyn RiskAssessor>,
    pub custody: Arc<dyn KeyCustody>,
    pub chain: Arc<dyn BlockchainClient>,
    pub persistence: Arc<dyn Persistence>,
    pub events: Arc<dyn EventSink>,
}

/// Collects collaborators before the engine starts
#[derive(Clone, Default)]
pub struct CollaboratorRegistry {
    validator: Option<Arc<dyn Validator>>,
    risk: Option<Arc<dyn RiskAssessor>>,
    custody: Option<Arc<dyn KeyCustody>>,
    chain: Option<Arc<dyn BlockchainClient>>,
    persistence: Option<Arc<dyn Persistence>>,
    events: Option<Arc<dyn EventSink>>,
}

impl CollaboratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_risk_assessor(mut self, risk: Arc<dyn RiskAssessor>) -> Self {
        self.risk = Some(risk);
        self
    }

    pub fn with_key_custody(mut self, custody: Arc<dyn KeyCustody>) -> Self {
        self.custody = Some(custody);
        self
    }

    pub fn with_blockchain(mut self, chain: Arc<dyn BlockchainClient>) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Typed collaborator set, or a configuration error naming the first gap.
    pub fn resolve(&self) -> Result<Collaborators> {
        fn require<T: ?Sized>(slot: &Option<Arc<T>>, name: &str) -> Result<Arc<T>> {
            slot.clone().ok_or_else(|| {
                MixerError::Configuration(format!("missing collaborator: {}", name))
            })
        }

        Ok(Collaborators {
            validator: require(&self.validator, "validator")?,
            risk: require(&self.risk, "risk assessor")?,
            custody: require(&self.custody, "key custody")?,
            chain: require(&self.chain, "blockchain client")?,
            persistence: require(&self.persistence, "persistence")?,
            events: require(&self.events, "event sink")?,
        })
    }
}
