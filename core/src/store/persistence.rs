// Persistence over a key/value backend
//
// Records are bincode-encoded under `<table>/<id>`. A secondary index key
// `<index>/<currency>/<status>/<id>` with an empty value supports lookups by
// currency and status; saving a record moves its index key when the status
// changes.

use super::backend::StorageBackend;
use crate::collaborators::Persistence;
use crate::error::{MixerError, Result};
use crate::model::{
    Currency, EntryId, EntryStatus, MixId, MixRequest, MixStatus, MixingTransaction, OperationId,
    OperationStatus, PoolEntry, ScheduledOperation, TransactionId, TransactionStatus,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Display;

/// A record stored in one table with a currency/status index
trait Record: Serialize + DeserializeOwned {
    const TABLE: &'static str;
    const INDEX: &'static str;

    fn record_id(&self) -> String;
    fn currency(&self) -> &Currency;
    fn status_label(&self) -> String;
}

impl Record for MixRequest {
    const TABLE: &'static str = "req";
    const INDEX: &'static str = "req_idx";

    fn record_id(&self) -> String {
        self.id.to_string()
    }

    fn currency(&self) -> &Currency {
        &self.currency
    }

    fn status_label(&self) -> String {
        self.status.to_string()
    }
}

impl Record for PoolEntry {
    const TABLE: &'static str = "entry";
    const INDEX: &'static str = "entry_idx";

    fn record_id(&self) -> String {
        self.id.to_string()
    }

    fn currency(&self) -> &Currency {
        &self.currency
    }

    fn status_label(&self) -> String {
        self.status.to_string()
    }
}

impl Record for ScheduledOperation {
    const TABLE: &'static str = "op";
    const INDEX: &'static str = "op_idx";

    fn record_id(&self) -> String {
        self.id.to_string()
    }

    fn currency(&self) -> &Currency {
        &self.currency
    }

    fn status_label(&self) -> String {
        self.status.to_string()
    }
}

impl Record for MixingTransaction {
    const TABLE: &'static str = "tx";
    const INDEX: &'static str = "tx_idx";

    fn record_id(&self) -> String {
        self.id.to_string()
    }

    fn currency(&self) -> &Currency {
        &self.currency
    }

    fn status_label(&self) -> String {
        self.status.to_string()
    }
}

fn codec_error(err: impl Display) -> MixerError {
    MixerError::collaborator("persistence", err)
}

/// Persistence implementation shared by the in-memory and sled backends
pub struct KvPersistence<B: StorageBackend> {
    backend: B,
}

impl<B: StorageBackend> KvPersistence<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn record_key<R: Record>(id: &str) -> Vec<u8> {
        format!("{}/{}", R::TABLE, id).into_bytes()
    }

    fn index_prefix<R: Record>(currency: &Currency, status: &str) -> String {
        format!("{}/{}/{}/", R::INDEX, currency, status)
    }

    fn index_key<R: Record>(record: &R) -> Vec<u8> {
        format!(
            "{}{}",
            Self::index_prefix::<R>(record.currency(), &record.status_label()),
            record.record_id()
        )
        .into_bytes()
    }

    fn save<R: Record>(&self, record: &R) -> Result<()> {
        let key = Self::record_key::<R>(&record.record_id());
        if let Some(previous) = self.backend.get(&key)? {
            let previous: R = bincode::deserialize(&previous).map_err(codec_error)?;
            let stale_index = Self::index_key(&previous);
            if stale_index != Self::index_key(record) {
                self.backend.remove(&stale_index)?;
            }
        }
        let encoded = bincode::serialize(record).map_err(codec_error)?;
        self.backend.put(&key, &encoded)?;
        self.backend.put(&Self::index_key(record), &[])?;
        Ok(())
    }

    fn load<R: Record>(&self, id: &str) -> Result<Option<R>> {
        match self.backend.get(&Self::record_key::<R>(id))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(codec_error)?)),
            None => Ok(None),
        }
    }

    fn by_status<R: Record>(&self, currency: &Currency, status: &str) -> Result<Vec<R>> {
        let prefix = Self::index_prefix::<R>(currency, status);
        let mut records = Vec::new();
        for (key, _) in self.backend.scan_prefix(prefix.as_bytes())? {
            let id = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            if let Some(record) = self.load::<R>(&id)? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl<B: StorageBackend> Persistence for KvPersistence<B> {
    async fn save_request(&self, request: &MixRequest) -> Result<()> {
        self.save(request)
    }

    async fn load_request(&self, id: &MixId) -> Result<Option<MixRequest>> {
        self.load(&id.to_string())
    }

    async fn requests_by_status(
        &self,
        currency: &Currency,
        status: MixStatus,
    ) -> Result<Vec<MixRequest>> {
        self.by_status(currency, &status.to_string())
    }

    async fn save_entry(&self, entry: &PoolEntry) -> Result<()> {
        self.save(entry)
    }

    async fn load_entry(&self, id: &EntryId) -> Result<Option<PoolEntry>> {
        self.load(&id.to_string())
    }

    async fn entries_by_status(
        &self,
        currency: &Currency,
        status: EntryStatus,
    ) -> Result<Vec<PoolEntry>> {
        self.by_status(currency, &status.to_string())
    }

    async fn save_operation(&self, operation: &ScheduledOperation) -> Result<()> {
        self.save(operation)
    }

    async fn load_operation(&self, id: &OperationId) -> Result<Option<ScheduledOperation>> {
        self.load(&id.to_string())
    }

    async fn operations_by_status(
        &self,
        currency: &Currency,
        status: OperationStatus,
    ) -> Result<Vec<ScheduledOperation>> {
        self.by_status(currency, &status.to_string())
    }

    async fn save_transaction(&self, tx: &MixingTransaction) -> Result<()> {
        self.save(tx)
    }

    async fn load_transaction(&self, id: &TransactionId) -> Result<Option<MixingTransaction>> {
        self.load(&id.to_string())
    }

    async fn transactions_by_status(
        &self,
        currency: &Currency,
        status: TransactionStatus,
    ) -> Result<Vec<MixingTransaction>> {
        self.by_status(currency, &status.to_string())
    }
}
