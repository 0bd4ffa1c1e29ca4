// Chain-agnostic transactions built by the pool manager and scheduler
//
// The digest is SHA-256 over the bincode encoding of the unsigned body. Key
// custody signs that digest once per input.

use crate::collaborators::{BlockchainClient, ChainTxStatus, KeyCustody};
use crate::error::{MixerError, Result};
use crate::model::{Amount, Currency, KeyId, OperationId, OperationKind, SessionId};
use crate::util::retry::bounded;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub address: String,
    pub amount: Amount,
    pub key_id: KeyId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: String,
    pub amount: Amount,
}

/// What a transaction is for, bound into its digest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxPurpose {
    MixingRound(SessionId),
    Release(OperationId, OperationKind),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTransaction {
    pub currency: Currency,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub purpose: TxPurpose,
}

impl UnsignedTransaction {
    pub fn input_total(&self) -> Amount {
        self.inputs.iter().map(|i| i.amount).sum()
    }

    pub fn output_total(&self) -> Amount {
        self.outputs.iter().map(|o| o.amount).sum()
    }

    /// Reject empty, zero-valued or unbalanced transactions.
    pub fn check_balanced(&self) -> Result<()> {
        if self.inputs.is_empty() || self.outputs.is_empty() {
            return Err(MixerError::Validation(
                "transaction needs at least one input and one output".to_string(),
            ));
        }
        if self.inputs.iter().any(|i| i.amount == 0) || self.outputs.iter().any(|o| o.amount == 0)
        {
            return Err(MixerError::Validation(
                "transaction amounts must be positive".to_string(),
            ));
        }
        if self.input_total() != self.output_total() {
            return Err(MixerError::Validation(format!(
                "transaction inputs {} do not match outputs {}",
                self.input_total(),
                self.output_total()
            )));
        }
        Ok(())
    }

    pub fn digest(&self) -> Result<[u8; 32]> {
        let encoded =
            bincode::serialize(self).map_err(|e| MixerError::collaborator("codec", e))?;
        Ok(Sha256::digest(&encoded).into())
    }
}

/// Transaction with one signature per input, in input order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub body: UnsignedTransaction,
    pub signatures: Vec<Vec<u8>>,
}

impl SignedTransaction {
    pub fn digest_hex(&self) -> Result<String> {
        Ok(hex::encode(self.body.digest()?))
    }
}

/// Sign every input through key custody.
pub async fn sign_transaction(
    custody: &dyn KeyCustody,
    body: UnsignedTransaction,
) -> Result<SignedTransaction> {
    body.check_balanced()?;
    let digest = body.digest()?;
    let mut signatures = Vec::with_capacity(body.inputs.len());
    for input in &body.inputs {
        signatures.push(custody.sign(&input.key_id, &digest).await?);
    }
    Ok(SignedTransaction { body, signatures })
}

/// Sign and broadcast with every collaborator call bounded by `limit`.
///
/// A broadcast that timed out is looked up by its digest: a node that already
/// holds the transaction counts as sent, so callers never roll back funds the
/// chain has moved.
pub async fn sign_and_broadcast(
    custody: &dyn KeyCustody,
    chain: &dyn BlockchainClient,
    body: UnsignedTransaction,
    limit: Duration,
) -> Result<String> {
    let currency = body.currency.clone();
    let signed = bounded(limit, "key custody", sign_transaction(custody, body)).await?;
    match bounded(limit, "blockchain broadcast", chain.broadcast_transaction(&signed)).await {
        Err(MixerError::Timeout(label)) => {
            let hash = signed.digest_hex()?;
            let status = bounded(limit, "blockchain status", chain.get_transaction_status(&currency, &hash))
                .await
                .unwrap_or(ChainTxStatus::Unknown);
            match status {
                ChainTxStatus::Pending | ChainTxStatus::Confirmed => {
                    warn!("{} broadcast {} timed out but reached the node", currency, hash);
                    Ok(hash)
                }
                ChainTxStatus::Unknown | ChainTxStatus::Failed => Err(MixerError::Timeout(label)),
            }
        }
        outcome => outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{SimulatedChain, SoftwareKeyCustody};

    fn body(key: KeyId) -> UnsignedTransaction {
        UnsignedTransaction {
            currency: Currency::new("BTC"),
            inputs: vec![TxInput {
                address: "btc1a".into(),
                amount: 500,
                key_id: key,
            }],
            outputs: vec![
                TxOutput {
                    address: "btc1b".into(),
                    amount: 300,
                },
                TxOutput {
                    address: "btc1c".into(),
                    amount: 200,
                },
            ],
            purpose: TxPurpose::MixingRound(SessionId::new()),
        }
    }

    #[test]
    fn test_digest_is_deterministic_and_purpose_bound() {
        let tx = body(KeyId("k".into()));
        assert_eq!(tx.digest().unwrap(), tx.digest().unwrap());
        let mut other = tx.clone();
        other.purpose = TxPurpose::MixingRound(SessionId::new());
        assert_ne!(tx.digest().unwrap(), other.digest().unwrap());
    }

    #[test]
    fn test_unbalanced_transaction_rejected() {
        let mut tx = body(KeyId("k".into()));
        tx.outputs[0].amount = 301;
        assert!(matches!(
            tx.check_balanced(),
            Err(MixerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_sign_transaction_one_signature_per_input() {
        let custody = SoftwareKeyCustody::new();
        let key = custody.generate_key(&Currency::new("BTC")).await.unwrap();
        let signed = sign_transaction(&custody, body(key)).await.unwrap();
        assert_eq!(signed.signatures.len(), 1);
        assert_eq!(signed.signatures[0].len(), 64);
        assert_eq!(signed.digest_hex().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_sign_with_unknown_key_fails() {
        let custody = SoftwareKeyCustody::new();
        let result = sign_transaction(&custody, body(KeyId("missing".into()))).await;
        assert!(matches!(result, Err(MixerError::Collaborator { .. })));
    }

    /// Node that stalls on broadcast, optionally after accepting the transaction.
    struct StallingNode {
        inner: SimulatedChain,
        accept_first: bool,
    }

    #[async_trait::async_trait]
    impl BlockchainClient for StallingNode {
        async fn generate_address(&self, currency: &Currency, public_key: &[u8]) -> Result<String> {
            self.inner.generate_address(currency, public_key).await
        }
        async fn get_balance(&self, currency: &Currency, address: &str) -> Result<Amount> {
            self.inner.get_balance(currency, address).await
        }
        async fn broadcast_transaction(&self, tx: &SignedTransaction) -> Result<String> {
            if self.accept_first {
                self.inner.broadcast_transaction(tx).await?;
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.inner.broadcast_transaction(tx).await
        }
        async fn get_transaction_status(&self, currency: &Currency, hash: &str) -> Result<ChainTxStatus> {
            self.inner.get_transaction_status(currency, hash).await
        }
    }

    async fn funded_body(custody: &SoftwareKeyCustody, node: &StallingNode) -> UnsignedTransaction {
        let btc = Currency::new("BTC");
        let key = custody.generate_key(&btc).await.unwrap();
        let public_key = custody.get_public_key(&key).await.unwrap();
        let address = node.generate_address(&btc, &public_key).await.unwrap();
        node.inner.credit(&btc, &address, 500);
        let mut tx = body(key);
        tx.inputs[0].address = address;
        tx
    }

    #[tokio::test]
    async fn test_timed_out_broadcast_that_landed_counts_as_sent() {
        let custody = SoftwareKeyCustody::new();
        let node = StallingNode {
            inner: SimulatedChain::new(),
            accept_first: true,
        };
        let tx = funded_body(&custody, &node).await;
        let expected = hex::encode(tx.digest().unwrap());
        let hash = sign_and_broadcast(&custody, &node, tx, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(hash, expected);
        assert_eq!(node.inner.balance(&Currency::new("BTC"), "btc1b"), 300);
    }

    #[tokio::test]
    async fn test_timed_out_broadcast_never_seen_is_a_timeout() {
        let custody = SoftwareKeyCustody::new();
        let node = StallingNode {
            inner: SimulatedChain::new(),
            accept_first: false,
        };
        let tx = funded_body(&custody, &node).await;
        let result = sign_and_broadcast(&custody, &node, tx, Duration::from_millis(50)).await;
        assert_eq!(result, Err(MixerError::Timeout("blockchain broadcast".into())));
        assert_eq!(node.inner.balance(&Currency::new("BTC"), "btc1b"), 0);
    }
}
