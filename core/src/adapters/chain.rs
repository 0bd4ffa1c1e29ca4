// In-memory ledger standing in for blockchain RPC
//
// Addresses are derived from the owning public key, so a broadcast can check
// every input signature against the key the address was generated for.

use crate::collaborators::{BlockchainClient, ChainTxStatus};
use crate::error::{MixerError, Result};
use crate::model::{Amount, Currency};
use crate::tx::SignedTransaction;
use async_trait::async_trait;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

fn chain_error(message: impl std::fmt::Display) -> MixerError {
    MixerError::collaborator("blockchain", message)
}

#[derive(Default)]
struct Ledger {
    balances: HashMap<(Currency, String), Amount>,
    owners: HashMap<String, [u8; 32]>,
    transactions: HashMap<String, ChainTxStatus>,
}

#[derive(Default)]
pub struct SimulatedChain {
    ledger: Mutex<Ledger>,
    fail_broadcasts: AtomicBool,
}

impl SimulatedChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pay funds into an address from outside the system (a user deposit).
    pub fn credit(&self, currency: &Currency, address: &str, amount: Amount) {
        let mut ledger = self.ledger.lock();
        *ledger
            .balances
            .entry((currency.clone(), address.to_string()))
            .or_default() += amount;
    }

    pub fn balance(&self, currency: &Currency, address: &str) -> Amount {
        self.ledger
            .lock()
            .balances
            .get(&(currency.clone(), address.to_string()))
            .copied()
            .unwrap_or_default()
    }

    /// Make every following broadcast fail until switched off again.
    pub fn set_fail_broadcasts(&self, fail: bool) {
        self.fail_broadcasts.store(fail, Ordering::SeqCst);
    }

    pub fn transaction_count(&self) -> usize {
        self.ledger.lock().transactions.len()
    }

    fn verify_signatures(ledger: &Ledger, tx: &SignedTransaction, digest: &[u8; 32]) -> Result<()> {
        if tx.signatures.len() != tx.body.inputs.len() {
            return Err(chain_error("signature count does not match inputs"));
        }
        for (input, signature) in tx.body.inputs.iter().zip(&tx.signatures) {
            let owner = ledger
                .owners
                .get(&input.address)
                .ok_or_else(|| chain_error(format!("unknown input address {}", input.address)))?;
            let key = VerifyingKey::from_bytes(owner).map_err(chain_error)?;
            let sig = Signature::from_slice(signature).map_err(chain_error)?;
            key.verify(digest, &sig)
                .map_err(|_| chain_error(format!("bad signature for {}", input.address)))?;
        }
        Ok(())
    }
}

#[async_trait]
impl BlockchainClient for SimulatedChain {
    async fn generate_address(&self, currency: &Currency, public_key: &[u8]) -> Result<String> {
        let owner: [u8; 32] = public_key
            .try_into()
            .map_err(|_| chain_error("public key must be 32 bytes"))?;
        let hash = blake3::hash(&owner);
        let address = format!(
            "{}1{}",
            currency.as_str().to_ascii_lowercase(),
            &hash.to_hex()[..40]
        );
        self.ledger.lock().owners.insert(address.clone(), owner);
        Ok(address)
    }

    async fn get_balance(&self, currency: &Currency, address: &str) -> Result<Amount> {
        Ok(self.balance(currency, address))
    }

    async fn broadcast_transaction(&self, tx: &SignedTransaction) -> Result<String> {
        if self.fail_broadcasts.load(Ordering::SeqCst) {
            return Err(chain_error("broadcast rejected by node"));
        }
        tx.body.check_balanced()?;
        let digest = tx.body.digest()?;
        let hash = hex::encode(digest);
        let currency = tx.body.currency.clone();

        let mut ledger = self.ledger.lock();
        if ledger.transactions.contains_key(&hash) {
            return Err(chain_error(format!("transaction {} already broadcast", hash)));
        }
        Self::verify_signatures(&ledger, tx, &digest)?;

        let mut spend: HashMap<&str, Amount> = HashMap::new();
        for input in &tx.body.inputs {
            *spend.entry(input.address.as_str()).or_default() += input.amount;
        }
        for (address, amount) in &spend {
            let held = ledger
                .balances
                .get(&(currency.clone(), address.to_string()))
                .copied()
                .unwrap_or_default();
            if held < *amount {
                return Err(chain_error(format!(
                    "insufficient balance at {}: {} < {}",
                    address, held, amount
                )));
            }
        }
        for (address, amount) in spend {
            if let Some(balance) = ledger
                .balances
                .get_mut(&(currency.clone(), address.to_string()))
            {
                *balance -= amount;
            }
        }
        for output in &tx.body.outputs {
            *ledger
                .balances
                .entry((currency.clone(), output.address.clone()))
                .or_default() += output.amount;
        }
        ledger
            .transactions
            .insert(hash.clone(), ChainTxStatus::Confirmed);
        debug!(
            "simulated {} broadcast {} ({} inputs, {} outputs)",
            currency,
            &hash[..16],
            tx.body.inputs.len(),
            tx.body.outputs.len()
        );
        Ok(hash)
    }

    async fn get_transaction_status(
        &self,
        _currency: &Currency,
        hash: &str,
    ) -> Result<ChainTxStatus> {
        Ok(self
            .ledger
            .lock()
            .transactions
            .get(hash)
            .copied()
            .unwrap_or(ChainTxStatus::Unknown))
    }
}
