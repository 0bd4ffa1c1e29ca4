// Rotating address set for one currency
//
// A claimed address belongs to exactly one pool entry until released.
// Intermediate routing hops are drawn from the least-used addresses without
// claiming them. Retired addresses are never handed out again.

use crate::model::KeyId;
use parking_lot::Mutex;

#[derive(Debug, Clone)]
struct RotatingAddress {
    address: String,
    key_id: KeyId,
    claimed: bool,
    retired: bool,
    uses: u64,
}

#[derive(Debug, Default)]
pub struct AddressRotation {
    addresses: Mutex<Vec<RotatingAddress>>,
}

impl AddressRotation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the least-used free address, if any.
    pub fn claim(&self) -> Option<(String, KeyId)> {
        let mut addresses = self.addresses.lock();
        let slot = addresses
            .iter_mut()
            .filter(|a| !a.claimed && !a.retired)
            .min_by_key(|a| a.uses)?;
        slot.claimed = true;
        slot.uses += 1;
        Some((slot.address.clone(), slot.key_id.clone()))
    }

    /// Register a freshly minted address, already claimed by the caller.
    pub fn insert_claimed(&self, address: String, key_id: KeyId) {
        self.upsert(address, key_id, true);
    }

    /// Register an address free for claiming.
    pub fn insert_free(&self, address: String, key_id: KeyId) {
        self.upsert(address, key_id, false);
    }

    fn upsert(&self, address: String, key_id: KeyId, claimed: bool) {
        let mut addresses = self.addresses.lock();
        if let Some(existing) = addresses.iter_mut().find(|a| a.address == address) {
            existing.claimed = claimed;
            existing.key_id = key_id;
            return;
        }
        addresses.push(RotatingAddress {
            address,
            key_id,
            claimed,
            retired: false,
            uses: u64::from(claimed),
        });
    }

    pub fn release(&self, address: &str) {
        if let Some(slot) = self
            .addresses
            .lock()
            .iter_mut()
            .find(|a| a.address == address)
        {
            slot.claimed = false;
        }
    }

    pub fn retire(&self, address: &str) {
        if let Some(slot) = self
            .addresses
            .lock()
            .iter_mut()
            .find(|a| a.address == address)
        {
            slot.claimed = false;
            slot.retired = true;
        }
    }

    /// Up to `count` distinct least-used addresses, skipping `exclude`.
    pub fn least_used(&self, count: usize, exclude: &[String]) -> Vec<String> {
        let mut addresses = self.addresses.lock();
        let mut pool: Vec<&mut RotatingAddress> = addresses
            .iter_mut()
            .filter(|a| !a.retired && !exclude.contains(&a.address))
            .collect();
        pool.sort_by_key(|a| a.uses);
        pool.into_iter()
            .take(count)
            .map(|a| {
                a.uses += 1;
                a.address.clone()
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.addresses.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn free_count(&self) -> usize {
        self.addresses
            .lock()
            .iter()
            .filter(|a| !a.claimed && !a.retired)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn key(n: usize) -> KeyId {
        KeyId(format!("k{}", n))
    }

    #[test]
    fn test_claim_is_exclusive_until_release() {
        let rotation = AddressRotation::new();
        rotation.insert_free("a".into(), key(1));
        let (address, _) = rotation.claim().unwrap();
        assert_eq!(address, "a");
        assert!(rotation.claim().is_none());
        rotation.release("a");
        assert_eq!(rotation.claim().map(|(a, _)| a), Some("a".to_string()));
    }

    #[test]
    fn test_retired_addresses_not_reused() {
        let rotation = AddressRotation::new();
        rotation.insert_claimed("a".into(), key(1));
        rotation.retire("a");
        assert!(rotation.claim().is_none());
        assert!(rotation.least_used(1, &[]).is_empty());
        assert_eq!(rotation.len(), 1);
    }

    #[test]
    fn test_least_used_balances_hops() {
        let rotation = AddressRotation::new();
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            rotation.insert_free(name.to_string(), key(i));
        }
        let first = rotation.least_used(2, &["c".to_string()]);
        assert_eq!(first.len(), 2);
        assert!(!first.contains(&"c".to_string()));
        let second = rotation.least_used(1, &[]);
        assert_eq!(second, vec!["c".to_string()]);
    }

    #[test]
    fn test_concurrent_claims_never_share() {
        let rotation = Arc::new(AddressRotation::new());
        for i in 0..32 {
            rotation.insert_free(format!("addr{}", i), key(i));
        }
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let rotation = rotation.clone();
                std::thread::spawn(move || {
                    (0..4).filter_map(|_| rotation.claim()).map(|(a, _)| a).collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for address in handle.join().unwrap() {
                assert!(seen.insert(address));
            }
        }
        assert_eq!(seen.len(), 32);
        assert_eq!(rotation.free_count(), 0);
    }
}
