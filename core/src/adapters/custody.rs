// In-process key custody
//
// Ed25519 keys generated from OS randomness and held in memory. Only public
// keys and signatures leave this module.

use crate::collaborators::KeyCustody;
use crate::error::{MixerError, Result};
use crate::model::{Currency, KeyId};
use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;
use zeroize::Zeroize;

#[derive(Default)]
pub struct SoftwareKeyCustody {
    keys: RwLock<HashMap<KeyId, SigningKey>>,
}

impl SoftwareKeyCustody {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_count(&self) -> usize {
        self.keys.read().len()
    }

    fn unknown(key: &KeyId) -> MixerError {
        MixerError::collaborator("key custody", format!("unknown key {}", key))
    }
}

#[async_trait]
impl KeyCustody for SoftwareKeyCustody {
    async fn generate_key(&self, currency: &Currency) -> Result<KeyId> {
        use rand::RngCore;
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        let signing_key = SigningKey::from_bytes(&seed);
        seed.zeroize();

        let key_id = KeyId(format!(
            "{}-{}",
            currency.as_str().to_ascii_lowercase(),
            Uuid::new_v4()
        ));
        self.keys.write().insert(key_id.clone(), signing_key);
        Ok(key_id)
    }

    async fn get_public_key(&self, key: &KeyId) -> Result<Vec<u8>> {
        self.keys
            .read()
            .get(key)
            .map(|k| k.verifying_key().to_bytes().to_vec())
            .ok_or_else(|| Self::unknown(key))
    }

    async fn sign(&self, key: &KeyId, digest: &[u8]) -> Result<Vec<u8>> {
        let keys = self.keys.read();
        let signing_key = keys.get(key).ok_or_else(|| Self::unknown(key))?;
        Ok(signing_key.sign(digest).to_bytes().to_vec())
    }
}
