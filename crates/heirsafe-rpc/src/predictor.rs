use alloy_primitives::{Address, B256};
use heirsafe_primitives::DeploymentSalt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::{ChainError, ChainResult};
use crate::reader::ChainReader;

/// Predicts module addresses by asking the factory itself.
///
/// The computation is never reimplemented locally so the answer always agrees
/// bit-for-bit with what the factory would deploy. One predictor belongs to
/// one network context; answers are cached per (factory, account, salt).
pub struct AddressPredictor {
    reader: Arc<dyn ChainReader>,
    cache: Mutex<HashMap<(Address, Address, B256), Address>>,
}

impl std::fmt::Debug for AddressPredictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cached = self.cache.lock().map(|c| c.len()).unwrap_or_default();
        f.debug_struct("AddressPredictor").field("cached", &cached).finish()
    }
}

impl AddressPredictor {
    pub fn new(reader: Arc<dyn ChainReader>) -> Self {
        Self { reader, cache: Mutex::new(HashMap::new()) }
    }

    /// Module address `factory` would deploy for `safe` under `salt`.
    ///
    /// Fails with [`ChainError::FactoryUnreachable`] when the factory has no
    /// code on the active network.
    pub async fn predict(
        &self,
        factory: Address,
        safe: Address,
        salt: &DeploymentSalt,
    ) -> ChainResult<Address> {
        let key = (factory, safe, salt.as_b256());
        if let Some(hit) = self.cached(&key) {
            return Ok(hit);
        }

        if !self.reader.has_code(factory).await? {
            return Err(ChainError::FactoryUnreachable { factory });
        }

        let module = self.reader.predict_module(factory, safe, salt.as_b256()).await?;
        debug!(%factory, %safe, %module, "predicted module address");

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, module);
        }
        Ok(module)
    }

    fn cached(&self, key: &(Address, Address, B256)) -> Option<Address> {
        self.cache.lock().ok()?.get(key).copied()
    }
}
