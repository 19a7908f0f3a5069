use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Reference record of a retail store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreRecord {
    pub store_name: String,
    pub area_code: String,
}

/// Immutable store id → record mapping, shared read-only by all workers.
#[derive(Debug, Clone, Default)]
pub struct ReferenceDataSet {
    stores: HashMap<String, StoreRecord>,
}

impl ReferenceDataSet {
    pub fn new(stores: HashMap<String, StoreRecord>) -> Self {
        Self { stores }
    }

    /// Look up a store. `None` is an expected outcome, not an error.
    pub fn get(&self, store_id: &str) -> Option<&StoreRecord> {
        self.stores.get(store_id)
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

impl FromIterator<(String, StoreRecord)> for ReferenceDataSet {
    fn from_iter<I: IntoIterator<Item = (String, StoreRecord)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
