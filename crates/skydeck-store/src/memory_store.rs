use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use skydeck_core::AccountId;

use crate::{AccountRecord, CredentialStore, StoreError};

/// Process-local `CredentialStore`, used by tests and simulations.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    records: Mutex<BTreeMap<AccountId, AccountRecord>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = AccountRecord>) -> Self {
        let records = records
            .into_iter()
            .map(|record| (record.account_id.clone(), record))
            .collect();
        Self {
            records: Mutex::new(records),
        }
    }

    fn records(&self) -> std::sync::MutexGuard<'_, BTreeMap<AccountId, AccountRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, account_id: &AccountId) -> Result<Option<AccountRecord>, StoreError> {
        Ok(self.records().get(account_id).cloned())
    }

    async fn put(&self, record: &AccountRecord) -> Result<(), StoreError> {
        self.records()
            .insert(record.account_id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, account_id: &AccountId) -> Result<(), StoreError> {
        self.records().remove(account_id);
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<AccountRecord>, StoreError> {
        Ok(self.records().values().cloned().collect())
    }
}
