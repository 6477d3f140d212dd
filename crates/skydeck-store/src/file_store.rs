//! Schema-versioned JSON credential store with optional token encryption.
//!
//! Writes are serialized through a single gate and land through an atomic
//! rename, so a failed `put` never leaves a partially written record behind.

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skydeck_core::{write_text_atomic, AccountId};
use tokio::sync::Mutex;

use crate::{
    decrypt_credential_secret, encrypt_credential_secret, AccountIdentity, AccountRecord,
    AuthType, CredentialStore, CredentialStoreEncryptionMode, SessionTokens, StoreError,
};

const CREDENTIAL_STORE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CredentialStoreFile {
    schema_version: u32,
    encryption: CredentialStoreEncryptionMode,
    #[serde(default)]
    accounts: BTreeMap<String, StoredAccountRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredAccountRecord {
    identity: AccountIdentity,
    access_jwt: String,
    refresh_jwt: String,
    #[serde(default)]
    access_expires_unix_ms: Option<u64>,
    service_endpoint: String,
    auth_type: AuthType,
    is_active: bool,
    created_unix_ms: u64,
    updated_unix_ms: u64,
}

#[derive(Clone)]
struct StoreLocation {
    path: PathBuf,
    encryption: CredentialStoreEncryptionMode,
    key: Option<String>,
}

/// File-backed `CredentialStore`.
pub struct FileCredentialStore {
    location: Arc<StoreLocation>,
    write_gate: Mutex<()>,
}

impl fmt::Debug for FileCredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileCredentialStore")
            .field("path", &self.location.path)
            .field("encryption", &self.location.encryption)
            .field("has_key", &self.location.key.is_some())
            .finish()
    }
}

impl FileCredentialStore {
    pub fn new(
        path: impl Into<PathBuf>,
        encryption: CredentialStoreEncryptionMode,
        key: Option<String>,
    ) -> Self {
        Self {
            location: Arc::new(StoreLocation {
                path: path.into(),
                encryption,
                key: key.filter(|value| !value.trim().is_empty()),
            }),
            write_gate: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.location.path
    }

    async fn run_blocking<T, F>(&self, operation: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&StoreLocation) -> Result<T, StoreError> + Send + 'static,
    {
        let location = Arc::clone(&self.location);
        tokio::task::spawn_blocking(move || operation(&location))
            .await
            .map_err(|error| StoreError::Unavailable(format!("store task failed: {error}")))?
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get(&self, account_id: &AccountId) -> Result<Option<AccountRecord>, StoreError> {
        let account_id = account_id.clone();
        self.run_blocking(move |location| {
            let mut accounts = load_accounts(location)?;
            Ok(accounts.remove(&account_id))
        })
        .await
    }

    async fn put(&self, record: &AccountRecord) -> Result<(), StoreError> {
        let _gate = self.write_gate.lock().await;
        let record = record.clone();
        tracing::debug!(
            credential_store = %self.location.path.display(),
            account_id = %record.account_id,
            token_fingerprint = %record.token_fingerprint(),
            "persisting account record"
        );
        self.run_blocking(move |location| {
            let mut accounts = load_accounts(location)?;
            accounts.insert(record.account_id.clone(), record);
            save_accounts(location, &accounts)
        })
        .await
    }

    async fn delete(&self, account_id: &AccountId) -> Result<(), StoreError> {
        let _gate = self.write_gate.lock().await;
        let account_id = account_id.clone();
        self.run_blocking(move |location| {
            let mut accounts = load_accounts(location)?;
            if accounts.remove(&account_id).is_none() {
                return Ok(());
            }
            save_accounts(location, &accounts)
        })
        .await
    }

    async fn list_all(&self) -> Result<Vec<AccountRecord>, StoreError> {
        self.run_blocking(|location| Ok(load_accounts(location)?.into_values().collect()))
            .await
    }
}

fn load_accounts(location: &StoreLocation) -> Result<BTreeMap<AccountId, AccountRecord>, StoreError> {
    if !location.path.exists() {
        return Ok(BTreeMap::new());
    }
    let raw = std::fs::read_to_string(&location.path).map_err(|error| {
        StoreError::Io(format!(
            "failed to read credential store {}: {error}",
            location.path.display()
        ))
    })?;
    let parsed = serde_json::from_str::<CredentialStoreFile>(&raw).map_err(|error| {
        StoreError::Malformed(format!(
            "failed to parse credential store {}: {error}",
            location.path.display()
        ))
    })?;
    if parsed.schema_version != CREDENTIAL_STORE_SCHEMA_VERSION {
        return Err(StoreError::UnsupportedSchema {
            found: parsed.schema_version,
            expected: CREDENTIAL_STORE_SCHEMA_VERSION,
        });
    }

    let key = location.key.as_deref();
    let mut accounts = BTreeMap::new();
    for (account_id, stored) in parsed.accounts {
        let access_jwt = decrypt_credential_secret(&stored.access_jwt, parsed.encryption, key)
            .map_err(|error| {
                StoreError::Crypto(format!(
                    "account '{account_id}' access token is invalid or corrupted: {error}"
                ))
            })?;
        let refresh_jwt = decrypt_credential_secret(&stored.refresh_jwt, parsed.encryption, key)
            .map_err(|error| {
                StoreError::Crypto(format!(
                    "account '{account_id}' refresh token is invalid or corrupted: {error}"
                ))
            })?;
        let account_id = AccountId::new(account_id);
        accounts.insert(
            account_id.clone(),
            AccountRecord {
                account_id,
                identity: stored.identity,
                session: SessionTokens {
                    access_jwt,
                    refresh_jwt,
                    access_expires_unix_ms: stored.access_expires_unix_ms,
                },
                service_endpoint: stored.service_endpoint,
                auth_type: stored.auth_type,
                is_active: stored.is_active,
                created_unix_ms: stored.created_unix_ms,
                updated_unix_ms: stored.updated_unix_ms,
            },
        );
    }
    Ok(accounts)
}

fn save_accounts(
    location: &StoreLocation,
    accounts: &BTreeMap<AccountId, AccountRecord>,
) -> Result<(), StoreError> {
    let key = location.key.as_deref();
    let mut stored_accounts = BTreeMap::new();
    for (account_id, record) in accounts {
        let access_jwt =
            encrypt_credential_secret(&record.session.access_jwt, location.encryption, key)?;
        let refresh_jwt =
            encrypt_credential_secret(&record.session.refresh_jwt, location.encryption, key)?;
        stored_accounts.insert(
            account_id.to_string(),
            StoredAccountRecord {
                identity: record.identity.clone(),
                access_jwt,
                refresh_jwt,
                access_expires_unix_ms: record.session.access_expires_unix_ms,
                service_endpoint: record.service_endpoint.clone(),
                auth_type: record.auth_type,
                is_active: record.is_active,
                created_unix_ms: record.created_unix_ms,
                updated_unix_ms: record.updated_unix_ms,
            },
        );
    }

    let payload = CredentialStoreFile {
        schema_version: CREDENTIAL_STORE_SCHEMA_VERSION,
        encryption: location.encryption,
        accounts: stored_accounts,
    };
    let mut encoded = serde_json::to_string_pretty(&payload)
        .map_err(|error| StoreError::Malformed(format!("failed to encode store: {error}")))?;
    encoded.push('\n');
    write_text_atomic(&location.path, &encoded).map_err(|error| StoreError::Io(format!("{error:#}")))
}
