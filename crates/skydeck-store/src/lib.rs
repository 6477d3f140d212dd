//! Durable account-record persistence for skydeck.
//!
//! The pool and session manager only ever hold account identifiers; this
//! crate owns every writable copy of token material. It defines the
//! `CredentialStore` contract plus an encrypted file-backed store and an
//! in-memory store.

mod crypto;
mod error;
mod file_store;
mod memory_store;
mod record;

use async_trait::async_trait;
use skydeck_core::AccountId;

pub use crypto::{
    decrypt_credential_secret, encrypt_credential_secret, CredentialStoreEncryptionMode,
};
pub use error::StoreError;
pub use file_store::FileCredentialStore;
pub use memory_store::MemoryCredentialStore;
pub use record::{token_fingerprint, AccountIdentity, AccountRecord, AuthType, SessionTokens};

#[async_trait]
/// Key/value persistence for account records.
///
/// Every failure is reported as a retryable `StoreError`; a failed `put`
/// leaves the previously stored record untouched.
pub trait CredentialStore: Send + Sync {
    async fn get(&self, account_id: &AccountId) -> Result<Option<AccountRecord>, StoreError>;

    async fn put(&self, record: &AccountRecord) -> Result<(), StoreError>;

    async fn delete(&self, account_id: &AccountId) -> Result<(), StoreError>;

    async fn list_all(&self) -> Result<Vec<AccountRecord>, StoreError>;
}
