use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
/// Enumerates supported `StoreError` values.
pub enum StoreError {
    #[error("credential store io failure: {0}")]
    Io(String),
    #[error("credential store is malformed: {0}")]
    Malformed(String),
    #[error("unsupported credential store schema_version {found} (expected {expected})")]
    UnsupportedSchema { found: u32, expected: u32 },
    #[error("credential store crypto failure: {0}")]
    Crypto(String),
    #[error("credential store is unavailable: {0}")]
    Unavailable(String),
}
