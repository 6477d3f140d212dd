//! Token-at-rest encryption for the file-backed credential store.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, Payload},
    Aes256Gcm,
};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::StoreError;

const ENCRYPTED_V2_PREFIX: &str = "enc:v2:";
const AES_GCM_NONCE_BYTES: usize = 12;
const AES_GCM_AAD: &[u8] = b"skydeck-credential-store-v2";
const MACHINE_KEY_CONTEXT: &str = "skydeck-credential-store-machine-key-v1";
const MACHINE_ID_CANDIDATE_PATHS: [&str; 2] = ["/etc/machine-id", "/var/lib/dbus/machine-id"];
const MIN_STORE_KEY_CHARS: usize = 8;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `CredentialStoreEncryptionMode` values.
pub enum CredentialStoreEncryptionMode {
    None,
    Keyed,
}

fn derive_key_material(key: Option<&str>) -> Result<[u8; 32], StoreError> {
    let key_seed = match key.map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) => {
            if value.len() < MIN_STORE_KEY_CHARS {
                return Err(StoreError::Crypto(format!(
                    "credential store key must be at least {MIN_STORE_KEY_CHARS} characters"
                )));
            }
            value.to_string()
        }
        None => machine_derived_key_seed(),
    };
    let digest = Sha256::digest(key_seed.as_bytes());
    let mut material = [0u8; 32];
    material.copy_from_slice(&digest);
    Ok(material)
}

fn machine_derived_key_seed() -> String {
    let mut segments = vec![
        MACHINE_KEY_CONTEXT.to_string(),
        format!("os={}", std::env::consts::OS),
        format!("arch={}", std::env::consts::ARCH),
    ];
    for variable in ["HOSTNAME", "COMPUTERNAME", "USER", "USERNAME", "HOME"] {
        if let Ok(value) = std::env::var(variable) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                segments.push(format!("{variable}={trimmed}"));
            }
        }
    }
    let machine_id = MACHINE_ID_CANDIDATE_PATHS.iter().find_map(|path| {
        std::fs::read_to_string(path)
            .ok()
            .map(|raw| raw.trim().to_string())
            .filter(|value| !value.is_empty())
    });
    if let Some(machine_id) = machine_id {
        segments.push(format!("machine_id={machine_id}"));
    }
    segments.join("|")
}

pub fn encrypt_credential_secret(
    secret: &str,
    mode: CredentialStoreEncryptionMode,
    key: Option<&str>,
) -> Result<String, StoreError> {
    if secret.trim().is_empty() {
        return Err(StoreError::Crypto(
            "credential secret must not be empty".to_string(),
        ));
    }
    match mode {
        CredentialStoreEncryptionMode::None => Ok(secret.to_string()),
        CredentialStoreEncryptionMode::Keyed => {
            let cipher = Aes256Gcm::new_from_slice(&derive_key_material(key)?)
                .map_err(|_| StoreError::Crypto("key material has invalid length".to_string()))?;
            let mut nonce = [0u8; AES_GCM_NONCE_BYTES];
            use aes_gcm::aead::rand_core::RngCore as _;
            OsRng.fill_bytes(&mut nonce);
            let ciphertext = cipher
                .encrypt(
                    (&nonce).into(),
                    Payload {
                        msg: secret.as_bytes(),
                        aad: AES_GCM_AAD,
                    },
                )
                .map_err(|_| StoreError::Crypto("payload encryption failed".to_string()))?;
            let mut payload = Vec::with_capacity(AES_GCM_NONCE_BYTES + ciphertext.len());
            payload.extend_from_slice(&nonce);
            payload.extend_from_slice(&ciphertext);
            Ok(format!(
                "{ENCRYPTED_V2_PREFIX}{}",
                BASE64_STANDARD.encode(payload)
            ))
        }
    }
}

pub fn decrypt_credential_secret(
    encoded: &str,
    mode: CredentialStoreEncryptionMode,
    key: Option<&str>,
) -> Result<String, StoreError> {
    match mode {
        CredentialStoreEncryptionMode::None => {
            if encoded.trim().is_empty() {
                return Err(StoreError::Crypto(
                    "credential secret must not be empty".to_string(),
                ));
            }
            Ok(encoded.to_string())
        }
        CredentialStoreEncryptionMode::Keyed => {
            let payload = encoded.strip_prefix(ENCRYPTED_V2_PREFIX).ok_or_else(|| {
                StoreError::Crypto("credential payload prefix is invalid".to_string())
            })?;
            let cipher = Aes256Gcm::new_from_slice(&derive_key_material(key)?)
                .map_err(|_| StoreError::Crypto("key material has invalid length".to_string()))?;
            let raw = BASE64_STANDARD
                .decode(payload)
                .map_err(|_| StoreError::Crypto("payload encoding is invalid".to_string()))?;
            if raw.len() <= AES_GCM_NONCE_BYTES {
                return Err(StoreError::Crypto("payload is truncated".to_string()));
            }
            let (nonce, ciphertext) = raw.split_at(AES_GCM_NONCE_BYTES);
            let plaintext = cipher
                .decrypt(
                    nonce.into(),
                    Payload {
                        msg: ciphertext,
                        aad: AES_GCM_AAD,
                    },
                )
                .map_err(|_| StoreError::Crypto("payload integrity check failed".to_string()))?;
            String::from_utf8(plaintext)
                .map_err(|_| StoreError::Crypto("payload is not valid UTF-8".to_string()))
        }
    }
}
