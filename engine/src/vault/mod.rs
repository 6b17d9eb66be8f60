//! Credential vault.
//!
//! Seals SSH and middleware credentials with AES-256-GCM. A handle is the
//! versioned base64 of `nonce || ciphertext`; it is the only form that
//! leaves this module or reaches storage.

pub mod secret;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::errors::EngineError;
pub use secret::SshSecret;
use secret::SealedSecret;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const HANDLE_PREFIX: &str = "v1:";

/// Opaque reference to a sealed credential
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialHandle(String);

impl CredentialHandle {
    pub fn new(sealed: impl Into<String>) -> Self {
        Self(sealed.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short digest that identifies the handle in logs without revealing it
    pub fn fingerprint(&self) -> String {
        let digest = crate::utils::sha256_hash(self.0.as_bytes());
        digest[..12].to_string()
    }
}

impl std::fmt::Debug for CredentialHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CredentialHandle({})", self.fingerprint())
    }
}

pub struct CredentialVault {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl CredentialVault {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    /// Derive the vault key as SHA-256 of a master secret
    pub fn from_master_secret(master: &str) -> Result<Self, EngineError> {
        if master.trim().is_empty() {
            return Err(EngineError::ConfigError(
                "vault master secret is empty".to_string(),
            ));
        }
        let digest = Sha256::digest(master.as_bytes());
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&digest);
        Ok(Self::new(key))
    }

    /// Read the master secret from an environment variable
    pub fn from_env(var: &str) -> Result<Self, EngineError> {
        let master = Zeroizing::new(std::env::var(var).map_err(|_| {
            EngineError::ConfigError(format!("environment variable {} is not set", var))
        })?);
        Self::from_master_secret(&master)
    }

    /// A fresh random master secret, base64 encoded
    pub fn generate_master_secret() -> String {
        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        rand::rng().fill_bytes(&mut bytes[..]);
        STANDARD.encode(&bytes[..])
    }

    pub fn store(&self, secret: &SshSecret) -> Result<CredentialHandle, EngineError> {
        let sealed = secret.to_sealed();
        let plaintext = Zeroizing::new(serde_json::to_vec(&sealed)?);
        self.seal(&plaintext)
    }

    pub fn retrieve(&self, handle: &CredentialHandle) -> Result<SshSecret, EngineError> {
        let plaintext = self.open(handle)?;
        let sealed: SealedSecret = serde_json::from_slice(&plaintext)
            .map_err(|_| EngineError::VaultError("credential payload is malformed".to_string()))?;
        Ok(SshSecret::from_sealed(&sealed))
    }

    /// Seal a single text secret such as a database password
    pub fn seal_text(&self, text: &str) -> Result<CredentialHandle, EngineError> {
        self.seal(text.as_bytes())
    }

    pub fn open_text(&self, handle: &CredentialHandle) -> Result<SecretString, EngineError> {
        let plaintext = self.open(handle)?;
        let text = std::str::from_utf8(&plaintext)
            .map_err(|_| EngineError::VaultError("sealed text is not UTF-8".to_string()))?;
        Ok(SecretString::from(text.to_string()))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key[..]))
    }

    fn seal(&self, plaintext: &[u8]) -> Result<CredentialHandle, EngineError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher()
            .encrypt(nonce, plaintext)
            .map_err(|_| EngineError::VaultError("encryption failed".to_string()))?;

        let mut blob = nonce_bytes.to_vec();
        blob.extend(ciphertext);
        Ok(CredentialHandle(format!("{}{}", HANDLE_PREFIX, STANDARD.encode(blob))))
    }

    fn open(&self, handle: &CredentialHandle) -> Result<Zeroizing<Vec<u8>>, EngineError> {
        let encoded = handle
            .0
            .strip_prefix(HANDLE_PREFIX)
            .ok_or_else(|| EngineError::VaultError("unsupported credential handle".to_string()))?;
        let blob = STANDARD
            .decode(encoded)
            .map_err(|_| EngineError::VaultError("credential handle is not base64".to_string()))?;
        if blob.len() <= NONCE_LEN {
            return Err(EngineError::VaultError(
                "credential handle is truncated".to_string(),
            ));
        }

        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| EngineError::VaultError("credential could not be decrypted".to_string()))?;
        Ok(Zeroizing::new(plaintext))
    }
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialVault { .. }")
    }
}
