//! Decrypted SSH credential material

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// SSH credential material for one target.
///
/// Only exists inside the scope of a session open; `Debug` never prints it.
pub struct SshSecret {
    password: Option<SecretString>,
    private_key: Option<SecretString>,
    passphrase: Option<SecretString>,
}

impl SshSecret {
    pub fn password(password: impl Into<String>) -> Self {
        Self {
            password: Some(SecretString::from(password.into())),
            private_key: None,
            passphrase: None,
        }
    }

    /// PEM/OpenSSH private key text with an optional passphrase
    pub fn private_key(pem: impl Into<String>, passphrase: Option<String>) -> Self {
        Self {
            password: None,
            private_key: Some(SecretString::from(pem.into())),
            passphrase: passphrase.map(SecretString::from),
        }
    }

    pub fn password_secret(&self) -> Option<&SecretString> {
        self.password.as_ref()
    }

    pub fn private_key_secret(&self) -> Option<&SecretString> {
        self.private_key.as_ref()
    }

    pub fn passphrase_secret(&self) -> Option<&SecretString> {
        self.passphrase.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        let blank = |s: &Option<SecretString>| {
            s.as_ref()
                .map(|s| s.expose_secret().is_empty())
                .unwrap_or(true)
        };
        blank(&self.password) && blank(&self.private_key)
    }

    pub(crate) fn to_sealed(&self) -> SealedSecret {
        let expose = |s: &Option<SecretString>| s.as_ref().map(|s| s.expose_secret().to_string());
        SealedSecret {
            password: expose(&self.password),
            private_key: expose(&self.private_key),
            passphrase: expose(&self.passphrase),
        }
    }

    pub(crate) fn from_sealed(sealed: &SealedSecret) -> Self {
        let wrap = |s: &Option<String>| s.clone().map(SecretString::from);
        Self {
            password: wrap(&sealed.password),
            private_key: wrap(&sealed.private_key),
            passphrase: wrap(&sealed.passphrase),
        }
    }
}

impl std::fmt::Debug for SshSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mark = |s: &Option<SecretString>| if s.is_some() { "[REDACTED]" } else { "none" };
        f.debug_struct("SshSecret")
            .field("password", &mark(&self.password))
            .field("private_key", &mark(&self.private_key))
            .field("passphrase", &mark(&self.passphrase))
            .finish()
    }
}

/// Wire form of [`SshSecret`] inside the ciphertext
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub(crate) struct SealedSecret {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}
