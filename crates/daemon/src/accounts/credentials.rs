//! Credential storage and verification.
//!
//! Secrets never leave this module in a comparable form: the registry stores
//! a [`StoredCredential`] and asks a [`CredentialVerifier`] whether a
//! presented password matches it.

use std::fmt;
use std::sync::Arc;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of the random salt in bytes.
const SALT_LEN: usize = 16;

/// How newly issued credentials are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialScheme {
    /// Password kept verbatim. Only for registries migrated from older
    /// deployments.
    Plaintext,
    /// SHA-256 over a random per-account salt followed by the password.
    #[default]
    SaltedSha256,
}

/// A credential as persisted in the registry.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "kebab-case")]
pub enum StoredCredential {
    Plaintext {
        password: String,
    },
    SaltedSha256 {
        /// Hex-encoded salt.
        salt: String,
        /// Hex-encoded digest.
        hash: String,
    },
}

impl fmt::Debug for StoredCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredCredential")
            .field("scheme", &self.scheme())
            .finish_non_exhaustive()
    }
}

impl StoredCredential {
    /// Scheme this credential was issued with.
    pub fn scheme(&self) -> CredentialScheme {
        match self {
            StoredCredential::Plaintext { .. } => CredentialScheme::Plaintext,
            StoredCredential::SaltedSha256 { .. } => CredentialScheme::SaltedSha256,
        }
    }

    /// Compare a presented password against this credential.
    ///
    /// Works for every scheme regardless of which one issues new credentials,
    /// so registries with mixed records keep working.
    pub fn matches(&self, password: &str) -> bool {
        match self {
            StoredCredential::Plaintext { password: stored } => {
                constant_time_eq(stored.as_bytes(), password.as_bytes())
            }
            StoredCredential::SaltedSha256 { salt, hash } => {
                let (Ok(salt), Ok(expected)) = (hex::decode(salt), hex::decode(hash)) else {
                    return false;
                };
                let actual = salted_digest(&salt, password);
                constant_time_eq(&expected, &actual)
            }
        }
    }
}

/// Issues and checks credentials.
pub trait CredentialVerifier: Send + Sync {
    /// Scheme used for newly issued credentials.
    fn scheme(&self) -> CredentialScheme;

    /// Turn a password into a credential suitable for persisting.
    fn issue(&self, password: &str) -> StoredCredential;

    /// Check a presented password.
    fn verify(&self, stored: &StoredCredential, password: &str) -> bool {
        stored.matches(password)
    }
}

/// Stores passwords verbatim.
#[derive(Debug, Default)]
pub struct PlaintextVerifier;

impl CredentialVerifier for PlaintextVerifier {
    fn scheme(&self) -> CredentialScheme {
        CredentialScheme::Plaintext
    }

    fn issue(&self, password: &str) -> StoredCredential {
        StoredCredential::Plaintext {
            password: password.to_string(),
        }
    }
}

/// Stores a salted SHA-256 digest.
#[derive(Debug, Default)]
pub struct SaltedSha256Verifier;

impl CredentialVerifier for SaltedSha256Verifier {
    fn scheme(&self) -> CredentialScheme {
        CredentialScheme::SaltedSha256
    }

    fn issue(&self, password: &str) -> StoredCredential {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        StoredCredential::SaltedSha256 {
            salt: hex::encode(salt),
            hash: hex::encode(salted_digest(&salt, password)),
        }
    }
}

/// Verifier for the configured scheme.
pub fn verifier_for(scheme: CredentialScheme) -> Arc<dyn CredentialVerifier> {
    match scheme {
        CredentialScheme::Plaintext => Arc::new(PlaintextVerifier),
        CredentialScheme::SaltedSha256 => Arc::new(SaltedSha256Verifier),
    }
}

fn salted_digest(salt: &[u8], password: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().to_vec()
}

/// Compare without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
