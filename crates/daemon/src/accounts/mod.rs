//! User accounts, credentials and upload quota.
//!
//! This module provides:
//! - `AccountRegistry`: concurrent username -> account table with
//!   transactional, persisted updates
//! - `CredentialVerifier`: how passwords are stored and checked
//! - `AccountStore`: JSON (and in-memory) persistence backends
//! - `QuotaLedger`: reserve/revert of upload allowance

pub mod credentials;
pub mod quota;
pub mod registry;
pub mod store;

pub use credentials::{
    verifier_for, CredentialScheme, CredentialVerifier, PlaintextVerifier, SaltedSha256Verifier,
    StoredCredential,
};
pub use quota::{QuotaError, QuotaLedger, Reservation};
pub use registry::{AccountRegistry, AccountSummary, RegistryError};
pub use store::{AccountRecord, AccountStore, JsonAccountStore, MemoryAccountStore};

/// Maximum username length.
pub const MAX_USERNAME_LEN: usize = 32;

/// Whether `name` can be used as a username.
///
/// Usernames become directory names, so only `[A-Za-z0-9_.-]` is allowed and
/// a leading `.` is refused.
pub fn is_valid_username(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_USERNAME_LEN
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}
