//! Upload quota ledger.
//!
//! Quota is an upload allowance: a reservation deducts the declared size
//! before any byte is received, and an incomplete transfer gives back
//! exactly the bytes that never arrived. Deleting files does not refund
//! quota.

use std::sync::Arc;

use thiserror::Error;

use super::registry::{AccountRegistry, RegistryError};

/// Errors raised by the ledger.
#[derive(Debug, Error)]
pub enum QuotaError {
    /// Declared size exceeds the remaining allowance.
    #[error("insufficient quota: requested {requested} bytes, {remaining} remaining")]
    Insufficient { requested: u64, remaining: u64 },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Quota deducted for one in-flight upload.
///
/// Must be settled with [`QuotaLedger::commit`] or [`QuotaLedger::revert`].
#[derive(Debug)]
#[must_use = "a reservation must be committed or reverted"]
pub struct Reservation {
    username: String,
    size: u64,
}

impl Reservation {
    /// Account the quota was taken from.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Reserved bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Serializes quota changes against the registry.
#[derive(Clone)]
pub struct QuotaLedger {
    registry: Arc<AccountRegistry>,
}

impl QuotaLedger {
    pub fn new(registry: Arc<AccountRegistry>) -> Self {
        Self { registry }
    }

    /// Atomically check and deduct `size` bytes.
    ///
    /// The decremented value is persisted before this returns, so the caller
    /// may start receiving data. Concurrent reservations on one account are
    /// serialized and can never jointly exceed the allowance.
    pub fn reserve(&self, username: &str, size: u64) -> Result<Reservation, QuotaError> {
        self.registry.update_quota(username, |remaining| {
            if size > remaining {
                return Err(QuotaError::Insufficient {
                    requested: size,
                    remaining,
                });
            }
            Ok((remaining - size, ()))
        })?;

        tracing::debug!(user = %username, size, "quota reserved");
        Ok(Reservation {
            username: username.to_string(),
            size,
        })
    }

    /// Settle a reservation whose bytes were all delivered.
    pub fn commit(&self, reservation: Reservation) {
        tracing::debug!(
            user = %reservation.username,
            size = reservation.size,
            "quota reservation committed"
        );
    }

    /// Give back `undelivered` bytes of a reservation.
    ///
    /// At most the reserved size is restored.
    pub fn revert(&self, reservation: Reservation, undelivered: u64) -> Result<(), QuotaError> {
        let restore = undelivered.min(reservation.size);
        self.registry.update_quota(&reservation.username, |remaining| {
            Ok::<_, QuotaError>((remaining.saturating_add(restore), ()))
        })?;

        tracing::debug!(
            user = %reservation.username,
            restored = restore,
            "quota reservation reverted"
        );
        Ok(())
    }

    /// Remaining allowance for an account.
    pub fn remaining(&self, username: &str) -> Option<u64> {
        self.registry.quota_remaining(username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::credentials::PlaintextVerifier;
    use crate::accounts::store::MemoryAccountStore;
    use std::thread;
    use tempfile::TempDir;

    fn ledger(temp_dir: &TempDir, quota: u64) -> QuotaLedger {
        let registry = AccountRegistry::open(
            Box::new(MemoryAccountStore::new()),
            Arc::new(PlaintextVerifier),
            temp_dir.path(),
            quota,
        )
        .unwrap();
        registry.register("alice", "pw").unwrap();
        QuotaLedger::new(Arc::new(registry))
    }

    #[test]
    fn test_reserve_deducts() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = ledger(&temp_dir, 1000);

        let reservation = ledger.reserve("alice", 600).unwrap();
        assert_eq!(reservation.size(), 600);
        assert_eq!(reservation.username(), "alice");
        assert_eq!(ledger.remaining("alice"), Some(400));
        ledger.commit(reservation);
        assert_eq!(ledger.remaining("alice"), Some(400));
    }

    #[test]
    fn test_reserve_exact_remaining() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = ledger(&temp_dir, 1000);

        ledger.commit(ledger.reserve("alice", 1000).unwrap());
        assert_eq!(ledger.remaining("alice"), Some(0));
        ledger.commit(ledger.reserve("alice", 0).unwrap());
    }

    #[test]
    fn test_reserve_insufficient_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = ledger(&temp_dir, 1000);

        let err = ledger.reserve("alice", 1001).unwrap_err();
        assert!(matches!(
            err,
            QuotaError::Insufficient {
                requested: 1001,
                remaining: 1000
            }
        ));
        assert_eq!(ledger.remaining("alice"), Some(1000));
    }

    #[test]
    fn test_revert_restores_undelivered_only() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = ledger(&temp_dir, 1000);

        let reservation = ledger.reserve("alice", 600).unwrap();
        ledger.revert(reservation, 250).unwrap();
        assert_eq!(ledger.remaining("alice"), Some(650));
    }

    #[test]
    fn test_revert_capped_at_reservation() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = ledger(&temp_dir, 1000);

        let reservation = ledger.reserve("alice", 100).unwrap();
        ledger.revert(reservation, 5000).unwrap();
        assert_eq!(ledger.remaining("alice"), Some(1000));
    }

    #[test]
    fn test_reserve_unknown_account() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = ledger(&temp_dir, 1000);
        assert!(matches!(
            ledger.reserve("ghost", 1),
            Err(QuotaError::Registry(RegistryError::UnknownAccount(_)))
        ));
    }

    #[test]
    fn test_concurrent_reservations_never_overcommit() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = ledger(&temp_dir, 1000);

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let ledger = ledger.clone();
                thread::spawn(move || match ledger.reserve("alice", 300) {
                    Ok(reservation) => {
                        ledger.commit(reservation);
                        true
                    }
                    Err(QuotaError::Insufficient { .. }) => false,
                    Err(other) => panic!("unexpected error: {other}"),
                })
            })
            .collect();

        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(granted, 3);
        assert_eq!(ledger.remaining("alice"), Some(100));
    }
}
