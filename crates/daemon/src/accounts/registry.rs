//! Concurrent account registry.
//!
//! Accounts live in a `DashMap` with one mutex per account. Every change runs
//! as a transactional update under that account's lock: the new state is
//! persisted through the [`AccountStore`] first and only committed in memory
//! once the write succeeded. A failed write leaves memory and disk agreeing
//! on the previous state.
//!
//! Lock order is account (or map shard) first, then the persisted snapshot.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

use super::credentials::{verifier_for, CredentialVerifier, StoredCredential};
use super::is_valid_username;
use super::store::{AccountRecord, AccountStore, JsonAccountStore};
use crate::config::Config;
use crate::logging::AUTH_TARGET;

/// Errors raised by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Username fails the naming rules.
    #[error("invalid username: {0:?}")]
    InvalidUsername(String),

    /// An account with this name already exists.
    #[error("account already exists: {0}")]
    AlreadyExists(String),

    /// No account with this name.
    #[error("unknown account: {0}")]
    UnknownAccount(String),

    /// The user's directory could not be created.
    #[error("failed to create user directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The registry could not be written.
    #[error("failed to persist account registry: {0:#}")]
    Persistence(anyhow::Error),
}

/// Public view of an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSummary {
    pub username: String,
    pub quota_remaining: u64,
}

#[derive(Debug)]
struct Account {
    credential: StoredCredential,
    quota_remaining: u64,
}

/// Username -> account table shared by every session.
pub struct AccountRegistry {
    accounts: DashMap<String, Arc<Mutex<Account>>>,
    /// Last persisted state; always what the store holds.
    snapshot: Mutex<BTreeMap<String, AccountRecord>>,
    store: Box<dyn AccountStore>,
    verifier: Arc<dyn CredentialVerifier>,
    users_dir: PathBuf,
    default_quota: u64,
}

impl AccountRegistry {
    /// Load the registry from `store`.
    ///
    /// Records with names that are not valid usernames are skipped, since
    /// they could not be mapped to a user directory safely.
    pub fn open(
        store: Box<dyn AccountStore>,
        verifier: Arc<dyn CredentialVerifier>,
        users_dir: impl Into<PathBuf>,
        default_quota: u64,
    ) -> anyhow::Result<Self> {
        let records = store.load()?;

        let accounts = DashMap::new();
        let mut snapshot = BTreeMap::new();
        for record in records {
            if !is_valid_username(&record.username) {
                tracing::warn!("Skipping account with invalid username {:?}", record.username);
                continue;
            }
            if snapshot.contains_key(&record.username) {
                tracing::warn!("Duplicate account {:?}, keeping the last entry", record.username);
            }
            accounts.insert(
                record.username.clone(),
                Arc::new(Mutex::new(Account {
                    credential: record.credential.clone(),
                    quota_remaining: record.quota_remaining,
                })),
            );
            snapshot.insert(record.username.clone(), record);
        }

        Ok(Self {
            accounts,
            snapshot: Mutex::new(snapshot),
            store,
            verifier,
            users_dir: users_dir.into(),
            default_quota,
        })
    }

    /// Open the JSON registry described by `config`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::open(
            Box::new(JsonAccountStore::new(config.registry_path())),
            verifier_for(config.security.credential_scheme),
            config.users_dir(),
            config.storage.default_quota,
        )
    }

    /// Confinement root of a user: `<users_dir>/<username>/docs`.
    pub fn user_root(&self, username: &str) -> PathBuf {
        self.users_dir.join(username).join("docs")
    }

    /// Number of accounts.
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    /// Whether the registry has no accounts.
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Whether an account exists.
    pub fn contains(&self, username: &str) -> bool {
        self.accounts.contains_key(username)
    }

    /// Check a username/password pair.
    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        let Some(account) = self.account(username) else {
            tracing::debug!(target: AUTH_TARGET, user = %username, "unknown account");
            return false;
        };
        let account = lock(&account);
        self.verifier.verify(&account.credential, password)
    }

    /// Create an account with the default quota.
    pub fn register(&self, username: &str, password: &str) -> Result<(), RegistryError> {
        self.register_with_quota(username, password, self.default_quota)
    }

    /// Create an account and its data directory.
    ///
    /// Concurrent registrations of the same name are serialized: exactly one
    /// succeeds.
    pub fn register_with_quota(
        &self,
        username: &str,
        password: &str,
        quota: u64,
    ) -> Result<(), RegistryError> {
        if !is_valid_username(username) {
            return Err(RegistryError::InvalidUsername(username.to_string()));
        }

        match self.accounts.entry(username.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyExists(username.to_string())),
            Entry::Vacant(slot) => {
                let root = self.user_root(username);
                fs::create_dir_all(&root).map_err(|source| RegistryError::Directory {
                    path: root.clone(),
                    source,
                })?;

                let record = AccountRecord {
                    username: username.to_string(),
                    credential: self.verifier.issue(password),
                    quota_remaining: quota,
                };
                self.persist(record.clone())?;

                slot.insert(Arc::new(Mutex::new(Account {
                    credential: record.credential,
                    quota_remaining: quota,
                })));
                tracing::info!(
                    target: AUTH_TARGET,
                    user = %username,
                    root = %root.display(),
                    "account registered"
                );
                Ok(())
            }
        }
    }

    /// Remaining upload allowance, or `None` for an unknown account.
    pub fn quota_remaining(&self, username: &str) -> Option<u64> {
        let account = self.account(username)?;
        let quota = lock(&account).quota_remaining;
        Some(quota)
    }

    /// Overwrite an account's remaining quota.
    pub fn set_quota(&self, username: &str, quota: u64) -> Result<(), RegistryError> {
        self.update_quota(username, |_| Ok::<_, RegistryError>((quota, ())))
    }

    /// All accounts as last persisted, sorted by name.
    pub fn list(&self) -> Vec<AccountSummary> {
        lock(&self.snapshot)
            .values()
            .map(|record| AccountSummary {
                username: record.username.clone(),
                quota_remaining: record.quota_remaining,
            })
            .collect()
    }

    /// Run a transactional quota update for one account.
    ///
    /// `f` receives the current quota and returns the new quota plus a value
    /// for the caller. The account stays locked while the new state is
    /// persisted, so concurrent updates of the same account are serialized.
    /// When `f` fails nothing is written.
    pub fn update_quota<T, E, F>(&self, username: &str, f: F) -> Result<T, E>
    where
        F: FnOnce(u64) -> Result<(u64, T), E>,
        E: From<RegistryError>,
    {
        let account = self
            .account(username)
            .ok_or_else(|| RegistryError::UnknownAccount(username.to_string()))?;
        let mut account = lock(&account);

        let (quota, value) = f(account.quota_remaining)?;
        if quota != account.quota_remaining {
            self.persist(AccountRecord {
                username: username.to_string(),
                credential: account.credential.clone(),
                quota_remaining: quota,
            })?;
            account.quota_remaining = quota;
        }
        Ok(value)
    }

    fn account(&self, username: &str) -> Option<Arc<Mutex<Account>>> {
        self.accounts.get(username).map(|entry| Arc::clone(entry.value()))
    }

    /// Write the registry with `record` applied, then update the snapshot.
    fn persist(&self, record: AccountRecord) -> Result<(), RegistryError> {
        let mut snapshot = lock(&self.snapshot);

        let mut next: Vec<AccountRecord> = snapshot
            .values()
            .filter(|existing| existing.username != record.username)
            .cloned()
            .collect();
        next.push(record.clone());
        next.sort_by(|a, b| a.username.cmp(&b.username));

        self.store.save(&next).map_err(RegistryError::Persistence)?;
        snapshot.insert(record.username.clone(), record);
        Ok(())
    }
}

/// Lock a mutex, recovering the data if a previous holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
