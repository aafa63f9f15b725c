//! Persistence backends for the account registry.
//!
//! The registry keeps its working set in memory and hands a full snapshot to
//! an [`AccountStore`] on every mutation. The JSON store writes
//! `users.json` atomically (temp file, then rename).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use super::credentials::StoredCredential;

/// Current version of the registry document.
const REGISTRY_VERSION: u32 = 1;

/// One persisted account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub username: String,
    pub credential: StoredCredential,
    /// Remaining upload allowance in bytes.
    pub quota_remaining: u64,
}

/// Load/save seam for the registry.
pub trait AccountStore: Send + Sync {
    /// Read every persisted account. A missing store yields no accounts.
    fn load(&self) -> Result<Vec<AccountRecord>>;

    /// Replace the persisted accounts with `accounts`.
    fn save(&self, accounts: &[AccountRecord]) -> Result<()>;
}

/// Wrapper for serializing the registry.
#[derive(Debug, Serialize, Deserialize)]
struct RegistryDocument {
    /// Version of the store format (for future migrations).
    version: u32,
    /// The accounts in the store.
    accounts: Vec<AccountRecord>,
}

/// Flat `{ "<user>": { "password": ..., "quota": ... } }` layout written by
/// earlier deployments.
#[derive(Debug, Deserialize)]
struct LegacyEntry {
    password: String,
    quota: i64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredDocument {
    Versioned(RegistryDocument),
    Legacy(BTreeMap<String, LegacyEntry>),
}

/// Registry persisted as a JSON document.
pub struct JsonAccountStore {
    path: PathBuf,
}

impl JsonAccountStore {
    /// Creates a store that persists to the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl AccountStore for JsonAccountStore {
    fn load(&self) -> Result<Vec<AccountRecord>> {
        if !self.path.exists() {
            tracing::debug!(
                "Account registry not found at {:?}, starting empty",
                self.path
            );
            return Ok(Vec::new());
        }

        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read account registry: {}", self.path.display()))?;

        let document: StoredDocument = serde_json::from_str(&contents).with_context(|| {
            format!("Failed to parse account registry: {}", self.path.display())
        })?;

        let accounts = match document {
            StoredDocument::Versioned(doc) => {
                if doc.version != REGISTRY_VERSION {
                    bail!(
                        "Unsupported account registry version {} in {}",
                        doc.version,
                        self.path.display()
                    );
                }
                doc.accounts
            }
            StoredDocument::Legacy(entries) => {
                tracing::warn!(
                    "Importing {} accounts from legacy registry format; plaintext credentials kept",
                    entries.len()
                );
                entries
                    .into_iter()
                    .map(|(username, entry)| AccountRecord {
                        username,
                        credential: StoredCredential::Plaintext {
                            password: entry.password,
                        },
                        quota_remaining: entry.quota.max(0) as u64,
                    })
                    .collect()
            }
        };

        tracing::info!("Loaded {} accounts from {:?}", accounts.len(), self.path);
        Ok(accounts)
    }

    fn save(&self, accounts: &[AccountRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create registry directory: {}", parent.display())
            })?;
        }

        let document = RegistryDocument {
            version: REGISTRY_VERSION,
            accounts: accounts.to_vec(),
        };
        let contents = serde_json::to_string_pretty(&document)
            .context("Failed to serialize account registry")?;

        // Atomic write: write to temp file, then rename
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &contents).with_context(|| {
            format!("Failed to write temp registry: {}", temp_path.display())
        })?;

        fs::rename(&temp_path, &self.path).with_context(|| {
            format!(
                "Failed to rename temp registry {} to {}",
                temp_path.display(),
                self.path.display()
            )
        })?;

        tracing::debug!("Saved {} accounts to {:?}", accounts.len(), self.path);
        Ok(())
    }
}

/// Volatile store for tests and throwaway servers.
///
/// Writes can be made to fail to exercise persistence error paths.
#[derive(Default)]
pub struct MemoryAccountStore {
    accounts: Mutex<Vec<AccountRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryAccountStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `accounts`.
    pub fn with_accounts(accounts: Vec<AccountRecord>) -> Self {
        Self {
            accounts: Mutex::new(accounts),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make subsequent saves fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// The last successfully saved accounts.
    pub fn saved(&self) -> Vec<AccountRecord> {
        self.accounts
            .lock()
            .map(|accounts| accounts.clone())
            .unwrap_or_default()
    }
}

impl AccountStore for MemoryAccountStore {
    fn load(&self) -> Result<Vec<AccountRecord>> {
        let accounts = self
            .accounts
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to acquire lock on memory store"))?;
        Ok(accounts.clone())
    }

    fn save(&self, accounts: &[AccountRecord]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("Simulated write failure");
        }
        let mut stored = self
            .accounts
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to acquire lock on memory store"))?;
        *stored = accounts.to_vec();
        Ok(())
    }
}
