//! Path confinement.
//!
//! Client paths are resolved against the user's root the way `realpath`
//! does: every existing prefix is canonicalized (symlinks followed) and the
//! non-existent remainder is normalized lexically. The result is accepted
//! only if it is the root itself or lies under it at a component boundary.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Errors that can occur during path resolution.
#[derive(Debug, Error)]
pub enum GuardError {
    /// The requested path resolves outside the user's root.
    #[error("path escapes user root: {0}")]
    Escapes(String),

    /// The root itself could not be opened.
    #[error("user root unavailable: {0}")]
    Io(#[from] io::Error),
}

/// Resolves client-supplied paths inside one user's root.
#[derive(Debug, Clone)]
pub struct PathGuard {
    /// Canonical root.
    root: PathBuf,
}

impl PathGuard {
    /// Create a guard for `root`, which must be an existing directory.
    pub fn new(root: &Path) -> Result<Self, GuardError> {
        let root = fs::canonicalize(root)?;
        if !root.is_dir() {
            return Err(GuardError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "user root is not a directory",
            )));
        }
        Ok(Self { root })
    }

    /// The canonical root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `path` is the root itself.
    pub fn is_root(&self, path: &Path) -> bool {
        path == self.root
    }

    /// Whether an already resolved absolute path is inside the root.
    ///
    /// Containment is component-wise, so `/data/alice2` is not inside
    /// `/data/alice`.
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }

    /// Resolve a client path.
    ///
    /// Absolute client paths are taken literally and are therefore rejected
    /// unless they point inside the root.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, GuardError> {
        let resolved = self.realpath(Path::new(relative));
        if self.contains(&resolved) {
            Ok(resolved)
        } else {
            Err(GuardError::Escapes(relative.to_string()))
        }
    }

    fn realpath(&self, relative: &Path) -> PathBuf {
        let mut resolved = self.root.clone();
        // Below a missing component nothing exists, until `..` climbs back out.
        let mut missing = false;

        for component in relative.components() {
            match component {
                Component::Prefix(_) | Component::RootDir => {
                    resolved = PathBuf::from("/");
                    missing = false;
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    resolved.pop();
                    // Back on an existing prefix: symlinks below it must be followed again.
                    if missing {
                        if let Ok(real) = fs::canonicalize(&resolved) {
                            resolved = real;
                            missing = false;
                        }
                    }
                }
                Component::Normal(name) => {
                    if missing {
                        resolved.push(name);
                        continue;
                    }
                    let candidate = resolved.join(name);
                    match fs::canonicalize(&candidate) {
                        Ok(real) => resolved = real,
                        Err(_) => {
                            missing = true;
                            resolved = match fs::read_link(&candidate) {
                                // Dangling symlink: follow its target lexically.
                                Ok(target) => normalize(&resolved.join(target)),
                                Err(_) => candidate,
                            };
                        }
                    }
                }
            }
        }

        resolved
    }
}

/// Lexically remove `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut parts: Vec<OsString> = Vec::new();
    let mut absolute = false;
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {
                absolute = true;
                parts.clear();
            }
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop();
            }
            Component::Normal(name) => parts.push(name.to_os_string()),
        }
    }

    let mut normalized = if absolute {
        PathBuf::from("/")
    } else {
        PathBuf::new()
    };
    normalized.extend(parts);
    normalized
}
