//! Filesystem commands for an authenticated user.
//!
//! Every path argument goes through the user's [`PathGuard`] before any
//! filesystem access. A rejected path aborts the whole command, is answered
//! with an access-denied line and recorded on the audit target. Successful
//! mutations are audit-logged with the resolved path.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use protocol::messages::{CURRENT_DIRECTORY, EMPTY_DIRECTORY};
use protocol::{Command, ProtocolError};
use tracing::{debug, info, warn};

use super::guard::PathGuard;
use super::transfer::is_upload_temp;
use crate::logging::AUDIT_TARGET;
use crate::session::SessionError;

/// Executes filesystem commands confined to one user's root.
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    username: String,
    guard: PathGuard,
}

impl CommandDispatcher {
    pub fn new(username: impl Into<String>, guard: PathGuard) -> Self {
        Self {
            username: username.into(),
            guard,
        }
    }

    /// The user this dispatcher acts for.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The user's path guard.
    pub fn guard(&self) -> &PathGuard {
        &self.guard
    }

    /// Resolve `requested` or fail with `denial` as the client's reply.
    ///
    /// Rejections are logged as security events.
    pub fn confine(
        &self,
        op: &str,
        requested: &str,
        denial: impl FnOnce() -> String,
    ) -> Result<PathBuf, SessionError> {
        self.guard.resolve(requested).map_err(|err| {
            warn!(
                target: AUDIT_TARGET,
                user = %self.username,
                op,
                requested,
                error = %err,
                "access denied"
            );
            SessionError::AccessDenied(denial())
        })
    }

    /// Run a filesystem command and return the reply line.
    ///
    /// Transfer and session-control verbs are not handled here.
    pub fn execute(&self, command: &Command) -> Result<String, SessionError> {
        match command {
            Command::Pwd => Ok(CURRENT_DIRECTORY.to_string()),
            Command::List { path } => self.list(path.as_deref()),
            Command::MakeDir { path } => self.make_dir(path),
            Command::RemoveDir { path } => self.remove_dir(path),
            Command::RemoveFile { path } => self.remove_file(path),
            Command::Rename { from, to } => self.rename(from, to),
            Command::Copy { from, to } => self.copy(from, to),
            other => Err(SessionError::Protocol(ProtocolError::UnknownVerb(
                other.verb().to_string(),
            ))),
        }
    }

    fn list(&self, path: Option<&str>) -> Result<String, SessionError> {
        let target = match path {
            None => self.guard.root().to_path_buf(),
            Some(requested) => {
                let missing = || {
                    format!("Error: Directory '{requested}' does not exist or is not accessible.")
                };
                let resolved = self.confine("ls", requested, missing)?;
                if !resolved.is_dir() {
                    return Ok(missing());
                }
                resolved
            }
        };

        let entries = match fs::read_dir(&target) {
            Ok(entries) => entries,
            Err(e) => return Ok(format!("Error listing directory: {e}")),
        };
        let mut names = Vec::new();
        for entry in entries {
            match entry {
                Ok(entry) => {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    // In-flight uploads stay invisible until renamed into place.
                    if !is_upload_temp(&name) {
                        names.push(name);
                    }
                }
                Err(e) => return Ok(format!("Error listing directory: {e}")),
            }
        }

        if names.is_empty() {
            return Ok(EMPTY_DIRECTORY.to_string());
        }
        names.sort();
        Ok(names.join("; "))
    }

    fn make_dir(&self, requested: &str) -> Result<String, SessionError> {
        let path = self.confine("mkdir", requested, || {
            format!("Access denied: Cannot create directory '{requested}' outside your designated area.")
        })?;

        if path.exists() {
            return Ok("Directory already exists".to_string());
        }
        match fs::create_dir_all(&path) {
            Ok(()) => {
                self.audit("mkdir", &path);
                Ok(format!("Directory created: {requested}"))
            }
            Err(e) => Ok(format!("Error creating directory {requested}: {e}")),
        }
    }

    fn remove_dir(&self, requested: &str) -> Result<String, SessionError> {
        let path = self.confine("rmdir", requested, || {
            format!("Access denied: Cannot remove directory '{requested}' outside your designated area.")
        })?;

        if self.guard.is_root(&path) {
            return Ok("Error: Cannot remove the root directory.".to_string());
        }
        if !path.is_dir() {
            return Ok("Directory does not exist or is not a directory.".to_string());
        }
        match fs::remove_dir_all(&path) {
            Ok(()) => {
                self.audit("rmdir", &path);
                Ok(format!("Directory removed: {requested}"))
            }
            Err(e) => Ok(format!(
                "Error removing directory {requested}: {e}. It might be in use or you lack permissions."
            )),
        }
    }

    fn remove_file(&self, requested: &str) -> Result<String, SessionError> {
        let path = self.confine("rmfile", requested, || {
            format!("Access denied: Cannot remove file '{requested}' outside your designated area.")
        })?;

        if !path.is_file() {
            return Ok("File does not exist or is not a file.".to_string());
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                self.audit("rmfile", &path);
                Ok(format!("File removed: {requested}"))
            }
            Err(e) => Ok(format!(
                "Error removing file {requested}: {e}. It might be in use or you lack permissions."
            )),
        }
    }

    fn rename(&self, from: &str, to: &str) -> Result<String, SessionError> {
        let denied =
            || "Access denied: Cannot rename paths outside your designated area.".to_string();
        let source = self.confine("rename", from, denied)?;
        let destination = self.confine("rename", to, denied)?;

        if self.guard.is_root(&source) || self.guard.is_root(&destination) {
            return Ok("Error: Cannot rename the root directory.".to_string());
        }
        if !source.exists() {
            return Ok("Source file/directory does not exist.".to_string());
        }
        match fs::rename(&source, &destination) {
            Ok(()) => {
                info!(
                    target: AUDIT_TARGET,
                    user = %self.username,
                    op = "rename",
                    from = %source.display(),
                    to = %destination.display(),
                );
                Ok(format!("Renamed from {from} to {to}"))
            }
            Err(e) => Ok(format!("Error renaming {from} to {to}: {e}")),
        }
    }

    fn copy(&self, from: &str, to: &str) -> Result<String, SessionError> {
        let denied =
            || "Access denied: Cannot copy paths outside your designated area.".to_string();
        let source = self.confine("copy", from, denied)?;
        let mut destination = self.confine("copy", to, denied)?;

        if !source.exists() {
            return Ok("Source file/directory does not exist.".to_string());
        }

        // Copying onto a directory places the source inside it.
        if destination.is_dir() {
            if let Some(name) = source.file_name() {
                destination = destination.join(name);
            }
        }

        let result = if source.is_file() {
            if destination == source {
                return Ok("Error: Source and destination are the same file.".to_string());
            }
            copy_file(&source, &destination)
                .map(|()| format!("Copied file from '{from}' to '{to}'"))
        } else if source.is_dir() {
            if destination.is_file() {
                return Ok(format!(
                    "Error: Cannot copy directory '{from}' to existing file '{to}'."
                ));
            }
            if destination.exists() {
                return Ok(format!(
                    "Error: Destination directory '{to}' already exists. Please provide a non-existent path for directory copy."
                ));
            }
            if destination.starts_with(&source) {
                return Ok(format!("Error: Cannot copy directory '{from}' into itself."));
            }
            copy_tree(&source, &destination)
                .map(|()| format!("Copied directory from '{from}' to '{to}'"))
        } else {
            return Ok("Source is neither a file nor a directory.".to_string());
        };

        match result {
            Ok(reply) => {
                info!(
                    target: AUDIT_TARGET,
                    user = %self.username,
                    op = "copy",
                    from = %source.display(),
                    to = %destination.display(),
                );
                Ok(reply)
            }
            Err(e) => Ok(format!("Error copying {from} to {to}: {e}")),
        }
    }

    fn audit(&self, op: &str, path: &Path) {
        info!(
            target: AUDIT_TARGET,
            user = %self.username,
            op,
            path = %path.display(),
        );
    }
}

/// Byte copy preserving permissions and modification time.
fn copy_file(source: &Path, destination: &Path) -> io::Result<()> {
    fs::copy(source, destination)?;
    let modified = fs::metadata(source)?.modified()?;
    File::options()
        .write(true)
        .open(destination)?
        .set_modified(modified)
}

/// Recursive copy. Symbolic links inside the tree are skipped.
fn copy_tree(source: &Path, destination: &Path) -> io::Result<()> {
    fs::create_dir(destination)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = destination.join(entry.file_name());
        if file_type.is_symlink() {
            debug!(path = ?entry.path(), "skipping symlink during copy");
        } else if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            copy_file(&entry.path(), &target)?;
        }
    }
    let permissions = fs::metadata(source)?.permissions();
    fs::set_permissions(destination, permissions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, CommandDispatcher) {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("alice").join("docs");
        fs::create_dir_all(&root).unwrap();
        let dispatcher = CommandDispatcher::new("alice", PathGuard::new(&root).unwrap());
        (temp_dir, dispatcher)
    }

    fn run(dispatcher: &CommandDispatcher, line: &str) -> Result<String, SessionError> {
        dispatcher.execute(&Command::parse(line).unwrap())
    }

    fn ok(dispatcher: &CommandDispatcher, line: &str) -> String {
        run(dispatcher, line).unwrap()
    }

    fn root(dispatcher: &CommandDispatcher) -> PathBuf {
        dispatcher.guard().root().to_path_buf()
    }

    #[test]
    fn test_pwd_never_reveals_real_path() {
        let (_temp, d) = setup();
        assert_eq!(ok(&d, "pwd"), "Current directory: /");
    }

    #[test]
    fn test_ls_empty_and_sorted() {
        let (_temp, d) = setup();
        assert_eq!(ok(&d, "ls"), "(empty directory)");

        fs::write(root(&d).join("b.txt"), b"").unwrap();
        fs::write(root(&d).join("a.txt"), b"").unwrap();
        fs::create_dir(root(&d).join("c")).unwrap();
        assert_eq!(ok(&d, "ls"), "a.txt; b.txt; c");
    }

    #[test]
    fn test_ls_hides_in_flight_uploads() {
        let (_temp, d) = setup();
        fs::write(root(&d).join(".big.iso.0123456789abcdef0123456789abcdef.part"), b"x").unwrap();
        assert_eq!(ok(&d, "ls"), "(empty directory)");

        fs::write(root(&d).join(".profile"), b"").unwrap();
        assert_eq!(ok(&d, "ls"), ".profile");
    }

    #[test]
    fn test_ls_missing_directory() {
        let (_temp, d) = setup();
        assert_eq!(
            ok(&d, "ls nope"),
            "Error: Directory 'nope' does not exist or is not accessible."
        );
    }

    #[test]
    fn test_ls_outside_root_denied() {
        let (_temp, d) = setup();
        let err = run(&d, "ls ../..").unwrap_err();
        assert!(matches!(err, SessionError::AccessDenied(_)));
        assert_eq!(
            err.to_string(),
            "Error: Directory '../..' does not exist or is not accessible."
        );
    }

    #[test]
    fn test_mkdir_nested_and_idempotent() {
        let (_temp, d) = setup();
        assert_eq!(ok(&d, "mkdir a/b/c"), "Directory created: a/b/c");
        assert!(root(&d).join("a/b/c").is_dir());
        assert_eq!(ok(&d, "mkdir a/b/c"), "Directory already exists");
    }

    #[test]
    fn test_mkdir_outside_denied_and_not_created() {
        let (temp, d) = setup();
        let err = run(&d, "mkdir ../escape").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Access denied: Cannot create directory '../escape' outside your designated area."
        );
        assert!(!temp.path().join("alice").join("escape").exists());
    }

    #[test]
    fn test_rmdir_recursive() {
        let (_temp, d) = setup();
        fs::create_dir_all(root(&d).join("sub/inner")).unwrap();
        fs::write(root(&d).join("sub/inner/f"), b"x").unwrap();

        assert_eq!(ok(&d, "rmdir sub"), "Directory removed: sub");
        assert!(!root(&d).join("sub").exists());
        assert_eq!(
            ok(&d, "rmdir sub"),
            "Directory does not exist or is not a directory."
        );
    }

    #[test]
    fn test_rmdir_refuses_root() {
        let (_temp, d) = setup();
        for line in ["rmdir .", "rmdir sub/..", "rmdir /"] {
            let reply = run(&d, line);
            match line {
                "rmdir /" => assert!(matches!(reply, Err(SessionError::AccessDenied(_)))),
                _ => assert_eq!(reply.unwrap(), "Error: Cannot remove the root directory."),
            }
        }
        assert!(root(&d).is_dir());
    }

    #[test]
    fn test_rmfile() {
        let (_temp, d) = setup();
        fs::write(root(&d).join("f.txt"), b"x").unwrap();
        fs::create_dir(root(&d).join("dir")).unwrap();

        assert_eq!(ok(&d, "rmfile f.txt"), "File removed: f.txt");
        assert_eq!(ok(&d, "rmfile f.txt"), "File does not exist or is not a file.");
        assert_eq!(ok(&d, "rmfile dir"), "File does not exist or is not a file.");
    }

    #[test]
    fn test_rename() {
        let (_temp, d) = setup();
        fs::write(root(&d).join("x"), b"data").unwrap();

        assert_eq!(ok(&d, "rename x y"), "Renamed from x to y");
        assert_eq!(fs::read(root(&d).join("y")).unwrap(), b"data");
        assert_eq!(ok(&d, "rename x z"), "Source file/directory does not exist.");
    }

    #[test]
    fn test_rename_outside_denied() {
        let (temp, d) = setup();
        fs::write(root(&d).join("x"), b"data").unwrap();

        let err = run(&d, "rename x ../../stolen").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Access denied: Cannot rename paths outside your designated area."
        );
        assert!(root(&d).join("x").exists());
        assert!(!temp.path().join("stolen").exists());
    }

    #[test]
    fn test_rename_refuses_root() {
        let (_temp, d) = setup();
        assert_eq!(ok(&d, "rename . other"), "Error: Cannot rename the root directory.");
    }

    #[test]
    fn test_copy_file_into_directory() {
        let (_temp, d) = setup();
        fs::write(root(&d).join("y"), b"payload").unwrap();
        fs::create_dir(root(&d).join("sub")).unwrap();

        assert_eq!(ok(&d, "copy y sub"), "Copied file from 'y' to 'sub'");
        assert_eq!(fs::read(root(&d).join("sub/y")).unwrap(), b"payload");
        assert_eq!(ok(&d, "ls sub"), "y");
    }

    #[test]
    fn test_copy_file_preserves_mtime() {
        let (_temp, d) = setup();
        let source = root(&d).join("old");
        fs::write(&source, b"x").unwrap();
        let past = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        File::options()
            .write(true)
            .open(&source)
            .unwrap()
            .set_modified(past)
            .unwrap();

        ok(&d, "copy old new");
        let copied = fs::metadata(root(&d).join("new")).unwrap().modified().unwrap();
        assert_eq!(copied, past);
    }

    #[test]
    fn test_copy_file_onto_itself_refused() {
        let (_temp, d) = setup();
        fs::write(root(&d).join("same"), b"keep me").unwrap();

        assert_eq!(
            ok(&d, "copy same same"),
            "Error: Source and destination are the same file."
        );
        assert_eq!(fs::read(root(&d).join("same")).unwrap(), b"keep me");
    }

    #[test]
    fn test_copy_directory_tree() {
        let (_temp, d) = setup();
        fs::create_dir_all(root(&d).join("src/inner")).unwrap();
        fs::write(root(&d).join("src/a"), b"a").unwrap();
        fs::write(root(&d).join("src/inner/b"), b"b").unwrap();

        assert_eq!(ok(&d, "copy src dst"), "Copied directory from 'src' to 'dst'");
        assert_eq!(fs::read(root(&d).join("dst/a")).unwrap(), b"a");
        assert_eq!(fs::read(root(&d).join("dst/inner/b")).unwrap(), b"b");
    }

    #[test]
    fn test_copy_directory_refusals() {
        let (_temp, d) = setup();
        fs::create_dir_all(root(&d).join("src/inner")).unwrap();
        fs::write(root(&d).join("file"), b"f").unwrap();
        fs::create_dir_all(root(&d).join("target/src")).unwrap();

        assert_eq!(
            ok(&d, "copy src file"),
            "Error: Cannot copy directory 'src' to existing file 'file'."
        );
        // `target` is a directory, so the copy would land on target/src.
        assert_eq!(
            ok(&d, "copy src target"),
            "Error: Destination directory 'target' already exists. Please provide a non-existent path for directory copy."
        );
        assert_eq!(
            ok(&d, "copy src src/inner/deeper"),
            "Error: Cannot copy directory 'src' into itself."
        );
        assert!(!root(&d).join("src/inner/deeper").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_tree_skips_symlinks() {
        let (temp, d) = setup();
        let secret = temp.path().join("secret");
        fs::write(&secret, b"outside").unwrap();
        fs::create_dir(root(&d).join("src")).unwrap();
        fs::write(root(&d).join("src/plain"), b"p").unwrap();
        std::os::unix::fs::symlink(&secret, root(&d).join("src/link")).unwrap();

        ok(&d, "copy src dst");
        assert!(root(&d).join("dst/plain").exists());
        assert!(fs::symlink_metadata(root(&d).join("dst/link")).is_err());
    }

    #[test]
    fn test_copy_outside_denied() {
        let (_temp, d) = setup();
        let err = run(&d, "copy ../../etc mine").unwrap_err();
        assert!(matches!(err, SessionError::AccessDenied(_)));
    }

    #[test]
    fn test_transfer_verbs_not_handled() {
        let (_temp, d) = setup();
        let err = run(&d, "upload x").unwrap_err();
        assert_eq!(err.to_string(), "bad request");
    }
}
