//! Request grammar and canonical response strings.
//!
//! Requests are single whitespace-separated lines. Before authentication a
//! client may only send `login`/`register`; afterwards it sends one of the
//! [`Command`] verbs. Responses are plain human-readable lines; the fixed ones
//! are exported as constants so that server and client agree byte for byte.

use std::fmt;
use std::str::FromStr;

use crate::error::{ProtocolError, Result};

// Authentication responses
pub const AUTHENTICATED: &str = "Authenticated";
pub const REGISTERED: &str = "Registered";
pub const AUTHENTICATION_FAILED: &str = "Authentication failed";
pub const REGISTRATION_FAILED: &str = "Registration failed. User may already exist.";
pub const REGISTRATION_INVALID_USERNAME: &str = "Registration failed. Invalid username.";

// Session responses
pub const CURRENT_DIRECTORY: &str = "Current directory: /";
pub const EMPTY_DIRECTORY: &str = "(empty directory)";
pub const BAD_REQUEST: &str = "bad request";
pub const EXIT: &str = "exit";
pub const SERVER_STOPPING: &str = "Server stopping";
pub const INSUFFICIENT_PRIVILEGES: &str = "Insufficient privileges.";

// Transfer control tokens
pub const READY_FOR_UPLOAD_SIZE: &str = "READY_FOR_UPLOAD_SIZE";
pub const QUOTA_OK: &str = "QUOTA_OK";
pub const INSUFFICIENT_QUOTA: &str = "Insufficient quota";
pub const DOWNLOAD_READY: &str = "DOWNLOAD_READY";
pub const INVALID_UPLOAD_SIZE: &str = "Invalid file size provided by client. Aborting upload.";
pub const DOWNLOAD_NOT_FOUND: &str = "File does not exist or is a directory.";

/// Authentication-phase action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAction {
    /// Log into an existing account.
    Login,
    /// Create a new account and log into it.
    Register,
}

impl AuthAction {
    /// The wire verb for this action.
    pub fn as_str(self) -> &'static str {
        match self {
            AuthAction::Login => "login",
            AuthAction::Register => "register",
        }
    }
}

/// A `login`/`register` request.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub action: AuthAction,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthRequest")
            .field("action", &self.action)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl AuthRequest {
    /// Parse an authentication-phase request.
    ///
    /// Exactly three whitespace-separated tokens are required and the action
    /// must be `login` or `register`.
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let [action, username, password] = parts.as_slice() else {
            return Err(ProtocolError::MalformedAuth);
        };

        let action = match *action {
            "login" => AuthAction::Login,
            "register" => AuthAction::Register,
            _ => return Err(ProtocolError::MalformedAuth),
        };

        Ok(Self {
            action,
            username: (*username).to_string(),
            password: (*password).to_string(),
        })
    }

    /// Render the request as it is sent on the wire.
    pub fn to_line(&self) -> String {
        format!("{} {} {}", self.action.as_str(), self.username, self.password)
    }
}

/// An authenticated-phase command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Pwd,
    List { path: Option<String> },
    MakeDir { path: String },
    RemoveDir { path: String },
    RemoveFile { path: String },
    Rename { from: String, to: String },
    Copy { from: String, to: String },
    Upload { path: String },
    Download { path: String },
    Exit,
    Stop,
}

impl Command {
    /// Parse an authenticated-phase request.
    ///
    /// The verb is case-insensitive. Extra trailing arguments are ignored.
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let verb = parts
            .next()
            .ok_or(ProtocolError::EmptyRequest)?
            .to_lowercase();
        let args: Vec<String> = parts.map(str::to_string).collect();

        let one = |usage: String| -> Result<String> {
            args.first().cloned().ok_or(ProtocolError::Usage(usage))
        };
        let two = |verb: &str| -> Result<(String, String)> {
            match args.as_slice() {
                [from, to, ..] => Ok((from.clone(), to.clone())),
                _ => Err(ProtocolError::Usage(format!(
                    "Usage: {verb} <source> <destination>"
                ))),
            }
        };

        let command = match verb.as_str() {
            "pwd" => Command::Pwd,
            "ls" => Command::List {
                path: args.first().cloned(),
            },
            "mkdir" => Command::MakeDir {
                path: one(arguments_usage("mkdir"))?,
            },
            "rmdir" => Command::RemoveDir {
                path: one(arguments_usage("rmdir"))?,
            },
            "rmfile" => Command::RemoveFile {
                path: one(arguments_usage("rmfile"))?,
            },
            "rename" => {
                let (from, to) = two("rename")?;
                Command::Rename { from, to }
            }
            "copy" => {
                let (from, to) = two("copy")?;
                Command::Copy { from, to }
            }
            "upload" => Command::Upload {
                path: one("Usage: upload <filename>".to_string())?,
            },
            "download" => Command::Download {
                path: one("Usage: download <filename>".to_string())?,
            },
            "exit" => Command::Exit,
            "stop" => Command::Stop,
            _ => return Err(ProtocolError::UnknownVerb(verb)),
        };

        Ok(command)
    }

    /// The lowercase wire verb.
    pub fn verb(&self) -> &'static str {
        match self {
            Command::Pwd => "pwd",
            Command::List { .. } => "ls",
            Command::MakeDir { .. } => "mkdir",
            Command::RemoveDir { .. } => "rmdir",
            Command::RemoveFile { .. } => "rmfile",
            Command::Rename { .. } => "rename",
            Command::Copy { .. } => "copy",
            Command::Upload { .. } => "upload",
            Command::Download { .. } => "download",
            Command::Exit => "exit",
            Command::Stop => "stop",
        }
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Command::parse(s)
    }
}

fn arguments_usage(verb: &str) -> String {
    format!("Usage: {verb} <argument(s)>")
}

/// Parse the size line a client sends after `READY_FOR_UPLOAD_SIZE`.
pub fn parse_upload_size(line: &str) -> Result<u64> {
    let trimmed = line.trim();
    trimmed
        .parse::<u64>()
        .map_err(|_| ProtocolError::InvalidSize(trimmed.to_string()))
}

/// Build the `DOWNLOAD_READY <size>` header.
pub fn download_ready(size: u64) -> String {
    format!("{DOWNLOAD_READY} {size}")
}

/// Parse a `DOWNLOAD_READY <size>` header.
///
/// Any other line is returned as [`ProtocolError::Rejected`] so the caller
/// can show the server's explanation.
pub fn parse_download_ready(line: &str) -> Result<u64> {
    let mut parts = line.split_whitespace();
    if parts.next() != Some(DOWNLOAD_READY) {
        return Err(ProtocolError::Rejected(line.to_string()));
    }
    let size = parts
        .next()
        .ok_or_else(|| ProtocolError::UnexpectedResponse(line.to_string()))?;
    size.parse::<u64>()
        .map_err(|_| ProtocolError::InvalidSize(size.to_string()))
}
