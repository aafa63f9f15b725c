//! # Lockbox Daemon Library
//!
//! This crate provides the server side of Lockbox, a multi-user file
//! storage service spoken over a plain-text TCP protocol.
//!
//! ## Overview
//!
//! - **Accounts**: registry of users with credentials and upload quota,
//!   persisted as a versioned JSON document
//! - **Sessions**: one task per connection, from `login`/`register` to
//!   `exit`
//! - **Files**: per-user confinement root, directory commands and chunked
//!   transfers
//! - **Server**: acceptor loop and graceful shutdown
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                         Server                            │
//! │   accept loop ──spawn──▶ SessionHandler (one per client)  │
//! ├───────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐   ┌──────────────┐   ┌───────────────┐  │
//! │  │  PathGuard   │   │   Command    │   │   Transfer    │  │
//! │  │ (confinement)│◀──│  Dispatcher  │   │ upload/dnload │  │
//! │  └──────────────┘   └──────────────┘   └───────┬───────┘  │
//! │                                                │          │
//! │  ┌─────────────────────────────────────────────▼───────┐  │
//! │  │     QuotaLedger ──▶ AccountRegistry ──▶ users.json  │  │
//! │  └─────────────────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use daemon::server::{Server, ServerContext, ServerOptions};
//! use daemon::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let context = Arc::new(ServerContext::from_config(&config)?);
//!
//!     let server = Server::bind(
//!         config.listen_addr(),
//!         context,
//!         ServerOptions::from_config(&config),
//!     )
//!     .await?;
//!
//!     // Runs until an admin sends `stop` and every session has ended.
//!     server.run().await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`accounts`]: Account registry, credentials and quota ledger
//! - [`config`]: Configuration loading and defaults
//! - [`files`]: Path confinement, directory commands and transfers
//! - [`logging`]: Console and per-target file logging
//! - [`server`]: Acceptor and shutdown coordinator
//! - [`session`]: Per-connection state machine and error taxonomy

pub mod accounts;
pub mod config;
pub mod files;
pub mod logging;
pub mod server;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::Config;

// Re-export account types for convenience
pub use accounts::{AccountRegistry, AccountSummary, QuotaLedger, RegistryError};

// Re-export server types for convenience
pub use server::{Server, ServerContext, ServerOptions, ShutdownCoordinator};

// Re-export session types for convenience
pub use session::{SessionError, SessionHandler};
