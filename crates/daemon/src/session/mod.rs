//! Client sessions.
//!
//! A session owns one connection. It starts unauthenticated, moves to the
//! authenticated state after `login`/`register`, and ends on `exit`, a
//! privileged `stop`, a socket fault or peer disconnect. Errors are mapped
//! to [`SessionError`], which decides whether the session survives them.

pub mod error;
pub mod handler;

pub use error::SessionError;
pub use handler::{SessionHandler, SessionState, MISSING_USER_ROOT};
