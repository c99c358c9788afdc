//! # scgi-core
//!
//! Core types and traits for the SCGI prefork dispatcher.
//!
//! This crate holds no process or socket management. Everything that
//! forks, polls or passes descriptors lives in `scgi-prefork`.
//!
//! ## Modules
//!
//! - `error` - Error taxonomy shared by parent and workers
//! - `state` - Parent-side worker readiness state
//! - `handler` - Connection handler contract (application callback)
//! - `request` - SCGI header block reader (worker side)
//! - `kprint` - Kernel-style stderr logging macros
//! - `env` - Environment variable utilities

pub mod error;
pub mod state;
pub mod handler;
pub mod request;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use error::{HeaderError, Result, ScgiError};
pub use state::WorkerState;
pub use handler::ConnectionHandler;
pub use request::RequestEnv;
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str};

/// Wire constants for the private parent/worker control protocol.
pub mod protocol {
    /// Byte a worker writes when it can take a connection.
    pub const READY_MARKER: u8 = b'1';

    /// Payload byte carried alongside an `SCM_RIGHTS` handoff.
    pub const HANDOFF_BYTE: u8 = b'\0';
}
