//! Compile-time defaults for `ServerConfig`.
//!
//! Every value here can be overridden at runtime through the matching
//! `SCGI_*` environment variable (see `ServerConfig::from_env`).

/// TCP port the accept loop listens on.
pub const PORT: u16 = 4000;

/// Address the listener binds to.
pub const BIND_ADDR: &str = "0.0.0.0";

/// Maximum number of worker processes in the pool.
pub const MAX_WORKERS: usize = 10;

/// listen(2) backlog. Connections queue here while every worker is busy.
pub const BACKLOG: i32 = 256;

/// Poll timeout between dispatcher recovery passes.
pub const RETRY_INTERVAL_MS: u64 = 2000;

/// Upper bound accepted by `ServerConfig::validate` for `max_workers`.
pub const MAX_WORKERS_LIMIT: usize = 4096;
