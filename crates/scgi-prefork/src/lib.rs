//! # scgi-prefork
//!
//! Prefork front end for SCGI: a single-threaded parent accepts TCP
//! connections and hands each one, as a raw descriptor, to exactly one
//! worker process that has announced it is idle.
//!
//! ```text
//!  accept ──► Dispatcher ──poll──► first ready worker ──SCM_RIGHTS──► worker
//!                 │                                                   │
//!                 └── reap / spawn when nobody is ready ◄── '1' ──────┘
//! ```
//!
//! ## Modules
//!
//! - `config` - Listener and pool configuration
//! - `channel` - Control channel: ready markers and descriptor handoff
//! - `pool` - Worker spawning, tracking and reaping
//! - `dispatcher` - Readiness polling and connection delegation
//! - `listener` - Bind, accept loop and graceful restart
//! - `runtime` - Worker-side serve loop
//! - `signal` - SIGHUP restart flag

pub mod config;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub mod channel;
        pub mod pool;
        pub mod dispatcher;
        pub mod listener;
        pub mod runtime;
        pub mod signal;

        #[cfg(test)]
        mod test_support;

        pub use channel::{ControlChannel, Readiness};
        pub use dispatcher::Dispatcher;
        pub use listener::{bind_listener, Server, StepOutcome};
        pub use pool::{Worker, WorkerPool};
        pub use signal::{request_restart, RestartSignal};
        pub use nix::unistd::Pid;
    } else {
        compile_error!("scgi-prefork requires a Unix platform");
    }
}

pub use config::{ConfigError, ServerConfig};
