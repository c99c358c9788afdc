//! Server Configuration
//!
//! Provides compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls (e.g. positional CLI arguments)
//! 2. Environment variables (`from_env`)
//! 3. Library defaults (`defaults`)
//!
//! # Example
//!
//! ```rust,ignore
//! use scgi_prefork::config::ServerConfig;
//!
//! let config = ServerConfig::from_env()
//!     .port(7777)
//!     .max_workers(4);
//! config.validate()?;
//! ```

pub mod defaults;

use scgi_core::env::{env_get, env_get_str};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Listener and pool configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port to listen on
    pub port: u16,
    /// Address to bind (IPv4 or IPv6)
    pub bind_addr: IpAddr,
    /// Maximum worker processes
    pub max_workers: usize,
    /// listen(2) backlog
    pub backlog: i32,
    /// Dispatcher poll timeout after the first (zero-timeout) pass
    pub retry_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ServerConfig {
    /// Create config from compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `SCGI_PORT` - Listening port
    /// - `SCGI_BIND_ADDR` - Bind address
    /// - `SCGI_MAX_WORKERS` - Worker pool capacity
    /// - `SCGI_BACKLOG` - listen(2) backlog
    /// - `SCGI_RETRY_INTERVAL_MS` - Dispatcher retry poll interval
    ///
    /// An unparsable value falls back to the default for that field.
    pub fn from_env() -> Self {
        let default_addr = Self::default_bind_addr();
        Self {
            port: env_get("SCGI_PORT", defaults::PORT),
            bind_addr: env_get_str("SCGI_BIND_ADDR", defaults::BIND_ADDR)
                .parse()
                .unwrap_or(default_addr),
            max_workers: env_get("SCGI_MAX_WORKERS", defaults::MAX_WORKERS),
            backlog: env_get("SCGI_BACKLOG", defaults::BACKLOG),
            retry_interval: Duration::from_millis(env_get(
                "SCGI_RETRY_INTERVAL_MS",
                defaults::RETRY_INTERVAL_MS,
            )),
        }
    }

    /// Create config with explicit defaults (no env override).
    /// Useful for testing or when you want full control.
    pub fn new() -> Self {
        Self {
            port: defaults::PORT,
            bind_addr: Self::default_bind_addr(),
            max_workers: defaults::MAX_WORKERS,
            backlog: defaults::BACKLOG,
            retry_interval: Duration::from_millis(defaults::RETRY_INTERVAL_MS),
        }
    }

    fn default_bind_addr() -> IpAddr {
        defaults::BIND_ADDR
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    // Builder methods

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn max_workers(mut self, n: usize) -> Self {
        self.max_workers = n;
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn retry_interval(mut self, d: Duration) -> Self {
        self.retry_interval = d;
        self
    }

    /// Socket address the listener binds.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::InvalidValue("max_workers must be > 0"));
        }
        if self.max_workers > defaults::MAX_WORKERS_LIMIT {
            return Err(ConfigError::InvalidValue("max_workers must be <= 4096"));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::InvalidValue("backlog must be > 0"));
        }
        if self.retry_interval.is_zero() {
            return Err(ConfigError::InvalidValue("retry_interval must be non-zero"));
        }
        if self.retry_interval > Duration::from_millis(u16::MAX as u64) {
            return Err(ConfigError::InvalidValue("retry_interval must be <= 65535ms"));
        }
        Ok(())
    }

    /// Print configuration (for startup logs)
    pub fn print(&self) {
        eprintln!("SCGI Prefork Configuration:");
        eprintln!("  listen_addr:     {}", self.listen_addr());
        eprintln!("  max_workers:     {}", self.max_workers);
        eprintln!("  backlog:         {}", self.backlog);
        eprintln!("  retry_interval:  {:?}", self.retry_interval);
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for scgi_core::ScgiError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::InvalidValue(msg) => scgi_core::ScgiError::Config(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::new();
        assert_eq!(config.port, 4000);
        assert_eq!(config.max_workers, 10);
        assert_eq!(config.backlog, 256);
        assert_eq!(config.retry_interval, Duration::from_secs(2));
        assert_eq!(config.listen_addr().to_string(), "0.0.0.0:4000");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = ServerConfig::new()
            .port(7777)
            .max_workers(3)
            .bind_addr(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .retry_interval(Duration::from_millis(50));

        assert_eq!(config.listen_addr().to_string(), "127.0.0.1:7777");
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.retry_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_validation() {
        assert!(ServerConfig::new().max_workers(0).validate().is_err());
        assert!(ServerConfig::new().max_workers(100_000).validate().is_err());
        assert!(ServerConfig::new().backlog(0).validate().is_err());
        assert!(ServerConfig::new().retry_interval(Duration::ZERO).validate().is_err());
        assert!(ServerConfig::new()
            .retry_interval(Duration::from_secs(120))
            .validate()
            .is_err());
    }

    #[test]
    fn test_config_error_converts() {
        let err: scgi_core::ScgiError = ConfigError::InvalidValue("backlog must be > 0").into();
        assert!(matches!(err, scgi_core::ScgiError::Config("backlog must be > 0")));
    }
}
