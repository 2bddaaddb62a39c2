//! Runtime configuration
//!
//! Settle delays and retry intervals are fixed heuristics rather than
//! completion signals; they live here so the CLI and tests can tune them.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Default port the server listens on
pub const DEFAULT_PORT: u16 = 5000;

/// Default world registry file
pub const DEFAULT_WORLDS_FILE: &str = "worlds.yaml";

/// Default time a registration may take before the challenge is abandoned
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(600);

/// Delays used by the watcher consumers and the applier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncTimings {
    /// Poll interval while a file is still held open by another writer
    pub retry_interval: Duration,
    /// Pause after creating a missing parent directory before writing into it
    pub parent_settle: Duration,
    /// Pause between receiving a local event and reading the file, so the
    /// writer has a chance to finish
    pub event_delay: Duration,
    /// How long a created, updated or deleted path stays suppressed after
    /// the mutation
    pub apply_settle: Duration,
    /// How long a moved path stays suppressed; moves can produce deferred
    /// notifications on some file systems
    pub move_settle: Duration,
}

impl Default for SyncTimings {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(50),
            parent_settle: Duration::from_millis(50),
            event_delay: Duration::from_millis(50),
            apply_settle: Duration::from_millis(500),
            move_settle: Duration::from_millis(1000),
        }
    }
}

impl SyncTimings {
    /// Short delays for tests and local loopback setups
    pub fn fast() -> Self {
        Self {
            retry_interval: Duration::from_millis(10),
            parent_settle: Duration::from_millis(5),
            event_delay: Duration::from_millis(5),
            apply_settle: Duration::from_millis(300),
            move_settle: Duration::from_millis(500),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to accept connections on
    pub listen: SocketAddr,
    /// Path of the world registry file
    pub worlds_file: PathBuf,
    /// Upper bound on a single registration wait
    pub auth_timeout: Duration,
    /// Applier / producer delays
    pub timings: SyncTimings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            worlds_file: PathBuf::from(DEFAULT_WORLDS_FILE),
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            timings: SyncTimings::default(),
        }
    }
}

impl ServerConfig {
    /// Build a config listening on `host:port`
    pub fn new(host: IpAddr, port: u16, worlds_file: impl Into<PathBuf>) -> Self {
        Self {
            listen: SocketAddr::new(host, port),
            worlds_file: worlds_file.into(),
            ..Self::default()
        }
    }

    /// Override the registration timeout
    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    /// Override the sync timings
    pub fn with_timings(mut self, timings: SyncTimings) -> Self {
        self.timings = timings;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.listen.port(), 5000);
        assert!(config.listen.ip().is_unspecified());
        assert_eq!(config.worlds_file, PathBuf::from("worlds.yaml"));
    }

    #[test]
    fn test_move_settles_longer_than_apply() {
        for timings in [SyncTimings::default(), SyncTimings::fast()] {
            assert!(timings.move_settle > timings.apply_settle);
        }
    }

    #[test]
    fn test_builder_overrides() {
        let config = ServerConfig::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7000, "w.yaml")
            .with_auth_timeout(Duration::from_secs(5))
            .with_timings(SyncTimings::fast());
        assert_eq!(config.listen.to_string(), "127.0.0.1:7000");
        assert_eq!(config.auth_timeout, Duration::from_secs(5));
        assert_eq!(config.timings, SyncTimings::fast());
    }
}
