use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::fs;

/// Top-level configuration for the session core.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        cfg.ensure_valid()?;
        Ok(cfg)
    }

    /// Ensure configuration correctness.
    pub fn ensure_valid(&self) -> Result<()> {
        if self.session.response_queue_size == 0 {
            bail!("session.response_queue_size must be at least 1");
        }
        if self.session.drain_deadline_ms == 0 {
            bail!("session.drain_deadline_ms must be positive");
        }
        Ok(())
    }
}

/// Knobs of the backend connection pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle connections kept per backend.
    pub max_idle: usize,
    /// Dial timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Run the READONLY handshake on every fresh connection, enabling
    /// reads against replicas.
    pub send_readonly: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 16,
            connect_timeout_ms: 1_000,
            send_readonly: false,
        }
    }
}

impl PoolConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Per-session behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Capacity of the bounded response channel between the dispatcher
    /// side and the session's writer.
    pub response_queue_size: usize,
    /// Upper bound on waiting for in-flight requests during teardown.
    pub drain_deadline_ms: u64,
    /// Emit one access-log line every this many commands; 0 disables
    /// sampling entirely.
    pub access_log_every: u64,
    /// Command names rejected in addition to the built-in deny-set.
    pub blacklist: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            response_queue_size: 1024,
            drain_deadline_ms: 30_000,
            access_log_every: 1_000,
            blacklist: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().ensure_valid().expect("defaults valid");
    }

    #[test]
    fn parses_partial_toml() {
        let cfg: Config = toml::from_str(
            r#"
            [pool]
            max_idle = 4
            send_readonly = true

            [session]
            blacklist = ["georadius"]
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.pool.max_idle, 4);
        assert!(cfg.pool.send_readonly);
        assert_eq!(cfg.pool.connect_timeout_ms, 1_000);
        assert_eq!(cfg.session.response_queue_size, 1024);
        assert_eq!(cfg.session.blacklist, vec!["georadius".to_string()]);
    }

    #[test]
    fn rejects_zero_response_queue() {
        let cfg: Config = toml::from_str(
            r#"
            [session]
            response_queue_size = 0
            "#,
        )
        .expect("parse");
        assert!(cfg.ensure_valid().is_err());
    }
}
