use crate::error::{AppError, AppResult};
use crate::transport::KnownHostsPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub ssh: SshSettings,
}

/// Keepalive, reconnect and timeout knobs. All durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Idle time before a keepalive probe is sent; 0 disables probing.
    #[serde(default = "default_keepalive", alias = "keepAliveInterval")]
    pub keep_alive_interval_ms: u64,
    #[serde(default = "default_reconnect_attempts", alias = "reconnectAttempts")]
    pub reconnect_attempts: u32,
    /// Base delay between reconnect attempts, doubled per attempt.
    #[serde(default = "default_reconnect_delay", alias = "reconnectDelay")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_max_reconnect_delay")]
    pub max_reconnect_delay_ms: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
}

fn default_keepalive() -> u64 {
    20_000
}

fn default_reconnect_attempts() -> u32 {
    3
}

fn default_reconnect_delay() -> u64 {
    1_000
}

fn default_max_reconnect_delay() -> u64 {
    30_000
}

fn default_handshake_timeout() -> u64 {
    30_000
}

fn default_probe_timeout() -> u64 {
    10_000
}

fn default_shutdown_timeout() -> u64 {
    5_000
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            keep_alive_interval_ms: default_keepalive(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay(),
            max_reconnect_delay_ms: default_max_reconnect_delay(),
            handshake_timeout_ms: default_handshake_timeout(),
            probe_timeout_ms: default_probe_timeout(),
            shutdown_timeout_ms: default_shutdown_timeout(),
        }
    }
}

impl SessionSettings {
    /// Apply per-connection overrides on top of the global settings.
    pub fn with_overrides(&self, options: &ConnectionOptions) -> Self {
        let mut merged = self.clone();
        if let Some(interval) = options.keep_alive_interval_ms {
            merged.keep_alive_interval_ms = interval;
        }
        if let Some(attempts) = options.reconnect_attempts {
            merged.reconnect_attempts = attempts;
        }
        if let Some(delay) = options.reconnect_delay_ms {
            merged.reconnect_delay_ms = delay;
        }
        merged
    }

    pub fn keep_alive_interval(&self) -> Option<Duration> {
        match self.keep_alive_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Timeouts must be positive; libssh2 reads a zero timeout as "wait forever".
    pub fn validate(&self) -> AppResult<()> {
        for (name, value) in [
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("shutdown_timeout_ms", self.shutdown_timeout_ms),
        ] {
            if value == 0 {
                return Err(AppError::Config(format!("{} must be greater than 0", name)));
            }
        }
        Ok(())
    }
}

/// Per-connection overrides carried by a connect request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    #[serde(default, alias = "keepAliveInterval")]
    pub keep_alive_interval_ms: Option<u64>,
    #[serde(default, alias = "reconnectAttempts")]
    pub reconnect_attempts: Option<u32>,
    #[serde(default, alias = "reconnectDelay")]
    pub reconnect_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    #[serde(default = "default_port")]
    pub default_port: u16,
    #[serde(default)]
    pub known_hosts_policy: KnownHostsPolicy,
}

pub fn default_port() -> u16 {
    22
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            default_port: default_port(),
            known_hosts_policy: KnownHostsPolicy::default(),
        }
    }
}

impl AppSettings {
    pub fn validate(&self) -> AppResult<()> {
        self.session.validate()?;
        if self.ssh.default_port == 0 {
            return Err(AppError::Config("default_port must be greater than 0".to_string()));
        }
        Ok(())
    }

    pub fn load(config_dir: &Path) -> AppResult<Self> {
        let config_path = config_dir.join("config.toml");
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let settings: AppSettings = toml::from_str(&content)?;
            settings.validate()?;
            Ok(settings)
        } else {
            let settings = AppSettings::default();
            settings.save(config_dir)?;
            Ok(settings)
        }
    }

    pub fn save(&self, config_dir: &Path) -> AppResult<()> {
        self.validate()?;
        std::fs::create_dir_all(config_dir)?;
        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }
}
