use crate::bus::Bus;
use crate::config::{known_hosts_path, AppSettings};
use crate::error::AppResult;
use crate::transport::{SshTransport, Transport};
use anyhow::Context;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Global application state
pub struct AppState {
    pub bus: Arc<Bus>,
    pub settings: Arc<RwLock<AppSettings>>,
    config_dir: PathBuf,
}

impl AppState {
    /// Load settings from `config_dir` and wire the bus to the ssh transport.
    pub fn new(config_dir: &Path) -> AppResult<Self> {
        std::fs::create_dir_all(config_dir)
            .with_context(|| format!("Failed to create config dir {:?}", config_dir))?;
        let settings = AppSettings::load(config_dir)?;
        let transport = SshTransport::new(
            known_hosts_path(config_dir),
            settings.ssh.known_hosts_policy,
        );
        Ok(Self::with_transport(config_dir, Arc::new(transport), settings))
    }

    pub fn with_transport(
        config_dir: &Path,
        transport: Arc<dyn Transport>,
        settings: AppSettings,
    ) -> Self {
        Self {
            bus: Arc::new(Bus::from_settings(transport, &settings)),
            settings: Arc::new(RwLock::new(settings)),
            config_dir: config_dir.to_path_buf(),
        }
    }

    /// Persist new settings. Session settings apply to connections opened
    /// from now on.
    pub fn save_settings(&self, settings: AppSettings) -> AppResult<()> {
        settings.save(&self.config_dir)?;
        self.bus.registry().update_settings(settings.session.clone());
        *self.settings.write() = settings;
        Ok(())
    }
}
