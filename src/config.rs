use std::{collections::BTreeMap, fs, path::Path};

use serde::Deserialize;

use crate::{FleetError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// checkpoint store config
    pub store: StoreConfig,
    /// http server config
    pub server: ServerConfig,
    /// local install config
    pub install: InstallConfig,
    /// network layout, only read by the coordinator
    pub fleet: FleetConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// path of the embedded store file
    pub path: String,
    /// upper bound of pooled connections
    pub max_connections: u32,
    /// how long `acquire` blocks on an exhausted pool, in milliseconds
    pub acquire_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServerMode {
    Coordinator,
    #[default]
    Follower,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub mode: ServerMode,
    /// port every follower serves its command endpoints on
    pub follower_port: u16,
    /// port the coordinator serves on, used by followers to answer back
    pub coordinator_port: u16,
    /// follower only: registers with this coordinator on startup
    pub coordinator_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstallMode {
    #[default]
    NewInstall,
    Update,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    /// where packages are unpacked and role scripts run
    pub install_path: String,
    /// coordinator only: role bundle and credential sources
    pub init_dir: String,
    pub mode: InstallMode,
    /// interval of the top-level finished-flag poll, in milliseconds
    pub finish_poll_interval_ms: u64,
    /// completion checks a run makes before it gives up waiting for reports
    pub completion_checks: u32,
    pub completion_check_interval_ms: u64,
    /// timeout of coordinator to follower commands, in milliseconds
    pub command_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub org_msp_id: String,
    pub peer_domain: String,
    pub orderer_domain: String,
    /// orderer host name -> "ip:port"
    pub orderers: BTreeMap<String, String>,
    /// peer host name -> "ip:port"
    pub peers: BTreeMap<String, String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "fleet-install.db".to_string(),
            max_connections: 32,
            acquire_timeout_ms: 5000,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            mode: ServerMode::default(),
            follower_port: 8080,
            coordinator_port: 8080,
            coordinator_url: None,
        }
    }
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            install_path: "install".to_string(),
            init_dir: "init".to_string(),
            mode: InstallMode::default(),
            finish_poll_interval_ms: 500,
            completion_checks: 10,
            completion_check_interval_ms: 10_000,
            command_timeout_ms: 30_000,
        }
    }
}

impl Config {
    pub fn create<T: AsRef<Path>>(path: T) -> Result<Self> {
        let data = fs::read_to_string(path.as_ref()).map_err(|err| FleetError::Config(format!("failed to load config file {:?}: {}", path.as_ref(), err)))?;

        Self::load_from_str(data.as_str())
    }

    pub fn load_from_str(toml_str: &str) -> Result<Self> {
        let config = toml::from_str::<Config>(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.store.max_connections == 0 {
            return Err(FleetError::Config("store.max_connections must be positive".to_string()));
        }
        if self.server.mode == ServerMode::Coordinator && self.fleet.org_msp_id.is_empty() {
            return Err(FleetError::Config("fleet.org_msp_id is required in coordinator mode".to_string()));
        }
        Ok(())
    }
}
