//! Configuration management for ShieldChain

use crate::consensus::{ConsensusParams, Network};
use crate::error::ChainError;
use crate::fork::default_snapshot_dir;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

pub const CONFIG_FILE_NAME: &str = "shieldchain.toml";

const DATABASE_FILE_NAME: &str = "chainstate.sqlite";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub fork: ForkConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    pub name: Network,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig { name: Network::Main }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            backend: StorageBackend::Sqlite,
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ForkConfig {
    /// Defaults to `<data_dir>/utxo_snapshot`.
    pub snapshot_dir: Option<PathBuf>,
    #[serde(default = "default_checkpoints")]
    pub checkpoints: bool,
}

impl Default for ForkConfig {
    fn default() -> Self {
        ForkConfig {
            snapshot_dir: None,
            checkpoints: default_checkpoints(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn from_toml_str(contents: &str) -> Result<Self, ChainError> {
        let config: Config = toml::from_str(contents).map_err(|e| ChainError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// In-memory regtest setup with no snapshot files, for tests and tools.
    pub fn regtest_in_memory() -> Self {
        Config {
            network: NetworkConfig { name: Network::Regtest },
            storage: StorageConfig {
                backend: StorageBackend::Memory,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ChainError> {
        if self.storage.backend == StorageBackend::Sqlite && self.storage.data_dir.as_os_str().is_empty() {
            return Err(ChainError::ConfigError(
                "storage.data_dir must be set for the sqlite backend".to_string(),
            ));
        }
        if let Some(dir) = &self.fork.snapshot_dir {
            if dir.as_os_str().is_empty() {
                return Err(ChainError::ConfigError("fork.snapshot_dir must not be empty".to_string()));
            }
        }
        EnvFilter::try_new(&self.logging.level)
            .map_err(|e| ChainError::ConfigError(format!("logging.level: {}", e)))?;
        Ok(())
    }

    pub fn consensus_params(&self) -> ConsensusParams {
        ConsensusParams::for_network(self.network.name)
    }

    pub fn database_path(&self) -> PathBuf {
        self.storage.data_dir.join(DATABASE_FILE_NAME)
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.fork
            .snapshot_dir
            .clone()
            .unwrap_or_else(|| default_snapshot_dir(&self.storage.data_dir))
    }
}

/// Loads `shieldchain.toml` from the working directory, falling back to
/// defaults when it is absent.
pub fn load_config() -> Result<Config, ChainError> {
    load_config_from(Path::new(CONFIG_FILE_NAME))
}

pub fn load_config_from(path: &Path) -> Result<Config, ChainError> {
    match fs::read_to_string(path) {
        Ok(contents) => Config::from_toml_str(&contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
        Err(e) => Err(ChainError::ConfigError(format!("{}: {}", path.display(), e))),
    }
}

/// Installs the global fmt subscriber. `RUST_LOG` overrides `level`.
///
/// Fails if a global subscriber is already set.
pub fn init_logging(level: &str) -> Result<(), ChainError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| ChainError::ConfigError(format!("Failed to install log subscriber: {}", e)))
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("shieldchain"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

fn default_checkpoints() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}
