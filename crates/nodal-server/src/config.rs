use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use nodal_protocol::{
    ClientConfig, DEFAULT_BATCH_INTERVAL_MS, DEFAULT_DEBOUNCE_MS, DEFAULT_FLOOD_THRESHOLD_MS,
    DEFAULT_LOGIN_TIMEOUT_SECS, paths,
};

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Root under which each user gets a working directory.
    pub storage_dir: PathBuf,
    /// Advisory client-side debounce, advertised at login.
    pub debounce_ms: u64,
    pub batch_interval_ms: u64,
    pub flood_threshold_ms: u64,
    pub login_timeout_secs: u64,
    pub allow_origins: Vec<String>,
}

impl ServerConfig {
    /// Loads `path`, or the default config file if it exists, else defaults.
    ///
    /// An explicitly named file that is missing is an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (config_path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (paths::config_path(), false),
        };
        if !required && !config_path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read config {}", config_path.display()))?;
        Self::from_toml(&contents)
            .with_context(|| format!("invalid config {}", config_path.display()))
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            debounce: self.debounce_ms,
            batch_interval: self.batch_interval_ms,
        }
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms.max(1))
    }

    pub fn flood_threshold(&self) -> Duration {
        Duration::from_millis(self.flood_threshold_ms)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8000)),
            storage_dir: PathBuf::from("storage"),
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            batch_interval_ms: DEFAULT_BATCH_INTERVAL_MS,
            flood_threshold_ms: DEFAULT_FLOOD_THRESHOLD_MS,
            login_timeout_secs: DEFAULT_LOGIN_TIMEOUT_SECS,
            allow_origins: vec![
                "http://localhost:5173".to_string(),
                "http://localhost:3000".to_string(),
            ],
        }
    }
}
