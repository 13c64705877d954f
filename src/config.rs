use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

/// Names the YAML file [`Config::load`] reads.
pub const CONFIG_ENV: &str = "SWERVE_CONFIG";
/// Overrides `server.port`.
pub const PORT_ENV: &str = "PORT";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    /// Switches every connection to TLS when present.
    pub tls: Option<TlsConfig>,
    pub static_files: Option<StaticFilesConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub idle_timeout_secs: u64,
    pub write_drain_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            idle_timeout_secs: 60,
            write_drain_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticFilesConfig {
    pub local_path: PathBuf,
    pub web_path: String,
}

impl Config {
    /// Reads the file named by `SWERVE_CONFIG` (defaults when unset), then
    /// applies `PORT`.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var(CONFIG_ENV).ok();
        let port = std::env::var(PORT_ENV).ok();
        Self::resolve(path.as_deref(), port.as_deref())
    }

    /// [`load`](Self::load) with the environment passed in.
    pub fn resolve(path: Option<&str>, port: Option<&str>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Some(port) = port {
            config.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("{PORT_ENV}={port:?} is not a port number"))?;
        }

        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(text).context("invalid YAML configuration")
    }
}
