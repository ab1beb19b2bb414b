use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::storage::{StorageError, read_bounded, write_atomic_with_retry};

pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8080/ws";
pub const DEFAULT_ORIGIN: &str = "http://127.0.0.1:8080";
pub const CONFIG_DIR_ENV: &str = "MAGICDROP_CONFIG_DIR";

const MAX_SERVER_URL_LEN: usize = 2048;
const MAX_ORIGIN_LEN: usize = 2048;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Please fix the following:\n\n- {}", .0.join("\n- "))]
    Invalid(Vec<String>),
    #[error("failed to access config file {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: StorageError,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub server_url: String,
    /// Base of the pairing link shown to the mobile side.
    pub origin: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_owned(),
            origin: DEFAULT_ORIGIN.to_owned(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        let server_url = self.server_url.trim();
        if server_url.is_empty() {
            errors.push("Server URL is required.".to_owned());
        } else if server_url.len() > MAX_SERVER_URL_LEN {
            errors.push(format!(
                "Server URL is too long ({} > {} chars).",
                server_url.len(),
                MAX_SERVER_URL_LEN
            ));
        } else {
            match Url::parse(server_url) {
                Ok(url) if url.scheme() == "ws" || url.scheme() == "wss" => {}
                Ok(_) => errors.push(
                    "Server URL must start with ws:// or wss:// (WebSocket).".to_owned(),
                ),
                Err(err) => errors.push(format!("Server URL is invalid: {err}")),
            }
        }

        let origin = self.origin.trim();
        if origin.is_empty() {
            errors.push("Origin is required.".to_owned());
        } else if origin.len() > MAX_ORIGIN_LEN {
            errors.push(format!(
                "Origin is too long ({} > {} chars).",
                origin.len(),
                MAX_ORIGIN_LEN
            ));
        } else {
            match Url::parse(origin) {
                Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
                Ok(_) => errors.push("Origin must start with http:// or https://.".to_owned()),
                Err(err) => errors.push(format!("Origin is invalid: {err}")),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    pub fn origin_url(&self) -> Result<Url, ConfigError> {
        Url::parse(self.origin.trim())
            .map_err(|err| ConfigError::Invalid(vec![format!("Origin is invalid: {err}")]))
    }
}

/// Directory holding config, storage and logs.
///
/// `MAGICDROP_CONFIG_DIR` wins; otherwise the platform's local data dir.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
        return PathBuf::from(dir);
    }

    let base = std::env::var_os("LOCALAPPDATA")
        .or_else(|| std::env::var_os("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local").join("share"))
        })
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("MagicDrop")
}

pub fn config_path(dir: &Path) -> PathBuf {
    dir.join("config.json")
}

pub fn storage_path(dir: &Path) -> PathBuf {
    dir.join("storage.json")
}

pub fn log_path(dir: &Path) -> PathBuf {
    dir.join("logs").join("magicdrop-client.log")
}

pub fn load_config(path: &Path) -> Result<Option<ClientConfig>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }

    let data = read_bounded(path).map_err(|source| ConfigError::Storage {
        path: path.to_owned(),
        source,
    })?;
    let cfg: ClientConfig = serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })?;
    cfg.validate()?;
    Ok(Some(cfg))
}

pub fn save_config(path: &Path, cfg: &ClientConfig) -> Result<(), ConfigError> {
    cfg.validate()?;
    let payload = serde_json::to_vec_pretty(cfg).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })?;
    write_atomic_with_retry(path, &payload).map_err(|source| ConfigError::Storage {
        path: path.to_owned(),
        source,
    })
}

/// Saved config with command-line overrides applied.
///
/// Overrides are validated and then saved for the next run. An unreadable
/// saved config is replaced by defaults.
pub fn resolve_config(
    dir: &Path,
    server_url: Option<&str>,
    origin: Option<&str>,
) -> Result<ClientConfig, ConfigError> {
    let path = config_path(dir);
    let mut cfg = match load_config(&path) {
        Ok(Some(cfg)) => cfg,
        Ok(None) => ClientConfig::default(),
        Err(err) => {
            warn!("saved config invalid, using defaults: {}", err);
            ClientConfig::default()
        }
    };

    let overridden = server_url.is_some() || origin.is_some();
    if let Some(server_url) = server_url {
        cfg.server_url = server_url.trim().to_owned();
    }
    if let Some(origin) = origin {
        cfg.origin = origin.trim().to_owned();
    }
    cfg.validate()?;

    if overridden && let Err(err) = save_config(&path, &cfg) {
        warn!("failed to save config: {}", err);
    }
    Ok(cfg)
}
