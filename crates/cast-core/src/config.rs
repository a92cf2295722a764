//! cast.toml agent configuration.
//!
//! Every field has a default so an empty file (or no file at all) yields a
//! working agent rooted at `/var/lib/cast`. Derived directories can be
//! overridden one by one; otherwise they hang off `data_root` using the
//! on-disk layout other cast tooling expects.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Hook timeout used when a hook has no entry in `[hooks.timeouts]`.
pub const DEFAULT_HOOK_TIMEOUT_SECS: u64 = 50;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub data_root: PathBuf,
    pub ca_dir: Option<PathBuf>,
    pub extracted_dir: Option<PathBuf>,
    pub app_dir: Option<PathBuf>,
    pub bundle_dir: Option<PathBuf>,
    pub service_dir_available: Option<PathBuf>,
    pub service_dir_enabled: Option<PathBuf>,
    pub tmp_dir: Option<PathBuf>,
    pub node_binary: String,
    pub hooks: HooksConfig,
    pub certgen: CertgenConfig,
    pub runit: RunitConfig,
    pub services: ServicesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    /// Per-hook timeouts in seconds.
    pub timeouts: HashMap<String, u64>,
    pub default_timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertgenConfig {
    pub openssl_binary: String,
    pub days: u32,
    pub key_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunitConfig {
    pub service_user: Option<String>,
    pub log_directory: String,
    pub max_log_size: u64,
    pub max_log_num: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub manager: ServiceManagerKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServiceManagerKind {
    #[default]
    Runit,
    Mock,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/var/lib/cast"),
            ca_dir: None,
            extracted_dir: None,
            app_dir: None,
            bundle_dir: None,
            service_dir_available: None,
            service_dir_enabled: None,
            tmp_dir: None,
            node_binary: "node".to_string(),
            hooks: HooksConfig::default(),
            certgen: CertgenConfig::default(),
            runit: RunitConfig::default(),
            services: ServicesConfig::default(),
        }
    }
}

impl Default for HooksConfig {
    fn default() -> Self {
        let timeouts = [
            "pre_prepare",
            "post_prepare",
            "pre_version_activate",
            "post_version_activate",
        ]
        .into_iter()
        .map(|hook| (hook.to_string(), DEFAULT_HOOK_TIMEOUT_SECS))
        .collect();

        Self {
            timeouts,
            default_timeout: DEFAULT_HOOK_TIMEOUT_SECS,
        }
    }
}

impl HooksConfig {
    pub fn timeout_for(&self, hook: &str) -> Duration {
        let secs = self
            .timeouts
            .get(hook)
            .copied()
            .unwrap_or(self.default_timeout);
        Duration::from_secs(secs)
    }
}

impl Default for CertgenConfig {
    fn default() -> Self {
        Self {
            openssl_binary: "openssl".to_string(),
            days: 3650,
            key_size: 2048,
        }
    }
}

impl Default for RunitConfig {
    fn default() -> Self {
        Self {
            service_user: None,
            log_directory: "main".to_string(),
            max_log_size: 10 * 1024 * 1024,
            max_log_num: 10,
        }
    }
}

impl AgentConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = ?path, data_root = ?config.data_root, "loaded agent config");
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// A config with every directory under `data_root`.
    pub fn with_data_root(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            ..Self::default()
        }
    }

    pub fn ca_dir(&self) -> PathBuf {
        self.derived(&self.ca_dir, "ca")
    }

    pub fn extracted_dir(&self) -> PathBuf {
        self.derived(&self.extracted_dir, "extracted")
    }

    pub fn app_dir(&self) -> PathBuf {
        self.derived(&self.app_dir, "applications")
    }

    pub fn bundle_dir(&self) -> PathBuf {
        self.derived(&self.bundle_dir, "bundles")
    }

    pub fn service_dir_available(&self) -> PathBuf {
        self.service_dir_available
            .clone()
            .unwrap_or_else(|| self.data_root.join("services").join("available"))
    }

    pub fn service_dir_enabled(&self) -> PathBuf {
        self.service_dir_enabled
            .clone()
            .unwrap_or_else(|| self.data_root.join("services").join("enabled"))
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.derived(&self.tmp_dir, "tmp")
    }

    fn derived(&self, explicit: &Option<PathBuf>, name: &str) -> PathBuf {
        explicit.clone().unwrap_or_else(|| self.data_root.join(name))
    }
}
