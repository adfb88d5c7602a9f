//! Layered configuration for dmirror.
//!
//! Values are merged from, in increasing priority:
//!
//! 1. built-in defaults,
//! 2. a TOML file (`--config`, or `dmirror.toml` in the user config
//!    directory if it exists),
//! 3. `DMIRROR_`-prefixed environment variables, with `__` between nested
//!    keys (`DMIRROR_SERVER__PORT=4000`).
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 49737
//!
//! [storage]
//! database = "/var/lib/dmirror/mirror.db"
//!
//! [recovery]
//! strict = false
//!
//! [log]
//! level = "info"
//! ```

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use dmirror_store::Location;
use exn::{OptionExt, ResultExt};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "DMIRROR_";
const FILE_NAME: &str = "dmirror.toml";
const DATABASE_NAME: &str = "mirror.db";
/// `storage.database` value selecting a throwaway in-memory database.
pub const IN_MEMORY: &str = ":memory:";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub recovery: RecoveryConfig,
    pub log: LogConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    /// How long the startup probe waits for an existing service to answer.
    pub probe_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 49737,
            probe_timeout_ms: 500,
        }
    }
}

impl ServerConfig {
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file; defaults to the user data directory.
    pub database: Option<PathBuf>,
    pub namespace: String,
    pub version: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: None,
            namespace: "dhub-mirroring-service".to_string(),
            version: "v1".to_string(),
        }
    }
}

impl StorageConfig {
    /// Where the database lives. Does not create anything.
    pub fn location(&self) -> Result<Location> {
        match &self.database {
            Some(path) if path.as_os_str() == IN_MEMORY => Ok(Location::Memory),
            Some(path) => Ok(Location::File(path.clone())),
            None => {
                let dirs = project_dirs().ok_or_raise(|| ErrorKind::NoDataDirectory)?;
                Ok(Location::File(dirs.data_dir().join(DATABASE_NAME)))
            },
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Abort startup when any stored resource cannot be restored.
    pub strict: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing` filter directive used when `RUST_LOG` is not set.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "dmirror")
}

/// `dmirror.toml` in the user config directory.
pub fn default_file() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join(FILE_NAME))
}

impl Config {
    /// The merged sources, before extraction. A missing `file` is skipped.
    pub fn figment(file: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(file) = file {
            figment = figment.merge(Toml::file(file));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load from defaults, `file` (or the default file) and the environment.
    ///
    /// An explicitly given `file` must exist; the default file is optional.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let file = match file {
            Some(file) if !file.exists() => exn::bail!(ErrorKind::NotFound(file.to_path_buf())),
            Some(file) => Some(file.to_path_buf()),
            None => default_file().filter(|file| file.exists()),
        };
        if let Some(file) = &file {
            tracing::debug!(path = %file.display(), "Loading configuration file");
        }
        Self::from_figment(&Self::figment(file.as_deref()))
    }

    pub fn from_figment(figment: &Figment) -> Result<Self> {
        let config: Self = figment.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            exn::bail!(ErrorKind::Invalid("server.port must not be 0".to_string()));
        }
        for (name, value) in [("storage.namespace", &self.storage.namespace), ("storage.version", &self.storage.version)] {
            if value.is_empty() || value.contains('/') {
                exn::bail!(ErrorKind::Invalid(format!("{name} must be non-empty and must not contain '/'")));
            }
        }
        if self.log.level.trim().is_empty() {
            exn::bail!(ErrorKind::Invalid("log.level must not be empty".to_string()));
        }
        Ok(())
    }
}
