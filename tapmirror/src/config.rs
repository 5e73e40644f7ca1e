//! Configuration for tapmirror.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
}

/// Directories holding the durable registries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub operations_dir: PathBuf,
    pub nbd_client_dir: PathBuf,
    pub nbd_tool_dir: PathBuf,
    pub tapdisk_dir: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::rooted_at(Path::new("/var/run/nonpersistent"))
    }
}

impl RegistryConfig {
    /// All registries rooted under a single directory.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            operations_dir: root.join("dp-mirror"),
            nbd_client_dir: root.join("persist-nbdclient"),
            nbd_tool_dir: root.join("persist-nbdtool"),
            tapdisk_dir: root.join("dp-tapdisk"),
        }
    }
}

/// External binaries and the device directory they operate on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub nbd_client: PathBuf,
    pub nbd_tool: PathBuf,
    pub tap_ctl: PathBuf,
    pub dev_dir: PathBuf,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            nbd_client: PathBuf::from("nbd-client"),
            nbd_tool: PathBuf::from("/usr/bin/nbd-tool"),
            tap_ctl: PathBuf::from("tap-ctl"),
            dev_dir: PathBuf::from("/dev"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// First port handed to mirror processes.
    pub port_base: u16,
    /// Number of ports reserved for mirror processes.
    pub port_count: u16,
    pub ready_timeout_ms: u64,
    pub ready_poll_ms: u64,
    /// Host the local NBD client connects to when fronting a mirror.
    pub client_host: String,
    /// Export name the local NBD client requests from the mirror.
    pub client_export: String,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            port_base: 10809,
            port_count: 100,
            ready_timeout_ms: 5000,
            ready_poll_ms: 100,
            client_host: "localhost".to_string(),
            client_export: "noname".to_string(),
        }
    }
}

impl MirrorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port_count == 0 {
            return Err(ConfigError::InvalidValue {
                field: "mirror.port_count",
                reason: "must be > 0",
            });
        }
        if u32::from(self.port_base) + u32::from(self.port_count) > u32::from(u16::MAX) + 1 {
            return Err(ConfigError::InvalidValue {
                field: "mirror.port_count",
                reason: "port range overflows u16",
            });
        }
        if self.ready_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "mirror.ready_timeout_ms",
                reason: "must be > 0",
            });
        }
        if self.ready_poll_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "mirror.ready_poll_ms",
                reason: "must be > 0",
            });
        }
        Ok(())
    }

    /// Inclusive port range reserved for mirror processes. Empty when no
    /// ports are reserved.
    pub fn ports(&self) -> std::ops::RangeInclusive<u16> {
        let Some(span) = self.port_count.checked_sub(1) else {
            return 1..=0;
        };
        let last = u32::from(self.port_base) + u32::from(span);
        self.port_base..=last.min(u32::from(u16::MAX)) as u16
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn ready_poll(&self) -> Duration {
        Duration::from_millis(self.ready_poll_ms)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mirror.validate()
    }
}
