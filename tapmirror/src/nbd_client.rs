//! NBD client device allocation.
//!
//! There is no way to atomically claim the next free `/dev/nbdN` (nothing like
//! `losetup -f`), and no way to ask the kernel which server a device is bound
//! to, so every binding this tool makes is recorded in its own registry and
//! the free set is computed as "device nodes present minus devices recorded".

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ToolsConfig;
use crate::error::{Error, Result};
use crate::host::Host;
use crate::record::{Record, RecordStore};

/// A local NBD device bound to a remote export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NbdClientBinding {
    pub remote_host: String,
    pub logical_name: String,
    /// Device node name, e.g. `nbd0`.
    pub device_id: String,
    pub remote_port: u16,
    pub created_at: DateTime<Utc>,
}

impl Record for NbdClientBinding {
    const REGISTRY: &'static str = "nbd-client";

    fn natural_id(&self) -> Option<String> {
        Some(self.device_id.clone())
    }
}

pub struct NbdClients {
    store: RecordStore<NbdClientBinding>,
    host: Arc<dyn Host>,
    program: PathBuf,
    dev_dir: PathBuf,
}

impl NbdClients {
    pub fn new(dir: impl Into<PathBuf>, host: Arc<dyn Host>, tools: &ToolsConfig) -> Self {
        Self {
            store: RecordStore::new(dir),
            host,
            program: tools.nbd_client.clone(),
            dev_dir: tools.dev_dir.clone(),
        }
    }

    pub fn store(&self) -> &RecordStore<NbdClientBinding> {
        &self.store
    }

    /// Path of the device node for `device_id`.
    pub fn device_path(&self, device_id: &str) -> PathBuf {
        self.dev_dir.join(device_id)
    }

    pub fn list(&self) -> Result<Vec<NbdClientBinding>> {
        self.store.load_all()
    }

    /// The binding serving export `name` on `port`.
    ///
    /// `host` does not take part in the match.
    pub fn find(&self, host: &str, name: &str, port: u16) -> Result<Option<NbdClientBinding>> {
        let found = self
            .store
            .find(|b| b.logical_name == name && b.remote_port == port)?;
        if let Some(binding) = &found
            && binding.remote_host != host
        {
            debug!(
                device = %binding.device_id,
                recorded = %binding.remote_host,
                requested = host,
                "reusing NBD binding recorded for a different host"
            );
        }
        Ok(found)
    }

    pub fn find_by_device(&self, device_id: &str) -> Result<NbdClientBinding> {
        self.store.load(device_id)
    }

    /// Return the binding for `(name, port)`, connecting a free device if
    /// there is none yet.
    pub async fn create(&self, host: &str, name: &str, port: u16) -> Result<NbdClientBinding> {
        let _lock = self.store.lock().await?;

        if let Some(existing) = self.find(host, name, port)? {
            debug!(device = %existing.device_id, name, port, "NBD binding already exists");
            return Ok(existing);
        }

        let used: BTreeSet<String> = self
            .store
            .load_all()?
            .into_iter()
            .map(|b| b.device_id)
            .collect();
        let present = self.host.nbd_devices()?;
        let Some(device_id) = present.difference(&used).next().cloned() else {
            return Err(Error::NoAvailableDevice { in_use: used.len() });
        };

        let device_path = self.device_path(&device_id);
        self.host
            .run(
                &self.program,
                &[
                    host.to_string(),
                    port.to_string(),
                    device_path.display().to_string(),
                    "-name".to_string(),
                    name.to_string(),
                ],
            )
            .await?;

        let mut binding = NbdClientBinding {
            remote_host: host.to_string(),
            logical_name: name.to_string(),
            device_id,
            remote_port: port,
            created_at: Utc::now(),
        };
        self.store.save(&mut binding)?;

        info!(
            device = %binding.device_id,
            host,
            port,
            name,
            "NBD device connected"
        );
        Ok(binding)
    }

    /// Disconnect the device, then forget the binding.
    pub async fn destroy(&self, binding: &NbdClientBinding) -> Result<()> {
        let device_path = self.device_path(&binding.device_id);
        self.disconnect(&device_path).await?;
        self.store.delete(&binding.device_id)?;
        info!(device = %binding.device_id, "NBD device disconnected");
        Ok(())
    }

    async fn disconnect(&self, device_path: &Path) -> Result<()> {
        self.host
            .run(
                &self.program,
                &["-d".to_string(), device_path.display().to_string()],
            )
            .await?;
        Ok(())
    }
}
