//! Mirror process allocation.
//!
//! `nbd-tool mirror` serves NBD on a local port and duplicates every write it
//! receives onto a primary and a secondary target. Like NBD devices, ports
//! cannot be reserved through the OS ahead of the spawn, so the ports handed
//! out are tracked in this registry.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{MirrorConfig, ToolsConfig};
use crate::error::{Error, Result};
use crate::host::{Host, Termination};
use crate::log_cleanup_error;
use crate::record::{Record, RecordStore};

/// A running `nbd-tool mirror` process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorProcess {
    pub primary: String,
    pub secondary: String,
    pub process_id: u32,
    pub listen_port: u16,
    pub created_at: DateTime<Utc>,
}

impl Record for MirrorProcess {
    const REGISTRY: &'static str = "nbd-tool";

    fn natural_id(&self) -> Option<String> {
        Some(record_id(self.process_id))
    }
}

fn record_id(pid: u32) -> String {
    format!("mirror.{pid}")
}

pub struct MirrorProcesses {
    store: RecordStore<MirrorProcess>,
    host: Arc<dyn Host>,
    program: PathBuf,
    config: MirrorConfig,
}

impl MirrorProcesses {
    pub fn new(
        dir: impl Into<PathBuf>,
        host: Arc<dyn Host>,
        tools: &ToolsConfig,
        config: MirrorConfig,
    ) -> Self {
        Self {
            store: RecordStore::new(dir),
            host,
            program: tools.nbd_tool.clone(),
            config,
        }
    }

    pub fn store(&self) -> &RecordStore<MirrorProcess> {
        &self.store
    }

    pub fn list(&self) -> Result<Vec<MirrorProcess>> {
        self.store.load_all()
    }

    /// Lowest port in the reserved range not recorded by any mirror.
    pub fn find_port(&self) -> Result<u16> {
        let used: BTreeSet<u16> = self
            .store
            .load_all()?
            .into_iter()
            .map(|m| m.listen_port)
            .collect();
        let ports = self.config.ports();
        let (first, last) = (*ports.start(), *ports.end());
        ports
            .into_iter()
            .find(|port| !used.contains(port))
            .ok_or(Error::NoAvailablePort { first, last })
    }

    pub fn find(&self, primary: &str, secondary: &str) -> Result<Option<MirrorProcess>> {
        self.store
            .find(|m| m.primary == primary && m.secondary == secondary)
    }

    /// Return the mirror for `(primary, secondary)`, spawning one if there is
    /// none yet.
    pub async fn create(&self, primary: &str, secondary: &str) -> Result<MirrorProcess> {
        let _lock = self.store.lock().await?;

        if let Some(existing) = self.find(primary, secondary)? {
            debug!(pid = existing.process_id, port = existing.listen_port, "mirror already running");
            return Ok(existing);
        }

        let port = self.find_port()?;
        let args = vec![
            "mirror".to_string(),
            primary.to_string(),
            secondary.to_string(),
            "--port".to_string(),
            port.to_string(),
        ];
        let pid = self.host.spawn(&self.program, &args).await?;

        if let Err(e) = self.wait_ready(pid, port).await {
            log_cleanup_error("terminate mirror that never listened", || {
                self.host.terminate(pid, &self.program).map(|_| ())
            });
            return Err(e);
        }

        let mut mirror = MirrorProcess {
            primary: primary.to_string(),
            secondary: secondary.to_string(),
            process_id: pid,
            listen_port: port,
            created_at: Utc::now(),
        };
        self.store.save(&mut mirror)?;

        info!(pid, port, primary, secondary, "mirror started");
        Ok(mirror)
    }

    /// Poll until the mirror accepts connections on `port`.
    async fn wait_ready(&self, pid: u32, port: u16) -> Result<()> {
        let started = Instant::now();
        let deadline = started + self.config.ready_timeout();
        loop {
            if self.host.is_listening(port).await {
                debug!(pid, port, waited_ms = started.elapsed().as_millis() as u64, "mirror ready");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::MirrorNotReady {
                    pid,
                    port,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep(self.config.ready_poll()).await;
        }
    }

    /// Signal the mirror to stop, then forget it. Does not wait for exit.
    pub async fn destroy(&self, mirror: &MirrorProcess) -> Result<()> {
        let pid = mirror.process_id;
        match self.host.terminate(pid, &self.program)? {
            Termination::Signalled => info!(pid, port = mirror.listen_port, "mirror signalled"),
            Termination::NotRunning => info!(pid, "mirror already exited"),
            Termination::Foreign => warn!(
                pid,
                program = %self.program.display(),
                "pid now belongs to another program; not signalling"
            ),
        }
        self.store.delete(&record_id(pid))
    }
}
