//! Datapath control operations.
//!
//! This module contains the entry points the control plane calls:
//! - `copy`, `mirror`: start an operation and return its handle
//! - `cancel`: tear an operation down and forget it
//! - `stat`, `ls`: read the operation registry
//!
//! The mirror start and stop sequences live in the `mirror` submodule.

mod mirror;

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};
use url::Url;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::host::{Host, LocalHost};
use crate::nbd_client::NbdClients;
use crate::nbd_tool::MirrorProcesses;
use crate::operation::{Operation, OperationHandle, Operations, Task};
use crate::tapdisk::{DiskControl, TapCtl, TapdiskMetadata};

/// Progress report for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OperationStatus {
    pub failed: bool,
    pub progress: f64,
}

/// Progress is not tracked; every live operation reports halfway.
const REPORTED_PROGRESS: f64 = 0.5;

pub struct Datapath {
    config: Config,
    disks: Arc<dyn DiskControl>,
    operations: Operations,
    clients: NbdClients,
    mirrors: MirrorProcesses,
    tapdisks: TapdiskMetadata,
}

impl Datapath {
    pub fn new(config: Config, host: Arc<dyn Host>, disks: Arc<dyn DiskControl>) -> Self {
        let registry = &config.registry;
        let operations = Operations::new(registry.operations_dir.clone());
        let clients = NbdClients::new(registry.nbd_client_dir.clone(), host.clone(), &config.tools);
        let mirrors = MirrorProcesses::new(
            registry.nbd_tool_dir.clone(),
            host,
            &config.tools,
            config.mirror.clone(),
        );
        let tapdisks = TapdiskMetadata::new(registry.tapdisk_dir.clone());
        Self {
            config,
            disks,
            operations,
            clients,
            mirrors,
            tapdisks,
        }
    }

    /// A datapath driving the real host through `tap-ctl`, `nbd-client` and
    /// `nbd-tool`.
    pub fn local(config: Config) -> Self {
        let host: Arc<dyn Host> = Arc::new(LocalHost::new(config.tools.dev_dir.clone()));
        let disks = Arc::new(TapCtl::new(host.clone(), config.tools.tap_ctl.clone()));
        Self::new(config, host, disks)
    }

    pub fn operations(&self) -> &Operations {
        &self.operations
    }

    pub fn clients(&self) -> &NbdClients {
        &self.clients
    }

    pub fn mirrors(&self) -> &MirrorProcesses {
        &self.mirrors
    }

    pub fn tapdisks(&self) -> &TapdiskMetadata {
        &self.tapdisks
    }

    /// Record a copy of `source_uri` to `destination`.
    ///
    /// The copy itself is carried out elsewhere; only the operation is tracked.
    pub async fn copy(
        &self,
        source_uri: &str,
        domain: &str,
        destination: &str,
    ) -> Result<OperationHandle> {
        let (op, inserted) = self
            .operations
            .find_or_insert(Operation::copy(source_uri, destination))
            .await?;
        if !inserted {
            debug!(handle = %op.handle(), domain, "copy already recorded");
        }
        Ok(op.handle())
    }

    /// Tear down the operation behind `handle` and remove its record.
    pub async fn cancel(&self, handle: &OperationHandle) -> Result<()> {
        let mut op = self.operations.find_by_handle(handle)?;
        match op.task {
            Task::Copy => {}
            Task::Mirror(_) => self.stop_mirror(&mut op).await?,
        }
        self.operations.delete(&op)?;
        info!(%handle, "operation cancelled");
        Ok(())
    }

    pub fn stat(&self, handle: &OperationHandle) -> Result<OperationStatus> {
        self.operations.find_by_handle(handle)?;
        Ok(OperationStatus {
            failed: false,
            progress: REPORTED_PROGRESS,
        })
    }

    pub fn ls(&self) -> Result<Vec<OperationHandle>> {
        Ok(self
            .operations
            .list()?
            .iter()
            .map(Operation::handle)
            .collect())
    }
}

/// Local path named by a `file://` URI.
fn uri_path(uri: &str) -> Result<PathBuf> {
    let url = Url::parse(uri).map_err(|e| Error::InvalidUri {
        uri: uri.to_string(),
        reason: e.to_string(),
    })?;
    url.to_file_path().map_err(|()| Error::InvalidUri {
        uri: uri.to_string(),
        reason: "not a local file URI".to_string(),
    })
}

/// Local path of an existing volume.
fn resolve_volume(uri: &str) -> Result<PathBuf> {
    let path = uri_path(uri)?;
    if !path.exists() {
        return Err(Error::VolumeNotFound(path));
    }
    Ok(path)
}
