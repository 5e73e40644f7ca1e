//! Mirror start and stop.
//!
//! Starting a mirror re-plumbs a running VM disk without the VM noticing:
//!
//! ```text
//!   before:  VM -> front tapdisk -> image
//!   after:   VM -> front tapdisk -> /dev/nbdN -> nbd-tool mirror -+-> shadow tapdisk -> image
//!                                                                 +-> destination
//! ```
//!
//! The front tapdisk stays paused from the first step until it is unpaused
//! onto the NBD device. Progress is written to the operation record after
//! every step, so a sequence interrupted part way can be unwound by a later
//! `cancel` or `mirror` on the same triple.

use std::path::Path;

use tracing::{debug, info, warn};

use super::{Datapath, resolve_volume, uri_path};
use crate::error::{Error, Result};
use crate::log_cleanup_error;
use crate::operation::{MirrorPhase, MirrorState, Operation, OperationHandle};
use crate::tapdisk::{Image, Tapdisk};

/// NBD locator `nbd-tool` uses for a tapdisk's block device.
fn shadow_locator(shadow: &Tapdisk) -> String {
    format!("file://{}", shadow.block_device().display())
}

impl Datapath {
    /// Start mirroring `source_uri` onto `destination`.
    ///
    /// An operation that is already mirroring is returned untouched. One left
    /// part way through by an earlier invocation is unwound first and then
    /// started again under the same record.
    pub async fn mirror(
        &self,
        source_uri: &str,
        domain: &str,
        destination: &str,
    ) -> Result<OperationHandle> {
        let path = resolve_volume(source_uri)?;
        let (mut op, inserted) = self
            .operations
            .find_or_insert(Operation::mirror(source_uri, destination))
            .await?;

        match op.mirror_state().map(|m| m.phase) {
            Some(MirrorPhase::Mirroring) => {
                info!(handle = %op.handle(), "mirror already running");
                return Ok(op.handle());
            }
            Some(phase) if !inserted => {
                warn!(handle = %op.handle(), ?phase, "unwinding interrupted mirror");
                self.stop_mirror(&mut op).await?;
                self.advance(&mut op, |m| *m = MirrorState::default())?;
            }
            _ => {}
        }

        info!(handle = %op.handle(), domain, "starting mirror");
        if let Err(e) = self.start_mirror(&mut op, &path).await {
            // Nothing was touched yet, so there is nothing to cancel later.
            if op.mirror_state().map(|m| m.phase) == Some(MirrorPhase::Starting) {
                log_cleanup_error("forget unstarted mirror", || self.operations.delete(&op));
            }
            return Err(e);
        }
        Ok(op.handle())
    }

    /// Apply `f` to the mirror state and persist the operation.
    fn advance(&self, op: &mut Operation, f: impl FnOnce(&mut MirrorState)) -> Result<()> {
        let phase = op.mirror_state_mut().map(|state| {
            f(state);
            state.phase
        });
        self.operations.save(op)?;
        debug!(handle = %op.handle(), ?phase, "mirror state saved");
        Ok(())
    }

    async fn start_mirror(&self, op: &mut Operation, path: &Path) -> Result<()> {
        let mut front = self.tapdisks.load(path)?;
        let backing = front
            .image
            .clone()
            .ok_or(Error::TapdiskNotOpen { minor: front.minor })?;

        self.disks.pause(&mut front).await?;
        self.advance(op, |m| {
            m.phase = MirrorPhase::Paused;
            m.front = Some(front.clone());
            m.backing = Some(backing.clone());
        })?;

        // The shadow takes over the backing image so the mirror can write
        // through to it once the front is pointed at the NBD device.
        let mut shadow = self.disks.create().await?;
        self.advance(op, |m| m.shadow = Some(shadow.clone()))?;
        self.disks.open(&mut shadow, backing, false).await?;
        self.tapdisks.save(path, &shadow)?;
        self.advance(op, |m| {
            m.phase = MirrorPhase::Shadowed;
            m.shadow = Some(shadow.clone());
        })?;

        let process = self
            .mirrors
            .create(&shadow_locator(&shadow), &op.destination)
            .await?;
        let client = &self.config.mirror;
        let binding = self
            .clients
            .create(&client.client_host, &client.client_export, process.listen_port)
            .await?;
        self.advance(op, |m| {
            m.phase = MirrorPhase::Replumbed;
            m.device = Some(binding.device_id.clone());
        })?;

        let device_path = self.clients.device_path(&binding.device_id);
        self.disks
            .unpause(&mut front, Image::raw(&device_path))
            .await?;
        self.tapdisks.save(&device_path, &front)?;
        self.advance(op, |m| {
            m.phase = MirrorPhase::Mirroring;
            m.front = Some(front.clone());
        })?;

        info!(
            handle = %op.handle(),
            device = %binding.device_id,
            port = process.listen_port,
            pid = process.process_id,
            front = front.minor,
            shadow = shadow.minor,
            "mirror running"
        );
        Ok(())
    }

    /// Undo whatever part of the start sequence `op` records.
    ///
    /// Resources that are already gone are skipped, so this also completes
    /// on records left behind by an interrupted start or stop.
    pub(super) async fn stop_mirror(&self, op: &mut Operation) -> Result<()> {
        let Some(state) = op.mirror_state().cloned() else {
            return Ok(());
        };
        if state.phase == MirrorPhase::Starting {
            debug!(handle = %op.handle(), "mirror never started; nothing to undo");
            return Ok(());
        }

        let source = uri_path(&op.source)?;
        let device_path = state.device.as_deref().map(|d| self.clients.device_path(d));
        self.advance(op, |m| m.phase = MirrorPhase::Stopping)?;

        // The front tapdisk is the one the VM talks to. Once mirroring it is
        // recorded under the NBD device; otherwise the operation's snapshot
        // is the freshest copy.
        let recorded = match &device_path {
            Some(p) if state.phase == MirrorPhase::Mirroring => self.tapdisks.get(p)?,
            _ => None,
        };
        let mut front = recorded
            .or_else(|| state.front.clone())
            .ok_or_else(|| Error::TapdiskNotFound(source.clone()))?;

        if !front.paused {
            self.disks.pause(&mut front).await?;
            self.advance(op, |m| m.front = Some(front.clone()))?;
        }

        // The shadow is bound to the source path while the mirror runs. The
        // snapshot covers records whose metadata was already rebound.
        let shadow = match &state.shadow {
            Some(snapshot) => Some(
                self.tapdisks
                    .get(&source)?
                    .filter(|t| t.minor == snapshot.minor)
                    .unwrap_or_else(|| snapshot.clone()),
            ),
            None => None,
        };

        let process = match &shadow {
            Some(shadow) => self.mirrors.find(&shadow_locator(shadow), &op.destination)?,
            None => None,
        };

        self.disconnect_client(state.device.as_deref(), process.as_ref().map(|p| p.listen_port))
            .await?;

        match &process {
            Some(process) => self.mirrors.destroy(process).await?,
            None => debug!(handle = %op.handle(), "no mirror process recorded"),
        }

        let mut image = state.backing.clone();
        if let Some(mut shadow) = shadow {
            if shadow.image.is_some() {
                image = shadow.image.clone();
                self.disks.close(&mut shadow).await?;
            }
            self.disks.destroy(shadow).await?;
            self.advance(op, |m| m.shadow = None)?;
        }

        let image = image.ok_or(Error::TapdiskNotOpen { minor: front.minor })?;
        self.disks.unpause(&mut front, image).await?;
        self.tapdisks.save(&source, &front)?;
        if let Some(p) = &device_path
            && !self.tapdisks.forget(p)?
        {
            debug!(device = %p.display(), "no tapdisk metadata under NBD device");
        }
        self.advance(op, |m| {
            m.front = Some(front.clone());
            m.device = None;
        })?;

        info!(handle = %op.handle(), front = front.minor, "mirror stopped");
        Ok(())
    }

    /// Disconnect the NBD device fronting a mirror.
    ///
    /// Found by recorded device id, or failing that by the mirror's port.
    async fn disconnect_client(&self, device: Option<&str>, port: Option<u16>) -> Result<()> {
        let binding = match (device, port) {
            (Some(device), _) => match self.clients.find_by_device(device) {
                Ok(binding) => Some(binding),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            },
            (None, Some(port)) => {
                let client = &self.config.mirror;
                self.clients
                    .find(&client.client_host, &client.client_export, port)?
            }
            (None, None) => return Ok(()),
        };

        match binding {
            Some(binding) => self.clients.destroy(&binding).await,
            None => {
                warn!(?device, ?port, "NBD binding already gone");
                Ok(())
            }
        }
    }
}
