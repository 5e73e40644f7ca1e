//! Operation registry.
//!
//! An operation is one user-visible copy or mirror task. Callers refer to it
//! by its handle `(kind, (source, destination))`, so at most one record may
//! exist per triple.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::record::{Record, RecordStore, RegistryLock};
use crate::tapdisk::{Image, Tapdisk};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Copy,
    Mirror,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Copy => write!(f, "Copy"),
            OperationKind::Mirror => write!(f, "Mirror"),
        }
    }
}

/// Public identifier of an operation, `(kind, (source, destination))`.
///
/// Serializes as `["Mirror", ["file:///vdi/a", "nbd://host/b"]]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationHandle(pub OperationKind, pub (String, String));

impl OperationHandle {
    pub fn new(kind: OperationKind, source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self(kind, (source.into(), destination.into()))
    }

    pub fn kind(&self) -> OperationKind {
        self.0
    }

    pub fn source(&self) -> &str {
        &self.1.0
    }

    pub fn destination(&self) -> &str {
        &self.1.1
    }

    pub fn parse(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| Error::InvalidHandle(format!("{s}: {e}")))
    }
}

impl fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

/// How far a mirror's start or stop sequence has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MirrorPhase {
    /// Recorded, nothing touched yet.
    Starting,
    /// The VM-facing tapdisk is paused.
    Paused,
    /// The shadow tapdisk is open on the backing image.
    Shadowed,
    /// Mirror process and NBD device exist; the VM disk is still paused.
    Replumbed,
    /// VM writes flow through the NBD device into the mirror.
    Mirroring,
    /// Teardown has begun.
    Stopping,
}

/// Mirror progress persisted with the operation so a later call can finish or
/// unwind a sequence a crashed invocation left behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorState {
    pub phase: MirrorPhase,
    /// NBD device the VM disk is (or is about to be) redirected onto.
    pub device: Option<String>,
    /// The image the VM disk had open before the mirror started.
    pub backing: Option<Image>,
    /// Last known state of the VM-facing tapdisk.
    pub front: Option<Tapdisk>,
    /// The shadow tapdisk serving the backing image to the mirror.
    pub shadow: Option<Tapdisk>,
}

impl Default for MirrorState {
    fn default() -> Self {
        Self {
            phase: MirrorPhase::Starting,
            device: None,
            backing: None,
            front: None,
            shadow: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Task {
    Copy,
    Mirror(MirrorState),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub source: String,
    pub destination: String,
    pub task: Task,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    record_id: Option<String>,
}

impl Operation {
    pub fn copy(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self::new(Task::Copy, source, destination)
    }

    pub fn mirror(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self::new(Task::Mirror(MirrorState::default()), source, destination)
    }

    fn new(task: Task, source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            task,
            created_at: Utc::now(),
            record_id: None,
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self.task {
            Task::Copy => OperationKind::Copy,
            Task::Mirror(_) => OperationKind::Mirror,
        }
    }

    pub fn handle(&self) -> OperationHandle {
        OperationHandle::new(self.kind(), &self.source, &self.destination)
    }

    pub fn matches(&self, kind: OperationKind, source: &str, destination: &str) -> bool {
        self.kind() == kind && self.source == source && self.destination == destination
    }

    /// The NBD device a mirror's VM disk is redirected onto.
    pub fn mirror_device(&self) -> Option<&str> {
        match &self.task {
            Task::Mirror(state) => state.device.as_deref(),
            Task::Copy => None,
        }
    }

    pub fn mirror_state(&self) -> Option<&MirrorState> {
        match &self.task {
            Task::Mirror(state) => Some(state),
            Task::Copy => None,
        }
    }

    pub fn mirror_state_mut(&mut self) -> Option<&mut MirrorState> {
        match &mut self.task {
            Task::Mirror(state) => Some(state),
            Task::Copy => None,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.record_id.as_deref()
    }
}

impl Record for Operation {
    const REGISTRY: &'static str = "operation";
    const PREFIX: &'static str = "mirror";

    fn record_id(&self) -> Option<&str> {
        self.record_id.as_deref()
    }

    fn set_record_id(&mut self, id: String) {
        self.record_id = Some(id);
    }
}

pub struct Operations {
    store: RecordStore<Operation>,
}

impl Operations {
    pub fn new(dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            store: RecordStore::new(dir),
        }
    }

    pub fn store(&self) -> &RecordStore<Operation> {
        &self.store
    }

    pub async fn lock(&self) -> Result<RegistryLock> {
        self.store.lock().await
    }

    pub fn list(&self) -> Result<Vec<Operation>> {
        self.store.load_all()
    }

    pub fn find(
        &self,
        kind: OperationKind,
        source: &str,
        destination: &str,
    ) -> Result<Option<Operation>> {
        self.store.find(|op| op.matches(kind, source, destination))
    }

    pub fn find_by_handle(&self, handle: &OperationHandle) -> Result<Operation> {
        self.find(handle.kind(), handle.source(), handle.destination())?
            .ok_or_else(|| Error::OperationNotFound(handle.to_string()))
    }

    /// Return the record matching `op`'s triple, or persist `op` as a new one.
    ///
    /// The flag is true when `op` was inserted.
    pub async fn find_or_insert(&self, mut op: Operation) -> Result<(Operation, bool)> {
        let _lock = self.lock().await?;
        if let Some(existing) = self.find(op.kind(), &op.source, &op.destination)? {
            return Ok((existing, false));
        }
        let id = self.store.save(&mut op)?;
        info!(id, handle = %op.handle(), "operation recorded");
        Ok((op, true))
    }

    pub fn save(&self, op: &mut Operation) -> Result<String> {
        self.store.save(op)
    }

    pub fn delete(&self, op: &Operation) -> Result<()> {
        let id = op
            .record_id
            .as_deref()
            .ok_or_else(|| Error::OperationNotFound(op.handle().to_string()))?;
        self.store.delete(id)?;
        info!(id, handle = %op.handle(), "operation removed");
        Ok(())
    }
}
