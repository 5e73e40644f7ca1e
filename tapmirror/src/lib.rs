//! tapmirror: live mirroring of tapdisk-backed virtual disks onto NBD targets.
//!
//! Each invocation is a short-lived process. Everything that must outlive it
//! (in-flight operations, NBD device bindings, mirror processes and tapdisk
//! metadata) is kept in file-backed registries, so later invocations can
//! query, resume or cancel what an earlier one started.

use tracing::warn;

pub mod config;
pub mod datapath;
pub mod error;
pub mod host;
pub mod nbd_client;
pub mod nbd_tool;
pub mod operation;
pub mod record;
pub mod tapdisk;

pub use config::Config;
pub use datapath::{Datapath, OperationStatus};
pub use error::{Error, FaultKind, Result};
pub use operation::{OperationHandle, OperationKind};

#[cfg(test)]
pub(crate) mod test_util;

/// Log cleanup errors without propagating them.
pub(crate) fn log_cleanup_error<F, E>(operation: &str, f: F)
where
    F: FnOnce() -> std::result::Result<(), E>,
    E: std::fmt::Display,
{
    if let Err(e) = f() {
        warn!(operation, error = %e, "cleanup failed");
    }
}
