//! Error types for tapmirror.

use std::io;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Fault classes reported to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FaultKind {
    NotFound,
    ResourceExhausted,
    ExternalToolFailure,
    InvalidArgument,
    Internal,
}

impl FaultKind {
    /// Process exit code used by the binary for this fault class.
    pub fn exit_code(self) -> i32 {
        match self {
            FaultKind::NotFound => 2,
            FaultKind::ResourceExhausted => 3,
            FaultKind::ExternalToolFailure => 4,
            FaultKind::InvalidArgument => 5,
            FaultKind::Internal => 1,
        }
    }
}

/// tapmirror errors with structured context.
#[derive(Debug, Error)]
pub enum Error {
    #[error("volume does not exist: {}", .0.display())]
    VolumeNotFound(PathBuf),

    #[error("operation not found: {0}")]
    OperationNotFound(String),

    #[error("no {registry} record named {id}")]
    RecordNotFound { registry: &'static str, id: String },

    #[error("no tapdisk metadata for {}", .0.display())]
    TapdiskNotFound(PathBuf),

    #[error("tapdisk {minor} has no image open")]
    TapdiskNotOpen { minor: u32 },

    #[error("no available NBD device ({in_use} in use)")]
    NoAvailableDevice { in_use: usize },

    #[error("no available mirror port in {first}..={last}")]
    NoAvailablePort { first: u16, last: u16 },

    #[error("failed to run {program}: {source}")]
    ToolSpawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    ToolFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("unexpected output from {program}: {output:?}")]
    ToolOutput { program: String, output: String },

    #[error("mirror process {pid} not listening on port {port} after {waited_ms}ms")]
    MirrorNotReady { pid: u32, port: u16, waited_ms: u64 },

    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: nix::Error,
    },

    #[error("invalid URI {uri}: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("invalid operation handle: {0}")]
    InvalidHandle(String),

    #[error("invalid record {}: {reason}", .path.display())]
    InvalidRecord { path: PathBuf, reason: String },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn tool_failed(program: impl Into<String>, output: &std::process::Output) -> Self {
        Self::ToolFailed {
            program: program.into(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }

    pub fn kind(&self) -> FaultKind {
        match self {
            Error::VolumeNotFound(_)
            | Error::OperationNotFound(_)
            | Error::RecordNotFound { .. }
            | Error::TapdiskNotFound(_)
            | Error::TapdiskNotOpen { .. } => FaultKind::NotFound,

            Error::NoAvailableDevice { .. } | Error::NoAvailablePort { .. } => {
                FaultKind::ResourceExhausted
            }

            Error::ToolSpawn { .. }
            | Error::ToolFailed { .. }
            | Error::ToolOutput { .. }
            | Error::MirrorNotReady { .. }
            | Error::Signal { .. } => FaultKind::ExternalToolFailure,

            Error::InvalidUri { .. } | Error::InvalidHandle(_) | Error::Config(_) => {
                FaultKind::InvalidArgument
            }

            Error::InvalidRecord { .. } | Error::Io(_) | Error::Json(_) => FaultKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == FaultKind::NotFound
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(io::Error),

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}
