//! Host interactions: external commands, background processes, signals and
//! device discovery.
//!
//! Everything that touches the running system goes through [`Host`] so the
//! allocators and the orchestrator can be driven against an in-memory host in
//! tests.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Outcome of asking the host to stop a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// SIGTERM was delivered.
    Signalled,
    /// No live process has that pid.
    NotRunning,
    /// The pid now belongs to a different program and was left alone.
    Foreign,
}

#[async_trait]
pub trait Host: Send + Sync {
    /// Run a command to completion, returning its stdout.
    ///
    /// A non-zero exit status is an error carrying the command's stderr.
    async fn run(&self, program: &Path, args: &[String]) -> Result<String>;

    /// Start a detached background process and return its pid.
    async fn spawn(&self, program: &Path, args: &[String]) -> Result<u32>;

    /// Send SIGTERM to `pid` if it is still running `program`.
    fn terminate(&self, pid: u32, program: &Path) -> Result<Termination>;

    /// Names of the NBD device nodes present on the host (`nbd0`, `nbd1`, ...).
    fn nbd_devices(&self) -> Result<BTreeSet<String>>;

    /// Whether something accepts connections on the local `port`.
    async fn is_listening(&self, port: u16) -> bool;
}

/// The real host.
#[derive(Debug, Clone)]
pub struct LocalHost {
    dev_dir: PathBuf,
    proc_dir: PathBuf,
}

impl LocalHost {
    pub fn new(dev_dir: impl Into<PathBuf>) -> Self {
        Self {
            dev_dir: dev_dir.into(),
            proc_dir: PathBuf::from("/proc"),
        }
    }

    /// argv[0] of a live process, or `None` if it is gone or a zombie.
    fn process_program(&self, pid: u32) -> Result<Option<String>> {
        let cmdline = match fs::read(self.proc_dir.join(pid.to_string()).join("cmdline")) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let argv0 = cmdline.split(|b| *b == 0).next().unwrap_or_default();
        if argv0.is_empty() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(argv0).to_string()))
    }
}

/// NBD device node names are `nbd` followed by the device index.
pub fn is_nbd_device_name(name: &str) -> bool {
    name.strip_prefix("nbd")
        .is_some_and(|index| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()))
}

fn same_program(argv0: &str, program: &Path) -> bool {
    let running = Path::new(argv0).file_name();
    running.is_some() && running == program.file_name()
}

#[async_trait]
impl Host for LocalHost {
    async fn run(&self, program: &Path, args: &[String]) -> Result<String> {
        let name = program.display().to_string();
        debug!(program = %name, ?args, "running");

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::ToolSpawn {
                program: name.clone(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(Error::tool_failed(name, &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn spawn(&self, program: &Path, args: &[String]) -> Result<u32> {
        let name = program.display().to_string();

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::ToolSpawn {
                program: name.clone(),
                source: e,
            })?;

        let pid = child.id().ok_or_else(|| Error::ToolOutput {
            program: name.clone(),
            output: "process exited before its pid was read".to_string(),
        })?;
        info!(program = %name, pid, ?args, "spawned background process");
        Ok(pid)
    }

    fn terminate(&self, pid: u32, program: &Path) -> Result<Termination> {
        let Some(argv0) = self.process_program(pid)? else {
            return Ok(Termination::NotRunning);
        };
        if !same_program(&argv0, program) {
            return Ok(Termination::Foreign);
        }

        let raw = i32::try_from(pid).map_err(|_| Error::Signal {
            pid,
            source: Errno::EINVAL,
        })?;
        match kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) => Ok(Termination::Signalled),
            Err(Errno::ESRCH) => Ok(Termination::NotRunning),
            Err(e) => Err(Error::Signal { pid, source: e }),
        }
    }

    fn nbd_devices(&self) -> Result<BTreeSet<String>> {
        let mut devices = BTreeSet::new();
        for entry in fs::read_dir(&self.dev_dir)? {
            let name = entry?.file_name().to_string_lossy().to_string();
            if is_nbd_device_name(&name) {
                devices.insert(name);
            }
        }
        Ok(devices)
    }

    async fn is_listening(&self, port: u16) -> bool {
        TcpStream::connect(("127.0.0.1", port)).await.is_ok()
    }
}
