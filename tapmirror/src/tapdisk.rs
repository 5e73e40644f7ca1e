//! Tapdisk handles and the `tap-ctl` driver.
//!
//! A tapdisk fronts a VM's disk I/O against a backing image. It can be paused
//! (I/O quiesced, device kept) and unpaused onto a possibly different image,
//! which is what lets a running VM's write path be re-plumbed.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::host::Host;
use crate::record::{Record, RecordStore};

const BLKTAP_DEVICE_PREFIX: &str = "/dev/xen/blktap-2/tapdev";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Vhd,
    Raw,
}

impl ImageFormat {
    fn as_str(self) -> &'static str {
        match self {
            ImageFormat::Vhd => "vhd",
            ImageFormat::Raw => "raw",
        }
    }
}

/// A backing image a tapdisk can open, rendered as `<format>:<path>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub format: ImageFormat,
    pub path: PathBuf,
}

impl Image {
    pub fn vhd(path: impl Into<PathBuf>) -> Self {
        Self {
            format: ImageFormat::Vhd,
            path: path.into(),
        }
    }

    pub fn raw(path: impl Into<PathBuf>) -> Self {
        Self {
            format: ImageFormat::Raw,
            path: path.into(),
        }
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.format.as_str(), self.path.display())
    }
}

/// A tapdisk instance: the blktap minor it is attached to, the tapdisk
/// process serving it and the image it currently has open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tapdisk {
    pub minor: u32,
    pub pid: u32,
    pub image: Option<Image>,
    #[serde(default)]
    pub paused: bool,
}

impl Tapdisk {
    pub fn block_device(&self) -> PathBuf {
        PathBuf::from(format!("{BLKTAP_DEVICE_PREFIX}{}", self.minor))
    }
}

impl Record for Tapdisk {
    const REGISTRY: &'static str = "tapdisk";
}

/// Control of tapdisk instances.
#[async_trait]
pub trait DiskControl: Send + Sync {
    /// Allocate a minor, spawn a tapdisk and attach it. No image is open yet.
    async fn create(&self) -> Result<Tapdisk>;

    async fn open(&self, tap: &mut Tapdisk, image: Image, read_only: bool) -> Result<()>;

    /// Quiesce I/O without tearing the device down.
    async fn pause(&self, tap: &mut Tapdisk) -> Result<()>;

    /// Resume I/O against `image`.
    async fn unpause(&self, tap: &mut Tapdisk, image: Image) -> Result<()>;

    async fn close(&self, tap: &mut Tapdisk) -> Result<()>;

    /// Detach the tapdisk and free its minor.
    async fn destroy(&self, tap: Tapdisk) -> Result<()>;
}

/// [`DiskControl`] backed by the `tap-ctl` binary.
pub struct TapCtl {
    host: Arc<dyn Host>,
    program: PathBuf,
}

impl TapCtl {
    pub fn new(host: Arc<dyn Host>, program: impl Into<PathBuf>) -> Self {
        Self {
            host,
            program: program.into(),
        }
    }

    async fn tap_ctl(&self, args: &[&str]) -> Result<String> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.host.run(&self.program, &args).await
    }

    async fn tap_ctl_on(&self, verb: &str, tap: &Tapdisk, extra: &[&str]) -> Result<String> {
        let pid = tap.pid.to_string();
        let minor = tap.minor.to_string();
        let mut args = vec![verb, "-p", pid.as_str(), "-m", minor.as_str()];
        args.extend_from_slice(extra);
        self.tap_ctl(&args).await
    }

    fn parse_number(&self, output: &str) -> Result<u32> {
        let trimmed = output.trim();
        let digits: String = trimmed
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        digits.parse().map_err(|_| Error::ToolOutput {
            program: self.program.display().to_string(),
            output: trimmed.to_string(),
        })
    }
}

#[async_trait]
impl DiskControl for TapCtl {
    async fn create(&self) -> Result<Tapdisk> {
        let minor = self.parse_number(&self.tap_ctl(&["allocate"]).await?)?;
        let pid = self.parse_number(&self.tap_ctl(&["spawn"]).await?)?;
        let tap = Tapdisk {
            minor,
            pid,
            image: None,
            paused: false,
        };
        self.tap_ctl_on("attach", &tap, &[]).await?;
        info!(minor, pid, "tapdisk created");
        Ok(tap)
    }

    async fn open(&self, tap: &mut Tapdisk, image: Image, read_only: bool) -> Result<()> {
        let arg = image.to_string();
        let mut extra = vec!["-a", arg.as_str()];
        if read_only {
            extra.push("-R");
        }
        self.tap_ctl_on("open", tap, &extra).await?;
        debug!(minor = tap.minor, image = %image, read_only, "tapdisk opened");
        tap.image = Some(image);
        Ok(())
    }

    async fn pause(&self, tap: &mut Tapdisk) -> Result<()> {
        self.tap_ctl_on("pause", tap, &[]).await?;
        tap.paused = true;
        debug!(minor = tap.minor, "tapdisk paused");
        Ok(())
    }

    async fn unpause(&self, tap: &mut Tapdisk, image: Image) -> Result<()> {
        let arg = image.to_string();
        self.tap_ctl_on("unpause", tap, &["-a", arg.as_str()]).await?;
        debug!(minor = tap.minor, image = %image, "tapdisk unpaused");
        tap.image = Some(image);
        tap.paused = false;
        Ok(())
    }

    async fn close(&self, tap: &mut Tapdisk) -> Result<()> {
        self.tap_ctl_on("close", tap, &[]).await?;
        tap.image = None;
        Ok(())
    }

    async fn destroy(&self, tap: Tapdisk) -> Result<()> {
        self.tap_ctl_on("detach", &tap, &[]).await?;
        let minor = tap.minor.to_string();
        self.tap_ctl(&["free", "-m", minor.as_str()]).await?;
        info!(minor = tap.minor, pid = tap.pid, "tapdisk destroyed");
        Ok(())
    }
}

/// Path-keyed store of the tapdisk currently bound to each path.
pub struct TapdiskMetadata {
    store: RecordStore<Tapdisk>,
}

impl TapdiskMetadata {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            store: RecordStore::new(dir),
        }
    }

    fn key(path: &Path) -> String {
        url::form_urlencoded::byte_serialize(path.to_string_lossy().as_bytes()).collect()
    }

    /// The tapdisk bound to `path`, if any.
    pub fn get(&self, path: &Path) -> Result<Option<Tapdisk>> {
        match self.store.load(&Self::key(path)) {
            Ok(tap) => Ok(Some(tap)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The tapdisk bound to `path`.
    pub fn load(&self, path: &Path) -> Result<Tapdisk> {
        self.get(path)?
            .ok_or_else(|| Error::TapdiskNotFound(path.to_path_buf()))
    }

    pub fn save(&self, path: &Path, tap: &Tapdisk) -> Result<()> {
        self.store.save_as(&Self::key(path), tap)?;
        debug!(path = %path.display(), minor = tap.minor, "tapdisk metadata saved");
        Ok(())
    }

    /// Drop the binding for `path`. Returns whether one existed.
    pub fn forget(&self, path: &Path) -> Result<bool> {
        match self.store.delete(&Self::key(path)) {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn store(&self) -> &RecordStore<Tapdisk> {
        &self.store
    }
}
