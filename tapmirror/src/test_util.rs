//! Shared test utilities: an in-memory host, an in-memory tapdisk driver and
//! a fixture wiring them into a [`Datapath`] over temporary registries.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use url::Url;

use crate::config::{Config, MirrorConfig, RegistryConfig, ToolsConfig};
use crate::datapath::Datapath;
use crate::error::{Error, Result};
use crate::host::{Host, Termination, is_nbd_device_name};
use crate::tapdisk::{DiskControl, Image, Tapdisk};

struct FakeProcess {
    program: String,
    port: Option<u16>,
    silent: bool,
}

#[derive(Default)]
struct HostState {
    devices: BTreeSet<String>,
    commands: Vec<String>,
    responses: Vec<(String, String)>,
    failures: Vec<String>,
    processes: BTreeMap<u32, FakeProcess>,
    connected: BTreeSet<String>,
    next_pid: u32,
    silent: bool,
}

/// In-memory [`Host`]. Commands are recorded as `"<program> <args...>"` and
/// spawned processes listen on their `--port` argument.
pub struct FakeHost {
    state: Mutex<HostState>,
}

impl FakeHost {
    /// A host with device nodes `nbd0` .. `nbd{devices - 1}`.
    pub fn new(devices: usize) -> Self {
        let state = HostState {
            devices: (0..devices).map(|i| format!("nbd{i}")).collect(),
            next_pid: 1000,
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    /// Answer commands starting with `prefix` with `stdout`.
    pub fn respond(&self, prefix: &str, stdout: &str) {
        let mut state = self.state.lock().unwrap();
        state.responses.push((prefix.to_string(), stdout.to_string()));
    }

    /// Make commands starting with `prefix` exit non-zero.
    pub fn fail(&self, prefix: &str) {
        self.state.lock().unwrap().failures.push(prefix.to_string());
    }

    /// Spawned processes never start listening.
    pub fn silent_spawns(&self) {
        self.state.lock().unwrap().silent = true;
    }

    /// Pretend an unrelated `program` is running as `pid`.
    pub fn occupy_pid(&self, pid: u32, program: &str) {
        self.state.lock().unwrap().processes.insert(
            pid,
            FakeProcess {
                program: program.to_string(),
                port: None,
                silent: false,
            },
        );
    }

    /// Make `pid` exit on its own.
    pub fn exit(&self, pid: u32) {
        self.state.lock().unwrap().processes.remove(&pid);
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Pids of live processes, ascending.
    pub fn running(&self) -> Vec<u32> {
        self.state.lock().unwrap().processes.keys().copied().collect()
    }

    /// NBD devices currently connected through `nbd-client`.
    pub fn connected_devices(&self) -> BTreeSet<String> {
        self.state.lock().unwrap().connected.clone()
    }

    /// Log a command and return it rendered, failing if it is poisoned.
    fn record(&self, program: &Path, args: &[String]) -> Result<String> {
        let mut rendered = program.display().to_string();
        for arg in args {
            rendered.push(' ');
            rendered.push_str(arg);
        }
        let mut state = self.state.lock().unwrap();
        state.commands.push(rendered.clone());
        if state.failures.iter().any(|p| rendered.starts_with(p)) {
            return Err(Error::ToolFailed {
                program: program.display().to_string(),
                status: "exit status: 1".to_string(),
                stderr: "injected failure".to_string(),
            });
        }
        Ok(rendered)
    }
}

fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[async_trait]
impl Host for FakeHost {
    async fn run(&self, program: &Path, args: &[String]) -> Result<String> {
        let rendered = self.record(program, args)?;
        let mut state = self.state.lock().unwrap();

        if file_name(&program.display().to_string()) == "nbd-client" {
            match args {
                [flag, device] if flag == "-d" => {
                    state.connected.remove(&file_name(device));
                }
                [_, _, device, ..] => {
                    let device = file_name(device);
                    if is_nbd_device_name(&device) {
                        state.connected.insert(device);
                    }
                }
                _ => {}
            }
        }

        Ok(state
            .responses
            .iter()
            .find(|(prefix, _)| rendered.starts_with(prefix.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default())
    }

    async fn spawn(&self, program: &Path, args: &[String]) -> Result<u32> {
        self.record(program, args)?;
        let port = args
            .iter()
            .position(|a| a == "--port")
            .and_then(|i| args.get(i + 1))
            .and_then(|p| p.parse().ok());
        let mut state = self.state.lock().unwrap();
        let pid = state.next_pid;
        state.next_pid += 1;
        let silent = state.silent;
        state.processes.insert(
            pid,
            FakeProcess {
                program: program.display().to_string(),
                port,
                silent,
            },
        );
        Ok(pid)
    }

    fn terminate(&self, pid: u32, program: &Path) -> Result<Termination> {
        let mut state = self.state.lock().unwrap();
        let Some(process) = state.processes.get(&pid) else {
            return Ok(Termination::NotRunning);
        };
        if file_name(&process.program) != file_name(&program.display().to_string()) {
            return Ok(Termination::Foreign);
        }
        state.processes.remove(&pid);
        Ok(Termination::Signalled)
    }

    fn nbd_devices(&self) -> Result<BTreeSet<String>> {
        Ok(self.state.lock().unwrap().devices.clone())
    }

    async fn is_listening(&self, port: u16) -> bool {
        self.state
            .lock()
            .unwrap()
            .processes
            .values()
            .any(|p| p.port == Some(port) && !p.silent)
    }
}

#[derive(Default)]
struct DiskState {
    next_minor: u32,
    live: BTreeMap<u32, Tapdisk>,
    log: Vec<String>,
    fail_on: Option<String>,
}

/// In-memory [`DiskControl`] that tracks live tapdisks by minor.
#[derive(Default)]
pub struct FakeDisks {
    state: Mutex<DiskState>,
}

impl FakeDisks {
    /// Make every `verb` call fail until [`FakeDisks::heal`].
    pub fn fail_on(&self, verb: &str) {
        self.state.lock().unwrap().fail_on = Some(verb.to_string());
    }

    pub fn heal(&self) {
        self.state.lock().unwrap().fail_on = None;
    }

    pub fn live(&self) -> Vec<Tapdisk> {
        self.state.lock().unwrap().live.values().cloned().collect()
    }

    pub fn get(&self, minor: u32) -> Option<Tapdisk> {
        self.state.lock().unwrap().live.get(&minor).cloned()
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    /// Log `verb` against `minor`, failing if `verb` is poisoned.
    fn step(&self, verb: &str, minor: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_on.as_deref() == Some(verb) {
            return Err(Error::ToolFailed {
                program: "tap-ctl".to_string(),
                status: "exit status: 1".to_string(),
                stderr: format!("injected {verb} failure"),
            });
        }
        state.log.push(format!("{verb} {minor}"));
        Ok(())
    }

    fn store(&self, tap: &Tapdisk) {
        self.state.lock().unwrap().live.insert(tap.minor, tap.clone());
    }
}

#[async_trait]
impl DiskControl for FakeDisks {
    async fn create(&self) -> Result<Tapdisk> {
        let minor = {
            let mut state = self.state.lock().unwrap();
            let minor = state.next_minor;
            state.next_minor += 1;
            minor
        };
        self.step("create", minor)?;
        let tap = Tapdisk {
            minor,
            pid: 5000 + minor,
            image: None,
            paused: false,
        };
        self.store(&tap);
        Ok(tap)
    }

    async fn open(&self, tap: &mut Tapdisk, image: Image, _read_only: bool) -> Result<()> {
        self.step("open", tap.minor)?;
        tap.image = Some(image);
        self.store(tap);
        Ok(())
    }

    async fn pause(&self, tap: &mut Tapdisk) -> Result<()> {
        self.step("pause", tap.minor)?;
        tap.paused = true;
        self.store(tap);
        Ok(())
    }

    async fn unpause(&self, tap: &mut Tapdisk, image: Image) -> Result<()> {
        self.step("unpause", tap.minor)?;
        tap.image = Some(image);
        tap.paused = false;
        self.store(tap);
        Ok(())
    }

    async fn close(&self, tap: &mut Tapdisk) -> Result<()> {
        self.step("close", tap.minor)?;
        tap.image = None;
        self.store(tap);
        Ok(())
    }

    async fn destroy(&self, tap: Tapdisk) -> Result<()> {
        self.step("destroy", tap.minor)?;
        self.state.lock().unwrap().live.remove(&tap.minor);
        Ok(())
    }
}

/// Test fixture providing an isolated datapath for each test.
pub struct TestFixture {
    pub config: Config,
    pub host: Arc<FakeHost>,
    pub disks: Arc<FakeDisks>,
    pub datapath: Datapath,
    temp_dir: TempDir,
}

impl TestFixture {
    pub fn new() -> Self {
        Self::with_ports(MirrorConfig::default().port_count)
    }

    /// A fixture whose mirror port range holds `port_count` ports.
    pub fn with_ports(port_count: u16) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let config = Config {
            registry: RegistryConfig::rooted_at(&temp_dir.path().join("registry")),
            tools: ToolsConfig {
                nbd_client: "nbd-client".into(),
                nbd_tool: "nbd-tool".into(),
                tap_ctl: "tap-ctl".into(),
                dev_dir: temp_dir.path().join("dev"),
            },
            mirror: MirrorConfig {
                port_count,
                ready_timeout_ms: 50,
                ready_poll_ms: 1,
                ..Default::default()
            },
        };
        let host = Arc::new(FakeHost::new(4));
        let disks = Arc::new(FakeDisks::default());
        let datapath = Datapath::new(config.clone(), host.clone(), disks.clone());
        Self {
            config,
            host,
            disks,
            datapath,
            temp_dir,
        }
    }

    /// Create a VM disk image named `name` with a running tapdisk fronting
    /// it, and return its `file://` URI.
    pub async fn attach_vm_disk(&self, name: &str) -> String {
        let dir = self.temp_dir.path().join("vdi");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, b"").unwrap();

        let mut tap = self.disks.create().await.unwrap();
        self.disks
            .open(&mut tap, Image::vhd(&path), false)
            .await
            .unwrap();
        self.datapath.tapdisks().save(&path, &tap).unwrap();

        Url::from_file_path(&path).unwrap().to_string()
    }

    /// Local path behind a `file://` URI returned by [`Self::attach_vm_disk`].
    pub fn vdi_path(&self, uri: &str) -> std::path::PathBuf {
        Url::parse(uri).unwrap().to_file_path().unwrap()
    }
}
