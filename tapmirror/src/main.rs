//! tapmirror - datapath control for tapdisk mirrors.
//!
//! Usage:
//!   tapmirror copy <source_uri> <domain> <destination>
//!   tapmirror mirror <source_uri> <domain> <destination>
//!   tapmirror cancel <handle>
//!   tapmirror stat <handle>
//!   tapmirror ls
//!
//! Handles are the JSON printed by `copy`/`mirror`, e.g.
//! `'["Mirror",["file:///vdi/a","nbd://host/b"]]'`. When invoked through a
//! link named `Data.<command>` the subcommand is taken from the link name.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use tapmirror::{Config, Datapath, Error, FaultKind, OperationHandle};

const DEFAULT_CONFIG_PATH: &str = "/etc/tapmirror/tapmirror.toml";

/// Prefix of the link names the control plane invokes us through.
const LINK_PREFIX: &str = "Data.";

#[derive(Parser, Debug)]
#[command(name = "tapmirror")]
#[command(about = "Mirror and copy tapdisk-backed volumes onto NBD targets")]
struct Cli {
    /// Configuration file. Defaults apply when it does not exist.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity level (0-4).
    #[arg(short, default_value = "0", global = true)]
    v: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record a copy of a volume to a remote destination
    Copy {
        source_uri: String,
        domain: String,
        destination: String,
    },
    /// Start mirroring a running volume to a remote destination
    Mirror {
        source_uri: String,
        domain: String,
        destination: String,
    },
    /// Stop an operation and forget it
    Cancel {
        /// Operation handle (JSON)
        handle: String,
    },
    /// Report progress of an operation
    Stat {
        /// Operation handle (JSON)
        handle: String,
    },
    /// List operations
    Ls,
}

/// Insert the subcommand implied by a `Data.<command>` program name.
fn dispatch_args(mut args: Vec<OsString>) -> Vec<OsString> {
    let implied = args
        .first()
        .and_then(|argv0| Path::new(argv0).file_name())
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_prefix(LINK_PREFIX))
        .map(|command| command.to_string());
    if let Some(command) = implied {
        args.insert(1.min(args.len()), OsString::from(command));
    }
    args
}

fn init_tracing(verbosity: u8) {
    // stdout carries results, so logs go to stderr.
    let filter = match verbosity {
        0 => "warn",
        1 => "tapmirror=info,warn",
        2 => "tapmirror=debug,warn",
        3 => "tapmirror=trace,warn",
        _ => "tapmirror=trace,info",
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let path = path.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));
    if !path.exists() {
        debug!(path = %path.display(), "no config file; using defaults");
        return Ok(Config::default());
    }
    let config = Config::load(path)
        .map_err(Error::from)
        .with_context(|| format!("loading {}", path.display()))?;
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let datapath = Datapath::local(config);

    match cli.command {
        Command::Copy {
            source_uri,
            domain,
            destination,
        } => print_json(&datapath.copy(&source_uri, &domain, &destination).await?),
        Command::Mirror {
            source_uri,
            domain,
            destination,
        } => print_json(&datapath.mirror(&source_uri, &domain, &destination).await?),
        Command::Cancel { handle } => {
            datapath.cancel(&OperationHandle::parse(&handle)?).await?;
            Ok(())
        }
        Command::Stat { handle } => print_json(&datapath.stat(&OperationHandle::parse(&handle)?)?),
        Command::Ls => print_json(&datapath.ls()?),
    }
}

#[derive(Serialize)]
struct Fault {
    fault: FaultKind,
    message: String,
}

/// The JSON fault line for `e` and the exit code that goes with it.
fn render_fault(e: &anyhow::Error) -> (String, i32) {
    let fault = e
        .downcast_ref::<Error>()
        .map(Error::kind)
        .unwrap_or(FaultKind::Internal);
    let report = Fault {
        fault,
        message: format!("{e:#}"),
    };
    let line = serde_json::to_string(&report).unwrap_or_else(|_| format!("Error: {e:#}"));
    (line, fault.exit_code())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse_from(dispatch_args(std::env::args_os().collect()));
    init_tracing(cli.v);

    if let Err(e) = run(cli).await {
        let (line, code) = render_fault(&e);
        eprintln!("{line}");
        std::process::exit(code);
    }
}
