#![warn(missing_docs)]
//! forkchan CLI Library
//!
//! Command-line front end for the forkchan process primitives:
//! - `demo` forks a child that builds a record and sends it back to the parent
//! - `exec` forks a child that replaces its image with another program
//! - `config` prints a default `forkchan.toml`

mod config;

pub use config::*;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use forkchan_core::{ChildExit, ProcessError, ProcessHandle};
use forkchan_ipc::{FailureKind, Transport};
use std::path::{Path, PathBuf};
use std::time::Duration;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// forkchan CLI arguments
#[derive(Parser, Debug)]
#[command(name = "forkchan")]
#[command(author, version, about = "forkchan - fork a child and collect its result")]
pub struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (discovered from the current directory if not given)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fork a child that sends a fixed record back to the parent
    Demo {
        /// Transport: pipe or socket-pair
        #[arg(long)]
        transport: Option<Transport>,

        /// Receive deadline (e.g., "2s", "500ms"); "0s" waits forever
        #[arg(long)]
        timeout: Option<String>,
    },
    /// Fork a child and replace its image with PATH
    Exec {
        /// Absolute or relative path of the program (no PATH search)
        path: PathBuf,

        /// Arguments passed after argv[0]
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,

        /// Transport: pipe or socket-pair
        #[arg(long)]
        transport: Option<Transport>,
    },
    /// Print a default forkchan.toml
    Config,
}

/// Record the demo child sends to its parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct DemoRecord {
    /// Wide integer field
    pub l: i64,
    /// Integer field
    pub i: i32,
    /// Short field
    pub s: i16,
    /// Character field
    pub c: u8,
    _pad: u8,
}

impl DemoRecord {
    /// Build a record; the padding byte is always zero
    pub fn new(l: i64, i: i32, s: i16, c: u8) -> Self {
        Self {
            l,
            i,
            s,
            c,
            _pad: 0,
        }
    }
}

impl std::fmt::Display for DemoRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "l={} i={} s={} c='{}'",
            self.l, self.i, self.s, self.c as char
        )
    }
}

/// Run the forkchan CLI with arguments from the environment
pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run_with_cli(cli)
}

/// Run the forkchan CLI with already-parsed arguments
pub fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let (config, invalid_config) = match &cli.config {
        Some(path) => (
            ForkchanConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None,
        ),
        None => match std::env::current_dir().map(|dir| ForkchanConfig::try_discover_from(&dir)) {
            Ok(Ok(found)) => (found.unwrap_or_default(), None),
            Ok(Err(e)) => (ForkchanConfig::default(), Some(e)),
            Err(_) => (ForkchanConfig::default(), None),
        },
    };

    init_logging(cli.verbose, &config.logging);
    if let Some(e) = invalid_config {
        tracing::warn!(
            error = %format_args!("{:#}", e),
            "ignoring invalid configuration, using defaults"
        );
    }

    match cli.command {
        Commands::Demo { transport, timeout } => {
            let transport = transport.unwrap_or_else(|| config.channel.transport.into());
            let timeout = match timeout {
                Some(value) => parse_timeout(&value)?,
                None => config.receive_timeout()?,
            };
            let record = run_demo(transport, timeout)?;
            println!("received {}", record);
            Ok(())
        }
        Commands::Exec {
            path,
            args,
            transport,
        } => {
            let transport = transport.unwrap_or_else(|| config.channel.transport.into());
            let exit = run_exec(transport, &path, &args)?;
            println!("{} {}", path.display(), exit);
            if !exit.success() {
                bail!("{} did not exit successfully ({})", path.display(), exit);
            }
            Ok(())
        }
        Commands::Config => {
            print!("{}", ForkchanConfig::default_toml());
            Ok(())
        }
    }
}

fn init_logging(verbose: bool, logging: &LoggingConfig) {
    let filter = match &logging.filter {
        Some(filter) => filter.as_str(),
        None if verbose || logging.verbose => "forkchan=debug",
        None => "forkchan=info",
    };
    // A subscriber may already be installed when the CLI is embedded.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn parse_timeout(value: &str) -> anyhow::Result<Option<Duration>> {
    let nanos = ForkchanConfig::parse_duration(value)?;
    Ok((nanos > 0).then(|| Duration::from_nanos(nanos)))
}

/// Fork a child that sends a [`DemoRecord`] back, then reap it
pub fn run_demo(transport: Transport, timeout: Option<Duration>) -> anyhow::Result<DemoRecord> {
    let mut handle = ProcessHandle::<DemoRecord>::with_transport(transport)?;
    handle.set_timeout(timeout);

    let child = handle.run(|| DemoRecord::new(10, 3, 50, b'f'))?;
    tracing::info!(%child, %transport, "forked demo child");

    let record = handle.receive_result().context("Failed to receive demo record")?;
    let exit = handle.wait()?;
    tracing::debug!(%child, %exit, "demo child reaped");
    if !exit.success() {
        bail!("demo child {} terminated abnormally ({})", child, exit);
    }
    Ok(record)
}

/// Fork a child that replaces its image with `path`, then reap it
pub fn run_exec(transport: Transport, path: &Path, args: &[String]) -> anyhow::Result<ChildExit> {
    let mut handle = ProcessHandle::<()>::with_transport(transport)?;
    let child = handle.run_program(path, args)?;
    tracing::info!(%child, program = %path.display(), "forked program child");

    // The replaced image never writes to the channel, so end of stream
    // without a failure report means execv succeeded.
    match handle.receive_result() {
        Ok(()) => {}
        Err(err) if err.is_short_transfer() => {
            tracing::debug!(%child, "program image replaced");
        }
        Err(ProcessError::ChildFailed {
            kind: FailureKind::ExecFailed,
            code,
        }) => {
            let _ = handle.wait();
            bail!(
                "Failed to execute {}: {}",
                path.display(),
                std::io::Error::from_raw_os_error(code)
            );
        }
        Err(err) => return Err(err.into()),
    }

    Ok(handle.wait()?)
}
