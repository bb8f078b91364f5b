//! gpif command-line driver
//!
//! Feeds lines from stdin to a child process (gnuplot unless told otherwise)
//! and copies whatever the child prints back to stdout.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use gpif::config::GpifConfig;
use gpif::{Session, SessionConfig};

/// Child launched when neither a command nor a preset is given
const DEFAULT_COMMAND: &str = "gnuplot";

/// gpif
///
/// Drive a line-oriented program over a pair of pipes
#[derive(Parser, Debug)]
#[command(name = "gpif")]
#[command(version, about, long_about = None)]
struct Args {
    /// Preset to launch from the config file
    #[arg(short, long)]
    preset: Option<String>,

    /// Config file (defaults to .gpif/config.toml in the current directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Milliseconds to let the child respond before collecting its output
    #[arg(long, default_value_t = 50)]
    settle_ms: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Command to run, followed by its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; stdout belongs to the child
    let log_level = if args.verbose { "debug" } else { "info" };

    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("gpif={log_level}"))),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .compact()
        .init();

    debug!("gpif v{}", env!("CARGO_PKG_VERSION"));

    let config = resolve_session_config(&args)?;
    let command = config.command.clone();

    let mut session =
        Session::spawn_with(config).with_context(|| format!("Failed to start {command}"))?;

    let settle = Duration::from_millis(args.settle_ms);
    let result = run(
        &mut session,
        io::stdin().lock(),
        &mut io::stdout().lock(),
        settle,
    );

    // Teardown runs even when the exchange failed
    let closed = session.close().context("Failed to shut down child");

    result?;
    closed?;

    info!("Session closed");
    Ok(())
}

/// Work out which child to launch from the command line and config file
fn resolve_session_config(args: &Args) -> anyhow::Result<SessionConfig> {
    if let Some((command, rest)) = args.command.split_first() {
        return Ok(SessionConfig::new(command.as_str()).with_args(rest.iter().cloned()));
    }

    let file_config = match &args.config {
        Some(path) => GpifConfig::load_from(path),
        None => {
            let cwd = std::env::current_dir().context("Failed to get current directory")?;
            GpifConfig::load(&cwd)
        }
    }
    .context("Failed to load config")?;

    if let Some(name) = &args.preset {
        return match file_config.get_preset(name) {
            Some(preset) => Ok(preset.to_session_config()),
            None => bail!("Unknown preset: {}", name),
        };
    }

    Ok(file_config
        .default_preset()
        .map(|preset| preset.to_session_config())
        .unwrap_or_else(|| SessionConfig::new(DEFAULT_COMMAND)))
}

/// Forward `input` to the child line by line, echoing its replies to `out`
fn run(
    session: &mut Session,
    input: impl BufRead,
    out: &mut impl Write,
    settle: Duration,
) -> anyhow::Result<()> {
    let mut buf = [0u8; 4096];

    // Raw bytes, so non-UTF-8 input passes through untouched
    for line in input.split(b'\n') {
        let mut line = line.context("Failed to read stdin")?;
        line.push(b'\n');
        session.write_all(&line).context("Failed to send command")?;

        thread::sleep(settle);
        drain(session, out, &mut buf)?;
    }

    drain(session, out, &mut buf)
}

/// Copy everything the child has printed so far without waiting for more
fn drain(session: &mut Session, out: &mut impl Write, buf: &mut [u8]) -> anyhow::Result<()> {
    loop {
        let n = session.try_read(buf).context("Failed to read child output")?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
    }
    out.flush()?;
    Ok(())
}
