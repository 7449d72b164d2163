//! launch-drop - run a media graph while dropping buffers after one stage
//!
//! Builds a graph from a launch-style description, taps the output of the
//! target stage, discards a window of buffers there and optionally requests a
//! key unit from that stage once the window closes.
//!
//! # Usage
//!
//! ```bash
//! # Drop the first 20 buffers produced by the stage named "encoder"
//! launch-drop --target encoder \
//!     videotestsrc num-buffers=300 ! x264enc name=encoder ! fakesink
//!
//! # Let 30 buffers through, drop the next 10, then ask for a key unit
//! launch-drop -t encoder -a 30 -d 10 -k \
//!     videotestsrc ! x264enc name=encoder ! h264parse ! fakesink
//!
//! # Without GStreamer: the in-process runtime
//! launch-drop --backend memory -t enc -d 5 \
//!     testsrc num-buffers=50 ! encoder name=enc ! sink
//!
//! # With logging
//! RUST_LOG=launchdrop_core=trace launch-drop -t encoder ...
//! ```
//!
//! # Exit status
//!
//! - `0`: end of stream, or stopped by Ctrl+C / `--timeout`
//! - `1`: the graph reported an error
//! - `3`: the description could not be built
//! - `4`: the target stage or its output edge does not exist
//! - `5`: the key unit request could not be delivered upstream
//! - `6`: configuration or setup failure

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use launchdrop_core::backend::memory::MemoryBuilder;
use launchdrop_core::{
    BuildError, Config, Error, EventDispatcher, FailureKind, GraphBuilder, LifecycleDriver,
    StopReason,
};
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const EXIT_RUNTIME_ERROR: u8 = 1;
const EXIT_BUILD_ERROR: u8 = 3;
const EXIT_LOOKUP_ERROR: u8 = 4;
const EXIT_SIGNAL_ERROR: u8 = 5;
const EXIT_SETUP_ERROR: u8 = 6;

/// launch-drop - drop buffers leaving a stage of a running media graph
#[derive(Parser, Debug)]
#[command(name = "launch-drop")]
#[command(author, version)]
#[command(about = "Run a media graph while discarding a window of buffers after a named stage")]
struct Args {
    /// Stage whose output buffers are filtered (no filtering when unset)
    #[arg(short, long)]
    target: Option<String>,

    /// Buffers let through before the drop window starts [default: 0]
    #[arg(short, long)]
    allow: Option<u64>,

    /// Buffers discarded after the allow window [default: 20]
    #[arg(short, long)]
    drop: Option<u64>,

    /// Ask the target stage for a key unit when the drop window closes
    #[arg(short = 'k', long)]
    request_keyframe: bool,

    /// Print property change notifications
    #[arg(short, long)]
    verbose: bool,

    /// TOML configuration file
    #[arg(short, long, env = "LAUNCH_DROP_CONFIG")]
    config: Option<PathBuf>,

    /// Graph runtime
    #[arg(long, value_enum, default_value_t = Backend::default())]
    backend: Backend,

    /// Stop the graph after this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Log filter (overrides RUST_LOG)
    #[arg(long)]
    log_filter: Option<String>,

    /// Graph description
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pipeline: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// GStreamer (requires the `gstreamer` feature)
    Gstreamer,
    /// In-process synthetic stages
    Memory,
}

impl Default for Backend {
    fn default() -> Self {
        if cfg!(feature = "gstreamer") {
            Backend::Gstreamer
        } else {
            Backend::Memory
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = match log_filter(args.log_filter.as_deref()) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            return ExitCode::from(EXIT_SETUP_ERROR);
        }
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            return ExitCode::from(EXIT_SETUP_ERROR);
        }
    };
    debug!(?config, backend = ?args.backend, "Configuration loaded");

    match run(&args, &config) {
        Ok(reason) => {
            info!(%reason, "Run finished");
            ExitCode::from(reason_exit_code(&reason))
        }
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            ExitCode::from(error_exit_code(&e))
        }
    }
}

/// `--log-filter` must parse; RUST_LOG falls back to `warn`
fn log_filter(directives: Option<&str>) -> Result<EnvFilter> {
    match directives {
        Some(directives) => EnvFilter::try_new(directives)
            .with_context(|| format!("Invalid log filter '{directives}'")),
        None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))),
    }
}

/// File and environment first, then command line flags
fn load_config(args: &Args) -> Result<Config> {
    let mut config =
        Config::load(args.config.as_deref()).context("Failed to load configuration")?;

    if let Some(target) = &args.target {
        config.tap.target = Some(target.clone());
    }
    if let Some(allow) = args.allow {
        config.tap.allow_count = allow;
    }
    if let Some(drop) = args.drop {
        config.tap.drop_count = drop;
    }
    if args.request_keyframe {
        config.tap.request_sync_point = true;
    }
    if args.verbose {
        config.output.verbose = true;
    }
    config.tap.validate()?;
    Ok(config)
}

fn run(args: &Args, config: &Config) -> Result<StopReason> {
    match args.backend {
        Backend::Memory => execute(MemoryBuilder::new(), args, config),
        Backend::Gstreamer => run_gstreamer(args, config),
    }
}

#[cfg(feature = "gstreamer")]
fn run_gstreamer(args: &Args, config: &Config) -> Result<StopReason> {
    let builder = launchdrop_core::backend::gst::GstBuilder::init()
        .context("GStreamer backend unavailable")?;
    execute(builder, args, config)
}

#[cfg(not(feature = "gstreamer"))]
fn run_gstreamer(_args: &Args, _config: &Config) -> Result<StopReason> {
    anyhow::bail!(
        "launch-drop was built without GStreamer support; rebuild with `--features gstreamer` or use `--backend memory`"
    )
}

fn execute<B: GraphBuilder>(builder: B, args: &Args, config: &Config) -> Result<StopReason> {
    let graph = builder.build(&args.pipeline)?;
    let mut driver = LifecycleDriver::new(
        graph,
        config,
        EventDispatcher::stdio(config.output.verbose),
    );

    // First Ctrl+C stops the graph, a second one exits immediately
    let stop = driver.stop_handle();
    let interrupted = Arc::new(AtomicBool::new(false));
    ctrlc::set_handler(move || {
        if interrupted.swap(true, Ordering::SeqCst) {
            eprintln!("Interrupted twice, exiting");
            std::process::exit(130);
        }
        stop.request_stop();
    })
    .context("Failed to set Ctrl+C handler")?;

    if let Some(secs) = args.timeout {
        let stop = driver.stop_handle();
        thread::Builder::new()
            .name("timeout".to_string())
            .spawn(move || {
                thread::sleep(Duration::from_secs(secs));
                info!(secs, "Timeout reached, stopping graph");
                stop.request_stop();
            })
            .context("Failed to spawn timeout thread")?;
    }

    driver.start()?;
    let reason = driver.run_until_terminal()?;
    driver.report_tap();
    Ok(reason)
}

fn reason_exit_code(reason: &StopReason) -> u8 {
    match reason {
        StopReason::EndOfStream | StopReason::OperatorRequested => 0,
        StopReason::Error(failure) => match failure.kind {
            FailureKind::Runtime => EXIT_RUNTIME_ERROR,
            FailureKind::SignalDelivery => EXIT_SIGNAL_ERROR,
        },
    }
}

fn error_exit_code(error: &anyhow::Error) -> u8 {
    if error.downcast_ref::<BuildError>().is_some() {
        return EXIT_BUILD_ERROR;
    }
    match error.downcast_ref::<Error>() {
        Some(Error::Build(_)) => EXIT_BUILD_ERROR,
        Some(Error::Lookup(_)) => EXIT_LOOKUP_ERROR,
        Some(Error::State(_)) => EXIT_RUNTIME_ERROR,
        // Runtime initialization, configuration and I/O
        _ => EXIT_SETUP_ERROR,
    }
}
