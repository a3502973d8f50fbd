//! sandcc CLI - build and run a C++ file inside the sandboxed toolchain
//!
//! ```text
//! sandcc run hello.cpp
//! sandcc check broken.cpp --json
//! ```
//!
//! Ctrl+C aborts whatever the toolchain or the program is doing.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use futures::executor::block_on;
use sandcc::diagnostics::Diagnostic;
use sandcc::platform::Terminal;
use sandcc::platform::stdio::StdioTerminal;
use sandcc::toolchain::artifacts::DirectoryArtifacts;
use sandcc::worker::{Response, WorkerTransport};
use sandcc::ToolchainConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Sandboxed C++ toolchain: clang, wasm-ld and your program all run as WASM.
#[derive(Parser, Debug)]
#[command(name = "sandcc")]
#[command(version, about)]
struct Args {
    /// Directory holding the toolchain modules and the sysroot image.
    #[arg(long, global = true)]
    artifacts: Option<PathBuf>,

    /// JSON configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Show how long each step took.
    #[arg(long, global = true)]
    timing: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile, link and run a C++ source file.
    Run {
        file: PathBuf,

        /// Calls into the program's continuation export after it asks to continue.
        #[arg(long, default_value_t = 0)]
        frames: u32,

        /// Export called for each frame.
        #[arg(long, default_value = "frame")]
        frame_export: String,
    },

    /// Syntax-check a C++ source file and print its diagnostics.
    Check {
        file: PathBuf,

        /// Print diagnostics as JSON on stdout.
        #[arg(long)]
        json: bool,
    },
}

fn load_config(args: &Args) -> Result<ToolchainConfig> {
    let config = match &args.config {
        Some(path) => ToolchainConfig::from_file(path)?,
        None => ToolchainConfig::default(),
    };
    let mut config = config.with_env();
    if let Some(dir) = &args.artifacts {
        config.artifact_dir = dir.clone();
    }
    if args.timing {
        config.show_timing = true;
    }
    Ok(config)
}

fn read_source(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn start(terminal: StdioTerminal, config: ToolchainConfig) -> Result<Arc<WorkerTransport<StdioTerminal>>> {
    let artifacts = Arc::new(DirectoryArtifacts::new(config.artifact_dir.clone()));
    let transport = Arc::new(WorkerTransport::spawn(terminal, config, artifacts)?);

    let handle = transport.clone();
    ctrlc::set_handler(move || {
        if let Err(err) = handle.force_abort() {
            tracing::error!(error = %err, "failed to restart worker");
        }
    })
    .context("failed to install Ctrl+C handler")?;
    Ok(transport)
}

fn run(
    transport: &WorkerTransport<StdioTerminal>,
    source: &[u8],
    frames: u32,
    frame_export: &str,
) -> Result<()> {
    let source = String::from_utf8_lossy(source);
    let mut continuing = match block_on(transport.compile_link_run(&source))? {
        Response::RunReport { continuing } => continuing,
        other => bail!("unexpected response {:?}", other),
    };

    let mut frame = 0;
    while continuing && frame < frames {
        continuing = match block_on(transport.call_continuation(frame_export))? {
            Response::RunReport { continuing } => continuing,
            other => bail!("unexpected response {:?}", other),
        };
        frame += 1;
    }
    tracing::debug!(frame, continuing, "program finished");
    Ok(())
}

/// Prints the diagnostics; returns whether any of them is an error
fn check(transport: &WorkerTransport<StdioTerminal>, source: &[u8], json: bool) -> Result<bool> {
    let diagnostics: Vec<Diagnostic> = match block_on(transport.run_cpp_check(source))? {
        Response::Diagnostics(diagnostics) => diagnostics,
        other => bail!("unexpected response {:?}", other),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&diagnostics)?);
    } else {
        for diagnostic in &diagnostics {
            transport.terminal().write(&diagnostic.render());
        }
    }
    Ok(diagnostics.iter().any(Diagnostic::is_error))
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    tracing::debug!(?config, "configuration loaded");

    match &args.command {
        Command::Run {
            file,
            frames,
            frame_export,
        } => {
            let source = read_source(file)?;
            let transport = start(StdioTerminal::new(), config)?;
            run(&transport, &source, *frames, frame_export)
        }
        Command::Check { file, json } => {
            let source = read_source(file)?;
            let terminal = if *json {
                StdioTerminal::on_stderr()
            } else {
                StdioTerminal::new()
            };
            let transport = start(terminal, config)?;
            if check(&transport, &source, *json)? {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
