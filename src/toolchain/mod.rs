//! The compile, link and run pipeline
//!
//! A [`Toolchain`] owns the module cache and a readiness future for the
//! filesystem bridge. The bridge is ready once memfs is instantiated, its
//! `init` has run and the sysroot image is fully extracted into it; every
//! operation awaits that first.
//!
//! Each stage is an execution unit run against the shared bridge:
//!
//! ```text
//! program.cpp --clang--> program.o --wasm-ld--> program.wasm --run-->
//! ```

pub mod artifacts;
pub mod hostlog;

use crate::config::ToolchainConfig;
use crate::diagnostics::{self, Diagnostic};
use crate::platform::HostPort;
use crate::sandbox::abi::exports;
use crate::sandbox::cache::ModuleCache;
use crate::sandbox::error::{Outcome, SandboxError, SandboxResult};
use crate::sandbox::loader;
use crate::sandbox::unit::{ExecutionUnit, RunMode};
use crate::vfs::bridge::{self, Bridge, SharedBridge};
use crate::worker::shared::SharedInput;
use artifacts::ArtifactSource;
use futures::future::{BoxFuture, FutureExt, Shared};
use hostlog::{HostLog, GRAY};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use wasmi::{Engine, Module};

/// Source file the compiler reads
pub const INPUT: &str = "program.cpp";
/// Object file the compiler writes
pub const OBJECT: &str = "program.o";
/// Executable the linker writes
pub const EXECUTABLE: &str = "program.wasm";

const LIB_DIR: &str = "lib/wasm32-wasi";

type PendingBridge = Shared<BoxFuture<'static, SandboxResult<SharedBridge>>>;

/// How one stage is run
#[derive(Debug, Clone, Copy)]
struct Stage {
    writes_stdout: bool,
    gray: bool,
    mode: RunMode,
}

impl Stage {
    const TOOL: Stage = Stage {
        writes_stdout: true,
        gray: true,
        mode: RunMode::Standard,
    };
    const QUIET: Stage = Stage {
        writes_stdout: false,
        gray: false,
        mode: RunMode::Standard,
    };
    const PROGRAM: Stage = Stage {
        writes_stdout: true,
        gray: false,
        mode: RunMode::Standard,
    };
    const DIAGNOSTICS: Stage = Stage {
        writes_stdout: false,
        gray: false,
        mode: RunMode::Diagnostics,
    };
}

/// Header search flags shared by compile and analysis runs
fn sysroot_args(config: &ToolchainConfig) -> Vec<String> {
    [
        "-disable-free",
        "-isysroot",
        "/",
        "-internal-isystem",
        "/include/c++/v1",
        "-internal-isystem",
        "/include",
        "-internal-isystem",
        config.clang_resource_dir.as_str(),
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// `clang -cc1` command line for an object build
pub fn compile_args(config: &ToolchainConfig) -> Vec<String> {
    let mut args = strings(&["clang", "-cc1", "-Wall", "-emit-obj"]);
    args.extend(sysroot_args(config));
    args.extend(strings(&[
        "-ferror-limit",
        "19",
        "-fmessage-length",
        "80",
        "-fcolor-diagnostics",
        "-O2",
        "-o",
        OBJECT,
        "-x",
        "c++",
        INPUT,
    ]));
    args
}

/// `clang -cc1 -fsyntax-only` command line
pub fn diagnostics_args(config: &ToolchainConfig) -> Vec<String> {
    let mut args = strings(&["clang", "-cc1", "-fsyntax-only", "-Wall", "-x", "c++"]);
    args.extend(sysroot_args(config));
    args.push(INPUT.to_string());
    args
}

/// `wasm-ld` command line producing the executable
pub fn link_args(config: &ToolchainConfig, object: &str) -> Vec<String> {
    let mut args = strings(&["wasm-ld", "--no-threads", "--export-dynamic", "-z"]);
    args.push(format!("stack-size={}", config.stack_size));
    args.push(format!("-L{}", LIB_DIR));
    args.push(format!("{}/libunistd_ext.o", LIB_DIR));
    args.push(format!("{}/crt1.o", LIB_DIR));
    args.push(object.to_string());
    args.extend(strings(&[
        "-o",
        EXECUTABLE,
        "-lc",
        "-lc++",
        "-lc++abi",
        "-lunistd_ext",
    ]));
    args
}

/// Orchestrates the sandboxed toolchain against one filesystem bridge
pub struct Toolchain {
    config: ToolchainConfig,
    log: HostLog,
    cache: ModuleCache,
    ready: PendingBridge,
}

impl Toolchain {
    pub fn new(
        config: ToolchainConfig,
        source: Arc<dyn ArtifactSource>,
        port: Arc<dyn HostPort>,
        input: Arc<SharedInput>,
    ) -> Self {
        let engine = Engine::default();
        let log = HostLog::new(port);
        log.set_show_timing(config.show_timing);
        let cache = ModuleCache::new(engine.clone(), source.clone(), log.clone());
        let ready = prepare(&config, engine, source, log.clone(), input);
        Self {
            config,
            log,
            cache,
            ready,
        }
    }

    pub fn config(&self) -> &ToolchainConfig {
        &self.config
    }

    pub fn cache(&self) -> &ModuleCache {
        &self.cache
    }

    pub fn show_timing(&self) -> bool {
        self.log.show_timing()
    }

    pub fn set_show_timing(&self, on: bool) {
        self.log.set_show_timing(on);
    }

    /// The bridge, once memfs is up and the sysroot extracted
    pub async fn ready(&self) -> SandboxResult<SharedBridge> {
        self.ready.clone().await
    }

    /// Compile `source` to the object file; returns its path
    pub async fn compile(&self, source: &str) -> SandboxResult<&'static str> {
        let bridge = self.ready().await?;
        bridge::lock(&bridge)?.add_file(INPUT, source.as_bytes())?;

        let clang = self.cache.get(&self.config.clang).await?;
        self.run(&bridge, clang, Stage::TOOL, &compile_args(&self.config))?;
        Ok(OBJECT)
    }

    /// Link `object` against the sysroot runtime; returns the executable path
    pub async fn link(&self, object: &str) -> SandboxResult<&'static str> {
        let bridge = self.ready().await?;
        let lld = self.cache.get(&self.config.lld).await?;
        self.run(&bridge, lld, Stage::QUIET, &link_args(&self.config, object))?;
        Ok(EXECUTABLE)
    }

    /// Build and run `source`
    ///
    /// Returns the program's unit when it exited with the continuation code.
    pub async fn compile_link_run(&self, source: &str) -> SandboxResult<Option<ExecutionUnit>> {
        let object = self.compile(source).await?;
        let executable = self.link(object).await?;

        let bridge = self.ready().await?;
        let engine = self.cache.engine().clone();
        let module = self
            .log
            .task(&format!("{}Compiling {}", GRAY, executable), || {
                let mut guard = bridge::lock(&bridge)?;
                let bytes = guard.file_contents(executable)?;
                loader::compile(&engine, bytes, &[exports::START])
            })?;

        let (outcome, unit) = self.run(
            &bridge,
            Arc::new(module),
            Stage::PROGRAM,
            &[executable.to_string()],
        )?;
        Ok((outcome == Outcome::Continue).then_some(unit))
    }

    /// Syntax-only compile of `source`, returning what clang reported
    ///
    /// The run itself is best effort: its failure leaves whatever output was
    /// captured. Failing to get the toolchain ready is still an error.
    pub async fn run_analysis(&self, source: &[u8]) -> SandboxResult<Vec<Diagnostic>> {
        let bridge = self.ready().await?;
        let clang = self.cache.get(&self.config.clang).await?;
        bridge::lock(&bridge)?.add_file(INPUT, source)?;

        let captured = Arc::new(Mutex::new(String::new()));
        let sink = captured.clone();
        bridge::lock(&bridge)?.set_listener(Some(Box::new(move |text: &str| {
            if let Ok(mut out) = sink.lock() {
                out.push_str(text);
            }
        })));

        let result = self.run(&bridge, clang, Stage::DIAGNOSTICS, &diagnostics_args(&self.config));
        bridge::lock(&bridge)?.set_listener(None);
        if let Err(err) = result {
            tracing::debug!(error = %err, "analysis run failed");
        }

        let output = captured.lock().map(|out| out.clone()).unwrap_or_default();
        Ok(diagnostics::parse(&output))
    }

    /// Run one stage to completion
    fn run(
        &self,
        bridge: &SharedBridge,
        module: Arc<Module>,
        stage: Stage,
        args: &[String],
    ) -> SandboxResult<(Outcome, ExecutionUnit)> {
        let (program, rest) = args.split_first().ok_or_else(|| SandboxError::InstantiationFailed {
            reason: "empty command line".to_string(),
        })?;

        if stage.writes_stdout {
            let color = if stage.gray { GRAY } else { "" };
            self.log.line(&format!("{}{}\r\n", color, args.join(" ")));
        }

        let start = Instant::now();
        let mut unit = ExecutionUnit::new(module, bridge.clone(), self.log.port().clone(), program, rest)
            .with_stdout(stage.writes_stdout);
        unit.instantiate()?;
        let instantiated = Instant::now();
        let outcome = unit.run(stage.mode);
        let finished = Instant::now();

        match (stage.mode, &outcome) {
            (RunMode::Diagnostics, Outcome::Exited(_)) => {}
            _ => {
                outcome.clone().into_result(program)?;
            }
        }

        if stage.writes_stdout {
            self.log.write("\r\n");
            self.log
                .run_timing(instantiated - start, finished - instantiated);
        }
        Ok((outcome, unit))
    }
}

/// Bring up the bridge: instantiate memfs, then extract the sysroot into it
fn prepare(
    config: &ToolchainConfig,
    engine: Engine,
    source: Arc<dyn ArtifactSource>,
    log: HostLog,
    input: Arc<SharedInput>,
) -> PendingBridge {
    let memfs = config.memfs.clone();
    let sysroot = config.sysroot.clone();
    async move {
        let bytes = source
            .fetch(&memfs)
            .map_err(|e| SandboxError::ArtifactUnavailable {
                name: memfs.clone(),
                reason: e.to_string(),
            })?;
        let module = loader::compile(&engine, &bytes, &[])?;
        let bridge = Bridge::new(&engine, &module, log.port().clone(), input)?.shared();

        let message = format!("{}Untarring {}", GRAY, sysroot);
        let entries = log.task(&message, || {
            let image = source
                .fetch(&sysroot)
                .map_err(|e| SandboxError::ArtifactUnavailable {
                    name: sysroot.clone(),
                    reason: e.to_string(),
                })?;
            bridge::lock(&bridge)?.untar(&image)
        })?;
        tracing::info!(entries, "sysroot extracted");
        Ok(bridge)
    }
    .boxed()
    .shared()
}
