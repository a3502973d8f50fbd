//! Execution units
//!
//! An execution unit is one instantiated toolchain module (compiler, linker
//! or user program) with its own store, argv and environment. Process
//! syscalls are served here; every other `wasi_unstable` import is a
//! trampoline into the filesystem bridge.

use super::abi::{self, exports, CONTINUE_EXIT_CODE, WASI_MODULE};
use super::error::{Outcome, SandboxError, SandboxResult, Signal};
use super::memory::exported_memory;
use super::{syscalls, UnitId};
use crate::platform::HostPort;
use crate::vfs::bridge::{self, SharedBridge};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use wasmi::{Caller, ExternType, Func, FuncType, Instance, Linker, Module, Store, Val};

static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

/// Whether exits are reported to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    #[default]
    Standard,
    /// Syntax-only pass: every exit is a benign completion
    Diagnostics,
}

/// Lifecycle of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitPhase {
    Created,
    Instantiated,
    Running,
    Finished,
}

/// Permission to keep calling into a unit after it exited
#[derive(Debug, Clone)]
pub struct Continuation(Arc<AtomicBool>);

impl Continuation {
    fn granted() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_allowed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn revoke(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Data owned by a unit's store
pub struct UnitState {
    pub(crate) id: UnitId,
    pub(crate) argv: Vec<String>,
    pub(crate) environ: Vec<String>,
    pub(crate) bridge: SharedBridge,
}

/// One sandboxed module run
pub struct ExecutionUnit {
    id: UnitId,
    program: String,
    module: Arc<Module>,
    store: Store<UnitState>,
    bridge: SharedBridge,
    port: Arc<dyn HostPort>,
    writes_stdout: bool,
    continuation: Continuation,
    phase: UnitPhase,
    instance: Option<Instance>,
}

impl std::fmt::Debug for ExecutionUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionUnit")
            .field("id", &self.id)
            .field("program", &self.program)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl ExecutionUnit {
    /// Prepare a unit; argv is `program` followed by `args`
    pub fn new(
        module: Arc<Module>,
        bridge: SharedBridge,
        port: Arc<dyn HostPort>,
        program: &str,
        args: &[String],
    ) -> Self {
        let id = NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed);
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(program.to_string());
        argv.extend(args.iter().cloned());

        let state = UnitState {
            id,
            argv,
            environ: abi::environ_strings(),
            bridge: bridge.clone(),
        };
        let store = Store::new(module.engine(), state);

        Self {
            id,
            program: program.to_string(),
            module,
            store,
            bridge,
            port,
            writes_stdout: true,
            continuation: Continuation::granted(),
            phase: UnitPhase::Created,
            instance: None,
        }
    }

    /// Route the unit's output to the host stream or only to listeners
    pub fn with_stdout(mut self, writes_stdout: bool) -> Self {
        self.writes_stdout = writes_stdout;
        self
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn phase(&self) -> UnitPhase {
        self.phase
    }

    pub fn writes_stdout(&self) -> bool {
        self.writes_stdout
    }

    /// Shareable handle on the continuation permission
    pub fn continuation(&self) -> Continuation {
        self.continuation.clone()
    }

    /// Link imports, instantiate and wire the unit into the bridge
    pub fn instantiate(&mut self) -> SandboxResult<()> {
        if self.phase != UnitPhase::Created {
            return Err(SandboxError::InstantiationFailed {
                reason: format!("{} is already instantiated", self.program),
            });
        }

        let mut linker = Linker::new(self.module.engine());
        syscalls::register(&mut linker)?;
        self.link_bridge(&mut linker)?;

        let instance = linker
            .instantiate(&mut self.store, &self.module)
            .and_then(|pre| pre.start(&mut self.store))
            .map_err(SandboxError::instantiation)?;

        if instance.get_memory(&self.store, exports::MEMORY).is_none() {
            return Err(SandboxError::MissingExport {
                name: exports::MEMORY.to_string(),
            });
        }
        if instance.get_func(&self.store, exports::START).is_none() {
            return Err(SandboxError::MissingExport {
                name: exports::START.to_string(),
            });
        }

        bridge::lock(&self.bridge)?.wire(self.id, self.writes_stdout);
        self.instance = Some(instance);
        self.phase = UnitPhase::Instantiated;
        tracing::debug!(unit = self.id, program = %self.program, "unit instantiated");
        Ok(())
    }

    /// Define every non-process `wasi_unstable` function import
    fn link_bridge(&mut self, linker: &mut Linker<UnitState>) -> SandboxResult<()> {
        let forwarded: Vec<(String, FuncType)> = self
            .module
            .imports()
            .filter(|import| import.module() == WASI_MODULE)
            .filter(|import| !abi::is_process_syscall(import.name()))
            .filter_map(|import| match import.ty() {
                ExternType::Func(ty) => Some((import.name().to_string(), ty.clone())),
                _ => None,
            })
            .collect();

        for (name, ty) in forwarded {
            let provided = bridge::lock(&self.bridge)?.has_function(&name);
            let func = if provided {
                trampoline(&mut self.store, name.clone(), ty)
            } else {
                tracing::trace!(import = %name, "no filesystem export, linking stub");
                stub(&mut self.store, name.clone(), ty)
            };
            linker
                .define(WASI_MODULE, &name, func)
                .map_err(SandboxError::instantiation)?;
        }
        Ok(())
    }

    /// Invoke `_start` and classify how it ended
    pub fn run(&mut self, mode: RunMode) -> Outcome {
        let Some(instance) = self.instance.filter(|_| self.phase == UnitPhase::Instantiated)
        else {
            return Outcome::Faulted(format!("{} is not ready to run", self.program));
        };
        self.invoke(instance, exports::START, mode)
    }

    /// Call a zero-argument export on a finished unit that kept its permission
    pub fn call_continuation(&mut self, export: &str) -> SandboxResult<Outcome> {
        let instance = match self.instance {
            Some(instance) if self.phase == UnitPhase::Finished => instance,
            _ => {
                return Err(SandboxError::Faulted {
                    program: self.program.clone(),
                    detail: "continuation before the program finished".to_string(),
                });
            }
        };
        if !self.continuation.is_allowed() {
            return Err(SandboxError::Faulted {
                program: self.program.clone(),
                detail: "continuation permission revoked".to_string(),
            });
        }
        if instance.get_func(&self.store, export).is_none() {
            return Err(SandboxError::MissingExport {
                name: export.to_string(),
            });
        }

        // another unit may have taken the slot since this one finished
        bridge::lock(&self.bridge)?.wire(self.id, self.writes_stdout);
        Ok(self.invoke(instance, export, RunMode::Standard))
    }

    fn invoke(&mut self, instance: Instance, export: &str, mode: RunMode) -> Outcome {
        self.phase = UnitPhase::Running;
        let result = instance
            .get_typed_func::<(), ()>(&self.store, export)
            .and_then(|func| func.call(&mut self.store, ()));
        self.phase = UnitPhase::Finished;

        let outcome = match result {
            Ok(()) => Outcome::Exited(0),
            Err(err) => Outcome::from_signal(Signal::from_error(&err)),
        };
        self.settle(&outcome, mode);
        outcome
    }

    /// Apply the exit policy
    fn settle(&self, outcome: &Outcome, mode: RunMode) {
        // output ends before any banner
        if let Ok(mut bridge) = bridge::lock(&self.bridge) {
            bridge.flush_output(self.id);
        }
        match outcome {
            Outcome::Exited(0) => {}
            Outcome::Continue => {
                tracing::debug!(unit = self.id, "exit {:#x} keeps continuations", CONTINUE_EXIT_CODE);
            }
            _ => {
                self.continuation.revoke();
                tracing::debug!(
                    unit = self.id,
                    program = %self.program,
                    ?outcome,
                    "run ended, continuations revoked"
                );
                if mode == RunMode::Standard && self.writes_stdout {
                    self.port.write(&format!(
                        "\x1b[91mExit code: {} ({})\x1b[0m\r\n",
                        outcome.exit_code(),
                        outcome.message()
                    ));
                }
            }
        }
    }
}

impl Drop for ExecutionUnit {
    fn drop(&mut self) {
        if let Ok(mut bridge) = self.bridge.lock() {
            bridge.unwire(self.id);
        }
    }
}

/// Forward a call to the bridge export of the same name
fn trampoline(store: &mut Store<UnitState>, name: String, ty: FuncType) -> Func {
    Func::new(
        store,
        ty,
        move |mut caller: Caller<'_, UnitState>, params: &[Val], results: &mut [Val]| {
            let unit = caller.data().id;
            let shared = caller.data().bridge.clone();
            let memory = exported_memory(&caller)?;
            let host_memory = memory.data_mut(&mut caller);
            let mut bridge = shared
                .lock()
                .map_err(|_| Signal::fault("filesystem bridge poisoned"))?;
            bridge.forward(unit, &name, host_memory, params, results)?;
            Ok(())
        },
    )
}

/// Import with no provider; fatal when called
fn stub(store: &mut Store<UnitState>, name: String, ty: FuncType) -> Func {
    Func::new(
        store,
        ty,
        move |_caller: Caller<'_, UnitState>, _params: &[Val], _results: &mut [Val]| {
            Err(Signal::not_implemented(WASI_MODULE, &name).into())
        },
    )
}
