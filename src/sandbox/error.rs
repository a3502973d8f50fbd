//! Error types for the sandbox
//!
//! `SandboxError` is what callers see. `Signal` is the host error that carries
//! process exit, abort and faults out of a guest call; the executor turns it
//! into an [`Outcome`] before anything leaves the sandbox.

use super::abi::CONTINUE_EXIT_CODE;
use crate::vfs::archive::ArchiveError;
use thiserror::Error;

/// Result type for sandbox operations
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Errors that can occur while loading, wiring and running sandboxed modules
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxError {
    /// An artifact could not be fetched
    #[error("artifact '{name}' unavailable: {reason}")]
    ArtifactUnavailable { name: String, reason: String },

    /// Module binary is malformed or invalid
    #[error("invalid WASM module: {reason}")]
    InvalidModule { reason: String },

    /// Required export is missing
    #[error("missing required export: '{name}'")]
    MissingExport { name: String },

    /// Module instantiation failed
    #[error("module instantiation failed: {reason}")]
    InstantiationFailed { reason: String },

    /// Memory access out of bounds
    #[error("memory access out of bounds: address {address} + size {size} > memory size {memory_size}")]
    MemoryAccessOutOfBounds {
        address: u32,
        size: u32,
        memory_size: u32,
    },

    /// Word access at an address that is not 4-byte aligned
    #[error("misaligned {width}-bit access at address {address}")]
    Misaligned { address: u32, width: u32 },

    /// The bridge has no node for this path
    #[error("file not found: {path}")]
    FileNotFound { path: String },

    /// The packaged root image could not be unpacked
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// A stage exited with a non-zero code
    #[error("{program} exited with code {code}")]
    Exited { program: String, code: i32 },

    /// The module called abort
    #[error("{program} aborted")]
    Aborted { program: String },

    /// Trap, unimplemented syscall or violated invariant
    #[error("{program} faulted: {detail}")]
    Faulted { program: String, detail: String },

    /// The bridge is not usable (poisoned lock, torn down worker, ...)
    #[error("filesystem bridge unavailable: {reason}")]
    BridgeUnavailable { reason: String },
}

impl SandboxError {
    pub(crate) fn instantiation(err: impl std::fmt::Display) -> Self {
        Self::InstantiationFailed {
            reason: err.to_string(),
        }
    }
}

/// Control-flow signal raised by a syscall inside a guest call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Signal {
    /// `proc_exit(code)`
    #[error("process exited with code {0}.")]
    Exit(i32),

    /// The module called `abort`
    #[error("abort")]
    Abort,

    /// A syscall the sandbox does not provide
    #[error("{module}.{name} not implemented.")]
    NotImplemented { module: String, name: String },

    /// Invariant violation; always fatal for the run
    #[error("{0}")]
    Fault(String),
}

impl Signal {
    pub fn fault(detail: impl Into<String>) -> Self {
        Self::Fault(detail.into())
    }

    pub fn not_implemented(module: &str, name: &str) -> Self {
        Self::NotImplemented {
            module: module.to_string(),
            name: name.to_string(),
        }
    }

    /// Recover the signal carried out of a guest call; plain traps become faults
    pub fn from_error(err: &wasmi::Error) -> Self {
        match err.downcast_ref::<Signal>() {
            Some(signal) => signal.clone(),
            None => Signal::Fault(err.to_string()),
        }
    }
}

impl wasmi::core::HostError for Signal {}

impl From<Signal> for wasmi::Error {
    fn from(signal: Signal) -> Self {
        wasmi::Error::host(signal)
    }
}

impl From<SandboxError> for Signal {
    fn from(err: SandboxError) -> Self {
        Signal::Fault(err.to_string())
    }
}

impl From<SandboxError> for wasmi::Error {
    fn from(err: SandboxError) -> Self {
        wasmi::Error::host(Signal::from(err))
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Exited with the sentinel code; the host may keep scheduling continuations
    Continue,
    /// Exited (or returned from `_start`) with this code
    Exited(i32),
    /// The module called abort
    Aborted,
    /// Trap, unimplemented syscall or invariant violation
    Faulted(String),
}

impl Outcome {
    /// Classify the signal that ended a run
    pub fn from_signal(signal: Signal) -> Self {
        match signal {
            Signal::Exit(CONTINUE_EXIT_CODE) => Outcome::Continue,
            Signal::Exit(code) => Outcome::Exited(code),
            Signal::Abort => Outcome::Aborted,
            signal @ Signal::NotImplemented { .. } => Outcome::Faulted(signal.to_string()),
            Signal::Fault(detail) => Outcome::Faulted(detail),
        }
    }

    /// Clean completion with nothing more to do
    pub fn is_clean(&self) -> bool {
        matches!(self, Outcome::Exited(0))
    }

    /// Code reported in the exit banner
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Continue => CONTINUE_EXIT_CODE,
            Outcome::Exited(code) => *code,
            Outcome::Aborted | Outcome::Faulted(_) => 1,
        }
    }

    /// Text shown in parentheses after the exit code
    pub fn message(&self) -> String {
        match self {
            Outcome::Continue | Outcome::Exited(_) => {
                Signal::Exit(self.exit_code()).to_string()
            }
            Outcome::Aborted => Signal::Abort.to_string(),
            Outcome::Faulted(detail) => detail.clone(),
        }
    }

    /// Turn a failed stage into an error naming `program`
    pub fn into_result(self, program: &str) -> SandboxResult<Outcome> {
        match self {
            Outcome::Continue | Outcome::Exited(0) => Ok(self),
            Outcome::Exited(code) => Err(SandboxError::Exited {
                program: program.to_string(),
                code,
            }),
            Outcome::Aborted => Err(SandboxError::Aborted {
                program: program.to_string(),
            }),
            Outcome::Faulted(detail) => Err(SandboxError::Faulted {
                program: program.to_string(),
                detail,
            }),
        }
    }
}
