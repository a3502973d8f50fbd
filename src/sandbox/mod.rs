//! WASM sandbox for toolchain modules
//!
//! Each toolchain stage (compiler, linker, user program) runs as an
//! [`unit::ExecutionUnit`]: a fresh store and instance over a cached, compiled
//! module. Units see a small `wasi_unstable` surface:
//!
//! ```text
//! proc_exit, environ_*, args_*,        served by the unit
//! random_get, clock_time_get,
//! poll_oneoff
//!
//! fd_*, path_*, ...                    forwarded to the memfs bridge
//! ```
//!
//! A call into a sandboxed module ends in one of the [`error::Outcome`]s; exit,
//! abort and faults travel out of the guest as a [`error::Signal`] host error.

pub mod abi;
pub mod cache;
pub mod error;
pub mod loader;
pub mod memory;
pub(crate) mod syscalls;
pub mod unit;

#[cfg(test)]
mod tests;

/// Identity of an execution unit; never reused within a process
pub type UnitId = u64;

pub use cache::ModuleCache;
pub use error::{Outcome, SandboxError, SandboxResult, Signal};
pub use memory::ByteAccessor;
pub use unit::{Continuation, ExecutionUnit, RunMode, UnitPhase};
