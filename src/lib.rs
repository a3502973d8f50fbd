//! sandcc - a sandboxed in-process C++ toolchain
//!
//! The compiler, the linker and the user's program all run as WASM modules
//! inside one process:
//! - Sandbox: every stage is an execution unit with its own store
//! - Files: an in-memory filesystem module, filled from a sysroot tarball
//! - Worker: the toolchain runs on a compute thread behind a message channel;
//!   the interactive side can abort it at any time
//!
//! Nothing here touches the host filesystem except the artifact source the
//! modules and the sysroot image are read from.

pub mod config;
pub mod diagnostics;
pub mod platform;
pub mod sandbox;
pub mod toolchain;
pub mod vfs;
pub mod worker;

pub use config::ToolchainConfig;
pub use diagnostics::{Diagnostic, Severity};
pub use sandbox::{Outcome, SandboxError, SandboxResult};
pub use toolchain::Toolchain;
pub use worker::{TransportError, WorkerTransport};
