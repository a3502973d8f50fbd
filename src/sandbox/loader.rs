//! Module compilation and export checks
//!
//! The engine parses and validates every binary; on top of that a module must
//! export a linear memory named `memory`. Execution units additionally need
//! `_start`; the filesystem bridge needs its node table exports.

use super::abi::exports;
use super::error::{SandboxError, SandboxResult};
use wasmi::{Engine, ExternType, Module};

/// Compile with `engine`, then require `memory` and every function in `required`
pub fn compile(engine: &Engine, bytes: &[u8], required: &[&str]) -> SandboxResult<Module> {
    let module = Module::new(engine, bytes).map_err(|e| SandboxError::InvalidModule {
        reason: e.to_string(),
    })?;
    check_exports(&module, required)?;
    Ok(module)
}

/// Fail with the first export `module` lacks
pub fn check_exports(module: &Module, required: &[&str]) -> SandboxResult<()> {
    let has_memory = module
        .exports()
        .any(|export| export.name() == exports::MEMORY && matches!(export.ty(), ExternType::Memory(_)));
    if !has_memory {
        return Err(SandboxError::MissingExport {
            name: exports::MEMORY.to_string(),
        });
    }

    let missing = required.iter().find(|&&name| {
        !module
            .exports()
            .any(|export| export.name() == name && matches!(export.ty(), ExternType::Func(_)))
    });
    match missing {
        Some(name) => Err(SandboxError::MissingExport {
            name: name.to_string(),
        }),
        None => Ok(()),
    }
}
