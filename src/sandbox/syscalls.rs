//! Process syscalls served by the execution unit itself
//!
//! Everything else a module imports from `wasi_unstable` belongs to the
//! filesystem bridge. This table is fixed: a module importing one of these
//! names with a different signature fails to link.

use super::abi::{ESUCCESS, WASI_MODULE};
use super::error::{SandboxError, SandboxResult, Signal};
use super::memory::{exported_memory, ByteAccessor};
use super::unit::UnitState;
use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};
use wasmi::{Caller, Linker};

/// Write the count and packed size of `strings`
pub fn write_sizes(
    mem: &mut ByteAccessor<'_>,
    strings: &[String],
    count_out: u32,
    size_out: u32,
) -> SandboxResult<()> {
    mem.write_u32(count_out, strings.len() as u32)?;
    mem.write_u32(size_out, super::abi::packed_size(strings) as u32)
}

/// Lay out `strings` at `buf` and their addresses at `ptrs`, then a null pointer
pub fn write_strings(
    mem: &mut ByteAccessor<'_>,
    strings: &[String],
    mut ptrs: u32,
    mut buf: u32,
) -> SandboxResult<()> {
    for s in strings {
        mem.write_u32(ptrs, buf)?;
        ptrs += 4;
        buf += mem.write_cstr(buf, s)?;
    }
    mem.write_u32(ptrs, 0)
}

/// Wall clock in nanoseconds, split into low and high words
pub fn now_ns() -> (u32, u32) {
    let ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    (ns as u32, (ns >> 32) as u32)
}

/// Apply `f` to the caller's memory and unit state
fn with_memory<R>(
    caller: &mut Caller<'_, UnitState>,
    f: impl FnOnce(&mut ByteAccessor<'_>, &UnitState) -> SandboxResult<R>,
) -> Result<R, wasmi::Error> {
    let memory = exported_memory(caller)?;
    let (bytes, state) = memory.data_and_store_mut(caller);
    Ok(f(&mut ByteAccessor::new(bytes), state)?)
}

/// Link the process syscalls into `wasi_unstable`
pub(crate) fn register(linker: &mut Linker<UnitState>) -> SandboxResult<()> {
    linker
        .func_wrap(
            WASI_MODULE,
            "proc_exit",
            |_caller: Caller<'_, UnitState>, code: i32| -> Result<(), wasmi::Error> {
                Err(Signal::Exit(code).into())
            },
        )
        .map_err(SandboxError::instantiation)?;

    linker
        .func_wrap(
            WASI_MODULE,
            "environ_sizes_get",
            |mut caller: Caller<'_, UnitState>, count_out: u32, size_out: u32| -> Result<i32, wasmi::Error> {
                with_memory(&mut caller, |mem, state| {
                    write_sizes(mem, &state.environ, count_out, size_out)
                })?;
                Ok(ESUCCESS)
            },
        )
        .map_err(SandboxError::instantiation)?;

    linker
        .func_wrap(
            WASI_MODULE,
            "environ_get",
            |mut caller: Caller<'_, UnitState>, ptrs: u32, buf: u32| -> Result<i32, wasmi::Error> {
                with_memory(&mut caller, |mem, state| {
                    write_strings(mem, &state.environ, ptrs, buf)
                })?;
                Ok(ESUCCESS)
            },
        )
        .map_err(SandboxError::instantiation)?;

    linker
        .func_wrap(
            WASI_MODULE,
            "args_sizes_get",
            |mut caller: Caller<'_, UnitState>, argc_out: u32, size_out: u32| -> Result<i32, wasmi::Error> {
                with_memory(&mut caller, |mem, state| {
                    write_sizes(mem, &state.argv, argc_out, size_out)
                })?;
                Ok(ESUCCESS)
            },
        )
        .map_err(SandboxError::instantiation)?;

    linker
        .func_wrap(
            WASI_MODULE,
            "args_get",
            |mut caller: Caller<'_, UnitState>, ptrs: u32, buf: u32| -> Result<i32, wasmi::Error> {
                with_memory(&mut caller, |mem, state| {
                    write_strings(mem, &state.argv, ptrs, buf)
                })?;
                Ok(ESUCCESS)
            },
        )
        .map_err(SandboxError::instantiation)?;

    linker
        .func_wrap(
            WASI_MODULE,
            "random_get",
            |mut caller: Caller<'_, UnitState>, buf: u32, len: u32| -> Result<i32, wasmi::Error> {
                with_memory(&mut caller, |mem, _| {
                    rand::rng().fill_bytes(mem.bytes_mut(buf, len)?);
                    Ok(())
                })?;
                Ok(ESUCCESS)
            },
        )
        .map_err(SandboxError::instantiation)?;

    // clock id and precision are ignored: every clock reads the wall clock
    linker
        .func_wrap(
            WASI_MODULE,
            "clock_time_get",
            |mut caller: Caller<'_, UnitState>, _id: u32, _precision: u64, out: u32| -> Result<i32, wasmi::Error> {
                let (low, high) = now_ns();
                with_memory(&mut caller, |mem, _| mem.write_u64(out, low, high))?;
                Ok(ESUCCESS)
            },
        )
        .map_err(SandboxError::instantiation)?;

    linker
        .func_wrap(
            WASI_MODULE,
            "poll_oneoff",
            |_caller: Caller<'_, UnitState>,
             _subscriptions: u32,
             _events: u32,
             _count: u32,
             _nevents_out: u32|
             -> Result<i32, wasmi::Error> {
                Err(Signal::not_implemented(WASI_MODULE, "poll_oneoff").into())
            },
        )
        .map_err(SandboxError::instantiation)?;

    Ok(())
}
