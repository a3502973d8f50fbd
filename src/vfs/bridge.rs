//! Filesystem bridge
//!
//! The in-memory filesystem is itself a sandboxed module (`memfs`) running in
//! a store of its own. Toolchain modules never share its address space: their
//! file and stream syscalls are forwarded to the memfs export of the same
//! name, and memfs moves bytes across with `copy_in`/`copy_out` imports that
//! the host services against the calling unit's memory.
//!
//! Exactly one unit is wired at a time. A forwarded call lends the bridge a
//! window onto that unit's memory for the length of the call and no longer.

use super::archive::{Archive, EntryKind};
use crate::platform::HostPort;
use crate::sandbox::abi::{exports, fd, BRIDGE_MODULE, ESUCCESS, WASI_MODULE};
use crate::sandbox::error::{SandboxError, SandboxResult, Signal};
use crate::sandbox::memory::{exported_memory, ByteAccessor};
use crate::sandbox::UnitId;
use crate::worker::shared::SharedInput;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard};
use wasmi::{Caller, Engine, Instance, Linker, Memory, Module, Store, TypedFunc, Val};

/// Name used when the bridge itself fails
const PROGRAM: &str = "memfs";

/// The bridge as shared by the orchestrator and every unit trampoline
pub type SharedBridge = Arc<Mutex<Bridge>>;

/// Observer for everything written through `host_write`
pub type OutputListener = Box<dyn FnMut(&str) + Send>;

/// Lock a shared bridge, failing instead of panicking on poison
pub fn lock(bridge: &SharedBridge) -> SandboxResult<MutexGuard<'_, Bridge>> {
    bridge.lock().map_err(|_| SandboxError::BridgeUnavailable {
        reason: "bridge lock poisoned".to_string(),
    })
}

/// The unit currently allowed to use the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Wiring {
    unit: UnitId,
    writes_stdout: bool,
}

/// Borrowed view of the wired unit's linear memory
struct HostWindow {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: a window only exists while `Bridge::forward` runs, on the thread
// that holds the unit's exclusive memory borrow for that whole call.
unsafe impl Send for HostWindow {}

impl HostWindow {
    fn new(bytes: &mut [u8]) -> Self {
        Self {
            ptr: NonNull::new(bytes.as_mut_ptr()).unwrap_or(NonNull::dangling()),
            len: bytes.len(),
        }
    }
}

/// Host-side state of the memfs store
struct BridgeState {
    port: Arc<dyn HostPort>,
    input: Arc<SharedInput>,
    wired: Option<Wiring>,
    window: Option<HostWindow>,
    listener: Option<OutputListener>,
    /// Input bytes read from the host but not yet consumed by the guest
    pending_input: Vec<u8>,
    /// Trailing bytes of a UTF-8 sequence split across writes
    partial_output: Utf8Carry,
}

impl BridgeState {
    fn ensure_open(&self) -> Result<(), Signal> {
        if self.port.is_closed() {
            return Err(Signal::fault("worker terminated"));
        }
        Ok(())
    }

    fn emit(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if self.wired.is_some_and(|w| w.writes_stdout) {
            self.port.write(text);
        }
        if let Some(listener) = self.listener.as_mut() {
            listener(text);
        }
    }

    /// Write out whatever incomplete sequence is still held back
    fn flush_output(&mut self) {
        let rest = self.partial_output.finish();
        self.emit(&rest);
    }
}

/// Decodes a byte stream written in arbitrary chunks
///
/// A multi-byte character cut by a write boundary is held until the next
/// chunk completes it. Bytes that can never form valid UTF-8 become U+FFFD.
#[derive(Debug, Default)]
struct Utf8Carry {
    held: Vec<u8>,
}

impl Utf8Carry {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.held.extend_from_slice(bytes);
        let mut text = String::with_capacity(self.held.len());
        let mut rest = &self.held[..];
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        // incomplete sequence at the end; wait for more
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        let consumed = self.held.len() - rest.len();
        self.held.drain(..consumed);
        text
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.held).into_owned();
        self.held.clear();
        rest
    }
}

/// The wired unit's memory, valid only inside a forwarded call
fn host_bytes(window: &mut Option<HostWindow>) -> Result<&mut [u8], Signal> {
    let window = window
        .as_mut()
        .ok_or_else(|| Signal::fault("no unit memory wired to the filesystem"))?;
    // SAFETY: see `HostWindow`; the slice does not outlive the forwarded call.
    Ok(unsafe { std::slice::from_raw_parts_mut(window.ptr.as_ptr(), window.len) })
}

struct BridgeExports {
    init: TypedFunc<(), ()>,
    get_path_buf: TypedFunc<(), u32>,
    add_directory_node: TypedFunc<u32, u32>,
    add_file_node: TypedFunc<(u32, u32), u32>,
    get_file_node_address: TypedFunc<u32, u32>,
    get_file_node_size: TypedFunc<u32, u32>,
    find_node: TypedFunc<u32, u32>,
}

impl BridgeExports {
    fn resolve(instance: &Instance, store: &Store<BridgeState>) -> SandboxResult<Self> {
        Ok(Self {
            init: typed(instance, store, exports::INIT)?,
            get_path_buf: typed(instance, store, exports::GET_PATH_BUF)?,
            add_directory_node: typed(instance, store, exports::ADD_DIRECTORY_NODE)?,
            add_file_node: typed(instance, store, exports::ADD_FILE_NODE)?,
            get_file_node_address: typed(instance, store, exports::GET_FILE_NODE_ADDRESS)?,
            get_file_node_size: typed(instance, store, exports::GET_FILE_NODE_SIZE)?,
            find_node: typed(instance, store, exports::FIND_NODE)?,
        })
    }
}

fn typed<P, R>(
    instance: &Instance,
    store: &Store<BridgeState>,
    name: &str,
) -> SandboxResult<TypedFunc<P, R>>
where
    P: wasmi::WasmParams,
    R: wasmi::WasmResults,
{
    if instance.get_func(store, name).is_none() {
        return Err(SandboxError::MissingExport {
            name: name.to_string(),
        });
    }
    instance
        .get_typed_func::<P, R>(store, name)
        .map_err(|e| SandboxError::InstantiationFailed {
            reason: format!("{}: {}", name, e),
        })
}

/// A running memfs instance plus the host half of its syscalls
pub struct Bridge {
    store: Store<BridgeState>,
    instance: Instance,
    memory: Memory,
    exports: BridgeExports,
}

impl Bridge {
    /// Instantiate memfs and run its `init`
    pub fn new(
        engine: &Engine,
        module: &Module,
        port: Arc<dyn HostPort>,
        input: Arc<SharedInput>,
    ) -> SandboxResult<Self> {
        let state = BridgeState {
            port,
            input,
            wired: None,
            window: None,
            listener: None,
            pending_input: Vec::new(),
            partial_output: Utf8Carry::default(),
        };
        let mut store = Store::new(engine, state);
        let mut linker = Linker::new(engine);
        register_imports(&mut linker)?;

        let instance = linker
            .instantiate(&mut store, module)
            .and_then(|pre| pre.start(&mut store))
            .map_err(SandboxError::instantiation)?;
        let memory = instance
            .get_memory(&store, exports::MEMORY)
            .ok_or_else(|| SandboxError::MissingExport {
                name: exports::MEMORY.to_string(),
            })?;
        let exports = BridgeExports::resolve(&instance, &store)?;

        let mut bridge = Self {
            store,
            instance,
            memory,
            exports,
        };
        let init = bridge.exports.init;
        bridge.call(init, ())?;
        tracing::debug!("filesystem bridge initialised");
        Ok(bridge)
    }

    /// Wrap for sharing with units
    pub fn shared(self) -> SharedBridge {
        Arc::new(Mutex::new(self))
    }

    fn call<P, R>(&mut self, func: TypedFunc<P, R>, params: P) -> SandboxResult<R>
    where
        P: wasmi::WasmParams,
        R: wasmi::WasmResults,
    {
        func.call(&mut self.store, params).map_err(|err| match Signal::from_error(&err) {
            Signal::Abort => SandboxError::Aborted {
                program: PROGRAM.to_string(),
            },
            signal => SandboxError::Faulted {
                program: PROGRAM.to_string(),
                detail: signal.to_string(),
            },
        })
    }

    fn memory(&mut self) -> ByteAccessor<'_> {
        ByteAccessor::of(&self.memory, &mut self.store)
    }

    /// Copy `path` into the module's path buffer; returns its length
    fn stage_path(&mut self, path: &str) -> SandboxResult<u32> {
        let get_path_buf = self.exports.get_path_buf;
        let buf = self.call(get_path_buf, ())?;
        self.memory().write_bytes(buf, path.as_bytes())
    }

    fn find(&mut self, path: &str) -> SandboxResult<u32> {
        let len = self.stage_path(path)?;
        let find_node = self.exports.find_node;
        self.call(find_node, len)
    }

    pub fn add_directory(&mut self, path: &str) -> SandboxResult<()> {
        let len = self.stage_path(path)?;
        let add_directory_node = self.exports.add_directory_node;
        self.call(add_directory_node, len)?;
        Ok(())
    }

    /// Create (or shadow) a file node holding `contents`
    pub fn add_file(&mut self, path: &str, contents: &[u8]) -> SandboxResult<()> {
        let len = self.stage_path(path)?;
        let add_file_node = self.exports.add_file_node;
        let inode = self.call(add_file_node, (len, contents.len() as u32))?;
        let get_file_node_address = self.exports.get_file_node_address;
        let address = self.call(get_file_node_address, inode)?;
        // node creation may have grown memory; take a fresh view
        self.memory().write_bytes(address, contents)?;
        Ok(())
    }

    pub fn check_file_exists(&mut self, path: &str) -> SandboxResult<bool> {
        Ok(self.find(path)? != 0)
    }

    /// Borrow a file's bytes straight out of memfs memory
    pub fn file_contents(&mut self, path: &str) -> SandboxResult<&[u8]> {
        let inode = self.find(path)?;
        if inode == 0 {
            return Err(SandboxError::FileNotFound {
                path: path.to_string(),
            });
        }
        let get_file_node_address = self.exports.get_file_node_address;
        let get_file_node_size = self.exports.get_file_node_size;
        let address = self.call(get_file_node_address, inode)?;
        let size = self.call(get_file_node_size, inode)?;

        let bytes = self.memory.data(&self.store);
        let end = address as usize + size as usize;
        if end > bytes.len() {
            return Err(SandboxError::MemoryAccessOutOfBounds {
                address,
                size,
                memory_size: bytes.len() as u32,
            });
        }
        Ok(&bytes[address as usize..end])
    }

    /// Extract a ustar image into the filesystem; returns the entry count
    pub fn untar(&mut self, image: &[u8]) -> SandboxResult<usize> {
        Archive::new(image).unpack(|entry| match entry.kind {
            EntryKind::File => self.add_file(&entry.name, entry.contents.unwrap_or_default()),
            EntryKind::Directory => self.add_directory(&entry.name),
        })
    }

    /// Install or remove the output listener
    pub fn set_listener(&mut self, listener: Option<OutputListener>) {
        self.store.data_mut().listener = listener;
    }

    /// Make `unit` the one whose memory forwarded calls operate on
    ///
    /// Unread input survives a unit re-wiring itself; a different unit
    /// starts with none.
    pub fn wire(&mut self, unit: UnitId, writes_stdout: bool) {
        let state = self.store.data_mut();
        if state.wired.is_some_and(|w| w.unit != unit) {
            state.flush_output();
            state.pending_input.clear();
        }
        state.wired = Some(Wiring {
            unit,
            writes_stdout,
        });
        tracing::trace!(unit, writes_stdout, "unit wired to filesystem");
    }

    /// Clear the slot if `unit` still holds it
    pub fn unwire(&mut self, unit: UnitId) {
        let state = self.store.data_mut();
        if state.wired.is_some_and(|w| w.unit == unit) {
            state.flush_output();
            state.pending_input.clear();
            state.wired = None;
            tracing::trace!(unit, "unit unwired from filesystem");
        }
    }

    /// Emit output `unit` left mid-character, if it holds the slot
    pub fn flush_output(&mut self, unit: UnitId) {
        let state = self.store.data_mut();
        if state.wired.is_some_and(|w| w.unit == unit) {
            state.flush_output();
        }
    }

    pub fn wired_unit(&self) -> Option<UnitId> {
        self.store.data().wired.map(|w| w.unit)
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.instance.get_func(&self.store, name).is_some()
    }

    /// Run the memfs export `name` on behalf of `unit`
    ///
    /// `host_memory` is the unit's linear memory; memfs reaches it through
    /// its host imports for the duration of this call only.
    pub fn forward(
        &mut self,
        unit: UnitId,
        name: &str,
        host_memory: &mut [u8],
        params: &[Val],
        results: &mut [Val],
    ) -> Result<(), Signal> {
        self.store.data().ensure_open()?;
        match self.store.data().wired {
            Some(wiring) if wiring.unit == unit => {}
            _ => {
                return Err(Signal::fault(format!(
                    "{} called by unit {} which is not wired to the filesystem",
                    name, unit
                )));
            }
        }
        let func = self
            .instance
            .get_func(&self.store, name)
            .ok_or_else(|| Signal::not_implemented(WASI_MODULE, name))?;

        self.store.data_mut().window = Some(HostWindow::new(host_memory));
        let result = func.call(&mut self.store, params, results);
        self.store.data_mut().window = None;

        result.map_err(|err| Signal::from_error(&err))
    }
}

/// Host functions memfs imports from `env`
fn register_imports(linker: &mut Linker<BridgeState>) -> SandboxResult<()> {
    linker
        .func_wrap(
            BRIDGE_MODULE,
            "abort",
            |caller: Caller<'_, BridgeState>| -> Result<(), wasmi::Error> {
                caller.data().ensure_open()?;
                Err(Signal::Abort.into())
            },
        )
        .map_err(SandboxError::instantiation)?;

    linker
        .func_wrap(BRIDGE_MODULE, "host_write", host_write)
        .map_err(SandboxError::instantiation)?;

    linker
        .func_wrap(BRIDGE_MODULE, "host_read", host_read)
        .map_err(SandboxError::instantiation)?;

    linker
        .func_wrap(
            BRIDGE_MODULE,
            "memfs_log",
            |mut caller: Caller<'_, BridgeState>, buf: u32, len: u32| -> Result<(), wasmi::Error> {
                caller.data().ensure_open()?;
                let memory = exported_memory(&caller)?;
                let text = ByteAccessor::of(&memory, &mut caller).read_str(buf, len)?;
                tracing::debug!(target: "sandcc::memfs", "{}", text);
                Ok(())
            },
        )
        .map_err(SandboxError::instantiation)?;

    linker
        .func_wrap(
            BRIDGE_MODULE,
            "copy_in",
            |mut caller: Caller<'_, BridgeState>,
             memfs_dst: u32,
             host_src: u32,
             size: u32|
             -> Result<(), wasmi::Error> {
                let memory = exported_memory(&caller)?;
                let (bridge_bytes, state) = memory.data_and_store_mut(&mut caller);
                state.ensure_open()?;
                let host = ByteAccessor::new(host_bytes(&mut state.window)?);
                let src = host.read_bytes(host_src, size)?;
                ByteAccessor::new(bridge_bytes).write_bytes(memfs_dst, src)?;
                Ok(())
            },
        )
        .map_err(SandboxError::instantiation)?;

    linker
        .func_wrap(
            BRIDGE_MODULE,
            "copy_out",
            |mut caller: Caller<'_, BridgeState>,
             host_dst: u32,
             memfs_src: u32,
             size: u32|
             -> Result<(), wasmi::Error> {
                let memory = exported_memory(&caller)?;
                let (bridge_bytes, state) = memory.data_and_store_mut(&mut caller);
                state.ensure_open()?;
                let bridge = ByteAccessor::new(bridge_bytes);
                let src = bridge.read_bytes(memfs_src, size)?;
                ByteAccessor::new(host_bytes(&mut state.window)?).write_bytes(host_dst, src)?;
                Ok(())
            },
        )
        .map_err(SandboxError::instantiation)?;

    Ok(())
}

fn host_write(
    mut caller: Caller<'_, BridgeState>,
    fd: u32,
    iovs: u32,
    iovs_len: u32,
    nwritten_out: u32,
) -> Result<i32, wasmi::Error> {
    let state = caller.data_mut();
    state.ensure_open()?;
    if fd > fd::STDERR {
        return Err(Signal::fault(format!("host_write to unsupported fd {}", fd)).into());
    }

    let mut host = ByteAccessor::new(host_bytes(&mut state.window)?);
    let iovecs = host.iovecs(iovs, iovs_len)?;
    let bytes = host.gather(&iovecs)?;
    host.write_u32(nwritten_out, bytes.len() as u32)?;

    let text = state.partial_output.decode(&bytes);
    state.emit(&text);
    Ok(ESUCCESS)
}

/// The one blocking syscall: parks the compute thread until a line arrives
fn host_read(
    mut caller: Caller<'_, BridgeState>,
    fd: u32,
    iovs: u32,
    iovs_len: u32,
    nread_out: u32,
) -> Result<i32, wasmi::Error> {
    let state = caller.data_mut();
    state.ensure_open()?;
    if fd != fd::STDIN {
        return Err(Signal::fault(format!("host_read from unsupported fd {}", fd)).into());
    }

    if state.pending_input.is_empty() {
        if !state.port.request_line() {
            // nobody will ever answer: end of file
            ByteAccessor::new(host_bytes(&mut state.window)?).write_u32(nread_out, 0)?;
            return Ok(ESUCCESS);
        }
        let line = state
            .input
            .wait_line()
            .map_err(|e| Signal::fault(e.to_string()))?;
        state.pending_input = line.into_bytes();
    }

    let mut host = ByteAccessor::new(host_bytes(&mut state.window)?);
    let iovecs = host.iovecs(iovs, iovs_len)?;
    let placed = host.scatter(&iovecs, &state.pending_input)?;
    host.write_u32(nread_out, placed as u32)?;
    state.pending_input.drain(..placed);
    Ok(ESUCCESS)
}
