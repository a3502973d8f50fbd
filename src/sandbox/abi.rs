//! ABI constants shared by the execution unit and the filesystem bridge
//!
//! Toolchain modules are linked against the `wasi_unstable` snapshot. The
//! process-lifecycle calls are served by the unit itself; file and stream calls
//! are exported by the memfs module and forwarded to it.

/// Import namespace of the sandboxed toolchain modules
pub const WASI_MODULE: &str = "wasi_unstable";

/// Import namespace of the memfs module
pub const BRIDGE_MODULE: &str = "env";

/// Success errno
pub const ESUCCESS: i32 = 0;

/// Exit code that keeps the continuation permission after exit
pub const CONTINUE_EXIT_CODE: i32 = 0xC0C0A;

/// The single environment variable every module sees
pub const ENVIRONMENT: &[(&str, &str)] = &[("USER", "alice")];

/// Syscalls implemented by the execution unit
pub const PROCESS_SYSCALLS: [&str; 8] = [
    "proc_exit",
    "environ_sizes_get",
    "environ_get",
    "args_sizes_get",
    "args_get",
    "random_get",
    "clock_time_get",
    "poll_oneoff",
];

/// Exports the memfs module must provide
pub mod exports {
    pub const MEMORY: &str = "memory";
    pub const START: &str = "_start";
    pub const INIT: &str = "init";
    pub const GET_PATH_BUF: &str = "GetPathBuf";
    pub const ADD_DIRECTORY_NODE: &str = "AddDirectoryNode";
    pub const ADD_FILE_NODE: &str = "AddFileNode";
    pub const GET_FILE_NODE_ADDRESS: &str = "GetFileNodeAddress";
    pub const GET_FILE_NODE_SIZE: &str = "GetFileNodeSize";
    pub const FIND_NODE: &str = "FindNode";
}

/// Standard file descriptors
pub mod fd {
    pub const STDIN: u32 = 0;
    pub const STDERR: u32 = 2;
}

/// Bytes needed to lay out `strings` as consecutive NUL-terminated strings
pub fn packed_size<S: AsRef<str>>(strings: &[S]) -> usize {
    strings.iter().map(|s| s.as_ref().len() + 1).sum()
}

/// The environment rendered as `name=value` strings
pub fn environ_strings() -> Vec<String> {
    ENVIRONMENT
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect()
}

pub fn is_process_syscall(name: &str) -> bool {
    PROCESS_SYSCALLS.contains(&name)
}
