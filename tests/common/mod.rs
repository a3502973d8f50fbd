//! Shared fixtures for the integration tests
//!
//! The toolchain modules are small WAT stand-ins: `clang` copies program.cpp
//! to program.o (or reports one error for sources starting with `!`), and
//! `lld` emits the sysroot's `crt1.o` as program.wasm. Whatever program a test
//! wants to run goes into the sysroot as that `crt1.o`.

#![allow(dead_code)]

use sandcc::platform::{LineReply, Terminal};
use sandcc::toolchain::artifacts::MemoryArtifacts;
use sandcc::vfs::ArchiveWriter;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

pub const MEMFS: &str = include_str!("../fixtures/memfs.wat");
pub const CLANG: &str = include_str!("../fixtures/clang.wat");
pub const LLD: &str = include_str!("../fixtures/lld.wat");
pub const HELLO: &str = include_str!("../fixtures/hello.wat");
pub const ECHO: &str = include_str!("../fixtures/echo.wat");
pub const FRAMES: &str = include_str!("../fixtures/frames.wat");

pub const EXIT_3: &str = r#"
(module
  (import "wasi_unstable" "proc_exit" (func $exit (param i32)))
  (memory (export "memory") 1)
  (func (export "_start") (call $exit (i32.const 3))))
"#;

pub const BANNER: &str = "\r\n\x1b[41m##### Program forcefully terminated #####\x1b[0m\r\n";

pub fn wasm(source: &str) -> Vec<u8> {
    wat::parse_str(source).unwrap()
}

/// Sysroot image whose `crt1.o` is `program`
pub fn sysroot(program: &str) -> Vec<u8> {
    ArchiveWriter::new()
        .append_dir("include")
        .append_file("include/stdio.h", b"int puts(const char *);\n")
        .append_dir("lib")
        .append_dir("lib/wasm32-wasi")
        .append_file("lib/wasm32-wasi/crt1.o", &wasm(program))
        .append_file("lib/wasm32-wasi/libunistd_ext.o", b"")
        .finish()
}

/// Every artifact the default configuration names
pub fn artifacts(program: &str) -> MemoryArtifacts {
    MemoryArtifacts::new()
        .with("memfs.wasm", wasm(MEMFS))
        .with("clang.wasm", wasm(CLANG))
        .with("lld.wasm", wasm(LLD))
        .with("sysroot.tar", sysroot(program))
}

/// Terminal that records output and answers line requests from a script
///
/// Each answer is sent from its own thread after `delay`. With the script
/// exhausted, requests are held until [`ScriptedTerminal::release`].
#[derive(Default)]
pub struct ScriptedTerminal {
    output: Mutex<String>,
    lines: Mutex<VecDeque<String>>,
    held: Mutex<Vec<LineReply>>,
    requests: AtomicUsize,
    delay: Duration,
}

impl ScriptedTerminal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answering(lines: &[&str], delay: Duration) -> Self {
        Self {
            lines: Mutex::new(lines.iter().map(|l| l.to_string()).collect()),
            delay,
            ..Self::default()
        }
    }

    pub fn output(&self) -> String {
        self.output.lock().unwrap().clone()
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Answer every held request with `line`
    pub fn release(&self, line: &str) {
        for reply in self.held.lock().unwrap().drain(..) {
            reply.send(line);
        }
    }

    /// Poll until `condition` holds or `timeout` passes
    pub fn wait_until(&self, timeout: Duration, condition: impl Fn(&Self) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition(self) {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition(self)
    }
}

impl Terminal for ScriptedTerminal {
    fn write(&self, text: &str) {
        self.output.lock().unwrap().push_str(text);
    }

    fn request_line(&self, reply: LineReply) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        match self.lines.lock().unwrap().pop_front() {
            Some(line) => {
                let delay = self.delay;
                thread::spawn(move || {
                    thread::sleep(delay);
                    reply.send(&line);
                });
            }
            None => self.held.lock().unwrap().push(reply),
        }
    }
}
