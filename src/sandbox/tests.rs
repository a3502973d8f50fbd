//! Execution unit tests against the memfs fixture

use super::*;
use crate::platform::RecordingPort;
use crate::vfs::bridge::{self, Bridge, SharedBridge};
use crate::worker::shared::SharedInput;
use std::sync::Arc;
use wasmi::{Engine, Module};

const MEMFS: &str = include_str!("../../tests/fixtures/memfs.wat");
const HELLO: &str = include_str!("../../tests/fixtures/hello.wat");
const FRAMES: &str = include_str!("../../tests/fixtures/frames.wat");

const EXIT_3: &str = r#"
(module
  (import "wasi_unstable" "proc_exit" (func $exit (param i32)))
  (memory (export "memory") 1)
  (func (export "_start") (call $exit (i32.const 3))))
"#;

struct Sandbox {
    engine: Engine,
    bridge: SharedBridge,
    port: Arc<RecordingPort>,
}

impl Sandbox {
    fn new() -> Self {
        let engine = Engine::default();
        let memfs = Module::new(&engine, &wat::parse_str(MEMFS).unwrap()[..]).unwrap();
        let port = Arc::new(RecordingPort::new());
        let bridge = Bridge::new(&engine, &memfs, port.clone(), Arc::new(SharedInput::default()))
            .unwrap()
            .shared();
        Self {
            engine,
            bridge,
            port,
        }
    }

    fn unit(&self, source: &str, args: &[&str]) -> ExecutionUnit {
        let module = Module::new(&self.engine, &wat::parse_str(source).unwrap()[..]).unwrap();
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let mut unit = ExecutionUnit::new(
            Arc::new(module),
            self.bridge.clone(),
            self.port.clone(),
            "test",
            &args,
        );
        unit.instantiate().unwrap();
        unit
    }
}

#[test]
fn test_clean_exit_is_silent() {
    let sandbox = Sandbox::new();
    let mut unit = sandbox.unit(HELLO, &[]);
    assert_eq!(unit.phase(), UnitPhase::Instantiated);

    assert_eq!(unit.run(RunMode::Standard), Outcome::Exited(0));
    assert_eq!(unit.phase(), UnitPhase::Finished);
    assert_eq!(sandbox.port.output(), "hello, world\n");
    assert!(unit.continuation().is_allowed());
}

#[test]
fn test_nonzero_exit_writes_one_banner() {
    let sandbox = Sandbox::new();
    let mut unit = sandbox.unit(EXIT_3, &[]);

    assert_eq!(unit.run(RunMode::Standard), Outcome::Exited(3));
    assert_eq!(
        sandbox.port.output(),
        "\x1b[91mExit code: 3 (process exited with code 3.)\x1b[0m\r\n"
    );
    assert!(!unit.continuation().is_allowed());
}

#[test]
fn test_diagnostics_mode_has_no_banner() {
    let sandbox = Sandbox::new();
    let mut unit = sandbox.unit(EXIT_3, &[]);
    assert_eq!(unit.run(RunMode::Diagnostics), Outcome::Exited(3));
    assert_eq!(sandbox.port.output(), "");
}

#[test]
fn test_quiet_unit_has_no_banner() {
    let sandbox = Sandbox::new();
    let module = Module::new(&sandbox.engine, &wat::parse_str(EXIT_3).unwrap()[..]).unwrap();
    let mut unit = ExecutionUnit::new(
        Arc::new(module),
        sandbox.bridge.clone(),
        sandbox.port.clone(),
        "wasm-ld",
        &[],
    )
    .with_stdout(false);
    unit.instantiate().unwrap();

    assert_eq!(unit.run(RunMode::Standard), Outcome::Exited(3));
    assert_eq!(sandbox.port.output(), "");
    assert!(!unit.continuation().is_allowed());
}

#[test]
fn test_continuation_after_sentinel_exit() {
    let sandbox = Sandbox::new();
    let mut unit = sandbox.unit(FRAMES, &[]);

    assert_eq!(unit.run(RunMode::Standard), Outcome::Continue);
    assert!(unit.continuation().is_allowed());
    assert_eq!(sandbox.port.output(), "");

    assert_eq!(unit.call_continuation("frame").unwrap(), Outcome::Exited(0));
    assert_eq!(unit.call_continuation("frame").unwrap(), Outcome::Exited(0));
    assert_eq!(sandbox.port.output(), "frame\nframe\n");

    unit.continuation().revoke();
    assert!(matches!(
        unit.call_continuation("frame"),
        Err(SandboxError::Faulted { .. })
    ));
    assert_eq!(
        unit.call_continuation("missing").unwrap_err(),
        SandboxError::Faulted {
            program: "test".to_string(),
            detail: "continuation permission revoked".to_string()
        }
    );
}

#[test]
fn test_continuation_requires_finished_run() {
    let sandbox = Sandbox::new();
    let mut unit = sandbox.unit(FRAMES, &[]);
    assert!(unit.call_continuation("frame").is_err());
}

#[test]
fn test_continuation_rewires_unit() {
    let sandbox = Sandbox::new();
    let mut frames = sandbox.unit(FRAMES, &[]);
    assert_eq!(frames.run(RunMode::Standard), Outcome::Continue);

    let hello = sandbox.unit(HELLO, &[]);
    assert_eq!(bridge::lock(&sandbox.bridge).unwrap().wired_unit(), Some(hello.id()));

    assert_eq!(frames.call_continuation("frame").unwrap(), Outcome::Exited(0));
    assert_eq!(bridge::lock(&sandbox.bridge).unwrap().wired_unit(), Some(frames.id()));
}

#[test]
fn test_args_and_environ_sizes() {
    // exits with argc * 100 + packed argv size, then the environ pair likewise
    let source = r#"
    (module
      (import "wasi_unstable" "proc_exit" (func $exit (param i32)))
      (import "wasi_unstable" "args_sizes_get" (func $args (param i32 i32) (result i32)))
      (import "wasi_unstable" "environ_sizes_get" (func $env (param i32 i32) (result i32)))
      (memory (export "memory") 1)
      (func (export "_start")
        (drop (call $args (i32.const 0) (i32.const 4)))
        (drop (call $env (i32.const 8) (i32.const 12)))
        (call $exit
          (i32.add
            (i32.mul (i32.load (i32.const 0)) (i32.const 100))
            (i32.load (i32.const 4))))))
    "#;
    let sandbox = Sandbox::new();
    let mut unit = sandbox.unit(source, &["a", "bc"]);
    // "test\0a\0bc\0"
    assert_eq!(unit.run(RunMode::Diagnostics), Outcome::Exited(310));
}

#[test]
fn test_clock_reads_wall_time() {
    let source = r#"
    (module
      (import "wasi_unstable" "proc_exit" (func $exit (param i32)))
      (import "wasi_unstable" "clock_time_get" (func $clock (param i32 i64 i32) (result i32)))
      (memory (export "memory") 1)
      (func (export "_start")
        (drop (call $clock (i32.const 0) (i64.const 1) (i32.const 16)))
        (call $exit (i32.ne (i32.load (i32.const 20)) (i32.const 0)))))
    "#;
    let sandbox = Sandbox::new();
    let mut unit = sandbox.unit(source, &[]);
    assert_eq!(unit.run(RunMode::Diagnostics), Outcome::Exited(1));
}

#[test]
fn test_misaligned_write_faults() {
    let source = r#"
    (module
      (import "wasi_unstable" "args_sizes_get" (func $args (param i32 i32) (result i32)))
      (memory (export "memory") 1)
      (func (export "_start")
        (drop (call $args (i32.const 1) (i32.const 8)))))
    "#;
    let sandbox = Sandbox::new();
    let mut unit = sandbox.unit(source, &[]);
    match unit.run(RunMode::Diagnostics) {
        Outcome::Faulted(detail) => assert!(detail.contains("misaligned"), "{}", detail),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_poll_oneoff_is_fatal() {
    let source = r#"
    (module
      (import "wasi_unstable" "poll_oneoff" (func $poll (param i32 i32 i32 i32) (result i32)))
      (memory (export "memory") 1)
      (func (export "_start")
        (drop (call $poll (i32.const 0) (i32.const 0) (i32.const 0) (i32.const 0)))))
    "#;
    let sandbox = Sandbox::new();
    let mut unit = sandbox.unit(source, &[]);
    assert_eq!(
        unit.run(RunMode::Standard),
        Outcome::Faulted("wasi_unstable.poll_oneoff not implemented.".to_string())
    );
    assert_eq!(
        sandbox.port.output(),
        "\x1b[91mExit code: 1 (wasi_unstable.poll_oneoff not implemented.)\x1b[0m\r\n"
    );
}

#[test]
fn test_import_without_provider_links_as_stub() {
    let source = r#"
    (module
      (import "wasi_unstable" "path_open" (func $open (param i32 i32) (result i32)))
      (memory (export "memory") 1)
      (func (export "_start")
        (drop (call $open (i32.const 0) (i32.const 0)))))
    "#;
    let sandbox = Sandbox::new();
    let mut unit = sandbox.unit(source, &[]);
    assert_eq!(
        unit.run(RunMode::Diagnostics),
        Outcome::Faulted("wasi_unstable.path_open not implemented.".to_string())
    );
}

#[test]
fn test_abort_inside_bridge() {
    let source = r#"
    (module
      (import "wasi_unstable" "fail" (func $fail))
      (memory (export "memory") 1)
      (func (export "_start") (call $fail)))
    "#;
    let sandbox = Sandbox::new();
    let mut unit = sandbox.unit(source, &[]);
    assert_eq!(unit.run(RunMode::Standard), Outcome::Aborted);
    assert!(sandbox.port.output().contains("Exit code: 1 (abort)"));
}

#[test]
fn test_missing_start() {
    let sandbox = Sandbox::new();
    let module = Module::new(
        &sandbox.engine,
        &wat::parse_str(r#"(module (memory (export "memory") 1))"#).unwrap()[..],
    )
    .unwrap();
    let mut unit = ExecutionUnit::new(
        Arc::new(module),
        sandbox.bridge.clone(),
        sandbox.port.clone(),
        "test",
        &[],
    );
    assert_eq!(
        unit.instantiate(),
        Err(SandboxError::MissingExport {
            name: "_start".to_string()
        })
    );
    assert_eq!(unit.phase(), UnitPhase::Created);
    assert!(matches!(unit.run(RunMode::Standard), Outcome::Faulted(_)));
}

#[test]
fn test_wiring_follows_unit_lifetime() {
    let sandbox = Sandbox::new();
    let first = sandbox.unit(HELLO, &[]);
    let second = sandbox.unit(HELLO, &[]);
    assert!(second.id() > first.id());
    assert_eq!(bridge::lock(&sandbox.bridge).unwrap().wired_unit(), Some(second.id()));

    // dropping a unit that lost the slot leaves the wiring alone
    drop(first);
    assert_eq!(bridge::lock(&sandbox.bridge).unwrap().wired_unit(), Some(second.id()));
    drop(second);
    assert_eq!(bridge::lock(&sandbox.bridge).unwrap().wired_unit(), None);
}

/// Writes "é" one byte per call, then a lone lead byte, then exits 3
const SPLIT_CHARACTER: &str = r#"
(module
  (import "wasi_unstable" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (import "wasi_unstable" "proc_exit" (func $exit (param i32)))
  (memory (export "memory") 1)
  (data (i32.const 64) "\c3\a9\c3")
  (func $byte (param $at i32)
    (i32.store (i32.const 0) (local.get $at))
    (i32.store (i32.const 4) (i32.const 1))
    (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8))))
  (func (export "_start")
    (call $byte (i32.const 64))
    (call $byte (i32.const 65))
    (call $byte (i32.const 66))
    (call $exit (i32.const 3))))
"#;

#[test]
fn test_character_split_across_writes() {
    let sandbox = Sandbox::new();
    let mut unit = sandbox.unit(SPLIT_CHARACTER, &[]);
    assert_eq!(unit.run(RunMode::Standard), Outcome::Exited(3));
    // the dangling lead byte is flushed ahead of the banner
    assert_eq!(
        sandbox.port.output(),
        "é\u{FFFD}\x1b[91mExit code: 3 (process exited with code 3.)\x1b[0m\r\n"
    );
}

#[test]
fn test_stdin_without_interactive_side_is_eof() {
    let sandbox = Sandbox::new();
    let mut unit = sandbox.unit(include_str!("../../tests/fixtures/echo.wat"), &[]);
    assert_eq!(unit.run(RunMode::Standard), Outcome::Exited(0));
    assert_eq!(sandbox.port.output(), "");
}
