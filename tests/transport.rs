//! Worker transport tests: requests, blocking input and forced termination

mod common;

use common::*;
use futures::executor::block_on;
use sandcc::diagnostics::Severity;
use sandcc::worker::{Response, TransportError, WorkerTransport};
use sandcc::ToolchainConfig;
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

fn transport(program: &str, terminal: ScriptedTerminal) -> WorkerTransport<ScriptedTerminal> {
    WorkerTransport::spawn(terminal, ToolchainConfig::default(), Arc::new(artifacts(program)))
        .unwrap()
}

#[test]
fn test_compile_link_run() {
    let transport = transport(HELLO, ScriptedTerminal::new());
    assert_eq!(
        block_on(transport.compile_link_run("int main() {}")),
        Ok(Response::RunReport { continuing: false })
    );
    assert!(transport.terminal().output().contains("hello, world\n"));
    assert_eq!(transport.pending_requests(), 0);
}

#[test]
fn test_analysis() {
    let transport = transport(HELLO, ScriptedTerminal::new());
    let diagnostics = match block_on(transport.run_cpp_check(b"!x")) {
        Ok(Response::Diagnostics(diagnostics)) => diagnostics,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].level(), Severity::Error);
    assert_eq!((diagnostics[0].line, diagnostics[0].column), (1, 1));
}

#[test]
fn test_responses_resolve_by_id() {
    let transport = transport(HELLO, ScriptedTerminal::new());
    let run = transport.compile_link_run("int main() {}");
    let check = transport.run_cpp_check(b"int main() {}");
    assert_ne!(run.id(), check.id());

    // awaited in the opposite order they were sent
    assert_eq!(block_on(check), Ok(Response::Diagnostics(Vec::new())));
    assert_eq!(block_on(run), Ok(Response::RunReport { continuing: false }));
}

#[test]
fn test_failed_build_is_rejected() {
    let transport = transport(HELLO, ScriptedTerminal::new());
    assert_eq!(
        block_on(transport.compile_link_run("!int main() {}")),
        Err(TransportError::Rejected)
    );
    assert!(transport.terminal().output().contains("Exit code: 1"));
}

#[test]
fn test_blocking_input_after_delay() {
    let terminal = ScriptedTerminal::answering(&["typed line\n"], Duration::from_millis(200));
    let transport = transport(ECHO, terminal);

    assert_eq!(
        block_on(transport.compile_link_run("int main() {}")),
        Ok(Response::RunReport { continuing: false })
    );
    assert_eq!(transport.terminal().requests(), 1);
    assert!(transport.terminal().output().contains("program.wasm\r\ntyped line\n"));
}

#[test]
fn test_continuation_through_worker() {
    let transport = transport(FRAMES, ScriptedTerminal::new());
    assert_eq!(
        block_on(transport.compile_link_run("int main() {}")),
        Ok(Response::RunReport { continuing: true })
    );
    assert_eq!(
        block_on(transport.call_continuation("frame")),
        Ok(Response::RunReport { continuing: true })
    );
    assert!(transport.terminal().output().ends_with("frame\n"));

    assert_eq!(
        block_on(transport.call_continuation("missing")),
        Err(TransportError::Rejected)
    );
}

#[test]
fn test_force_abort_while_reading() {
    let transport = transport(ECHO, ScriptedTerminal::new());
    let pending = transport.compile_link_run("int main() {}");
    assert!(transport.terminal().wait_until(TIMEOUT, |t| t.requests() == 1));

    transport.force_abort().unwrap();
    assert_eq!(block_on(pending), Err(TransportError::Terminated));
    assert_eq!(transport.generation(), 2);
    assert!(transport.terminal().output().ends_with(BANNER));

    // the retired worker's fault never reaches the terminal
    transport.terminal().release("too late\n");
    let before = transport.terminal().output();
    assert!(!before.contains("Exit code"));

    // the fresh worker starts from an empty cache
    let next = transport.compile_link_run("int main() {}");
    assert!(transport.terminal().wait_until(TIMEOUT, |t| t.requests() == 2));
    transport.terminal().release("again\n");
    assert_eq!(block_on(next), Ok(Response::RunReport { continuing: false }));

    let output = transport.terminal().output();
    let after = &output[before.len()..];
    assert!(after.contains("Untarring sysroot.tar... done."));
    assert!(after.contains("Fetching and compiling clang.wasm... done."));
    assert!(after.contains("again\n"));
    assert!(!after.contains("too late"));
}

#[test]
fn test_force_abort_with_nothing_pending() {
    let transport = transport(HELLO, ScriptedTerminal::new());
    transport.force_abort().unwrap();
    transport.force_abort().unwrap();
    assert_eq!(transport.generation(), 3);
    assert_eq!(transport.terminal().output().matches(BANNER).count(), 2);
    assert_eq!(
        block_on(transport.compile_link_run("int main() {}")),
        Ok(Response::RunReport { continuing: false })
    );
}
