//! The compute thread
//!
//! Everything the worker keeps between requests lives in a [`ComputeContext`]:
//! the host port, the toolchain (module cache and bridge) and the program unit
//! that last asked to continue. Requests are served one at a time, in arrival
//! order, on this thread.

use super::protocol::{HostMessage, Request, Response, ResponseId, WorkerMessage, WorkerPort};
use super::shared::SharedInput;
use crate::config::ToolchainConfig;
use crate::sandbox::error::{SandboxError, SandboxResult};
use crate::sandbox::unit::ExecutionUnit;
use crate::toolchain::artifacts::ArtifactSource;
use crate::toolchain::{Toolchain, EXECUTABLE};
use futures::executor::block_on;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

/// State owned by one compute thread
pub struct ComputeContext {
    port: Arc<WorkerPort>,
    toolchain: Toolchain,
    current: Option<ExecutionUnit>,
}

impl ComputeContext {
    pub fn new(
        config: ToolchainConfig,
        source: Arc<dyn ArtifactSource>,
        port: WorkerPort,
        input: Arc<SharedInput>,
    ) -> Self {
        let port = Arc::new(port);
        let toolchain = Toolchain::new(config, source, port.clone(), input);
        Self {
            port,
            toolchain,
            current: None,
        }
    }

    pub fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }

    pub fn handle(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Constructor { .. } => {
                tracing::warn!("worker already constructed, ignoring constructor");
            }
            WorkerMessage::SetShowTiming(on) => self.toolchain.set_show_timing(on),
            WorkerMessage::Request {
                response_id,
                request,
            } => self.respond(response_id, request),
        }
    }

    fn respond(&mut self, response_id: ResponseId, request: Request) {
        tracing::debug!(response_id, ?request, "request received");
        let data = self.execute(request).map_err(|err| {
            tracing::error!(response_id, error = %err, "request failed");
        });
        self.port.post(HostMessage::RunAsync { response_id, data });
    }

    fn execute(&mut self, request: Request) -> SandboxResult<Response> {
        match request {
            Request::CompileLinkRun { source } => {
                if let Some(previous) = self.current.take() {
                    previous.continuation().revoke();
                }
                let unit = block_on(self.toolchain.compile_link_run(&source))?;
                let continuing = unit.is_some();
                self.current = unit;
                Ok(Response::RunReport { continuing })
            }
            Request::RunCppCheck { source } => {
                let diagnostics = block_on(self.toolchain.run_analysis(&source))?;
                Ok(Response::Diagnostics(diagnostics))
            }
            Request::CallContinuation { export } => {
                let unit = self
                    .current
                    .as_mut()
                    .ok_or_else(|| SandboxError::Faulted {
                        program: EXECUTABLE.to_string(),
                        detail: "no program is waiting for continuations".to_string(),
                    })?;
                let outcome = unit.call_continuation(&export)?;
                let continuing = unit.continuation().is_allowed();
                if !continuing {
                    self.current = None;
                }
                outcome.into_result(EXECUTABLE)?;
                Ok(Response::RunReport { continuing })
            }
        }
    }
}

/// Thread body: wait for the constructor, then serve until the channel closes
pub(crate) fn serve(
    inbox: Receiver<WorkerMessage>,
    config: ToolchainConfig,
    source: Arc<dyn ArtifactSource>,
) {
    let mut context = match inbox.recv() {
        Ok(WorkerMessage::Constructor { port, shared }) => {
            tracing::debug!(generation = port.generation(), "compute thread started");
            ComputeContext::new(config, source, port, shared)
        }
        Ok(other) => {
            tracing::error!(message = ?other, "first message must be the constructor");
            return;
        }
        Err(_) => return,
    };

    for message in inbox {
        context.handle(message);
    }
    tracing::debug!(
        generation = context.port.generation(),
        "compute thread exiting"
    );
}
