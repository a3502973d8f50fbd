//! Messages between the interactive side and the compute thread
//!
//! Requests and responses keep the `{"id": ..., "data": ...}` shape so they can
//! be logged or relayed as JSON. The setup message carries in-process handles
//! and never leaves the process.

use super::shared::SharedInput;
use crate::diagnostics::Diagnostic;
use crate::platform::HostPort;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

/// Correlation id chosen by the requester
pub type ResponseId = u64;

/// Generation of compute thread a message came from
pub type Generation = u64;

/// Work the compute thread can be asked to do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "id", content = "data", rename_all = "camelCase")]
pub enum Request {
    /// Build the source and run it
    CompileLinkRun { source: String },
    /// Syntax-only compile returning diagnostics
    RunCppCheck { source: Vec<u8> },
    /// Call an export of the program that asked to continue
    CallContinuation { export: String },
}

/// Successful result of a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "id", content = "data", rename_all = "camelCase")]
pub enum Response {
    /// The program ran; `continuing` when it may still be called into
    RunReport { continuing: bool },
    Diagnostics(Vec<Diagnostic>),
}

/// Messages to the compute thread
#[derive(Debug)]
pub enum WorkerMessage {
    /// Setup; must be the first message
    Constructor {
        port: WorkerPort,
        shared: Arc<SharedInput>,
    },
    SetShowTiming(bool),
    Request {
        response_id: ResponseId,
        request: Request,
    },
}

/// Messages to the interactive side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "id", content = "data", rename_all = "camelCase")]
pub enum HostMessage {
    Write(String),
    ReadLine,
    /// Completion of a request; `Err(())` when it failed on the compute side
    #[serde(rename_all = "camelCase")]
    RunAsync {
        response_id: ResponseId,
        data: Result<Response, ()>,
    },
}

/// What the dispatcher receives
#[derive(Debug)]
pub(crate) enum Dispatch {
    Host {
        generation: Generation,
        message: HostMessage,
    },
    Shutdown,
}

/// Compute-side end of the host channel
///
/// Every message is stamped with the generation that sent it, so the
/// dispatcher can drop what a terminated worker still sends.
#[derive(Debug, Clone)]
pub struct WorkerPort {
    generation: Generation,
    outbox: Sender<Dispatch>,
    terminated: Arc<AtomicBool>,
}

impl WorkerPort {
    pub(crate) fn new(
        generation: Generation,
        outbox: Sender<Dispatch>,
        terminated: Arc<AtomicBool>,
    ) -> Self {
        Self {
            generation,
            outbox,
            terminated,
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Returns false when the host side is gone
    pub fn post(&self, message: HostMessage) -> bool {
        let dispatch = Dispatch::Host {
            generation: self.generation,
            message,
        };
        let sent = self.outbox.send(dispatch).is_ok();
        if !sent {
            tracing::debug!(generation = self.generation, "host side gone, message dropped");
        }
        sent
    }
}

impl HostPort for WorkerPort {
    fn write(&self, text: &str) {
        self.post(HostMessage::Write(text.to_string()));
    }

    fn request_line(&self) -> bool {
        self.post(HostMessage::ReadLine)
    }

    fn is_closed(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::mpsc;

    #[test]
    fn test_request_shape() {
        let request = Request::CompileLinkRun {
            source: "int main() {}".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"id": "compileLinkRun", "data": {"source": "int main() {}"}})
        );

        let parsed: Request =
            serde_json::from_value(json!({"id": "runCppCheck", "data": {"source": [105, 110]}}))
                .unwrap();
        assert_eq!(
            parsed,
            Request::RunCppCheck {
                source: b"in".to_vec()
            }
        );
    }

    #[test]
    fn test_run_async_shape() {
        let message = HostMessage::RunAsync {
            response_id: 4,
            data: Ok(Response::RunReport { continuing: false }),
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "id": "runAsync",
                "data": {
                    "responseId": 4,
                    "data": {"Ok": {"id": "runReport", "data": {"continuing": false}}}
                }
            })
        );
        assert_eq!(
            serde_json::to_value(HostMessage::ReadLine).unwrap(),
            json!({"id": "readLine"})
        );
    }

    #[test]
    fn test_port_stamps_generation() {
        let (tx, rx) = mpsc::channel();
        let terminated = Arc::new(AtomicBool::new(false));
        let port = WorkerPort::new(3, tx, terminated.clone());

        port.write("hi");
        assert!(port.request_line());
        let generations: Vec<_> = rx
            .try_iter()
            .map(|dispatch| match dispatch {
                Dispatch::Host { generation, .. } => generation,
                Dispatch::Shutdown => 0,
            })
            .collect();
        assert_eq!(generations, vec![3, 3]);

        assert!(!port.is_closed());
        terminated.store(true, Ordering::Release);
        assert!(port.is_closed());
    }
}
