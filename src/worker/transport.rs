//! Interactive side of the worker
//!
//! A [`WorkerTransport`] owns one compute thread at a time plus a dispatcher
//! thread that plays the part of the UI event loop: it renders `write`
//! messages, answers `readLine` through the terminal and resolves pending
//! requests by correlation id.
//!
//! Native threads cannot be killed. [`WorkerTransport::force_abort`] instead
//! retires the current generation: its port reports closed so the next guest
//! syscall faults, its input region is closed so a parked read wakes, and its
//! request channel is dropped. Whatever the retired thread still sends is
//! evicted by generation.

use super::compute;
use super::error::TransportError;
use super::protocol::{
    Dispatch, Generation, HostMessage, Request, Response, ResponseId, WorkerMessage, WorkerPort,
};
use super::shared::{LineReply, SharedInput};
use crate::config::ToolchainConfig;
use crate::platform::Terminal;
use crate::toolchain::artifacts::ArtifactSource;
use futures::channel::oneshot;
use pin_project_lite::pin_project;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};

const TERMINATED_BANNER: &str = "\r\n\x1b[41m##### Program forcefully terminated #####\x1b[0m\r\n";

type Completion = oneshot::Sender<Result<Response, TransportError>>;

pin_project! {
    /// Completion of one request
    pub struct PendingResponse {
        id: ResponseId,
        #[pin]
        receiver: oneshot::Receiver<Result<Response, TransportError>>,
    }
}

impl PendingResponse {
    pub fn id(&self) -> ResponseId {
        self.id
    }
}

impl Future for PendingResponse {
    type Output = Result<Response, TransportError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().receiver.poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // the completion was dropped without an answer
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(TransportError::Disconnected)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Handles on the live compute thread
struct Worker {
    generation: Generation,
    inbox: Sender<WorkerMessage>,
    input: Arc<SharedInput>,
    terminated: Arc<AtomicBool>,
}

impl Worker {
    fn start(
        generation: Generation,
        config: &ToolchainConfig,
        source: &Arc<dyn ArtifactSource>,
        outbox: &Sender<Dispatch>,
        show_timing: bool,
    ) -> Result<Self, TransportError> {
        let terminated = Arc::new(AtomicBool::new(false));
        let input = Arc::new(SharedInput::new(config.input_capacity));
        let (inbox, requests) = mpsc::channel();

        let thread_config = config.clone();
        let thread_source = source.clone();
        thread::Builder::new()
            .name(format!("sandcc-compute-{}", generation))
            .spawn(move || compute::serve(requests, thread_config, thread_source))
            .map_err(|e| TransportError::Spawn {
                reason: e.to_string(),
            })?;

        let port = WorkerPort::new(generation, outbox.clone(), terminated.clone());
        let setup = [
            WorkerMessage::Constructor {
                port,
                shared: input.clone(),
            },
            WorkerMessage::SetShowTiming(show_timing),
        ];
        for message in setup {
            inbox
                .send(message)
                .map_err(|_| TransportError::Disconnected)?;
        }

        tracing::debug!(generation, "worker started");
        Ok(Self {
            generation,
            inbox,
            input,
            terminated,
        })
    }

    fn retire(&self) {
        self.terminated.store(true, Ordering::Release);
        self.input.close();
    }
}

struct Inner<T> {
    terminal: T,
    config: ToolchainConfig,
    source: Arc<dyn ArtifactSource>,
    outbox: Sender<Dispatch>,
    next_id: AtomicU64,
    show_timing: AtomicBool,
    pending: Mutex<HashMap<ResponseId, Completion>>,
    worker: Mutex<Worker>,
}

impl<T: Terminal> Inner<T> {
    fn worker(&self) -> MutexGuard<'_, Worker> {
        self.worker.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<ResponseId, Completion>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn complete(&self, id: ResponseId, result: Result<Response, TransportError>) {
        match self.pending().remove(&id) {
            Some(completion) => {
                // the caller may have stopped waiting
                let _ = completion.send(result);
            }
            None => tracing::debug!(response_id = id, "response for unknown request"),
        }
    }

    fn dispatch(&self, messages: Receiver<Dispatch>) {
        for dispatch in messages {
            let (generation, message) = match dispatch {
                Dispatch::Shutdown => break,
                Dispatch::Host {
                    generation,
                    message,
                } => (generation, message),
            };

            let (current, input) = {
                let worker = self.worker();
                (worker.generation, worker.input.clone())
            };
            if generation != current {
                tracing::debug!(generation, current, "evicting message from terminated worker");
                continue;
            }

            match message {
                HostMessage::Write(text) => self.terminal.write(&text),
                HostMessage::ReadLine => self.terminal.request_line(LineReply::new(input)),
                HostMessage::RunAsync { response_id, data } => {
                    self.complete(response_id, data.map_err(|()| TransportError::Rejected))
                }
            }
        }
        tracing::debug!("dispatcher stopped");
    }
}

/// Request/response front end of the compute thread
pub struct WorkerTransport<T: Terminal> {
    inner: Arc<Inner<T>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl<T: Terminal> WorkerTransport<T> {
    /// Start the dispatcher and the first compute thread
    pub fn spawn(
        terminal: T,
        config: ToolchainConfig,
        source: Arc<dyn ArtifactSource>,
    ) -> Result<Self, TransportError> {
        let (outbox, messages) = mpsc::channel();
        let worker = Worker::start(1, &config, &source, &outbox, config.show_timing)?;

        let inner = Arc::new(Inner {
            terminal,
            show_timing: AtomicBool::new(config.show_timing),
            config,
            source,
            outbox,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            worker: Mutex::new(worker),
        });

        let dispatcher = {
            let inner = inner.clone();
            thread::Builder::new()
                .name("sandcc-dispatch".to_string())
                .spawn(move || inner.dispatch(messages))
                .map_err(|e| TransportError::Spawn {
                    reason: e.to_string(),
                })?
        };

        Ok(Self {
            inner,
            dispatcher: Some(dispatcher),
        })
    }

    pub fn terminal(&self) -> &T {
        &self.inner.terminal
    }

    /// Generation of the live compute thread; starts at 1
    pub fn generation(&self) -> Generation {
        self.inner.worker().generation
    }

    /// Requests sent but not yet answered
    pub fn pending_requests(&self) -> usize {
        self.inner.pending().len()
    }

    pub fn set_show_timing(&self, on: bool) {
        self.inner.show_timing.store(on, Ordering::Relaxed);
        if self
            .inner
            .worker()
            .inbox
            .send(WorkerMessage::SetShowTiming(on))
            .is_err()
        {
            tracing::warn!("worker gone, timing setting kept for the next one");
        }
    }

    /// Send `request` under a fresh correlation id
    pub fn request(&self, request: Request) -> PendingResponse {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (completion, receiver) = oneshot::channel();

        // registration and send happen under one worker lock
        let sent = {
            let worker = self.inner.worker();
            self.inner.pending().insert(id, completion);
            worker
                .inbox
                .send(WorkerMessage::Request {
                    response_id: id,
                    request,
                })
                .is_ok()
        };
        if !sent {
            self.inner.complete(id, Err(TransportError::Disconnected));
        }
        PendingResponse { id, receiver }
    }

    pub fn compile_link_run(&self, source: &str) -> PendingResponse {
        self.request(Request::CompileLinkRun {
            source: source.to_string(),
        })
    }

    pub fn run_cpp_check(&self, source: &[u8]) -> PendingResponse {
        self.request(Request::RunCppCheck {
            source: source.to_vec(),
        })
    }

    pub fn call_continuation(&self, export: &str) -> PendingResponse {
        self.request(Request::CallContinuation {
            export: export.to_string(),
        })
    }

    /// Retire the compute thread, fail everything pending and start afresh
    ///
    /// The new worker has an empty module cache and a fresh bridge.
    pub fn force_abort(&self) -> Result<(), TransportError> {
        let mut worker = self.inner.worker();
        worker.retire();

        let rejected: Vec<(ResponseId, Completion)> = self.inner.pending().drain().collect();
        for (id, completion) in rejected {
            tracing::warn!("Response {} Worker forcefully terminated", id);
            let _ = completion.send(Err(TransportError::Terminated));
        }
        self.inner.terminal.write(TERMINATED_BANNER);

        let generation = worker.generation + 1;
        *worker = Worker::start(
            generation,
            &self.inner.config,
            &self.inner.source,
            &self.inner.outbox,
            self.inner.show_timing.load(Ordering::Relaxed),
        )?;
        tracing::info!(generation, "worker restarted");
        Ok(())
    }
}

impl<T: Terminal> Drop for WorkerTransport<T> {
    fn drop(&mut self) {
        self.inner.worker().retire();
        let _ = self.inner.outbox.send(Dispatch::Shutdown);
        if let Some(dispatcher) = self.dispatcher.take() {
            if dispatcher.join().is_err() {
                tracing::error!("dispatcher thread panicked");
            }
        }
    }
}
