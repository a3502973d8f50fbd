//! Host collaborators
//!
//! The toolchain never talks to a terminal directly. The compute side sees a
//! [`HostPort`]: a byte stream plus a way to ask for one line of input. The
//! interactive side owns a [`Terminal`], which renders output and eventually
//! answers a line request through a [`LineReply`].
//!
//! - `HostPort`: implemented by the worker's message port, or by
//!   [`RecordingPort`] when the toolchain is driven directly
//! - `Terminal`: implemented by [`stdio::StdioTerminal`] for the CLI

pub mod stdio;

use std::sync::Mutex;

pub use crate::worker::shared::LineReply;

/// Output stream and input trigger as seen from the compute thread
pub trait HostPort: Send + Sync {
    /// Write text to the host stream
    fn write(&self, text: &str);

    /// Ask the interactive side for one line of input
    ///
    /// The line arrives through the shared input region, not as a return value.
    /// Returns false when nothing will ever answer; the reader then sees end
    /// of file instead of parking.
    fn request_line(&self) -> bool;

    /// The other end discarded this port; every guest syscall must fault
    fn is_closed(&self) -> bool {
        false
    }
}

/// Rendering and keyboard side of the host
pub trait Terminal: Send + Sync + 'static {
    /// Render text received from the compute thread
    fn write(&self, text: &str);

    /// Collect one line of input and deliver it through `reply`
    ///
    /// May answer later from another thread.
    fn request_line(&self, reply: LineReply);
}

/// Port that keeps everything written to it
///
/// Used when the toolchain runs without a worker in front of it.
#[derive(Debug, Default)]
pub struct RecordingPort {
    output: Mutex<String>,
}

impl RecordingPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far
    pub fn output(&self) -> String {
        self.output
            .lock()
            .map(|out| out.clone())
            .unwrap_or_default()
    }

    /// Drain and return the recorded output
    pub fn take(&self) -> String {
        self.output
            .lock()
            .map(|mut out| std::mem::take(&mut *out))
            .unwrap_or_default()
    }
}

impl HostPort for RecordingPort {
    fn write(&self, text: &str) {
        if let Ok(mut out) = self.output.lock() {
            out.push_str(text);
        }
    }

    fn request_line(&self) -> bool {
        tracing::debug!("line requested from a port with no interactive side");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_port() {
        let port = RecordingPort::new();
        port.write("a");
        port.write("b");
        assert_eq!(port.output(), "ab");
        assert_eq!(port.take(), "ab");
        assert_eq!(port.output(), "");
        assert!(!port.is_closed());
        assert!(!port.request_line());
    }
}
