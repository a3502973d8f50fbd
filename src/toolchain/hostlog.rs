//! Progress lines on the host stream
//!
//! These are part of what the user sees, so they go to the host port and not
//! to `tracing`.

use crate::platform::HostPort;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const ARROW: &str = "\x1b[1;93m>\x1b[0m ";
const GREEN: &str = "\x1b[92m";
const NORMAL: &str = "\x1b[0m";

/// Grey text for toolchain chatter
pub const GRAY: &str = "\x1b[38;5;248m";

/// Host port plus the show-timing switch
#[derive(Clone)]
pub struct HostLog {
    port: Arc<dyn HostPort>,
    show_timing: Arc<AtomicBool>,
}

impl HostLog {
    pub fn new(port: Arc<dyn HostPort>) -> Self {
        Self {
            port,
            show_timing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn port(&self) -> &Arc<dyn HostPort> {
        &self.port
    }

    pub fn show_timing(&self) -> bool {
        self.show_timing.load(Ordering::Relaxed)
    }

    pub fn set_show_timing(&self, on: bool) {
        self.show_timing.store(on, Ordering::Relaxed);
    }

    pub fn write(&self, text: &str) {
        self.port.write(text);
    }

    /// `> message`
    pub fn line(&self, message: &str) {
        self.port.write(&format!("{}{}", ARROW, message));
    }

    /// Log `message...`, run `f`, and mark it done if it succeeded
    pub fn task<T, E>(&self, message: &str, f: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        let start = Instant::now();
        self.line(&format!("{}...", message));
        let value = f()?;
        self.write(" done.");
        if self.show_timing() {
            self.write(&format!(
                " {}({}s){}\r\n",
                GREEN,
                seconds(start.elapsed()),
                NORMAL
            ));
        }
        self.write("\r\n");
        Ok(value)
    }

    /// `(instantiate s/run s)` after a run
    pub fn run_timing(&self, instantiate: Duration, run: Duration) {
        if self.show_timing() {
            self.write(&format!(
                "{}({}s/{}s){}\r\n",
                GREEN,
                seconds(instantiate),
                seconds(run),
                NORMAL
            ));
        }
    }
}

fn seconds(elapsed: Duration) -> String {
    format!("{:.2}", elapsed.as_secs_f64())
}
