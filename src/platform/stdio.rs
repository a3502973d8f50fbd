//! Terminal over the process's standard streams
//!
//! Output is written straight through, to stdout or (when stdout carries
//! machine-readable results) to stderr. Line requests are served by a reader
//! thread per request, so the dispatcher never blocks on the keyboard.

use super::{LineReply, Terminal};
use std::io::{self, BufRead, Write};
use std::thread;

/// Terminal backed by stdio
#[derive(Debug, Default)]
pub struct StdioTerminal {
    to_stderr: bool,
}

impl StdioTerminal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render host output on stderr instead of stdout
    pub fn on_stderr() -> Self {
        Self { to_stderr: true }
    }
}

impl Terminal for StdioTerminal {
    fn write(&self, text: &str) {
        let result = if self.to_stderr {
            let mut stderr = io::stderr().lock();
            stderr.write_all(text.as_bytes()).and_then(|_| stderr.flush())
        } else {
            let mut stdout = io::stdout().lock();
            stdout.write_all(text.as_bytes()).and_then(|_| stdout.flush())
        };
        if let Err(err) = result {
            tracing::debug!(error = %err, "terminal write failed");
        }
    }

    fn request_line(&self, reply: LineReply) {
        let spawned = thread::Builder::new()
            .name("sandcc-stdin".to_string())
            .spawn(move || {
                let mut line = String::new();
                match io::stdin().lock().read_line(&mut line) {
                    // EOF answers with an empty line
                    Ok(_) => reply.send(&line),
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to read stdin");
                        reply.send("");
                    }
                }
            });
        if let Err(err) = spawned {
            tracing::error!(error = %err, "failed to spawn stdin reader");
        }
    }
}
