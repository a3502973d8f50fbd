//! Compiler diagnostics parsing
//!
//! Turns clang's text output into positioned records. Lines that are not of
//! the `file:line:column: severity: message` shape (source excerpts, carets,
//! summaries) are skipped.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

static DIAGNOSTIC_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(.+):(\d+):(\d+):\s([^:]*):\s(.+)").expect("diagnostic pattern is valid")
});

/// One positioned compiler message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub file: String,
    /// 1-based
    pub line: u32,
    /// 1-based
    pub column: u32,
    pub severity: String,
    pub message: String,
}

/// Known severities
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Note,
    Warning,
    Error,
    Fatal,
    Other,
}

impl Severity {
    pub fn classify(text: &str) -> Self {
        match text.trim() {
            "note" | "remark" => Severity::Note,
            "warning" => Severity::Warning,
            "error" => Severity::Error,
            "fatal error" => Severity::Fatal,
            _ => Severity::Other,
        }
    }

    /// ANSI colour used when rendering to a terminal
    fn color(self) -> &'static str {
        match self {
            Severity::Note => "\x1b[96m",
            Severity::Warning => "\x1b[95m",
            Severity::Error | Severity::Fatal => "\x1b[91m",
            Severity::Other => "\x1b[0m",
        }
    }
}

impl Diagnostic {
    pub fn level(&self) -> Severity {
        Severity::classify(&self.severity)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.level(), Severity::Error | Severity::Fatal)
    }

    /// Single coloured line for terminal output
    pub fn render(&self) -> String {
        format!(
            "\x1b[1m{}:{}:{}: {}{}:\x1b[0m {}\r\n",
            self.file,
            self.line,
            self.column,
            self.level().color(),
            self.severity,
            self.message
        )
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}: {}: {}",
            self.file, self.line, self.column, self.severity, self.message
        )
    }
}

/// Extract every diagnostic from compiler output, in input order
pub fn parse(output: &str) -> Vec<Diagnostic> {
    output.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<Diagnostic> {
    let caps = DIAGNOSTIC_LINE.captures(line)?;
    Some(Diagnostic {
        file: caps[1].to_string(),
        line: caps[2].parse().ok()?,
        column: caps[3].parse().ok()?,
        severity: caps[4].to_string(),
        message: caps[5].to_string(),
    })
}
