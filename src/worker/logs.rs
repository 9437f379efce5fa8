//! Per-line classification of worker output.
//!
//! Every complete line a worker writes is classified once and routed to the
//! appropriate buffer. The same predicates double as a readiness hint: a
//! ready-signal line means the server is effectively up even when the HTTP
//! probe is still slow to answer.

use std::sync::LazyLock;

use regex::Regex;

/// Classification of a single log line, in match precedence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogClass {
    /// The worker announced it is serving.
    Ready,
    Error,
    Warning,
    /// A line that names a listening port without being a known ready banner.
    PortAnnouncement(u16),
    Info,
}

const READY_PATTERNS: [&str; 5] = [
    "Server running",
    "Running on",
    "Starting server",
    "Web UI available at",
    "Server listening",
];

const ERROR_PATTERNS: [&str; 4] = ["ERROR", "error:", "Exception", "Traceback"];

const WARNING_PATTERNS: [&str; 3] = ["WARNING", "WARN", "warning:"];

/// Substrings that mean the worker cannot recover and will never come up.
pub const FATAL_PATTERNS: [&str; 4] = [
    "ModuleNotFoundError",
    "No module named",
    "Fatal error",
    "Could not find model",
];

static LOCALHOST_PORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"localhost:(\d+)").expect("static regex"));
static LOOPBACK_PORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"127\.0\.0\.1:(\d+)").expect("static regex"));
static RUNNING_ON_PORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Running on.*port (\d+)").expect("static regex"));

/// Classify one log line.
pub fn classify(line: &str) -> LogClass {
    if READY_PATTERNS.iter().any(|p| line.contains(p)) || LOCALHOST_PORT.is_match(line) {
        return LogClass::Ready;
    }
    if ERROR_PATTERNS.iter().any(|p| line.contains(p)) {
        return LogClass::Error;
    }
    if WARNING_PATTERNS.iter().any(|p| line.contains(p)) {
        return LogClass::Warning;
    }
    if let Some(port) = extract_port(line) {
        return LogClass::PortAnnouncement(port);
    }
    LogClass::Info
}

/// Pull a listening port out of a line, whatever its classification.
pub fn extract_port(line: &str) -> Option<u16> {
    for re in [&*LOCALHOST_PORT, &*LOOPBACK_PORT, &*RUNNING_ON_PORT] {
        if let Some(caps) = re.captures(line) {
            if let Ok(port) = caps[1].parse() {
                return Some(port);
            }
        }
    }
    None
}

/// Whether a line matches one of the unrecoverable patterns.
pub fn is_fatal(line: &str) -> bool {
    FATAL_PATTERNS.iter().any(|p| line.contains(p))
}

/// Strip ANSI escape sequences so colored worker output classifies cleanly.
pub fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            // Escape sequences end at the first ASCII letter.
            for c2 in chars.by_ref() {
                if c2.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}
