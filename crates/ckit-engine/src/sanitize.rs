use std::sync::LazyLock;

use regex::Regex;

/// Longest error message returned to a caller.
pub const MAX_ERROR_LEN: usize = 2048;

static BACKTRACE_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:\d+:\s|at\s+\S*[/\\]|stack backtrace:|note: run with `RUST_BACKTRACE)")
        .unwrap()
});

static ABSOLUTE_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:[A-Za-z]:\\(?:[\w.\-]+\\)*|(?:/[\w.\-@]+)+/)([\w.\-]+)").unwrap()
});

/// Strip backtrace frames and absolute paths from a message bound for a caller.
///
/// Absolute paths collapse to their final component, so
/// `/home/ci/src/tool.rs:12:5` becomes `tool.rs:12:5`.
pub fn sanitize_message(message: &str) -> String {
    let kept: Vec<&str> = message
        .lines()
        .filter(|line| !BACKTRACE_FRAME.is_match(line))
        .collect();
    let joined = kept.join("\n");
    let stripped = ABSOLUTE_PATH.replace_all(&joined, "$1");
    truncate_message(stripped.trim(), MAX_ERROR_LEN)
}

/// Cut at a char boundary at or below `max_bytes`, marking the cut.
pub fn truncate_message(message: &str, max_bytes: usize) -> String {
    if message.len() <= max_bytes {
        return message.to_string();
    }
    let mut boundary = max_bytes;
    while !message.is_char_boundary(boundary) {
        boundary -= 1;
    }
    format!(
        "{}… [truncated: {} bytes -> {} bytes]",
        &message[..boundary],
        message.len(),
        boundary
    )
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
