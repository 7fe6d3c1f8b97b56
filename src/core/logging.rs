//! Per-device log context.
//!
//! Each component that logs carries one of these by value instead of
//! consulting global state, so several connections can log side by side
//! with their own prefix.

use std::fmt;
use std::sync::Arc;

/// Device tag and verbosity flag attached to every log line of a connection.
#[derive(Clone, PartialEq, Eq)]
pub struct LogContext {
    tag: Arc<str>,
    verbose: bool,
}

impl LogContext {
    /// Context for a device id; long ids are shortened to `abc...xyz`.
    pub fn new(device_id: &str, verbose: bool) -> Self {
        let chars: Vec<char> = device_id.chars().collect();
        let tag = if chars.len() > 6 {
            let head: String = chars[..3].iter().collect();
            let tail: String = chars[chars.len() - 3..].iter().collect();
            format!("{head}...{tail}")
        } else {
            device_id.to_string()
        };
        Self {
            tag: tag.into(),
            verbose,
        }
    }

    /// Short device tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Whether per-frame debug tracing is enabled.
    pub fn verbose(&self) -> bool {
        self.verbose
    }
}

impl Default for LogContext {
    fn default() -> Self {
        Self {
            tag: Arc::from("device"),
            verbose: false,
        }
    }
}

impl fmt::Debug for LogContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.tag)
    }
}

impl fmt::Display for LogContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.tag)
    }
}

/// `log::debug!` gated on the context's verbose flag.
#[macro_export]
macro_rules! trace_device {
    ($ctx:expr, $($arg:tt)+) => {
        if $ctx.verbose() {
            log::debug!("{} {}", $ctx, format_args!($($arg)+));
        }
    };
}
