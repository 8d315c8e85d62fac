//! Classification of stream failures by gRPC status

use tonic::Code;

/// Whether a failed stream is worth reconnecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClassification {
    /// Back off, then reconnect
    Retryable,
    /// Stop sending forever
    Fatal,
}

/// Maps transport status codes onto retry decisions.
///
/// Only `UNIMPLEMENTED` is fatal: the observer does not speak this protocol
/// version, so no amount of retrying will help. Everything else, including a
/// missing status from a local cancellation, is retryable.
#[derive(Debug, Clone)]
pub struct StatusBackoffPolicy {
    fatal: Vec<Code>,
}

impl StatusBackoffPolicy {
    /// Policy with `UNIMPLEMENTED` as the only fatal code
    pub fn new() -> Self {
        Self {
            fatal: vec![Code::Unimplemented],
        }
    }

    /// Classify a failure status; `None` means no remote status was received
    pub fn classify(&self, code: Option<Code>) -> FailureClassification {
        match code {
            Some(code) if self.fatal.contains(&code) => FailureClassification::Fatal,
            _ => FailureClassification::Retryable,
        }
    }
}

impl Default for StatusBackoffPolicy {
    fn default() -> Self {
        Self::new()
    }
}
