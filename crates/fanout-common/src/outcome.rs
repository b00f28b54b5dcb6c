//! Attempt and terminal outcomes.
//!
//! Every failure a transport reports is classified into one of three
//! [`FailureClass`]es. The class alone decides whether a retry is possible:
//! `Throttled` and `Transient` failures may be retried, `Fatal` ones never are.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Three-way classification of a failed invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Explicit overload signal from the endpoint
    Throttled,
    /// Network or timeout class failure
    Transient,
    /// Permanent failure for this record
    Fatal,
}

impl FailureClass {
    pub fn is_retryable(self) -> bool {
        !matches!(self, FailureClass::Fatal)
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureClass::Throttled => "throttled",
            FailureClass::Transient => "transient",
            FailureClass::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// A classified invocation failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{class}: {message}")]
pub struct InvocationError {
    pub class: FailureClass,
    pub message: String,
    /// Minimum wait requested by the endpoint before trying again
    pub retry_after: Option<Duration>,
}

impl InvocationError {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn throttled(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Throttled, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Fatal, message)
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// Result of one call through a transport.
pub type InvokeResult = std::result::Result<Bytes, InvocationError>;

/// Per-attempt outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Failed(FailureClass),
}

impl AttemptOutcome {
    pub fn of(result: &InvokeResult) -> Self {
        match result {
            Ok(_) => AttemptOutcome::Success,
            Err(err) => AttemptOutcome::Failed(err.class),
        }
    }
}

/// One attempt at delivering one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvocationAttempt {
    /// Attempt number, starting at 1
    pub attempt: u32,
    pub started_at: Instant,
    pub latency: Duration,
    pub outcome: AttemptOutcome,
}

/// Final, immutable classification of a record.
///
/// `Succeeded` counts as success; `Fatal`, `Rejected` and `Exhausted` count
/// as failure; `Cancelled` records were abandoned by an abort or deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TerminalOutcome {
    Succeeded {
        attempts: u32,
    },
    /// Non-retryable failure reported by the endpoint
    Fatal {
        attempts: u32,
        reason: String,
    },
    /// Malformed at the source; never invoked
    Rejected {
        reason: String,
    },
    /// Retryable failures until the attempt budget ran out
    Exhausted {
        attempts: u32,
        last_failure: FailureClass,
        reason: String,
    },
    Cancelled {
        attempts: u32,
    },
}

impl TerminalOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            TerminalOutcome::Succeeded { attempts }
            | TerminalOutcome::Fatal { attempts, .. }
            | TerminalOutcome::Exhausted { attempts, .. }
            | TerminalOutcome::Cancelled { attempts } => *attempts,
            TerminalOutcome::Rejected { .. } => 0,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TerminalOutcome::Succeeded { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            TerminalOutcome::Fatal { .. }
                | TerminalOutcome::Rejected { .. }
                | TerminalOutcome::Exhausted { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TerminalOutcome::Cancelled { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TerminalOutcome::Succeeded { .. } => "succeeded",
            TerminalOutcome::Fatal { .. } => "fatal",
            TerminalOutcome::Rejected { .. } => "rejected",
            TerminalOutcome::Exhausted { .. } => "exhausted",
            TerminalOutcome::Cancelled { .. } => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_class_retryable() {
        assert!(FailureClass::Throttled.is_retryable());
        assert!(FailureClass::Transient.is_retryable());
        assert!(!FailureClass::Fatal.is_retryable());
    }

    #[test]
    fn test_invocation_error_display() {
        let err = InvocationError::throttled("429 Too Many Requests")
            .with_retry_after(Duration::from_secs(2));
        assert_eq!(err.to_string(), "throttled: 429 Too Many Requests");
        assert_eq!(err.retry_after, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_attempt_outcome_of_result() {
        let ok: InvokeResult = Ok(Bytes::from_static(b"{}"));
        let err: InvokeResult = Err(InvocationError::transient("reset"));
        assert_eq!(AttemptOutcome::of(&ok), AttemptOutcome::Success);
        assert_eq!(
            AttemptOutcome::of(&err),
            AttemptOutcome::Failed(FailureClass::Transient)
        );
    }

    #[test]
    fn test_terminal_outcome_classification() {
        let rejected = TerminalOutcome::Rejected {
            reason: "bad json".into(),
        };
        assert!(rejected.is_failure());
        assert_eq!(rejected.attempts(), 0);

        let exhausted = TerminalOutcome::Exhausted {
            attempts: 3,
            last_failure: FailureClass::Transient,
            reason: "timeout".into(),
        };
        assert!(exhausted.is_failure());
        assert!(!exhausted.is_success());
        assert_eq!(exhausted.kind(), "exhausted");

        let cancelled = TerminalOutcome::Cancelled { attempts: 1 };
        assert!(!cancelled.is_failure());
        assert!(cancelled.is_cancelled());
    }

    #[test]
    fn test_terminal_outcome_serialization() {
        let outcome = TerminalOutcome::Succeeded { attempts: 2 };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "succeeded");
        assert_eq!(json["attempts"], 2);
    }
}
