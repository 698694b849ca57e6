//! Error types produced by the call engine

use std::fmt;
use std::time::Duration;

/// Unified error type for outbound calls.
///
/// Every failure mode the engine can produce maps to exactly one variant, and
/// every variant maps to a stable identifier via [`CallError::kind`]. Callers
/// should branch on the predicates or on `kind()` rather than on message text.
#[derive(Debug)]
pub enum CallError {
    /// The live target set was empty after breaker filtering
    NoEndpoint { uri: String, method: String },
    /// The circuit breaker for the chosen target is open
    ShortCircuit { key: String },
    /// The breaker or transport deadline fired
    Timeout { elapsed: Duration, timeout: Duration },
    /// The breaker concurrency semaphore stayed saturated for the whole deadline
    ConcurrencyReject { max: usize },
    /// The underlying network call failed
    Transport { message: String },
    /// The request body could not be serialized
    Encoding { message: String },
    /// The response body could not be deserialized
    Decoding { status: u16, message: String },
    /// The caller cancelled the call
    Canceled,
    /// The caller-supplied deadline expired during the call
    DeadlineExceeded,
    /// Malformed configuration (setting file, SD config, HTTP method)
    Config { message: String },
    /// A recovered panic or broken invariant at the call boundary
    Internal { message: String },
}

impl CallError {
    /// Stable identifier for this error kind. These strings are part of the
    /// public contract and do not change across releases.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoEndpoint { .. } => "no_endpoint",
            Self::ShortCircuit { .. } => "short_circuit",
            Self::Timeout { .. } => "timeout",
            Self::ConcurrencyReject { .. } => "concurrency_reject",
            Self::Transport { .. } => "transport",
            Self::Encoding { .. } => "encoding",
            Self::Decoding { .. } => "decoding",
            Self::Canceled => "context_canceled",
            Self::DeadlineExceeded => "context_deadline_exceeded",
            Self::Config { .. } => "config",
            Self::Internal { .. } => "internal",
        }
    }

    /// Check if this error means the live set was empty.
    pub fn is_no_endpoint(&self) -> bool {
        matches!(self, Self::NoEndpoint { .. })
    }

    /// Check if this error is a breaker-imposed rejection.
    pub fn is_short_circuit(&self) -> bool {
        matches!(self, Self::ShortCircuit { .. })
    }

    /// Check if this error is due to a deadline firing.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error is a semaphore saturation rejection.
    pub fn is_concurrency_reject(&self) -> bool {
        matches!(self, Self::ConcurrencyReject { .. })
    }

    /// Check if this error came from the network layer.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Check if this error came from response decoding.
    pub fn is_decoding(&self) -> bool {
        matches!(self, Self::Decoding { .. })
    }

    /// Check if the caller terminated the call (cancel or deadline).
    pub fn is_caller_terminated(&self) -> bool {
        matches!(self, Self::Canceled | Self::DeadlineExceeded)
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoEndpoint { uri, method } => {
                write!(f, "no live endpoint for {} {}, all nodes dead or open", method, uri)
            }
            Self::ShortCircuit { key } => write!(f, "circuit open for {}", key),
            Self::Timeout { elapsed, timeout } => {
                write!(f, "call timed out after {:?} (limit {:?})", elapsed, timeout)
            }
            Self::ConcurrencyReject { max } => {
                write!(f, "concurrency limit reached ({} in flight)", max)
            }
            Self::Transport { message } => write!(f, "transport failure: {}", message),
            Self::Encoding { message } => write!(f, "request encoding failed: {}", message),
            Self::Decoding { status, message } => {
                write!(f, "response decoding failed (status {}): {}", status, message)
            }
            Self::Canceled => write!(f, "call canceled by caller"),
            Self::DeadlineExceeded => write!(f, "caller deadline exceeded"),
            Self::Config { message } => write!(f, "configuration error: {}", message),
            Self::Internal { message } => write!(f, "internal error: {}", message),
        }
    }
}

impl std::error::Error for CallError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        let cases: Vec<(CallError, &str)> = vec![
            (
                CallError::NoEndpoint { uri: "/a".into(), method: "GET".into() },
                "no_endpoint",
            ),
            (CallError::ShortCircuit { key: "k".into() }, "short_circuit"),
            (
                CallError::Timeout {
                    elapsed: Duration::from_millis(7),
                    timeout: Duration::from_millis(5),
                },
                "timeout",
            ),
            (CallError::ConcurrencyReject { max: 10 }, "concurrency_reject"),
            (CallError::Transport { message: "refused".into() }, "transport"),
            (CallError::Encoding { message: "bad".into() }, "encoding"),
            (CallError::Decoding { status: 404, message: "bad".into() }, "decoding"),
            (CallError::Canceled, "context_canceled"),
            (CallError::DeadlineExceeded, "context_deadline_exceeded"),
            (CallError::Config { message: "bad".into() }, "config"),
            (CallError::Internal { message: "panic".into() }, "internal"),
        ];
        for (err, kind) in cases {
            assert_eq!(err.kind(), kind);
        }
    }

    #[test]
    fn short_circuit_display_names_the_key() {
        let err = CallError::ShortCircuit { key: "10.0.0.1:80-/x-GET".into() };
        let msg = err.to_string();
        assert!(msg.contains("circuit open"));
        assert!(msg.contains("10.0.0.1:80-/x-GET"));
    }

    #[test]
    fn decoding_display_includes_status() {
        let err = CallError::Decoding { status: 404, message: "expected value".into() };
        assert!(err.to_string().contains("404"));
    }

    #[test]
    fn predicates_match_variants() {
        assert!(CallError::Timeout {
            elapsed: Duration::ZERO,
            timeout: Duration::ZERO,
        }
        .is_timeout());
        assert!(CallError::ShortCircuit { key: String::new() }.is_short_circuit());
        assert!(CallError::NoEndpoint { uri: String::new(), method: String::new() }
            .is_no_endpoint());
        assert!(CallError::Canceled.is_caller_terminated());
        assert!(CallError::DeadlineExceeded.is_caller_terminated());
        assert!(!CallError::Transport { message: String::new() }.is_caller_terminated());
    }
}
