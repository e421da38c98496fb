//! Boundary error kinds visible to renters.
//!
//! These are the only failure reasons that cross the wire; their `Display`
//! form is the concise reason string carried in `result_delivery.error` and
//! `task_timeout.error`.

use thiserror::Error;

/// Reasons a task can fail at the scheduling boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskErrorKind {
    /// Submit rejected because the bounded submit queue is at capacity.
    /// The caller may retry later.
    #[error("queue_full")]
    QueueFull,

    /// The submitted `task_type` is not in the executor registry. Rejected
    /// synchronously, never retried.
    #[error("unknown_task_type")]
    UnknownTaskType,

    /// No registered peer satisfies the task's constraints.
    #[error("no_peers")]
    NoPeers,

    /// A peer returned a non-success result; the peer's message is carried
    /// separately in `result_delivery.error`.
    #[error("peer_error")]
    PeerError,

    /// The task's deadline elapsed before a result arrived.
    #[error("timeout")]
    Timeout,

    /// `max_attempts` assignments were made without a success.
    #[error("exhausted_attempts")]
    ExhaustedAttempts,

    /// The renter or peer connection dropped; all pending operations on that
    /// connection complete with this error.
    #[error("transport_closed")]
    TransportClosed,
}

impl TaskErrorKind {
    /// Parse a wire reason string back into a kind, if it matches one.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queue_full" => Some(Self::QueueFull),
            "unknown_task_type" => Some(Self::UnknownTaskType),
            "no_peers" => Some(Self::NoPeers),
            "peer_error" => Some(Self::PeerError),
            "timeout" => Some(Self::Timeout),
            "exhausted_attempts" => Some(Self::ExhaustedAttempts),
            "transport_closed" => Some(Self::TransportClosed),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_wire_strings() {
        assert_eq!(TaskErrorKind::QueueFull.to_string(), "queue_full");
        assert_eq!(
            TaskErrorKind::ExhaustedAttempts.to_string(),
            "exhausted_attempts"
        );
        assert_eq!(
            TaskErrorKind::parse("timeout"),
            Some(TaskErrorKind::Timeout)
        );
        assert_eq!(TaskErrorKind::parse("nonsense"), None);
    }
}
