use thiserror::Error;

pub type DispatchResult<T> = std::result::Result<T, DispatchError>;

/// Error taxonomy for dispatch operations.
///
/// Transient errors are retried with backoff; permanent errors move the row
/// to its terminal failed state. Lease-lost and stale-fencing abort the
/// current batch without touching row state so the reaper can recover it.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("transient: {message}")]
    Transient { message: String },

    #[error("permanent: {message}")]
    Permanent { message: String },

    #[error("lease lost for scope {scope}")]
    LeaseLost { scope: String },

    #[error("stale fencing token {token}, store has {persisted}")]
    StaleFencing { token: i64, persisted: i64 },

    #[error("duplicate execution suppressed for key {key}")]
    Duplicate { key: String },

    #[error("no handler registered for topic {topic}")]
    UnknownTopic { topic: String },
}

impl DispatchError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// Classification used by the dispatcher when deciding between abandon
    /// and fail.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            DispatchError::Transient { .. } => FailureKind::Transient,
            DispatchError::Permanent { .. }
            | DispatchError::Duplicate { .. }
            | DispatchError::UnknownTopic { .. } => FailureKind::Permanent,
            DispatchError::LeaseLost { .. } | DispatchError::StaleFencing { .. } => {
                FailureKind::AbortBatch
            }
        }
    }
}

/// What the dispatcher should do with a row after a failed handler call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Return the row to pending with backoff.
    Transient,
    /// Move the row to its terminal failed state.
    Permanent,
    /// Stop the batch without mutating rows; the reaper recovers them.
    AbortBatch,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn lease_loss_aborts_the_batch() {
        let err = DispatchError::LeaseLost {
            scope: "outbox:dispatch".to_string(),
        };
        assert_eq!(err.failure_kind(), FailureKind::AbortBatch);
    }

    #[test]
    fn unknown_topic_is_permanent() {
        let err = DispatchError::UnknownTopic {
            topic: "nope".to_string(),
        };
        assert_eq!(err.failure_kind(), FailureKind::Permanent);
    }
}
