use thiserror::Error;

use courier_types::api::{AckOutcome, ErrorCode};

/// Everything that can go wrong handling one client operation.
///
/// None of these are ever broadcast: they travel back to the issuing
/// connection only, as an error ack.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("not permitted: {0}")]
    Authorization(&'static str),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("invalid request: {0}")]
    Invalid(String),

    /// The store rejected the operation; the transaction was rolled back.
    #[error("store operation `{op}` failed: {reason}")]
    Persistence { op: &'static str, reason: String },

    #[error("store operation `{0}` timed out")]
    Timeout(&'static str),
}

impl GatewayError {
    pub fn persistence(op: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Persistence {
            op,
            reason: err.to_string(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Authentication(_) => ErrorCode::Unauthenticated,
            Self::Authorization(_) => ErrorCode::Forbidden,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Invalid(_) => ErrorCode::Invalid,
            Self::Persistence { .. } => ErrorCode::Persistence,
            Self::Timeout(_) => ErrorCode::Timeout,
        }
    }

    /// Whether retrying the same command could succeed.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Persistence { .. } | Self::Timeout(_))
    }

    pub fn to_outcome(&self) -> AckOutcome {
        // Store internals stay in the server log, not on the wire.
        let reason = match self {
            Self::Persistence { op, .. } => format!("store operation `{}` failed", op),
            other => other.to_string(),
        };
        AckOutcome::Error {
            code: self.code(),
            reason,
            retryable: self.retryable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistence_is_retryable_and_redacted() {
        let err = GatewayError::persistence("insert_message", "UNIQUE constraint failed: secret_table.x");
        assert!(err.retryable());
        match err.to_outcome() {
            AckOutcome::Error { code, reason, retryable } => {
                assert_eq!(code, ErrorCode::Persistence);
                assert!(retryable);
                assert!(!reason.contains("secret_table"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_authorization_is_final() {
        let err = GatewayError::Authorization("only the sender may edit a message");
        assert_eq!(err.code(), ErrorCode::Forbidden);
        assert!(!err.retryable());
    }
}
