use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Message;

// -- JWT Claims --

/// Bearer-token claims. Tokens are issued elsewhere; the gateway only
/// verifies them and reads the stable user id out of `sub`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Acknowledgements --

/// Result of a client command, delivered only to the issuing connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AckOutcome {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<Message>,
    },
    Error {
        code: ErrorCode,
        reason: String,
        retryable: bool,
    },
}

impl AckOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthenticated,
    Forbidden,
    NotFound,
    Invalid,
    Persistence,
    Timeout,
}
