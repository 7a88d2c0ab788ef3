//! Transport-neutral operation outcomes.

use crate::Error;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Outcome category, mapped to transport codes by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StatusCategory {
    Ok,
    Accepted,
    BadRequest,
    NotFound,
    Unauthorized,
    Conflict,
    Unsupported,
    Internal,
}

impl StatusCategory {
    pub fn is_success(&self) -> bool {
        matches!(self, StatusCategory::Ok | StatusCategory::Accepted)
    }
}

/// Result of a service operation: a category, a user-facing message and an
/// optional value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OperationResult<T> {
    pub status: StatusCategory,
    pub message: String,
    pub value: Option<T>,
}

impl<T> OperationResult<T> {
    pub fn ok(message: impl Into<String>, value: T) -> Self {
        Self {
            status: StatusCategory::Ok,
            message: message.into(),
            value: Some(value),
        }
    }

    pub fn ok_empty(message: impl Into<String>) -> Self {
        Self {
            status: StatusCategory::Ok,
            message: message.into(),
            value: None,
        }
    }

    pub fn accepted(message: impl Into<String>, value: Option<T>) -> Self {
        Self {
            status: StatusCategory::Accepted,
            message: message.into(),
            value,
        }
    }

    pub fn failure(status: StatusCategory, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            value: None,
        }
    }

    pub fn from_error(error: &Error) -> Self {
        Self::failure(error.category(), error.to_string())
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> OperationResult<U> {
        OperationResult {
            status: self.status,
            message: self.message,
            value: self.value.map(f),
        }
    }
}

impl<T> From<Error> for OperationResult<T> {
    fn from(error: Error) -> Self {
        Self::from_error(&error)
    }
}
