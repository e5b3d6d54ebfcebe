//! Uniform result envelope for every operation.

use crate::utils::errors::{DrError, Result};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub message: String,
}

impl From<&DrError> for ErrorBody {
    fn from(error: &DrError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// `{ "success": true, "data": ... }` or `{ "success": false, "error": {...} }`
#[derive(Debug, Clone, Serialize)]
pub struct Response<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl<T> Response<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: &DrError) -> Self {
        match error {
            DrError::Io(_) | DrError::Serialization(_) | DrError::Task(_) | DrError::Compression(_) => {
                tracing::error!(kind = error.kind(), "Operation failed: {error}");
            }
            _ => tracing::warn!(kind = error.kind(), "Operation rejected: {error}"),
        }
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    pub fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::err(&e),
        }
    }

    pub fn error_kind(&self) -> Option<&'static str> {
        self.error.as_ref().map(|e| e.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shape() {
        let ok = serde_json::to_value(Response::ok(42)).unwrap();
        assert_eq!(ok, serde_json::json!({ "success": true, "data": 42 }));

        let err: Response<u32> = Response::err(&DrError::NotFound("backup 'x'".into()));
        let err = serde_json::to_value(err).unwrap();
        assert_eq!(err["success"], false);
        assert_eq!(err["error"]["kind"], "not_found");
        assert!(err.get("data").is_none());
    }
}
