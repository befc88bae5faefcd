//! # Dispatch Errors
//!
//! Two families of errors live here:
//!
//! - [`DispatchError`] covers failures of the worker pool itself: caller mistakes that are
//!   rejected synchronously by `do_request`, and transport problems between the dispatcher
//!   and its units.
//! - [`ResourceError`] covers failures of a resource operation. These never escape a worker
//!   unit as a Rust error; the unit converts them into a nonzero `status` and a JSON body
//!   that travels back inside a `REST_RESPONSE`.

use serde_json::{json, Value};

/// Errors raised by the dispatcher and its client handle.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Unknown resource: {0}")]
    UnknownResource(String),
    #[error("Invalid request options: {0}")]
    InvalidOptions(String),
    #[error("Resource registered twice: {0}")]
    DuplicateResource(String),
    #[error("Worker unavailable for resource: {0}")]
    WorkerUnavailable(String),
    #[error("Failed to spawn worker unit: {0}")]
    UnitSpawn(String),
    #[error("Dispatcher closed")]
    DispatcherClosed,
    #[error("Dispatcher dropped response channel")]
    DispatcherDropped,
    #[error("Request failed: {body}")]
    RequestFailed { body: Value },
    #[error("Dispatcher task failed: {0}")]
    TaskFailed(String),
}

impl DispatchError {
    /// Status code carried in the body of a `RequestFailed` error, if any.
    pub fn status(&self) -> Option<i64> {
        match self {
            DispatchError::RequestFailed { body } => body.get("status").and_then(Value::as_i64),
            _ => None,
        }
    }
}

/// Failure of a single resource operation.
///
/// Every variant maps to a nonzero status code; `0` is reserved for success on the wire.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResourceError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Operation timed out: {0}")]
    Timeout(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("Unavailable: {0}")]
    Unavailable(String),
}

impl ResourceError {
    pub fn status(&self) -> i32 {
        match self {
            ResourceError::NotFound(_) => 404,
            ResourceError::Validation(_) => 400,
            ResourceError::Timeout(_) => 504,
            ResourceError::Io(_) | ResourceError::Internal(_) => 500,
            ResourceError::Unavailable(_) => 503,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ResourceError::NotFound(_) => "not_found",
            ResourceError::Validation(_) => "validation",
            ResourceError::Timeout(_) => "timeout",
            ResourceError::Io(_) => "io",
            ResourceError::Internal(_) => "internal",
            ResourceError::Unavailable(_) => "unavailable",
        }
    }

    /// The JSON error body sent back to the caller's `on_error`.
    pub fn body(&self) -> Value {
        json!({
            "status": self.status(),
            "error": self.kind(),
            "message": self.to_string(),
        })
    }
}

impl From<std::io::Error> for ResourceError {
    fn from(e: std::io::Error) -> Self {
        ResourceError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ResourceError {
    fn from(e: serde_json::Error) -> Self {
        ResourceError::Validation(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_errors_never_map_to_success() {
        let errors = [
            ResourceError::NotFound("x".into()),
            ResourceError::Validation("x".into()),
            ResourceError::Timeout("x".into()),
            ResourceError::Io("x".into()),
            ResourceError::Internal("x".into()),
            ResourceError::Unavailable("x".into()),
        ];
        for e in errors {
            assert_ne!(e.status(), 0);
            assert_eq!(e.body()["status"], json!(e.status()));
        }
    }

    #[test]
    fn request_failed_exposes_status() {
        let e = DispatchError::RequestFailed {
            body: ResourceError::NotFound("image 7".into()).body(),
        };
        assert_eq!(e.status(), Some(404));
        assert_eq!(DispatchError::DispatcherClosed.status(), None);
    }
}
