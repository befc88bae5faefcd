//! Request options as supplied by callers of `do_request`.
//!
//! Options carry two kinds of data: JSON-safe fields (`id`, `query`, `attr`, ...) that are
//! forwarded to the worker unit, and completion callbacks that stay with the dispatcher.
//! Fields may also arrive as a JSON string; it is parsed when the request is dispatched.

use serde_json::{Map, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::sync::oneshot;
use tracing::error;

use crate::error::DispatchError;

pub type ResponseCallback = Box<dyn FnOnce(Value) + Send + 'static>;

enum Payload {
    Text(String),
    Json(Value),
}

/// Options for a single `do_request` call.
pub struct RequestOptions {
    payload: Option<Payload>,
    fields: Map<String, Value>,
    on_success: Option<ResponseCallback>,
    on_error: Option<ResponseCallback>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let payload = match &self.payload {
            None => None,
            Some(Payload::Text(text)) => Some(text.clone()),
            Some(Payload::Json(value)) => Some(value.to_string()),
        };
        f.debug_struct("RequestOptions")
            .field("payload", &payload)
            .field("fields", &self.fields)
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl RequestOptions {
    pub fn new() -> Self {
        Self {
            payload: None,
            fields: Map::new(),
            on_success: None,
            on_error: None,
        }
    }

    /// Options given as a JSON document. Must describe an object (or `null`).
    pub fn from_json_str(json: impl Into<String>) -> Self {
        Self {
            payload: Some(Payload::Text(json.into())),
            ..Self::new()
        }
    }

    /// Options given as an already-parsed JSON value. Must be an object (or `null`).
    pub fn from_value(value: Value) -> Self {
        Self {
            payload: Some(Payload::Json(value)),
            ..Self::new()
        }
    }

    pub fn id(self, id: impl Into<Value>) -> Self {
        self.field("id", id)
    }

    pub fn query(self, query: Value) -> Self {
        self.field("query", query)
    }

    pub fn attr(self, attr: Value) -> Self {
        self.field("attr", attr)
    }

    /// Sets an arbitrary field. On options built from a JSON string or value, the field
    /// overrides the parsed one of the same name.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn on_success(mut self, callback: impl FnOnce(Value) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl FnOnce(Value) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }

    /// Splits the options into the JSON fields sent to the unit and the callbacks kept
    /// by the dispatcher.
    pub(crate) fn normalize(self) -> Result<(Map<String, Value>, Completion), DispatchError> {
        let mut fields = match self.payload {
            None => Map::new(),
            Some(Payload::Text(text)) => {
                let value: Value = serde_json::from_str(&text)
                    .map_err(|e| DispatchError::InvalidOptions(e.to_string()))?;
                into_object(value)?
            }
            Some(Payload::Json(value)) => into_object(value)?,
        };
        fields.extend(self.fields);
        let completion = Completion::Callbacks {
            on_success: self.on_success,
            on_error: self.on_error,
        };
        Ok((fields, completion))
    }
}

fn into_object(value: Value) -> Result<Map<String, Value>, DispatchError> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(DispatchError::InvalidOptions(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}

/// The caller-side half of a pending request.
pub(crate) enum Completion {
    /// Callback style: `on_success` for status `0`, `on_error` otherwise.
    Callbacks {
        on_success: Option<ResponseCallback>,
        on_error: Option<ResponseCallback>,
    },
    /// Future style: the body is delivered as `Ok` or `Err` on a oneshot channel.
    Reply(oneshot::Sender<Result<Value, Value>>),
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Completion::Callbacks {
                on_success,
                on_error,
            } => f
                .debug_struct("Callbacks")
                .field("on_success", &on_success.is_some())
                .field("on_error", &on_error.is_some())
                .finish(),
            Completion::Reply(_) => f.write_str("Reply"),
        }
    }
}

impl Completion {
    /// Delivers the response according to `status`. Returns whether anyone was listening.
    pub(crate) fn complete(self, status: i32, body: Value) -> bool {
        match self {
            Completion::Callbacks {
                on_success,
                on_error,
            } => {
                let (name, callback) = if status == 0 {
                    ("on_success", on_success)
                } else {
                    ("on_error", on_error)
                };
                match callback {
                    Some(callback) => {
                        run_guarded(name, move || callback(body));
                        true
                    }
                    None => false,
                }
            }
            Completion::Reply(reply) => {
                let outcome = if status == 0 { Ok(body) } else { Err(body) };
                reply.send(outcome).is_ok()
            }
        }
    }
}

/// Runs a caller-supplied callback, containing a panic to the callback itself.
/// Returns `false` if it panicked.
pub(crate) fn run_guarded(name: &str, callback: impl FnOnce()) -> bool {
    match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(()) => true,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(callback = name, %reason, "Callback panicked");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn string_payload_is_parsed() {
        let (fields, _) = RequestOptions::from_json_str(r#"{"id": "img-1", "query": {"n": 2}}"#)
            .normalize()
            .unwrap();
        assert_eq!(fields["id"], json!("img-1"));
        assert_eq!(fields["query"]["n"], json!(2));
    }

    #[test]
    fn builder_fields_merge_over_parsed_payloads() {
        let (fields, _) = RequestOptions::from_json_str(r#"{"id": "old", "query": {"n": 2}}"#)
            .id("img-7")
            .attr(json!({"name": "beach.jpg"}))
            .normalize()
            .unwrap();
        assert_eq!(fields["id"], json!("img-7"));
        assert_eq!(fields["query"]["n"], json!(2));
        assert_eq!(fields["attr"]["name"], json!("beach.jpg"));

        let (fields, _) = RequestOptions::from_value(Value::Null)
            .field("page", 3)
            .normalize()
            .unwrap();
        assert_eq!(fields["page"], json!(3));

        let (fields, _) = RequestOptions::from_json_str("{}").id("x").normalize().unwrap();
        assert_eq!(fields["id"], json!("x"));
    }

    #[test]
    fn panicking_callback_is_contained() {
        let (_, completion) = RequestOptions::new()
            .on_error(|_| panic!("broken handler"))
            .normalize()
            .unwrap();
        assert!(completion.complete(500, json!({})));
        assert!(!run_guarded("ready", || panic!("broken ready")));
        assert!(run_guarded("ready", || {}));
    }

    #[test]
    fn null_payload_becomes_empty() {
        let (fields, _) = RequestOptions::from_json_str("null").normalize().unwrap();
        assert!(fields.is_empty());
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        for bad in ["{not json", "[1, 2]", "\"text\""] {
            let err = RequestOptions::from_json_str(bad).normalize().unwrap_err();
            assert!(matches!(err, DispatchError::InvalidOptions(_)), "{bad}");
        }
        let err = RequestOptions::from_value(json!(42)).normalize().unwrap_err();
        assert!(matches!(err, DispatchError::InvalidOptions(_)));
    }

    #[test]
    fn completion_picks_one_callback_by_status() {
        let successes = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));

        let build = || {
            let s = successes.clone();
            let e = errors.clone();
            RequestOptions::new()
                .on_success(move |_| {
                    s.fetch_add(1, Ordering::SeqCst);
                })
                .on_error(move |_| {
                    e.fetch_add(1, Ordering::SeqCst);
                })
                .normalize()
                .unwrap()
                .1
        };

        assert!(build().complete(0, json!({})));
        assert!(build().complete(404, json!({})));
        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reply_completion_resolves_the_receiver() {
        let (tx, rx) = oneshot::channel();
        assert!(Completion::Reply(tx).complete(500, json!({"status": 500})));
        assert_eq!(rx.await.unwrap(), Err(json!({"status": 500})));
    }

    #[test]
    fn completion_without_matching_callback_reports_it() {
        let (_, completion) = RequestOptions::new().on_success(|_| {}).normalize().unwrap();
        assert!(!completion.complete(500, json!({})));
    }
}
