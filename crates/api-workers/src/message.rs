//! # Worker Messages
//!
//! The wire contract between the dispatcher and its worker units. Five kinds of message
//! cross the boundary:
//!
//! | Kind                 | Direction          | Payload                                   |
//! |----------------------|--------------------|-------------------------------------------|
//! | `REST_REQUEST`       | dispatcher → unit  | `request: {requestId, resource, method, options}` |
//! | `REST_RESPONSE`      | unit → dispatcher  | `response: {requestId, status, body}`     |
//! | `NOTIFICATION`       | unit → dispatcher  | `notification: {resource, event, data}`   |
//! | `READY_STATE_CHANGE` | unit → dispatcher  | `readyState`                              |
//! | `START`              | dispatcher → unit  | (none)                                    |
//!
//! In-process units receive [`Message`] values directly. Units living behind a serializing
//! transport use the JSON form, which is internally tagged by `type`:
//!
//! ```rust
//! use api_workers::message::{Message, ReadyState};
//!
//! let msg = Message::ready_state_change(ReadyState::Ready);
//! let json = serde_json::to_value(&msg).unwrap();
//! assert_eq!(json["type"], "READY_STATE_CHANGE");
//! assert_eq!(json["readyState"], "READY");
//! ```
//!
//! Callbacks never cross the boundary: `options` inside a request is plain JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::{self, Display};
use tracing::debug;
use uuid::Uuid;

use crate::resource::ResourceDescriptor;

/// Opaque token correlating one request with its one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// HTTP verb of a REST request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        };
        f.write_str(verb)
    }
}

/// Readiness of a worker unit. Moves `Created` → `Ready` once and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadyState {
    Created,
    Ready,
}

impl ReadyState {
    /// Numeric value used on the legacy numeric wire encoding.
    pub fn code(self) -> u8 {
        match self {
            ReadyState::Created => 0,
            ReadyState::Ready => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestRequest {
    pub request_id: RequestId,
    pub resource: String,
    pub method: Method,
    #[serde(default)]
    pub options: Map<String, Value>,
}

impl RestRequest {
    /// Generates a fresh request id and strips callback keys from `options`; everything
    /// else is forwarded untouched.
    pub fn new(
        resource: &ResourceDescriptor,
        method: Method,
        mut options: Map<String, Value>,
    ) -> Self {
        for key in CALLBACK_KEYS {
            options.remove(key);
        }
        let request_id = RequestId::new();
        debug!(%request_id, resource = %resource, %method, "Creating REST request message");
        Self {
            request_id,
            resource: resource.full_path().to_string(),
            method,
            options,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestResponse {
    pub request_id: RequestId,
    /// `0` on success, any other value is an error code.
    pub status: i32,
    #[serde(default)]
    pub body: Value,
}

impl RestResponse {
    pub fn is_success(&self) -> bool {
        self.status == 0
    }
}

/// A resource-level change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub resource: String,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Notification {
    pub fn new(resource: impl Into<String>, event: impl Into<String>, data: Value) -> Self {
        Self {
            resource: resource.into(),
            event: event.into(),
            data,
        }
    }
}

/// A message exchanged between the dispatcher and a worker unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    RestRequest {
        request: RestRequest,
    },
    RestResponse {
        response: RestResponse,
    },
    Notification {
        notification: Notification,
    },
    ReadyStateChange {
        #[serde(rename = "readyState")]
        ready_state: ReadyState,
    },
    Start,
}

/// Discriminant of a [`Message`], with its numeric wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    RestRequest = 1,
    RestResponse = 2,
    Notification = 3,
    ReadyStateChange = 4,
    Start = 5,
}

impl Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            MessageKind::RestRequest => "REST_REQUEST",
            MessageKind::RestResponse => "REST_RESPONSE",
            MessageKind::Notification => "NOTIFICATION",
            MessageKind::ReadyStateChange => "READY_STATE_CHANGE",
            MessageKind::Start => "START",
        };
        f.write_str(tag)
    }
}

/// Option keys that hold callbacks on the caller side and must never be sent to a unit.
const CALLBACK_KEYS: [&str; 2] = ["onSuccess", "onError"];

impl Message {
    /// Builds a `REST_REQUEST` with a freshly generated request id.
    pub fn rest_request(
        resource: &ResourceDescriptor,
        method: Method,
        options: Map<String, Value>,
    ) -> Self {
        Message::RestRequest {
            request: RestRequest::new(resource, method, options),
        }
    }

    pub fn rest_response(request_id: RequestId, status: i32, body: Value) -> Self {
        Message::RestResponse {
            response: RestResponse {
                request_id,
                status,
                body,
            },
        }
    }

    pub fn notification(notification: Notification) -> Self {
        Message::Notification { notification }
    }

    pub fn ready_state_change(ready_state: ReadyState) -> Self {
        Message::ReadyStateChange { ready_state }
    }

    pub fn start() -> Self {
        Message::Start
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::RestRequest { .. } => MessageKind::RestRequest,
            Message::RestResponse { .. } => MessageKind::RestResponse,
            Message::Notification { .. } => MessageKind::Notification,
            Message::ReadyStateChange { .. } => MessageKind::ReadyStateChange,
            Message::Start => MessageKind::Start,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rest_request_strips_callback_keys() {
        let resource = ResourceDescriptor::new("/images");
        let mut options = Map::new();
        options.insert("id".into(), json!("img-1"));
        options.insert("onSuccess".into(), json!("not-serializable-in-practice"));
        options.insert("onError".into(), Value::Null);

        let msg = Message::rest_request(&resource, Method::Get, options);
        let Message::RestRequest { request } = msg else {
            panic!("expected REST_REQUEST");
        };
        assert_eq!(request.resource, "/images");
        assert_eq!(request.method, Method::Get);
        assert_eq!(request.options.len(), 1);
        assert_eq!(request.options["id"], json!("img-1"));
    }

    #[test]
    fn request_ids_are_unique() {
        let resource = ResourceDescriptor::new("/tags");
        let ids: std::collections::HashSet<RequestId> = (0..500)
            .map(|_| match Message::rest_request(&resource, Method::Get, Map::new()) {
                Message::RestRequest { request } => request.request_id,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ids.len(), 500);
    }

    #[test]
    fn wire_format_uses_tagged_envelope() {
        let id = RequestId::new();
        let msg = Message::rest_response(id, 0, json!({"count": 3}));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "REST_RESPONSE");
        assert_eq!(json["response"]["requestId"], json!(id.to_string()));
        assert_eq!(json["response"]["status"], 0);
        assert_eq!(json["response"]["body"]["count"], 3);

        let start = serde_json::to_value(Message::start()).unwrap();
        assert_eq!(start, json!({"type": "START"}));

        let request = serde_json::to_value(Message::rest_request(
            &ResourceDescriptor::new("/importers"),
            Method::Post,
            Map::new(),
        ))
        .unwrap();
        assert_eq!(request["type"], "REST_REQUEST");
        assert_eq!(request["request"]["method"], "POST");
        assert_eq!(request["request"]["resource"], "/importers");
    }

    #[test]
    fn notification_survives_json_transport() {
        let sent = Message::notification(Notification::new(
            "/importers",
            "import.started",
            json!({"id": "imp-1", "files": ["a.jpg", "b.jpg"]}),
        ));
        let decoded = Message::from_json(&sent.to_json().unwrap()).unwrap();
        assert_eq!(decoded, sent);
        assert_eq!(decoded.kind(), MessageKind::Notification);
    }

    #[test]
    fn kinds_keep_numeric_codes() {
        assert_eq!(MessageKind::RestRequest as u8, 1);
        assert_eq!(MessageKind::Start as u8, 5);
        assert_eq!(Message::start().kind().to_string(), "START");
        assert_eq!(ReadyState::Ready.code(), 1);
    }
}
