//! # API Resources
//!
//! The [`ApiResource`] trait is the contract a REST resource implements to be hosted by a
//! worker unit. The unit owns the resource exclusively: every call happens on the unit's
//! own message loop, one at a time, so implementations can keep plain mutable state
//! without locks.
//!
//! A resource never sees callbacks or request ids. It receives the HTTP verb and the
//! JSON-safe options, and returns either a response body or a [`ResourceError`]. The unit
//! turns that result into a `REST_RESPONSE`.
//!
//! Notifications are emitted through the [`Notifier`] found in the [`UnitContext`]. The
//! notifier can be cloned and moved into background tasks; whatever it sends is routed
//! through the unit's loop, so it stays ordered with the unit's own responses.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt::{self, Display};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::ResourceError;
use crate::message::{Method, Notification};

/// Identifies one API resource by its full path. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceDescriptor(Arc<str>);

impl ResourceDescriptor {
    pub fn new(full_path: impl AsRef<str>) -> Self {
        Self(Arc::from(full_path.as_ref()))
    }

    pub fn full_path(&self) -> &str {
        &self.0
    }
}

impl Display for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceDescriptor {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for ResourceDescriptor {
    fn from(path: String) -> Self {
        Self::new(path)
    }
}

/// Sends notifications into the owning unit's message loop.
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: mpsc::UnboundedSender<Notification>,
}

impl Notifier {
    pub(crate) fn new(sender: mpsc::UnboundedSender<Notification>) -> Self {
        Self { sender }
    }

    /// Emits `event` on the `resource` topic. Returns `false` once the unit has stopped.
    pub fn notify(&self, resource: impl Into<String>, event: impl Into<String>, data: Value) -> bool {
        self.sender
            .send(Notification::new(resource, event, data))
            .is_ok()
    }
}

/// Per-unit context handed to every resource hook.
#[derive(Debug, Clone)]
pub struct UnitContext {
    descriptor: ResourceDescriptor,
    notifier: Notifier,
}

impl UnitContext {
    pub(crate) fn new(descriptor: ResourceDescriptor, notifier: Notifier) -> Self {
        Self {
            descriptor,
            notifier,
        }
    }

    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }
}

/// A REST resource hosted by a worker unit.
///
/// # Example
///
/// ```rust
/// use api_workers::{ApiResource, Method, ResourceDescriptor, ResourceError, UnitContext};
/// use async_trait::async_trait;
/// use serde_json::{json, Map, Value};
///
/// struct Counter {
///     hits: u64,
/// }
///
/// #[async_trait]
/// impl ApiResource for Counter {
///     fn descriptor(&self) -> ResourceDescriptor {
///         ResourceDescriptor::new("/counter")
///     }
///
///     async fn handle(
///         &mut self,
///         method: Method,
///         _options: Map<String, Value>,
///         _ctx: &UnitContext,
///     ) -> Result<Value, ResourceError> {
///         match method {
///             Method::Post => {
///                 self.hits += 1;
///                 Ok(json!({ "hits": self.hits }))
///             }
///             other => Err(ResourceError::Validation(format!("{other} not supported"))),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait ApiResource: Send + 'static {
    /// The full path this resource is registered under.
    fn descriptor(&self) -> ResourceDescriptor;

    /// Runs when the unit receives `START`, before readiness is reported.
    ///
    /// A failure is logged and the unit still becomes ready; requests are then served
    /// without whatever the hook would have set up.
    async fn on_start(&mut self, _ctx: &UnitContext) -> Result<(), ResourceError> {
        Ok(())
    }

    /// Performs one request.
    async fn handle(
        &mut self,
        method: Method,
        options: Map<String, Value>,
        ctx: &UnitContext,
    ) -> Result<Value, ResourceError>;
}
