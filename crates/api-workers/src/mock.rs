//! # Test Doubles
//!
//! Three helpers for testing code built on the dispatcher without real resources.
//!
//! | Helper           | Stands in for          | Use it to                                           |
//! |------------------|------------------------|-----------------------------------------------------|
//! | [`ManualUnit`]   | a worker unit          | drive the dispatcher message by message             |
//! | [`MockResource`] | an [`ApiResource`]     | script responses and check which calls were made    |
//! | [`RecordingSink`]| the notification bus   | await republished notifications                     |
//!
//! ## Driving the dispatcher by hand
//!
//! A [`ManualUnit`] is registered like any other unit, but nothing runs behind it. The
//! test holds the [`ManualUnitHandle`] and plays the unit's part: it receives `START` and
//! `REST_REQUEST`, and decides when readiness, responses, notifications and exits happen.
//! Responses can be sent in any order, with any request id, including ones the dispatcher
//! never issued.
//!
//! ```rust
//! use api_workers::mock::{ManualUnit, RecordingSink};
//! use api_workers::{Dispatcher, DispatcherConfig, ResourceRegistry};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (unit, mut importers) = ManualUnit::new("/importers");
//!     let (sink, mut published) = RecordingSink::new();
//!     let dispatcher = Dispatcher::start(
//!         ResourceRegistry::new().register_launcher(unit),
//!         Arc::new(sink),
//!         &DispatcherConfig::default(),
//!     )
//!     .unwrap();
//!
//!     importers.recv_start().await;
//!     importers.notify("/importers", "import.started", json!({"id": 1}));
//!
//!     let n = published.recv().await.unwrap();
//!     assert_eq!(n.resource, "/importers");
//!     assert_eq!(n.event, "import.started");
//!
//!     drop(importers);
//!     dispatcher.shutdown().await.unwrap();
//! }
//! ```
//!
//! ## Scripting a resource
//!
//! ```rust
//! use api_workers::mock::MockResource;
//! use api_workers::{Dispatcher, DispatcherConfig, Method, RequestOptions, ResourceError, ResourceRegistry};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut tags = MockResource::new("/tags");
//!     tags.expect(Method::Get).return_ok(json!(["sunset"]));
//!     tags.expect(Method::Delete).return_err(ResourceError::NotFound("tag 9".into()));
//!
//!     let dispatcher = Dispatcher::start(
//!         ResourceRegistry::new().register(tags.resource()),
//!         Arc::new(|_: &str, _: &str, _: serde_json::Value| {}),
//!         &DispatcherConfig::default(),
//!     )
//!     .unwrap();
//!     let client = dispatcher.client();
//!     client.wait_ready().await.unwrap();
//!
//!     let tags_path = "/tags".into();
//!     let body = client.request(&tags_path, Method::Get, RequestOptions::new()).await.unwrap();
//!     assert_eq!(body, json!(["sunset"]));
//!     let err = client
//!         .request(&tags_path, Method::Delete, RequestOptions::new().id(9))
//!         .await
//!         .unwrap_err();
//!     assert_eq!(err.status(), Some(404));
//!
//!     tags.verify();
//!     dispatcher.shutdown().await.unwrap();
//! }
//! ```

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::DispatcherConfig;
use crate::error::{DispatchError, ResourceError};
use crate::message::{Message, Method, Notification, ReadyState, RequestId, RestRequest};
use crate::resource::{ApiResource, ResourceDescriptor, UnitContext};
use crate::sink::NotificationSink;
use crate::unit::{UnitExit, UnitLauncher, UnitOutbox};

// =============================================================================
// MANUAL UNIT
// =============================================================================

type Wiring = (mpsc::UnboundedReceiver<Message>, UnitOutbox, CancellationToken);

/// A unit launcher that hands both ends of the unit's channel to a test.
pub struct ManualUnit {
    descriptor: ResourceDescriptor,
    wiring: oneshot::Sender<Wiring>,
}

impl ManualUnit {
    pub fn new(path: impl AsRef<str>) -> (Self, ManualUnitHandle) {
        let descriptor = ResourceDescriptor::new(path);
        let (wiring_tx, wiring_rx) = oneshot::channel();
        let unit = Self {
            descriptor: descriptor.clone(),
            wiring: wiring_tx,
        };
        let handle = ManualUnitHandle {
            descriptor,
            wiring: Some(wiring_rx),
            inbox: None,
            outbox: None,
            stop: None,
            exited: false,
        };
        (unit, handle)
    }
}

impl UnitLauncher for ManualUnit {
    fn descriptor(&self) -> ResourceDescriptor {
        self.descriptor.clone()
    }

    fn launch(
        self: Box<Self>,
        inbox: mpsc::UnboundedReceiver<Message>,
        outbox: UnitOutbox,
        stop: CancellationToken,
        _config: &DispatcherConfig,
    ) -> Result<(), DispatchError> {
        if let Err((_, outbox, _)) = self.wiring.send((inbox, outbox, stop)) {
            // Nobody is left to play the unit.
            outbox.exited(UnitExit::Clean);
        }
        Ok(())
    }
}

/// The test's side of a [`ManualUnit`].
///
/// Dropping the handle reports a clean exit to the dispatcher, unless [`exit`] already
/// reported one. Nothing happens on its own when the dispatcher asks the unit to stop;
/// the test decides, and can check [`stop_requested`].
///
/// [`exit`]: ManualUnitHandle::exit
/// [`stop_requested`]: ManualUnitHandle::stop_requested
pub struct ManualUnitHandle {
    descriptor: ResourceDescriptor,
    wiring: Option<oneshot::Receiver<Wiring>>,
    inbox: Option<mpsc::UnboundedReceiver<Message>>,
    outbox: Option<UnitOutbox>,
    stop: Option<CancellationToken>,
    exited: bool,
}

impl ManualUnitHandle {
    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    /// Next message sent by the dispatcher, or `None` once it closed the inbox.
    pub async fn recv(&mut self) -> Option<Message> {
        self.connect();
        self.inbox.as_mut()?.recv().await
    }

    /// Waits for `START`. Panics on anything else.
    pub async fn recv_start(&mut self) {
        match self.recv().await {
            Some(Message::Start) => {}
            other => panic!("{}: expected START, got {other:?}", self.descriptor),
        }
    }

    /// Waits for the next `REST_REQUEST`. Panics on anything else.
    pub async fn recv_request(&mut self) -> RestRequest {
        match self.recv().await {
            Some(Message::RestRequest { request }) => request,
            other => panic!("{}: expected REST_REQUEST, got {other:?}", self.descriptor),
        }
    }

    /// Non-blocking check for a queued message.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.connect();
        self.inbox.as_mut()?.try_recv().ok()
    }

    /// Sends any message to the dispatcher as if the unit had produced it.
    pub fn send(&mut self, message: Message) -> bool {
        self.connect();
        match &self.outbox {
            Some(outbox) => outbox.send(message),
            None => false,
        }
    }

    pub fn ready(&mut self) -> bool {
        self.send(Message::ready_state_change(ReadyState::Ready))
    }

    pub fn respond(&mut self, request_id: RequestId, status: i32, body: Value) -> bool {
        self.send(Message::rest_response(request_id, status, body))
    }

    pub fn notify(&mut self, resource: &str, event: &str, data: Value) -> bool {
        self.send(Message::notification(Notification::new(resource, event, data)))
    }

    /// Whether the dispatcher has told this unit to stop.
    pub fn stop_requested(&mut self) -> bool {
        self.connect();
        self.stop.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Reports the unit's exit and releases the handle.
    pub fn exit(mut self, exit: UnitExit) {
        self.connect();
        if let Some(outbox) = &self.outbox {
            outbox.exited(exit);
        }
        self.exited = true;
    }

    fn connect(&mut self) {
        let Some(mut wiring) = self.wiring.take() else {
            return;
        };
        match wiring.try_recv() {
            Ok((inbox, outbox, stop)) => {
                self.inbox = Some(inbox);
                self.outbox = Some(outbox);
                self.stop = Some(stop);
            }
            Err(_) => panic!("{}: unit has not been launched", self.descriptor),
        }
    }
}

impl Drop for ManualUnitHandle {
    fn drop(&mut self) {
        if let Some(mut wiring) = self.wiring.take() {
            if let Ok((_, outbox, _)) = wiring.try_recv() {
                self.outbox = Some(outbox);
            }
        }
        if !self.exited {
            if let Some(outbox) = &self.outbox {
                outbox.exited(UnitExit::Clean);
            }
        }
    }
}

// =============================================================================
// MOCK RESOURCE
// =============================================================================

struct Expectation {
    method: Method,
    response: Result<Value, ResourceError>,
}

#[derive(Default)]
struct Script {
    expectations: VecDeque<Expectation>,
    calls: Vec<(Method, Map<String, Value>)>,
    unexpected: Vec<String>,
}

/// An [`ApiResource`] that answers from a queue of scripted responses.
///
/// Each request consumes the next expectation. A request with no expectation left, or with
/// a different method, is answered with `ResourceError::Internal` and recorded;
/// [`verify`](MockResource::verify) then fails.
pub struct MockResource {
    descriptor: ResourceDescriptor,
    script: Arc<Mutex<Script>>,
}

impl MockResource {
    pub fn new(path: impl AsRef<str>) -> Self {
        Self {
            descriptor: ResourceDescriptor::new(path),
            script: Arc::new(Mutex::new(Script::default())),
        }
    }

    /// The resource to register with the dispatcher. Shares this mock's script.
    pub fn resource(&self) -> MockApiResource {
        MockApiResource {
            descriptor: self.descriptor.clone(),
            script: self.script.clone(),
        }
    }

    pub fn expect(&mut self, method: Method) -> ExpectationBuilder {
        ExpectationBuilder {
            method,
            script: self.script.clone(),
        }
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<(Method, Map<String, Value>)> {
        self.script.lock().unwrap().calls.clone()
    }

    /// Panics if an expectation is left over or an unexpected call was made.
    pub fn verify(&self) {
        let script = self.script.lock().unwrap();
        if !script.unexpected.is_empty() {
            panic!("Unexpected calls to {}: {:?}", self.descriptor, script.unexpected);
        }
        if !script.expectations.is_empty() {
            panic!(
                "Not all expectations were met. {} remaining",
                script.expectations.len()
            );
        }
    }
}

/// Builder for one scripted response.
pub struct ExpectationBuilder {
    method: Method,
    script: Arc<Mutex<Script>>,
}

impl ExpectationBuilder {
    pub fn return_ok(self, body: Value) {
        self.push(Ok(body));
    }

    pub fn return_err(self, error: ResourceError) {
        self.push(Err(error));
    }

    fn push(self, response: Result<Value, ResourceError>) {
        self.script.lock().unwrap().expectations.push_back(Expectation {
            method: self.method,
            response,
        });
    }
}

/// The [`ApiResource`] half of a [`MockResource`].
pub struct MockApiResource {
    descriptor: ResourceDescriptor,
    script: Arc<Mutex<Script>>,
}

#[async_trait]
impl ApiResource for MockApiResource {
    fn descriptor(&self) -> ResourceDescriptor {
        self.descriptor.clone()
    }

    async fn handle(
        &mut self,
        method: Method,
        options: Map<String, Value>,
        _ctx: &UnitContext,
    ) -> Result<Value, ResourceError> {
        let mut script = self.script.lock().unwrap();
        script.calls.push((method, options));
        match script.expectations.pop_front() {
            Some(expectation) if expectation.method == method => expectation.response,
            Some(expectation) => {
                let problem = format!("expected {}, got {method}", expectation.method);
                script.unexpected.push(problem.clone());
                Err(ResourceError::Internal(problem))
            }
            None => {
                let problem = format!("no expectation left for {method}");
                script.unexpected.push(problem.clone());
                Err(ResourceError::Internal(problem))
            }
        }
    }
}

// =============================================================================
// RECORDING SINK
// =============================================================================

/// A [`NotificationSink`] that forwards every publication to a channel.
pub struct RecordingSink {
    sender: mpsc::UnboundedSender<Notification>,
}

impl RecordingSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl NotificationSink for RecordingSink {
    fn publish(&self, resource: &str, event: &str, data: Value) {
        let _ = self.sender.send(Notification::new(resource, event, data));
    }
}
