//! # Worker Units
//!
//! A worker unit is the isolated execution context bound to exactly one resource. It owns
//! the resource, reads [`Message`]s from its inbox one at a time, and writes responses,
//! notifications and its readiness into an outbox shared with the dispatcher.
//!
//! ## Lifecycle
//!
//! 1. The dispatcher launches the unit and sends `START`.
//! 2. The unit runs [`ApiResource::on_start`] and answers `READY_STATE_CHANGE{READY}`.
//! 3. Each `REST_REQUEST` produces exactly one `REST_RESPONSE` with the same request id:
//!    status `0` and the body on success, the error's status and JSON body otherwise.
//! 4. When the stop token is cancelled or the inbox closes (dispatcher shutdown), the loop
//!    ends and the launcher reports the exit on the outbox. A request still being handled
//!    at that point is abandoned, and queued requests are not handled.
//!
//! ## Variants
//!
//! The dispatcher only sees an inbox sender and an outbox, so the backing execution
//! variant is interchangeable:
//!
//! - [`UnitKind::Task`]: a tokio task on the current runtime.
//! - [`UnitKind::Thread`]: a named OS thread with its own current-thread runtime.
//! - Anything else implementing [`UnitLauncher`] (see [`crate::mock::ManualUnit`]).

use std::panic::AssertUnwindSafe;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{DispatcherConfig, UnitKind};
use crate::error::{DispatchError, ResourceError};
use crate::message::{Message, Notification, ReadyState, RestRequest};
use crate::resource::{ApiResource, Notifier, ResourceDescriptor, UnitContext};

/// How a unit's execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitExit {
    /// The message loop returned after it was told to stop or its inbox closed.
    Clean,
    /// The unit panicked or could not keep running.
    Abnormal(String),
}

/// Transport-level events a unit reports to the dispatcher.
#[derive(Debug)]
pub(crate) enum UnitEvent {
    Message(Message),
    Exited(UnitExit),
}

/// The unit's sending half towards the dispatcher.
#[derive(Debug, Clone)]
pub struct UnitOutbox {
    resource: ResourceDescriptor,
    sender: mpsc::UnboundedSender<(ResourceDescriptor, UnitEvent)>,
}

impl UnitOutbox {
    pub(crate) fn new(
        resource: ResourceDescriptor,
        sender: mpsc::UnboundedSender<(ResourceDescriptor, UnitEvent)>,
    ) -> Self {
        Self { resource, sender }
    }

    pub fn resource(&self) -> &ResourceDescriptor {
        &self.resource
    }

    /// Posts a message to the dispatcher. Returns `false` once the dispatcher is gone.
    pub fn send(&self, message: Message) -> bool {
        self.sender
            .send((self.resource.clone(), UnitEvent::Message(message)))
            .is_ok()
    }

    /// Reports that the unit stopped running.
    pub fn exited(&self, exit: UnitExit) {
        let _ = self
            .sender
            .send((self.resource.clone(), UnitEvent::Exited(exit)));
    }
}

/// Starts a worker unit for one resource.
///
/// Implementations must consume `inbox` on some execution context, post every outbound
/// message through `outbox`, and call [`UnitOutbox::exited`] when that context ends.
/// Once `stop` is cancelled the unit should exit as soon as it can.
pub trait UnitLauncher: Send {
    fn descriptor(&self) -> ResourceDescriptor;

    fn launch(
        self: Box<Self>,
        inbox: mpsc::UnboundedReceiver<Message>,
        outbox: UnitOutbox,
        stop: CancellationToken,
        config: &DispatcherConfig,
    ) -> Result<(), DispatchError>;
}

/// Launches a [`WorkerUnit`] around an [`ApiResource`].
pub struct ResourceUnit {
    resource: Box<dyn ApiResource>,
    kind: Option<UnitKind>,
}

impl ResourceUnit {
    pub fn new(resource: impl ApiResource, kind: Option<UnitKind>) -> Self {
        Self {
            resource: Box::new(resource),
            kind,
        }
    }
}

impl UnitLauncher for ResourceUnit {
    fn descriptor(&self) -> ResourceDescriptor {
        self.resource.descriptor()
    }

    fn launch(
        self: Box<Self>,
        inbox: mpsc::UnboundedReceiver<Message>,
        outbox: UnitOutbox,
        stop: CancellationToken,
        config: &DispatcherConfig,
    ) -> Result<(), DispatchError> {
        let kind = self.kind.unwrap_or(config.default_unit_kind);
        let descriptor = self.resource.descriptor();
        let unit = WorkerUnit::new(self.resource, inbox, outbox.clone(), stop);

        match kind {
            UnitKind::Task => {
                let runtime = tokio::runtime::Handle::try_current()
                    .map_err(|e| DispatchError::UnitSpawn(e.to_string()))?;
                let handle = runtime.spawn(unit.run());
                runtime.spawn(async move {
                    let exit = match handle.await {
                        Ok(()) => UnitExit::Clean,
                        Err(e) => UnitExit::Abnormal(e.to_string()),
                    };
                    outbox.exited(exit);
                });
            }
            UnitKind::Thread => {
                let name = format!("{}:{}", config.thread_name_prefix, descriptor);
                std::thread::Builder::new()
                    .name(name)
                    .spawn(move || {
                        let exit = match tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                        {
                            Ok(runtime) => {
                                match std::panic::catch_unwind(AssertUnwindSafe(|| {
                                    runtime.block_on(unit.run())
                                })) {
                                    Ok(()) => UnitExit::Clean,
                                    Err(_) => UnitExit::Abnormal("worker thread panicked".into()),
                                }
                            }
                            Err(e) => UnitExit::Abnormal(e.to_string()),
                        };
                        outbox.exited(exit);
                    })
                    .map_err(|e| DispatchError::UnitSpawn(e.to_string()))?;
            }
        }
        debug!(resource = %descriptor, ?kind, "Worker unit launched");
        Ok(())
    }
}

/// The message loop of one worker unit.
pub struct WorkerUnit {
    resource: Box<dyn ApiResource>,
    inbox: mpsc::UnboundedReceiver<Message>,
    outbox: UnitOutbox,
    notifications: mpsc::UnboundedReceiver<Notification>,
    ctx: UnitContext,
    stop: CancellationToken,
    started: bool,
}

impl WorkerUnit {
    pub fn new(
        resource: Box<dyn ApiResource>,
        inbox: mpsc::UnboundedReceiver<Message>,
        outbox: UnitOutbox,
        stop: CancellationToken,
    ) -> Self {
        let (notify_tx, notifications) = mpsc::unbounded_channel();
        let ctx = UnitContext::new(resource.descriptor(), Notifier::new(notify_tx));
        Self {
            resource,
            inbox,
            outbox,
            notifications,
            ctx,
            stop,
            started: false,
        }
    }

    /// Processes messages until told to stop, the inbox closes or the dispatcher disappears.
    pub async fn run(mut self) {
        let resource = self.ctx.descriptor().clone();
        let stop = self.stop.clone();
        info!(%resource, "Worker unit started");

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    debug!(%resource, "Stop requested");
                    break;
                }
                inbound = self.inbox.recv() => {
                    let Some(msg) = inbound else { break };
                    let keep_running = tokio::select! {
                        biased;
                        _ = stop.cancelled() => {
                            warn!(%resource, "Stop requested while handling a message, abandoning it");
                            false
                        }
                        keep_running = self.process(msg) => keep_running,
                    };
                    if !keep_running {
                        break;
                    }
                }
                Some(notification) = self.notifications.recv() => {
                    if !self.forward(notification) {
                        break;
                    }
                }
            }
        }

        info!(%resource, "Worker unit stopped");
    }

    async fn process(&mut self, msg: Message) -> bool {
        match msg {
            Message::Start => {
                if self.started {
                    debug!(resource = %self.ctx.descriptor(), "Duplicate START ignored");
                    return true;
                }
                if let Err(e) = self.resource.on_start(&self.ctx).await {
                    warn!(resource = %self.ctx.descriptor(), error = %e, "on_start failed");
                }
                self.started = true;
                self.flush_notifications()
                    && self
                        .outbox
                        .send(Message::ready_state_change(ReadyState::Ready))
            }
            Message::RestRequest { request } => {
                let RestRequest {
                    request_id,
                    method,
                    options,
                    ..
                } = request;
                debug!(resource = %self.ctx.descriptor(), %request_id, %method, "Request");

                let result = if self.started {
                    self.resource.handle(method, options, &self.ctx).await
                } else {
                    Err(ResourceError::Unavailable(
                        "worker unit has not been started".into(),
                    ))
                };
                let reply = match result {
                    Ok(body) => Message::rest_response(request_id, 0, body),
                    Err(e) => {
                        warn!(resource = %self.ctx.descriptor(), %request_id, error = %e, "Request failed");
                        Message::rest_response(request_id, e.status(), e.body())
                    }
                };
                // Notifications raised while handling go out before the response.
                self.flush_notifications() && self.outbox.send(reply)
            }
            other => {
                error!(
                    resource = %self.ctx.descriptor(),
                    kind = %other.kind(),
                    "Invalid message received by worker unit"
                );
                true
            }
        }
    }

    fn forward(&self, notification: Notification) -> bool {
        debug!(
            resource = %self.ctx.descriptor(),
            topic = %notification.resource,
            event = %notification.event,
            "Notification"
        );
        self.outbox.send(Message::notification(notification))
    }

    fn flush_notifications(&mut self) -> bool {
        while let Ok(notification) = self.notifications.try_recv() {
            if !self.forward(notification) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResourceError;
    use crate::message::{Method, RestResponse};
    use async_trait::async_trait;
    use serde_json::{json, Map, Value};

    struct Echo;

    #[async_trait]
    impl ApiResource for Echo {
        fn descriptor(&self) -> ResourceDescriptor {
            ResourceDescriptor::new("/echo")
        }

        async fn handle(
            &mut self,
            method: Method,
            options: Map<String, Value>,
            ctx: &UnitContext,
        ) -> Result<Value, ResourceError> {
            match method {
                Method::Get => Ok(Value::Object(options)),
                Method::Post => {
                    ctx.notifier().notify("/echo", "echoed", json!({"n": 1}));
                    Ok(json!({"posted": true}))
                }
                _ => Err(ResourceError::Validation("unsupported".into())),
            }
        }
    }

    fn spawn_echo() -> (
        mpsc::UnboundedSender<Message>,
        mpsc::UnboundedReceiver<(ResourceDescriptor, UnitEvent)>,
    ) {
        spawn_with_token(CancellationToken::new())
    }

    fn spawn_with_token(
        stop: CancellationToken,
    ) -> (
        mpsc::UnboundedSender<Message>,
        mpsc::UnboundedReceiver<(ResourceDescriptor, UnitEvent)>,
    ) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let outbox = UnitOutbox::new(ResourceDescriptor::new("/echo"), events_tx);
        let launcher = Box::new(ResourceUnit::new(Echo, Some(UnitKind::Task)));
        launcher
            .launch(inbox_rx, outbox, stop, &DispatcherConfig::default())
            .unwrap();
        (inbox_tx, events_rx)
    }

    async fn next_message(
        events: &mut mpsc::UnboundedReceiver<(ResourceDescriptor, UnitEvent)>,
    ) -> Message {
        match events.recv().await {
            Some((_, UnitEvent::Message(msg))) => msg,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    fn request(method: Method, options: Value) -> (Message, crate::message::RequestId) {
        let Value::Object(options) = options else {
            panic!("options must be an object")
        };
        let msg = Message::rest_request(&ResourceDescriptor::new("/echo"), method, options);
        let id = match &msg {
            Message::RestRequest { request } => request.request_id,
            _ => unreachable!(),
        };
        (msg, id)
    }

    #[tokio::test]
    async fn start_yields_ready_once() {
        let (inbox, mut events) = spawn_echo();
        inbox.send(Message::start()).unwrap();
        inbox.send(Message::start()).unwrap();
        let (msg, id) = request(Method::Get, json!({}));
        inbox.send(msg).unwrap();

        assert_eq!(
            next_message(&mut events).await,
            Message::ready_state_change(ReadyState::Ready)
        );
        // The second START produced nothing; the next message is the response.
        match next_message(&mut events).await {
            Message::RestResponse { response } => assert_eq!(response.request_id, id),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn failures_become_nonzero_status() {
        let (inbox, mut events) = spawn_echo();
        inbox.send(Message::start()).unwrap();
        let (msg, id) = request(Method::Delete, json!({"id": "x"}));
        inbox.send(msg).unwrap();

        next_message(&mut events).await;
        let Message::RestResponse { response } = next_message(&mut events).await else {
            panic!("expected response");
        };
        let RestResponse {
            request_id,
            status,
            body,
        } = response;
        assert_eq!(request_id, id);
        assert_eq!(status, 400);
        assert_eq!(body["error"], "validation");

        // The unit keeps serving after a failed request.
        let (msg, id) = request(Method::Get, json!({"id": "y"}));
        inbox.send(msg).unwrap();
        let Message::RestResponse { response } = next_message(&mut events).await else {
            panic!("expected response");
        };
        assert_eq!(response.request_id, id);
        assert!(response.is_success());
        assert_eq!(response.body["id"], "y");
    }

    #[tokio::test]
    async fn requests_before_start_are_rejected() {
        let (inbox, mut events) = spawn_echo();
        let (msg, id) = request(Method::Get, json!({}));
        inbox.send(msg).unwrap();
        let Message::RestResponse { response } = next_message(&mut events).await else {
            panic!("expected response");
        };
        assert_eq!(response.request_id, id);
        assert_eq!(response.status, 503);
    }

    #[tokio::test]
    async fn notifications_precede_the_response_that_raised_them() {
        let (inbox, mut events) = spawn_echo();
        inbox.send(Message::start()).unwrap();
        let (msg, id) = request(Method::Post, json!({}));
        inbox.send(msg).unwrap();

        next_message(&mut events).await;
        match next_message(&mut events).await {
            Message::Notification { notification } => {
                assert_eq!(notification.resource, "/echo");
                assert_eq!(notification.event, "echoed");
            }
            other => panic!("expected notification, got {other:?}"),
        }
        match next_message(&mut events).await {
            Message::RestResponse { response } => assert_eq!(response.request_id, id),
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn thread_variant_reports_clean_exit() {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let outbox = UnitOutbox::new(ResourceDescriptor::new("/echo"), events_tx);
        let launcher = Box::new(ResourceUnit::new(Echo, Some(UnitKind::Thread)));
        launcher
            .launch(
                inbox_rx,
                outbox,
                CancellationToken::new(),
                &DispatcherConfig::default(),
            )
            .unwrap();

        inbox_tx.send(Message::start()).unwrap();
        assert_eq!(
            next_message(&mut events).await,
            Message::ready_state_change(ReadyState::Ready)
        );

        drop(inbox_tx);
        match events.recv().await {
            Some((resource, UnitEvent::Exited(exit))) => {
                assert_eq!(resource.full_path(), "/echo");
                assert_eq!(exit, UnitExit::Clean);
            }
            other => panic!("expected exit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_unit_skips_queued_requests() {
        let stop = CancellationToken::new();
        let (inbox, mut events) = spawn_with_token(stop.clone());
        inbox.send(Message::start()).unwrap();
        assert_eq!(
            next_message(&mut events).await,
            Message::ready_state_change(ReadyState::Ready)
        );

        stop.cancel();
        let (msg, _) = request(Method::Get, json!({}));
        inbox.send(msg).unwrap();

        // The inbox is still open, yet the unit exits without answering.
        match events.recv().await {
            Some((_, UnitEvent::Exited(exit))) => assert_eq!(exit, UnitExit::Clean),
            other => panic!("expected exit, got {other:?}"),
        }
        drop(inbox);
    }
}
