//! # Dispatcher
//!
//! The worker pool. One [`Dispatcher`] owns every worker unit, the table of pending
//! requests and the readiness barrier.
//!
//! ## Architecture
//!
//! Like any actor, the dispatcher is split in two halves:
//!
//! - `DispatcherCore` (private) is the server. It runs as a single tokio task and is the
//!   only code that ever touches the worker records and the pending table, so neither
//!   needs a lock.
//! - [`DispatcherClient`] is the cheap, cloneable handle. `do_request` and `ready` only
//!   enqueue a command and return; they never wait on a unit.
//!
//! The core multiplexes two inputs: commands from clients, and events from units (messages
//! plus transport-level exits). Events from one unit are handled in the order the unit sent
//! them; nothing is guaranteed across units. Events go first, but after a long run of them
//! one queued command is let through, so a chatty unit cannot starve clients.
//!
//! Caller callbacks (`on_success`, `on_error`, `ready`) run on the core task. A callback
//! that panics is logged and does not take the dispatcher down.
//!
//! ## Correlation
//!
//! Every request gets a fresh [`RequestId`]. The callbacks stay in the pending table under
//! that id, and only the JSON fields travel to the unit. When a `REST_RESPONSE` comes back
//! the entry is removed and exactly one of `on_success` / `on_error` runs, chosen by the
//! status. Responses are matched by id alone, so they may arrive in any order.
//!
//! ## Readiness
//!
//! Each unit reports `READY` once. The transition that makes the whole set ready flips a
//! shared flag and fires every queued `ready` callback once. After that, `ready` runs its
//! callback immediately on the caller's own stack.
//!
//! ```rust
//! use api_workers::mock::{ManualUnit, RecordingSink};
//! use api_workers::{Dispatcher, DispatcherConfig, Method, RequestOptions, ResourceRegistry};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (unit, mut images) = ManualUnit::new("/images");
//!     let (sink, _notifications) = RecordingSink::new();
//!     let registry = ResourceRegistry::new().register_launcher(unit);
//!     let dispatcher =
//!         Dispatcher::start(registry, Arc::new(sink), &DispatcherConfig::default()).unwrap();
//!     let client = dispatcher.client();
//!
//!     images.recv_start().await;
//!     images.ready();
//!     client.wait_ready().await.unwrap();
//!
//!     let (tx, rx) = tokio::sync::oneshot::channel();
//!     let options = RequestOptions::new().on_success(move |body| {
//!         let _ = tx.send(body);
//!     });
//!     client.do_request(&"/images".into(), Method::Get, options).unwrap();
//!
//!     let request = images.recv_request().await;
//!     images.respond(request.request_id, 0, json!({"count": 3}));
//!     assert_eq!(rx.await.unwrap(), json!({"count": 3}));
//!
//!     drop(images);
//!     dispatcher.shutdown().await.unwrap();
//! }
//! ```

use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{DispatcherConfig, UnitKind};
use crate::error::DispatchError;
use crate::message::{Message, Method, ReadyState, RequestId, RestRequest, RestResponse};
use crate::options::{run_guarded, Completion, RequestOptions};
use crate::resource::{ApiResource, ResourceDescriptor};
use crate::sink::NotificationSink;
use crate::unit::{ResourceUnit, UnitEvent, UnitExit, UnitLauncher, UnitOutbox};

pub type ReadyCallback = Box<dyn FnOnce() + Send + 'static>;

/// Unit events handled in a row before one queued command is let through.
const EVENT_BURST: usize = 64;

/// The set of resources a dispatcher will host, one worker unit each.
#[derive(Default)]
pub struct ResourceRegistry {
    launchers: Vec<Box<dyn UnitLauncher>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hosts `resource` on the configured default unit kind.
    pub fn register(self, resource: impl ApiResource) -> Self {
        self.register_launcher(ResourceUnit::new(resource, None))
    }

    /// Hosts `resource` on a specific unit kind.
    pub fn register_with_kind(self, resource: impl ApiResource, kind: UnitKind) -> Self {
        self.register_launcher(ResourceUnit::new(resource, Some(kind)))
    }

    /// Hosts a unit started by a custom launcher.
    pub fn register_launcher(mut self, launcher: impl UnitLauncher + 'static) -> Self {
        self.launchers.push(Box::new(launcher));
        self
    }

    pub fn len(&self) -> usize {
        self.launchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.launchers.is_empty()
    }
}

/// Snapshot of the dispatcher's internal state.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherStats {
    pub pending: Vec<RequestId>,
    pub workers: BTreeMap<ResourceDescriptor, ReadyState>,
    pub all_ready: bool,
}

impl DispatcherStats {
    pub fn is_pending(&self, request_id: RequestId) -> bool {
        self.pending.contains(&request_id)
    }

    pub fn ready_state(&self, resource: &ResourceDescriptor) -> Option<ReadyState> {
        self.workers.get(resource).copied()
    }
}

enum Command {
    Request {
        resource: ResourceDescriptor,
        request: RestRequest,
        completion: Completion,
    },
    WhenReady(ReadyCallback),
    Stats(oneshot::Sender<DispatcherStats>),
    Shutdown,
}

/// Handle used to issue requests to the worker pool.
#[derive(Clone)]
pub struct DispatcherClient {
    commands: mpsc::UnboundedSender<Command>,
    resources: Arc<HashSet<ResourceDescriptor>>,
    all_ready: Arc<AtomicBool>,
}

impl DispatcherClient {
    /// Sends one request to the unit hosting `resource`.
    ///
    /// Returns as soon as the request is queued. The outcome is delivered later through
    /// the `on_success` or `on_error` callback of `options`.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::UnknownResource`] if no unit hosts `resource`.
    /// - [`DispatchError::InvalidOptions`] if the options payload is not a JSON object.
    /// - [`DispatchError::DispatcherClosed`] once the dispatcher has stopped.
    ///
    /// In every error case nothing is sent to any unit.
    pub fn do_request(
        &self,
        resource: &ResourceDescriptor,
        method: Method,
        options: RequestOptions,
    ) -> Result<RequestId, DispatchError> {
        self.ensure_known(resource)?;
        let (fields, completion) = options.normalize()?;
        self.post(resource, method, fields, completion)
    }

    /// Sends one request and waits for its response body.
    ///
    /// Callbacks set on `options` are ignored; a nonzero status comes back as
    /// [`DispatchError::RequestFailed`] carrying the error body.
    pub async fn request(
        &self,
        resource: &ResourceDescriptor,
        method: Method,
        options: RequestOptions,
    ) -> Result<Value, DispatchError> {
        self.ensure_known(resource)?;
        let (fields, _) = options.normalize()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.post(resource, method, fields, Completion::Reply(reply_tx))?;
        match reply_rx.await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(body)) => Err(DispatchError::RequestFailed { body }),
            Err(_) => Err(DispatchError::DispatcherDropped),
        }
    }

    /// Runs `callback` once every unit is ready.
    ///
    /// If that is already the case the callback runs before this method returns.
    pub fn ready(&self, callback: impl FnOnce() + Send + 'static) -> Result<(), DispatchError> {
        if self.is_ready() {
            callback();
            return Ok(());
        }
        self.commands
            .send(Command::WhenReady(Box::new(callback)))
            .map_err(|_| DispatchError::DispatcherClosed)
    }

    pub async fn wait_ready(&self) -> Result<(), DispatchError> {
        let (tx, rx) = oneshot::channel();
        self.ready(move || {
            let _ = tx.send(());
        })?;
        rx.await.map_err(|_| DispatchError::DispatcherDropped)
    }

    pub fn is_ready(&self) -> bool {
        self.all_ready.load(Ordering::Acquire)
    }

    pub fn is_registered(&self, resource: &ResourceDescriptor) -> bool {
        self.resources.contains(resource)
    }

    pub fn resources(&self) -> impl Iterator<Item = &ResourceDescriptor> {
        self.resources.iter()
    }

    pub async fn stats(&self) -> Result<DispatcherStats, DispatchError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Stats(tx))
            .map_err(|_| DispatchError::DispatcherClosed)?;
        rx.await.map_err(|_| DispatchError::DispatcherDropped)
    }

    /// Asks every unit to stop. Pending requests are left unanswered, and a request a unit
    /// is still handling is abandoned.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    fn ensure_known(&self, resource: &ResourceDescriptor) -> Result<(), DispatchError> {
        if self.resources.contains(resource) {
            Ok(())
        } else {
            warn!(%resource, "Request for unregistered resource");
            Err(DispatchError::UnknownResource(resource.to_string()))
        }
    }

    fn post(
        &self,
        resource: &ResourceDescriptor,
        method: Method,
        fields: Map<String, Value>,
        completion: Completion,
    ) -> Result<RequestId, DispatchError> {
        let request = RestRequest::new(resource, method, fields);
        let request_id = request.request_id;
        self.commands
            .send(Command::Request {
                resource: resource.clone(),
                request,
                completion,
            })
            .map_err(|_| DispatchError::DispatcherClosed)?;
        Ok(request_id)
    }
}

/// Owner of a running worker pool.
pub struct Dispatcher {
    client: DispatcherClient,
    task: JoinHandle<()>,
}

impl Dispatcher {
    /// Launches one unit per registered resource, sends each a `START`, and spawns the
    /// dispatcher task on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::DuplicateResource`] if two resources share a full path. No unit
    ///   is launched in that case.
    /// - [`DispatchError::UnitSpawn`] if a unit cannot be started. Units launched before it
    ///   see their inbox close and stop.
    pub fn start(
        registry: ResourceRegistry,
        sink: Arc<dyn NotificationSink>,
        config: &DispatcherConfig,
    ) -> Result<Self, DispatchError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| DispatchError::TaskFailed(e.to_string()))?;

        let mut resources = HashSet::new();
        for launcher in &registry.launchers {
            let resource = launcher.descriptor();
            if !resources.insert(resource.clone()) {
                return Err(DispatchError::DuplicateResource(resource.to_string()));
            }
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let mut workers = HashMap::new();
        for launcher in registry.launchers {
            let resource = launcher.descriptor();
            let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
            let outbox = UnitOutbox::new(resource.clone(), events_tx.clone());
            if let Err(e) = launcher.launch(inbox_rx, outbox, stop.child_token(), config) {
                stop.cancel();
                return Err(e);
            }
            let _ = inbox_tx.send(Message::start());
            workers.insert(resource, WorkerRecord::new(inbox_tx));
        }
        drop(events_tx);

        let all_ready = Arc::new(AtomicBool::new(workers.is_empty()));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let core = DispatcherCore {
            commands: commands_rx,
            events: events_rx,
            workers,
            pending: HashMap::new(),
            waiters: Vec::new(),
            all_ready: all_ready.clone(),
            sink,
            stop,
            shutdown_timeout: config.shutdown_timeout(),
            shutdown_deadline: None,
            shutting_down: false,
        };
        let task = runtime.spawn(core.run());

        Ok(Self {
            client: DispatcherClient {
                commands: commands_tx,
                resources: Arc::new(resources),
                all_ready,
            },
            task,
        })
    }

    pub fn client(&self) -> DispatcherClient {
        self.client.clone()
    }

    pub fn do_request(
        &self,
        resource: &ResourceDescriptor,
        method: Method,
        options: RequestOptions,
    ) -> Result<RequestId, DispatchError> {
        self.client.do_request(resource, method, options)
    }

    pub fn ready(&self, callback: impl FnOnce() + Send + 'static) -> Result<(), DispatchError> {
        self.client.ready(callback)
    }

    /// Stops every unit and waits until each has exited, or until the configured shutdown
    /// timeout passes. Units still running then are detached.
    pub async fn shutdown(self) -> Result<(), DispatchError> {
        self.client.shutdown();
        self.task
            .await
            .map_err(|e| DispatchError::TaskFailed(e.to_string()))
    }
}

struct WorkerRecord {
    /// `None` once the unit has exited or shutdown has begun.
    inbox: Option<mpsc::UnboundedSender<Message>>,
    ready_state: ReadyState,
    exited: bool,
}

impl WorkerRecord {
    fn new(inbox: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            inbox: Some(inbox),
            ready_state: ReadyState::Created,
            exited: false,
        }
    }
}

struct PendingRequest {
    resource: ResourceDescriptor,
    method: Method,
    completion: Completion,
}

struct DispatcherCore {
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedReceiver<(ResourceDescriptor, UnitEvent)>,
    workers: HashMap<ResourceDescriptor, WorkerRecord>,
    pending: HashMap<RequestId, PendingRequest>,
    waiters: Vec<ReadyCallback>,
    all_ready: Arc<AtomicBool>,
    sink: Arc<dyn NotificationSink>,
    stop: CancellationToken,
    shutdown_timeout: std::time::Duration,
    shutdown_deadline: Option<Instant>,
    shutting_down: bool,
}

impl DispatcherCore {
    async fn run(mut self) {
        info!(workers = self.workers.len(), "Dispatcher started");
        let mut commands_open = true;
        let mut events_open = !self.workers.is_empty();
        let mut burst = 0;

        loop {
            if self.shutting_down && self.workers.values().all(|w| w.exited) {
                break;
            }
            if !commands_open && !events_open {
                break;
            }
            let deadline = self.shutdown_deadline;
            tokio::select! {
                biased;
                event = self.events.recv(), if events_open => {
                    burst += 1;
                    match event {
                        Some((resource, UnitEvent::Message(msg))) => self.on_message(resource, msg),
                        Some((resource, UnitEvent::Exited(exit))) => self.on_exit(resource, exit),
                        None => events_open = false,
                    }
                }
                command = self.commands.recv(), if commands_open => {
                    burst = 0;
                    match command {
                        Some(command) => self.on_command(command),
                        None => {
                            commands_open = false;
                            self.begin_shutdown();
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let running: Vec<String> = self
                        .workers
                        .iter()
                        .filter(|(_, w)| !w.exited)
                        .map(|(resource, _)| resource.to_string())
                        .collect();
                    warn!(?running, "Worker units did not stop in time, detaching them");
                    break;
                }
            }

            if burst >= EVENT_BURST {
                burst = 0;
                if commands_open {
                    if let Ok(command) = self.commands.try_recv() {
                        self.on_command(command);
                    }
                }
            }
        }

        self.stop.cancel();
        if !self.pending.is_empty() {
            warn!(pending = self.pending.len(), "Dispatcher stopped with unanswered requests");
        }
        info!("Dispatcher stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Request {
                resource,
                request,
                completion,
            } => self.post(resource, request, completion),
            Command::WhenReady(callback) => {
                if self.all_ready.load(Ordering::Acquire) {
                    run_guarded("ready", callback);
                } else {
                    self.waiters.push(callback);
                }
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown => self.begin_shutdown(),
        }
    }

    fn post(&mut self, resource: ResourceDescriptor, request: RestRequest, completion: Completion) {
        let request_id = request.request_id;
        let method = request.method;

        let inbox = match self.workers.get(&resource) {
            Some(worker) if !self.shutting_down => worker.inbox.clone(),
            _ => None,
        };
        let Some(inbox) = inbox else {
            warn!(%request_id, %resource, "Worker unit unavailable, failing request");
            completion.complete(503, unavailable_body(&resource));
            return;
        };

        self.pending.insert(
            request_id,
            PendingRequest {
                resource: resource.clone(),
                method,
                completion,
            },
        );
        if inbox.send(Message::RestRequest { request }).is_err() {
            if let Some(pending) = self.pending.remove(&request_id) {
                warn!(%request_id, %resource, "Worker unit inbox closed, failing request");
                pending.completion.complete(503, unavailable_body(&resource));
            }
            return;
        }
        debug!(%request_id, %resource, %method, "Request posted");
    }

    fn on_message(&mut self, resource: ResourceDescriptor, msg: Message) {
        match msg {
            Message::ReadyStateChange { ready_state } => self.on_ready_state(resource, ready_state),
            Message::RestResponse { response } => self.on_response(resource, response),
            Message::Notification { notification } => {
                debug!(
                    %resource,
                    topic = %notification.resource,
                    event = %notification.event,
                    "Notification republished"
                );
                self.sink.publish(
                    &notification.resource,
                    &notification.event,
                    notification.data,
                );
            }
            other => {
                error!(%resource, kind = %other.kind(), "Invalid message received from worker unit");
            }
        }
    }

    fn on_ready_state(&mut self, resource: ResourceDescriptor, state: ReadyState) {
        let Some(worker) = self.workers.get_mut(&resource) else {
            warn!(%resource, "Ready state from unknown worker unit");
            return;
        };
        match (worker.ready_state, state) {
            (ReadyState::Created, ReadyState::Ready) => {
                worker.ready_state = ReadyState::Ready;
                info!(%resource, "Worker unit ready");
            }
            (current, reported) => {
                debug!(%resource, ?current, ?reported, "Ready state change ignored");
                return;
            }
        }

        let all_ready = self
            .workers
            .values()
            .all(|w| w.ready_state == ReadyState::Ready);
        if all_ready && !self.all_ready.swap(true, Ordering::AcqRel) {
            info!(workers = self.workers.len(), "All worker units ready");
            for callback in self.waiters.drain(..) {
                run_guarded("ready", callback);
            }
        }
    }

    fn on_response(&mut self, resource: ResourceDescriptor, response: RestResponse) {
        let RestResponse {
            request_id,
            status,
            body,
        } = response;

        let owner = match self.pending.get(&request_id) {
            Some(pending) => pending.resource.clone(),
            None => {
                error!(%request_id, %resource, "Response for unknown request dropped");
                return;
            }
        };
        if owner != resource {
            error!(%request_id, %resource, expected = %owner, "Response from the wrong worker unit dropped");
            return;
        }

        let Some(pending) = self.pending.remove(&request_id) else {
            return;
        };
        info!(%request_id, %resource, method = %pending.method, status, "Response received");
        if !pending.completion.complete(status, body) {
            debug!(%request_id, status, "No callback registered for response");
        }
    }

    fn on_exit(&mut self, resource: ResourceDescriptor, exit: UnitExit) {
        let Some(worker) = self.workers.get_mut(&resource) else {
            return;
        };
        worker.exited = true;
        worker.inbox = None;

        match &exit {
            UnitExit::Clean => info!(%resource, "Worker unit exited"),
            UnitExit::Abnormal(reason) => error!(%resource, %reason, "Worker unit crashed"),
        }
        if self.shutting_down {
            return;
        }

        let orphaned: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.resource == resource)
            .map(|(id, _)| *id)
            .collect();
        for request_id in orphaned {
            if let Some(pending) = self.pending.remove(&request_id) {
                warn!(%request_id, %resource, "Failing request of exited worker unit");
                pending.completion.complete(503, unavailable_body(&resource));
            }
        }
    }

    fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        self.shutdown_deadline = Some(Instant::now() + self.shutdown_timeout);
        info!(
            workers = self.workers.len(),
            pending = self.pending.len(),
            "Dispatcher shutting down"
        );
        self.stop.cancel();
        for worker in self.workers.values_mut() {
            worker.inbox = None;
        }
    }

    fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            pending: self.pending.keys().copied().collect(),
            workers: self
                .workers
                .iter()
                .map(|(resource, worker)| (resource.clone(), worker.ready_state))
                .collect(),
            all_ready: self.all_ready.load(Ordering::Acquire),
        }
    }
}

fn unavailable_body(resource: &ResourceDescriptor) -> Value {
    json!({
        "status": 503,
        "error": "worker_unavailable",
        "message": DispatchError::WorkerUnavailable(resource.to_string()).to_string(),
    })
}
