//! # API Workers
//!
//! A request dispatcher that hosts each REST resource in its own isolated worker unit and
//! routes calls to it by message passing.
//!
//! ## Architecture Overview
//!
//! ```text
//!   caller ──do_request──▶ DispatcherClient ──Command──▶ DispatcherCore
//!                                                          │   ▲
//!                                          REST_REQUEST    │   │  REST_RESPONSE
//!                                          START           ▼   │  NOTIFICATION
//!                                                       WorkerUnit  READY_STATE_CHANGE
//!                                                          │
//!                                                     ApiResource
//! ```
//!
//! 1. **Resource layer** ([`ApiResource`]): the business logic of one endpoint.
//! 2. **Unit layer** ([`unit`]): one message loop per resource, on a tokio task or a
//!    dedicated thread, that turns messages into resource calls and back.
//! 3. **Dispatcher layer** ([`Dispatcher`], [`DispatcherClient`]): owns the units, the
//!    table of pending requests and the readiness barrier.
//!
//! Units share no memory with the dispatcher or with each other. Everything crosses the
//! boundary as a [`Message`], whose JSON form is documented in [`message`].
//!
//! ## Concurrency Model
//!
//! - Each unit processes its own messages sequentially, so a resource needs no locks.
//! - Units run in parallel with each other and with the dispatcher.
//! - The dispatcher processes one event at a time; the pending table and worker records
//!   are never shared.
//! - `do_request` never waits. Responses come back in whatever order units produce them
//!   and are matched to their callers by [`RequestId`].
//!
//! ## Testing
//!
//! The [`mock`] module provides a hand-driven unit, a scripted resource and a recording
//! notification sink.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod mock;
pub mod options;
pub mod resource;
pub mod sink;
pub mod tracing;
pub mod unit;

pub use config::{DispatcherConfig, UnitKind};
pub use dispatcher::{Dispatcher, DispatcherClient, DispatcherStats, ResourceRegistry};
pub use error::{DispatchError, ResourceError};
pub use message::{Message, MessageKind, Method, Notification, ReadyState, RequestId};
pub use options::RequestOptions;
pub use resource::{ApiResource, Notifier, ResourceDescriptor, UnitContext};
pub use sink::NotificationSink;
pub use unit::{UnitExit, UnitLauncher, UnitOutbox};
