//! # Media Manager
//!
//! Host application for the [`api_workers`] dispatcher: the media manager's REST resources,
//! the notification bus their events are published on, configuration loading and
//! lifecycle orchestration.
//!
//! - **[config]**: layered [`AppConfig`](config::AppConfig) (defaults, file, environment).
//! - **[resources]**: the resource catalog served by worker units.
//! - **[bus]**: topic-keyed [`NotificationBus`](bus::NotificationBus).
//! - **[lifecycle]**: [`MediaSystem`](lifecycle::MediaSystem), which starts and stops it all.

pub mod bus;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod resources;

pub use error::AppError;
