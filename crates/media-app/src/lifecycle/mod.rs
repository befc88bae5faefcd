//! # System Lifecycle
//!
//! [`MediaSystem`] wires the application together:
//!
//! 1. **Bus**: creates the [`NotificationBus`] with the configured capacity.
//! 2. **Catalog**: builds every resource from the `rest_api` settings.
//! 3. **Dispatcher**: starts one worker unit per resource, republishing their
//!    notifications onto the bus.
//!
//! ## Graceful Shutdown
//!
//! [`MediaSystem::shutdown`] tells every unit to stop and waits until each one has
//! exited, for at most `dispatcher.shutdown_timeout_ms`. Requests still pending at that
//! point get no answer; awaiting callers see `DispatcherDropped`.

use api_workers::{
    Dispatcher, DispatcherClient, Method, NotificationSink, RequestOptions, ResourceDescriptor,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::bus::NotificationBus;
use crate::config::AppConfig;
use crate::error::AppError;
use crate::resources::{self, Catalog};

pub struct MediaSystem {
    config: AppConfig,
    dispatcher: Dispatcher,
    bus: Arc<NotificationBus>,
    catalog: Catalog,
}

impl MediaSystem {
    /// Starts every resource. Must be called from within a tokio runtime.
    pub fn start(config: AppConfig) -> Result<Self, AppError> {
        let bus = Arc::new(NotificationBus::new(config.notifications.channel_capacity));
        let (registry, catalog) = resources::build(&config.rest_api);
        let sink: Arc<dyn NotificationSink> = bus.clone();
        let dispatcher = Dispatcher::start(registry, sink, &config.dispatcher)?;

        info!(
            resources = catalog.len(),
            prefix = %config.rest_api.full_path(""),
            "Media system started"
        );
        Ok(Self {
            config,
            dispatcher,
            bus,
            catalog,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn client(&self) -> DispatcherClient {
        self.dispatcher.client()
    }

    pub fn bus(&self) -> Arc<NotificationBus> {
        self.bus.clone()
    }

    /// Descriptor of the resource mounted at `name`, e.g. `/images`.
    pub fn resource(&self, name: &str) -> Result<ResourceDescriptor, AppError> {
        self.catalog
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::UnknownResource(name.to_string()))
    }

    pub async fn wait_ready(&self) -> Result<(), AppError> {
        self.dispatcher.client().wait_ready().await?;
        info!("Media system ready");
        Ok(())
    }

    /// Sends one request to the resource mounted at `name` and waits for the body.
    pub async fn request(
        &self,
        name: &str,
        method: Method,
        options: RequestOptions,
    ) -> Result<Value, AppError> {
        let resource = self.resource(name)?;
        Ok(self.client().request(&resource, method, options).await?)
    }

    pub async fn shutdown(self) -> Result<(), AppError> {
        info!("Shutting down media system");
        self.dispatcher.shutdown().await?;
        info!("Media system stopped");
        Ok(())
    }
}
