//! # Media Manager Demo
//!
//! Starts every resource, waits for readiness, runs an import and a few collection
//! requests, then prints the notifications the bus carried.
//!
//! ```bash
//! RUST_LOG=info cargo run -p media-app
//! MEDIA_MANAGER__DISPATCHER__DEFAULT_UNIT_KIND=thread cargo run -p media-app
//! MEDIA_MANAGER_CONFIG=media-manager.toml cargo run -p media-app
//! ```

use api_workers::tracing::setup_tracing;
use api_workers::{Method, RequestOptions};
use media_app::config::AppConfig;
use media_app::lifecycle::MediaSystem;
use media_app::resources::{IMAGES, IMPORTERS, STORAGE_SYNCHRONIZERS, TAGS};
use media_app::AppError;
use serde_json::json;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{error, info, Instrument};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    setup_tracing();

    let config_file = std::env::var_os("MEDIA_MANAGER_CONFIG").map(PathBuf::from);
    let config = AppConfig::load(config_file.as_deref())?;

    let system = MediaSystem::start(config)?;
    let mut events = system.bus().subscribe_all();
    system.wait_ready().await?;

    let span = tracing::info_span!("import");
    async {
        let importer = system
            .request(
                IMPORTERS,
                Method::Post,
                RequestOptions::new().attr(json!({
                    "import_dir": "/media/camera/2013-06",
                    "files": ["IMG_0001.JPG", "IMG_0002.JPG", "IMG_0003.JPG"],
                })),
            )
            .await?;
        info!(importer = %importer, "Import finished");
        Ok::<_, AppError>(())
    }
    .instrument(span)
    .await?;

    // Callback style, as the REST router uses it.
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let failed_tx = done_tx.clone();
    system.client().do_request(
        &system.resource(TAGS)?,
        Method::Post,
        RequestOptions::from_json_str(r#"{"attr": {"label": "vacation"}}"#)
            .on_success(move |body| {
                let _ = done_tx.send(Ok(body));
            })
            .on_error(move |body| {
                let _ = failed_tx.send(Err(body));
            }),
    )?;
    match done_rx.recv().await {
        Some(Ok(tag)) => info!(tag = %tag, "Tag created"),
        Some(Err(body)) => error!(error = %body, "Tag creation failed"),
        None => error!("Tag request was dropped"),
    }

    let synchronizer = system
        .request(
            STORAGE_SYNCHRONIZERS,
            Method::Post,
            RequestOptions::new().attr(json!({"target": "s3://media-backup"})),
        )
        .await?;
    info!(synchronizer = %synchronizer, "Synchronizer created");

    match system
        .request(IMAGES, Method::Get, RequestOptions::new().id("image-42"))
        .await
    {
        Ok(image) => info!(image = %image, "Image found"),
        Err(e) => info!(error = %e, "Image lookup failed as expected"),
    }

    println!("Notifications observed:");
    while let Ok(notification) = events.try_recv() {
        println!(
            "  {} {} {}",
            notification.resource, notification.event, notification.data
        );
    }

    system.shutdown().await?;
    info!("Application completed successfully");
    Ok(())
}
