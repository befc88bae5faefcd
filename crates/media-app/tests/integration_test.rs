use api_workers::{DispatchError, Method, RequestOptions, UnitKind};
use media_app::config::AppConfig;
use media_app::lifecycle::MediaSystem;
use media_app::resources::{self, IMAGES, IMPORTERS, STORAGE_SYNCHRONIZERS, TAGS};
use media_app::AppError;
use serde_json::json;

async fn started(kind: UnitKind) -> MediaSystem {
    let mut config = AppConfig::default();
    config.dispatcher.default_unit_kind = kind;
    let system = MediaSystem::start(config).expect("system should start");
    system.wait_ready().await.expect("system should become ready");
    system
}

fn status(result: Result<serde_json::Value, AppError>) -> Option<i64> {
    match result {
        Err(AppError::Dispatch(e)) => e.status(),
        other => panic!("expected a failed request, got {other:?}"),
    }
}

#[tokio::test]
async fn test_every_catalog_resource_is_served() {
    let system = started(UnitKind::Task).await;
    let client = system.client();

    for name in resources::ALL {
        let resource = system.resource(name).unwrap();
        assert!(client.is_registered(&resource), "{name}");
        assert!(resource.full_path().ends_with(name));
    }
    assert!(client.stats().await.unwrap().all_ready);

    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_collection_crud_through_the_dispatcher() {
    let system = started(UnitKind::Task).await;

    let created = system
        .request(
            TAGS,
            Method::Post,
            RequestOptions::new().attr(json!({"label": "beach"})),
        )
        .await
        .unwrap();
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(id, "tag-1");
    assert_eq!(created["label"], "beach");

    let updated = system
        .request(
            TAGS,
            Method::Put,
            RequestOptions::new()
                .id(id.as_str())
                .attr(json!({"label": "sunset", "id": "hijacked"})),
        )
        .await
        .unwrap();
    assert_eq!(updated["label"], "sunset");
    assert_eq!(updated["id"], "tag-1");

    let index = system
        .request(TAGS, Method::Get, RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(index["tags"].as_array().unwrap().len(), 1);

    let one = system
        .request(TAGS, Method::Get, RequestOptions::new().id(id.as_str()))
        .await
        .unwrap();
    assert_eq!(one["tag"]["label"], "sunset");

    system
        .request(TAGS, Method::Delete, RequestOptions::new().id(id.as_str()))
        .await
        .unwrap();
    let missing = system
        .request(TAGS, Method::Get, RequestOptions::new().id(id.as_str()))
        .await;
    assert_eq!(status(missing), Some(404));

    let invalid = system
        .request(TAGS, Method::Post, RequestOptions::new().attr(json!("not an object")))
        .await;
    assert_eq!(status(invalid), Some(400));

    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_import_notifications_reach_topic_subscribers() {
    let system = started(UnitKind::Thread).await;
    let mut importers = system.bus().subscribe(IMPORTERS);
    let mut synchronizers = system.bus().subscribe(STORAGE_SYNCHRONIZERS);

    let importer = system
        .request(
            IMPORTERS,
            Method::Post,
            RequestOptions::new().attr(json!({
                "import_dir": "/media/import",
                "files": ["a.jpg", "b.jpg"],
            })),
        )
        .await
        .unwrap();
    assert_eq!(importer["state"], "completed");
    assert_eq!(importer["num_imported"], 2);

    let started = importers.recv().await.unwrap();
    assert_eq!(started.resource, IMPORTERS);
    assert_eq!(started.event, "import.started");
    assert_eq!(started.data["import_dir"], "/media/import");

    let completed = importers.recv().await.unwrap();
    assert_eq!(completed.event, "import.completed");
    assert_eq!(completed.data, importer);

    assert!(synchronizers.try_recv().is_err());

    let missing_dir = system
        .request(IMPORTERS, Method::Post, RequestOptions::new())
        .await;
    assert_eq!(status(missing_dir), Some(400));

    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_synchronizer_changes_are_published() {
    let system = started(UnitKind::Task).await;
    let mut all = system.bus().subscribe_all();

    let created = system
        .request(
            STORAGE_SYNCHRONIZERS,
            Method::Post,
            RequestOptions::new().attr(json!({"target": "s3://backup"})),
        )
        .await
        .unwrap();
    system
        .request(
            STORAGE_SYNCHRONIZERS,
            Method::Delete,
            RequestOptions::new().id(created["id"].clone()),
        )
        .await
        .unwrap();

    let events: Vec<String> = vec![
        all.recv().await.unwrap().event,
        all.recv().await.unwrap().event,
    ];
    assert_eq!(events, ["synchronizer.created", "synchronizer.deleted"]);

    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_callback_requests_and_unknown_names() {
    let system = started(UnitKind::Task).await;

    let (tx, rx) = tokio::sync::oneshot::channel();
    system
        .client()
        .do_request(
            &system.resource(IMAGES).unwrap(),
            Method::Get,
            RequestOptions::new().on_success(move |body| {
                let _ = tx.send(body);
            }),
        )
        .unwrap();
    assert_eq!(rx.await.unwrap(), json!({"images": []}));

    assert!(matches!(
        system.resource("/widgets"),
        Err(AppError::UnknownResource(name)) if name == "/widgets"
    ));
    let unmounted = system
        .client()
        .do_request(&"/images".into(), Method::Get, RequestOptions::new());
    assert!(matches!(unmounted, Err(DispatchError::UnknownResource(_))));

    system.shutdown().await.unwrap();
}
