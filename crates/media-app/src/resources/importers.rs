use api_workers::{ApiResource, Method, ResourceDescriptor, ResourceError, UnitContext};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::info;

use super::collection::{attributes, item_id};

/// Import jobs.
///
/// `POST` with `attr: {import_dir, files?}` runs an import and emits `import.started` and
/// `import.completed` on the notification topic. `GET` lists jobs or returns one by `id`.
/// Jobs cannot be modified or removed.
pub struct ImportersResource {
    descriptor: ResourceDescriptor,
    topic: String,
    importers: BTreeMap<String, Value>,
    next_id: u64,
}

impl ImportersResource {
    pub fn new(descriptor: ResourceDescriptor, topic: impl Into<String>) -> Self {
        Self {
            descriptor,
            topic: topic.into(),
            importers: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn start_import(
        &mut self,
        attr: Map<String, Value>,
        ctx: &UnitContext,
    ) -> Result<Value, ResourceError> {
        let import_dir = attr
            .get("import_dir")
            .and_then(Value::as_str)
            .ok_or_else(|| ResourceError::Validation("attr.import_dir is required".into()))?
            .to_string();
        let files: Vec<String> = match attr.get("files") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(files)) => files
                .iter()
                .filter_map(|f| f.as_str().map(str::to_string))
                .collect(),
            Some(other) => {
                return Err(ResourceError::Validation(format!(
                    "attr.files must be a list, got {other}"
                )))
            }
        };

        let id = format!("importer-{}", self.next_id);
        self.next_id += 1;
        let notifier = ctx.notifier();

        notifier.notify(
            self.topic.as_str(),
            "import.started",
            json!({"id": id, "import_dir": import_dir, "num_to_import": files.len()}),
        );
        info!(%id, %import_dir, files = files.len(), "Import started");

        let importer = json!({
            "id": id,
            "import_dir": import_dir,
            "state": "completed",
            "num_to_import": files.len(),
            "num_imported": files.len(),
        });
        self.importers.insert(id.clone(), importer.clone());

        notifier.notify(self.topic.as_str(), "import.completed", importer.clone());
        info!(%id, "Import completed");
        Ok(importer)
    }
}

#[async_trait]
impl ApiResource for ImportersResource {
    fn descriptor(&self) -> ResourceDescriptor {
        self.descriptor.clone()
    }

    async fn handle(
        &mut self,
        method: Method,
        options: Map<String, Value>,
        ctx: &UnitContext,
    ) -> Result<Value, ResourceError> {
        match method {
            Method::Get => match item_id(&options)? {
                Some(id) => self
                    .importers
                    .get(&id)
                    .map(|importer| json!({ "importer": importer }))
                    .ok_or_else(|| ResourceError::NotFound(format!("importer {id}"))),
                None => Ok(json!({ "importers": self.importers.values().collect::<Vec<_>>() })),
            },
            Method::Post => self.start_import(attributes(&options)?, ctx),
            other => Err(ResourceError::Validation(format!(
                "{other} is not supported on importers"
            ))),
        }
    }
}
