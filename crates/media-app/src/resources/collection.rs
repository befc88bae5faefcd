use api_workers::{ApiResource, Method, ResourceDescriptor, ResourceError, UnitContext};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// An in-memory REST collection.
///
/// | Method   | Options        | Result                                   |
/// |----------|----------------|------------------------------------------|
/// | `GET`    | (none)         | `{"<inst>s": [...]}` in id order         |
/// | `GET`    | `id`           | `{"<inst>": {...}}` or 404               |
/// | `POST`   | `attr`         | the created item, with a generated `id`  |
/// | `PUT`    | `id`, `attr`   | the item with `attr` merged in, or 404   |
/// | `DELETE` | `id`           | the removed item, or 404                 |
///
/// When a notification topic is set, every change emits `<inst>.created`,
/// `<inst>.updated` or `<inst>.deleted` on it, carrying the item.
pub struct CollectionResource {
    descriptor: ResourceDescriptor,
    inst_name: String,
    topic: Option<String>,
    items: BTreeMap<String, Map<String, Value>>,
    next_id: u64,
}

impl CollectionResource {
    pub fn new(descriptor: ResourceDescriptor, inst_name: impl Into<String>) -> Self {
        Self {
            descriptor,
            inst_name: inst_name.into(),
            topic: None,
            items: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Emits change notifications on `topic`.
    pub fn with_notifications(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    fn index(&self) -> Value {
        let items: Vec<Value> = self.items.values().cloned().map(Value::Object).collect();
        let mut body = Map::new();
        body.insert(format!("{}s", self.inst_name), Value::Array(items));
        Value::Object(body)
    }

    fn get(&self, id: &str) -> Result<Value, ResourceError> {
        let item = self.items.get(id).ok_or_else(|| self.not_found(id))?;
        let mut body = Map::new();
        body.insert(self.inst_name.clone(), Value::Object(item.clone()));
        Ok(Value::Object(body))
    }

    fn create(&mut self, attr: Map<String, Value>, ctx: &UnitContext) -> Value {
        let id = format!("{}-{}", self.inst_name, self.next_id);
        self.next_id += 1;

        let mut item = attr;
        item.insert("id".into(), Value::String(id.clone()));
        self.items.insert(id, item.clone());

        let item = Value::Object(item);
        self.emit(ctx, "created", &item);
        item
    }

    fn update(
        &mut self,
        id: &str,
        attr: Map<String, Value>,
        ctx: &UnitContext,
    ) -> Result<Value, ResourceError> {
        let Some(item) = self.items.get_mut(id) else {
            return Err(self.not_found(id));
        };
        for (key, value) in attr {
            if key != "id" {
                item.insert(key, value);
            }
        }
        let item = Value::Object(item.clone());
        self.emit(ctx, "updated", &item);
        Ok(item)
    }

    fn delete(&mut self, id: &str, ctx: &UnitContext) -> Result<Value, ResourceError> {
        let item = self.items.remove(id).ok_or_else(|| self.not_found(id))?;
        let item = Value::Object(item);
        self.emit(ctx, "deleted", &item);
        Ok(item)
    }

    fn emit(&self, ctx: &UnitContext, change: &str, item: &Value) {
        if let Some(topic) = &self.topic {
            let event = format!("{}.{change}", self.inst_name);
            ctx.notifier().notify(topic.as_str(), event, item.clone());
        }
    }

    fn not_found(&self, id: &str) -> ResourceError {
        ResourceError::NotFound(format!("{} {id}", self.inst_name))
    }
}

#[async_trait]
impl ApiResource for CollectionResource {
    fn descriptor(&self) -> ResourceDescriptor {
        self.descriptor.clone()
    }

    async fn handle(
        &mut self,
        method: Method,
        options: Map<String, Value>,
        ctx: &UnitContext,
    ) -> Result<Value, ResourceError> {
        debug!(resource = %self.descriptor, %method, items = self.items.len(), "Collection request");
        match method {
            Method::Get => match item_id(&options)? {
                Some(id) => self.get(&id),
                None => Ok(self.index()),
            },
            Method::Post => Ok(self.create(attributes(&options)?, ctx)),
            Method::Put => {
                let id = required_id(&options)?;
                let attr = attributes(&options)?;
                self.update(&id, attr, ctx)
            }
            Method::Delete => {
                let id = required_id(&options)?;
                self.delete(&id, ctx)
            }
        }
    }
}

/// Reads `id`, accepting strings and numbers.
pub(crate) fn item_id(options: &Map<String, Value>) -> Result<Option<String>, ResourceError> {
    match options.get("id") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(id)) => Ok(Some(id.clone())),
        Some(Value::Number(id)) => Ok(Some(id.to_string())),
        Some(other) => Err(ResourceError::Validation(format!("invalid id: {other}"))),
    }
}

pub(crate) fn required_id(options: &Map<String, Value>) -> Result<String, ResourceError> {
    item_id(options)?.ok_or_else(|| ResourceError::Validation("missing id".into()))
}

/// Reads `attr`, which must be an object when present.
pub(crate) fn attributes(options: &Map<String, Value>) -> Result<Map<String, Value>, ResourceError> {
    match options.get("attr") {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(attr)) => Ok(attr.clone()),
        Some(other) => Err(ResourceError::Validation(format!(
            "attr must be an object, got {other}"
        ))),
    }
}
