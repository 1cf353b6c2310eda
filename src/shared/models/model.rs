use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use super::registry::ModelDefinition;
use crate::shared::store::query::{get_path, set_path};
use crate::shared::store::{
    id_key, new_object_id, now_millis, projection_from_fields, Document, DocumentStore,
    FindOneAndUpdateOptions, FindOptions, StoreError,
};

/// Options for reads through a [`Model`].
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Return plain stored data without the hydrated `id` virtual.
    pub lean: bool,
    pub sort: Option<Document>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

/// Options for find-and-update through a [`Model`].
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub lean: bool,
    /// Return the post-update document.
    pub return_new: bool,
    pub upsert: bool,
    pub sort: Option<Document>,
}

/// One relation to expand inline when populating.
#[derive(Debug, Clone, PartialEq)]
pub struct PopulatePath {
    pub path: String,
    pub select: Option<Document>,
}

impl PopulatePath {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            select: None,
        }
    }

    /// Accepts `"author tags"`, `{ "path": "author", "select": "name" }`, or
    /// an array mixing both.
    pub fn parse(value: &Value) -> Result<Vec<Self>, StoreError> {
        match value {
            Value::Null => Ok(Vec::new()),
            Value::String(paths) => Ok(paths.split_whitespace().map(Self::new).collect()),
            Value::Array(items) => {
                let mut out = Vec::new();
                for item in items {
                    out.extend(Self::parse(item)?);
                }
                Ok(out)
            }
            Value::Object(map) => {
                let path = map.get("path").and_then(Value::as_str).ok_or_else(|| {
                    StoreError::InvalidQuery("populate entries need a 'path'".to_string())
                })?;
                let select = match map.get("select") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(fields)) => Some(projection_from_fields(fields)),
                    Some(Value::Object(fields)) => Some(fields.clone()),
                    Some(_) => {
                        return Err(StoreError::InvalidQuery(
                            "populate 'select' must be a string or an object".to_string(),
                        ))
                    }
                };
                Ok(path
                    .split_whitespace()
                    .map(|p| Self {
                        path: p.to_string(),
                        select: select.clone(),
                    })
                    .collect())
            }
            _ => Err(StoreError::InvalidQuery(
                "populate must be a string, an object or an array".to_string(),
            )),
        }
    }
}

/// Collection handle bound to one model definition.
#[derive(Clone)]
pub struct Model {
    definition: Arc<ModelDefinition>,
    collection: String,
    /// Field path -> referenced collection.
    references: HashMap<String, String>,
    store: Arc<dyn DocumentStore>,
}

impl Model {
    pub(crate) fn new(
        definition: Arc<ModelDefinition>,
        collection: String,
        references: HashMap<String, String>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            definition,
            collection,
            references,
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn definition(&self) -> &ModelDefinition {
        &self.definition
    }

    pub async fn ensure_collection(&self) -> Result<(), StoreError> {
        self.store.ensure_collection(&self.collection).await
    }

    /// Build a new record from `data` and persist it.
    pub async fn save(&self, data: Document) -> Result<Document, StoreError> {
        let mut doc = data;
        for (field, value) in &self.definition.defaults {
            if get_path(&doc, field).is_none() {
                set_path(&mut doc, field, value.clone())?;
            }
        }
        for field in &self.definition.required {
            match get_path(&doc, field) {
                None | Some(Value::Null) => {
                    return Err(StoreError::Validation(format!(
                        "{}: path '{}' is required",
                        self.definition.name, field
                    )))
                }
                Some(Value::String(s)) if s.is_empty() => {
                    return Err(StoreError::Validation(format!(
                        "{}: path '{}' is required",
                        self.definition.name, field
                    )))
                }
                _ => {}
            }
        }
        if !doc.contains_key("_id") {
            doc.insert("_id".to_string(), Value::String(new_object_id()));
        }
        if self.definition.timestamps {
            let now = now_millis();
            doc.entry("createdAt").or_insert_with(|| json!(now));
            doc.entry("updatedAt").or_insert_with(|| json!(now));
        }
        self.store.insert_one(&self.collection, doc).await
    }

    pub async fn find_one_and_update(
        &self,
        criteria: &Document,
        update: Document,
        options: &UpdateOptions,
    ) -> Result<Option<Document>, StoreError> {
        let mut update = update;
        if self.definition.timestamps {
            let now = json!(now_millis());
            let has_updated_at = update.contains_key("updatedAt")
                || update
                    .get("$set")
                    .and_then(Value::as_object)
                    .is_some_and(|set| set.contains_key("updatedAt"));
            if !has_updated_at {
                update.insert("updatedAt".to_string(), now.clone());
            }
            if options.upsert {
                let on_insert = update
                    .entry("$setOnInsert")
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Value::Object(fields) = on_insert {
                    fields.entry("createdAt").or_insert(now);
                }
            }
        }

        let store_options = FindOneAndUpdateOptions {
            return_new: options.return_new,
            upsert: options.upsert,
            sort: options.sort.clone(),
            projection: None,
        };
        let found = self
            .store
            .find_one_and_update(&self.collection, criteria, &update, &store_options)
            .await?;
        Ok(found.map(|doc| hydrate(doc, options.lean)))
    }

    pub async fn find_one_and_remove(
        &self,
        criteria: &Document,
    ) -> Result<Option<Document>, StoreError> {
        self.store
            .find_one_and_delete(&self.collection, criteria)
            .await
    }

    pub async fn find(
        &self,
        criteria: &Document,
        projection: Option<&Document>,
        options: &QueryOptions,
    ) -> Result<Vec<Document>, StoreError> {
        let find_options = FindOptions {
            projection: projection.cloned(),
            sort: options.sort.clone(),
            skip: options.skip,
            limit: options.limit,
        };
        let docs = self
            .store
            .find(&self.collection, criteria, &find_options)
            .await?;
        Ok(docs
            .into_iter()
            .map(|doc| hydrate(doc, options.lean))
            .collect())
    }

    /// Find, restrict fields, then replace reference ids with the referenced
    /// records.
    pub async fn find_populated(
        &self,
        criteria: &Document,
        projection: Option<&Document>,
        populate: &[PopulatePath],
    ) -> Result<Vec<Document>, StoreError> {
        let find_options = FindOptions {
            projection: projection.cloned(),
            ..Default::default()
        };
        let mut docs = self
            .store
            .find(&self.collection, criteria, &find_options)
            .await?;

        for target in populate {
            self.populate_path(&mut docs, target).await?;
        }

        Ok(docs.into_iter().map(|doc| hydrate(doc, false)).collect())
    }

    async fn populate_path(
        &self,
        docs: &mut [Document],
        target: &PopulatePath,
    ) -> Result<(), StoreError> {
        let collection = self.references.get(&target.path).ok_or_else(|| {
            StoreError::InvalidQuery(format!(
                "cannot populate '{}': not a reference of {}",
                target.path, self.definition.name
            ))
        })?;

        let mut ids: Vec<Value> = Vec::new();
        for doc in docs.iter() {
            match get_path(doc, &target.path) {
                Some(Value::Array(items)) => ids.extend(items.iter().cloned()),
                Some(Value::Null) | None => {}
                Some(other) => ids.push(other.clone()),
            }
        }
        if ids.is_empty() {
            return Ok(());
        }

        let mut filter = Map::new();
        filter.insert("_id".to_string(), json!({ "$in": ids }));
        let projection = target.select.clone().map(|mut select| {
            // `_id` must survive so results can be matched back
            if select.get("_id").and_then(Value::as_i64) == Some(0) {
                select.shift_remove("_id");
            }
            select
        });
        let options = FindOptions {
            projection,
            ..Default::default()
        };
        let related = self.store.find(collection, &filter, &options).await?;
        let by_id: HashMap<String, Document> = related
            .into_iter()
            .filter_map(|doc| doc.get("_id").map(id_key).map(|key| (key, doc)))
            .collect();

        for doc in docs.iter_mut() {
            let replacement = match get_path(doc, &target.path) {
                Some(Value::Array(items)) => Value::Array(
                    items
                        .iter()
                        .filter_map(|id| by_id.get(&id_key(id)).cloned().map(Value::Object))
                        .collect(),
                ),
                Some(Value::Null) | None => continue,
                Some(id) => by_id
                    .get(&id_key(id))
                    .cloned()
                    .map(Value::Object)
                    .unwrap_or(Value::Null),
            };
            set_path(doc, &target.path, replacement)?;
        }
        Ok(())
    }

    pub async fn aggregate(&self, pipeline: &[Document]) -> Result<Vec<Document>, StoreError> {
        self.store.aggregate(&self.collection, pipeline).await
    }
}

/// Non-lean results carry an `id` virtual mirroring `_id`.
fn hydrate(mut doc: Document, lean: bool) -> Document {
    if lean {
        return doc;
    }
    if let Some(id) = doc.get("_id").map(id_key) {
        doc.entry("id").or_insert(Value::String(id));
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::{ModelDefinition, ModelRegistry};
    use crate::shared::store::MemoryStore;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn registry() -> ModelRegistry {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        ModelRegistry::new(
            vec![
                ModelDefinition::new("User").with_required(&["name"]),
                ModelDefinition::new("Tag").without_timestamps(),
                ModelDefinition::new("Post")
                    .with_reference("author", "User")
                    .with_reference("tags", "Tag"),
            ],
            store,
        )
        .unwrap()
    }

    #[test]
    fn test_populate_spec_parsing() {
        let parsed = PopulatePath::parse(&json!(["author tags", {"path": "editor", "select": "name -_id"}]))
            .unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0], PopulatePath::new("author"));
        assert_eq!(parsed[2].select, Some(doc(json!({"name": 1, "_id": 0}))));
        assert!(PopulatePath::parse(&json!(5)).is_err());
    }

    #[tokio::test]
    async fn test_save_applies_timestamps_and_required() {
        let registry = registry();
        let users = registry.model("User").unwrap();
        let saved = users.save(doc(json!({"name": "Ada"}))).await.unwrap();
        assert!(saved["createdAt"].is_i64());
        assert_eq!(saved["createdAt"], saved["updatedAt"]);

        let err = users.save(doc(json!({"email": "x"}))).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));

        let tags = registry.model("Tag").unwrap();
        let tag = tags.save(doc(json!({"label": "rust"}))).await.unwrap();
        assert!(!tag.contains_key("createdAt"));
    }

    #[tokio::test]
    async fn test_find_hydrates_unless_lean() {
        let registry = registry();
        let users = registry.model("User").unwrap();
        users.save(doc(json!({"_id": "u1", "name": "Ada"}))).await.unwrap();

        let hydrated = users
            .find(&Document::new(), None, &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(hydrated[0]["id"], json!("u1"));

        let lean = users
            .find(
                &Document::new(),
                None,
                &QueryOptions {
                    lean: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!lean[0].contains_key("id"));
    }

    #[tokio::test]
    async fn test_populate_replaces_references() {
        let registry = registry();
        let users = registry.model("User").unwrap();
        let tags = registry.model("Tag").unwrap();
        let posts = registry.model("Post").unwrap();

        users
            .save(doc(json!({"_id": "u1", "name": "Ada", "password": "pw"})))
            .await
            .unwrap();
        tags.save(doc(json!({"_id": "t1", "label": "a"}))).await.unwrap();
        tags.save(doc(json!({"_id": "t2", "label": "b"}))).await.unwrap();
        posts
            .save(doc(json!({"title": "Hello", "author": "u1", "tags": ["t2", "missing", "t1"]})))
            .await
            .unwrap();
        posts
            .save(doc(json!({"title": "Orphan", "author": "gone"})))
            .await
            .unwrap();

        let populate = vec![
            PopulatePath {
                path: "author".to_string(),
                select: Some(doc(json!({"name": 1}))),
            },
            PopulatePath::new("tags"),
        ];
        let found = posts
            .find_populated(
                &doc(json!({"title": "Hello"})),
                Some(&doc(json!({"title": 1, "author": 1, "tags": 1}))),
                &populate,
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["author"], json!({"_id": "u1", "name": "Ada"}));
        let labels: Vec<_> = found[0]["tags"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["label"].clone())
            .collect();
        assert_eq!(labels, vec![json!("b"), json!("a")]);

        let orphan = posts
            .find_populated(&doc(json!({"title": "Orphan"})), None, &populate[..1])
            .await
            .unwrap();
        assert!(orphan[0]["author"].is_null());
    }

    #[tokio::test]
    async fn test_populate_unknown_path_is_rejected() {
        let registry = registry();
        let posts = registry.model("Post").unwrap();
        posts.save(doc(json!({"title": "x"}))).await.unwrap();
        let err = posts
            .find_populated(&Document::new(), None, &[PopulatePath::new("title")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidQuery(_)));
    }
}
