use std::future::Future;
use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::error;

use crate::shared::models::{Model, ModelRegistry, PopulatePath, QueryOptions, UpdateOptions};
use crate::shared::store::{now_millis, Document, StoreError};

const UPDATED_AT: &str = "updatedAt";

#[derive(Error, Debug, PartialEq)]
pub enum ServiceError {
    #[error("Invalid model name '{0}'. Terminating app...")]
    InvalidModel(String),
}

/// Uniform record access for one registered model.
///
/// Every operation forwards to a single call on the model's collection and
/// hands back the store's error untouched.
#[derive(Clone)]
pub struct GenericService {
    model_name: String,
    model: Model,
}

impl GenericService {
    /// Bind a service to `model_name`. Fails before any I/O when the name is
    /// empty or not registered.
    pub fn new(registry: Arc<ModelRegistry>, model_name: &str) -> Result<Self, ServiceError> {
        let model = match lookup_model(&registry, model_name) {
            Some(model) => model.clone(),
            None => {
                error!("Invalid model name {}", model_name);
                return Err(ServiceError::InvalidModel(model_name.to_string()));
            }
        };

        Ok(Self {
            model_name: model_name.to_string(),
            model,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Update the first record matching `criteria` and return it as it is
    /// after the update, or `None` when nothing matched.
    ///
    /// `updatedAt` is stamped with the current time, and the lean and
    /// return-new options are always on whatever the caller passed.
    pub async fn update_record(
        &self,
        criteria: &Document,
        mut data: Document,
        mut options: UpdateOptions,
    ) -> Result<Option<Document>, StoreError> {
        stamp_updated_at(&mut data);
        options.lean = true;
        options.return_new = true;
        self.model
            .find_one_and_update(criteria, data, &options)
            .await
    }

    pub async fn create_record(&self, data: Document) -> Result<Document, StoreError> {
        self.model.save(data).await
    }

    /// Hard delete the first matching record.
    pub async fn delete_record(&self, criteria: &Document) -> Result<Option<Document>, StoreError> {
        self.model.find_one_and_remove(criteria).await
    }

    pub async fn get_record(
        &self,
        criteria: &Document,
        projection: Option<&Document>,
        mut options: QueryOptions,
    ) -> Result<Vec<Document>, StoreError> {
        options.lean = true;
        self.model.find(criteria, projection, &options).await
    }

    pub async fn get_populated_records(
        &self,
        criteria: &Document,
        projection: Option<&Document>,
        populate: &[PopulatePath],
    ) -> Result<Vec<Document>, StoreError> {
        self.model
            .find_populated(criteria, projection, populate)
            .await
    }

    pub async fn aggregate(&self, pipeline: &[Document]) -> Result<Vec<Document>, StoreError> {
        self.model.aggregate(pipeline).await
    }

    /// Same as [`get_record`](Self::get_record), but returns an owned future
    /// that does not borrow the service and can be spawned or stored.
    pub fn get_record_deferred(
        &self,
        criteria: Document,
        projection: Option<Document>,
        mut options: QueryOptions,
    ) -> impl Future<Output = Result<Vec<Document>, StoreError>> + Send + 'static {
        options.lean = true;
        let model = self.model.clone();
        async move { model.find(&criteria, projection.as_ref(), &options).await }
    }
}

/// Route the `updatedAt` stamp through `$set` so no other operator in the
/// caller's update can override or remove it.
fn stamp_updated_at(data: &mut Document) {
    data.remove(UPDATED_AT);
    for (key, value) in data.iter_mut() {
        if key.starts_with('$') && key != "$set" {
            if let Value::Object(fields) = value {
                fields.remove(UPDATED_AT);
            }
        }
    }

    let stamp = json!(now_millis());
    match data.get_mut("$set") {
        Some(Value::Object(set)) => {
            set.insert(UPDATED_AT.to_string(), stamp);
        }
        // a malformed `$set` is left for the store to reject
        Some(_) => {}
        None => {
            let mut set = Document::new();
            set.insert(UPDATED_AT.to_string(), stamp);
            data.insert("$set".to_string(), Value::Object(set));
        }
    }
}

fn lookup_model<'a>(registry: &'a ModelRegistry, model_name: &str) -> Option<&'a Model> {
    if model_name.is_empty() {
        return None;
    }
    registry.model(model_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::ModelDefinition;
    use crate::shared::store::{DocumentStore, MemoryStore};

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn registry() -> Arc<ModelRegistry> {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        Arc::new(
            ModelRegistry::new(
                vec![
                    ModelDefinition::new("User"),
                    ModelDefinition::new("Order").with_reference("user", "User"),
                ],
                store,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_invalid_model_names_fail_construction() {
        let registry = registry();
        for name in ["", "Unknown", "user", " User"] {
            let err = GenericService::new(registry.clone(), name).err();
            assert_eq!(err, Some(ServiceError::InvalidModel(name.to_string())));
        }
        assert!(GenericService::new(registry, "User").is_ok());
    }

    #[tokio::test]
    async fn test_create_record_on_empty_collection() {
        let service = GenericService::new(registry(), "User").unwrap();
        let saved = service.create_record(doc(json!({"name": "x"}))).await.unwrap();
        assert_eq!(saved["name"], json!("x"));
        assert!(saved.contains_key("_id"));
    }

    #[tokio::test]
    async fn test_update_record_stamps_and_forces_options() {
        let service = GenericService::new(registry(), "User").unwrap();
        let saved = service
            .create_record(doc(json!({"name": "x", "visits": 1})))
            .await
            .unwrap();

        let before = now_millis();
        let caller_options = UpdateOptions {
            lean: false,
            return_new: false,
            ..Default::default()
        };
        let updated = service
            .update_record(
                &doc(json!({"_id": saved["_id"].clone()})),
                doc(json!({"$inc": {"visits": 1}})),
                caller_options.clone(),
            )
            .await
            .unwrap()
            .unwrap();

        // post-update document, lean (no `id` virtual)
        assert_eq!(updated["visits"], json!(2));
        assert!(!updated.contains_key("id"));
        assert!(updated["updatedAt"].as_i64().unwrap() >= before);
        // the caller's options are left alone
        assert!(!caller_options.lean);
        assert!(!caller_options.return_new);
    }

    #[tokio::test]
    async fn test_update_record_stamp_wins_over_caller_updated_at() {
        let service = GenericService::new(registry(), "User").unwrap();
        let saved = service
            .create_record(doc(json!({"name": "x", "updatedAt": 5})))
            .await
            .unwrap();
        let criteria = doc(json!({"_id": saved["_id"].clone()}));

        let before = now_millis();
        for data in [
            json!({"$set": {"updatedAt": 0, "name": "y"}}),
            json!({"$set": {"name": "z"}, "$unset": {"updatedAt": ""}}),
            json!({"updatedAt": 0, "$inc": {"updatedAt": -1_000_000}}),
        ] {
            let updated = service
                .update_record(&criteria, doc(data), UpdateOptions::default())
                .await
                .unwrap()
                .unwrap();
            assert!(updated["updatedAt"].as_i64().unwrap() >= before);
        }

        let found = service
            .get_record(&criteria, None, QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(found[0]["name"], json!("z"));
    }

    #[test]
    fn test_malformed_set_is_left_for_the_store() {
        let mut data = doc(json!({"$set": 1}));
        stamp_updated_at(&mut data);
        assert_eq!(Value::Object(data), json!({"$set": 1}));
    }

    #[tokio::test]
    async fn test_update_record_without_match_returns_none() {
        let service = GenericService::new(registry(), "User").unwrap();
        let updated = service
            .update_record(
                &doc(json!({"_id": "missing"})),
                doc(json!({"name": "y"})),
                UpdateOptions::default(),
            )
            .await
            .unwrap();
        assert!(updated.is_none());
    }

    #[tokio::test]
    async fn test_delete_missing_record_yields_none() {
        let service = GenericService::new(registry(), "User").unwrap();
        service.create_record(doc(json!({"name": "x"}))).await.unwrap();
        let removed = service
            .delete_record(&doc(json!({"_id": "missingId"})))
            .await
            .unwrap();
        assert!(removed.is_none());
    }

    #[tokio::test]
    async fn test_delete_removes_first_match() {
        let service = GenericService::new(registry(), "User").unwrap();
        service.create_record(doc(json!({"_id": "a", "role": "admin"}))).await.unwrap();
        service.create_record(doc(json!({"_id": "b", "role": "admin"}))).await.unwrap();

        let removed = service
            .delete_record(&doc(json!({"role": "admin"})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(removed["_id"], json!("a"));

        let left = service
            .get_record(&Document::new(), None, QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(left.len(), 1);
    }

    #[tokio::test]
    async fn test_get_record_forces_lean() {
        let service = GenericService::new(registry(), "User").unwrap();
        service.create_record(doc(json!({"name": "x"}))).await.unwrap();
        let found = service
            .get_record(
                &doc(json!({"name": "x"})),
                Some(&doc(json!({"name": 1}))),
                QueryOptions {
                    lean: false,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(!found[0].contains_key("id"));
        assert_eq!(found[0].len(), 2);
    }

    #[tokio::test]
    async fn test_get_record_deferred_resolves_and_rejects() {
        let service = GenericService::new(registry(), "User").unwrap();
        service.create_record(doc(json!({"name": "x"}))).await.unwrap();

        let pending = service.get_record_deferred(
            Document::new(),
            None,
            QueryOptions {
                lean: false,
                ..Default::default()
            },
        );
        let found = tokio::spawn(pending).await.unwrap().unwrap();
        assert_eq!(found.len(), 1);
        assert!(!found[0].contains_key("id"));

        let err = service
            .get_record_deferred(doc(json!({"name": {"$bogus": 1}})), None, QueryOptions::default())
            .await
            .unwrap_err();
        match err {
            StoreError::InvalidQuery(message) => {
                assert_eq!(message, "unknown query operator: $bogus")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_populated_records_and_aggregate() {
        let registry = registry();
        let users = GenericService::new(registry.clone(), "User").unwrap();
        let orders = GenericService::new(registry, "Order").unwrap();

        users.create_record(doc(json!({"_id": "u1", "name": "Ada"}))).await.unwrap();
        orders.create_record(doc(json!({"user": "u1", "total": 10}))).await.unwrap();
        orders.create_record(doc(json!({"user": "u1", "total": 5}))).await.unwrap();

        let populated = orders
            .get_populated_records(
                &Document::new(),
                Some(&doc(json!({"user": 1, "total": 1}))),
                &[PopulatePath::new("user")],
            )
            .await
            .unwrap();
        assert_eq!(populated.len(), 2);
        assert_eq!(populated[0]["user"]["name"], json!("Ada"));

        let totals = orders
            .aggregate(&[
                doc(json!({"$group": {"_id": "$user", "sum": {"$sum": "$total"}}})),
            ])
            .await
            .unwrap();
        assert_eq!(Value::Object(totals[0].clone()), json!({"_id": "u1", "sum": 15}));
    }
}
