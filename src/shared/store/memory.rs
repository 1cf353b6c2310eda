use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::aggregate::{lookup_collections, run_pipeline};
use super::update::{apply_update, normalize_update};
use super::{
    ensure_id, finish_find, first_match, id_key, project_all, query, upsert_document,
    validate_collection_name, Document, DocumentStore, FindOneAndUpdateOptions, FindOptions,
    StoreError,
};

/// In-process document store. Every find-and-modify runs under the write
/// lock, so it is atomic with respect to other callers.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn ensure_collection(&self, collection: &str) -> Result<(), StoreError> {
        validate_collection_name(collection)?;
        let mut collections = self.collections.write().await;
        collections.entry(collection.to_string()).or_default();
        Ok(())
    }

    async fn insert_one(&self, collection: &str, mut doc: Document) -> Result<Document, StoreError> {
        validate_collection_name(collection)?;
        let id = ensure_id(&mut doc);
        let key = id_key(&id);

        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_string()).or_default();
        if docs
            .iter()
            .any(|existing| existing.get("_id").map(id_key).as_deref() == Some(key.as_str()))
        {
            return Err(StoreError::Duplicate(format!(
                "duplicate _id '{key}' in collection '{collection}'"
            )));
        }
        docs.push(doc.clone());
        Ok(doc)
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Document,
        options: &FindOptions,
    ) -> Result<Vec<Document>, StoreError> {
        validate_collection_name(collection)?;
        let collections = self.collections.read().await;
        let mut hits = Vec::new();
        if let Some(docs) = collections.get(collection) {
            for doc in docs {
                if query::matches(doc, filter)? {
                    hits.push(doc.clone());
                }
            }
        }
        drop(collections);
        finish_find(hits, options)
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        options: &FindOneAndUpdateOptions,
    ) -> Result<Option<Document>, StoreError> {
        validate_collection_name(collection)?;
        let update = normalize_update(update)?;

        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_string()).or_default();

        let result = match first_match(docs.iter(), filter, options.sort.as_ref())? {
            Some(index) => {
                let before = docs[index].clone();
                let mut after = before.clone();
                apply_update(&mut after, &update, false)?;
                docs[index] = after.clone();
                Some(if options.return_new { after } else { before })
            }
            None if options.upsert => {
                let inserted = upsert_document(filter, &update)?;
                let key = inserted.get("_id").map(id_key);
                if docs
                    .iter()
                    .any(|existing| existing.get("_id").map(id_key) == key)
                {
                    return Err(StoreError::Duplicate(format!(
                        "duplicate _id in collection '{collection}'"
                    )));
                }
                docs.push(inserted.clone());
                options.return_new.then_some(inserted)
            }
            None => None,
        };
        drop(collections);

        match result {
            Some(doc) => Ok(project_all(vec![doc], options.projection.as_ref())?.pop()),
            None => Ok(None),
        }
    }

    async fn find_one_and_delete(
        &self,
        collection: &str,
        filter: &Document,
    ) -> Result<Option<Document>, StoreError> {
        validate_collection_name(collection)?;
        let mut collections = self.collections.write().await;
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(None);
        };
        match first_match(docs.iter(), filter, None)? {
            Some(index) => Ok(Some(docs.remove(index))),
            None => Ok(None),
        }
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: &[Document],
    ) -> Result<Vec<Document>, StoreError> {
        validate_collection_name(collection)?;
        let collections = self.collections.read().await;
        let docs = collections.get(collection).cloned().unwrap_or_default();

        let mut foreign = HashMap::new();
        for name in lookup_collections(pipeline) {
            validate_collection_name(&name)?;
            let contents = collections.get(&name).cloned().unwrap_or_default();
            foreign.insert(name, contents);
        }
        drop(collections);

        run_pipeline(docs, pipeline, &foreign)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_insert_assigns_id_and_rejects_duplicates() {
        let store = MemoryStore::new();
        let saved = store.insert_one("users", doc(json!({"name": "x"}))).await.unwrap();
        assert!(saved["_id"].is_string());

        let again = store
            .insert_one("users", doc(json!({"_id": saved["_id"].clone()})))
            .await
            .unwrap_err();
        assert!(matches!(again, StoreError::Duplicate(_)));
    }

    #[tokio::test]
    async fn test_find_one_and_update_returns_old_or_new() {
        let store = MemoryStore::new();
        store
            .insert_one("items", doc(json!({"_id": "a", "qty": 1})))
            .await
            .unwrap();

        let filter = doc(json!({"_id": "a"}));
        let update = doc(json!({"$inc": {"qty": 1}}));
        let old = store
            .find_one_and_update("items", &filter, &update, &FindOneAndUpdateOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(old["qty"], json!(1));

        let options = FindOneAndUpdateOptions {
            return_new: true,
            ..Default::default()
        };
        let new = store
            .find_one_and_update("items", &filter, &update, &options)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(new["qty"], json!(3));
    }

    #[tokio::test]
    async fn test_upsert_inserts_when_missing() {
        let store = MemoryStore::new();
        let options = FindOneAndUpdateOptions {
            return_new: true,
            upsert: true,
            ..Default::default()
        };
        let created = store
            .find_one_and_update(
                "settings",
                &doc(json!({"key": "theme"})),
                &doc(json!({"value": "dark"})),
                &options,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(created["key"], json!("theme"));
        assert_eq!(created["value"], json!("dark"));

        let all = store
            .find("settings", &Document::new(), &FindOptions::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_returns_none() {
        let store = MemoryStore::new();
        let removed = store
            .find_one_and_delete("users", &doc(json!({"_id": "nope"})))
            .await
            .unwrap();
        assert!(removed.is_none());
    }

    #[tokio::test]
    async fn test_find_with_sort_skip_limit_projection() {
        let store = MemoryStore::new();
        for n in 1..=5 {
            store
                .insert_one("nums", doc(json!({"n": n, "secret": true})))
                .await
                .unwrap();
        }
        let options = FindOptions {
            projection: Some(doc(json!({"n": 1, "_id": 0}))),
            sort: Some(doc(json!({"n": -1}))),
            skip: Some(1),
            limit: Some(2),
        };
        let found = store
            .find("nums", &doc(json!({"n": {"$gte": 2}})), &options)
            .await
            .unwrap();
        assert_eq!(
            found.into_iter().map(Value::Object).collect::<Vec<_>>(),
            vec![json!({"n": 4}), json!({"n": 3})]
        );
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_atomic() {
        let store = std::sync::Arc::new(MemoryStore::new());
        store
            .insert_one("counters", doc(json!({"_id": "c", "v": 0})))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .find_one_and_update(
                        "counters",
                        &doc(json!({"_id": "c"})),
                        &doc(json!({"$inc": {"v": 1}})),
                        &FindOneAndUpdateOptions::default(),
                    )
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let found = store
            .find("counters", &Document::new(), &FindOptions::default())
            .await
            .unwrap();
        assert_eq!(found[0]["v"], json!(20));
    }
}
