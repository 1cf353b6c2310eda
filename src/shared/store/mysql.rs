use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde_json::Value;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::types::Json;
use sqlx::{query, MySql, Pool, Row};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::aggregate::{lookup_collections, run_pipeline};
use super::update::{apply_update, normalize_update};
use super::{
    ensure_id, finish_find, first_match, id_key, project_all, query as doc_query,
    upsert_document, validate_collection_name, Document, DocumentStore,
    FindOneAndUpdateOptions, FindOptions, StoreError,
};

/// Document store on MySQL: one table per collection, each row holding a
/// JSON document. Queries are evaluated by the shared document engine;
/// find-and-modify locks the collection rows inside a transaction.
pub struct MySqlStore {
    pool: Pool<MySql>,
    known_tables: RwLock<HashSet<String>>,
}

impl MySqlStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: Pool<MySql>) -> Self {
        Self {
            pool,
            known_tables: RwLock::new(HashSet::new()),
        }
    }

    async fn ensure_table(&self, collection: &str) -> Result<(), StoreError> {
        validate_collection_name(collection)?;
        if self.known_tables.read().await.contains(collection) {
            return Ok(());
        }

        query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS `{collection}` (
                seq BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
                doc_id VARCHAR(191) NOT NULL,
                doc JSON NOT NULL,
                created_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3),
                updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3),
                UNIQUE KEY uq_{collection}_doc_id (doc_id)
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        debug!("Ensured collection table {}", collection);
        self.known_tables
            .write()
            .await
            .insert(collection.to_string());
        Ok(())
    }

    async fn load_all(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        self.ensure_table(collection).await?;
        let rows = query(&format!("SELECT doc FROM `{collection}` ORDER BY seq"))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(|row| decode_doc(&row)).collect()
    }
}

fn decode_doc(row: &sqlx::mysql::MySqlRow) -> Result<Document, StoreError> {
    let Json(value): Json<Value> = row.try_get("doc")?;
    match value {
        Value::Object(doc) => Ok(doc),
        other => Err(StoreError::Internal(format!(
            "stored document is not an object: {other}"
        ))),
    }
}

#[async_trait]
impl DocumentStore for MySqlStore {
    fn backend(&self) -> &'static str {
        "mysql"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn ensure_collection(&self, collection: &str) -> Result<(), StoreError> {
        self.ensure_table(collection).await
    }

    async fn insert_one(&self, collection: &str, mut doc: Document) -> Result<Document, StoreError> {
        self.ensure_table(collection).await?;
        let id = ensure_id(&mut doc);

        query(&format!(
            "INSERT INTO `{collection}` (doc_id, doc) VALUES (?, ?)"
        ))
        .bind(id_key(&id))
        .bind(Json(Value::Object(doc.clone())))
        .execute(&self.pool)
        .await?;

        Ok(doc)
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Document,
        options: &FindOptions,
    ) -> Result<Vec<Document>, StoreError> {
        let docs = self.load_all(collection).await?;
        let mut hits = Vec::new();
        for doc in docs {
            if doc_query::matches(&doc, filter)? {
                hits.push(doc);
            }
        }
        finish_find(hits, options)
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        options: &FindOneAndUpdateOptions,
    ) -> Result<Option<Document>, StoreError> {
        self.ensure_table(collection).await?;
        let update = normalize_update(update)?;

        let mut tx = self.pool.begin().await?;
        let rows = query(&format!(
            "SELECT seq, doc FROM `{collection}` ORDER BY seq FOR UPDATE"
        ))
        .fetch_all(&mut *tx)
        .await?;

        let mut seqs = Vec::with_capacity(rows.len());
        let mut docs = Vec::with_capacity(rows.len());
        for row in &rows {
            seqs.push(row.try_get::<i64, _>("seq")?);
            docs.push(decode_doc(row)?);
        }

        let result = match first_match(docs.iter(), filter, options.sort.as_ref())? {
            Some(index) => {
                let before = docs[index].clone();
                let mut after = before.clone();
                apply_update(&mut after, &update, false)?;
                query(&format!("UPDATE `{collection}` SET doc = ? WHERE seq = ?"))
                    .bind(Json(Value::Object(after.clone())))
                    .bind(seqs[index])
                    .execute(&mut *tx)
                    .await?;
                Some(if options.return_new { after } else { before })
            }
            None if options.upsert => {
                let inserted = upsert_document(filter, &update)?;
                let key = inserted.get("_id").map(id_key).unwrap_or_default();
                query(&format!(
                    "INSERT INTO `{collection}` (doc_id, doc) VALUES (?, ?)"
                ))
                .bind(key)
                .bind(Json(Value::Object(inserted.clone())))
                .execute(&mut *tx)
                .await?;
                options.return_new.then_some(inserted)
            }
            None => None,
        };

        tx.commit().await?;

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
        self.ensure_table(collection).await?;

        let mut tx = self.pool.begin().await?;
        let rows = query(&format!(
            "SELECT seq, doc FROM `{collection}` ORDER BY seq FOR UPDATE"
        ))
        .fetch_all(&mut *tx)
        .await?;

        let mut removed = None;
        for row in &rows {
            let doc = decode_doc(row)?;
            if doc_query::matches(&doc, filter)? {
                let seq: i64 = row.try_get("seq")?;
                query(&format!("DELETE FROM `{collection}` WHERE seq = ?"))
                    .bind(seq)
                    .execute(&mut *tx)
                    .await?;
                removed = Some(doc);
                break;
            }
        }

        tx.commit().await?;
        Ok(removed)
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: &[Document],
    ) -> Result<Vec<Document>, StoreError> {
        let docs = self.load_all(collection).await?;

        let mut foreign = HashMap::new();
        for name in lookup_collections(pipeline) {
            let contents = self.load_all(&name).await?;
            foreign.insert(name, contents);
        }

        info!(
            collection = %collection,
            stages = pipeline.len(),
            "Running aggregation pipeline"
        );
        run_pipeline(docs, pipeline, &foreign)
    }
}
