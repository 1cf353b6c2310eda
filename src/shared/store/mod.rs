use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use uuid::Uuid;

pub mod aggregate;
pub mod memory;
pub mod mysql;
pub mod projection;
pub mod query;
pub mod update;

pub use crate::shared::models::StoreError;
pub use memory::MemoryStore;
pub use mysql::MySqlStore;
pub use projection::{projection_from_fields, Projection};

/// A stored record: a plain JSON object.
pub type Document = Map<String, Value>;

static COLLECTION_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid collection regex"));

/// Options understood by [`DocumentStore::find`].
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub projection: Option<Document>,
    pub sort: Option<Document>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

/// Options understood by [`DocumentStore::find_one_and_update`].
#[derive(Debug, Clone, Default)]
pub struct FindOneAndUpdateOptions {
    /// Return the document as it is after the update instead of before.
    pub return_new: bool,
    /// Insert a document built from the filter when nothing matches.
    pub upsert: bool,
    pub sort: Option<Document>,
    pub projection: Option<Document>,
}

/// Storage backend for schemaless documents grouped into named collections.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    async fn ping(&self) -> Result<(), StoreError>;

    async fn ensure_collection(&self, collection: &str) -> Result<(), StoreError>;

    async fn insert_one(&self, collection: &str, doc: Document) -> Result<Document, StoreError>;

    async fn find(
        &self,
        collection: &str,
        filter: &Document,
        options: &FindOptions,
    ) -> Result<Vec<Document>, StoreError>;

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        options: &FindOneAndUpdateOptions,
    ) -> Result<Option<Document>, StoreError>;

    async fn find_one_and_delete(
        &self,
        collection: &str,
        filter: &Document,
    ) -> Result<Option<Document>, StoreError>;

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: &[Document],
    ) -> Result<Vec<Document>, StoreError>;
}

pub fn validate_collection_name(name: &str) -> Result<(), StoreError> {
    if COLLECTION_NAME.is_match(name) {
        Ok(())
    } else {
        Err(StoreError::InvalidCollection(name.to_string()))
    }
}

/// Fresh identifier for a new document.
pub fn new_object_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Canonical string form of an `_id`, used for uniqueness checks.
pub fn id_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Current time as epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// JSON number that stays integral when the value has no fractional part.
pub fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}

/// Make sure a document has an `_id`, generating one when missing.
pub fn ensure_id(doc: &mut Document) -> Value {
    match doc.get("_id") {
        Some(id) if !id.is_null() => id.clone(),
        _ => {
            let id = Value::String(new_object_id());
            doc.insert("_id".to_string(), id.clone());
            id
        }
    }
}

/// Index of the first document matching `filter`, honouring `sort`.
pub(crate) fn first_match<'a, I>(
    docs: I,
    filter: &Document,
    sort: Option<&Document>,
) -> Result<Option<usize>, StoreError>
where
    I: IntoIterator<Item = &'a Document>,
{
    let mut hits: Vec<(usize, Document)> = Vec::new();
    for (index, doc) in docs.into_iter().enumerate() {
        if query::matches(doc, filter)? {
            if sort.is_none() {
                return Ok(Some(index));
            }
            let mut keyed = doc.clone();
            keyed.insert("__position".to_string(), Value::from(index as u64));
            hits.push((index, keyed));
        }
    }
    let Some(sort) = sort else {
        return Ok(None);
    };
    let mut ordered: Vec<Document> = hits.into_iter().map(|(_, doc)| doc).collect();
    query::sort_documents(&mut ordered, sort)?;
    Ok(ordered
        .first()
        .and_then(|doc| doc.get("__position"))
        .and_then(Value::as_u64)
        .map(|p| p as usize))
}

/// Apply sort, skip, limit and projection to a filtered result set.
pub(crate) fn finish_find(
    mut docs: Vec<Document>,
    options: &FindOptions,
) -> Result<Vec<Document>, StoreError> {
    if let Some(sort) = &options.sort {
        query::sort_documents(&mut docs, sort)?;
    }
    let skip = options.skip.unwrap_or(0);
    let docs: Vec<Document> = match options.limit {
        Some(limit) if limit > 0 => docs.into_iter().skip(skip).take(limit).collect(),
        _ => docs.into_iter().skip(skip).collect(),
    };
    project_all(docs, options.projection.as_ref())
}

pub(crate) fn project_all(
    docs: Vec<Document>,
    projection: Option<&Document>,
) -> Result<Vec<Document>, StoreError> {
    match projection.map(Projection::parse).transpose()?.flatten() {
        Some(projection) => Ok(docs.iter().map(|doc| projection.apply(doc)).collect()),
        None => Ok(docs),
    }
}

/// Build the document inserted by an upsert: equality fields of the filter,
/// then the update applied in insert mode.
pub(crate) fn upsert_document(filter: &Document, update: &Document) -> Result<Document, StoreError> {
    let mut doc = Map::new();
    for (key, value) in filter {
        if key.starts_with('$') || query::is_operator_object(value) {
            continue;
        }
        query::set_path(&mut doc, key, value.clone())?;
    }
    update::apply_update(&mut doc, update, true)?;
    ensure_id(&mut doc);
    Ok(doc)
}
