use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use utoipa::ToSchema;

use crate::server::rest::error::{ApiError, ApiResult, ErrorDto};
use crate::services::GenericService;
use crate::shared::models::{AppState, PopulatePath, QueryOptions, UpdateOptions};
use crate::shared::store::{projection_from_fields, Document};

pub const RECORDS_TAG: &str = "records";

#[derive(Debug, Deserialize, ToSchema)]
pub struct RecordInput {
    /// Fields of the new record.
    #[schema(value_type = Object)]
    pub data: Document,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateRecordRequest {
    /// Plain fields to set, or an update with `$set`, `$inc`, ... operators.
    #[schema(value_type = Object)]
    pub data: Document,
    #[serde(default)]
    pub upsert: bool,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct QueryRequest {
    #[serde(default)]
    #[schema(value_type = Object)]
    pub criteria: Document,
    /// Inclusion/exclusion object, or a space separated list like `"name -password"`.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub projection: Option<Value>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub sort: Option<Document>,
    #[serde(default)]
    pub skip: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct PopulateRequest {
    #[serde(default)]
    #[schema(value_type = Object)]
    pub criteria: Document,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub projection: Option<Value>,
    /// `"author tags"`, `{"path": "author", "select": "name"}` or an array of both.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub populate: Value,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AggregateRequest {
    #[schema(value_type = Vec<Object>)]
    pub pipeline: Vec<Document>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RecordDto {
    #[schema(value_type = Object)]
    pub record: Document,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RecordListDto {
    pub count: usize,
    #[schema(value_type = Vec<Object>)]
    pub records: Vec<Document>,
}

impl RecordListDto {
    fn new(records: Vec<Document>) -> Self {
        Self {
            count: records.len(),
            records,
        }
    }
}

fn service(state: &AppState, model: &str) -> ApiResult<GenericService> {
    GenericService::new(state.registry.clone(), model)
        .map_err(|_| ApiError::NotFound(format!("Unknown model '{model}'")))
}

fn parse_projection(projection: Option<Value>) -> ApiResult<Option<Document>> {
    match projection {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(fields)) => Ok(Some(projection_from_fields(&fields))),
        Some(Value::Object(fields)) => Ok(Some(fields)),
        Some(_) => Err(ApiError::BadRequest(
            "projection must be an object or a string".to_string(),
        )),
    }
}

fn id_criteria(id: &str) -> Document {
    let mut criteria = Document::new();
    criteria.insert("_id".to_string(), json!(id));
    criteria
}

/// List every record of a model.
#[utoipa::path(
    get,
    path = "/api/v1/records/{model}",
    tag = RECORDS_TAG,
    params(("model" = String, Path, description = "Registered model name")),
    responses(
        (status = 200, description = "All records", body = RecordListDto),
        (status = 404, description = "Unknown model", body = ErrorDto),
        (status = 500, description = "Store error", body = ErrorDto)
    ),
)]
pub async fn list_records(
    State(state): State<Arc<AppState>>,
    Path(model): Path<String>,
) -> ApiResult<Json<RecordListDto>> {
    let service = service(&state, &model)?;
    let records = service
        .get_record(&Document::new(), None, QueryOptions::default())
        .await?;
    Ok(Json(RecordListDto::new(records)))
}

/// Create a record.
#[utoipa::path(
    post,
    path = "/api/v1/records/{model}",
    tag = RECORDS_TAG,
    params(("model" = String, Path, description = "Registered model name")),
    request_body = RecordInput,
    responses(
        (status = 201, description = "Created record", body = RecordDto),
        (status = 400, description = "Validation failed", body = ErrorDto),
        (status = 404, description = "Unknown model", body = ErrorDto),
        (status = 409, description = "Duplicate key", body = ErrorDto)
    ),
)]
pub async fn create_record(
    State(state): State<Arc<AppState>>,
    Path(model): Path<String>,
    Json(input): Json<RecordInput>,
) -> ApiResult<(StatusCode, Json<RecordDto>)> {
    let service = service(&state, &model)?;
    let record = service.create_record(input.data).await?;
    Ok((StatusCode::CREATED, Json(RecordDto { record })))
}

/// Find records matching criteria, with projection, sort, skip and limit.
#[utoipa::path(
    post,
    path = "/api/v1/records/{model}/query",
    tag = RECORDS_TAG,
    params(("model" = String, Path, description = "Registered model name")),
    request_body = QueryRequest,
    responses(
        (status = 200, description = "Matching records", body = RecordListDto),
        (status = 400, description = "Invalid query", body = ErrorDto),
        (status = 404, description = "Unknown model", body = ErrorDto)
    ),
)]
pub async fn query_records(
    State(state): State<Arc<AppState>>,
    Path(model): Path<String>,
    Json(request): Json<QueryRequest>,
) -> ApiResult<Json<RecordListDto>> {
    let service = service(&state, &model)?;
    let projection = parse_projection(request.projection)?;
    let options = QueryOptions {
        lean: true,
        sort: request.sort,
        skip: request.skip,
        limit: request.limit,
    };
    let records = service
        .get_record(&request.criteria, projection.as_ref(), options)
        .await?;
    Ok(Json(RecordListDto::new(records)))
}

/// Find records and expand their references.
#[utoipa::path(
    post,
    path = "/api/v1/records/{model}/populate",
    tag = RECORDS_TAG,
    params(("model" = String, Path, description = "Registered model name")),
    request_body = PopulateRequest,
    responses(
        (status = 200, description = "Populated records", body = RecordListDto),
        (status = 400, description = "Invalid query or populate path", body = ErrorDto),
        (status = 404, description = "Unknown model", body = ErrorDto)
    ),
)]
pub async fn populate_records(
    State(state): State<Arc<AppState>>,
    Path(model): Path<String>,
    Json(request): Json<PopulateRequest>,
) -> ApiResult<Json<RecordListDto>> {
    let service = service(&state, &model)?;
    let projection = parse_projection(request.projection)?;
    let populate = PopulatePath::parse(&request.populate)?;
    let records = service
        .get_populated_records(&request.criteria, projection.as_ref(), &populate)
        .await?;
    Ok(Json(RecordListDto::new(records)))
}

/// Run an aggregation pipeline over a model's collection.
#[utoipa::path(
    post,
    path = "/api/v1/records/{model}/aggregate",
    tag = RECORDS_TAG,
    params(("model" = String, Path, description = "Registered model name")),
    request_body = AggregateRequest,
    responses(
        (status = 200, description = "Pipeline output", body = RecordListDto),
        (status = 400, description = "Invalid pipeline", body = ErrorDto),
        (status = 404, description = "Unknown model", body = ErrorDto)
    ),
)]
pub async fn aggregate_records(
    State(state): State<Arc<AppState>>,
    Path(model): Path<String>,
    Json(request): Json<AggregateRequest>,
) -> ApiResult<Json<RecordListDto>> {
    let service = service(&state, &model)?;
    let records = service.aggregate(&request.pipeline).await?;
    Ok(Json(RecordListDto::new(records)))
}

/// Update a record by id and return it as stored after the update.
#[utoipa::path(
    patch,
    path = "/api/v1/records/{model}/{id}",
    tag = RECORDS_TAG,
    params(
        ("model" = String, Path, description = "Registered model name"),
        ("id" = String, Path, description = "Record id")
    ),
    request_body = UpdateRecordRequest,
    responses(
        (status = 200, description = "Updated record", body = RecordDto),
        (status = 400, description = "Invalid update", body = ErrorDto),
        (status = 404, description = "Unknown model or record", body = ErrorDto)
    ),
)]
pub async fn update_record(
    State(state): State<Arc<AppState>>,
    Path((model, id)): Path<(String, String)>,
    Json(request): Json<UpdateRecordRequest>,
) -> ApiResult<Json<RecordDto>> {
    let service = service(&state, &model)?;
    let options = UpdateOptions {
        upsert: request.upsert,
        ..Default::default()
    };
    let record = service
        .update_record(&id_criteria(&id), request.data, options)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("{model} '{id}' not found")))?;
    Ok(Json(RecordDto { record }))
}

/// Delete a record by id and return what was removed.
#[utoipa::path(
    delete,
    path = "/api/v1/records/{model}/{id}",
    tag = RECORDS_TAG,
    params(
        ("model" = String, Path, description = "Registered model name"),
        ("id" = String, Path, description = "Record id")
    ),
    responses(
        (status = 200, description = "Removed record", body = RecordDto),
        (status = 404, description = "Unknown model or record", body = ErrorDto)
    ),
)]
pub async fn delete_record(
    State(state): State<Arc<AppState>>,
    Path((model, id)): Path<(String, String)>,
) -> ApiResult<Json<RecordDto>> {
    let service = service(&state, &model)?;
    let record = service
        .delete_record(&id_criteria(&id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("{model} '{id}' not found")))?;
    Ok(Json(RecordDto { record }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_projection_forms() {
        assert_eq!(parse_projection(None).unwrap(), None);
        assert_eq!(
            parse_projection(Some(json!("name -secret"))).unwrap(),
            Some(projection_from_fields("name -secret"))
        );
        assert_eq!(
            parse_projection(Some(json!({"name": 1}))).unwrap(),
            json!({"name": 1}).as_object().cloned()
        );
        assert!(matches!(
            parse_projection(Some(json!(3))),
            Err(ApiError::BadRequest(_))
        ));
    }
}
