use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::shared::errors::ApiError;
use crate::shared::state::AppState;
use crate::shared::utils::clamp_paging;
use crate::shared::TenantContext;

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route("/documents/upload", post(upload_document))
        .route("/documents", get(list_documents))
        .route("/documents/search", post(search_documents))
        .route(
            "/documents/:id",
            get(get_document).delete(delete_document),
        )
        .route("/documents/:id/chunks", get(list_chunks))
}

async fn upload_document(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut filename = None;
    let mut bytes = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(format!("invalid multipart body: {}", e)))?
    {
        if field.name() == Some("file") {
            filename = field.file_name().map(|s| s.to_string());
            bytes = Some(
                field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::Validation(format!("failed to read upload: {}", e)))?
                    .to_vec(),
            );
        }
    }

    let filename =
        filename.ok_or_else(|| ApiError::Validation("missing 'file' field".to_string()))?;
    let bytes = bytes.unwrap_or_default();

    let document = super::ingest(state, &ctx, filename, bytes).await?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "document_id": document.id,
            "filename": document.filename,
            "file_size": document.file_size,
            "status": document.status,
            "message": "Document uploaded, processing scheduled",
        })),
    ))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    skip: Option<i64>,
    limit: Option<i64>,
    status_filter: Option<String>,
}

async fn list_documents(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Query(params): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let (skip, limit) = clamp_paging(params.skip, params.limit, 100);
    let page = super::list_documents(&state, &ctx, skip, limit, params.status_filter).await?;
    Ok(Json(page))
}

async fn get_document(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let document = super::get_document(&state, &ctx, id).await?;
    Ok(Json(document))
}

async fn delete_document(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    super::delete_document(&state, &ctx, id).await?;
    Ok(Json(serde_json::json!({ "message": "Document deleted" })))
}

async fn list_chunks(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let chunks = super::list_chunks(&state, &ctx, id).await?;
    Ok(Json(serde_json::json!({
        "document_id": id,
        "total_chunks": chunks.len(),
        "chunks": chunks,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SearchFilter {
    document_ids: Option<Vec<Uuid>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SearchRequest {
    query: String,
    limit: Option<usize>,
    score_threshold: Option<f32>,
    filter_metadata: Option<SearchFilter>,
}

async fn search_documents(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Json(request): Json<SearchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = super::search(
        &state,
        &ctx,
        &request.query,
        request.limit.unwrap_or(10).min(100),
        request.score_threshold.unwrap_or(0.5),
        request.filter_metadata.and_then(|f| f.document_ids),
    )
    .await?;
    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_request_rejects_unknown_fields() {
        let result: Result<SearchRequest, _> =
            serde_json::from_str(r#"{"query":"x","surprise":true}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_search_request_defaults() {
        let request: SearchRequest = serde_json::from_str(r#"{"query":"capital"}"#).unwrap();
        assert_eq!(request.query, "capital");
        assert!(request.limit.is_none());
        assert!(request.filter_metadata.is_none());
    }
}
