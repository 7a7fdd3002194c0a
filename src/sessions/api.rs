use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, put};
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::shared::errors::ApiError;
use crate::shared::models::SessionMode;
use crate::shared::state::AppState;
use crate::shared::TenantContext;

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/sessions/:id/documents",
            get(list_documents).post(add_document),
        )
        .route(
            "/sessions/:id/documents/:document_id",
            axum::routing::delete(remove_document),
        )
        .route("/sessions/:id/mode", put(update_mode))
        .route("/sessions/:id/context", get(get_context))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AddDocumentRequest {
    document_id: Uuid,
}

async fn add_document(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
    Json(request): Json<AddDocumentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let bridge = super::add_document(&state, &ctx, id, request.document_id).await?;
    Ok((StatusCode::CREATED, Json(bridge)))
}

async fn remove_document(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path((id, document_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    super::remove_document(&state, &ctx, id, document_id).await?;
    Ok(Json(serde_json::json!({ "message": "Document removed from session" })))
}

async fn list_documents(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let documents = super::list_documents(&state, &ctx, id).await?;
    Ok(Json(documents))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateModeRequest {
    mode: String,
}

async fn update_mode(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateModeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mode = SessionMode::parse(&request.mode).ok_or_else(|| {
        ApiError::Validation(format!(
            "mode must be auto, chat_only, or rag_only (got '{}')",
            request.mode
        ))
    })?;
    let session = super::update_mode(&state, &ctx, id, mode).await?;
    Ok(Json(session))
}

async fn get_context(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let context = super::get_context(&state, &ctx, id).await?;
    Ok(Json(context))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_mode_request_rejects_unknown_fields() {
        assert!(
            serde_json::from_str::<UpdateModeRequest>(r#"{"mode":"auto","extra":1}"#).is_err()
        );
    }
}
