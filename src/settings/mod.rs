//! Per-tenant provider settings.
//!
//! The config row selects providers and models; API keys go straight into
//! the secret store and never touch the row. Changing the embedding width
//! while documents are indexed is refused until a reindex is explicitly
//! requested, because the tenant collection is already sized.

use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use diesel::prelude::*;
use log::info;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::providers::detect_dimensions;
use crate::shared::errors::ApiError;
use crate::shared::models::DocumentStatus;
use crate::shared::state::AppState;
use crate::shared::utils::run_blocking;
use crate::shared::TenantContext;

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/settings/embedding-provider",
            get(get_embedding_provider).put(put_embedding_provider),
        )
        .route(
            "/settings/embedding-provider/test",
            post(test_embedding_provider),
        )
        .route(
            "/settings/llm-provider",
            get(get_llm_provider).put(put_llm_provider),
        )
}

fn require_admin(ctx: &TenantContext) -> Result<(), ApiError> {
    if !ctx.is_admin() {
        return Err(ApiError::Forbidden(
            "provider settings require a tenant admin".to_string(),
        ));
    }
    Ok(())
}

async fn get_embedding_provider(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
) -> Result<impl IntoResponse, ApiError> {
    let config = state
        .providers
        .tenant_config(ctx.tenant_id)
        .await
        .map_err(ApiError::from)?;
    let has_api_key = state
        .secrets
        .get(
            ctx.tenant_id,
            &format!("embedding-providers/{}", config.embedding_provider),
        )
        .await
        .map(|secret| secret.contains_key("api_key"))
        .unwrap_or(false);

    Ok(Json(serde_json::json!({
        "provider": config.embedding_provider,
        "model": config.embedding_model,
        "dimensions": config.embedding_dimensions,
        "base_url": config.embedding_base_url,
        "has_api_key": has_api_key,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EmbeddingProviderUpdate {
    provider: String,
    model: String,
    dimensions: Option<usize>,
    base_url: Option<String>,
    api_key: Option<String>,
    reindex: Option<bool>,
}

async fn put_embedding_provider(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Json(update): Json<EmbeddingProviderUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&ctx)?;

    let current = state
        .providers
        .tenant_config(ctx.tenant_id)
        .await
        .map_err(ApiError::from)?;
    let new_dimensions = update
        .dimensions
        .unwrap_or_else(|| detect_dimensions(&update.model));

    // Indexed vectors are sized to the old width; a silent change would
    // orphan them.
    if new_dimensions != current.embedding_dimensions
        && !update.reindex.unwrap_or(false)
        && tenant_has_documents(&state, &ctx).await?
    {
        return Err(ApiError::Conflict(format!(
            "DimensionMismatch: indexed documents use {}-dim embeddings, requested {}. Pass reindex=true to accept a reindex.",
            current.embedding_dimensions, new_dimensions
        )));
    }

    if let Some(api_key) = &update.api_key {
        let mut secret = HashMap::new();
        secret.insert("api_key".to_string(), api_key.clone());
        state
            .secrets
            .put(
                ctx.tenant_id,
                &format!("embedding-providers/{}", update.provider),
                secret,
            )
            .await
            .map_err(ApiError::from)?;
    }

    upsert_config(&state, &ctx, {
        let update_provider = update.provider.clone();
        let update_model = update.model.clone();
        let update_base_url = update.base_url.clone();
        move |row| {
            row.embedding_provider = update_provider;
            row.embedding_model = update_model;
            row.embedding_dimensions = new_dimensions as i32;
            row.embedding_base_url = update_base_url;
        }
    })
    .await?;
    state.providers.invalidate(ctx.tenant_id).await;

    info!(
        "[SETTINGS] tenant {} embedding provider set to {}/{} ({} dims)",
        ctx.tenant_id, update.provider, update.model, new_dimensions
    );
    Ok(Json(serde_json::json!({
        "provider": update.provider,
        "model": update.model,
        "dimensions": new_dimensions,
        "message": "Embedding provider updated",
    })))
}

async fn test_embedding_provider(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
) -> Result<impl IntoResponse, ApiError> {
    let provider = state
        .providers
        .embedding_for(ctx.tenant_id)
        .await
        .map_err(ApiError::from)?;
    provider.probe().await.map_err(ApiError::from)?;

    Ok(Json(serde_json::json!({
        "status": "ok",
        "dimensions": provider.dimensions(),
    })))
}

async fn get_llm_provider(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
) -> Result<impl IntoResponse, ApiError> {
    let config = state
        .providers
        .tenant_config(ctx.tenant_id)
        .await
        .map_err(ApiError::from)?;
    let has_api_key = state
        .secrets
        .get(
            ctx.tenant_id,
            &format!("chat-providers/{}", config.chat_provider),
        )
        .await
        .map(|secret| secret.contains_key("api_key"))
        .unwrap_or(false);

    Ok(Json(serde_json::json!({
        "provider": config.chat_provider,
        "model": config.chat_model,
        "base_url": config.chat_base_url,
        "has_api_key": has_api_key,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LlmProviderUpdate {
    provider: String,
    model: String,
    base_url: Option<String>,
    api_key: Option<String>,
}

async fn put_llm_provider(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Json(update): Json<LlmProviderUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&ctx)?;

    if let Some(api_key) = &update.api_key {
        let mut secret = HashMap::new();
        secret.insert("api_key".to_string(), api_key.clone());
        state
            .secrets
            .put(
                ctx.tenant_id,
                &format!("chat-providers/{}", update.provider),
                secret,
            )
            .await
            .map_err(ApiError::from)?;
    }

    upsert_config(&state, &ctx, {
        let update_provider = update.provider.clone();
        let update_model = update.model.clone();
        let update_base_url = update.base_url.clone();
        move |row| {
            row.chat_provider = update_provider;
            row.chat_model = update_model;
            row.chat_base_url = update_base_url;
        }
    })
    .await?;
    state.providers.invalidate(ctx.tenant_id).await;

    info!(
        "[SETTINGS] tenant {} chat provider set to {}/{}",
        ctx.tenant_id, update.provider, update.model
    );
    Ok(Json(serde_json::json!({
        "provider": update.provider,
        "model": update.model,
        "message": "LLM provider updated",
    })))
}

struct ConfigRow {
    embedding_provider: String,
    embedding_model: String,
    embedding_dimensions: i32,
    embedding_base_url: Option<String>,
    chat_provider: String,
    chat_model: String,
    chat_base_url: Option<String>,
}

async fn upsert_config<F>(state: &AppState, ctx: &TenantContext, apply: F) -> Result<(), ApiError>
where
    F: FnOnce(&mut ConfigRow) + Send + 'static,
{
    let current = state
        .providers
        .tenant_config(ctx.tenant_id)
        .await
        .map_err(ApiError::from)?;
    let mut row = ConfigRow {
        embedding_provider: current.embedding_provider,
        embedding_model: current.embedding_model,
        embedding_dimensions: current.embedding_dimensions as i32,
        embedding_base_url: current.embedding_base_url,
        chat_provider: current.chat_provider,
        chat_model: current.chat_model,
        chat_base_url: current.chat_base_url,
    };
    apply(&mut row);

    let tenant = ctx.tenant_id;
    run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::tenant_configs::dsl::*;
        diesel::insert_into(tenant_configs)
            .values((
                tenant_id.eq(tenant),
                embedding_provider.eq(&row.embedding_provider),
                embedding_model.eq(&row.embedding_model),
                embedding_dimensions.eq(row.embedding_dimensions),
                embedding_base_url.eq(&row.embedding_base_url),
                chat_provider.eq(&row.chat_provider),
                chat_model.eq(&row.chat_model),
                chat_base_url.eq(&row.chat_base_url),
                updated_at.eq(Utc::now()),
            ))
            .on_conflict(tenant_id)
            .do_update()
            .set((
                embedding_provider.eq(&row.embedding_provider),
                embedding_model.eq(&row.embedding_model),
                embedding_dimensions.eq(row.embedding_dimensions),
                embedding_base_url.eq(&row.embedding_base_url),
                chat_provider.eq(&row.chat_provider),
                chat_model.eq(&row.chat_model),
                chat_base_url.eq(&row.chat_base_url),
                updated_at.eq(Utc::now()),
            ))
            .execute(conn)?;
        Ok(())
    })
    .await
    .map_err(ApiError::from)
}

async fn tenant_has_documents(state: &AppState, ctx: &TenantContext) -> Result<bool, ApiError> {
    let tenant = ctx.tenant_id;
    let count: i64 = run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::documents::dsl::*;
        let n = documents
            .filter(tenant_id.eq(tenant))
            .filter(status.ne(DocumentStatus::Deleted.as_str()))
            .count()
            .get_result(conn)?;
        Ok(n)
    })
    .await
    .map_err(ApiError::from)?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_update_rejects_unknown_fields() {
        assert!(serde_json::from_str::<EmbeddingProviderUpdate>(
            r#"{"provider":"openai","model":"text-embedding-3-small","shard_count":4}"#
        )
        .is_err());
    }

    #[test]
    fn test_embedding_update_minimal_shape() {
        let update: EmbeddingProviderUpdate =
            serde_json::from_str(r#"{"provider":"ollama","model":"nomic-embed-text"}"#).unwrap();
        assert!(update.dimensions.is_none());
        assert!(update.reindex.is_none());
    }
}
