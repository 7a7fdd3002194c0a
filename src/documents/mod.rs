//! Document ingestion pipeline: upload, parse, chunk, embed, index.
//!
//! `ingest` returns the `uploading` row synchronously and schedules the rest
//! onto the worker pool. Background failure always lands the document in
//! `failed` with its partial chunks and vectors rolled back.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use diesel::prelude::*;
use log::{error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::providers::with_retries;
use crate::shared::errors::ApiError;
use crate::shared::models::{Document, DocumentChunk, DocumentStatus};
use crate::shared::state::AppState;
use crate::shared::utils::{run_blocking, Page};
use crate::shared::TenantContext;
use crate::vector::VectorRecord;

pub mod api;
pub mod parser;

use parser::{chunk_text, parser_for};

#[derive(Debug, Clone, Serialize)]
pub struct SearchResultItem {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub document_filename: String,
    pub content: String,
    pub score: f32,
    pub chunk_index: i32,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchResultItem>,
    pub total_results: usize,
    pub search_time_ms: f64,
}

fn file_type_of(filename: &str) -> String {
    filename
        .rsplit('.')
        .next()
        .filter(|ext| *ext != filename)
        .unwrap_or("txt")
        .to_lowercase()
}

/// Create the document row and schedule background processing. The returned
/// row is in `uploading` status; clients poll `GET /documents/{id}`.
pub async fn ingest(
    state: Arc<AppState>,
    ctx: &TenantContext,
    upload_filename: String,
    bytes: Vec<u8>,
) -> Result<Document, ApiError> {
    if upload_filename.is_empty() {
        return Err(ApiError::Validation("filename is required".to_string()));
    }
    if bytes.is_empty() {
        return Err(ApiError::Validation("file is empty".to_string()));
    }

    let doc_id = Uuid::new_v4();
    let ftype = file_type_of(&upload_filename);
    let dir = format!("{}/{}", state.config.upload_dir, ctx.tenant_id);
    let stored_path = format!("{}/{}_{}", dir, doc_id.simple(), upload_filename);

    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| ApiError::Internal(format!("failed to store upload: {}", e)))?;
    tokio::fs::write(&stored_path, &bytes)
        .await
        .map_err(|e| ApiError::Internal(format!("failed to store upload: {}", e)))?;

    let tenant = ctx.tenant_id;
    let user = ctx.user_id;
    let size_bytes = bytes.len() as i64;
    let insert_filename = upload_filename.clone();
    let insert_path = stored_path.clone();

    let document = run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::documents::dsl::*;
        let now = Utc::now();
        let row: Document = diesel::insert_into(documents)
            .values((
                id.eq(doc_id),
                tenant_id.eq(tenant),
                user_id.eq(user),
                filename.eq(&insert_filename),
                file_path.eq(&insert_path),
                file_size.eq(size_bytes),
                file_type.eq(&ftype),
                status.eq(DocumentStatus::Uploading.as_str()),
                content.eq(None::<String>),
                chunk_count.eq(0),
                created_at.eq(now),
                updated_at.eq(now),
            ))
            .returning(Document::as_returning())
            .get_result(conn)?;
        Ok(row)
    })
    .await
    .map_err(ApiError::from)?;

    info!(
        "[DOCS] document {} ({}) uploaded by tenant {}, scheduling processing",
        doc_id, upload_filename, tenant
    );
    spawn_processing(state, tenant, doc_id);

    Ok(document)
}

/// Schedule the parse/chunk/embed/index pipeline for a document. Honors the
/// per-tenant ingestion cap and the background-task deadline.
pub fn spawn_processing(state: Arc<AppState>, tenant: Uuid, document_id: Uuid) {
    tokio::spawn(async move {
        let _permit = state.ingest_limits.acquire(tenant).await;
        let deadline = Duration::from_secs(state.config.operation_timeout_secs);

        let outcome = tokio::time::timeout(
            deadline,
            process_document(Arc::clone(&state), tenant, document_id),
        )
        .await;

        match outcome {
            Ok(Ok(chunk_count)) => {
                info!(
                    "[DOCS] document {} processed, {} chunks indexed",
                    document_id, chunk_count
                );
            }
            Ok(Err(e)) => {
                error!("[DOCS] document {} failed: {:#}", document_id, e);
                fail_document(&state, tenant, document_id, &format!("{:#}", e)).await;
            }
            Err(_) => {
                error!("[DOCS] document {} timed out", document_id);
                fail_document(&state, tenant, document_id, "timeout").await;
            }
        }
    });
}

async fn process_document(state: Arc<AppState>, tenant: Uuid, doc_id: Uuid) -> Result<usize> {
    let document = load_document(&state, tenant, doc_id)
        .await?
        .ok_or_else(|| anyhow!("document {} vanished before processing", doc_id))?;

    set_status(&state, doc_id, DocumentStatus::Processing, None).await?;

    // Retries start from scratch: any chunks or vectors from an earlier
    // attempt are wiped before re-indexing.
    wipe_document_data(&state, tenant, doc_id).await?;

    let bytes = tokio::fs::read(&document.file_path)
        .await
        .with_context(|| format!("failed to read stored file {}", document.file_path))?;

    let text = parser_for(&document.file_type)
        .and_then(|p| p.parse(&bytes))
        .map_err(|e| anyhow!("{}", e))?;

    let chunks = chunk_text(&text, state.config.chunk_size, state.config.chunk_overlap);
    if chunks.is_empty() {
        return Err(anyhow!("ParseError: no chunks produced"));
    }

    let embedder = state.providers.embedding_for(tenant).await?;
    state
        .vectors
        .ensure_collection(tenant, embedder.dimensions())
        .await?;

    // Persist extracted text alongside the row so operations can re-read it
    // without another parse.
    {
        let text = text.clone();
        run_blocking(&state.conn, move |conn| {
            use crate::shared::schema::documents::dsl::*;
            diesel::update(documents.filter(id.eq(doc_id)))
                .set((content.eq(Some(text)), updated_at.eq(Utc::now())))
                .execute(conn)?;
            Ok(())
        })
        .await?;
    }

    let mut records = Vec::with_capacity(chunks.len());
    let batch_size = state.config.embed_batch_size.max(1);

    for batch in chunks.chunks(batch_size) {
        let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
        let vectors = with_retries("embed", || {
            let embedder = Arc::clone(&embedder);
            let texts = texts.clone();
            async move { embedder.embed(&texts).await }
        })
        .await?;

        if vectors.len() != batch.len() {
            return Err(anyhow!(
                "embedding count {} does not match batch size {}",
                vectors.len(),
                batch.len()
            ));
        }

        for (chunk, vector) in batch.iter().zip(vectors) {
            records.push((
                Uuid::new_v4(),
                chunk.clone(),
                vector,
            ));
        }
    }

    let vector_records: Vec<VectorRecord> = records
        .iter()
        .map(|(chunk_id, chunk, vector)| VectorRecord {
            chunk_id: *chunk_id,
            document_id: doc_id,
            chunk_index: chunk.chunk_index,
            content: chunk.content.clone(),
            filename: document.filename.clone(),
            vector: vector.clone(),
        })
        .collect();

    state.vectors.upsert(tenant, &vector_records).await?;

    let chunk_total = records.len();
    run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::document_chunks::dsl::*;
        conn.transaction::<_, anyhow::Error, _>(|conn| {
            for (cid, chunk, _) in &records {
                diesel::insert_into(document_chunks)
                    .values((
                        id.eq(cid),
                        document_id.eq(doc_id),
                        tenant_id.eq(tenant),
                        chunk_index.eq(chunk.chunk_index),
                        content.eq(&chunk.content),
                        token_count.eq(chunk.token_count as i32),
                        start_char.eq(Some(chunk.start_char as i32)),
                        end_char.eq(Some(chunk.end_char as i32)),
                        metadata.eq(serde_json::json!({})),
                        created_at.eq(Utc::now()),
                    ))
                    .execute(conn)?;
            }

            use crate::shared::schema::documents::dsl as docs;
            diesel::update(docs::documents.filter(docs::id.eq(doc_id)))
                .set((
                    docs::status.eq(DocumentStatus::Completed.as_str()),
                    docs::chunk_count.eq(chunk_total as i32),
                    docs::error_message.eq(None::<String>),
                    docs::updated_at.eq(Utc::now()),
                ))
                .execute(conn)?;
            Ok(())
        })
    })
    .await?;

    Ok(chunk_total)
}

async fn fail_document(state: &AppState, tenant: Uuid, document_id: Uuid, message: &str) {
    if let Err(e) = wipe_document_data(state, tenant, document_id).await {
        warn!(
            "[DOCS] rollback of document {} left residue: {:#}",
            document_id, e
        );
    }
    if let Err(e) = set_status(
        state,
        document_id,
        DocumentStatus::Failed,
        Some(message.to_string()),
    )
    .await
    {
        error!(
            "[DOCS] failed to mark document {} as failed: {:#}",
            document_id, e
        );
    }
}

async fn set_status(
    state: &AppState,
    document_id: Uuid,
    new_status: DocumentStatus,
    message: Option<String>,
) -> Result<()> {
    run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::documents::dsl::*;
        diesel::update(documents.filter(id.eq(document_id)))
            .set((
                status.eq(new_status.as_str()),
                error_message.eq(message),
                updated_at.eq(Utc::now()),
            ))
            .execute(conn)?;
        Ok(())
    })
    .await
}

/// Remove all chunks and vectors for a document, in both stores.
async fn wipe_document_data(state: &AppState, tenant: Uuid, doc_id: Uuid) -> Result<()> {
    state
        .vectors
        .delete_by_document(tenant, doc_id)
        .await
        .map_err(|e| anyhow!("{}", e))?;

    run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::document_chunks::dsl::*;
        diesel::delete(document_chunks.filter(document_id.eq(doc_id))).execute(conn)?;
        Ok(())
    })
    .await
}

async fn load_document(state: &AppState, tenant: Uuid, doc_id: Uuid) -> Result<Option<Document>> {
    run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::documents::dsl::*;
        let row = documents
            .filter(id.eq(doc_id))
            .filter(tenant_id.eq(tenant))
            .select(Document::as_select())
            .first::<Document>(conn)
            .optional()?;
        Ok(row)
    })
    .await
}

pub async fn get_document(
    state: &AppState,
    ctx: &TenantContext,
    document_id: Uuid,
) -> Result<Document, ApiError> {
    load_document(state, ctx.tenant_id, document_id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found("Document"))
}

pub async fn list_documents(
    state: &AppState,
    ctx: &TenantContext,
    skip: i64,
    limit: i64,
    status_filter: Option<String>,
) -> Result<Page<Document>, ApiError> {
    if let Some(s) = &status_filter {
        if DocumentStatus::parse(s).is_none() {
            return Err(ApiError::Validation(format!("unknown status '{}'", s)));
        }
    }

    let tenant = ctx.tenant_id;
    let (items, total) = run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::documents::dsl::*;

        let mut query = documents.filter(tenant_id.eq(tenant)).into_boxed();
        let mut count_query = documents.filter(tenant_id.eq(tenant)).into_boxed();

        match &status_filter {
            Some(s) => {
                query = query.filter(status.eq(s.clone()));
                count_query = count_query.filter(status.eq(s.clone()));
            }
            None => {
                query = query.filter(status.ne(DocumentStatus::Deleted.as_str()));
                count_query = count_query.filter(status.ne(DocumentStatus::Deleted.as_str()));
            }
        }

        let total: i64 = count_query.count().get_result(conn)?;
        let items = query
            .order(created_at.desc())
            .offset(skip)
            .limit(limit)
            .select(Document::as_select())
            .load::<Document>(conn)?;
        Ok((items, total))
    })
    .await
    .map_err(ApiError::from)?;

    Ok(Page::new(items, total, skip, limit))
}

pub async fn list_chunks(
    state: &AppState,
    ctx: &TenantContext,
    doc_id: Uuid,
) -> Result<Vec<DocumentChunk>, ApiError> {
    // 404 before listing so cross-tenant probes cannot tell an empty
    // document from a foreign one.
    get_document(state, ctx, doc_id).await?;

    let tenant = ctx.tenant_id;
    run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::document_chunks::dsl::*;
        let rows = document_chunks
            .filter(document_id.eq(doc_id))
            .filter(tenant_id.eq(tenant))
            .order(chunk_index.asc())
            .select(DocumentChunk::as_select())
            .load::<DocumentChunk>(conn)?;
        Ok(rows)
    })
    .await
    .map_err(ApiError::from)
}

/// Soft-delete the document and purge its chunks and vectors. The row stays
/// referable by existing operation records.
pub async fn delete_document(
    state: &AppState,
    ctx: &TenantContext,
    document_id: Uuid,
) -> Result<(), ApiError> {
    let document = get_document(state, ctx, document_id).await?;
    if document.status == DocumentStatus::Deleted.as_str() {
        return Err(ApiError::not_found("Document"));
    }

    wipe_document_data(state, ctx.tenant_id, document_id)
        .await
        .map_err(ApiError::from)?;

    run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::documents::dsl::*;
        diesel::update(documents.filter(id.eq(document_id)))
            .set((
                status.eq(DocumentStatus::Deleted.as_str()),
                chunk_count.eq(0),
                updated_at.eq(Utc::now()),
            ))
            .execute(conn)?;
        Ok(())
    })
    .await
    .map_err(ApiError::from)?;

    info!(
        "[DOCS] document {} deleted for tenant {}",
        document_id, ctx.tenant_id
    );
    Ok(())
}

/// Semantic search across the tenant's indexed chunks, optionally narrowed
/// to a document set. The query is embedded with the same model used at
/// ingest time.
pub async fn search(
    state: &AppState,
    ctx: &TenantContext,
    query: &str,
    limit: usize,
    score_threshold: f32,
    document_ids: Option<Vec<Uuid>>,
) -> Result<SearchResponse, ApiError> {
    if query.trim().is_empty() {
        return Err(ApiError::Validation("query must not be empty".to_string()));
    }
    let started = Instant::now();

    let embedder = state
        .providers
        .embedding_for(ctx.tenant_id)
        .await
        .map_err(ApiError::from)?;

    let query_string = query.to_string();
    let vectors = with_retries("embed-query", || {
        let embedder = Arc::clone(&embedder);
        let texts = vec![query_string.clone()];
        async move { embedder.embed(&texts).await }
    })
    .await?;
    let query_vec = vectors
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::Internal("no embedding for query".to_string()))?;

    let hits = state
        .vectors
        .search(
            ctx.tenant_id,
            &query_vec,
            limit,
            score_threshold,
            document_ids.as_deref(),
        )
        .await
        .map_err(ApiError::from)?;

    let results: Vec<SearchResultItem> = hits
        .into_iter()
        .map(|hit| SearchResultItem {
            chunk_id: hit.chunk_id,
            document_id: hit.document_id,
            document_filename: hit.filename,
            content: hit.content,
            score: hit.score,
            chunk_index: hit.chunk_index,
        })
        .collect();

    Ok(SearchResponse {
        query: query.to_string(),
        total_results: results.len(),
        search_time_ms: started.elapsed().as_secs_f64() * 1000.0,
        results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_type_of() {
        assert_eq!(file_type_of("notes.txt"), "txt");
        assert_eq!(file_type_of("Report.MD"), "md");
        assert_eq!(file_type_of("noextension"), "txt");
        assert_eq!(file_type_of("archive.tar.gz"), "gz");
    }
}
