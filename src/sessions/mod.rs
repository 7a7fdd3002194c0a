//! Conversation sessions and their document context.
//!
//! A session bridges a conversation thread to the documents it may consult.
//! Bridges are soft-removed by flipping `is_active`; re-adding reactivates
//! the existing row. The database is authoritative; when a cache client is
//! configured the context snapshot is mirrored there for cheap reads.

use anyhow::Result;
use chrono::Utc;
use diesel::prelude::*;
use log::{info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::shared::errors::ApiError;
use crate::shared::models::{
    ConversationSession, Document, DocumentStatus, Message, MessageRole, SessionDocument,
    SessionMode,
};
use crate::shared::state::AppState;
use crate::shared::utils::run_blocking;
use crate::shared::TenantContext;

pub mod api;

#[derive(Debug, Serialize)]
pub struct SessionDocumentDetail {
    pub document_id: Uuid,
    pub filename: String,
    pub status: String,
    pub chunk_count: i32,
    pub added_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct SessionContext {
    pub session_id: Uuid,
    pub mode: String,
    pub active_documents: Vec<SessionDocumentDetail>,
    pub total_documents: usize,
    pub total_chunks: i64,
}

pub fn thread_id_for(tenant: Uuid, session: Uuid) -> String {
    format!("tenant_{}_session_{}", tenant, session)
}

pub async fn create_session(
    state: &AppState,
    ctx: &TenantContext,
    workflow: Option<Uuid>,
    session_title: Option<String>,
) -> Result<ConversationSession, ApiError> {
    let tenant = ctx.tenant_id;
    let user = ctx.user_id;

    run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::conversation_sessions::dsl::*;
        let session_id = Uuid::new_v4();
        let now = Utc::now();
        let row: ConversationSession = diesel::insert_into(conversation_sessions)
            .values((
                id.eq(session_id),
                tenant_id.eq(tenant),
                user_id.eq(user),
                workflow_id.eq(workflow),
                thread_id.eq(thread_id_for(tenant, session_id)),
                title.eq(session_title.unwrap_or_else(|| "New Conversation".to_string())),
                mode.eq(SessionMode::Auto.as_str()),
                metadata.eq(serde_json::json!({})),
                created_at.eq(now),
                updated_at.eq(now),
            ))
            .returning(ConversationSession::as_returning())
            .get_result(conn)?;
        Ok(row)
    })
    .await
    .map_err(ApiError::from)
}

pub async fn get_session(
    state: &AppState,
    ctx: &TenantContext,
    session: Uuid,
) -> Result<ConversationSession, ApiError> {
    let tenant = ctx.tenant_id;
    run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::conversation_sessions::dsl::*;
        let row = conversation_sessions
            .filter(id.eq(session))
            .filter(tenant_id.eq(tenant))
            .select(ConversationSession::as_select())
            .first::<ConversationSession>(conn)
            .optional()?;
        Ok(row)
    })
    .await
    .map_err(ApiError::from)?
    .ok_or_else(|| ApiError::not_found("Session"))
}

pub async fn list_sessions(
    state: &AppState,
    ctx: &TenantContext,
    limit: i64,
    offset: i64,
) -> Result<Vec<ConversationSession>, ApiError> {
    let tenant = ctx.tenant_id;
    let user = ctx.user_id;
    run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::conversation_sessions::dsl::*;
        let rows = conversation_sessions
            .filter(tenant_id.eq(tenant))
            .filter(user_id.eq(user))
            .order(updated_at.desc())
            .limit(limit)
            .offset(offset)
            .select(ConversationSession::as_select())
            .load::<ConversationSession>(conn)?;
        Ok(rows)
    })
    .await
    .map_err(ApiError::from)
}

pub async fn add_message(
    state: &AppState,
    session: Uuid,
    message_role: MessageRole,
    text: String,
) -> Result<Message, ApiError> {
    run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::messages::dsl::*;
        let row: Message = diesel::insert_into(messages)
            .values((
                id.eq(Uuid::new_v4()),
                session_id.eq(session),
                role.eq(message_role.as_str()),
                content.eq(text),
                metadata.eq(serde_json::json!({})),
                created_at.eq(Utc::now()),
            ))
            .returning(Message::as_returning())
            .get_result(conn)?;

        use crate::shared::schema::conversation_sessions::dsl as sessions_dsl;
        diesel::update(sessions_dsl::conversation_sessions.filter(sessions_dsl::id.eq(session)))
            .set(sessions_dsl::updated_at.eq(Utc::now()))
            .execute(conn)?;
        Ok(row)
    })
    .await
    .map_err(ApiError::from)
}

pub async fn list_messages(
    state: &AppState,
    ctx: &TenantContext,
    session: Uuid,
    limit: i64,
) -> Result<Vec<Message>, ApiError> {
    get_session(state, ctx, session).await?;
    run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::messages::dsl::*;
        let rows = messages
            .filter(session_id.eq(session))
            .order(created_at.asc())
            .limit(limit)
            .select(Message::as_select())
            .load::<Message>(conn)?;
        Ok(rows)
    })
    .await
    .map_err(ApiError::from)
}

/// Attach a completed document to a session. Verifies tenant ownership and
/// readiness; a soft-removed bridge is reactivated instead of duplicated.
pub async fn add_document(
    state: &AppState,
    ctx: &TenantContext,
    session: Uuid,
    document: Uuid,
) -> Result<SessionDocument, ApiError> {
    get_session(state, ctx, session).await?;

    let tenant = ctx.tenant_id;
    let bridge = run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::documents::dsl as docs;
        let doc = docs::documents
            .filter(docs::id.eq(document))
            .filter(docs::tenant_id.eq(tenant))
            .filter(docs::status.eq(DocumentStatus::Completed.as_str()))
            .select(Document::as_select())
            .first::<Document>(conn)
            .optional()?;
        if doc.is_none() {
            return Ok(None);
        }

        use crate::shared::schema::session_documents::dsl::*;
        let existing = session_documents
            .filter(session_id.eq(session))
            .filter(document_id.eq(document))
            .select(SessionDocument::as_select())
            .first::<SessionDocument>(conn)
            .optional()?;

        let row = match existing {
            Some(bridge) if bridge.is_active => {
                anyhow::bail!("document already in session");
            }
            Some(bridge) => diesel::update(session_documents.filter(id.eq(bridge.id)))
                .set((is_active.eq(true), added_at.eq(Utc::now())))
                .returning(SessionDocument::as_returning())
                .get_result(conn)?,
            None => diesel::insert_into(session_documents)
                .values((
                    id.eq(Uuid::new_v4()),
                    session_id.eq(session),
                    document_id.eq(document),
                    added_at.eq(Utc::now()),
                    is_active.eq(true),
                ))
                .returning(SessionDocument::as_returning())
                .get_result(conn)?,
        };
        Ok(Some(row))
    })
    .await
    .map_err(|e| {
        if e.to_string().contains("already in session") {
            ApiError::Conflict("document already in session".to_string())
        } else {
            ApiError::from(e)
        }
    })?
    .ok_or_else(|| {
        ApiError::NotFound("Document not found or not completed".to_string())
    })?;

    info!(
        "[SESSION] document {} attached to session {}",
        document, session
    );
    refresh_context_cache(state, ctx, session).await;
    Ok(bridge)
}

pub async fn remove_document(
    state: &AppState,
    ctx: &TenantContext,
    session: Uuid,
    document: Uuid,
) -> Result<(), ApiError> {
    get_session(state, ctx, session).await?;

    let updated = run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::session_documents::dsl::*;
        let n = diesel::update(
            session_documents
                .filter(session_id.eq(session))
                .filter(document_id.eq(document))
                .filter(is_active.eq(true)),
        )
        .set(is_active.eq(false))
        .execute(conn)?;
        Ok(n)
    })
    .await
    .map_err(ApiError::from)?;

    if updated == 0 {
        return Err(ApiError::not_found("Session document"));
    }
    refresh_context_cache(state, ctx, session).await;
    Ok(())
}

pub async fn active_document_ids(state: &AppState, session: Uuid) -> Result<Vec<Uuid>> {
    run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::session_documents::dsl::*;
        let ids = session_documents
            .filter(session_id.eq(session))
            .filter(is_active.eq(true))
            .select(document_id)
            .load::<Uuid>(conn)?;
        Ok(ids)
    })
    .await
}

pub async fn list_documents(
    state: &AppState,
    ctx: &TenantContext,
    session: Uuid,
) -> Result<Vec<SessionDocumentDetail>, ApiError> {
    get_session(state, ctx, session).await?;

    let tenant = ctx.tenant_id;
    run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::documents::dsl as docs;
        use crate::shared::schema::session_documents::dsl::*;
        let rows: Vec<(SessionDocument, Document)> = session_documents
            .inner_join(docs::documents)
            .filter(session_id.eq(session))
            .filter(is_active.eq(true))
            .filter(docs::tenant_id.eq(tenant))
            .order(added_at.asc())
            .select((SessionDocument::as_select(), Document::as_select()))
            .load(conn)?;

        Ok(rows
            .into_iter()
            .map(|(bridge, doc)| SessionDocumentDetail {
                document_id: doc.id,
                filename: doc.filename,
                status: doc.status,
                chunk_count: doc.chunk_count,
                added_at: bridge.added_at,
            })
            .collect())
    })
    .await
    .map_err(ApiError::from)
}

pub async fn get_context(
    state: &AppState,
    ctx: &TenantContext,
    session: Uuid,
) -> Result<SessionContext, ApiError> {
    let session_row = get_session(state, ctx, session).await?;
    let documents = list_documents(state, ctx, session).await?;
    let total_chunks = documents.iter().map(|d| d.chunk_count as i64).sum();

    Ok(SessionContext {
        session_id: session,
        mode: session_row.mode,
        total_documents: documents.len(),
        total_chunks,
        active_documents: documents,
    })
}

/// Switch the session mode. `rag_only` requires at least one active document.
pub async fn update_mode(
    state: &AppState,
    ctx: &TenantContext,
    session: Uuid,
    new_mode: SessionMode,
) -> Result<ConversationSession, ApiError> {
    get_session(state, ctx, session).await?;

    if new_mode == SessionMode::RagOnly {
        let docs = active_document_ids(state, session)
            .await
            .map_err(ApiError::from)?;
        if docs.is_empty() {
            return Err(ApiError::Validation(
                "rag_only mode requires at least one active document".to_string(),
            ));
        }
    }

    let row = run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::conversation_sessions::dsl::*;
        let row: ConversationSession =
            diesel::update(conversation_sessions.filter(id.eq(session)))
                .set((mode.eq(new_mode.as_str()), updated_at.eq(Utc::now())))
                .returning(ConversationSession::as_returning())
                .get_result(conn)?;
        Ok(row)
    })
    .await
    .map_err(ApiError::from)?;

    refresh_context_cache(state, ctx, session).await;
    Ok(row)
}

/// Mirror the context snapshot into the cache tier. Best effort: the DB is
/// authoritative and a missing cache only costs a query.
async fn refresh_context_cache(state: &AppState, ctx: &TenantContext, session: Uuid) {
    let Some(client) = &state.cache else {
        return;
    };
    let Ok(context) = get_context(state, ctx, session).await else {
        return;
    };
    let Ok(payload) = serde_json::to_string(&context) else {
        return;
    };

    let key = format!("session_context:{}:{}", ctx.tenant_id, session);
    match client.get_multiplexed_async_connection().await {
        Ok(mut conn) => {
            let result: redis::RedisResult<()> = redis::cmd("SET")
                .arg(&key)
                .arg(payload)
                .arg("EX")
                .arg(300)
                .query_async(&mut conn)
                .await;
            if let Err(e) = result {
                warn!("[SESSION] context cache write failed: {}", e);
            }
        }
        Err(e) => warn!("[SESSION] cache connection failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_id_format() {
        let tenant = Uuid::new_v4();
        let session = Uuid::new_v4();
        let thread = thread_id_for(tenant, session);
        assert!(thread.starts_with(&format!("tenant_{}", tenant)));
        assert!(thread.ends_with(&format!("session_{}", session)));
    }
}
