//! Human-in-the-loop approvals.
//!
//! An interrupted execution parks exactly one pending approval row; the
//! user's response flips it atomically and replays are refused. Resuming the
//! workflow is the caller's move, via `POST /workflows/resume`.

use chrono::Utc;
use diesel::prelude::*;
use log::info;
use uuid::Uuid;

use crate::shared::errors::ApiError;
use crate::shared::models::{ApprovalStatus, HitlApproval};
use crate::shared::state::AppState;
use crate::shared::utils::run_blocking;
use crate::shared::TenantContext;

pub mod api;

/// Create the pending approval for an interrupted execution. At most one
/// pending approval may exist per execution at any instant.
pub async fn create_pending(
    state: &AppState,
    ctx: &TenantContext,
    execution: Uuid,
    approval_prompt: String,
    context: serde_json::Value,
) -> Result<HitlApproval, ApiError> {
    let tenant = ctx.tenant_id;
    let user = ctx.user_id;

    run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::hitl_approvals::dsl::*;

        conn.transaction::<_, anyhow::Error, _>(|conn| {
            let pending_count: i64 = hitl_approvals
                .filter(execution_id.eq(execution))
                .filter(status.eq(ApprovalStatus::Pending.as_str()))
                .count()
                .get_result(conn)?;
            if pending_count > 0 {
                anyhow::bail!("execution already has a pending approval");
            }

            let row: HitlApproval = diesel::insert_into(hitl_approvals)
                .values((
                    id.eq(Uuid::new_v4()),
                    execution_id.eq(execution),
                    tenant_id.eq(tenant),
                    user_id.eq(user),
                    prompt.eq(approval_prompt),
                    context_data.eq(context),
                    status.eq(ApprovalStatus::Pending.as_str()),
                    created_at.eq(Utc::now()),
                ))
                .returning(HitlApproval::as_returning())
                .get_result(conn)?;
            Ok(row)
        })
    })
    .await
    .map_err(|e| {
        if e.to_string().contains("pending approval") {
            ApiError::Conflict("execution already has a pending approval".to_string())
        } else {
            ApiError::from(e)
        }
    })
}

pub async fn get_approval(
    state: &AppState,
    ctx: &TenantContext,
    approval: Uuid,
) -> Result<HitlApproval, ApiError> {
    let tenant = ctx.tenant_id;
    run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::hitl_approvals::dsl::*;
        let row = hitl_approvals
            .filter(id.eq(approval))
            .filter(tenant_id.eq(tenant))
            .select(HitlApproval::as_select())
            .first::<HitlApproval>(conn)
            .optional()?;
        Ok(row)
    })
    .await
    .map_err(ApiError::from)?
    .ok_or_else(|| ApiError::not_found("Approval"))
}

pub async fn list_pending(
    state: &AppState,
    ctx: &TenantContext,
) -> Result<Vec<HitlApproval>, ApiError> {
    list_approvals(state, ctx, Some(ApprovalStatus::Pending), 100, 0).await
}

pub async fn list_approvals(
    state: &AppState,
    ctx: &TenantContext,
    status_filter: Option<ApprovalStatus>,
    limit: i64,
    offset: i64,
) -> Result<Vec<HitlApproval>, ApiError> {
    let tenant = ctx.tenant_id;
    let user = ctx.user_id;
    run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::hitl_approvals::dsl::*;
        let mut query = hitl_approvals
            .filter(tenant_id.eq(tenant))
            .filter(user_id.eq(user))
            .into_boxed();
        if let Some(wanted) = status_filter {
            query = query.filter(status.eq(wanted.as_str()));
        }
        let rows = query
            .order(created_at.desc())
            .limit(limit)
            .offset(offset)
            .select(HitlApproval::as_select())
            .load::<HitlApproval>(conn)?;
        Ok(rows)
    })
    .await
    .map_err(ApiError::from)
}

/// Record the user's decision. The status flip happens in one guarded
/// update; a second response hits zero rows and is rejected.
pub async fn respond(
    state: &AppState,
    ctx: &TenantContext,
    approval: Uuid,
    approved: bool,
    feedback: Option<String>,
) -> Result<HitlApproval, ApiError> {
    // Tenant scoping first so a foreign id stays a 404.
    get_approval(state, ctx, approval).await?;

    let new_status = if approved {
        ApprovalStatus::Approved
    } else {
        ApprovalStatus::Rejected
    };
    let response = serde_json::json!({ "approved": approved, "feedback": feedback });

    let updated = run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::hitl_approvals::dsl::*;
        let n = diesel::update(
            hitl_approvals
                .filter(id.eq(approval))
                .filter(status.eq(ApprovalStatus::Pending.as_str())),
        )
        .set((
            status.eq(new_status.as_str()),
            user_response.eq(Some(response)),
            responded_at.eq(Some(Utc::now())),
        ))
        .execute(conn)?;
        Ok(n)
    })
    .await
    .map_err(ApiError::from)?;

    if updated == 0 {
        return Err(ApiError::Conflict("approval already responded".to_string()));
    }

    info!(
        "[HITL] approval {} {} by user {}",
        approval,
        new_status.as_str(),
        ctx.user_id
    );
    get_approval(state, ctx, approval).await
}
