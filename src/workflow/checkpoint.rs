//! Append-only checkpoint log, keyed by thread.
//!
//! `step` is strictly increasing per thread and enforced by a unique
//! `(thread_id, step)` index. Two executors racing on the same thread both
//! compute the same next step; the second insert hits the unique index and
//! surfaces as `ConcurrentUpdate`. That contention is the whole per-thread
//! serialization story.

use anyhow::Result;
use chrono::Utc;
use diesel::prelude::*;
use uuid::Uuid;

use crate::shared::errors::ApiError;
use crate::shared::models::Checkpoint;
use crate::shared::utils::{run_blocking, DbPool};

#[derive(Debug)]
pub enum CheckpointError {
    ConcurrentUpdate,
    Other(anyhow::Error),
}

impl std::fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointError::ConcurrentUpdate => {
                write!(f, "another executor is progressing this thread")
            }
            CheckpointError::Other(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CheckpointError {}

impl From<CheckpointError> for ApiError {
    fn from(e: CheckpointError) -> Self {
        match e {
            CheckpointError::ConcurrentUpdate => ApiError::Conflict(e.to_string()),
            CheckpointError::Other(inner) => ApiError::Internal(inner.to_string()),
        }
    }
}

pub async fn save(
    pool: &DbPool,
    thread: &str,
    save_step: i32,
    blob: serde_json::Value,
    parent: Option<i32>,
) -> Result<Checkpoint, CheckpointError> {
    let thread = thread.to_string();
    let result = run_blocking(pool, move |conn| {
        use crate::shared::schema::checkpoints::dsl::*;
        let row: Checkpoint = diesel::insert_into(checkpoints)
            .values((
                id.eq(Uuid::new_v4()),
                thread_id.eq(&thread),
                step.eq(save_step),
                state_blob.eq(blob),
                parent_step.eq(parent),
                created_at.eq(Utc::now()),
            ))
            .returning(Checkpoint::as_returning())
            .get_result(conn)?;
        Ok(row)
    })
    .await;

    result.map_err(|e| {
        let is_unique_violation = e.downcast_ref::<diesel::result::Error>().is_some_and(|d| {
            matches!(
                d,
                diesel::result::Error::DatabaseError(
                    diesel::result::DatabaseErrorKind::UniqueViolation,
                    _,
                )
            )
        });
        if is_unique_violation {
            CheckpointError::ConcurrentUpdate
        } else {
            CheckpointError::Other(e)
        }
    })
}

/// The highest-step snapshot for a thread, or none.
pub async fn load_latest(pool: &DbPool, thread: &str) -> Result<Option<Checkpoint>> {
    let thread = thread.to_string();
    run_blocking(pool, move |conn| {
        use crate::shared::schema::checkpoints::dsl::*;
        let row = checkpoints
            .filter(thread_id.eq(&thread))
            .order(step.desc())
            .select(Checkpoint::as_select())
            .first::<Checkpoint>(conn)
            .optional()?;
        Ok(row)
    })
    .await
}

pub async fn list(pool: &DbPool, thread: &str) -> Result<Vec<Checkpoint>> {
    let thread = thread.to_string();
    run_blocking(pool, move |conn| {
        use crate::shared::schema::checkpoints::dsl::*;
        let rows = checkpoints
            .filter(thread_id.eq(&thread))
            .order(step.asc())
            .select(Checkpoint::as_select())
            .load::<Checkpoint>(conn)?;
        Ok(rows)
    })
    .await
}

/// Drop checkpoints above `keep_step`, for branch/retry flows.
pub async fn truncate_after(pool: &DbPool, thread: &str, keep_step: i32) -> Result<usize> {
    let thread = thread.to_string();
    run_blocking(pool, move |conn| {
        use crate::shared::schema::checkpoints::dsl::*;
        let deleted = diesel::delete(
            checkpoints
                .filter(thread_id.eq(&thread))
                .filter(step.gt(keep_step)),
        )
        .execute(conn)?;
        Ok(deleted)
    })
    .await
}
