// src/handlers/violation.rs

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use sqlx::PgPool;
use validator::Validate;

use crate::{
    error::AppError,
    handlers::session::lock_session,
    models::session::{ViolationAck, ViolationReport},
    state::SessionPolicy,
    utils::{html::clean_reason, jwt::Claims},
};

/// Server-side outcome of one violation report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViolationResolution {
    pub violation_count: u32,
    pub is_locked: bool,
    /// This report is the one that locked the session.
    pub newly_locked: bool,
}

/// Merges a client report into the stored counters.
///
/// The count never goes down. Once locked, the count is frozen and the lock
/// stays until a proctor clears it. The session locks when the client asks for
/// it or when the count reaches the server's own threshold.
pub fn resolve_violation(
    current_count: u32,
    already_locked: bool,
    reported_count: u32,
    requested_lock: bool,
    threshold: u32,
) -> ViolationResolution {
    if already_locked {
        return ViolationResolution {
            violation_count: current_count,
            is_locked: true,
            newly_locked: false,
        };
    }

    let violation_count = current_count.max(reported_count);
    let is_locked = requested_lock || violation_count >= threshold;
    ViolationResolution {
        violation_count,
        is_locked,
        newly_locked: is_locked,
    }
}

/// Appends a violation record and applies the lock decision.
pub async fn report_violation(
    State(pool): State<PgPool>,
    State(policy): State<SessionPolicy>,
    Extension(claims): Extension<Claims>,
    Path(session_id): Path<i64>,
    Json(payload): Json<ViolationReport>,
) -> Result<impl IntoResponse, AppError> {
    if let Err(validation_errors) = payload.validate() {
        return Err(AppError::BadRequest(validation_errors.to_string()));
    }
    let participant_id = claims.subject_id()?;

    let reason = clean_reason(&payload.reason);
    if reason.is_empty() {
        return Err(AppError::BadRequest("Violation reason is empty".to_string()));
    }

    let mut tx = pool.begin().await?;
    let session = lock_session(&mut tx, session_id).await?;
    if session.participant_id != participant_id {
        return Err(AppError::Forbidden("Session belongs to another participant".to_string()));
    }
    if session.is_completed() {
        return Err(AppError::Conflict("Session already submitted".to_string()));
    }

    let resolution = resolve_violation(
        u32::try_from(session.violation_count).unwrap_or(0),
        session.is_locked,
        payload.violation_count,
        payload.lock,
        policy.lock_threshold,
    );

    // The row lock above serializes sequence allocation per session.
    let seq: i32 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM violation_records WHERE session_id = $1",
    )
    .bind(session_id)
    .fetch_one(&mut *tx)
    .await?;

    let reported_count = i32::try_from(payload.violation_count).unwrap_or(i32::MAX);
    sqlx::query(
        r#"
        INSERT INTO violation_records (session_id, seq, reason, reported_count, triggered_lock)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(session_id)
    .bind(seq)
    .bind(&reason)
    .bind(reported_count)
    .bind(resolution.newly_locked)
    .execute(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!("Failed to record violation: {:?}", e);
        AppError::InternalServerError(e.to_string())
    })?;

    sqlx::query(
        r#"
        UPDATE exam_sessions
        SET violation_count = $1,
            is_locked = $2,
            lock_reason = CASE WHEN $3 THEN $4 ELSE lock_reason END
        WHERE id = $5
        "#,
    )
    .bind(i32::try_from(resolution.violation_count).unwrap_or(i32::MAX))
    .bind(resolution.is_locked)
    .bind(resolution.newly_locked)
    .bind(&reason)
    .bind(session_id)
    .execute(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!("Failed to update violation count: {:?}", e);
        AppError::InternalServerError(e.to_string())
    })?;

    tx.commit().await?;

    if resolution.newly_locked {
        tracing::warn!(session_id, %reason, count = resolution.violation_count, "Session locked");
    } else {
        tracing::info!(session_id, %reason, count = resolution.violation_count, "Violation recorded");
    }

    Ok((
        StatusCode::CREATED,
        Json(ViolationAck {
            seq,
            violation_count: resolution.violation_count,
            is_locked: resolution.is_locked,
        }),
    ))
}
