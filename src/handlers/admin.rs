// src/handlers/admin.rs

use axum::{
    Json,
    extract::{Extension, Path, State},
    response::IntoResponse,
};
use chrono::Utc;
use sqlx::PgPool;
use validator::Validate;

use crate::{
    error::AppError,
    handlers::session::{load_record, lock_session},
    models::{
        score::{ManualGradeRequest, ScoreSummary},
        session::{ExamSession, SessionOverview, ViolationRecord},
    },
    utils::jwt::Claims,
};

/// Clears the lock of a session.
/// Admin only.
///
/// The violation count is reset to zero so the participant starts over with
/// the full allowance; the violation records keep the whole history.
pub async fn unlock_session(
    State(pool): State<PgPool>,
    Extension(claims): Extension<Claims>,
    Path(session_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let mut tx = pool.begin().await?;
    let session = lock_session(&mut tx, session_id).await?;

    if session.is_completed() {
        return Err(AppError::Conflict("Session already submitted".to_string()));
    }
    if !session.is_locked {
        tx.commit().await?;
        return Ok(Json(session.snapshot()));
    }

    let unlocked = sqlx::query_as::<_, ExamSession>(
        r#"
        UPDATE exam_sessions
        SET is_locked = FALSE, lock_reason = NULL, violation_count = 0, unlocked_at = $1
        WHERE id = $2
        RETURNING *
        "#,
    )
    .bind(Utc::now())
    .bind(session_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!("Failed to unlock session: {:?}", e);
        AppError::InternalServerError(e.to_string())
    })?;
    tx.commit().await?;

    tracing::info!(
        session_id,
        admin = %claims.sub,
        previous_count = session.violation_count,
        "Session unlocked"
    );

    Ok(Json(unlocked.snapshot()))
}

/// Lists the violation log of a session, oldest first.
/// Admin only.
pub async fn list_session_violations(
    State(pool): State<PgPool>,
    Path(session_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM exam_sessions WHERE id = $1")
        .bind(session_id)
        .fetch_optional(&pool)
        .await?;
    if exists.is_none() {
        return Err(AppError::NotFound("Session not found".to_string()));
    }

    let records = sqlx::query_as::<_, ViolationRecord>(
        "SELECT * FROM violation_records WHERE session_id = $1 ORDER BY seq",
    )
    .bind(session_id)
    .fetch_all(&pool)
    .await
    .map_err(|e| {
        tracing::error!("Failed to list violations: {:?}", e);
        AppError::InternalServerError(e.to_string())
    })?;

    Ok(Json(records))
}

/// Lists every session of an exam for the proctor's monitor.
/// Admin only.
pub async fn list_exam_sessions(
    State(pool): State<PgPool>,
    Path(exam_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let sessions = sqlx::query_as::<_, SessionOverview>(
        r#"
        SELECT
            id, participant_id, status, violation_count, is_locked, lock_reason,
            last_persisted_at, submitted_at, late_submission
        FROM exam_sessions
        WHERE exam_id = $1
        ORDER BY is_locked DESC, violation_count DESC, id
        "#,
    )
    .bind(exam_id)
    .fetch_all(&pool)
    .await
    .map_err(|e| {
        tracing::error!("Failed to list sessions: {:?}", e);
        AppError::InternalServerError(e.to_string())
    })?;

    Ok(Json(sessions))
}

/// Scores one subjective question of a submitted session.
/// Admin only.
///
/// Objective rows are never touched; the returned summary is re-derived from
/// the stored rows.
pub async fn grade_question(
    State(pool): State<PgPool>,
    Extension(claims): Extension<Claims>,
    Path((session_id, question_id)): Path<(i64, i64)>,
    Json(payload): Json<ManualGradeRequest>,
) -> Result<impl IntoResponse, AppError> {
    if let Err(validation_errors) = payload.validate() {
        return Err(AppError::BadRequest(validation_errors.to_string()));
    }
    let grader_id = claims.subject_id()?;

    let mut tx = pool.begin().await?;
    let session = lock_session(&mut tx, session_id).await?;
    if !session.is_completed() {
        return Err(AppError::Conflict("Session has not been submitted".to_string()));
    }

    let mut record = load_record(&mut *tx, session_id).await?;
    record.apply_manual_grade(question_id, payload.score)?;

    sqlx::query(
        r#"
        UPDATE question_scores
        SET awarded = $1, graded = TRUE, graded_by = $2, graded_at = $3
        WHERE session_id = $4 AND question_id = $5
        "#,
    )
    .bind(payload.score)
    .bind(grader_id)
    .bind(Utc::now())
    .bind(session_id)
    .bind(question_id)
    .execute(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!("Failed to store manual grade: {:?}", e);
        AppError::InternalServerError(e.to_string())
    })?;
    tx.commit().await?;

    tracing::info!(session_id, question_id, score = payload.score, grader_id, "Question graded");

    Ok(Json(ScoreSummary::from_record(
        session_id,
        &record,
        session.late_submission,
    )))
}
