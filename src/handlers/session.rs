// src/handlers/session.rs

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use chrono::Utc;
use sqlx::{PgConnection, PgExecutor, PgPool, Postgres, QueryBuilder, types::Json as SqlJson};
use validator::Validate;

use crate::{
    error::AppError,
    models::{
        exam::Exam,
        question::{Question, QuestionKind},
        score::{QuestionScoreRow, ScoreSummary},
        session::{
            AnswerMap, AttemptStatus, ContentParams, ExamContent, ExamSession, ProgressRequest,
            ProgressResponse,
        },
    },
    scoring::{ScoreRecord, ScoringQuestion, score_submission},
    state::SessionPolicy,
    utils::jwt::Claims,
};

/// Opens (or resumes) the caller's session for an exam.
///
/// * Checks the exam window and the optional access token.
/// * Creates the session on first fetch (one per participant and exam).
/// * Returns the questions without answer keys, the server copy of the session,
///   and the remaining seconds computed from the exam end-time.
///
/// Also serves as the unlock check for locked clients.
pub async fn open_session(
    State(pool): State<PgPool>,
    Extension(claims): Extension<Claims>,
    Path(exam_id): Path<i64>,
    Query(params): Query<ContentParams>,
) -> Result<impl IntoResponse, AppError> {
    let participant_id = claims.subject_id()?;
    let exam = fetch_exam(&pool, exam_id).await?;
    exam.check_access(params.token.as_deref())?;

    let now = Utc::now();
    if !exam.has_started(now) {
        return Err(AppError::Forbidden("Exam has not started yet".to_string()));
    }

    sqlx::query(
        r#"
        INSERT INTO exam_sessions (exam_id, participant_id)
        VALUES ($1, $2)
        ON CONFLICT (exam_id, participant_id) DO NOTHING
        "#,
    )
    .bind(exam_id)
    .bind(participant_id)
    .execute(&pool)
    .await
    .map_err(|e| {
        tracing::error!("Failed to create session: {:?}", e);
        AppError::InternalServerError(e.to_string())
    })?;

    let session = sqlx::query_as::<_, ExamSession>(
        "SELECT * FROM exam_sessions WHERE exam_id = $1 AND participant_id = $2",
    )
    .bind(exam_id)
    .bind(participant_id)
    .fetch_one(&pool)
    .await?;

    let questions = load_questions(&pool, &exam, session.id).await?;
    let result = if session.is_completed() {
        Some(load_summary(&pool, &session).await?)
    } else {
        None
    };

    tracing::debug!(
        session_id = session.id,
        participant_id,
        locked = session.is_locked,
        "Exam content served"
    );

    Ok(Json(ExamContent {
        exam: exam.meta(),
        questions: questions
            .iter()
            .map(|(q, kind)| q.to_public(*kind))
            .collect(),
        session: session.snapshot(),
        remaining_seconds: exam.deadline().remaining_seconds(now),
        server_time: now,
        result,
    }))
}

/// Persists progress, or submits when `finished = true`.
///
/// * Completed session: autosave is rejected with 409; a repeated submission
///   returns the stored result without rescoring.
/// * Locked session: 403.
/// * Autosave after end-time plus grace: 409.
/// * Submission after end-time plus grace: accepted and flagged `late_submission`.
/// * Autosaves older than the last accepted one are ignored (last-write-wins).
pub async fn save_progress(
    State(pool): State<PgPool>,
    State(policy): State<SessionPolicy>,
    Extension(claims): Extension<Claims>,
    Path(session_id): Path<i64>,
    Json(payload): Json<ProgressRequest>,
) -> Result<impl IntoResponse, AppError> {
    if let Err(validation_errors) = payload.validate() {
        return Err(AppError::BadRequest(validation_errors.to_string()));
    }
    let participant_id = claims.subject_id()?;

    let mut tx = pool.begin().await?;
    let session = lock_session(&mut tx, session_id).await?;
    ensure_owner(&session, participant_id)?;

    if session.is_completed() {
        if payload.finished {
            let summary = load_summary(&mut *tx, &session).await?;
            tx.commit().await?;
            return Ok(Json(ProgressResponse {
                session_id,
                status: AttemptStatus::Completed,
                persisted_at: session.submitted_at.unwrap_or_else(Utc::now),
                late_submission: session.late_submission,
                result: Some(summary),
            }));
        }
        return Err(AppError::Conflict("Session already submitted".to_string()));
    }
    if session.is_locked {
        return Err(AppError::Forbidden("Session is locked".to_string()));
    }

    let exam = fetch_exam(&mut *tx, session.exam_id).await?;
    let questions = load_questions(&mut *tx, &exam, session.id).await?;
    let question_ids: Vec<i64> = questions.iter().map(|(q, _)| q.id).collect();
    let mut answers = payload.answers.clone();
    retain_known_answers(&mut answers, &question_ids);
    let current_question = i32::try_from(payload.current_question).unwrap_or(0);

    let now = Utc::now();
    let deadline = exam.deadline();

    if !payload.finished {
        if !deadline.accepts_writes(now, policy.late_grace) {
            return Err(AppError::Conflict("Exam time is over".to_string()));
        }

        if session.client_saved_at.is_some_and(|at| payload.saved_at < at) {
            tracing::debug!(session_id, "Ignoring stale autosave");
            tx.commit().await?;
            return Ok(Json(ProgressResponse {
                session_id,
                status: AttemptStatus::InProgress,
                persisted_at: session.last_persisted_at.unwrap_or(now),
                late_submission: false,
                result: None,
            }));
        }

        sqlx::query(
            r#"
            UPDATE exam_sessions
            SET answers = $1, current_question = $2, client_saved_at = $3, last_persisted_at = $4
            WHERE id = $5
            "#,
        )
        .bind(SqlJson(&answers))
        .bind(current_question)
        .bind(payload.saved_at)
        .bind(now)
        .bind(session_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            tracing::error!("Failed to persist progress: {:?}", e);
            AppError::InternalServerError(e.to_string())
        })?;
        tx.commit().await?;

        return Ok(Json(ProgressResponse {
            session_id,
            status: AttemptStatus::InProgress,
            persisted_at: now,
            late_submission: false,
            result: None,
        }));
    }

    // Submission: score the final answer set once.
    let late = deadline.is_late(now, policy.late_grace);
    if late {
        tracing::warn!(session_id, end_time = %deadline.end_time(), "Late submission accepted");
    }

    let scoring: Vec<ScoringQuestion> = questions
        .iter()
        .map(|(q, kind)| q.to_scoring(*kind))
        .collect();
    let record = score_submission(&scoring, &answers);

    sqlx::query(
        r#"
        UPDATE exam_sessions
        SET status = $1, answers = $2, current_question = $3, client_saved_at = $4,
            last_persisted_at = $5, submitted_at = $5, late_submission = $6
        WHERE id = $7
        "#,
    )
    .bind(AttemptStatus::Completed.as_str())
    .bind(SqlJson(&answers))
    .bind(current_question)
    .bind(payload.saved_at)
    .bind(now)
    .bind(late)
    .bind(session_id)
    .execute(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!("Failed to complete session: {:?}", e);
        AppError::InternalServerError(e.to_string())
    })?;

    insert_scores(&mut tx, session_id, &record).await?;
    tx.commit().await?;

    tracing::info!(
        session_id,
        total = record.total(),
        pending_manual = record.pending_manual(),
        "Session submitted"
    );

    Ok(Json(ProgressResponse {
        session_id,
        status: AttemptStatus::Completed,
        persisted_at: now,
        late_submission: late,
        result: Some(ScoreSummary::from_record(session_id, &record, late)),
    }))
}

/// Returns the result of a submitted session to its participant or an admin.
pub async fn get_result(
    State(pool): State<PgPool>,
    Extension(claims): Extension<Claims>,
    Path(session_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let session = sqlx::query_as::<_, ExamSession>("SELECT * FROM exam_sessions WHERE id = $1")
        .bind(session_id)
        .fetch_optional(&pool)
        .await?
        .ok_or(AppError::NotFound("Session not found".to_string()))?;

    if !claims.is_admin() {
        ensure_owner(&session, claims.subject_id()?)?;
    }
    if !session.is_completed() {
        return Err(AppError::Conflict("Session has not been submitted".to_string()));
    }

    Ok(Json(load_summary(&pool, &session).await?))
}

pub(crate) async fn fetch_exam<'e, E: PgExecutor<'e>>(
    executor: E,
    exam_id: i64,
) -> Result<Exam, AppError> {
    sqlx::query_as::<_, Exam>("SELECT * FROM exams WHERE id = $1")
        .bind(exam_id)
        .fetch_optional(executor)
        .await?
        .ok_or(AppError::NotFound("Exam not found".to_string()))
}

/// Loads a session row and holds its lock until the transaction ends.
/// Every write to a session goes through here.
pub(crate) async fn lock_session(
    conn: &mut PgConnection,
    session_id: i64,
) -> Result<ExamSession, AppError> {
    sqlx::query_as::<_, ExamSession>("SELECT * FROM exam_sessions WHERE id = $1 FOR UPDATE")
        .bind(session_id)
        .fetch_optional(conn)
        .await?
        .ok_or(AppError::NotFound("Session not found".to_string()))
}

fn ensure_owner(session: &ExamSession, participant_id: i64) -> Result<(), AppError> {
    if session.participant_id != participant_id {
        return Err(AppError::Forbidden("Session belongs to another participant".to_string()));
    }
    Ok(())
}

/// Loads the exam's questions in serving order and checks their invariants.
///
/// Randomized exams are shuffled deterministically per session, so a reload
/// shows the same order.
async fn load_questions<'e, E: PgExecutor<'e>>(
    executor: E,
    exam: &Exam,
    session_id: i64,
) -> Result<Vec<(Question, QuestionKind)>, AppError> {
    let questions = if exam.randomize_questions {
        sqlx::query_as::<_, Question>(
            r#"
            SELECT * FROM questions
            WHERE exam_id = $1
            ORDER BY md5(id::text || ':' || $2::text), id
            "#,
        )
        .bind(exam.id)
        .bind(session_id)
        .fetch_all(executor)
        .await?
    } else {
        sqlx::query_as::<_, Question>(
            "SELECT * FROM questions WHERE exam_id = $1 ORDER BY position, id",
        )
        .bind(exam.id)
        .fetch_all(executor)
        .await?
    };

    questions
        .into_iter()
        .map(|q| {
            let kind = q.check_invariants().map_err(|e| {
                tracing::error!("Refusing to serve malformed question: {}", e);
                AppError::InternalServerError(e)
            })?;
            Ok((q, kind))
        })
        .collect()
}

pub(crate) async fn load_record<'e, E: PgExecutor<'e>>(
    executor: E,
    session_id: i64,
) -> Result<ScoreRecord, AppError> {
    let rows = sqlx::query_as::<_, QuestionScoreRow>(
        "SELECT * FROM question_scores WHERE session_id = $1 ORDER BY question_id",
    )
    .bind(session_id)
    .fetch_all(executor)
    .await?;

    Ok(ScoreRecord::from_items(rows.iter().filter_map(|r| r.to_score())))
}

async fn load_summary<'e, E: PgExecutor<'e>>(
    executor: E,
    session: &ExamSession,
) -> Result<ScoreSummary, AppError> {
    let record = load_record(executor, session.id).await?;
    Ok(ScoreSummary::from_record(session.id, &record, session.late_submission))
}

/// Writes one row per question. Existing rows are kept, so the insert is safe to repeat.
async fn insert_scores(
    conn: &mut PgConnection,
    session_id: i64,
    record: &ScoreRecord,
) -> Result<(), AppError> {
    if record.is_empty() {
        return Ok(());
    }

    let mut query_builder = QueryBuilder::<Postgres>::new(
        "INSERT INTO question_scores (session_id, question_id, kind, awarded, max_points, is_correct, answered, graded) ",
    );
    query_builder.push_values(record.items(), |mut b, score| {
        b.push_bind(session_id)
            .push_bind(score.question_id)
            .push_bind(score.kind.as_str())
            .push_bind(score.awarded)
            .push_bind(score.max_points)
            .push_bind(score.is_correct)
            .push_bind(score.answered)
            .push_bind(score.graded);
    });
    query_builder.push(" ON CONFLICT (session_id, question_id) DO NOTHING");

    query_builder
        .build()
        .execute(conn)
        .await
        .map_err(|e| {
            tracing::error!("Failed to store scores: {:?}", e);
            AppError::InternalServerError(e.to_string())
        })?;
    Ok(())
}

/// Drops answers for questions outside the exam so they are never stored or scored.
fn retain_known_answers(answers: &mut AnswerMap, question_ids: &[i64]) {
    answers.retain(|id, _| question_ids.contains(id));
}
