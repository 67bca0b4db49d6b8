// src/models/session.rs

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, types::Json};
use validator::Validate;

use crate::models::{exam::ExamMeta, question::PublicQuestion, score::ScoreSummary};

/// Participant answers.
/// Key: Question ID. Value: the chosen label or free text.
/// Sparse: unanswered questions are absent.
pub type AnswerMap = BTreeMap<i64, String>;

/// Durable status of a session on the server.
/// Lock state is tracked separately (`is_locked`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    InProgress,
    Completed,
}

impl AttemptStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }
}

/// Represents the 'exam_sessions' table in the database.
#[derive(Debug, Clone, FromRow)]
pub struct ExamSession {
    pub id: i64,
    pub exam_id: i64,
    pub participant_id: i64,
    pub status: String,
    pub answers: Json<AnswerMap>,
    pub current_question: i32,
    pub violation_count: i32,
    pub is_locked: bool,
    pub lock_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_persisted_at: Option<DateTime<Utc>>,
    pub client_saved_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub late_submission: bool,
    pub unlocked_at: Option<DateTime<Utc>>,
}

impl ExamSession {
    pub fn status(&self) -> AttemptStatus {
        if self.status == AttemptStatus::Completed.as_str() {
            AttemptStatus::Completed
        } else {
            AttemptStatus::InProgress
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status() == AttemptStatus::Completed
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id,
            status: self.status(),
            answers: self.answers.0.clone(),
            current_question: u32::try_from(self.current_question).unwrap_or(0),
            violation_count: u32::try_from(self.violation_count).unwrap_or(0),
            is_locked: self.is_locked,
            lock_reason: self.lock_reason.clone(),
            client_saved_at: self.client_saved_at,
        }
    }
}

/// The server copy of a session as returned to its participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: i64,
    pub status: AttemptStatus,
    pub answers: AnswerMap,
    pub current_question: u32,
    pub violation_count: u32,
    pub is_locked: bool,
    pub lock_reason: Option<String>,

    /// Client timestamp of the snapshot the server last accepted.
    pub client_saved_at: Option<DateTime<Utc>>,
}

/// Query string of the content fetch.
#[derive(Debug, Deserialize)]
pub struct ContentParams {
    pub token: Option<String>,
}

/// DTO returned by the exam content fetch (also used as the unlock check).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamContent {
    pub exam: ExamMeta,
    pub questions: Vec<PublicQuestion>,
    pub session: SessionSnapshot,

    /// Computed server-side from the exam end-time.
    pub remaining_seconds: i64,
    pub server_time: DateTime<Utc>,

    /// Present when the session was already submitted.
    #[serde(default)]
    pub result: Option<ScoreSummary>,
}

/// DTO for autosave and submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ProgressRequest {
    #[validate(custom(function = validate_answers))]
    pub answers: AnswerMap,

    #[validate(range(max = 10000))]
    pub current_question: u32,

    /// `true` turns this write into the submission.
    #[serde(default)]
    pub finished: bool,

    /// Client timestamp of the snapshot, used for last-write-wins reconciliation.
    pub saved_at: DateTime<Utc>,
}

/// Caps answer count and size to keep a single write bounded.
fn validate_answers(answers: &AnswerMap) -> Result<(), validator::ValidationError> {
    if answers.len() > 1000 {
        return Err(validator::ValidationError::new("too_many_answers"));
    }
    for value in answers.values() {
        if value.len() > 20000 {
            return Err(validator::ValidationError::new("answer_too_long"));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressResponse {
    pub session_id: i64,
    pub status: AttemptStatus,
    pub persisted_at: DateTime<Utc>,

    /// Set when the submission arrived after the authoritative end-time.
    pub late_submission: bool,

    /// Present once the session is completed.
    pub result: Option<ScoreSummary>,
}

/// DTO for reporting an integrity violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ViolationReport {
    #[validate(length(min = 1, max = 200))]
    pub reason: String,

    /// The client's count after this violation.
    pub violation_count: u32,

    /// The client's lock decision.
    pub lock: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationAck {
    pub seq: i32,
    pub violation_count: u32,
    pub is_locked: bool,
}

/// Represents the 'violation_records' table in the database.
/// Append-only.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub id: i64,
    pub session_id: i64,
    pub seq: i32,
    pub reason: String,
    pub reported_count: i32,
    pub triggered_lock: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Row of the proctor's exam monitor.
#[derive(Debug, Serialize, FromRow)]
pub struct SessionOverview {
    pub id: i64,
    pub participant_id: i64,
    pub status: String,
    pub violation_count: i32,
    pub is_locked: bool,
    pub lock_reason: Option<String>,
    pub last_persisted_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub late_submission: bool,
}
