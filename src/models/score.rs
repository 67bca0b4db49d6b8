// src/models/score.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

use crate::{
    models::question::QuestionKind,
    scoring::{QuestionScore, ScoreRecord},
};

/// Represents the 'question_scores' table in the database.
/// One row per question of a submitted session.
#[derive(Debug, Clone, FromRow)]
pub struct QuestionScoreRow {
    pub session_id: i64,
    pub question_id: i64,
    pub kind: String,
    pub awarded: i32,
    pub max_points: i32,
    pub is_correct: Option<bool>,
    pub answered: bool,
    pub graded: bool,
    pub graded_by: Option<i64>,
    pub graded_at: Option<DateTime<Utc>>,
}

impl QuestionScoreRow {
    pub fn to_score(&self) -> Option<QuestionScore> {
        Some(QuestionScore {
            question_id: self.question_id,
            kind: QuestionKind::parse(&self.kind)?,
            awarded: self.awarded,
            max_points: self.max_points,
            is_correct: self.is_correct,
            answered: self.answered,
            graded: self.graded,
        })
    }
}

/// Result of a submitted session.
/// Every aggregate is derived from `questions`; nothing is cached separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreSummary {
    pub session_id: i64,
    pub objective_score: i64,
    pub subjective_score: i64,
    pub total: i64,
    pub max_total: i64,
    pub correct_count: usize,
    pub incorrect_count: usize,
    pub unanswered_count: usize,

    /// Subjective questions still waiting for a grader.
    pub pending_manual: usize,
    pub late_submission: bool,
    pub questions: Vec<QuestionScore>,
}

impl ScoreSummary {
    pub fn from_record(session_id: i64, record: &ScoreRecord, late_submission: bool) -> Self {
        Self {
            session_id,
            objective_score: record.objective_total(),
            subjective_score: record.subjective_total(),
            total: record.total(),
            max_total: record.max_total(),
            correct_count: record.correct_count(),
            incorrect_count: record.incorrect_count(),
            unanswered_count: record.unanswered_count(),
            pending_manual: record.pending_manual(),
            late_submission,
            questions: record.items().cloned().collect(),
        }
    }
}

/// DTO for a grader scoring a subjective item.
#[derive(Debug, Deserialize, Validate)]
pub struct ManualGradeRequest {
    #[validate(range(min = 0, max = 10000))]
    pub score: i32,
}
