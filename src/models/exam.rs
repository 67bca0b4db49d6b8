// src/models/exam.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::{engine::clock::ServerDeadline, error::AppError};

/// Represents the 'exams' table in the database.
/// Authored elsewhere; read-only to the session engine.
#[derive(Debug, Clone, FromRow)]
pub struct Exam {
    pub id: i64,
    pub title: String,
    pub duration_minutes: i32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,

    /// Optional shared secret participants must present to open the exam.
    pub access_token: Option<String>,

    /// Serve questions in a per-session shuffled order.
    pub randomize_questions: bool,
}

impl Exam {
    pub fn meta(&self) -> ExamMeta {
        ExamMeta {
            id: self.id,
            title: self.title.clone(),
            duration_minutes: self.duration_minutes,
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }

    /// The authoritative end of the exam window.
    pub fn deadline(&self) -> ServerDeadline {
        ServerDeadline::new(self.end_time)
    }

    pub fn check_access(&self, presented: Option<&str>) -> Result<(), AppError> {
        match (&self.access_token, presented) {
            (None, _) => Ok(()),
            (Some(expected), Some(given)) if expected == given => Ok(()),
            _ => Err(AppError::Forbidden("Invalid exam access token".to_string())),
        }
    }

    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        now >= self.start_time
    }
}

/// Exam metadata sent alongside the question list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamMeta {
    pub id: i64,
    pub title: String,
    pub duration_minutes: i32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}
