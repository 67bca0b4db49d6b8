// src/models/question.rs

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, types::Json};

use crate::scoring::ScoringQuestion;

/// Auto-gradable (`objective`) or human-gradable (`subjective`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    Objective,
    Subjective,
}

impl QuestionKind {
    /// String form stored in the `kind` column.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Objective => "objective",
            Self::Subjective => "subjective",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "objective" => Some(Self::Objective),
            "subjective" => Some(Self::Subjective),
            _ => None,
        }
    }
}

impl fmt::Display for QuestionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A labeled answer option of an objective question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub label: String,
    pub text: String,
}

/// Represents the 'questions' table in the database.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Question {
    pub id: i64,
    pub exam_id: i64,

    /// 'objective' or 'subjective'.
    pub kind: String,

    /// Rendering payload. Opaque to the session engine.
    pub content: Json<serde_json::Value>,

    /// Labeled options. Empty for subjective questions.
    pub choices: Json<Vec<Choice>>,

    /// The correct choice label. Never sent to participants.
    pub correct_label: Option<String>,

    pub points: i32,
    pub position: i32,
}

impl Question {
    /// Checks the shape rules a question must satisfy before it can be served or scored:
    /// objective questions carry exactly one correct label found among their choices,
    /// subjective questions carry none, and every question is worth more than zero points.
    pub fn check_invariants(&self) -> Result<QuestionKind, String> {
        let kind = QuestionKind::parse(&self.kind)
            .ok_or_else(|| format!("question {} has unknown kind '{}'", self.id, self.kind))?;

        if self.points <= 0 {
            return Err(format!("question {} has non-positive points", self.id));
        }

        match kind {
            QuestionKind::Objective => {
                let label = self
                    .correct_label
                    .as_deref()
                    .ok_or_else(|| format!("objective question {} has no correct label", self.id))?;
                let matches = self.choices.iter().filter(|c| c.label == label).count();
                if matches != 1 {
                    return Err(format!(
                        "objective question {} must have exactly one choice labeled '{}', found {}",
                        self.id, label, matches
                    ));
                }
            }
            QuestionKind::Subjective => {
                if self.correct_label.is_some() {
                    return Err(format!(
                        "subjective question {} must not carry a correct label",
                        self.id
                    ));
                }
            }
        }

        Ok(kind)
    }

    /// Converts into the participant-facing DTO, dropping the answer key.
    pub fn to_public(&self, kind: QuestionKind) -> PublicQuestion {
        PublicQuestion {
            id: self.id,
            kind,
            content: self.content.0.clone(),
            choices: self.choices.0.clone(),
            points: self.points,
        }
    }

    pub fn to_scoring(&self, kind: QuestionKind) -> ScoringQuestion {
        ScoringQuestion {
            id: self.id,
            kind,
            correct_label: self.correct_label.clone(),
            points: self.points,
        }
    }
}

/// DTO for sending question to client (excludes the correct label).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicQuestion {
    pub id: i64,
    pub kind: QuestionKind,
    pub content: serde_json::Value,
    pub choices: Vec<Choice>,
    pub points: i32,
}
