// src/scoring.rs

//! Scoring of submitted answer sets.
//!
//! Objective items are scored once, at submission, from the final answer map.
//! Subjective items start at zero and are filled in later by a grader without
//! touching the objective rows. Totals are always re-derived from the rows.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{question::QuestionKind, session::AnswerMap};

/// The slice of a question the scorer needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoringQuestion {
    pub id: i64,
    pub kind: QuestionKind,
    pub correct_label: Option<String>,
    pub points: i32,
}

/// Awarded score of a single question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionScore {
    pub question_id: i64,
    pub kind: QuestionKind,
    pub awarded: i32,
    pub max_points: i32,

    /// `None` for subjective items.
    pub is_correct: Option<bool>,
    pub answered: bool,

    /// Objective items are graded on submission; subjective ones once a grader scores them.
    pub graded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GradeError {
    #[error("question {0} is not part of this submission")]
    UnknownQuestion(i64),

    #[error("question {0} is objective and scored automatically")]
    ObjectiveQuestion(i64),

    #[error("score {awarded} for question {question_id} is outside 0..={max_points}")]
    OutOfRange {
        question_id: i64,
        awarded: i32,
        max_points: i32,
    },
}

/// Per-question scores of one submission, keyed by question id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScoreRecord {
    items: BTreeMap<i64, QuestionScore>,
}

impl ScoreRecord {
    pub fn from_items(items: impl IntoIterator<Item = QuestionScore>) -> Self {
        Self {
            items: items.into_iter().map(|s| (s.question_id, s)).collect(),
        }
    }

    pub fn items(&self) -> impl Iterator<Item = &QuestionScore> {
        self.items.values()
    }

    pub fn get(&self, question_id: i64) -> Option<&QuestionScore> {
        self.items.get(&question_id)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn total(&self) -> i64 {
        self.items().map(|s| i64::from(s.awarded)).sum()
    }

    pub fn objective_total(&self) -> i64 {
        self.sum_kind(QuestionKind::Objective)
    }

    pub fn subjective_total(&self) -> i64 {
        self.sum_kind(QuestionKind::Subjective)
    }

    pub fn max_total(&self) -> i64 {
        self.items().map(|s| i64::from(s.max_points)).sum()
    }

    pub fn correct_count(&self) -> usize {
        self.items().filter(|s| s.is_correct == Some(true)).count()
    }

    pub fn incorrect_count(&self) -> usize {
        self.items()
            .filter(|s| s.answered && s.is_correct == Some(false))
            .count()
    }

    pub fn unanswered_count(&self) -> usize {
        self.items().filter(|s| !s.answered).count()
    }

    pub fn pending_manual(&self) -> usize {
        self.items()
            .filter(|s| s.kind == QuestionKind::Subjective && !s.graded)
            .count()
    }

    /// Overwrites the score of one subjective item. Objective rows are never touched.
    pub fn apply_manual_grade(&mut self, question_id: i64, awarded: i32) -> Result<(), GradeError> {
        let item = self
            .items
            .get_mut(&question_id)
            .ok_or(GradeError::UnknownQuestion(question_id))?;

        if item.kind == QuestionKind::Objective {
            return Err(GradeError::ObjectiveQuestion(question_id));
        }
        if awarded < 0 || awarded > item.max_points {
            return Err(GradeError::OutOfRange {
                question_id,
                awarded,
                max_points: item.max_points,
            });
        }

        item.awarded = awarded;
        item.graded = true;
        Ok(())
    }

    fn sum_kind(&self, kind: QuestionKind) -> i64 {
        self.items()
            .filter(|s| s.kind == kind)
            .map(|s| i64::from(s.awarded))
            .sum()
    }
}

fn is_answered(value: Option<&String>) -> bool {
    value.is_some_and(|v| !v.trim().is_empty())
}

/// Scores a final answer map against its question set.
///
/// * Objective: full points on an exact label match, else 0.
/// * Subjective: 0 and ungraded until a grader scores it.
///
/// Answers for questions outside the set are ignored; questions without an
/// answer score 0.
pub fn score_submission(questions: &[ScoringQuestion], answers: &AnswerMap) -> ScoreRecord {
    let items = questions.iter().map(|q| {
        let given = answers.get(&q.id);
        let answered = is_answered(given);

        match q.kind {
            QuestionKind::Objective => {
                // Case-sensitive label compare; a question without a key never matches.
                let correct = answered && given.map(String::as_str) == q.correct_label.as_deref();
                QuestionScore {
                    question_id: q.id,
                    kind: q.kind,
                    awarded: if correct { q.points } else { 0 },
                    max_points: q.points,
                    is_correct: Some(correct),
                    answered,
                    graded: true,
                }
            }
            QuestionKind::Subjective => QuestionScore {
                question_id: q.id,
                kind: q.kind,
                awarded: 0,
                max_points: q.points,
                is_correct: None,
                answered,
                graded: false,
            },
        }
    });

    ScoreRecord::from_items(items)
}
