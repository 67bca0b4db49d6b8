// src/engine/state_machine.rs

//! Session state machine as a pure function.
//!
//! ```text
//! loading → active ⇄ temporarily_locked
//!           active | temporarily_locked → permanently_locked   (count ≥ threshold, or server lock)
//!           active | temporarily_locked → submitting → completed
//! ```
//!
//! [`transition`] performs no I/O and reads no clock. Network work is returned
//! as [`Effect`]s for the runner to execute.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{score::ScoreSummary, session::AnswerMap};

pub const DEFAULT_LOCK_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Loading,
    Active,
    TemporarilyLocked,
    PermanentlyLocked,
    Submitting,
    Completed,
}

impl SessionStatus {
    /// States from which a submission may start.
    pub const fn can_submit(self) -> bool {
        matches!(self, Self::Active | Self::TemporarilyLocked)
    }
}

/// A violation as tracked by the client for audit display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalViolation {
    pub seq: u32,
    pub reason: String,
    pub at: DateTime<Utc>,
    pub triggered_lock: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitTrigger {
    Manual,
    TimeUp,
}

/// Network work requested by a transition, executed in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Persist,
    ReportViolation { reason: String, count: u32, lock: bool },
    Submit { trigger: SubmitTrigger },
}

/// Why an event was refused. Advisory: the state is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Unanswered(Vec<i64>),
    NotAccepting(SessionStatus),
    UnknownQuestion(i64),
}

/// Data needed to leave `Loading`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedSession {
    pub session_id: i64,
    pub question_ids: Vec<i64>,
    pub answers: AnswerMap,
    pub current_question: u32,
    pub violation_count: u32,
    pub is_locked: bool,
    pub lock_reason: Option<String>,
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Loaded(LoadedSession),
    Answered { question_id: i64, value: String },
    Navigated(u32),
    Violation { reason: String, at: DateTime<Utc> },
    FullscreenRestored,
    SubmitRequested,
    TimeUp,
    SubmitSucceeded(ScoreSummary),
    SubmitFailed(String),
    /// The server reports the session locked, whether or not this client asked.
    LockImposed {
        violation_count: Option<u32>,
        reason: Option<String>,
    },
    UnlockObserved { violation_count: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub session_id: Option<i64>,
    pub status: SessionStatus,
    pub question_ids: Vec<i64>,
    pub answers: AnswerMap,
    pub current_question: u32,

    /// Count reported to the server. Frozen once permanently locked.
    pub violation_count: u32,

    /// Occurrences observed while permanently locked.
    pub suppressed_violations: u32,
    pub violations: Vec<LocalViolation>,
    pub lock_threshold: u32,
    pub lock_reason: Option<String>,

    /// The server confirmed the lock; no further lock requests are sent.
    pub lock_acknowledged: bool,

    /// Single-entry guard shared by the manual and time-up submission paths.
    pub submit_in_flight: bool,
    pub time_up: bool,

    /// Status to return to if the submission fails.
    pub resume_status: Option<SessionStatus>,
    pub last_error: Option<String>,
    pub result: Option<ScoreSummary>,
}

impl SessionState {
    pub fn new(lock_threshold: u32) -> Self {
        Self {
            session_id: None,
            status: SessionStatus::Loading,
            question_ids: Vec::new(),
            answers: AnswerMap::new(),
            current_question: 0,
            violation_count: 0,
            suppressed_violations: 0,
            violations: Vec::new(),
            lock_threshold: lock_threshold.max(1),
            lock_reason: None,
            lock_acknowledged: false,
            submit_in_flight: false,
            time_up: false,
            resume_status: None,
            last_error: None,
            result: None,
        }
    }

    /// Questions without a non-blank answer, in served order.
    pub fn unanswered(&self) -> Vec<i64> {
        self.question_ids
            .iter()
            .copied()
            .filter(|id| self.answers.get(id).is_none_or(|v| v.trim().is_empty()))
            .collect()
    }

    /// Every counted or suppressed occurrence, for audit display.
    pub fn observed_violations(&self) -> u32 {
        self.violation_count + self.suppressed_violations
    }

    /// No violation may be recorded in this state.
    pub fn detection_suspended(&self) -> bool {
        self.submit_in_flight
            || self.time_up
            || matches!(
                self.status,
                SessionStatus::Loading | SessionStatus::Submitting | SessionStatus::Completed
            )
    }

    fn begin_submission(&mut self, trigger: SubmitTrigger) -> Vec<Effect> {
        self.resume_status = Some(self.status);
        self.status = SessionStatus::Submitting;
        self.submit_in_flight = true;
        self.last_error = None;
        vec![Effect::Persist, Effect::Submit { trigger }]
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_THRESHOLD)
    }
}

/// Outcome of applying one event.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: SessionState,
    pub effects: Vec<Effect>,
    pub rejection: Option<Rejection>,
}

impl Transition {
    fn to(state: SessionState, effects: Vec<Effect>) -> Self {
        Self {
            state,
            effects,
            rejection: None,
        }
    }

    fn unchanged(state: &SessionState) -> Self {
        Self::to(state.clone(), Vec::new())
    }

    fn rejected(state: &SessionState, rejection: Rejection) -> Self {
        Self {
            state: state.clone(),
            effects: Vec::new(),
            rejection: Some(rejection),
        }
    }
}

/// Applies `event` to `current` and returns the next state plus requested effects.
pub fn transition(current: &SessionState, event: Event) -> Transition {
    use SessionStatus::*;

    match event {
        Event::Loaded(loaded) => {
            if current.status != Loading {
                return Transition::unchanged(current);
            }
            let mut next = current.clone();
            next.session_id = Some(loaded.session_id);
            next.question_ids = loaded.question_ids;
            next.answers = loaded.answers;
            next.current_question = loaded.current_question;
            next.violation_count = loaded.violation_count;

            next.status = if loaded.completed {
                Completed
            } else if loaded.is_locked {
                next.lock_reason = loaded.lock_reason;
                next.lock_acknowledged = true;
                PermanentlyLocked
            } else {
                Active
            };
            Transition::to(next, Vec::new())
        }

        Event::Answered { question_id, value } => {
            if current.status != Active {
                return Transition::rejected(current, Rejection::NotAccepting(current.status));
            }
            if !current.question_ids.contains(&question_id) {
                return Transition::rejected(current, Rejection::UnknownQuestion(question_id));
            }
            let mut next = current.clone();
            if value.trim().is_empty() {
                next.answers.remove(&question_id);
            } else {
                next.answers.insert(question_id, value);
            }
            Transition::to(next, Vec::new())
        }

        Event::Navigated(index) => {
            if !matches!(current.status, Active | TemporarilyLocked) {
                return Transition::unchanged(current);
            }
            let last = u32::try_from(current.question_ids.len().saturating_sub(1)).unwrap_or(0);
            let mut next = current.clone();
            next.current_question = index.min(last);
            Transition::to(next, Vec::new())
        }

        Event::Violation { reason, at } => match current.status {
            Active | TemporarilyLocked if !current.detection_suspended() => {
                let mut next = current.clone();
                next.violation_count += 1;
                let lock = next.violation_count >= next.lock_threshold;
                next.violations.push(LocalViolation {
                    seq: u32::try_from(next.violations.len() + 1).unwrap_or(u32::MAX),
                    reason: reason.clone(),
                    at,
                    triggered_lock: lock,
                });

                let report = Effect::ReportViolation {
                    reason: reason.clone(),
                    count: next.violation_count,
                    lock,
                };
                if lock {
                    next.status = PermanentlyLocked;
                    next.lock_reason = Some(reason);
                    next.lock_acknowledged = false;
                    // Answers are flushed before the lock lands server-side.
                    Transition::to(next, vec![Effect::Persist, report])
                } else {
                    next.status = TemporarilyLocked;
                    Transition::to(next, vec![report])
                }
            }
            PermanentlyLocked => {
                let mut next = current.clone();
                next.suppressed_violations += 1;
                let effects = if next.lock_acknowledged {
                    Vec::new()
                } else {
                    vec![Effect::ReportViolation {
                        reason,
                        count: next.violation_count,
                        lock: true,
                    }]
                };
                Transition::to(next, effects)
            }
            _ => Transition::unchanged(current),
        },

        Event::FullscreenRestored => {
            if current.status != TemporarilyLocked || current.submit_in_flight {
                return Transition::unchanged(current);
            }
            let mut next = current.clone();
            next.status = Active;
            Transition::to(next, Vec::new())
        }

        Event::SubmitRequested => {
            if current.submit_in_flight || current.status == Submitting {
                return Transition::unchanged(current);
            }
            if !current.status.can_submit() {
                return Transition::rejected(current, Rejection::NotAccepting(current.status));
            }
            // After time-up this is a retry of the automatic submission, which
            // is never gated on completeness.
            if !current.time_up {
                let unanswered = current.unanswered();
                if !unanswered.is_empty() {
                    return Transition::rejected(current, Rejection::Unanswered(unanswered));
                }
            }
            let mut next = current.clone();
            let effects = next.begin_submission(SubmitTrigger::Manual);
            Transition::to(next, effects)
        }

        Event::TimeUp => {
            if current.time_up || current.status == Completed {
                return Transition::unchanged(current);
            }
            let mut next = current.clone();
            next.time_up = true;
            if next.submit_in_flight || !next.status.can_submit() {
                return Transition::to(next, Vec::new());
            }
            let effects = next.begin_submission(SubmitTrigger::TimeUp);
            Transition::to(next, effects)
        }

        Event::SubmitSucceeded(summary) => {
            if current.status != Submitting {
                return Transition::unchanged(current);
            }
            let mut next = current.clone();
            next.status = Completed;
            next.submit_in_flight = false;
            next.resume_status = None;
            next.last_error = None;
            next.result = Some(summary);
            Transition::to(next, Vec::new())
        }

        Event::SubmitFailed(message) => {
            if current.status != Submitting {
                return Transition::unchanged(current);
            }
            let mut next = current.clone();
            next.status = next.resume_status.take().unwrap_or(Active);
            next.submit_in_flight = false;
            next.last_error = Some(message);
            Transition::to(next, Vec::new())
        }

        Event::LockImposed {
            violation_count,
            reason,
        } => {
            let mut next = current.clone();
            if let Some(count) = violation_count {
                next.violation_count = next.violation_count.max(count);
            }
            if reason.is_some() && next.lock_reason.is_none() {
                next.lock_reason = reason;
            }
            next.lock_acknowledged = true;

            match current.status {
                Active | TemporarilyLocked => next.status = PermanentlyLocked,
                // A failing submission falls back into the lock.
                Submitting => next.resume_status = Some(PermanentlyLocked),
                PermanentlyLocked => {}
                Loading | Completed => return Transition::unchanged(current),
            }
            Transition::to(next, Vec::new())
        }

        Event::UnlockObserved { violation_count } => {
            if current.status != PermanentlyLocked {
                return Transition::unchanged(current);
            }
            let mut next = current.clone();
            next.status = Active;
            next.violation_count = violation_count;
            next.lock_reason = None;
            next.lock_acknowledged = false;
            if next.time_up {
                // The deadline passed while locked; submit what was captured.
                let effects = next.begin_submission(SubmitTrigger::TimeUp);
                return Transition::to(next, effects);
            }
            // Pushes answers recovered from the stash while the server refused writes.
            Transition::to(next, vec![Effect::Persist])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(question_ids: &[i64]) -> SessionState {
        let t = transition(
            &SessionState::new(DEFAULT_LOCK_THRESHOLD),
            Event::Loaded(LoadedSession {
                session_id: 42,
                question_ids: question_ids.to_vec(),
                answers: AnswerMap::new(),
                current_question: 0,
                violation_count: 0,
                is_locked: false,
                lock_reason: None,
                completed: false,
            }),
        );
        assert_eq!(t.state.status, SessionStatus::Active);
        t.state
    }

    fn apply(state: &SessionState, event: Event) -> SessionState {
        transition(state, event).state
    }

    fn violation() -> Event {
        Event::Violation {
            reason: "fullscreen_exit".to_string(),
            at: Utc::now(),
        }
    }

    fn answer(state: &SessionState, id: i64, value: &str) -> SessionState {
        apply(
            state,
            Event::Answered {
                question_id: id,
                value: value.to_string(),
            },
        )
    }

    fn acknowledged() -> Event {
        Event::LockImposed {
            violation_count: None,
            reason: None,
        }
    }

    fn answer_rejection(state: &SessionState) -> Option<Rejection> {
        transition(
            state,
            Event::Answered {
                question_id: 1,
                value: "A".to_string(),
            },
        )
        .rejection
    }

    fn summary() -> ScoreSummary {
        ScoreSummary {
            session_id: 42,
            objective_score: 0,
            subjective_score: 0,
            total: 0,
            max_total: 0,
            correct_count: 0,
            incorrect_count: 0,
            unanswered_count: 0,
            pending_manual: 0,
            late_submission: false,
            questions: Vec::new(),
        }
    }

    #[test]
    fn lock_status_follows_threshold() {
        for threshold in 1..=7 {
            let mut state = loaded(&[1]);
            state.lock_threshold = threshold;
            for n in 1..=threshold + 2 {
                state = apply(&state, violation());
                if n < threshold {
                    assert_eq!(state.status, SessionStatus::TemporarilyLocked, "n={n}");
                } else {
                    assert_eq!(state.status, SessionStatus::PermanentlyLocked, "n={n}");
                }
                // Re-enter to leave the temporary lock between occurrences.
                state = apply(&state, Event::FullscreenRestored);
            }
        }
    }

    #[test]
    fn reentry_restores_active_without_touching_answers_or_count() {
        let state = answer(&loaded(&[1, 2]), 1, "A");
        let locked = apply(&state, violation());
        assert_eq!(locked.status, SessionStatus::TemporarilyLocked);

        let restored = apply(&locked, Event::FullscreenRestored);
        assert_eq!(restored.status, SessionStatus::Active);
        assert_eq!(restored.answers, state.answers);
        assert_eq!(restored.violation_count, 1);
    }

    #[test]
    fn reentry_does_not_lift_permanent_lock() {
        let mut state = loaded(&[1]);
        state.lock_threshold = 1;
        let locked = apply(&state, violation());
        assert_eq!(locked.status, SessionStatus::PermanentlyLocked);
        assert_eq!(
            apply(&locked, Event::FullscreenRestored).status,
            SessionStatus::PermanentlyLocked
        );
    }

    #[test]
    fn four_exits_then_fifth_locks_and_count_freezes() {
        let mut state = loaded(&[1, 2]);
        for n in 1..=4 {
            let t = transition(&state, violation());
            assert_eq!(t.state.status, SessionStatus::TemporarilyLocked);
            assert_eq!(
                t.effects,
                vec![Effect::ReportViolation {
                    reason: "fullscreen_exit".to_string(),
                    count: n,
                    lock: false,
                }]
            );
            state = apply(&t.state, Event::FullscreenRestored);
            assert_eq!(state.status, SessionStatus::Active);
        }

        let t = transition(&state, violation());
        assert_eq!(t.state.status, SessionStatus::PermanentlyLocked);
        assert_eq!(t.state.violation_count, 5);
        assert_eq!(t.state.lock_reason.as_deref(), Some("fullscreen_exit"));
        assert_eq!(
            t.effects,
            vec![
                Effect::Persist,
                Effect::ReportViolation {
                    reason: "fullscreen_exit".to_string(),
                    count: 5,
                    lock: true,
                }
            ]
        );
        assert!(t.state.violations.last().unwrap().triggered_lock);

        let mut state = apply(&t.state, acknowledged());
        for _ in 0..3 {
            let t = transition(&state, violation());
            assert!(t.effects.is_empty());
            state = t.state;
        }
        assert_eq!(state.violation_count, 5);
        assert_eq!(state.suppressed_violations, 3);
        assert_eq!(state.observed_violations(), 8);
        assert_eq!(state.violations.len(), 5);
    }

    #[test]
    fn lock_request_is_resent_only_until_acknowledged() {
        let mut state = loaded(&[1]);
        state.lock_threshold = 1;
        let locked = apply(&state, violation());

        let t = transition(&locked, violation());
        assert_eq!(
            t.effects,
            vec![Effect::ReportViolation {
                reason: "fullscreen_exit".to_string(),
                count: 1,
                lock: true,
            }]
        );
        assert_eq!(t.state.violation_count, 1);

        let acked = apply(&t.state, acknowledged());
        assert!(transition(&acked, violation()).effects.is_empty());
    }

    #[test]
    fn loaded_locked_session_goes_straight_to_permanent_lock() {
        let t = transition(
            &SessionState::default(),
            Event::Loaded(LoadedSession {
                session_id: 9,
                question_ids: vec![1, 2],
                answers: AnswerMap::from([(1, "A".to_string())]),
                current_question: 1,
                violation_count: 5,
                is_locked: true,
                lock_reason: Some("tab_switch".to_string()),
                completed: false,
            }),
        );
        assert_eq!(t.state.status, SessionStatus::PermanentlyLocked);
        assert_eq!(t.state.violation_count, 5);
        assert_eq!(t.state.lock_reason.as_deref(), Some("tab_switch"));
        assert!(t.state.lock_acknowledged);
    }

    #[test]
    fn manual_submit_requires_every_answer() {
        let state = answer(&loaded(&[1, 2, 3]), 2, "B");
        let t = transition(&state, Event::SubmitRequested);
        assert_eq!(t.rejection, Some(Rejection::Unanswered(vec![1, 3])));
        assert_eq!(t.state, state);
        assert!(t.effects.is_empty());
    }

    #[test]
    fn double_fire_of_submit_and_timeout_yields_one_submission() {
        let state = answer(&answer(&loaded(&[1, 2]), 1, "A"), 2, "B");

        let first = transition(&state, Event::SubmitRequested);
        assert_eq!(first.state.status, SessionStatus::Submitting);
        assert_eq!(
            first.effects,
            vec![
                Effect::Persist,
                Effect::Submit {
                    trigger: SubmitTrigger::Manual
                }
            ]
        );

        let second = transition(&first.state, Event::TimeUp);
        assert!(second.effects.is_empty());
        let third = transition(&second.state, Event::SubmitRequested);
        assert!(third.effects.is_empty());

        let done = apply(&third.state, Event::SubmitSucceeded(summary()));
        assert_eq!(done.status, SessionStatus::Completed);
        let after = transition(&done, Event::TimeUp);
        assert!(after.effects.is_empty());
        assert_eq!(after.state.status, SessionStatus::Completed);
    }

    #[test]
    fn timeout_submits_with_unanswered_questions() {
        let state = answer(&answer(&loaded(&[1, 2, 3, 4, 5]), 1, "A"), 4, "C");
        let t = transition(&state, Event::TimeUp);
        assert_eq!(t.state.status, SessionStatus::Submitting);
        assert!(t.state.time_up);
        assert_eq!(
            t.effects,
            vec![
                Effect::Persist,
                Effect::Submit {
                    trigger: SubmitTrigger::TimeUp
                }
            ]
        );
        assert_eq!(t.state.answers.len(), 2);
    }

    #[test]
    fn timeout_from_temporary_lock_still_submits() {
        let state = apply(&loaded(&[1]), violation());
        let t = transition(&state, Event::TimeUp);
        assert_eq!(t.state.status, SessionStatus::Submitting);
    }

    #[test]
    fn violations_during_submission_are_ignored() {
        let state = answer(&loaded(&[1]), 1, "A");
        let submitting = apply(&state, Event::SubmitRequested);
        let t = transition(&submitting, violation());
        assert!(t.effects.is_empty());
        assert_eq!(t.state.violation_count, 0);
        assert_eq!(t.state.status, SessionStatus::Submitting);
    }

    #[test]
    fn failed_submission_resets_guard_and_keeps_answers() {
        let state = answer(&loaded(&[1]), 1, "A");
        let submitting = apply(&state, Event::SubmitRequested);
        let failed = apply(&submitting, Event::SubmitFailed("offline".to_string()));

        assert_eq!(failed.status, SessionStatus::Active);
        assert!(!failed.submit_in_flight);
        assert_eq!(failed.last_error.as_deref(), Some("offline"));
        assert_eq!(failed.answers, state.answers);

        let retry = transition(&failed, Event::SubmitRequested);
        assert_eq!(retry.state.status, SessionStatus::Submitting);
    }

    #[test]
    fn retry_after_failed_timeout_submission_skips_completeness_check() {
        let state = loaded(&[1, 2]);
        let submitting = apply(&state, Event::TimeUp);
        let failed = apply(&submitting, Event::SubmitFailed("timeout".to_string()));
        assert!(failed.time_up);

        let retry = transition(&failed, Event::SubmitRequested);
        assert_eq!(retry.rejection, None);
        assert_eq!(retry.state.status, SessionStatus::Submitting);
    }

    #[test]
    fn answers_only_accepted_while_active() {
        let state = loaded(&[1]);
        let gated = apply(&state, violation());
        let t = transition(
            &gated,
            Event::Answered {
                question_id: 1,
                value: "A".to_string(),
            },
        );
        assert_eq!(
            t.rejection,
            Some(Rejection::NotAccepting(SessionStatus::TemporarilyLocked))
        );

        let t = transition(
            &state,
            Event::Answered {
                question_id: 77,
                value: "A".to_string(),
            },
        );
        assert_eq!(t.rejection, Some(Rejection::UnknownQuestion(77)));
    }

    #[test]
    fn blank_answer_clears_previous_value() {
        let state = answer(&loaded(&[1]), 1, "A");
        let cleared = answer(&state, 1, "   ");
        assert!(cleared.answers.is_empty());
    }

    #[test]
    fn navigation_is_clamped() {
        let state = apply(&loaded(&[1, 2, 3]), Event::Navigated(10));
        assert_eq!(state.current_question, 2);
    }

    #[test]
    fn unlock_returns_to_active_with_server_count() {
        let mut state = loaded(&[1]);
        state.lock_threshold = 2;
        state = apply(&state, violation());
        state = apply(&state, Event::FullscreenRestored);
        state = apply(&state, violation());
        assert_eq!(state.status, SessionStatus::PermanentlyLocked);

        let t = transition(&state, Event::UnlockObserved { violation_count: 0 });
        assert_eq!(t.state.status, SessionStatus::Active);
        assert_eq!(t.state.violation_count, 0);
        assert_eq!(t.state.lock_reason, None);
        assert_eq!(t.effects, vec![Effect::Persist]);
    }

    #[test]
    fn unlock_after_deadline_submits_immediately() {
        let mut state = loaded(&[1]);
        state.lock_threshold = 1;
        let locked = apply(&state, violation());
        let expired = transition(&locked, Event::TimeUp);
        assert!(expired.effects.is_empty());
        assert_eq!(expired.state.status, SessionStatus::PermanentlyLocked);

        let t = transition(&expired.state, Event::UnlockObserved { violation_count: 0 });
        assert_eq!(t.state.status, SessionStatus::Submitting);
        assert!(t.effects.contains(&Effect::Submit {
            trigger: SubmitTrigger::TimeUp
        }));
    }

    #[test]
    fn server_lock_is_adopted_below_local_threshold() {
        let mut state = loaded(&[1]);
        state.lock_threshold = 10;
        state = apply(&state, violation());
        state = apply(&state, Event::FullscreenRestored);

        let t = transition(
            &state,
            Event::LockImposed {
                violation_count: Some(5),
                reason: Some("tab_switch".to_string()),
            },
        );
        assert!(t.effects.is_empty());
        assert_eq!(t.state.status, SessionStatus::PermanentlyLocked);
        assert_eq!(t.state.violation_count, 5);
        assert_eq!(t.state.lock_reason.as_deref(), Some("tab_switch"));
        assert!(t.state.lock_acknowledged);

        // No lock request follows, and answers are refused.
        assert!(transition(&t.state, violation()).effects.is_empty());
        assert_eq!(
            answer_rejection(&t.state),
            Some(Rejection::NotAccepting(SessionStatus::PermanentlyLocked))
        );
    }

    #[test]
    fn lock_during_submission_is_restored_when_it_fails() {
        let state = answer(&loaded(&[1]), 1, "A");
        let submitting = apply(&state, Event::SubmitRequested);
        let locked = apply(&submitting, acknowledged());
        assert_eq!(locked.status, SessionStatus::Submitting);

        let failed = apply(&locked, Event::SubmitFailed("Session is locked".to_string()));
        assert_eq!(failed.status, SessionStatus::PermanentlyLocked);
        assert!(!failed.submit_in_flight);
        assert_eq!(
            transition(&failed, Event::SubmitRequested).rejection,
            Some(Rejection::NotAccepting(SessionStatus::PermanentlyLocked))
        );
    }

    #[test]
    fn server_lock_never_reopens_a_finished_session() {
        let state = answer(&loaded(&[1]), 1, "A");
        let submitting = apply(&state, Event::SubmitRequested);
        let done = apply(&submitting, Event::SubmitSucceeded(summary()));
        assert_eq!(apply(&done, acknowledged()), done);
    }
}
