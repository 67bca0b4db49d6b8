// src/engine/runner.rs

//! Async driver around the pure state machine.
//!
//! One task owns the [`SessionState`] and applies events one at a time. Network
//! effects run in spawned tasks and report back over an internal channel, so the
//! countdown keeps ticking while a request hangs. The effects of a single
//! transition run sequentially inside one task, which keeps a lock report
//! behind the persist that precedes it.

use chrono::{DateTime, Utc};
use tokio::{
    sync::{mpsc, watch},
    time::{Instant, MissedTickBehavior, interval_at},
};

use crate::{
    engine::{
        EngineConfig, EngineError,
        bridge::{
            BridgeError, PersistAck, PersistenceBridge, ProgressSnapshot, SaveStatus,
            SnapshotSource, reconcile,
        },
        clock::{Countdown, Tick},
        remote::{ExamRemote, RemoteError},
        stash::LocalStash,
        state_machine::{
            Effect, Event, LoadedSession, Rejection, SessionState, SessionStatus, SubmitTrigger,
            transition,
        },
        violation::{Signal, Verdict, ViolationDetector},
    },
    models::{
        score::ScoreSummary,
        session::{AttemptStatus, ExamContent, ViolationReport},
    },
};

/// Input from the participant's UI.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Answer { question_id: i64, value: String },
    Navigate(u32),
    Signal(Signal),
    Submit,
    /// Manual "check again" while permanently locked.
    CheckUnlock,
}

/// What the UI renders.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub status: SessionStatus,
    pub remaining_seconds: u64,
    pub current_question: u32,
    pub answered: usize,
    pub total_questions: usize,
    pub violation_count: u32,
    pub observed_violations: u32,
    pub lock_reason: Option<String>,
    pub last_rejection: Option<Rejection>,
    pub last_error: Option<String>,
}

#[derive(Debug)]
pub enum SessionOutcome {
    Completed(ScoreSummary),
    /// The UI went away before the attempt finished.
    Abandoned(SessionState),
}

#[derive(Debug)]
enum Completion {
    Submitted(Result<ScoreSummary, BridgeError>),
    /// The server holds the session locked.
    Locked {
        violation_count: Option<u32>,
        reason: Option<String>,
    },
    Unlock(Result<ExamContent, RemoteError>),
}

impl Completion {
    fn server_lock(ack: &PersistAck) -> Option<Self> {
        ack.flushed_reports
            .iter()
            .filter(|a| a.is_locked)
            .map(|a| a.violation_count)
            .max()
            .map(|count| Completion::Locked {
                violation_count: Some(count),
                reason: None,
            })
    }

    fn refused_write() -> Self {
        Completion::Locked {
            violation_count: None,
            reason: None,
        }
    }
}

pub struct SessionRunner<R, S> {
    bridge: PersistenceBridge<R, S>,
    config: EngineConfig,
    exam_id: i64,
    session_id: i64,
    access_token: Option<String>,
    state: SessionState,
    countdown: Countdown,
    detector: ViolationDetector,
    view: watch::Sender<SessionView>,
    last_rejection: Option<Rejection>,
    last_saved_at: DateTime<Utc>,
    dirty: bool,
    unlock_check_in_flight: bool,
}

impl<R: ExamRemote, S: LocalStash> SessionRunner<R, S> {
    /// Fetches exam content, reconciles any local stash and leaves `Loading`.
    pub async fn open(
        bridge: PersistenceBridge<R, S>,
        exam_id: i64,
        access_token: Option<String>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let content = bridge
            .remote()
            .fetch_content(exam_id, access_token.as_deref())
            .await
            .map_err(EngineError::Load)?;

        if let Err(e) = bridge.restore_pending_reports(exam_id).await {
            tracing::warn!(exam_id, "Failed to restore queued violation reports: {}", e);
        }

        let session = &content.session;
        let question_ids: Vec<i64> = content.questions.iter().map(|q| q.id).collect();
        let mut answers = session.answers.clone();
        let mut current_question = session.current_question;

        // A completed session is server-authoritative; the stash is not consulted.
        if session.status == AttemptStatus::InProgress {
            match bridge.recover_stash(exam_id).await {
                Ok(local) => {
                    let local = local.filter(|s| s.session_id == session.session_id);
                    let server = ProgressSnapshot::from_server(exam_id, session);
                    let reconciled = reconcile(local, server);
                    if reconciled.source != SnapshotSource::Server {
                        tracing::info!(
                            exam_id,
                            source = ?reconciled.source,
                            locked = session.is_locked,
                            "Resuming from local stash"
                        );
                        answers = reconciled.snapshot.answers.clone();
                        current_question = reconciled.snapshot.current_question;

                        // A locked session refuses writes. The stash stays until the
                        // persist that follows an unlock supersedes it.
                        if !session.is_locked {
                            let bridge = bridge.clone();
                            tokio::spawn(async move {
                                if let Err(e) = bridge.persist(&reconciled.snapshot).await {
                                    tracing::warn!("Failed to push recovered snapshot: {}", e);
                                }
                            });
                        }
                    }
                }
                Err(e) => tracing::warn!(exam_id, "Ignoring unreadable stash: {}", e),
            }
        }
        answers.retain(|id, _| question_ids.contains(id));

        let loaded = LoadedSession {
            session_id: session.session_id,
            question_ids,
            answers,
            current_question,
            violation_count: session.violation_count,
            is_locked: session.is_locked,
            lock_reason: session.lock_reason.clone(),
            completed: session.status == AttemptStatus::Completed,
        };
        let mut state = transition(&SessionState::new(config.lock_threshold), Event::Loaded(loaded)).state;
        state.result = content.result.clone();

        let mut countdown = Countdown::from_server(content.remaining_seconds);
        let mut detector = ViolationDetector::new();
        if state.status == SessionStatus::Completed {
            countdown.halt();
        } else {
            detector.attach();
        }

        tracing::info!(
            exam_id,
            session_id = session.session_id,
            status = ?state.status,
            remaining_seconds = content.remaining_seconds,
            "Session opened"
        );

        let (view, _) = watch::channel(Self::render(&state, &countdown, None));
        Ok(Self {
            bridge,
            config,
            exam_id,
            session_id: session.session_id,
            access_token,
            state,
            countdown,
            detector,
            view,
            last_rejection: None,
            last_saved_at: DateTime::<Utc>::MIN_UTC,
            dirty: false,
            unlock_check_in_flight: false,
        })
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn view(&self) -> watch::Receiver<SessionView> {
        self.view.subscribe()
    }

    pub fn save_status(&self) -> watch::Receiver<SaveStatus> {
        self.bridge.subscribe()
    }

    /// Drives the session until it completes or the event channel closes.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<ClientEvent>,
    ) -> Result<SessionOutcome, EngineError> {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion>();

        let start = Instant::now();
        let mut tick = interval_at(start + self.config.tick, self.config.tick);
        let mut autosave = interval_at(
            start + self.config.autosave_interval,
            self.config.autosave_interval,
        );
        let mut unlock_poll = interval_at(
            start + self.config.unlock_poll_interval,
            self.config.unlock_poll_interval,
        );
        autosave.set_missed_tick_behavior(MissedTickBehavior::Delay);
        unlock_poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut events_open = true;

        loop {
            self.publish();

            if self.state.status == SessionStatus::Completed {
                self.detector.detach();
                self.countdown.halt();
                return match self.state.result.take() {
                    Some(summary) => Ok(SessionOutcome::Completed(summary)),
                    None => Ok(SessionOutcome::Abandoned(self.state)),
                };
            }
            if !events_open && !self.state.submit_in_flight {
                return Ok(self.abandon().await);
            }

            tokio::select! {
                _ = tick.tick() => self.on_tick(&done_tx),
                _ = autosave.tick() => self.on_autosave(&done_tx),
                _ = unlock_poll.tick(), if self.state.status == SessionStatus::PermanentlyLocked => {
                    self.check_unlock(&done_tx);
                }
                Some(done) = done_rx.recv() => self.on_completion(done, &done_tx)?,
                event = events.recv(), if events_open => match event {
                    Some(event) => self.on_client_event(event, &done_tx),
                    None => events_open = false,
                },
            }
        }
    }

    fn apply(&mut self, event: Event, done: &mpsc::UnboundedSender<Completion>) {
        let before = self.state.status;
        let outcome = transition(&self.state, event);
        self.state = outcome.state;

        if let Some(rejection) = &outcome.rejection {
            tracing::debug!(?rejection, "Event rejected");
        }
        self.last_rejection = outcome.rejection;

        if before != self.state.status {
            tracing::debug!(from = ?before, to = ?self.state.status, "Session transition");
        }
        if self.state.detection_suspended() {
            self.detector.suppress();
        } else {
            self.detector.resume();
        }

        if !outcome.effects.is_empty() {
            self.execute(outcome.effects, done);
        }
    }

    fn on_client_event(&mut self, event: ClientEvent, done: &mpsc::UnboundedSender<Completion>) {
        match event {
            ClientEvent::Answer { question_id, value } => {
                self.apply(Event::Answered { question_id, value }, done);
                if self.last_rejection.is_none() {
                    self.dirty = true;
                }
            }
            ClientEvent::Navigate(index) => {
                let before = self.state.current_question;
                self.apply(Event::Navigated(index), done);
                if self.state.current_question != before {
                    self.dirty = true;
                }
            }
            ClientEvent::Signal(signal) => match self.detector.observe(signal) {
                Verdict::Penalize(reason) => {
                    let was_locked = self.state.status == SessionStatus::PermanentlyLocked;
                    self.apply(
                        Event::Violation {
                            reason: reason.to_string(),
                            at: Utc::now(),
                        },
                        done,
                    );
                    tracing::warn!(
                        session_id = self.session_id,
                        %reason,
                        count = self.state.violation_count,
                        observed = self.state.observed_violations(),
                        "Integrity violation"
                    );
                    if !was_locked && self.state.status == SessionStatus::PermanentlyLocked {
                        tracing::info!(session_id = self.session_id, "Session locked");
                    }
                }
                Verdict::Restore => self.apply(Event::FullscreenRestored, done),
                Verdict::Prevent => {
                    tracing::debug!(?signal, "Blocked clipboard or context menu");
                }
                Verdict::Ignore => {}
            },
            ClientEvent::Submit => self.apply(Event::SubmitRequested, done),
            ClientEvent::CheckUnlock => {
                if self.state.status == SessionStatus::PermanentlyLocked {
                    self.check_unlock(done);
                }
            }
        }
    }

    fn on_tick(&mut self, done: &mpsc::UnboundedSender<Completion>) {
        if let Tick::Expired = self.countdown.tick() {
            tracing::info!(session_id = self.session_id, "Time is up");
            self.apply(Event::TimeUp, done);
        }
    }

    fn on_autosave(&mut self, done: &mpsc::UnboundedSender<Completion>) {
        if self.state.submit_in_flight {
            return;
        }

        // A failed automatic submission is retried without waiting for the UI.
        if self.state.time_up && self.state.status.can_submit() {
            self.apply(Event::SubmitRequested, done);
            return;
        }

        if self.dirty {
            self.dirty = false;
            let snapshot = self.snapshot();
            let bridge = self.bridge.clone();
            let done = done.clone();
            tokio::spawn(async move {
                let lock = match bridge.persist(&snapshot).await {
                    Ok(ack) => Completion::server_lock(&ack),
                    Err(e) if e.is_forbidden() => Some(Completion::refused_write()),
                    Err(_) => None,
                };
                if let Some(lock) = lock {
                    let _ = done.send(lock);
                }
            });
        } else if self.bridge.status() == SaveStatus::StashedLocally
            && self.state.status != SessionStatus::PermanentlyLocked
        {
            let bridge = self.bridge.clone();
            let exam_id = self.exam_id;
            tokio::spawn(async move {
                if let Err(e) = bridge.retry_stashed(exam_id).await {
                    tracing::debug!("Stash retry failed: {}", e);
                }
            });
        }
    }

    fn check_unlock(&mut self, done: &mpsc::UnboundedSender<Completion>) {
        if self.unlock_check_in_flight {
            return;
        }
        self.unlock_check_in_flight = true;

        let bridge = self.bridge.clone();
        let exam_id = self.exam_id;
        let token = self.access_token.clone();
        let done = done.clone();
        tokio::spawn(async move {
            let result = bridge.remote().fetch_content(exam_id, token.as_deref()).await;
            let _ = done.send(Completion::Unlock(result));
        });
    }

    fn on_completion(
        &mut self,
        completion: Completion,
        done: &mpsc::UnboundedSender<Completion>,
    ) -> Result<(), EngineError> {
        match completion {
            Completion::Submitted(Ok(summary)) => {
                tracing::info!(
                    session_id = self.session_id,
                    total = summary.total,
                    late = summary.late_submission,
                    "Session submitted"
                );
                self.apply(Event::SubmitSucceeded(summary), done);
            }
            Completion::Submitted(Err(err)) => {
                tracing::warn!(session_id = self.session_id, "Submission failed: {}", err);
                if err.is_forbidden() {
                    self.adopt_server_lock(None, None, done);
                }
                self.apply(Event::SubmitFailed(err.to_string()), done);
            }
            Completion::Locked {
                violation_count,
                reason,
            } => self.adopt_server_lock(violation_count, reason, done),
            Completion::Unlock(result) => {
                self.unlock_check_in_flight = false;
                match result {
                    Ok(content) if !content.session.is_locked => {
                        tracing::info!(session_id = self.session_id, "Lock cleared by proctor");
                        self.apply(
                            Event::UnlockObserved {
                                violation_count: content.session.violation_count,
                            },
                            done,
                        );
                    }
                    Ok(content) => self.adopt_server_lock(
                        Some(content.session.violation_count),
                        content.session.lock_reason,
                        done,
                    ),
                    Err(RemoteError::Unauthorized) => {
                        tracing::error!(session_id = self.session_id, "Identity lost while locked");
                        self.detector.detach();
                        return Err(EngineError::IdentityLost);
                    }
                    Err(e) => tracing::debug!("Unlock check failed: {}", e),
                }
            }
        }
        Ok(())
    }

    fn adopt_server_lock(
        &mut self,
        violation_count: Option<u32>,
        reason: Option<String>,
        done: &mpsc::UnboundedSender<Completion>,
    ) {
        let was_locked = self.state.status == SessionStatus::PermanentlyLocked;
        self.apply(
            Event::LockImposed {
                violation_count,
                reason,
            },
            done,
        );
        if !was_locked && self.state.status == SessionStatus::PermanentlyLocked {
            tracing::info!(
                session_id = self.session_id,
                count = self.state.violation_count,
                "Session locked by server"
            );
        }
    }

    /// Runs the effects of one transition, in order, in a single task.
    fn execute(&mut self, effects: Vec<Effect>, done: &mpsc::UnboundedSender<Completion>) {
        if effects.contains(&Effect::Persist) {
            self.dirty = false;
        }

        let snapshot = self.snapshot();
        let bridge = self.bridge.clone();
        let done = done.clone();
        let grace = self.config.submit_grace;
        let (exam_id, session_id) = (self.exam_id, self.session_id);

        tokio::spawn(async move {
            for effect in effects {
                match effect {
                    Effect::Persist => match bridge.persist(&snapshot).await {
                        Ok(ack) => {
                            if let Some(lock) = Completion::server_lock(&ack) {
                                let _ = done.send(lock);
                            }
                        }
                        Err(e) if e.is_forbidden() => {
                            let _ = done.send(Completion::refused_write());
                        }
                        Err(e) => tracing::debug!("Persist deferred to stash: {}", e),
                    },
                    Effect::ReportViolation { reason, count, lock } => {
                        let report = ViolationReport {
                            reason: reason.clone(),
                            violation_count: count,
                            lock,
                        };
                        match bridge.report_violation(exam_id, session_id, report).await {
                            Ok(ack) if ack.is_locked => {
                                let _ = done.send(Completion::Locked {
                                    violation_count: Some(ack.violation_count),
                                    reason: Some(reason),
                                });
                            }
                            Ok(_) => {}
                            Err(e) => tracing::debug!("Violation report not delivered: {}", e),
                        }
                    }
                    Effect::Submit { trigger } => {
                        if trigger == SubmitTrigger::TimeUp {
                            tokio::time::sleep(grace).await;
                        }
                        let result = bridge.submit(&snapshot).await;
                        let _ = done.send(Completion::Submitted(result));
                    }
                }
            }
        });
    }

    fn snapshot(&mut self) -> ProgressSnapshot {
        // Strictly increasing so the server never sees two writes as simultaneous.
        let saved_at = Utc::now().max(self.last_saved_at + chrono::Duration::milliseconds(1));
        self.last_saved_at = saved_at;
        ProgressSnapshot {
            exam_id: self.exam_id,
            session_id: self.session_id,
            answers: self.state.answers.clone(),
            current_question: self.state.current_question,
            saved_at,
        }
    }

    async fn abandon(mut self) -> SessionOutcome {
        self.detector.detach();
        if self.dirty && self.state.status != SessionStatus::Loading {
            let snapshot = self.snapshot();
            if let Err(e) = self.bridge.persist(&snapshot).await {
                tracing::warn!("Final persist failed, answers kept in stash: {}", e);
            }
        }
        tracing::info!(session_id = self.session_id, status = ?self.state.status, "Session abandoned");
        SessionOutcome::Abandoned(self.state)
    }

    fn publish(&self) {
        self.view.send_replace(Self::render(
            &self.state,
            &self.countdown,
            self.last_rejection.clone(),
        ));
    }

    fn render(
        state: &SessionState,
        countdown: &Countdown,
        last_rejection: Option<Rejection>,
    ) -> SessionView {
        SessionView {
            status: state.status,
            remaining_seconds: countdown.remaining(),
            current_question: state.current_question,
            answered: state.question_ids.len() - state.unanswered().len(),
            total_questions: state.question_ids.len(),
            violation_count: state.violation_count,
            observed_violations: state.observed_violations(),
            lock_reason: state.lock_reason.clone(),
            last_rejection,
            last_error: state.last_error.clone(),
        }
    }
}
