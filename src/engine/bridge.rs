// src/engine/bridge.rs

//! Persistence bridge: server writes with a local stash fallback.
//!
//! Reconciliation is last-write-wins on the client timestamp of each snapshot.
//! On equal timestamps both answer maps are merged with the local value winning
//! per key. A narrow window of server-authored state (a proctor unlock racing a
//! stash retry) may be overwritten; participant answers never are.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::{
    engine::{
        remote::{ExamRemote, RemoteError},
        stash::{LocalStash, StashEntry, StashError, StashKey},
    },
    models::{
        score::ScoreSummary,
        session::{
            AnswerMap, ProgressRequest, ProgressResponse, SessionSnapshot, ViolationAck,
            ViolationReport,
        },
    },
};

/// Observable save indicator. Has no effect on the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveStatus {
    Saved,
    Saving,
    StashedLocally,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Stash(#[from] StashError),

    #[error("server accepted the submission without returning a result")]
    MissingResult,
}

impl BridgeError {
    /// The server refused the write because the session is locked.
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Remote(err) if err.is_forbidden())
    }
}

/// Timestamped copy of the participant-authored part of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub exam_id: i64,
    pub session_id: i64,
    pub answers: AnswerMap,
    pub current_question: u32,
    pub saved_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    /// The server copy, stamped with the client time of the write it last accepted.
    pub fn from_server(exam_id: i64, session: &SessionSnapshot) -> Self {
        Self {
            exam_id,
            session_id: session.session_id,
            answers: session.answers.clone(),
            current_question: session.current_question,
            saved_at: session.client_saved_at.unwrap_or(DateTime::<Utc>::MIN_UTC),
        }
    }

    pub fn to_request(&self, finished: bool) -> ProgressRequest {
        ProgressRequest {
            answers: self.answers.clone(),
            current_question: self.current_question,
            finished,
            saved_at: self.saved_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSource {
    Local,
    Server,
    Merged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub snapshot: ProgressSnapshot,
    pub source: SnapshotSource,
}

/// Picks the snapshot to continue from after a reload or reconnect.
pub fn reconcile(local: Option<ProgressSnapshot>, server: ProgressSnapshot) -> Reconciled {
    let Some(local) = local else {
        return Reconciled {
            snapshot: server,
            source: SnapshotSource::Server,
        };
    };

    if local.saved_at > server.saved_at {
        Reconciled {
            snapshot: ProgressSnapshot {
                session_id: server.session_id,
                ..local
            },
            source: SnapshotSource::Local,
        }
    } else if local.saved_at < server.saved_at {
        Reconciled {
            snapshot: server,
            source: SnapshotSource::Server,
        }
    } else {
        let mut answers = server.answers;
        answers.extend(local.answers);
        Reconciled {
            snapshot: ProgressSnapshot {
                exam_id: server.exam_id,
                session_id: server.session_id,
                answers,
                current_question: local.current_question,
                saved_at: local.saved_at,
            },
            source: SnapshotSource::Merged,
        }
    }
}

/// A violation report waiting for the next successful server contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingReport {
    pub session_id: i64,
    pub report: ViolationReport,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistAck {
    pub response: ProgressResponse,

    /// Queued violation reports delivered after this write.
    pub flushed_reports: Vec<ViolationAck>,
}

#[derive(Debug, Default)]
struct Ledger {
    acknowledged_at: Option<DateTime<Utc>>,
    pending_reports: Vec<PendingReport>,
}

struct Inner<R, S> {
    remote: R,
    stash: S,
    status: watch::Sender<SaveStatus>,
    ledger: Mutex<Ledger>,
}

/// Shared handle; clones talk to the same remote, stash and ledger.
pub struct PersistenceBridge<R, S> {
    inner: Arc<Inner<R, S>>,
}

impl<R, S> Clone for PersistenceBridge<R, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: ExamRemote, S: LocalStash> PersistenceBridge<R, S> {
    pub fn new(remote: R, stash: S) -> Self {
        let (status, _) = watch::channel(SaveStatus::Saved);
        Self {
            inner: Arc::new(Inner {
                remote,
                stash,
                status,
                ledger: Mutex::new(Ledger::default()),
            }),
        }
    }

    pub fn remote(&self) -> &R {
        &self.inner.remote
    }

    pub fn status(&self) -> SaveStatus {
        *self.inner.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SaveStatus> {
        self.inner.status.subscribe()
    }

    pub fn pending_reports(&self) -> usize {
        self.with_ledger(|l| l.pending_reports.len())
    }

    fn set_status(&self, status: SaveStatus) {
        self.inner.status.send_replace(status);
    }

    fn with_ledger<T>(&self, f: impl FnOnce(&mut Ledger) -> T) -> T {
        match self.inner.ledger.lock() {
            Ok(mut ledger) => f(&mut ledger),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn acknowledge(&self, saved_at: DateTime<Utc>) {
        self.with_ledger(|l| {
            if l.acknowledged_at.is_none_or(|at| saved_at > at) {
                l.acknowledged_at = Some(saved_at);
            }
        });
    }

    /// Writes `snapshot` to the local stash unless a newer one is already there.
    pub async fn stash(&self, snapshot: &ProgressSnapshot) -> Result<(), BridgeError> {
        let key = StashKey::session(snapshot.exam_id);
        if let Some(existing) = self.inner.stash.get(&key).await? {
            if existing.saved_at > snapshot.saved_at {
                return Ok(());
            }
        }
        let entry = StashEntry {
            saved_at: snapshot.saved_at,
            payload: serde_json::to_value(snapshot).map_err(StashError::from)?,
        };
        self.inner.stash.put(&key, &entry).await?;
        Ok(())
    }

    pub async fn recover_stash(&self, exam_id: i64) -> Result<Option<ProgressSnapshot>, BridgeError> {
        let Some(entry) = self.inner.stash.get(&StashKey::session(exam_id)).await? else {
            return Ok(None);
        };
        let snapshot = serde_json::from_value(entry.payload).map_err(StashError::from)?;
        Ok(Some(snapshot))
    }

    pub async fn clear_stash(&self, exam_id: i64) -> Result<(), BridgeError> {
        self.inner.stash.remove(&StashKey::session(exam_id)).await?;
        Ok(())
    }

    /// Durably records a snapshot, falling back to the stash on failure.
    pub async fn persist(&self, snapshot: &ProgressSnapshot) -> Result<PersistAck, BridgeError> {
        self.set_status(SaveStatus::Saving);

        let response = match self
            .inner
            .remote
            .persist_progress(snapshot.session_id, &snapshot.to_request(false))
            .await
        {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    session_id = snapshot.session_id,
                    "Persist failed, stashing locally: {}",
                    err
                );
                if let Err(stash_err) = self.stash(snapshot).await {
                    tracing::error!("Failed to stash snapshot: {}", stash_err);
                }
                self.set_status(SaveStatus::StashedLocally);
                return Err(err.into());
            }
        };

        self.acknowledge(snapshot.saved_at);
        if let Err(e) = self.drop_superseded_stash(snapshot).await {
            tracing::warn!("Failed to drop superseded stash: {}", e);
        }

        let flushed_reports = self.flush_pending_reports(snapshot.exam_id).await;
        let status = if self.pending_reports() == 0 {
            SaveStatus::Saved
        } else {
            SaveStatus::StashedLocally
        };
        self.set_status(status);

        Ok(PersistAck {
            response,
            flushed_reports,
        })
    }

    /// Re-sends a stashed snapshot that is newer than anything the server acknowledged.
    pub async fn retry_stashed(&self, exam_id: i64) -> Result<Option<PersistAck>, BridgeError> {
        let Some(stashed) = self.recover_stash(exam_id).await? else {
            return Ok(None);
        };
        let acknowledged = self.with_ledger(|l| l.acknowledged_at);
        if acknowledged.is_some_and(|at| stashed.saved_at <= at) {
            self.clear_stash(exam_id).await?;
            return Ok(None);
        }
        self.persist(&stashed).await.map(Some)
    }

    /// Final write. The snapshot is stashed first so a failed call loses nothing.
    pub async fn submit(&self, snapshot: &ProgressSnapshot) -> Result<ScoreSummary, BridgeError> {
        if let Err(e) = self.stash(snapshot).await {
            tracing::error!("Failed to stash snapshot before submission: {}", e);
        }
        self.set_status(SaveStatus::Saving);

        match self
            .inner
            .remote
            .persist_progress(snapshot.session_id, &snapshot.to_request(true))
            .await
        {
            Ok(response) => {
                self.acknowledge(snapshot.saved_at);
                if let Err(e) = self.clear_stash(snapshot.exam_id).await {
                    tracing::warn!("Failed to clear stash after submission: {}", e);
                }
                self.set_status(SaveStatus::Saved);
                response.result.ok_or(BridgeError::MissingResult)
            }
            Err(err) => {
                self.set_status(SaveStatus::StashedLocally);
                Err(err.into())
            }
        }
    }

    /// Sends a violation report. A transient failure is queued and stashed for the
    /// next contact; a report the server refuses outright is dropped.
    pub async fn report_violation(
        &self,
        exam_id: i64,
        session_id: i64,
        report: ViolationReport,
    ) -> Result<ViolationAck, BridgeError> {
        match self.inner.remote.report_violation(session_id, &report).await {
            Ok(ack) => Ok(ack),
            Err(err) if err.is_transient() => {
                tracing::warn!(session_id, "Violation report failed, queued: {}", err);
                self.with_ledger(|l| l.pending_reports.push(PendingReport { session_id, report }));
                if let Err(e) = self.stash_pending_reports(exam_id).await {
                    tracing::error!("Failed to stash pending reports: {}", e);
                }
                self.set_status(SaveStatus::StashedLocally);
                Err(err.into())
            }
            Err(err) => {
                tracing::warn!(session_id, "Violation report refused, dropped: {}", err);
                Err(err.into())
            }
        }
    }

    /// Loads reports queued by an earlier run.
    pub async fn restore_pending_reports(&self, exam_id: i64) -> Result<usize, BridgeError> {
        let Some(entry) = self.inner.stash.get(&StashKey::violations(exam_id)).await? else {
            return Ok(0);
        };
        let restored: Vec<PendingReport> =
            serde_json::from_value(entry.payload).map_err(StashError::from)?;
        let count = restored.len();
        self.with_ledger(|l| {
            for pending in restored {
                if !l.pending_reports.contains(&pending) {
                    l.pending_reports.push(pending);
                }
            }
        });
        Ok(count)
    }

    async fn flush_pending_reports(&self, exam_id: i64) -> Vec<ViolationAck> {
        let queued = self.with_ledger(|l| std::mem::take(&mut l.pending_reports));
        if queued.is_empty() {
            return Vec::new();
        }

        let mut acks = Vec::new();
        let mut remaining = Vec::new();
        for pending in queued {
            match self
                .inner
                .remote
                .report_violation(pending.session_id, &pending.report)
                .await
            {
                Ok(ack) => acks.push(ack),
                Err(err) if err.is_transient() => {
                    tracing::debug!("Queued violation report still failing: {}", err);
                    remaining.push(pending);
                }
                Err(err) => {
                    tracing::warn!(
                        session_id = pending.session_id,
                        count = pending.report.violation_count,
                        "Queued violation report refused, dropped: {}",
                        err
                    );
                }
            }
        }

        self.with_ledger(|l| {
            l.pending_reports.splice(0..0, remaining);
        });
        if let Err(e) = self.stash_pending_reports(exam_id).await {
            tracing::warn!("Failed to update pending report stash: {}", e);
        }
        acks
    }

    async fn stash_pending_reports(&self, exam_id: i64) -> Result<(), BridgeError> {
        let key = StashKey::violations(exam_id);
        let pending = self.with_ledger(|l| l.pending_reports.clone());
        if pending.is_empty() {
            self.inner.stash.remove(&key).await?;
            return Ok(());
        }
        let entry = StashEntry {
            saved_at: Utc::now(),
            payload: serde_json::to_value(&pending).map_err(StashError::from)?,
        };
        self.inner.stash.put(&key, &entry).await?;
        Ok(())
    }

    async fn drop_superseded_stash(&self, persisted: &ProgressSnapshot) -> Result<(), BridgeError> {
        if let Some(stashed) = self.recover_stash(persisted.exam_id).await? {
            if stashed.saved_at <= persisted.saved_at {
                self.clear_stash(persisted.exam_id).await?;
            }
        }
        Ok(())
    }
}
