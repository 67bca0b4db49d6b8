// src/engine/draft.rs

//! Local drafts for question authoring.
//!
//! Same stash contract as the session bridge, but recovery is always an
//! explicit restore-or-discard choice made by the author.

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};

use crate::engine::stash::{LocalStash, StashEntry, StashError, StashKey};

/// Identifies one draft: a question in a bank, or a new one (`question_id = None`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DraftKey {
    pub bank_id: i64,
    pub question_id: Option<i64>,
}

impl DraftKey {
    pub fn new_question(bank_id: i64) -> Self {
        Self {
            bank_id,
            question_id: None,
        }
    }

    pub fn existing(bank_id: i64, question_id: i64) -> Self {
        Self {
            bank_id,
            question_id: Some(question_id),
        }
    }

    fn stash_key(&self) -> StashKey {
        StashKey::draft(self.bank_id, self.question_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalDraft<T> {
    pub key: DraftKey,
    pub saved_at: DateTime<Utc>,
    pub body: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DraftChoice {
    Restore,
    Discard,
}

pub struct DraftRecovery<S> {
    stash: S,
}

impl<S: LocalStash> DraftRecovery<S> {
    pub fn new(stash: S) -> Self {
        Self { stash }
    }

    pub async fn save<T: Serialize>(&self, key: DraftKey, body: &T) -> Result<(), StashError> {
        self.save_at(key, body, Utc::now()).await
    }

    pub async fn save_at<T: Serialize>(
        &self,
        key: DraftKey,
        body: &T,
        saved_at: DateTime<Utc>,
    ) -> Result<(), StashError> {
        let entry = StashEntry {
            saved_at,
            payload: serde_json::to_value(body)?,
        };
        self.stash.put(&key.stash_key(), &entry).await
    }

    /// Returns a draft worth offering to the author.
    ///
    /// A draft no newer than the server copy is stale and removed. Drafts for
    /// new questions have no server copy and are always offered.
    pub async fn detect<T: DeserializeOwned>(
        &self,
        key: DraftKey,
        server_updated_at: Option<DateTime<Utc>>,
    ) -> Result<Option<LocalDraft<T>>, StashError> {
        let stash_key = key.stash_key();
        let Some(entry) = self.stash.get(&stash_key).await? else {
            return Ok(None);
        };

        if key.question_id.is_some() && server_updated_at.is_some_and(|at| entry.saved_at <= at) {
            tracing::debug!(draft = %stash_key, "Dropping stale draft");
            self.stash.remove(&stash_key).await?;
            return Ok(None);
        }

        let body = match serde_json::from_value(entry.payload) {
            Ok(body) => body,
            Err(e) => {
                // An unreadable draft cannot be restored; treat it as absent.
                tracing::warn!(draft = %stash_key, "Discarding unreadable draft: {}", e);
                self.stash.remove(&stash_key).await?;
                return Ok(None);
            }
        };

        Ok(Some(LocalDraft {
            key,
            saved_at: entry.saved_at,
            body,
        }))
    }

    /// Returns the draft body and clears it.
    pub async fn restore<T: DeserializeOwned>(&self, key: DraftKey) -> Result<Option<T>, StashError> {
        let stash_key = key.stash_key();
        let Some(entry) = self.stash.get(&stash_key).await? else {
            return Ok(None);
        };
        let body = serde_json::from_value(entry.payload)?;
        self.stash.remove(&stash_key).await?;
        Ok(Some(body))
    }

    pub async fn discard(&self, key: DraftKey) -> Result<(), StashError> {
        self.stash.remove(&key.stash_key()).await
    }

    pub async fn resolve<T: DeserializeOwned>(
        &self,
        key: DraftKey,
        choice: DraftChoice,
    ) -> Result<Option<T>, StashError> {
        match choice {
            DraftChoice::Restore => self.restore(key).await,
            DraftChoice::Discard => {
                self.discard(key).await?;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::stash::MemoryStash;
    use chrono::Duration;
    use serde::Deserialize;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct QuestionDraft {
        content: String,
        correct_label: Option<String>,
    }

    fn draft() -> QuestionDraft {
        QuestionDraft {
            content: "Which layer routes packets?".to_string(),
            correct_label: Some("C".to_string()),
        }
    }

    #[tokio::test]
    async fn newer_draft_is_offered() {
        let recovery = DraftRecovery::new(MemoryStash::new());
        let key = DraftKey::existing(1, 7);
        let server_at = Utc::now();
        recovery
            .save_at(key, &draft(), server_at + Duration::minutes(2))
            .await
            .unwrap();

        let found: Option<LocalDraft<QuestionDraft>> =
            recovery.detect(key, Some(server_at)).await.unwrap();
        assert_eq!(found.map(|d| d.body), Some(draft()));
    }

    #[tokio::test]
    async fn stale_draft_is_dropped() {
        let stash = Arc::new(MemoryStash::new());
        let recovery = DraftRecovery::new(stash.clone());
        let key = DraftKey::existing(1, 7);
        let server_at = Utc::now();
        recovery
            .save_at(key, &draft(), server_at - Duration::minutes(1))
            .await
            .unwrap();

        let found: Option<LocalDraft<QuestionDraft>> =
            recovery.detect(key, Some(server_at)).await.unwrap();
        assert!(found.is_none());
        assert!(stash.is_empty());
    }

    #[tokio::test]
    async fn new_question_draft_is_always_offered() {
        let recovery = DraftRecovery::new(MemoryStash::new());
        let key = DraftKey::new_question(3);
        recovery.save(key, &draft()).await.unwrap();

        let found: Option<LocalDraft<QuestionDraft>> =
            recovery.detect(key, Some(Utc::now() + Duration::days(1))).await.unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn restore_returns_body_once() {
        let recovery = DraftRecovery::new(MemoryStash::new());
        let key = DraftKey::new_question(3);
        recovery.save(key, &draft()).await.unwrap();

        let restored: Option<QuestionDraft> =
            recovery.resolve(key, DraftChoice::Restore).await.unwrap();
        assert_eq!(restored, Some(draft()));

        let again: Option<QuestionDraft> = recovery.restore(key).await.unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn discard_removes_draft() {
        let stash = Arc::new(MemoryStash::new());
        let recovery = DraftRecovery::new(stash.clone());
        let key = DraftKey::existing(2, 4);
        recovery.save(key, &draft()).await.unwrap();

        let out: Option<QuestionDraft> = recovery.resolve(key, DraftChoice::Discard).await.unwrap();
        assert!(out.is_none());
        assert!(stash.is_empty());
    }
}
