//! Survey answer consumer.
//!
//! Reads answer submissions from Kafka and writes them to an [`AnswerStore`]. Payloads
//! that are not valid answer JSON are logged and acknowledged; store failures are
//! returned to the pipeline, which retries them and finally dead-letters the event.

use drainpipe_core::{BoxFuture, CancellationToken, Event, Handler, HandlerError, HandlerFuture};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// One submitted answer, as published by the survey service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerMessage {
    /// Respondent
    pub user_id: Uuid,
    /// Answered question
    pub question_id: Uuid,
    /// Survey the question belongs to
    pub question_set_id: Uuid,
    /// Chosen option for multiple-choice questions
    #[serde(default)]
    pub selected_option: Option<String>,
    /// Free-text answer
    #[serde(default)]
    pub answer_text: Option<String>,
}

/// Failure writing an answer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend unavailable or rejected the write
    #[error("answer store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence for answers.
///
/// Returns `BoxFuture` instead of async fn to be dyn-compatible.
pub trait AnswerStore: Send + Sync {
    /// Insert or replace the answer for `(user_id, question_id)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    fn save(&self, answer: AnswerMessage) -> BoxFuture<'_, Result<(), StoreError>>;
}

/// Answer store kept in memory. Writes are upserts keyed by user and question.
#[derive(Debug, Default)]
pub struct InMemoryAnswerStore {
    answers: Mutex<Vec<AnswerMessage>>,
}

impl InMemoryAnswerStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the stored answers.
    pub async fn answers(&self) -> Vec<AnswerMessage> {
        self.answers.lock().await.clone()
    }
}

impl AnswerStore for InMemoryAnswerStore {
    fn save(&self, answer: AnswerMessage) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            let mut answers = self.answers.lock().await;
            match answers
                .iter_mut()
                .find(|a| a.user_id == answer.user_id && a.question_id == answer.question_id)
            {
                Some(existing) => *existing = answer,
                None => answers.push(answer),
            }
            Ok(())
        })
    }
}

/// Handler that decodes [`AnswerMessage`] payloads and saves them.
pub struct AnswerHandler {
    store: Arc<dyn AnswerStore>,
}

impl AnswerHandler {
    /// Create a handler writing to `store`.
    #[must_use]
    pub fn new(store: Arc<dyn AnswerStore>) -> Self {
        Self { store }
    }
}

impl std::fmt::Debug for AnswerHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnswerHandler").finish_non_exhaustive()
    }
}

impl Handler for AnswerHandler {
    fn handle(&self, _cancel: CancellationToken, event: Arc<Event>) -> HandlerFuture<'_> {
        Box::pin(async move {
            let answer: AnswerMessage = match serde_json::from_slice(event.payload()) {
                Ok(answer) => answer,
                Err(e) => {
                    // Redelivery cannot fix a bad payload
                    tracing::error!(
                        position = %event.position(),
                        error = %e,
                        "Discarding malformed answer"
                    );
                    return Ok(());
                }
            };

            let user_id = answer.user_id;
            let question_id = answer.question_id;
            self.store.save(answer).await.map_err(HandlerError::from_error)?;

            tracing::debug!(
                position = %event.position(),
                user_id = %user_id,
                question_id = %question_id,
                "Answer stored"
            );
            Ok(())
        })
    }
}
