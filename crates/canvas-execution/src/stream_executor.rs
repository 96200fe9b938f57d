//! Drives one token stream into the conversation.

use canvas_application::{ConversationHandle, ReconcileOutcome};
use canvas_core::config::StreamConfig;
use canvas_core::message::{Message, ScopeKey};
use canvas_core::store::MessageStore;
use canvas_core::stream::{StreamSignal, TokenStream};
use canvas_core::Result;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// How a stream session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StreamOutcome {
    Finalized {
        session_id: String,
        message_id: String,
        /// Whether the final record came from the store or was rebuilt from
        /// the stream buffer.
        fetched: bool,
        outcome: ReconcileOutcome,
    },
    Aborted {
        session_id: String,
        reason: String,
    },
}

/// Responsible for executing a single stream session.
///
/// Every code path ends in `finalize` or `abort`: producer completion,
/// producer failure (with or without a durable id), producer end without a
/// completion signal, idle timeout and cancellation.
pub struct StreamExecutor {
    conversation: ConversationHandle,
    store: Arc<dyn MessageStore>,
    config: StreamConfig,
}

impl StreamExecutor {
    pub fn new(conversation: ConversationHandle, store: Arc<dyn MessageStore>, config: StreamConfig) -> Self {
        Self {
            conversation,
            store,
            config,
        }
    }

    /// Opens `session_id` and feeds it from `tokens` until a terminal state.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be opened or the conversation
    /// actor has stopped. Producer failures are not errors; they end in
    /// [`StreamOutcome::Aborted`].
    pub async fn run(
        &self,
        session_id: &str,
        scope: ScopeKey,
        mut tokens: TokenStream,
        cancel: CancellationToken,
    ) -> Result<StreamOutcome> {
        self.conversation.open_stream(session_id, scope).await?;
        tracing::debug!("[StreamExecutor] session '{}' opened", session_id);

        let idle_timeout = self.config.idle_timeout();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    return self.abort(session_id, "cancelled").await;
                }
                next = tokio::time::timeout(idle_timeout, tokens.next()) => next,
            };

            let signal = match next {
                Ok(Some(signal)) => signal,
                Ok(None) => {
                    return self
                        .abort(session_id, "producer ended without completion")
                        .await;
                }
                Err(_) => {
                    let reason = format!("no output for {}ms", idle_timeout.as_millis());
                    return self.abort(session_id, &reason).await;
                }
            };

            match signal {
                StreamSignal::Chunk(text) => {
                    if let Err(err) = self.conversation.append_chunk(session_id, &text).await {
                        if err.is_invalid_state() {
                            // Someone else ended the session; the producer is no
                            // longer wanted.
                            tracing::debug!(
                                "[StreamExecutor] session '{}' ended elsewhere: {}",
                                session_id,
                                err
                            );
                            return Ok(StreamOutcome::Aborted {
                                session_id: session_id.to_string(),
                                reason: err.to_string(),
                            });
                        }
                        return Err(err);
                    }
                }
                StreamSignal::Complete { message_id } => {
                    return self.finish(session_id, &message_id).await;
                }
                StreamSignal::Failed {
                    error,
                    message_id: Some(message_id),
                } => {
                    tracing::warn!(
                        "[StreamExecutor] producer failed after writing '{}': {}",
                        message_id,
                        error
                    );
                    return self.finish(session_id, &message_id).await;
                }
                StreamSignal::Failed {
                    error,
                    message_id: None,
                } => {
                    tracing::warn!("[StreamExecutor] producer failed: {}", error);
                    return self.abort(session_id, &error.to_string()).await;
                }
            }
        }
    }

    async fn finish(&self, session_id: &str, message_id: &str) -> Result<StreamOutcome> {
        self.conversation
            .begin_finalizing(session_id, message_id)
            .await?;

        let record = self.fetch_final_record(message_id).await;
        let fetched = record.is_some();
        let outcome = self
            .conversation
            .finalize_stream(session_id, message_id, record)
            .await?;
        tracing::debug!(
            "[StreamExecutor] session '{}' finalized as '{}': {:?}",
            session_id,
            message_id,
            outcome
        );
        Ok(StreamOutcome::Finalized {
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
            fetched,
            outcome,
        })
    }

    async fn fetch_final_record(&self, message_id: &str) -> Option<Message> {
        let attempts = self.config.finalize_fetch_attempts.max(1);
        for attempt in 1..=attempts {
            match self.store.fetch_by_id(message_id).await {
                Ok(Some(record)) => return Some(record),
                Ok(None) => tracing::debug!(
                    "[StreamExecutor] '{}' not readable yet (attempt {}/{})",
                    message_id,
                    attempt,
                    attempts
                ),
                Err(err) => tracing::warn!(
                    "[StreamExecutor] fetching '{}' failed (attempt {}/{}): {}",
                    message_id,
                    attempt,
                    attempts,
                    err
                ),
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.finalize_retry_delay()).await;
            }
        }
        None
    }

    async fn abort(&self, session_id: &str, reason: &str) -> Result<StreamOutcome> {
        self.conversation.abort_stream(session_id, reason).await?;
        tracing::info!("[StreamExecutor] session '{}' aborted: {}", session_id, reason);
        Ok(StreamOutcome::Aborted {
            session_id: session_id.to_string(),
            reason: reason.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvas_core::message::{MessageDraft, SenderRole};
    use canvas_core::{CanvasError, EngineConfig};
    use canvas_infrastructure::{InMemoryMessageStore, StoreOp};
    use futures::stream;

    fn setup(store: Arc<InMemoryMessageStore>) -> (StreamExecutor, ConversationHandle) {
        let config = EngineConfig::default();
        let (conversation, _task) = ConversationHandle::spawn(None, &config);
        let executor = StreamExecutor::new(conversation.clone(), store, config.stream);
        (executor, conversation)
    }

    async fn stored_reply(store: &InMemoryMessageStore, content: &str, session_id: &str) -> String {
        let draft = MessageDraft::assistant(ScopeKey::general()).with_client_ref(session_id);
        let draft = MessageDraft {
            content: content.to_string(),
            ..draft
        };
        store.create(&draft).await.unwrap()
    }

    fn chunks(parts: &[&str], last: StreamSignal) -> TokenStream {
        let signals: Vec<StreamSignal> = parts
            .iter()
            .map(|p| StreamSignal::chunk(*p))
            .chain(std::iter::once(last))
            .collect();
        stream::iter(signals).boxed()
    }

    #[tokio::test]
    async fn completed_stream_is_finalized_with_fetched_record() {
        let store = Arc::new(InMemoryMessageStore::new());
        let message_id = stored_reply(&store, "Hello world", "s1").await;
        let (executor, conversation) = setup(store);

        let tokens = chunks(&["Hel", "lo wor", "ld"], StreamSignal::complete(&message_id));
        let outcome = executor
            .run("s1", ScopeKey::general(), tokens, CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            StreamOutcome::Finalized { fetched: true, .. }
        ));
        let view = conversation.view();
        assert_eq!(view.messages.len(), 1);
        assert_eq!(view.messages[0].id, message_id);
        assert_eq!(view.messages[0].content, "Hello world");
        assert_eq!(view.messages[0].sender_role, SenderRole::Assistant);
        assert!(view.streams.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_record_falls_back_to_buffer() {
        let store = Arc::new(InMemoryMessageStore::new());
        for _ in 0..3 {
            store.fail_next(StoreOp::Fetch, CanvasError::transient("read replica lag"));
        }
        let (executor, conversation) = setup(store);

        let tokens = chunks(&["partial ", "answer"], StreamSignal::complete("m-unknown"));
        let outcome = executor
            .run("s1", ScopeKey::general(), tokens, CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            StreamOutcome::Finalized { fetched: false, .. }
        ));
        let view = conversation.view();
        assert_eq!(view.message("m-unknown").map(|m| m.content.as_str()), Some("partial answer"));
    }

    #[tokio::test]
    async fn producer_failure_without_id_aborts() {
        let store = Arc::new(InMemoryMessageStore::new());
        let (executor, conversation) = setup(store);

        let tokens = chunks(
            &["doomed"],
            StreamSignal::Failed {
                error: CanvasError::transient("backend reset"),
                message_id: None,
            },
        );
        let outcome = executor
            .run("s1", ScopeKey::general(), tokens, CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome, StreamOutcome::Aborted { .. }));
        assert!(conversation.view().messages.is_empty());
    }

    #[tokio::test]
    async fn producer_failure_with_id_still_finalizes() {
        let store = Arc::new(InMemoryMessageStore::new());
        let message_id = stored_reply(&store, "half", "s1").await;
        let (executor, conversation) = setup(store);

        let tokens = chunks(
            &["half"],
            StreamSignal::Failed {
                error: CanvasError::transient("backend reset"),
                message_id: Some(message_id.clone()),
            },
        );
        let outcome = executor
            .run("s1", ScopeKey::general(), tokens, CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome, StreamOutcome::Finalized { .. }));
        assert!(conversation.view().message(&message_id).is_some());
    }

    #[tokio::test]
    async fn producer_end_without_completion_aborts() {
        let store = Arc::new(InMemoryMessageStore::new());
        let (executor, conversation) = setup(store);

        let tokens = stream::iter(vec![StreamSignal::chunk("dangling")]).boxed();
        let outcome = executor
            .run("s1", ScopeKey::general(), tokens, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            StreamOutcome::Aborted {
                session_id: "s1".into(),
                reason: "producer ended without completion".into()
            }
        );
        assert!(conversation.view().messages.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_producer_is_aborted() {
        let store = Arc::new(InMemoryMessageStore::new());
        let (executor, conversation) = setup(store);

        let tokens = stream::iter(vec![StreamSignal::chunk("thinking")])
            .chain(stream::pending())
            .boxed();
        let outcome = executor
            .run("s1", ScopeKey::general(), tokens, CancellationToken::new())
            .await
            .unwrap();

        match outcome {
            StreamOutcome::Aborted { reason, .. } => assert!(reason.starts_with("no output")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(conversation.view().streams.is_empty());
    }

    #[tokio::test]
    async fn cancellation_aborts() {
        let store = Arc::new(InMemoryMessageStore::new());
        let (executor, conversation) = setup(store);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let tokens = stream::pending().boxed();
        let outcome = executor
            .run("s1", ScopeKey::general(), tokens, cancel)
            .await
            .unwrap();

        assert!(matches!(outcome, StreamOutcome::Aborted { .. }));
        assert!(conversation.view().messages.is_empty());
    }

    #[tokio::test]
    async fn reused_session_id_is_rejected() {
        let store = Arc::new(InMemoryMessageStore::new());
        let (executor, _conversation) = setup(store);

        let tokens = stream::iter(Vec::<StreamSignal>::new()).boxed();
        executor
            .run("s1", ScopeKey::general(), tokens, CancellationToken::new())
            .await
            .unwrap();

        let tokens = stream::iter(Vec::<StreamSignal>::new()).boxed();
        let err = executor
            .run("s1", ScopeKey::general(), tokens, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_invalid_state());
    }
}
