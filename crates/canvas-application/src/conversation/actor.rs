//! The conversation actor: sole owner of the reconciler and stream tracker.
//!
//! Commands are processed one at a time in arrival order. After every command
//! the actor publishes a fresh [`ConversationView`].

use canvas_core::config::EngineConfig;
use canvas_core::message::{Message, MessageDraft, PushEvent, ScopeKey, SenderRole};
use canvas_core::{CanvasError, Result};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::reconciler::{IdentityReconciler, ReconcileOutcome};
use crate::stream::{LiveStream, StreamSessionTracker};

const COMMAND_BUFFER: usize = 256;

/// Renderer-facing snapshot of a conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversationView {
    /// Incremented once per processed command.
    pub revision: u64,
    /// The canonical list.
    pub messages: Vec<Message>,
    /// Streams that have not reached a terminal state.
    pub streams: Vec<LiveStream>,
}

impl ConversationView {
    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn stream(&self, session_id: &str) -> Option<&LiveStream> {
        self.streams.iter().find(|s| s.session_id == session_id)
    }
}

type Reply<T> = oneshot::Sender<T>;

/// Every mutation the actor accepts.
#[derive(Debug)]
pub enum ConversationCommand {
    Optimistic {
        temp_id: String,
        draft: MessageDraft,
        reply: Reply<ReconcileOutcome>,
    },
    Confirm {
        temp_id: String,
        record: Message,
        reply: Reply<ReconcileOutcome>,
    },
    DurabilityFailed {
        temp_id: String,
        reply: Reply<ReconcileOutcome>,
    },
    OpenStream {
        session_id: String,
        scope: ScopeKey,
        reply: Reply<Result<LiveStream>>,
    },
    StreamChunk {
        session_id: String,
        text: String,
        reply: Reply<Result<LiveStream>>,
    },
    /// The producer announced the durable id; the session stops taking chunks.
    BeginFinalizing {
        session_id: String,
        message_id: String,
        reply: Reply<Result<ReconcileOutcome>>,
    },
    /// `record: None` finalizes with a record built from the stream buffer.
    FinalizeStream {
        session_id: String,
        message_id: String,
        record: Option<Message>,
        reply: Reply<Result<ReconcileOutcome>>,
    },
    AbortStream {
        session_id: String,
        reason: String,
        reply: Reply<Result<ReconcileOutcome>>,
    },
    Push {
        event: PushEvent,
        reply: Option<Reply<ReconcileOutcome>>,
    },
    LocalUpdate {
        record: Message,
        reply: Reply<ReconcileOutcome>,
    },
    LocalDelete {
        message_id: String,
        reply: Reply<ReconcileOutcome>,
    },
    Seed {
        records: Vec<Message>,
        reply: Reply<usize>,
    },
}

struct ConversationActor {
    reconciler: IdentityReconciler,
    tracker: StreamSessionTracker,
    view: watch::Sender<ConversationView>,
    revision: u64,
}

impl ConversationActor {
    async fn run(mut self, mut commands: mpsc::Receiver<ConversationCommand>) {
        while let Some(command) = commands.recv().await {
            self.handle(command);
        }
        tracing::debug!("[ConversationActor] all handles dropped, stopping");
    }

    fn handle(&mut self, command: ConversationCommand) {
        match command {
            ConversationCommand::Optimistic {
                temp_id,
                draft,
                reply,
            } => {
                let outcome = self.reconciler.apply_optimistic(&temp_id, &draft);
                self.respond(reply, outcome);
            }
            ConversationCommand::Confirm {
                temp_id,
                record,
                reply,
            } => {
                let outcome = self.reconciler.apply_durable_confirmation(&temp_id, record);
                self.respond(reply, outcome);
            }
            ConversationCommand::DurabilityFailed { temp_id, reply } => {
                let outcome = self.reconciler.apply_durability_failure(&temp_id);
                self.respond(reply, outcome);
            }
            ConversationCommand::OpenStream {
                session_id,
                scope,
                reply,
            } => {
                let result = self.open_stream(&session_id, scope);
                self.respond(reply, result);
            }
            ConversationCommand::StreamChunk {
                session_id,
                text,
                reply,
            } => {
                let result = self.stream_chunk(&session_id, &text);
                self.respond(reply, result);
            }
            ConversationCommand::BeginFinalizing {
                session_id,
                message_id,
                reply,
            } => {
                let result = self
                    .tracker
                    .begin_finalizing(&session_id, &message_id)
                    .map(|_| self.reconciler.bind_stream_message_id(&session_id, &message_id));
                self.respond(reply, result);
            }
            ConversationCommand::FinalizeStream {
                session_id,
                message_id,
                record,
                reply,
            } => {
                let result = self.finalize_stream(&session_id, &message_id, record);
                self.respond(reply, result);
            }
            ConversationCommand::AbortStream {
                session_id,
                reason,
                reply,
            } => {
                let result = self.abort_stream(&session_id, &reason);
                self.respond(reply, result);
            }
            ConversationCommand::Push { event, reply } => {
                let outcome = self.reconciler.apply_push_event(event);
                match reply {
                    Some(reply) => self.respond(reply, outcome),
                    None => self.publish(),
                }
            }
            ConversationCommand::LocalUpdate { record, reply } => {
                let outcome = self.reconciler.apply_local_update(record);
                self.respond(reply, outcome);
            }
            ConversationCommand::LocalDelete { message_id, reply } => {
                let outcome = self.reconciler.apply_local_delete(&message_id);
                self.respond(reply, outcome);
            }
            ConversationCommand::Seed { records, reply } => {
                let seeded = self.reconciler.apply_history(records);
                self.respond(reply, seeded);
            }
        }
    }

    /// Publishes the new view before answering, so a caller that awaited the
    /// reply always observes its own effect.
    fn respond<T>(&mut self, reply: Reply<T>, value: T) {
        self.publish();
        // The caller may have stopped waiting; the event is applied regardless.
        let _ = reply.send(value);
    }

    fn open_stream(&mut self, session_id: &str, scope: ScopeKey) -> Result<LiveStream> {
        if self.reconciler.is_aborted(session_id) {
            return Err(CanvasError::invalid_state(format!(
                "stream session '{}' was aborted",
                session_id
            )));
        }
        if let Some(filter) = self.reconciler.scope_filter().filter(|f| **f != scope) {
            return Err(CanvasError::invalid_state(format!(
                "stream session '{}' targets scope {} but the conversation tracks {}",
                session_id, scope, filter
            )));
        }
        let live = self.tracker.open(session_id, scope.clone())?;
        let outcome = self
            .reconciler
            .apply_stream_placeholder(session_id, &MessageDraft::assistant(scope));
        tracing::debug!("[ConversationActor] placeholder for '{}': {:?}", session_id, outcome);
        Ok(live)
    }

    fn stream_chunk(&mut self, session_id: &str, text: &str) -> Result<LiveStream> {
        let live = self.tracker.append_chunk(session_id, text)?;
        self.reconciler.apply_stream_progress(session_id, &live.buffer);
        Ok(live)
    }

    fn finalize_stream(
        &mut self,
        session_id: &str,
        message_id: &str,
        record: Option<Message>,
    ) -> Result<ReconcileOutcome> {
        let finalized = self.tracker.finalize(session_id, message_id)?;
        let record = record.unwrap_or_else(|| {
            tracing::warn!(
                "[ConversationActor] finalizing '{}' without a fetched record, using stream buffer",
                session_id
            );
            Message {
                id: finalized.message_id.clone(),
                content: finalized.content,
                sender_role: SenderRole::Assistant,
                scope_type: finalized.scope.scope_type,
                scope_id: finalized.scope.scope_id,
                scope_version_ref: None,
                created_at: Utc::now(),
                edited: false,
                client_ref: Some(finalized.session_id),
            }
        });
        Ok(self.reconciler.apply_stream_finalization(session_id, record))
    }

    fn abort_stream(&mut self, session_id: &str, reason: &str) -> Result<ReconcileOutcome> {
        match self.tracker.abort(session_id, reason) {
            Ok(()) => {}
            // Never opened here (or already forgotten): still blacklist the id
            // so late events for it are dropped.
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        Ok(self.reconciler.apply_stream_abort(session_id))
    }

    fn publish(&mut self) {
        self.revision += 1;
        let view = ConversationView {
            revision: self.revision,
            messages: self.reconciler.messages(),
            streams: self.tracker.live_streams(),
        };
        self.view.send_replace(view);
    }
}

/// Cloneable handle to a running conversation actor.
///
/// The actor stops once every handle has been dropped.
#[derive(Debug, Clone)]
pub struct ConversationHandle {
    commands: mpsc::Sender<ConversationCommand>,
    view: watch::Receiver<ConversationView>,
}

impl ConversationHandle {
    /// Spawns an actor on the current tokio runtime.
    ///
    /// # Arguments
    ///
    /// * `scope_filter` - Scope tracked by this conversation, `None` for all scopes
    /// * `config` - Engine configuration
    pub fn spawn(scope_filter: Option<ScopeKey>, config: &EngineConfig) -> (Self, JoinHandle<()>) {
        let (commands, receiver) = mpsc::channel(COMMAND_BUFFER);
        let (view_tx, view) = watch::channel(ConversationView::default());
        let actor = ConversationActor {
            reconciler: IdentityReconciler::new(scope_filter, &config.reconciler),
            tracker: StreamSessionTracker::new(&config.stream),
            view: view_tx,
            revision: 0,
        };
        let task = tokio::spawn(actor.run(receiver));
        (Self { commands, view }, task)
    }

    /// Latest published view.
    pub fn view(&self) -> ConversationView {
        self.view.borrow().clone()
    }

    /// A receiver that is notified on every published view.
    pub fn subscribe(&self) -> watch::Receiver<ConversationView> {
        self.view.clone()
    }

    pub async fn apply_optimistic(&self, temp_id: &str, draft: MessageDraft) -> Result<ReconcileOutcome> {
        self.request(|reply| ConversationCommand::Optimistic {
            temp_id: temp_id.to_string(),
            draft,
            reply,
        })
        .await
    }

    pub async fn confirm(&self, temp_id: &str, record: Message) -> Result<ReconcileOutcome> {
        self.request(|reply| ConversationCommand::Confirm {
            temp_id: temp_id.to_string(),
            record,
            reply,
        })
        .await
    }

    pub async fn durability_failed(&self, temp_id: &str) -> Result<ReconcileOutcome> {
        self.request(|reply| ConversationCommand::DurabilityFailed {
            temp_id: temp_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn open_stream(&self, session_id: &str, scope: ScopeKey) -> Result<LiveStream> {
        self.request(|reply| ConversationCommand::OpenStream {
            session_id: session_id.to_string(),
            scope,
            reply,
        })
        .await?
    }

    pub async fn append_chunk(&self, session_id: &str, text: &str) -> Result<LiveStream> {
        self.request(|reply| ConversationCommand::StreamChunk {
            session_id: session_id.to_string(),
            text: text.to_string(),
            reply,
        })
        .await?
    }

    pub async fn begin_finalizing(&self, session_id: &str, message_id: &str) -> Result<ReconcileOutcome> {
        self.request(|reply| ConversationCommand::BeginFinalizing {
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn finalize_stream(
        &self,
        session_id: &str,
        message_id: &str,
        record: Option<Message>,
    ) -> Result<ReconcileOutcome> {
        self.request(|reply| ConversationCommand::FinalizeStream {
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
            record,
            reply,
        })
        .await?
    }

    pub async fn abort_stream(&self, session_id: &str, reason: &str) -> Result<ReconcileOutcome> {
        self.request(|reply| ConversationCommand::AbortStream {
            session_id: session_id.to_string(),
            reason: reason.to_string(),
            reply,
        })
        .await?
    }

    pub async fn apply_push(&self, event: PushEvent) -> Result<ReconcileOutcome> {
        self.request(|reply| ConversationCommand::Push {
            event,
            reply: Some(reply),
        })
        .await
    }

    /// Enqueues a push event without waiting for its outcome.
    pub async fn forward_push(&self, event: PushEvent) -> Result<()> {
        self.commands
            .send(ConversationCommand::Push { event, reply: None })
            .await
            .map_err(|_| actor_stopped())
    }

    pub async fn apply_local_update(&self, record: Message) -> Result<ReconcileOutcome> {
        self.request(|reply| ConversationCommand::LocalUpdate { record, reply })
            .await
    }

    pub async fn apply_local_delete(&self, message_id: &str) -> Result<ReconcileOutcome> {
        self.request(|reply| ConversationCommand::LocalDelete {
            message_id: message_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn seed(&self, records: Vec<Message>) -> Result<usize> {
        self.request(|reply| ConversationCommand::Seed { records, reply })
            .await
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> ConversationCommand) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| actor_stopped())?;
        response.await.map_err(|_| actor_stopped())
    }
}

fn actor_stopped() -> CanvasError {
    CanvasError::internal("conversation actor stopped")
}
