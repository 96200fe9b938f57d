//! End-to-end conversation scenarios over the in-memory store and push feed.
//!
//! Every durable write is echoed back through the feed, so these tests cover
//! the interleavings of local confirmations and push echoes.

use canvas_application::{
    ContextSubscriptionManager, ConversationHandle, ConversationUseCase, ConversationView,
    SubscriptionState,
};
use canvas_core::directive::{DIRECTIVE_OPEN, DirectiveState, PAYLOAD_CLOSE, PAYLOAD_OPEN, SegmentKind};
use canvas_core::message::{Message, MessageDraft, PushEvent, ScopeKey, ScopeType, SenderRole};
use canvas_core::store::MessageStore;
use canvas_core::EngineConfig;
use canvas_infrastructure::{InMemoryMessageStore, InMemoryPushFeed, StoreOp};
use chrono::Utc;
use std::sync::Arc;

struct Harness {
    feed: InMemoryPushFeed,
    store: Arc<InMemoryMessageStore>,
    conversation: ConversationHandle,
    usecase: ConversationUseCase,
    subscriptions: ContextSubscriptionManager,
    scope: ScopeKey,
    sentinels: std::sync::atomic::AtomicUsize,
}

impl Harness {
    async fn start() -> Self {
        let config = EngineConfig::default();
        let scope = ScopeKey::of(ScopeType::Document, "doc-1");
        let feed = InMemoryPushFeed::new();
        let store = Arc::new(InMemoryMessageStore::with_feed(feed.clone()));
        let (conversation, _task) = ConversationHandle::spawn(Some(scope.clone()), &config);
        let usecase = ConversationUseCase::new(store.clone(), conversation.clone(), &config.reconciler);
        let subscriptions = ContextSubscriptionManager::new(
            Arc::new(feed.clone()),
            conversation.clone(),
            config.subscription.clone(),
        )
        .with_jitter_seed(11);

        subscriptions.subscribe(scope.clone()).await;
        subscriptions
            .watch()
            .wait_for(|s| s.state == SubscriptionState::Subscribed)
            .await
            .unwrap();

        Self {
            feed,
            store,
            conversation,
            usecase,
            subscriptions,
            scope,
            sentinels: Default::default(),
        }
    }

    /// Waits until every event published so far has reached the conversation.
    ///
    /// Pushes a marker record through the feed and waits for it; the feed
    /// delivers in order.
    async fn settle_feed(&self) -> ConversationView {
        let n = self
            .sentinels
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let id = format!("sentinel-{n}");
        self.feed.publish(PushEvent::insert(record(&id, "marker", &self.scope)));
        let mut views = self.conversation.subscribe();
        views
            .wait_for(|v| v.message(&id).is_some())
            .await
            .unwrap()
            .clone()
    }

    /// Messages other than feed markers.
    async fn messages(&self) -> Vec<Message> {
        self.settle_feed()
            .await
            .messages
            .into_iter()
            .filter(|m| !m.id.starts_with("sentinel-"))
            .collect()
    }
}

fn record(id: &str, content: &str, scope: &ScopeKey) -> Message {
    Message {
        id: id.to_string(),
        content: content.to_string(),
        sender_role: SenderRole::User,
        scope_type: scope.scope_type,
        scope_id: scope.scope_id.clone(),
        scope_version_ref: None,
        created_at: Utc::now(),
        edited: false,
        client_ref: None,
    }
}

#[tokio::test]
async fn sent_message_appears_once_after_echo() {
    let h = Harness::start().await;
    h.feed.set_duplicate_deliveries(true);

    let sent = h.usecase.send("hello", h.scope.clone()).await.unwrap();

    let messages = h.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, sent.id);
    assert_eq!(messages[0].content, "hello");
    assert!(!messages[0].id.starts_with("tmp-"));
}

#[tokio::test]
async fn consecutive_sends_keep_creation_order() {
    let h = Harness::start().await;

    let first = h.usecase.send("one", h.scope.clone()).await.unwrap();
    let second = h.usecase.send("two", h.scope.clone()).await.unwrap();

    let ids: Vec<String> = h.messages().await.into_iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![first.id, second.id]);
}

#[tokio::test]
async fn streamed_reply_settles_to_one_entry() {
    let h = Harness::start().await;
    h.feed.set_duplicate_deliveries(true);

    h.conversation.open_stream("s1", h.scope.clone()).await.unwrap();
    for chunk in ["Hel", "lo wor", "ld"] {
        h.conversation.append_chunk("s1", chunk).await.unwrap();
    }
    let live = h.conversation.view();
    assert_eq!(live.stream("s1").map(|s| s.buffer.as_str()), Some("Hello world"));

    // The backend writes the reply, which is echoed before completion is seen.
    let draft = MessageDraft {
        content: "Hello world".to_string(),
        ..MessageDraft::assistant(h.scope.clone()).with_client_ref("s1")
    };
    let message_id = h.store.create(&draft).await.unwrap();
    h.settle_feed().await;

    h.conversation.begin_finalizing("s1", &message_id).await.unwrap();
    let final_record = h.store.fetch_by_id(&message_id).await.unwrap();
    h.conversation
        .finalize_stream("s1", &message_id, final_record.clone())
        .await
        .unwrap();

    // A late replay of the insert is a no-op.
    h.feed.publish(PushEvent::insert(final_record.unwrap()));

    let messages = h.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, message_id);
    assert_eq!(messages[0].content, "Hello world");
    assert_eq!(messages[0].sender_role, SenderRole::Assistant);
    assert!(h.conversation.view().streams.is_empty());
}

#[tokio::test]
async fn malformed_directive_is_reported_while_streaming() {
    let h = Harness::start().await;

    h.conversation.open_stream("s2", h.scope.clone()).await.unwrap();
    for chunk in ["intro ", DIRECTIVE_OPEN, PAYLOAD_OPEN, "{\"action\": nope", PAYLOAD_CLOSE] {
        h.conversation.append_chunk("s2", chunk).await.unwrap();
    }

    let view = h.conversation.view();
    let stream = view.stream("s2").unwrap();
    assert_eq!(stream.directive_state, DirectiveState::Malformed);
    assert_eq!(
        stream.directive_history,
        vec![
            DirectiveState::None,
            DirectiveState::Opening,
            DirectiveState::PayloadInProgress,
            DirectiveState::Malformed,
        ]
    );
    assert_eq!(stream.segments[0].kind, SegmentKind::Prose);
    assert_eq!(stream.segments[0].text, "intro ");
    assert_eq!(stream.segments[1].directive_state, Some(DirectiveState::Malformed));

    h.conversation.abort_stream("s2", "user cancelled").await.unwrap();
    assert!(h.messages().await.is_empty());
}

#[tokio::test]
async fn failed_write_rolls_back_optimistic_entry() {
    let h = Harness::start().await;
    h.store
        .fail_next(StoreOp::Create, canvas_core::CanvasError::transient("store down"));

    let err = h.usecase.send("lost", h.scope.clone()).await.unwrap_err();

    assert!(err.is_durability());
    assert!(h.messages().await.is_empty());
    assert!(h.store.is_empty().await);
}

#[tokio::test]
async fn edit_and_delete_survive_their_echoes() {
    let h = Harness::start().await;
    let sent = h.usecase.send("draft", h.scope.clone()).await.unwrap();

    let ack = h.usecase.edit_message(&sent.id, "final").await.unwrap();
    assert!(ack.record.edited);
    let messages = h.messages().await;
    assert_eq!(messages[0].content, "final");
    assert!(messages[0].edited);

    let ack = h.usecase.delete_message(&sent.id).await.unwrap();
    assert!(ack.deleted);

    // A stale insert replayed by the feed must not bring it back.
    h.feed.publish(PushEvent::insert(sent.clone()));
    assert!(h.messages().await.is_empty());
}

#[tokio::test]
async fn other_scopes_are_not_delivered() {
    let h = Harness::start().await;
    let other = ScopeKey::of(ScopeType::Document, "doc-2");

    h.store
        .create(&MessageDraft::user("elsewhere", other))
        .await
        .unwrap();
    h.usecase.send("here", h.scope.clone()).await.unwrap();

    let contents: Vec<String> = h.messages().await.into_iter().map(|m| m.content).collect();
    assert_eq!(contents, vec!["here".to_string()]);
}

#[tokio::test]
async fn reopening_conversation_seeds_history() {
    let scope = ScopeKey::of(ScopeType::Project, "p-1");
    let store = Arc::new(InMemoryMessageStore::new());
    for text in ["a", "b"] {
        store.create(&MessageDraft::user(text, scope.clone())).await.unwrap();
    }
    store
        .create(&MessageDraft::user("other project", ScopeKey::of(ScopeType::Project, "p-2")))
        .await
        .unwrap();

    let config = EngineConfig::default();
    let (conversation, _task) = ConversationHandle::spawn(Some(scope.clone()), &config);
    let usecase = ConversationUseCase::new(store, conversation.clone(), &config.reconciler);

    assert_eq!(usecase.open_conversation(&scope).await.unwrap(), 2);
    // Loading twice adds nothing.
    assert_eq!(usecase.open_conversation(&scope).await.unwrap(), 0);

    let contents: Vec<String> = conversation
        .view()
        .messages
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(contents, vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn unsubscribing_stops_delivery() {
    let h = Harness::start().await;
    h.subscriptions.unsubscribe().await;
    assert_eq!(h.subscriptions.status().state, SubscriptionState::Unsubscribed);

    h.usecase.send("offline", h.scope.clone()).await.unwrap();
    let stray = record("stray", "pushed while unsubscribed", &h.scope);
    h.feed.publish(PushEvent::insert(stray));
    tokio::task::yield_now().await;

    let view = h.conversation.view();
    assert_eq!(view.messages.len(), 1);
    assert!(view.message("stray").is_none());
}
