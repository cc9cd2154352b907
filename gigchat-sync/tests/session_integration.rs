//! End-to-end tests for the session dispatcher.
//!
//! The remote gateway is replaced by an in-memory `ChatApi` whose calls can
//! be held back, so the races between history, live events and sends can be
//! staged deterministically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use gigchat_sync::{
    AttachmentCategory, ChatApi, ConnectionState, EngineSnapshot, HistoryQuery, InboundEvent, ManualClock,
    MarkReadRequest, Message, MessageDraft, MessagePayload, Offer, OfferAction,
    OrderNotification, OutgoingAttachment, ReadReceipt, ReconciliationEngine, SessionConfig,
    SessionHandle, SyncError, SyncSession,
};
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep, timeout, Duration};

const ME: &str = "buyer";
const THEM: &str = "seller";

#[derive(Default)]
struct MockState {
    histories: HashMap<String, Vec<Message>>,
    list: Vec<Message>,
    gates: HashMap<String, Arc<Notify>>,
    offer_gate: Option<Arc<Notify>>,
    fail_sends: bool,
    sent: Vec<MessagePayload>,
    next_id: u32,
    offer_calls: Vec<(String, OfferAction)>,
    read_requests: Vec<MarkReadRequest>,
    notifications_read: Vec<String>,
}

/// In-memory gateway.
#[derive(Default)]
struct MockChatApi {
    state: Mutex<MockState>,
}

impl MockChatApi {
    fn with_history(self, key: &str, messages: Vec<Message>) -> Self {
        self.state
            .lock()
            .unwrap()
            .histories
            .insert(key.to_string(), messages);
        self
    }

    /// Hold history requests for `key` until the returned gate is notified.
    fn gate_history(&self, key: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state
            .lock()
            .unwrap()
            .gates
            .insert(key.to_string(), gate.clone());
        gate
    }

    fn gate_offers(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().unwrap().offer_gate = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl ChatApi for MockChatApi {
    async fn fetch_conversation_list(&self, _username: &str) -> Result<Vec<Message>, SyncError> {
        Ok(self.state.lock().unwrap().list.clone())
    }

    async fn fetch_messages(&self, query: &HistoryQuery) -> Result<Vec<Message>, SyncError> {
        let key = match query {
            HistoryQuery::Conversation(id) => id.clone(),
            HistoryQuery::Participants { sender, receiver } => format!("{sender}/{receiver}"),
        };
        let gate = self.state.lock().unwrap().gates.get(&key).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(self
            .state
            .lock()
            .unwrap()
            .histories
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_message(&self, payload: &MessagePayload) -> Result<Message, SyncError> {
        let mut state = self.state.lock().unwrap();
        state.sent.push(payload.clone());
        if state.fail_sends {
            return Err(SyncError::Api("gateway unavailable".into()));
        }
        state.next_id += 1;
        Ok(Message {
            id: format!("srv-{}", state.next_id),
            conversation_id: payload
                .conversation_id
                .clone()
                .unwrap_or_else(|| "c-new".into()),
            sender_username: payload.sender_username.clone(),
            receiver_username: payload.receiver_username.clone(),
            sender_picture: None,
            receiver_picture: None,
            body: payload.body.clone(),
            attachment: None,
            offer: payload.offer.clone(),
            is_read: false,
            created_at: Utc.timestamp_opt(20, 0).unwrap(),
        })
    }

    async fn mark_messages_read(&self, request: &MarkReadRequest) -> Result<(), SyncError> {
        self.state.lock().unwrap().read_requests.push(request.clone());
        Ok(())
    }

    async fn update_offer(&self, message_id: &str, action: OfferAction) -> Result<(), SyncError> {
        let gate = {
            let mut state = self.state.lock().unwrap();
            state.offer_calls.push((message_id.to_string(), action));
            state.offer_gate.clone()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(())
    }

    async fn mark_notification_read(&self, notification_id: &str) -> Result<(), SyncError> {
        self.state
            .lock()
            .unwrap()
            .notifications_read
            .push(notification_id.to_string());
        Ok(())
    }
}

fn msg(id: &str, conversation: &str, secs: i64, to_me: bool) -> Message {
    let (sender, receiver) = if to_me { (THEM, ME) } else { (ME, THEM) };
    Message {
        id: id.into(),
        conversation_id: conversation.into(),
        sender_username: sender.into(),
        receiver_username: receiver.into(),
        sender_picture: None,
        receiver_picture: None,
        body: Some(format!("body of {id}")),
        attachment: None,
        offer: None,
        is_read: false,
        created_at: Utc.timestamp_opt(secs, 0).unwrap(),
    }
}

fn offer_msg(id: &str, accepted: bool) -> Message {
    Message {
        offer: Some(Offer {
            gig_title: "Product photos".into(),
            price: 80,
            description: "10 edited photos".into(),
            delivery_in_days: 3,
            old_delivery_date: None,
            new_delivery_date: None,
            accepted,
            cancelled: false,
        }),
        ..msg(id, "c1", 5, true)
    }
}

struct Harness {
    session: SessionHandle,
    events: mpsc::Sender<InboundEvent>,
    api: Arc<MockChatApi>,
}

fn start(api: MockChatApi) -> Harness {
    start_with_config(api, &SessionConfig::for_user(ME))
}

fn start_with_config(api: MockChatApi, config: &SessionConfig) -> Harness {
    let api = Arc::new(api);
    let (events, events_rx) = mpsc::channel(64);
    let engine = ReconciliationEngine::new(ME, Arc::new(ManualClock::at_millis(10_000)));
    let session = SyncSession::spawn_with_config(engine, api.clone(), events_rx, config);
    Harness {
        session,
        events,
        api,
    }
}

async fn wait_for_snapshot(
    session: &SessionHandle,
    predicate: impl FnMut(&EngineSnapshot) -> bool,
) -> EngineSnapshot {
    let mut rx = session.watch();
    let snapshot = timeout(Duration::from_secs(3), rx.wait_for(predicate))
        .await
        .expect("snapshot condition within timeout")
        .unwrap()
        .clone();
    snapshot
}

/// Poll the mock until a spawned call has been recorded.
async fn wait_for_api(api: &MockChatApi, mut done: impl FnMut(&MockState) -> bool) {
    for _ in 0..300 {
        if done(&api.state.lock().unwrap()) {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("api call not observed");
}

fn ids(snapshot: &EngineSnapshot) -> Vec<String> {
    snapshot.messages.iter().map(|m| m.id.clone()).collect()
}

#[tokio::test]
async fn test_open_conversation_seeds_history() {
    let h = start(MockChatApi::default().with_history(
        "c1",
        vec![msg("t3", "c1", 3, true), msg("t1", "c1", 1, true), msg("t2", "c1", 2, false)],
    ));

    h.session
        .open_conversation(Some("c1".into()), THEM)
        .await
        .unwrap();

    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.open_conversation.as_deref(), Some("c1"));
    assert_eq!(ids(&snapshot), vec!["t1", "t2", "t3"]);
    assert!(snapshot.notifications.has_unread_message);
    assert_eq!(snapshot.conversations.len(), 1);
}

#[tokio::test]
async fn test_live_message_during_history_fetch_is_kept() {
    let api = MockChatApi::default().with_history(
        "c1",
        vec![msg("t1", "c1", 1, true), msg("t2", "c1", 2, true), msg("t3", "c1", 3, true)],
    );
    let gate = api.gate_history("c1");
    let h = start(api);

    let opener = {
        let session = h.session.clone();
        tokio::spawn(async move { session.open_conversation(Some("c1".into()), THEM).await })
    };
    wait_for_snapshot(&h.session, |s| s.open_conversation.as_deref() == Some("c1")).await;

    h.events
        .send(InboundEvent::MessageReceived(msg("t25", "c1", 2, true)))
        .await
        .unwrap();
    wait_for_snapshot(&h.session, |s| s.messages.len() == 1).await;

    gate.notify_one();
    opener.await.unwrap().unwrap();
    assert_eq!(ids(&h.session.snapshot()), vec!["t1", "t2", "t25", "t3"]);
}

#[tokio::test]
async fn test_stale_history_is_discarded() {
    let api = MockChatApi::default()
        .with_history("c1", vec![msg("old", "c1", 1, true)])
        .with_history("c2", vec![msg("fresh", "c2", 2, true)]);
    let gate = api.gate_history("c1");
    let h = start(api);

    let first = {
        let session = h.session.clone();
        tokio::spawn(async move { session.open_conversation(Some("c1".into()), THEM).await })
    };
    wait_for_snapshot(&h.session, |s| s.open_conversation.as_deref() == Some("c1")).await;

    h.session
        .open_conversation(Some("c2".into()), THEM)
        .await
        .unwrap();
    gate.notify_one();

    // Stale pages are not an error for the caller.
    first.await.unwrap().unwrap();
    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.open_conversation.as_deref(), Some("c2"));
    assert_eq!(ids(&snapshot), vec!["fresh"]);
    assert!(snapshot.conversations.iter().all(|e| e.conversation_id == "c2"));
}

#[tokio::test]
async fn test_send_then_swap_placeholder() {
    let h = start(MockChatApi::default());
    h.session
        .open_conversation(Some("c1".into()), THEM)
        .await
        .unwrap();

    let sent = h
        .session
        .send(MessageDraft::text(Some("c1".into()), THEM, "hi there"))
        .await
        .unwrap();
    assert_eq!(sent.message.id, "srv-1");
    assert_eq!(sent.placeholder_id, "local-1");
    assert_eq!(ids(&h.session.snapshot()), vec!["local-1", "srv-1"]);

    let removed = h.session.discard_message(sent.placeholder_id).await.unwrap();
    assert!(removed.is_some());
    let snapshot = h.session.snapshot();
    assert_eq!(ids(&snapshot), vec!["srv-1"]);
    assert_eq!(snapshot.conversations[0].last_message.id, "srv-1");
}

#[tokio::test]
async fn test_failed_send_keeps_placeholder() {
    let api = MockChatApi::default();
    api.state.lock().unwrap().fail_sends = true;
    let h = start(api);
    h.session
        .open_conversation(Some("c1".into()), THEM)
        .await
        .unwrap();

    let err = h
        .session
        .send(MessageDraft::text(Some("c1".into()), THEM, "hello?"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::SendFailed { ref placeholder_id, .. } if placeholder_id == "local-1"
    ));
    assert_eq!(ids(&h.session.snapshot()), vec!["local-1"]);
}

#[tokio::test]
async fn test_oversized_attachment_rejected_before_network() {
    let config = SessionConfig {
        max_attachment_bytes: 4,
        ..SessionConfig::for_user(ME)
    };
    let h = start_with_config(MockChatApi::default(), &config);
    h.session
        .open_conversation(Some("c1".into()), THEM)
        .await
        .unwrap();

    let draft = MessageDraft {
        attachment: Some(OutgoingAttachment {
            file_name: "design.zip".into(),
            category: AttachmentCategory::Archive,
            data: vec![0; 10],
        }),
        ..MessageDraft::text(Some("c1".into()), THEM, "files")
    };
    let err = h.session.send(draft).await.unwrap_err();
    assert!(matches!(err, SyncError::SendFailed { .. }));
    assert!(h.api.state.lock().unwrap().sent.is_empty());
}

#[tokio::test]
async fn test_first_message_resolves_conversation() {
    let h = start(MockChatApi::default());
    h.session.open_conversation(None, THEM).await.unwrap();
    let pending = h.session.snapshot().open_conversation.unwrap();
    assert!(pending.starts_with("pending-"));

    let sent = h
        .session
        .send(MessageDraft::text(None, THEM, "is this gig available?"))
        .await
        .unwrap();
    h.session.discard_message(sent.placeholder_id).await.unwrap();

    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.open_conversation.as_deref(), Some("c-new"));
    assert_eq!(ids(&snapshot), vec!["srv-1"]);
    assert_eq!(snapshot.conversations.len(), 1);
    assert_eq!(snapshot.conversations[0].conversation_id, "c-new");
    assert!(h.api.state.lock().unwrap().sent[0].conversation_id.is_none());
}

#[tokio::test]
async fn test_offer_transition_guards() {
    let api = MockChatApi::default().with_history("c1", vec![offer_msg("o1", false)]);
    let gate = api.gate_offers();
    let h = start(api);
    h.session
        .open_conversation(Some("c1".into()), THEM)
        .await
        .unwrap();

    let first = {
        let session = h.session.clone();
        tokio::spawn(async move { session.apply_offer_transition("o1", OfferAction::Accept).await })
    };
    wait_for_api(&h.api, |s| s.offer_calls.len() == 1).await;

    assert_eq!(
        h.session
            .apply_offer_transition("o1", OfferAction::Cancel)
            .await,
        Err(SyncError::OfferTransitionInFlight("o1".into()))
    );

    gate.notify_one();
    first.await.unwrap().unwrap();

    h.events
        .send(InboundEvent::MessageUpdated(offer_msg("o1", true)))
        .await
        .unwrap();
    wait_for_snapshot(&h.session, |s| {
        s.messages
            .iter()
            .any(|m| m.offer.as_ref().is_some_and(|o| o.accepted))
    })
    .await;

    assert_eq!(
        h.session
            .apply_offer_transition("o1", OfferAction::Cancel)
            .await,
        Err(SyncError::OfferAlreadyResolved("o1".into()))
    );
    assert_eq!(h.api.state.lock().unwrap().offer_calls.len(), 1);
}

#[tokio::test]
async fn test_mark_conversation_read_reports_to_gateway() {
    let h = start(MockChatApi::default().with_history(
        "c1",
        vec![msg("a", "c1", 1, true), msg("b", "c1", 2, true)],
    ));
    h.session
        .open_conversation(Some("c1".into()), THEM)
        .await
        .unwrap();
    assert!(h.session.snapshot().notifications.has_unread_message);

    h.session.mark_conversation_read("c1").await.unwrap();
    let snapshot = h.session.snapshot();
    assert!(!snapshot.notifications.has_unread_message);
    assert!(snapshot.messages.iter().all(|m| m.is_read));

    wait_for_api(&h.api, |s| !s.read_requests.is_empty()).await;
    let request = h.api.state.lock().unwrap().read_requests[0].clone();
    assert_eq!(request.receiver_username, ME);
    assert_eq!(request.sender_username, THEM);
    assert_eq!(request.message_id, "b");
}

#[tokio::test]
async fn test_events_update_presence_and_badges() {
    let h = start(MockChatApi::default());

    h.events
        .send(InboundEvent::PresenceSnapshot(vec!["alice".into(), "bob".into()]))
        .await
        .unwrap();
    h.events
        .send(InboundEvent::PresenceSnapshot(vec!["bob".into()]))
        .await
        .unwrap();
    h.events
        .send(InboundEvent::MessageReceived(msg("x", "c9", 4, true)))
        .await
        .unwrap();
    h.events
        .send(InboundEvent::ReadReceipt(ReadReceipt {
            conversation_id: "c9".into(),
            message_ids: vec!["x".into()],
        }))
        .await
        .unwrap();
    h.events
        .send(InboundEvent::OrderNotification(OrderNotification {
            id: "n1".into(),
            order_id: "o1".into(),
            sender_username: THEM.into(),
            receiver_username: ME.into(),
            message: "delivered your order".into(),
            is_read: false,
            created_at: Utc.timestamp_opt(6, 0).unwrap(),
        }))
        .await
        .unwrap();

    let snapshot = wait_for_snapshot(&h.session, |s| s.notifications.has_unread_notification).await;
    assert!(snapshot.is_online("bob"));
    assert!(!snapshot.is_online("alice"));
    assert!(!snapshot.notifications.has_unread_message);
    assert_eq!(snapshot.conversations.len(), 1);

    h.session.mark_notification_read("n1").await.unwrap();
    assert!(!h.session.snapshot().notifications.has_unread_notification);
    assert_eq!(h.api.state.lock().unwrap().notifications_read, vec!["n1"]);
}

#[tokio::test]
async fn test_load_conversation_list_orders_by_recency() {
    let api = MockChatApi::default();
    api.state.lock().unwrap().list = vec![
        msg("m1", "c1", 1, false),
        msg("m3", "c3", 3, true),
        msg("m2", "c2", 2, false),
    ];
    let h = start(api);

    h.session.load_conversation_list().await.unwrap();
    let snapshot = h.session.snapshot();
    let order: Vec<_> = snapshot
        .conversations
        .iter()
        .map(|e| e.conversation_id.as_str())
        .collect();
    assert_eq!(order, vec!["c3", "c2", "c1"]);
    assert!(snapshot.notifications.has_unread_message);
}

#[tokio::test]
async fn test_concurrent_sends_name_their_own_placeholders() {
    let h = start(MockChatApi::default());
    h.session
        .open_conversation(Some("c1".into()), THEM)
        .await
        .unwrap();

    let other = h.session.clone();
    let (first, second) = tokio::join!(
        h.session
            .send(MessageDraft::text(Some("c1".into()), THEM, "one")),
        other.send(MessageDraft::text(Some("c1".into()), THEM, "two")),
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_ne!(first.placeholder_id, second.placeholder_id);

    h.session.discard_message(first.placeholder_id).await.unwrap();
    let remaining = ids(&h.session.snapshot());
    assert!(remaining.contains(&second.placeholder_id));
    assert!(remaining.contains(&first.message.id));
    assert!(remaining.contains(&second.message.id));
}

#[tokio::test]
async fn test_reconnect_refreshes_conversation_list() {
    let h = start(MockChatApi::default());
    h.events
        .send(InboundEvent::Connection(ConnectionState::Connected))
        .await
        .unwrap();
    wait_for_snapshot(&h.session, |s| s.connection == ConnectionState::Connected).await;
    assert!(h.session.snapshot().conversations.is_empty());

    h.api.state.lock().unwrap().list = vec![msg("m7", "c7", 7, true)];
    h.events
        .send(InboundEvent::Connection(ConnectionState::Connected))
        .await
        .unwrap();
    h.events.send(InboundEvent::Reconnected).await.unwrap();

    let snapshot = wait_for_snapshot(&h.session, |s| !s.conversations.is_empty()).await;
    assert_eq!(snapshot.conversations[0].conversation_id, "c7");
    assert!(snapshot.notifications.has_unread_message);
}

#[tokio::test]
async fn test_redelivered_message_after_receipt_keeps_badge_clear() {
    let h = start(MockChatApi::default());
    let event = InboundEvent::MessageReceived(msg("x", "c9", 4, true));
    h.events.send(event.clone()).await.unwrap();
    h.events
        .send(InboundEvent::ReadReceipt(ReadReceipt {
            conversation_id: "c9".into(),
            message_ids: vec!["x".into()],
        }))
        .await
        .unwrap();
    h.events.send(event).await.unwrap();
    h.events
        .send(InboundEvent::PresenceSnapshot(vec!["done".into()]))
        .await
        .unwrap();

    let snapshot = wait_for_snapshot(&h.session, |s| s.is_online("done")).await;
    assert!(!snapshot.notifications.has_unread_message);
    assert!(!snapshot.conversations[0].unread);
}

#[tokio::test]
async fn test_shutdown_closes_handle() {
    let h = start(MockChatApi::default());
    h.session.shutdown().await;
    assert_eq!(
        h.session.close_conversation().await,
        Err(SyncError::SessionClosed)
    );
}
