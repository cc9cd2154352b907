//! Integration tests for the live transport.
//!
//! These tests start a real in-process WebSocket relay and connect the
//! transport to it, verifying announce, routing, reconnect and shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use gigchat_sync::protocol::names;
use gigchat_sync::{
    ConnectionState, Envelope, EventBridge, EventTransport, InboundEvent, ReconnectPolicy,
    SyncError,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message as Frame;

#[derive(Debug, Clone)]
enum RelayCommand {
    /// Push a text frame to every connected client.
    Push(String),
    /// Drop every connection without a close handshake.
    DropAll,
}

/// A frame a client sent, tagged with its connection number.
type Received = (usize, Envelope);

struct Relay {
    url: String,
    received: mpsc::UnboundedReceiver<Received>,
    commands: broadcast::Sender<RelayCommand>,
}

impl Relay {
    fn push(&self, event: &str, data: Value) {
        let frame = Envelope::new(event, data).encode().unwrap();
        self.commands.send(RelayCommand::Push(frame)).unwrap();
    }

    fn push_raw(&self, text: &str) {
        self.commands
            .send(RelayCommand::Push(text.to_string()))
            .unwrap();
    }

    fn drop_all(&self) {
        self.commands.send(RelayCommand::DropAll).unwrap();
    }

    async fn next_frame(&mut self) -> Received {
        timeout(Duration::from_secs(3), self.received.recv())
            .await
            .expect("relay frame within timeout")
            .expect("relay still running")
    }
}

/// Start a relay on a free port.
async fn start_relay() -> Relay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (received_tx, received) = mpsc::unbounded_channel();
    let (commands, _) = broadcast::channel(64);
    let connections = Arc::new(AtomicUsize::new(0));

    let commands_for_accept = commands.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let mut control = commands_for_accept.subscribe();
            let received_tx = received_tx.clone();
            let id = connections.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let (mut write, mut read) = ws.split();
                loop {
                    tokio::select! {
                        frame = read.next() => match frame {
                            Some(Ok(Frame::Text(text))) => {
                                let envelope = Envelope::decode(text.as_str()).unwrap();
                                let _ = received_tx.send((id, envelope));
                            }
                            Some(Ok(Frame::Close(_))) | None | Some(Err(_)) => break,
                            Some(Ok(_)) => {}
                        },
                        command = control.recv() => match command {
                            Ok(RelayCommand::Push(text)) => {
                                if write.send(Frame::Text(text.into())).await.is_err() {
                                    break;
                                }
                            }
                            Ok(RelayCommand::DropAll) | Err(_) => break,
                        },
                    }
                }
            });
        }
    });

    Relay {
        url: format!("ws://127.0.0.1:{port}"),
        received,
        commands,
    }
}

fn transport(url: &str, username: &str) -> EventTransport {
    EventTransport::new(
        url,
        username,
        ReconnectPolicy::new(Duration::from_millis(20), Duration::from_millis(100)),
        64,
    )
}

async fn wait_for_state(transport: &EventTransport, wanted: ConnectionState) {
    let mut state = transport.watch_state();
    timeout(Duration::from_secs(3), state.wait_for(|s| *s == wanted))
        .await
        .expect("state reached within timeout")
        .unwrap();
}

/// Next non-connection event from the bridge.
async fn next_event(events: &mut mpsc::Receiver<InboundEvent>) -> InboundEvent {
    loop {
        let event = timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("event within timeout")
            .expect("bridge still running");
        if !matches!(event, InboundEvent::Connection(_) | InboundEvent::Reconnected) {
            return event;
        }
    }
}

#[tokio::test]
async fn test_connect_announces_user_and_requests_roster() {
    let mut relay = start_relay().await;
    let transport = transport(&relay.url, "alice");
    transport.start().await;

    let (conn, first) = relay.next_frame().await;
    assert_eq!(first.event, names::LOGGED_IN_USERS);
    assert_eq!(first.data, json!("alice"));

    let (same_conn, second) = relay.next_frame().await;
    assert_eq!(same_conn, conn);
    assert_eq!(second.event, names::GET_LOGGED_IN_USERS);

    wait_for_state(&transport, ConnectionState::Connected).await;
    transport.shutdown().await;
}

#[tokio::test]
async fn test_pushed_events_reach_the_bridge_in_order() {
    let mut relay = start_relay().await;
    let transport = transport(&relay.url, "bob");
    let mut events = EventBridge::attach(&transport).await;
    transport.start().await;
    relay.next_frame().await;
    relay.next_frame().await;

    relay.push(names::ONLINE, json!(["alice", "bob"]));
    relay.push(
        names::MESSAGES_READ,
        json!({"conversationId": "c1", "messageIds": ["m1"]}),
    );

    assert_eq!(
        next_event(&mut events).await,
        InboundEvent::PresenceSnapshot(vec!["alice".into(), "bob".into()])
    );
    assert!(matches!(
        next_event(&mut events).await,
        InboundEvent::ReadReceipt(ref r) if r.conversation_id == "c1"
    ));
    transport.shutdown().await;
}

#[tokio::test]
async fn test_malformed_and_unknown_events_do_not_stop_the_stream() {
    let mut relay = start_relay().await;
    let transport = transport(&relay.url, "bob");
    let mut events = EventBridge::attach(&transport).await;
    transport.start().await;
    relay.next_frame().await;
    relay.next_frame().await;

    relay.push_raw("definitely not json");
    relay.push("typing", json!({"user": "alice"}));
    relay.push(names::ONLINE, json!({"wrong": "shape"}));
    relay.push(names::ONLINE, json!(["carol"]));

    assert_eq!(
        next_event(&mut events).await,
        InboundEvent::PresenceSnapshot(vec!["carol".into()])
    );
    assert_eq!(transport.state(), ConnectionState::Connected);
    transport.shutdown().await;
}

#[tokio::test]
async fn test_publish_reaches_relay_when_connected() {
    let mut relay = start_relay().await;
    let transport = transport(&relay.url, "alice");
    transport.start().await;
    relay.next_frame().await;
    relay.next_frame().await;
    wait_for_state(&transport, ConnectionState::Connected).await;

    transport
        .publish(names::GET_LOGGED_IN_USERS, Value::Null)
        .await
        .unwrap();
    let (_, frame) = relay.next_frame().await;
    assert_eq!(frame.event, names::GET_LOGGED_IN_USERS);
    transport.shutdown().await;
}

#[tokio::test]
async fn test_publish_without_connection_fails() {
    let transport = transport("ws://127.0.0.1:1", "alice");
    let err = transport
        .publish(names::GET_LOGGED_IN_USERS, Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::TransportUnavailable(_)));
}

#[tokio::test]
async fn test_reconnect_reannounces_user() {
    let mut relay = start_relay().await;
    let transport = transport(&relay.url, "alice");
    let mut events = EventBridge::attach(&transport).await;
    transport.start().await;
    let (first_conn, _) = relay.next_frame().await;
    relay.next_frame().await;
    wait_for_state(&transport, ConnectionState::Connected).await;

    relay.drop_all();

    loop {
        let event = timeout(Duration::from_secs(3), events.recv())
            .await
            .unwrap()
            .unwrap();
        if event == InboundEvent::Reconnected {
            break;
        }
    }
    assert_eq!(transport.state(), ConnectionState::Connected);
    assert_eq!(transport.connection_count(), 2);

    let (second_conn, announce) = relay.next_frame().await;
    assert_ne!(second_conn, first_conn);
    assert_eq!(announce.event, names::LOGGED_IN_USERS);
    let (_, roster) = relay.next_frame().await;
    assert_eq!(roster.event, names::GET_LOGGED_IN_USERS);
    transport.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_withdraws_presence() {
    let mut relay = start_relay().await;
    let transport = transport(&relay.url, "alice");
    transport.start().await;
    relay.next_frame().await;
    relay.next_frame().await;
    wait_for_state(&transport, ConnectionState::Connected).await;

    transport.shutdown().await;
    let (_, leave) = relay.next_frame().await;
    assert_eq!(leave.event, names::REMOVE_LOGGED_IN_USER);
    assert_eq!(leave.data, json!("alice"));
    assert_eq!(transport.state(), ConnectionState::Disconnected);
}
