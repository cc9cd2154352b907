//! Single dispatcher that owns the engine.
//!
//! ```text
//!  SessionHandle ──commands──┐
//!                            │      ┌──────────────────────┐
//!  EventBridge ────events────┼────► │ session task         │ ──► watch<EngineSnapshot>
//!                            │      │  engine + ViewContext│
//!  spawned API calls ─done───┘      └──────────┬───────────┘
//!          ▲                                   │
//!          └───────────── tokio::spawn ────────┘
//! ```
//!
//! All engine writes happen on one task, so there is no locking around the
//! stores. Remote calls run on their own tasks and report back as
//! completions; the engine is never borrowed across an await.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch};

use crate::api::{ChatApi, HistoryQuery, MessagePayload};
use crate::config::SessionConfig;
use crate::engine::{EngineSnapshot, HistoryPage, ReconciliationEngine, ViewContext};
use crate::error::SyncError;
use crate::model::{
    new_pending_conversation_id, ConversationId, Message, MessageDraft, MessageId, OfferAction,
};
use crate::protocol::InboundEvent;

type Reply<T> = oneshot::Sender<Result<T, SyncError>>;

/// Answer to a send: the stored message and the placeholder it stands in for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    /// `local-<n>` id to discard once the UI has swapped.
    pub placeholder_id: MessageId,
    pub message: Message,
}

enum Command {
    Open {
        conversation_id: Option<ConversationId>,
        counterpart: String,
        reply: Reply<()>,
    },
    Close {
        reply: Reply<()>,
    },
    LoadList {
        reply: Reply<()>,
    },
    Send {
        draft: MessageDraft,
        reply: Reply<SentMessage>,
    },
    Discard {
        id: MessageId,
        reply: Reply<Option<Message>>,
    },
    MarkRead {
        conversation_id: ConversationId,
        reply: Reply<()>,
    },
    Offer {
        message_id: MessageId,
        action: OfferAction,
        reply: Reply<()>,
    },
    MarkNotificationRead {
        id: String,
        reply: Reply<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum Completion {
    History {
        conversation_id: ConversationId,
        result: Result<Vec<Message>, SyncError>,
        reply: Reply<()>,
    },
    List {
        result: Result<Vec<Message>, SyncError>,
        reply: Option<Reply<()>>,
    },
    Sent {
        placeholder: Message,
        result: Result<Message, SyncError>,
        reply: Reply<SentMessage>,
    },
    MarkedRead {
        conversation_id: ConversationId,
        result: Result<(), SyncError>,
    },
    Offer {
        message_id: MessageId,
        result: Result<(), SyncError>,
        reply: Reply<()>,
    },
    NotificationRead {
        result: Result<(), SyncError>,
        reply: Reply<()>,
    },
}

/// Spawns the dispatcher task.
pub struct SyncSession;

impl SyncSession {
    /// Start a session with default limits.
    pub fn spawn(
        engine: ReconciliationEngine,
        api: Arc<dyn ChatApi>,
        events: mpsc::Receiver<InboundEvent>,
    ) -> SessionHandle {
        Self::spawn_with_config(engine, api, events, &SessionConfig::default())
    }

    pub fn spawn_with_config(
        engine: ReconciliationEngine,
        api: Arc<dyn ChatApi>,
        events: mpsc::Receiver<InboundEvent>,
        config: &SessionConfig,
    ) -> SessionHandle {
        let ctx = ViewContext::closed();
        let (snapshot_tx, snapshot_rx) = watch::channel(engine.snapshot(&ctx));
        let (command_tx, command_rx) = mpsc::channel(config.event_buffer.max(1));
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let session = Session {
            engine,
            ctx,
            api,
            max_attachment_bytes: config.max_attachment_bytes,
            snapshots: snapshot_tx,
            completions: completion_tx,
        };
        tokio::spawn(session.run(command_rx, events, completion_rx));

        SessionHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
        }
    }
}

/// Caller side of a running session. Cheap to clone.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<EngineSnapshot>,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SyncError::SessionClosed)?;
        rx.await.map_err(|_| SyncError::SessionClosed)?
    }

    /// Open a conversation and wait for its history.
    ///
    /// `conversation_id` is `None` when the user has never talked to
    /// `counterpart`; the history is then looked up by participants. If the
    /// user navigates away before the page arrives, the page is dropped and
    /// this still returns `Ok`.
    pub async fn open_conversation(
        &self,
        conversation_id: Option<ConversationId>,
        counterpart: impl Into<String>,
    ) -> Result<(), SyncError> {
        let counterpart = counterpart.into();
        self.request(|reply| Command::Open {
            conversation_id,
            counterpart,
            reply,
        })
        .await
    }

    pub async fn close_conversation(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::Close { reply }).await
    }

    /// Fetch the conversation list for the local user.
    pub async fn load_conversation_list(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::LoadList { reply }).await
    }

    /// Send optimistically. Resolves to the authoritative message and the id
    /// of the placeholder to discard; on failure the placeholder stays in the
    /// store and the error names it.
    pub async fn send(&self, draft: MessageDraft) -> Result<SentMessage, SyncError> {
        self.request(|reply| Command::Send { draft, reply }).await
    }

    /// Remove a message (normally a placeholder) from the open conversation.
    pub async fn discard_message(&self, id: impl Into<MessageId>) -> Result<Option<Message>, SyncError> {
        let id = id.into();
        self.request(|reply| Command::Discard { id, reply }).await
    }

    /// Mark everything addressed to the local user in a conversation as read.
    pub async fn mark_conversation_read(
        &self,
        conversation_id: impl Into<ConversationId>,
    ) -> Result<(), SyncError> {
        let conversation_id = conversation_id.into();
        self.request(|reply| Command::MarkRead {
            conversation_id,
            reply,
        })
        .await
    }

    /// Accept or cancel an offer. The new state arrives as a `message updated` event.
    pub async fn apply_offer_transition(
        &self,
        message_id: impl Into<MessageId>,
        action: OfferAction,
    ) -> Result<(), SyncError> {
        let message_id = message_id.into();
        self.request(|reply| Command::Offer {
            message_id,
            action,
            reply,
        })
        .await
    }

    pub async fn mark_notification_read(&self, id: impl Into<String>) -> Result<(), SyncError> {
        let id = id.into();
        self.request(|reply| Command::MarkNotificationRead { id, reply })
            .await
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver that wakes on every published snapshot.
    pub fn watch(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshots.clone()
    }

    /// Stop the dispatcher. Pending requests resolve to `SessionClosed`.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct Session {
    engine: ReconciliationEngine,
    ctx: ViewContext,
    api: Arc<dyn ChatApi>,
    max_attachment_bytes: usize,
    snapshots: watch::Sender<EngineSnapshot>,
    completions: mpsc::UnboundedSender<Completion>,
}

impl Session {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::Receiver<InboundEvent>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        info!("Session started for {}", self.engine.local_user());
        let mut events_open = true;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = events.recv(), if events_open => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        debug!("Inbound event stream closed");
                        events_open = false;
                    }
                },
                Some(done) = completions.recv() => self.handle_completion(done),
            }
        }

        info!("Session stopped for {}", self.engine.local_user());
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.engine.snapshot(&self.ctx));
    }

    /// Run a remote call off the dispatcher and feed its result back.
    fn spawn_call<F>(&self, call: F)
    where
        F: std::future::Future<Output = Completion> + Send + 'static,
    {
        let done = self.completions.clone();
        tokio::spawn(async move {
            let _ = done.send(call.await);
        });
    }

    fn handle_event(&mut self, event: InboundEvent) {
        let reconnected = matches!(event, InboundEvent::Reconnected);
        self.engine.apply_event(event, &self.ctx);
        self.publish();

        if reconnected {
            debug!("Reconnected, refreshing conversation list");
            self.load_list(None);
        }
    }

    fn load_list(&self, reply: Option<Reply<()>>) {
        let api = self.api.clone();
        let username = self.engine.local_user().to_string();
        self.spawn_call(async move {
            let result = api.fetch_conversation_list(&username).await;
            Completion::List { result, reply }
        });
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Open {
                conversation_id,
                counterpart,
                reply,
            } => {
                let (conversation_id, query) = match conversation_id {
                    Some(id) => (id.clone(), HistoryQuery::Conversation(id)),
                    None => (
                        new_pending_conversation_id(),
                        HistoryQuery::Participants {
                            sender: self.engine.local_user().to_string(),
                            receiver: counterpart,
                        },
                    ),
                };
                self.ctx = ViewContext::open(conversation_id.clone());
                self.engine.sync_open_conversation(&self.ctx);
                self.publish();

                let api = self.api.clone();
                self.spawn_call(async move {
                    let result = api.fetch_messages(&query).await;
                    Completion::History {
                        conversation_id,
                        result,
                        reply,
                    }
                });
            }
            Command::Close { reply } => {
                self.ctx = ViewContext::closed();
                self.engine.sync_open_conversation(&self.ctx);
                self.publish();
                let _ = reply.send(Ok(()));
            }
            Command::LoadList { reply } => self.load_list(Some(reply)),
            Command::Send { draft, reply } => self.send(draft, reply),
            Command::Discard { id, reply } => {
                let removed = self.engine.discard_message(&id);
                self.publish();
                let _ = reply.send(Ok(removed));
            }
            Command::MarkRead {
                conversation_id,
                reply,
            } => {
                if let Some(request) = self
                    .engine
                    .mark_conversation_read(&conversation_id, &self.ctx)
                {
                    self.publish();
                    let api = self.api.clone();
                    self.spawn_call(async move {
                        let result = api.mark_messages_read(&request).await;
                        Completion::MarkedRead {
                            conversation_id,
                            result,
                        }
                    });
                }
                let _ = reply.send(Ok(()));
            }
            Command::Offer {
                message_id,
                action,
                reply,
            } => match self.engine.begin_offer_transition(&message_id, action) {
                Ok(transition) => {
                    let api = self.api.clone();
                    self.spawn_call(async move {
                        let result = api
                            .update_offer(&transition.message_id, transition.action)
                            .await;
                        Completion::Offer {
                            message_id: transition.message_id,
                            result,
                            reply,
                        }
                    });
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::MarkNotificationRead { id, reply } => {
                if !self.engine.mark_notification_read(&id) {
                    debug!("Marking unseen notification {id} as read");
                }
                self.publish();
                let api = self.api.clone();
                self.spawn_call(async move {
                    let result = api.mark_notification_read(&id).await;
                    Completion::NotificationRead { result, reply }
                });
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn send(&mut self, draft: MessageDraft, reply: Reply<SentMessage>) {
        let placeholder = self.engine.begin_send(&draft, &self.ctx);
        self.publish();

        if let Some(attachment) = &draft.attachment {
            if attachment.data.len() > self.max_attachment_bytes {
                let reason = format!(
                    "attachment {} is {} bytes, limit is {}",
                    attachment.file_name,
                    attachment.data.len(),
                    self.max_attachment_bytes
                );
                let _ = reply.send(Err(self.engine.fail_send(&placeholder, &reason)));
                return;
            }
        }

        let payload = MessagePayload::for_placeholder(&placeholder, draft.attachment.as_ref());
        let api = self.api.clone();
        self.spawn_call(async move {
            let result = api.send_message(&payload).await;
            Completion::Sent {
                placeholder,
                result,
                reply,
            }
        });
    }

    fn handle_completion(&mut self, done: Completion) {
        match done {
            Completion::History {
                conversation_id,
                result,
                reply,
            } => {
                let outcome = match result {
                    Ok(messages) => self
                        .engine
                        .seed_history(
                            HistoryPage {
                                conversation_id,
                                messages,
                            },
                            &mut self.ctx,
                        )
                        .map(|count| debug!("Seeded {count} messages")),
                    Err(e) if self.ctx.is_open(&conversation_id) => Err(e),
                    Err(e) => {
                        debug!("History fetch for closed conversation {conversation_id} failed: {e}");
                        Ok(())
                    }
                };
                let outcome = match outcome {
                    Err(SyncError::HistoryFetchStale(_)) => Ok(()),
                    other => other,
                };
                self.publish();
                let _ = reply.send(outcome);
            }
            Completion::List { result, reply } => {
                let outcome = result.map(|summaries| {
                    self.engine.seed_conversation_list(summaries);
                    self.publish();
                });
                match reply {
                    Some(reply) => {
                        let _ = reply.send(outcome);
                    }
                    None => {
                        if let Err(e) = outcome {
                            warn!("Conversation list refresh failed: {e}");
                        }
                    }
                }
            }
            Completion::Sent {
                placeholder,
                result,
                reply,
            } => {
                let outcome = match result {
                    Ok(message) => {
                        self.engine
                            .complete_send(&placeholder, message.clone(), &mut self.ctx);
                        Ok(SentMessage {
                            placeholder_id: placeholder.id,
                            message,
                        })
                    }
                    Err(e) => Err(self.engine.fail_send(&placeholder, &e.to_string())),
                };
                self.publish();
                let _ = reply.send(outcome);
            }
            Completion::MarkedRead {
                conversation_id,
                result,
            } => {
                if let Err(e) = result {
                    warn!("Marking {conversation_id} read failed: {e}");
                }
            }
            Completion::Offer {
                message_id,
                result,
                reply,
            } => {
                self.engine.finish_offer_transition(&message_id);
                if let Err(e) = &result {
                    warn!("Offer transition for {message_id} failed: {e}");
                }
                let _ = reply.send(result);
            }
            Completion::NotificationRead { result, reply } => {
                let _ = reply.send(result);
            }
        }
    }
}
