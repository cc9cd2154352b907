//! Request/response side of the marketplace message gateway.
//!
//! The session only talks to [`ChatApi`]; [`HttpChatApi`] is the production
//! implementation over `reqwest`, tests plug in an in-memory double.

use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::*;
use log::debug;
use reqwest::{Client, Response, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::SessionConfig;
use crate::error::SyncError;
use crate::model::{
    is_pending_conversation, AttachmentCategory, ConversationId, Message, MessageId, Offer,
    OfferAction, OutgoingAttachment,
};

/// Which history to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryQuery {
    /// A conversation that already exists.
    Conversation(ConversationId),
    /// No conversation id yet: look it up by the two participants.
    Participants { sender: String, receiver: String },
}

/// Inline attachment as sent to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentPayload {
    pub file_name: String,
    pub category: AttachmentCategory,
    pub size: u64,
    /// Base64 (standard alphabet) file contents.
    pub data: String,
}

impl From<&OutgoingAttachment> for AttachmentPayload {
    fn from(attachment: &OutgoingAttachment) -> Self {
        Self {
            file_name: attachment.file_name.clone(),
            category: attachment.category,
            size: attachment.data.len() as u64,
            data: BASE64_STANDARD.encode(&attachment.data),
        }
    }
}

/// Body of a send request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    /// Absent when the conversation does not exist yet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    pub sender_username: String,
    pub receiver_username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_picture: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_picture: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offer: Option<Offer>,
    pub is_read: bool,
}

impl MessagePayload {
    /// Build the request for an optimistic placeholder.
    pub fn for_placeholder(placeholder: &Message, attachment: Option<&OutgoingAttachment>) -> Self {
        let conversation_id = Some(placeholder.conversation_id.clone())
            .filter(|id| !is_pending_conversation(id));
        Self {
            conversation_id,
            sender_username: placeholder.sender_username.clone(),
            receiver_username: placeholder.receiver_username.clone(),
            sender_picture: placeholder.sender_picture.clone(),
            receiver_picture: placeholder.receiver_picture.clone(),
            body: placeholder.body.clone(),
            attachment: attachment.map(AttachmentPayload::from),
            offer: placeholder.offer.clone(),
            is_read: false,
        }
    }
}

/// "I have read up to this message" for one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadRequest {
    pub receiver_username: String,
    pub sender_username: String,
    pub message_id: MessageId,
}

/// Remote operations the session depends on.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Latest message of every conversation the user takes part in.
    async fn fetch_conversation_list(&self, username: &str) -> Result<Vec<Message>, SyncError>;

    async fn fetch_messages(&self, query: &HistoryQuery) -> Result<Vec<Message>, SyncError>;

    /// Returns the authoritative message, with its resolved conversation id.
    async fn send_message(&self, payload: &MessagePayload) -> Result<Message, SyncError>;

    async fn mark_messages_read(&self, request: &MarkReadRequest) -> Result<(), SyncError>;

    async fn update_offer(&self, message_id: &str, action: OfferAction) -> Result<(), SyncError>;

    async fn mark_notification_read(&self, notification_id: &str) -> Result<(), SyncError>;
}

#[derive(Deserialize)]
struct ConversationsResponse {
    conversations: Vec<Message>,
}

#[derive(Deserialize)]
struct MessagesResponse {
    messages: Vec<Message>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    conversation_id: ConversationId,
    message_data: Message,
}

/// [`ChatApi`] over the JSON gateway.
pub struct HttpChatApi {
    base_url: Url,
    http: Client,
}

impl HttpChatApi {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, SyncError> {
        let raw = base_url.into();
        let base_url = Url::parse(raw.trim_end_matches('/'))
            .map_err(|e| SyncError::Config(format!("gateway url {raw:?}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::Config(format!("gateway url {raw:?} cannot carry a path")));
        }
        let http = Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("gigchat-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { base_url, http })
    }

    pub fn from_config(config: &SessionConfig) -> Result<Self, SyncError> {
        Self::new(config.api_base_url.clone(), config.request_timeout)
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str().trim_end_matches('/')
    }

    /// Append path segments to the base, percent-encoding each one.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // Checked in `new`: the base can carry a path.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

/// Map non-2xx responses to `SyncError::Api`.
async fn ensure_success(response: Response) -> Result<Response, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    Err(SyncError::Api(format!("{url} answered {status}: {body}")))
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_conversation_list(&self, username: &str) -> Result<Vec<Message>, SyncError> {
        let url = self.url(&["message", "conversation", "list", username]);
        debug!("GET {url}");
        let response = ensure_success(self.http.get(url).send().await?).await?;
        let body: ConversationsResponse = response.json().await?;
        Ok(body.conversations)
    }

    async fn fetch_messages(&self, query: &HistoryQuery) -> Result<Vec<Message>, SyncError> {
        let url = match query {
            HistoryQuery::Conversation(id) => self.url(&["message", id.as_str()]),
            HistoryQuery::Participants { sender, receiver } => {
                self.url(&["message", sender.as_str(), receiver.as_str()])
            }
        };
        debug!("GET {url}");
        let response = ensure_success(self.http.get(url).send().await?).await?;
        let body: MessagesResponse = response.json().await?;
        Ok(body.messages)
    }

    async fn send_message(&self, payload: &MessagePayload) -> Result<Message, SyncError> {
        let url = self.url(&["message"]);
        debug!("POST {url}");
        let response = ensure_success(self.http.post(url).json(payload).send().await?).await?;
        let body: SendResponse = response.json().await?;
        let mut message = body.message_data;
        message.conversation_id = body.conversation_id;
        Ok(message)
    }

    async fn mark_messages_read(&self, request: &MarkReadRequest) -> Result<(), SyncError> {
        let url = self.url(&["message", "mark-multiple-as-read"]);
        ensure_success(self.http.put(url).json(request).send().await?).await?;
        Ok(())
    }

    async fn update_offer(&self, message_id: &str, action: OfferAction) -> Result<(), SyncError> {
        let url = self.url(&["message", "offer"]);
        let body = json!({ "messageId": message_id, "type": action.as_str() });
        ensure_success(self.http.put(url).json(&body).send().await?).await?;
        Ok(())
    }

    async fn mark_notification_read(&self, notification_id: &str) -> Result<(), SyncError> {
        let url = self.url(&["order", "notification", "mark-as-read"]);
        let body = json!({ "notificationId": notification_id });
        ensure_success(self.http.put(url).json(&body).send().await?).await?;
        Ok(())
    }
}
