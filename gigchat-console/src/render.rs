//! Plain-text rendering of engine snapshots.

use gigchat_sync::{ConversationListEntry, EngineSnapshot, Message, OfferStatus};

pub fn message_line(message: &Message) -> String {
    let mut line = format!(
        "[{}] {} -> {}",
        message.created_at.format("%H:%M:%S"),
        message.sender_username,
        message.receiver_username
    );
    if let Some(body) = &message.body {
        line.push_str(": ");
        line.push_str(body);
    }
    if let Some(attachment) = &message.attachment {
        line.push_str(&format!(" <{} {} bytes>", attachment.file_name, attachment.size));
    }
    if let Some(offer) = &message.offer {
        let status = match offer.status() {
            OfferStatus::Pending => "pending",
            OfferStatus::Accepted => "accepted",
            OfferStatus::Cancelled => "cancelled",
        };
        line.push_str(&format!(
            " {{offer {} ${} in {}d, {status}}}",
            offer.gig_title, offer.price, offer.delivery_in_days
        ));
    }
    if message.is_placeholder() {
        line.push_str(" (sending)");
    } else if message.is_read {
        line.push_str(" ✓");
    }
    format!("{line}  #{}", message.id)
}

pub fn conversation_line(entry: &ConversationListEntry, local_user: &str, online: bool) -> String {
    format!(
        "{} {}{} {} | {}",
        if entry.unread { "*" } else { " " },
        entry.counterpart(local_user),
        if online { " (online)" } else { "" },
        entry.conversation_id,
        entry.last_message.body.as_deref().unwrap_or("")
    )
}

pub fn conversation_list(snapshot: &EngineSnapshot, local_user: &str) -> String {
    if snapshot.conversations.is_empty() {
        return "no conversations".to_string();
    }
    snapshot
        .conversations
        .iter()
        .map(|entry| {
            let online = snapshot.is_online(entry.counterpart(local_user));
            conversation_line(entry, local_user, online)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn badges(snapshot: &EngineSnapshot) -> String {
    format!(
        "{:?} | unread messages: {} | unread notifications: {}",
        snapshot.connection,
        snapshot.notifications.has_unread_message,
        snapshot.notifications.has_unread_notification
    )
}
