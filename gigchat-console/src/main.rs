//! GigChat console — terminal client for the conversation sync engine.
//!
//! Wires the WebSocket transport, the HTTP gateway client and a sync
//! session together. Lines starting with `/` are commands, anything else is
//! sent to the counterpart of the open conversation.

mod render;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

use gigchat_sync::model::is_pending_conversation;
use gigchat_sync::{
    ChatApi, EventBridge, EventTransport, HttpChatApi, MessageDraft,
    OfferAction, ReconciliationEngine, ReconnectPolicy, SessionConfig, SessionHandle,
    SyncSession, SystemClock,
};

/// Terminal chat client for the gig marketplace
#[derive(Parser, Debug, Clone)]
#[command(name = "gigchat")]
#[command(about = "Chat with buyers and sellers from the terminal")]
struct Args {
    /// Local username
    #[arg(long, env = "GIGCHAT_USERNAME")]
    username: String,

    /// Push-event relay WebSocket URL
    #[arg(long, env = "GIGCHAT_SOCKET_URL", default_value = "ws://127.0.0.1:4000")]
    socket_url: String,

    /// Message gateway base URL
    #[arg(long, env = "GIGCHAT_API_URL", default_value = "http://127.0.0.1:4000/api/gateway/v1")]
    api_url: String,

    /// Gateway request timeout in seconds
    #[arg(long, default_value = "10")]
    timeout_secs: u64,

    /// Largest attachment accepted, in bytes
    #[arg(long, default_value = "52428800")]
    max_attachment_bytes: usize,
}

impl Args {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            socket_url: self.socket_url.clone(),
            api_base_url: self.api_url.clone(),
            username: self.username.clone(),
            request_timeout: Duration::from_secs(self.timeout_secs),
            reconnect: ReconnectPolicy::default(),
            max_attachment_bytes: self.max_attachment_bytes,
            ..SessionConfig::default()
        }
    }
}

const HELP: &str = "\
/list                 refresh the conversation list
/open <conversation>  open a conversation by id
/with <username>      open (or start) a conversation with a user
/close                close the open conversation
/read                 mark the open conversation read
/accept <message>     accept the offer in a message
/cancel <message>     cancel the offer in a message
/seen <notification>  mark an order notification read
/discard <message>    drop a message from the view
/status               connection and badges
/quit                 leave
<text>                send to the open conversation";

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();
    let config = args.session_config();

    let api: Arc<dyn ChatApi> = match HttpChatApi::from_config(&config) {
        Ok(api) => Arc::new(api),
        Err(e) => {
            error!("Could not build gateway client: {e}");
            std::process::exit(1);
        }
    };

    let transport = EventTransport::from_config(&config);
    let events = EventBridge::attach(&transport).await;
    transport.start().await;

    let engine = ReconciliationEngine::new(config.username.clone(), Arc::new(SystemClock));
    let session = SyncSession::spawn_with_config(engine, api, events, &config);
    info!("GigChat console for {} ({})", config.username, config.socket_url);

    if let Err(e) = session.load_conversation_list().await {
        warn!("Initial conversation list failed: {e}");
    }
    println!("{}", render::conversation_list(&session.snapshot(), &config.username));
    println!("type /help for commands");

    tokio::spawn(follow_messages(session.clone()));

    let mut counterpart: Option<String> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Err(e) = run_line(&session, &config.username, &mut counterpart, line).await {
            println!("error: {e}");
        }
    }

    session.shutdown().await;
    transport.shutdown().await;
}

async fn run_line(
    session: &SessionHandle,
    local_user: &str,
    counterpart: &mut Option<String>,
    line: &str,
) -> Result<(), gigchat_sync::SyncError> {
    let (command, arg) = match line.split_once(' ') {
        Some((command, arg)) => (command, arg.trim()),
        None => (line, ""),
    };

    match command {
        "/help" => println!("{HELP}"),
        "/list" => {
            session.load_conversation_list().await?;
            println!("{}", render::conversation_list(&session.snapshot(), local_user));
        }
        "/open" => {
            let snapshot = session.snapshot();
            *counterpart = snapshot
                .conversations
                .iter()
                .find(|e| e.conversation_id == arg)
                .map(|e| e.counterpart(local_user).to_string());
            session
                .open_conversation(Some(arg.to_string()), counterpart.clone().unwrap_or_default())
                .await?;
            print_conversation(session);
        }
        "/with" => {
            *counterpart = Some(arg.to_string());
            let existing = session
                .snapshot()
                .conversations
                .iter()
                .find(|e| e.counterpart(local_user) == arg)
                .map(|e| e.conversation_id.clone());
            session.open_conversation(existing, arg).await?;
            print_conversation(session);
        }
        "/close" => {
            *counterpart = None;
            session.close_conversation().await?;
        }
        "/read" => {
            if let Some(open) = session.snapshot().open_conversation {
                session.mark_conversation_read(open).await?;
            }
        }
        "/accept" => session.apply_offer_transition(arg, OfferAction::Accept).await?,
        "/cancel" => session.apply_offer_transition(arg, OfferAction::Cancel).await?,
        "/seen" => session.mark_notification_read(arg).await?,
        "/discard" => {
            session.discard_message(arg).await?;
        }
        "/status" => println!("{}", render::badges(&session.snapshot())),
        _ if command.starts_with('/') => println!("unknown command, try /help"),
        _ => {
            let Some(receiver) = counterpart.clone() else {
                println!("open a conversation first (/open or /with)");
                return Ok(());
            };
            let conversation_id = session
                .snapshot()
                .open_conversation
                .filter(|id| !is_pending_conversation(id));
            let sent = session
                .send(MessageDraft::text(conversation_id, receiver, line))
                .await?;
            session.discard_message(sent.placeholder_id).await?;
        }
    }
    Ok(())
}

fn print_conversation(session: &SessionHandle) {
    let snapshot = session.snapshot();
    for message in &snapshot.messages {
        println!("{}", render::message_line(message));
    }
}

/// Print messages of the open conversation as they arrive.
async fn follow_messages(session: SessionHandle) {
    let mut snapshots = session.watch();
    let mut seen = snapshots.borrow().messages.len();
    let mut open = snapshots.borrow().open_conversation.clone();
    while snapshots.changed().await.is_ok() {
        let snapshot = snapshots.borrow_and_update().clone();
        if snapshot.open_conversation != open {
            open = snapshot.open_conversation.clone();
            seen = snapshot.messages.len();
            continue;
        }
        if snapshot.messages.len() > seen {
            if let Some(latest) = snapshot.messages.last() {
                println!("{}", render::message_line(latest));
            }
        }
        seen = snapshot.messages.len();
    }
}
