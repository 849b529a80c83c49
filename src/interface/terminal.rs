use crate::{
    bus::NotificationLevel,
    chat::{ChatMessage, ConversationId, ConversationKind, ConversationTarget},
    conversation_list::{ConversationListAggregator, ConversationListEntry},
    entity::UserId,
    error::ChatError,
    session::{ConversationSession, SessionState},
    store::Store,
    suggestion::{HttpSuggestionService, SuggestionPipeline},
};
use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Help,
    List,
    Users,
    Group,
    Dm(String),
    Leave,
    Draft(String),
    Accept,
    Send,
    Retry,
    Dismiss,
    Nick(String),
    Quit,
    /// Plain text, sent as a message
    Say(String),
}

const HELP: &str = "These commands are supported:
/list            show your conversations
/users           show people you can start a chat with
/group           open the group conversation
/dm <uid>        open a private conversation
/leave           close the open conversation
/draft <text>    set the draft and get an emoji suggestion
/accept          append the suggested emoji to the draft
/send            send the draft
/retry           reload the current conversation after an error
/dismiss         hide the current notice
/nick <name>     change your display name
/help            display this text
/quit            exit
Anything else is sent to the open conversation.";

impl Command {
    fn parse(line: &str) -> Result<Option<Command>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Some(Command::Say(line.to_string())));
        };

        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };
        let needs_arg = |usage: &str| {
            if arg.is_empty() {
                Err(format!("Usage: {}", usage))
            } else {
                Ok(arg.to_string())
            }
        };

        let command = match name.to_lowercase().as_str() {
            "help" => Command::Help,
            "list" => Command::List,
            "users" => Command::Users,
            "group" => Command::Group,
            "dm" => Command::Dm(needs_arg("/dm <uid>")?),
            "leave" => Command::Leave,
            "draft" => Command::Draft(arg.to_string()),
            "accept" => Command::Accept,
            "send" => Command::Send,
            "retry" => Command::Retry,
            "dismiss" => Command::Dismiss,
            "nick" => Command::Nick(needs_arg("/nick <name>")?),
            "quit" | "exit" => Command::Quit,
            other => return Err(format!("Unknown command /{}. Try /help.", other)),
        };
        Ok(Some(command))
    }
}

pub struct TerminalInterface {
    store: Arc<Store>,
    session: ConversationSession<Store>,
    list: ConversationListAggregator<Store>,
    suggestions: Option<SuggestionPipeline<HttpSuggestionService>>,
    entries: Vec<ConversationListEntry>,
    refresh: Duration,
    /// Kept here as well so it survives with suggestions disabled
    draft: String,
    /// Conversation and number of its messages already printed
    rendered: (Option<ConversationId>, usize),
}

impl TerminalInterface {
    pub fn new(
        store: Arc<Store>,
        session: ConversationSession<Store>,
        suggestions: Option<SuggestionPipeline<HttpSuggestionService>>,
        refresh: Duration,
    ) -> Self {
        Self {
            list: ConversationListAggregator::new(store.clone()),
            store,
            session,
            suggestions,
            entries: Vec::new(),
            refresh,
            draft: String::new(),
            rendered: (None, 0),
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let me = self.session.me().clone();
        println!("Signed in as {}. Type /help for commands.", me);

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let list_updates = self.list.watch(me.uid.clone(), self.refresh);
        futures::pin_mut!(list_updates);

        self.session.select_conversation(ConversationTarget::Group)?;

        loop {
            tokio::select! {
                line = lines.next_line() => match line? {
                    Some(line) => {
                        if !self.handle_line(&line).await {
                            break;
                        }
                    }
                    None => break,
                },
                applied = self.session.process_next() => {
                    if applied {
                        self.render_session();
                    }
                }
                applied = next_suggestion(&mut self.suggestions) => {
                    if applied {
                        self.render_suggestion();
                    }
                }
                Some(pass) = list_updates.next() => match pass {
                    Ok(entries) => self.entries = entries,
                    Err(e) => warn!("Failed to refresh conversation list: {:#}", e),
                },
            }
        }

        info!("terminal session closed");
        Ok(())
    }

    /// Returns false when the user asked to quit.
    async fn handle_line(&mut self, line: &str) -> bool {
        let command = match Command::parse(line) {
            Ok(Some(command)) => command,
            Ok(None) => return true,
            Err(usage) => {
                println!("{}", usage);
                return true;
            }
        };

        match command {
            Command::Help => println!("{}", HELP),
            Command::List => self.print_list(),
            Command::Users => {
                let me = self.session.me().uid.clone();
                match self.list.start_chat_candidates(&me).await {
                    Ok(users) if users.is_empty() => {
                        notify(NotificationLevel::Info, "Nobody else is here yet.")
                    }
                    Ok(users) => {
                        for user in users {
                            println!("  {}", user);
                        }
                    }
                    Err(e) => {
                        notify(NotificationLevel::Error, format!("Could not load users: {:#}", e))
                    }
                }
            }
            Command::Group => self.select(ConversationTarget::Group),
            Command::Dm(raw) => match UserId::parse(raw) {
                Ok(uid) => self.select(ConversationTarget::Private(uid)),
                Err(e) => report(&e),
            },
            Command::Leave => {
                self.session.leave();
                self.rendered = (None, 0);
                notify(NotificationLevel::Info, "Conversation closed.");
            }
            Command::Draft(text) => {
                self.set_draft(text);
                println!("draft: {}", self.draft);
                if self.suggestions.is_none() {
                    notify(
                        NotificationLevel::Info,
                        "Suggestions are disabled (set RELAY_SUGGEST_URL).",
                    );
                }
            }
            Command::Accept => match self.suggestions.as_mut().and_then(|p| p.accept()) {
                Some(draft) => {
                    self.draft = draft.to_string();
                    println!("draft: {}", self.draft);
                }
                None => notify(NotificationLevel::Info, "No suggestion to accept."),
            },
            Command::Send => {
                let draft = self.draft.clone();
                if self.send(&draft).await {
                    self.draft.clear();
                    if let Some(pipeline) = self.suggestions.as_mut() {
                        pipeline.clear();
                    }
                }
            }
            Command::Retry => {
                if !self.session.retry() {
                    notify(NotificationLevel::Info, "No conversation open.");
                }
            }
            Command::Dismiss => self.session.dismiss_notice(),
            Command::Nick(name) => {
                let uid = self.session.me().uid.clone();
                match self.store.update_display_name(&uid, &name).await {
                    Ok(()) => {
                        self.session.set_display_name(name.trim());
                        notify(NotificationLevel::Info, format!("You are now {}.", name.trim()));
                    }
                    Err(e) => notify(NotificationLevel::Error, format!("{:#}", e)),
                }
            }
            Command::Quit => return false,
            Command::Say(text) => {
                if !self.send(&text).await {
                    self.set_draft(text);
                    notify(NotificationLevel::Info, "Kept as draft, /send to try again.");
                }
            }
        }
        true
    }

    fn set_draft(&mut self, text: String) {
        if let Some(pipeline) = self.suggestions.as_mut() {
            pipeline.edit(text.clone());
        }
        self.draft = text;
    }

    fn select(&mut self, target: ConversationTarget) {
        match self.session.select_conversation(target) {
            Ok(true) => {
                if let Some(conversation) = self.session.conversation() {
                    let me = &self.session.me().uid;
                    match conversation.counterpart(me) {
                        Some(other) => println!("-- private chat with {} --", other),
                        None => println!("-- {} --", crate::chat::GROUP_DISPLAY_NAME),
                    }
                }
            }
            Ok(false) => notify(NotificationLevel::Info, "Already open."),
            Err(e) => report(&e),
        }
    }

    /// The draft is left untouched on failure so it can be resent.
    async fn send(&mut self, text: &str) -> bool {
        match self.session.send(text).await {
            Ok(_) => true,
            Err(e) => {
                report(&e);
                false
            }
        }
    }

    /// Index of the first message not printed yet. A reload of the same
    /// conversation continues where the previous snapshot left off.
    fn render_start(&self) -> usize {
        let current = self.session.conversation().map(|c| &c.id);
        let (rendered, count) = &self.rendered;
        if rendered.as_ref() == current && *count <= self.session.messages().len() {
            *count
        } else {
            0
        }
    }

    fn render_session(&mut self) {
        let start = self.render_start();
        let messages = self.session.messages();

        let me = &self.session.me().uid;
        for message in &messages[start..] {
            println!("{}", format_message(message, me));
        }
        if self.session.state() == SessionState::Live && messages.is_empty() && start == 0 {
            println!("(no messages yet)");
        }
        self.rendered = (
            self.session.conversation().map(|c| c.id.clone()),
            messages.len(),
        );

        if let Some(notice) = self.session.notice() {
            notify(notice.level, format!("{} (/retry or /dismiss)", notice.message));
        }
    }

    fn render_suggestion(&self) {
        if let Some(pipeline) = &self.suggestions {
            if pipeline.is_busy() {
                println!("(thinking of an emoji...)");
            } else if let Some(emoji) = pipeline.suggestion() {
                println!("suggestion: {}  (/accept to add it)", emoji);
            }
        }
    }

    fn print_list(&self) {
        if self.entries.is_empty() {
            notify(NotificationLevel::Info, "Loading conversations...");
            return;
        }
        let now = Utc::now();
        for entry in &self.entries {
            let marker = match entry.conversation.kind {
                ConversationKind::Group => "#",
                ConversationKind::Private => "@",
            };
            let preview = match &entry.last_message {
                Some(last) => format!("{}  ({})", last.text, ago(last.timestamp, now)),
                None => "No messages yet".to_string(),
            };
            println!("{} {:<20} {}", marker, entry.display_name, preview);
        }
    }
}

async fn next_suggestion(pipeline: &mut Option<SuggestionPipeline<HttpSuggestionService>>) -> bool {
    match pipeline {
        Some(pipeline) => pipeline.next_outcome().await,
        None => std::future::pending().await,
    }
}

fn notify(level: NotificationLevel, message: impl std::fmt::Display) {
    match level {
        NotificationLevel::Info => println!("{}", message),
        NotificationLevel::Warning => println!("! {}", message),
        NotificationLevel::Error => println!("!! {}", message),
    }
}

/// Rejected input is a warning, a failed write an error.
fn report(error: &ChatError) {
    let level = if error.is_contract_violation() {
        NotificationLevel::Warning
    } else {
        NotificationLevel::Error
    };
    notify(level, error);
}

fn format_message(message: &ChatMessage, me: &UserId) -> String {
    let who = if &message.sender_id == me {
        "you"
    } else {
        message.sender_name.as_str()
    };
    format!(
        "[{}] {}: {}",
        message.timestamp.with_timezone(&Local).format("%H:%M"),
        who,
        message.text
    )
}

fn ago(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = now.signed_duration_since(timestamp);
    if elapsed.num_minutes() < 1 {
        "just now".to_string()
    } else if elapsed.num_hours() < 1 {
        format!("{}m ago", elapsed.num_minutes())
    } else if elapsed.num_days() < 1 {
        format!("{}h ago", elapsed.num_hours())
    } else {
        format!("{}d ago", elapsed.num_days())
    }
}
