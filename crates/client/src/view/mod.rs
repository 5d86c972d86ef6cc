//! Plain-text rendering of client state. Every function here is pure.

pub mod command;

use chrono::{DateTime, Local, TimeZone};
use parlor_storage::{ConversationId, ConversationRecord, MessageRecord, ServerTimestamp};

use crate::client::ChatClient;

pub use command::{Command, CommandError, HELP, parse_command};

pub const APP_TITLE: &str = "parlor";
pub const SESSION_PROMPT: &str = "Enter your name to get started";
pub const NO_CONVERSATIONS: &str = "No conversations yet";
pub const NO_SELECTION: &str = "No conversation selected";
pub const NO_MESSAGES: &str = "No messages yet";
pub const START_CONVERSATION: &str = "Start a conversation!";
pub const AVATAR_SLOTS: u32 = 16;
pub const THREAD_WIDTH: usize = 72;

const TIME_FORMAT: &str = "%d %b %H:%M";

/// Upper-cased first character of `name`, or `?` for a blank name.
pub fn avatar_initial(name: &str) -> char {
    name.trim()
        .chars()
        .next()
        .and_then(|first| first.to_uppercase().next())
        .unwrap_or('?')
}

/// Stable colour slot derived from the lower-cased initial.
pub fn avatar_slot(name: &str) -> u32 {
    let initial = avatar_initial(name);
    let lowered = initial.to_lowercase().next().unwrap_or(initial);
    u32::from(lowered) % AVATAR_SLOTS
}

pub fn format_timestamp<Tz: TimeZone>(timestamp: ServerTimestamp, zone: &Tz) -> String
where
    Tz::Offset: std::fmt::Display,
{
    match DateTime::from_timestamp_millis(timestamp.as_millis()) {
        Some(utc) => utc.with_timezone(zone).format(TIME_FORMAT).to_string(),
        None => String::from("--"),
    }
}

pub fn render_header(user_name: Option<&str>) -> String {
    match user_name {
        Some(name) => format!("{APP_TITLE} | ({}) {name}", avatar_initial(name)),
        None => APP_TITLE.to_string(),
    }
}

pub fn render_session_entry() -> String {
    format!("{SESSION_PROMPT}:")
}

pub fn render_conversation_list(
    conversations: &[ConversationRecord],
    selected: Option<ConversationId>,
) -> String {
    if conversations.is_empty() {
        return format!("  {NO_CONVERSATIONS}. Create one with /new <name>");
    }

    conversations
        .iter()
        .enumerate()
        .map(|(index, conversation)| {
            let marker = if Some(conversation.id) == selected {
                '>'
            } else {
                ' '
            };
            format!(
                "{marker} {:>2}. {} ({})",
                index + 1,
                conversation.name,
                people(conversation.participants.len())
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_thread<Tz: TimeZone>(
    conversation: Option<&ConversationRecord>,
    messages: &[MessageRecord],
    user_name: Option<&str>,
    zone: &Tz,
) -> String
where
    Tz::Offset: std::fmt::Display,
{
    let Some(conversation) = conversation else {
        return NO_SELECTION.to_string();
    };

    let mut lines = vec![format!("# {}", conversation.name)];
    if messages.is_empty() {
        lines.push(NO_MESSAGES.to_string());
        lines.push(START_CONVERSATION.to_string());
        return lines.join("\n");
    }

    for message in messages {
        let own = user_name.is_some_and(|name| name == message.username);
        let heading = format!(
            "({}:{:02}) {}  {}",
            avatar_initial(&message.username),
            avatar_slot(&message.username),
            message.username,
            format_timestamp(message.created_at, zone)
        );
        for line in std::iter::once(heading).chain(message.content.lines().map(str::to_string)) {
            if own {
                lines.push(format!("{line:>THREAD_WIDTH$}"));
            } else {
                lines.push(line);
            }
        }
    }
    lines.join("\n")
}

/// Whole screen for the current client state, in local time.
pub fn render_screen(client: &ChatClient) -> String {
    let user_name = client.session().name();
    let mut sections = vec![render_header(user_name)];

    if user_name.is_none() {
        sections.push(render_session_entry());
        return sections.join("\n\n");
    }

    sections.push(render_conversation_list(
        client.conversations(),
        client.selected_id(),
    ));
    sections.push(render_thread(
        client.selected_conversation(),
        client.messages(),
        user_name,
        &Local,
    ));
    sections.join("\n\n")
}

fn people(count: usize) -> String {
    match count {
        1 => "1 person".to_string(),
        count => format!("{count} people"),
    }
}
