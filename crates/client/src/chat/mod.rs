/// Snapshot events forwarded from live subscriptions.
pub mod events;
pub mod conversations;
pub mod messages;

use std::fmt;

pub use conversations::ConversationListController;
pub use events::{ChatEvent, EventReceiver, EventSender};
pub use messages::MessageStreamController;

/// How the user names a conversation: by its 1-based position in the list or by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatRef {
    Position(usize),
    Id(String),
}

impl fmt::Display for ChatRef {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Position(position) => write!(formatter, "#{position}"),
            Self::Id(id) => formatter.write_str(id),
        }
    }
}
