pub mod chat;
pub mod client;
pub mod copilot;
pub mod error;
pub mod session;
pub mod settings;
pub mod view;

pub use client::ChatClient;
pub use error::{ClientError, ClientResult};
pub use session::{FileStorage, LocalStorage, MemoryStorage, Session, SessionError};
pub use settings::{ClientSettings, SettingsStore};
